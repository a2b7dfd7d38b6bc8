// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creates and formats an SFS volume image.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{LevelFilter, error, info};

use sfs::Sfs;
use sfs::layout::BLOCK_SIZE;

#[derive(Parser)]
#[command(name = "mksfs", version, about = "Creates an SFS volume in a disk image")]
struct Args {
    /// Path of the disk image to create
    image: PathBuf,

    /// Volume size in bytes, with an optional k/m/g suffix;
    /// must be a multiple of the host page size
    size: String,

    /// Prints more about what is happening (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logger(args.verbose);
    let Some(size) = parse_size(&args.size) else {
        error!("mksfs: bad size {:?}", args.size);
        return ExitCode::FAILURE;
    };
    let mut fs = Sfs::new();
    if let Err(err) = fs.format(&args.image, size) {
        error!("mksfs: {}: {err}", args.image.display());
        return ExitCode::FAILURE;
    }
    match fs.usage() {
        Ok(usage) => info!(
            "{}: {} blocks of {BLOCK_SIZE} bytes, {} free",
            args.image.display(),
            usage.n_blocks,
            usage.free_blocks
        ),
        Err(err) => {
            error!("mksfs: {}: {err}", args.image.display());
            return ExitCode::FAILURE;
        }
    }
    if let Err(err) = fs.unmount() {
        error!("mksfs: {}: {err}", args.image.display());
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

/// Parses a size with an optional binary suffix.
fn parse_size(s: &str) -> Option<u64> {
    let (digits, unit) = match s.as_bytes().last()? {
        b'k' | b'K' => (&s[..s.len() - 1], 1u64 << 10),
        b'm' | b'M' => (&s[..s.len() - 1], 1 << 20),
        b'g' | b'G' => (&s[..s.len() - 1], 1 << 30),
        _ => (s, 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(unit)
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).format_timestamp(None).init();
}
