// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checks the structural consistency of an SFS volume image.
//!
//! Exits 0 if the image is clean and nonzero otherwise.  All
//! diagnostics go to standard error; nothing is repaired.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{LevelFilter, error, info};

use sfs::check;

#[derive(Parser)]
#[command(name = "sfsck", version, about = "Checks the consistency of an SFS volume image")]
struct Args {
    /// Path of the disk image to check
    image: PathBuf,

    /// Prints more about the check (repeatable; -vv dumps the
    /// block ownership map)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logger(args.verbose);
    let report = match check::check_image(&args.image) {
        Ok(report) => report,
        Err(err) => {
            error!("sfsck: {}: {err}", args.image.display());
            return ExitCode::FAILURE;
        }
    };
    if args.verbose >= 2 {
        for row in report.map_rows() {
            eprintln!("{row}");
        }
    }
    if report.is_clean() {
        info!("{}: clean", args.image.display());
        ExitCode::SUCCESS
    } else {
        error!(
            "{}: {} inconsistencies ({:?})",
            args.image.display(),
            report.errors,
            report.classes
        );
        ExitCode::FAILURE
    }
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
