// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The offline consistency checker.
//!
//! The checker maps a volume image read-only and walks the same
//! graph the engine maintains: the free list, the directory
//! overflow chain, and the chain of every live file.  Each
//! block it reaches is marked in a bytemap with a code naming
//! the list that claimed it, so the three structural sins are
//! all cheap to detect: a block claimed twice with the same
//! code closed a cycle, a block claimed with two different
//! codes sits on two lists, and a block never claimed at all is
//! lost.
//!
//! Unlike the engine, the checker never asserts on image
//! contents.  Whatever it finds it reports and, where it can,
//! keeps going: a bad type tag poisons one block, not the walk;
//! a dangling link abandons one list, not the run.  Only a
//! superblock too broken to describe the volume stops the check
//! outright.  Nothing is ever repaired.

use std::fs::File;
use std::path::Path;

use bitflags::bitflags;
use log::{error, info};
use memmap2::Mmap;

use crate::image::Image;
use crate::layout::{
    BLOCK_SIZE, BlockId, DIR_ENTRIES_PER_BLOCK, NIL, Tag, chain_blocks,
};
use crate::result::{Error, Result};

bitflags! {
    /// Classes of structural error a check can report.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct Trouble: u32 {
        /// A link names a block beyond the volume.
        const RANGE = 1 << 0;
        /// A list closes a cycle.
        const CYCLE = 1 << 1;
        /// A block appears on two lists.
        const CROSS = 1 << 2;
        /// A block carries the wrong type tag.
        const TYPE = 1 << 3;
        /// A `prev` link disagrees with the walk.
        const LINK = 1 << 4;
        /// A directory entry name is malformed.
        const NAME = 1 << 5;
        /// A file's size disagrees with its chain length.
        const LENGTH = 1 << 6;
        /// A block is on no list at all.
        const LOST = 1 << 7;
    }
}

/// Bytemap code for the superblock.
pub const BM_SUPER: u8 = b'S';
/// Bytemap code for a block never reached.
pub const BM_UNVISITED: u8 = b'.';
/// Bytemap code for a block with a corrupt type tag.
pub const BM_CORRUPT: u8 = b'!';
/// Bytemap code for a free-list block.
pub const BM_FREE: u8 = b'F';
/// Bytemap code for a directory-chain block.
pub const BM_DIR: u8 = b'D';
/// Bytemap terminator, one past the last block.
pub const BM_END: u8 = 0;

/// Bytemap code for the blocks of the k-th live file.
fn file_code(k: usize) -> u8 {
    b'a' + (k % 26) as u8
}

/// The outcome of a consistency check.
pub struct Report {
    /// Total inconsistencies reported.
    pub errors: u64,
    /// The classes of error seen.
    pub classes: Trouble,
    /// Per-block ownership codes, `n_blocks + 1` bytes, the
    /// last being [`BM_END`].
    pub bytemap: Vec<u8>,
}

impl Report {
    /// Returns true IFF no inconsistencies were found.
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }

    /// Renders the bytemap as rows of 64 printable codes.
    pub fn map_rows(&self) -> impl Iterator<Item = String> + '_ {
        let blocks = &self.bytemap[..self.bytemap.len() - 1];
        blocks.chunks(64).enumerate().map(|(i, row)| {
            let codes: String = row.iter().map(|&b| b as char).collect();
            format!("{:>8}  {codes}", i * 64)
        })
    }
}

/// Checks the volume image at `path` and returns a report.
/// Returns an error only for conditions that prevent the check
/// from running at all: host I/O failures, a size that is not a
/// whole number of blocks, a bad magic, or a block count that
/// disagrees with the image size.
pub fn check_image(path: &Path) -> Result<Report> {
    let file = File::open(path)?;
    let map = unsafe { Mmap::map(&file)? };
    check_bytes(&map)
}

/// Checks an already-mapped (or in-memory) volume image.
pub fn check_bytes(bytes: &[u8]) -> Result<Report> {
    if bytes.len() < BLOCK_SIZE || bytes.len() % BLOCK_SIZE != 0 {
        error!("image size {} is not a whole number of blocks", bytes.len());
        return Err(Error::InvalidArgument);
    }
    let img = Image::new(bytes);
    if !img.has_magic() {
        error!("bad magic in superblock");
        return Err(Error::InvalidArgument);
    }
    let n_blocks = img.n_blocks();
    if n_blocks as u64 * BLOCK_SIZE as u64 != bytes.len() as u64 {
        error!(
            "superblock says {n_blocks} blocks, image holds {}",
            bytes.len() / BLOCK_SIZE
        );
        return Err(Error::InvalidArgument);
    }
    let mut bytemap = vec![BM_UNVISITED; n_blocks as usize + 1];
    bytemap[0] = BM_SUPER;
    bytemap[n_blocks as usize] = BM_END;
    let mut checker = Checker { img, n_blocks, bytemap, errors: 0, classes: Trouble::empty() };
    checker.run();
    Ok(Report {
        errors: checker.errors,
        classes: checker.classes,
        bytemap: checker.bytemap,
    })
}

struct Checker<'a> {
    img: Image<&'a [u8]>,
    n_blocks: u32,
    bytemap: Vec<u8>,
    errors: u64,
    classes: Trouble,
}

impl Checker<'_> {
    fn run(&mut self) {
        info!("checking free list");
        let free = self.walk(self.img.freelist(), Tag::Free, BM_FREE, "free list");
        info!("free list: {} blocks", free.len());

        info!("checking directory chain");
        let mut dirs = vec![NIL];
        dirs.extend(self.walk(
            self.img.next_rootdir(),
            Tag::Dir,
            BM_DIR,
            "directory chain",
        ));

        let mut files = 0;
        for dir in dirs {
            for slot in 0..DIR_ENTRIES_PER_BLOCK {
                let first = self.img.entry_first(dir, slot);
                if first == NIL {
                    continue;
                }
                self.check_file(dir, slot, first, files);
                files += 1;
            }
        }
        info!("{files} live files");

        for b in 1..self.n_blocks {
            if self.bytemap[b as usize] == BM_UNVISITED {
                self.report(Trouble::LOST, format!("block {b}: lost (on no list)"));
            }
        }
    }

    fn check_file(&mut self, dir: BlockId, slot: usize, first: BlockId, ordinal: usize) {
        let raw = self.img.entry_name_raw(dir, slot);
        let label = if valid_entry_name(raw) {
            let name = self.img.entry_name(dir, slot);
            format!("file \"{}\"", String::from_utf8_lossy(name))
        } else {
            let what = format!("directory block {dir} slot {slot}");
            self.report(Trouble::NAME, format!("{what}: malformed name"));
            what
        };
        info!("checking {label}");
        let chain = self.walk(first, Tag::File, file_code(ordinal), &label);
        let size = self.img.entry_size(dir, slot);
        let expect = chain_blocks(size);
        if chain.len() as u64 != expect as u64 {
            self.report(
                Trouble::LENGTH,
                format!(
                    "{label}: size {size} wants {expect} blocks, chain has {}",
                    chain.len()
                ),
            );
        }
    }

    /// Walks a chain from `start` by `next` links, marking each
    /// block with `code`, and returns the blocks visited.  The
    /// head's `prev` must be null, as must each following
    /// block's `prev` agree with its predecessor.
    fn walk(&mut self, start: BlockId, expected: Tag, code: u8, what: &str) -> Vec<BlockId> {
        let mut visited = Vec::new();
        let mut prev = NIL;
        let mut b = start;
        while b != NIL {
            if b >= self.n_blocks {
                self.report(
                    Trouble::RANGE,
                    format!("{what}: link to block {b}, beyond the volume"),
                );
                break;
            }
            let mark = self.bytemap[b as usize];
            if mark == code {
                self.report(Trouble::CYCLE, format!("{what}: cycle at block {b}"));
                break;
            }
            if mark != BM_UNVISITED {
                self.report(
                    Trouble::CROSS,
                    format!("{what}: block {b} already claimed by '{}'", mark as char),
                );
                break;
            }
            self.bytemap[b as usize] = code;
            match self.img.tag(b) {
                Some(tag) if tag == expected => (),
                tag => {
                    let found = tag.map_or("garbage", Tag::as_str);
                    self.report(
                        Trouble::TYPE,
                        format!("{what}: block {b} tagged {found}, expected {}", expected.as_str()),
                    );
                    self.bytemap[b as usize] = BM_CORRUPT;
                }
            }
            if self.img.prev(b) != prev {
                self.report(
                    Trouble::LINK,
                    format!("{what}: block {b} prev is {}, walk came from {prev}", self.img.prev(b)),
                );
            }
            visited.push(b);
            prev = b;
            b = self.img.next(b);
        }
        visited
    }

    fn report(&mut self, class: Trouble, msg: String) {
        error!("{msg}");
        self.errors += 1;
        self.classes |= class;
    }
}

/// A stored name is valid IFF it is one contiguous non-NUL run,
/// starting at the first byte, terminated and padded by NULs.
fn valid_entry_name(raw: &[u8]) -> bool {
    match raw.iter().position(|&b| b == 0) {
        Some(0) | None => false,
        Some(nul) => raw[nul..].iter().all(|&b| b == 0),
    }
}
