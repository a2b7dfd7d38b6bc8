// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SFS is a small FAT-style file system on a single volume,
//! backed by a memory-mapped disk image.  It is an educational
//! design: one directory, fifteen files, 512-byte blocks, and
//! every structure on disk is a doubly-linked chain of blocks,
//! including the free list.  What it lacks in features it makes
//! up for in checkability, and the crate ships the checker: a
//! read-only fsck that walks the whole on-disk graph and
//! accounts for every block.
//!
//! The FAT family keeps its allocation state in a table off to
//! the side; SFS instead threads the links through the blocks
//! themselves, in a 12-byte header carrying a type tag and the
//! `prev`/`next` of whichever chain owns the block.  Allocation
//! moves blocks between the free chain and a file's chain, so
//! the allocator is list surgery and the invariants are list
//! invariants: every block on exactly one chain, links agreeing
//! in both directions, sizes agreeing with chain lengths.
//!
//! The public surface is deliberately POSIX-shaped: format,
//! mount, unmount, then open/close/read/write/seek and friends
//! against a descriptor table.  See [`Sfs`] for the engine and
//! [`check`] for the checker.
//!
//! The engine is a single-mutator design.  Nothing here locks;
//! a caller that wants concurrent access wraps the engine in
//! one exclusive lock and keeps fsck away from volumes mounted
//! read-write.

#![forbid(unsafe_op_in_unsafe_fn)]

mod alloc;
pub mod check;
mod dir;
mod fs;
mod image;
pub mod layout;
mod result;

pub use dir::ListCookie;
pub use fs::{ListStep, Sfs, Usage, host_page_size};
pub use result::{Error, Result};
