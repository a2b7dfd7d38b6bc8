// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed views over a mapped volume image.
//!
//! An [`Image`] wraps any byte region that dereferences to
//! `[u8]` and exposes the on-disk structures as field-granular
//! accessors: block headers, the superblock, and directory
//! entries.  Every accessor is a byte-exact little-endian read
//! or write at an offset from [`crate::layout`]; nothing here is
//! cached, so a view is always coherent with the region.
//!
//! The same accessor set serves three callers with different
//! regions: the engine mutates a shared read-write mapping, the
//! consistency checker reads a read-only mapping, and the unit
//! tests run against a plain `Vec<u8>`.
//!
//! Block IDs passed to the header and data accessors must be
//! nonzero and in range for the region; violations are
//! precondition bugs in the caller and fail an assertion.  The
//! checker validates IDs against the superblock's block count
//! before dereferencing them, and so never trips these.

use std::ops::{Deref, DerefMut};

use memmap2::MmapMut;

use crate::layout::{
    self, BLOCK_SIZE, BlockId, DIR_ENTRY_SIZE, ENTRY_FIRST, ENTRY_NAME,
    ENTRY_SIZE, HDR_NEXT, HDR_PREV, HDR_TAG, NAME_MAX, NIL, Tag,
};
use crate::result::Result;

/// A volume image: a byte region viewed as an array of blocks.
pub(crate) struct Image<M> {
    region: M,
}

impl<M: Deref<Target = [u8]>> Image<M> {
    /// Wraps the given region.  The region length must be a
    /// nonzero multiple of the block size.
    pub(crate) fn new(region: M) -> Image<M> {
        assert!(!region.is_empty());
        assert_eq!(region.len() % BLOCK_SIZE, 0);
        Image { region }
    }

    /// Returns the length of the region, in bytes.
    pub(crate) fn len(&self) -> usize {
        self.region.len()
    }

    /// Unwraps the image back into its region.
    #[cfg(test)]
    pub(crate) fn into_inner(self) -> M {
        self.region
    }

    /// Returns the byte offset of the given block, which must
    /// be in range for the region.  Block 0 is permitted here:
    /// the superblock and directory-entry accessors reach it.
    fn base(&self, id: BlockId) -> usize {
        let off = id as usize * BLOCK_SIZE;
        assert!(off + BLOCK_SIZE <= self.region.len(), "block {id} out of range");
        off
    }

    fn read_u32(&self, off: usize) -> u32 {
        let bs = &self.region[off..off + 4];
        u32::from_le_bytes([bs[0], bs[1], bs[2], bs[3]])
    }

    /// Returns true IFF the superblock carries the SFS magic.
    pub(crate) fn has_magic(&self) -> bool {
        self.region[..layout::MAGIC.len()] == layout::MAGIC
    }

    /// Returns the total block count recorded in the superblock.
    pub(crate) fn n_blocks(&self) -> u32 {
        self.read_u32(layout::SUPER_NBLOCKS)
    }

    /// Returns the head of the free list, or `NIL` if the
    /// volume is full.
    pub(crate) fn freelist(&self) -> BlockId {
        self.read_u32(layout::SUPER_FREELIST)
    }

    /// Returns the head of the directory overflow chain, or
    /// `NIL` if there is none.
    pub(crate) fn next_rootdir(&self) -> BlockId {
        self.read_u32(layout::SUPER_NEXT_ROOTDIR)
    }

    /// Returns the raw type tag of the given block.
    pub(crate) fn tag_bytes(&self, id: BlockId) -> [u8; 4] {
        assert_ne!(id, NIL);
        let off = self.base(id) + HDR_TAG;
        let bs = &self.region[off..off + 4];
        [bs[0], bs[1], bs[2], bs[3]]
    }

    /// Returns the parsed type tag of the given block, or
    /// `None` if the tag bytes are not a valid tag.
    pub(crate) fn tag(&self, id: BlockId) -> Option<Tag> {
        Tag::from_bytes(self.tag_bytes(id))
    }

    /// Returns the `prev` link of the given block.
    pub(crate) fn prev(&self, id: BlockId) -> BlockId {
        assert_ne!(id, NIL);
        self.read_u32(self.base(id) + HDR_PREV)
    }

    /// Returns the `next` link of the given block.
    pub(crate) fn next(&self, id: BlockId) -> BlockId {
        assert_ne!(id, NIL);
        self.read_u32(self.base(id) + HDR_NEXT)
    }

    /// Returns the payload of the given file data block.
    pub(crate) fn data(&self, id: BlockId) -> &[u8] {
        assert_ne!(id, NIL);
        let off = self.base(id) + layout::HEADER_SIZE;
        &self.region[off..off + layout::BLOCK_DATA]
    }

    fn entry_base(&self, dir: BlockId, slot: usize) -> usize {
        assert!(slot < layout::DIR_ENTRIES_PER_BLOCK);
        self.base(dir) + layout::DIR_ENTRIES + slot * DIR_ENTRY_SIZE
    }

    /// Returns the `first_block` field of a directory entry.
    /// `dir` 0 names the directory embedded in the superblock.
    pub(crate) fn entry_first(&self, dir: BlockId, slot: usize) -> BlockId {
        self.read_u32(self.entry_base(dir, slot) + ENTRY_FIRST)
    }

    /// Returns the `size` field of a directory entry.
    pub(crate) fn entry_size(&self, dir: BlockId, slot: usize) -> u32 {
        self.read_u32(self.entry_base(dir, slot) + ENTRY_SIZE)
    }

    /// Returns the raw name field of a directory entry, all
    /// `NAME_MAX` bytes of it.
    pub(crate) fn entry_name_raw(&self, dir: BlockId, slot: usize) -> &[u8] {
        let off = self.entry_base(dir, slot) + ENTRY_NAME;
        &self.region[off..off + NAME_MAX]
    }

    /// Returns the name of a directory entry, up to but not
    /// including the first NUL.
    pub(crate) fn entry_name(&self, dir: BlockId, slot: usize) -> &[u8] {
        let raw = self.entry_name_raw(dir, slot);
        let nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        &raw[..nul]
    }
}

impl<M: DerefMut<Target = [u8]>> Image<M> {
    fn write_u32(&mut self, off: usize, val: u32) {
        self.region[off..off + 4].copy_from_slice(&val.to_le_bytes());
    }

    /// Stamps the SFS magic into the superblock.
    pub(crate) fn set_magic(&mut self) {
        self.region[..layout::MAGIC.len()].copy_from_slice(&layout::MAGIC);
    }

    /// Records the total block count in the superblock.
    pub(crate) fn set_n_blocks(&mut self, n: u32) {
        self.write_u32(layout::SUPER_NBLOCKS, n);
    }

    /// Points the superblock at a new free list head.
    pub(crate) fn set_freelist(&mut self, id: BlockId) {
        self.write_u32(layout::SUPER_FREELIST, id);
    }

    /// Points the superblock at a new directory overflow chain.
    pub(crate) fn set_next_rootdir(&mut self, id: BlockId) {
        self.write_u32(layout::SUPER_NEXT_ROOTDIR, id);
    }

    /// Rewrites the type tag of the given block.
    pub(crate) fn set_tag(&mut self, id: BlockId, tag: Tag) {
        assert_ne!(id, NIL);
        let off = self.base(id) + HDR_TAG;
        self.region[off..off + 4].copy_from_slice(&tag.bytes());
    }

    /// Rewrites the `prev` link of the given block.
    pub(crate) fn set_prev(&mut self, id: BlockId, to: BlockId) {
        assert_ne!(id, NIL);
        let off = self.base(id) + HDR_PREV;
        self.write_u32(off, to);
    }

    /// Rewrites the `next` link of the given block.
    pub(crate) fn set_next(&mut self, id: BlockId, to: BlockId) {
        assert_ne!(id, NIL);
        let off = self.base(id) + HDR_NEXT;
        self.write_u32(off, to);
    }

    /// Returns the payload of the given file data block,
    /// mutably.
    pub(crate) fn data_mut(&mut self, id: BlockId) -> &mut [u8] {
        assert_ne!(id, NIL);
        let off = self.base(id) + layout::HEADER_SIZE;
        &mut self.region[off..off + layout::BLOCK_DATA]
    }

    /// Rewrites the `first_block` field of a directory entry.
    pub(crate) fn set_entry_first(&mut self, dir: BlockId, slot: usize, to: BlockId) {
        let off = self.entry_base(dir, slot) + ENTRY_FIRST;
        self.write_u32(off, to);
    }

    /// Rewrites the `size` field of a directory entry.
    pub(crate) fn set_entry_size(&mut self, dir: BlockId, slot: usize, to: u32) {
        let off = self.entry_base(dir, slot) + ENTRY_SIZE;
        self.write_u32(off, to);
    }

    /// Rewrites the name field of a directory entry, padding
    /// with NULs.  The name must fit with its terminator.
    pub(crate) fn set_entry_name(&mut self, dir: BlockId, slot: usize, name: &[u8]) {
        assert!(name.len() < NAME_MAX);
        let off = self.entry_base(dir, slot) + ENTRY_NAME;
        let field = &mut self.region[off..off + NAME_MAX];
        field[..name.len()].copy_from_slice(name);
        field[name.len()..].fill(0);
    }
}

impl Image<MmapMut> {
    /// Flushes outstanding writes to the backing file.
    pub(crate) fn flush(&self) -> Result<()> {
        self.region.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> Image<Vec<u8>> {
        Image::new(vec![0u8; 4 * BLOCK_SIZE])
    }

    #[test]
    fn superblock_fields() {
        let mut img = image();
        assert!(!img.has_magic());
        img.set_magic();
        img.set_n_blocks(4);
        img.set_freelist(1);
        img.set_next_rootdir(NIL);
        assert!(img.has_magic());
        assert_eq!(img.n_blocks(), 4);
        assert_eq!(img.freelist(), 1);
        assert_eq!(img.next_rootdir(), NIL);
    }

    #[test]
    fn header_fields() {
        let mut img = image();
        img.set_tag(2, Tag::File);
        img.set_prev(2, 1);
        img.set_next(2, 3);
        assert_eq!(img.tag(2), Some(Tag::File));
        assert_eq!(img.prev(2), 1);
        assert_eq!(img.next(2), 3);
        assert_eq!(img.tag(1), None);
    }

    #[test]
    fn entry_name_padding() {
        let mut img = image();
        img.set_entry_name(NIL, 3, b"hello");
        let raw = img.entry_name_raw(NIL, 3);
        assert_eq!(&raw[..5], b"hello");
        assert!(raw[5..].iter().all(|&b| b == 0));
        assert_eq!(img.entry_name(NIL, 3), b"hello");
    }

    #[test]
    fn data_is_payload_sized() {
        let mut img = image();
        img.data_mut(1).fill(0xA5);
        assert_eq!(img.data(1).len(), layout::BLOCK_DATA);
        // The header of block 1 and the start of block 2 are
        // untouched.
        assert_eq!(img.tag_bytes(1), [0; 4]);
        assert_eq!(img.tag_bytes(2), [0; 4]);
    }

    #[test]
    #[should_panic]
    fn out_of_range_block_panics() {
        let img = image();
        img.tag(4);
    }
}
