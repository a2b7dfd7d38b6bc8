// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SFS engine.
//!
//! An [`Sfs`] owns at most one mounted volume: a shared
//! read-write mapping of the image file, a fixed table of open
//! file descriptors, and a fixed table of v-nodes.  Every API
//! call is gated on the mount; between mount and unmount the
//! mapping is exclusively the engine's, and the engine assumes
//! a single mutator throughout.
//!
//! The descriptor and v-node tables are two levels on purpose.
//! A descriptor is cheap per-open state: the cursor position
//! and the block it falls in.  The v-node is per-file state
//! shared by every descriptor open on that file, chiefly the
//! directory slot through which the file's size is read and
//! written, plus the reference count that keeps the slot pinned.
//! Remove and rename consult the v-node table so a file with
//! open descriptors cannot be pulled out from under them.
//!
//! State updates are direct writes into the mapping.  There is
//! no journal and no atomicity across blocks after a crash;
//! durability is whatever [`Sfs::flush`] and the host's
//! writeback provide.  Within the single-mutator model, though,
//! every successful call leaves the on-disk structure
//! consistent, and the consistency checker holds the crate to
//! that.

use std::fs::OpenOptions;
use std::io::Read;
use std::path::Path;

use log::{debug, info};
use memmap2::MmapMut;

use crate::alloc;
use crate::dir::{self, ListCookie};
use crate::image::Image;
use crate::layout::{
    BLOCK_DATA, BLOCK_SIZE, BlockId, DIR_ENTRIES_PER_BLOCK, FILE_COUNT_LIMIT,
    MAGIC, MAX_DISK_SIZE, MAX_FILE_SIZE, NIL, OPEN_FILE_LIMIT, Tag,
    chain_blocks,
};
use crate::result::{Error, Result};

/// Per-open-file state.
#[derive(Clone, Copy, Debug)]
struct Descriptor {
    vnode: usize,   // index into the v-node table
    start: BlockId, // first block of the file's chain
    curr: BlockId,  // block holding byte `pos - 1` (start if pos == 0)
    pos: u32,       // cursor; never exceeds the file size
}

/// Per-file state shared by all descriptors open on the file.
#[derive(Clone, Copy, Debug)]
struct VNode {
    slot: usize, // directory slot of the file's entry
    refs: u32,   // open descriptors referencing this v-node
}

/// A mounted volume with its open-file tables.
struct Mounted {
    img: Image<MmapMut>,
    fds: [Option<Descriptor>; OPEN_FILE_LIMIT],
    vnodes: [Option<VNode>; FILE_COUNT_LIMIT],
}

/// A point-in-time accounting of a mounted volume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Usage {
    /// Total blocks, the superblock included.
    pub n_blocks: u32,
    /// Blocks on the free list.
    pub free_blocks: u32,
    /// Live directory entries.
    pub live_files: u32,
}

/// One step of a directory listing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ListStep {
    /// An entry was produced: the name, NUL included, occupies
    /// this many bytes at the front of the output buffer.
    Entry(usize),
    /// The listing is exhausted and the cookie has been reset.
    Done,
}

/// The file system engine.  See the module documentation.
#[derive(Default)]
pub struct Sfs {
    state: Option<Mounted>,
}

/// Returns the host page size, in bytes.  Volume sizes must be
/// a multiple of this.
pub fn host_page_size() -> u64 {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 { 4096 } else { sz as u64 }
}

/// Initializes a zeroed region as an empty volume: magic, block
/// count, an empty directory, and every block from 1 up threaded
/// onto the free list in ascending order.
pub(crate) fn initialize_volume<M>(img: &mut Image<M>, n_blocks: u32)
where
    M: std::ops::DerefMut<Target = [u8]>,
{
    assert_eq!(img.len() as u64, n_blocks as u64 * BLOCK_SIZE as u64);
    img.set_magic();
    img.set_n_blocks(n_blocks);
    img.set_next_rootdir(NIL);
    img.set_freelist(if n_blocks > 1 { 1 } else { NIL });
    for b in 1..n_blocks {
        img.set_tag(b, Tag::Free);
        img.set_prev(b, b - 1);
        img.set_next(b, if b + 1 == n_blocks { NIL } else { b + 1 });
    }
    for slot in 0..DIR_ENTRIES_PER_BLOCK {
        img.set_entry_first(NIL, slot, NIL);
    }
}

impl Sfs {
    /// Returns a new engine with no volume mounted.
    pub fn new() -> Sfs {
        Sfs::default()
    }

    /// Returns true IFF a volume is mounted.
    pub fn is_mounted(&self) -> bool {
        self.state.is_some()
    }

    /// Creates and formats a volume image at `path`, and leaves
    /// it mounted.  The size must be a nonzero multiple of the
    /// host page size and fit the on-disk block count field.
    pub fn format(&mut self, path: &Path, size: u64) -> Result<()> {
        if self.state.is_some() {
            return Err(Error::AlreadyMounted);
        }
        if size == 0 || size % host_page_size() != 0 {
            return Err(Error::InvalidArgument);
        }
        if size > MAX_DISK_SIZE || size / BLOCK_SIZE as u64 > u32::MAX as u64 {
            return Err(Error::TooLarge);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut img = Image::new(map);
        let n_blocks = (size / BLOCK_SIZE as u64) as u32;
        initialize_volume(&mut img, n_blocks);
        info!("formatted {}: {n_blocks} blocks", path.display());
        self.state = Some(Mounted::new(img));
        Ok(())
    }

    /// Mounts the volume image at `path` read-write.
    pub fn mount(&mut self, path: &Path) -> Result<()> {
        if self.state.is_some() {
            return Err(Error::AlreadyMounted);
        }
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len == 0 || len % host_page_size() != 0 {
            return Err(Error::InvalidArgument);
        }
        if len > MAX_DISK_SIZE || len / BLOCK_SIZE as u64 > u32::MAX as u64 {
            return Err(Error::TooLarge);
        }
        let mut magic = [0u8; MAGIC.len()];
        file.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(Error::InvalidArgument);
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        debug!("mounted {}: {} blocks", path.display(), len / BLOCK_SIZE as u64);
        self.state = Some(Mounted::new(Image::new(map)));
        Ok(())
    }

    /// Unmounts the volume, flushing it first.  Fails with
    /// `Busy` while any descriptor is open.
    pub fn unmount(&mut self) -> Result<()> {
        let m = self.state.as_ref().ok_or(Error::NotMounted)?;
        if m.fds.iter().any(Option::is_some) {
            return Err(Error::Busy);
        }
        m.img.flush()?;
        self.state = None;
        Ok(())
    }

    /// Flushes outstanding writes to the image file.
    pub fn flush(&self) -> Result<()> {
        self.state.as_ref().ok_or(Error::NotMounted)?.img.flush()
    }

    /// Returns an accounting of the mounted volume: total and
    /// free blocks, and live files.  Walks the free list, so it
    /// costs a pass over the free blocks.
    pub fn usage(&self) -> Result<Usage> {
        let m = self.state.as_ref().ok_or(Error::NotMounted)?;
        let mut free_blocks = 0;
        let mut b = m.img.freelist();
        while b != NIL {
            free_blocks += 1;
            b = m.img.next(b);
        }
        let live_files = (0..DIR_ENTRIES_PER_BLOCK)
            .filter(|&slot| m.img.entry_first(NIL, slot) != NIL)
            .count() as u32;
        Ok(Usage { n_blocks: m.img.n_blocks(), free_blocks, live_files })
    }

    /// Opens the named file, creating it if need be, and
    /// returns a descriptor.
    pub fn open(&mut self, name: &str) -> Result<usize> {
        dir::check_name(name)?;
        let m = self.state.as_mut().ok_or(Error::NotMounted)?;
        let scan = dir::scan(&m.img, name.as_bytes());
        if let Some(slot) = scan.found {
            return m.open_slot(slot);
        }
        let Some(slot) = scan.vacant else {
            return Err(Error::NoSpace);
        };
        let first = alloc::allocate(&mut m.img, 1, Tag::File).ok_or(Error::NoSpace)?;
        m.img.set_entry_first(NIL, slot, first);
        m.img.set_entry_size(NIL, slot, 0);
        m.img.set_entry_name(NIL, slot, name.as_bytes());
        debug!("created {name:?} in slot {slot}, first block {first}");
        m.open_slot(slot)
    }

    /// Closes a descriptor.  Tolerant: a descriptor that is out
    /// of range or not open does nothing.
    pub fn close(&mut self, fd: usize) {
        let Some(m) = self.state.as_mut() else {
            return;
        };
        let Some(d) = m.fds.get_mut(fd).and_then(Option::take) else {
            return;
        };
        if let Some(vn) = m.vnodes[d.vnode].as_mut() {
            vn.refs -= 1;
            if vn.refs == 0 {
                m.vnodes[d.vnode] = None;
            }
        }
    }

    /// Reads from the descriptor's position into `buf`.
    /// Returns the number of bytes read, which is zero at end
    /// of file.
    pub fn read(&mut self, fd: usize, buf: &mut [u8]) -> Result<usize> {
        let m = self.state.as_mut().ok_or(Error::BadDescriptor)?;
        let d = m.descriptor(fd)?;
        let size = m.img.entry_size(NIL, m.slot_of(&d));
        let n = ((size - d.pos) as usize).min(buf.len());
        if n == 0 {
            return Ok(0);
        }
        let mut curr = d.curr;
        let mut pos = d.pos;
        let mut copied = 0;
        while copied < n {
            let off = pos as usize % BLOCK_DATA;
            if pos > 0 && off == 0 {
                let next = m.img.next(curr);
                assert_ne!(next, NIL, "file chain ends mid-read");
                curr = next;
            }
            assert_eq!(m.img.tag(curr), Some(Tag::File), "block {curr} in a file chain");
            let take = (BLOCK_DATA - off).min(n - copied);
            buf[copied..copied + take]
                .copy_from_slice(&m.img.data(curr)[off..off + take]);
            pos += take as u32;
            copied += take;
        }
        m.update(fd, curr, pos);
        Ok(n)
    }

    /// Writes `buf` at the descriptor's position, growing the
    /// file as needed.  All-or-nothing: either every byte is
    /// written or the volume is untouched.
    pub fn write(&mut self, fd: usize, buf: &[u8]) -> Result<usize> {
        let m = self.state.as_mut().ok_or(Error::BadDescriptor)?;
        let d = m.descriptor(fd)?;
        let slot = m.slot_of(&d);
        let size = m.img.entry_size(NIL, slot);
        let end = d.pos as u64 + buf.len() as u64;
        // Growth is in whole blocks, so the cap applies to the
        // rounded-up allocation, not the final size.
        if end.div_ceil(BLOCK_DATA as u64) * BLOCK_DATA as u64 > MAX_FILE_SIZE {
            return Err(Error::TooLarge);
        }
        let end = end as u32;
        let have = chain_blocks(size);
        let need = chain_blocks(end);
        let mut fresh = if need > have {
            let head = alloc::allocate(&mut m.img, need - have, Tag::File)
                .ok_or(Error::NoSpace)?;
            debug!("grew slot {slot} by {} blocks", need - have);
            Some(head)
        } else {
            None
        };
        let mut curr = d.curr;
        let mut pos = d.pos;
        let mut copied = 0;
        while copied < buf.len() {
            let off = pos as usize % BLOCK_DATA;
            if pos > 0 && off == 0 {
                let mut next = m.img.next(curr);
                if next == NIL {
                    // The old tail; splice the new stretch on.
                    let head = fresh.take().expect("file chain ends mid-write");
                    m.img.set_next(curr, head);
                    m.img.set_prev(head, curr);
                    next = head;
                }
                curr = next;
            }
            assert_eq!(m.img.tag(curr), Some(Tag::File), "block {curr} in a file chain");
            let take = (BLOCK_DATA - off).min(buf.len() - copied);
            m.img.data_mut(curr)[off..off + take]
                .copy_from_slice(&buf[copied..copied + take]);
            pos += take as u32;
            copied += take;
        }
        assert!(fresh.is_none(), "allocated chain never spliced");
        if end > size {
            m.img.set_entry_size(NIL, slot, end);
        }
        m.update(fd, curr, pos);
        Ok(buf.len())
    }

    /// Returns the descriptor's position.
    pub fn getpos(&self, fd: usize) -> Result<u64> {
        let m = self.state.as_ref().ok_or(Error::BadDescriptor)?;
        Ok(m.descriptor(fd)?.pos as u64)
    }

    /// Moves the descriptor's position by `delta`, clamping to
    /// the file, and returns the new position.
    pub fn seek(&mut self, fd: usize, delta: i64) -> Result<u64> {
        let m = self.state.as_mut().ok_or(Error::BadDescriptor)?;
        let d = m.descriptor(fd)?;
        let size = m.img.entry_size(NIL, m.slot_of(&d));
        let pos = (d.pos as i64).saturating_add(delta).clamp(0, size as i64) as u32;
        let hops = if pos == 0 { 0 } else { (pos - 1) / BLOCK_DATA as u32 };
        let mut curr = d.start;
        for _ in 0..hops {
            curr = m.img.next(curr);
            assert_ne!(curr, NIL, "file chain shorter than its size");
        }
        m.update(fd, curr, pos);
        Ok(pos as u64)
    }

    /// Removes the named file.  Fails with `Busy` while the
    /// file is open.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        dir::check_name(name)?;
        let m = self.state.as_mut().ok_or(Error::NotMounted)?;
        let slot = dir::scan(&m.img, name.as_bytes()).found.ok_or(Error::NoEntry)?;
        if m.vnode_for(slot) {
            return Err(Error::Busy);
        }
        let first = m.img.entry_first(NIL, slot);
        m.img.set_entry_first(NIL, slot, NIL);
        alloc::free(&mut m.img, first);
        debug!("removed {name:?} from slot {slot}");
        Ok(())
    }

    /// Renames `old` to `new`, atomically replacing any file
    /// already called `new`.  Replacement of or out of an open
    /// file fails with `Busy`; renaming an open file to a fresh
    /// name is permitted, as only the name bytes change.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        dir::check_name(old)?;
        dir::check_name(new)?;
        let m = self.state.as_mut().ok_or(Error::NotMounted)?;
        let oslot = dir::scan(&m.img, old.as_bytes()).found.ok_or(Error::NoEntry)?;
        if new == old {
            return Ok(());
        }
        if let Some(nslot) = dir::scan(&m.img, new.as_bytes()).found {
            // The entry changes slots, so neither file may be
            // open: the replaced chain would vanish under its
            // readers, and the v-node for `old` holds a slot
            // index that would go stale.
            if m.vnode_for(nslot) || m.vnode_for(oslot) {
                return Err(Error::Busy);
            }
            let doomed = m.img.entry_first(NIL, nslot);
            let first = m.img.entry_first(NIL, oslot);
            let size = m.img.entry_size(NIL, oslot);
            alloc::free(&mut m.img, doomed);
            m.img.set_entry_first(NIL, nslot, first);
            m.img.set_entry_size(NIL, nslot, size);
            m.img.set_entry_first(NIL, oslot, NIL);
        } else {
            m.img.set_entry_name(NIL, oslot, new.as_bytes());
        }
        Ok(())
    }

    /// Advances a directory listing by one entry.  On
    /// `ListStep::Entry`, the entry's name, NUL-terminated, has
    /// been copied to the front of `out`.  The cookie is left
    /// unchanged if `out` cannot hold the name, so the call may
    /// be retried with a larger buffer.
    pub fn list(&self, cookie: &mut ListCookie, out: &mut [u8]) -> Result<ListStep> {
        if out.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let m = self.state.as_ref().ok_or(Error::NotMounted)?;
        for slot in cookie.slot.unwrap_or(0)..DIR_ENTRIES_PER_BLOCK {
            if m.img.entry_first(NIL, slot) == NIL {
                continue;
            }
            let name = m.img.entry_name(NIL, slot);
            if name.len() + 1 > out.len() {
                return Err(Error::NameTooLong);
            }
            out[..name.len()].copy_from_slice(name);
            out[name.len()] = 0;
            cookie.slot = Some(slot + 1);
            return Ok(ListStep::Entry(name.len() + 1));
        }
        cookie.slot = None;
        Ok(ListStep::Done)
    }
}

impl Mounted {
    fn new(img: Image<MmapMut>) -> Mounted {
        Mounted { img, fds: [None; OPEN_FILE_LIMIT], vnodes: [None; FILE_COUNT_LIMIT] }
    }

    /// Returns a copy of the given descriptor's state.
    fn descriptor(&self, fd: usize) -> Result<Descriptor> {
        self.fds.get(fd).copied().flatten().ok_or(Error::BadDescriptor)
    }

    /// Returns the directory slot behind a descriptor.
    fn slot_of(&self, d: &Descriptor) -> usize {
        self.vnodes[d.vnode].expect("descriptor without v-node").slot
    }

    /// Returns true IFF some v-node references the given slot.
    fn vnode_for(&self, slot: usize) -> bool {
        self.vnodes.iter().flatten().any(|v| v.slot == slot)
    }

    /// Writes a descriptor's cursor back after a walk.
    fn update(&mut self, fd: usize, curr: BlockId, pos: u32) {
        if let Some(d) = self.fds.get_mut(fd).and_then(Option::as_mut) {
            d.curr = curr;
            d.pos = pos;
        }
    }

    /// Opens a descriptor onto the file in the given directory
    /// slot, creating or sharing its v-node.
    fn open_slot(&mut self, slot: usize) -> Result<usize> {
        let fd = self
            .fds
            .iter()
            .position(Option::is_none)
            .ok_or(Error::TooManyOpenFiles)?;
        let vi = match self
            .vnodes
            .iter()
            .position(|v| v.is_some_and(|v| v.slot == slot))
        {
            Some(vi) => vi,
            None => {
                let vi = self
                    .vnodes
                    .iter()
                    .position(Option::is_none)
                    .ok_or(Error::OutOfMemory)?;
                self.vnodes[vi] = Some(VNode { slot, refs: 0 });
                vi
            }
        };
        if let Some(vn) = self.vnodes[vi].as_mut() {
            vn.refs += 1;
        }
        let first = self.img.entry_first(NIL, slot);
        self.fds[fd] = Some(Descriptor { vnode: vi, start: first, curr: first, pos: 0 });
        Ok(fd)
    }
}
