// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block allocation.
//!
//! The free list is an ordinary block chain rooted at the
//! superblock, so allocation is list surgery: detach a prefix of
//! the free list, retag it, and hand it over; deallocation
//! retags a chain and splices it back onto the front.  Blocks
//! that were adjacent on the free list stay adjacent in the
//! allocated chain, which keeps the work per block down to the
//! tag and the two boundary links.
//!
//! Allocation is all-or-nothing.  A request the free list
//! cannot satisfy returns `None` and leaves the list untouched,
//! so a failed multi-block grow never strands half a chain.

use std::ops::DerefMut;

use crate::image::Image;
use crate::layout::{BlockId, NIL, Tag};

/// Detaches `n` blocks from the front of the free list, retags
/// them as `tag`, and returns the head of the detached chain.
/// Returns `None`, with the free list unchanged, if `n` is zero
/// or the list holds fewer than `n` blocks.
pub(crate) fn allocate<M>(img: &mut Image<M>, n: u32, tag: Tag) -> Option<BlockId>
where
    M: DerefMut<Target = [u8]>,
{
    if n == 0 {
        return None;
    }
    let head = img.freelist();
    if head == NIL {
        return None;
    }
    // Walk to the n-th block without touching anything, so a
    // short list is left exactly as found.
    let mut last = head;
    for _ in 1..n {
        let next = img.next(last);
        if next == NIL {
            return None;
        }
        last = next;
    }
    let rest = img.next(last);
    img.set_next(last, NIL);
    if rest != NIL {
        img.set_prev(rest, NIL);
    }
    img.set_freelist(rest);
    // The detached prefix is already internally linked; only the
    // tags change.  The head's `prev` was already NIL.
    let mut b = head;
    loop {
        assert_eq!(img.tag(b), Some(Tag::Free), "allocating non-free block {b}");
        img.set_tag(b, tag);
        if b == last {
            break;
        }
        b = img.next(b);
    }
    Some(head)
}

/// Returns the chain starting at `first` to the free list.  If
/// `first` is mid-chain, it is detached from its predecessor
/// first; the whole stretch from `first` to the end of its
/// chain is freed.
pub(crate) fn free<M>(img: &mut Image<M>, first: BlockId)
where
    M: DerefMut<Target = [u8]>,
{
    assert_ne!(first, NIL);
    let prev = img.prev(first);
    if prev != NIL {
        img.set_next(prev, NIL);
        img.set_prev(first, NIL);
    }
    let mut last = first;
    loop {
        assert_ne!(img.tag(last), Some(Tag::Free), "freeing free block {last}");
        img.set_tag(last, Tag::Free);
        let next = img.next(last);
        if next == NIL {
            break;
        }
        last = next;
    }
    // Splice [first, last] onto the front of the free list.
    let old = img.freelist();
    img.set_next(last, old);
    if old != NIL {
        img.set_prev(old, last);
    }
    img.set_freelist(first);
}
