// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The embedded directory.
//!
//! The superblock carries fifteen directory entries, and that
//! is the whole namespace: lookups are a linear scan over those
//! slots.  The `next_rootdir` field reserves room for overflow
//! directory blocks with the same entry layout, and the checker
//! walks that chain, but the engine does not extend it.

use std::ops::Deref;

use crate::image::Image;
use crate::layout::{DIR_ENTRIES_PER_BLOCK, NAME_MAX, NIL};
use crate::result::{Error, Result};

/// The result of a directory scan: the slot holding a live
/// entry with the sought name, and the first unused slot seen,
/// either of which may not exist.
pub(crate) struct Scan {
    pub(crate) found: Option<usize>,
    pub(crate) vacant: Option<usize>,
}

/// Scans the embedded directory for `name`, noting the first
/// vacant slot along the way.
pub(crate) fn scan<M: Deref<Target = [u8]>>(img: &Image<M>, name: &[u8]) -> Scan {
    let mut found = None;
    let mut vacant = None;
    for slot in 0..DIR_ENTRIES_PER_BLOCK {
        if img.entry_first(NIL, slot) == NIL {
            if vacant.is_none() {
                vacant = Some(slot);
            }
        } else if found.is_none() && img.entry_name(NIL, slot) == name {
            found = Some(slot);
        }
    }
    Scan { found, vacant }
}

/// Validates a name for use in a directory entry: nonempty, no
/// embedded NUL, and short enough to store with its terminator.
pub(crate) fn check_name(name: &str) -> Result<()> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.contains(&0) {
        return Err(Error::InvalidArgument);
    }
    if bytes.len() >= NAME_MAX {
        return Err(Error::NameTooLong);
    }
    Ok(())
}

/// An opaque cursor for directory listing.
///
/// The default cursor denotes the start of the directory; the
/// engine resets it there again once the listing is exhausted.
/// A cursor is invalidated by any mutation of the directory,
/// and the caller must not continue a listing across one.
#[derive(Clone, Copy, Debug, Default)]
pub struct ListCookie {
    pub(crate) slot: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::BLOCK_SIZE;

    #[test]
    fn name_rules() {
        assert!(check_name("a").is_ok());
        assert!(check_name("a-name.with23bytes-full").is_ok());
        assert!(matches!(
            check_name("a-name.with24bytes-full!"),
            Err(Error::NameTooLong)
        ));
        assert!(matches!(check_name(""), Err(Error::InvalidArgument)));
        assert!(matches!(check_name("a\0b"), Err(Error::InvalidArgument)));
    }

    #[test]
    fn scan_finds_live_and_vacant() {
        let mut img = Image::new(vec![0u8; BLOCK_SIZE]);
        img.set_entry_first(NIL, 1, 7);
        img.set_entry_name(NIL, 1, b"one");
        img.set_entry_first(NIL, 3, 9);
        img.set_entry_name(NIL, 3, b"three");

        let scan = super::scan(&img, b"three");
        assert_eq!(scan.found, Some(3));
        assert_eq!(scan.vacant, Some(0));

        let scan = super::scan(&img, b"nine");
        assert_eq!(scan.found, None);
        assert_eq!(scan.vacant, Some(0));
    }

    #[test]
    fn scan_ignores_stale_names_in_vacant_slots() {
        let mut img = Image::new(vec![0u8; BLOCK_SIZE]);
        // A removed file leaves its name bytes behind; only
        // `first_block` decides liveness.
        img.set_entry_name(NIL, 0, b"ghost");
        let scan = super::scan(&img, b"ghost");
        assert_eq!(scan.found, None);
        assert_eq!(scan.vacant, Some(0));
    }
}
