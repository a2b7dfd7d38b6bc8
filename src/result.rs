// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::io;

/// Various errors.
///
/// Every fallible operation in the crate resolves to exactly one
/// of these conditions; there are no partial-success states.
#[derive(Debug)]
pub enum Error {
    /// No volume is currently mounted.
    NotMounted,
    /// A volume is already mounted.
    AlreadyMounted,
    /// A size, buffer, or name argument is malformed.
    InvalidArgument,
    /// The volume or file would exceed its maximum size.
    TooLarge,
    /// A file name does not fit in a directory entry.
    NameTooLong,
    /// The volume has no free blocks, or the directory is full.
    NoSpace,
    /// The descriptor table is full.
    TooManyOpenFiles,
    /// A descriptor does not refer to an open file.
    BadDescriptor,
    /// No file with the given name exists.
    NoEntry,
    /// The file is open, or the volume is otherwise in use.
    Busy,
    /// The v-node table is full.
    OutOfMemory,
    /// An error from the host operating system.
    Io(io::Error),
}

impl Error {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotMounted => "No volume currently mounted",
            Self::AlreadyMounted => "A volume is already mounted",
            Self::InvalidArgument => "Invalid argument",
            Self::TooLarge => "Volume or file too large",
            Self::NameTooLong => "File name too long",
            Self::NoSpace => "No space left on volume",
            Self::TooManyOpenFiles => "Too many open files",
            Self::BadDescriptor => "Bad file descriptor",
            Self::NoEntry => "No such file",
            Self::Busy => "Volume or file busy",
            Self::OutOfMemory => "Out of memory",
            Self::Io(_) => "I/O error",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{}: {err}", self.as_str()),
            _ => write!(f, "{}", self.as_str()),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
