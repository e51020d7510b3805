/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Predicates over `open(2)`-style flag words.

use nix::fcntl::OFlag;

/// Access predicates for an `open(2)` flag word. The accessor mode bits are
/// not a bitmask (O_RDONLY is 0), so these cannot be written as plain
/// `contains` checks.
pub trait OFlagExt {
    /// The call wants to read from the file.
    fn is_read(&self) -> bool;

    /// The call wants to write, create, or truncate the file.
    fn is_write(&self) -> bool;

    /// The call creates the file if it does not exist.
    fn create_if_not_exist(&self) -> bool;
}

impl OFlagExt for OFlag {
    fn is_read(&self) -> bool {
        let accmode = *self & OFlag::O_ACCMODE;
        accmode == OFlag::O_RDONLY || accmode == OFlag::O_RDWR
    }

    fn is_write(&self) -> bool {
        let accmode = *self & OFlag::O_ACCMODE;
        accmode == OFlag::O_WRONLY
            || accmode == OFlag::O_RDWR
            || self.intersects(OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_APPEND)
    }

    fn create_if_not_exist(&self) -> bool {
        self.contains(OFlag::O_CREAT)
    }
}

/// Same predicates for a raw flag word peeked out of a tracee register.
pub fn from_raw(flags: u64) -> OFlag {
    OFlag::from_bits_truncate(flags as libc::c_int)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_is_read() {
        assert!(OFlag::O_RDONLY.is_read());
        assert!(!OFlag::O_RDONLY.is_write());
        assert!(!OFlag::O_RDONLY.create_if_not_exist());
    }

    #[test]
    fn write_modes() {
        assert!(OFlag::O_WRONLY.is_write());
        assert!(!OFlag::O_WRONLY.is_read());

        assert!(OFlag::O_RDWR.is_read());
        assert!(OFlag::O_RDWR.is_write());

        // O_CREAT and O_TRUNC imply mutation even with O_RDONLY.
        assert!((OFlag::O_RDONLY | OFlag::O_CREAT).is_write());
        assert!((OFlag::O_RDONLY | OFlag::O_TRUNC).is_write());
        assert!((OFlag::O_RDONLY | OFlag::O_CREAT).create_if_not_exist());
    }

    #[test]
    fn from_raw_truncates_unknown_bits() {
        let flags = from_raw((libc::O_WRONLY | libc::O_CREAT) as u64);
        assert!(flags.is_write());
        assert!(flags.create_if_not_exist());
    }
}
