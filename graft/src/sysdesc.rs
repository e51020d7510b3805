/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Shape descriptors: which register slots of a syscall carry paths, which
//! dirfd they resolve against, whether a final symlink is dereferenced, and
//! whether the call mutates the filesystem (and therefore must be rejected on
//! a read-only binding).
//!
//! Syscalls whose translation depends on more than register shape (open and
//! friends, execve, chdir, the read-back family, sockets, and the emulated
//! ptrace surface) are dispatched by name in the handlers; everything listed
//! here is translated generically.

use syscalls::Sysno;

use crate::tracee::Slot;

/// How the final component of this path argument is dereferenced.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FollowRule {
    /// Always dereference a final symlink.
    Always,
    /// Never dereference a final symlink.
    Never,
    /// Dereference unless the given AT_* flag bit is set in the flag slot.
    UnlessFlag(Slot, u64),
    /// Dereference only if the given AT_* flag bit is set in the flag slot.
    IfFlag(Slot, u64),
}

/// One path-bearing argument of a syscall.
#[derive(Debug, Clone, Copy)]
pub struct PathArg {
    /// The register slot holding the path pointer.
    pub path: Slot,
    /// The register slot holding the dirfd the path is relative to, for the
    /// `*at` family.
    pub dirfd: Option<Slot>,
    pub follow: FollowRule,
    /// The call creates, modifies, or unlinks the object the path names.
    pub mutates: bool,
}

const fn path(slot: Slot, follow: FollowRule, mutates: bool) -> PathArg {
    PathArg {
        path: slot,
        dirfd: None,
        follow,
        mutates,
    }
}

const fn path_at(dirfd: Slot, slot: Slot, follow: FollowRule, mutates: bool) -> PathArg {
    PathArg {
        path: slot,
        dirfd: Some(dirfd),
        follow,
        mutates,
    }
}

const AT_SYMLINK_NOFOLLOW: u64 = libc::AT_SYMLINK_NOFOLLOW as u64;
const AT_SYMLINK_FOLLOW: u64 = libc::AT_SYMLINK_FOLLOW as u64;

/// Returns the path arguments of a syscall. The empty slice means the
/// syscall carries no generically-translated path.
pub fn path_args(sysno: Sysno) -> &'static [PathArg] {
    use FollowRule::*;
    use Slot::*;

    match sysno {
        // *at family, present on every architecture.
        Sysno::faccessat => {
            const A: [PathArg; 1] = [path_at(SysArg1, SysArg2, Always, false)];
            &A
        }
        Sysno::faccessat2 => {
            const A: [PathArg; 1] = [path_at(
                SysArg1,
                SysArg2,
                UnlessFlag(SysArg4, AT_SYMLINK_NOFOLLOW),
                false,
            )];
            &A
        }
        Sysno::newfstatat => {
            const A: [PathArg; 1] = [path_at(
                SysArg1,
                SysArg2,
                UnlessFlag(SysArg4, AT_SYMLINK_NOFOLLOW),
                false,
            )];
            &A
        }
        Sysno::statx => {
            const A: [PathArg; 1] = [path_at(
                SysArg1,
                SysArg2,
                UnlessFlag(SysArg3, AT_SYMLINK_NOFOLLOW),
                false,
            )];
            &A
        }
        Sysno::readlinkat => {
            const A: [PathArg; 1] = [path_at(SysArg1, SysArg2, Never, false)];
            &A
        }
        Sysno::mkdirat => {
            const A: [PathArg; 1] = [path_at(SysArg1, SysArg2, Never, true)];
            &A
        }
        Sysno::mknodat => {
            const A: [PathArg; 1] = [path_at(SysArg1, SysArg2, Never, true)];
            &A
        }
        Sysno::unlinkat => {
            const A: [PathArg; 1] = [path_at(SysArg1, SysArg2, Never, true)];
            &A
        }
        Sysno::renameat => {
            const A: [PathArg; 2] = [
                path_at(SysArg1, SysArg2, Never, true),
                path_at(SysArg3, SysArg4, Never, true),
            ];
            &A
        }
        Sysno::renameat2 => {
            const A: [PathArg; 2] = [
                path_at(SysArg1, SysArg2, Never, true),
                path_at(SysArg3, SysArg4, Never, true),
            ];
            &A
        }
        Sysno::linkat => {
            const A: [PathArg; 2] = [
                path_at(SysArg1, SysArg2, IfFlag(SysArg5, AT_SYMLINK_FOLLOW), false),
                path_at(SysArg3, SysArg4, Never, true),
            ];
            &A
        }
        // The link *content* (SysArg1) is a guest path and stays verbatim;
        // only the placement path is translated.
        Sysno::symlinkat => {
            const A: [PathArg; 1] = [path_at(SysArg2, SysArg3, Never, true)];
            &A
        }
        Sysno::fchmodat => {
            const A: [PathArg; 1] = [path_at(SysArg1, SysArg2, Always, true)];
            &A
        }
        Sysno::fchownat => {
            const A: [PathArg; 1] = [path_at(
                SysArg1,
                SysArg2,
                UnlessFlag(SysArg5, AT_SYMLINK_NOFOLLOW),
                true,
            )];
            &A
        }
        Sysno::utimensat => {
            const A: [PathArg; 1] = [path_at(
                SysArg1,
                SysArg2,
                UnlessFlag(SysArg4, AT_SYMLINK_NOFOLLOW),
                true,
            )];
            &A
        }
        Sysno::truncate => {
            const A: [PathArg; 1] = [path(SysArg1, Always, true)];
            &A
        }
        Sysno::statfs => {
            const A: [PathArg; 1] = [path(SysArg1, Always, false)];
            &A
        }
        Sysno::getxattr => {
            const A: [PathArg; 1] = [path(SysArg1, Always, false)];
            &A
        }
        Sysno::lgetxattr => {
            const A: [PathArg; 1] = [path(SysArg1, Never, false)];
            &A
        }
        Sysno::listxattr => {
            const A: [PathArg; 1] = [path(SysArg1, Always, false)];
            &A
        }
        Sysno::llistxattr => {
            const A: [PathArg; 1] = [path(SysArg1, Never, false)];
            &A
        }
        Sysno::setxattr => {
            const A: [PathArg; 1] = [path(SysArg1, Always, true)];
            &A
        }
        Sysno::lsetxattr => {
            const A: [PathArg; 1] = [path(SysArg1, Never, true)];
            &A
        }
        Sysno::removexattr => {
            const A: [PathArg; 1] = [path(SysArg1, Always, true)];
            &A
        }
        Sysno::lremovexattr => {
            const A: [PathArg; 1] = [path(SysArg1, Never, true)];
            &A
        }

        // Legacy path syscalls, absent on aarch64.
        #[cfg(target_arch = "x86_64")]
        Sysno::stat => {
            const A: [PathArg; 1] = [path(SysArg1, Always, false)];
            &A
        }
        #[cfg(target_arch = "x86_64")]
        Sysno::lstat => {
            const A: [PathArg; 1] = [path(SysArg1, Never, false)];
            &A
        }
        #[cfg(target_arch = "x86_64")]
        Sysno::access => {
            const A: [PathArg; 1] = [path(SysArg1, Always, false)];
            &A
        }
        #[cfg(target_arch = "x86_64")]
        Sysno::readlink => {
            const A: [PathArg; 1] = [path(SysArg1, Never, false)];
            &A
        }
        #[cfg(target_arch = "x86_64")]
        Sysno::mkdir => {
            const A: [PathArg; 1] = [path(SysArg1, Never, true)];
            &A
        }
        #[cfg(target_arch = "x86_64")]
        Sysno::rmdir => {
            const A: [PathArg; 1] = [path(SysArg1, Never, true)];
            &A
        }
        #[cfg(target_arch = "x86_64")]
        Sysno::unlink => {
            const A: [PathArg; 1] = [path(SysArg1, Never, true)];
            &A
        }
        #[cfg(target_arch = "x86_64")]
        Sysno::rename => {
            const A: [PathArg; 2] = [path(SysArg1, Never, true), path(SysArg2, Never, true)];
            &A
        }
        #[cfg(target_arch = "x86_64")]
        Sysno::link => {
            const A: [PathArg; 2] = [path(SysArg1, Never, false), path(SysArg2, Never, true)];
            &A
        }
        #[cfg(target_arch = "x86_64")]
        Sysno::symlink => {
            const A: [PathArg; 1] = [path(SysArg2, Never, true)];
            &A
        }
        #[cfg(target_arch = "x86_64")]
        Sysno::chmod => {
            const A: [PathArg; 1] = [path(SysArg1, Always, true)];
            &A
        }
        #[cfg(target_arch = "x86_64")]
        Sysno::chown => {
            const A: [PathArg; 1] = [path(SysArg1, Always, true)];
            &A
        }
        #[cfg(target_arch = "x86_64")]
        Sysno::lchown => {
            const A: [PathArg; 1] = [path(SysArg1, Never, true)];
            &A
        }
        #[cfg(target_arch = "x86_64")]
        Sysno::mknod => {
            const A: [PathArg; 1] = [path(SysArg1, Never, true)];
            &A
        }
        #[cfg(target_arch = "x86_64")]
        Sysno::utime => {
            const A: [PathArg; 1] = [path(SysArg1, Always, true)];
            &A
        }
        #[cfg(target_arch = "x86_64")]
        Sysno::utimes => {
            const A: [PathArg; 1] = [path(SysArg1, Always, true)];
            &A
        }
        #[cfg(target_arch = "x86_64")]
        Sysno::futimesat => {
            const A: [PathArg; 1] = [path_at(SysArg1, SysArg2, Always, true)];
            &A
        }

        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_family_uses_dirfd_slot() {
        let args = path_args(Sysno::openat2);
        assert!(args.is_empty(), "openat2 is rejected, not translated");

        let args = path_args(Sysno::mkdirat);
        assert_eq!(args.len(), 1);
        assert_eq!(args[0].dirfd, Some(Slot::SysArg1));
        assert_eq!(args[0].path, Slot::SysArg2);
        assert!(args[0].mutates);
    }

    #[test]
    fn rename_translates_both_paths() {
        let args = path_args(Sysno::renameat);
        assert_eq!(args.len(), 2);
        assert!(args.iter().all(|a| a.mutates));
        assert!(args.iter().all(|a| a.follow == FollowRule::Never));
    }

    #[test]
    fn symlink_content_is_not_translated() {
        let args = path_args(Sysno::symlinkat);
        assert_eq!(args.len(), 1);
        assert_eq!(args[0].path, Slot::SysArg2);
    }

    #[test]
    fn stat_family_follow_rules() {
        let args = path_args(Sysno::newfstatat);
        assert_eq!(
            args[0].follow,
            FollowRule::UnlessFlag(Slot::SysArg4, libc::AT_SYMLINK_NOFOLLOW as u64)
        );

        #[cfg(target_arch = "x86_64")]
        {
            assert_eq!(path_args(Sysno::lstat)[0].follow, FollowRule::Never);
            assert_eq!(path_args(Sysno::stat)[0].follow, FollowRule::Always);
        }
    }

    #[test]
    fn non_path_syscalls_have_no_args() {
        assert!(path_args(Sysno::getpid).is_empty());
        assert!(path_args(Sysno::read).is_empty());
        assert!(path_args(Sysno::close).is_empty());
    }
}
