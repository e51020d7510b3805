/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Generic path rewriting for path-bearing syscalls, plus the read-back
//! fixups (readlink, getcwd) and the chdir commit protocol.

use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use graft_trace::StoppedTask;
use syscalls::Errno;
use syscalls::Sysno;

use crate::event_loop::Engine;
use crate::fs::flags;
use crate::fs::flags::OFlagExt;
use crate::fs::translate::bytes_to_path;
use crate::fs::Follow;
use crate::fs::FsView;
use crate::fs::Translated;
use crate::fs::PATH_MAX;
use crate::sysdesc::FollowRule;
use crate::sysdesc::PathArg;
use crate::tracee::RegVersion;
use crate::tracee::Slot;
use crate::tracee::Tracee;

/// Leaf functions may use the 128 bytes below the stack pointer without
/// allocating, so the scratch area starts below the red zone.
const RED_ZONE: u64 = 128;

/// A bump allocator over the reserved region of the tracee's stack, used to
/// stage translated strings that rewritten registers then point at.
pub(crate) struct Scratch {
    next: u64,
}

impl Scratch {
    /// Builds the scratch area below the stack pointer the guest entered the
    /// syscall with.
    pub fn new(tracee: &Tracee) -> Self {
        Scratch {
            next: tracee.peek_reg(RegVersion::Original, Slot::StackPointer) - RED_ZONE,
        }
    }

    /// Stages a NUL-terminated string, returning its tracee-side address.
    pub fn push_cstring(&mut self, task: &StoppedTask, bytes: &[u8]) -> Result<u64, Errno> {
        self.next -= bytes.len() as u64 + 1;
        task.write_cstring(self.next, bytes)?;
        Ok(self.next)
    }

    /// Stages an array of words (an argv-style vector), returning its
    /// tracee-side address.
    pub fn push_words(&mut self, task: &StoppedTask, words: &[u64]) -> Result<u64, Errno> {
        self.next -= (words.len() * 8) as u64;
        // Word arrays are dereferenced by the kernel; keep them aligned.
        self.next &= !7;
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();
        task.write_exact(self.next, &bytes)?;
        Ok(self.next)
    }
}

/// Peeks the guest path string at the given register slot.
pub(crate) fn read_path(
    task: &StoppedTask,
    tracee: &Tracee,
    slot: Slot,
) -> Result<PathBuf, Errno> {
    let addr = tracee.peek_reg(RegVersion::Original, slot);
    if addr == 0 {
        return Err(Errno::EFAULT);
    }
    let bytes = task.read_cstring(addr, PATH_MAX - 1)?;
    Ok(bytes_to_path(bytes))
}

/// Resolves the directory a dirfd refers to, as a guest path. The kernel's
/// own view of the descriptor is a host path, read through procfs and
/// reverse-translated.
pub(crate) fn resolve_dirfd(tracee: &Tracee, dirfd: i32) -> Result<PathBuf, Errno> {
    if dirfd == libc::AT_FDCWD {
        return Ok(tracee.fs.cwd.clone());
    }
    if dirfd < 0 {
        return Err(Errno::EBADF);
    }

    let link = format!("/proc/{}/fd/{}", tracee.pid, dirfd);
    let host = std::fs::read_link(link).map_err(|_| Errno::EBADF)?;

    let view = FsView {
        bindings: &tracee.fs.bindings,
        cwd: &tracee.fs.cwd,
    };
    Ok(view.detranslate(&host))
}

fn resolve_follow(tracee: &Tracee, rule: FollowRule) -> Follow {
    match rule {
        FollowRule::Always => Follow::Final,
        FollowRule::Never => Follow::NotFinal,
        FollowRule::UnlessFlag(slot, bit) => {
            if tracee.peek_reg(RegVersion::Original, slot) & bit != 0 {
                Follow::NotFinal
            } else {
                Follow::Final
            }
        }
        FollowRule::IfFlag(slot, bit) => {
            if tracee.peek_reg(RegVersion::Original, slot) & bit != 0 {
                Follow::Final
            } else {
                Follow::NotFinal
            }
        }
    }
}

/// Translates one path argument and rewrites its register to point at the
/// staged host path.
fn translate_one(
    tracee: &mut Tracee,
    task: &StoppedTask,
    scratch: &mut Scratch,
    arg: &PathArg,
) -> Result<(), Errno> {
    let addr = tracee.peek_reg(RegVersion::Original, arg.path);
    if addr == 0 {
        // NULL is meaningful for some *at calls (utimensat); leave it to the
        // kernel.
        return Ok(());
    }

    let guest = read_path(task, tracee, arg.path)?;

    // The empty string addresses the dirfd itself (AT_EMPTY_PATH); the
    // descriptor already refers to a host object, so there is nothing to
    // rewrite.
    if guest.as_os_str().is_empty() {
        return Ok(());
    }

    let guest = if guest.is_relative() {
        let base = match arg.dirfd {
            Some(slot) => {
                let dirfd = tracee.peek_reg(RegVersion::Original, slot) as i64 as i32;
                resolve_dirfd(tracee, dirfd)?
            }
            None => tracee.fs.cwd.clone(),
        };
        base.join(guest)
    } else {
        guest
    };

    let view = FsView {
        bindings: &tracee.fs.bindings,
        cwd: &tracee.fs.cwd,
    };
    let follow = resolve_follow(tracee, arg.follow);
    let translated = view.translate(&guest, follow)?;

    if arg.mutates && translated.read_only {
        return Err(Errno::EROFS);
    }

    let staged = scratch.push_cstring(task, translated.host.as_os_str().as_bytes())?;
    tracee.poke_reg(arg.path, staged);
    // A relative path has been made absolute; the dirfd no longer matters,
    // but it must stay valid, so it is rewritten to AT_FDCWD.
    if let Some(slot) = arg.dirfd {
        tracee.poke_reg(slot, libc::AT_FDCWD as i64 as u64);
    }

    Ok(())
}

/// Entry-phase translation for every syscall covered by the shape table.
pub(crate) fn translate_path_args(
    tracee: &mut Tracee,
    task: &StoppedTask,
    args: &[PathArg],
) -> Result<(), Errno> {
    let mut scratch = Scratch::new(tracee);
    for arg in args {
        translate_one(tracee, task, &mut scratch, arg)?;
    }
    Ok(())
}

/// Entry-phase handling for the open family, whose write-rejection depends on
/// the flag word.
pub(crate) fn translate_open(
    tracee: &mut Tracee,
    task: &StoppedTask,
    sysno: Sysno,
) -> Result<(), Errno> {
    let (path_slot, dirfd_slot, flags_slot) = match sysno {
        #[cfg(target_arch = "x86_64")]
        Sysno::open => (Slot::SysArg1, None, Some(Slot::SysArg2)),
        #[cfg(target_arch = "x86_64")]
        Sysno::creat => (Slot::SysArg1, None, None),
        Sysno::openat => (Slot::SysArg2, Some(Slot::SysArg1), Some(Slot::SysArg3)),
        _ => unreachable!("not an open-family syscall: {}", sysno),
    };

    let oflags = match flags_slot {
        Some(slot) => flags::from_raw(tracee.peek_reg(RegVersion::Original, slot)),
        // creat(2) is open with O_CREAT|O_WRONLY|O_TRUNC.
        None => nix::fcntl::OFlag::O_CREAT | nix::fcntl::OFlag::O_WRONLY | nix::fcntl::OFlag::O_TRUNC,
    };

    let follow = if oflags.contains(nix::fcntl::OFlag::O_NOFOLLOW) {
        FollowRule::Never
    } else {
        FollowRule::Always
    };

    let arg = PathArg {
        path: path_slot,
        dirfd: dirfd_slot,
        follow,
        mutates: oflags.is_write(),
    };

    let mut scratch = Scratch::new(tracee);
    translate_one(tracee, task, &mut scratch, &arg)
}

/// Entry-phase handling for chdir/fchdir: translate (chdir only) and record
/// the prospective working directory, committed at exit-success.
pub(crate) fn translate_chdir(
    tracee: &mut Tracee,
    task: &StoppedTask,
    sysno: Sysno,
) -> Result<(), Errno> {
    if sysno == Sysno::fchdir {
        let dirfd = tracee.peek_reg(RegVersion::Original, Slot::SysArg1) as i64 as i32;
        let guest = resolve_dirfd(tracee, dirfd)?;
        tracee.fs.new_cwd = Some(guest);
        return Ok(());
    }

    let guest = read_path(task, tracee, Slot::SysArg1)?;
    let guest = if guest.is_relative() {
        tracee.fs.cwd.join(guest)
    } else {
        guest
    };

    let view = FsView {
        bindings: &tracee.fs.bindings,
        cwd: &tracee.fs.cwd,
    };
    let translated: Translated = view.translate(&guest, Follow::Final)?;

    let mut scratch = Scratch::new(tracee);
    let staged = scratch.push_cstring(task, translated.host.as_os_str().as_bytes())?;
    tracee.poke_reg(Slot::SysArg1, staged);
    tracee.fs.new_cwd = Some(translated.guest);

    Ok(())
}

/// Exit-phase commit of a successful chdir/fchdir.
pub(crate) fn commit_chdir(tracee: &mut Tracee, result: i64) {
    let new_cwd = tracee.fs.new_cwd.take();
    if result == 0 {
        if let Some(cwd) = new_cwd {
            tracing::debug!("vpid {} cwd -> {:?}", tracee.vpid, cwd);
            tracee.fs.cwd = cwd;
        }
    }
}

/// Exit-phase rewrite of getcwd: the kernel produced the host view; the guest
/// gets its own working directory back.
pub(crate) fn fixup_getcwd(tracee: &mut Tracee, task: &StoppedTask) -> Result<(), Errno> {
    let result = tracee.peek_reg(RegVersion::Current, Slot::SysResult) as i64;
    if result < 0 {
        return Ok(());
    }

    let buf = tracee.peek_reg(RegVersion::Original, Slot::SysArg1);
    let size = tracee.peek_reg(RegVersion::Original, Slot::SysArg2);
    let cwd = tracee.fs.cwd.as_os_str().as_bytes().to_vec();

    if (cwd.len() as u64) + 1 > size {
        return Err(Errno::ERANGE);
    }

    task.write_cstring(buf, &cwd)?;
    tracee.poke_reg(Slot::SysResult, cwd.len() as u64 + 1);
    Ok(())
}

/// Exit-phase rewrite of readlink/readlinkat: absolute targets are host paths
/// and must be reverse-translated; `/proc/<self>/exe` answers with the guest
/// view of the executable.
pub(crate) fn fixup_readlink(
    engine: &Engine,
    tracee: &mut Tracee,
    task: &StoppedTask,
    sysno: Sysno,
) -> Result<(), Errno> {
    let result = tracee.peek_reg(RegVersion::Current, Slot::SysResult) as i64;
    if result <= 0 {
        return Ok(());
    }

    let (path_slot, buf_slot, size_slot) = if sysno == Sysno::readlinkat {
        (Slot::SysArg2, Slot::SysArg3, Slot::SysArg4)
    } else {
        (Slot::SysArg1, Slot::SysArg2, Slot::SysArg3)
    };

    let buf = tracee.peek_reg(RegVersion::Original, buf_slot);
    let size = tracee.peek_reg(RegVersion::Original, size_slot);

    let mut target = vec![0u8; result as usize];
    task.read_exact(buf, &mut target)?;

    let answer = match proc_exe_target(engine, tracee, task, path_slot)? {
        Some(exe) => exe.as_os_str().as_bytes().to_vec(),
        None => {
            if target.first() == Some(&b'/') {
                let view = FsView {
                    bindings: &tracee.fs.bindings,
                    cwd: &tracee.fs.cwd,
                };
                let guest = view.detranslate(&bytes_to_path(target.clone()));
                guest.as_os_str().as_bytes().to_vec()
            } else {
                // Relative targets are guest-authored content; leave them.
                return Ok(());
            }
        }
    };

    if answer == target {
        return Ok(());
    }

    // readlink truncates silently.
    let n = answer.len().min(size as usize);
    task.write_exact(buf, &answer[..n])?;
    tracee.poke_reg(Slot::SysResult, n as u64);
    Ok(())
}

/// If the link operand names the exe magic link of a known tracee, returns
/// that tracee's guest-side executable path.
fn proc_exe_target(
    engine: &Engine,
    tracee: &Tracee,
    task: &StoppedTask,
    path_slot: Slot,
) -> Result<Option<PathBuf>, Errno> {
    let link = read_path(task, tracee, path_slot)?;
    let link = if link.is_relative() {
        tracee.fs.cwd.join(link)
    } else {
        link
    };
    let link = crate::fs::normalize(&link);

    let mut parts = link.components();
    if parts.next() != Some(std::path::Component::RootDir) {
        return Ok(None);
    }
    if parts.next().map(|c| c.as_os_str()) != Some("proc".as_ref()) {
        return Ok(None);
    }
    let who = match parts.next() {
        Some(c) => c.as_os_str().to_owned(),
        None => return Ok(None),
    };
    if parts.next().map(|c| c.as_os_str()) != Some("exe".as_ref()) || parts.next().is_some() {
        return Ok(None);
    }

    if who == "self" {
        return Ok(Some(tracee.exe.clone()));
    }

    if let Some(pid) = who.to_str().and_then(|s| s.parse::<i32>().ok()) {
        if pid == tracee.pid.as_raw() {
            return Ok(Some(tracee.exe.clone()));
        }
        if let Some(other) = engine.tracees.get(graft_trace::Pid::from_raw(pid)) {
            if let Ok(other) = other.try_borrow() {
                return Ok(Some(other.exe.clone()));
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::fs::BindingTable;
    use crate::tracee::FsNamespace;
    use crate::tracee::Tracee;

    fn test_tracee() -> Tracee {
        let fs = FsNamespace {
            bindings: Rc::new(BindingTable::new("/sandbox")),
            cwd: PathBuf::from("/start"),
            new_cwd: None,
        };
        Tracee::new(graft_trace::Pid::from_raw(1), 1, fs)
    }

    #[test]
    fn chdir_commits_only_on_success() {
        let mut tracee = test_tracee();

        tracee.fs.new_cwd = Some(PathBuf::from("/elsewhere"));
        commit_chdir(&mut tracee, -(libc::ENOENT as i64));
        assert_eq!(tracee.fs.cwd, PathBuf::from("/start"));
        assert!(tracee.fs.new_cwd.is_none());

        tracee.fs.new_cwd = Some(PathBuf::from("/elsewhere"));
        commit_chdir(&mut tracee, 0);
        assert_eq!(tracee.fs.cwd, PathBuf::from("/elsewhere"));
    }

    #[test]
    fn scratch_starts_below_red_zone() {
        use graft_trace::RegAccess;

        let mut tracee = test_tracee();
        tracee.seed_current_regs(|regs| *regs.sp_mut() = 0x8000);
        tracee.save_original_regs();

        let scratch = Scratch::new(&tracee);
        assert_eq!(scratch.next, 0x8000 - RED_ZONE);
    }

    #[test]
    fn follow_rules_honor_flag_bits() {
        let mut tracee = test_tracee();
        tracee.save_original_regs();

        assert_eq!(resolve_follow(&tracee, FollowRule::Always), Follow::Final);
        assert_eq!(resolve_follow(&tracee, FollowRule::Never), Follow::NotFinal);

        // Flag clear: UnlessFlag follows, IfFlag does not.
        assert_eq!(
            resolve_follow(
                &tracee,
                FollowRule::UnlessFlag(Slot::SysArg4, libc::AT_SYMLINK_NOFOLLOW as u64)
            ),
            Follow::Final
        );
        assert_eq!(
            resolve_follow(
                &tracee,
                FollowRule::IfFlag(Slot::SysArg5, libc::AT_SYMLINK_FOLLOW as u64)
            ),
            Follow::NotFinal
        );
    }
}
