/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! execve/execveat translation: resolve the program through the bindings and,
//! when the binfmt check says the program cannot run on the host CPU, wrap the
//! call in the configured emulator.

use std::os::unix::ffi::OsStrExt;

use graft_trace::StoppedTask;
use syscalls::Errno;
use syscalls::Sysno;
use tracing::debug;

use super::path::read_path;
use super::path::resolve_dirfd;
use super::path::Scratch;
use crate::binfmt::Binfmt;
use crate::fs::Follow;
use crate::fs::FsView;
use crate::tracee::RegVersion;
use crate::tracee::Slot;
use crate::tracee::Tracee;

/// Upper bound on argv entries walked out of tracee memory.
const ARGV_MAX: usize = 4096;

/// Entry-phase translation of execve/execveat.
pub(crate) fn translate_exec(
    tracee: &mut Tracee,
    task: &StoppedTask,
    sysno: Sysno,
) -> Result<(), Errno> {
    let (path_slot, argv_slot) = if sysno == Sysno::execveat {
        (Slot::SysArg2, Slot::SysArg3)
    } else {
        (Slot::SysArg1, Slot::SysArg2)
    };

    // An empty argv is how the boundary is probed; the kernel historically
    // tolerates it, this engine does not.
    let argv_addr = tracee.peek_reg(RegVersion::Original, argv_slot);
    if argv_addr == 0 || task.read_value::<u64>(argv_addr)? == 0 {
        return Err(Errno::EFAULT);
    }

    let guest = read_path(task, tracee, path_slot)?;
    let guest = if guest.is_relative() {
        let base = if sysno == Sysno::execveat {
            let dirfd = tracee.peek_reg(RegVersion::Original, Slot::SysArg1) as i64 as i32;
            resolve_dirfd(tracee, dirfd)?
        } else {
            tracee.fs.cwd.clone()
        };
        base.join(guest)
    } else {
        guest
    };

    let view = FsView {
        bindings: &tracee.fs.bindings,
        cwd: &tracee.fs.cwd,
    };
    let translated = view.translate(&guest, Follow::Final)?;

    tracee.new_exe = Some(translated.guest.clone());

    let wrap = match (&tracee.qemu, Binfmt::examine(&translated.host)) {
        (Some(qemu), Ok(Some(binfmt))) if binfmt.needs_emulator() => Some(qemu.clone()),
        _ => None,
    };

    let mut scratch = Scratch::new(tracee);

    match wrap {
        None => {
            let staged = scratch.push_cstring(task, translated.host.as_os_str().as_bytes())?;
            tracee.poke_reg(path_slot, staged);
        }
        Some(qemu) => {
            debug!(
                "vpid {} exec {:?} through emulator",
                tracee.vpid, translated.guest
            );

            // Old argv pointers, minus argv[0] which the program path
            // replaces.
            let mut old_argv = Vec::new();
            let mut cursor = argv_addr;
            loop {
                let ptr = task.read_value::<u64>(cursor)?;
                if ptr == 0 {
                    break;
                }
                old_argv.push(ptr);
                if old_argv.len() > ARGV_MAX {
                    return Err(Errno::E2BIG);
                }
                cursor += 8;
            }

            // New vector: emulator command, then the host path of the
            // program, then the original arguments.
            let mut new_argv = Vec::new();
            for part in qemu.iter() {
                new_argv.push(scratch.push_cstring(task, part.as_os_str().as_bytes())?);
            }
            let program = scratch.push_cstring(task, translated.host.as_os_str().as_bytes())?;
            new_argv.push(program);
            new_argv.extend(&old_argv[1..]);
            new_argv.push(0);

            let argv_staged = scratch.push_words(task, &new_argv)?;

            // The emulator itself is a host program; its path bypasses the
            // bindings.
            tracee.poke_reg(path_slot, new_argv[0]);
            tracee.poke_reg(argv_slot, argv_staged);
            if sysno == Sysno::execveat {
                // The wrapped call is plain execve semantics.
                tracee.poke_reg(Slot::SysArg1, libc::AT_FDCWD as i64 as u64);
                tracee.poke_reg(Slot::SysArg4, 0);
            }
        }
    }

    Ok(())
}

/// Commits the pending executable path at the exec stop and resets state the
/// fresh program must not inherit.
pub(crate) fn commit_exec(tracee: &mut Tracee) {
    if let Some(exe) = tracee.new_exe.take() {
        debug!("vpid {} exe -> {:?}", tracee.vpid, exe);
        tracee.exe = exe;
    }
    tracee.as_ptracee.ignore_loader_syscalls = false;
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::rc::Rc;

    use super::*;
    use crate::fs::BindingTable;
    use crate::tracee::FsNamespace;

    #[test]
    fn commit_exec_promotes_new_exe() {
        let fs = FsNamespace {
            bindings: Rc::new(BindingTable::new("/sandbox")),
            cwd: PathBuf::from("/"),
            new_cwd: None,
        };
        let mut tracee = Tracee::new(graft_trace::Pid::from_raw(1), 1, fs);
        tracee.exe = PathBuf::from("/bin/old");
        tracee.new_exe = Some(PathBuf::from("/bin/new"));

        commit_exec(&mut tracee);
        assert_eq!(tracee.exe, PathBuf::from("/bin/new"));
        assert!(tracee.new_exe.is_none());

        // A second commit without a pending exe is a no-op.
        commit_exec(&mut tracee);
        assert_eq!(tracee.exe, PathBuf::from("/bin/new"));
    }
}
