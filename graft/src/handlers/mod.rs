/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Syscall translation: the entry/exit dispatch and the per-family handlers.

mod exec;
mod ident;
mod net;
mod path;

use graft_trace::Pid;
use graft_trace::StoppedTask;
use graft_trace::TraceError;
use syscalls::Errno;
use syscalls::Sysno;
use tracing::trace;

pub(crate) use exec::commit_exec;

use crate::event_loop::Engine;
use crate::ptrace_emu;
use crate::sysdesc;
use crate::tracee::RegVersion;
use crate::tracee::Slot;
use crate::tracee::SyscallStatus;
use crate::tracee::Tracee;
use crate::tracee::WaitMode;

fn is_exec(sysno: Option<Sysno>) -> bool {
    matches!(sysno, Some(Sysno::execve) | Some(Sysno::execveat))
}

// Only wait4 is emulated; waitid carries its pid in a different register
// shape and guest tracers in practice go through the libc wrappers, which use
// wait4.
fn is_wait(sysno: Sysno) -> bool {
    sysno == Sysno::wait4
}

/// Entry-phase dispatch. Register snapshots are taken here; a translation
/// failure cancels the syscall and records the errno for the exit stop.
pub(crate) fn syscall_enter(
    engine: &Engine,
    pid: Pid,
    task: &StoppedTask,
) -> Result<(), TraceError> {
    let cell = engine.tracees.get(pid).unwrap();

    let sysno = {
        let mut tracee = cell.borrow_mut();
        tracee.fetch_regs(task)?;
        tracee.save_original_regs();
        tracee.status = SyscallStatus::Exit;
        Sysno::new(tracee.peek_reg(RegVersion::Original, Slot::SysArgNum) as usize)
    };

    trace!("pid {} enter {:?}", pid, sysno);

    match sysno {
        Some(Sysno::ptrace) => {
            let _ = ptrace_emu::translate_ptrace_enter(engine, pid);
        }
        Some(sysno) if is_wait(sysno) => {
            ptrace_emu::translate_wait_enter(engine, pid);
        }
        Some(sysno) => {
            let mut tracee = cell.borrow_mut();
            if let Err(errno) = enter_common(engine, &mut tracee, task, sysno) {
                trace!("pid {} enter {:?} canceled: {}", pid, sysno, errno);
                tracee.cancel_syscall(Some(errno));
            }
        }
        None => {}
    }

    cell.borrow_mut().push_regs(task)
}

/// Entry-phase translation for everything that does not touch other tracees.
fn enter_common(
    engine: &Engine,
    tracee: &mut Tracee,
    task: &StoppedTask,
    sysno: Sysno,
) -> Result<(), Errno> {
    match sysno {
        #[cfg(target_arch = "x86_64")]
        Sysno::open | Sysno::creat => path::translate_open(tracee, task, sysno),
        Sysno::openat => path::translate_open(tracee, task, sysno),

        // openat2's flags live in a struct; rejecting it makes libc fall back
        // to openat.
        Sysno::openat2 => Err(Errno::ENOSYS),

        Sysno::chdir | Sysno::fchdir => path::translate_chdir(tracee, task, sysno),

        Sysno::execve | Sysno::execveat => exec::translate_exec(tracee, task, sysno),

        Sysno::bind | Sysno::connect => {
            net::translate_sockaddr_port(&engine.port_map, tracee, task)
        }

        _ => path::translate_path_args(tracee, task, sysdesc::path_args(sysno)),
    }
}

/// Exit-phase dispatch: restore the guest's registers, inject recorded
/// errnos, run read-back fixups, and commit pending state.
pub(crate) fn syscall_exit(engine: &Engine, pid: Pid, task: &StoppedTask) -> Result<(), TraceError> {
    let cell = engine.tracees.get(pid).unwrap();

    let (sysno, result) = {
        let mut tracee = cell.borrow_mut();
        tracee.fetch_regs(task)?;
        let sysno = Sysno::new(tracee.peek_reg(RegVersion::Original, Slot::SysArgNum) as usize);
        let result = tracee.peek_reg(RegVersion::Current, Slot::SysResult) as i64;

        // A successful exec replaced the calling frame; the entry registers
        // must not be pushed over the fresh program.
        if is_exec(sysno) && result == 0 {
            tracee.status = SyscallStatus::Enter;
            return Ok(());
        }

        tracee.restore_original_regs();

        if let SyscallStatus::ExitError(errno) = tracee.status {
            tracee.poke_reg(Slot::SysResult, -(errno.into_raw() as i64) as u64);
            tracee.status = SyscallStatus::Enter;
            return tracee.push_regs(task);
        }

        (sysno, result)
    };

    trace!("pid {} exit {:?} = {}", pid, sysno, result);

    // Emulated-wait completion touches other tracees; no borrow may be held.
    if let Some(sysno) = sysno {
        if is_wait(sysno) {
            if let Err(errno) = ptrace_emu::translate_wait_exit(engine, pid) {
                let mut tracee = cell.borrow_mut();
                tracee.poke_reg(Slot::SysResult, -(errno.into_raw() as i64) as u64);
            }
            let mut tracee = cell.borrow_mut();
            if tracee.as_ptracer.wait_mode == WaitMode::WaitingInKernel {
                tracee.as_ptracer.wait_mode = WaitMode::NotWaiting;
            }
        }
    }

    {
        let mut tracee = cell.borrow_mut();

        if let Some(sysno) = sysno {
            if let Err(errno) = exit_fixups(engine, &mut tracee, task, sysno, result) {
                tracee.poke_reg(Slot::SysResult, -(errno.into_raw() as i64) as u64);
            }
        }

        if let Some(forced) = tracee.forced_result.take() {
            tracee.poke_reg(Slot::SysResult, forced as u64);
        }

        tracee.status = SyscallStatus::Enter;
        tracee.push_regs(task)
    }
}

/// Read-back rewrites and commits that run after a syscall finished.
fn exit_fixups(
    engine: &Engine,
    tracee: &mut Tracee,
    task: &StoppedTask,
    sysno: Sysno,
    result: i64,
) -> Result<(), Errno> {
    match sysno {
        Sysno::chdir | Sysno::fchdir => {
            path::commit_chdir(tracee, result);
            Ok(())
        }
        Sysno::getcwd => path::fixup_getcwd(tracee, task),
        Sysno::readlinkat => path::fixup_readlink(engine, tracee, task, sysno),
        #[cfg(target_arch = "x86_64")]
        Sysno::readlink => path::fixup_readlink(engine, tracee, task, sysno),
        Sysno::uname => ident::fixup_uname(engine, tracee, task),
        Sysno::getuid | Sysno::geteuid | Sysno::getgid | Sysno::getegid => {
            ident::fixup_getid(engine, tracee, sysno);
            Ok(())
        }
        _ if ident::is_stat_family(sysno) => ident::fixup_stat(engine, tracee, task, sysno),
        _ => Ok(()),
    }
}
