/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Nested-ptrace emulation.
//!
//! A guest process that itself calls `ptrace` cannot be allowed to reach the
//! kernel: its children are already traced by the engine, and the kernel
//! permits one tracer per process. Instead, `ptrace` and `wait4` from guest
//! tracers are canceled and serviced from the engine's own tables.
//!
//! Every kernel stop of a ptracee produces two views: the engine consumes the
//! *proot* view for translation, and if the stop satisfies the guest tracer's
//! option mask, the *ptracer* view is marked pending, SIGCHLD is sent to the
//! tracer, and the ptracee is held stopped until the tracer collects the
//! event through `wait4`.

use graft_trace::Pid;
use graft_trace::Reg;
use graft_trace::Signal;
use graft_trace::StoppedTask;
use graft_trace::SYSCALL_INSN_LEN;
use syscalls::Errno;
use tracing::debug;
use tracing::warn;

use crate::event_loop::Engine;
use crate::tracee::RegVersion;
use crate::tracee::RestartHow;
use crate::tracee::Slot;
use crate::tracee::SyscallStatus;
use crate::tracee::WaitMode;

const WALL: u64 = libc::__WALL as u64;
const WCLONE: u64 = libc::__WCLONE as u64;

/// Builds the status word of a signal stop.
pub(crate) fn w_stopcode(sig: i32) -> i32 {
    (sig << 8) | 0x7f
}

/// Builds the status word of a ptrace-event stop.
pub(crate) fn w_event(event: i32) -> i32 {
    (((event << 8) | libc::SIGTRAP) << 8) | 0x7f
}

/// Builds the status word of a syscall stop under TRACESYSGOOD.
pub(crate) fn w_syscall_stop() -> i32 {
    w_stopcode(libc::SIGTRAP | 0x80)
}

fn wifstopped(status: i32) -> bool {
    status & 0xff == 0x7f
}

fn wifexited(status: i32) -> bool {
    status & 0x7f == 0
}

fn wifsignaled(status: i32) -> bool {
    !wifstopped(status) && !wifexited(status)
}

/// The `__WALL`/`__WCLONE` wait-option filter: does a wait with `options`
/// collect a child created the way `clone` says?
fn expected_wait_clone(options: u64, clone: bool) -> bool {
    (options & WALL) != 0 || ((options & WCLONE) != 0) == clone
}

/// Does a wait for `wait_pid` with `options` match this ptracee?
fn wait_matches(wait_pid: i32, options: u64, ptracee_pid: Pid, clone: bool) -> bool {
    (wait_pid == -1 || wait_pid == ptracee_pid.as_raw()) && expected_wait_clone(options, clone)
}

/// Severs the ptracer/ptracee link, e.g. on PTRACE_DETACH or once a zombie's
/// status has been collected.
pub(crate) fn detach_from_ptracer(engine: &Engine, ptracee_pid: Pid) {
    let ptracer_pid = {
        let Some(cell) = engine.tracees.get(ptracee_pid) else {
            return;
        };
        let mut ptracee = cell.borrow_mut();
        ptracee.as_ptracee.tracing_started = false;
        ptracee.as_ptracee.ptracer.take()
    };

    if let Some(ptracer_pid) = ptracer_pid {
        if let Some(cell) = engine.tracees.get(ptracer_pid) {
            let mut ptracer = cell.borrow_mut();
            ptracer.as_ptracer.nb_ptracees = ptracer.as_ptracer.nb_ptracees.saturating_sub(1);
            ptracer.as_ptracer.zombies.retain(|z| *z != ptracee_pid);
        }
        debug!("pid {} detached from guest tracer {}", ptracee_pid, ptracer_pid);
    }
}

/// Finds a ptracee of `ptracer_pid` that is stopped with a pending
/// ptracer-view event and matches the wait filter.
fn find_stopped_ptracee(
    engine: &Engine,
    ptracer_pid: Pid,
    wait_pid: i32,
    options: u64,
) -> Option<Pid> {
    for pid in engine.tracees.pids() {
        let Some(cell) = engine.tracees.get(pid) else {
            continue;
        };
        let Ok(tracee) = cell.try_borrow() else {
            continue;
        };
        if tracee.as_ptracee.ptracer != Some(ptracer_pid) {
            continue;
        }
        if !wait_matches(wait_pid, options, pid, tracee.clone) {
            continue;
        }
        if tracee.as_ptracee.event_ptracer.pending && !tracee.running {
            return Some(pid);
        }
    }
    None
}

/// Does the guest tracer have any ptracee a wait could eventually collect?
fn has_ptracees(engine: &Engine, ptracer_pid: Pid, wait_pid: i32, options: u64) -> bool {
    for pid in engine.tracees.pids() {
        let Some(cell) = engine.tracees.get(pid) else {
            continue;
        };
        let Ok(tracee) = cell.try_borrow() else {
            continue;
        };
        if tracee.as_ptracee.ptracer == Some(ptracer_pid)
            && wait_matches(wait_pid, options, pid, tracee.clone)
        {
            return true;
        }
    }
    false
}

/// Entry-phase interception of `wait4` issued by a guest tracer.
///
/// Three cases: no emulated ptracees at all (the kernel handles the wait), a
/// pending event exists (the syscall is canceled and the event is delivered
/// at the exit stop), or events may arrive later (the syscall is canceled and
/// the tracer parks until `handle_ptracee_event` wakes it).
pub(crate) fn translate_wait_enter(engine: &Engine, pid: Pid) {
    let cell = engine.tracees.get(pid).unwrap();
    let mut tracee = cell.borrow_mut();

    if tracee.as_ptracer.nb_ptracees == 0 {
        tracee.as_ptracer.wait_mode = WaitMode::WaitingInKernel;
        return;
    }

    let wait_pid = tracee.peek_reg(RegVersion::Original, Slot::SysArg1) as i64 as i32;
    let options = tracee.peek_reg(RegVersion::Original, Slot::SysArg3);
    tracee.as_ptracer.wait_pid = wait_pid;
    tracee.as_ptracer.wait_options = options;

    if !has_ptracees(engine, pid, wait_pid, options) {
        // The wait targets real children only.
        tracee.as_ptracer.wait_mode = WaitMode::WaitingInKernel;
        return;
    }

    // All further handling happens at the exit stop of the canceled syscall.
    tracee.cancel_syscall(None);
    tracee.as_ptracer.wait_mode = WaitMode::WaitingInProot;
}

/// Exit-phase completion of an intercepted `wait4`: deliver a pending event
/// if one exists, otherwise park the tracer.
pub(crate) fn translate_wait_exit(engine: &Engine, pid: Pid) -> Result<(), Errno> {
    let (wait_pid, options) = {
        let cell = engine.tracees.get(pid).unwrap();
        let tracee = cell.borrow();
        if tracee.as_ptracer.wait_mode != WaitMode::WaitingInProot {
            return Ok(());
        }
        (tracee.as_ptracer.wait_pid, tracee.as_ptracer.wait_options)
    };

    match find_stopped_ptracee(engine, pid, wait_pid, options) {
        Some(ptracee_pid) => {
            let result = update_wait_status(engine, pid, ptracee_pid)?;
            let cell = engine.tracees.get(pid).unwrap();
            let mut tracee = cell.borrow_mut();
            tracee.as_ptracer.wait_mode = WaitMode::NotWaiting;
            if result != 0 {
                tracee.forced_result = Some(result);
            } else {
                // The tracer was already rewound and restarted onto its
                // original wait; the exit path must not restart it again.
                tracee.restart_how = RestartHow::DontRestart;
            }
        }
        None => {
            if options & libc::WNOHANG as u64 != 0 {
                let cell = engine.tracees.get(pid).unwrap();
                let mut tracee = cell.borrow_mut();
                tracee.as_ptracer.wait_mode = WaitMode::NotWaiting;
                tracee.forced_result = Some(0);
            } else {
                // Park until a qualifying event arrives.
                let cell = engine.tracees.get(pid).unwrap();
                let mut tracee = cell.borrow_mut();
                tracee.restart_how = RestartHow::DontRestart;
                tracee.parked_at = Some(crate::tracee::ParkedStop::SyscallExit);
            }
        }
    }
    Ok(())
}

/// Pokes the status word into the guest tracer's wait buffer and returns the
/// result register value for its wait4.
///
/// Special case: the kernel reports a terminating event only once when tracer
/// and parent are the same process. The engine therefore suppresses its own
/// view and re-executes the tracer's original wait4 against the kernel so the
/// zombie is actually collected.
pub(crate) fn update_wait_status(
    engine: &Engine,
    ptracer_pid: Pid,
    ptracee_pid: Pid,
) -> Result<i64, Errno> {
    let (event, is_zombie, parent_is_tracer) = {
        let cell = engine.tracees.get(ptracee_pid).unwrap();
        let ptracee = cell.borrow();
        (
            ptracee.as_ptracee.event_ptracer.value,
            ptracee.as_ptracee.is_zombie,
            ptracee.parent == Some(ptracer_pid),
        )
    };

    if parent_is_tracer && (wifexited(event) || wifsignaled(event)) {
        restart_original_wait(engine, ptracer_pid)?;
        detach_from_ptracer(engine, ptracee_pid);
        return Ok(0);
    }

    let status_addr = {
        let cell = engine.tracees.get(ptracer_pid).unwrap();
        let ptracer = cell.borrow();
        ptracer.peek_reg(RegVersion::Original, Slot::SysArg2)
    };

    if status_addr != 0 {
        let task = StoppedTask::assume_stopped(ptracer_pid);
        task.write_value::<i32>(status_addr, &event)?;
    }

    {
        let cell = engine.tracees.get(ptracee_pid).unwrap();
        let mut ptracee = cell.borrow_mut();
        ptracee.as_ptracee.event_ptracer.pending = false;
    }

    if is_zombie {
        detach_from_ptracer(engine, ptracee_pid);
    }

    Ok(ptracee_pid.as_raw() as i64)
}

/// Rewinds the guest tracer to re-execute the wait4 it entered, letting the
/// kernel collect the terminal status directly.
fn restart_original_wait(engine: &Engine, ptracer_pid: Pid) -> Result<(), Errno> {
    let cell = engine.tracees.get(ptracer_pid).unwrap();
    let mut ptracer = cell.borrow_mut();

    let task = StoppedTask::assume_stopped(ptracer_pid);

    let sysno = ptracer.peek_reg(RegVersion::Original, Slot::SysArgNum);
    let ip = ptracer.peek_reg(RegVersion::Original, Slot::InstrPointer);

    // Restore the entry frame and step back over the syscall instruction.
    for slot in [
        Slot::SysArg1,
        Slot::SysArg2,
        Slot::SysArg3,
        Slot::SysArg4,
        Slot::SysArg5,
        Slot::SysArg6,
        Slot::StackPointer,
    ] {
        let value = ptracer.peek_reg(RegVersion::Original, slot);
        ptracer.poke_reg(slot, value);
    }
    ptracer.poke_reg(Slot::SysArgNum, sysno);
    // On x86_64 the re-executed `syscall` instruction takes its number from
    // rax, which the canceled syscall left holding -ENOSYS. (On aarch64 the
    // result register aliases the first argument, already restored above.)
    #[cfg(target_arch = "x86_64")]
    ptracer.poke_reg(Slot::SysResult, sysno);
    ptracer.poke_reg(Slot::InstrPointer, ip - SYSCALL_INSN_LEN as Reg);

    ptracer.push_regs(&task).map_err(|_| Errno::ESRCH)?;

    ptracer.as_ptracer.wait_mode = WaitMode::NotWaiting;
    ptracer.as_ptracer.wait_pid = 0;
    ptracer.status = SyscallStatus::Enter;
    ptracer.restart_how = RestartHow::Syscall;
    ptracer
        .restart(StoppedTask::assume_stopped(ptracer_pid))
        .map_err(|_| Errno::ESRCH)?;

    debug!("guest tracer {} rewound to its original wait", ptracer_pid);
    Ok(())
}

/// What the event loop should do with a ptracee's stop after the emulator has
/// seen it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum EventDisposition {
    /// Not forwarded; the translator and the normal restart path proceed.
    NotForwarded,
    /// Forwarded to the guest tracer; the ptracee stays stopped until the
    /// tracer restarts it.
    KeepStopped,
    /// Terminal event forwarded; nothing to keep stopped.
    Terminal,
}

/// Routes one kernel stop (or terminal status) of a ptracee through the
/// emulated-ptrace layer. `event` is the raw wait status word the guest
/// tracer would have seen; `event_msg` is the PTRACE_GETEVENTMSG payload.
pub(crate) fn handle_ptracee_event(
    engine: &Engine,
    ptracee_pid: Pid,
    mut event: i32,
    event_msg: u64,
) -> EventDisposition {
    let ptracer_pid = {
        let Some(cell) = engine.tracees.get(ptracee_pid) else {
            return EventDisposition::NotForwarded;
        };
        let tracee = cell.borrow();
        match tracee.as_ptracee.ptracer {
            Some(pid) => pid,
            None => return EventDisposition::NotForwarded,
        }
    };

    let mut keep_stopped = EventDisposition::KeepStopped;

    {
        let cell = engine.tracees.get(ptracee_pid).unwrap();
        let mut ptracee = cell.borrow_mut();
        ptracee.as_ptracee.event_proot.value = event;
        ptracee.as_ptracee.event_proot.pending = true;

        if wifstopped(event) {
            let data = (event >> 8) & 0xffff;
            let options = ptracee.as_ptracee.options;

            let interested = |bit: u64| options & bit != 0;

            if data == libc::SIGTRAP | 0x80 {
                if ptracee.as_ptracee.ignore_syscalls
                    || ptracee.as_ptracee.ignore_loader_syscalls
                {
                    return EventDisposition::NotForwarded;
                }
                if !interested(libc::PTRACE_O_TRACESYSGOOD as u64) {
                    event &= !(0x80 << 8);
                }
            } else if data == libc::SIGTRAP | (libc::PTRACE_EVENT_FORK << 8) {
                if !interested(libc::PTRACE_O_TRACEFORK as u64) {
                    return EventDisposition::NotForwarded;
                }
                ptracee.as_ptracee.tracing_started = true;
            } else if data == libc::SIGTRAP | (libc::PTRACE_EVENT_VFORK << 8) {
                if !interested(libc::PTRACE_O_TRACEVFORK as u64) {
                    return EventDisposition::NotForwarded;
                }
                ptracee.as_ptracee.tracing_started = true;
            } else if data == libc::SIGTRAP | (libc::PTRACE_EVENT_VFORK_DONE << 8) {
                if !interested(libc::PTRACE_O_TRACEVFORKDONE as u64) {
                    return EventDisposition::NotForwarded;
                }
                ptracee.as_ptracee.tracing_started = true;
            } else if data == libc::SIGTRAP | (libc::PTRACE_EVENT_CLONE << 8) {
                if !interested(libc::PTRACE_O_TRACECLONE as u64) {
                    return EventDisposition::NotForwarded;
                }
                ptracee.as_ptracee.tracing_started = true;
            } else if data == libc::SIGTRAP | (libc::PTRACE_EVENT_EXIT << 8) {
                if !interested(libc::PTRACE_O_TRACEEXIT as u64) {
                    return EventDisposition::NotForwarded;
                }
                ptracee.as_ptracee.tracing_started = true;
            } else if data == libc::SIGTRAP | (libc::PTRACE_EVENT_EXEC << 8) {
                if !interested(libc::PTRACE_O_TRACEEXEC as u64) {
                    return EventDisposition::NotForwarded;
                }
                ptracee.as_ptracee.tracing_started = true;
            } else {
                // Plain signal-delivery stop; always visible to the tracer.
                ptracee.as_ptracee.tracing_started = true;
            }
        } else {
            // Terminal event: reported, and nothing remains to hold stopped.
            keep_stopped = EventDisposition::Terminal;
            ptracee.as_ptracee.tracing_started = true;
            ptracee.as_ptracee.is_zombie = true;
        }

        if !ptracee.as_ptracee.tracing_started {
            // The tracer has not yet observed the first stop; do not forward.
            return EventDisposition::NotForwarded;
        }

        ptracee.as_ptracee.event_ptracer.value = event;
        ptracee.as_ptracee.event_ptracer.pending = true;
        ptracee.as_ptracee.event_msg = event_msg;
    }

    // Notify the ptracer asynchronously, as the kernel does.
    let _ = nix::sys::signal::kill(ptracer_pid.into(), Signal::SIGCHLD);

    // If the tracer is parked in an emulated wait that matches, deliver the
    // event and restart it synchronously.
    let deliver = {
        let Some(cell) = engine.tracees.get(ptracer_pid) else {
            return keep_stopped;
        };
        let ptracer = cell.borrow();
        let (wait_pid, options) = (
            ptracer.as_ptracer.wait_pid,
            ptracer.as_ptracer.wait_options,
        );
        let clone = engine
            .tracees
            .get(ptracee_pid)
            .map(|c| c.borrow().clone)
            .unwrap_or(false);
        ptracer.as_ptracer.wait_mode == WaitMode::WaitingInProot
            && wait_matches(wait_pid, options, ptracee_pid, clone)
    };

    if deliver {
        match update_wait_status(engine, ptracer_pid, ptracee_pid) {
            Ok(result) => {
                if result != 0 {
                    let task = StoppedTask::assume_stopped(ptracer_pid);
                    let cell = engine.tracees.get(ptracer_pid).unwrap();
                    let mut ptracer = cell.borrow_mut();
                    ptracer.poke_reg(Slot::SysResult, result as u64);
                    if ptracer.push_regs(&task).is_err() {
                        warn!("guest tracer {} died during wait delivery", ptracer_pid);
                        return keep_stopped;
                    }
                    ptracer.as_ptracer.wait_mode = WaitMode::NotWaiting;
                    ptracer.as_ptracer.wait_pid = 0;
                    ptracer.status = SyscallStatus::Enter;
                    ptracer.restart_how = RestartHow::Syscall;
                    if ptracer.restart(StoppedTask::assume_stopped(ptracer_pid)).is_err() {
                        warn!("guest tracer {} died during restart", ptracer_pid);
                    }
                }
            }
            Err(errno) => {
                warn!(
                    "wait delivery to guest tracer {} failed: {}",
                    ptracer_pid, errno
                );
            }
        }
    }

    keep_stopped
}

/// Entry-phase interception of `ptrace` issued by a guest process. The real
/// syscall is always canceled; the computed result is injected at the exit
/// stop.
pub(crate) fn translate_ptrace_enter(engine: &Engine, pid: Pid) -> Result<(), Errno> {
    let (request, target_raw, addr, data) = {
        let cell = engine.tracees.get(pid).unwrap();
        let mut tracee = cell.borrow_mut();
        tracee.cancel_syscall(None);
        tracee.forced_result = Some(0);
        (
            tracee.peek_reg(RegVersion::Original, Slot::SysArg1) as u32,
            tracee.peek_reg(RegVersion::Original, Slot::SysArg2) as i64 as i32,
            tracee.peek_reg(RegVersion::Original, Slot::SysArg3),
            tracee.peek_reg(RegVersion::Original, Slot::SysArg4),
        )
    };
    let target = Pid::from_raw(target_raw);

    let result = emulate_ptrace_request(engine, pid, request, target, addr, data);

    if let Err(errno) = result {
        let cell = engine.tracees.get(pid).unwrap();
        let mut tracee = cell.borrow_mut();
        tracee.forced_result = None;
        tracee.status = SyscallStatus::ExitError(errno);
    }
    Ok(())
}

fn emulate_ptrace_request(
    engine: &Engine,
    pid: Pid,
    request: u32,
    target: Pid,
    addr: u64,
    data: u64,
) -> Result<(), Errno> {
    debug!(
        "pid {} emulated ptrace request {} on {}",
        pid, request, target
    );

    match request {
        libc::PTRACE_TRACEME => {
            let parent_pid = {
                let cell = engine.tracees.get(pid).unwrap();
                let tracee = cell.borrow();
                tracee.parent.ok_or(Errno::EPERM)?
            };
            attach(engine, parent_pid, pid, false)
        }
        libc::PTRACE_ATTACH => {
            if target == pid {
                return Err(Errno::EPERM);
            }
            attach(engine, pid, target, true)
        }
        libc::PTRACE_SEIZE => {
            if target == pid {
                return Err(Errno::EPERM);
            }
            attach(engine, pid, target, false)?;
            let cell = engine.tracees.get(target).unwrap();
            cell.borrow_mut().as_ptracee.options = data;
            Ok(())
        }
        libc::PTRACE_SETOPTIONS => {
            let cell = ptracee_of(engine, pid, target)?;
            cell.borrow_mut().as_ptracee.options = data;
            Ok(())
        }
        libc::PTRACE_GETEVENTMSG => {
            let msg = {
                let cell = ptracee_of(engine, pid, target)?;
                let tracee = cell.borrow();
                tracee.as_ptracee.event_msg
            };
            let task = StoppedTask::assume_stopped(pid);
            task.write_value::<u64>(data, &msg)
        }
        libc::PTRACE_PEEKDATA | libc::PTRACE_PEEKTEXT => {
            ptracee_of(engine, pid, target)?;
            let word = StoppedTask::assume_stopped(target).read_value::<u64>(addr)?;
            StoppedTask::assume_stopped(pid).write_value::<u64>(data, &word)
        }
        libc::PTRACE_POKEDATA | libc::PTRACE_POKETEXT => {
            ptracee_of(engine, pid, target)?;
            StoppedTask::assume_stopped(target).write_value::<u64>(addr, &data)
        }
        libc::PTRACE_GETREGSET => {
            ptracee_of(engine, pid, target)?;
            if addr != libc::NT_PRSTATUS as u64 {
                return Err(Errno::EINVAL);
            }
            let regs = StoppedTask::assume_stopped(target)
                .getregs()
                .map_err(trace_errno)?;
            let tracer_task = StoppedTask::assume_stopped(pid);
            // data points at an iovec in the tracer.
            let iov = tracer_task.read_value::<libc::iovec>(data)?;
            let len = iov.iov_len.min(std::mem::size_of_val(&regs));
            let bytes = unsafe {
                std::slice::from_raw_parts(&regs as *const _ as *const u8, len)
            };
            tracer_task.write_exact(iov.iov_base as u64, bytes)?;
            let iov = libc::iovec {
                iov_base: iov.iov_base,
                iov_len: len,
            };
            tracer_task.write_value::<libc::iovec>(data, &iov)
        }
        #[cfg(target_arch = "x86_64")]
        libc::PTRACE_GETREGS => {
            ptracee_of(engine, pid, target)?;
            let regs = StoppedTask::assume_stopped(target)
                .getregs()
                .map_err(trace_errno)?;
            StoppedTask::assume_stopped(pid).write_value(data, &regs)
        }
        libc::PTRACE_GETSIGINFO => {
            ptracee_of(engine, pid, target)?;
            let siginfo = StoppedTask::assume_stopped(target)
                .getsiginfo()
                .map_err(trace_errno)?;
            StoppedTask::assume_stopped(pid).write_value(data, &siginfo)
        }
        libc::PTRACE_SYSCALL | libc::PTRACE_CONT | libc::PTRACE_DETACH | libc::PTRACE_KILL => {
            restart_ptracee(engine, pid, target, request, data)
        }
        libc::PTRACE_INTERRUPT => {
            let cell = ptracee_of(engine, pid, target)?;
            let running = cell.borrow().running;
            if running {
                // The next stop (the SIGSTOP delivery) is forwarded as usual.
                let _ = nix::sys::signal::kill(target.into(), Signal::SIGSTOP);
            } else {
                // Already parked: synthesize the seized-style group-stop
                // event for the tracer.
                let status = (((libc::PTRACE_EVENT_STOP << 8) | libc::SIGSTOP) << 8) | 0x7f;
                handle_ptracee_event(engine, target, status, 0);
            }
            Ok(())
        }
        libc::PTRACE_LISTEN => {
            // The ptracee stays parked; nothing to do beyond acknowledging.
            ptracee_of(engine, pid, target)?;
            Ok(())
        }
        _ => {
            warn!("pid {} unsupported ptrace request {}", pid, request);
            Err(Errno::EIO)
        }
    }
}

fn trace_errno(err: graft_trace::TraceError) -> Errno {
    match err {
        graft_trace::TraceError::Os(errno) => errno,
        graft_trace::TraceError::Gone(_) => Errno::ESRCH,
    }
}

/// Looks up `target` and checks it really is a ptracee of `tracer`.
fn ptracee_of<'a>(
    engine: &'a Engine,
    tracer: Pid,
    target: Pid,
) -> Result<&'a std::cell::RefCell<crate::tracee::Tracee>, Errno> {
    let cell = engine.tracees.get(target).ok_or(Errno::ESRCH)?;
    {
        let tracee = cell.try_borrow().map_err(|_| Errno::ESRCH)?;
        if tracee.as_ptracee.ptracer != Some(tracer) {
            return Err(Errno::ESRCH);
        }
    }
    Ok(cell)
}

/// Records (tracer, ptracee) in the emulation tables.
fn attach(engine: &Engine, tracer: Pid, target: Pid, send_sigstop: bool) -> Result<(), Errno> {
    {
        let cell = engine.tracees.get(target).ok_or(Errno::ESRCH)?;
        let mut ptracee = cell.try_borrow_mut().map_err(|_| Errno::EPERM)?;
        if ptracee.as_ptracee.ptracer.is_some() {
            return Err(Errno::EPERM);
        }
        ptracee.as_ptracee.ptracer = Some(tracer);
    }

    {
        let cell = engine.tracees.get(tracer).ok_or(Errno::ESRCH)?;
        cell.borrow_mut().as_ptracer.nb_ptracees += 1;
    }

    debug!("pid {} is now guest-traced by {}", target, tracer);

    if send_sigstop {
        let _ = nix::sys::signal::kill(target.into(), Signal::SIGSTOP);
    }

    Ok(())
}

/// Restarts a ptracee on behalf of its guest tracer. At kernel level the
/// process is always restarted with PTRACE_SYSCALL (the engine must see every
/// syscall); a guest PTRACE_CONT merely suppresses forwarding of syscall
/// stops.
fn restart_ptracee(
    engine: &Engine,
    tracer: Pid,
    target: Pid,
    request: u32,
    data: u64,
) -> Result<(), Errno> {
    let cell = ptracee_of(engine, tracer, target)?;

    let parked_at_exit = {
        let mut ptracee = cell.borrow_mut();
        ptracee.as_ptracee.event_proot.pending = false;
        ptracee.as_ptracee.event_ptracer.pending = false;
        ptracee.as_ptracee.ignore_syscalls = request == libc::PTRACE_CONT;

        if request == libc::PTRACE_KILL {
            let _ = nix::sys::signal::kill(target.into(), Signal::SIGKILL);
        }

        let sig = if data != 0 {
            Signal::try_from(data as i32).ok()
        } else {
            None
        };
        ptracee.pending_signal = sig;

        if ptracee.running || ptracee.terminated {
            // Nothing to restart; the request only updated bookkeeping.
            return Ok(());
        }

        ptracee.parked_at == Some(crate::tracee::ParkedStop::SyscallExit)
            && ptracee.as_ptracee.ptracer.is_some()
    };

    // A ptracee parked at a syscall-exit stop was forwarded before the
    // engine's own exit translation ran; run it now so the guest's registers
    // are restored before it resumes.
    if parked_at_exit {
        crate::handlers::syscall_exit(engine, target, &StoppedTask::assume_stopped(target))
            .map_err(|_| Errno::ESRCH)?;
    }

    {
        let mut ptracee = cell.borrow_mut();
        if request == libc::PTRACE_DETACH {
            drop(ptracee);
            detach_from_ptracer(engine, target);
            ptracee = cell.borrow_mut();
        }
        ptracee.restart_how = RestartHow::Syscall;
        ptracee
            .restart(StoppedTask::assume_stopped(target))
            .map_err(|_| Errno::ESRCH)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use graft_trace::ExitStatus;

    use super::*;

    #[test]
    fn status_word_builders_match_wait_macros() {
        let status = w_stopcode(libc::SIGSTOP);
        assert!(libc::WIFSTOPPED(status));
        assert_eq!(libc::WSTOPSIG(status), libc::SIGSTOP);

        let status = w_event(libc::PTRACE_EVENT_CLONE);
        assert!(libc::WIFSTOPPED(status));
        assert_eq!(libc::WSTOPSIG(status), libc::SIGTRAP);
        assert_eq!(status >> 16, libc::PTRACE_EVENT_CLONE);

        let status = w_syscall_stop();
        assert!(libc::WIFSTOPPED(status));
        assert_eq!(libc::WSTOPSIG(status), libc::SIGTRAP | 0x80);
    }

    #[test]
    fn wait_filters() {
        let pid = Pid::from_raw(7);

        // waitpid(-1, 0) collects non-clone children.
        assert!(wait_matches(-1, 0, pid, false));
        assert!(!wait_matches(-1, 0, pid, true));

        // __WALL collects everything.
        assert!(wait_matches(-1, WALL, pid, true));
        assert!(wait_matches(-1, WALL, pid, false));

        // __WCLONE collects only clones.
        assert!(wait_matches(-1, WCLONE, pid, true));
        assert!(!wait_matches(-1, WCLONE, pid, false));

        // Pid filter.
        assert!(!wait_matches(8, WALL, pid, false));
        assert!(wait_matches(7, WALL, pid, false));
    }

    #[test]
    fn stopped_and_terminal_discriminators() {
        // Terminal words come straight from ExitStatus now; the local
        // discriminators must agree with its encoding.
        let exited = ExitStatus::Exited(1).as_wait_status();
        let killed = ExitStatus::Killed(Signal::SIGKILL, false).as_wait_status();

        assert!(wifstopped(w_stopcode(libc::SIGTRAP)));
        assert!(!wifstopped(exited));
        assert!(wifexited(exited));
        assert!(!wifexited(killed));
        assert!(wifsignaled(killed));
        assert!(!wifsignaled(exited));
        assert!(!wifsignaled(w_stopcode(libc::SIGSTOP)));
    }
}
