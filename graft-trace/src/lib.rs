/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![deny(rustdoc::broken_intra_doc_links)]
#![cfg(target_os = "linux")]

//! The ptrace layer of the graft engine.
//!
//! This crate owns the raw kernel interface and nothing else: waiting on the
//! tracee herd, decoding what kind of stop the kernel delivered, and the
//! register/memory operations that are only legal while a tracee is stopped.
//! The engine's scheduler consumes [`wait_next`] in a loop and hands each
//! [`TraceEvent`] to its translation machinery.
//!
//! Everything here must run on the one thread that spawned the tracees; the
//! kernel refuses ptrace requests from anywhere else.

mod exit_status;
mod memory;
mod regs;

use core::mem::MaybeUninit;

use nix::sys::ptrace;
use nix::sys::wait::waitpid;
use nix::sys::wait::WaitPidFlag;
use nix::sys::wait::WaitStatus;
// Re-exports so that the engine does not need its own `nix` spelling for
// these.
pub use nix::sys::ptrace::Options;
pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
pub use syscalls::Errno;
use syscalls::Sysno;
use thiserror::Error;

pub use crate::exit_status::ExitStatus;
pub use crate::regs::Reg;
pub use crate::regs::RegAccess;
pub use crate::regs::Regs;
pub use crate::regs::SYSCALL_INSN_LEN;

/// An error from the ptrace layer.
#[derive(Error, Debug, Eq, PartialEq)]
pub enum TraceError {
    /// A kernel primitive failed.
    #[error(transparent)]
    Os(#[from] Errno),

    /// The tracee vanished mid-operation. ptrace reports this as ESRCH, and
    /// since every call here targets a process we observed in a stop, ESRCH
    /// can only mean the tracee died under us; its terminal status is still
    /// coming through the wait channel. (See "Death under ptrace" in
    /// ptrace(2).)
    #[error("tracee {0} vanished mid-operation")]
    Gone(Pid),
}

impl From<nix::errno::Errno> for TraceError {
    fn from(err: nix::errno::Errno) -> Self {
        Self::Os(Errno::new(err as i32))
    }
}

/// Which fork-family syscall created a child.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ForkKind {
    Fork,
    Vfork,
    Clone,
}

/// How to let a stopped tracee go.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Resume {
    /// Run until the next syscall entry or exit.
    Syscall,
    /// Run until the next signal or ptrace event.
    Cont,
    /// Stop tracing it altogether.
    Detach,
}

/// A tracee currently sitting in a ptrace stop. Register and memory
/// operations are only available through this handle, and letting the tracee
/// go consumes it.
#[derive(Debug, Eq, PartialEq)]
pub struct StoppedTask(Pid);

impl StoppedTask {
    /// Wraps a pid the caller knows to be in a ptrace stop. The engine parks
    /// tracees (a guest tracer may hold one stopped for a long time) and
    /// later operates on them by pid; this is the door back in. Nothing
    /// verifies the claim — a wrong pid surfaces as [`TraceError::Gone`] on
    /// the first operation.
    pub fn assume_stopped(pid: Pid) -> Self {
        StoppedTask(pid)
    }

    /// The tracee's pid.
    pub fn pid(&self) -> Pid {
        self.0
    }

    /// Applies the ESRCH-means-death rule to a failed primitive.
    fn gone_or(&self, err: Errno) -> TraceError {
        if err == Errno::ESRCH {
            TraceError::Gone(self.0)
        } else {
            TraceError::Os(err)
        }
    }

    fn gone_or_nix(&self, err: nix::Error) -> TraceError {
        self.gone_or(Errno::new(err as i32))
    }

    /// Reads a register set with PTRACE_GETREGSET. PTRACE_GETREGS does not
    /// exist on aarch64, so this is the one portable spelling.
    fn regset_read<T>(&self, which: i32) -> Result<T, TraceError> {
        let mut value = MaybeUninit::<T>::uninit();
        let mut iov = libc::iovec {
            iov_base: value.as_mut_ptr() as *mut libc::c_void,
            iov_len: core::mem::size_of::<T>(),
        };

        unsafe {
            syscalls::syscall!(
                Sysno::ptrace,
                libc::PTRACE_GETREGSET,
                self.0.as_raw(),
                which,
                &mut iov as *mut _
            )
        }
        .map_err(|err| self.gone_or(err))?;

        debug_assert_eq!(iov.iov_len, core::mem::size_of::<T>());
        Ok(unsafe { value.assume_init() })
    }

    fn regset_write<T>(&self, which: i32, value: &T) -> Result<(), TraceError> {
        let iov = libc::iovec {
            iov_base: value as *const _ as *mut _,
            iov_len: core::mem::size_of::<T>(),
        };

        unsafe {
            syscalls::syscall!(
                Sysno::ptrace,
                libc::PTRACE_SETREGSET,
                self.0.as_raw(),
                which,
                &iov as *const _
            )
        }
        .map_err(|err| self.gone_or(err))?;

        Ok(())
    }

    /// Fetches the general purpose registers.
    pub fn getregs(&self) -> Result<Regs, TraceError> {
        self.regset_read(libc::NT_PRSTATUS)
    }

    /// Writes the general purpose registers back.
    pub fn setregs(&self, regs: &Regs) -> Result<(), TraceError> {
        self.regset_write(libc::NT_PRSTATUS, regs)
    }

    /// Overrides the syscall number about to execute. Needed (and available)
    /// only on aarch64, where the number has its own regset and is not picked
    /// up from a PTRACE_SETREGSET at a syscall stop.
    #[cfg(target_arch = "aarch64")]
    pub fn set_syscall(&self, nr: i32) -> Result<(), TraceError> {
        const NT_ARM_SYSTEM_CALL: i32 = 0x404;
        self.regset_write(NT_ARM_SYSTEM_CALL, &nr)
    }

    /// Sets the tracing option mask.
    pub fn setoptions(&self, options: Options) -> Result<(), TraceError> {
        ptrace::setoptions(self.0, options).map_err(|err| self.gone_or_nix(err))
    }

    /// Fetches the event payload of the current stop (child pid at a fork
    /// event, exit status at an exit event).
    pub fn getevent(&self) -> Result<i64, TraceError> {
        ptrace::getevent(self.0).map_err(|err| self.gone_or_nix(err))
    }

    /// Fetches the siginfo of the current stop. Fails with EINVAL at a
    /// group-stop notification, which is exactly how the engine recognizes
    /// one.
    pub fn getsiginfo(&self) -> Result<libc::siginfo_t, TraceError> {
        ptrace::getsiginfo(self.0).map_err(|err| self.gone_or_nix(err))
    }

    /// Lets the tracee go, optionally delivering a signal.
    pub fn resume(self, how: Resume, sig: Option<Signal>) -> Result<(), TraceError> {
        match how {
            Resume::Syscall => ptrace::syscall(self.0, sig),
            Resume::Cont => ptrace::cont(self.0, sig),
            Resume::Detach => ptrace::detach(self.0, sig),
        }
        .map_err(|err| self.gone_or_nix(err))
    }
}

/// One delivery from the wait channel: a tracee stopped somewhere
/// interesting, or a tracee is gone for good.
#[derive(Debug)]
pub enum TraceEvent {
    /// A syscall entry or exit under PTRACE_O_TRACESYSGOOD. Which of the two
    /// it is, is the engine's bookkeeping: the kernel tags them identically
    /// and guarantees strict alternation.
    SyscallStop(StoppedTask),

    /// A signal is about to be delivered; the tracee stays stopped until the
    /// signal is passed on (or suppressed) at resume.
    SignalStop(StoppedTask, Signal),

    /// The tracee created a child; the new pid is already known from the
    /// event payload.
    ChildEvent(StoppedTask, ForkKind, Pid),

    /// The tracee completed an execve. The payload is the former thread id
    /// that performed the call.
    ExecStop(StoppedTask, Pid),

    /// A vfork parent was unblocked by its child execing or exiting.
    VforkDoneStop(StoppedTask),

    /// The tracee is about to die; registers are still readable, and it must
    /// be resumed once more to actually exit.
    ExitStop(StoppedTask),

    /// A group-stop (only seen under PTRACE_SEIZE semantics; decoded for
    /// completeness).
    GroupStop(StoppedTask),

    /// The tracee is fully gone. Delivered exactly once per tracee, last.
    Terminated(Pid, ExitStatus),
}

impl TraceEvent {
    /// The pid this event concerns.
    pub fn pid(&self) -> Pid {
        match self {
            TraceEvent::SyscallStop(task)
            | TraceEvent::SignalStop(task, _)
            | TraceEvent::ChildEvent(task, _, _)
            | TraceEvent::ExecStop(task, _)
            | TraceEvent::VforkDoneStop(task)
            | TraceEvent::ExitStop(task)
            | TraceEvent::GroupStop(task) => task.pid(),
            TraceEvent::Terminated(pid, _) => *pid,
        }
    }

    /// Decodes a raw wait status. Ptrace events need a follow-up
    /// PTRACE_GETEVENTMSG for their payload, which is safe here because the
    /// tracee is in a ptrace stop by definition.
    fn classify(status: WaitStatus) -> Result<TraceEvent, TraceError> {
        Ok(match status {
            WaitStatus::Exited(pid, code) => {
                TraceEvent::Terminated(pid, ExitStatus::Exited(code))
            }
            WaitStatus::Signaled(pid, sig, core) => {
                TraceEvent::Terminated(pid, ExitStatus::Killed(sig, core))
            }
            WaitStatus::PtraceSyscall(pid) => TraceEvent::SyscallStop(StoppedTask(pid)),
            WaitStatus::Stopped(pid, sig) => TraceEvent::SignalStop(StoppedTask(pid), sig),
            WaitStatus::PtraceEvent(pid, _sig, event) => {
                let task = StoppedTask(pid);
                let fork_kind = match event {
                    libc::PTRACE_EVENT_FORK => Some(ForkKind::Fork),
                    libc::PTRACE_EVENT_VFORK => Some(ForkKind::Vfork),
                    libc::PTRACE_EVENT_CLONE => Some(ForkKind::Clone),
                    _ => None,
                };
                if let Some(kind) = fork_kind {
                    let child = Pid::from_raw(task.getevent()? as i32);
                    return Ok(TraceEvent::ChildEvent(task, kind, child));
                }
                match event {
                    libc::PTRACE_EVENT_EXEC => {
                        let former = Pid::from_raw(task.getevent()? as i32);
                        TraceEvent::ExecStop(task, former)
                    }
                    libc::PTRACE_EVENT_VFORK_DONE => TraceEvent::VforkDoneStop(task),
                    libc::PTRACE_EVENT_EXIT => TraceEvent::ExitStop(task),
                    libc::PTRACE_EVENT_STOP => TraceEvent::GroupStop(task),
                    _ => return Err(TraceError::Os(Errno::EINVAL)),
                }
            }
            // WCONTINUED is never requested and WNOHANG is never passed, so
            // neither of these can reach us.
            WaitStatus::Continued(_) | WaitStatus::StillAlive => {
                return Err(TraceError::Os(Errno::EINVAL));
            }
        })
    }
}

/// Blocks until any tracee delivers an event. Returns `None` once every
/// tracee has terminated and been collected, which is the loop's natural end.
pub fn wait_next() -> Result<Option<TraceEvent>, TraceError> {
    loop {
        // __WALL so that clone children (threads) are reported too.
        match waitpid(None, Some(WaitPidFlag::__WALL)) {
            Ok(status) => return TraceEvent::classify(status).map(Some),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::ECHILD) => return Ok(None),
            Err(err) => return Err(err.into()),
        }
    }
}

/// Marks the calling process as traced by its parent. For use between fork
/// and exec.
pub fn request_trace() -> Result<(), Errno> {
    ptrace::traceme().map_err(|err| Errno::new(err as i32))
}

/// Waits on one specific tracee until the given signal stops it, passing any
/// other signal through. Used right after spawn, where stray SIGWINCHes and
/// friends can arrive before the stop that matters.
pub fn synchronize(pid: Pid, wanted: Signal) -> Result<StoppedTask, TraceError> {
    loop {
        let status = match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(status) => status,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => return Err(err.into()),
        };

        match TraceEvent::classify(status)? {
            TraceEvent::SignalStop(task, sig) if sig == wanted => return Ok(task),
            TraceEvent::SignalStop(task, sig) => task.resume(Resume::Cont, Some(sig))?,
            TraceEvent::Terminated(pid, _) => return Err(TraceError::Gone(pid)),
            event => {
                // No options are installed yet, so nothing else should stop
                // here; whatever it was, push past it.
                StoppedTask::assume_stopped(event.pid()).resume(Resume::Cont, None)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use nix::sys::signal;
    use nix::unistd::fork;
    use nix::unistd::ForkResult;
    use syscalls::Sysno;

    use super::*;

    // wait_next() collects any child of the test process, so tests that fork
    // must not overlap.
    static TRACE_LOCK: Mutex<()> = Mutex::new(());

    // Forks a child that makes itself traceable, parks in SIGSTOP until the
    // test releases it, then runs `f` and exits with its return value.
    fn fork_traced<F: FnOnce() -> i32>(f: F) -> Pid {
        match unsafe { fork() }.unwrap() {
            ForkResult::Parent { child } => child,
            ForkResult::Child => {
                request_trace().unwrap();
                signal::raise(Signal::SIGSTOP).unwrap();
                let code = f();
                // _exit, not exit: no atexit handlers exist without execve.
                unsafe { libc::_exit(code) }
            }
        }
    }

    fn release(pid: Pid) {
        StoppedTask::assume_stopped(pid)
            .resume(Resume::Cont, None)
            .unwrap();
    }

    #[test]
    fn exit_code_travels_through_wait_next() {
        let _guard = TRACE_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let pid = fork_traced(|| 7);
        synchronize(pid, Signal::SIGSTOP).unwrap();
        release(pid);

        match wait_next().unwrap().unwrap() {
            TraceEvent::Terminated(seen, status) => {
                assert_eq!(seen, pid);
                assert_eq!(status, ExitStatus::Exited(7));
            }
            event => panic!("expected termination, got {:?}", event),
        }
    }

    #[test]
    fn signal_death_reports_the_signal() {
        let _guard = TRACE_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let pid = fork_traced(|| {
            let _ = signal::raise(Signal::SIGKILL);
            unreachable!()
        });
        synchronize(pid, Signal::SIGSTOP).unwrap();
        release(pid);

        match wait_next().unwrap().unwrap() {
            TraceEvent::Terminated(seen, status) => {
                assert_eq!(seen, pid);
                assert_eq!(status, ExitStatus::Killed(Signal::SIGKILL, false));
            }
            event => panic!("expected termination, got {:?}", event),
        }
    }

    #[test]
    fn synchronize_passes_unrelated_signals_through() {
        let _guard = TRACE_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let pid = fork_traced(|| 0);

        // The child stops for SIGWINCH delivery before reaching its SIGSTOP;
        // synchronize must hand the WINCH on and still find the SIGSTOP.
        // (Default disposition of SIGWINCH is ignore, so delivery is
        // harmless.)
        let _ = signal::kill(pid, Signal::SIGWINCH);

        let task = synchronize(pid, Signal::SIGSTOP).unwrap();
        assert_eq!(task.pid(), pid);
        task.resume(Resume::Cont, None).unwrap();

        match wait_next().unwrap().unwrap() {
            TraceEvent::Terminated(_, status) => assert_eq!(status, ExitStatus::Exited(0)),
            event => panic!("expected termination, got {:?}", event),
        }
    }

    #[test]
    fn syscall_stops_come_in_pairs() {
        let _guard = TRACE_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let pid = fork_traced(|| {
            unsafe { libc::syscall(libc::SYS_getpid) };
            0
        });

        let task = synchronize(pid, Signal::SIGSTOP).unwrap();
        task.setoptions(Options::PTRACE_O_TRACESYSGOOD | Options::PTRACE_O_EXITKILL)
            .unwrap();
        task.resume(Resume::Syscall, None).unwrap();

        // Entry and exit alternate strictly, so getpid is seen at exactly two
        // stops. (exit_group never reaches its exit stop, which is why a
        // specific syscall is counted rather than all stops.)
        let mut getpid_stops = 0;
        loop {
            match wait_next().unwrap().unwrap() {
                TraceEvent::SyscallStop(task) => {
                    if task.getregs().unwrap().sysno() == Sysno::getpid as Reg {
                        getpid_stops += 1;
                    }
                    task.resume(Resume::Syscall, None).unwrap();
                }
                TraceEvent::SignalStop(task, sig) => {
                    task.resume(Resume::Syscall, Some(sig)).unwrap();
                }
                TraceEvent::Terminated(seen, status) => {
                    assert_eq!(seen, pid);
                    assert_eq!(status, ExitStatus::Exited(0));
                    break;
                }
                event => panic!("unexpected event {:?}", event),
            }
        }

        assert_eq!(getpid_stops, 2);
    }

    #[test]
    fn detached_tracee_runs_to_completion_untraced() {
        let _guard = TRACE_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let pid = fork_traced(|| 3);

        let task = synchronize(pid, Signal::SIGSTOP).unwrap();
        task.setoptions(Options::PTRACE_O_TRACESYSGOOD).unwrap();
        task.resume(Resume::Detach, None).unwrap();

        // Detached means no more syscall stops: the very next event is the
        // exit itself.
        match wait_next().unwrap().unwrap() {
            TraceEvent::Terminated(seen, status) => {
                assert_eq!(seen, pid);
                assert_eq!(status, ExitStatus::Exited(3));
            }
            event => panic!("expected termination, got {:?}", event),
        }
    }

    #[test]
    fn gone_is_distinguished_from_other_errors() {
        // No live process has this pid for long; operations on it must map
        // ESRCH to Gone rather than surfacing a raw errno.
        let bogus = StoppedTask::assume_stopped(Pid::from_raw(i32::MAX - 1));
        let err = bogus.getregs().map(|_| ()).unwrap_err();
        assert_eq!(err, TraceError::Gone(bogus.pid()));
    }
}
