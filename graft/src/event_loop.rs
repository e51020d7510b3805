/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The scheduler: one thread owning every ptrace operation, waiting on all
//! tracees, classifying each stop, and routing it to the syscall translator
//! or the nested-ptrace emulator.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::rc::Rc;

use graft_trace::wait_next;
use graft_trace::ExitStatus;
use graft_trace::ForkKind;
use graft_trace::Pid;
use graft_trace::Signal;
use graft_trace::StoppedTask;
use graft_trace::TraceError;
use graft_trace::TraceEvent;
use syscalls::Errno;
use tracing::debug;

use crate::config::Config;
use crate::error::Error;
use crate::fs::BindingTable;
use crate::handlers;
use crate::ptrace_emu;
use crate::ptrace_emu::EventDisposition;
use crate::tracee::FsNamespace;
use crate::tracee::ParkedStop;
use crate::tracee::RegVersion;
use crate::tracee::RestartHow;
use crate::tracee::SigStopStatus;
use crate::tracee::Slot;
use crate::tracee::SyscallStatus;
use crate::tracee::TraceeTable;

const CLONE_PARENT_FLAGS: u64 = (libc::CLONE_PARENT | libc::CLONE_THREAD) as u64;

/// Everything the scheduler thread owns: the tracee table, the binding table,
/// and the engine-wide configuration. Helpers receive this context
/// explicitly; there is no global state.
pub(crate) struct Engine {
    pub tracees: TraceeTable,
    pub bindings: Rc<BindingTable>,
    pub qemu: Option<Rc<Vec<OsString>>>,
    pub kernel_release: Option<String>,
    pub uid: Option<libc::uid_t>,
    pub gid: Option<libc::gid_t>,
    pub real_uid: libc::uid_t,
    pub real_gid: libc::gid_t,
    pub port_map: HashMap<u16, u16>,
    pub root_pid: Pid,
    root_exit: Option<ExitStatus>,
}

impl Engine {
    /// Builds the engine around an already-spawned, already-stopped root
    /// tracee.
    pub fn new(config: &Config, bindings: BindingTable, root_pid: Pid, root_exe: PathBuf) -> Self {
        let bindings = Rc::new(bindings);
        let qemu = if config.qemu.is_empty() {
            None
        } else {
            Some(Rc::new(config.qemu.clone()))
        };

        let mut tracees = TraceeTable::new();
        {
            let fs = FsNamespace {
                bindings: bindings.clone(),
                cwd: crate::fs::normalize(&config.cwd),
                new_cwd: None,
            };
            let cell = tracees.create(root_pid, fs);
            let mut root = cell.borrow_mut();
            root.exe = root_exe;
            root.qemu = qemu.clone();
        }

        Engine {
            tracees,
            bindings,
            qemu,
            kernel_release: config.kernel_release.clone(),
            uid: config.uid,
            gid: config.gid,
            real_uid: nix::unistd::getuid().as_raw(),
            real_gid: nix::unistd::getgid().as_raw(),
            port_map: config.port_map.clone(),
            root_pid,
            root_exit: None,
        }
    }

    /// Runs all tracees to completion and returns the root's exit status.
    pub fn run(&mut self) -> Result<ExitStatus, Error> {
        loop {
            let event = match wait_next() {
                Ok(Some(event)) => event,
                // ECHILD: the root and all of its descendants are gone.
                Ok(None) => break,
                Err(TraceError::Gone(_)) => continue,
                Err(TraceError::Os(errno)) => {
                    return Err(Error::kernel(self.root_pid, errno));
                }
            };

            match event {
                TraceEvent::Terminated(pid, status) => self.handle_terminated(pid, status),
                event => self.handle_stop(event)?,
            }

            self.tracees.free_terminated();
        }

        self.root_exit
            .ok_or_else(|| Error::kernel(self.root_pid, Errno::ECHILD))
    }

    /// A tracee fully exited or was killed by a signal.
    fn handle_terminated(&mut self, pid: Pid, status: ExitStatus) {
        debug!("pid {} terminated: {:?}", pid, status);

        let event = status.as_wait_status();

        if self.tracees.contains(pid) {
            {
                let cell = self.tracees.get(pid).unwrap();
                let mut tracee = cell.borrow_mut();
                tracee.running = false;
                tracee.terminated = true;
            }

            // Reparent: the dead tracee's own guest-ptracees lose their
            // tracer.
            self.clear_ptracees_of(pid);

            // The terminal event is delivered to an emulated ptracer before
            // the record may be reaped.
            ptrace_emu::handle_ptracee_event(self, pid, event, event as u64);
        }

        if pid == self.root_pid {
            self.root_exit = Some(status);
            self.kill_all();
        }
    }

    /// Clears the ptracer reference of every ptracee the dead tracer had.
    fn clear_ptracees_of(&self, dead: Pid) {
        for pid in self.tracees.pids() {
            let Some(cell) = self.tracees.get(pid) else {
                continue;
            };
            let Ok(mut tracee) = cell.try_borrow_mut() else {
                continue;
            };
            if tracee.as_ptracee.ptracer == Some(dead) {
                tracee.as_ptracee.ptracer = None;
                tracee.as_ptracee.tracing_started = false;
                tracee.as_ptracee.event_ptracer.pending = false;
                // A ptracee held stopped for the dead tracer must not hang.
                if !tracee.running && !tracee.terminated {
                    tracee.restart_how = RestartHow::Syscall;
                    let _ = tracee.restart(StoppedTask::assume_stopped(pid));
                }
            }
        }
    }

    /// SIGKILLs every remaining tracee; the loop then drains their waits.
    fn kill_all(&self) {
        for pid in self.tracees.pids() {
            let terminated = self
                .tracees
                .get(pid)
                .map(|c| c.borrow().terminated)
                .unwrap_or(true);
            if !terminated {
                debug!("killing leftover tracee {}", pid);
                let _ = nix::sys::signal::kill(pid.into(), Signal::SIGKILL);
            }
        }
    }

    /// Classifies one ptrace stop and routes it.
    fn handle_stop(&mut self, event: TraceEvent) -> Result<(), Error> {
        let pid = event.pid();

        // A child can stop before its creator's fork event arrives; park it
        // until the event tells us who it belongs to.
        if !self.tracees.contains(pid) {
            let fs = self.root_fs();
            let cell = self.tracees.create(pid, fs);
            cell.borrow_mut().sigstop = SigStopStatus::Pending;
        }

        {
            let cell = self.tracees.get(pid).unwrap();
            cell.borrow_mut().running = false;
        }

        let result = match event {
            TraceEvent::SyscallStop(task) => self.handle_syscall_stop(pid, &task),
            TraceEvent::ChildEvent(_task, kind, child) => {
                self.handle_new_child(pid, child, kind);
                Ok(())
            }
            TraceEvent::ExecStop(_task, _former) => {
                let cell = self.tracees.get(pid).unwrap();
                handlers::commit_exec(&mut cell.borrow_mut());
                self.forward_event(pid, ptrace_emu::w_event(libc::PTRACE_EVENT_EXEC), 0);
                Ok(())
            }
            TraceEvent::VforkDoneStop(_task) => {
                self.forward_event(pid, ptrace_emu::w_event(libc::PTRACE_EVENT_VFORK_DONE), 0);
                Ok(())
            }
            TraceEvent::ExitStop(task) => {
                let msg = task.getevent().unwrap_or(0) as u64;
                self.forward_event(pid, ptrace_emu::w_event(libc::PTRACE_EVENT_EXIT), msg);
                Ok(())
            }
            TraceEvent::GroupStop(_task) => Ok(()),
            TraceEvent::SignalStop(task, sig) => {
                self.handle_signal_stop(pid, sig, &task);
                Ok(())
            }
            TraceEvent::Terminated(..) => unreachable!("terminations are routed in run()"),
        };

        match result {
            Ok(()) => {}
            Err(TraceError::Gone(gone)) => {
                debug!("pid {} died mid-translation", gone);
                if let Some(cell) = self.tracees.get(pid) {
                    let mut tracee = cell.borrow_mut();
                    tracee.running = false;
                    tracee.restart_how = RestartHow::DontRestart;
                }
                // The terminal status arrives through wait_next shortly.
                return Ok(());
            }
            Err(TraceError::Os(errno)) => {
                // Register restore failed with the tracee still alive; it
                // cannot safely resume.
                return Err(Error::kernel(pid, errno));
            }
        }

        let cell = self.tracees.get(pid).unwrap();
        let mut tracee = cell.borrow_mut();
        match tracee.restart(StoppedTask::assume_stopped(pid)) {
            Ok(()) => Ok(()),
            Err(TraceError::Gone(_)) => Ok(()),
            Err(TraceError::Os(errno)) => Err(Error::kernel(pid, errno)),
        }
    }

    fn root_fs(&self) -> FsNamespace {
        self.tracees
            .get(self.root_pid)
            .map(|c| c.borrow().fs.clone())
            .unwrap_or(FsNamespace {
                bindings: self.bindings.clone(),
                cwd: PathBuf::from("/"),
                new_cwd: None,
            })
    }

    /// A syscall stop: entry and exit strictly alternate per tracee.
    fn handle_syscall_stop(&self, pid: Pid, task: &StoppedTask) -> Result<(), TraceError> {
        let (entering, forwarded_ptracee) = {
            let cell = self.tracees.get(pid).unwrap();
            let tracee = cell.borrow();
            (
                tracee.status == SyscallStatus::Enter,
                tracee.as_ptracee.ptracer.is_some() && tracee.as_ptracee.tracing_started,
            )
        };

        if entering {
            handlers::syscall_enter(self, pid, task)?;

            if forwarded_ptracee {
                let disposition = ptrace_emu::handle_ptracee_event(
                    self,
                    pid,
                    ptrace_emu::w_syscall_stop(),
                    0,
                );
                if disposition == EventDisposition::KeepStopped {
                    let cell = self.tracees.get(pid).unwrap();
                    let mut tracee = cell.borrow_mut();
                    tracee.restart_how = RestartHow::DontRestart;
                    tracee.parked_at = Some(ParkedStop::SyscallEnter);
                }
            }
        } else if forwarded_ptracee {
            // Exit stops go to the guest tracer first; our own exit
            // translation runs when the tracer restarts the ptracee.
            let disposition =
                ptrace_emu::handle_ptracee_event(self, pid, ptrace_emu::w_syscall_stop(), 0);
            if disposition == EventDisposition::KeepStopped {
                let cell = self.tracees.get(pid).unwrap();
                let mut tracee = cell.borrow_mut();
                tracee.restart_how = RestartHow::DontRestart;
                tracee.parked_at = Some(ParkedStop::SyscallExit);
            } else {
                handlers::syscall_exit(self, pid, task)?;
            }
        } else {
            handlers::syscall_exit(self, pid, task)?;
        }

        Ok(())
    }

    /// A fork/vfork/clone event: create or adopt the child record.
    fn handle_new_child(&mut self, creator: Pid, child: Pid, op: ForkKind) {
        debug!("pid {} created {} via {:?}", creator, child, op);

        let (fs, qemu, exe, clone_flags, creator_parent, guest_tracer) = {
            let cell = self.tracees.get(creator).unwrap();
            let tracee = cell.borrow();
            let flags = if op == ForkKind::Clone {
                tracee.peek_reg(RegVersion::Original, Slot::SysArg1)
            } else {
                0
            };
            (
                tracee.fs.clone(),
                tracee.qemu.clone(),
                tracee.exe.clone(),
                flags,
                tracee.parent,
                tracee.as_ptracee.ptracer,
            )
        };

        let was_pending = if self.tracees.contains(child) {
            let cell = self.tracees.get(child).unwrap();
            let pending = cell.borrow().sigstop == SigStopStatus::Pending;
            pending
        } else {
            self.tracees.create(child, fs.clone());
            false
        };

        let is_clone = clone_flags & CLONE_PARENT_FLAGS != 0;
        let parent = if is_clone { creator_parent } else { Some(creator) };

        {
            let cell = self.tracees.get(child).unwrap();
            let mut tracee = cell.borrow_mut();
            tracee.fs = fs;
            tracee.qemu = qemu;
            tracee.exe = exe;
            tracee.clone = is_clone;
            tracee.parent = parent;
            tracee.sigstop = if was_pending {
                // It already stopped; the held SIGSTOP can be released now.
                SigStopStatus::Pending
            } else {
                SigStopStatus::Allowed
            };
        }

        if let Some(parent) = parent {
            if let Some(cell) = self.tracees.get(parent) {
                let mut parent = cell.borrow_mut();
                if !parent.children.contains(&child) {
                    parent.children.push(child);
                }
            }
        }

        // The guest tracer auto-attaches children created under the matching
        // TRACE* option.
        if let Some(tracer) = guest_tracer {
            let bit = match op {
                ForkKind::Fork => libc::PTRACE_O_TRACEFORK,
                ForkKind::Vfork => libc::PTRACE_O_TRACEVFORK,
                ForkKind::Clone => libc::PTRACE_O_TRACECLONE,
            } as u64;

            let attach = self
                .tracees
                .get(tracer)
                .map(|c| c.borrow().as_ptracer.nb_ptracees > 0)
                .unwrap_or(false)
                && self
                    .tracees
                    .get(creator)
                    .map(|c| c.borrow().as_ptracee.options & bit != 0)
                    .unwrap_or(false);

            if attach {
                {
                    let cell = self.tracees.get(child).unwrap();
                    let mut tracee = cell.borrow_mut();
                    tracee.as_ptracee.ptracer = Some(tracer);
                    tracee.as_ptracee.tracing_started = true;
                    // The child inherits the tracer's option mask.
                    tracee.as_ptracee.options = self
                        .tracees
                        .get(creator)
                        .map(|c| c.borrow().as_ptracee.options)
                        .unwrap_or(0);
                }
                if let Some(cell) = self.tracees.get(tracer) {
                    cell.borrow_mut().as_ptracer.nb_ptracees += 1;
                }
                debug!("child {} auto-attached to guest tracer {}", child, tracer);
            }
        }

        // If the child stopped before this event, it is parked in its initial
        // SIGSTOP; release it.
        if was_pending {
            let cell = self.tracees.get(child).unwrap();
            let mut tracee = cell.borrow_mut();
            tracee.sigstop = SigStopStatus::Ignored;
            tracee.restart_how = RestartHow::Syscall;
            let _ = tracee.restart(StoppedTask::assume_stopped(child));
        }

        // Forward the event itself to the creator's guest tracer.
        let event_word = match op {
            ForkKind::Fork => ptrace_emu::w_event(libc::PTRACE_EVENT_FORK),
            ForkKind::Vfork => ptrace_emu::w_event(libc::PTRACE_EVENT_VFORK),
            ForkKind::Clone => ptrace_emu::w_event(libc::PTRACE_EVENT_CLONE),
        };
        self.forward_event(creator, event_word, child.as_raw() as u64);
    }

    /// Offers a non-syscall stop to the guest tracer; holds the tracee
    /// stopped when the tracer claims it.
    fn forward_event(&self, pid: Pid, event_word: i32, msg: u64) {
        let eligible = {
            let cell = self.tracees.get(pid).unwrap();
            let tracee = cell.borrow();
            tracee.as_ptracee.ptracer.is_some()
        };
        if !eligible {
            return;
        }

        let disposition = ptrace_emu::handle_ptracee_event(self, pid, event_word, msg);
        if disposition == EventDisposition::KeepStopped {
            let cell = self.tracees.get(pid).unwrap();
            let mut tracee = cell.borrow_mut();
            tracee.restart_how = RestartHow::DontRestart;
            tracee.parked_at = Some(ParkedStop::Other);
        }
    }

    /// Signal-delivery stops: the attach-SIGSTOP dance, group-stop parking,
    /// guest-tracer forwarding, and plain pass-through.
    fn handle_signal_stop(&self, pid: Pid, sig: Signal, task: &StoppedTask) {
        let cell = self.tracees.get(pid).unwrap();

        // A stop *notification* carries no siginfo. Re-delivering it would
        // bounce the tracee between delivery stop and group stop forever;
        // instead the tracee is left parked, which is what "stopped" means.
        // A later SIGCONT moves it on and produces a fresh stop.
        if matches!(
            sig,
            Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU
        ) && matches!(
            task.getsiginfo(),
            Err(TraceError::Os(Errno::EINVAL))
        ) {
            let mut tracee = cell.borrow_mut();
            tracee.restart_how = RestartHow::DontRestart;
            tracee.parked_at = Some(ParkedStop::Other);
            return;
        }

        if sig == Signal::SIGSTOP {
            let state = cell.borrow().sigstop;
            match state {
                SigStopStatus::Allowed => {
                    // The attach-stop of a child we knew about: swallow it.
                    let mut tracee = cell.borrow_mut();
                    tracee.sigstop = SigStopStatus::Ignored;

                    // A guest-traced child reports its first stop to the
                    // tracer instead.
                    if tracee.as_ptracee.ptracer.is_some() {
                        drop(tracee);
                        self.forward_event(pid, ptrace_emu::w_stopcode(libc::SIGSTOP), 0);
                    }
                    return;
                }
                SigStopStatus::Pending => {
                    // Stopped before the creator's fork event; stay parked.
                    let mut tracee = cell.borrow_mut();
                    tracee.restart_how = RestartHow::DontRestart;
                    tracee.parked_at = Some(ParkedStop::Other);
                    return;
                }
                SigStopStatus::Ignored => {}
            }
        }

        let forwarded = {
            let tracee = cell.borrow();
            tracee.as_ptracee.ptracer.is_some() && tracee.as_ptracee.tracing_started
        };

        if forwarded {
            self.forward_event(pid, ptrace_emu::w_stopcode(sig as i32), 0);
            let still_pending = {
                let tracee = cell.borrow();
                tracee.as_ptracee.event_ptracer.pending
            };
            if still_pending {
                // The tracer owns signal delivery now; it passes the signal
                // (or not) when it restarts the tracee.
                return;
            }
        }

        cell.borrow_mut().pending_signal = Some(sig);
    }
}
