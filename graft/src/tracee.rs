/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Per-tracee state: identity, syscall phase, cached registers in three
//! versions, filesystem namespace, and both sides of emulated-ptrace
//! relationships.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::OsString;
use std::mem::MaybeUninit;
use std::path::PathBuf;
use std::rc::Rc;

use graft_trace::Pid;
use graft_trace::Reg;
use graft_trace::RegAccess;
use graft_trace::Regs;
use graft_trace::Resume;
use graft_trace::Signal;
use graft_trace::StoppedTask;
use graft_trace::TraceError;
use syscalls::Errno;

use crate::fs::BindingTable;

/// Symbolic register slots. Handlers address syscall state exclusively
/// through these; the per-ABI mapping lives in `graft_trace::RegAccess`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Slot {
    SysArgNum,
    SysArg1,
    SysArg2,
    SysArg3,
    SysArg4,
    SysArg5,
    SysArg6,
    SysResult,
    StackPointer,
    InstrPointer,
}

fn get_slot(regs: &Regs, slot: Slot) -> Reg {
    match slot {
        Slot::SysArgNum => regs.sysno(),
        Slot::SysArg1 => regs.arg(0),
        Slot::SysArg2 => regs.arg(1),
        Slot::SysArg3 => regs.arg(2),
        Slot::SysArg4 => regs.arg(3),
        Slot::SysArg5 => regs.arg(4),
        Slot::SysArg6 => regs.arg(5),
        Slot::SysResult => regs.ret(),
        Slot::StackPointer => regs.sp(),
        Slot::InstrPointer => regs.ip(),
    }
}

fn set_slot(regs: &mut Regs, slot: Slot, value: Reg) {
    match slot {
        Slot::SysArgNum => *regs.sysno_mut() = value,
        Slot::SysArg1 => *regs.arg_mut(0) = value,
        Slot::SysArg2 => *regs.arg_mut(1) = value,
        Slot::SysArg3 => *regs.arg_mut(2) = value,
        Slot::SysArg4 => *regs.arg_mut(3) = value,
        Slot::SysArg5 => *regs.arg_mut(4) = value,
        Slot::SysArg6 => *regs.arg_mut(5) = value,
        Slot::SysResult => *regs.ret_mut() = value,
        Slot::StackPointer => *regs.sp_mut() = value,
        Slot::InstrPointer => *regs.ip_mut() = value,
    }
}

/// Which cached copy of the registers to consult.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RegVersion {
    /// The live registers as last fetched from the kernel.
    Current,
    /// The registers as the kernel delivered them at syscall entry, i.e. the
    /// guest's unmodified view.
    Original,
    /// The registers we will push back before restarting.
    Modified,
}

/// Where a tracee is within the current syscall.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SyscallStatus {
    /// Not inside a syscall; the next syscall stop is an entry.
    Enter,
    /// Entry was translated; the next syscall stop is the exit.
    Exit,
    /// Entry failed translation; the syscall was canceled and this errno must
    /// be injected at the exit stop.
    ExitError(Errno),
}

/// How a tracee is to be restarted after the current stop.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RestartHow {
    /// Stop again at the next syscall entry or exit.
    Syscall,
    /// Run freely until the next signal or event.
    Cont,
    /// Detach and let it run untraced.
    Detach,
    /// Leave it stopped; someone else (the nested-ptrace emulator) will
    /// restart it later.
    DontRestart,
}

/// What kind of stop a tracee is parked in while its guest tracer inspects
/// it. Needed because the syscall phase field alone cannot distinguish a
/// tracee held at an entry stop from one held at an exit stop.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ParkedStop {
    SyscallEnter,
    SyscallExit,
    Other,
}

/// Bookkeeping for the SIGSTOP each freshly-created child delivers once.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SigStopStatus {
    /// Deliver SIGSTOPs normally.
    Ignored,
    /// The next SIGSTOP is the attach-stop of a known child; swallow it.
    Allowed,
    /// The child stopped before its creator's fork event arrived; hold it
    /// until the parent is known.
    Pending,
}

/// Wait state of an emulated ptracer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WaitMode {
    NotWaiting,
    /// Its wait4 was let through to the kernel.
    WaitingInKernel,
    /// Its wait4 was canceled and it sits stopped until a ptracee event
    /// arrives.
    WaitingInProot,
}

/// One half of the double-view event multiplexing: a kernel stop is consumed
/// once by the engine and once by the guest tracer.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventSlot {
    pub value: i32,
    pub pending: bool,
}

/// State a tracee carries when it traces others.
#[derive(Debug, Clone, Default)]
pub struct PtracerState {
    /// Number of live ptracees attached to this tracer.
    pub nb_ptracees: usize,
    /// Ptracees that died but whose status the tracer has not collected.
    pub zombies: Vec<Pid>,
    /// Pid argument of the wait in progress (-1 for any).
    pub wait_pid: i32,
    /// Options argument of the wait in progress.
    pub wait_options: u64,
    pub wait_mode: WaitMode,
}

impl PtracerState {
    pub fn new() -> Self {
        Self {
            wait_mode: WaitMode::NotWaiting,
            ..Default::default()
        }
    }
}

impl Default for WaitMode {
    fn default() -> Self {
        WaitMode::NotWaiting
    }
}

/// State a tracee carries when a guest tracer is attached to it.
#[derive(Debug, Clone, Default)]
pub struct PtraceeState {
    /// The emulated tracer, if any.
    pub ptracer: Option<Pid>,
    /// The engine's view of the pending stop.
    pub event_proot: EventSlot,
    /// The guest tracer's view of the pending stop.
    pub event_ptracer: EventSlot,
    /// False until the tracer has observed the first stop.
    pub tracing_started: bool,
    /// Suppress forwarding of syscall stops.
    pub ignore_syscalls: bool,
    /// Suppress forwarding of syscall stops made by the in-guest loader.
    pub ignore_loader_syscalls: bool,
    /// Option bitmask set by the guest tracer via PTRACE_SETOPTIONS.
    pub options: u64,
    /// Payload for PTRACE_GETEVENTMSG (new child pid, exit status).
    pub event_msg: u64,
    /// The ptracee died; only its status remains to be collected.
    pub is_zombie: bool,
}

/// The filesystem namespace of a tracee: the shared binding table plus its
/// guest working directory.
#[derive(Debug, Clone)]
pub struct FsNamespace {
    pub bindings: Rc<BindingTable>,
    /// Guest-view working directory.
    pub cwd: PathBuf,
    /// Prospective working directory recorded at chdir entry, committed at
    /// exit-success.
    pub new_cwd: Option<PathBuf>,
}

const NB_REG_VERSION: usize = 3;

/// One traced process.
pub struct Tracee {
    /// Host kernel pid.
    pub pid: Pid,
    /// Engine-assigned virtual pid, stable for the tracee's lifetime.
    pub vpid: u64,
    /// Currently running (not sitting in a ptrace stop).
    pub running: bool,
    /// Ready to be reaped from the table.
    pub terminated: bool,
    /// Created with flags that make its parent equal its creator's parent.
    pub clone: bool,
    /// Real parent, if traced. Non-owning back-edge resolved through the
    /// table.
    pub parent: Option<Pid>,
    /// Owning child set.
    pub children: Vec<Pid>,

    pub status: SyscallStatus,
    pub restart_how: RestartHow,
    pub sigstop: SigStopStatus,
    /// Signal to deliver at the next restart.
    pub pending_signal: Option<Signal>,
    /// Result to poke into the result register at the exit stop of an
    /// emulated (canceled) syscall.
    pub forced_result: Option<i64>,
    /// Set while the tracee sits stopped waiting for someone (usually its
    /// guest tracer) to restart it.
    pub parked_at: Option<ParkedStop>,

    pub fs: FsNamespace,
    /// Guest path of the executable, à la /proc/self/exe.
    pub exe: PathBuf,
    /// Set at execve entry, committed at the exec stop.
    pub new_exe: Option<PathBuf>,
    /// Emulator command used to run foreign-architecture executables.
    pub qemu: Option<Rc<Vec<OsString>>>,

    pub as_ptracer: PtracerState,
    pub as_ptracee: PtraceeState,

    regs: [Regs; NB_REG_VERSION],
    regs_changed: bool,
}

fn zeroed_regs() -> Regs {
    unsafe { MaybeUninit::zeroed().assume_init() }
}

impl Tracee {
    pub fn new(pid: Pid, vpid: u64, fs: FsNamespace) -> Self {
        Tracee {
            pid,
            vpid,
            running: false,
            terminated: false,
            clone: false,
            parent: None,
            children: Vec::new(),
            status: SyscallStatus::Enter,
            restart_how: RestartHow::Syscall,
            sigstop: SigStopStatus::Ignored,
            pending_signal: None,
            forced_result: None,
            parked_at: None,
            fs,
            exe: PathBuf::new(),
            new_exe: None,
            qemu: None,
            as_ptracer: PtracerState::new(),
            as_ptracee: PtraceeState::default(),
            regs: [zeroed_regs(), zeroed_regs(), zeroed_regs()],
            regs_changed: false,
        }
    }

    /// Directly seeds the `Current` register version. Tests stand in for the
    /// kernel with this.
    #[cfg(test)]
    pub(crate) fn seed_current_regs(&mut self, f: impl FnOnce(&mut Regs)) {
        f(&mut self.regs[RegVersion::Current as usize]);
    }

    /// Fetches the live registers into the `Current` version.
    pub fn fetch_regs(&mut self, task: &StoppedTask) -> Result<(), TraceError> {
        self.regs[RegVersion::Current as usize] = task.getregs()?;
        self.regs_changed = false;
        Ok(())
    }

    /// Snapshots `Current` into both `Original` and `Modified`. Done once per
    /// syscall entry, before any handler runs.
    pub fn save_original_regs(&mut self) {
        self.regs[RegVersion::Original as usize] = self.regs[RegVersion::Current as usize];
        self.regs[RegVersion::Modified as usize] = self.regs[RegVersion::Current as usize];
    }

    /// Reads a register slot from the requested version.
    pub fn peek_reg(&self, version: RegVersion, slot: Slot) -> Reg {
        get_slot(&self.regs[version as usize], slot)
    }

    /// Writes a register slot into the `Modified` version.
    pub fn poke_reg(&mut self, slot: Slot, value: Reg) {
        if self.peek_reg(RegVersion::Modified, slot) != value {
            set_slot(&mut self.regs[RegVersion::Modified as usize], slot, value);
            self.regs_changed = true;
        }
    }

    /// Restores `Modified` from `Original`, keeping the result register from
    /// `Current`. Called on the exit phase so the guest observes exactly the
    /// registers it supplied.
    pub fn restore_original_regs(&mut self) {
        let result = self.peek_reg(RegVersion::Current, Slot::SysResult);
        self.regs[RegVersion::Modified as usize] = self.regs[RegVersion::Original as usize];
        set_slot(
            &mut self.regs[RegVersion::Modified as usize],
            Slot::SysResult,
            result,
        );
        self.regs_changed = true;
    }

    /// Pushes the `Modified` registers to the kernel. A no-op when nothing
    /// was modified.
    pub fn push_regs(&mut self, task: &StoppedTask) -> Result<(), TraceError> {
        if !self.regs_changed {
            return Ok(());
        }

        #[cfg(target_arch = "aarch64")]
        {
            // The syscall number register is ignored by PTRACE_SETREGSET at a
            // syscall stop on aarch64; it has its own regset.
            let sysno = self.peek_reg(RegVersion::Modified, Slot::SysArgNum);
            if sysno != self.peek_reg(RegVersion::Current, Slot::SysArgNum) {
                task.set_syscall(sysno as i32)?;
            }
        }

        task.setregs(&self.regs[RegVersion::Modified as usize])?;
        self.regs[RegVersion::Current as usize] = self.regs[RegVersion::Modified as usize];
        self.regs_changed = false;
        Ok(())
    }

    /// Cancels the syscall being entered so the kernel executes nothing. The
    /// recorded errno (or a result poked later) is delivered at the exit
    /// stop.
    pub fn cancel_syscall(&mut self, errno: Option<Errno>) {
        self.poke_reg(Slot::SysArgNum, -1i64 as Reg);
        if let Some(errno) = errno {
            self.status = SyscallStatus::ExitError(errno);
        }
    }

    /// Restarts the tracee according to its disposition, delivering any
    /// pending signal. Consumes the stopped state; with
    /// `RestartHow::DontRestart` the tracee simply stays stopped.
    pub fn restart(&mut self, task: StoppedTask) -> Result<(), TraceError> {
        let sig = self.pending_signal.take();
        let how = match self.restart_how {
            RestartHow::Syscall => Resume::Syscall,
            RestartHow::Cont => Resume::Cont,
            RestartHow::Detach => Resume::Detach,
            RestartHow::DontRestart => {
                self.restart_how = RestartHow::Syscall;
                return Ok(());
            }
        };
        task.resume(how, sig)?;
        self.restart_how = RestartHow::Syscall;
        self.running = true;
        self.parked_at = None;
        Ok(())
    }
}

/// The process-wide pid → tracee mapping, owned by the event loop and handed
/// to helpers explicitly. Records sit in `RefCell`s so that two tracees (a
/// guest tracer and its ptracee) can be borrowed at once.
pub struct TraceeTable {
    map: HashMap<Pid, RefCell<Tracee>>,
    next_vpid: u64,
}

impl TraceeTable {
    pub fn new() -> Self {
        TraceeTable {
            map: HashMap::new(),
            next_vpid: 1,
        }
    }

    /// Creates a tracee for a pid not yet in the table, assigning the next
    /// vpid.
    pub fn create(&mut self, pid: Pid, fs: FsNamespace) -> &RefCell<Tracee> {
        let vpid = self.next_vpid;
        self.next_vpid += 1;
        let previous = self.map.insert(pid, RefCell::new(Tracee::new(pid, vpid, fs)));
        assert!(
            previous.is_none(),
            "two tracees for live pid {}; table invariant broken",
            pid
        );
        tracing::debug!("new tracee pid {} vpid {}", pid, vpid);
        self.map.get(&pid).unwrap()
    }

    pub fn get(&self, pid: Pid) -> Option<&RefCell<Tracee>> {
        self.map.get(&pid)
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Tracee> {
        self.map.remove(&pid).map(RefCell::into_inner)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.map.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.map.keys().copied().collect()
    }

    /// Reaps every terminated tracee whose events have all been delivered.
    pub fn free_terminated(&mut self) {
        let done: Vec<Pid> = self
            .map
            .iter()
            .filter(|(_, t)| {
                let t = t.borrow();
                t.terminated && !t.as_ptracee.event_ptracer.pending
            })
            .map(|(pid, _)| *pid)
            .collect();
        for pid in done {
            if let Some(tracee) = self.remove(pid) {
                tracing::debug!("reaped tracee pid {} vpid {}", pid, tracee.vpid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_fs() -> FsNamespace {
        FsNamespace {
            bindings: Rc::new(BindingTable::new("/sandbox")),
            cwd: PathBuf::from("/"),
            new_cwd: None,
        }
    }

    #[test]
    fn vpids_are_monotonic() {
        let mut table = TraceeTable::new();
        table.create(Pid::from_raw(100), test_fs());
        table.create(Pid::from_raw(50), test_fs());
        table.create(Pid::from_raw(75), test_fs());

        assert_eq!(table.get(Pid::from_raw(100)).unwrap().borrow().vpid, 1);
        assert_eq!(table.get(Pid::from_raw(50)).unwrap().borrow().vpid, 2);
        assert_eq!(table.get(Pid::from_raw(75)).unwrap().borrow().vpid, 3);
    }

    #[test]
    #[should_panic(expected = "table invariant broken")]
    fn duplicate_pid_panics() {
        let mut table = TraceeTable::new();
        table.create(Pid::from_raw(1), test_fs());
        table.create(Pid::from_raw(1), test_fs());
    }

    #[test]
    fn poke_then_restore_returns_original_view() {
        let mut tracee = Tracee::new(Pid::from_raw(1), 1, test_fs());
        tracee.save_original_regs();

        tracee.poke_reg(Slot::SysArg1, 0xdead);
        tracee.poke_reg(Slot::SysArgNum, 42);
        assert_eq!(tracee.peek_reg(RegVersion::Modified, Slot::SysArg1), 0xdead);
        assert_eq!(tracee.peek_reg(RegVersion::Original, Slot::SysArg1), 0);

        // Exit phase: everything except the result register reverts.
        tracee.restore_original_regs();
        assert_eq!(tracee.peek_reg(RegVersion::Modified, Slot::SysArg1), 0);
        assert_eq!(tracee.peek_reg(RegVersion::Modified, Slot::SysArgNum), 0);
    }

    #[test]
    fn cancel_records_errno_for_exit() {
        let mut tracee = Tracee::new(Pid::from_raw(1), 1, test_fs());
        tracee.save_original_regs();
        tracee.cancel_syscall(Some(Errno::EROFS));

        assert_eq!(tracee.status, SyscallStatus::ExitError(Errno::EROFS));
        assert_eq!(
            tracee.peek_reg(RegVersion::Modified, Slot::SysArgNum),
            -1i64 as Reg
        );
    }

    #[test]
    fn free_terminated_keeps_undelivered_events() {
        let mut table = TraceeTable::new();
        table.create(Pid::from_raw(7), test_fs());
        {
            let cell = table.get(Pid::from_raw(7)).unwrap();
            let mut tracee = cell.borrow_mut();
            tracee.terminated = true;
            tracee.as_ptracee.event_ptracer.pending = true;
        }

        table.free_terminated();
        assert!(table.contains(Pid::from_raw(7)));

        table
            .get(Pid::from_raw(7))
            .unwrap()
            .borrow_mut()
            .as_ptracee
            .event_ptracer
            .pending = false;
        table.free_terminated();
        assert!(!table.contains(Pid::from_raw(7)));
    }
}
