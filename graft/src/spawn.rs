/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Fork/exec of the root tracee and the scheduler-thread handshake.
//!
//! The kernel requires every ptrace operation to come from the thread that
//! attached, so the fork and the entire event loop run on one dedicated
//! thread; `spawn` hands back the pid and pipe ends through a channel.

use std::fs::File;
use std::io;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::IntoRawFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use graft_trace::ExitStatus;
use graft_trace::Options;
use graft_trace::Pid;
use graft_trace::Resume;
use graft_trace::Signal;
use graft_trace::TraceError;
use tracing::debug;

use crate::binfmt::Binfmt;
use crate::config::Config;
use crate::error::Error;
use crate::event_loop::Engine;
use crate::fs::BindingTable;
use crate::fs::Follow;
use crate::fs::FsView;
use crate::stdio::StdioPipes;

/// A running guest. Dropping it does not stop the guest; use [`Guest::wait`]
/// or signal the pid.
pub struct Guest {
    pid: Pid,
    pipes: StdioPipes,
    scheduler: thread::JoinHandle<Result<ExitStatus, Error>>,
}

impl Guest {
    /// Host pid of the root guest process.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Write end of the guest's stdin, when it was `Stdio::Piped`.
    pub fn stdin(&mut self) -> Option<File> {
        self.pipes.stdin.take()
    }

    /// Read end of the guest's stdout, when it was `Stdio::Piped`.
    pub fn stdout(&mut self) -> Option<File> {
        self.pipes.stdout.take()
    }

    /// Read end of the guest's stderr, when it was `Stdio::Piped`.
    pub fn stderr(&mut self) -> Option<File> {
        self.pipes.stderr.take()
    }

    /// Waits for the whole guest tree to finish and returns the root's exit
    /// status, or the engine's first fatal error.
    pub fn wait(self) -> Result<ExitStatus, Error> {
        // Close our stdin end first so the guest cannot block on input
        // nobody will write.
        drop(self.pipes);
        self.scheduler.join().map_err(|_| Error::TracerGone)?
    }

    /// Kills the whole guest tree.
    pub fn kill(&self) {
        let _ = nix::sys::signal::kill(self.pid.into(), Signal::SIGKILL);
    }
}

/// Starts a guest per the configuration. The binding table is frozen here;
/// mutating it after `spawn` is not possible by construction.
pub fn spawn(config: Config) -> Result<Guest, Error> {
    config.validate()?;
    let bindings = config.binding_table()?;

    let (tx, rx) = mpsc::channel();

    let scheduler = thread::Builder::new()
        .name("graft-tracer".into())
        .spawn(move || scheduler_main(config, bindings, tx))
        .map_err(Error::Spawn)?;

    match rx.recv() {
        Ok(Ok((pid, pipes))) => Ok(Guest {
            pid,
            pipes,
            scheduler,
        }),
        Ok(Err(err)) => {
            let _ = scheduler.join();
            Err(err)
        }
        Err(_) => {
            let _ = scheduler.join();
            Err(Error::TracerGone)
        }
    }
}

type Handshake = mpsc::Sender<Result<(Pid, StdioPipes), Error>>;

fn scheduler_main(
    config: Config,
    bindings: BindingTable,
    tx: Handshake,
) -> Result<ExitStatus, Error> {
    let (pid, pipes, root_exe) = match spawn_guest(&config, &bindings) {
        Ok(spawned) => spawned,
        Err(err) => {
            let _ = tx.send(Err(err));
            return Err(Error::TracerGone);
        }
    };

    let _ = tx.send(Ok((pid, pipes)));

    let mut engine = Engine::new(&config, bindings, pid, root_exe);
    let result = engine.run();
    if result.is_err() {
        // The loop cannot continue; do not leave half-translated tracees
        // running.
        let _ = nix::sys::signal::kill(pid.into(), Signal::SIGKILL);
    }
    result
}

/// Forks the guest command under TRACEME and installs the ptrace options at
/// its first stop.
fn spawn_guest(
    config: &Config,
    bindings: &BindingTable,
) -> Result<(Pid, StdioPipes, PathBuf), Error> {
    let view = FsView {
        bindings,
        cwd: &config.cwd,
    };

    let guest_program = PathBuf::from(&config.command[0]);
    let translated = view
        .translate(&guest_program, Follow::Final)
        .map_err(|errno| Error::Spawn(io::Error::from_raw_os_error(errno.into_raw())))?;

    let host_cwd = view
        .translate(&config.cwd, Follow::Final)
        .map_err(|errno| Error::Spawn(io::Error::from_raw_os_error(errno.into_raw())))?
        .host;

    // The initial exec is wrapped here rather than in the execve handler;
    // the handler takes over for everything the guest execs afterwards.
    let needs_emulator = !config.qemu.is_empty()
        && matches!(
            Binfmt::examine(&translated.host),
            Ok(Some(binfmt)) if binfmt.needs_emulator()
        );

    let mut command = if needs_emulator {
        let mut command = std::process::Command::new(&config.qemu[0]);
        command.args(&config.qemu[1..]);
        command.arg(&translated.host);
        command.args(&config.command[1..]);
        command
    } else {
        let mut command = std::process::Command::new(&translated.host);
        command.arg0(&config.command[0]);
        command.args(&config.command[1..]);
        command
    };

    command.current_dir(host_cwd);
    for (key, value) in &config.envs {
        command.env(key, value);
    }
    command.stdin(config.stdin.to_process_stdio().map_err(Error::Spawn)?);
    command.stdout(config.stdout.to_process_stdio().map_err(Error::Spawn)?);
    command.stderr(config.stderr.to_process_stdio().map_err(Error::Spawn)?);

    // TRACEME only, no SIGSTOP: `Command::spawn` blocks on its internal
    // exec-status pipe, so the child must reach execve. The first stop is
    // then the post-exec SIGTRAP.
    unsafe {
        command.pre_exec(|| {
            graft_trace::request_trace()
                .map_err(|errno| io::Error::from_raw_os_error(errno.into_raw()))?;
            Ok(())
        });
    }

    let mut child = command.spawn().map_err(Error::Spawn)?;
    let pid = Pid::from_raw(child.id() as i32);
    debug!("spawned root tracee {} for {:?}", pid, config.command);

    let mut pipes = StdioPipes::default();
    if let Some(stdin) = child.stdin.take() {
        pipes.stdin = Some(unsafe { File::from_raw_fd(stdin.into_raw_fd()) });
    }
    if let Some(stdout) = child.stdout.take() {
        pipes.stdout = Some(unsafe { File::from_raw_fd(stdout.into_raw_fd()) });
    }
    if let Some(stderr) = child.stderr.take() {
        pipes.stderr = Some(unsafe { File::from_raw_fd(stderr.into_raw_fd()) });
    }

    // Consume the post-exec SIGTRAP and install the option mask so the loop
    // only ever sees tagged stops.
    postspawn(pid).map_err(|err| match err {
        TraceError::Os(errno) => Error::Spawn(io::Error::from_raw_os_error(errno.into_raw())),
        TraceError::Gone(gone) => Error::Spawn(io::Error::new(
            io::ErrorKind::Other,
            format!("root tracee {} died during initialization", gone),
        )),
    })?;

    // Keep the child handle from running its drop logic; the engine owns the
    // process's lifetime from here.
    std::mem::forget(child);

    Ok((pid, pipes, translated.guest))
}

fn postspawn(pid: Pid) -> Result<(), TraceError> {
    // Spurious signals (SIGWINCH and friends) can arrive before the
    // post-exec SIGTRAP; synchronize passes them through.
    let root = graft_trace::synchronize(pid, Signal::SIGTRAP)?;

    root.setoptions(
        Options::PTRACE_O_TRACESYSGOOD
            | Options::PTRACE_O_TRACECLONE
            | Options::PTRACE_O_TRACEFORK
            | Options::PTRACE_O_TRACEVFORK
            | Options::PTRACE_O_TRACEVFORKDONE
            | Options::PTRACE_O_TRACEEXEC
            | Options::PTRACE_O_TRACEEXIT
            | Options::PTRACE_O_EXITKILL,
    )?;

    root.resume(Resume::Syscall, None)?;
    Ok(())
}
