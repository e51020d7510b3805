/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Whole-guest scenarios. The host root is used as the guest rootfs so the
//! usual shell utilities exist inside the guest; temporary directories are
//! grafted in to observe translation.
//!
//! Each engine waits on any child of the test process, so engines must not
//! overlap; every test holds `ENGINE_LOCK` for its duration.

use std::io::Read;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use graft::Config;
use graft::ExitStatus;
use graft::Stdio;
use tempfile::TempDir;

static ENGINE_LOCK: Mutex<()> = Mutex::new(());

/// Runs a guest to completion with a watchdog, capturing stdout. A deadlock
/// in the engine fails the test instead of hanging the suite.
fn run_collect(config: Config) -> (ExitStatus, String) {
    let _guard = ENGINE_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let mut guest = graft::spawn(config.stdin(Stdio::Null).stdout(Stdio::Piped))
        .expect("failed to spawn guest");

    let pid = guest.pid();
    let mut stdout = guest.stdout().expect("stdout was piped");

    // Both the wait and the stdout drain can block; each gets its own
    // thread so the watchdog can fire.
    let reader = std::thread::spawn(move || {
        let mut output = String::new();
        let _ = stdout.read_to_string(&mut output);
        output
    });

    let (tx, rx) = mpsc::channel();
    let waiter = std::thread::spawn(move || {
        let result = guest.wait();
        let _ = tx.send(());
        result
    });

    let timed_out = rx.recv_timeout(Duration::from_secs(60)).is_err();
    if timed_out {
        unsafe { libc::kill(pid.as_raw(), libc::SIGKILL) };
    }

    let status = waiter.join().expect("waiter panicked").expect("engine failed");
    let output = reader.join().expect("reader panicked");

    assert!(!timed_out, "guest did not finish within the watchdog interval");
    (status, output)
}

fn sh(script: &str) -> Config {
    Config::new("/").command(["/bin/sh", "-c", script])
}

#[test]
fn exit_status_propagates() {
    let (status, _) = run_collect(Config::new("/").command(["/bin/true"]));
    assert_eq!(status, ExitStatus::Exited(0));

    let (status, _) = run_collect(Config::new("/").command(["/bin/false"]));
    assert_eq!(status, ExitStatus::Exited(1));
}

#[test]
fn stdout_is_captured() {
    let (status, out) = run_collect(sh("echo hello from the guest"));
    assert_eq!(status, ExitStatus::Exited(0));
    assert_eq!(out, "hello from the guest\n");
}

#[test]
fn reads_file_through_binding() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("hostname"), "guest-host\n").unwrap();

    let (status, out) = run_collect(
        Config::new("/")
            .bind(dir.path(), "/grafted")
            .command(["/bin/cat", "/grafted/hostname"]),
    );
    assert_eq!(status, ExitStatus::Exited(0));
    assert_eq!(out, "guest-host\n");
}

#[test]
fn write_to_read_only_binding_is_erofs() {
    let dir = TempDir::new().unwrap();

    let (status, _) = run_collect(
        sh("echo x > /ro/x").bind_read_only(dir.path(), "/ro"),
    );
    assert_ne!(status, ExitStatus::Exited(0));
    assert!(
        !dir.path().join("x").exists(),
        "read-only binding was mutated on the host"
    );
}

#[test]
fn write_to_writable_binding_lands_on_host() {
    let dir = TempDir::new().unwrap();

    let (status, _) = run_collect(sh("echo x > /rw/x").bind(dir.path(), "/rw"));
    assert_eq!(status, ExitStatus::Exited(0));
    assert_eq!(std::fs::read_to_string(dir.path().join("x")).unwrap(), "x\n");
}

#[test]
fn unlink_in_read_only_binding_is_rejected() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("precious"), "keep").unwrap();

    let (status, _) = run_collect(sh("rm /ro/precious").bind_read_only(dir.path(), "/ro"));
    assert_ne!(status, ExitStatus::Exited(0));
    assert!(dir.path().join("precious").exists());
}

#[test]
fn chdir_and_getcwd_stay_in_guest_view() {
    let dir = TempDir::new().unwrap();

    let (status, out) = run_collect(sh("cd /grafted && pwd -P").bind(dir.path(), "/grafted"));
    assert_eq!(status, ExitStatus::Exited(0));
    assert_eq!(out, "/grafted\n");
}

#[test]
fn readlink_proc_self_exe_is_reverse_translated() {
    let readlink = ["/usr/bin/readlink", "/bin/readlink"]
        .iter()
        .find(|p| Path::new(p).exists());
    let Some(readlink) = readlink else {
        // No readlink(1) on this host; nothing to drive the scenario with.
        return;
    };

    // The binary is grafted at a different guest path; the magic link must
    // answer with the guest path, not the host one.
    let (status, out) = run_collect(
        Config::new("/")
            .bind_file(readlink, "/grafted-readlink")
            .command(["/grafted-readlink", "/proc/self/exe"]),
    );
    assert_eq!(status, ExitStatus::Exited(0));
    assert_eq!(out.trim_end(), "/grafted-readlink");
}

#[test]
fn uname_release_is_spoofed() {
    if !Path::new("/bin/uname").exists() && !Path::new("/usr/bin/uname").exists() {
        return;
    }

    let (status, out) = run_collect(sh("uname -r").kernel_release("9.9.9-graft"));
    assert_eq!(status, ExitStatus::Exited(0));
    assert_eq!(out, "9.9.9-graft\n");
}

#[test]
fn credentials_are_spoofed() {
    let (status, out) = run_collect(sh("echo uid=$(id -u) gid=$(id -g)").ids(1234, 5678));
    assert_eq!(status, ExitStatus::Exited(0));
    assert_eq!(out, "uid=1234 gid=5678\n");
}

#[test]
fn forked_children_are_followed() {
    let (status, out) = run_collect(sh("( /bin/true ) && echo forked-ok"));
    assert_eq!(status, ExitStatus::Exited(0));
    assert_eq!(out, "forked-ok\n");
}

#[test]
fn fatal_signal_is_reported() {
    use nix::sys::signal::Signal;

    let (status, _) = run_collect(sh("kill -USR1 $$"));
    assert_eq!(status, ExitStatus::Killed(Signal::SIGUSR1, false));
}

#[test]
fn nested_strace_completes() {
    let strace = ["/usr/bin/strace", "/bin/strace"]
        .iter()
        .find(|p| Path::new(p).exists());
    let Some(strace) = strace else {
        // strace is not installed; the nested-ptrace path is exercised in
        // environments that have it.
        return;
    };

    // The default /tmp binding is read-only, so the log goes to a grafted
    // writable directory.
    let out_dir = TempDir::new().unwrap();
    let (status, out) = run_collect(
        sh(&format!(
            "{} -f -o /out/trace /bin/true && echo straced-ok",
            strace
        ))
        .bind(out_dir.path(), "/out"),
    );
    assert_eq!(status, ExitStatus::Exited(0));
    assert_eq!(out, "straced-ok\n");

    let log = std::fs::read_to_string(out_dir.path().join("trace")).unwrap();
    assert!(log.contains("execve"), "strace saw no execve: {}", log);
    assert!(log.contains("exit"), "strace saw no exit: {}", log);
}
