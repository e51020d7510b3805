/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! How a tracee ended.

use nix::sys::signal::SigHandler;
use nix::sys::signal::SigSet;
use nix::sys::signal::SigmaskHow;
use nix::sys::signal::Signal;
use nix::sys::signal::{self};

/// The terminal state of a tracee: a normal exit or a signal death.
///
/// The engine surfaces this for the guest tree's root and feeds it back into
/// the nested-ptrace emulation, where a guest tracer expects the classic
/// `wait(2)` encoding; [`ExitStatus::as_wait_status`] produces that word.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExitStatus {
    /// Exited with a code.
    Exited(i32),
    /// Killed by a signal; true when a core was dumped.
    Killed(Signal, bool),
}

impl ExitStatus {
    /// Encodes this status the way `wait(2)` reports it: exit code in the
    /// second byte, or the terminating signal with the core-dump bit.
    pub fn as_wait_status(self) -> i32 {
        match self {
            ExitStatus::Exited(code) => (code & 0xff) << 8,
            ExitStatus::Killed(sig, core) => sig as i32 | if core { 0x80 } else { 0 },
        }
    }

    /// Ends the current process the same way the tracee ended: exit with its
    /// code, or die by its signal so the shell sees the truth. Falls back to
    /// the conventional `128 + signo` code if the re-raised signal turns out
    /// not to be fatal here.
    pub fn propagate(self) -> ! {
        let (sig, core) = match self {
            ExitStatus::Exited(code) => std::process::exit(code),
            ExitStatus::Killed(sig, core) => (sig, core),
        };

        if core {
            // The tracee already dumped its core; ours would only shadow it.
            let no_core = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            unsafe { libc::setrlimit(libc::RLIMIT_CORE, &no_core) };
        }

        unsafe {
            let _ = signal::signal(sig, SigHandler::SigDfl);
        }
        let mut mask = SigSet::empty();
        mask.add(sig);
        let _ = signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&mask), None);
        let _ = signal::raise(sig);

        std::process::exit(128 + sig as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_status_encoding_matches_the_libc_macros() {
        let status = ExitStatus::Exited(42).as_wait_status();
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 42);

        let status = ExitStatus::Killed(Signal::SIGKILL, false).as_wait_status();
        assert!(libc::WIFSIGNALED(status));
        assert_eq!(libc::WTERMSIG(status), libc::SIGKILL);
        assert!(!libc::WCOREDUMP(status));

        let status = ExitStatus::Killed(Signal::SIGSEGV, true).as_wait_status();
        assert!(libc::WIFSIGNALED(status));
        assert_eq!(libc::WTERMSIG(status), libc::SIGSEGV);
        assert!(libc::WCOREDUMP(status));
    }

    #[test]
    fn exit_and_signal_words_never_collide() {
        // A shell must be able to tell `exit 9` from `killed by SIGKILL`.
        assert_ne!(
            ExitStatus::Exited(libc::SIGKILL).as_wait_status(),
            ExitStatus::Killed(Signal::SIGKILL, false).as_wait_status()
        );
    }
}
