/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use graft_trace::Pid;
use syscalls::Errno;
use thiserror::Error;

/// A graft engine error.
///
/// Errors that the guest caused (bad paths, writes to read-only bindings,
/// faulting buffers) are never represented here; those are injected back into
/// the guest's syscall result register and the engine keeps running.
#[derive(Error, Debug)]
pub enum Error {
    /// The configuration cannot be used to start a guest.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Fork/exec of the initial guest process failed.
    #[error("failed to spawn the guest command")]
    Spawn(#[source] std::io::Error),

    /// A ptrace primitive failed unexpectedly (not ESRCH). This is fatal for
    /// the affected tracee and, during the exit phase, for the engine.
    #[error("ptrace failure on pid {pid}: {errno}")]
    Kernel { pid: Pid, errno: Errno },

    /// The scheduler thread disappeared without reporting a status.
    #[error("tracer thread panicked")]
    TracerGone,
}

impl Error {
    pub(crate) fn kernel(pid: Pid, errno: Errno) -> Self {
        Error::Kernel { pid, errno }
    }
}
