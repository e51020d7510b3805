/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Standard-I/O plumbing between the host and the guest.
//!
//! A stream that is already a host file descriptor is attached directly;
//! piped streams hand the other end back to the caller. The copy loops for
//! caller-supplied readers/writers run on named helper threads and never
//! touch tracee state.

use std::fs::File;
use std::io;
use std::io::Read;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::OwnedFd;
use std::thread;

/// How one of the guest's standard streams is supplied.
#[derive(Debug)]
pub enum Stdio {
    /// Use the engine's own descriptor.
    Inherit,
    /// Attach to /dev/null.
    Null,
    /// Create a pipe; the host end is handed back on spawn.
    Piped,
    /// Attach this descriptor directly.
    Fd(OwnedFd),
}

impl Default for Stdio {
    fn default() -> Self {
        Stdio::Inherit
    }
}

impl Stdio {
    pub(crate) fn to_process_stdio(&self) -> io::Result<std::process::Stdio> {
        Ok(match self {
            Stdio::Inherit => std::process::Stdio::inherit(),
            Stdio::Null => std::process::Stdio::null(),
            Stdio::Piped => std::process::Stdio::piped(),
            Stdio::Fd(fd) => {
                let dup = nix::unistd::dup(fd.as_raw_fd())
                    .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
                unsafe { std::process::Stdio::from_raw_fd(dup) }
            }
        })
    }

    pub(crate) fn is_piped(&self) -> bool {
        matches!(self, Stdio::Piped)
    }
}

/// Spawns a named helper thread copying `reader` into `writer` until EOF.
/// Used when the caller supplies arbitrary byte streams rather than host
/// descriptors.
pub fn spawn_copier<R, W>(name: &str, mut reader: R, mut writer: W) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    thread::Builder::new()
        .name(format!("graft-{}", name))
        .spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if writer.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = writer.flush();
        })
        .expect("failed to spawn stdio helper thread")
}

/// The host-side ends of the guest's piped streams.
#[derive(Debug, Default)]
pub struct StdioPipes {
    /// Write end feeding the guest's stdin.
    pub stdin: Option<File>,
    /// Read end of the guest's stdout.
    pub stdout: Option<File>,
    /// Read end of the guest's stderr.
    pub stderr: Option<File>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copier_moves_bytes_to_eof() {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        let reader = unsafe { File::from_raw_fd(read_fd) };
        let mut writer = unsafe { File::from_raw_fd(write_fd) };

        let sink = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_clone = sink.clone();

        struct SharedSink(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);
        impl Write for SharedSink {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let handle = spawn_copier("test", reader, SharedSink(sink_clone));

        writer.write_all(b"hello through the pipe").unwrap();
        drop(writer);
        handle.join().unwrap();

        assert_eq!(&*sink.lock().unwrap(), b"hello through the pipe");
    }
}
