/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Access to the address space of a stopped tracee.
//!
//! Addresses are plain `u64` values as read out of the tracee's registers.
//! Bulk transfers go through `process_vm_readv(2)`/`process_vm_writev(2)`;
//! word-sized transfers use PTRACE_PEEKDATA/POKEDATA, which is faster for
//! small amounts of data.

use core::mem;
use std::io;

use nix::sys::ptrace;
use syscalls::Errno;

use super::StoppedTask;

const PAGE_SIZE: u64 = 4096;

/// Number of bytes from `addr` to the end of its page. A single
/// `process_vm_readv` transfer never crosses a page boundary so that a
/// protected page does not hide readable bytes in front of it.
fn page_remaining(addr: u64) -> u64 {
    PAGE_SIZE - (addr & (PAGE_SIZE - 1))
}

impl StoppedTask {
    /// Reads a single word.
    fn peek_word(&self, addr: u64) -> Result<u64, Errno> {
        ptrace::read(self.pid().into(), addr as *mut libc::c_void)
            .map_err(|err| Errno::new(err as i32))
            .map(|word| word as u64)
    }

    /// Writes a single word.
    fn poke_word(&self, addr: u64, value: u64) -> Result<(), Errno> {
        unsafe {
            ptrace::write(
                self.pid().into(),
                addr as *mut libc::c_void,
                value as *mut libc::c_void,
            )
        }
        .map_err(|err| Errno::new(err as i32))
    }

    /// Performs a read starting at the given address. The number of bytes read
    /// is returned; a fault at the very first byte reads 0 bytes. The buffer
    /// is not guaranteed to be completely filled.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        let size = buf.len();
        if size == 0 {
            return Ok(0);
        } else if size <= mem::size_of::<u64>() && page_remaining(addr) >= 8 {
            let word = self.peek_word(addr)?;
            buf.copy_from_slice(&word.to_ne_bytes()[..size]);
            return Ok(size);
        }

        let mut done = 0;
        while done < size {
            let chunk = (size - done).min(page_remaining(addr + done as u64) as usize);
            let local = [io::IoSliceMut::new(&mut buf[done..done + chunk])];
            let remote = [libc::iovec {
                iov_base: (addr + done as u64) as *mut libc::c_void,
                iov_len: chunk,
            }];

            let n = Errno::result(unsafe {
                libc::process_vm_readv(
                    self.pid().as_raw(),
                    local.as_ptr() as *const libc::iovec,
                    1,
                    remote.as_ptr(),
                    1,
                    0,
                )
            })
            .or_else(|err| {
                if err == Errno::EFAULT {
                    // Treat page faults as an EOF.
                    Ok(0)
                } else {
                    Err(err)
                }
            })? as usize;

            if n == 0 {
                break;
            }
            done += n;
        }

        Ok(done)
    }

    /// Performs a write starting at the given address. The number of bytes
    /// written is returned. There is no guarantee that the given buffer will
    /// be fully written.
    pub fn write(&self, addr: u64, buf: &[u8]) -> Result<usize, Errno> {
        let size = buf.len();
        if size == 0 {
            return Ok(0);
        } else if size == mem::size_of::<u64>() && page_remaining(addr) >= 8 {
            let word = u64::from_ne_bytes(buf.try_into().unwrap());
            self.poke_word(addr, word)?;
            return Ok(size);
        }

        let mut done = 0;
        while done < size {
            let chunk = (size - done).min(page_remaining(addr + done as u64) as usize);
            let local = [io::IoSlice::new(&buf[done..done + chunk])];
            let remote = [libc::iovec {
                iov_base: (addr + done as u64) as *mut libc::c_void,
                iov_len: chunk,
            }];

            let n = Errno::result(unsafe {
                libc::process_vm_writev(
                    self.pid().as_raw(),
                    local.as_ptr() as *const libc::iovec,
                    1,
                    remote.as_ptr(),
                    1,
                    0,
                )
            })
            .or_else(|err| {
                if err == Errno::EFAULT {
                    Ok(0)
                } else {
                    Err(err)
                }
            })? as usize;

            if n == 0 {
                break;
            }
            done += n;
        }

        Ok(done)
    }

    /// Reads exactly the number of bytes wanted by `buf`. Fails with EFAULT if
    /// the range is not fully readable.
    pub fn read_exact(&self, addr: u64, buf: &mut [u8]) -> Result<(), Errno> {
        if self.read(addr, buf)? == buf.len() {
            Ok(())
        } else {
            Err(Errno::EFAULT)
        }
    }

    /// Writes all of `buf`. Fails with EFAULT if the range is not fully
    /// writable.
    pub fn write_exact(&self, addr: u64, buf: &[u8]) -> Result<(), Errno> {
        if self.write(addr, buf)? == buf.len() {
            Ok(())
        } else {
            Err(Errno::EFAULT)
        }
    }

    /// Reads a value at the given address.
    pub fn read_value<T: Sized>(&self, addr: u64) -> Result<T, Errno> {
        let mut value = mem::MaybeUninit::<T>::uninit();

        let value_buf = unsafe {
            core::slice::from_raw_parts_mut(value.as_mut_ptr() as *mut u8, mem::size_of::<T>())
        };

        self.read_exact(addr, value_buf)?;

        Ok(unsafe { value.assume_init() })
    }

    /// Writes a value to the given address.
    pub fn write_value<T: Sized>(&self, addr: u64, value: &T) -> Result<(), Errno> {
        let value_buf = unsafe {
            core::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>())
        };

        self.write_exact(addr, value_buf)
    }

    /// Reads a NUL terminated string starting at the given address, returning
    /// its bytes without the terminator. Fails with ENAMETOOLONG if no NUL is
    /// found within `max` bytes.
    pub fn read_cstring(&self, addr: u64, max: usize) -> Result<Vec<u8>, Errno> {
        let mut accumulator = Vec::new();
        let mut buf = [0u8; 512];

        loop {
            let remaining = max + 1 - accumulator.len();
            if remaining == 0 {
                return Err(Errno::ENAMETOOLONG);
            }

            let chunk = remaining.min(buf.len());
            let read = self.read(addr + accumulator.len() as u64, &mut buf[..chunk])?;
            if read == 0 {
                // Hit unmapped memory before finding a terminator.
                return Err(Errno::EFAULT);
            }

            if let Some(nul) = buf[..read].iter().position(|&b| b == 0) {
                accumulator.extend(&buf[..nul]);
                if accumulator.len() > max {
                    return Err(Errno::ENAMETOOLONG);
                }
                return Ok(accumulator);
            }

            accumulator.extend(&buf[..read]);
            if accumulator.len() > max {
                return Err(Errno::ENAMETOOLONG);
            }
        }
    }

    /// Writes a string including its NUL terminator.
    pub fn write_cstring(&self, addr: u64, bytes: &[u8]) -> Result<(), Errno> {
        debug_assert!(!bytes.contains(&0));
        self.write_exact(addr, bytes)?;
        self.write_exact(addr + bytes.len() as u64, &[0])
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;

    use nix::sys::ptrace;
    use nix::sys::signal::raise;
    use nix::sys::signal::Signal;
    use nix::sys::wait::waitpid;
    use nix::sys::wait::WaitStatus;
    use nix::unistd::fork;
    use nix::unistd::ForkResult;
    use quickcheck::QuickCheck;
    use quickcheck_macros::quickcheck;

    use super::*;

    // Helper function for spawning a child process in a stopped state. The
    // value `T` will be in the child's address space allowing us to read or
    // modify it from the parent.
    fn fork_helper<P, C, T>(mut value: T, parent: P, child: C) -> bool
    where
        P: FnOnce(StoppedTask, T) -> bool,
        C: FnOnce(&mut T),
    {
        match unsafe { fork() }.unwrap() {
            ForkResult::Parent { child, .. } => {
                assert_eq!(
                    waitpid(child, None).unwrap(),
                    WaitStatus::Stopped(child, Signal::SIGTRAP)
                );

                let result = parent(StoppedTask::assume_stopped(child), value);

                // Allow child to exit.
                ptrace::cont(child, None).unwrap();
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));

                result
            }
            ForkResult::Child => {
                ptrace::traceme().unwrap();

                // Give us a chance to modify if needed.
                child(&mut value);

                // Allow parent to control when we exit. While stopped here, the
                // parent can mess with the child's memory.
                raise(Signal::SIGTRAP).unwrap();

                // Can't use the normal exit function here because we don't want
                // to call atexit handlers since `execve` was never called.
                unsafe {
                    ::libc::_exit(0);
                }
            }
        }
    }

    fn prop_remote_read_exact(buf: Vec<u8>) -> bool {
        fork_helper(
            buf,
            move |memory, mut buf| {
                let copied = buf.clone();
                let addr = buf.as_ptr() as u64;

                // Zero out the buffer just to show that we are really reading
                // from the child process and not our own process.
                for byte in buf.iter_mut() {
                    *byte = 0;
                }

                memory.read_exact(addr, &mut buf).unwrap();

                buf == copied
            },
            |_| {},
        )
    }

    fn prop_remote_write_exact(buf: Vec<u8>) -> bool {
        fork_helper(
            buf,
            move |memory, mut buf| {
                let copied = buf.clone();
                let addr = buf.as_ptr() as u64;

                memory.write_exact(addr, &copied).unwrap();
                memory.read_exact(addr, &mut buf).unwrap();

                buf == copied
            },
            |buf| {
                // Zero out the buffer before the parent gets a chance to write
                // to it to demonstrate that writes by the parent are actually
                // working.
                for byte in buf.iter_mut() {
                    *byte = 0;
                }
            },
        )
    }

    #[test]
    fn test_remote_memory() {
        // The generator must produce vectors larger than one page to exercise
        // the chunked transfers.
        let mut qc = QuickCheck::new().gen(quickcheck::Gen::new(0x4000 + u8::MAX as usize));

        qc.quickcheck(prop_remote_read_exact as fn(Vec<u8>) -> bool);

        // Known small reads that random generation may miss.
        assert!(prop_remote_read_exact(vec![]));
        assert!(prop_remote_read_exact(vec![1]));
        assert!(prop_remote_read_exact(vec![1, 2, 3]));
        assert!(prop_remote_read_exact(vec![1, 2, 3, 4, 5, 6, 7, 8]));

        qc.quickcheck(prop_remote_write_exact as fn(Vec<u8>) -> bool);

        assert!(prop_remote_write_exact(vec![]));
        assert!(prop_remote_write_exact(vec![1]));
        assert!(prop_remote_write_exact(vec![1, 2, 3]));
        assert!(prop_remote_write_exact(vec![1, 2, 3, 4, 5, 6, 7, 8]));
    }

    #[quickcheck]
    fn prop_remote_read_cstring(s: String) -> bool {
        // quickcheck doesn't support CString.
        let s = CString::new(
            s.into_bytes()
                .into_iter()
                .filter(|&x| x != 0)
                .collect::<Vec<_>>(),
        )
        .unwrap();

        fork_helper(
            s,
            move |memory, s| {
                let addr = s.as_bytes().as_ptr() as u64;
                let remote = memory.read_cstring(addr, 4096).unwrap();
                remote == s.as_bytes()
            },
            |_| {},
        )
    }

    #[test]
    fn cstring_too_long() {
        let s = CString::new(vec![b'x'; 300]).unwrap();

        assert!(fork_helper(
            s,
            move |memory, s| {
                let addr = s.as_bytes().as_ptr() as u64;
                memory.read_cstring(addr, 16) == Err(Errno::ENAMETOOLONG)
            },
            |_| {},
        ));
    }
}
