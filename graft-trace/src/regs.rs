/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

/// The general purpose registers of a tracee, as fetched with
/// PTRACE_GETREGSET.
pub type Regs = libc::user_regs_struct;

/// A single register.
pub type Reg = u64;

/// Length in bytes of the syscall instruction (`syscall` on x86_64, `svc` on
/// aarch64). Subtracting this from the instruction pointer at a syscall stop
/// re-executes the syscall when the tracee is resumed.
#[cfg(target_arch = "x86_64")]
pub const SYSCALL_INSN_LEN: Reg = 2;

/// Length in bytes of the syscall instruction (`syscall` on x86_64, `svc` on
/// aarch64). Subtracting this from the instruction pointer at a syscall stop
/// re-executes the syscall when the tracee is resumed.
#[cfg(target_arch = "aarch64")]
pub const SYSCALL_INSN_LEN: Reg = 4;

/// This trait enables architecture-independent access to general purpose
/// registers.
pub trait RegAccess {
    /// Returns the value of the instruction pointer (aka the program counter).
    fn ip(&self) -> Reg;

    /// Mutable access to the instruction pointer (aka the program counter).
    fn ip_mut(&mut self) -> &mut Reg;

    /// Returns the value of the stack pointer.
    fn sp(&self) -> Reg;

    /// Mutable access to the stack pointer.
    fn sp_mut(&mut self) -> &mut Reg;

    /// Returns the syscall number. This is guaranteed to be available even
    /// after the syscall has executed (on x86_64, `rax` is clobbered by the
    /// return value, so `orig_rax` is used instead).
    fn sysno(&self) -> Reg;

    /// Mutable access to the register holding the syscall number.
    fn sysno_mut(&mut self) -> &mut Reg;

    /// Returns the value of the register where the syscall return value is
    /// stored.
    fn ret(&self) -> Reg;

    /// Mutable access to the register where the syscall return value is stored.
    fn ret_mut(&mut self) -> &mut Reg;

    /// Returns the `n`th (0-based, n < 6) syscall argument.
    fn arg(&self, n: usize) -> Reg;

    /// Mutable access to the `n`th (0-based, n < 6) syscall argument.
    fn arg_mut(&mut self, n: usize) -> &mut Reg;
}

#[cfg(target_arch = "x86_64")]
impl RegAccess for Regs {
    fn ip(&self) -> Reg {
        self.rip
    }

    fn ip_mut(&mut self) -> &mut Reg {
        &mut self.rip
    }

    fn sp(&self) -> Reg {
        self.rsp
    }

    fn sp_mut(&mut self) -> &mut Reg {
        &mut self.rsp
    }

    fn sysno(&self) -> Reg {
        // orig_rax is still available after the syscall has executed.
        self.orig_rax
    }

    fn sysno_mut(&mut self) -> &mut Reg {
        &mut self.orig_rax
    }

    fn ret(&self) -> Reg {
        self.rax
    }

    fn ret_mut(&mut self) -> &mut Reg {
        &mut self.rax
    }

    fn arg(&self, n: usize) -> Reg {
        match n {
            0 => self.rdi,
            1 => self.rsi,
            2 => self.rdx,
            3 => self.r10,
            4 => self.r8,
            5 => self.r9,
            _ => panic!("syscall argument index out of range: {}", n),
        }
    }

    fn arg_mut(&mut self, n: usize) -> &mut Reg {
        match n {
            0 => &mut self.rdi,
            1 => &mut self.rsi,
            2 => &mut self.rdx,
            3 => &mut self.r10,
            4 => &mut self.r8,
            5 => &mut self.r9,
            _ => panic!("syscall argument index out of range: {}", n),
        }
    }
}

#[cfg(target_arch = "aarch64")]
impl RegAccess for Regs {
    fn ip(&self) -> Reg {
        self.pc
    }

    fn ip_mut(&mut self) -> &mut Reg {
        &mut self.pc
    }

    fn sp(&self) -> Reg {
        self.sp
    }

    fn sp_mut(&mut self) -> &mut Reg {
        &mut self.sp
    }

    fn sysno(&self) -> Reg {
        self.regs[8]
    }

    fn sysno_mut(&mut self) -> &mut Reg {
        &mut self.regs[8]
    }

    fn ret(&self) -> Reg {
        self.regs[0]
    }

    fn ret_mut(&mut self) -> &mut Reg {
        &mut self.regs[0]
    }

    fn arg(&self, n: usize) -> Reg {
        assert!(n < 6, "syscall argument index out of range: {}", n);
        self.regs[n]
    }

    fn arg_mut(&mut self, n: usize) -> &mut Reg {
        assert!(n < 6, "syscall argument index out of range: {}", n);
        &mut self.regs[n]
    }
}

#[cfg(test)]
mod tests {
    use core::mem::MaybeUninit;

    use super::*;

    #[test]
    fn args_roundtrip() {
        let mut regs = unsafe { MaybeUninit::<Regs>::zeroed().assume_init() };

        for n in 0..6 {
            *regs.arg_mut(n) = 100 + n as Reg;
        }
        for n in 0..6 {
            assert_eq!(regs.arg(n), 100 + n as Reg);
        }

        *regs.ip_mut() = 42;
        assert_eq!(regs.ip(), 42);

        *regs.sp_mut() = 0xdead_0000;
        assert_eq!(regs.sp(), 0xdead_0000);

        *regs.ret_mut() = u64::MAX - 1;
        assert_eq!(regs.ret(), u64::MAX - 1);
    }
}
