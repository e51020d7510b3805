/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Decides whether a host executable needs the CPU emulator: an ELF whose
//! machine type differs from the host's cannot be executed natively.

use std::fs::File;
use std::io;
use std::io::Read;
use std::path::Path;

#[cfg(target_arch = "x86_64")]
const HOST_MACHINE: u16 = 62; // EM_X86_64

#[cfg(target_arch = "aarch64")]
const HOST_MACHINE: u16 = 183; // EM_AARCH64

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// What the ELF header says about a program.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Binfmt {
    /// The e_machine field of the header.
    pub machine: u16,
}

impl Binfmt {
    /// Examines the header of a host executable. Non-ELF files (scripts,
    /// garbage) are reported as host-native; the kernel deals with them.
    pub fn examine(host_path: &Path) -> io::Result<Option<Binfmt>> {
        let mut file = File::open(host_path)?;
        // e_machine sits at offset 18 for both ELFCLASS32 and ELFCLASS64.
        let mut header = [0u8; 20];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        }

        if header[..4] != ELF_MAGIC {
            return Ok(None);
        }

        Ok(Some(Binfmt {
            machine: u16::from_le_bytes([header[18], header[19]]),
        }))
    }

    /// True when this program cannot run on the host CPU.
    pub fn needs_emulator(&self) -> bool {
        self.machine != HOST_MACHINE
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn native_elf_needs_no_emulator() {
        let mut file = NamedTempFile::new().unwrap();
        let mut header = vec![0u8; 20];
        header[..4].copy_from_slice(&ELF_MAGIC);
        header[18..20].copy_from_slice(&HOST_MACHINE.to_le_bytes());
        file.write_all(&header).unwrap();

        let binfmt = Binfmt::examine(file.path()).unwrap().unwrap();
        assert!(!binfmt.needs_emulator());
    }

    #[test]
    fn foreign_elf_needs_emulator() {
        let mut file = NamedTempFile::new().unwrap();
        let mut header = vec![0u8; 20];
        header[..4].copy_from_slice(&ELF_MAGIC);
        // EM_RISCV, definitely not the host.
        header[18..20].copy_from_slice(&243u16.to_le_bytes());
        file.write_all(&header).unwrap();

        let binfmt = Binfmt::examine(file.path()).unwrap().unwrap();
        assert!(binfmt.needs_emulator());
    }

    #[test]
    fn scripts_are_not_elves() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"#!/bin/sh\necho hello\n").unwrap();
        assert_eq!(Binfmt::examine(file.path()).unwrap(), None);
    }

    #[test]
    fn short_files_are_not_elves() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"\x7fEL").unwrap();
        assert_eq!(Binfmt::examine(file.path()).unwrap(), None);
    }
}
