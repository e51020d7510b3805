/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Identity spoofing on the exit phase: kernel release in `uname`,
//! credentials in `get*id`, and ownership substitution in stat results.

use graft_trace::StoppedTask;
use syscalls::Errno;
use syscalls::Sysno;

use crate::event_loop::Engine;
use crate::tracee::RegVersion;
use crate::tracee::Slot;
use crate::tracee::Tracee;

/// Each utsname field is a fixed-size NUL-padded array; `release` is the
/// third.
const UTS_FIELD_LEN: u64 = 65;
const UTS_RELEASE_OFFSET: u64 = 2 * UTS_FIELD_LEN;

/// Exit-phase rewrite of `uname` when a kernel release override is set.
pub(crate) fn fixup_uname(
    engine: &Engine,
    tracee: &mut Tracee,
    task: &StoppedTask,
) -> Result<(), Errno> {
    let release = match &engine.kernel_release {
        Some(release) => release,
        None => return Ok(()),
    };

    let result = tracee.peek_reg(RegVersion::Current, Slot::SysResult) as i64;
    if result != 0 {
        return Ok(());
    }

    let buf = tracee.peek_reg(RegVersion::Original, Slot::SysArg1);
    let mut field = [0u8; UTS_FIELD_LEN as usize];
    let bytes = release.as_bytes();
    let n = bytes.len().min(field.len() - 1);
    field[..n].copy_from_slice(&bytes[..n]);

    task.write_exact(buf + UTS_RELEASE_OFFSET, &field)?;
    Ok(())
}

/// Exit-phase rewrite of the credential syscalls.
pub(crate) fn fixup_getid(engine: &Engine, tracee: &mut Tracee, sysno: Sysno) {
    let spoofed = match sysno {
        Sysno::getuid | Sysno::geteuid => engine.uid.map(|id| id as u64),
        Sysno::getgid | Sysno::getegid => engine.gid.map(|id| id as u64),
        _ => None,
    };

    if let Some(id) = spoofed {
        tracee.poke_reg(Slot::SysResult, id);
    }
}

/// Substitutes the spoofed uid/gid into a stat result for files owned by the
/// real user.
pub(crate) fn fixup_stat(
    engine: &Engine,
    tracee: &mut Tracee,
    task: &StoppedTask,
    sysno: Sysno,
) -> Result<(), Errno> {
    if engine.uid.is_none() && engine.gid.is_none() {
        return Ok(());
    }

    let result = tracee.peek_reg(RegVersion::Current, Slot::SysResult) as i64;
    if result != 0 {
        return Ok(());
    }

    if sysno == Sysno::statx {
        let buf = tracee.peek_reg(RegVersion::Original, Slot::SysArg5);
        let mut stx = task.read_value::<libc::statx>(buf)?;
        let mut changed = false;
        if let Some(uid) = engine.uid {
            if stx.stx_uid == engine.real_uid {
                stx.stx_uid = uid;
                changed = true;
            }
        }
        if let Some(gid) = engine.gid {
            if stx.stx_gid == engine.real_gid {
                stx.stx_gid = gid;
                changed = true;
            }
        }
        if changed {
            task.write_value(buf, &stx)?;
        }
        return Ok(());
    }

    let buf_slot = match sysno {
        Sysno::newfstatat => Slot::SysArg3,
        #[cfg(target_arch = "x86_64")]
        Sysno::stat | Sysno::lstat => Slot::SysArg2,
        Sysno::fstat => Slot::SysArg2,
        _ => return Ok(()),
    };

    let buf = tracee.peek_reg(RegVersion::Original, buf_slot);
    let mut st = task.read_value::<libc::stat>(buf)?;
    let mut changed = false;
    if let Some(uid) = engine.uid {
        if st.st_uid == engine.real_uid {
            st.st_uid = uid;
            changed = true;
        }
    }
    if let Some(gid) = engine.gid {
        if st.st_gid == engine.real_gid {
            st.st_gid = gid;
            changed = true;
        }
    }
    if changed {
        task.write_value(buf, &st)?;
    }

    Ok(())
}

/// True when the exit phase needs a stat fixup for this syscall.
pub(crate) fn is_stat_family(sysno: Sysno) -> bool {
    #[cfg(target_arch = "x86_64")]
    if matches!(sysno, Sysno::stat | Sysno::lstat) {
        return true;
    }
    matches!(sysno, Sysno::fstat | Sysno::newfstatat | Sysno::statx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uts_release_offset_matches_libc() {
        // utsname is six 65-byte arrays; release is field #3.
        assert_eq!(
            std::mem::size_of::<libc::utsname>() as u64,
            6 * UTS_FIELD_LEN
        );
        assert_eq!(UTS_RELEASE_OFFSET, 130);
    }

    #[test]
    fn stat_family_covers_at_variants() {
        assert!(is_stat_family(Sysno::fstat));
        assert!(is_stat_family(Sysno::newfstatat));
        assert!(is_stat_family(Sysno::statx));
        assert!(!is_stat_family(Sysno::read));
    }
}
