/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Port rewriting on `bind` and `connect`: when the sockaddr's port matches a
//! port-map entry, the port is rewritten in place in tracee memory.

use std::collections::HashMap;

use graft_trace::StoppedTask;
use syscalls::Errno;

use crate::tracee::RegVersion;
use crate::tracee::Slot;
use crate::tracee::Tracee;

/// Offset of `sin_port`/`sin6_port` within the sockaddr; the same for both
/// families, right after `sa_family`.
const PORT_OFFSET: u64 = 2;

/// Entry-phase rewrite for bind/connect.
pub(crate) fn translate_sockaddr_port(
    port_map: &HashMap<u16, u16>,
    tracee: &mut Tracee,
    task: &StoppedTask,
) -> Result<(), Errno> {
    if port_map.is_empty() {
        return Ok(());
    }

    let addr = tracee.peek_reg(RegVersion::Original, Slot::SysArg2);
    let addrlen = tracee.peek_reg(RegVersion::Original, Slot::SysArg3);
    if addr == 0 || addrlen < 4 {
        return Ok(());
    }

    let family = task.read_value::<u16>(addr)?;
    if family != libc::AF_INET as u16 && family != libc::AF_INET6 as u16 {
        return Ok(());
    }

    let wire_port = task.read_value::<[u8; 2]>(addr + PORT_OFFSET)?;
    let port = u16::from_be_bytes(wire_port);

    if let Some(&mapped) = port_map.get(&port) {
        tracing::debug!("vpid {} port {} -> {}", tracee.vpid, port, mapped);
        task.write_value(addr + PORT_OFFSET, &mapped.to_be_bytes())?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_bytes_are_network_order() {
        // The in-memory surgery writes big-endian; check the byte mapping the
        // handler relies on.
        let port: u16 = 5432;
        assert_eq!(port.to_be_bytes(), [0x15, 0x38]);
        assert_eq!(u16::from_be_bytes([0x15, 0x38]), 5432);
    }

    #[test]
    fn map_lookup_uses_host_order() {
        let mut map = HashMap::new();
        map.insert(5432u16, 5433u16);

        let wire = 5432u16.to_be_bytes();
        let seen = u16::from_be_bytes(wire);
        assert_eq!(map.get(&seen), Some(&5433));
    }
}
