// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A claimed channel (§3, §4.F): the server-side binding between a
//! client's chosen name and a process variable the adapter owns.

use crate::resource_table::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
    NoAccess,
}

/// One channel a stream client holds open. `sid` is the server-assigned
/// resource ID the client will use in subsequent requests; `cid` is the
/// client's own tag, echoed back verbatim on every response so the client
/// can correlate without maintaining its own id->name map.
#[derive(Debug, Clone)]
pub struct Chan {
    pub sid: ResourceId,
    pub cid: u32,
    pub name: String,
    pub native_type: ca_protocol::DbrType,
    pub native_count: u32,
    pub access: AccessMode,
}

impl Chan {
    pub fn is_writable(&self) -> bool {
        matches!(self.access, AccessMode::ReadWrite)
    }
}

/// A lightweight back-reference installed in the server-wide resource
/// table so a channel's global uniqueness can be checked without the
/// server owning the `Chan` itself -- `Chan`s remain exclusively owned by
/// their client's own table. The "same object" invariant from the design
/// notes becomes an ID/ownership-equivalence check: for a channel `c`
/// owned by client `client_id`, `resource_table.lookup(c.sid)` must yield
/// a `ChannelRef` whose fields match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRef {
    pub client_id: u64,
    pub sid: ResourceId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_access_modes() {
        let mut chan = Chan {
            sid: ResourceId(1),
            cid: 1,
            name: "test:pv".into(),
            native_type: ca_protocol::DbrType::Double,
            native_count: 1,
            access: AccessMode::ReadOnly,
        };
        assert!(!chan.is_writable());
        chan.access = AccessMode::ReadWrite;
        assert!(chan.is_writable());
    }
}
