// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Reference-counted data descriptor handle (§4.B), mirroring
//! `smartGDDPointer`/`smartConstGDDPointer`'s auto ref/unref discipline.
//! `Arc` gives us the atomic refcounting for free; the two constructors
//! below exist only to preserve the source's textural distinction between
//! an acquisition that assumes the count was already bumped by the caller
//! and one that bumps it itself.

use ca_protocol::DbrType;
use std::sync::Arc;

/// The payload behind a `DdHandle`: a typed, counted value buffer.
#[derive(Debug)]
pub struct Dd {
    pub dbr_type: DbrType,
    pub count: u32,
    pub bytes: Vec<u8>,
}

impl Dd {
    pub fn new(dbr_type: DbrType, count: u32, bytes: Vec<u8>) -> Self {
        assert_eq!(bytes.len(), dbr_type.value_size(count));
        Self { dbr_type, count, bytes }
    }
}

/// A shared, reference-counted handle to a `Dd`. Cloning is cheap (bumps the
/// `Arc` strong count); the value is dropped once the last handle is.
#[derive(Debug, Clone)]
pub struct DdHandle(Arc<Dd>);

impl DdHandle {
    /// Wrap a freshly-produced `Dd` whose logical refcount starts at one --
    /// the common case, e.g. an adapter just formatted a read result.
    pub fn from_owned(dd: Dd) -> Self {
        DdHandle(Arc::new(dd))
    }

    /// Take a new handle on a `Dd` someone else already holds a reference
    /// to, incrementing the shared count. Named to mirror the source's
    /// "already referenced" constructor.
    pub fn from_shared(existing: &DdHandle) -> Self {
        DdHandle(Arc::clone(&existing.0))
    }

    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn dbr_type(&self) -> DbrType {
        self.0.dbr_type
    }

    pub fn count(&self) -> u32 {
        self.0.count
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_owned_starts_at_one_reference() {
        let dd = Dd::new(DbrType::Double, 1, vec![0u8; 8]);
        let handle = DdHandle::from_owned(dd);
        assert_eq!(handle.strong_count(), 1);
    }

    #[test]
    fn from_shared_bumps_the_count_and_drop_releases_it() {
        // Boundary scenario 3: refcount must balance back to the baseline
        // once every handle is dropped.
        let dd = Dd::new(DbrType::Long, 4, vec![0u8; 16]);
        let first = DdHandle::from_owned(dd);
        assert_eq!(first.strong_count(), 1);

        {
            let second = DdHandle::from_shared(&first);
            assert_eq!(first.strong_count(), 2);
            assert_eq!(second.strong_count(), 2);
        }

        assert_eq!(first.strong_count(), 1);
    }

    #[test]
    fn accessors_expose_type_count_and_bytes() {
        let dd = Dd::new(DbrType::Char, 3, vec![1, 2, 3]);
        let handle = DdHandle::from_owned(dd);
        assert_eq!(handle.dbr_type(), DbrType::Char);
        assert_eq!(handle.count(), 3);
        assert_eq!(handle.bytes(), &[1, 2, 3]);
    }
}
