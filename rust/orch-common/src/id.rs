// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Opaque identifiers handed out by the scheduler and the object store.
//!
//! Every identifier is a `u64` newtype. No arithmetic is exposed, so an
//! `ObjectID` can never be mixed up with a `SegmentID` or bumped by accident.

use std::fmt;

use crate::constants::NIL_ID;

/// Generates an opaque integer identifier type.
///
/// Each ID gets:
/// - `new` / `nil` constructors and the `value()` accessor
/// - `Hash`, `Eq`, `Ord`, `Clone`, `Copy`, `Debug`, `Display`
/// - `Nil` default (`u64::MAX`)
macro_rules! define_opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw wire value.
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn nil() -> Self {
                Self(NIL_ID)
            }

            pub const fn is_nil(&self) -> bool {
                self.0 == NIL_ID
            }

            /// Raw value, for putting the ID back on the wire.
            pub const fn value(&self) -> u64 {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::nil()
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> u64 {
                id.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_nil() {
                    write!(f, "{}(nil)", stringify!($name))
                } else {
                    write!(f, "{}({})", stringify!($name), self.0)
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_opaque_id!(
    /// Cluster-wide identifier of a distributed object. Allocated only by the scheduler.
    ObjectID
);

define_opaque_id!(
    /// Identifier of a worker process, assigned at registration.
    WorkerID
);

define_opaque_id!(
    /// Identifier of the node-local object store process.
    ObjStoreID
);

define_opaque_id!(
    /// Identifier of a shared-memory segment within one object store.
    SegmentID
);

/// Convert a slice of object IDs to their wire values.
pub fn to_wire(ids: &[ObjectID]) -> Vec<u64> {
    ids.iter().map(ObjectID::value).collect()
}

/// Convert wire values back to object IDs.
pub fn from_wire(ids: &[u64]) -> Vec<ObjectID> {
    ids.iter().copied().map(ObjectID::new).collect()
}
