//! Stable integer identifiers used in place of direct references.
//!
//! Nodes, links, transfers, flows and clusters all live in arenas owned by
//! [`crate::sim::Simulator`]; everything else refers to them by one of these
//! newtypes instead of holding a pointer/reference, per the cyclic-reference
//! design note in the spec (node <-> link <-> node, cluster <-> members).

use std::fmt;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

id_type!(NodeId);
id_type!(LinkId);
id_type!(TransferId);
id_type!(FlowId);
id_type!(ClusterId);
id_type!(ReservationId);
id_type!(EventHandle);

/// Caller-facing file identifier. Kept as a string since callers (shells,
/// scenario runners) name files by path-like identifiers, not arena slots.
pub type FileId = String;

/// Index of a chunk within a file's manifest, stable for the file's lifetime.
pub type ChunkId = u32;

/// Monotonically increasing id generator backing every arena above.
#[derive(Debug, Clone, Default)]
pub struct IdGen {
    next: u64,
}

impl IdGen {
    pub fn next_u64(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    /// Raises the generator floor so IDs restored from a snapshot are
    /// never reissued.
    pub fn ensure_above(&mut self, used: u64) {
        self.next = self.next.max(used + 1);
    }
}
