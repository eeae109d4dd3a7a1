//! Fabric adapter: the collective transport consumed during bootstrap.
//!
//! The fabric itself is an external collaborator. This module defines the
//! narrow interface initialization needs from it (join, rank identity,
//! all-gather, group creation) and the plain data types that cross that
//! boundary. A real NCCL or Gloo transport implements [`Fabric`] out of
//! tree; [`LocalFabric`] implements it in-process for development and
//! tests.

mod local;

pub use local::LocalFabric;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Collective backend the fabric joins with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// GPU collectives (NCCL).
    Nccl,
    /// TCP-based CPU collectives (Gloo).
    Gloo,
}

impl Backend {
    /// Wire name understood by transport initializers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Nccl => "nccl",
            Backend::Gloo => "gloo",
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Nccl
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a created process group.
///
/// Participants of the same collective `new_group` call observe the same
/// id, so ids can be compared across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub u64);

/// Handle to a created process group.
///
/// A plain token: it names the group and remembers its membership but
/// carries no transport state. `Clone` is cheap (the rank list is shared).
#[derive(Debug, Clone)]
pub struct GroupHandle {
    id: GroupId,
    ranks: Arc<Vec<usize>>,
}

impl GroupHandle {
    /// Create a handle for a group over `ranks` (ascending global ranks).
    pub fn new(id: GroupId, ranks: Vec<usize>) -> Self {
        debug_assert!(
            ranks.windows(2).all(|w| w[0] < w[1]),
            "group ranks must be ascending"
        );
        Self {
            id,
            ranks: Arc::new(ranks),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Member ranks, ascending.
    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    /// Number of member ranks.
    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    /// Whether `rank` is a member of this group.
    pub fn contains(&self, rank: usize) -> bool {
        self.ranks.binary_search(&rank).is_ok()
    }
}

/// Interface to the collective transport.
///
/// Methods documented as collective must be called by every participant of
/// the world in the same order; the transport blocks until all have issued
/// the call. Implementations keep whatever state they need behind interior
/// mutability, so a shared reference drives the whole sequence.
pub trait Fabric: Send + Sync {
    /// Join the global world. Collective; blocks until every participant
    /// has joined. Must precede every other call.
    fn join(&self, backend: Backend) -> Result<()>;

    /// This participant's global rank (0..world_size). Valid after `join`.
    fn self_rank(&self) -> usize;

    /// Total number of participants.
    fn world_size(&self) -> usize;

    /// Gather one value from every participant. Collective. The result is
    /// rank-ordered: index `i` holds the value contributed by global rank
    /// `i`.
    fn all_gather(&self, value: u64) -> Result<Vec<u64>>;

    /// Create a process group over `ranks`. Collective: every participant
    /// of the world must call this with the identical rank list, whether
    /// or not it is a member of the new group.
    fn new_group(&self, ranks: &[usize]) -> Result<GroupHandle>;
}
