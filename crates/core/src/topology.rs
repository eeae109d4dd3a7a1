//! Topology derivation from gathered participant records.
//!
//! No node identifiers cross the wire during bootstrap. Each process
//! contributes only its `(local_rank, local_world_size)` pair, and every
//! process reconstructs the node partition from the rank-ordered sequence
//! of those pairs.
//!
//! # Algorithm
//!
//! Records are scanned in ascending global-rank order. Ranks accumulate
//! into the current node; a new node begins exactly when the current node
//! holds as many ranks as the previous record declared its node to hold.
//! Within a node every member must declare the same size and local ranks
//! must ascend from 0. When all nodes declare one common size `W`, slot
//! `i` additionally collects the rank at local-rank `i` of every node,
//! giving `W` cross-node groups of stride `W`.
//!
//! The derivation is a pure function of the records, so every process
//! that gathered the same sequence derives the identical topology. That
//! determinism is what lets the orchestrator issue group-creation calls
//! without any further coordination, and [`Topology::fingerprint`] is the
//! cheap cross-check that it actually held.

use sha2::{Digest, Sha256};

use crate::error::{MeshError, Result};

// ─── Records ─────────────────────────────────────────────────────────────────

/// One process's contribution to the topology exchange.
///
/// `global_rank` equals the record's index in the gathered sequence; it is
/// carried explicitly so diagnostics can name the offending rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    /// Global rank (0..world_size).
    pub global_rank: usize,
    /// Position on the owning node (0..local_world_size).
    pub local_rank: usize,
    /// Number of processes the owning node hosts.
    pub local_world_size: usize,
}

// ─── Groups ──────────────────────────────────────────────────────────────────

/// All ranks hosted by one physical node.
///
/// Ranks are ascending and contiguous in global-rank space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeGroup {
    pub ranks: Vec<usize>,
}

impl NodeGroup {
    /// Number of processes on this node.
    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    /// Whether `rank` is hosted by this node.
    pub fn contains(&self, rank: usize) -> bool {
        self.ranks.binary_search(&rank).is_ok()
    }
}

/// The rank at local-rank `slot` of every node.
///
/// Slot groups exist only when all nodes host the same number of
/// processes; their ranks are then strided by that common size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotGroup {
    /// The shared local rank of the members.
    pub slot: usize,
    /// Member ranks, ascending (one per node).
    pub ranks: Vec<usize>,
}

// ─── Topology ────────────────────────────────────────────────────────────────

/// The derived shape of the world: its node partition and, for uniform
/// shapes, its cross-node slot partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// One group per physical node, in ascending rank order.
    pub nodes: Vec<NodeGroup>,
    /// One group per local-rank slot; `None` when node sizes differ.
    pub slots: Option<Vec<SlotGroup>>,
}

impl Topology {
    /// Derive the topology from rank-ordered participant records.
    ///
    /// Deterministic: identical input produces an identical topology on
    /// every process. Every failure names the first offending rank, so
    /// logs from different processes agree on the diagnosis.
    pub fn build(records: &[Participant]) -> Result<Topology> {
        if records.is_empty() {
            return Err(MeshError::EmptyWorld);
        }
        for rec in records {
            if rec.local_world_size == 0 {
                return Err(MeshError::InvalidLocalWorldSize {
                    rank: rec.global_rank,
                });
            }
        }

        // Scan: close the current node once it holds as many ranks as its
        // members declared, otherwise the record must agree with its
        // predecessor about the node size and sit at the next local rank.
        let mut nodes: Vec<NodeGroup> = Vec::new();
        let mut current: Vec<usize> = Vec::new();
        for (i, rec) in records.iter().enumerate() {
            debug_assert_eq!(rec.global_rank, i, "records must be rank-ordered");
            if i > 0 {
                let prev = &records[i - 1];
                if current.len() == prev.local_world_size {
                    nodes.push(NodeGroup {
                        ranks: std::mem::take(&mut current),
                    });
                } else if rec.local_world_size != prev.local_world_size {
                    return Err(MeshError::LocalWorldSizeMismatch {
                        rank: i,
                        expected: prev.local_world_size,
                        actual: rec.local_world_size,
                    });
                }
            }
            if rec.local_rank != current.len() {
                return Err(MeshError::NonContiguousPlacement {
                    rank: i,
                    expected: current.len(),
                    actual: rec.local_rank,
                });
            }
            current.push(i);
        }
        nodes.push(NodeGroup { ranks: current });

        // Every node must have filled up to its declared size; only the
        // trailing node can fall short, but the check is cheap for all.
        for (node_idx, node) in nodes.iter().enumerate() {
            let declared = records[node.ranks[0]].local_world_size;
            if node.size() != declared {
                return Err(MeshError::IncompleteNode {
                    node: node_idx,
                    declared,
                    actual: node.size(),
                });
            }
        }

        let min_size = records.iter().map(|r| r.local_world_size).min();
        let max_size = records.iter().map(|r| r.local_world_size).max();
        let slots = if min_size == max_size {
            let width = records[0].local_world_size;
            Some(
                (0..width)
                    .map(|slot| SlotGroup {
                        slot,
                        ranks: (slot..records.len()).step_by(width).collect(),
                    })
                    .collect(),
            )
        } else {
            tracing::debug!(
                nodes = nodes.len(),
                "node sizes are not uniform, skipping slot groups"
            );
            None
        };

        Ok(Topology { nodes, slots })
    }

    /// Total number of participants.
    pub fn world_size(&self) -> usize {
        self.nodes.iter().map(NodeGroup::size).sum()
    }

    /// Number of physical nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Whether all nodes host the same number of processes.
    pub fn is_uniform(&self) -> bool {
        self.slots.is_some()
    }

    /// Index of the node hosting `global_rank`, if it is in the world.
    pub fn node_of(&self, global_rank: usize) -> Option<usize> {
        self.nodes.iter().position(|n| n.contains(global_rank))
    }

    /// Deterministic digest of the derived topology.
    ///
    /// Two processes that derived the same node partition and slot layout
    /// produce the same value; any difference in either changes it. Group
    /// boundaries are length-framed into the digest so that, for example,
    /// nodes `[0,1],[2]` and `[0],[1,2]` cannot collide.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(b"nodes:");
        hasher.update((self.nodes.len() as u64).to_le_bytes());
        for node in &self.nodes {
            hasher.update((node.size() as u64).to_le_bytes());
            for &rank in &node.ranks {
                hasher.update((rank as u64).to_le_bytes());
            }
        }
        match &self.slots {
            Some(slots) => {
                hasher.update(b"slots:");
                hasher.update((slots.len() as u64).to_le_bytes());
            }
            None => hasher.update(b"no-slots"),
        }
        let digest = hasher.finalize();
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(first)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
