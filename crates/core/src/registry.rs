//! Write-once registry for the group handles created during
//! initialization.
//!
//! Group creation happens exactly once per process, inside the
//! initialization sequence. [`GroupRegistry`] is the mutable holder for
//! that phase; [`GroupRegistry::finalize`] seals it into a
//! [`NodeContext`], the read-only view the rest of the process threads
//! through explicitly. There is no ambient global: whoever needs the
//! groups holds the context.
//!
//! Violations of the write-once contract are programming errors in the
//! collective call sequence, not runtime conditions, so both setters
//! panic instead of returning `Result`.

use crate::fabric::GroupHandle;
use crate::topology::Topology;

// ─── GroupRegistry ───────────────────────────────────────────────────────────

/// Init-phase holder for this process's group handles.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    intra_node: Option<IntraNode>,
    inter_node: Option<GroupHandle>,
}

#[derive(Debug)]
struct IntraNode {
    handle: GroupHandle,
    local_rank: usize,
    local_world_size: usize,
}

impl GroupRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record this process's intra-node group and node-local identity.
    ///
    /// # Panics
    /// Panics if an intra-node group was already recorded, or if
    /// `local_rank >= local_world_size`.
    pub fn set_intra_node(
        &mut self,
        handle: GroupHandle,
        local_rank: usize,
        local_world_size: usize,
    ) {
        assert!(
            self.intra_node.is_none(),
            "intra-node group already set: each process belongs to exactly one node group"
        );
        assert!(
            local_rank < local_world_size,
            "local_rank must be < local_world_size"
        );
        self.intra_node = Some(IntraNode {
            handle,
            local_rank,
            local_world_size,
        });
    }

    /// Record this process's inter-node (slot) group.
    ///
    /// # Panics
    /// Panics if an inter-node group was already recorded.
    pub fn set_inter_node(&mut self, handle: GroupHandle) {
        assert!(
            self.inter_node.is_none(),
            "inter-node group already set: each process belongs to at most one slot group"
        );
        self.inter_node = Some(handle);
    }

    /// Whether the intra-node group has been recorded.
    pub fn has_intra_node(&self) -> bool {
        self.intra_node.is_some()
    }

    /// Seal the registry into a read-only [`NodeContext`].
    ///
    /// # Panics
    /// Panics if the intra-node group was never set; every process
    /// belongs to a node.
    pub fn finalize(self, topology: Topology, model_parallel_size: usize) -> NodeContext {
        let intra = self
            .intra_node
            .expect("finalize() called before set_intra_node(): every process belongs to a node");
        NodeContext {
            local_rank: intra.local_rank,
            local_world_size: intra.local_world_size,
            intra_node: intra.handle,
            inter_node: self.inter_node,
            topology,
            model_parallel_size,
        }
    }
}

// ─── NodeContext ─────────────────────────────────────────────────────────────

/// Read-only product of a completed initialization.
///
/// Holds this process's node-local identity, the group handles it is a
/// member of, and the full derived topology. `Clone` is cheap (handles
/// share their rank lists).
#[derive(Debug, Clone)]
pub struct NodeContext {
    local_rank: usize,
    local_world_size: usize,
    intra_node: GroupHandle,
    inter_node: Option<GroupHandle>,
    topology: Topology,
    model_parallel_size: usize,
}

impl NodeContext {
    /// This process's rank on its node (0..local_world_size).
    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    /// Number of processes on this process's node.
    pub fn local_world_size(&self) -> usize {
        self.local_world_size
    }

    /// Group spanning all processes on this node.
    pub fn intra_node_group(&self) -> &GroupHandle {
        &self.intra_node
    }

    /// Group spanning this process's local-rank slot on every node.
    ///
    /// # Panics
    /// Panics on a non-uniform topology, where no slot groups exist.
    /// Guard with [`has_inter_node_group`](Self::has_inter_node_group).
    pub fn inter_node_group(&self) -> &GroupHandle {
        self.inter_node.as_ref().expect(
            "no inter-node group on a non-uniform topology: guard with has_inter_node_group()",
        )
    }

    /// Whether an inter-node group exists (uniform node sizes only).
    pub fn has_inter_node_group(&self) -> bool {
        self.inter_node.is_some()
    }

    /// The full derived topology.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Requested model-parallel group size, carried unchanged for the
    /// model-parallel initializer; nothing here consumes it.
    pub fn model_parallel_size(&self) -> usize {
        self.model_parallel_size
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
