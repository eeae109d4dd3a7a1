//! Error types for bootstrap and group formation.

use thiserror::Error;

/// Errors that can occur while bootstrapping a distributed job.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Launcher variables required from this point on were never set.
    #[error("required launch variables not set by launcher: {missing:?}")]
    MissingLaunchVar { missing: Vec<&'static str> },

    /// This process's declared local rank is outside its node's size.
    #[error("invalid local_rank {local_rank}: must be < local_world_size {local_world_size}")]
    InvalidLocalRank {
        local_rank: usize,
        local_world_size: usize,
    },

    /// A participant declared a node size of zero.
    #[error("rank {rank} declared local_world_size = 0")]
    InvalidLocalWorldSize { rank: usize },

    /// Two ranks placed on the same node disagree about its size.
    #[error("rank {rank} declared local_world_size {actual}, its node started with {expected}")]
    LocalWorldSizeMismatch {
        rank: usize,
        expected: usize,
        actual: usize,
    },

    /// A rank's local rank does not match its position within its node.
    #[error(
        "rank {rank} has local_rank {actual}, expected {expected}: \
         ranks of one node must be contiguous and locally ascending"
    )]
    NonContiguousPlacement {
        rank: usize,
        expected: usize,
        actual: usize,
    },

    /// A node ended with fewer ranks than its members declared.
    #[error("node {node} holds {actual} ranks but its members declared local_world_size {declared}")]
    IncompleteNode {
        node: usize,
        declared: usize,
        actual: usize,
    },

    /// The gathered record sequence was empty.
    #[error("topology requires at least one participant")]
    EmptyWorld,

    /// A peer derived a different topology from the gathered records.
    #[error(
        "topology divergence: rank {rank} fingerprinted {theirs:#018x}, this rank {ours:#018x}"
    )]
    TopologyDivergence { rank: usize, ours: u64, theirs: u64 },

    /// Participants issued mismatching collective calls.
    #[error("collective mismatch: {0}")]
    CollectiveMismatch(String),

    /// The underlying fabric reported a failure.
    #[error("fabric error: {0}")]
    Fabric(String),
}

pub type Result<T> = std::result::Result<T, MeshError>;
