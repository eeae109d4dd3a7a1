//! Node-aware process-group bootstrap for multi-node distributed jobs.
//!
//! A job launched by a torchrun-style launcher starts as N identical
//! processes that know only their own environment. This crate takes each
//! process from that state to a sealed [`NodeContext`]:
//!
//! 1. resolve the rendezvous environment ([`LaunchEnv`])
//! 2. join the collective fabric ([`Fabric`])
//! 3. exchange `(local_rank, local_world_size)` with every peer
//! 4. derive the node partition online ([`Topology`]), with no node
//!    identifiers on the wire
//! 5. create one group per physical node and, when node sizes are
//!    uniform, one group per local-rank slot across nodes
//!
//! # Architecture
//!
//! The transport is an external collaborator behind the [`Fabric`] trait;
//! [`LocalFabric`] simulates it in-process for development and tests.
//! Collective calls are issued in one deterministic order derived from
//! data every peer shares, and the derived topology is fingerprint-checked
//! across the world before the first group is created, so divergence
//! fails fast instead of deadlocking inside the transport.
//!
//! # Usage
//!
//! ```ignore
//! use nodemesh_core::{initialize, InitOptions};
//!
//! let opts = InitOptions::default();
//! let ctx = initialize(&opts, &fabric)?;
//! let node_group = ctx.intra_node_group();
//! if ctx.has_inter_node_group() {
//!     let slot_group = ctx.inter_node_group();
//! }
//! ```

pub mod bootstrap;
pub mod error;
pub mod fabric;
pub mod init;
pub mod registry;
pub mod topology;

pub use bootstrap::LaunchEnv;
pub use error::{MeshError, Result};
pub use fabric::{Backend, Fabric, GroupHandle, GroupId, LocalFabric};
pub use init::{initialize, initialize_with_env, InitOptions, InitStage};
pub use registry::{GroupRegistry, NodeContext};
pub use topology::{NodeGroup, Participant, SlotGroup, Topology};
