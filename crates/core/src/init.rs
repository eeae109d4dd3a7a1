//! Initialization orchestrator.
//!
//! Drives one process from its launch environment to a sealed
//! [`NodeContext`]: validate identity, join the fabric, exchange
//! `(local_rank, local_world_size)` with every peer, derive the topology,
//! cross-check it, and create the node and slot groups in a fixed order.
//!
//! Every call into the fabric is collective: all processes must reach the
//! same calls in the same order. The orchestrator therefore derives its
//! entire call sequence from data all peers share (the gathered records),
//! and verifies the derived topology with a fingerprint gather before the
//! first `new_group` call, so a divergent peer surfaces as an error
//! instead of a deadlock inside the transport.

use serde::{Deserialize, Serialize};

use crate::bootstrap::LaunchEnv;
use crate::error::{MeshError, Result};
use crate::fabric::{Backend, Fabric};
use crate::registry::{GroupRegistry, NodeContext};
use crate::topology::{Participant, Topology};

// ─── Options ─────────────────────────────────────────────────────────────────

/// Options for [`initialize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitOptions {
    /// Collective backend to join the fabric with.
    pub backend: Backend,
    /// Rendezvous port used when the launcher did not set `MASTER_PORT`.
    pub default_port: u16,
    /// Model-parallel group size, carried through to [`NodeContext`] for
    /// the model-parallel initializer; this crate does not consume it.
    pub model_parallel_size: usize,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            backend: Backend::Nccl,
            default_port: 29500,
            model_parallel_size: 1,
        }
    }
}

// ─── Stages ──────────────────────────────────────────────────────────────────

/// Progress of one process through initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    /// Nothing has run yet.
    Unstarted,
    /// Launch environment resolved and identity validated.
    BootstrapResolved,
    /// Fabric joined; rank and world size are authoritative.
    FabricJoined,
    /// Peer records gathered and topology derived.
    TopologyExchanged,
    /// Node and slot groups created.
    GroupsCreated,
    /// Context sealed; initialization finished.
    Ready,
    /// Initialization failed; the process must not continue.
    Aborted,
}

impl InitStage {
    /// Whether initialization can make no further progress from here.
    pub fn is_terminal(self) -> bool {
        matches!(self, InitStage::Ready | InitStage::Aborted)
    }
}

fn advance(stage: &mut InitStage, to: InitStage) {
    tracing::debug!(from = ?stage, to = ?to, "initialization stage");
    *stage = to;
}

// ─── Entry points ────────────────────────────────────────────────────────────

/// Initialize this process against `fabric`, resolving the launch
/// environment from the process environment and exporting the rendezvous
/// pair back to it.
///
/// Collective: every process of the job must call this (or
/// [`initialize_with_env`]) concurrently, with equal options.
pub fn initialize(opts: &InitOptions, fabric: &dyn Fabric) -> Result<NodeContext> {
    let env = LaunchEnv::resolve(opts.default_port);
    env.export();
    initialize_with_env(opts, env, fabric)
}

/// Initialize with a launch environment the caller already resolved.
///
/// Entry point for launchers that compute the environment themselves, and
/// for simulated worlds where participants cannot share one process
/// environment. [`initialize`] is the thin wrapper that resolves and
/// exports first.
pub fn initialize_with_env(
    opts: &InitOptions,
    env: LaunchEnv,
    fabric: &dyn Fabric,
) -> Result<NodeContext> {
    let mut stage = InitStage::Unstarted;
    let result = run(opts, &env, fabric, &mut stage);
    if let Err(e) = &result {
        tracing::error!(reached = ?stage, error = %e, "initialization aborted");
        stage = InitStage::Aborted;
    }
    debug_assert!(stage.is_terminal());
    result
}

// ─── Sequence ────────────────────────────────────────────────────────────────

fn run(
    opts: &InitOptions,
    env: &LaunchEnv,
    fabric: &dyn Fabric,
    stage: &mut InitStage,
) -> Result<NodeContext> {
    // Own identity first: a process with a broken environment must not
    // join, or its peers would hang waiting for its next collective.
    let (local_rank, local_world_size) = match (env.local_rank, env.local_world_size) {
        (Some(local_rank), Some(local_world_size)) => (local_rank, local_world_size),
        _ => {
            let missing: Vec<&'static str> = env
                .missing()
                .into_iter()
                .filter(|name| matches!(*name, "LOCAL_RANK" | "LOCAL_WORLD_SIZE"))
                .collect();
            return Err(MeshError::MissingLaunchVar { missing });
        }
    };
    if local_world_size == 0 {
        return Err(MeshError::InvalidLocalWorldSize {
            rank: env.rank.unwrap_or(0),
        });
    }
    if local_rank >= local_world_size {
        return Err(MeshError::InvalidLocalRank {
            local_rank,
            local_world_size,
        });
    }
    advance(stage, InitStage::BootstrapResolved);

    fabric.join(opts.backend)?;
    let rank = fabric.self_rank();
    let world_size = fabric.world_size();
    advance(stage, InitStage::FabricJoined);
    tracing::info!(
        rank,
        world_size,
        local_rank,
        local_world_size,
        backend = %opts.backend,
        "fabric joined"
    );

    // The fabric is authoritative for global identity after the join.
    if let Some(env_rank) = env.rank {
        if env_rank != rank {
            tracing::warn!(env_rank, fabric_rank = rank, "RANK disagrees with the joined fabric");
        }
    }
    if let Some(env_world) = env.world_size {
        if env_world != world_size {
            tracing::warn!(
                env_world,
                fabric_world = world_size,
                "WORLD_SIZE disagrees with the joined fabric"
            );
        }
    }

    // Two gathers in a fixed order on every process; the gathered vectors
    // are rank-indexed.
    let local_ranks = fabric.all_gather(local_rank as u64)?;
    let local_world_sizes = fabric.all_gather(local_world_size as u64)?;
    let records: Vec<Participant> = local_ranks
        .iter()
        .zip(&local_world_sizes)
        .enumerate()
        .map(|(global_rank, (&lr, &lws))| Participant {
            global_rank,
            local_rank: lr as usize,
            local_world_size: lws as usize,
        })
        .collect();

    let topology = Topology::build(&records)?;
    advance(stage, InitStage::TopologyExchanged);

    // Cross-check before the first new_group call: a peer that derived a
    // different topology would issue different collectives and deadlock
    // everyone inside the transport.
    let ours = topology.fingerprint();
    let fingerprints = fabric.all_gather(ours)?;
    if let Some((peer, &theirs)) = fingerprints
        .iter()
        .enumerate()
        .find(|(_, &fingerprint)| fingerprint != ours)
    {
        return Err(MeshError::TopologyDivergence {
            rank: peer,
            ours,
            theirs,
        });
    }

    // Every process issues every new_group call; only members keep the
    // handle. Nodes first in ascending order, then slots in ascending
    // order.
    let mut registry = GroupRegistry::new();
    for node in &topology.nodes {
        let handle = fabric.new_group(&node.ranks)?;
        if node.contains(rank) {
            registry.set_intra_node(handle, local_rank, local_world_size);
        }
    }
    if let Some(slots) = &topology.slots {
        for slot_group in slots {
            let handle = fabric.new_group(&slot_group.ranks)?;
            if slot_group.slot == local_rank {
                registry.set_inter_node(handle);
            }
        }
    }
    advance(stage, InitStage::GroupsCreated);

    let nodes = topology.node_count();
    let slots = topology.slots.as_ref().map_or(0, Vec::len);
    let ctx = registry.finalize(topology, opts.model_parallel_size);
    advance(stage, InitStage::Ready);
    tracing::info!(rank, local_rank, nodes, slots, "initialization complete");
    Ok(ctx)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::fabric::{GroupHandle, GroupId, LocalFabric};

    fn launch_env(rank: usize, world: usize, local_rank: usize, local_world: usize) -> LaunchEnv {
        LaunchEnv {
            master_addr: "127.0.0.1".to_string(),
            master_port: 29500,
            rank: Some(rank),
            world_size: Some(world),
            local_rank: Some(local_rank),
            local_world_size: Some(local_world),
        }
    }

    /// Fabric that impersonates one rank of a larger world: gathers are
    /// answered from a script (falling back to echo once the script is
    /// drained) and created groups are recorded for inspection.
    struct ScriptedFabric {
        rank: usize,
        world_size: usize,
        gathers: Mutex<VecDeque<Vec<u64>>>,
        created: Mutex<Vec<Vec<usize>>>,
    }

    impl ScriptedFabric {
        fn new(rank: usize, world_size: usize, gathers: Vec<Vec<u64>>) -> Self {
            Self {
                rank,
                world_size,
                gathers: Mutex::new(gathers.into()),
                created: Mutex::new(Vec::new()),
            }
        }

        fn created_groups(&self) -> Vec<Vec<usize>> {
            self.created.lock().unwrap().clone()
        }
    }

    impl Fabric for ScriptedFabric {
        fn join(&self, _backend: Backend) -> Result<()> {
            Ok(())
        }

        fn self_rank(&self) -> usize {
            self.rank
        }

        fn world_size(&self) -> usize {
            self.world_size
        }

        fn all_gather(&self, value: u64) -> Result<Vec<u64>> {
            match self.gathers.lock().unwrap().pop_front() {
                Some(scripted) => Ok(scripted),
                None => Ok(vec![value; self.world_size]),
            }
        }

        fn new_group(&self, ranks: &[usize]) -> Result<GroupHandle> {
            let mut created = self.created.lock().unwrap();
            let id = created.len() as u64;
            created.push(ranks.to_vec());
            Ok(GroupHandle::new(GroupId(id), ranks.to_vec()))
        }
    }

    /// Fabric whose third gather (the fingerprint round) reports a peer
    /// with a different value.
    struct TamperedFabric {
        world_size: usize,
        gather_calls: AtomicUsize,
    }

    impl Fabric for TamperedFabric {
        fn join(&self, _backend: Backend) -> Result<()> {
            Ok(())
        }

        fn self_rank(&self) -> usize {
            0
        }

        fn world_size(&self) -> usize {
            self.world_size
        }

        fn all_gather(&self, value: u64) -> Result<Vec<u64>> {
            let call = self.gather_calls.fetch_add(1, Ordering::SeqCst);
            let mut gathered = vec![value; self.world_size];
            if call == 2 {
                gathered[1] ^= 1;
            }
            Ok(gathered)
        }

        fn new_group(&self, _ranks: &[usize]) -> Result<GroupHandle> {
            panic!("new_group must not be reached after a divergent fingerprint");
        }
    }

    // ── options ─────────────────────────────────────────────────────────────

    #[test]
    fn default_options() {
        let opts = InitOptions::default();
        assert_eq!(opts.backend, Backend::Nccl);
        assert_eq!(opts.default_port, 29500);
        assert_eq!(opts.model_parallel_size, 1);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: InitOptions = serde_json::from_str(r#"{"backend":"gloo"}"#).unwrap();
        assert_eq!(opts.backend, Backend::Gloo);
        assert_eq!(opts.default_port, 29500);
        assert_eq!(opts.model_parallel_size, 1);
    }

    #[test]
    fn options_round_trip() {
        let opts = InitOptions {
            backend: Backend::Gloo,
            default_port: 12345,
            model_parallel_size: 2,
        };
        let json = serde_json::to_string(&opts).unwrap();
        let back: InitOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, opts);
    }

    // ── stages ──────────────────────────────────────────────────────────────

    #[test]
    fn only_ready_and_aborted_are_terminal() {
        assert!(InitStage::Ready.is_terminal());
        assert!(InitStage::Aborted.is_terminal());
        for stage in [
            InitStage::Unstarted,
            InitStage::BootstrapResolved,
            InitStage::FabricJoined,
            InitStage::TopologyExchanged,
            InitStage::GroupsCreated,
        ] {
            assert!(!stage.is_terminal(), "{stage:?}");
        }
    }

    // ── single-participant world over the local fabric ──────────────────────

    #[test]
    fn single_world_initializes_fully() {
        let fabric = LocalFabric::create_world(1).remove(0);
        let ctx =
            initialize_with_env(&InitOptions::default(), launch_env(0, 1, 0, 1), &fabric).unwrap();

        assert_eq!(ctx.local_rank(), 0);
        assert_eq!(ctx.local_world_size(), 1);
        assert_eq!(ctx.intra_node_group().ranks(), &[0]);
        assert!(ctx.has_inter_node_group());
        assert_eq!(ctx.inter_node_group().ranks(), &[0]);
        assert_eq!(ctx.topology().node_count(), 1);
        assert!(ctx.topology().is_uniform());
    }

    // ── identity validation before any collective ───────────────────────────

    #[test]
    fn missing_local_identity_is_fatal() {
        let fabric = LocalFabric::create_world(1).remove(0);
        let mut env = launch_env(0, 1, 0, 1);
        env.local_rank = None;
        env.local_world_size = None;

        let err = initialize_with_env(&InitOptions::default(), env, &fabric).unwrap_err();
        match err {
            MeshError::MissingLaunchVar { missing } => {
                assert_eq!(missing, vec!["LOCAL_RANK", "LOCAL_WORLD_SIZE"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn out_of_range_local_rank_is_fatal() {
        let fabric = LocalFabric::create_world(1).remove(0);
        let mut env = launch_env(0, 1, 0, 1);
        env.local_rank = Some(3);
        env.local_world_size = Some(2);

        let err = initialize_with_env(&InitOptions::default(), env, &fabric).unwrap_err();
        assert!(matches!(
            err,
            MeshError::InvalidLocalRank {
                local_rank: 3,
                local_world_size: 2,
            }
        ));
    }

    #[test]
    fn zero_local_world_size_is_fatal() {
        let fabric = LocalFabric::create_world(1).remove(0);
        let mut env = launch_env(0, 1, 0, 1);
        env.local_world_size = Some(0);

        let err = initialize_with_env(&InitOptions::default(), env, &fabric).unwrap_err();
        assert!(matches!(err, MeshError::InvalidLocalWorldSize { rank: 0 }));
    }

    #[test]
    fn world_size_disagreement_is_not_fatal() {
        // The env claims a different world; the fabric wins with a warning.
        let fabric = LocalFabric::create_world(1).remove(0);
        let env = launch_env(0, 99, 0, 1);
        assert!(initialize_with_env(&InitOptions::default(), env, &fabric).is_ok());
    }

    // ── collective call order over a scripted world ─────────────────────────

    #[test]
    fn groups_are_created_nodes_first_then_slots() {
        // Rank 1 of a 2x2 world: nodes {0,1} and {2,3}, slots {0,2} and
        // {1,3}. Every group is created; membership lands on two of them.
        let fabric = ScriptedFabric::new(1, 4, vec![vec![0, 1, 0, 1], vec![2, 2, 2, 2]]);
        let ctx =
            initialize_with_env(&InitOptions::default(), launch_env(1, 4, 1, 2), &fabric).unwrap();

        assert_eq!(
            fabric.created_groups(),
            vec![vec![0, 1], vec![2, 3], vec![0, 2], vec![1, 3]]
        );
        assert_eq!(ctx.intra_node_group().ranks(), &[0, 1]);
        assert_eq!(ctx.inter_node_group().ranks(), &[1, 3]);
        assert_eq!(ctx.intra_node_group().id(), GroupId(0));
        assert_eq!(ctx.inter_node_group().id(), GroupId(3));
    }

    #[test]
    fn membership_follows_node_and_slot_of_the_rank() {
        // Rank 2 of the same 2x2 world sits on the second node, slot 0.
        let fabric = ScriptedFabric::new(2, 4, vec![vec![0, 1, 0, 1], vec![2, 2, 2, 2]]);
        let ctx =
            initialize_with_env(&InitOptions::default(), launch_env(2, 4, 0, 2), &fabric).unwrap();

        assert_eq!(ctx.intra_node_group().ranks(), &[2, 3]);
        assert_eq!(ctx.inter_node_group().ranks(), &[0, 2]);
    }

    #[test]
    fn non_uniform_world_creates_no_slot_groups() {
        // 4+2 world seen from rank 4 (first rank of the small node).
        let fabric = ScriptedFabric::new(
            4,
            6,
            vec![vec![0, 1, 2, 3, 0, 1], vec![4, 4, 4, 4, 2, 2]],
        );
        let ctx =
            initialize_with_env(&InitOptions::default(), launch_env(4, 6, 0, 2), &fabric).unwrap();

        assert_eq!(
            fabric.created_groups(),
            vec![vec![0, 1, 2, 3], vec![4, 5]]
        );
        assert_eq!(ctx.intra_node_group().ranks(), &[4, 5]);
        assert!(!ctx.has_inter_node_group());
    }

    #[test]
    fn gathered_inconsistency_surfaces_from_the_builder() {
        // Peer 2 claims a different node size than its node started with.
        let fabric = ScriptedFabric::new(0, 4, vec![vec![0, 1, 2, 3], vec![4, 4, 2, 4]]);
        let err = initialize_with_env(&InitOptions::default(), launch_env(0, 4, 0, 4), &fabric)
            .unwrap_err();
        assert!(matches!(
            err,
            MeshError::LocalWorldSizeMismatch {
                rank: 2,
                expected: 4,
                actual: 2,
            }
        ));
        assert!(fabric.created_groups().is_empty());
    }

    // ── fingerprint cross-check ─────────────────────────────────────────────

    #[test]
    fn divergent_fingerprint_aborts_before_group_creation() {
        let fabric = TamperedFabric {
            world_size: 2,
            gather_calls: AtomicUsize::new(0),
        };
        let err = initialize_with_env(&InitOptions::default(), launch_env(0, 2, 0, 1), &fabric)
            .unwrap_err();
        match err {
            MeshError::TopologyDivergence { rank, ours, theirs } => {
                assert_eq!(rank, 1);
                assert_eq!(theirs, ours ^ 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
