//! In-process fabric for development and tests.
//!
//! [`LocalFabric::create_world`] hands out one fabric handle per simulated
//! participant, all sharing a single in-memory world. Collectives are real
//! synchronization points over [`std::sync::Barrier`], so participants
//! must run on separate threads and issue the same calls in the same
//! order, exactly as processes over a real transport would. A world of
//! one never blocks, making every collective an identity.
//!
//! Unlike a real transport, a divergent `new_group` call sequence is
//! detected and reported as [`MeshError::CollectiveMismatch`] on every
//! participant instead of deadlocking.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex, MutexGuard};

use super::{Backend, Fabric, GroupHandle, GroupId};
use crate::error::{MeshError, Result};

/// State shared by all handles of one world.
struct WorldShared {
    barrier: Barrier,
    /// Rank-indexed publication board for `all_gather`.
    board: Mutex<Vec<u64>>,
    /// Rank-indexed rank lists proposed to the current `new_group` call.
    proposals: Mutex<Vec<Option<Vec<usize>>>>,
}

// A participant that panicked poisons the locks; the data itself stays
// valid for the survivors.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// One participant's handle onto a shared in-memory world.
pub struct LocalFabric {
    rank: usize,
    world_size: usize,
    shared: Arc<WorldShared>,
    joined: AtomicBool,
    /// Count of `new_group` calls issued through this handle. All
    /// participants issue the calls in the same order, so the count is
    /// identical across handles and doubles as the deterministic group id.
    group_seq: AtomicU64,
}

impl LocalFabric {
    /// Create `world_size` handles over one shared world, indexed by rank.
    ///
    /// # Panics
    /// Panics if `world_size == 0`.
    pub fn create_world(world_size: usize) -> Vec<LocalFabric> {
        assert!(world_size > 0, "world_size must be > 0");
        let shared = Arc::new(WorldShared {
            barrier: Barrier::new(world_size),
            board: Mutex::new(vec![0; world_size]),
            proposals: Mutex::new(vec![None; world_size]),
        });
        (0..world_size)
            .map(|rank| LocalFabric {
                rank,
                world_size,
                shared: Arc::clone(&shared),
                joined: AtomicBool::new(false),
                group_seq: AtomicU64::new(0),
            })
            .collect()
    }
}

impl Fabric for LocalFabric {
    fn join(&self, backend: Backend) -> Result<()> {
        if self.joined.swap(true, Ordering::SeqCst) {
            return Err(MeshError::Fabric(format!(
                "rank {} already joined this world",
                self.rank
            )));
        }
        self.shared.barrier.wait();
        tracing::debug!(
            rank = self.rank,
            world_size = self.world_size,
            backend = %backend,
            "joined local world"
        );
        Ok(())
    }

    fn self_rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, value: u64) -> Result<Vec<u64>> {
        lock(&self.shared.board)[self.rank] = value;
        // First barrier: everyone has published. Second barrier: everyone
        // has read, so the board may be reused by the next collective.
        self.shared.barrier.wait();
        let gathered = lock(&self.shared.board).clone();
        self.shared.barrier.wait();
        Ok(gathered)
    }

    fn new_group(&self, ranks: &[usize]) -> Result<GroupHandle> {
        debug_assert!(!ranks.is_empty(), "group must have at least one member");
        debug_assert!(
            ranks.iter().all(|&r| r < self.world_size),
            "group rank out of range"
        );

        let seq = self.group_seq.fetch_add(1, Ordering::SeqCst);

        lock(&self.shared.proposals)[self.rank] = Some(ranks.to_vec());
        self.shared.barrier.wait();
        let mismatch = {
            let proposals = lock(&self.shared.proposals);
            proposals.iter().enumerate().find_map(|(peer, proposal)| {
                match proposal {
                    Some(theirs) if theirs.as_slice() != ranks => Some(format!(
                        "new_group call {seq}: rank {peer} passed {theirs:?}, rank {} passed {ranks:?}",
                        self.rank
                    )),
                    None => Some(format!(
                        "new_group call {seq}: rank {peer} did not publish a rank list"
                    )),
                    _ => None,
                }
            })
        };
        self.shared.barrier.wait();

        match mismatch {
            Some(msg) => Err(MeshError::CollectiveMismatch(msg)),
            None => Ok(GroupHandle::new(GroupId(seq), ranks.to_vec())),
        }
    }
}
