//! Launch environment resolution.
//!
//! Launchers in the torchrun convention hand each process its identity and
//! the rendezvous endpoint through environment variables:
//!
//! - `MASTER_ADDR`: address of the rank-0 host (default: 127.0.0.1)
//! - `MASTER_PORT`: rendezvous port (defaulted when absent)
//! - `RANK`: global rank of this process (0..WORLD_SIZE)
//! - `WORLD_SIZE`: total number of processes
//! - `LOCAL_RANK`: rank of this process on its node
//! - `LOCAL_WORLD_SIZE`: number of processes on this node
//!
//! [`LaunchEnv::resolve`] reads them all, fills the two rendezvous values
//! with defaults when the launcher left them unset, and reports (without
//! failing) whichever identity values are missing. Resolution only
//! diagnoses; joining the fabric is the hard gate.

use std::env;

/// Resolved launch environment of one process.
///
/// The rendezvous pair is always present after [`resolve`](Self::resolve);
/// the identity values stay `None` when the launcher did not provide them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEnv {
    /// Address of the rank-0 host.
    pub master_addr: String,
    /// Rendezvous port.
    pub master_port: u16,
    /// Global rank, if the launcher provided it.
    pub rank: Option<usize>,
    /// Total process count, if the launcher provided it.
    pub world_size: Option<usize>,
    /// Rank on the owning node, if the launcher provided it.
    pub local_rank: Option<usize>,
    /// Process count on the owning node, if the launcher provided it.
    pub local_world_size: Option<usize>,
}

impl LaunchEnv {
    /// Read the launch environment, defaulting the rendezvous values.
    ///
    /// Never fails: identity variables the launcher did not set stay
    /// `None` and are listed by [`missing`](Self::missing). An unparsable
    /// value is diagnosed the same as an absent one.
    pub fn resolve(default_port: u16) -> Self {
        let master_addr = match env::var("MASTER_ADDR") {
            Ok(addr) => addr,
            Err(_) => {
                tracing::warn!("MASTER_ADDR not set by launcher, defaulting to 127.0.0.1");
                "127.0.0.1".to_string()
            }
        };

        let master_port = match env::var("MASTER_PORT").ok().and_then(|s| s.parse().ok()) {
            Some(port) => {
                tracing::info!(port, "using MASTER_PORT set by launcher");
                port
            }
            None => {
                tracing::info!(port = default_port, "MASTER_PORT not set by launcher, using default");
                default_port
            }
        };

        let resolved = Self {
            master_addr,
            master_port,
            rank: read_usize("RANK"),
            world_size: read_usize("WORLD_SIZE"),
            local_rank: read_usize("LOCAL_RANK"),
            local_world_size: read_usize("LOCAL_WORLD_SIZE"),
        };

        let missing = resolved.missing();
        if !missing.is_empty() {
            tracing::error!(
                ?missing,
                "required environment variables not set by launcher; \
                 use a distributed launcher such as torchrun"
            );
        }
        resolved
    }

    /// Identity variables the launcher did not provide, in a fixed order.
    pub fn missing(&self) -> Vec<&'static str> {
        [
            ("RANK", self.rank),
            ("WORLD_SIZE", self.world_size),
            ("LOCAL_RANK", self.local_rank),
            ("LOCAL_WORLD_SIZE", self.local_world_size),
        ]
        .iter()
        .filter(|(_, value)| value.is_none())
        .map(|(name, _)| *name)
        .collect()
    }

    /// Write the resolved rendezvous pair back into the process
    /// environment, for transports that read it there.
    pub fn export(&self) {
        env::set_var("MASTER_ADDR", &self.master_addr);
        env::set_var("MASTER_PORT", self.master_port.to_string());
    }
}

fn read_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}
