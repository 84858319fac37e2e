//! Vault configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Tunables for a vault process.
///
/// Loading this from a file or the environment is the embedding
/// application's job; the struct with its defaults is the contract. The
/// lease and sweep values are deliberately conservative defaults, not
/// canonical numbers.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Root directory for filesystem-backed object storage.
    pub data_dir: PathBuf,
    /// Path of the SQLite database file.
    pub db_path: PathBuf,
    /// Number of concurrent ingest pipeline workers.
    pub ingest_workers: usize,
    /// Depth of the ingest event queue.
    pub ingest_queue_depth: usize,
    /// Number of concurrent task workers on this node.
    pub task_workers: usize,
    /// Buffers below this size stay on the heap; larger ones spill to disk.
    pub spill_threshold: usize,
    /// Seconds an in-progress claim is honored before the sweep may reclaim it.
    pub claim_lease_secs: u64,
    /// Seconds between stale-claim sweep passes.
    pub sweep_interval_secs: u64,
    /// Seconds after which a silent node is considered gone.
    pub node_timeout_secs: u64,
    /// Milliseconds between notification-fallback polls.
    pub poll_interval_millis: u64,
    /// Retryable failures beyond this count park the task as dead.
    pub max_retries: u32,
    /// Cap on concurrently running ingest tasks, applied through the
    /// `ingest` resource.
    pub ingest_concurrency: Option<u32>,
}

impl VaultConfig {
    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        VaultConfig {
            data_dir: PathBuf::from("vault-data"),
            db_path: PathBuf::from("vault-data/vault.db"),
            ingest_workers: 4,
            ingest_queue_depth: 256,
            task_workers: 4,
            spill_threshold: crate::object::DEFAULT_SPILL_THRESHOLD,
            claim_lease_secs: 300,
            sweep_interval_secs: 30,
            node_timeout_secs: 600,
            poll_interval_millis: 500,
            max_retries: 3,
            ingest_concurrency: Some(8),
        }
    }
}
