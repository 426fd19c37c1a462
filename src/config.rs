//! Gateway-wide tuning knobs: freshness budgets, the connection pool,
//! retry/timeout caps, and the volume block size.

/// How aggressively the consistency layer refreshes metadata before serving
/// reads and writes. Mirrors the `SyncMode` idiom of a storage-engine config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessPolicy {
    /// Refresh on every access if the TTL is zero; otherwise obey the TTL.
    Default,
    /// Favor availability: wider TTLs, fewer coordinator round-trips.
    LowLatency,
    /// Favor correctness: near-zero TTLs, always validate with the coordinator.
    HighDurability,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Default block size for a volume (bytes); `aligned()` partitions against this.
    pub block_size: u64,
    /// Read freshness TTL: `now - refresh_time > max_read_freshness_ms` forces a refresh.
    pub max_read_freshness_ms: u64,
    /// Write freshness TTL: same predicate, applied before a write.
    pub max_write_freshness_ms: u64,
    /// Per-transfer network timeout (default: 25s).
    pub transfer_timeout_ms: u64,
    /// Per-component retry cap before remote-I/O/timeout becomes terminal (default: 5).
    pub retry_cap: u32,
    /// Gateway-wide connection budget shared by replication and download loops (default: 100).
    pub connection_budget: usize,
    /// Bounded concurrency per RG during chunk fan-out (default: 6).
    pub fanout_concurrency_per_rg: usize,
    /// Bounded concurrency for the read-path download loop (default: min(this, request count)).
    pub read_download_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 1024 * 1024,
            max_read_freshness_ms: 5000,
            max_write_freshness_ms: 5000,
            transfer_timeout_ms: 25_000,
            retry_cap: 5,
            connection_budget: 100,
            fanout_concurrency_per_rg: 6,
            read_download_concurrency: 10,
        }
    }
}

impl Config {
    /// Wide TTLs and a large connection budget; fewer round-trips to the MS/coordinator.
    pub fn low_latency() -> Self {
        Self {
            max_read_freshness_ms: 30_000,
            max_write_freshness_ms: 30_000,
            transfer_timeout_ms: 10_000,
            retry_cap: 3,
            connection_budget: 200,
            fanout_concurrency_per_rg: 12,
            read_download_concurrency: 20,
            ..Self::default()
        }
    }

    /// Near-zero TTLs: every read/write re-validates with the coordinator.
    pub fn high_durability() -> Self {
        Self {
            max_read_freshness_ms: 0,
            max_write_freshness_ms: 0,
            transfer_timeout_ms: 30_000,
            retry_cap: 8,
            connection_budget: 50,
            fanout_concurrency_per_rg: 4,
            read_download_concurrency: 5,
            ..Self::default()
        }
    }

    pub fn for_policy(policy: FreshnessPolicy) -> Self {
        match policy {
            FreshnessPolicy::Default => Self::default(),
            FreshnessPolicy::LowLatency => Self::low_latency(),
            FreshnessPolicy::HighDurability => Self::high_durability(),
        }
    }
}
