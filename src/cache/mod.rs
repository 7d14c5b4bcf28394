//! The public operation surface: Get/Set/Add/Replace/Cas/Delete/Touch/
//! Incr/Decr/Append/Prepend/FlushAll/Stats, dispatched via the router to
//! one of a fixed number of shards.

pub mod entry;
pub mod router;
pub mod shard;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::clock::StartClock;
use crate::error::Result;
use shard::{AggregatedStats, Shard};

pub struct Cache {
    shards: Vec<Shard>,
    start: StartClock,
    limit_maxbytes: usize,
    curr_connections: Arc<AtomicUsize>,
}

impl Cache {
    /// Builds a cache with `shard_count` shards, each budgeted
    /// `total_max_bytes / shard_count` bytes (`0` disables eviction).
    pub fn new(shard_count: usize, total_max_bytes: usize, curr_connections: Arc<AtomicUsize>) -> Self {
        assert!(shard_count > 0, "shard_count must be positive");
        let per_shard = total_max_bytes / shard_count;
        let shards = (0..shard_count).map(|_| Shard::new(per_shard)).collect();
        Self {
            shards,
            start: StartClock::now(),
            limit_maxbytes: total_max_bytes,
            curr_connections,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, key: &[u8]) -> &Shard {
        &self.shards[router::shard_for(key, self.shards.len())]
    }

    pub async fn get(&self, key: &[u8]) -> Result<(Vec<u8>, u32, u64)> {
        self.shard_for(key).get(key).await
    }

    pub async fn set(&self, key: Vec<u8>, value: Vec<u8>, flags: u32, ttl: i64) -> Result<u64> {
        self.shard_for(&key).set(key, value, flags, ttl).await
    }

    pub async fn add(&self, key: Vec<u8>, value: Vec<u8>, flags: u32, ttl: i64) -> Result<u64> {
        self.shard_for(&key).add(key, value, flags, ttl).await
    }

    pub async fn replace(&self, key: Vec<u8>, value: Vec<u8>, flags: u32, ttl: i64) -> Result<u64> {
        self.shard_for(&key).replace(key, value, flags, ttl).await
    }

    pub async fn cas(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        flags: u32,
        ttl: i64,
        expected_cas: u64,
    ) -> Result<u64> {
        self.shard_for(&key).cas(key, value, flags, ttl, expected_cas).await
    }

    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        self.shard_for(key).delete(key).await
    }

    pub async fn touch(&self, key: &[u8], ttl: i64) -> Result<u64> {
        self.shard_for(key).touch(key, ttl).await
    }

    pub async fn get_and_touch(&self, key: &[u8], ttl: i64) -> Result<(Vec<u8>, u32, u64)> {
        self.shard_for(key).get_and_touch(key, ttl).await
    }

    pub async fn incr(&self, key: &[u8], delta: u64) -> Result<(u64, u64)> {
        self.shard_for(key).incr(key, delta).await
    }

    pub async fn decr(&self, key: &[u8], delta: u64) -> Result<(u64, u64)> {
        self.shard_for(key).decr(key, delta).await
    }

    pub async fn incr_or_init(&self, key: Vec<u8>, delta: u64, initial: u64, ttl: i64) -> Result<(u64, u64)> {
        self.shard_for(&key).arith_or_init(key, delta, initial, ttl, true).await
    }

    pub async fn decr_or_init(&self, key: Vec<u8>, delta: u64, initial: u64, ttl: i64) -> Result<(u64, u64)> {
        self.shard_for(&key).arith_or_init(key, delta, initial, ttl, false).await
    }

    pub async fn append(&self, key: &[u8], data: Vec<u8>) -> Result<u64> {
        self.shard_for(key).append(key, data).await
    }

    pub async fn prepend(&self, key: &[u8], data: Vec<u8>) -> Result<u64> {
        self.shard_for(key).prepend(key, data).await
    }

    /// Not atomic across shards: each shard clears independently, so a
    /// write landing on a not-yet-flushed shard concurrently with this
    /// call may survive it.
    pub async fn flush_all(&self) {
        for shard in &self.shards {
            shard.flush_all().await;
        }
    }

    /// Runs one expiry sweep pass over every shard, returning the total
    /// number of entries removed. Intended to be called on a fixed
    /// period by a background task.
    pub async fn sweep_expired(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.sweep_expired().await;
        }
        total
    }

    async fn aggregated_stats(&self) -> AggregatedStats {
        let mut agg = AggregatedStats::default();
        for shard in &self.shards {
            agg.add(shard.snapshot().await);
        }
        agg
    }

    /// Full `STAT <k> <v>` pair set, aggregated across shards plus the
    /// process-level fields.
    pub async fn stats(&self) -> Vec<(&'static str, String)> {
        let agg = self.aggregated_stats().await;
        let mut pairs = agg.as_pairs();
        pairs.push(("pid", std::process::id().to_string()));
        pairs.push(("uptime", self.start.uptime_secs().to_string()));
        pairs.push(("time", crate::clock::now_secs().to_string()));
        pairs.push(("version", env!("CARGO_PKG_VERSION").to_string()));
        pairs.push(("limit_maxbytes", self.limit_maxbytes.to_string()));
        pairs.push(("threads", self.shards.len().to_string()));
        pairs.push((
            "curr_connections",
            self.curr_connections.load(Ordering::Relaxed).to_string(),
        ));
        pairs
    }
}
