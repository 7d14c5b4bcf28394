//! A single shard: owns one index, one LRU list, one expiry heap, and the
//! byte-budget accounting for the keys routed to it. All mutation happens
//! behind a single `tokio::sync::Mutex`, which is the "single exclusive
//! owner" discipline the design doc calls for - the lock is the execution
//! context, and it is held for the full span of one operation, never
//! released mid-operation.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use tokio::sync::Mutex;

use crate::cache::entry::Entry;
use crate::clock::{now_ms, resolve_expiry_ms};
use crate::error::{CacheError, Result};
use crate::limits::{validate_key, validate_value_len, MAX_VALUE_LEN};

#[derive(Debug, Default, Clone, Copy)]
pub struct ShardStats {
    pub evictions: u64,
    pub cmd_get: u64,
    pub cmd_set: u64,
    pub get_hits: u64,
    pub get_misses: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ShardSnapshot {
    pub curr_items: usize,
    pub bytes: usize,
    pub evictions: u64,
    pub cmd_get: u64,
    pub cmd_set: u64,
    pub get_hits: u64,
    pub get_misses: u64,
}

struct Inner {
    index: LruCache<Vec<u8>, Entry>,
    expiry_heap: BinaryHeap<Reverse<(i64, Vec<u8>)>>,
    used_bytes: usize,
    max_bytes: usize,
    cas_counter: u64,
    stats: ShardStats,
}

pub struct Shard {
    inner: Mutex<Inner>,
}

impl Shard {
    pub fn new(max_bytes: usize) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        Self {
            inner: Mutex::new(Inner {
                index: LruCache::unbounded(),
                expiry_heap: BinaryHeap::new(),
                used_bytes: 0,
                max_bytes,
                cas_counter: seed,
                stats: ShardStats::default(),
            }),
        }
    }

    pub async fn get(&self, key: &[u8]) -> Result<(Vec<u8>, u32, u64)> {
        let now = now_ms();
        let mut guard = self.inner.lock().await;
        guard.stats.cmd_get += 1;
        let snapshot = guard
            .index
            .get(key)
            .map(|e| (e.is_hard_expired(now), e.value.clone(), e.flags, e.cas));
        match snapshot {
            Some((true, ..)) => {
                guard.remove_live(key);
                guard.stats.get_misses += 1;
                Err(CacheError::NotFound)
            }
            Some((false, value, flags, cas)) => {
                guard.stats.get_hits += 1;
                Ok((value, flags, cas))
            }
            None => {
                guard.stats.get_misses += 1;
                Err(CacheError::NotFound)
            }
        }
    }

    pub async fn set(&self, key: Vec<u8>, value: Vec<u8>, flags: u32, ttl: i64) -> Result<u64> {
        validate_key(&key)?;
        validate_value_len(value.len())?;
        let now = now_ms();
        let expiry_ms = resolve_expiry_ms(ttl, now);
        let mut guard = self.inner.lock().await;
        guard.stats.cmd_set += 1;
        Ok(guard.store(key, value, flags, expiry_ms))
    }

    pub async fn add(&self, key: Vec<u8>, value: Vec<u8>, flags: u32, ttl: i64) -> Result<u64> {
        validate_key(&key)?;
        validate_value_len(value.len())?;
        let now = now_ms();
        let mut guard = self.inner.lock().await;
        let existing_is_fresh = guard.index.peek(&key).map(|e| !e.is_hard_expired(now));
        match existing_is_fresh {
            Some(true) => return Err(CacheError::Exists),
            Some(false) => guard.remove_live(&key),
            None => {}
        }
        let expiry_ms = resolve_expiry_ms(ttl, now);
        Ok(guard.store(key, value, flags, expiry_ms))
    }

    pub async fn replace(&self, key: Vec<u8>, value: Vec<u8>, flags: u32, ttl: i64) -> Result<u64> {
        validate_key(&key)?;
        validate_value_len(value.len())?;
        let now = now_ms();
        let mut guard = self.inner.lock().await;
        guard.require_fresh(&key, now)?;
        let expiry_ms = resolve_expiry_ms(ttl, now);
        Ok(guard.store(key, value, flags, expiry_ms))
    }

    pub async fn cas(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        flags: u32,
        ttl: i64,
        expected_cas: u64,
    ) -> Result<u64> {
        validate_key(&key)?;
        validate_value_len(value.len())?;
        let now = now_ms();
        let mut guard = self.inner.lock().await;
        let current = guard.require_fresh(&key, now)?;
        if current != expected_cas {
            return Err(CacheError::CasMismatch);
        }
        let expiry_ms = resolve_expiry_ms(ttl, now);
        Ok(guard.store(key, value, flags, expiry_ms))
    }

    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        let now = now_ms();
        let mut guard = self.inner.lock().await;
        guard.require_fresh(key, now)?;
        guard.remove_live(key);
        Ok(())
    }

    pub async fn touch(&self, key: &[u8], ttl: i64) -> Result<u64> {
        let now = now_ms();
        let mut guard = self.inner.lock().await;
        guard.require_fresh(key, now)?;
        let entry = guard.index.peek(key).expect("checked fresh above").clone();
        let expiry_ms = resolve_expiry_ms(ttl, now);
        Ok(guard.store(entry.key, entry.value, entry.flags, expiry_ms))
    }

    /// Get-and-touch: look up, verify freshness, update expiry, move to the
    /// LRU tail, and return the value - one atomic shard operation, per the
    /// binary protocol's GAT opcode.
    pub async fn get_and_touch(&self, key: &[u8], ttl: i64) -> Result<(Vec<u8>, u32, u64)> {
        let now = now_ms();
        let mut guard = self.inner.lock().await;
        guard.stats.cmd_get += 1;
        let fresh = guard.require_fresh(key, now);
        match fresh {
            Err(e) => {
                guard.stats.get_misses += 1;
                Err(e)
            }
            Ok(_) => {
                guard.stats.get_hits += 1;
                let entry = guard.index.peek(key).expect("checked fresh above").clone();
                let expiry_ms = resolve_expiry_ms(ttl, now);
                let cas = guard.store(entry.key, entry.value.clone(), entry.flags, expiry_ms);
                Ok((entry.value, entry.flags, cas))
            }
        }
    }

    pub async fn incr(&self, key: &[u8], delta: u64) -> Result<(u64, u64)> {
        self.arith(key, delta, true).await
    }

    pub async fn decr(&self, key: &[u8], delta: u64) -> Result<(u64, u64)> {
        self.arith(key, delta, false).await
    }

    async fn arith(&self, key: &[u8], delta: u64, increment: bool) -> Result<(u64, u64)> {
        let now = now_ms();
        let mut guard = self.inner.lock().await;
        guard.require_fresh(key, now)?;
        arith_on_locked(&mut guard, key, delta, increment)
    }

    /// Creates the key with `initial` if absent (or hard-expired), per the
    /// binary protocol's Increment/Decrement extras semantics. Present-and-fresh
    /// and absent-or-expired are both handled under the one guard acquired
    /// here, so a concurrent delete or store on the same key can't interleave
    /// between the existence check and the mutation.
    pub async fn arith_or_init(
        &self,
        key: Vec<u8>,
        delta: u64,
        initial: u64,
        ttl: i64,
        increment: bool,
    ) -> Result<(u64, u64)> {
        validate_key(&key)?;
        let now = now_ms();
        let mut guard = self.inner.lock().await;
        let present_and_fresh = match guard.index.peek(&key) {
            Some(e) => !e.is_hard_expired(now),
            None => false,
        };
        if !present_and_fresh {
            guard.remove_live(&key);
            let expiry_ms = resolve_expiry_ms(ttl, now);
            let bytes = initial.to_string().into_bytes();
            let cas = guard.store(key, bytes, 0, expiry_ms);
            return Ok((initial, cas));
        }
        arith_on_locked(&mut guard, &key, delta, increment)
    }

    pub async fn append(&self, key: &[u8], data: Vec<u8>) -> Result<u64> {
        self.concat(key, data, false).await
    }

    pub async fn prepend(&self, key: &[u8], data: Vec<u8>) -> Result<u64> {
        self.concat(key, data, true).await
    }

    async fn concat(&self, key: &[u8], data: Vec<u8>, prepend: bool) -> Result<u64> {
        let now = now_ms();
        let mut guard = self.inner.lock().await;
        guard.require_fresh(key, now)?;
        let entry = guard.index.peek(key).expect("checked fresh above").clone();
        let mut new_value = Vec::with_capacity(entry.value.len() + data.len());
        if prepend {
            new_value.extend_from_slice(&data);
            new_value.extend_from_slice(&entry.value);
        } else {
            new_value.extend_from_slice(&entry.value);
            new_value.extend_from_slice(&data);
        }
        validate_value_len(new_value.len())?;
        Ok(guard.store(entry.key, new_value, entry.flags, entry.expiry_ms))
    }

    pub async fn flush_all(&self) {
        let mut guard = self.inner.lock().await;
        guard.index.clear();
        guard.expiry_heap.clear();
        guard.used_bytes = 0;
    }

    pub async fn snapshot(&self) -> ShardSnapshot {
        let guard = self.inner.lock().await;
        ShardSnapshot {
            curr_items: guard.index.len(),
            bytes: guard.used_bytes,
            evictions: guard.stats.evictions,
            cmd_get: guard.stats.cmd_get,
            cmd_set: guard.stats.cmd_set,
            get_hits: guard.stats.get_hits,
            get_misses: guard.stats.get_misses,
        }
    }

    /// Amortized O(k log n) for k expired keys; called periodically by the
    /// background sweep task. Returns the number of entries removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = now_ms();
        let mut guard = self.inner.lock().await;
        let mut removed = 0;
        loop {
            let Some(Reverse((expiry_ms, key))) = guard.expiry_heap.peek().cloned() else {
                break;
            };
            if expiry_ms > now {
                break;
            }
            guard.expiry_heap.pop();
            // Lazy invalidation: the heap entry is stale if the key is gone
            // or its live expiry no longer matches this heap tuple (it was
            // updated since this tuple was pushed).
            let still_matches = guard
                .index
                .peek(&key)
                .map(|e| e.expiry_ms == expiry_ms)
                .unwrap_or(false);
            if still_matches {
                guard.remove_live(&key);
                removed += 1;
            }
        }
        removed
    }
}

impl Inner {
    /// Returns the live, fresh cas for `key`, or the appropriate error.
    /// Lazily evicts a hard-expired entry as a side effect (refunding
    /// memory), matching the "hard-expired keys are reported as NotFound ...
    /// and removed" rule.
    fn require_fresh(&mut self, key: &[u8], now: i64) -> Result<u64> {
        let snapshot = self.index.peek(key).map(|e| (e.is_hard_expired(now), e.cas));
        match snapshot {
            Some((true, _)) => {
                self.remove_live(key);
                Err(CacheError::NotFound)
            }
            Some((false, cas)) => Ok(cas),
            None => Err(CacheError::NotFound),
        }
    }

    fn remove_live(&mut self, key: &[u8]) {
        if let Some(entry) = self.index.pop(key) {
            self.used_bytes = self.used_bytes.saturating_sub(entry.size());
        }
    }

    /// Inserts or overwrites `key`, evicting from the LRU head as needed to
    /// stay under `max_bytes`, minting a fresh cas, and moving the entry to
    /// the LRU tail (both `LruCache::put` itself, and any eviction from the
    /// opposite end, are O(1)).
    fn store(&mut self, key: Vec<u8>, value: Vec<u8>, flags: u32, expiry_ms: i64) -> u64 {
        if let Some(old) = self.index.pop(&key) {
            self.used_bytes = self.used_bytes.saturating_sub(old.size());
        }
        let new_size = key.len() + value.len();
        debug_assert!(new_size <= MAX_VALUE_LEN + 250);
        self.evict_to_fit(new_size);

        self.cas_counter += 1;
        let cas = self.cas_counter;
        let entry = Entry {
            key: key.clone(),
            value,
            flags,
            expiry_ms,
            cas,
        };
        self.index.put(key.clone(), entry);
        self.used_bytes += new_size;
        if expiry_ms != 0 {
            self.expiry_heap.push(Reverse((expiry_ms, key)));
        }
        cas
    }

    fn evict_to_fit(&mut self, needed: usize) {
        if self.max_bytes == 0 {
            return;
        }
        while self.used_bytes + needed > self.max_bytes {
            match self.index.pop_lru() {
                Some((_, victim)) => {
                    self.used_bytes = self.used_bytes.saturating_sub(victim.size());
                    self.stats.evictions += 1;
                }
                None => break,
            }
        }
    }
}

/// Parses `key`'s current value as a decimal counter and stores the
/// incremented or decremented result, all under a guard the caller already
/// holds. Callers must have already confirmed `key` is present and fresh.
fn arith_on_locked(guard: &mut Inner, key: &[u8], delta: u64, increment: bool) -> Result<(u64, u64)> {
    let entry = guard.index.peek(key).expect("caller checked fresh").clone();
    let text = std::str::from_utf8(&entry.value).map_err(|_| CacheError::NotNumeric)?;
    let current: u64 = text.trim().parse().map_err(|_| CacheError::NotNumeric)?;
    let new_value = if increment {
        current.saturating_add(delta)
    } else {
        current.saturating_sub(delta)
    };
    let new_bytes = new_value.to_string().into_bytes();
    let cas = guard.store(entry.key, new_bytes, entry.flags, entry.expiry_ms);
    Ok((new_value, cas))
}

/// Aggregated view across all shards, used by the cache façade's `Stats`.
#[derive(Debug, Default, Clone)]
pub struct AggregatedStats {
    pub curr_items: usize,
    pub bytes: usize,
    pub evictions: u64,
    pub cmd_get: u64,
    pub cmd_set: u64,
    pub get_hits: u64,
    pub get_misses: u64,
}

impl AggregatedStats {
    pub fn add(&mut self, s: ShardSnapshot) {
        self.curr_items += s.curr_items;
        self.bytes += s.bytes;
        self.evictions += s.evictions;
        self.cmd_get += s.cmd_get;
        self.cmd_set += s.cmd_set;
        self.get_hits += s.get_hits;
        self.get_misses += s.get_misses;
    }

    /// Rendered as `STAT <k> <v>` lines (sans the trailing `END`), in a
    /// stable order.
    pub fn as_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("curr_items", self.curr_items.to_string()),
            ("bytes", self.bytes.to_string()),
            ("evictions", self.evictions.to_string()),
            ("cmd_get", self.cmd_get.to_string()),
            ("cmd_set", self.cmd_set.to_string()),
            ("get_hits", self.get_hits.to_string()),
            ("get_misses", self.get_misses.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let shard = Shard::new(0);
        shard.set(b"k".to_vec(), b"v".to_vec(), 7, 0).await.unwrap();
        let (value, flags, _cas) = shard.get(b"k").await.unwrap();
        assert_eq!(value, b"v");
        assert_eq!(flags, 7);
    }

    #[tokio::test]
    async fn cas_strictly_increases_per_key() {
        let shard = Shard::new(0);
        let cas1 = shard.set(b"k".to_vec(), b"a".to_vec(), 0, 0).await.unwrap();
        let cas2 = shard.set(b"k".to_vec(), b"b".to_vec(), 0, 0).await.unwrap();
        assert!(cas2 > cas1);
    }

    #[tokio::test]
    async fn add_fails_when_present() {
        let shard = Shard::new(0);
        shard.set(b"k".to_vec(), b"a".to_vec(), 0, 0).await.unwrap();
        let err = shard
            .add(b"k".to_vec(), b"b".to_vec(), 0, 0)
            .await
            .unwrap_err();
        assert_eq!(err, CacheError::Exists);
    }

    #[tokio::test]
    async fn replace_fails_when_absent() {
        let shard = Shard::new(0);
        let err = shard
            .replace(b"k".to_vec(), b"b".to_vec(), 0, 0)
            .await
            .unwrap_err();
        assert_eq!(err, CacheError::NotFound);
    }

    #[tokio::test]
    async fn cas_mismatch_is_reported() {
        let shard = Shard::new(0);
        let cas1 = shard.set(b"k".to_vec(), b"a".to_vec(), 0, 0).await.unwrap();
        let err = shard
            .cas(b"k".to_vec(), b"b".to_vec(), 0, 0, cas1 + 1)
            .await
            .unwrap_err();
        assert_eq!(err, CacheError::CasMismatch);
        let (value, _, _) = shard.get(b"k").await.unwrap();
        assert_eq!(value, b"a");
    }

    #[tokio::test]
    async fn delete_of_absent_key_is_not_found() {
        let shard = Shard::new(0);
        assert_eq!(shard.delete(b"nope").await.unwrap_err(), CacheError::NotFound);
    }

    #[tokio::test]
    async fn incr_on_non_numeric_value() {
        let shard = Shard::new(0);
        shard.set(b"k".to_vec(), b"abc".to_vec(), 0, 0).await.unwrap();
        assert_eq!(shard.incr(b"k", 1).await.unwrap_err(), CacheError::NotNumeric);
    }

    #[tokio::test]
    async fn incr_saturates_at_u64_max() {
        let shard = Shard::new(0);
        shard
            .set(b"k".to_vec(), u64::MAX.to_string().into_bytes(), 0, 0)
            .await
            .unwrap();
        let (new_value, _) = shard.incr(b"k", 10).await.unwrap();
        assert_eq!(new_value, u64::MAX);
    }

    #[tokio::test]
    async fn decr_floors_at_zero() {
        let shard = Shard::new(0);
        shard.set(b"k".to_vec(), b"5".to_vec(), 0, 0).await.unwrap();
        let (new_value, _) = shard.decr(b"k", 10).await.unwrap();
        assert_eq!(new_value, 0);
    }

    #[tokio::test]
    async fn append_and_prepend_concatenate() {
        let shard = Shard::new(0);
        shard.set(b"k".to_vec(), b"mid".to_vec(), 0, 0).await.unwrap();
        shard.append(b"k", b"-end".to_vec()).await.unwrap();
        shard.prepend(b"k", b"start-".to_vec()).await.unwrap();
        let (value, _, _) = shard.get(b"k").await.unwrap();
        assert_eq!(value, b"start-mid-end");
    }

    #[tokio::test]
    async fn byte_accounting_matches_contents() {
        let shard = Shard::new(0);
        shard.set(b"a".to_vec(), b"12345".to_vec(), 0, 0).await.unwrap();
        shard.set(b"bb".to_vec(), b"123".to_vec(), 0, 0).await.unwrap();
        let snap = shard.snapshot().await;
        assert_eq!(snap.bytes, 1 + 5 + 2 + 3);
    }

    #[tokio::test]
    async fn eviction_respects_byte_budget() {
        let shard = Shard::new(32);
        for i in 0..20u32 {
            let key = format!("k{i}").into_bytes();
            shard.set(key, vec![b'v'; 10], 0, 0).await.unwrap();
        }
        let snap = shard.snapshot().await;
        assert!(snap.bytes <= 32, "bytes={} over budget", snap.bytes);
        assert!(snap.evictions > 0);
        assert!(snap.curr_items < 20);
    }

    #[tokio::test]
    async fn most_recently_set_keys_survive_eviction() {
        let shard = Shard::new(24);
        for i in 0..10u32 {
            let key = format!("k{i}").into_bytes();
            shard.set(key, vec![b'v'; 5], 0, 0).await.unwrap();
        }
        let (value, _, _) = shard.get(b"k9").await.unwrap();
        assert_eq!(value, vec![b'v'; 5]);
    }

    #[tokio::test]
    async fn oversize_single_entry_still_stores() {
        let shard = Shard::new(4);
        shard.set(b"k".to_vec(), vec![b'v'; 20], 0, 0).await.unwrap();
        let snap = shard.snapshot().await;
        assert!(snap.bytes > 4);
    }

    /// Back-dates key `k`'s stored expiry to a fixed point in the past,
    /// without requiring the test to sleep past a real TTL.
    async fn backdate_expiry(shard: &Shard, new_expiry_ms: i64) {
        let key: &[u8] = b"k";
        let mut guard = shard.inner.lock().await;
        if let Some(e) = guard.index.peek_mut(key) {
            e.expiry_ms = new_expiry_ms;
        }
    }

    #[tokio::test]
    async fn get_on_expired_key_refunds_and_misses() {
        let shard = Shard::new(0);
        shard.set(b"k".to_vec(), b"v".to_vec(), 0, 1).await.unwrap();
        backdate_expiry(&shard, 1).await;
        assert_eq!(shard.get(b"k").await.unwrap_err(), CacheError::NotFound);
        let snap = shard.snapshot().await;
        assert_eq!(snap.curr_items, 0);
        assert_eq!(snap.bytes, 0);
    }

    #[tokio::test]
    async fn add_succeeds_on_hard_expired_key() {
        let shard = Shard::new(0);
        shard.set(b"k".to_vec(), b"v".to_vec(), 0, 1).await.unwrap();
        backdate_expiry(&shard, 1).await;
        let result = shard.add(b"k".to_vec(), b"new".to_vec(), 0, 0).await;
        assert!(result.is_ok());
        let (value, _, _) = shard.get(b"k").await.unwrap();
        assert_eq!(value, b"new");
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let shard = Shard::new(0);
        shard.set(b"k".to_vec(), b"v".to_vec(), 0, 1).await.unwrap();
        backdate_expiry(&shard, 1).await;
        {
            // Re-seed the heap with the now-matching tuple for the sweep to find.
            let mut guard = shard.inner.lock().await;
            guard.expiry_heap.push(Reverse((1, b"k".to_vec())));
        }
        let removed = shard.sweep_expired().await;
        assert!(removed >= 1);
        let snap = shard.snapshot().await;
        assert_eq!(snap.curr_items, 0);
    }

    #[tokio::test]
    async fn flush_all_empties_shard() {
        let shard = Shard::new(0);
        shard.set(b"k".to_vec(), b"v".to_vec(), 0, 0).await.unwrap();
        shard.flush_all().await;
        let snap = shard.snapshot().await;
        assert_eq!(snap.curr_items, 0);
        assert_eq!(snap.bytes, 0);
        assert_eq!(shard.get(b"k").await.unwrap_err(), CacheError::NotFound);
    }
}
