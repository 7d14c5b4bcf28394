//! The unit of storage inside a shard.

/// One value stored in a shard. `key` is duplicated inside the entry (as
/// well as being the map key in [`crate::cache::shard::Shard`]'s LRU map) so
/// that expiry-heap and eviction bookkeeping can report which key they
/// touched without a reverse lookup.
#[derive(Debug, Clone)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub flags: u32,
    /// Absolute UNIX-ms deadline; `0` means "never expires".
    pub expiry_ms: i64,
    pub cas: u64,
}

impl Entry {
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }

    pub fn is_hard_expired(&self, now_ms: i64) -> bool {
        self.expiry_ms != 0 && self.expiry_ms <= now_ms
    }
}
