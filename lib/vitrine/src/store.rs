use hashbrown::HashMap;
use parking_lot::RwLock;

/// Opaque key bytes. Keys compare by value.
pub type Key = Vec<u8>;

/// Sharded in-memory key-value store. The replication layer drives all
/// mutation through two primitives, `put_if_absent` and `replace_if_equal`,
/// and runs CAS loops on top of them; there is no global store lock, only
/// the per-shard ones.
pub struct Store<V> {
    shards: Vec<RwLock<HashMap<Key, V>>>,
    mask: u64,
}

const DEFAULT_SHARDS: usize = 16;

impl<V: Clone + PartialEq> Store<V> {
    #[inline]
    pub fn new() -> Store<V> {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(count: usize) -> Store<V> {
        if !count.is_power_of_two() {
            panic!("Shard count must be a power of two, got {}", count);
        }

        Store {
            shards: (0..count).map(|_| RwLock::new(HashMap::new())).collect(),
            mask: (count - 1) as u64,
        }
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &RwLock<HashMap<Key, V>> {
        &self.shards[(fnv1a(key) & self.mask) as usize]
    }

    #[inline]
    pub fn get(&self, key: &[u8]) -> Option<V> {
        self.shard(key).read().get(key).cloned()
    }

    #[inline]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.shard(key).read().contains_key(key)
    }

    /// Insert `value` unless the key is present; returns the prior value when
    /// the insert lost.
    pub fn put_if_absent(&self, key: &[u8], value: V) -> Option<V> {
        let mut shard = self.shard(key).write();

        match shard.get(key) {
            Some(existing) => Some(existing.clone()),
            None => {
                shard.insert(key.to_vec(), value);
                None
            }
        }
    }

    /// Replace the stored value with `new` only when the current value equals
    /// `old`. Returns false (and changes nothing) otherwise; callers loop.
    pub fn replace_if_equal(&self, key: &[u8], old: &V, new: V) -> bool {
        let mut shard = self.shard(key).write();

        match shard.get_mut(key) {
            Some(existing) if existing == old => {
                *existing = new;
                true
            }
            _ => false,
        }
    }

    /// Raw entry count, including whatever the caller layers on top (e.g.
    /// tombstoned records).
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all keys. Taken shard by shard, so concurrent writers may
    /// be partially reflected; callers re-validate per key.
    pub fn keys(&self) -> Vec<Key> {
        let mut keys = Vec::with_capacity(self.len());
        for shard in &self.shards {
            keys.extend(shard.read().keys().cloned());
        }
        keys
    }

    /// Visit every entry under the shard read locks. The closure must not
    /// call back into the store.
    pub fn scan<F: FnMut(&[u8], &V)>(&self, mut visit: F) {
        for shard in &self.shards {
            for (key, value) in shard.read().iter() {
                visit(key, value);
            }
        }
    }

    /// True when any entry satisfies the predicate. Short-circuits.
    pub fn any<F: Fn(&[u8], &V) -> bool>(&self, pred: F) -> bool {
        for shard in &self.shards {
            if shard.read().iter().any(|(key, value)| pred(key, value)) {
                return true;
            }
        }
        false
    }
}

#[inline]
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
