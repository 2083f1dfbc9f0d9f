use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flint::logging::{self, Logger};
use flint::shared::{ErrorType, WireError, WireResult};
use flint::time::timestamp_millis;
use flint::NodeId;

use crate::repl::iter::ModIter;
use crate::store::{Key, Store};
use crate::wire::{Document, Value};

/// Fixed ceiling on remote peer identifiers, sized at construction.
pub const MAX_PEERS: usize = 135;

const PEER_WORDS: usize = 4;

/// A 256-bit peer mask, bits counted from the least significant bit of the
/// lowest word. Bit `i` of a record's dirty mask means "the current value has
/// not yet been shipped to peer i".
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, Hash)]
pub struct PeerBits {
    words: [u64; PEER_WORDS],
}

impl PeerBits {
    #[inline]
    pub fn none() -> PeerBits {
        PeerBits::default()
    }

    /// All peer slots raised.
    pub fn full() -> PeerBits {
        let mut words = [0u64; PEER_WORDS];
        for (index, word) in words.iter_mut().enumerate() {
            let bits = MAX_PEERS.saturating_sub(index * 64);
            *word = match bits {
                0 => 0,
                bits if bits >= 64 => u64::max_value(),
                bits => (1u64 << bits) - 1,
            };
        }
        PeerBits { words }
    }

    #[inline]
    pub fn get(&self, peer: NodeId) -> bool {
        let peer = peer as usize;
        self.words[peer / 64] & (1 << (peer % 64)) != 0
    }

    #[inline]
    pub fn set(&mut self, peer: NodeId) {
        let peer = peer as usize;
        self.words[peer / 64] |= 1 << (peer % 64);
    }

    #[inline]
    pub fn clear(&mut self, peer: NodeId) {
        let peer = peer as usize;
        self.words[peer / 64] &= !(1 << (peer % 64));
    }

    #[inline]
    pub fn any(&self) -> bool {
        self.words.iter().any(|word| *word != 0)
    }
}

/// Lock-free set of peer identifiers, used for the active-iterator set and
/// the "needs a bootstrap timestamp" flags.
pub struct AtomicPeerSet {
    words: [AtomicU64; PEER_WORDS],
}

impl AtomicPeerSet {
    pub fn new() -> AtomicPeerSet {
        AtomicPeerSet {
            words: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
        }
    }

    /// Raises the peer's bit; returns true when it was newly raised.
    #[inline]
    pub fn insert(&self, peer: NodeId) -> bool {
        let mask = 1u64 << (peer % 64);
        self.words[peer as usize / 64].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    /// Clears the peer's bit; returns true when it was set.
    #[inline]
    pub fn remove(&self, peer: NodeId) -> bool {
        let mask = 1u64 << (peer % 64);
        self.words[peer as usize / 64].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    #[inline]
    pub fn contains(&self, peer: NodeId) -> bool {
        let mask = 1u64 << (peer % 64);
        self.words[peer as usize / 64].load(Ordering::Acquire) & mask != 0
    }

    /// Snapshot of the raised peer ids.
    pub fn members(&self) -> Vec<NodeId> {
        let mut members = Vec::new();
        for (index, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                members.push((index * 64 + bit) as NodeId);
                bits &= bits - 1;
            }
        }
        members
    }
}

/// Per-key replication metadata, stored alongside the value in one record so
/// a single CAS covers both.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ReplRecord {
    pub deleted: bool,
    pub timestamp: u64,
    pub origin: NodeId,
    pub dirty: PeerBits,
}

/// One store entry: user-visible value plus replication record. A tombstoned
/// entry keeps its record but has no value.
#[derive(Clone, PartialEq, Debug)]
pub struct Slot {
    pub value: Option<Vec<u8>>,
    pub record: ReplRecord,
}

impl Slot {
    #[inline]
    pub fn visible(&self) -> Option<&[u8]> {
        if self.record.deleted {
            None
        } else {
            self.value.as_deref()
        }
    }
}

/// What travels between peers for one key.
#[derive(Clone, PartialEq, Debug)]
pub struct ReplicationEntry {
    pub key: Key,
    pub value: Option<Vec<u8>>,
    pub deleted: bool,
    pub timestamp: u64,
    pub origin: NodeId,
}

impl ReplicationEntry {
    /// Appends the entry fields to a wire document.
    pub fn write_fields(&self, doc: &mut Document) {
        doc.push("key", Value::Bytes(self.key.clone()));
        doc.push(
            "value",
            match &self.value {
                Some(value) => Value::Bytes(value.clone()),
                None => Value::Null,
            },
        );
        doc.push("deleted", Value::Bool(self.deleted));
        doc.push("timestamp", Value::I64(self.timestamp as i64));
        doc.push("identifier", Value::I8(self.origin as i8));
    }

    /// Reads the entry fields back out of a wire document.
    pub fn from_document(doc: &Document) -> WireResult<ReplicationEntry> {
        let key = doc
            .bytes_field("key")
            .ok_or(WireError::Fatal(ErrorType::ProtocolViolation))?
            .to_vec();
        let value = match doc.get("value") {
            Some(Value::Bytes(bytes)) => Some(bytes.clone()),
            Some(Value::Null) | None => None,
            Some(_) => return Err(WireError::Fatal(ErrorType::ProtocolViolation)),
        };
        let deleted = doc
            .bool_field("deleted")
            .ok_or(WireError::Fatal(ErrorType::ProtocolViolation))?;
        let timestamp = doc
            .i64_field("timestamp")
            .ok_or(WireError::Fatal(ErrorType::ProtocolViolation))? as u64;
        let origin = doc
            .i64_field("identifier")
            .ok_or(WireError::Fatal(ErrorType::ProtocolViolation))? as u8;

        Ok(ReplicationEntry {
            key,
            value,
            deleted,
            timestamp,
            origin,
        })
    }
}

/// Per-remote-peer bookkeeping. `last_bootstrap_ts` is the timestamp below
/// which the peer has already been told every change; `next_bootstrap_ts` is
/// a candidate awaiting atomic promotion (0 = unset). `last_modification_time`
/// is the highest timestamp received *from* that peer.
pub struct PeerSlot {
    last_bootstrap_ts: AtomicU64,
    next_bootstrap_ts: AtomicU64,
    last_modification_time: AtomicU64,
}

impl PeerSlot {
    fn new() -> PeerSlot {
        PeerSlot {
            last_bootstrap_ts: AtomicU64::new(0),
            next_bootstrap_ts: AtomicU64::new(0),
            last_modification_time: AtomicU64::new(0),
        }
    }
}

/// Outcome of applying a remote entry.
#[derive(Debug, PartialEq)]
pub enum ApplyOutcome {
    /// The entry won the conflict-resolution rule; carries the previously
    /// visible value.
    Accepted { old: Option<Vec<u8>> },
    /// A newer (or tie-winning) local record is already in place.
    Stale,
}

/// The replication state store: tracks per-key modification state, fans
/// changes out to every active remote peer via dirty bits, and resolves
/// concurrent writes deterministically (newer timestamp wins, ties broken by
/// smaller originating identifier).
pub struct ReplicatedMap {
    id: NodeId,
    pub(crate) store: Store<Slot>,
    peers: Vec<PeerSlot>,
    pub(crate) active: AtomicPeerSet,
    pub(crate) needs_bootstrap: AtomicPeerSet,
    iters: RwLock<HashMap<NodeId, Arc<ModIter>>>,
    log: Logger,
}

impl ReplicatedMap {
    pub fn new(id: NodeId, log: &Logger) -> Arc<ReplicatedMap> {
        assert!((id as usize) < MAX_PEERS, "Node id outside the peer range");

        Arc::new(ReplicatedMap {
            id,
            store: Store::new(),
            peers: (0..MAX_PEERS).map(|_| PeerSlot::new()).collect(),
            active: AtomicPeerSet::new(),
            needs_bootstrap: AtomicPeerSet::new(),
            iters: RwLock::new(HashMap::new()),
            log: log.new(logging::o!("node" => id)),
        })
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.store
            .get(key)
            .and_then(|slot| slot.visible().map(<[u8]>::to_vec))
    }

    #[inline]
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    pub fn contains_value(&self, value: &[u8]) -> bool {
        self.store
            .any(|_, slot| slot.visible().map_or(false, |stored| stored == value))
    }

    /// Count of visible (non-tombstoned) entries.
    pub fn size(&self) -> usize {
        let mut count = 0;
        self.store.scan(|_, slot| {
            if slot.visible().is_some() {
                count += 1;
            }
        });
        count
    }

    /// Snapshot of the visible key → value mapping.
    pub fn visible_snapshot(&self) -> Vec<(Key, Vec<u8>)> {
        let mut entries = Vec::new();
        self.store.scan(|key, slot| {
            if let Some(value) = slot.visible() {
                entries.push((key.to_vec(), value.to_vec()));
            }
        });
        entries
    }

    /// Local insert/update. Returns the previously visible value.
    pub fn put(&self, key: &[u8], value: Vec<u8>) -> Option<Vec<u8>> {
        self.on_change(key, Some(value), false)
    }

    /// Local delete; the record survives as a tombstone. Returns the
    /// previously visible value.
    pub fn remove(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.on_change(key, None, true)
    }

    /// Tombstones every visible entry.
    pub fn clear(&self) {
        for key in self.store.keys() {
            if self.get(&key).is_some() {
                self.remove(&key);
            }
        }
    }

    /// Records a local mutation: bumps the key's timestamp past any prior
    /// one, stamps the local origin and raises every dirty bit, retrying the
    /// record CAS until it lands.
    fn on_change(&self, key: &[u8], value: Option<Vec<u8>>, deleted: bool) -> Option<Vec<u8>> {
        let (old, timestamp) = loop {
            let current = self.store.get(key);
            let now = timestamp_millis();

            match current {
                None => {
                    let slot = Slot {
                        value: value.clone(),
                        record: ReplRecord {
                            deleted,
                            timestamp: now,
                            origin: self.id,
                            dirty: PeerBits::full(),
                        },
                    };
                    if self.store.put_if_absent(key, slot).is_none() {
                        break (None, now);
                    }
                }
                Some(prev) => {
                    let timestamp = std::cmp::max(now, prev.record.timestamp + 1);
                    let slot = Slot {
                        value: value.clone(),
                        record: ReplRecord {
                            deleted,
                            timestamp,
                            origin: self.id,
                            dirty: PeerBits::full(),
                        },
                    };
                    if self.store.replace_if_equal(key, &prev, slot) {
                        break (prev.visible().map(<[u8]>::to_vec), timestamp);
                    }
                }
            }
            // Lost the race; reload and retry.
        };

        self.after_local_change(timestamp);
        old
    }

    /// Post-mutation fan-out: peers flagged as needing a bootstrap timestamp
    /// get this write's timestamp published, and every active iterator is
    /// nudged awake.
    fn after_local_change(&self, timestamp: u64) {
        let iters = self.iters.read();

        for peer in self.active.members() {
            if self.needs_bootstrap.remove(peer) {
                let slot = &self.peers[peer as usize];
                if slot
                    .next_bootstrap_ts
                    .compare_exchange(0, timestamp, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    logging::warn!(
                        self.log, "bootstrap timestamp already published";
                        "peer" => peer, "timestamp" => timestamp
                    );
                }
            }

            if let Some(iter) = iters.get(&peer) {
                iter.notify();
            }
        }
    }

    /// Applies a remote entry through the conflict-resolution rule: a newer
    /// timestamp wins; on an exact tie the smaller originating identifier
    /// wins. Accepted entries land with an empty dirty mask, since arrival is
    /// not a local change that needs re-fanout.
    pub fn apply(&self, entry: &ReplicationEntry) -> ApplyOutcome {
        let outcome = loop {
            let current = self.store.get(&entry.key);

            let accept = match &current {
                None => true,
                Some(slot) => {
                    if entry.timestamp == slot.record.timestamp
                        && entry.origin == slot.record.origin
                    {
                        // The same write arriving again (duplicate delivery or
                        // an echo of our own change); must not disturb the
                        // dirty bits still pending for other peers.
                        break ApplyOutcome::Stale;
                    }
                    entry.timestamp > slot.record.timestamp
                        || (entry.timestamp == slot.record.timestamp
                            && entry.origin <= slot.record.origin)
                }
            };

            if !accept {
                break ApplyOutcome::Stale;
            }

            let slot = Slot {
                value: entry.value.clone(),
                record: ReplRecord {
                    deleted: entry.deleted,
                    timestamp: entry.timestamp,
                    origin: entry.origin,
                    dirty: PeerBits::none(),
                },
            };

            match current {
                None => {
                    if self.store.put_if_absent(&entry.key, slot).is_none() {
                        break ApplyOutcome::Accepted { old: None };
                    }
                }
                Some(prev) => {
                    if self.store.replace_if_equal(&entry.key, &prev, slot) {
                        break ApplyOutcome::Accepted {
                            old: prev.visible().map(<[u8]>::to_vec),
                        };
                    }
                }
            }
        };

        if let ApplyOutcome::Accepted { .. } = outcome {
            self.record_remote_modification(entry.origin, entry.timestamp);
        }

        outcome
    }

    /// Monotone max of the timestamps received from `peer`.
    fn record_remote_modification(&self, peer: NodeId, timestamp: u64) {
        let slot = &self.peers[peer as usize];
        let mut prev = slot.last_modification_time.load(Ordering::Acquire);

        while timestamp > prev {
            match slot.last_modification_time.compare_exchange_weak(
                prev,
                timestamp,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => prev = observed,
            }
        }
    }

    #[inline]
    pub fn last_modification_time(&self, peer: NodeId) -> u64 {
        self.peers[peer as usize]
            .last_modification_time
            .load(Ordering::Acquire)
    }

    /// The timestamp a peer should request replay from. A pending candidate
    /// is atomically promoted into `last_bootstrap_ts` and consumed.
    pub fn bootstrap_timestamp(&self, peer: NodeId) -> u64 {
        let slot = &self.peers[peer as usize];

        loop {
            let next = slot.next_bootstrap_ts.load(Ordering::Acquire);

            if next == 0 {
                return slot.last_bootstrap_ts.load(Ordering::Acquire);
            }

            if slot
                .next_bootstrap_ts
                .compare_exchange(next, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.last_bootstrap_ts.store(next, Ordering::Release);
                return next;
            }
        }
    }

    /// Lazily constructs the modification iterator for `peer` and marks the
    /// peer active. Idempotent; concurrent callers share one instance.
    pub fn acquire_iterator(self: &Arc<Self>, peer: NodeId) -> Arc<ModIter> {
        assert!((peer as usize) < MAX_PEERS, "Peer id outside the peer range");

        let mut iters = self.iters.write();
        let iter = iters
            .entry(peer)
            .or_insert_with(|| ModIter::new(peer, Arc::downgrade(self), &self.log))
            .clone();
        self.active.insert(peer);
        iter
    }

    #[cfg(test)]
    pub(crate) fn dirty_for(&self, key: &[u8], peer: NodeId) -> bool {
        self.store
            .get(key)
            .map_or(false, |slot| slot.record.dirty.get(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flint::logging;

    fn map(id: NodeId) -> Arc<ReplicatedMap> {
        ReplicatedMap::new(id, &logging::discard())
    }

    #[test]
    fn test_peer_bits_full_covers_exactly_max_peers() {
        let full = PeerBits::full();

        for peer in 0..MAX_PEERS {
            assert!(full.get(peer as NodeId), "peer {} should be set", peer);
        }
        for peer in MAX_PEERS..PEER_WORDS * 64 {
            assert!(!full.get(peer as NodeId), "peer {} should be clear", peer);
        }
    }

    #[test]
    fn test_peer_bits_set_clear() {
        let mut bits = PeerBits::none();
        assert!(!bits.any());

        bits.set(70);
        assert!(bits.get(70));
        assert!(bits.any());

        bits.clear(70);
        assert!(!bits.any());
    }

    #[test]
    fn test_atomic_peer_set() {
        let set = AtomicPeerSet::new();

        assert!(set.insert(3));
        assert!(!set.insert(3));
        assert!(set.contains(3));
        assert!(set.insert(130));

        assert_eq!(set.members(), vec![3, 130]);

        assert!(set.remove(3));
        assert!(!set.remove(3));
        assert_eq!(set.members(), vec![130]);
    }

    #[test]
    fn test_put_get_remove_visibility() {
        let map = map(1);

        assert_eq!(map.put(b"a", vec![1, 2]), None);
        assert_eq!(map.get(b"a"), Some(vec![1, 2]));
        assert_eq!(map.size(), 1);

        assert_eq!(map.put(b"a", vec![3]), Some(vec![1, 2]));
        assert_eq!(map.remove(b"a"), Some(vec![3]));

        // The tombstone stays behind for replication convergence.
        assert_eq!(map.get(b"a"), None);
        assert_eq!(map.size(), 0);
        assert_eq!(map.store.len(), 1);
    }

    #[test]
    fn test_local_timestamps_strictly_increase() {
        let map = map(1);
        let mut prev = 0;

        for round in 0..100 {
            map.put(b"k", vec![round]);
            let slot = map.store.get(b"k").unwrap();
            assert!(slot.record.timestamp > prev);
            prev = slot.record.timestamp;
        }
    }

    #[test]
    fn test_local_change_raises_all_dirty_bits() {
        let map = map(1);
        map.put(b"k", vec![1]);

        let slot = map.store.get(b"k").unwrap();
        assert_eq!(slot.record.dirty, PeerBits::full());
        assert_eq!(slot.record.origin, 1);
    }

    #[test]
    fn test_apply_newer_wins() {
        let map = map(1);
        map.put(b"k", vec![1]);
        let local_ts = map.store.get(b"k").unwrap().record.timestamp;

        let outcome = map.apply(&ReplicationEntry {
            key: b"k".to_vec(),
            value: Some(vec![9]),
            deleted: false,
            timestamp: local_ts + 10,
            origin: 2,
        });

        assert_eq!(outcome, ApplyOutcome::Accepted { old: Some(vec![1]) });
        assert_eq!(map.get(b"k"), Some(vec![9]));

        // The applied record carries no dirty bits.
        assert!(!map.store.get(b"k").unwrap().record.dirty.any());
        assert_eq!(map.last_modification_time(2), local_ts + 10);
    }

    #[test]
    fn test_apply_older_rejected() {
        let map = map(1);
        map.put(b"k", vec![1]);
        let local_ts = map.store.get(b"k").unwrap().record.timestamp;

        let outcome = map.apply(&ReplicationEntry {
            key: b"k".to_vec(),
            value: Some(vec![9]),
            deleted: false,
            timestamp: local_ts - 1,
            origin: 2,
        });

        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(map.get(b"k"), Some(vec![1]));
    }

    #[test]
    fn test_tie_breaks_to_smaller_origin() {
        // Node 2 holds its own write; node 1's concurrent write at the same
        // timestamp must displace it, while node 3's must not.
        let map = map(2);
        map.put(b"k", vec![2]);
        let ts = map.store.get(b"k").unwrap().record.timestamp;

        let from_three = map.apply(&ReplicationEntry {
            key: b"k".to_vec(),
            value: Some(vec![3]),
            deleted: false,
            timestamp: ts,
            origin: 3,
        });
        assert_eq!(from_three, ApplyOutcome::Stale);

        let from_one = map.apply(&ReplicationEntry {
            key: b"k".to_vec(),
            value: Some(vec![1]),
            deleted: false,
            timestamp: ts,
            origin: 1,
        });
        assert_eq!(from_one, ApplyOutcome::Accepted { old: Some(vec![2]) });
        assert_eq!(map.get(b"k"), Some(vec![1]));
    }

    #[test]
    fn test_apply_delete_tombstones() {
        let map = map(1);
        map.put(b"k", vec![1]);
        let ts = map.store.get(b"k").unwrap().record.timestamp;

        let outcome = map.apply(&ReplicationEntry {
            key: b"k".to_vec(),
            value: None,
            deleted: true,
            timestamp: ts + 1,
            origin: 2,
        });

        assert_eq!(outcome, ApplyOutcome::Accepted { old: Some(vec![1]) });
        assert_eq!(map.get(b"k"), None);
        assert_eq!(map.store.len(), 1);
    }

    #[test]
    fn test_bootstrap_timestamp_promotion() {
        let map = map(1);

        assert_eq!(map.bootstrap_timestamp(5), 0);

        // An active peer flagged for bootstrap gets the next write published.
        map.acquire_iterator(5);
        map.needs_bootstrap.insert(5);
        map.put(b"k", vec![1]);

        let ts = map.store.get(b"k").unwrap().record.timestamp;
        assert_eq!(map.bootstrap_timestamp(5), ts);
        // Promotion consumed the candidate; the promoted value sticks.
        assert_eq!(map.bootstrap_timestamp(5), ts);
    }

    #[test]
    fn test_entry_document_roundtrip() {
        let entry = ReplicationEntry {
            key: b"k".to_vec(),
            value: Some(vec![1, 2]),
            deleted: false,
            timestamp: 12345,
            origin: 7,
        };

        let mut doc = Document::new().with("replicationEvent", Value::Null);
        entry.write_fields(&mut doc);
        assert_eq!(ReplicationEntry::from_document(&doc).unwrap(), entry);

        let tombstone = ReplicationEntry {
            key: b"gone".to_vec(),
            value: None,
            deleted: true,
            timestamp: 99,
            origin: 0,
        };

        let mut doc = Document::new();
        tombstone.write_fields(&mut doc);
        assert_eq!(ReplicationEntry::from_document(&doc).unwrap(), tombstone);
    }

    #[test]
    fn test_convergence_after_full_exchange() {
        let a = map(1);
        let b = map(2);

        for i in 0..50u8 {
            a.put(format!("a-{}", i).as_bytes(), vec![i]);
            b.put(format!("b-{}", i).as_bytes(), vec![i]);
        }
        a.put(b"shared", vec![0xaa]);
        b.put(b"shared", vec![0xbb]);

        // Exchange every record both ways, twice, out of order.
        for _ in 0..2 {
            let mut a_entries = Vec::new();
            a.store.scan(|key, slot| {
                a_entries.push(ReplicationEntry {
                    key: key.to_vec(),
                    value: slot.value.clone(),
                    deleted: slot.record.deleted,
                    timestamp: slot.record.timestamp,
                    origin: slot.record.origin,
                })
            });
            a_entries.reverse();

            for entry in &a_entries {
                b.apply(entry);
            }

            let mut b_entries = Vec::new();
            b.store.scan(|key, slot| {
                b_entries.push(ReplicationEntry {
                    key: key.to_vec(),
                    value: slot.value.clone(),
                    timestamp: slot.record.timestamp,
                    deleted: slot.record.deleted,
                    origin: slot.record.origin,
                })
            });

            for entry in &b_entries {
                a.apply(entry);
            }
        }

        let mut left = a.visible_snapshot();
        let mut right = b.visible_snapshot();
        left.sort();
        right.sort();

        assert_eq!(left, right);
        assert_eq!(left.len(), 101);
    }
}
