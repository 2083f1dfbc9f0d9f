use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use flint::logging::{self, Logger};
use flint::shared::{ErrorType, WireError, WireResult};
use flint::NodeId;

use crate::repl::state::{ReplicatedMap, ReplicationEntry, Slot};

/// How many times a dirty-bit clear may lose its CAS against an unchanged
/// record before the iterator declares the session broken.
const CLEAR_RETRIES: usize = 3;

/// Per-peer cursor over the keys whose dirty bit for that peer is raised.
/// One instance exists per remote identifier, created lazily by
/// [`ReplicatedMap::acquire_iterator`]. The iterator holds its map weakly;
/// the map owns the iterators, and a dropped map simply ends the session.
pub struct ModIter {
    peer: NodeId,
    map: Weak<ReplicatedMap>,
    notifier: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    log: Logger,
}

impl ModIter {
    pub(crate) fn new(peer: NodeId, map: Weak<ReplicatedMap>, log: &Logger) -> Arc<ModIter> {
        Arc::new(ModIter {
            peer,
            map,
            notifier: Mutex::new(None),
            log: log.new(logging::o!("peer" => peer)),
        })
    }

    #[inline]
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    fn map(&self) -> WireResult<Arc<ReplicatedMap>> {
        self.map
            .upgrade()
            .ok_or(WireError::Fatal(ErrorType::ConnectionClosed))
    }

    /// Installs the hook invoked after every dirty-bit raise for this peer,
    /// so the owning event loop wakes.
    pub fn set_modification_notifier(&self, notifier: Arc<dyn Fn() + Send + Sync>) {
        *self.notifier.lock() = Some(notifier);
    }

    pub(crate) fn notify(&self) {
        if let Some(notifier) = self.notifier.lock().clone() {
            notifier();
        }
    }

    /// True when any key still has this peer's dirty bit raised. A scan with
    /// no side effects.
    pub fn has_next(&self) -> bool {
        match self.map() {
            Ok(map) => map
                .store
                .any(|_, slot| slot.record.dirty.get(self.peer)),
            Err(_) => false,
        }
    }

    /// Drains the dirty entries for this peer: each one is presented to the
    /// consumer, then its dirty bit is CAS-cleared. A record superseded
    /// mid-flight keeps its (re-raised) bit and will be revisited; a clear
    /// that keeps losing against an unchanged record is an invariant
    /// violation and kills the session. When a pass emits nothing, the peer
    /// is flagged so the next local write publishes a bootstrap timestamp.
    pub fn for_each<F>(&self, mut consumer: F) -> WireResult<usize>
    where
        F: FnMut(&ReplicationEntry) -> WireResult<()>,
    {
        let map = self.map()?;
        let mut emitted = 0;

        for key in map.store.keys() {
            let slot = match map.store.get(&key) {
                Some(slot) if slot.record.dirty.get(self.peer) => slot,
                _ => continue,
            };

            let entry = ReplicationEntry {
                key: key.clone(),
                value: slot.value.clone(),
                deleted: slot.record.deleted,
                timestamp: slot.record.timestamp,
                origin: slot.record.origin,
            };

            consumer(&entry)?;
            emitted += 1;

            self.clear_bit(&map, &key, slot)?;
        }

        if emitted == 0 {
            map.needs_bootstrap.insert(self.peer);
        }

        Ok(emitted)
    }

    /// Clears this peer's dirty bit on an entry that has just been emitted.
    fn clear_bit(&self, map: &ReplicatedMap, key: &[u8], mut slot: Slot) -> WireResult<()> {
        for _ in 0..CLEAR_RETRIES {
            let mut cleared = slot.clone();
            cleared.record.dirty.clear(self.peer);

            if map.store.replace_if_equal(key, &slot, cleared) {
                return Ok(());
            }

            slot = match map.store.get(key) {
                // A newer mutation supersedes the emitted entry; its re-raised
                // bit keeps the key eligible, nothing to clear here.
                Some(current) if current.record.timestamp != slot.record.timestamp => {
                    return Ok(())
                }
                Some(current) => current,
                None => return Ok(()),
            };

            if !slot.record.dirty.get(self.peer) {
                return Ok(());
            }
        }

        logging::error!(
            self.log, "dirty bit clear kept failing on an unchanged record";
            "key_len" => key.len()
        );
        Err(WireError::Fatal(ErrorType::AssertionFailed))
    }

    /// Re-raises this peer's dirty bit on every record stamped at or after
    /// `from_ts`. Used to resync after a reconnection. Returns the number of
    /// records marked.
    pub fn dirty_entries(&self, from_ts: u64) -> WireResult<usize> {
        let map = self.map()?;
        let mut marked = 0;

        for key in map.store.keys() {
            loop {
                let slot = match map.store.get(&key) {
                    Some(slot) => slot,
                    None => break,
                };

                if slot.record.timestamp < from_ts || slot.record.dirty.get(self.peer) {
                    break;
                }

                let mut raised = slot.clone();
                raised.record.dirty.set(self.peer);

                if map.store.replace_if_equal(&key, &slot, raised) {
                    marked += 1;
                    break;
                }
            }
        }

        if marked > 0 {
            self.notify();
        }

        Ok(marked)
    }
}
