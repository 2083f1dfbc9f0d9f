use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use flint::logging::{self, Logger};
use flint::shared::WireResult;
use flint::{NodeId, Tid};

use crate::csp::Csp;
use crate::repl::state::{ApplyOutcome, ReplicatedMap, ReplicationEntry};
use crate::wire::{Document, Value};

/// Receives the documents produced for one subscription. Implementations
/// enqueue onto a connection's outbound queue; a failed delivery marks the
/// subscriber invalid and drops it from the fan.
pub trait EventSink: Send + Sync {
    fn deliver(&self, doc: Document) -> WireResult<()>;

    /// Called when the subscription ends (unregistered or invalidated).
    fn close(&self) {}
}

/// Entry-level change event, published to map-event subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum MapEvent {
    Insert {
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Update {
        key: Vec<u8>,
        old: Vec<u8>,
        new: Vec<u8>,
    },
    Remove {
        key: Vec<u8>,
        old: Vec<u8>,
    },
}

impl MapEvent {
    pub fn to_document(&self) -> Document {
        match self {
            MapEvent::Insert { key, value } => Document::new()
                .with("insert", Value::Null)
                .with("key", Value::Bytes(key.clone()))
                .with("value", Value::Bytes(value.clone())),
            MapEvent::Update { key, old, new } => Document::new()
                .with("update", Value::Null)
                .with("key", Value::Bytes(key.clone()))
                .with("oldValue", Value::Bytes(old.clone()))
                .with("newValue", Value::Bytes(new.clone())),
            MapEvent::Remove { key, old } => Document::new()
                .with("remove", Value::Null)
                .with("key", Value::Bytes(key.clone()))
                .with("oldValue", Value::Bytes(old.clone())),
        }
    }

    fn from_change(key: &[u8], old: Option<Vec<u8>>, new: Option<&[u8]>) -> Option<MapEvent> {
        match (old, new) {
            (None, Some(new)) => Some(MapEvent::Insert {
                key: key.to_vec(),
                value: new.to_vec(),
            }),
            (Some(old), Some(new)) => Some(MapEvent::Update {
                key: key.to_vec(),
                old,
                new: new.to_vec(),
            }),
            (Some(old), None) => Some(MapEvent::Remove {
                key: key.to_vec(),
                old,
            }),
            (None, None) => None,
        }
    }
}

/// One node of the asset tree: a path-addressed, replicated map plus the
/// subscriber fans hanging off it (map events and named topics).
pub struct Asset {
    path: String,
    map: Arc<ReplicatedMap>,
    listeners: Mutex<Vec<(Tid, Arc<dyn EventSink>)>>,
    topics: Mutex<HashMap<String, Vec<(Tid, Arc<dyn EventSink>)>>>,
    log: Logger,
}

impl Asset {
    fn new(path: &str, id: NodeId, log: &Logger) -> Arc<Asset> {
        Arc::new(Asset {
            path: path.to_string(),
            map: ReplicatedMap::new(id, log),
            listeners: Mutex::new(Vec::new()),
            topics: Mutex::new(HashMap::new()),
            log: log.new(logging::o!("asset" => path.to_string())),
        })
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn map(&self) -> &Arc<ReplicatedMap> {
        &self.map
    }

    pub fn put(&self, key: &[u8], value: Vec<u8>) -> Option<Vec<u8>> {
        let old = self.map.put(key, value.clone());
        if let Some(event) = MapEvent::from_change(key, old.clone(), Some(&value)) {
            self.emit(event);
        }
        old
    }

    pub fn remove(&self, key: &[u8]) -> Option<Vec<u8>> {
        let old = self.map.remove(key);
        if let Some(event) = MapEvent::from_change(key, old.clone(), None) {
            self.emit(event);
        }
        old
    }

    pub fn clear(&self) {
        for (key, _) in self.map.visible_snapshot() {
            self.remove(&key);
        }
    }

    /// Applies a replication entry and, when it wins, publishes the
    /// corresponding map event to local subscribers.
    pub fn apply_remote(&self, entry: &ReplicationEntry) -> ApplyOutcome {
        let outcome = self.map.apply(entry);

        if let ApplyOutcome::Accepted { old } = &outcome {
            let new = if entry.deleted {
                None
            } else {
                entry.value.as_deref()
            };
            if let Some(event) = MapEvent::from_change(&entry.key, old.clone(), new) {
                self.emit(event);
            }
        }

        outcome
    }

    /// Registers a map-event subscriber under its transaction id.
    pub fn subscribe(&self, tid: Tid, sink: Arc<dyn EventSink>) {
        self.listeners.lock().push((tid, sink));
    }

    pub fn subscribe_topic(&self, topic: &str, tid: Tid, sink: Arc<dyn EventSink>) {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(Vec::new)
            .push((tid, sink));
    }

    /// Drops the subscription registered under `tid` from every fan. Returns
    /// true when something was removed.
    pub fn unsubscribe(&self, tid: Tid) -> bool {
        let mut removed = false;

        self.listeners.lock().retain(|(entry_tid, sink)| {
            if *entry_tid == tid {
                sink.close();
                removed = true;
                false
            } else {
                true
            }
        });

        let mut topics = self.topics.lock();
        for subscribers in topics.values_mut() {
            subscribers.retain(|(entry_tid, sink)| {
                if *entry_tid == tid {
                    sink.close();
                    removed = true;
                    false
                } else {
                    true
                }
            });
        }
        topics.retain(|_, subscribers| !subscribers.is_empty());

        removed
    }

    /// Publishes a message on a named topic of this asset.
    pub fn publish(&self, topic: &str, message: Value) {
        let doc = Document::new()
            .with("topic", Value::Text(topic.to_string()))
            .with("message", message);

        let mut topics = self.topics.lock();
        if let Some(subscribers) = topics.get_mut(topic) {
            Self::fan_out(&self.log, subscribers, &doc);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    fn emit(&self, event: MapEvent) {
        let doc = event.to_document();
        Self::fan_out(&self.log, &mut self.listeners.lock(), &doc);
    }

    /// Delivers to every sink, discarding subscribers that fail.
    fn fan_out(log: &Logger, subscribers: &mut Vec<(Tid, Arc<dyn EventSink>)>, doc: &Document) {
        subscribers.retain(|(tid, sink)| match sink.deliver(doc.clone()) {
            Ok(()) => true,
            Err(err) => {
                logging::warn!(log, "subscriber invalid, dropping"; "tid" => tid, "error" => ?err);
                sink.close();
                false
            }
        });
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// The asset tree: assets addressed by path, created on first acquire. All
/// views derived from one path (map, keySet, values, entrySet, topic,
/// replication) share the same underlying asset.
pub struct AssetTree {
    id: NodeId,
    assets: Mutex<HashMap<String, Arc<Asset>>>,
    log: Logger,
}

impl AssetTree {
    pub fn new(id: NodeId, log: &Logger) -> Arc<AssetTree> {
        Arc::new(AssetTree {
            id,
            assets: Mutex::new(HashMap::new()),
            log: log.new(logging::o!("component" => "assets")),
        })
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Resolves the asset a path names, creating it on first use.
    pub fn acquire(&self, csp: &Csp) -> Arc<Asset> {
        let mut assets = self.assets.lock();
        assets
            .entry(csp.path().to_string())
            .or_insert_with(|| {
                logging::debug!(self.log, "asset created"; "path" => csp.path());
                Asset::new(csp.path(), self.id, &self.log)
            })
            .clone()
    }

    #[inline]
    pub fn lookup(&self, path: &str) -> Option<Arc<Asset>> {
        self.assets.lock().get(path).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flint::logging;
    use flint::shared::{ErrorType, WireError};

    struct Collector {
        docs: Mutex<Vec<Document>>,
        fail: bool,
    }

    impl Collector {
        fn new(fail: bool) -> Arc<Collector> {
            Arc::new(Collector {
                docs: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    impl EventSink for Collector {
        fn deliver(&self, doc: Document) -> WireResult<()> {
            if self.fail {
                return Err(WireError::Fatal(ErrorType::ConnectionClosed));
            }
            self.docs.lock().push(doc);
            Ok(())
        }
    }

    fn tree() -> Arc<AssetTree> {
        AssetTree::new(1, &logging::discard())
    }

    fn csp(raw: &str) -> Csp {
        Csp::parse(raw).unwrap()
    }

    #[test]
    fn test_acquire_shares_asset_across_views() {
        let tree = tree();

        let map_view = tree.acquire(&csp("/m?view=map"));
        let key_view = tree.acquire(&csp("/m?view=keySet"));
        let other = tree.acquire(&csp("/n?view=map"));

        assert!(Arc::ptr_eq(&map_view, &key_view));
        assert!(!Arc::ptr_eq(&map_view, &other));
        assert!(tree.lookup("/m").is_some());
        assert!(tree.lookup("/missing").is_none());
    }

    #[test]
    fn test_map_event_sequence() {
        let tree = tree();
        let asset = tree.acquire(&csp("/m?view=map"));

        let sink = Collector::new(false);
        asset.subscribe(7, sink.clone());

        asset.put(b"x", vec![1]);
        asset.put(b"x", vec![2]);
        asset.remove(b"x");

        let docs = sink.docs.lock();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].first().unwrap().0, "insert");
        assert_eq!(docs[1].first().unwrap().0, "update");
        assert_eq!(docs[1].bytes_field("oldValue"), Some(&[1u8][..]));
        assert_eq!(docs[1].bytes_field("newValue"), Some(&[2u8][..]));
        assert_eq!(docs[2].first().unwrap().0, "remove");
    }

    #[test]
    fn test_failing_sink_is_dropped() {
        let tree = tree();
        let asset = tree.acquire(&csp("/m?view=map"));

        asset.subscribe(1, Collector::new(true));
        asset.subscribe(2, Collector::new(false));
        assert_eq!(asset.listener_count(), 2);

        asset.put(b"x", vec![1]);
        assert_eq!(asset.listener_count(), 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let tree = tree();
        let asset = tree.acquire(&csp("/m?view=map"));

        asset.subscribe(7, Collector::new(false));

        assert!(asset.unsubscribe(7));
        assert!(!asset.unsubscribe(7));
    }

    #[test]
    fn test_topic_fan() {
        let tree = tree();
        let asset = tree.acquire(&csp("/m?view=topic"));

        let sink = Collector::new(false);
        asset.subscribe_topic("alerts", 9, sink.clone());

        asset.publish("alerts", Value::Text("fire".to_string()));
        asset.publish("other", Value::Text("ignored".to_string()));

        let docs = sink.docs.lock();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].text_field("topic"), Some("alerts"));
        assert_eq!(docs[0].text_field("message"), Some("fire"));
    }

    #[test]
    fn test_remote_apply_emits_events() {
        let tree = tree();
        let asset = tree.acquire(&csp("/m?view=map"));

        let sink = Collector::new(false);
        asset.subscribe(3, sink.clone());

        let outcome = asset.apply_remote(&ReplicationEntry {
            key: b"k".to_vec(),
            value: Some(vec![5]),
            deleted: false,
            timestamp: 10,
            origin: 2,
        });

        assert_eq!(outcome, ApplyOutcome::Accepted { old: None });
        let docs = sink.docs.lock();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].first().unwrap().0, "insert");
    }

    #[test]
    fn test_remote_stale_apply_is_silent() {
        let tree = tree();
        let asset = tree.acquire(&csp("/m?view=map"));
        asset.put(b"k", vec![1]);
        let ts = asset.map().last_modification_time(2).max(1);

        let sink = Collector::new(false);
        asset.subscribe(3, sink.clone());

        let outcome = asset.apply_remote(&ReplicationEntry {
            key: b"k".to_vec(),
            value: Some(vec![9]),
            deleted: false,
            timestamp: ts.saturating_sub(1),
            origin: 2,
        });

        assert_eq!(outcome, ApplyOutcome::Stale);
        assert!(sink.docs.lock().is_empty());
    }
}
