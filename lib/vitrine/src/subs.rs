use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use flint::logging::{self, Logger};
use flint::shared::{ErrorType, WireError, WireResult};
use flint::Tid;

use crate::asset::{Asset, EventSink};
use crate::wire::{Document, Value};

/// A document queued for transmission on a connection, tagged with the
/// transaction id it belongs to. `ready = false` marks a streaming
/// continuation of a still-open logical reply.
#[derive(Debug)]
pub struct OutboundDoc {
    pub tid: Tid,
    pub doc: Document,
    pub ready: bool,
}

/// The per-connection publish queue. Enqueues are wait-free; the channel
/// writer drains serially.
pub type OutboundSender = mpsc::Sender<OutboundDoc>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SubKind {
    MapEvent,
    Topic,
    Replication,
}

/// Wraps each subscription event in a `reply` document and enqueues it on
/// the owning connection. The sink fails once the connection is gone, which
/// invalidates the subscriber upstream.
struct QueueSink {
    tid: Tid,
    sender: OutboundSender,
    /// Set when the subscription should announce its end to the client.
    end_event: bool,
}

impl EventSink for QueueSink {
    fn deliver(&self, doc: Document) -> WireResult<()> {
        let data = Document::new().with("reply", Value::Nested(doc));

        self.sender
            .send(OutboundDoc {
                tid: self.tid,
                doc: data,
                ready: false,
            })
            .map_err(|_| WireError::Fatal(ErrorType::ConnectionClosed))
    }

    fn close(&self) {
        if self.end_event {
            // Best effort; the connection may already be gone.
            let _ = self.sender.send(OutboundDoc {
                tid: self.tid,
                doc: Document::new().with("onEndOfSubscription", Value::Null),
                ready: false,
            });
        }
    }
}

struct SubEntry {
    asset: Arc<Asset>,
    kind: SubKind,
    sender: OutboundSender,
    /// Kill switch for the replication pump bound to this subscription.
    closed: Option<Arc<AtomicBool>>,
}

/// Server-side registry binding a transaction id to a long-lived listener on
/// an asset.
pub struct SubRegistry {
    entries: Mutex<HashMap<Tid, SubEntry>>,
    log: Logger,
}

impl SubRegistry {
    pub fn new(log: &Logger) -> Arc<SubRegistry> {
        Arc::new(SubRegistry {
            entries: Mutex::new(HashMap::new()),
            log: log.new(logging::o!("component" => "subs")),
        })
    }

    /// Installs a map-event subscriber. With `bootstrap` set, the current
    /// visible entries are streamed as inserts before live events.
    pub fn register_map(
        &self,
        tid: Tid,
        asset: &Arc<Asset>,
        sender: OutboundSender,
        bootstrap: bool,
    ) {
        let sink = Arc::new(QueueSink {
            tid,
            sender: sender.clone(),
            end_event: false,
        });

        if bootstrap {
            for (key, value) in asset.map().visible_snapshot() {
                let event = Document::new()
                    .with("insert", Value::Null)
                    .with("key", Value::Bytes(key))
                    .with("value", Value::Bytes(value));
                if sink.deliver(event).is_err() {
                    return;
                }
            }
        }

        asset.subscribe(tid, sink);
        self.insert(tid, asset.clone(), SubKind::MapEvent, sender, None);
        logging::debug!(self.log, "map subscriber registered"; "tid" => tid, "path" => asset.path());
    }

    /// Installs a streaming topic subscriber; its end is announced with a
    /// single `onEndOfSubscription` event.
    pub fn register_topic(
        &self,
        tid: Tid,
        asset: &Arc<Asset>,
        topic: &str,
        sender: OutboundSender,
    ) {
        let sink = Arc::new(QueueSink {
            tid,
            sender: sender.clone(),
            end_event: true,
        });

        asset.subscribe_topic(topic, tid, sink);
        self.insert(tid, asset.clone(), SubKind::Topic, sender, None);
        logging::debug!(
            self.log, "topic subscriber registered";
            "tid" => tid, "path" => asset.path(), "topic" => topic
        );
    }

    /// Tracks a replication stream so connection teardown can stop its pump.
    pub fn register_replication(
        &self,
        tid: Tid,
        asset: &Arc<Asset>,
        sender: OutboundSender,
        closed: Arc<AtomicBool>,
    ) {
        self.insert(tid, asset.clone(), SubKind::Replication, sender, Some(closed));
        logging::debug!(self.log, "replication stream registered"; "tid" => tid, "path" => asset.path());
    }

    fn insert(
        &self,
        tid: Tid,
        asset: Arc<Asset>,
        kind: SubKind,
        sender: OutboundSender,
        closed: Option<Arc<AtomicBool>>,
    ) {
        self.entries.lock().insert(
            tid,
            SubEntry {
                asset,
                kind,
                sender,
                closed,
            },
        );
    }

    /// Removes the listener registered under `tid` and acknowledges with a
    /// terminal `reply: null` document. Unregistering an unknown tid logs a
    /// warning and still acknowledges, making the operation idempotent.
    pub fn unregister(&self, tid: Tid, sender: &OutboundSender) {
        let entry = self.entries.lock().remove(&tid);

        match entry {
            Some(entry) => {
                entry.asset.unsubscribe(tid);
                if let Some(closed) = entry.closed {
                    closed.store(true, Ordering::Release);
                }
                logging::debug!(self.log, "subscriber unregistered"; "tid" => tid, "kind" => ?entry.kind);
            }
            None => {
                logging::warn!(self.log, "unregister for unknown subscriber"; "tid" => tid);
            }
        }

        let _ = sender.send(OutboundDoc {
            tid,
            doc: Document::new().with("reply", Value::Null),
            ready: true,
        });
    }

    /// Tears down every subscription belonging to a closed connection. No
    /// terminal documents; there is nobody left to read them.
    pub fn drop_connection(&self, tids: &[Tid]) {
        let mut entries = self.entries.lock();

        for tid in tids {
            if let Some(entry) = entries.remove(tid) {
                entry.asset.unsubscribe(*tid);
                if let Some(closed) = entry.closed {
                    closed.store(true, Ordering::Release);
                }
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetTree;
    use crate::csp::Csp;
    use flint::logging;

    fn setup() -> (Arc<SubRegistry>, Arc<Asset>) {
        let tree = AssetTree::new(1, &logging::discard());
        let asset = tree.acquire(&Csp::parse("/m?view=map").unwrap());
        (SubRegistry::new(&logging::discard()), asset)
    }

    #[test]
    fn test_map_events_stream_on_one_tid() {
        let (registry, asset) = setup();
        let (tx, rx) = mpsc::channel();

        registry.register_map(42, &asset, tx, false);

        asset.put(b"x", vec![1]);
        asset.put(b"x", vec![2]);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());

        assert_eq!(first.tid, 42);
        assert_eq!(second.tid, 42);
        assert!(!first.ready);
        assert!(!second.ready);

        let insert = first.doc.get("reply").unwrap().as_nested().unwrap();
        assert_eq!(insert.first().unwrap().0, "insert");
        let update = second.doc.get("reply").unwrap().as_nested().unwrap();
        assert_eq!(update.first().unwrap().0, "update");
    }

    #[test]
    fn test_bootstrap_snapshot_precedes_live_events() {
        let (registry, asset) = setup();
        asset.put(b"seed", vec![9]);

        let (tx, rx) = mpsc::channel();
        registry.register_map(42, &asset, tx, true);

        asset.put(b"live", vec![1]);

        let snapshot = rx.try_recv().unwrap();
        let live = rx.try_recv().unwrap();

        let doc = snapshot.doc.get("reply").unwrap().as_nested().unwrap();
        assert_eq!(doc.bytes_field("key"), Some(&b"seed"[..]));
        let doc = live.doc.get("reply").unwrap().as_nested().unwrap();
        assert_eq!(doc.bytes_field("key"), Some(&b"live"[..]));
    }

    #[test]
    fn test_unregister_sends_terminal_and_is_idempotent() {
        let (registry, asset) = setup();
        let (tx, rx) = mpsc::channel();

        registry.register_map(42, &asset, tx.clone(), false);
        assert_eq!(registry.len(), 1);

        registry.unregister(42, &tx);
        assert_eq!(registry.len(), 0);

        let terminal = rx.try_recv().unwrap();
        assert_eq!(terminal.tid, 42);
        assert!(terminal.ready);
        assert!(terminal.doc.get("reply").unwrap().is_null());

        // No events after the terminal document.
        asset.put(b"x", vec![1]);
        assert!(rx.try_recv().is_err());

        // Unknown tid still acknowledges.
        registry.unregister(42, &tx);
        let ack = rx.try_recv().unwrap();
        assert!(ack.doc.get("reply").unwrap().is_null());
    }

    #[test]
    fn test_topic_close_announces_end() {
        let (registry, asset) = setup();
        let (tx, rx) = mpsc::channel();

        registry.register_topic(7, &asset, "alerts", tx.clone());
        asset.publish("alerts", Value::Text("one".to_string()));

        registry.unregister(7, &tx);

        let event = rx.try_recv().unwrap();
        assert_eq!(
            event
                .doc
                .get("reply")
                .unwrap()
                .as_nested()
                .unwrap()
                .text_field("message"),
            Some("one")
        );

        let end = rx.try_recv().unwrap();
        assert_eq!(end.doc.first().unwrap().0, "onEndOfSubscription");

        let terminal = rx.try_recv().unwrap();
        assert!(terminal.ready);
    }

    #[test]
    fn test_drop_connection_stops_pumps() {
        let (registry, asset) = setup();
        let (tx, _rx) = mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));

        registry.register_replication(9, &asset, tx, closed.clone());
        registry.drop_connection(&[9]);

        assert!(closed.load(Ordering::Acquire));
        assert_eq!(registry.len(), 0);
    }
}
