use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flint::logging::{self, Logger};
use flint::shared::{ErrorType, WireError, WireResult};
use flint::Tid;

use crate::wire::Document;

/// A parked synchronous call: the reader fulfills it, the caller waits with a
/// deadline. One-shot.
pub struct SyncSlot {
    slot: Mutex<Option<WireResult<Document>>>,
    cond: Condvar,
}

impl SyncSlot {
    fn new() -> Arc<SyncSlot> {
        Arc::new(SyncSlot {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    pub fn fulfill(&self, result: WireResult<Document>) {
        let mut slot = self.slot.lock();
        *slot = Some(result);
        self.cond.notify_all();
    }

    /// Parks until the response arrives or the timeout elapses.
    pub fn wait(&self, timeout: Duration) -> WireResult<Document> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();

        while slot.is_none() {
            if self.cond.wait_until(&mut slot, deadline).timed_out() {
                return Err(WireError::Fatal(ErrorType::Timeout));
            }
        }

        slot.take().expect("Fulfilled slot must hold a result")
    }
}

/// How an inbound document was routed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Routed {
    Sync,
    Subscription,
    Unclaimed,
}

/// Subscription callback: receives each document arriving under the
/// subscription's tid, together with its ready flag.
pub type SubCallback = Arc<dyn Fn(&Document, bool) + Send + Sync>;

/// Client-side transaction multiplexer: routes each inbound document to the
/// waiter registered under its tid. Synchronous waiters are one-shot and
/// removed on delivery; subscriptions persist until explicitly removed.
pub struct Multiplexer {
    sync: Mutex<HashMap<Tid, Arc<SyncSlot>>>,
    subs: Mutex<HashMap<Tid, SubCallback>>,
    log: Logger,
}

impl Multiplexer {
    pub fn new(log: &Logger) -> Arc<Multiplexer> {
        Arc::new(Multiplexer {
            sync: Mutex::new(HashMap::new()),
            subs: Mutex::new(HashMap::new()),
            log: log.new(logging::o!("component" => "mux")),
        })
    }

    /// Registers a synchronous waiter under a fresh tid, before the request
    /// is transmitted.
    pub fn register_sync(&self, tid: Tid) -> Arc<SyncSlot> {
        let slot = SyncSlot::new();
        let previous = self.sync.lock().insert(tid, slot.clone());
        assert!(previous.is_none(), "Tid reused by a concurrent request");
        slot
    }

    /// Abandons a synchronous waiter (deadline elapsed before delivery).
    pub fn cancel_sync(&self, tid: Tid) -> bool {
        self.sync.lock().remove(&tid).is_some()
    }

    pub fn register_subscription(&self, tid: Tid, callback: SubCallback) {
        self.subs.lock().insert(tid, callback);
    }

    pub fn remove_subscription(&self, tid: Tid) -> bool {
        self.subs.lock().remove(&tid).is_some()
    }

    #[inline]
    pub fn has_subscription(&self, tid: Tid) -> bool {
        self.subs.lock().contains_key(&tid)
    }

    /// Routes one inbound document by tid.
    pub fn route(&self, tid: Tid, doc: Document, ready: bool) -> Routed {
        if let Some(slot) = self.sync.lock().remove(&tid) {
            slot.fulfill(Ok(doc));
            return Routed::Sync;
        }

        let callback = self.subs.lock().get(&tid).cloned();
        if let Some(callback) = callback {
            callback(&doc, ready);
            return Routed::Subscription;
        }

        logging::trace!(self.log, "unclaimed document"; "tid" => tid);
        Routed::Unclaimed
    }

    /// Wakes every parked synchronous caller with a failure. Subscriptions
    /// stay registered; the channel owner reapplies them after reconnect.
    pub fn fail_all_sync(&self, kind: ErrorType) {
        let drained: Vec<_> = self.sync.lock().drain().collect();
        for (tid, slot) in drained {
            logging::debug!(self.log, "sync waiter failed"; "tid" => tid, "error" => ?kind);
            slot.fulfill(Err(WireError::Fatal(kind)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Value;
    use flint::logging;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn mux() -> Arc<Multiplexer> {
        Multiplexer::new(&logging::discard())
    }

    #[test]
    fn test_sync_waiter_roundtrip() {
        let mux = mux();
        let slot = mux.register_sync(7);

        let routed = {
            let mux = mux.clone();
            thread::spawn(move || {
                mux.route(7, Document::new().with("reply", Value::I32(5)), true)
            })
        };

        let doc = slot.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(doc.i64_field("reply"), Some(5));
        assert_eq!(routed.join().unwrap(), Routed::Sync);

        // The waiter was consumed.
        assert_eq!(
            mux.route(7, Document::new(), true),
            Routed::Unclaimed
        );
    }

    #[test]
    fn test_sync_waiter_times_out() {
        let mux = mux();
        let slot = mux.register_sync(7);

        let started = Instant::now();
        let result = slot.wait(Duration::from_millis(50));

        assert_eq!(result, Err(WireError::Fatal(ErrorType::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(mux.cancel_sync(7));
    }

    #[test]
    fn test_subscription_persists_across_deliveries() {
        let mux = mux();
        let count = Arc::new(AtomicUsize::new(0));

        let seen = count.clone();
        mux.register_subscription(
            9,
            Arc::new(move |_doc, ready| {
                assert!(!ready);
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        for _ in 0..3 {
            assert_eq!(
                mux.route(9, Document::new().with("reply", Value::Null), false),
                Routed::Subscription
            );
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);

        assert!(mux.remove_subscription(9));
        assert_eq!(mux.route(9, Document::new(), false), Routed::Unclaimed);
    }

    #[test]
    fn test_fail_all_sync_leaves_subscriptions() {
        let mux = mux();
        let slot = mux.register_sync(1);
        mux.register_subscription(2, Arc::new(|_, _| ()));

        mux.fail_all_sync(ErrorType::ConnectionClosed);

        assert_eq!(
            slot.wait(Duration::from_secs(1)),
            Err(WireError::Fatal(ErrorType::ConnectionClosed))
        );
        assert!(mux.has_subscription(2));
    }

    #[test]
    #[should_panic(expected = "Tid reused by a concurrent request")]
    fn test_tid_reuse_detected() {
        let mux = mux();
        let _first = mux.register_sync(1);
        let _second = mux.register_sync(1);
    }
}
