use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flint::logging::{self, Logger};
use flint::shared::{ErrorType, WireError, WireResult};
use flint::time::next_tid;
use flint::{NodeId, Tid};

use crate::asset::Asset;
use crate::client::Client;
use crate::csp::ViewKind;
use crate::dispatch::EventKind;
use crate::evloop::{EventLoop, Priority, Pump};
use crate::mux::SubCallback;
use crate::repl::iter::ModIter;
use crate::repl::state::ReplicationEntry;
use crate::subs::{OutboundDoc, OutboundSender};
use crate::wire::{Document, Value};

/// Server-side half of a replication session: drains the peer's modification
/// iterator into `replicactionReply` documents on the subscription's tid.
/// Lives on the event loop; reports "did work" per pass and dies with its
/// connection.
pub struct StreamPump {
    iter: Arc<ModIter>,
    sender: OutboundSender,
    tid: Tid,
    closed: Arc<AtomicBool>,
    log: Logger,
}

impl StreamPump {
    pub fn new(
        iter: Arc<ModIter>,
        sender: OutboundSender,
        tid: Tid,
        closed: Arc<AtomicBool>,
        log: &Logger,
    ) -> StreamPump {
        let peer = iter.peer();
        StreamPump {
            iter,
            sender,
            tid,
            closed,
            log: log.new(logging::o!("pump" => "stream", "peer" => peer)),
        }
    }
}

impl Pump for StreamPump {
    fn name(&self) -> &str {
        "replication-stream"
    }

    fn priority(&self) -> Priority {
        Priority::Medium
    }

    fn pump(&mut self) -> WireResult<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WireError::Fatal(ErrorType::ConnectionClosed));
        }

        if !self.iter.has_next() {
            return Ok(false);
        }

        let sender = &self.sender;
        let tid = self.tid;

        self.iter.for_each(|entry| {
            let mut doc =
                Document::new().with(EventKind::ReplicationReply.wire_name(), Value::Null);
            entry.write_fields(&mut doc);

            sender
                .send(OutboundDoc {
                    tid,
                    doc,
                    ready: false,
                })
                .map_err(|_| WireError::Fatal(ErrorType::ConnectionClosed))
        })?;

        Ok(true)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    Handshake,
    Subscribed,
    Streaming,
    Closed,
}

/// Client-side replication session with one remote peer over one asset:
/// identifier exchange, bootstrap handshake, subscription for the peer's
/// entries and a pump pushing local changes out. Inbound entries apply
/// through the conflict-resolution rule; local mutations reach the peer as
/// `replicationEvent` documents.
pub struct PeerSession {
    client: Arc<Client>,
    asset: Arc<Asset>,
    csp: String,
    local_id: NodeId,
    remote_id: NodeId,
    iter: Arc<ModIter>,
    state: Mutex<SessionState>,
    closed: Arc<AtomicBool>,
    log: Logger,
}

impl PeerSession {
    /// Runs the session lifecycle against an already-connected client:
    /// identity exchange, bootstrap, subscribe, resync, pump registration.
    pub fn establish(
        client: Arc<Client>,
        asset: Arc<Asset>,
        evloop: &Arc<EventLoop>,
        log: &Logger,
    ) -> WireResult<Arc<PeerSession>> {
        let csp = format!("{}?view={}", asset.path(), ViewKind::Replication.name());
        let local_id = asset.map().id();

        // Identity exchange.
        let reply = client.call(
            &csp,
            Document::new().with(EventKind::Identifier.wire_name(), Value::Null),
        )?;
        let remote_id = reply
            .i64_field("identifier")
            .ok_or(WireError::Fatal(ErrorType::ProtocolViolation))? as NodeId;

        if remote_id == local_id {
            logging::error!(log, "peer claims our own identifier"; "identifier" => remote_id);
            return Err(WireError::Fatal(ErrorType::AssertionFailed));
        }

        // Bootstrap handshake.
        let iter = asset.map().acquire_iterator(remote_id);
        let last_seen = asset.map().last_modification_time(remote_id);

        let reply = client.call(
            &csp,
            Document::new()
                .with(EventKind::Bootstrap.wire_name(), Value::Null)
                .with("identifier", Value::I8(local_id as i8))
                .with("lastUpdatedTime", Value::I64(last_seen as i64)),
        )?;
        let remote_last_updated = reply.i64_field("lastUpdatedTime").unwrap_or(0) as u64;

        let session = Arc::new(PeerSession {
            log: log.new(logging::o!(
                "component" => "repl-session",
                "local" => local_id,
                "remote" => remote_id
            )),
            client: client.clone(),
            asset: asset.clone(),
            csp: csp.clone(),
            local_id,
            remote_id,
            iter: iter.clone(),
            state: Mutex::new(SessionState::Handshake),
            closed: Arc::new(AtomicBool::new(false)),
        });

        logging::debug!(session.log, "bootstrap complete";
                        "remote_last_updated" => remote_last_updated);

        // Subscribe to the peer's stream.
        let callback: SubCallback = {
            let session = session.clone();
            Arc::new(move |doc, ready| session.on_stream_event(doc, ready))
        };
        client.subscribe(
            &csp,
            Document::new()
                .with(EventKind::ReplicationSubscribe.wire_name(), Value::Null)
                .with("identifier", Value::I8(local_id as i8)),
            callback,
        )?;
        *session.state.lock() = SessionState::Subscribed;

        // Resync before the first pump pass, so nothing written between the
        // handshake and the first drain is lost.
        let from = if remote_last_updated > 0 {
            remote_last_updated
        } else {
            asset.map().bootstrap_timestamp(remote_id)
        };
        iter.dirty_entries(from)?;

        iter.set_modification_notifier(evloop.notifier());
        *session.state.lock() = SessionState::Streaming;

        evloop.register(Box::new(SessionPump {
            session: session.clone(),
        }));

        logging::debug!(session.log, "session streaming");
        Ok(session)
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    #[inline]
    pub fn remote_id(&self) -> NodeId {
        self.remote_id
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        *self.state.lock() = SessionState::Closed;
    }

    /// Handles one document arriving on the subscription tid.
    fn on_stream_event(&self, doc: &Document, ready: bool) {
        let event = doc.first().map(|(name, _)| name);

        match event.and_then(EventKind::parse) {
            Some(EventKind::ReplicationReply) => match ReplicationEntry::from_document(doc) {
                Ok(entry) => {
                    self.asset.apply_remote(&entry);
                }
                Err(err) => {
                    logging::warn!(self.log, "malformed replication entry"; "error" => ?err);
                }
            },
            // Terminal `reply: null` ends the stream.
            _ if ready && doc.get("reply").map_or(false, Value::is_null) => {
                logging::debug!(self.log, "stream ended by the peer");
                self.close();
            }
            other => {
                // Anything else means the two sides lost step; fall back to
                // the beginning of the lifecycle.
                logging::warn!(self.log, "unexpected event in session";
                               "event" => other.map(EventKind::wire_name).unwrap_or("?"),
                               "state" => ?self.state());
                *self.state.lock() = SessionState::Handshake;
            }
        }
    }

    /// Pushes local dirty entries to the peer. Returns "did work".
    fn pump(&self) -> WireResult<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WireError::Fatal(ErrorType::ConnectionClosed));
        }

        if self.state() != SessionState::Streaming || !self.iter.has_next() {
            return Ok(false);
        }

        let client = &self.client;
        let csp = &self.csp;
        let tid = next_tid();

        self.iter.for_each(|entry| {
            let mut doc =
                Document::new().with(EventKind::ReplicationEvent.wire_name(), Value::Null);
            entry.write_fields(&mut doc);
            client.send_document(&crate::client::Target::Path(csp.clone()), tid, &doc, true)
        })?;

        Ok(true)
    }
}

/// Event-loop adapter for a client-side session.
struct SessionPump {
    session: Arc<PeerSession>,
}

impl Pump for SessionPump {
    fn name(&self) -> &str {
        "replication-session"
    }

    fn priority(&self) -> Priority {
        Priority::Medium
    }

    fn pump(&mut self) -> WireResult<bool> {
        self.session.pump()
    }
}
