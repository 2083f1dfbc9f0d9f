use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use flint::logging::{self, Logger};
use flint::shared::{ErrorType, WireError, WireResult};
use flint::Tid;

use crate::asset::{Asset, AssetTree};
use crate::csp::{Csp, ViewKind};
use crate::evloop::EventLoop;
use crate::net::channel::{Channel, InboundMessage, RemotePeer};
use crate::repl::hub::StreamPump;
use crate::repl::state::ReplicationEntry;
use crate::subs::{OutboundDoc, SubRegistry};
use crate::wire::{Document, Value};

/// The full event catalogue. Names are case-sensitive ASCII; the two
/// misspellings (`bootstap`, `replicactionReply`) are wire-stable and must be
/// both emitted and accepted.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventKind {
    Put,
    Remove,
    Get,
    GetAndPut,
    GetAndRemove,
    PutIfAbsent,
    Replace,
    ReplaceForOld,
    RemoveWithValue,
    ContainsKey,
    ContainsValue,
    Size,
    Clear,
    KeySet,
    Values,
    EntrySet,
    RegisterSubscriber,
    UnregisterSubscriber,
    Publish,
    RegisterTopicSubscriber,
    OnEndOfSubscription,
    Userid,
    Heartbeat,
    HeartbeatReply,
    Identifier,
    IdentifierReply,
    Bootstrap,
    BootstrapReply,
    ReplicationSubscribe,
    ReplicationEvent,
    ReplicationReply,
}

impl EventKind {
    pub fn parse(name: &str) -> Option<EventKind> {
        let kind = match name {
            "put" => EventKind::Put,
            "remove" => EventKind::Remove,
            "get" => EventKind::Get,
            "getAndPut" => EventKind::GetAndPut,
            "getAndRemove" => EventKind::GetAndRemove,
            "putIfAbsent" => EventKind::PutIfAbsent,
            "replace" => EventKind::Replace,
            "replaceForOld" => EventKind::ReplaceForOld,
            "removeWithValue" => EventKind::RemoveWithValue,
            "containsKey" => EventKind::ContainsKey,
            "containsValue" => EventKind::ContainsValue,
            "size" => EventKind::Size,
            "clear" => EventKind::Clear,
            "keySet" => EventKind::KeySet,
            "values" => EventKind::Values,
            "entrySet" => EventKind::EntrySet,
            "registerSubscriber" => EventKind::RegisterSubscriber,
            "unRegisterSubscriber" => EventKind::UnregisterSubscriber,
            "publish" => EventKind::Publish,
            "registerTopicSubscriber" => EventKind::RegisterTopicSubscriber,
            "onEndOfSubscription" => EventKind::OnEndOfSubscription,
            "userid" => EventKind::Userid,
            "heartbeat" => EventKind::Heartbeat,
            "heartbeatReply" => EventKind::HeartbeatReply,
            "identifier" => EventKind::Identifier,
            "identifierReply" => EventKind::IdentifierReply,
            "bootstap" => EventKind::Bootstrap,
            "bootstrapReply" => EventKind::BootstrapReply,
            "replicationSubscribe" => EventKind::ReplicationSubscribe,
            "replicationEvent" => EventKind::ReplicationEvent,
            "replicactionReply" => EventKind::ReplicationReply,
            _ => return None,
        };
        Some(kind)
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            EventKind::Put => "put",
            EventKind::Remove => "remove",
            EventKind::Get => "get",
            EventKind::GetAndPut => "getAndPut",
            EventKind::GetAndRemove => "getAndRemove",
            EventKind::PutIfAbsent => "putIfAbsent",
            EventKind::Replace => "replace",
            EventKind::ReplaceForOld => "replaceForOld",
            EventKind::RemoveWithValue => "removeWithValue",
            EventKind::ContainsKey => "containsKey",
            EventKind::ContainsValue => "containsValue",
            EventKind::Size => "size",
            EventKind::Clear => "clear",
            EventKind::KeySet => "keySet",
            EventKind::Values => "values",
            EventKind::EntrySet => "entrySet",
            EventKind::RegisterSubscriber => "registerSubscriber",
            EventKind::UnregisterSubscriber => "unRegisterSubscriber",
            EventKind::Publish => "publish",
            EventKind::RegisterTopicSubscriber => "registerTopicSubscriber",
            EventKind::OnEndOfSubscription => "onEndOfSubscription",
            EventKind::Userid => "userid",
            EventKind::Heartbeat => "heartbeat",
            EventKind::HeartbeatReply => "heartbeatReply",
            EventKind::Identifier => "identifier",
            EventKind::IdentifierReply => "identifierReply",
            EventKind::Bootstrap => "bootstap",
            EventKind::BootstrapReply => "bootstrapReply",
            EventKind::ReplicationSubscribe => "replicationSubscribe",
            EventKind::ReplicationEvent => "replicationEvent",
            EventKind::ReplicationReply => "replicactionReply",
        }
    }
}

/// Server-side demultiplexer: parses the event name once, resolves the view
/// the meta document addresses and invokes the handler. Protocol violations
/// (null arguments, unknown events) are logged with the reply omitted; the
/// connection is kept.
pub struct Dispatcher {
    tree: Arc<AssetTree>,
    registry: Arc<SubRegistry>,
    evloop: Arc<EventLoop>,
    log: Logger,
}

impl Dispatcher {
    pub fn new(
        tree: Arc<AssetTree>,
        registry: Arc<SubRegistry>,
        evloop: Arc<EventLoop>,
        log: &Logger,
    ) -> Dispatcher {
        Dispatcher {
            tree,
            registry,
            evloop,
            log: log.new(logging::o!("component" => "dispatch")),
        }
    }

    pub fn dispatch(&self, channel: &mut Channel, message: InboundMessage) -> WireResult<()> {
        let tid = match message.meta.i64_field("tid") {
            Some(tid) => tid as Tid,
            None => {
                logging::warn!(self.log, "request without tid");
                return Ok(());
            }
        };

        let name = match message.data.first() {
            Some((name, _)) => name,
            None => {
                logging::warn!(self.log, "empty data document"; "tid" => tid);
                return Ok(());
            }
        };

        let kind = match EventKind::parse(name) {
            Some(kind) => kind,
            None => {
                logging::warn!(self.log, "unknown event"; "tid" => tid, "event" => name.to_string());
                return Ok(());
            }
        };

        // System traffic carries no view address.
        match kind {
            EventKind::Heartbeat => {
                return self.enqueue(
                    channel,
                    0,
                    Document::new().with(EventKind::HeartbeatReply.wire_name(), Value::Null),
                    true,
                );
            }
            EventKind::HeartbeatReply => return Ok(()),
            EventKind::Userid => {
                if let Some(user) = message.data.text_field("userid") {
                    logging::debug!(self.log, "user identified"; "user" => user.to_string());
                    channel.set_user(user.to_string());
                } else {
                    logging::warn!(self.log, "userid event without a user");
                }
                return Ok(());
            }
            _ => (),
        }

        let (csp, _cid) = match channel.binder.resolve(&message.meta) {
            Ok(resolved) => resolved,
            Err(_) => {
                logging::warn!(self.log, "unresolvable view address";
                               "tid" => tid, "event" => kind.wire_name());
                return Ok(());
            }
        };

        let asset = self.tree.acquire(&csp);

        let outcome = self.handle(channel, &asset, &csp, tid, kind, &message.data);

        match outcome {
            Err(WireError::Fatal(ErrorType::ProtocolViolation)) => {
                // Logged, reply omitted, connection kept.
                logging::warn!(self.log, "protocol violation";
                               "tid" => tid, "event" => kind.wire_name());
                Ok(())
            }
            other => other,
        }
    }

    fn handle(
        &self,
        channel: &mut Channel,
        asset: &Arc<Asset>,
        csp: &Arc<Csp>,
        tid: Tid,
        kind: EventKind,
        data: &Document,
    ) -> WireResult<()> {
        match kind {
            EventKind::Put => {
                let key = require_bytes(data, "key")?;
                let value = require_bytes(data, "value")?;
                asset.put(&key, value);
                Ok(())
            }
            EventKind::Remove => {
                let key = require_bytes(data, "key")?;
                asset.remove(&key);
                Ok(())
            }
            EventKind::Get => {
                let key = require_bytes(data, "key")?;
                self.enqueue_reply(channel, tid, opt_bytes(asset.map().get(&key)))
            }
            EventKind::GetAndPut => {
                let key = require_bytes(data, "key")?;
                let value = require_bytes(data, "value")?;
                let old = asset.put(&key, value);
                let reply = if csp.put_returns_null() {
                    Value::Null
                } else {
                    opt_bytes(old)
                };
                self.enqueue_reply(channel, tid, reply)
            }
            EventKind::GetAndRemove => {
                let key = require_bytes(data, "key")?;
                let old = asset.remove(&key);
                let reply = if csp.remove_returns_null() {
                    Value::Null
                } else {
                    opt_bytes(old)
                };
                self.enqueue_reply(channel, tid, reply)
            }
            EventKind::PutIfAbsent => {
                let key = require_bytes(data, "key")?;
                let value = require_bytes(data, "value")?;

                let existing = match asset.map().get(&key) {
                    Some(existing) => Some(existing),
                    None => {
                        asset.put(&key, value);
                        None
                    }
                };
                self.enqueue_reply(channel, tid, opt_bytes(existing))
            }
            EventKind::Replace => {
                let key = require_bytes(data, "key")?;
                let value = require_bytes(data, "value")?;

                let old = match asset.map().get(&key) {
                    Some(_) => asset.put(&key, value),
                    None => None,
                };
                self.enqueue_reply(channel, tid, opt_bytes(old))
            }
            EventKind::ReplaceForOld => {
                let key = require_bytes(data, "key")?;
                let old = require_bytes(data, "oldValue")?;
                let new = require_bytes(data, "newValue")?;

                let swapped = asset.map().get(&key).as_deref() == Some(&old[..]);
                if swapped {
                    asset.put(&key, new);
                }
                self.enqueue_reply(channel, tid, Value::Bool(swapped))
            }
            EventKind::RemoveWithValue => {
                let key = require_bytes(data, "key")?;
                let value = require_bytes(data, "value")?;

                let removed = asset.map().get(&key).as_deref() == Some(&value[..]);
                if removed {
                    asset.remove(&key);
                }
                self.enqueue_reply(channel, tid, Value::Bool(removed))
            }
            EventKind::ContainsKey => {
                let key = require_bytes(data, "key")?;
                self.enqueue_reply(channel, tid, Value::Bool(asset.map().contains_key(&key)))
            }
            EventKind::ContainsValue => {
                let value = require_bytes(data, "value")?;
                self.enqueue_reply(channel, tid, Value::Bool(asset.map().contains_value(&value)))
            }
            EventKind::Size => {
                self.enqueue_reply(channel, tid, Value::I64(asset.map().size() as i64))
            }
            EventKind::Clear => {
                asset.clear();
                Ok(())
            }
            EventKind::KeySet | EventKind::Values | EventKind::EntrySet => {
                let view = match kind {
                    EventKind::KeySet => ViewKind::KeySet,
                    EventKind::Values => ViewKind::Values,
                    _ => ViewKind::EntrySet,
                };

                // Collection views are never materialised into the reply; the
                // client gets a proxy address and iterates against that.
                let derived = Arc::new(csp.derived(view));
                let cid = channel.binder.bind(derived.clone());

                let proxy = Document::new()
                    .with("type", Value::Text("set-proxy".to_string()))
                    .with("csp", Value::Text(derived.as_str().to_string()))
                    .with("cid", Value::I64(cid as i64));
                self.enqueue_reply(channel, tid, Value::Nested(proxy))
            }
            EventKind::RegisterSubscriber => {
                self.registry
                    .register_map(tid, asset, channel.outbound_sender(), csp.bootstrap());
                channel.track_subscription(tid);
                Ok(())
            }
            EventKind::UnregisterSubscriber => {
                self.registry.unregister(tid, &channel.outbound_sender());
                channel.untrack_subscription(tid);
                Ok(())
            }
            EventKind::Publish => {
                let topic = require_text(data, "topic")?;
                let message = data
                    .get("message")
                    .filter(|message| !message.is_null())
                    .ok_or(WireError::Fatal(ErrorType::ProtocolViolation))?;
                asset.publish(&topic, message.clone());
                Ok(())
            }
            EventKind::RegisterTopicSubscriber => {
                let topic = require_text(data, "topic")?;
                self.registry
                    .register_topic(tid, asset, &topic, channel.outbound_sender());
                channel.track_subscription(tid);
                Ok(())
            }
            EventKind::OnEndOfSubscription => Ok(()),
            EventKind::Identifier => {
                let reply = Document::new()
                    .with(
                        EventKind::IdentifierReply.wire_name(),
                        Value::I8(self.tree.id() as i8),
                    )
                    .with("identifier", Value::I8(self.tree.id() as i8));
                self.enqueue(channel, tid, reply, true)
            }
            EventKind::Bootstrap => {
                let remote_id = require_i64(data, "identifier")? as u8;
                let last_updated = require_i64(data, "lastUpdatedTime")? as u64;

                channel.remotes.insert(
                    csp.path().to_string(),
                    RemotePeer {
                        id: remote_id,
                        last_updated,
                    },
                );
                asset.map().acquire_iterator(remote_id);

                logging::debug!(self.log, "bootstrap request";
                                "peer" => remote_id, "last_updated" => last_updated);

                let reply = Document::new()
                    .with(EventKind::BootstrapReply.wire_name(), Value::Null)
                    .with("identifier", Value::I8(self.tree.id() as i8))
                    .with(
                        "lastUpdatedTime",
                        Value::I64(asset.map().last_modification_time(remote_id) as i64),
                    );
                self.enqueue(channel, tid, reply, true)
            }
            EventKind::BootstrapReply | EventKind::IdentifierReply => {
                // Client-side events; a server receiving one is out of step.
                logging::warn!(self.log, "unexpected reply event on the server";
                               "event" => kind.wire_name());
                Ok(())
            }
            EventKind::ReplicationSubscribe => {
                let remote_id = require_i64(data, "identifier")? as u8;

                let iter = asset.map().acquire_iterator(remote_id);

                // Resync first, so nothing written between the peer's
                // handshake and this pump's first pass is lost.
                let from = channel
                    .remotes
                    .get(csp.path())
                    .map(|remote| remote.last_updated)
                    .filter(|last_updated| *last_updated > 0)
                    .unwrap_or_else(|| asset.map().bootstrap_timestamp(remote_id));
                iter.dirty_entries(from)?;

                let closed = Arc::new(AtomicBool::new(false));
                iter.set_modification_notifier(self.evloop.notifier());

                self.registry.register_replication(
                    tid,
                    asset,
                    channel.outbound_sender(),
                    closed.clone(),
                );
                channel.track_subscription(tid);
                channel.track_kill_switch(closed.clone());

                self.evloop.register(Box::new(StreamPump::new(
                    iter,
                    channel.outbound_sender(),
                    tid,
                    closed,
                    &self.log,
                )));

                logging::debug!(self.log, "replication stream started";
                                "peer" => remote_id, "tid" => tid);
                Ok(())
            }
            EventKind::ReplicationEvent | EventKind::ReplicationReply => {
                let entry = ReplicationEntry::from_document(data)?;
                asset.apply_remote(&entry);
                Ok(())
            }
            EventKind::Userid | EventKind::Heartbeat | EventKind::HeartbeatReply => {
                unreachable!("system events handled before view resolution")
            }
        }
    }

    fn enqueue_reply(&self, channel: &Channel, tid: Tid, value: Value) -> WireResult<()> {
        self.enqueue(channel, tid, Document::new().with("reply", value), true)
    }

    fn enqueue(&self, channel: &Channel, tid: Tid, doc: Document, ready: bool) -> WireResult<()> {
        channel
            .outbound_sender()
            .send(OutboundDoc { tid, doc, ready })
            .map_err(|_| WireError::Fatal(ErrorType::ConnectionClosed))
    }
}

fn require_bytes(doc: &Document, name: &str) -> WireResult<Vec<u8>> {
    match doc.get(name) {
        Some(Value::Bytes(bytes)) => Ok(bytes.clone()),
        _ => Err(WireError::Fatal(ErrorType::ProtocolViolation)),
    }
}

fn require_text(doc: &Document, name: &str) -> WireResult<String> {
    match doc.get(name) {
        Some(Value::Text(text)) => Ok(text.clone()),
        _ => Err(WireError::Fatal(ErrorType::ProtocolViolation)),
    }
}

fn require_i64(doc: &Document, name: &str) -> WireResult<i64> {
    doc.i64_field(name)
        .ok_or(WireError::Fatal(ErrorType::ProtocolViolation))
}

#[inline]
fn opt_bytes(value: Option<Vec<u8>>) -> Value {
    match value {
        Some(bytes) => Value::Bytes(bytes),
        None => Value::Null,
    }
}
