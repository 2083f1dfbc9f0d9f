use hashbrown::HashMap;
use parking_lot::Mutex;
use std::io;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flint::logging::{self, Logger};
use flint::shared::{ErrorType, WireError, WireResult};
use flint::time::next_tid;
use flint::{Cid, Tid};

use crate::dispatch::EventKind;
use crate::mux::{Multiplexer, Routed, SubCallback};
use crate::net::buffer::Buffer;
use crate::net::frame::{self, FrameHeader, HEADER_SIZE};
use crate::wire::{Document, Value, WireFormat};

const READ_BUF_SIZE: usize = 65536;
const PENDING_BUF_SIZE: usize = 8 * 65536;

// Slice of the read timeout; bounds how late a heartbeat decision can be.
const READ_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub address: String,
    pub user: String,
    pub format: WireFormat,
    /// Silence on the wire before a `heartbeat` is emitted.
    pub ping_interval: Duration,
    /// Silence on the wire before the connection is declared dead.
    pub ping_timeout: Duration,
    /// Deadline for synchronous calls.
    pub call_timeout: Duration,
    pub reconnect_backoff: Duration,
}

impl ClientConfig {
    pub fn new(address: &str) -> ClientConfig {
        ClientConfig {
            address: address.to_string(),
            user: "vitrine".to_string(),
            format: WireFormat::Binary,
            ping_interval: Duration::from_millis(3000),
            ping_timeout: Duration::from_millis(5000),
            call_timeout: Duration::from_secs(10),
            reconnect_backoff: Duration::from_secs(1),
        }
    }
}

/// Where a request is addressed: a path (bound server-side on first use), an
/// already-known alias, or nowhere (system traffic).
#[derive(Debug, Clone)]
pub enum Target {
    Path(String),
    Alias(Cid),
    System,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum HeartbeatAction {
    None,
    Ping,
    Reconnect,
}

#[derive(Clone)]
struct Subscription {
    csp: String,
    request: Document,
}

struct HeartbeatClock {
    last_ingress: Instant,
    last_ping: Instant,
}

struct Pending {
    buffer: Buffer,
    largest: usize,
}

/// Client side of the wire protocol: one TCP connection carrying synchronous
/// calls and long-lived subscriptions, multiplexed by tid. A dedicated
/// reader thread routes inbound documents, emits heartbeats during silence
/// and reconnects (with subscriptions reapplied) when the channel dies.
pub struct Client {
    cfg: ClientConfig,

    conn: Mutex<Option<Arc<TcpStream>>>,

    // Outbound coalescing buffer; the flush lock holder writes the socket.
    pending: Mutex<Pending>,
    flush: Mutex<()>,

    mux: Arc<Multiplexer>,
    subs: Mutex<HashMap<Tid, Subscription>>,

    clock: Mutex<HeartbeatClock>,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,

    log: Logger,
}

impl Client {
    /// Dials the configured address, performs the `userid` handshake and
    /// starts the reader thread.
    pub fn connect(cfg: ClientConfig, log: &Logger) -> WireResult<Arc<Client>> {
        let now = Instant::now();

        let client = Arc::new(Client {
            log: log.new(logging::o!("component" => "client", "peer" => cfg.address.clone())),
            cfg,
            conn: Mutex::new(None),
            pending: Mutex::new(Pending {
                buffer: Buffer::new(PENDING_BUF_SIZE),
                largest: 0,
            }),
            flush: Mutex::new(()),
            mux: Multiplexer::new(&logging::discard()),
            subs: Mutex::new(HashMap::new()),
            clock: Mutex::new(HeartbeatClock {
                last_ingress: now,
                last_ping: now,
            }),
            closed: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
        });

        client.dial()?;

        let reader = {
            let client = client.clone();
            thread::Builder::new()
                .name("vitrine-client-reader".to_string())
                .spawn(move || client.read_loop())
                .expect("Failed spawning the client reader thread")
        };
        *client.reader.lock() = Some(reader);

        Ok(client)
    }

    /// Synchronous call on a path view. Parks until the reply arrives or the
    /// call deadline passes.
    pub fn call(&self, csp: &str, doc: Document) -> WireResult<Document> {
        self.call_target(Target::Path(csp.to_string()), doc)
    }

    /// Synchronous call through a CID learned from a set-proxy reply.
    pub fn call_cid(&self, cid: Cid, doc: Document) -> WireResult<Document> {
        self.call_target(Target::Alias(cid), doc)
    }

    /// Fire-and-forget document on a path view.
    pub fn send(&self, csp: &str, doc: &Document) -> WireResult<()> {
        self.send_document(&Target::Path(csp.to_string()), next_tid(), doc, true)
    }

    /// Installs a subscription: the callback receives every document the
    /// server emits under the returned tid. Survives reconnects.
    pub fn subscribe(
        &self,
        csp: &str,
        request: Document,
        callback: SubCallback,
    ) -> WireResult<Tid> {
        let tid = next_tid();

        self.mux.register_subscription(tid, callback);
        self.subs.lock().insert(
            tid,
            Subscription {
                csp: csp.to_string(),
                request: request.clone(),
            },
        );

        if let Err(err) = self.send_document(&Target::Path(csp.to_string()), tid, &request, true) {
            self.mux.remove_subscription(tid);
            self.subs.lock().remove(&tid);
            return Err(err);
        }

        Ok(tid)
    }

    /// Asks the server to end a subscription. The local registration is
    /// dropped when the terminal `reply: null` document arrives.
    pub fn unsubscribe(&self, tid: Tid) -> WireResult<()> {
        let sub = match self.subs.lock().get(&tid) {
            Some(sub) => sub.clone(),
            None => return Ok(()),
        };

        self.send_document(
            &Target::Path(sub.csp),
            tid,
            &Document::new().with(EventKind::UnregisterSubscriber.wire_name(), Value::Null),
            true,
        )
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(stream) = self.conn.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }

        if let Some(reader) = self.reader.lock().take() {
            let _ = reader.join();
        }

        self.mux.fail_all_sync(ErrorType::ConnectionClosed);

        // Subscription callbacks can hold this client alive through the
        // multiplexer; sever them so the cycle cannot outlive the close.
        for (tid, _) in self.subs.lock().drain() {
            self.mux.remove_subscription(tid);
        }

        logging::debug!(self.log, "client closed");
    }

    fn call_target(&self, target: Target, doc: Document) -> WireResult<Document> {
        let tid = next_tid();
        let slot = self.mux.register_sync(tid);

        if let Err(err) = self.send_document(&target, tid, &doc, true) {
            self.mux.cancel_sync(tid);
            return Err(err);
        }

        match slot.wait(self.cfg.call_timeout) {
            Ok(reply) => Ok(reply),
            Err(err) => {
                self.mux.cancel_sync(tid);
                Err(err)
            }
        }
    }

    /// Frames and transmits one document. The send buffer coalesces: the
    /// flush-lock holder writes the socket, and a contended writer returns
    /// without flushing as long as the buffer can hold another document of
    /// the largest size seen, so batched sends form under contention.
    pub(crate) fn send_document(
        &self,
        target: &Target,
        tid: Tid,
        doc: &Document,
        ready: bool,
    ) -> WireResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WireError::Fatal(ErrorType::ConnectionClosed));
        }

        let codec = self.cfg.format.codec();

        let mut meta_doc = Document::new().with("tid", Value::I64(tid as i64));
        match target {
            Target::Path(path) => meta_doc.push("csp", Value::Text(path.clone())),
            Target::Alias(cid) => meta_doc.push("cid", Value::I64(*cid as i64)),
            Target::System => (),
        }

        let mut meta = Vec::new();
        codec.encode(&meta_doc, &mut meta)?;
        let mut data = Vec::new();
        codec.encode(doc, &mut data)?;

        let mut frames = Vec::with_capacity(meta.len() + data.len() + 2 * HEADER_SIZE);
        frame::frame_to_vec(FrameHeader::meta(meta.len()), &meta, &mut frames);
        frame::frame_to_vec(FrameHeader::data(data.len(), ready), &data, &mut frames);

        if frames.len() > PENDING_BUF_SIZE {
            return Err(WireError::Fatal(ErrorType::PayloadTooLarge));
        }

        {
            let mut pending = self.pending.lock();
            if frames.len() > pending.buffer.free_capacity() {
                drop(pending);
                self.flush_now()?;
                pending = self.pending.lock();
            }
            pending.buffer.append(&frames);
            pending.largest = pending.largest.max(frames.len());
        }

        match self.flush.try_lock() {
            Some(_holder) => self.flush_body(),
            None => {
                let roomy = {
                    let pending = self.pending.lock();
                    pending.buffer.free_capacity() >= pending.largest
                };
                if roomy {
                    // The current holder (or the next contended writer
                    // without room) carries this document out.
                    Ok(())
                } else {
                    let _holder = self.flush.lock();
                    self.flush_body()
                }
            }
        }
    }

    fn flush_now(&self) -> WireResult<()> {
        let _holder = self.flush.lock();
        self.flush_body()
    }

    fn flush_body(&self) -> WireResult<()> {
        loop {
            let (bytes, stream) = {
                let mut pending = self.pending.lock();
                if pending.buffer.is_empty() {
                    return Ok(());
                }

                let stream = match self.conn.lock().clone() {
                    Some(stream) => stream,
                    None => return Err(WireError::Fatal(ErrorType::ConnectionClosed)),
                };

                let bytes = pending.buffer.read_slice().to_vec();
                pending.buffer.clear();
                (bytes, stream)
            };

            (&*stream).write_all(&bytes).map_err(WireError::from)?;
        }
    }

    fn dial(&self) -> WireResult<()> {
        let stream = TcpStream::connect(&self.cfg.address[..])?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_SLICE))?;

        *self.conn.lock() = Some(Arc::new(stream));
        self.pending.lock().buffer.clear();

        let now = Instant::now();
        {
            let mut clock = self.clock.lock();
            clock.last_ingress = now;
            clock.last_ping = now;
        }

        self.send_document(
            &Target::System,
            0,
            &Document::new().with(
                EventKind::Userid.wire_name(),
                Value::Text(self.cfg.user.clone()),
            ),
            true,
        )?;

        logging::debug!(self.log, "connected"; "user" => self.cfg.user.clone());
        Ok(())
    }

    fn read_loop(self: Arc<Self>) {
        let mut buffer = Buffer::new(READ_BUF_SIZE);
        let mut pending_meta: Option<Document> = None;

        while !self.closed.load(Ordering::Acquire) {
            let stream = match self.conn.lock().clone() {
                Some(stream) => stream,
                None => {
                    self.reconnect();
                    buffer.clear();
                    pending_meta = None;
                    continue;
                }
            };

            match buffer.ingress_some(&mut &*stream) {
                Ok(_) => {
                    self.clock.lock().last_ingress = Instant::now();

                    if self.process_frames(&mut buffer, &mut pending_meta).is_err() {
                        self.reconnect();
                        buffer.clear();
                        pending_meta = None;
                    }
                }
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    match self.heartbeat_action(Instant::now()) {
                        HeartbeatAction::None => (),
                        HeartbeatAction::Ping => {
                            self.clock.lock().last_ping = Instant::now();
                            let ping = Document::new()
                                .with(EventKind::Heartbeat.wire_name(), Value::Null);
                            if self.send_document(&Target::System, 0, &ping, true).is_err() {
                                self.reconnect();
                                buffer.clear();
                                pending_meta = None;
                            }
                        }
                        HeartbeatAction::Reconnect => {
                            logging::warn!(self.log, "heartbeat timeout");
                            self.reconnect();
                            buffer.clear();
                            pending_meta = None;
                        }
                    }
                }
                Err(_) => {
                    self.reconnect();
                    buffer.clear();
                    pending_meta = None;
                }
            }
        }
    }

    fn process_frames(
        &self,
        buffer: &mut Buffer,
        pending_meta: &mut Option<Document>,
    ) -> WireResult<()> {
        loop {
            let header = match FrameHeader::peek(buffer) {
                Some(header) => header,
                None => return Ok(()),
            };

            if header.length > READ_BUF_SIZE - HEADER_SIZE {
                return Err(WireError::Fatal(ErrorType::PayloadTooLarge));
            }
            if buffer.len() < HEADER_SIZE + header.length {
                return Ok(());
            }

            let doc = {
                let payload = &buffer.read_slice()[HEADER_SIZE..HEADER_SIZE + header.length];
                self.cfg.format.codec().decode(payload)?
            };
            buffer.consume(HEADER_SIZE + header.length);

            if !header.data {
                *pending_meta = Some(doc);
                continue;
            }

            let meta = match pending_meta.take() {
                Some(meta) => meta,
                None => return Err(WireError::Fatal(ErrorType::ProtocolViolation)),
            };

            let tid = meta.i64_field("tid").unwrap_or(0) as Tid;

            // Tid 0 is system traffic (heartbeat echoes); receipt alone
            // refreshed the silence clock.
            if tid == 0 {
                continue;
            }

            let terminal = header.ready
                && doc.len() == 1
                && doc.get("reply").map_or(false, Value::is_null);

            let routed = self.mux.route(tid, doc, header.ready);

            if terminal && routed == Routed::Subscription {
                self.mux.remove_subscription(tid);
                self.subs.lock().remove(&tid);
                logging::debug!(self.log, "subscription ended"; "tid" => tid);
            }
        }
    }

    /// Decides what the silence on the wire currently calls for.
    pub(crate) fn heartbeat_action(&self, now: Instant) -> HeartbeatAction {
        let clock = self.clock.lock();
        let silent = now.saturating_duration_since(clock.last_ingress);

        if silent >= self.cfg.ping_timeout {
            HeartbeatAction::Reconnect
        } else if silent >= self.cfg.ping_interval
            && now.saturating_duration_since(clock.last_ping) >= self.cfg.ping_interval
        {
            HeartbeatAction::Ping
        } else {
            HeartbeatAction::None
        }
    }

    /// Tears the connection down, then dials with back-off until it is back;
    /// live subscriptions are reapplied under their original tids.
    fn reconnect(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        logging::warn!(self.log, "connection lost");
        self.mux.fail_all_sync(ErrorType::ConnectionClosed);

        if let Some(stream) = self.conn.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.pending.lock().buffer.clear();

        while !self.closed.load(Ordering::Acquire) {
            thread::sleep(self.cfg.reconnect_backoff);

            match self.dial() {
                Ok(()) => {
                    let subs: Vec<(Tid, Subscription)> = self
                        .subs
                        .lock()
                        .iter()
                        .map(|(tid, sub)| (*tid, sub.clone()))
                        .collect();

                    let mut reapplied = true;
                    for (tid, sub) in subs {
                        if self
                            .send_document(&Target::Path(sub.csp), tid, &sub.request, true)
                            .is_err()
                        {
                            reapplied = false;
                            break;
                        }
                    }

                    if reapplied {
                        logging::debug!(self.log, "reconnected");
                        return;
                    }
                }
                Err(err) => {
                    logging::debug!(self.log, "reconnect attempt failed"; "error" => ?err);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_clock(&self, last_ingress: Instant, last_ping: Instant) {
        let mut clock = self.clock.lock();
        clock.last_ingress = last_ingress;
        clock.last_ping = last_ping;
    }

    #[cfg(test)]
    pub(crate) fn kill_connection(&self) {
        if let Some(stream) = self.conn.lock().clone() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}
