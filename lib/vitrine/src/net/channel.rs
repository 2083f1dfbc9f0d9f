use hashbrown::HashMap;
use mio::net::TcpStream;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use flint::logging::{self, Logger};
use flint::shared::{ErrorType, WireError, WireResult};
use flint::{NodeId, Tid};

use crate::csp::CidBinder;
use crate::net::buffer::Buffer;
use crate::net::frame::{self, FrameHeader, HEADER_SIZE};
use crate::subs::{OutboundDoc, OutboundSender};
use crate::wire::{Document, Value, WireFormat};

pub const READ_BUF_SIZE: usize = 65536;
// Write buffer should be 512k
pub const WRITE_BUF_SIZE: usize = 8 * 65536;

pub type ChannelId = usize;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    Handshake(Instant),
    Connected,
    Disconnected,
}

/// What this connection's counterpart told us about itself during the
/// replication bootstrap handshake, per replicated asset path.
#[derive(Debug, Copy, Clone)]
pub struct RemotePeer {
    pub id: NodeId,
    pub last_updated: u64,
}

/// A complete inbound exchange: the meta document that announced it and the
/// data document that followed.
#[derive(Debug)]
pub struct InboundMessage {
    pub meta: Document,
    pub data: Document,
    pub ready: bool,
}

/// Server-side framed document channel over a single non-blocking TCP
/// stream. Owns the per-connection read/write buffers, the CSP ↔ CID
/// bindings and the outbound publish queue that subscription sinks feed.
pub struct Channel {
    id: Option<ChannelId>,

    stream: Option<TcpStream>,
    state: ChannelState,
    format: WireFormat,

    user: Option<String>,

    // Communication timestamps
    last_egress: Instant,
    last_ingress: Instant,

    read_buffer: Buffer,
    write_buffer: Buffer,

    // A meta document waiting for its data document.
    pending_meta: Option<Document>,

    // Publish queue; sinks hold senders, the writer drains.
    outbound_tx: mpsc::Sender<OutboundDoc>,
    outbound_rx: mpsc::Receiver<OutboundDoc>,
    stalled: Option<OutboundDoc>,

    pub binder: CidBinder,

    // Replication handshake state, keyed by asset path.
    pub remotes: HashMap<String, RemotePeer>,

    // Subscriptions and replication pumps bound to this connection.
    subs: Vec<Tid>,
    kill_switches: Vec<Arc<AtomicBool>>,

    log: Logger,
}

impl Channel {
    #[inline]
    pub fn new(format: WireFormat, log: &Logger) -> Channel {
        let now = Instant::now();
        let (outbound_tx, outbound_rx) = mpsc::channel();

        Channel {
            id: None,
            stream: None,
            state: ChannelState::Disconnected,
            format,
            user: None,
            last_egress: now,
            last_ingress: now,
            read_buffer: Buffer::new(READ_BUF_SIZE),
            write_buffer: Buffer::new(WRITE_BUF_SIZE),
            pending_meta: None,
            outbound_tx,
            outbound_rx,
            stalled: None,
            binder: CidBinder::new(),
            remotes: HashMap::new(),
            subs: Vec::new(),
            kill_switches: Vec::new(),
            log: log.new(logging::o!()),
        }
    }

    /// Opens the channel using a new underlying stream. The channel must be
    /// closed for this operation to succeed.
    pub fn open(&mut self, id: ChannelId, stream: TcpStream, now: Instant) {
        if self.state != ChannelState::Disconnected {
            panic!("Attempted to open an already open channel");
        }

        let (outbound_tx, outbound_rx) = mpsc::channel();

        self.id = Some(id);
        self.state = ChannelState::Handshake(now);
        self.stream = Some(stream);
        self.last_egress = now;
        self.last_ingress = now;
        self.outbound_tx = outbound_tx;
        self.outbound_rx = outbound_rx;

        logging::debug!(self.log, "channel opened"; "channel_id" => id);
    }

    /// Closes the channel and clears all connection-scoped state. Returns the
    /// subscription tids that were bound to it, for registry teardown.
    pub fn close(&mut self) -> Vec<Tid> {
        logging::debug!(self.log, "closing channel";
                        "channel_id" => self.id,
                        "user" => self.user.as_deref().unwrap_or("-"),
                        "read_size" => self.read_buffer.len(),
                        "write_size" => self.write_buffer.len());

        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }

        self.state = ChannelState::Disconnected;
        self.id = None;
        self.user = None;
        self.read_buffer.clear();
        self.write_buffer.clear();
        self.pending_meta = None;
        self.stalled = None;
        self.binder.clear();
        self.remotes.clear();

        for switch in self.kill_switches.drain(..) {
            switch.store(true, Ordering::Release);
        }

        std::mem::replace(&mut self.subs, Vec::new())
    }

    /// Registers this channel's stream on the supplied mio registry.
    pub fn register(&mut self, id: ChannelId, registry: &mio::Registry) -> WireResult<()> {
        let stream = self
            .stream
            .as_mut()
            .expect("Can't register disconnected channel");

        registry
            .register(
                stream,
                mio::Token(id),
                mio::Interest::READABLE | mio::Interest::WRITABLE,
            )
            .map_err(Into::into)
    }

    pub fn deregister(&mut self, registry: &mio::Registry) -> WireResult<()> {
        let stream = self
            .stream
            .as_mut()
            .expect("Can't deregister disconnected channel");

        registry.deregister(stream).map_err(Into::into)
    }

    #[inline]
    pub fn get_state(&self) -> ChannelState {
        self.state
    }

    #[inline]
    pub fn set_connected(&mut self) {
        self.state = ChannelState::Connected;
    }

    #[inline]
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    #[inline]
    pub fn set_user(&mut self, user: String) {
        self.user = Some(user);
    }

    #[inline]
    pub fn last_egress_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.last_egress)
    }

    #[inline]
    pub fn last_ingress_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.last_ingress)
    }

    /// Returns true if there is outgoing data on the channel.
    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.write_buffer.is_empty() || self.stalled.is_some()
    }

    /// A sender feeding this connection's outbound publish queue.
    #[inline]
    pub fn outbound_sender(&self) -> OutboundSender {
        self.outbound_tx.clone()
    }

    /// Remembers a subscription bound to this connection.
    #[inline]
    pub fn track_subscription(&mut self, tid: Tid) {
        self.subs.push(tid);
    }

    #[inline]
    pub fn untrack_subscription(&mut self, tid: Tid) {
        self.subs.retain(|tracked| *tracked != tid);
    }

    /// Remembers a pump kill switch to flip on close.
    #[inline]
    pub fn track_kill_switch(&mut self, switch: Arc<AtomicBool>) {
        self.kill_switches.push(switch);
    }

    /// Read all available data off the network; updates the last ingress
    /// time when bytes arrived.
    pub fn receive(&mut self, now: Instant) -> WireResult<usize> {
        let stream = self.stream.as_mut().expect("Channel must have valid stream");

        let received = self.read_buffer.ingress(stream)?;

        if received > 0 {
            self.last_ingress = now;
        }

        Ok(received)
    }

    /// Flush buffered output to the network; updates the last egress time
    /// when bytes left.
    pub fn send(&mut self, now: Instant) -> WireResult<usize> {
        if self.write_buffer.is_empty() {
            return Ok(0);
        }

        let stream = self.stream.as_mut().expect("Channel must have valid stream");

        let sent = self.write_buffer.egress(stream)?;

        if sent > 0 {
            self.last_egress = now;
        }

        Ok(sent)
    }
}

impl Channel {
    /// Extracts the next complete meta/data document pair from the read
    /// buffer. Returns `Wait` until one is fully buffered.
    pub fn next_message(&mut self) -> WireResult<InboundMessage> {
        loop {
            let header = match FrameHeader::peek(&self.read_buffer) {
                Some(header) => header,
                None => return Err(WireError::Wait),
            };

            if header.length > READ_BUF_SIZE - HEADER_SIZE {
                return Err(WireError::Fatal(ErrorType::PayloadTooLarge));
            }

            if self.read_buffer.len() < HEADER_SIZE + header.length {
                return Err(WireError::Wait);
            }

            let doc = {
                let payload =
                    &self.read_buffer.read_slice()[HEADER_SIZE..HEADER_SIZE + header.length];
                self.format.codec().decode(payload)?
            };
            self.read_buffer.consume(HEADER_SIZE + header.length);

            if !header.data {
                if self.pending_meta.is_some() {
                    logging::warn!(self.log, "meta document replaced before its data arrived";
                                   "channel_id" => self.id);
                }
                self.pending_meta = Some(doc);
                continue;
            }

            let meta = match self.pending_meta.take() {
                Some(meta) => meta,
                // A data document with no preceding meta document.
                None => return Err(WireError::Fatal(ErrorType::ProtocolViolation)),
            };

            return Ok(InboundMessage {
                meta,
                data: doc,
                ready: header.ready,
            });
        }
    }

    /// Frames and buffers one outbound exchange: a meta document carrying
    /// the tid, then the data document.
    pub fn write_message(&mut self, tid: Tid, doc: &Document, ready: bool) -> WireResult<()> {
        let codec = self.format.codec();

        let mut data = Vec::new();
        codec.encode(doc, &mut data)?;

        let meta_doc = Document::new().with("tid", Value::I64(tid as i64));
        let mut meta = Vec::new();
        codec.encode(&meta_doc, &mut meta)?;

        let total = meta.len() + data.len() + 2 * HEADER_SIZE;

        if total > WRITE_BUF_SIZE {
            return Err(WireError::Fatal(ErrorType::PayloadTooLarge));
        }
        if total > self.write_buffer.free_capacity() {
            return Err(WireError::Wait);
        }

        frame::write_frame(&mut self.write_buffer, FrameHeader::meta(meta.len()), &meta);
        frame::write_frame(
            &mut self.write_buffer,
            FrameHeader::data(data.len(), ready),
            &data,
        );

        Ok(())
    }

    /// Moves everything written so far over to the read side, looping the
    /// channel back on itself. Test-only.
    #[cfg(test)]
    pub(crate) fn loopback_written(&mut self) {
        let bytes = self.write_buffer.read_slice().to_vec();
        self.write_buffer.clear();
        self.read_buffer.append(&bytes);
    }

    /// Moves queued publish documents into the write buffer. A document that
    /// does not fit right now is stashed and retried on the next drain.
    pub fn drain_outbound(&mut self) -> WireResult<()> {
        loop {
            let next = match self.stalled.take() {
                Some(doc) => doc,
                None => match self.outbound_rx.try_recv() {
                    Ok(doc) => doc,
                    Err(_) => return Ok(()),
                },
            };

            match self.write_message(next.tid, &next.doc, next.ready) {
                Ok(()) => (),
                Err(WireError::Wait) => {
                    self.stalled = Some(next);
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flint::logging;
    use std::mem;

    fn channel() -> Channel {
        Channel::new(WireFormat::Binary, &logging::discard())
    }

    fn loopback(channel: &mut Channel) {
        mem::swap(&mut channel.read_buffer, &mut channel.write_buffer);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut channel = channel();

        let doc = Document::new()
            .with("get", Value::Null)
            .with("key", Value::Bytes(vec![1, 2]));
        channel.write_message(55, &doc, true).unwrap();

        loopback(&mut channel);

        let message = channel.next_message().unwrap();
        assert_eq!(message.meta.i64_field("tid"), Some(55));
        assert_eq!(message.data, doc);
        assert!(message.ready);

        // The buffer is fully consumed.
        assert_eq!(channel.next_message().err().unwrap(), WireError::Wait);
    }

    #[test]
    fn test_streaming_frames_not_ready() {
        let mut channel = channel();

        let doc = Document::new().with("reply", Value::I32(1));
        channel.write_message(7, &doc, false).unwrap();

        loopback(&mut channel);

        let message = channel.next_message().unwrap();
        assert!(!message.ready);
    }

    #[test]
    fn test_data_without_meta_rejected() {
        let mut channel = channel();

        let mut payload = Vec::new();
        WireFormat::Binary
            .codec()
            .encode(&Document::new().with("put", Value::Null), &mut payload)
            .unwrap();
        frame::write_frame(
            &mut channel.read_buffer,
            FrameHeader::data(payload.len(), true),
            &payload,
        );

        assert_eq!(
            channel.next_message().err().unwrap(),
            WireError::Fatal(ErrorType::ProtocolViolation)
        );
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut channel = channel();

        let doc = Document::new().with("put", Value::Bytes(vec![1; 100]));
        channel.write_message(9, &doc, true).unwrap();

        loopback(&mut channel);

        // Withhold the last byte.
        let full = channel.read_buffer.read_slice().to_vec();
        channel.read_buffer.clear();
        channel.read_buffer.append(&full[..full.len() - 1]);

        assert_eq!(channel.next_message().err().unwrap(), WireError::Wait);

        channel.read_buffer.append(&full[full.len() - 1..]);
        let message = channel.next_message().unwrap();
        assert_eq!(message.meta.i64_field("tid"), Some(9));
    }

    #[test]
    fn test_oversized_inbound_frame_fatal() {
        use byteorder::{ByteOrder, LittleEndian};

        let mut channel = channel();

        // Header alone is enough to reject it; the (impossible) payload never
        // needs to arrive.
        let mut word = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut word, FrameHeader::data(READ_BUF_SIZE, true).pack());
        channel.read_buffer.append(&word);

        assert_eq!(
            channel.next_message().err().unwrap(),
            WireError::Fatal(ErrorType::PayloadTooLarge)
        );
    }

    #[test]
    fn test_outbound_queue_drains_in_order() {
        let mut channel = channel();
        let sender = channel.outbound_sender();

        for round in 0..3i64 {
            sender
                .send(OutboundDoc {
                    tid: 100 + round as Tid,
                    doc: Document::new().with("reply", Value::I64(round)),
                    ready: round == 2,
                })
                .unwrap();
        }

        channel.drain_outbound().unwrap();
        loopback(&mut channel);

        for round in 0..3i64 {
            let message = channel.next_message().unwrap();
            assert_eq!(message.meta.i64_field("tid"), Some(100 + round));
            assert_eq!(message.data.i64_field("reply"), Some(round));
            assert_eq!(message.ready, round == 2);
        }
    }

    #[test]
    fn test_oversized_write_rejected() {
        let mut channel = channel();

        let doc = Document::new().with("value", Value::Bytes(vec![0; WRITE_BUF_SIZE]));
        assert_eq!(
            channel.write_message(1, &doc, true).err().unwrap(),
            WireError::Fatal(ErrorType::PayloadTooLarge)
        );
    }

    #[test]
    fn test_write_backpressure_waits() {
        let mut channel = channel();

        // Nearly fill the write buffer, then ask for more than the remainder.
        let filler = Document::new().with("value", Value::Bytes(vec![0; WRITE_BUF_SIZE / 2]));
        channel.write_message(1, &filler, true).unwrap();

        assert_eq!(
            channel.write_message(2, &filler, true).err().unwrap(),
            WireError::Wait
        );
    }

    #[test]
    fn test_close_flips_kill_switches_and_returns_subs() {
        let mut channel = channel();

        channel.track_subscription(5);
        channel.track_subscription(6);
        let switch = Arc::new(AtomicBool::new(false));
        channel.track_kill_switch(switch.clone());

        let subs = channel.close();

        assert_eq!(subs, vec![5, 6]);
        assert!(switch.load(Ordering::Acquire));
        assert_eq!(channel.get_state(), ChannelState::Disconnected);
    }
}
