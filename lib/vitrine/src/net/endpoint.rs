use indexmap::IndexSet;
use mio::net::TcpListener;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flint::logging::{self, Logger};
use flint::shared::{ErrorUtils, WireError, WireResult};

use crate::dispatch::Dispatcher;
use crate::net::channel::{Channel, ChannelId, ChannelState};
use crate::subs::SubRegistry;
use crate::wire::WireFormat;

/// Describes a change in the connectivity status of a channel.
#[derive(Debug, Clone)]
pub enum ConnectionChange {
    Connected(String, ChannelId),
    Disconnected(ChannelId),
}

/// Handles connection management and network transmission on the server
/// side: accepts sockets, pumps the per-connection channels and tears dead
/// ones down. `sync` is driven externally, once per tick.
pub struct Endpoint {
    server: TcpListener,
    local_addr: SocketAddr,

    poll: mio::Poll,
    events: mio::Events,

    format: WireFormat,
    dispatcher: Dispatcher,
    registry: Arc<SubRegistry>,

    channels: Vec<Channel>,
    free: Vec<ChannelId>,
    live: IndexSet<ChannelId>,

    changes: Vec<ConnectionChange>,

    current_time: Instant,
    housekeeping_time: Instant,

    log: Logger,
}

impl Endpoint {
    const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
    const INGRESS_TIMEOUT: Duration = Duration::from_secs(10);
    const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);
    const POLL_TIMEOUT: Duration = Duration::from_millis(1);
    const SERVER_TOKEN: mio::Token = mio::Token(usize::max_value());

    /// Binds the listener to `address` (`<ip>:<port>`; port 0 picks a free
    /// one).
    pub fn new(
        address: &str,
        format: WireFormat,
        dispatcher: Dispatcher,
        registry: Arc<SubRegistry>,
        log: &Logger,
    ) -> WireResult<Endpoint> {
        let addr: SocketAddr = address.parse()?;
        let mut server = TcpListener::bind(addr)?;
        let local_addr = server.local_addr()?;

        let poll = mio::Poll::new()?;
        poll.registry()
            .register(&mut server, Self::SERVER_TOKEN, mio::Interest::READABLE)?;

        let now = Instant::now();
        let log = log.new(logging::o!("component" => "endpoint"));

        logging::debug!(log, "endpoint listening"; "address" => local_addr.to_string());

        Ok(Endpoint {
            server,
            local_addr,
            poll,
            events: mio::Events::with_capacity(1024),
            format,
            dispatcher,
            registry,
            channels: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            changes: Vec::new(),
            current_time: now,
            housekeeping_time: now,
            log,
        })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// One tick: flush pending output, poll for readiness, pump the affected
    /// channels and run periodic housekeeping.
    pub fn sync(&mut self, now: Instant) {
        self.current_time = now;

        if now.duration_since(self.housekeeping_time) >= Self::HOUSEKEEPING_INTERVAL {
            self.housekeeping();
            self.housekeeping_time = now;
        }

        // Queued publishes and unflushed output do not wait for readiness
        // events.
        let live: Vec<ChannelId> = self.live.iter().copied().collect();
        for channel_id in live {
            let result = Self::pump_channel(
                &self.dispatcher,
                &mut self.channels[channel_id],
                false,
                true,
                now,
            );
            if result.has_failed() {
                self.disconnect(channel_id);
            }
        }

        self.poll
            .poll(&mut self.events, Some(Self::POLL_TIMEOUT))
            .expect("Endpoint poll failed");

        let mut accepted = Vec::new();
        let mut pending = Vec::new();

        for event in self.events.iter() {
            if event.token() == Self::SERVER_TOKEN {
                accepted.push(());
            } else {
                pending.push((
                    usize::from(event.token()),
                    event.is_readable(),
                    event.is_writable(),
                ));
            }
        }

        if !accepted.is_empty() {
            self.accept_connections(now);
        }

        for (channel_id, readable, writable) in pending {
            if !self.live.contains(&channel_id) {
                continue;
            }

            let result = Self::pump_channel(
                &self.dispatcher,
                &mut self.channels[channel_id],
                readable,
                writable,
                now,
            );
            if result.has_failed() {
                self.disconnect(channel_id);
            } else {
                self.promote_handshake(channel_id);
            }
        }
    }

    /// Drains all the changes accumulated since the last `sync`.
    #[inline]
    pub fn changes(&mut self) -> impl Iterator<Item = ConnectionChange> + '_ {
        self.changes.drain(..)
    }

    /// Spawns a thread driving `sync` until `closed` flips.
    pub fn spawn(mut self, closed: Arc<AtomicBool>) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("vitrine-endpoint".to_string())
            .spawn(move || {
                while !closed.load(Ordering::Acquire) {
                    self.sync(Instant::now());
                }
            })
            .expect("Failed spawning the endpoint thread")
    }

    fn accept_connections(&mut self, now: Instant) {
        loop {
            match self.server.accept() {
                Ok((stream, peer)) => {
                    let channel_id = match self.free.pop() {
                        Some(channel_id) => channel_id,
                        None => {
                            let channel_id = self.channels.len();
                            self.channels.push(Channel::new(self.format, &self.log));
                            channel_id
                        }
                    };

                    let channel = &mut self.channels[channel_id];
                    channel.open(channel_id, stream, now);

                    if channel.register(channel_id, self.poll.registry()).has_failed() {
                        logging::warn!(self.log, "stream registration failed";
                                       "channel_id" => channel_id);
                        let _ = channel.close();
                        self.free.push(channel_id);
                        continue;
                    }

                    self.live.insert(channel_id);
                    logging::debug!(self.log, "connection accepted";
                                    "channel_id" => channel_id, "peer" => peer.to_string());
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::error!(self.log, "accept failed"; "error" => ?err);
                    break;
                }
            }
        }
    }

    /// Receives, dispatches and flushes one channel. Any fatal error makes
    /// the caller disconnect it.
    fn pump_channel(
        dispatcher: &Dispatcher,
        channel: &mut Channel,
        readable: bool,
        writable: bool,
        now: Instant,
    ) -> WireResult<()> {
        if readable {
            // Readiness is edge-triggered: alternate socket drains with
            // message processing until the socket is dry, so a backlog larger
            // than the read buffer cannot strand bytes in the kernel.
            loop {
                let received = match channel.receive(now) {
                    Ok(received) => received,
                    Err(WireError::Wait) => 0,
                    Err(err) => return Err(err),
                };

                loop {
                    match channel.next_message() {
                        Ok(message) => dispatcher.dispatch(channel, message)?,
                        Err(WireError::Wait) => break,
                        Err(err) => return Err(err),
                    }
                }

                if received == 0 {
                    break;
                }
            }
        }

        channel.drain_outbound()?;

        if writable || channel.has_egress() {
            match channel.send(now) {
                Ok(_) | Err(WireError::Wait) => (),
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// A channel in handshake state that has identified its user becomes
    /// fully connected.
    fn promote_handshake(&mut self, channel_id: ChannelId) {
        let channel = &mut self.channels[channel_id];

        if let ChannelState::Handshake(_) = channel.get_state() {
            if let Some(user) = channel.user().map(str::to_string) {
                channel.set_connected();
                self.changes
                    .push(ConnectionChange::Connected(user.clone(), channel_id));
                logging::debug!(self.log, "channel connected";
                                "channel_id" => channel_id, "user" => user);
            }
        }
    }

    fn disconnect(&mut self, channel_id: ChannelId) {
        let channel = &mut self.channels[channel_id];

        let _ = channel.deregister(self.poll.registry());
        let orphaned = channel.close();
        self.registry.drop_connection(&orphaned);

        self.live.swap_remove(&channel_id);
        self.free.push(channel_id);
        self.changes.push(ConnectionChange::Disconnected(channel_id));

        logging::debug!(self.log, "channel disconnected";
                        "channel_id" => channel_id, "orphaned_subs" => orphaned.len());
    }

    /// Times out stalled handshakes and silent connections. The server sends
    /// no keepalives of its own; clients ping and we echo.
    fn housekeeping(&mut self) {
        let now = self.current_time;
        let stale: Vec<ChannelId> = self
            .live
            .iter()
            .copied()
            .filter(|&channel_id| {
                let channel = &self.channels[channel_id];
                match channel.get_state() {
                    ChannelState::Handshake(since) => {
                        now.duration_since(since) >= Self::HANDSHAKE_TIMEOUT
                    }
                    ChannelState::Connected => {
                        channel.last_ingress_elapsed(now) >= Self::INGRESS_TIMEOUT
                    }
                    ChannelState::Disconnected => panic!("Disconnected channel in live set"),
                }
            })
            .collect();

        for channel_id in stale {
            logging::debug!(self.log, "closing silent channel"; "channel_id" => channel_id);
            self.disconnect(channel_id);
        }
    }
}
