use log::{debug, trace, warn};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep_until, Instant};
use url::Url;

use crate::client::SocketOptions;
use crate::error::{Error, Result};
use crate::packet::{HandshakePacket, Packet, PacketId};
use crate::transport::{
    ReadyState, Transport, TransportEvent, TransportId, TransportOptions, TransportSink, POLLING,
    WEBSOCKET,
};

/// Why a socket closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// [`crate::Client::close`] was called.
    ForcedClose,
    /// The transport went away, usually closed by the server.
    TransportClose,
    /// The transport failed with the given description.
    TransportError(String),
    /// The server stopped pinging.
    PingTimeout,
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let reason = match self {
            CloseReason::ForcedClose => "forced close",
            CloseReason::TransportClose => "transport close",
            CloseReason::TransportError(_) => "transport error",
            CloseReason::PingTimeout => "ping timeout",
        };
        f.write_str(reason)
    }
}

/// Everything that happens on a socket, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The server accepted the connection.
    Handshake(HandshakePacket),
    Open,
    /// Any packet received from the server.
    Packet(Packet),
    /// A message packet, text or binary.
    Message(Packet),
    /// The server pinged, the pong is on its way.
    Ping,
    /// The write buffer is empty.
    Drain,
    /// A batch of buffered packets was handed to the transport.
    Flush,
    /// A probe succeeded, the socket switches to the named transport.
    Upgrading(String),
    /// The socket now runs on the named transport.
    Upgrade(String),
    UpgradeError(String),
    Error(String),
    Close(CloseReason),
}

#[derive(Debug)]
pub(crate) enum Command {
    Send(Packet),
    Close,
}

/// The part of the socket state handles can read without asking the driver.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub(crate) ready_state: ReadyState,
    pub(crate) sid: Option<String>,
    pub(crate) transport: Option<&'static str>,
    pub(crate) writable: bool,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot {
            ready_state: ReadyState::Opening,
            sid: None,
            transport: None,
            writable: false,
        }
    }
}

pub(crate) type SharedSnapshot = Arc<RwLock<Snapshot>>;

/// What a requested close still waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseAfter {
    Drain,
    Upgrade,
}

#[derive(Debug)]
struct Attached {
    id: TransportId,
    transport: Box<dyn Transport>,
    /// Tracked from the events of the transport, the socket never writes
    /// twice before a `Drain`.
    writable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeStage {
    Opening,
    AwaitingPong,
    /// The active transport was asked to pause.
    Pausing,
}

#[derive(Debug)]
struct Probe {
    attached: Attached,
    stage: ProbeStage,
}

/// Number of leading packets of `buffer` that fit into one polling payload of
/// at most `max_payload` bytes. Every packet costs its type byte, its data
/// and a separator, at least one packet is always taken.
pub(crate) fn writable_prefix(buffer: &[Packet], max_payload: u64) -> usize {
    // type byte of the first packet
    let mut payload_size: u64 = 1;
    for (index, packet) in buffer.iter().enumerate() {
        payload_size += packet.byte_length() as u64;
        if index > 0 && payload_size > max_payload {
            return index;
        }
        payload_size += 2;
    }
    buffer.len()
}

/// Owns the state of one `engine.io` connection. Runs as a single task and
/// handles commands, transport events and the ping deadline one at a time.
pub(crate) struct Driver {
    url: Url,
    options: SocketOptions,
    /// Candidate transports, shrinks when a transport can't be created.
    transports: Vec<String>,
    events: UnboundedSender<Event>,
    transport_tx: UnboundedSender<(TransportId, TransportEvent)>,
    next_id: TransportId,
    ready_state: ReadyState,
    active: Option<Attached>,
    probes: Vec<Probe>,
    upgrading: bool,
    write_buffer: Vec<Packet>,
    prev_buffer_len: usize,
    sid: Option<String>,
    upgrades: Vec<String>,
    max_payload: u64,
    ping_timeout: Duration,
    ping_deadline: Option<Instant>,
    close_after: Option<CloseAfter>,
    snapshot: SharedSnapshot,
}

impl Driver {
    pub(crate) fn new(
        url: Url,
        options: SocketOptions,
        events: UnboundedSender<Event>,
        snapshot: SharedSnapshot,
    ) -> (Self, UnboundedReceiver<(TransportId, TransportEvent)>) {
        let (transport_tx, transport_rx) = unbounded_channel();
        let driver = Driver {
            url,
            transports: options.transports.clone(),
            options,
            events,
            transport_tx,
            next_id: 0,
            ready_state: ReadyState::Opening,
            active: None,
            probes: Vec::new(),
            upgrading: false,
            write_buffer: Vec::new(),
            prev_buffer_len: 0,
            sid: None,
            upgrades: Vec::new(),
            max_payload: 0,
            ping_timeout: Duration::ZERO,
            ping_deadline: None,
            close_after: None,
            snapshot,
        };
        (driver, transport_rx)
    }

    pub(crate) async fn run(
        mut self,
        mut commands: UnboundedReceiver<Command>,
        mut transport_events: UnboundedReceiver<(TransportId, TransportEvent)>,
    ) {
        self.open();
        self.publish();

        let mut handles_alive = true;
        while self.ready_state != ReadyState::Closed {
            let deadline = self.ping_deadline;
            tokio::select! {
                command = commands.recv(), if handles_alive => match command {
                    Some(Command::Send(packet)) => self.send_packet(packet),
                    Some(Command::Close) => self.close(),
                    None => {
                        debug!("all client handles dropped");
                        handles_alive = false;
                        self.close();
                    }
                },
                Some((id, event)) = transport_events.recv() => self.on_transport_event(id, event),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_close(CloseReason::PingTimeout);
                }
                else => break,
            }
            self.publish();
        }
        self.publish();
        trace!("socket driver stopped");
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let mut snapshot = self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        snapshot.ready_state = self.ready_state;
        snapshot.sid.clone_from(&self.sid);
        snapshot.transport = self.active.as_ref().map(|a| a.transport.name());
        snapshot.writable = self.active.as_ref().is_some_and(|a| a.writable);
    }

    fn create_transport(&mut self, name: &str) -> Result<Attached> {
        let id = self.next_id;
        self.next_id += 1;

        let options = TransportOptions {
            url: self.url.clone(),
            query: self.options.query.clone(),
            sid: self.sid.clone(),
            timestamp_requests: self.options.timestamp_requests,
            force_base64: self.options.force_base64,
            extra_headers: self.options.extra_headers.clone(),
            tls_config: self.options.tls_config.clone(),
        };
        let sink = TransportSink::new(id, self.transport_tx.clone());
        let transport = self.options.transport_factory.create(name, options, sink)?;
        Ok(Attached {
            id,
            transport,
            writable: false,
        })
    }

    /// Opens the first transport that can be created.
    fn open(&mut self) {
        self.ready_state = ReadyState::Opening;
        loop {
            let name = if self.options.remember_upgrade
                && self.options.preferences.prior_websocket_success()
                && self.transports.iter().any(|t| t == WEBSOCKET)
            {
                WEBSOCKET.to_owned()
            } else if let Some(name) = self.transports.first() {
                name.clone()
            } else {
                self.on_error(Error::NoTransportAvailable().to_string());
                return;
            };

            match self.create_transport(&name) {
                Ok(mut attached) => {
                    debug!("opening transport {name}");
                    attached.transport.open();
                    self.active = Some(attached);
                    return;
                }
                Err(err) => {
                    warn!("could not create transport {name}: {err}");
                    self.transports.retain(|t| *t != name);
                }
            }
        }
    }

    fn on_transport_event(&mut self, id: TransportId, event: TransportEvent) {
        if self.active.as_ref().map(|a| a.id) == Some(id) {
            self.on_active_event(event);
        } else if self.probes.iter().any(|p| p.attached.id == id) {
            self.on_probe_event(id, event);
        } else {
            trace!("ignoring event of detached transport {id}: {event:?}");
        }
    }

    fn on_active_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                if let Some(active) = self.active.as_mut() {
                    active.writable = true;
                }
            }
            TransportEvent::Packet(packet) => self.on_packet(packet),
            TransportEvent::Drain => self.on_drain(),
            TransportEvent::Paused => self.on_paused(),
            TransportEvent::Error(error) => self.on_error(error),
            TransportEvent::Close(description) => {
                debug!("transport closed: {description}");
                self.on_close(CloseReason::TransportClose);
            }
        }
    }

    fn on_packet(&mut self, packet: Packet) {
        if !matches!(
            self.ready_state,
            ReadyState::Opening | ReadyState::Open | ReadyState::Closing
        ) {
            trace!("packet received with socket state {}", self.ready_state);
            return;
        }

        trace!("socket receive: type {}", packet.packet_id);
        self.emit(Event::Packet(packet.clone()));

        match packet.packet_id {
            PacketId::Open if self.sid.is_some() => warn!("ignoring repeated handshake"),
            PacketId::Open => match HandshakePacket::try_from(packet) {
                Ok(handshake) => self.on_handshake(handshake),
                Err(err) => self.on_error(err.to_string()),
            },
            PacketId::Ping => {
                self.reset_ping_timeout();
                self.send_packet(Packet::new(PacketId::Pong, ""));
                self.emit(Event::Ping);
            }
            PacketId::Message | PacketId::MessageBinary => self.emit(Event::Message(packet)),
            PacketId::Close => self.on_close(CloseReason::TransportClose),
            PacketId::Pong | PacketId::Upgrade | PacketId::Noop => {}
        }
    }

    fn on_handshake(&mut self, handshake: HandshakePacket) {
        self.emit(Event::Handshake(handshake.clone()));

        let HandshakePacket {
            sid,
            upgrades,
            ping_interval,
            ping_timeout,
            max_payload,
        } = handshake;
        if let Some(active) = self.active.as_mut() {
            active.transport.set_sid(&sid);
        }
        self.sid = Some(sid);
        self.upgrades = upgrades
            .into_iter()
            .filter(|upgrade| self.transports.contains(upgrade))
            .collect();
        self.ping_timeout = Duration::from_millis(ping_interval + ping_timeout);
        self.max_payload = max_payload;

        self.on_open();
        if self.ready_state == ReadyState::Closed {
            return;
        }
        self.reset_ping_timeout();
    }

    fn on_open(&mut self) {
        debug!("socket open");
        if self.ready_state != ReadyState::Closing {
            self.ready_state = ReadyState::Open;
        }
        let name = self.active.as_ref().map(|a| a.transport.name());
        self.options
            .preferences
            .set_prior_websocket_success(name == Some(WEBSOCKET));
        self.emit(Event::Open);
        self.flush();

        if self.ready_state == ReadyState::Open && self.options.upgrade && name == Some(POLLING) {
            debug!("starting upgrade probes");
            for upgrade in self.upgrades.clone() {
                if Some(upgrade.as_str()) != name {
                    self.probe(&upgrade);
                }
            }
        }
    }

    fn reset_ping_timeout(&mut self) {
        self.ping_deadline = Some(Instant::now() + self.ping_timeout);
    }

    fn probe(&mut self, name: &str) {
        debug!("probing transport {name}");
        self.options.preferences.set_prior_websocket_success(false);
        match self.create_transport(name) {
            Ok(mut attached) => {
                attached.transport.open();
                self.probes.push(Probe {
                    attached,
                    stage: ProbeStage::Opening,
                });
            }
            Err(err) => self.emit(Event::UpgradeError(format!("probe error: {err}"))),
        }
    }

    fn on_probe_event(&mut self, id: TransportId, event: TransportEvent) {
        let Some(probe) = self.probes.iter_mut().find(|p| p.attached.id == id) else {
            return;
        };

        match event {
            TransportEvent::Open => {
                probe.attached.writable = true;
                if probe.stage == ProbeStage::Opening {
                    trace!("probe transport {} opened", probe.attached.transport.name());
                    probe
                        .attached
                        .transport
                        .send(vec![Packet::new(PacketId::Ping, "probe")]);
                    probe.attached.writable = false;
                    probe.stage = ProbeStage::AwaitingPong;
                }
            }
            TransportEvent::Drain => probe.attached.writable = true,
            TransportEvent::Packet(packet) => {
                if probe.stage != ProbeStage::AwaitingPong {
                    return;
                }
                if packet.packet_id == PacketId::Pong && packet.data.as_ref() == b"probe" {
                    self.start_upgrade(id);
                } else {
                    self.fail_probe(id, "probe error".to_owned());
                }
            }
            TransportEvent::Paused => {}
            TransportEvent::Error(error) => self.fail_probe(id, format!("probe error: {error}")),
            TransportEvent::Close(_) => {
                self.fail_probe(id, "probe error: transport closed".to_owned())
            }
        }
    }

    /// The probe answered, pause the active transport and wait for it.
    fn start_upgrade(&mut self, id: TransportId) {
        let Some(name) = self
            .probes
            .iter()
            .find(|p| p.attached.id == id)
            .map(|p| p.attached.transport.name())
        else {
            return;
        };

        debug!("probe transport {name} pong");
        self.upgrading = true;
        self.emit(Event::Upgrading(name.to_owned()));

        // probes of other transports lost the race
        let mut index = 0;
        while index < self.probes.len() {
            if self.probes[index].attached.transport.name() != name {
                let mut frozen = self.probes.remove(index);
                frozen.attached.transport.close();
            } else {
                index += 1;
            }
        }

        self.options
            .preferences
            .set_prior_websocket_success(name == WEBSOCKET);
        if let Some(probe) = self.probes.iter_mut().find(|p| p.attached.id == id) {
            probe.stage = ProbeStage::Pausing;
        }
        debug!("pausing current transport");
        if let Some(active) = self.active.as_mut() {
            active.transport.pause();
        }
    }

    /// Swaps the paused transport for the probe that asked for the pause.
    fn on_paused(&mut self) {
        let Some(index) = self
            .probes
            .iter()
            .position(|p| p.stage == ProbeStage::Pausing)
        else {
            // the probe is gone and a paused transport never resumes
            self.on_error("probe error: upgrade aborted".to_owned());
            return;
        };

        let mut probe = self.probes.remove(index);
        for mut frozen in self.probes.drain(..) {
            frozen.attached.transport.close();
        }

        let name = probe.attached.transport.name();
        debug!("changing transport and sending upgrade packet");
        probe
            .attached
            .transport
            .send(vec![Packet::new(PacketId::Upgrade, "")]);
        probe.attached.writable = false;
        self.active = Some(probe.attached);
        self.emit(Event::Upgrade(name.to_owned()));
        self.upgrading = false;

        if self.close_after == Some(CloseAfter::Upgrade) {
            self.on_close(CloseReason::ForcedClose);
        } else {
            self.flush();
        }
    }

    /// Gives up on a probe. Its transport is closed and every further event
    /// of it is ignored, the active transport stays as it is.
    fn fail_probe(&mut self, id: TransportId, error: String) {
        let Some(index) = self.probes.iter().position(|p| p.attached.id == id) else {
            return;
        };
        let mut probe = self.probes.remove(index);
        warn!("{error}");
        probe.attached.transport.close();
        if probe.stage == ProbeStage::Pausing {
            self.upgrading = false;
        }
        self.emit(Event::UpgradeError(error));

        if self.close_after == Some(CloseAfter::Upgrade) {
            self.on_close(CloseReason::ForcedClose);
        }
    }

    fn send_packet(&mut self, packet: Packet) {
        if matches!(self.ready_state, ReadyState::Closing | ReadyState::Closed) {
            warn!(
                "dropping {} packet, socket is {}",
                packet.packet_id, self.ready_state
            );
            return;
        }
        self.write_buffer.push(packet);
        self.flush();
    }

    fn flush(&mut self) {
        if !matches!(self.ready_state, ReadyState::Open | ReadyState::Closing)
            || self.upgrading
            || self.write_buffer.is_empty()
        {
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if !active.writable {
            return;
        }

        let count = if self.max_payload > 0
            && active.transport.name() == POLLING
            && self.write_buffer.len() > 1
        {
            writable_prefix(&self.write_buffer, self.max_payload)
        } else {
            self.write_buffer.len()
        };

        trace!("flushing {count} packets in socket");
        active.transport.send(self.write_buffer[..count].to_vec());
        active.writable = false;
        self.prev_buffer_len = count;
        self.emit(Event::Flush);
    }

    fn on_drain(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.writable = true;
        }
        let written = self.prev_buffer_len.min(self.write_buffer.len());
        self.write_buffer.drain(..written);
        self.prev_buffer_len = 0;

        if !self.write_buffer.is_empty() {
            self.flush();
            return;
        }

        self.emit(Event::Drain);
        if self.close_after == Some(CloseAfter::Drain) {
            if self.upgrading {
                self.close_after = Some(CloseAfter::Upgrade);
            } else {
                self.on_close(CloseReason::ForcedClose);
            }
        }
    }

    /// Closes once buffered packets are written and a running upgrade is done.
    fn close(&mut self) {
        match self.ready_state {
            ReadyState::Opening if self.write_buffer.is_empty() => {
                self.on_close(CloseReason::ForcedClose)
            }
            // the handshake still has to come in to write the buffer
            ReadyState::Opening => {
                self.ready_state = ReadyState::Closing;
                self.close_after = Some(CloseAfter::Drain);
            }
            ReadyState::Open => {
                self.ready_state = ReadyState::Closing;
                if !self.write_buffer.is_empty() {
                    self.close_after = Some(CloseAfter::Drain);
                } else if self.upgrading {
                    self.close_after = Some(CloseAfter::Upgrade);
                } else {
                    self.on_close(CloseReason::ForcedClose);
                }
            }
            _ => {}
        }
    }

    fn on_error(&mut self, error: String) {
        debug!("socket error {error}");
        self.options.preferences.set_prior_websocket_success(false);
        self.emit(Event::Error(error.clone()));
        self.on_close(CloseReason::TransportError(error));
    }

    fn on_close(&mut self, reason: CloseReason) {
        if !matches!(
            self.ready_state,
            ReadyState::Opening | ReadyState::Open | ReadyState::Closing
        ) {
            return;
        }
        debug!("socket close with reason: \"{reason}\"");

        self.ping_deadline = None;
        if let Some(mut active) = self.active.take() {
            active.transport.close();
        }
        self.ready_state = ReadyState::Closed;
        self.sid = None;
        self.emit(Event::Close(reason));

        self.write_buffer.clear();
        self.prev_buffer_len = 0;
        self.close_after = None;
        self.upgrading = false;

        for mut probe in std::mem::take(&mut self.probes) {
            probe.attached.transport.close();
            self.emit(Event::UpgradeError("probe error: socket closed".to_owned()));
        }
    }
}
