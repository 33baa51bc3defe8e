//! An in-memory transport for tests. The [`MockTransportFactory`] hands every
//! transport a socket creates to a [`MockServer`], whose [`MockHandle`]s play
//! the server side: accept the transport, push packets and inspect what the
//! client wrote.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::error::{Error, Result};
use crate::packet::{Packet, PacketId};
use crate::transport::{
    ReadyState, Transport, TransportEvent, TransportFactory, TransportOptions, TransportSink,
    POLLING, WEBSOCKET,
};

/// How long the async helpers wait before giving up.
const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct MockState {
    ready_state: ReadyState,
    writable: bool,
    sid: Option<String>,
}

#[derive(Debug)]
struct Shared {
    auto_drain: bool,
    failing: HashSet<String>,
}

/// Builds [`MockTransport`]s and hands their server side to the paired
/// [`MockServer`].
#[derive(Debug, Clone)]
pub struct MockTransportFactory {
    shared: Arc<Mutex<Shared>>,
    handles: UnboundedSender<MockHandle>,
}

impl MockTransportFactory {
    /// Every write is acknowledged right away.
    pub fn paired() -> (Self, MockServer) {
        Self::with_auto_drain(true)
    }

    /// Writes stay pending until [`MockHandle::drain`] is called.
    pub fn paired_with_manual_drain() -> (Self, MockServer) {
        Self::with_auto_drain(false)
    }

    fn with_auto_drain(auto_drain: bool) -> (Self, MockServer) {
        let (tx, rx) = unbounded_channel();
        let factory = MockTransportFactory {
            shared: Arc::new(Mutex::new(Shared {
                auto_drain,
                failing: HashSet::new(),
            })),
            handles: tx,
        };
        (factory, MockServer { handles: rx })
    }

    /// Creating a transport with this name fails from now on.
    pub fn fail_construction(&self, name: &str) {
        lock(&self.shared).failing.insert(name.to_owned());
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        name: &str,
        options: TransportOptions,
        sink: TransportSink,
    ) -> Result<Box<dyn Transport>> {
        let name = match name {
            POLLING => POLLING,
            WEBSOCKET => WEBSOCKET,
            _ => return Err(Error::UnknownTransport(name.to_owned())),
        };
        let auto_drain = {
            let shared = lock(&self.shared);
            if shared.failing.contains(name) {
                return Err(Error::UnknownTransport(name.to_owned()));
            }
            shared.auto_drain
        };

        let state = Arc::new(Mutex::new(MockState {
            ready_state: ReadyState::Closed,
            writable: false,
            sid: options.sid.clone(),
        }));
        let (sent_tx, sent_rx) = unbounded_channel();
        let _ = self.handles.send(MockHandle {
            name,
            options,
            sink: sink.clone(),
            state: state.clone(),
            sent: sent_rx,
        });

        Ok(Box::new(MockTransport {
            name,
            sink,
            state,
            sent: sent_tx,
            auto_drain,
        }))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The client side of a mocked transport.
#[derive(Debug)]
pub struct MockTransport {
    name: &'static str,
    sink: TransportSink,
    state: Arc<Mutex<MockState>>,
    sent: UnboundedSender<Vec<Packet>>,
    auto_drain: bool,
}

fn finish_write(state: &mut MockState, sink: &TransportSink) {
    state.writable = true;
    sink.emit(TransportEvent::Drain);
    if state.ready_state == ReadyState::Pausing {
        state.ready_state = ReadyState::Paused;
        sink.emit(TransportEvent::Paused);
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    fn ready_state(&self) -> ReadyState {
        lock(&self.state).ready_state
    }

    fn writable(&self) -> bool {
        lock(&self.state).writable
    }

    fn open(&mut self) {
        lock(&self.state).ready_state = ReadyState::Opening;
    }

    fn send(&mut self, packets: Vec<Packet>) {
        let mut state = lock(&self.state);
        if state.ready_state != ReadyState::Open {
            return;
        }
        state.writable = false;
        let _ = self.sent.send(packets);
        if self.auto_drain {
            finish_write(&mut state, &self.sink);
        }
    }

    fn close(&mut self) {
        let mut state = lock(&self.state);
        if !matches!(state.ready_state, ReadyState::Opening | ReadyState::Open) {
            return;
        }
        state.ready_state = ReadyState::Closed;
        state.writable = false;
        self.sink
            .emit(TransportEvent::Close("transport closed by the client".to_owned()));
    }

    fn pause(&mut self) {
        let mut state = lock(&self.state);
        if state.writable {
            state.ready_state = ReadyState::Paused;
            self.sink.emit(TransportEvent::Paused);
        } else {
            state.ready_state = ReadyState::Pausing;
        }
    }

    fn set_sid(&mut self, sid: &str) {
        lock(&self.state).sid = Some(sid.to_owned());
    }
}

/// Receives the server side of every transport the factory builds.
#[derive(Debug)]
pub struct MockServer {
    handles: UnboundedReceiver<MockHandle>,
}

impl MockServer {
    /// Waits for the next transport. Panics after a few seconds.
    pub async fn next_transport(&mut self) -> MockHandle {
        match tokio::time::timeout(WAIT, self.handles.recv()).await {
            Ok(Some(handle)) => handle,
            _ => panic!("no transport was created"),
        }
    }

    pub fn try_next_transport(&mut self) -> Option<MockHandle> {
        self.handles.try_recv().ok()
    }
}

/// The server side of a [`MockTransport`].
#[derive(Debug)]
pub struct MockHandle {
    name: &'static str,
    options: TransportOptions,
    sink: TransportSink,
    state: Arc<Mutex<MockState>>,
    sent: UnboundedReceiver<Vec<Packet>>,
}

impl MockHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The options the transport was created with.
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// The session id the transport currently sends.
    pub fn sid(&self) -> Option<String> {
        lock(&self.state).sid.clone()
    }

    pub fn ready_state(&self) -> ReadyState {
        lock(&self.state).ready_state
    }

    /// Completes the connection.
    pub fn open(&self) {
        let mut state = lock(&self.state);
        state.ready_state = ReadyState::Open;
        state.writable = true;
        self.sink.emit(TransportEvent::Open);
    }

    /// Delivers a packet to the client.
    pub fn receive(&self, packet: Packet) {
        self.sink.emit(TransportEvent::Packet(packet));
    }

    pub fn receive_message(&self, data: &str) {
        self.receive(Packet::new(PacketId::Message, data.to_owned()));
    }

    /// Opens the transport and answers with a handshake.
    pub fn handshake(&self, sid: &str, upgrades: &[&str], ping_interval: u64, ping_timeout: u64) {
        self.handshake_with_max_payload(sid, upgrades, ping_interval, ping_timeout, 1_000_000);
    }

    pub fn handshake_with_max_payload(
        &self,
        sid: &str,
        upgrades: &[&str],
        ping_interval: u64,
        ping_timeout: u64,
        max_payload: u64,
    ) {
        self.open();
        let data = serde_json::json!({
            "sid": sid,
            "upgrades": upgrades,
            "pingInterval": ping_interval,
            "pingTimeout": ping_timeout,
            "maxPayload": max_payload,
        });
        self.receive(Packet::new(PacketId::Open, data.to_string()));
    }

    /// Waits for the next batch the client wrote. Panics after a few seconds.
    pub async fn next_sent(&mut self) -> Vec<Packet> {
        match tokio::time::timeout(WAIT, self.sent.recv()).await {
            Ok(Some(packets)) => packets,
            _ => panic!("nothing was sent on {}", self.name),
        }
    }

    pub fn try_next_sent(&mut self) -> Option<Vec<Packet>> {
        self.sent.try_recv().ok()
    }

    /// Acknowledges the pending write.
    pub fn drain(&self) {
        finish_write(&mut lock(&self.state), &self.sink);
    }

    pub fn error(&self, message: &str) {
        self.sink.emit(TransportEvent::Error(message.to_owned()));
    }

    pub fn close_by_server(&self) {
        lock(&self.state).ready_state = ReadyState::Closed;
        self.sink
            .emit(TransportEvent::Close("transport closed by the server".to_owned()));
    }
}
