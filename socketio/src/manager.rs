use engineio_client::{
    Client as EngineClient, ClientEvents, Error as EngineError, Event as EngineEvent,
    Packet as EnginePacket, PacketId as EnginePacketId, SocketOptions as EngineOptions,
    TransportFactory,
};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use log::{debug, trace, warn};
use native_tls::TlsConnector;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{
    unbounded_channel, UnboundedReceiver, UnboundedSender, WeakUnboundedSender,
};
use tokio::time::Instant;
use url::Url;

use crate::backoff::Backoff;
use crate::emitter::{deliver, lock, Dispatcher, Emitter, Handler, ListenerId};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::packet::{Chunk, Decoder, Encoder, Packet, PacketId};
use crate::payload::Payload;
use crate::socket::{AckHandler, AckId, EmitFlags, Namespace, Socket, SocketOptions, SocketShared};

/// Connection state of a [`Manager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Closed,
    Opening,
    Open,
}

/// What a [`Manager`] reports to its listeners, see [`Manager::on`].
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    Open,
    /// The connection closed, with the reason.
    Close(String),
    /// A packet of any namespace was decoded.
    Packet(Packet),
    Error(String),
    /// The server pinged.
    Ping,
    /// Reconnected after the given number of attempts.
    Reconnect(u32),
    ReconnectAttempt(u32),
    ReconnectError(String),
    /// Gave up after `reconnection_attempts`.
    ReconnectFailed,
}

impl ManagerEvent {
    /// The name listeners register for.
    pub fn name(&self) -> &'static str {
        match self {
            ManagerEvent::Open => "open",
            ManagerEvent::Close(_) => "close",
            ManagerEvent::Packet(_) => "packet",
            ManagerEvent::Error(_) => "error",
            ManagerEvent::Ping => "ping",
            ManagerEvent::Reconnect(_) => "reconnect",
            ManagerEvent::ReconnectAttempt(_) => "reconnect_attempt",
            ManagerEvent::ReconnectError(_) => "reconnect_error",
            ManagerEvent::ReconnectFailed => "reconnect_failed",
        }
    }
}

/// How a [`Manager`] connects and reconnects.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Options of the underlying `engine.io` connection. The path defaults to
    /// `/socket.io`.
    pub engine: EngineOptions,
    pub reconnection: bool,
    /// `None` retries forever.
    pub reconnection_attempts: Option<u32>,
    pub reconnection_delay: Duration,
    pub reconnection_delay_max: Duration,
    /// Jitter of the reconnection delay, between 0 and 1.
    pub randomization_factor: f64,
    /// Gives up opening after this long.
    pub timeout: Option<Duration>,
    /// Connect sockets as soon as they are created.
    pub auto_connect: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        ManagerOptions {
            engine: EngineOptions {
                path: "/socket.io".to_owned(),
                ..EngineOptions::default()
            },
            reconnection: true,
            reconnection_attempts: None,
            reconnection_delay: Duration::from_millis(1000),
            reconnection_delay_max: Duration::from_millis(5000),
            randomization_factor: 0.5,
            timeout: Some(Duration::from_millis(20_000)),
            auto_connect: true,
        }
    }
}

#[derive(Debug, Clone)]
struct Settings {
    reconnection: bool,
    reconnection_attempts: Option<u32>,
    reconnection_delay: Duration,
    reconnection_delay_max: Duration,
    randomization_factor: f64,
    timeout: Option<Duration>,
}

impl From<&ManagerOptions> for Settings {
    fn from(options: &ManagerOptions) -> Self {
        Settings {
            reconnection: options.reconnection,
            reconnection_attempts: options.reconnection_attempts,
            reconnection_delay: options.reconnection_delay,
            reconnection_delay_max: options.reconnection_delay_max,
            randomization_factor: options.randomization_factor,
            timeout: options.timeout,
        }
    }
}

/// Requests from the handles to the manager task.
#[derive(Debug)]
pub(crate) enum Command {
    Open,
    Close,
    Register {
        shared: Arc<SocketShared>,
        options: SocketOptions,
    },
    Connect {
        nsp: String,
    },
    Disconnect {
        nsp: String,
    },
    Emit {
        nsp: String,
        event: Event,
        payload: Payload,
        flags: EmitFlags,
        ack: Option<AckHandler>,
    },
    Ack {
        nsp: String,
        id: AckId,
        payload: Payload,
    },
}

#[derive(Debug)]
struct ManagerShared {
    ready_state: RwLock<ReadyState>,
    reconnecting: AtomicBool,
    settings: RwLock<Settings>,
    auto_connect: bool,
    sockets: Mutex<HashMap<String, Arc<SocketShared>>>,
    emitter: Mutex<Emitter<String, ManagerEvent>>,
}

impl ManagerShared {
    fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut self
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner));
    }
}

/// Owns the `engine.io` connection to one server and multiplexes the
/// namespace [`Socket`]s over it. Reconnects with exponential backoff when
/// the connection drops.
///
/// All state lives in a task on the tokio runtime; `Manager` is a cheap
/// handle to it. The task stops once every handle is dropped.
///
/// ```rust,no_run
/// use socketio_client::{ManagerBuilder, ManagerEvent};
/// use futures_util::FutureExt;
///
/// # async fn run() -> Result<(), socketio_client::Error> {
/// let manager = ManagerBuilder::new("http://localhost:4200")
///     .reconnection_attempts(5)
///     .build()?;
/// manager.on("reconnect", |event: ManagerEvent| {
///     async move { println!("{event:?}") }.boxed()
/// });
/// let admin = manager.socket("/admin")?;
/// admin.emit("hello", "world")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Manager {
    commands: UnboundedSender<Command>,
    shared: Arc<ManagerShared>,
}

impl Debug for Manager {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Manager")
            .field("ready_state", &self.ready_state())
            .field("reconnecting", &self.reconnecting())
            .finish()
    }
}

impl Manager {
    /// Creates a manager for `uri`. Must be called from within a tokio
    /// runtime. Opens right away unless `auto_connect` is off.
    pub fn new<T: AsRef<str>>(uri: T, options: ManagerOptions) -> Result<Manager> {
        let handle = Handle::try_current().map_err(|_| EngineError::MissingRuntime())?;
        let uri = Url::parse(uri.as_ref())?;
        match uri.scheme() {
            "http" | "https" | "ws" | "wss" => {}
            other => return Err(Error::InvalidUrlScheme(other.to_owned())),
        }

        let shared = Arc::new(ManagerShared {
            ready_state: RwLock::new(ReadyState::Closed),
            reconnecting: AtomicBool::new(false),
            settings: RwLock::new(Settings::from(&options)),
            auto_connect: options.auto_connect,
            sockets: Mutex::new(HashMap::new()),
            emitter: Mutex::new(Emitter::default()),
        });
        let (tx, rx) = unbounded_channel();
        let manager = Manager {
            commands: tx,
            shared,
        };

        let driver = Driver::new(uri, options.engine, manager.downgrade(), &manager.shared);
        handle.spawn(driver.run(rx));

        if manager.shared.auto_connect {
            manager.open()?;
        }
        Ok(manager)
    }

    pub(crate) fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::StoppedManager())
    }

    fn downgrade(&self) -> WeakManager {
        WeakManager {
            commands: self.commands.downgrade(),
            shared: self.shared.clone(),
        }
    }

    /// Opens the connection. Does nothing while open or opening.
    pub fn open(&self) -> Result<()> {
        self.command(Command::Open)
    }

    pub fn connect(&self) -> Result<()> {
        self.open()
    }

    /// Closes the connection and stops reconnecting.
    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Close)
    }

    pub fn close(&self) -> Result<()> {
        self.disconnect()
    }

    /// The socket of namespace `nsp`, created on first use. Every call for
    /// the same namespace returns a handle to the same socket.
    pub fn socket(&self, nsp: &str) -> Result<Socket> {
        self.socket_with_options(nsp, SocketOptions::default())
    }

    /// Like [`Manager::socket`]. `options` only apply when the socket is
    /// created.
    pub fn socket_with_options(&self, nsp: &str, options: SocketOptions) -> Result<Socket> {
        let nsp = if nsp.starts_with('/') {
            nsp.to_owned()
        } else {
            format!("/{nsp}")
        };

        let (shared, created) = {
            let mut sockets = lock(&self.shared.sockets);
            match sockets.get(&nsp) {
                Some(shared) => (shared.clone(), false),
                None => {
                    let shared = Arc::new(SocketShared::new(nsp.clone()));
                    sockets.insert(nsp.clone(), shared.clone());
                    (shared, true)
                }
            }
        };

        if created {
            self.command(Command::Register {
                shared: shared.clone(),
                options,
            })?;
        }
        if self.shared.auto_connect && (created || !shared.is_active()) {
            self.command(Command::Connect { nsp })?;
        }
        Ok(Socket::new(self.clone(), shared))
    }

    pub(crate) fn has_socket(&self, nsp: &str) -> bool {
        lock(&self.shared.sockets).contains_key(nsp)
    }

    pub fn ready_state(&self) -> ReadyState {
        *self
            .shared
            .ready_state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a reconnection is scheduled or in progress.
    pub fn reconnecting(&self) -> bool {
        self.shared.reconnecting.load(Ordering::Acquire)
    }

    /// Registers a listener for the [`ManagerEvent`] named `event`, see
    /// [`ManagerEvent::name`].
    pub fn on<F>(&self, event: &str, callback: F) -> ListenerId
    where
        F: FnMut(ManagerEvent) -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.listen(event, false, Box::new(callback))
    }

    pub fn once<F>(&self, event: &str, callback: F) -> ListenerId
    where
        F: FnMut(ManagerEvent) -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.listen(event, true, Box::new(callback))
    }

    fn listen(&self, event: &str, once: bool, handler: Handler<ManagerEvent>) -> ListenerId {
        lock(&self.shared.emitter).on(event.to_owned(), once, handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        lock(&self.shared.emitter).off(id)
    }

    pub fn reconnection(&self) -> bool {
        self.shared.settings().reconnection
    }

    /// Turning reconnection off also cancels a pending attempt.
    pub fn set_reconnection(&self, reconnection: bool) {
        self.shared.update(|s| s.reconnection = reconnection);
    }

    pub fn reconnection_attempts(&self) -> Option<u32> {
        self.shared.settings().reconnection_attempts
    }

    pub fn set_reconnection_attempts(&self, attempts: Option<u32>) {
        self.shared.update(|s| s.reconnection_attempts = attempts);
    }

    pub fn reconnection_delay(&self) -> Duration {
        self.shared.settings().reconnection_delay
    }

    pub fn set_reconnection_delay(&self, delay: Duration) {
        self.shared.update(|s| s.reconnection_delay = delay);
    }

    pub fn reconnection_delay_max(&self) -> Duration {
        self.shared.settings().reconnection_delay_max
    }

    pub fn set_reconnection_delay_max(&self, delay: Duration) {
        self.shared.update(|s| s.reconnection_delay_max = delay);
    }

    pub fn randomization_factor(&self) -> f64 {
        self.shared.settings().randomization_factor
    }

    pub fn set_randomization_factor(&self, factor: f64) {
        self.shared.update(|s| s.randomization_factor = factor);
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.shared.settings().timeout
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.shared.update(|s| s.timeout = timeout);
    }
}

/// A handle that doesn't keep the manager task alive.
#[derive(Debug, Clone)]
pub(crate) struct WeakManager {
    commands: WeakUnboundedSender<Command>,
    shared: Arc<ManagerShared>,
}

impl WeakManager {
    pub(crate) fn upgrade(&self) -> Option<Manager> {
        Some(Manager {
            commands: self.commands.upgrade()?,
            shared: self.shared.clone(),
        })
    }
}

/// Writes packets to the `engine.io` connection, if there is one.
#[derive(Debug, Default)]
pub(crate) struct Wire {
    engine: Option<EngineClient>,
    encoder: Encoder,
}

impl Wire {
    pub(crate) fn packet(&self, packet: &Packet) {
        let Some(engine) = &self.engine else {
            debug!("no connection, dropping packet {packet:?}");
            return;
        };
        trace!("writing packet {packet:?}");
        for chunk in self.encoder.encode(packet) {
            let result = match chunk {
                Chunk::Text(text) => engine.send_message(text),
                Chunk::Binary(data) => engine.send_binary(data),
            };
            if let Err(err) = result {
                warn!("could not write packet: {err}");
            }
        }
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.engine.as_ref().is_some_and(EngineClient::is_writable)
    }
}

/// The manager task.
struct Driver {
    uri: Url,
    engine_options: EngineOptions,
    ready_state: ReadyState,
    wire: Wire,
    engine_events: Option<ClientEvents>,
    decoder: Decoder,
    backoff: Backoff,
    reconnecting: bool,
    skip_reconnect: bool,
    /// The running open is a reconnection attempt.
    open_for_reconnect: bool,
    connect_deadline: Option<Instant>,
    reconnect_deadline: Option<Instant>,
    /// Ordered, so namespaces connect in a stable order.
    nsps: BTreeMap<String, Namespace>,
    shared: Arc<ManagerShared>,
    dispatcher: Dispatcher,
    manager: WeakManager,
}

impl Driver {
    fn new(
        uri: Url,
        engine_options: EngineOptions,
        manager: WeakManager,
        shared: &Arc<ManagerShared>,
    ) -> Self {
        let settings = shared.settings();
        Driver {
            uri,
            engine_options,
            ready_state: ReadyState::Closed,
            wire: Wire::default(),
            engine_events: None,
            decoder: Decoder::new(),
            backoff: Backoff::new(
                settings.reconnection_delay.as_millis() as u64,
                settings.reconnection_delay_max.as_millis() as u64,
                2,
                settings.randomization_factor,
            ),
            reconnecting: false,
            skip_reconnect: false,
            open_for_reconnect: false,
            connect_deadline: None,
            reconnect_deadline: None,
            nsps: BTreeMap::new(),
            shared: shared.clone(),
            dispatcher: Dispatcher::spawn(),
            manager,
        }
    }

    async fn run(mut self, mut commands: UnboundedReceiver<Command>) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        self.close_forced();
                        break;
                    }
                },
                event = next_engine_event(&mut self.engine_events) => self.on_engine_event(event),
                () = sleep_until(deadline) => self.on_timer(),
            }
        }
        trace!("manager task for {} stopped", self.uri);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.nsps
            .values()
            .filter_map(Namespace::next_deadline)
            .chain(self.connect_deadline)
            .chain(self.reconnect_deadline)
            .min()
    }

    fn emit(&self, event: ManagerEvent) {
        let handlers = lock(&self.shared.emitter).take(&event.name().to_owned(), false);
        if !handlers.is_empty() {
            self.dispatcher.dispatch(deliver(handlers, event));
        }
    }

    fn set_ready_state(&mut self, state: ReadyState) {
        self.ready_state = state;
        *self
            .shared
            .ready_state
            .write()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn set_reconnecting(&mut self, reconnecting: bool) {
        self.reconnecting = reconnecting;
        self.shared
            .reconnecting
            .store(reconnecting, Ordering::Release);
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Open => self.open(),
            Command::Close => self.close_forced(),
            Command::Register { shared, options } => {
                let nsp = shared.nsp().to_owned();
                let namespace =
                    Namespace::new(shared, options, self.manager.clone(), self.dispatcher.clone());
                self.nsps.entry(nsp).or_insert(namespace);
            }
            Command::Connect { nsp } => self.socket_connect(&nsp),
            Command::Disconnect { nsp } => self.socket_disconnect(&nsp),
            Command::Emit {
                nsp,
                event,
                payload,
                flags,
                ack,
            } => {
                if let Some(ns) = self.nsps.get_mut(&nsp) {
                    ns.emit(&self.wire, event, payload, flags, ack);
                }
            }
            Command::Ack { nsp, id, payload } => {
                if let Some(ns) = self.nsps.get_mut(&nsp) {
                    ns.ack(&self.wire, id, payload);
                }
            }
        }
    }

    fn open(&mut self) {
        if self.ready_state != ReadyState::Closed {
            return;
        }
        debug!("opening {}", self.uri);
        self.skip_reconnect = false;
        self.set_ready_state(ReadyState::Opening);

        match EngineClient::connect(self.uri.clone(), self.engine_options.clone()) {
            Ok((engine, events)) => {
                self.wire.engine = Some(engine);
                self.engine_events = Some(events);
                self.connect_deadline = self
                    .shared
                    .settings()
                    .timeout
                    .map(|timeout| Instant::now() + timeout);
            }
            Err(err) => self.on_open_error(err.to_string()),
        }
    }

    fn on_open_error(&mut self, error: String) {
        debug!("connect error: {error}");
        self.cleanup();
        self.close_engine();
        self.set_ready_state(ReadyState::Closed);
        self.emit(ManagerEvent::Error(error.clone()));
        for ns in self.nsps.values().filter(|ns| ns.is_active()) {
            ns.onerror(&error);
        }

        if self.open_for_reconnect {
            self.open_for_reconnect = false;
            self.set_reconnecting(false);
            self.reconnect();
            self.emit(ManagerEvent::ReconnectError(error));
        } else {
            self.maybe_reconnect_on_open();
        }
    }

    fn maybe_reconnect_on_open(&mut self) {
        if !self.reconnecting
            && self.shared.settings().reconnection
            && self.backoff.attempts() == 0
        {
            self.reconnect();
        }
    }

    fn onopen(&mut self) {
        debug!("open");
        self.cleanup();
        self.set_ready_state(ReadyState::Open);
        self.emit(ManagerEvent::Open);
        for ns in self.nsps.values_mut().filter(|ns| ns.is_active()) {
            ns.onopen(&self.wire);
        }
        if self.open_for_reconnect || self.reconnecting {
            self.open_for_reconnect = false;
            self.reconnect_deadline = None;
            self.onreconnect();
        }
    }

    fn cleanup(&mut self) {
        self.connect_deadline = None;
        self.decoder.reset();
    }

    fn close_engine(&mut self) {
        self.engine_events = None;
        if let Some(engine) = self.wire.engine.take() {
            let _ = engine.close();
        }
    }

    fn on_engine_event(&mut self, event: Option<EngineEvent>) {
        let Some(event) = event else {
            self.engine_events = None;
            match self.ready_state {
                ReadyState::Opening => self.on_open_error("transport close".to_owned()),
                ReadyState::Open => self.onclose("transport close"),
                ReadyState::Closed => {}
            }
            return;
        };

        match (self.ready_state, event) {
            (ReadyState::Opening, EngineEvent::Open) => self.onopen(),
            (ReadyState::Opening, EngineEvent::Error(error)) => self.on_open_error(error),
            (ReadyState::Opening, EngineEvent::Close(reason)) => {
                self.on_open_error(reason.to_string())
            }
            (ReadyState::Open, EngineEvent::Message(packet)) => self.ondata(packet),
            (ReadyState::Open, EngineEvent::Ping) => self.emit(ManagerEvent::Ping),
            (ReadyState::Open, EngineEvent::Error(error)) => {
                debug!("error: {error}");
                self.emit(ManagerEvent::Error(error.clone()));
                for ns in self.nsps.values().filter(|ns| ns.is_active()) {
                    ns.onerror(&error);
                }
            }
            (ReadyState::Open, EngineEvent::Close(reason)) => self.onclose(&reason.to_string()),
            _ => {}
        }
    }

    fn ondata(&mut self, packet: EnginePacket) {
        let chunk = match packet.packet_id {
            EnginePacketId::MessageBinary => Chunk::Binary(packet.data),
            _ => match String::from_utf8(packet.data.to_vec()) {
                Ok(text) => Chunk::Text(text),
                Err(err) => {
                    warn!("received invalid utf-8: {err}");
                    self.onclose("parse error");
                    return;
                }
            },
        };
        match self.decoder.add(chunk) {
            Ok(Some(packet)) => self.ondecoded(packet),
            Ok(None) => {}
            Err(err) => {
                warn!("could not decode packet: {err}");
                self.onclose("parse error");
            }
        }
    }

    fn ondecoded(&mut self, packet: Packet) {
        trace!("decoded {packet:?}");
        self.emit(ManagerEvent::Packet(packet.clone()));
        let nsp = packet.nsp.clone();
        match self.nsps.get_mut(&nsp) {
            Some(ns) if ns.is_active() => match packet.packet_type {
                PacketId::Disconnect => {
                    ns.destroy();
                    self.destroy_check();
                    if let Some(ns) = self.nsps.get_mut(&nsp) {
                        ns.onclose(&self.wire, "io server disconnect");
                    }
                }
                PacketId::ConnectError => {
                    ns.destroy();
                    self.destroy_check();
                    if let Some(ns) = self.nsps.get(&nsp) {
                        ns.on_connect_error(packet.data);
                    }
                }
                _ => ns.onpacket(&self.wire, packet),
            },
            _ => trace!("no active socket for namespace {nsp}"),
        }
    }

    fn onclose(&mut self, reason: &str) {
        debug!("close ({reason})");
        self.cleanup();
        self.close_engine();
        self.backoff.reset();
        self.set_ready_state(ReadyState::Closed);
        self.emit(ManagerEvent::Close(reason.to_owned()));
        for ns in self.nsps.values_mut().filter(|ns| ns.is_active()) {
            ns.onclose(&self.wire, reason);
        }
        if self.shared.settings().reconnection && !self.skip_reconnect {
            self.reconnect();
        }
    }

    fn reconnect(&mut self) {
        if self.reconnecting || self.skip_reconnect {
            return;
        }
        let settings = self.shared.settings();
        self.backoff
            .set_min(settings.reconnection_delay.as_millis() as u64);
        self.backoff
            .set_max(settings.reconnection_delay_max.as_millis() as u64);
        self.backoff.set_jitter(settings.randomization_factor);

        if settings
            .reconnection_attempts
            .is_some_and(|limit| self.backoff.attempts() >= limit)
        {
            debug!("reconnect failed");
            self.backoff.reset();
            self.emit(ManagerEvent::ReconnectFailed);
            self.set_reconnecting(false);
        } else {
            let delay = self.backoff.duration();
            debug!("will wait {delay:?} before reconnect attempt");
            self.set_reconnecting(true);
            self.reconnect_deadline = Some(Instant::now() + delay);
        }
    }

    fn on_reconnect_timer(&mut self) {
        if self.skip_reconnect || !self.shared.settings().reconnection {
            self.set_reconnecting(false);
            return;
        }
        debug!("attempting reconnect");
        self.emit(ManagerEvent::ReconnectAttempt(self.backoff.attempts()));
        self.open_for_reconnect = true;
        self.open();
    }

    fn onreconnect(&mut self) {
        let attempt = self.backoff.attempts();
        self.set_reconnecting(false);
        self.backoff.reset();
        self.emit(ManagerEvent::Reconnect(attempt));
    }

    fn on_timer(&mut self) {
        let now = Instant::now();
        if self.connect_deadline.is_some_and(|deadline| deadline <= now) {
            self.connect_deadline = None;
            debug!("connect attempt timed out");
            self.on_open_error("timeout".to_owned());
        }
        if self.reconnect_deadline.is_some_and(|deadline| deadline <= now) {
            self.reconnect_deadline = None;
            self.on_reconnect_timer();
        }
        for ns in self.nsps.values_mut() {
            ns.expire_acks(&self.wire, now);
        }
    }

    /// Closes for good, no reconnection follows.
    fn close_forced(&mut self) {
        debug!("disconnect");
        self.skip_reconnect = true;
        self.set_reconnecting(false);
        self.reconnect_deadline = None;
        self.open_for_reconnect = false;
        if self.ready_state != ReadyState::Closed {
            self.onclose("forced close");
        }
    }

    /// Closes once no socket follows the manager any more.
    fn destroy_check(&mut self) {
        if self.nsps.values().any(Namespace::is_active) {
            return;
        }
        self.close_forced();
    }

    fn socket_connect(&mut self, nsp: &str) {
        match self.nsps.get_mut(nsp) {
            Some(ns) if !ns.is_connected() => ns.subscribe(),
            _ => return,
        }
        if !self.reconnecting {
            self.open();
        }
        if self.ready_state == ReadyState::Open {
            if let Some(ns) = self.nsps.get_mut(nsp) {
                ns.onopen(&self.wire);
            }
        }
    }

    fn socket_disconnect(&mut self, nsp: &str) {
        let Some(ns) = self.nsps.get_mut(nsp) else {
            return;
        };
        let was_connected = ns.is_connected();
        if was_connected {
            self.wire.packet(&Packet::disconnect(nsp));
        }
        ns.destroy();
        self.destroy_check();
        if was_connected {
            if let Some(ns) = self.nsps.get_mut(nsp) {
                ns.onclose(&self.wire, "io client disconnect");
            }
        }
    }
}

async fn next_engine_event(events: &mut Option<ClientEvents>) -> Option<EngineEvent> {
    match events {
        Some(events) => events.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Configures and builds a [`Manager`].
#[derive(Debug, Clone)]
pub struct ManagerBuilder {
    uri: String,
    options: ManagerOptions,
}

impl ManagerBuilder {
    pub fn new<T: Into<String>>(uri: T) -> Self {
        ManagerBuilder {
            uri: uri.into(),
            options: ManagerOptions::default(),
        }
    }

    pub fn with_options<T: Into<String>>(uri: T, options: ManagerOptions) -> Self {
        ManagerBuilder {
            uri: uri.into(),
            options,
        }
    }

    /// Path of the `engine.io` endpoint, `/socket.io` by default.
    pub fn path<T: Into<String>>(mut self, path: T) -> Self {
        self.options.engine.path = path.into();
        self
    }

    pub fn query<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.options.engine.query.push((key.into(), value.into()));
        self
    }

    pub fn transports<I, T>(mut self, transports: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.options.engine.transports = transports.into_iter().map(Into::into).collect();
        self
    }

    pub fn upgrade(mut self, upgrade: bool) -> Self {
        self.options.engine.upgrade = upgrade;
        self
    }

    pub fn tls_config(mut self, tls_config: TlsConnector) -> Self {
        self.options.engine.tls_config = Some(tls_config);
        self
    }

    /// Adds a header to the requests that open the connection.
    pub fn opening_header<V: Into<HeaderValue>>(mut self, name: HeaderName, value: V) -> Self {
        self.options
            .engine
            .extra_headers
            .get_or_insert_with(HeaderMap::new)
            .insert(name, value.into());
        self
    }

    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.options.engine.transport_factory = factory;
        self
    }

    pub fn reconnection(mut self, reconnection: bool) -> Self {
        self.options.reconnection = reconnection;
        self
    }

    pub fn reconnection_attempts(mut self, attempts: u32) -> Self {
        self.options.reconnection_attempts = Some(attempts);
        self
    }

    pub fn reconnection_delay(mut self, delay: Duration) -> Self {
        self.options.reconnection_delay = delay;
        self
    }

    pub fn reconnection_delay_max(mut self, delay: Duration) -> Self {
        self.options.reconnection_delay_max = delay;
        self
    }

    pub fn randomization_factor(mut self, factor: f64) -> Self {
        self.options.randomization_factor = factor;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.options.auto_connect = auto_connect;
        self
    }

    pub fn build(self) -> Result<Manager> {
        Manager::new(self.uri, self.options)
    }
}
