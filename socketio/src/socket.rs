use futures_util::future::{BoxFuture, FutureExt};
use log::{debug, trace, warn};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::emitter::{deliver, lock, Dispatcher, Emitter, Handler, ListenerId, SharedHandler};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::manager::{Command, Manager, WeakManager, Wire};
use crate::packet::{Packet, PacketId};
use crate::payload::Payload;
use crate::value::Value;

/// The id of an acknowledgement the server asked for, see [`Socket::ack`].
pub type AckId = u64;

const V2_SERVER: &str = "It seems you are trying to reach a Socket.IO server in v2.x with a v3.x client, but they are not compatible (more information here: https://socket.io/docs/v3/migrating-from-2-x-to-3-0/)";

/// Options of one namespace.
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    /// Sent with the `CONNECT` packet, must be a JSON object.
    pub auth: Option<Value>,
    /// Fails acknowledgements that take longer.
    pub ack_timeout: Option<Duration>,
    /// Routes every emit through a queue that sends one packet at a time and
    /// retries a packet whose acknowledgement failed up to this many times.
    pub retries: Option<u32>,
}

impl SocketOptions {
    pub fn auth(mut self, auth: serde_json::Value) -> Self {
        self.auth = Some(Value::from(auth));
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct EmitFlags {
    pub(crate) volatile: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) from_queue: bool,
}

/// What a listener receives.
#[derive(Debug, Clone)]
pub(crate) struct Delivery {
    event: Event,
    payload: Payload,
    ack: Option<AckId>,
    socket: Socket,
}

type AckCallback = Box<dyn FnOnce(Result<Payload>, Socket) -> BoxFuture<'static, ()> + Send>;

/// Whoever waits for an acknowledgement.
pub(crate) enum AckHandler {
    Callback(AckCallback),
    Channel(oneshot::Sender<Result<Payload>>),
    /// The head of the retry queue with the given sequence number.
    Queue(u64),
}

impl Debug for AckHandler {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            AckHandler::Callback(_) => f.write_str("Callback"),
            AckHandler::Channel(_) => f.write_str("Channel"),
            AckHandler::Queue(id) => f.debug_tuple("Queue").field(id).finish(),
        }
    }
}

/// The state of a namespace that handles can read without the manager.
#[derive(Debug)]
pub(crate) struct SocketShared {
    nsp: String,
    connected: AtomicBool,
    active: AtomicBool,
    recovered: AtomicBool,
    id: RwLock<Option<String>>,
    emitter: Mutex<Emitter<Event, Delivery>>,
}

impl SocketShared {
    pub(crate) fn new(nsp: String) -> Self {
        SocketShared {
            nsp,
            connected: AtomicBool::new(false),
            active: AtomicBool::new(false),
            recovered: AtomicBool::new(false),
            id: RwLock::new(None),
            emitter: Mutex::new(Emitter::default()),
        }
    }

    pub(crate) fn nsp(&self) -> &str {
        &self.nsp
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// A socket bound to one namespace of a [`Manager`]. Handles are cheap to
/// clone and all talk to the same namespace.
///
/// ```rust,no_run
/// use socketio_client::{ManagerBuilder, Payload, Socket};
/// use futures_util::FutureExt;
/// use serde_json::json;
///
/// # async fn run() -> Result<(), socketio_client::Error> {
/// let manager = ManagerBuilder::new("http://localhost:4200").build()?;
/// let socket = manager.socket("/chat")?;
///
/// socket.on("message", |payload: Payload, _socket: Socket| {
///     async move { println!("Received: {payload:?}") }.boxed()
/// });
///
/// // buffered until the namespace is connected
/// socket.emit("join", json!({"room": "lobby"}))?;
///
/// let reply = socket
///     .timeout(std::time::Duration::from_secs(5))
///     .emit_with_ack_async("ping", ())
///     .await?;
/// println!("server answered {reply:?}");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Socket {
    manager: Manager,
    shared: Arc<SocketShared>,
    flags: EmitFlags,
}

impl Socket {
    pub(crate) fn new(manager: Manager, shared: Arc<SocketShared>) -> Self {
        Socket {
            manager,
            shared,
            flags: EmitFlags::default(),
        }
    }

    fn command(&self, command: Command) -> Result<()> {
        self.manager.command(command)
    }

    /// The namespace of this socket.
    pub fn nsp(&self) -> &str {
        &self.shared.nsp
    }

    /// The manager this socket is multiplexed on.
    pub fn io(&self) -> &Manager {
        &self.manager
    }

    /// Whether the namespace accepted the connection.
    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Whether the socket follows the manager, that is reconnects with it.
    pub fn active(&self) -> bool {
        self.shared.is_active()
    }

    /// Whether the last connection restored the session of the one before.
    pub fn recovered(&self) -> bool {
        self.shared.recovered.load(Ordering::Acquire)
    }

    /// The id the server assigned on connect.
    pub fn id(&self) -> Option<String> {
        self.shared
            .id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Connects the namespace, opening the manager if needed. Does nothing
    /// if already connected.
    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect {
            nsp: self.nsp().to_owned(),
        })
    }

    pub fn open(&self) -> Result<()> {
        self.connect()
    }

    /// Leaves the namespace. The manager closes once no socket is active.
    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect {
            nsp: self.nsp().to_owned(),
        })
    }

    pub fn close(&self) -> Result<()> {
        self.disconnect()
    }

    /// A handle whose emits are dropped unless they can be written right away.
    pub fn volatile(&self) -> Socket {
        let mut socket = self.clone();
        socket.flags.volatile = true;
        socket
    }

    /// A handle whose acknowledgements fail after `timeout`.
    pub fn timeout(&self, timeout: Duration) -> Socket {
        let mut socket = self.clone();
        socket.flags.timeout = Some(timeout);
        socket
    }

    /// Sends an event. Events emitted before the namespace is connected are
    /// buffered and sent on connect.
    ///
    /// Fails if `event` is one of the reserved event names.
    pub fn emit<E, D>(&self, event: E, data: D) -> Result<()>
    where
        E: Into<Event>,
        D: Into<Payload>,
    {
        self.emit_inner(event.into(), data.into(), None)
    }

    /// Sends an event and calls `callback` with the acknowledgement of the
    /// server, or with an error if it timed out or the socket disconnected
    /// first.
    pub fn emit_with_ack<E, D, F>(&self, event: E, data: D, callback: F) -> Result<()>
    where
        E: Into<Event>,
        D: Into<Payload>,
        F: FnOnce(Result<Payload>, Socket) -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.emit_inner(
            event.into(),
            data.into(),
            Some(AckHandler::Callback(Box::new(callback))),
        )
    }

    /// Sends an event and waits for its acknowledgement.
    pub async fn emit_with_ack_async<E, D>(&self, event: E, data: D) -> Result<Payload>
    where
        E: Into<Event>,
        D: Into<Payload>,
    {
        let (tx, rx) = oneshot::channel();
        self.emit_inner(event.into(), data.into(), Some(AckHandler::Channel(tx)))?;
        rx.await.map_err(|_| Error::StoppedManager())?
    }

    /// Emits a `message` event.
    pub fn send<D: Into<Payload>>(&self, data: D) -> Result<()> {
        self.emit(Event::Message, data)
    }

    fn emit_inner(&self, event: Event, payload: Payload, ack: Option<AckHandler>) -> Result<()> {
        if event.is_reserved() {
            return Err(Error::ReservedEvent(event.to_string()));
        }
        self.command(Command::Emit {
            nsp: self.nsp().to_owned(),
            event,
            payload,
            flags: self.flags,
            ack,
        })
    }

    /// Answers an event the server asked an acknowledgement for. Only the
    /// first answer per id is sent.
    pub fn ack<D: Into<Payload>>(&self, id: AckId, data: D) -> Result<()> {
        self.command(Command::Ack {
            nsp: self.nsp().to_owned(),
            id,
            payload: data.into(),
        })
    }

    /// Registers a listener. Lifecycle events carry their details as payload:
    /// the reason for [`Event::Disconnect`], the error for
    /// [`Event::ConnectError`].
    pub fn on<T, F>(&self, event: T, mut callback: F) -> ListenerId
    where
        T: Into<Event>,
        F: FnMut(Payload, Socket) -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.listen(
            event.into(),
            false,
            Box::new(move |delivery: Delivery| callback(delivery.payload, delivery.socket)),
        )
    }

    /// Registers a listener for events the server wants acknowledged. It is
    /// only called for those.
    pub fn on_with_ack<T, F>(&self, event: T, mut callback: F) -> ListenerId
    where
        T: Into<Event>,
        F: FnMut(Payload, Socket, AckId) -> BoxFuture<'static, ()> + Send + 'static,
    {
        lock(&self.shared.emitter).on_acking(
            event.into(),
            Box::new(move |delivery: Delivery| match delivery.ack {
                Some(id) => callback(delivery.payload, delivery.socket, id),
                None => std::future::ready(()).boxed(),
            }),
        )
    }

    /// Like [`Socket::on`], removed after the first call.
    pub fn once<T, F>(&self, event: T, mut callback: F) -> ListenerId
    where
        T: Into<Event>,
        F: FnMut(Payload, Socket) -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.listen(
            event.into(),
            true,
            Box::new(move |delivery: Delivery| callback(delivery.payload, delivery.socket)),
        )
    }

    fn listen(&self, event: Event, once: bool, handler: Handler<Delivery>) -> ListenerId {
        lock(&self.shared.emitter).on(event, once, handler)
    }

    /// Registers a listener for every event the server sends. Lifecycle
    /// events don't reach it.
    pub fn on_any<F>(&self, mut callback: F) -> ListenerId
    where
        F: FnMut(Event, Payload, Socket) -> BoxFuture<'static, ()> + Send + 'static,
    {
        lock(&self.shared.emitter).on_any(Box::new(move |delivery: Delivery| {
            callback(delivery.event, delivery.payload, delivery.socket)
        }))
    }

    /// Removes a listener, returns whether it was registered.
    pub fn off(&self, id: ListenerId) -> bool {
        lock(&self.shared.emitter).off(id)
    }

    /// Removes every listener of `event`.
    pub fn off_event<T: Into<Event>>(&self, event: T) {
        lock(&self.shared.emitter).off_key(&event.into());
    }

    /// Removes every listener registered with [`Socket::on_any`].
    pub fn off_any(&self) {
        lock(&self.shared.emitter).off_any();
    }

    pub fn remove_all_listeners(&self) {
        lock(&self.shared.emitter).clear();
    }
}

#[derive(Debug)]
struct PendingAck {
    handler: AckHandler,
    deadline: Option<Instant>,
}

#[derive(Debug)]
struct Queued {
    id: u64,
    try_count: u32,
    pending: bool,
    event: Event,
    payload: Payload,
    flags: EmitFlags,
    ack: Option<AckHandler>,
}

/// A namespace as the manager sees it. Lives inside the manager task.
#[derive(Debug)]
pub(crate) struct Namespace {
    shared: Arc<SocketShared>,
    manager: WeakManager,
    dispatcher: Dispatcher,
    options: SocketOptions,
    active: bool,
    connected: bool,
    pid: Option<String>,
    last_offset: Option<String>,
    next_ack: u64,
    acks: HashMap<u64, PendingAck>,
    /// Acks the server asked for and we did not send yet.
    server_acks: HashSet<AckId>,
    send_buffer: Vec<Packet>,
    receive_buffer: Vec<Packet>,
    queue: VecDeque<Queued>,
    queue_seq: u64,
}

impl Namespace {
    pub(crate) fn new(
        shared: Arc<SocketShared>,
        options: SocketOptions,
        manager: WeakManager,
        dispatcher: Dispatcher,
    ) -> Self {
        Namespace {
            shared,
            manager,
            dispatcher,
            options,
            active: false,
            connected: false,
            pid: None,
            last_offset: None,
            next_ack: 0,
            acks: HashMap::new(),
            server_acks: HashSet::new(),
            send_buffer: Vec::new(),
            receive_buffer: Vec::new(),
            queue: VecDeque::new(),
            queue_seq: 0,
        }
    }

    fn nsp(&self) -> &str {
        &self.shared.nsp
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected
    }

    fn handle(&self) -> Option<Socket> {
        self.manager
            .upgrade()
            .map(|manager| Socket::new(manager, self.shared.clone()))
    }

    fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        self.shared.connected.store(connected, Ordering::Release);
    }

    fn set_id(&mut self, id: Option<String>) {
        *self
            .shared
            .id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = id;
    }

    /// Starts following the manager.
    pub(crate) fn subscribe(&mut self) {
        self.active = true;
        self.shared.active.store(true, Ordering::Release);
    }

    /// Stops following the manager, it won't reconnect this namespace.
    pub(crate) fn destroy(&mut self) {
        self.active = false;
        self.shared.active.store(false, Ordering::Release);
    }

    fn emit_reserved(&self, event: Event, payload: Payload) {
        let handlers = lock(&self.shared.emitter).take(&event, false);
        self.dispatch(handlers, event, payload, None);
    }

    fn dispatch(
        &self,
        handlers: Vec<SharedHandler<Delivery>>,
        event: Event,
        payload: Payload,
        ack: Option<AckId>,
    ) {
        if handlers.is_empty() {
            return;
        }
        let Some(socket) = self.handle() else {
            return;
        };
        self.dispatcher.dispatch(deliver(
            handlers,
            Delivery {
                event,
                payload,
                ack,
                socket,
            },
        ));
    }

    /// The manager is open, ask the server for the namespace.
    pub(crate) fn onopen(&mut self, wire: &Wire) {
        trace!("connecting namespace {}", self.nsp());
        let mut auth = self.options.auth.clone();
        if let Some(pid) = &self.pid {
            let mut map = match auth {
                Some(Value::Object(map)) => map,
                _ => BTreeMap::new(),
            };
            map.entry("pid".to_owned())
                .or_insert_with(|| Value::from(pid.as_str()));
            if let Some(offset) = &self.last_offset {
                map.entry("offset".to_owned())
                    .or_insert_with(|| Value::from(offset.as_str()));
            }
            auth = Some(Value::Object(map));
        }
        wire.packet(&Packet::connect(self.nsp(), auth));
    }

    pub(crate) fn emit(
        &mut self,
        wire: &Wire,
        event: Event,
        payload: Payload,
        flags: EmitFlags,
        ack: Option<AckHandler>,
    ) {
        if self.options.retries.is_some() && !flags.from_queue && !flags.volatile {
            self.add_to_queue(wire, event, payload, flags, ack);
            return;
        }

        let mut packet = Packet::event(self.nsp(), &event, payload, None);
        if let Some(handler) = ack {
            let id = self.next_ack;
            self.next_ack += 1;
            packet.id = Some(id);
            let deadline = flags
                .timeout
                .or(self.options.ack_timeout)
                .map(|timeout| Instant::now() + timeout);
            self.acks.insert(id, PendingAck { handler, deadline });
        }

        if flags.volatile && !(self.connected && wire.is_writable()) {
            debug!("discard volatile packet for event {event}");
        } else if self.connected {
            wire.packet(&packet);
        } else {
            self.send_buffer.push(packet);
        }
    }

    fn add_to_queue(
        &mut self,
        wire: &Wire,
        event: Event,
        payload: Payload,
        flags: EmitFlags,
        ack: Option<AckHandler>,
    ) {
        let id = self.queue_seq;
        self.queue_seq += 1;
        self.queue.push_back(Queued {
            id,
            try_count: 0,
            pending: false,
            event,
            payload,
            flags: EmitFlags {
                from_queue: true,
                ..flags
            },
            ack,
        });
        self.drain_queue(wire, false);
    }

    /// Sends the head of the queue unless it is already in flight.
    fn drain_queue(&mut self, wire: &Wire, force: bool) {
        if !self.connected {
            return;
        }
        let Some(head) = self.queue.front_mut() else {
            return;
        };
        if head.pending && !force {
            return;
        }
        head.pending = true;
        head.try_count += 1;
        trace!("sending queued packet {} (try {})", head.id, head.try_count);
        let (id, event, payload, flags) = (
            head.id,
            head.event.clone(),
            head.payload.clone(),
            head.flags,
        );
        self.emit(wire, event, payload, flags, Some(AckHandler::Queue(id)));
    }

    fn on_queue_ack(&mut self, wire: &Wire, id: u64, result: Result<Payload>) {
        let retries = self.options.retries.unwrap_or(0);
        let Some(head) = self.queue.front_mut() else {
            return;
        };
        if head.id != id {
            // already resolved
            return;
        }
        match result {
            Err(err) if head.try_count <= retries => {
                debug!("queued packet {id} failed, retrying: {err}");
                head.pending = false;
            }
            result => {
                if let Some(ack) = self.queue.pop_front().and_then(|queued| queued.ack) {
                    self.resolve(wire, ack, result);
                }
            }
        }
        self.drain_queue(wire, false);
    }

    fn resolve(&mut self, wire: &Wire, handler: AckHandler, result: Result<Payload>) {
        match handler {
            AckHandler::Callback(callback) => {
                if let Some(socket) = self.handle() {
                    self.dispatcher.dispatch(callback(result, socket));
                }
            }
            AckHandler::Channel(tx) => {
                let _ = tx.send(result);
            }
            AckHandler::Queue(id) => self.on_queue_ack(wire, id, result),
        }
    }

    /// Replies to an acknowledgement request of the server.
    pub(crate) fn ack(&mut self, wire: &Wire, id: AckId, payload: Payload) {
        if self.server_acks.remove(&id) {
            wire.packet(&Packet::ack(self.nsp(), id, payload));
        } else {
            warn!("no acknowledgement {id} pending on {}", self.nsp());
        }
    }

    /// Handles a packet of this namespace. `DISCONNECT` and `CONNECT_ERROR`
    /// concern the manager too and are handled there.
    pub(crate) fn onpacket(&mut self, wire: &Wire, packet: Packet) {
        match packet.packet_type {
            PacketId::Connect => {
                let sid = packet
                    .data
                    .as_ref()
                    .and_then(|data| data.get("sid"))
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                match sid {
                    Some(sid) => {
                        let pid = packet
                            .data
                            .as_ref()
                            .and_then(|data| data.get("pid"))
                            .and_then(Value::as_str)
                            .map(str::to_owned);
                        self.onconnect(wire, sid, pid);
                    }
                    None => self.emit_reserved(Event::ConnectError, Payload::from(V2_SERVER)),
                }
            }
            PacketId::Event | PacketId::BinaryEvent => self.onevent(packet),
            PacketId::Ack | PacketId::BinaryAck => self.onack(wire, packet),
            PacketId::Disconnect | PacketId::ConnectError => {}
        }
    }

    fn onconnect(&mut self, wire: &Wire, id: String, pid: Option<String>) {
        debug!("namespace {} connected with id {id}", self.nsp());
        self.set_id(Some(id));
        let recovered = pid.is_some() && self.pid == pid;
        self.shared.recovered.store(recovered, Ordering::Release);
        self.pid = pid;
        self.set_connected(true);

        for packet in std::mem::take(&mut self.receive_buffer) {
            self.emit_event(packet);
        }
        for packet in std::mem::take(&mut self.send_buffer) {
            wire.packet(&packet);
        }
        self.emit_reserved(Event::Connect, Payload::default());
        self.drain_queue(wire, true);
    }

    fn onevent(&mut self, packet: Packet) {
        if self.connected {
            self.emit_event(packet);
        } else {
            self.receive_buffer.push(packet);
        }
    }

    fn emit_event(&mut self, packet: Packet) {
        let ack = packet.id;
        let mut args = packet.into_args().into_iter();
        let event = match args.next() {
            Some(Value::String(name)) => Event::from(name),
            Some(Value::Number(n)) => Event::Custom(n.to_string()),
            _ => return,
        };
        let payload = Payload::new(args.collect());

        if self.pid.is_some() {
            if let Some(Value::String(offset)) = payload.last() {
                self.last_offset = Some(offset.clone());
            }
        }

        let handlers = {
            let mut emitter = lock(&self.shared.emitter);
            // only listeners added with `on_with_ack` can answer
            if let Some(id) = ack.filter(|_| emitter.acks(&event)) {
                self.server_acks.insert(id);
            }
            emitter.take(&event, true)
        };
        self.dispatch(handlers, event, payload, ack);
    }

    fn onack(&mut self, wire: &Wire, packet: Packet) {
        let Some(id) = packet.id else {
            return;
        };
        match self.acks.remove(&id) {
            Some(pending) => {
                trace!("calling ack {id} on {}", self.nsp());
                self.resolve(wire, pending.handler, Ok(Payload::new(packet.into_args())));
            }
            None => warn!("bad ack {id} on {}", self.nsp()),
        }
    }

    /// Reports a connection failure of the manager.
    pub(crate) fn onerror(&self, error: &str) {
        if !self.connected {
            self.emit_reserved(Event::ConnectError, Payload::from(error));
        }
    }

    /// The server refused the namespace.
    pub(crate) fn on_connect_error(&self, data: Option<Value>) {
        let error = data.unwrap_or_else(|| Value::from("connect error"));
        self.emit_reserved(Event::ConnectError, Payload::from(error));
    }

    pub(crate) fn onclose(&mut self, wire: &Wire, reason: &str) {
        debug!("namespace {} closed ({reason})", self.nsp());
        self.set_connected(false);
        self.set_id(None);
        self.server_acks.clear();
        self.emit_reserved(Event::Disconnect, Payload::from(reason));
        self.clear_acks(wire);
    }

    /// Fails the acknowledgements of packets that left already. Buffered
    /// packets keep theirs, they are sent on the next connect.
    fn clear_acks(&mut self, wire: &Wire) {
        let buffered: HashSet<u64> = self.send_buffer.iter().filter_map(|p| p.id).collect();
        let mut ids: Vec<u64> = self
            .acks
            .keys()
            .copied()
            .filter(|id| !buffered.contains(id))
            .collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(pending) = self.acks.remove(&id) {
                self.resolve(wire, pending.handler, Err(Error::Disconnected()));
            }
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.acks.values().filter_map(|pending| pending.deadline).min()
    }

    /// Fails every acknowledgement whose deadline passed. A packet still in
    /// the send buffer is dropped with it.
    pub(crate) fn expire_acks(&mut self, wire: &Wire, now: Instant) {
        let mut expired: Vec<u64> = self
            .acks
            .iter()
            .filter(|(_, pending)| pending.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        for id in expired {
            if let Some(pending) = self.acks.remove(&id) {
                debug!("ack {id} on {} timed out", self.nsp());
                self.send_buffer.retain(|packet| packet.id != Some(id));
                self.resolve(wire, pending.handler, Err(Error::AckTimeout()));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::manager::test::{accept_namespace, builder, connected, recv, record, text, Peer};
    use bytes::Bytes;
    use engineio_client::testing::MockTransportFactory;
    use engineio_client::PacketId as EnginePacketId;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn ack_channel() -> (
        impl FnOnce(Result<Payload>, Socket) -> BoxFuture<'static, ()> + Send + 'static,
        mpsc::UnboundedReceiver<Result<Payload>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback = move |result: Result<Payload>, _: Socket| {
            let _ = tx.send(result);
            async {}.boxed()
        };
        (callback, rx)
    }

    #[tokio::test]
    async fn emits_are_buffered_until_connected() {
        let (factory, mut server) = MockTransportFactory::paired();
        let manager = builder(&factory).build().unwrap();
        let socket = manager.socket("/").unwrap();
        socket.emit("hello", "world").unwrap();
        socket.send(json!({"a": 1})).unwrap();

        let mut peer = Peer::accept(&mut server).await;
        accept_namespace(&mut peer, "/", "a").await;
        assert_eq!(peer.next_frame().await, r#"2["hello","world"]"#);
        assert_eq!(peer.next_frame().await, r#"2["message",{"a":1}]"#);
    }

    #[tokio::test]
    async fn events_before_connect_are_replayed() {
        let (factory, mut server) = MockTransportFactory::paired();
        let manager = builder(&factory).build().unwrap();
        let socket = manager.socket("/").unwrap();
        let mut early = record(&socket, "early");
        let mut peer = Peer::accept(&mut server).await;

        assert_eq!(peer.next_frame().await, "0");
        peer.send(r#"2["early",1]"#);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(early.try_recv().is_err());

        peer.send(r#"0{"sid":"a"}"#);
        let payload = recv(&mut early).await;
        assert_eq!(payload.first().and_then(Value::as_i64), Some(1));
    }

    #[tokio::test]
    async fn reserved_events_cannot_be_emitted() {
        let (factory, _server) = MockTransportFactory::paired();
        let manager = builder(&factory).auto_connect(false).build().unwrap();
        let socket = manager.socket("/").unwrap();
        for name in ["connect", "disconnect", "connect_error", "newListener"] {
            assert!(matches!(
                socket.emit(name, ()),
                Err(Error::ReservedEvent(event)) if event == name
            ));
        }
    }

    #[tokio::test]
    async fn listeners() {
        let (factory, mut server) = MockTransportFactory::paired();
        let (socket, peer) = connected(builder(&factory), &mut server, "/").await;

        let count = Arc::new(AtomicUsize::new(0));
        let once_count = count.clone();
        socket.once("news", move |_, _| {
            once_count.fetch_add(1, Ordering::SeqCst);
            async {}.boxed()
        });
        let removed = socket.on("news", |_, _| panic!("removed listener called"));
        assert!(socket.off(removed));

        let (tx, mut any) = mpsc::unbounded_channel();
        socket.on_any(move |event, payload, _| {
            let _ = tx.send((event, payload));
            async {}.boxed()
        });
        let mut news = record(&socket, "news");

        peer.send(r#"2["news","a"]"#);
        peer.send(r#"2["news","b"]"#);
        peer.send(r#"2[42,"c"]"#);
        assert_eq!(text(&recv(&mut news).await), Some("a"));
        assert_eq!(text(&recv(&mut news).await), Some("b"));

        let (event, _) = recv(&mut any).await;
        assert_eq!(event, Event::from("news"));
        recv(&mut any).await;
        let (event, payload) = recv(&mut any).await;
        assert_eq!(event, Event::Custom("42".to_owned()));
        assert_eq!(text(&payload), Some("c"));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        socket.off_event("news");
        socket.off_any();
        peer.send(r#"2["news","d"]"#);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(news.try_recv().is_err());
        assert!(any.try_recv().is_err());
    }

    #[tokio::test]
    async fn acks_resolve_in_any_order() {
        let (factory, mut server) = MockTransportFactory::paired();
        let (socket, mut peer) = connected(builder(&factory), &mut server, "/").await;
        let (first, mut first_rx) = ack_channel();
        let (second, mut second_rx) = ack_channel();

        socket.emit_with_ack("a", (), first).unwrap();
        socket.emit_with_ack("b", json!(1), second).unwrap();
        assert_eq!(peer.next_frame().await, r#"20["a"]"#);
        assert_eq!(peer.next_frame().await, r#"21["b",1]"#);

        peer.send(r#"31["second"]"#);
        peer.send(r#"30["first"]"#);
        assert_eq!(text(&recv(&mut second_rx).await.unwrap()), Some("second"));
        assert_eq!(text(&recv(&mut first_rx).await.unwrap()), Some("first"));

        // unknown and repeated acks are ignored
        peer.send(r#"30["again"]"#);
        peer.send(r#"37[]"#);
        let reply = socket.emit_with_ack_async("c", ());
        let server = async {
            assert_eq!(peer.next_frame().await, r#"22["c"]"#);
            peer.send(r#"32["third"]"#);
        };
        let (reply, ()) = tokio::join!(reply, server);
        assert_eq!(text(&reply.unwrap()), Some("third"));
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ack_timeout_fires_once() {
        let (factory, mut server) = MockTransportFactory::paired();
        let (socket, mut peer) = connected(builder(&factory), &mut server, "/").await;
        let (callback, mut rx) = ack_channel();

        socket
            .timeout(Duration::from_millis(50))
            .emit_with_ack("slow", (), callback)
            .unwrap();
        assert_eq!(peer.next_frame().await, r#"20["slow"]"#);
        assert!(matches!(recv(&mut rx).await, Err(Error::AckTimeout())));

        peer.send(r#"30["late"]"#);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn timed_out_buffered_packets_are_never_sent() {
        let (factory, mut server) = MockTransportFactory::paired();
        let manager = builder(&factory).build().unwrap();
        let options = SocketOptions::default().ack_timeout(Duration::from_millis(20));
        let socket = manager.socket_with_options("/", options).unwrap();
        let result = socket.emit_with_ack_async("early", ()).await;
        assert!(matches!(result, Err(Error::AckTimeout())));

        let mut peer = Peer::accept(&mut server).await;
        accept_namespace(&mut peer, "/", "a").await;
        socket.emit("after", ()).unwrap();
        assert_eq!(peer.next_frame().await, r#"2["after"]"#);
    }

    #[tokio::test]
    async fn answers_server_acks_once() {
        let (factory, mut server) = MockTransportFactory::paired();
        let (socket, mut peer) = connected(builder(&factory), &mut server, "/chat").await;
        socket.on_with_ack("question", |payload, socket, id| {
            async move {
                let answer = format!("{} answered", text(&payload).unwrap_or_default());
                socket.ack(id, answer.as_str()).unwrap();
                socket.ack(id, "twice").unwrap();
            }
            .boxed()
        });

        peer.send(r#"2/chat,5["question","q"]"#);
        assert_eq!(peer.next_frame().await, r#"3/chat,5["q answered"]"#);
        socket.emit("done", ()).unwrap();
        assert_eq!(peer.next_frame().await, r#"2/chat,["done"]"#);
    }

    #[tokio::test]
    async fn volatile_emits_are_dropped_while_disconnected() {
        let (factory, mut server) = MockTransportFactory::paired();
        let manager = builder(&factory).build().unwrap();
        let socket = manager.socket("/").unwrap();
        socket.volatile().emit("dropped", ()).unwrap();
        socket.emit("kept", ()).unwrap();

        let mut peer = Peer::accept(&mut server).await;
        accept_namespace(&mut peer, "/", "a").await;
        assert_eq!(peer.next_frame().await, r#"2["kept"]"#);

        socket.volatile().emit("live", ()).unwrap();
        assert_eq!(peer.next_frame().await, r#"2["live"]"#);
    }

    #[tokio::test]
    async fn acks_fail_on_disconnect() {
        let (factory, mut server) = MockTransportFactory::paired();
        let (socket, mut peer) = connected(
            builder(&factory).reconnection(false),
            &mut server,
            "/",
        )
        .await;
        let (callback, mut rx) = ack_channel();
        socket.emit_with_ack("pending", (), callback).unwrap();
        assert_eq!(peer.next_frame().await, r#"20["pending"]"#);

        peer.close();
        assert!(matches!(recv(&mut rx).await, Err(Error::Disconnected())));
    }

    #[tokio::test]
    async fn binary_arguments() {
        let (factory, mut server) = MockTransportFactory::paired();
        let (socket, mut peer) = connected(builder(&factory), &mut server, "/").await;
        let mut files = record(&socket, "file");

        let args = vec![
            Value::from("name"),
            Value::from(Bytes::from_static(b"\x01\x02")),
        ];
        socket.emit("upload", args).unwrap();
        assert_eq!(
            peer.next_frame().await,
            r#"51-["upload","name",{"_placeholder":true,"num":0}]"#
        );
        let attachment = peer.next_message().await;
        assert_eq!(attachment.packet_id, EnginePacketId::MessageBinary);
        assert_eq!(&attachment.data[..], b"\x01\x02");

        peer.send(r#"51-["file",{"_placeholder":true,"num":0}]"#);
        peer.send_binary(b"\x03\x04\x05");
        let payload = recv(&mut files).await;
        assert_eq!(
            payload.first().and_then(Value::as_bytes).map(|b| &b[..]),
            Some(&b"\x03\x04\x05"[..])
        );
    }

    #[tokio::test]
    async fn retry_queue_sends_one_at_a_time() {
        let (factory, mut server) = MockTransportFactory::paired();
        let manager = builder(&factory).build().unwrap();
        let socket = manager
            .socket_with_options("/", SocketOptions::default().retries(2))
            .unwrap();
        let mut peer = Peer::accept(&mut server).await;
        accept_namespace(&mut peer, "/", "a").await;

        let (first, mut first_rx) = ack_channel();
        socket.emit_with_ack("a", (), first).unwrap();
        socket.emit("b", ()).unwrap();
        assert_eq!(peer.next_frame().await, r#"20["a"]"#);
        tokio::time::sleep(Duration::from_millis(50)).await;
        peer.assert_quiet();

        peer.send(r#"30["ok"]"#);
        assert_eq!(text(&recv(&mut first_rx).await.unwrap()), Some("ok"));
        assert_eq!(peer.next_frame().await, r#"21["b"]"#);
        peer.send(r#"31[]"#);
    }

    #[tokio::test]
    async fn retry_queue_gives_up_after_retries() {
        let (factory, mut server) = MockTransportFactory::paired();
        let manager = builder(&factory).build().unwrap();
        let options = SocketOptions::default()
            .retries(2)
            .ack_timeout(Duration::from_millis(30));
        let socket = manager.socket_with_options("/", options).unwrap();
        let mut peer = Peer::accept(&mut server).await;
        accept_namespace(&mut peer, "/", "a").await;

        let (callback, mut rx) = ack_channel();
        socket.emit_with_ack("job", json!(7), callback).unwrap();
        assert_eq!(peer.next_frame().await, r#"20["job",7]"#);
        assert_eq!(peer.next_frame().await, r#"21["job",7]"#);
        assert_eq!(peer.next_frame().await, r#"22["job",7]"#);
        assert!(matches!(recv(&mut rx).await, Err(Error::AckTimeout())));

        socket.emit("next", ()).unwrap();
        assert_eq!(peer.next_frame().await, r#"23["next"]"#);
    }

    #[tokio::test]
    async fn retry_queue_holds_later_emits_while_retrying() {
        let (factory, mut server) = MockTransportFactory::paired();
        let manager = builder(&factory).build().unwrap();
        let options = SocketOptions::default()
            .retries(2)
            .ack_timeout(Duration::from_millis(100));
        let socket = manager.socket_with_options("/", options).unwrap();
        let mut peer = Peer::accept(&mut server).await;
        accept_namespace(&mut peer, "/", "a").await;

        let (callback, mut rx) = ack_channel();
        socket.emit_with_ack("job", json!(7), callback).unwrap();
        assert_eq!(peer.next_frame().await, r#"20["job",7]"#);
        socket.emit("next", ()).unwrap();

        assert_eq!(peer.next_frame().await, r#"21["job",7]"#);
        assert_eq!(peer.next_frame().await, r#"22["job",7]"#);
        peer.assert_quiet();

        peer.send(r#"32["done"]"#);
        assert_eq!(text(&recv(&mut rx).await.unwrap()), Some("done"));
        assert_eq!(peer.next_frame().await, r#"23["next"]"#);
    }

    #[tokio::test]
    async fn unanswerable_server_acks_are_forgotten() {
        let (factory, mut server) = MockTransportFactory::paired();
        let (root, mut peer) = connected(builder(&factory), &mut server, "/").await;
        let chat = root.io().socket("/chat").unwrap();
        let mut connect = record(&chat, "connect");
        accept_namespace(&mut peer, "/chat", "b").await;
        recv(&mut connect).await;

        // a plain listener has no way to answer
        let mut plain = record(&chat, "plain");
        peer.send(r#"2/chat,7["plain"]"#);
        recv(&mut plain).await;
        chat.ack(7, "late").unwrap();

        let (tx, mut ids) = mpsc::unbounded_channel();
        chat.on_with_ack("question", move |_, _, id| {
            let _ = tx.send(id);
            async {}.boxed()
        });
        peer.send(r#"2/chat,8["question"]"#);
        let id = recv(&mut ids).await;

        chat.disconnect().unwrap();
        assert_eq!(peer.next_frame().await, "1/chat,");
        chat.connect().unwrap();
        accept_namespace(&mut peer, "/chat", "c").await;
        recv(&mut connect).await;

        // the request belonged to the previous session
        chat.ack(id, "stale").unwrap();
        chat.emit("done", ()).unwrap();
        assert_eq!(peer.next_frame().await, r#"2/chat,["done"]"#);
    }

    #[tokio::test]
    async fn recovers_the_session_after_reconnecting() {
        let (factory, mut server) = MockTransportFactory::paired();
        let manager = builder(&factory).build().unwrap();
        let socket = manager
            .socket_with_options("/", SocketOptions::default().auth(json!({"token": "t"})))
            .unwrap();
        let mut connect = record(&socket, "connect");
        let mut news = record(&socket, "news");

        let mut peer = Peer::accept(&mut server).await;
        assert_eq!(peer.next_frame().await, r#"0{"token":"t"}"#);
        peer.send(r#"0{"sid":"a","pid":"p1"}"#);
        recv(&mut connect).await;
        assert!(!socket.recovered());
        peer.send(r#"2["news","hi","offset-1"]"#);
        recv(&mut news).await;

        peer.close();
        let mut peer = Peer::accept(&mut server).await;
        assert_eq!(
            peer.next_frame().await,
            r#"0{"offset":"offset-1","pid":"p1","token":"t"}"#
        );
        peer.send(r#"0{"sid":"b","pid":"p1"}"#);
        recv(&mut connect).await;
        assert!(socket.recovered());
        assert_eq!(socket.id().as_deref(), Some("b"));
    }
}
