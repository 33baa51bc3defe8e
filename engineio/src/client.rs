use async_stream::stream;
use bytes::Bytes;
use futures_util::Stream;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use native_tls::TlsConnector;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use url::Url;

use crate::error::{Error, Result};
use crate::packet::{Packet, PacketId};
use crate::socket::{Command, Driver, Event, SharedSnapshot};
use crate::transport::{
    DefaultTransportFactory, ReadyState, TransportFactory, POLLING, WEBSOCKET,
};

/// A boxed [`Send`] stream, the shape every event stream of this crate has.
pub(crate) type Generator<T> = Pin<Box<dyn Stream<Item = T> + 'static + Send>>;

/// Remembers across connections whether websocket worked before. Sockets
/// built with the same preferences and `remember_upgrade` skip the polling
/// phase once a websocket connection succeeded.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPreferences {
    prior_websocket_success: Arc<AtomicBool>,
}

impl ConnectionPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prior_websocket_success(&self) -> bool {
        self.prior_websocket_success.load(Ordering::Acquire)
    }

    pub(crate) fn set_prior_websocket_success(&self, success: bool) {
        self.prior_websocket_success.store(success, Ordering::Release);
    }
}

/// How a socket connects.
#[derive(Clone)]
pub struct SocketOptions {
    /// Path of the endpoint, a trailing slash is added.
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Transports in the order they are tried.
    pub transports: Vec<String>,
    /// Whether to probe for a better transport after the handshake.
    pub upgrade: bool,
    /// Start with websocket right away if it worked before.
    pub remember_upgrade: bool,
    /// Add a cache busting timestamp to every request. `None` does so for
    /// polling only.
    pub timestamp_requests: Option<bool>,
    pub force_base64: bool,
    pub extra_headers: Option<HeaderMap>,
    pub tls_config: Option<TlsConnector>,
    pub preferences: ConnectionPreferences,
    pub transport_factory: Arc<dyn TransportFactory>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            path: "/engine.io".to_owned(),
            query: Vec::new(),
            transports: vec![POLLING.to_owned(), WEBSOCKET.to_owned()],
            upgrade: true,
            remember_upgrade: false,
            timestamp_requests: None,
            force_base64: false,
            extra_headers: None,
            tls_config: None,
            preferences: ConnectionPreferences::default(),
            transport_factory: Arc::new(DefaultTransportFactory),
        }
    }
}

impl Debug for SocketOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("SocketOptions")
            .field("path", &self.path)
            .field("query", &self.query)
            .field("transports", &self.transports)
            .field("upgrade", &self.upgrade)
            .field("remember_upgrade", &self.remember_upgrade)
            .field("timestamp_requests", &self.timestamp_requests)
            .field("force_base64", &self.force_base64)
            .field("extra_headers", &self.extra_headers)
            .field("tls_config", &self.tls_config.is_some())
            .field("preferences", &self.preferences)
            .field("transport_factory", &self.transport_factory)
            .finish()
    }
}

/// Splits a user supplied url into the http endpoint the transports talk to
/// and the query parameters it carried.
fn endpoint(url: &Url, path: &str) -> Result<(Url, Vec<(String, String)>)> {
    let scheme = match url.scheme() {
        "http" | "ws" => "http",
        "https" | "wss" => "https",
        other => return Err(Error::InvalidUrlScheme(other.to_owned())),
    };
    let mut endpoint = url.clone();
    endpoint
        .set_scheme(scheme)
        .map_err(|()| Error::InvalidUrlScheme(scheme.to_owned()))?;

    let query = url.query_pairs().into_owned().collect();
    endpoint.set_query(None);
    endpoint.set_fragment(None);
    endpoint.set_path(&format!("{}/", path.trim_end_matches('/')));
    Ok((endpoint, query))
}

/// A handle to an `engine.io` socket. Cheap to clone, the socket itself runs
/// as a task on the tokio runtime and closes once every handle is dropped.
#[derive(Clone, Debug)]
pub struct Client {
    commands: UnboundedSender<Command>,
    snapshot: SharedSnapshot,
}

impl Client {
    /// Starts connecting to `url`. Everything that happens on the socket is
    /// reported through the returned [`ClientEvents`].
    pub fn connect(url: Url, mut options: SocketOptions) -> Result<(Client, ClientEvents)> {
        let handle = Handle::try_current().map_err(|_| Error::MissingRuntime())?;

        let (endpoint, mut query) = endpoint(&url, &options.path)?;
        query.append(&mut options.query);
        options.query = query;

        let (event_tx, event_rx) = unbounded_channel();
        let (command_tx, command_rx) = unbounded_channel();
        let snapshot = SharedSnapshot::default();
        let (driver, transport_rx) = Driver::new(endpoint, options, event_tx, snapshot.clone());
        handle.spawn(driver.run(command_rx, transport_rx));

        Ok((
            Client {
                commands: command_tx,
                snapshot,
            },
            ClientEvents::new(event_rx),
        ))
    }

    /// Queues a packet. Packets are buffered until the handshake is done and
    /// written in batches whenever the transport is ready.
    pub fn send(&self, packet: Packet) -> Result<()> {
        if matches!(self.ready_state(), ReadyState::Closing | ReadyState::Closed) {
            return Err(Error::IllegalActionAfterClose());
        }
        self.commands
            .send(Command::Send(packet))
            .map_err(|_| Error::IllegalActionAfterClose())
    }

    pub fn send_message<T: Into<Bytes>>(&self, data: T) -> Result<()> {
        self.send(Packet::new(PacketId::Message, data))
    }

    pub fn send_binary<T: Into<Bytes>>(&self, data: T) -> Result<()> {
        self.send(Packet::new(PacketId::MessageBinary, data))
    }

    /// Closes the socket once the buffered packets are written.
    pub fn close(&self) -> Result<()> {
        self.commands
            .send(Command::Close)
            .map_err(|_| Error::IllegalActionAfterClose())
    }

    /// The session id, known between handshake and close.
    pub fn id(&self) -> Option<String> {
        self.read(|snapshot| snapshot.sid.clone())
    }

    pub fn is_writable(&self) -> bool {
        self.read(|snapshot| snapshot.writable)
    }

    /// Name of the active transport.
    pub fn transport_name(&self) -> Option<&'static str> {
        self.read(|snapshot| snapshot.transport)
    }

    pub fn ready_state(&self) -> ReadyState {
        self.read(|snapshot| snapshot.ready_state)
    }

    fn read<T>(&self, f: impl FnOnce(&crate::socket::Snapshot) -> T) -> T {
        f(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }
}

/// The events of a socket. Ends after [`Event::Close`].
pub struct ClientEvents {
    generator: Generator<Event>,
}

impl ClientEvents {
    fn new(mut receiver: UnboundedReceiver<Event>) -> Self {
        ClientEvents {
            generator: Box::pin(stream! {
                while let Some(event) = receiver.recv().await {
                    yield event;
                }
            }),
        }
    }
}

impl Stream for ClientEvents {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.generator.as_mut().poll_next(cx)
    }
}

impl Debug for ClientEvents {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ClientEvents").finish_non_exhaustive()
    }
}

/// Configures and connects a [`Client`].
#[derive(Clone, Debug)]
pub struct ClientBuilder {
    url: Url,
    options: SocketOptions,
}

impl ClientBuilder {
    /// The path of `url` is used as endpoint path unless it is empty, in which
    /// case `/engine.io/` is used.
    pub fn new(url: Url) -> Self {
        let mut options = SocketOptions::default();
        if url.path() != "/" && !url.path().is_empty() {
            options.path = url.path().to_owned();
        }
        ClientBuilder { url, options }
    }

    pub fn with_options(url: Url, options: SocketOptions) -> Self {
        ClientBuilder { url, options }
    }

    pub fn path<T: Into<String>>(mut self, path: T) -> Self {
        self.options.path = path.into();
        self
    }

    pub fn query<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.options.query.push((key.into(), value.into()));
        self
    }

    pub fn transports<I, T>(mut self, transports: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.options.transports = transports.into_iter().map(Into::into).collect();
        self
    }

    pub fn upgrade(mut self, upgrade: bool) -> Self {
        self.options.upgrade = upgrade;
        self
    }

    pub fn remember_upgrade(mut self, remember_upgrade: bool) -> Self {
        self.options.remember_upgrade = remember_upgrade;
        self
    }

    pub fn timestamp_requests(mut self, timestamp_requests: bool) -> Self {
        self.options.timestamp_requests = Some(timestamp_requests);
        self
    }

    pub fn force_base64(mut self, force_base64: bool) -> Self {
        self.options.force_base64 = force_base64;
        self
    }

    /// Specify transport's tls config
    pub fn tls_config(mut self, tls_config: TlsConnector) -> Self {
        self.options.tls_config = Some(tls_config);
        self
    }

    /// Specify transport's HTTP headers
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.options.extra_headers = Some(headers);
        self
    }

    /// Adds a single HTTP header, fails on an illegal name or value.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_str(name)?;
        let value = HeaderValue::from_str(value)?;
        self.options
            .extra_headers
            .get_or_insert_with(HeaderMap::new)
            .insert(name, value);
        Ok(self)
    }

    pub fn preferences(mut self, preferences: ConnectionPreferences) -> Self {
        self.options.preferences = preferences;
        self
    }

    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.options.transport_factory = factory;
        self
    }

    /// Connects, see [`Client::connect`]. Must be called within a tokio runtime.
    pub fn build(self) -> Result<(Client, ClientEvents)> {
        Client::connect(self.url, self.options)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn endpoint_keeps_host_and_query() -> Result<()> {
        let url = Url::parse("ws://localhost:4200/ignored?token=abc#frag")?;
        let (base, query) = endpoint(&url, "/engine.io")?;
        assert_eq!(base.as_str(), "http://localhost:4200/engine.io/");
        assert_eq!(query, vec![("token".to_owned(), "abc".to_owned())]);

        let url = Url::parse("wss://example.com")?;
        let (base, _) = endpoint(&url, "/socket.io/")?;
        assert_eq!(base.as_str(), "https://example.com/socket.io/");
        Ok(())
    }

    #[test]
    fn endpoint_rejects_foreign_schemes() -> Result<()> {
        let url = Url::parse("ftp://localhost")?;
        assert!(matches!(
            endpoint(&url, "/engine.io"),
            Err(Error::InvalidUrlScheme(_))
        ));
        Ok(())
    }

    #[test]
    fn builder_defaults() -> Result<()> {
        let builder = ClientBuilder::new(Url::parse("http://localhost:4200")?);
        assert_eq!(builder.options.path, "/engine.io");
        assert_eq!(builder.options.transports, vec!["polling", "websocket"]);
        assert!(builder.options.upgrade);
        assert!(!builder.options.remember_upgrade);

        let builder = ClientBuilder::new(Url::parse("http://localhost:4200/custom/")?)
            .transports(["websocket"])
            .header("x-token", "abc")?;
        assert_eq!(builder.options.path, "/custom/");
        assert_eq!(builder.options.transports, vec!["websocket"]);
        assert_eq!(
            builder.options.extra_headers.unwrap().get("x-token").unwrap(),
            "abc"
        );
        Ok(())
    }

    #[test]
    fn illegal_header_is_rejected() -> Result<()> {
        let builder = ClientBuilder::new(Url::parse("http://localhost:4200")?);
        assert!(builder.header("bad header", "value").is_err());
        Ok(())
    }

    #[test]
    fn connect_requires_runtime() -> Result<()> {
        let result = Client::connect(Url::parse("http://localhost:4200")?, SocketOptions::default());
        assert!(matches!(result, Err(Error::MissingRuntime())));
        Ok(())
    }

    #[test]
    fn preferences_are_shared() {
        let preferences = ConnectionPreferences::new();
        let copy = preferences.clone();
        copy.set_prior_websocket_success(true);
        assert!(preferences.prior_websocket_success());
    }
}
