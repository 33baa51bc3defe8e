use adler32::adler32;
use http::HeaderMap;
use native_tls::TlsConnector;
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::time::SystemTime;
use tokio::sync::mpsc::UnboundedSender;
use url::Url;

use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::transports::{PollingTransport, WebsocketTransport};
use crate::ENGINE_IO_VERSION;

pub const POLLING: &str = "polling";
pub const WEBSOCKET: &str = "websocket";

/// The life cycle of a transport.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReadyState {
    Opening,
    Open,
    Pausing,
    Paused,
    Closing,
    Closed,
}

impl Display for ReadyState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            ReadyState::Opening => "opening",
            ReadyState::Open => "open",
            ReadyState::Pausing => "pausing",
            ReadyState::Paused => "paused",
            ReadyState::Closing => "closing",
            ReadyState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Identifies the transport an event stems from. A socket ignores every event
/// of a transport it no longer listens to.
pub type TransportId = u64;

/// Everything a transport reports to its owning socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Packet(Packet),
    /// All packets of the last `send` were written.
    Drain,
    /// Reply to [`Transport::pause`], no further reads or writes are in flight.
    Paused,
    Error(String),
    Close(String),
}

/// The channel end a transport pushes its events into.
#[derive(Debug, Clone)]
pub struct TransportSink {
    id: TransportId,
    tx: UnboundedSender<(TransportId, TransportEvent)>,
}

impl TransportSink {
    pub(crate) fn new(id: TransportId, tx: UnboundedSender<(TransportId, TransportEvent)>) -> Self {
        TransportSink { id, tx }
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Reports an event. Events emitted after the socket went away are dropped.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send((self.id, event));
    }
}

/// A duplex channel to an `engine.io` server. Implementations never block:
/// every operation starts the work and reports its outcome through the
/// [`TransportSink`] the transport was created with.
pub trait Transport: Send + Debug {
    /// The name used in the `transport` query parameter.
    fn name(&self) -> &'static str;

    fn ready_state(&self) -> ReadyState;

    /// Whether the transport accepts a new batch of packets.
    fn writable(&self) -> bool;

    /// Starts opening the transport, reports `Open` once it is usable.
    fn open(&mut self);

    /// Writes a batch of packets. Does nothing unless the transport is open,
    /// reports `Drain` once the batch was written.
    fn send(&mut self, packets: Vec<Packet>);

    /// Closes the transport if it is opening or open and reports `Close`.
    fn close(&mut self);

    /// Stops reading and writing, reports `Paused` once nothing is in flight.
    fn pause(&mut self);

    /// Attaches the session id to every further request.
    fn set_sid(&mut self, sid: &str);
}

/// Builds transports by name.
pub trait TransportFactory: Send + Sync + Debug {
    fn create(
        &self,
        name: &str,
        options: TransportOptions,
        sink: TransportSink,
    ) -> Result<Box<dyn Transport>>;
}

/// Builds the polling and websocket transports of this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        name: &str,
        options: TransportOptions,
        sink: TransportSink,
    ) -> Result<Box<dyn Transport>> {
        match name {
            POLLING => Ok(Box::new(PollingTransport::new(options, sink)?)),
            WEBSOCKET => Ok(Box::new(WebsocketTransport::new(options, sink)?)),
            _ => Err(Error::UnknownTransport(name.to_owned())),
        }
    }
}

/// Everything a transport needs to know to reach the server.
#[derive(Clone)]
pub struct TransportOptions {
    /// Base url including the path, e.g. `http://localhost:4200/engine.io/`.
    pub url: Url,
    /// User supplied query parameters.
    pub query: Vec<(String, String)>,
    /// Session id, known once the handshake happened on another transport.
    pub sid: Option<String>,
    /// `None` keeps the transport default (polling only).
    pub timestamp_requests: Option<bool>,
    pub force_base64: bool,
    pub extra_headers: Option<HeaderMap>,
    pub tls_config: Option<TlsConnector>,
}

impl TransportOptions {
    pub fn new(url: Url) -> Self {
        TransportOptions {
            url,
            query: Vec::new(),
            sid: None,
            timestamp_requests: None,
            force_base64: false,
            extra_headers: None,
            tls_config: None,
        }
    }

    /// Builds the full request url for the given transport. Always carries the
    /// protocol version and the transport name, the session id once known, a
    /// cache busting timestamp if requested and `b64=1` when binary data can't
    /// be transmitted yet.
    pub fn uri(
        &self,
        transport: &str,
        sid: Option<&str>,
        timestamp: bool,
        supports_binary: bool,
    ) -> Result<Url> {
        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in &self.query {
                query.append_pair(key, value);
            }
            query.append_pair("EIO", &ENGINE_IO_VERSION.to_string());
            query.append_pair("transport", transport);
            if let Some(sid) = sid {
                query.append_pair("sid", sid);
            }
            if timestamp {
                query.append_pair("t", &timestamp_param()?);
            }
            if !supports_binary && sid.is_none() {
                query.append_pair("b64", "1");
            }
        }
        Ok(url)
    }
}

impl Debug for TransportOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("TransportOptions")
            .field("url", &self.url)
            .field("query", &self.query)
            .field("sid", &self.sid)
            .field("timestamp_requests", &self.timestamp_requests)
            .field("force_base64", &self.force_base64)
            .field("extra_headers", &self.extra_headers)
            .field("tls_config", &self.tls_config.is_some())
            .finish()
    }
}

/// Cache busting value for the `t` query parameter.
fn timestamp_param() -> Result<String> {
    let reader = format!("{:#?}", SystemTime::now());
    let hash = adler32(reader.as_bytes())?;
    Ok(hash.to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn options() -> TransportOptions {
        TransportOptions::new(Url::parse("http://localhost:4200/engine.io/").unwrap())
    }

    #[test]
    fn uri_contains_protocol_and_transport() -> Result<()> {
        let uri = options().uri(POLLING, None, false, true)?;
        assert_eq!(
            uri.as_str(),
            "http://localhost:4200/engine.io/?EIO=4&transport=polling"
        );
        Ok(())
    }

    #[test]
    fn uri_with_sid_timestamp_and_base64() -> Result<()> {
        let mut options = options();
        options.query.push(("token".to_owned(), "abc".to_owned()));

        let uri = options.uri(POLLING, None, true, false)?;
        let pairs: Vec<(String, String)> = uri.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("token".to_owned(), "abc".to_owned()));
        assert!(pairs.iter().any(|(k, _)| k == "t"));
        assert!(pairs.contains(&("b64".to_owned(), "1".to_owned())));

        let uri = options.uri(WEBSOCKET, Some("sid42"), false, false)?;
        let pairs: Vec<(String, String)> = uri.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("sid".to_owned(), "sid42".to_owned())));
        assert!(!pairs.iter().any(|(k, _)| k == "b64" || k == "t"));
        Ok(())
    }

    #[test]
    fn unknown_transport_is_rejected() {
        let (tx, _rx) = unbounded_channel();
        let result = DefaultTransportFactory.create("webtransport", options(), TransportSink::new(0, tx));
        assert!(matches!(result, Err(Error::UnknownTransport(_))));
    }

    #[test]
    fn sink_tags_events() {
        let (tx, mut rx) = unbounded_channel();
        let sink = TransportSink::new(7, tx);
        sink.emit(TransportEvent::Drain);
        assert_eq!(rx.try_recv().unwrap(), (7, TransportEvent::Drain));
    }
}
