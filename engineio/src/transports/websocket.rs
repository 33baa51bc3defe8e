use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::trace;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tungstenite::client::IntoClientRequest;
use tungstenite::Message;
use url::Url;

use crate::error::{Error, Result};
use crate::packet::{Encoded, Packet, PacketId};
use crate::transport::{
    ReadyState, Transport, TransportEvent, TransportOptions, TransportSink, WEBSOCKET,
};

type WsSender = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug)]
struct WebsocketState {
    ready_state: ReadyState,
    writable: bool,
}

/// A websocket connection, every packet travels in its own frame.
pub struct WebsocketTransport {
    options: TransportOptions,
    sink: TransportSink,
    state: Arc<Mutex<WebsocketState>>,
    sender: Arc<tokio::sync::Mutex<Option<WsSender>>>,
    task: Option<JoinHandle<()>>,
}

impl WebsocketTransport {
    /// Fails right away if the url can't be mapped onto a websocket scheme.
    pub fn new(options: TransportOptions, sink: TransportSink) -> Result<Self> {
        let transport = WebsocketTransport {
            options,
            sink,
            state: Arc::new(Mutex::new(WebsocketState {
                ready_state: ReadyState::Closed,
                writable: false,
            })),
            sender: Arc::new(tokio::sync::Mutex::new(None)),
            task: None,
        };
        transport.uri()?;
        Ok(transport)
    }

    fn lock(&self) -> MutexGuard<'_, WebsocketState> {
        lock(&self.state)
    }

    fn supports_binary(&self) -> bool {
        !self.options.force_base64
    }

    fn uri(&self) -> Result<Url> {
        let mut url = self.options.uri(
            WEBSOCKET,
            self.options.sid.as_deref(),
            self.options.timestamp_requests == Some(true),
            self.supports_binary(),
        )?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(Error::InvalidUrlScheme(other.to_owned())),
        };
        url.set_scheme(scheme)
            .map_err(|()| Error::InvalidUrlScheme(scheme.to_owned()))?;
        Ok(url)
    }
}

impl std::fmt::Debug for WebsocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebsocketTransport")
            .field("options", &self.options)
            .field("sink", &self.sink)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn lock(state: &Mutex<WebsocketState>) -> MutexGuard<'_, WebsocketState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Transport for WebsocketTransport {
    fn name(&self) -> &'static str {
        WEBSOCKET
    }

    fn ready_state(&self) -> ReadyState {
        self.lock().ready_state
    }

    fn writable(&self) -> bool {
        self.lock().writable
    }

    fn open(&mut self) {
        self.lock().ready_state = ReadyState::Opening;

        let uri = self.uri();
        let headers = self.options.extra_headers.clone();
        let connector = self.options.tls_config.clone().map(Connector::NativeTls);
        let state = self.state.clone();
        let sender = self.sender.clone();
        let sink = self.sink.clone();

        self.task = Some(tokio::spawn(async move {
            let connect = async {
                let mut request = uri?.as_str().into_client_request()?;
                if let Some(headers) = headers {
                    request.headers_mut().extend(headers);
                }
                let (stream, _) =
                    connect_async_tls_with_config(request, None, false, connector).await?;
                Ok::<_, Error>(stream)
            };
            let stream = match connect.await {
                Ok(stream) => stream,
                Err(err) => {
                    sink.emit(TransportEvent::Error(format!("websocket error: {err}")));
                    return;
                }
            };

            let (write, mut read) = stream.split();
            *sender.lock().await = Some(write);
            {
                let mut state = lock(&state);
                state.ready_state = ReadyState::Open;
                state.writable = true;
                sink.emit(TransportEvent::Open);
            }

            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => match Packet::decode_str(&text) {
                        Ok(packet) => sink.emit(TransportEvent::Packet(packet)),
                        Err(err) => {
                            sink.emit(TransportEvent::Error(format!("parse error: {err}")))
                        }
                    },
                    Ok(Message::Binary(data)) => {
                        sink.emit(TransportEvent::Packet(Packet::new(
                            PacketId::MessageBinary,
                            data,
                        )));
                    }
                    Ok(Message::Close(_)) => break,
                    // ping and pong frames are answered by tungstenite
                    Ok(_) => {}
                    Err(err) => {
                        sink.emit(TransportEvent::Error(format!("websocket error: {err}")));
                        return;
                    }
                }
            }

            trace!("websocket connection closed by the server");
            let mut state = lock(&state);
            state.ready_state = ReadyState::Closed;
            state.writable = false;
            sink.emit(TransportEvent::Close(
                "websocket connection closed".to_owned(),
            ));
        }));
    }

    fn send(&mut self, packets: Vec<Packet>) {
        {
            let mut state = self.lock();
            if state.ready_state != ReadyState::Open {
                return;
            }
            state.writable = false;
        }

        let supports_binary = self.supports_binary();
        let state = self.state.clone();
        let sender = self.sender.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let mut sender = sender.lock().await;
            let Some(sender) = sender.as_mut() else {
                return;
            };
            for packet in packets {
                let message = match packet.encode(supports_binary) {
                    Ok(Encoded::Text(text)) => Message::Text(text),
                    Ok(Encoded::Binary(data)) => Message::Binary(data.to_vec()),
                    Err(err) => {
                        sink.emit(TransportEvent::Error(format!("websocket error: {err}")));
                        return;
                    }
                };
                if let Err(err) = sender.send(message).await {
                    sink.emit(TransportEvent::Error(format!("websocket error: {err}")));
                    return;
                }
            }

            let mut state = lock(&state);
            if state.ready_state == ReadyState::Open {
                state.writable = true;
                sink.emit(TransportEvent::Drain);
            }
        });
    }

    fn close(&mut self) {
        {
            let mut state = self.lock();
            if !matches!(state.ready_state, ReadyState::Opening | ReadyState::Open) {
                return;
            }
            state.ready_state = ReadyState::Closed;
            state.writable = false;
        }

        if let Some(task) = self.task.take() {
            task.abort();
        }

        let sender = self.sender.clone();
        tokio::spawn(async move {
            if let Some(mut sender) = sender.lock().await.take() {
                let _ = sender.close().await;
            }
        });

        self.sink
            .emit(TransportEvent::Close("transport closed by the client".to_owned()));
    }

    /// A websocket has nothing to wind down.
    fn pause(&mut self) {
        self.lock().ready_state = ReadyState::Paused;
        self.sink.emit(TransportEvent::Paused);
    }

    fn set_sid(&mut self, sid: &str) {
        self.options.sid = Some(sid.to_owned());
    }
}

impl Drop for WebsocketTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn options(url: &str) -> TransportOptions {
        TransportOptions::new(Url::parse(url).unwrap())
    }

    #[test]
    fn http_schemes_are_mapped() -> Result<()> {
        let (tx, _rx) = unbounded_channel();
        let transport = WebsocketTransport::new(
            options("http://localhost:4200/engine.io/"),
            TransportSink::new(0, tx.clone()),
        )?;
        let uri = transport.uri()?;
        assert_eq!(uri.scheme(), "ws");
        assert!(!uri.query_pairs().any(|(k, _)| k == "t"));

        let transport = WebsocketTransport::new(
            options("https://localhost:4202/engine.io/"),
            TransportSink::new(1, tx),
        )?;
        assert_eq!(transport.uri()?.scheme(), "wss");
        Ok(())
    }

    #[test]
    fn timestamps_on_request() -> Result<()> {
        let (tx, _rx) = unbounded_channel();
        let mut options = options("http://localhost:4200/engine.io/");
        options.timestamp_requests = Some(true);
        let transport = WebsocketTransport::new(options, TransportSink::new(0, tx))?;
        assert!(transport.uri()?.query_pairs().any(|(k, _)| k == "t"));
        Ok(())
    }

    #[test]
    fn unsupported_scheme_fails_construction() {
        let (tx, _rx) = unbounded_channel();
        let result = WebsocketTransport::new(
            options("ftp://localhost/engine.io/"),
            TransportSink::new(0, tx),
        );
        assert!(matches!(result, Err(Error::InvalidUrlScheme(_))));
    }

    #[test]
    fn pause_is_immediate() {
        let (tx, mut rx) = unbounded_channel();
        let mut transport = WebsocketTransport::new(
            options("http://localhost:4200/engine.io/"),
            TransportSink::new(3, tx),
        )
        .unwrap();
        transport.pause();
        assert_eq!(transport.ready_state(), ReadyState::Paused);
        assert_eq!(rx.try_recv().unwrap(), (3, TransportEvent::Paused));
    }
}
