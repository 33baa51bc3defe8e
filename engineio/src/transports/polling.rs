use log::trace;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, ClientBuilder};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::packet::{decode_payload, encode_payload, Packet, PacketId};
use crate::transport::{
    ReadyState, Transport, TransportEvent, TransportOptions, TransportSink, POLLING,
};

#[derive(Debug)]
struct PollingState {
    ready_state: ReadyState,
    sid: Option<String>,
    /// A GET request is in flight.
    polling: bool,
    /// No POST request is in flight.
    writable: bool,
}

impl PollingState {
    /// Finishes a requested pause once neither a poll nor a write is pending.
    fn check_paused(&mut self, sink: &TransportSink) {
        if self.ready_state == ReadyState::Pausing && !self.polling && self.writable {
            self.ready_state = ReadyState::Paused;
            sink.emit(TransportEvent::Paused);
        }
    }
}

/// Shared between the transport and its poll and write tasks.
#[derive(Debug)]
struct Inner {
    client: Client,
    options: TransportOptions,
    sink: TransportSink,
    state: Mutex<PollingState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, PollingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn uri(&self) -> Result<url::Url> {
        let sid = self.lock().sid.clone();
        self.options.uri(
            POLLING,
            sid.as_deref(),
            self.options.timestamp_requests != Some(false),
            !self.options.force_base64,
        )
    }

    async fn get(&self) -> Result<String> {
        let response = self.client.get(self.uri()?).send().await?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(Error::IncompleteHttp(status));
        }
        Ok(response.text().await?)
    }

    async fn post(&self, body: String) -> Result<()> {
        let response = self
            .client
            .post(self.uri()?)
            .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(Error::IncompleteHttp(status));
        }
        Ok(())
    }
}

/// HTTP long-polling. A GET request is kept pending at all times to receive
/// data, packets are sent as payloads in POST requests, one at a time.
#[derive(Debug)]
pub struct PollingTransport {
    inner: Arc<Inner>,
    poll_task: Option<JoinHandle<()>>,
}

impl PollingTransport {
    pub fn new(options: TransportOptions, sink: TransportSink) -> Result<Self> {
        let mut builder = ClientBuilder::new();
        if let Some(tls_config) = options.tls_config.clone() {
            builder = builder.use_preconfigured_tls(tls_config);
        }
        if let Some(headers) = options.extra_headers.clone() {
            builder = builder.default_headers(headers);
        }

        let state = PollingState {
            ready_state: ReadyState::Closed,
            sid: options.sid.clone(),
            polling: false,
            writable: false,
        };
        Ok(PollingTransport {
            inner: Arc::new(Inner {
                client: builder.build()?,
                options,
                sink,
                state: Mutex::new(state),
            }),
            poll_task: None,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PollingState> {
        self.inner.lock()
    }
}

/// The long-polling cycle. Re-polls after every payload for as long as the
/// transport stays open.
async fn poll_loop(inner: Arc<Inner>) {
    let sink = &inner.sink;
    loop {
        {
            let mut state = inner.lock();
            if matches!(state.ready_state, ReadyState::Closed | ReadyState::Paused) {
                return;
            }
            state.polling = true;
        }

        trace!("polling");
        let payload = match inner.get().await {
            Ok(payload) => payload,
            Err(err) => {
                sink.emit(TransportEvent::Error(format!("xhr poll error: {err}")));
                return;
            }
        };

        for packet in decode_payload(&payload) {
            let packet = match packet {
                Ok(packet) => packet,
                Err(err) => {
                    sink.emit(TransportEvent::Error(format!("parse error: {err}")));
                    return;
                }
            };

            let mut state = inner.lock();
            if state.ready_state == ReadyState::Opening && packet.packet_id == PacketId::Open {
                state.ready_state = ReadyState::Open;
                state.writable = true;
                sink.emit(TransportEvent::Open);
            }

            if packet.packet_id == PacketId::Close {
                state.ready_state = ReadyState::Closed;
                state.polling = false;
                sink.emit(TransportEvent::Close(
                    "transport closed by the server".to_owned(),
                ));
                return;
            }

            sink.emit(TransportEvent::Packet(packet));
        }

        let mut state = inner.lock();
        if state.ready_state == ReadyState::Closed {
            return;
        }
        state.polling = false;
        state.check_paused(sink);
        if state.ready_state != ReadyState::Open {
            trace!("ignoring poll - transport state {}", state.ready_state);
            return;
        }
    }
}

impl Transport for PollingTransport {
    fn name(&self) -> &'static str {
        POLLING
    }

    fn ready_state(&self) -> ReadyState {
        self.lock().ready_state
    }

    fn writable(&self) -> bool {
        self.lock().writable
    }

    fn open(&mut self) {
        self.lock().ready_state = ReadyState::Opening;
        self.poll_task = Some(tokio::spawn(poll_loop(self.inner.clone())));
    }

    fn send(&mut self, packets: Vec<Packet>) {
        {
            let mut state = self.lock();
            if state.ready_state != ReadyState::Open {
                return;
            }
            state.writable = false;
        }

        let body = match encode_payload(&packets) {
            Ok(body) => body,
            Err(err) => {
                self.inner
                    .sink
                    .emit(TransportEvent::Error(format!("xhr post error: {err}")));
                return;
            }
        };

        trace!("writing {} packet(s) with polling", packets.len());
        let inner = self.inner.clone();
        tokio::spawn(async move {
            match inner.post(body).await {
                Ok(()) => {
                    let mut state = inner.lock();
                    state.writable = true;
                    inner.sink.emit(TransportEvent::Drain);
                    state.check_paused(&inner.sink);
                }
                Err(err) => inner
                    .sink
                    .emit(TransportEvent::Error(format!("xhr post error: {err}"))),
            }
        });
    }

    fn close(&mut self) {
        let was_open = {
            let mut state = self.lock();
            if !matches!(state.ready_state, ReadyState::Opening | ReadyState::Open) {
                return;
            }
            let was_open = state.ready_state == ReadyState::Open;
            state.ready_state = ReadyState::Closed;
            state.writable = false;
            was_open
        };

        if let Some(task) = self.poll_task.take() {
            task.abort();
        }

        if was_open {
            // tell the server, nobody waits for the answer
            if let Ok(body) = encode_payload(&[Packet::new(PacketId::Close, "")]) {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    let _ = inner.post(body).await;
                });
            }
        }

        self.inner
            .sink
            .emit(TransportEvent::Close("transport closed by the client".to_owned()));
    }

    fn pause(&mut self) {
        let mut state = self.lock();
        state.ready_state = ReadyState::Pausing;
        state.check_paused(&self.inner.sink);
    }

    fn set_sid(&mut self, sid: &str) {
        self.lock().sid = Some(sid.to_owned());
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;
    use url::Url;

    fn transport() -> (
        PollingTransport,
        tokio::sync::mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    ) {
        let (tx, rx) = unbounded_channel();
        let options =
            TransportOptions::new(Url::parse("http://localhost:4200/engine.io/").unwrap());
        (
            PollingTransport::new(options, TransportSink::new(1, tx)).unwrap(),
            rx,
        )
    }

    #[test]
    fn polling_uri_has_timestamp() -> Result<()> {
        let (mut transport, _rx) = transport();
        let uri = transport.inner.uri()?;
        assert!(uri.query_pairs().any(|(k, v)| k == "transport" && v == "polling"));
        assert!(uri.query_pairs().any(|(k, _)| k == "t"));
        assert!(!uri.query_pairs().any(|(k, _)| k == "sid"));

        transport.set_sid("abc");
        let uri = transport.inner.uri()?;
        assert!(uri.query_pairs().any(|(k, v)| k == "sid" && v == "abc"));
        Ok(())
    }

    #[test]
    fn send_before_open_is_ignored() {
        let (mut transport, mut rx) = transport();
        assert_eq!(transport.ready_state(), ReadyState::Closed);
        transport.send(vec![Packet::new(PacketId::Message, "hello")]);
        assert!(!transport.writable());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn pause_when_idle_is_immediate() {
        let (mut transport, mut rx) = transport();
        {
            let mut state = transport.lock();
            state.ready_state = ReadyState::Open;
            state.writable = true;
        }
        transport.pause();
        assert_eq!(transport.ready_state(), ReadyState::Paused);
        assert_eq!(rx.try_recv().unwrap(), (1, TransportEvent::Paused));
    }

    #[test]
    fn pause_waits_for_pending_write() {
        let (mut transport, mut rx) = transport();
        {
            let mut state = transport.lock();
            state.ready_state = ReadyState::Open;
            state.writable = false;
        }
        transport.pause();
        assert_eq!(transport.ready_state(), ReadyState::Pausing);
        assert!(rx.try_recv().is_err());

        // the pending write completes
        {
            let mut state = transport.lock();
            state.writable = true;
            state.check_paused(&transport.inner.sink);
        }
        assert_eq!(transport.ready_state(), ReadyState::Paused);
        assert_eq!(rx.try_recv().unwrap(), (1, TransportEvent::Paused));
    }

    #[test]
    fn close_only_acts_when_opening_or_open() {
        let (mut transport, mut rx) = transport();
        transport.close();
        assert!(rx.try_recv().is_err());

        transport.lock().ready_state = ReadyState::Opening;
        transport.close();
        assert_eq!(transport.ready_state(), ReadyState::Closed);
        assert!(matches!(rx.try_recv().unwrap(), (1, TransportEvent::Close(_))));
    }
}
