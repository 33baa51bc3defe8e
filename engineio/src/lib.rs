//! # engineio-client
//!
//! An implementation of an engine.io client written in the rust programming language. This
//! implementation supports revision 4 of the engine.io protocol.
//!
//! ## Example usage
//!
//! ``` rust,no_run
//! use engineio_client::{socket::Event, ClientBuilder};
//! use futures_util::StreamExt;
//! use url::Url;
//!
//! # async fn run() -> Result<(), engineio_client::Error> {
//! let (client, mut events) = ClientBuilder::new(Url::parse("http://localhost:4201")?).build()?;
//!
//! // packets are buffered until the handshake is done
//! client.send_message("Hello World")?;
//!
//! while let Some(event) = events.next().await {
//!     match event {
//!         Event::Open => println!("Connection opened!"),
//!         Event::Upgrade(transport) => println!("Upgraded to {transport}"),
//!         Event::Message(packet) => println!("Received {:?}", packet.data),
//!         Event::Close(reason) => println!("Closed: {reason}"),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The socket starts on the first configured transport (`polling` by default), performs the
//! handshake and probes the upgrades the server offers. Once a `websocket` probe is answered,
//! the polling transport is paused and the socket switches over without losing packets.
//!
//! Every socket is driven by a single task on the tokio runtime. The [`Client`] handle only
//! sends commands to it, everything that happens on the socket is reported in order through
//! the [`ClientEvents`] stream.
//!
//! ## Current features
//!
//! * `polling` and `websocket` transports, with custom headers and tls configuration
//! * transport upgrades, optionally remembered across connections
//! * heartbeat supervision
//! * write buffering that respects the `maxPayload` of the server
//!
#![allow(clippy::rc_buffer)]
#![warn(clippy::complexity)]
#![warn(clippy::style)]
#![warn(clippy::perf)]
#![warn(clippy::correctness)]

pub mod client;
pub mod packet;
pub mod socket;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod transport;
pub mod transports;

pub const ENGINE_IO_VERSION: i32 = 4;

/// Contains the error type which will be returned with every result in this
/// crate. Handles all kinds of errors.
pub mod error;

pub use client::{Client, ClientBuilder, ClientEvents, ConnectionPreferences, SocketOptions};
pub use error::Error;
pub use packet::{Packet, PacketId};
pub use socket::{CloseReason, Event};
pub use transport::{ReadyState, Transport, TransportFactory};
