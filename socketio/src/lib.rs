//! # socketio-client
//!
//! A socket.io client written in the Rust Programming Language. It implements revision 5 of
//! the socket.io protocol on top of [`engineio_client`].
//!
//! ## Example usage
//!
//! ``` rust,no_run
//! use futures_util::FutureExt;
//! use serde_json::json;
//! use socketio_client::{ManagerBuilder, Payload, Socket};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), socketio_client::Error> {
//!     let manager = ManagerBuilder::new("http://localhost:4200/").build()?;
//!
//!     // get a socket that is connected to the admin namespace
//!     let socket = manager.socket("/admin")?;
//!
//!     // define a callback which is called when a payload is received
//!     // this callback gets the payload as well as an instance of the
//!     // socket to communicate with the server
//!     socket.on("test", |payload: Payload, socket: Socket| {
//!         async move {
//!             println!("Received: {payload:?}");
//!             let _ = socket.emit("test", json!({"got ack": true}));
//!         }
//!         .boxed()
//!     });
//!     socket.on("connect_error", |err, _| {
//!         async move { eprintln!("Error: {err:?}") }.boxed()
//!     });
//!
//!     // emit to the "foo" event, buffered until the namespace is connected
//!     socket.emit("foo", json!({"token": 123}))?;
//!
//!     // emit with an ack
//!     socket.timeout(Duration::from_secs(2)).emit_with_ack(
//!         "test",
//!         json!({"myAckData": 123}),
//!         |message, _| {
//!             async move { println!("Ack data: {message:?}") }.boxed()
//!         },
//!     )?;
//!     Ok(())
//! }
//! ```
//!
//! The [`Manager`] owns the connection to a server. Every namespace gets a [`Socket`] from
//! [`Manager::socket`], all of them share the one connection. [`ManagerRegistry`] hands out
//! sockets by url and reuses managers across lookups.
//!
//! ## Current features
//!
//! - namespaces multiplexed over one connection
//! - listeners for lifecycle and custom events, catch-all listeners
//! - JSON and binary arguments, mixed freely
//! - acknowledgements in both directions, with optional timeouts
//! - buffering while disconnected, volatile emits
//! - an at-least-once retry queue
//! - automatic reconnection with exponential backoff
//!
#![allow(clippy::rc_buffer)]
#![warn(clippy::complexity)]
#![warn(clippy::style)]
#![warn(clippy::perf)]
#![warn(clippy::correctness)]

pub mod backoff;
mod emitter;
/// Contains the error type which will be returned with every result in this
/// crate.
pub mod error;
pub mod event;
pub mod manager;
pub mod packet;
pub mod payload;
pub mod registry;
pub mod socket;
pub mod value;

pub const SOCKET_IO_VERSION: i32 = 5;

pub use backoff::Backoff;
pub use emitter::ListenerId;
pub use error::Error;
pub use event::Event;
pub use manager::{Manager, ManagerBuilder, ManagerEvent, ManagerOptions, ReadyState};
pub use packet::{Chunk, Decoder, Encoder, Packet, PacketId};
pub use payload::Payload;
pub use registry::{LookupOptions, ManagerRegistry};
pub use socket::{AckId, Socket, SocketOptions};
pub use value::Value;
