//! Asynchronous TCP transport with length-delimited packet framing and a
//! structural record serializer.
//!
//! The crate is layered:
//!
//! - [`engine`] — the stream core: one socket, one read loop, one write
//!   loop, a periodic tick, and hook-based callbacks.
//! - [`client`] / [`server`] / [`connection`] — the transport roles built
//!   on the engine.
//! - [`packet`] — tag-validated length-delimited frames with a one-time
//!   handshake, so embedders work in whole packets.
//! - [`record`] — flat field-ordered struct serialization for packet
//!   payloads, generated by [`wire_record!`].
//!
//! Everything runs on a [`NetContext`]: either an owned single-threaded
//! runtime driven by a background thread, or a handle to a runtime the
//! embedder already has.
//!
//! ```ignore
//! use std::sync::Arc;
//! use streamnet::{NetContext, PacketClient};
//!
//! let ctx = NetContext::new()?;
//! ctx.start_thread();
//!
//! let client = PacketClient::new(ctx.clone(), Arc::new(MyHooks));
//! client.resolve("chat.example.com".into(), 4000);
//! client.connect();
//! client.send_handshake(b"");
//! client.send_packet(&message.to_bytes());
//! ```

pub mod client;
pub mod connection;
pub mod context;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod packet;
pub mod queue;
pub mod record;
pub mod server;

pub use client::Client;
pub use connection::Connection;
pub use context::NetContext;
pub use engine::{EngineConfig, EngineHooks, Event, NoopHooks, StreamEngine};
pub use error::{DecodeError, ErrorKind, FrameError, NetError, Result};
pub use packet::{PacketClient, PacketHooks, PacketLink, PacketServer, PacketServerHooks};
pub use record::{Record, WireDecode, WireEncode};
pub use server::{ConnectionId, Server, ServerEvent, ServerHooks};
