//! Per-peer connection owned by a [`Server`](crate::server::Server).
//!
//! Each accepted socket gets its own [`StreamEngine`] and lives in the
//! server's registry under a numeric id. The connection holds no strong
//! reference back to the server; when its engine disconnects it asks the
//! server (through a weak reference) to drop it from the registry.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use crate::engine::{EngineHooks, Event, StreamEngine};
use crate::error::ErrorKind;
use crate::server::{ConnectionId, ServerShared};

/// One accepted peer.
pub struct Connection {
    engine: StreamEngine,
    id: ConnectionId,
    peer: SocketAddr,
}

impl Connection {
    pub(crate) fn new(engine: StreamEngine, id: ConnectionId, peer: SocketAddr) -> Self {
        Self { engine, id, peer }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn engine(&self) -> &StreamEngine {
        &self.engine
    }

    pub fn is_online(&self) -> bool {
        self.engine.is_online()
    }

    /// Queue bytes for transmission to this peer.
    pub fn send(&self, data: impl Into<bytes::Bytes>) {
        self.engine.send(data);
    }

    /// Tear this peer's connection down.
    pub fn disconnect(&self) {
        self.engine.disconnect();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.engine.shutdown_for_drop();
    }
}

/// Engine hooks wrapper installed on every accepted connection.
///
/// Forwards everything to the embedder's hooks and, on disconnect,
/// schedules the connection's removal from the server registry. Removal is
/// scheduled rather than performed inline because the disconnect hook runs
/// under the engine's lifecycle guard and removal may drop the last
/// reference to the connection.
pub(crate) struct ConnectionGuardHooks {
    inner: Arc<dyn EngineHooks>,
    server: Weak<ServerShared>,
    id: ConnectionId,
}

impl ConnectionGuardHooks {
    pub(crate) fn new(
        inner: Arc<dyn EngineHooks>,
        server: Weak<ServerShared>,
        id: ConnectionId,
    ) -> Self {
        Self { inner, server, id }
    }
}

impl EngineHooks for ConnectionGuardHooks {
    fn on_attach(&self, engine: &StreamEngine) {
        self.inner.on_attach(engine);
    }

    fn on_connect(&self) {
        self.inner.on_connect();
    }

    fn on_disconnect(&self) {
        self.inner.on_disconnect();
        let id = self.id;
        if let Some(server) = self.server.upgrade() {
            let shared = Arc::clone(&server);
            server.context.spawn(async move {
                shared.remove_connection(id);
            });
        }
    }

    fn on_receive(&self, data: &[u8]) {
        self.inner.on_receive(data);
    }

    fn on_tick(&self) {
        self.inner.on_tick();
    }

    fn on_event(&self, event: Event) {
        self.inner.on_event(event);
    }

    fn on_error(&self, kind: ErrorKind, err: &std::io::Error) {
        self.inner.on_error(kind, err);
    }
}
