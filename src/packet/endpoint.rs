//! Packet-framed client and server conveniences.
//!
//! These wire a [`PacketLink`] into the transport roles so embedders work
//! in whole packets and never see raw bytes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::client::Client;
use crate::connection::Connection;
use crate::context::NetContext;
use crate::engine::{EngineConfig, EngineHooks};
use crate::error::ErrorKind;
use crate::packet::link::{NoopPacketHooks, PacketHooks, PacketLink};
use crate::server::{ConnectionId, Server, ServerEvent, ServerHooks};

/// TCP client whose traffic is packet framed.
pub struct PacketClient {
    client: Client,
    link: Arc<PacketLink>,
}

impl PacketClient {
    pub fn new(context: NetContext, hooks: Arc<dyn PacketHooks>) -> Self {
        Self::with_config(context, hooks, EngineConfig::default())
    }

    pub fn with_config(
        context: NetContext,
        hooks: Arc<dyn PacketHooks>,
        config: EngineConfig,
    ) -> Self {
        let link = PacketLink::new(hooks);
        let engine_hooks: Arc<dyn EngineHooks> = Arc::clone(&link) as _;
        Self {
            client: Client::with_config(context, engine_hooks, config),
            link,
        }
    }

    pub fn link(&self) -> &Arc<PacketLink> {
        &self.link
    }

    pub fn is_online(&self) -> bool {
        self.client.is_online()
    }

    pub fn add_endpoint(&self, addr: SocketAddr) {
        self.client.add_endpoint(addr);
    }

    pub fn resolve(&self, host: String, port: u16) {
        self.client.resolve(host, port);
    }

    pub fn connect(&self) {
        self.client.connect();
    }

    pub fn disconnect(&self) {
        self.client.disconnect();
    }

    /// Send the one-time handshake frame; a no-op after the first send.
    pub fn send_handshake(&self, payload: &[u8]) {
        self.link.send_handshake(payload);
    }

    /// Frame and send a payload.
    pub fn send_packet(&self, payload: &[u8]) {
        self.link.send_packet(payload);
    }
}

/// Callbacks for a packet-framed server.
///
/// Mirrors [`ServerHooks`] but hands out [`PacketHooks`] per peer instead
/// of raw engine hooks.
pub trait PacketServerHooks: Send + Sync {
    fn on_start(&self) {}
    fn on_abort(&self) {}

    /// Produce the packet hooks for a newly accepted peer.
    fn peer_hooks(&self, _id: ConnectionId, _peer: SocketAddr) -> Arc<dyn PacketHooks> {
        Arc::new(NoopPacketHooks)
    }

    fn on_peer_connected(&self, _conn: &Arc<Connection>) {}
    fn on_peer_disconnected(&self, _conn: &Arc<Connection>) {}
    fn on_event(&self, _event: ServerEvent) {}
    fn on_error(&self, _kind: ErrorKind, _err: &std::io::Error) {}
}

/// `ServerHooks` adapter that gives every accepted peer a fresh
/// [`PacketLink`] and keeps the links addressable by connection id.
struct PacketServerAdapter {
    user: Arc<dyn PacketServerHooks>,
    links: Mutex<HashMap<ConnectionId, Arc<PacketLink>>>,
}

impl PacketServerAdapter {
    fn lock_links(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Arc<PacketLink>>> {
        match self.links.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ServerHooks for PacketServerAdapter {
    fn on_start(&self) {
        self.user.on_start();
    }

    fn on_abort(&self) {
        self.user.on_abort();
    }

    fn accept_hooks(&self, id: ConnectionId, peer: SocketAddr) -> Arc<dyn EngineHooks> {
        let link = PacketLink::new(self.user.peer_hooks(id, peer));
        self.lock_links().insert(id, Arc::clone(&link));
        link as _
    }

    fn on_peer_connected(&self, conn: &Arc<Connection>) {
        self.user.on_peer_connected(conn);
    }

    fn on_peer_disconnected(&self, conn: &Arc<Connection>) {
        self.lock_links().remove(&conn.id());
        self.user.on_peer_disconnected(conn);
    }

    fn on_event(&self, event: ServerEvent) {
        self.user.on_event(event);
    }

    fn on_error(&self, kind: ErrorKind, err: &std::io::Error) {
        self.user.on_error(kind, err);
    }
}

/// TCP server whose peers are packet framed.
pub struct PacketServer {
    server: Server,
    adapter: Arc<PacketServerAdapter>,
}

impl PacketServer {
    pub fn new(context: NetContext, hooks: Arc<dyn PacketServerHooks>) -> Self {
        Self::with_config(context, hooks, EngineConfig::default())
    }

    pub fn with_config(
        context: NetContext,
        hooks: Arc<dyn PacketServerHooks>,
        config: EngineConfig,
    ) -> Self {
        let adapter = Arc::new(PacketServerAdapter {
            user: hooks,
            links: Mutex::new(HashMap::new()),
        });
        let server_hooks: Arc<dyn ServerHooks> = Arc::clone(&adapter) as _;
        Self {
            server: Server::with_config(context, server_hooks, config),
            adapter,
        }
    }

    pub fn start(&self, port: u16) {
        self.server.start(port);
    }

    pub fn close(&self) {
        self.server.close();
    }

    pub fn is_online(&self) -> bool {
        self.server.is_online()
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    pub fn connection_count(&self) -> usize {
        self.server.connection_count()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.server.connection(id)
    }

    /// Packet link for a registered peer.
    pub fn link(&self, id: ConnectionId) -> Option<Arc<PacketLink>> {
        self.adapter.lock_links().get(&id).cloned()
    }

    /// Send the one-time handshake frame to one peer.
    pub fn send_handshake(&self, id: ConnectionId, payload: &[u8]) {
        if let Some(link) = self.link(id) {
            link.send_handshake(payload);
        }
    }

    /// Frame and send a payload to one peer.
    pub fn send_packet(&self, id: ConnectionId, payload: &[u8]) {
        if let Some(link) = self.link(id) {
            link.send_packet(payload);
        }
    }
}
