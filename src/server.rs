//! TCP server role: listener, accept loop and connection registry.
//!
//! A [`Server`] binds a port, accepts peers in a loop and gives each one a
//! [`Connection`] with its own engine. Connections are stored in a registry
//! keyed by [`ConnectionId`]; the embedder supplies per-connection engine
//! hooks through [`ServerHooks::accept_hooks`].
//!
//! ```ignore
//! let server = Server::new(ctx, Arc::new(MyServerHooks));
//! server.start(4000);
//! // ...
//! server.close();
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};

use crate::connection::{Connection, ConnectionGuardHooks};
use crate::context::NetContext;
use crate::engine::{abort_connection, state, EngineConfig, EngineHooks, NoopHooks, StreamEngine};
use crate::error::ErrorKind;
use crate::lifecycle::LifecycleLock;

/// Registry key for an accepted connection. Ids are never reused within a
/// server's lifetime.
pub type ConnectionId = u64;

/// Coarse server-level notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    Started,
    Aborted,
}

/// Callbacks for server lifecycle and peer management.
///
/// All methods default to no-ops; `accept_hooks` defaults to hooks that
/// ignore everything.
pub trait ServerHooks: Send + Sync {
    /// The listener is bound and accepting.
    fn on_start(&self) {}

    /// The server shut down; every connection has been torn down.
    fn on_abort(&self) {}

    /// Produce the engine hooks for a newly accepted peer.
    fn accept_hooks(&self, _id: ConnectionId, _peer: SocketAddr) -> Arc<dyn EngineHooks> {
        Arc::new(NoopHooks)
    }

    /// A peer was accepted and registered.
    fn on_peer_connected(&self, _conn: &Arc<Connection>) {}

    /// A peer left the registry (its engine disconnected, or it was removed
    /// during server close).
    fn on_peer_disconnected(&self, _conn: &Arc<Connection>) {}

    fn on_event(&self, _event: ServerEvent) {}

    fn on_error(&self, _kind: ErrorKind, _err: &std::io::Error) {}
}

pub(crate) struct ServerShared {
    pub(crate) context: NetContext,
    config: EngineConfig,
    state: AtomicU8,
    lifecycle: LifecycleLock,
    hooks: Arc<dyn ServerHooks>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    registry: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
    port: AtomicU16,
    abort_tx: watch::Sender<bool>,
    accepting: AtomicBool,
    accept_exited: Notify,
}

/// Handle to a server. Cheap to clone; all clones drive the same listener.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub fn new(context: NetContext, hooks: Arc<dyn ServerHooks>) -> Self {
        Self::with_config(context, hooks, EngineConfig::default())
    }

    /// `config` applies to every accepted connection's engine.
    pub fn with_config(
        context: NetContext,
        hooks: Arc<dyn ServerHooks>,
        config: EngineConfig,
    ) -> Self {
        let (abort_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(ServerShared {
                context,
                config,
                state: AtomicU8::new(state::OFFLINE),
                lifecycle: LifecycleLock::new(),
                hooks,
                listener: Mutex::new(None),
                registry: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                port: AtomicU16::new(0),
                abort_tx,
                accepting: AtomicBool::new(false),
                accept_exited: Notify::new(),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) & state::ONLINE != 0
    }

    /// Port the listener is bound to (0 until started; with a requested
    /// port of 0 this is the ephemeral port the system picked).
    pub fn port(&self) -> u16 {
        self.shared.port.load(Ordering::Acquire)
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        lock_registry(&self.shared).len()
    }

    /// Look a connection up by id.
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        lock_registry(&self.shared).get(&id).cloned()
    }

    /// Snapshot of every registered connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        lock_registry(&self.shared).values().cloned().collect()
    }

    /// Bind `port` on all interfaces and start accepting.
    ///
    /// Rejected with `AlreadyStarted` while online. Bind failure reports
    /// `BindFailed` and leaves the server offline. Success fires `on_start`
    /// and `ServerEvent::Started`.
    pub fn start(&self, port: u16) {
        let shared = Arc::clone(&self.shared);
        self.shared.context.spawn(async move {
            if shared.state.fetch_or(state::ONLINE, Ordering::AcqRel) & state::ONLINE != 0 {
                let err = std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "server is already started",
                );
                shared.report_error(ErrorKind::AlreadyStarted, &err);
                return;
            }
            shared.abort_tx.send_replace(false);

            let listener = match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => listener,
                Err(err) => {
                    shared.state.fetch_and(!state::ONLINE, Ordering::AcqRel);
                    tracing::debug!(port, %err, "bind failed");
                    shared.report_error(ErrorKind::BindFailed, &err);
                    return;
                }
            };
            let bound_port = listener.local_addr().map(|a| a.port()).unwrap_or(port);
            shared.port.store(bound_port, Ordering::Release);
            *lock_listener(&shared) = Some(Arc::new(listener));

            tracing::debug!(port = bound_port, "server started");
            if let Some(_guard) = shared.lifecycle.acquire() {
                shared.hooks.on_start();
                shared.hooks.on_event(ServerEvent::Started);
            }

            shared.accepting.store(true, Ordering::Release);
            let loop_shared = Arc::clone(&shared);
            shared.context.spawn(async move {
                accept_loop(loop_shared).await;
            });
        });
    }

    /// Stop accepting, tear every connection down, then fire `on_abort` and
    /// `ServerEvent::Aborted`. Idempotent; a no-op when already offline.
    pub fn close(&self) {
        let shared = Arc::clone(&self.shared);
        self.shared.context.spawn(async move {
            server_abort(&shared).await;
        });
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if Arc::strong_count(&self.shared) > 1 {
            return;
        }
        // Last handle: silence the hooks and tear everything down without
        // firing further callbacks.
        self.shared
            .state
            .fetch_and(!state::ONLINE, Ordering::AcqRel);
        let _ = self.shared.abort_tx.send(true);
        self.shared.lifecycle.begin_destroy_and_wait();
        lock_listener(&self.shared).take();
        lock_registry(&self.shared).clear();
    }
}

impl ServerShared {
    fn aborted(&self) -> bool {
        *self.abort_tx.borrow()
    }

    fn report_error(&self, kind: ErrorKind, err: &std::io::Error) {
        if let Some(_guard) = self.lifecycle.acquire() {
            tracing::debug!(?kind, %err, "server error");
            self.hooks.on_error(kind, err);
        }
    }

    /// Drop a connection from the registry, firing `on_peer_disconnected`.
    /// Missing ids are ignored (the connection may already have been
    /// removed by a concurrent server close).
    pub(crate) fn remove_connection(&self, id: ConnectionId) {
        let conn = lock_registry_inner(&self.registry).remove(&id);
        if let Some(conn) = conn {
            if let Some(_guard) = self.lifecycle.acquire() {
                self.hooks.on_peer_disconnected(&conn);
            }
        }
    }
}

fn lock_listener(shared: &ServerShared) -> std::sync::MutexGuard<'_, Option<Arc<TcpListener>>> {
    match shared.listener.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_registry(
    shared: &ServerShared,
) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
    lock_registry_inner(&shared.registry)
}

fn lock_registry_inner(
    registry: &Mutex<HashMap<ConnectionId, Arc<Connection>>>,
) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn accept_loop(shared: Arc<ServerShared>) {
    let mut abort_rx = shared.abort_tx.subscribe();

    loop {
        if shared.aborted() {
            break;
        }
        let Some(listener) = lock_listener(&shared).clone() else {
            break;
        };

        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    register_peer(&shared, stream, peer);
                }
                Err(err) => {
                    shared.report_error(ErrorKind::AcceptFailed, &err);
                }
            },
            _ = abort_rx.changed() => continue,
        }
    }

    shared.accepting.store(false, Ordering::Release);
    shared.accept_exited.notify_waiters();
}

fn register_peer(shared: &Arc<ServerShared>, stream: TcpStream, peer: SocketAddr) {
    let Some(_guard) = shared.lifecycle.acquire() else {
        return;
    };
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let user_hooks = shared.hooks.accept_hooks(id, peer);
    let guard_hooks = Arc::new(ConnectionGuardHooks::new(
        user_hooks,
        Arc::downgrade(shared),
        id,
    ));
    let engine = StreamEngine::with_config(
        shared.context.clone(),
        guard_hooks,
        shared.config.clone(),
    );
    engine.install_socket(stream);
    let conn = Arc::new(Connection::new(engine.clone(), id, peer));
    lock_registry(shared).insert(id, Arc::clone(&conn));
    tracing::debug!(id, %peer, "peer connected");
    shared.hooks.on_peer_connected(&conn);
    engine.start_read();
}

/// Full server teardown. Runs on the context; idempotent.
async fn server_abort(shared: &Arc<ServerShared>) {
    let prev = shared.state.fetch_and(!state::ONLINE, Ordering::AcqRel);
    let had_listener = lock_listener(shared).is_some();
    if prev & state::ONLINE == 0 && !had_listener {
        return;
    }

    let _ = shared.abort_tx.send(true);

    // Wait for the accept loop to observe the abort and exit.
    loop {
        let notified = shared.accept_exited.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !shared.accepting.load(Ordering::Acquire) {
            break;
        }
        notified.await;
    }

    lock_listener(shared).take();

    // Tear connections down one at a time; each peer's disconnect hooks
    // fire before the next teardown starts.
    let ids: Vec<ConnectionId> = lock_registry(shared).keys().copied().collect();
    for id in ids {
        let conn = lock_registry(shared).get(&id).cloned();
        if let Some(conn) = conn {
            abort_connection(conn.engine().shared()).await;
            shared.remove_connection(id);
        }
    }

    tracing::debug!("server stopped");
    if let Some(_guard) = shared.lifecycle.acquire() {
        shared.hooks.on_abort();
        shared.hooks.on_event(ServerEvent::Aborted);
    }
}
