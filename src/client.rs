//! Outbound TCP client role.
//!
//! A [`Client`] wraps one [`StreamEngine`] and adds endpoint management:
//! resolve a host name into candidate addresses, or add addresses directly,
//! then connect to the first candidate that accepts.
//!
//! ```ignore
//! let ctx = NetContext::new()?;
//! ctx.start_thread();
//! let client = Client::new(ctx, Arc::new(MyHooks));
//! client.resolve("example.com".into(), 4000);
//! client.connect();
//! ```
//!
//! All operations are posted and return immediately; outcomes arrive via
//! the engine hooks (`on_resolve`, `on_connect`, `on_error`).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;

use crate::context::NetContext;
use crate::engine::{state, EngineConfig, EngineHooks, Event, StreamEngine};
use crate::error::ErrorKind;

pub struct Client {
    engine: StreamEngine,
    endpoints: Arc<Mutex<Vec<SocketAddr>>>,
}

impl Client {
    pub fn new(context: NetContext, hooks: Arc<dyn EngineHooks>) -> Self {
        Self::with_config(context, hooks, EngineConfig::default())
    }

    pub fn with_config(
        context: NetContext,
        hooks: Arc<dyn EngineHooks>,
        config: EngineConfig,
    ) -> Self {
        Self {
            engine: StreamEngine::with_config(context, hooks, config),
            endpoints: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn engine(&self) -> &StreamEngine {
        &self.engine
    }

    pub fn is_online(&self) -> bool {
        self.engine.is_online()
    }

    /// Add a candidate endpoint without resolution.
    pub fn add_endpoint(&self, addr: SocketAddr) {
        lock_endpoints(&self.endpoints).push(addr);
    }

    /// Snapshot of the current candidate list.
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        lock_endpoints(&self.endpoints).clone()
    }

    /// Resolve `host:port` and append the results to the candidate list.
    ///
    /// Rejected with `AlreadyConnected` while online, connecting or
    /// resolving. Success fires `on_resolve` and `Event::Resolved`.
    pub fn resolve(&self, host: String, port: u16) {
        let shared = Arc::clone(self.engine.shared());
        let endpoints = Arc::clone(&self.endpoints);
        self.engine.context().spawn(async move {
            if !try_enter(&shared.state, state::RESOLVING) {
                let err = busy_error("resolve requested while connected or busy");
                shared.report_error(ErrorKind::AlreadyConnected, &err);
                return;
            }
            match tokio::net::lookup_host((host.as_str(), port)).await {
                Ok(addrs) => {
                    let mut found = lock_endpoints(&endpoints);
                    found.extend(addrs);
                    drop(found);
                    shared.state.fetch_and(!state::RESOLVING, Ordering::AcqRel);
                    if let Some(_guard) = shared.lifecycle.acquire() {
                        shared.hooks.on_resolve();
                        shared.hooks.on_event(Event::Resolved);
                    }
                }
                Err(err) => {
                    shared.state.fetch_and(!state::RESOLVING, Ordering::AcqRel);
                    tracing::debug!(%host, port, %err, "resolve failed");
                    shared.report_error(ErrorKind::ResolveFailed, &err);
                }
            }
        });
    }

    /// Try the candidate endpoints in order and adopt the first stream that
    /// connects.
    ///
    /// Rejected with `AlreadyConnected` while online, connecting or
    /// resolving. Exactly one `ConnectFailed` is reported if every
    /// candidate fails. On success the read loop starts automatically.
    pub fn connect(&self) {
        let engine = self.engine.clone();
        let endpoints = Arc::clone(&self.endpoints);
        self.engine.context().spawn(async move {
            let shared = Arc::clone(engine.shared());
            if !try_enter(&shared.state, state::CONNECTING) {
                let err = busy_error("connect requested while connected or busy");
                shared.report_error(ErrorKind::AlreadyConnected, &err);
                return;
            }

            let candidates = lock_endpoints(&endpoints).clone();
            let mut last_err = std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no endpoints to connect to",
            );
            for addr in candidates {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        engine.install_socket(stream);
                        shared
                            .state
                            .fetch_and(!state::CONNECTING, Ordering::AcqRel);
                        tracing::debug!(%addr, "connected");
                        if let Some(_guard) = shared.lifecycle.acquire() {
                            shared.hooks.on_event(Event::Connected);
                            shared.hooks.on_connect();
                        }
                        engine.start_read();
                        return;
                    }
                    Err(err) => {
                        tracing::debug!(%addr, %err, "connect attempt failed");
                        last_err = err;
                    }
                }
            }
            shared
                .state
                .fetch_and(!state::CONNECTING, Ordering::AcqRel);
            shared.report_error(ErrorKind::ConnectFailed, &last_err);
        });
    }

    /// Queue bytes for transmission.
    pub fn send(&self, data: impl Into<bytes::Bytes>) {
        self.engine.send(data);
    }

    /// Tear the connection down; `on_disconnect` fires when done.
    pub fn disconnect(&self) {
        self.engine.disconnect();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.engine.shutdown_for_drop();
    }
}

fn lock_endpoints(
    endpoints: &Mutex<Vec<SocketAddr>>,
) -> std::sync::MutexGuard<'_, Vec<SocketAddr>> {
    match endpoints.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Set `bit` only if no connectivity bit is set yet.
fn try_enter(state_word: &AtomicU8, bit: u8) -> bool {
    let mut cur = state_word.load(Ordering::Acquire);
    loop {
        if cur & state::CONNECTIVITY != 0 {
            return false;
        }
        match state_word.compare_exchange_weak(
            cur,
            cur | bit,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(now) => cur = now,
        }
    }
}

fn busy_error(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::AlreadyExists, msg.to_string())
}
