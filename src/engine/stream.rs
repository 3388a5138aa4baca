//! Core stream engine: socket ownership, read/write/tick loops, abort.
//!
//! One engine drives one TCP stream. At most one read loop and one write
//! loop run at a time (guarded by the `IN_READ`/`IN_WRITE` state bits), and
//! each loop performs at most one socket operation per iteration, so there
//! is never more than one outstanding read or write.
//!
//! All control operations (`send`, `start_read`, `disconnect`, ...) are
//! posted to the engine's context and return immediately; outcomes surface
//! through [`EngineHooks`].

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};

use crate::context::NetContext;
use crate::engine::hooks::{EngineHooks, Event};
use crate::engine::state;
use crate::error::ErrorKind;
use crate::lifecycle::LifecycleLock;
use crate::queue::TsQueue;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of the read buffer; one read delivers at most this many bytes.
    pub read_chunk_size: usize,
    /// Cadence of the `on_tick` hook, online or not.
    pub tick_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 20 * 1024,
            tick_interval: Duration::from_millis(50),
        }
    }
}

pub(crate) struct EngineShared {
    pub(crate) context: NetContext,
    pub(crate) config: EngineConfig,
    pub(crate) state: AtomicU8,
    pub(crate) lifecycle: LifecycleLock,
    pub(crate) hooks: Arc<dyn EngineHooks>,
    outbound: TsQueue<Bytes>,
    socket: Mutex<Option<Arc<TcpStream>>>,
    /// Latched abort signal; loops observe it between socket operations.
    abort_tx: watch::Sender<bool>,
    /// Single-flight latch: only one abort task performs teardown.
    aborting: AtomicBool,
    /// Pinged whenever a loop exits, so abort can wait for both.
    loop_exited: Notify,
}

/// Handle to a stream engine. Cheap to clone; all clones drive the same
/// underlying connection.
#[derive(Clone)]
pub struct StreamEngine {
    shared: Arc<EngineShared>,
}

/// Non-owning engine handle for adapters stored inside the hooks object.
///
/// The engine owns its hooks, so hooks that need to call back into the
/// engine hold one of these instead of a [`StreamEngine`] to avoid a
/// reference cycle.
#[derive(Clone)]
pub struct EngineRef {
    shared: Weak<EngineShared>,
}

impl EngineRef {
    pub fn upgrade(&self) -> Option<StreamEngine> {
        self.shared.upgrade().map(|shared| StreamEngine { shared })
    }
}

impl StreamEngine {
    pub fn new(context: NetContext, hooks: Arc<dyn EngineHooks>) -> Self {
        Self::with_config(context, hooks, EngineConfig::default())
    }

    pub fn with_config(
        context: NetContext,
        hooks: Arc<dyn EngineHooks>,
        config: EngineConfig,
    ) -> Self {
        let (abort_tx, _) = watch::channel(false);
        let engine = Self {
            shared: Arc::new(EngineShared {
                context,
                config,
                state: AtomicU8::new(state::OFFLINE),
                lifecycle: LifecycleLock::new(),
                hooks,
                outbound: TsQueue::new(),
                socket: Mutex::new(None),
                abort_tx,
                aborting: AtomicBool::new(false),
                loop_exited: Notify::new(),
            }),
        };
        // The tick runs from construction until destruction, online or not.
        let shared = Arc::clone(&engine.shared);
        engine.shared.context.spawn(async move {
            tick_loop(shared).await;
        });
        engine.shared.hooks.on_attach(&engine);
        engine
    }

    pub fn downgrade(&self) -> EngineRef {
        EngineRef {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn context(&self) -> &NetContext {
        &self.shared.context
    }

    /// Current state bitmask snapshot.
    pub fn state(&self) -> u8 {
        self.shared.state.load(Ordering::Acquire)
    }

    pub fn is_online(&self) -> bool {
        self.state() & state::ONLINE != 0
    }

    pub fn is_reading(&self) -> bool {
        self.state() & state::IN_READ != 0
    }

    pub fn is_writing(&self) -> bool {
        self.state() & state::IN_WRITE != 0
    }

    /// Number of buffers waiting in the outbound queue.
    pub fn pending_writes(&self) -> usize {
        self.shared.outbound.len()
    }

    /// Queue bytes for transmission and make sure the write loop runs.
    ///
    /// Data queued while offline stays queued and goes out once a new
    /// connection starts writing.
    pub fn send(&self, data: impl Into<Bytes>) {
        self.shared.outbound.push(data.into());
        self.start_write();
    }

    /// Start the read loop if the engine is online and not already reading.
    pub fn start_read(&self) {
        let shared = Arc::clone(&self.shared);
        self.shared.context.spawn(async move {
            if claim_loop(&shared, state::IN_READ) {
                read_loop(shared).await;
            }
        });
    }

    /// Start the write loop if the engine is online and not already writing.
    pub fn start_write(&self) {
        let shared = Arc::clone(&self.shared);
        self.shared.context.spawn(async move {
            if claim_loop(&shared, state::IN_WRITE) {
                write_loop(shared).await;
            }
        });
    }

    /// Ask the read loop to stop after its current operation completes.
    pub fn stop_read(&self) {
        if self.state() & state::IN_READ != 0 {
            self.shared
                .state
                .fetch_or(state::STOP_READ, Ordering::AcqRel);
        }
    }

    /// Ask the write loop to stop after the current buffer is fully sent.
    pub fn stop_write(&self) {
        if self.state() & state::IN_WRITE != 0 {
            self.shared
                .state
                .fetch_or(state::STOP_WRITE, Ordering::AcqRel);
        }
    }

    /// Tear the connection down: interrupt both loops, shut the socket down
    /// and close it, then fire `on_disconnect`. Idempotent; a no-op when
    /// already offline.
    pub fn disconnect(&self) {
        let shared = Arc::clone(&self.shared);
        self.shared.context.spawn(async move {
            abort_connection(&shared).await;
        });
    }

    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    /// Adopt a freshly connected socket: rearm the abort signal and mark
    /// the engine online. Caller fires the connect hooks.
    pub(crate) fn install_socket(&self, stream: TcpStream) {
        self.shared.abort_tx.send_replace(false);
        {
            let mut slot = lock_socket(&self.shared);
            *slot = Some(Arc::new(stream));
        }
        self.shared
            .state
            .fetch_or(state::ONLINE, Ordering::AcqRel);
    }

    /// Synchronous teardown used by role destructors: interrupt the loops
    /// and make sure no hook is running or will run again.
    pub(crate) fn shutdown_for_drop(&self) {
        self.shared
            .state
            .fetch_and(!state::CONNECTIVITY, Ordering::AcqRel);
        let _ = self.shared.abort_tx.send(true);
        self.shared.lifecycle.begin_destroy_and_wait();
        let stream = lock_socket(&self.shared).take();
        if let Some(stream) = stream {
            close_socket(&self.shared, stream, false);
        }
    }
}

fn lock_socket(shared: &EngineShared) -> std::sync::MutexGuard<'_, Option<Arc<TcpStream>>> {
    match shared.socket.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl EngineShared {
    fn aborted(&self) -> bool {
        *self.abort_tx.borrow()
    }

    fn current_socket(&self) -> Option<Arc<TcpStream>> {
        lock_socket(self).clone()
    }

    pub(crate) fn report_error(&self, kind: ErrorKind, err: &std::io::Error) {
        if let Some(_guard) = self.lifecycle.acquire() {
            tracing::debug!(?kind, %err, "engine error");
            self.hooks.on_error(kind, err);
        }
    }

    fn schedule_abort(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        self.context.spawn(async move {
            abort_connection(&shared).await;
        });
    }
}

/// Claim one of the loop-activity bits. Fails when the engine is being
/// destroyed, is offline, or the loop is already running. The lifecycle
/// guard covers only the claim itself, never the loop.
fn claim_loop(shared: &Arc<EngineShared>, bit: u8) -> bool {
    let Some(_guard) = shared.lifecycle.acquire() else {
        return false;
    };
    if shared.state.load(Ordering::Acquire) & state::ONLINE == 0 {
        return false;
    }
    shared.state.fetch_or(bit, Ordering::AcqRel) & bit == 0
}

/// Full teardown sequence. Runs on the context; idempotent.
pub(crate) async fn abort_connection(shared: &Arc<EngineShared>) {
    // Single-flight latch: a second abort racing the first (two disconnect
    // calls, or a read-error abort racing a user disconnect) must not
    // repeat the teardown or double-fire the disconnect hooks.
    if shared.aborting.swap(true, Ordering::AcqRel) {
        return;
    }

    let prev = shared
        .state
        .fetch_and(!state::CONNECTIVITY, Ordering::AcqRel);
    let had_socket = lock_socket(shared).is_some();
    if prev & state::CONNECTIVITY == 0 && !had_socket {
        shared.aborting.store(false, Ordering::Release);
        return;
    }

    let _ = shared.abort_tx.send(true);

    // Wait until both loops have observed the abort and exited.
    loop {
        let notified = shared.loop_exited.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if shared.state.load(Ordering::Acquire) & (state::IN_READ | state::IN_WRITE) == 0 {
            break;
        }
        notified.await;
    }

    let stream = lock_socket(shared).take();
    if let Some(stream) = stream {
        close_socket(shared, stream, true);
    }

    if let Some(_guard) = shared.lifecycle.acquire() {
        shared.hooks.on_disconnect();
        shared.hooks.on_event(Event::Disconnected);
    }
    shared.aborting.store(false, Ordering::Release);
}

/// Shut the socket down in both directions, then close it by dropping.
/// Failures are reported but never abort the teardown.
fn close_socket(shared: &EngineShared, stream: Arc<TcpStream>, report: bool) {
    match Arc::try_unwrap(stream) {
        Ok(stream) => match stream.into_std() {
            Ok(std_stream) => {
                if let Err(err) = std_stream.shutdown(std::net::Shutdown::Both) {
                    if report {
                        shared.report_error(ErrorKind::ShutdownFailed, &err);
                    }
                }
                drop(std_stream);
            }
            Err(err) => {
                if report {
                    shared.report_error(ErrorKind::CloseFailed, &err);
                }
            }
        },
        Err(_still_shared) => {
            // A loop task has not released its reference yet; the socket
            // closes when the last clone drops.
            tracing::warn!("socket still referenced at close, deferring to last drop");
        }
    }
}

async fn read_loop(shared: Arc<EngineShared>) {
    let mut abort_rx = shared.abort_tx.subscribe();
    let mut buf = vec![0u8; shared.config.read_chunk_size];

    loop {
        if shared.aborted() {
            break;
        }
        let Some(socket) = shared.current_socket() else {
            break;
        };

        tokio::select! {
            ready = socket.readable() => {
                if let Err(err) = ready {
                    shared.report_error(ErrorKind::from_read_error(&err), &err);
                    shared.schedule_abort();
                    break;
                }
            }
            _ = abort_rx.changed() => continue,
        }

        match socket.try_read(&mut buf) {
            Ok(0) => {
                let err = std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed the connection",
                );
                shared.report_error(ErrorKind::ConnectionClosed, &err);
                shared.schedule_abort();
                break;
            }
            Ok(n) => {
                {
                    let Some(_guard) = shared.lifecycle.acquire() else {
                        break;
                    };
                    shared.hooks.on_receive(&buf[..n]);
                    shared.hooks.on_event(Event::DataReceived);
                }
                // Completion boundary: honor a pending stop request.
                if shared.state.load(Ordering::Acquire) & state::STOP_READ != 0 {
                    break;
                }
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) => {
                shared.report_error(ErrorKind::from_read_error(&err), &err);
                shared.schedule_abort();
                break;
            }
        }
    }

    shared
        .state
        .fetch_and(!(state::IN_READ | state::STOP_READ), Ordering::AcqRel);
    shared.loop_exited.notify_waiters();
}

async fn write_loop(shared: Arc<EngineShared>) {
    let mut abort_rx = shared.abort_tx.subscribe();

    'outer: loop {
        if shared.aborted() {
            break;
        }
        let Some(data) = shared.outbound.front() else {
            // Queue drained. Clear the activity bit first, then re-check:
            // a send that landed in between saw IN_WRITE still set and did
            // not start a new loop, so this loop must pick its data up.
            shared.state.fetch_and(!state::IN_WRITE, Ordering::AcqRel);
            if !shared.outbound.is_empty()
                && !shared.aborted()
                && shared.state.load(Ordering::Acquire) & state::ONLINE != 0
                && shared.state.fetch_or(state::IN_WRITE, Ordering::AcqRel) & state::IN_WRITE
                    == 0
            {
                continue;
            }
            shared
                .state
                .fetch_and(!state::STOP_WRITE, Ordering::AcqRel);
            shared.loop_exited.notify_waiters();
            return;
        };

        let Some(socket) = shared.current_socket() else {
            break;
        };

        // Transmit the whole buffer before touching the queue again.
        let mut written = 0;
        while written < data.len() {
            if shared.aborted() {
                break 'outer;
            }
            tokio::select! {
                ready = socket.writable() => {
                    if let Err(err) = ready {
                        shared.report_error(ErrorKind::from_write_error(&err), &err);
                        shared.schedule_abort();
                        break 'outer;
                    }
                }
                _ = abort_rx.changed() => continue,
            }
            match socket.try_write(&data[written..]) {
                Ok(n) => written += n,
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(err) => {
                    shared.report_error(ErrorKind::from_write_error(&err), &err);
                    shared.schedule_abort();
                    break 'outer;
                }
            }
        }
        drop(socket);

        {
            let Some(_guard) = shared.lifecycle.acquire() else {
                break;
            };
            shared.hooks.on_event(Event::DataSent);
        }
        // Only now is the buffer consumed; a failed write leaves it queued.
        shared.outbound.pop();

        if shared.state.load(Ordering::Acquire) & state::STOP_WRITE != 0 {
            break;
        }
    }

    shared
        .state
        .fetch_and(!(state::IN_WRITE | state::STOP_WRITE), Ordering::AcqRel);
    shared.loop_exited.notify_waiters();
}

/// Lifetime of the tick matches the engine: it starts at construction and
/// ends only when the lifecycle lock reports destruction. Connections come
/// and go underneath it; the tick keeps firing either way.
async fn tick_loop(shared: Arc<EngineShared>) {
    let mut interval = tokio::time::interval(shared.config.tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(_guard) = shared.lifecycle.acquire() else {
            break;
        };
        shared.hooks.on_tick();
    }
}
