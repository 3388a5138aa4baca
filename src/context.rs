//! Execution context shared by every engine and server.
//!
//! A [`NetContext`] either owns a single-threaded tokio runtime (created by
//! [`NetContext::new`]) or borrows an existing runtime's handle
//! ([`NetContext::from_handle`]). An owned context runs its event loop on a
//! dedicated background thread started with [`start_thread`]; nothing makes
//! progress until that thread exists.
//!
//! ```ignore
//! let ctx = NetContext::new()?;
//! ctx.start_thread();
//! // ... run clients/servers against ctx ...
//! ctx.join_thread();
//! ```
//!
//! [`start_thread`]: NetContext::start_thread

use std::sync::{Arc, Mutex};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Notify;

struct OwnedLoop {
    runtime: Runtime,
    shutdown: Notify,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

struct ContextInner {
    handle: Handle,
    owned: Option<OwnedLoop>,
}

/// Cloneable handle to the event loop that drives all network activity.
#[derive(Clone)]
pub struct NetContext {
    inner: Arc<ContextInner>,
}

impl NetContext {
    /// Create a context that owns a fresh single-threaded runtime.
    ///
    /// The runtime is idle until [`start_thread`](Self::start_thread) is
    /// called.
    pub fn new() -> crate::error::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            inner: Arc::new(ContextInner {
                handle,
                owned: Some(OwnedLoop {
                    runtime,
                    shutdown: Notify::new(),
                    thread: Mutex::new(None),
                }),
            }),
        })
    }

    /// Borrow an existing runtime; the caller keeps driving it.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                handle,
                owned: None,
            }),
        }
    }

    /// Spawn a task onto the context's runtime.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(future)
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Start the background thread that drives an owned runtime.
    ///
    /// No-op for borrowed contexts, and for owned contexts whose thread is
    /// already running.
    pub fn start_thread(&self) {
        let Some(owned) = &self.inner.owned else {
            return;
        };
        let mut slot = match owned.thread.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *slot = Some(std::thread::spawn(move || {
            // `owned` is Some by construction on this path.
            if let Some(owned) = &inner.owned {
                owned.runtime.block_on(owned.shutdown.notified());
            }
        }));
    }

    /// Signal the owned loop to stop and join its thread.
    ///
    /// Tasks still queued on the runtime are dropped, not completed. No-op
    /// for borrowed contexts.
    pub fn join_thread(&self) {
        let Some(owned) = &self.inner.owned else {
            return;
        };
        let thread = {
            let mut slot = match owned.thread.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        if let Some(thread) = thread {
            owned.shutdown.notify_one();
            if thread.join().is_err() {
                tracing::error!("context thread panicked");
            }
        }
    }
}
