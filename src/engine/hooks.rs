//! Embedder callbacks.
//!
//! Behavior is injected through [`EngineHooks`] rather than subclassing:
//! every method has a no-op default, so an embedder overrides only what it
//! needs. Hooks are invoked from the engine's event-loop tasks under the
//! engine's lifecycle lock; once the owning role object is dropped, no hook
//! runs again.

use crate::engine::StreamEngine;
use crate::error::ErrorKind;

/// Coarse notifications delivered alongside the dedicated hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Resolved,
    Connected,
    DataSent,
    DataReceived,
    Disconnected,
}

/// Callbacks for a single stream engine.
///
/// All methods default to no-ops. Implementations must be cheap or must
/// hand work off; they run on the engine's event loop.
pub trait EngineHooks: Send + Sync {
    /// Called once when the engine is created, with a handle to it.
    fn on_attach(&self, _engine: &StreamEngine) {}

    /// A connection was established.
    fn on_connect(&self) {}

    /// Name resolution produced at least one endpoint.
    fn on_resolve(&self) {}

    /// The connection was torn down (peer close, error, or local abort).
    fn on_disconnect(&self) {}

    /// Raw bytes arrived. `data` is only valid for the duration of the call.
    fn on_receive(&self, _data: &[u8]) {}

    /// Periodic timer fired while the engine is online.
    fn on_tick(&self) {}

    /// Coarse event notification.
    fn on_event(&self, _event: Event) {}

    /// An operation failed. `kind` identifies the operation, `err` the
    /// underlying system error.
    fn on_error(&self, _kind: ErrorKind, _err: &std::io::Error) {}
}

/// Hooks implementation that ignores everything.
pub struct NoopHooks;

impl EngineHooks for NoopHooks {}
