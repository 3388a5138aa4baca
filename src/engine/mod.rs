//! Stream engine: the transport core shared by clients, servers and
//! per-peer connections.

mod hooks;
pub mod state;
mod stream;

pub use hooks::{EngineHooks, Event, NoopHooks};
pub use stream::{EngineConfig, EngineRef, StreamEngine};

pub(crate) use stream::abort_connection;
