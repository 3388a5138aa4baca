//! Packet link: frames outbound payloads and reassembles inbound ones,
//! enforcing the handshake discipline.
//!
//! A [`PacketLink`] plugs into a [`StreamEngine`] as its hooks object. The
//! first frame received on a connection is routed to
//! [`PacketHooks::on_handshake`]; every later frame goes to
//! [`PacketHooks::on_packet`]. On the send side, handshake and data frames
//! share one wire encoding; the first frame sent, whichever method queued
//! it, consumes the one handshake slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;

use crate::engine::{EngineHooks, EngineRef, Event, StreamEngine};
use crate::error::ErrorKind;
use crate::packet::frame::encode_frame;
use crate::packet::framer::Framer;

/// Callbacks for a packet-framed connection.
///
/// All methods default to no-ops.
pub trait PacketHooks: Send + Sync {
    /// First frame of the connection.
    fn on_handshake(&self, _payload: Bytes) {}

    /// Any frame after the first.
    fn on_packet(&self, _payload: Bytes) {}

    fn on_connect(&self) {}
    fn on_resolve(&self) {}
    fn on_disconnect(&self) {}
    fn on_tick(&self) {}
    fn on_event(&self, _event: Event) {}
    fn on_error(&self, _kind: ErrorKind, _err: &std::io::Error) {}
}

/// Packet hooks implementation that ignores everything.
pub struct NoopPacketHooks;

impl PacketHooks for NoopPacketHooks {}

struct RxState {
    framer: Framer,
    awaiting_handshake: bool,
}

/// Framing adapter between a [`StreamEngine`] and [`PacketHooks`].
pub struct PacketLink {
    /// Back-reference set by `on_attach`; weak, since the engine owns us.
    engine: OnceLock<EngineRef>,
    rx: Mutex<RxState>,
    handshake_sent: AtomicBool,
    hooks: Arc<dyn PacketHooks>,
}

impl PacketLink {
    pub fn new(hooks: Arc<dyn PacketHooks>) -> Arc<Self> {
        Arc::new(Self {
            engine: OnceLock::new(),
            rx: Mutex::new(RxState {
                framer: Framer::new(),
                awaiting_handshake: true,
            }),
            handshake_sent: AtomicBool::new(false),
            hooks,
        })
    }

    /// The engine this link is attached to, if it still exists.
    pub fn engine(&self) -> Option<StreamEngine> {
        self.engine.get().and_then(EngineRef::upgrade)
    }

    /// Whether the handshake slot has been consumed on the send side.
    pub fn handshake_sent(&self) -> bool {
        self.handshake_sent.load(Ordering::Acquire)
    }

    /// Send the handshake frame if none has gone out yet; otherwise a
    /// no-op. Safe to call from racing tasks; exactly one frame is queued.
    pub fn send_handshake(&self, payload: &[u8]) {
        if self.handshake_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue_frame(payload);
    }

    /// Frame and send a payload. The first frame sent on a connection
    /// consumes the handshake slot whether it was queued here or via
    /// [`send_handshake`](Self::send_handshake).
    pub fn send_packet(&self, payload: &[u8]) {
        self.handshake_sent.store(true, Ordering::Release);
        self.queue_frame(payload);
    }

    fn queue_frame(&self, payload: &[u8]) {
        if let Some(engine) = self.engine() {
            engine.send(encode_frame(payload));
        } else {
            tracing::warn!("packet send with no attached engine, dropping");
        }
    }

    fn lock_rx(&self) -> std::sync::MutexGuard<'_, RxState> {
        match self.rx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Rearm for a fresh connection: empty buffer, handshake pending on
    /// both sides.
    fn reset(&self) {
        let mut rx = self.lock_rx();
        rx.framer.clear();
        rx.awaiting_handshake = true;
        self.handshake_sent.store(false, Ordering::Release);
    }
}

impl EngineHooks for PacketLink {
    fn on_attach(&self, engine: &StreamEngine) {
        let _ = self.engine.set(engine.downgrade());
    }

    fn on_connect(&self) {
        // A reconnect gets a fresh handshake exchange.
        self.reset();
        self.hooks.on_connect();
    }

    fn on_resolve(&self) {
        self.hooks.on_resolve();
    }

    fn on_disconnect(&self) {
        {
            let mut rx = self.lock_rx();
            rx.framer.clear();
        }
        self.hooks.on_disconnect();
    }

    fn on_receive(&self, data: &[u8]) {
        // Route under the lock, dispatch outside it, so hooks may call
        // back into send without contention.
        let routed = {
            let mut rx = self.lock_rx();
            match rx.framer.push(data) {
                Ok(frames) => {
                    let mut routed = Vec::with_capacity(frames.len());
                    for frame in frames {
                        let is_handshake = rx.awaiting_handshake;
                        rx.awaiting_handshake = false;
                        routed.push((is_handshake, frame));
                    }
                    Ok(routed)
                }
                Err(err) => {
                    rx.framer.clear();
                    Err(err)
                }
            }
        };
        match routed {
            Ok(routed) => {
                for (is_handshake, frame) in routed {
                    if is_handshake {
                        self.hooks.on_handshake(frame);
                    } else {
                        self.hooks.on_packet(frame);
                    }
                }
            }
            Err(err) => {
                tracing::debug!(%err, "frame violation, dropping connection");
                if let Some(engine) = self.engine() {
                    engine.disconnect();
                }
                let io_err = std::io::Error::new(std::io::ErrorKind::InvalidData, err);
                self.hooks.on_error(ErrorKind::ProtocolViolation, &io_err);
            }
        }
    }

    fn on_tick(&self) {
        self.hooks.on_tick();
    }

    fn on_event(&self, event: Event) {
        self.hooks.on_event(event);
    }

    fn on_error(&self, kind: ErrorKind, err: &std::io::Error) {
        self.hooks.on_error(kind, err);
    }
}
