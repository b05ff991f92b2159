//! Connection lifecycle state.
//!
//! The state trajectory is always a subsequence of
//! `Initial → Connecting → Connected → Disconnected`. Transitions go through
//! [`StateCell`], an atomic compare-and-exchange cell, so lifecycle changes
//! never serialize sends behind a lock.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a [`Connection`](../index.html).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, no I/O performed yet.
    Initial = 0,
    /// `start` in flight: negotiating, selecting, or starting a transport.
    Connecting = 1,
    /// Transport up; sends accepted, events flowing.
    Connected = 2,
    /// Terminal. A new logical connection requires a new instance.
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Initial,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Atomic holder for a [`ConnectionState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        StateCell(AtomicU8::new(ConnectionState::Initial as u8))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Transition `from → to` if the current state is `from`.
    ///
    /// Returns `true` when the transition happened; `false` leaves the cell
    /// untouched and means another path already moved the state.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Unconditionally move to `Disconnected`, returning the previous state.
    pub fn disconnect(&self) -> ConnectionState {
        ConnectionState::from_u8(
            self.0
                .swap(ConnectionState::Disconnected as u8, Ordering::SeqCst),
        )
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
