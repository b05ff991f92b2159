//! tether-core: Shared primitives for the tether connection library.
//!
//! Provides the error taxonomy, the connection lifecycle state cell, the
//! transport-kind set, the application/transport channel pair, the sequential
//! event dispatch queue, and the negotiation response model.

pub mod channel;
pub mod error;
pub mod events;
pub mod kind;
pub mod negotiate;
pub mod state;

// Re-export commonly used items at crate root.
pub use channel::{channel_pair, ApplicationSide, InboundSink, SendEnvelope, TransportSide};
pub use error::{TetherError, TetherResult};
pub use events::{Callbacks, ConnectionEvent, EnqueueHandle, EventQueue};
pub use kind::{TransportKind, TransportSet};
pub use negotiate::{connect_url, NegotiateResponse};
pub use state::{ConnectionState, StateCell};
