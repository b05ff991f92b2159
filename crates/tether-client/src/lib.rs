//! tether-client: persistent client connections over interchangeable
//! transports.
//!
//! A [`Connection`] negotiates a session with the server over HTTP, picks the
//! best mutually supported transport (WebSockets, Server-Sent Events, or long
//! polling, in that order), and then pumps opaque byte payloads both ways.
//! Lifecycle is reported through ordered callbacks: `Connected` first, then
//! any number of `Received`, then exactly one `Closed`.
//!
//! # Quick Start
//!
//! ```no_run
//! use tether_client::ConnectionBuilder;
//!
//! # async fn example() -> tether_core::TetherResult<()> {
//! let connection = ConnectionBuilder::new("https://example.com/chat")
//!     .on_received(|payload| println!("{}", String::from_utf8_lossy(payload)))
//!     .on_closed(|fault| match fault {
//!         Some(err) => eprintln!("connection lost: {err}"),
//!         None => eprintln!("connection closed"),
//!     })
//!     .build();
//!
//! connection.start().await?;
//! connection.send(b"hello".to_vec()).await?;
//! connection.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod http;
pub mod negotiate;
pub mod transport;

// Re-export primary public types.
pub use connection::{Connection, ConnectionBuilder, ConnectionConfig};
pub use http::{BodyStream, HttpClient, HttpMethod, HttpResponse, ReqwestClient};
pub use transport::{
    AnyTransport, LongPollingTransport, SseTransport, Transport, TransportFactory,
    WebSocketTransport,
};

// Re-export tether-core types applications need.
pub use tether_core::{
    ConnectionState, TetherError, TetherResult, TransportKind, TransportSet,
};
