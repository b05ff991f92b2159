//! Transport kinds and the bitset the negotiation step and factory trade in.

use std::fmt;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

use crate::error::{TetherError, TetherResult};

/// A pluggable mechanism for moving bytes to/from the server.
///
/// Order matters: the factory tries kinds in the order they are declared here
/// (full-duplex socket first, then server-push stream, then polling).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSockets,
    ServerSentEvents,
    LongPolling,
}

impl TransportKind {
    /// All kinds, in fixed selection priority order.
    pub const PRIORITY: [TransportKind; 3] = [
        TransportKind::WebSockets,
        TransportKind::ServerSentEvents,
        TransportKind::LongPolling,
    ];

    fn bit(self) -> u8 {
        match self {
            TransportKind::WebSockets => 0b001,
            TransportKind::ServerSentEvents => 0b010,
            TransportKind::LongPolling => 0b100,
        }
    }

    /// Parse a kind from its negotiation wire name.
    pub fn from_wire(name: &str) -> TetherResult<Self> {
        match name {
            "WebSockets" => Ok(TransportKind::WebSockets),
            "ServerSentEvents" => Ok(TransportKind::ServerSentEvents),
            "LongPolling" => Ok(TransportKind::LongPolling),
            other => Err(TetherError::Protocol(format!(
                "unknown transport kind: {other}"
            ))),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::WebSockets => "WebSockets",
            TransportKind::ServerSentEvents => "ServerSentEvents",
            TransportKind::LongPolling => "LongPolling",
        };
        f.write_str(name)
    }
}

// The negotiation body spells kinds by their wire names.
impl Serialize for TransportKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TransportKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        TransportKind::from_wire(&name).map_err(de::Error::custom)
    }
}

/// A set of transport kinds, stored as a bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportSet(u8);

impl TransportSet {
    pub const EMPTY: TransportSet = TransportSet(0);

    /// The set containing every kind.
    pub fn all() -> Self {
        let mut set = TransportSet::EMPTY;
        for kind in TransportKind::PRIORITY {
            set.insert(kind);
        }
        set
    }

    pub fn insert(&mut self, kind: TransportKind) {
        self.0 |= kind.bit();
    }

    pub fn contains(self, kind: TransportKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Kinds present in both sets.
    pub fn intersection(self, other: TransportSet) -> TransportSet {
        TransportSet(self.0 & other.0)
    }
}

impl FromIterator<TransportKind> for TransportSet {
    fn from_iter<I: IntoIterator<Item = TransportKind>>(iter: I) -> Self {
        let mut set = TransportSet::EMPTY;
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}
