//! Negotiation response model and connect-URL construction.
//!
//! The negotiation exchange itself lives in `tether-client`; this module only
//! knows the body's shape and validation rules.

use serde::{Deserialize, Serialize};

use crate::error::{TetherError, TetherResult};
use crate::kind::{TransportKind, TransportSet};

/// The server's answer to the negotiation request.
///
/// Transient: consumed once, immediately after the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    pub connection_id: String,
    pub available_transports: Vec<TransportKind>,
}

impl NegotiateResponse {
    /// Parse and validate a negotiation body.
    pub fn from_json(body: &[u8]) -> TetherResult<Self> {
        if body.is_empty() {
            return Err(TetherError::Protocol("empty negotiation response".into()));
        }
        let response: NegotiateResponse = serde_json::from_slice(body)
            .map_err(|e| TetherError::Protocol(format!("malformed negotiation response: {e}")))?;
        if response.connection_id.trim().is_empty() {
            return Err(TetherError::Protocol(
                "negotiation response has no connection id".into(),
            ));
        }
        if response.available_transports.is_empty() {
            return Err(TetherError::Protocol(
                "negotiation response advertises no transports".into(),
            ));
        }
        Ok(response)
    }

    /// The advertised transports as a set.
    pub fn transports(&self) -> TransportSet {
        self.available_transports.iter().copied().collect()
    }
}

/// Append the connection id to the endpoint's query string.
pub fn connect_url(endpoint: &str, connection_id: &str) -> String {
    let sep = if endpoint.contains('?') { '&' } else { '?' };
    format!("{endpoint}{sep}id={connection_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_body() {
        let body = br#"{"connectionId":"abc123","availableTransports":["WebSockets","LongPolling"]}"#;
        let response = NegotiateResponse::from_json(body).unwrap();
        assert_eq!(response.connection_id, "abc123");
        assert!(response.transports().contains(TransportKind::WebSockets));
        assert!(response.transports().contains(TransportKind::LongPolling));
        assert!(!response.transports().contains(TransportKind::ServerSentEvents));
    }

    #[test]
    fn rejects_empty_body() {
        assert!(matches!(
            NegotiateResponse::from_json(b""),
            Err(TetherError::Protocol(_))
        ));
    }

    #[test]
    fn rejects_blank_connection_id() {
        let body = br#"{"connectionId":"  ","availableTransports":["LongPolling"]}"#;
        assert!(NegotiateResponse::from_json(body).is_err());
    }

    #[test]
    fn rejects_unknown_transport_name() {
        let body = br#"{"connectionId":"abc","availableTransports":["CarrierPigeon"]}"#;
        assert!(matches!(
            NegotiateResponse::from_json(body),
            Err(TetherError::Protocol(_))
        ));
    }

    #[test]
    fn rejects_empty_transport_list() {
        let body = br#"{"connectionId":"abc","availableTransports":[]}"#;
        assert!(NegotiateResponse::from_json(body).is_err());
    }

    #[test]
    fn connect_url_appends_id() {
        assert_eq!(
            connect_url("https://example.com/chat", "abc123"),
            "https://example.com/chat?id=abc123"
        );
        assert_eq!(
            connect_url("https://example.com/chat?tenant=1", "abc123"),
            "https://example.com/chat?tenant=1&id=abc123"
        );
    }
}
