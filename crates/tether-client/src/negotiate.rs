//! The one-shot negotiation exchange.
//!
//! Sends a single request to the base endpoint and parses the server's
//! `{connectionId, availableTransports}` answer. All failures here are
//! startup faults: they reject `start` and surface through `Closed`.

use std::sync::Arc;

use tether_core::{NegotiateResponse, TetherError, TetherResult};

use crate::http::{HttpClient, HttpMethod};

/// Exchange one negotiation request with the server.
pub async fn negotiate(
    http: &Arc<dyn HttpClient>,
    endpoint: &str,
    method: HttpMethod,
) -> TetherResult<NegotiateResponse> {
    tracing::debug!("negotiating with {}", endpoint);

    let response = http
        .request(method, endpoint, Vec::new())
        .await
        .map_err(|e| TetherError::Negotiate(e.to_string()))?;

    if !response.is_success() {
        return Err(TetherError::Negotiate(format!(
            "negotiation request to {endpoint} returned status {}",
            response.status
        )));
    }

    let parsed = NegotiateResponse::from_json(&response.body)?;
    tracing::info!(
        "negotiated connection {} ({} transports advertised)",
        parsed.connection_id,
        parsed.available_transports.len()
    );
    Ok(parsed)
}
