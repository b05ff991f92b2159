//! The HTTP collaborator boundary.
//!
//! Negotiation, the server-push stream, long polling, and outbound batch
//! sends all go through [`HttpClient`], an object-safe "send request, get
//! response or stream" capability. [`ReqwestClient`] is the default
//! implementation; tests substitute in-memory fakes.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

use tether_core::{TetherError, TetherResult};

/// HTTP method for a collaborator request.
///
/// The negotiation step's method is configuration (servers differ on GET vs
/// OPTIONS), so it is threaded through rather than hard-coded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Options,
    Delete,
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// An incrementally consumed response body (the server-push event stream).
pub type BodyStream = Pin<Box<dyn Stream<Item = TetherResult<Bytes>> + Send>>;

/// Opaque request-sending capability.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Issue one request and buffer the whole response.
    async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        body: Vec<u8>,
    ) -> TetherResult<HttpResponse>;

    /// Issue a GET whose response body is consumed incrementally.
    ///
    /// `accept` is sent as the `Accept` header. A non-2xx status is an error.
    async fn open_stream(&self, url: &str, accept: &str) -> TetherResult<BodyStream>;
}

/// Default [`HttpClient`] backed by reqwest.
pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        ReqwestClient {
            inner: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new()
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Options => reqwest::Method::OPTIONS,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        body: Vec<u8>,
    ) -> TetherResult<HttpResponse> {
        let response = self
            .inner
            .request(to_reqwest_method(method), url)
            .body(body)
            .send()
            .await
            .map_err(|e| TetherError::Http(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TetherError::Http(e.to_string()))?
            .to_vec();
        Ok(HttpResponse { status, body })
    }

    async fn open_stream(&self, url: &str, accept: &str) -> TetherResult<BodyStream> {
        let response = self
            .inner
            .get(url)
            .header(reqwest::header::ACCEPT, accept)
            .send()
            .await
            .map_err(|e| TetherError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TetherError::Http(format!(
                "stream request to {url} returned {}",
                response.status()
            )));
        }

        use futures_util::TryStreamExt;
        let stream = response
            .bytes_stream()
            .map_err(|e| TetherError::Http(e.to_string()));
        Ok(Box::pin(stream))
    }
}
