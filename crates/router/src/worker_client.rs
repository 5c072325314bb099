//! Client for calls from the router to decode workers

use axum::body::Bytes;
use axum::http::HeaderValue;
use handoff_common::error::{Result, RouterError};
use handoff_protocol::GenerateRequest;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;

/// Longest slice of an upstream error body kept in the error detail
const MAX_ERROR_BODY: usize = 512;

/// A decode worker's generate response, kept as raw bytes for pass-through
#[derive(Debug, Clone)]
pub struct DecodeResponse {
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

/// HTTP client shared by every dispatch
///
/// Single hop: failures are reported to the caller, never retried here.
#[derive(Debug, Clone)]
pub struct DecodeClient {
    client: Client,
    request_timeout: Duration,
}

impl DecodeClient {
    pub fn new(request_timeout: Duration, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| RouterError::internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            request_timeout,
        })
    }

    /// Forward a generate request to `worker`
    pub async fn generate(
        &self,
        worker: &str,
        request: &GenerateRequest<'_>,
    ) -> Result<DecodeResponse> {
        let url = format!("{}/generate", worker);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport_error(worker, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RouterError::upstream(
                worker,
                Some(status.as_u16()),
                format!("decode worker returned {}: {}", status, truncate(&body)),
            ));
        }

        let content_type = response.headers().get(CONTENT_TYPE).cloned();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(worker, e))?;

        Ok(DecodeResponse { content_type, body })
    }

    fn transport_error(&self, worker: &str, err: reqwest::Error) -> RouterError {
        if err.is_timeout() {
            RouterError::upstream(
                worker,
                None,
                format!("request timed out after {:?}", self.request_timeout),
            )
        } else {
            RouterError::upstream(worker, err.status().map(|s| s.as_u16()), err.to_string())
        }
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
