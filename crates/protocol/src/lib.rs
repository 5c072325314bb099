//! Handoff wire protocol
//!
//! JSON bodies exchanged with prefill workers (reservation and dispatch) and
//! with decode workers (generate).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Sampling parameters are forwarded to the decode worker untouched.
pub type SamplingParams = BTreeMap<String, serde_json::Number>;

/// Body of `POST /prefill_finish`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub text: String,
}

/// Response of `POST /prefill_finish`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationResponse {
    pub decode_worker_id: String,

    /// Same value as `decode_worker_id`, under the key older prefill workers read
    pub decode_worker_url: String,

    /// Token to present on dispatch; the reservation is released after the lease expires
    pub reservation_id: Uuid,

    pub lease_expires_in_ms: u64,
}

/// Body of `POST /generate_decode`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    #[serde(alias = "decode_worker_url")]
    pub decode_worker_id: String,

    pub text: String,

    #[serde(default)]
    pub sampling_params: SamplingParams,

    /// Omitted by callers that only remember the worker id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<Uuid>,
}

/// Body sent to `POST {worker}/generate`
#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest<'a> {
    pub text: &'a str,
    pub sampling_params: &'a SamplingParams,
}

impl<'a> From<&'a DispatchRequest> for GenerateRequest<'a> {
    fn from(request: &'a DispatchRequest) -> Self {
        Self {
            text: &request.text,
            sampling_params: &request.sampling_params,
        }
    }
}

/// One entry of `GET /workers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLoad {
    pub decode_worker_id: String,
    pub load: u64,
    pub outstanding_reservations: usize,
}
