//! Handoff decode router
//!
//! Picks the least-loaded decode worker when a prefill finishes, tracks that
//! worker's load while it decodes, and forwards the decode request to it.

pub mod lease;
pub mod registry;
pub mod router;
pub mod selection;
pub mod server;
pub mod worker_client;

pub use lease::{Lease, LeaseTable};
pub use registry::{WorkerRecord, WorkerRegistry};
pub use router::{load_weight, DecodeRouter};
pub use selection::select_least_loaded;
pub use server::{create_router, serve};
pub use worker_client::{DecodeClient, DecodeResponse};
