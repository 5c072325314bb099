//! Handoff common library
//!
//! This crate contains shared code used across Handoff components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{RouterConfig, TieBreak};
pub use error::{Result, RouterError};
pub use metrics::RouterMetrics;
