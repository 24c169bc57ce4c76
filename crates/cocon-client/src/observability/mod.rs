//! Observability for the client runtime.

pub mod metrics;
