//! Observability setup for Stepline processes.

pub mod tracing_setup;
