//! Workflow definitions and the step-driving executor.

pub mod definition;
pub mod executor;
pub mod handler;
pub mod registry;
pub mod retry;
pub mod start;
