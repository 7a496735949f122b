//! Storage traits and the in-memory store.

pub mod memory;
pub mod workflow_store;
