//! Shared domain types for Stepline.
//!
//! This crate contains the data that crosses crate and queue boundaries:
//! the workflow context, the queued step message, the persisted execution
//! record, and the error enums used by the engine's traits.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod context;
pub mod error;
pub mod workflow;
