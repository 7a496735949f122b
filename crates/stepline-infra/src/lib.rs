//! Infrastructure layer for Stepline.
//!
//! Contains implementations of the traits defined in `stepline-core`:
//! the SQLite workflow store, the SQLite job queue and its worker pool, and
//! the `config.toml` loader.

pub mod config;
pub mod queue;
pub mod sqlite;
