//! Durable SQLite job queue and the worker pool that drains it.

pub mod sqlite;
pub mod worker;
