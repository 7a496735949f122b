//! Workflow engine logic and trait definitions for Stepline.
//!
//! This crate defines the "ports" (store and job queue traits) that the
//! infrastructure layer implements, plus the engine itself: workflow
//! definitions, the immutable registry, input hashing, and the step-driving
//! executor. It depends only on `stepline-types` -- never on
//! `stepline-infra` or any database/IO crate.

pub mod hash;
pub mod queue;
pub mod repository;
pub mod workflow;
