//! Shared domain types for the Gantry workflow execution engine.
//!
//! This crate contains the data model the engine operates on: execution
//! plans, per-run workflow state, worker result envelopes, gate decisions,
//! remediation payloads, and the persisted transition events.
//!
//! Zero infrastructure dependencies -- only serde, serde_json, uuid, chrono,
//! thiserror.

pub mod envelope;
pub mod error;
pub mod event;
pub mod plan;
pub mod state;
