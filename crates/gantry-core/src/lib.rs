//! Workflow execution engine for Gantry.
//!
//! This crate turns a validated [`gantry_types::plan::ExecutionPlan`] into a
//! running workflow: it builds the dependency graph, schedules ready steps
//! onto worker tasks, routes every result through the quality gate, and
//! drives bounded loopback remediation when a gate soft-fails. It defines
//! the "ports" (the [`worker::Worker`] and [`store::StateStore`] traits)
//! that the infrastructure layer implements -- it depends only on
//! `gantry-types`, never on any filesystem or IO crate.

pub mod engine;
pub mod gate;
pub mod graph;
pub mod loopback;
pub mod report;
pub mod store;
pub mod telemetry;
pub mod worker;
