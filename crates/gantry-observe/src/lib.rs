//! Observability setup for Gantry.
//!
//! Hosts the tracing subscriber initialization used by binaries embedding
//! the engine. Library crates only emit `tracing` events; wiring those to a
//! subscriber (and optionally to OpenTelemetry) happens here, once, at
//! process startup.

pub mod tracing_setup;
