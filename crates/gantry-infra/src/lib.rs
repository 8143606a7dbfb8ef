//! Infrastructure implementations for Gantry.
//!
//! Implements the ports defined in `gantry-core` against real IO. Currently
//! that is the filesystem state store; the core crate stays free of any
//! filesystem dependency.

pub mod fs_store;
