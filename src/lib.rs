//! fleet-agent - policy-driven agent
//!
//! Compiles declarative policies into per-program configuration slices,
//! routes them to running program groups, and executes actions delivered by
//! a fleet control plane with durable, at-least-once acknowledgement.

pub mod agent;
pub mod config;
pub mod emitter;
pub mod fleet;
pub mod info;
pub mod metrics;
pub mod policy;
pub mod program;
pub mod providers;
pub mod router;
pub mod transpiler;
