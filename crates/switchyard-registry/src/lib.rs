//! Agent registry: the authoritative store of agent metadata and lifecycle.
//!
//! Agents are registered as trait objects, tracked through a small state
//! machine, health-checked on a background loop, and dispatched tasks one at
//! a time per agent with execution statistics recorded on every attempt.
//!
//! # Main types
//!
//! - [`AgentRegistry`]: Registration, lifecycle, dispatch, and health reporting.
//! - [`Agent`]: The capability set every registered agent provides.
//! - [`AgentMetadata`]: Per-agent record with execution counters.
//! - [`RegistryConfig`]: Health-check cadence and stale-agent thresholds.

/// The `Agent` trait and the descriptor agents register with.
pub mod agent;
/// Registry settings.
pub mod config;
/// The registry itself and its background loops.
pub mod registry;
/// Agent types, statuses, metadata and report shapes.
pub mod types;

pub use agent::{Agent, AgentDescriptor};
pub use config::RegistryConfig;
pub use registry::{AgentRegistry, CallbackId, StatusCallback};
pub use types::{
    AgentHealth, AgentMetadata, AgentStatus, AgentType, RegistryHealth, RegistryStatistics,
    ResourceUsage, StatusChange, TaskOutcome,
};
