//! Core types shared across all Switchyard crates.
//!
//! # Main types
//!
//! - [`SwitchyardError`]: Unified error enum for the registry, the bus and the host.
//! - [`SwitchyardResult`]: Convenience alias for `Result<T, SwitchyardError>`.
//! - [`HealthState`]: Coarse health classification used by every health report.

/// Error types.
pub mod error;

pub use error::{SwitchyardError, SwitchyardResult};

use serde::{Deserialize, Serialize};

/// Overall health classification reported by the registry and the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Everything is operating normally.
    Healthy,
    /// Operating, but at least one component is failing.
    Degraded,
    /// Not operating.
    Unhealthy,
}

impl HealthState {
    /// Combine two states, keeping the worse one.
    pub fn worst(self, other: HealthState) -> HealthState {
        use HealthState::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_health_state_serialization() {
        let json = serde_json::to_string(&HealthState::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
        let parsed: HealthState = serde_json::from_str("\"unhealthy\"").unwrap();
        assert_eq!(parsed, HealthState::Unhealthy);
    }

    #[test]
    fn test_worst_keeps_more_severe_state() {
        assert_eq!(
            HealthState::Healthy.worst(HealthState::Degraded),
            HealthState::Degraded
        );
        assert_eq!(
            HealthState::Unhealthy.worst(HealthState::Degraded),
            HealthState::Unhealthy
        );
        assert_eq!(
            HealthState::Healthy.worst(HealthState::Healthy),
            HealthState::Healthy
        );
    }
}
