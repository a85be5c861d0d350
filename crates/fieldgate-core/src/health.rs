//! Health snapshot types consumed by north-bound collectors.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Coarse health classification of a device or connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthState::Healthy)
    }
}

/// A point-in-time health view of one device or connector.
///
/// Emission is pull-oriented: the gateway assembles a snapshot on demand and
/// an external collector decides what to do with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub state: HealthState,
    /// Last successful communication, if any.
    pub last_comm: Option<SystemTime>,
    /// Failure ratio over the component's error window, in `[0, 1]`.
    pub error_rate: f64,
    /// Time since the component was registered/started.
    pub uptime: Duration,
    /// Stable code of the most recent error, if any.
    pub last_error: Option<String>,
}

impl HealthSnapshot {
    /// A snapshot for a component that has not communicated yet.
    pub fn unknown(uptime: Duration) -> Self {
        Self {
            state: HealthState::Degraded,
            last_comm: None,
            error_rate: 0.0,
            uptime,
            last_error: None,
        }
    }
}
