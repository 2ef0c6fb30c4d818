//! Telemetry Module
//!
//! Device position source consumed by the sharing session. Platform
//! integrations implement [`LocationProvider`]; [`SimulatedWalk`] stands in
//! where no positioning hardware is available.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Requested fix quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accuracy {
    Balanced,
    High,
}

/// Outcome of a location permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// One position reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters, when the platform reports one
    pub accuracy: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl PositionFix {
    pub fn new(latitude: f64, longitude: f64, accuracy: Option<f64>) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            timestamp: Utc::now(),
        }
    }
}

/// Source of device positions
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Ask the platform for foreground location permission.
    async fn request_permission(&self) -> PermissionStatus;

    /// Acquire a single position fix.
    async fn current_position(&self, accuracy: Accuracy) -> Result<PositionFix, LocationError>;
}

/// Position acquisition errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Position unavailable: {0}")]
    Unavailable(String),

    #[error("Position request timed out")]
    Timeout,
}

/// Provider that walks a straight line from an origin, one step per fix.
pub struct SimulatedWalk {
    position: Mutex<(f64, f64)>,
    step: f64,
    permission: PermissionStatus,
}

impl SimulatedWalk {
    pub fn new(origin: (f64, f64), step: f64) -> Self {
        Self {
            position: Mutex::new(origin),
            step,
            permission: PermissionStatus::Granted,
        }
    }

    /// Make permission requests answer with `status`.
    pub fn with_permission(mut self, status: PermissionStatus) -> Self {
        self.permission = status;
        self
    }
}

#[async_trait]
impl LocationProvider for SimulatedWalk {
    async fn request_permission(&self) -> PermissionStatus {
        self.permission
    }

    async fn current_position(&self, accuracy: Accuracy) -> Result<PositionFix, LocationError> {
        if self.permission == PermissionStatus::Denied {
            return Err(LocationError::PermissionDenied);
        }

        let (lat, lng) = {
            let mut position = self.position.lock();
            position.0 = (position.0 + self.step).clamp(-90.0, 90.0);
            position.1 = (position.1 + self.step).clamp(-180.0, 180.0);
            *position
        };

        let radius = match accuracy {
            Accuracy::High => 5.0,
            Accuracy::Balanced => 25.0,
        };
        debug!(lat, lng, "Simulated position fix");
        Ok(PositionFix::new(lat, lng, Some(radius)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_walk_advances_each_fix() {
        let walk = SimulatedWalk::new((34.6794, -82.8351), 0.0001);

        let first = walk.current_position(Accuracy::High).await.unwrap();
        let second = walk.current_position(Accuracy::High).await.unwrap();

        assert!((first.latitude - 34.6795).abs() < 1e-9);
        assert!((second.longitude - -82.8349).abs() < 1e-9);
        assert_eq!(second.accuracy, Some(5.0));
    }

    #[tokio::test]
    async fn denied_walk_refuses_fixes() {
        let walk = SimulatedWalk::new((0.0, 0.0), 0.1).with_permission(PermissionStatus::Denied);

        assert_eq!(walk.request_permission().await, PermissionStatus::Denied);
        assert!(matches!(
            walk.current_position(Accuracy::High).await,
            Err(LocationError::PermissionDenied)
        ));
    }
}
