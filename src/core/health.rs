use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::clock::SharedClock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Liveness of each periodic component, as last reported by its own cycle.
#[derive(Clone)]
pub struct HealthChecker {
    start_time: std::time::Instant,
    clock: SharedClock,
    status: Arc<RwLock<BTreeMap<String, ComponentHealth>>>,
}

impl HealthChecker {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            start_time: std::time::Instant::now(),
            clock,
            status: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub async fn get_status(&self) -> HealthStatus {
        let components = self.status.read().await.clone();
        let all_healthy = components.values().all(|c| c.healthy);

        HealthStatus {
            status: if all_healthy {
                "healthy".to_string()
            } else {
                "degraded".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            components,
        }
    }

    pub async fn record_success(&self, component: &str) {
        let now = self.clock.now();
        let mut status = self.status.write().await;
        let entry = status
            .entry(component.to_string())
            .or_insert_with(|| ComponentHealth {
                healthy: true,
                last_success: None,
                last_error: None,
            });
        entry.healthy = true;
        entry.last_success = Some(now);
    }

    pub async fn record_failure(&self, component: &str, error: &str) {
        let mut status = self.status.write().await;
        let entry = status
            .entry(component.to_string())
            .or_insert_with(|| ComponentHealth {
                healthy: false,
                last_success: None,
                last_error: None,
            });
        entry.healthy = false;
        entry.last_error = Some(error.to_string());
    }

    pub async fn component(&self, component: &str) -> Option<ComponentHealth> {
        self.status.read().await.get(component).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::SystemClock;

    #[tokio::test]
    async fn test_degraded_after_failure() {
        let checker = HealthChecker::new(Arc::new(SystemClock));
        checker.record_success("calibration").await;
        assert_eq!(checker.get_status().await.status, "healthy");

        checker.record_failure("retention", "archive unavailable").await;
        let status = checker.get_status().await;
        assert_eq!(status.status, "degraded");
        assert_eq!(
            status.components["retention"].last_error.as_deref(),
            Some("archive unavailable")
        );

        checker.record_success("retention").await;
        assert_eq!(checker.get_status().await.status, "healthy");
    }

    #[test]
    fn test_empty_checker_is_healthy() {
        let checker = HealthChecker::new(Arc::new(SystemClock));
        let status = tokio_test::block_on(checker.get_status());
        assert_eq!(status.status, "healthy");
        assert!(status.components.is_empty());
        assert!(tokio_test::block_on(checker.component("fusion")).is_none());
    }
}
