//! Database Health Reporting
//!
//! A health check never fails. An unreachable database is reported as
//! `disconnected` with no response time, next to the pool's usage figures.

use super::statistics::PoolStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Round trips slower than this mark the database as degraded
pub const SLOW_RESPONSE: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseStatus {
    Connected,
    Disconnected,
}

/// Result of leasing a connection and pinging the server through it
#[derive(Debug, Clone)]
pub struct PoolHealthReport {
    pub database: DatabaseStatus,
    /// Lease plus ping time; `None` when the database could not be reached
    pub response_time: Option<Duration>,
    /// Why the database could not be reached
    pub error: Option<String>,
    pub pool: PoolStats,
    pub checked_at: DateTime<Utc>,
}

impl PoolHealthReport {
    pub fn connected(response_time: Duration, pool: PoolStats) -> Self {
        Self {
            database: DatabaseStatus::Connected,
            response_time: Some(response_time),
            error: None,
            pool,
            checked_at: Utc::now(),
        }
    }

    pub fn disconnected(error: impl Into<String>, pool: PoolStats) -> Self {
        Self {
            database: DatabaseStatus::Disconnected,
            response_time: None,
            error: Some(error.into()),
            pool,
            checked_at: Utc::now(),
        }
    }

    pub fn status(&self) -> HealthStatus {
        if self.database == DatabaseStatus::Disconnected {
            let reason = self
                .error
                .clone()
                .unwrap_or_else(|| "Database is unreachable".to_string());
            return HealthStatus::Unhealthy { reason };
        }

        match self.response_time {
            Some(elapsed) if elapsed >= SLOW_RESPONSE => HealthStatus::Degraded {
                reason: format!("Slow response: {}ms", elapsed.as_millis()),
            },
            _ if self.pool.active_connections >= self.pool.max_connections => {
                HealthStatus::Degraded {
                    reason: format!("All {} connections are leased", self.pool.max_connections),
                }
            }
            _ => HealthStatus::Healthy,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    pub fn response_time_ms(&self) -> Option<f64> {
        self.response_time.map(|elapsed| elapsed.as_micros() as f64 / 1000.0)
    }

    /// Serializable view for machine-readable output
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: self.status().label(),
            timestamp: self.checked_at,
            uptime: self.pool.uptime().as_secs(),
            database: DatabaseSnapshot {
                status: self.database,
                response_time: self.response_time_ms(),
                error: self.error.clone(),
            },
            pool: PoolSnapshot {
                size: self.pool.size,
                max: self.pool.max_connections,
                active: self.pool.active_connections,
                idle: self.pool.idle_connections,
                acquires: self.pool.acquire_count,
                acquire_errors: self.pool.acquire_errors,
                error_rate: self.pool.error_rate(),
            },
        }
    }
}

/// JSON shape of a [`PoolHealthReport`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    /// Pool uptime in seconds
    pub uptime: u64,
    pub database: DatabaseSnapshot,
    pub pool: PoolSnapshot,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSnapshot {
    pub status: DatabaseStatus,
    /// Milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub size: u32,
    pub max: u32,
    pub active: u32,
    pub idle: u32,
    pub acquires: u64,
    pub acquire_errors: u64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Reachable, but slow or saturated
    Degraded { reason: String },
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn label(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded { .. } => "degraded",
            HealthStatus::Unhealthy { .. } => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded { reason } | HealthStatus::Unhealthy { reason } => {
                write!(f, "{} ({})", self.label(), reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn stats(active: u32) -> PoolStats {
        PoolStats {
            max_connections: 4,
            size: active + 1,
            active_connections: active,
            idle_connections: 1,
            acquire_count: 10,
            acquire_errors: 0,
            created_at: Instant::now(),
        }
    }

    #[test]
    fn test_connected_database_is_healthy() {
        let report = PoolHealthReport::connected(Duration::from_millis(3), stats(0));
        assert!(report.is_healthy());

        let json = serde_json::to_value(report.snapshot()).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["database"]["status"], "connected");
        assert_eq!(json["database"]["responseTime"], 3.0);
        assert!(json["database"].get("error").is_none());
        assert_eq!(json["pool"]["acquireErrors"], 0);
    }

    #[test]
    fn test_disconnected_database_is_unhealthy() {
        let report = PoolHealthReport::disconnected("Database connection error", stats(0));

        assert_eq!(
            report.status(),
            HealthStatus::Unhealthy {
                reason: "Database connection error".to_string()
            }
        );
        let json = serde_json::to_value(report.snapshot()).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["database"]["status"], "disconnected");
        assert!(json["database"].get("responseTime").is_none());
    }

    #[test]
    fn test_slow_or_saturated_pool_is_degraded() {
        let slow = PoolHealthReport::connected(Duration::from_millis(1500), stats(0));
        assert_eq!(slow.status().to_string(), "degraded (Slow response: 1500ms)");

        let saturated = PoolHealthReport::connected(Duration::from_millis(2), stats(4));
        assert_eq!(saturated.status().label(), "degraded");
        assert!(!saturated.is_healthy());
    }
}
