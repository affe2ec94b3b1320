//! Connection Pool Statistics

use std::time::{Duration, Instant};

/// Point-in-time pool counters
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub max_connections: u32,
    /// Open connections reported by the backend, leased or idle
    pub size: u32,
    /// Connections currently leased out
    pub active_connections: u32,
    pub idle_connections: u32,
    pub acquire_count: u64,
    pub acquire_errors: u64,
    pub created_at: Instant,
}

impl PoolStats {
    /// Failed acquires as a percentage of all acquires
    pub fn error_rate(&self) -> f64 {
        if self.acquire_count > 0 {
            (self.acquire_errors as f64 / self.acquire_count as f64) * 100.0
        } else {
            0.0
        }
    }

    /// Leased connections as a percentage of the pool bound
    pub fn utilization(&self) -> f64 {
        if self.max_connections > 0 {
            (self.active_connections as f64 / self.max_connections as f64) * 100.0
        } else {
            0.0
        }
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(active: u32, idle: u32, acquires: u64, errors: u64) -> PoolStats {
        PoolStats {
            max_connections: 10,
            size: active + idle,
            active_connections: active,
            idle_connections: idle,
            acquire_count: acquires,
            acquire_errors: errors,
            created_at: Instant::now(),
        }
    }

    #[test]
    fn test_rates() {
        let s = stats(8, 1, 20, 1);
        assert!((s.error_rate() - 5.0).abs() < f64::EPSILON);
        assert!((s.utilization() - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_pool_has_no_rates() {
        let s = stats(0, 0, 0, 0);
        assert_eq!(s.error_rate(), 0.0);
        assert_eq!(s.utilization(), 0.0);
    }
}
