//! Connection Management
//!
//! Managed pooling over a backend pool, per-statement logging, health monitoring
//! and pool statistics.

pub mod health;
pub mod pool;
pub mod statistics;

// Re-export for convenience
pub use health::*;
pub use pool::*;
pub use statistics::*;
