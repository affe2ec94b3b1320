use console::style;
use strata_orm::{DatabaseStatus, HealthStatus, ManagedPool, PoolHealthReport};

/// Check the database through the pool and print a health report.
///
/// The report is printed either way; the command fails when the database is
/// unreachable.
pub async fn run(pool: &ManagedPool, json: bool) -> anyhow::Result<()> {
    let report = pool.detailed_health_check().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report.snapshot())?);
    } else {
        print!("{}", render_health(&report));
    }

    if let HealthStatus::Unhealthy { reason } = report.status() {
        anyhow::bail!("Database is unhealthy: {}", reason);
    }
    Ok(())
}

pub fn render_health(report: &PoolHealthReport) -> String {
    let status = report.status();
    let status_line = match &status {
        HealthStatus::Healthy => style(status.to_string()).green(),
        HealthStatus::Degraded { .. } => style(status.to_string()).yellow(),
        HealthStatus::Unhealthy { .. } => style(status.to_string()).red(),
    };
    let database = match report.database {
        DatabaseStatus::Connected => "connected",
        DatabaseStatus::Disconnected => "disconnected",
    };

    let mut out = String::new();
    out.push_str(&format!("{}\n\n", style("=== Database Health ===").bold()));
    out.push_str(&format!("Status:        {}\n", status_line));
    out.push_str(&format!("Database:      {}\n", database));
    if let Some(ms) = report.response_time_ms() {
        out.push_str(&format!("Response time: {:.2}ms\n", ms));
    }
    let pool = &report.pool;
    out.push_str(&format!(
        "Connections:   {} active, {} idle, {} max ({:.0}% in use)\n",
        pool.active_connections,
        pool.idle_connections,
        pool.max_connections,
        pool.utilization()
    ));
    out.push_str(&format!(
        "Acquires:      {} ({} errors, {:.1}%)\n",
        pool.acquire_count,
        pool.acquire_errors,
        pool.error_rate()
    ));
    out
}
