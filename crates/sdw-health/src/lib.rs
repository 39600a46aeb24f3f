//! Rolling per-source reliability classification from the sync log.

use chrono::{DateTime, Duration, Utc};
use sdw_core::{Source, SyncOutcome};
use sdw_storage::{DealStore, StoreError};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sdw-health";

/// Outcomes considered per source.
pub const HEALTH_WINDOW: usize = 10;
/// A source with no outcome inside this window is stale.
pub const STALENESS_HOURS: i64 = 48;

const NO_HISTORY_ISSUE: &str = "no scraping history available";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Healthy,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Healthy => "healthy",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub source_id: Uuid,
    pub source_name: String,
    pub severity: Severity,
    pub success_rate: f64,
    pub average_deals_found: f64,
    pub consecutive_failures: usize,
    pub last_outcome_at: Option<DateTime<Utc>>,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub severity: Severity,
    pub sources: Vec<SourceHealth>,
}

/// Classify one source from its most recent outcomes (newest first).
///
/// Severity only escalates as rules apply, never downgrades. A source with no
/// history is a warning, never healthy by default and never critical.
pub fn check_source_health(
    source: &Source,
    outcomes: &[SyncOutcome],
    now: DateTime<Utc>,
) -> SourceHealth {
    let window: Vec<&SyncOutcome> = outcomes.iter().take(HEALTH_WINDOW).collect();

    if window.is_empty() {
        return SourceHealth {
            source_id: source.id,
            source_name: source.name.clone(),
            severity: Severity::Warning,
            success_rate: 0.0,
            average_deals_found: 0.0,
            consecutive_failures: 0,
            last_outcome_at: None,
            issues: vec![NO_HISTORY_ISSUE.to_string()],
        };
    }

    let total = window.len();
    let successes = window.iter().filter(|o| o.counts_as_success()).count();
    let success_rate = successes as f64 / total as f64;
    let average_deals_found =
        window.iter().map(|o| f64::from(o.found)).sum::<f64>() / total as f64;
    let consecutive_failures = window.iter().take_while(|o| o.is_failed()).count();

    let mut severity = Severity::Healthy;
    let mut issues = Vec::new();

    if consecutive_failures >= 3 {
        severity = severity.max(Severity::Critical);
        issues.push(format!("{consecutive_failures} consecutive failed runs"));
    } else if consecutive_failures >= 2 {
        severity = severity.max(Severity::Warning);
        issues.push("2 consecutive failed runs".to_string());
    }

    if success_rate < 0.5 {
        severity = severity.max(Severity::Warning);
        issues.push(format!(
            "success rate {:.0}% over the last {total} runs",
            success_rate * 100.0
        ));
    }

    if total >= 6 {
        let newest_3 = window[..3].iter().map(|o| f64::from(o.found)).sum::<f64>() / 3.0;
        let prior_3 = window[3..6].iter().map(|o| f64::from(o.found)).sum::<f64>() / 3.0;
        if prior_3 > 0.0 && newest_3 <= prior_3 * 0.5 {
            severity = severity.max(Severity::Warning);
            issues.push(format!(
                "deals found dropped from {prior_3:.1} to {newest_3:.1} per run; source structure may have changed"
            ));
        }
    }

    let last_outcome_at = window[0].created_at;
    if now - last_outcome_at > Duration::hours(STALENESS_HOURS) {
        severity = severity.max(Severity::Warning);
        issues.push(format!("no sync within the last {STALENESS_HOURS} hours"));
    }

    SourceHealth {
        source_id: source.id,
        source_name: source.name.clone(),
        severity,
        success_rate,
        average_deals_found,
        consecutive_failures,
        last_outcome_at: Some(last_outcome_at),
        issues,
    }
}

/// Classify every active source and aggregate to the worst status: one
/// critical source makes the system critical, one warning (absent critical)
/// makes it warning.
pub async fn check_system_health(
    store: &dyn DealStore,
    now: DateTime<Utc>,
) -> Result<SystemHealth, StoreError> {
    let sources = store.list_sources(true).await?;
    let mut reports = Vec::with_capacity(sources.len());
    for source in &sources {
        let outcomes = store.recent_outcomes(source.id, HEALTH_WINDOW).await?;
        let health = check_source_health(source, &outcomes, now);
        if health.severity == Severity::Critical {
            warn!(
                source = %health.source_name,
                issues = ?health.issues,
                "source classified critical"
            );
        }
        reports.push(health);
    }
    let severity = reports
        .iter()
        .map(|h| h.severity)
        .max()
        .unwrap_or(Severity::Healthy);
    Ok(SystemHealth {
        severity,
        sources: reports,
    })
}
