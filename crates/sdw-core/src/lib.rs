//! Core domain model for Switch Deal Watch.

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sdw-core";

/// Business default applied when a deal page does not state a direct-debit count.
pub const DEFAULT_REQUIRED_DIRECT_DEBITS: i32 = 2;

/// Two money amounts are the same deal value within a penny.
const AMOUNT_TOLERANCE: f64 = 0.005;

/// An externally configured site polled for deal extraction.
///
/// Sources are created and edited by the admin collaborator; this engine only
/// reads them, runs extractions against them, and writes back last-run
/// metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub name: String,
    pub endpoint: String,
    /// Trust ranking. Higher always wins when reconciling same-named data.
    pub priority: i32,
    pub active: bool,
    pub extraction: ExtractionConfig,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<SyncStatus>,
    pub last_run_deal_count: Option<i64>,
}

/// Declarative extraction behavior for one source. Pure data, never code.
///
/// All three groups must be present for a source to be accepted; a config
/// that fails [`ExtractionConfig::validate`] is rejected at configuration
/// time, never discovered at scrape time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub selectors: SelectorConfig,
    pub parsing: ParsingConfig,
    pub options: FetchOptions,
}

/// CSS selectors locating the deal containers and their fields.
/// `reward`, `requirements` and `expiry` may be empty, in which case the
/// whole container text is used (or the field defaults apply).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub container: String,
    pub name: String,
    #[serde(default)]
    pub reward: String,
    #[serde(default)]
    pub requirements: String,
    #[serde(default)]
    pub expiry: String,
}

/// Regex sources for numeric field parsing plus an optional chrono format
/// hint (e.g. `%d %B %Y`) tried before the standard expiry formats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsingConfig {
    #[serde(default = "default_reward_pattern")]
    pub reward_pattern: String,
    #[serde(default = "default_direct_debits_pattern")]
    pub direct_debits_pattern: String,
    #[serde(default = "default_pay_in_pattern")]
    pub pay_in_pattern: String,
    #[serde(default)]
    pub date_format_hint: Option<String>,
}

fn default_reward_pattern() -> String {
    r"£?\s*([0-9][0-9,]*(?:\.[0-9]{1,2})?)".to_string()
}

fn default_direct_debits_pattern() -> String {
    r"(?i)(\d+)\s+(?:active\s+)?direct\s+debits?".to_string()
}

fn default_pay_in_pattern() -> String {
    r"(?i)pay\s+in\s+£?\s*([0-9][0-9,]*(?:\.[0-9]{1,2})?)".to_string()
}

impl Default for ParsingConfig {
    fn default() -> Self {
        Self {
            reward_pattern: default_reward_pattern(),
            direct_debits_pattern: default_direct_debits_pattern(),
            pay_in_pattern: default_pay_in_pattern(),
            date_format_hint: None,
        }
    }
}

/// Per-source fetch behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOptions {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

fn default_user_agent() -> String {
    "sdw-bot/0.1".to_string()
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_retry_attempts() -> u32 {
    3
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_ms: default_timeout_ms(),
            retry_attempts: default_retry_attempts(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("selector group is missing a {0} selector")]
    MissingSelector(&'static str),
    #[error("parsing pattern {field} does not compile: {source}")]
    InvalidPattern {
        field: &'static str,
        source: regex::Error,
    },
    #[error("timeout of {0}ms is outside the accepted 1..=120000ms range")]
    TimeoutOutOfRange(u64),
    #[error("retry attempts of {0} exceeds the accepted maximum of 10")]
    RetriesOutOfRange(u32),
}

impl ExtractionConfig {
    /// Structural validation, run when a source is accepted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.selectors.container.trim().is_empty() {
            return Err(ConfigError::MissingSelector("container"));
        }
        if self.selectors.name.trim().is_empty() {
            return Err(ConfigError::MissingSelector("name"));
        }
        for (field, pattern) in [
            ("reward_pattern", &self.parsing.reward_pattern),
            ("direct_debits_pattern", &self.parsing.direct_debits_pattern),
            ("pay_in_pattern", &self.parsing.pay_in_pattern),
        ] {
            Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern { field, source })?;
        }
        if self.options.timeout_ms == 0 || self.options.timeout_ms > 120_000 {
            return Err(ConfigError::TimeoutOutOfRange(self.options.timeout_ms));
        }
        if self.options.retry_attempts > 10 {
            return Err(ConfigError::RetriesOutOfRange(self.options.retry_attempts));
        }
        Ok(())
    }
}

/// Ephemeral per-run extraction result, discarded after the merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealDraft {
    pub name: String,
    pub reward_amount: f64,
    pub required_direct_debits: i32,
    pub min_pay_in: f64,
    pub debit_card_transactions: i32,
    pub time_to_payout: String,
    pub expiry_date: Option<NaiveDate>,
    pub source_id: Uuid,
    pub source_name: String,
    pub source_priority: i32,
    /// Raw container text kept for diagnostics only.
    pub raw_text: String,
}

/// The single reconciled, persisted representation of an offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: Uuid,
    /// Unique match key, compared case-insensitively via [`normalize_name`].
    pub name: String,
    pub reward_amount: f64,
    pub required_direct_debits: i32,
    pub min_pay_in: f64,
    pub debit_card_transactions: i32,
    pub expiry_date: Option<NaiveDate>,
    pub time_to_payout: String,
    pub active: bool,
    pub current_source_name: String,
    pub current_source_priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    pub fn from_draft(draft: &DealDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: draft.name.clone(),
            reward_amount: draft.reward_amount,
            required_direct_debits: draft.required_direct_debits,
            min_pay_in: draft.min_pay_in,
            debit_card_transactions: draft.debit_card_transactions,
            expiry_date: draft.expiry_date,
            time_to_payout: draft.time_to_payout.clone(),
            active: true,
            current_source_name: draft.source_name.clone(),
            current_source_priority: draft.source_priority,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    /// Overwrite canonical fields with the draft's values and record the
    /// draft's source as the current winner. Re-sighting reactivates.
    pub fn apply_draft(&mut self, draft: &DealDraft, now: DateTime<Utc>) {
        self.reward_amount = draft.reward_amount;
        self.required_direct_debits = draft.required_direct_debits;
        self.min_pay_in = draft.min_pay_in;
        self.debit_card_transactions = draft.debit_card_transactions;
        self.expiry_date = draft.expiry_date;
        self.time_to_payout = draft.time_to_payout.clone();
        self.active = true;
        self.current_source_name = draft.source_name.clone();
        self.current_source_priority = draft.source_priority;
        self.updated_at = now;
    }
}

/// Case-insensitive, whitespace-folded match key.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn amounts_differ(a: f64, b: f64) -> bool {
    (a - b).abs() > AMOUNT_TOLERANCE
}

/// The fixed material-field set: a difference on any of these constitutes a
/// conflict and justifies a canonical update.
pub fn material_fields_differ(deal: &Deal, draft: &DealDraft) -> bool {
    amounts_differ(deal.reward_amount, draft.reward_amount)
        || deal.required_direct_debits != draft.required_direct_debits
        || amounts_differ(deal.min_pay_in, draft.min_pay_in)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Partial,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Partial => "partial",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(SyncStatus::Success),
            "partial" => Some(SyncStatus::Partial),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// Append-only log row, written once per (source, run). The sole substrate
/// for health scoring; never mutated after the write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub id: Uuid,
    pub source_id: Uuid,
    pub source_name: String,
    pub found: i32,
    pub added: i32,
    pub updated: i32,
    pub deactivated: i32,
    pub status: SyncStatus,
    pub errors: Vec<String>,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

impl SyncOutcome {
    pub fn is_failed(&self) -> bool {
        self.status == SyncStatus::Failed
    }

    /// An outcome counts toward the success rate when it produced no errors,
    /// or produced errors but still found deals.
    pub fn counts_as_success(&self) -> bool {
        self.errors.is_empty() || self.found > 0
    }
}

/// Status derivation shared by every writer of the sync log.
pub fn status_for(errors: &[String], found: i32) -> SyncStatus {
    if errors.is_empty() {
        SyncStatus::Success
    } else if found > 0 {
        SyncStatus::Partial
    } else {
        SyncStatus::Failed
    }
}

/// One side of a detected disagreement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictSide {
    pub deal_id: Uuid,
    pub deal_name: String,
    pub source_name: String,
    pub source_priority: i32,
    pub reward_amount: f64,
    pub required_direct_debits: i32,
    pub min_pay_in: f64,
}

impl ConflictSide {
    pub fn of(deal: &Deal) -> Self {
        Self {
            deal_id: deal.id,
            deal_name: deal.name.clone(),
            source_name: deal.current_source_name.clone(),
            source_priority: deal.current_source_priority,
            reward_amount: deal.reward_amount,
            required_direct_debits: deal.required_direct_debits,
            min_pay_in: deal.min_pay_in,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ConflictResolution {
    Unresolved,
    ResolvedByPriority { at: DateTime<Utc> },
    ResolvedManually { resolver: String, at: DateTime<Utc> },
}

/// A detected disagreement between two same-named records, derived on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// `{primary_deal_id}:{secondary_deal_id}`.
    pub id: String,
    pub normalized_name: String,
    /// Material field names that differ between the two sides.
    pub differing_fields: Vec<String>,
    /// The top-priority side of the pair.
    pub primary: ConflictSide,
    pub secondary: ConflictSide,
    pub resolution: ConflictResolution,
}

impl Conflict {
    pub fn conflict_id(primary: Uuid, secondary: Uuid) -> String {
        format!("{primary}:{secondary}")
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self.resolution, ConflictResolution::Unresolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ExtractionConfig {
        ExtractionConfig {
            selectors: SelectorConfig {
                container: ".deal-card".to_string(),
                name: ".deal-name".to_string(),
                reward: ".reward".to_string(),
                requirements: ".requirements".to_string(),
                expiry: ".expiry".to_string(),
            },
            parsing: ParsingConfig::default(),
            options: FetchOptions::default(),
        }
    }

    #[test]
    fn default_config_validates() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn empty_container_selector_is_rejected() {
        let mut cfg = config();
        cfg.selectors.container = "  ".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingSelector("container"))
        ));
    }

    #[test]
    fn non_compiling_pattern_is_rejected() {
        let mut cfg = config();
        cfg.parsing.reward_pattern = "([0-9".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidPattern {
                field: "reward_pattern",
                ..
            })
        ));
    }

    #[test]
    fn out_of_range_options_are_rejected() {
        let mut cfg = config();
        cfg.options.timeout_ms = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::TimeoutOutOfRange(0))));

        let mut cfg = config();
        cfg.options.retry_attempts = 50;
        assert!(matches!(cfg.validate(), Err(ConfigError::RetriesOutOfRange(50))));
    }

    #[test]
    fn normalized_names_fold_case_and_whitespace() {
        assert_eq!(normalize_name("  HSBC   Advance "), "hsbc advance");
        assert_eq!(normalize_name("Halifax"), normalize_name("HALIFAX"));
    }

    #[test]
    fn material_diff_ignores_sub_penny_noise() {
        let draft = DealDraft {
            name: "Halifax".to_string(),
            reward_amount: 150.0,
            required_direct_debits: 2,
            min_pay_in: 1500.0,
            debit_card_transactions: 0,
            time_to_payout: String::new(),
            expiry_date: None,
            source_id: Uuid::new_v4(),
            source_name: "a".to_string(),
            source_priority: 5,
            raw_text: String::new(),
        };
        let mut deal = Deal::from_draft(&draft, Utc::now());
        deal.reward_amount = 150.0001;
        assert!(!material_fields_differ(&deal, &draft));
        deal.reward_amount = 125.0;
        assert!(material_fields_differ(&deal, &draft));
    }

    #[test]
    fn status_derivation_matches_log_semantics() {
        assert_eq!(status_for(&[], 5), SyncStatus::Success);
        assert_eq!(status_for(&["boom".to_string()], 5), SyncStatus::Partial);
        assert_eq!(status_for(&["boom".to_string()], 0), SyncStatus::Failed);
    }

    #[test]
    fn conflict_id_round_trip_shape() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let id = Conflict::conflict_id(a, b);
        let parts: Vec<_> = id.split(':').collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].parse::<Uuid>().unwrap(), a);
        assert_eq!(parts[1].parse::<Uuid>().unwrap(), b);
    }
}
