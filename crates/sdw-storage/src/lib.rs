//! Canonical store, raw-page snapshots and HTTP fetch for Switch Deal Watch.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, StatusCode};
use sdw_core::{Deal, ExtractionConfig, FetchOptions, Source, SyncOutcome, SyncStatus};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sdw-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("source {0} not found")]
    SourceNotFound(Uuid),
    #[error("deal {0} not found")]
    DealNotFound(Uuid),
    #[error("stored extraction config for source {source_id} is corrupt: {cause}")]
    CorruptConfig { source_id: Uuid, cause: String },
}

/// Single-record read/match/write access to the canonical store.
///
/// There is no run-scoped transaction: each operation is atomic on its own,
/// so a crash mid-run leaves the store valid but partially updated.
#[async_trait]
pub trait DealStore: Send + Sync {
    async fn list_sources(&self, only_active: bool) -> Result<Vec<Source>, StoreError>;
    async fn get_source(&self, id: Uuid) -> Result<Source, StoreError>;
    async fn find_source_by_name(&self, name: &str) -> Result<Option<Source>, StoreError>;
    async fn upsert_source(&self, source: &Source) -> Result<(), StoreError>;
    async fn record_source_run(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        status: SyncStatus,
        deal_count: i64,
    ) -> Result<(), StoreError>;

    async fn list_deals(&self) -> Result<Vec<Deal>, StoreError>;
    async fn get_deal(&self, id: Uuid) -> Result<Option<Deal>, StoreError>;
    /// Match by normalized name. When same-named rows coexist (repairable via
    /// the conflict resolver), the highest-priority row wins the match.
    async fn find_deal_by_name(&self, normalized: &str) -> Result<Option<Deal>, StoreError>;
    async fn insert_deal(&self, deal: &Deal) -> Result<(), StoreError>;
    async fn update_deal(&self, deal: &Deal) -> Result<(), StoreError>;

    /// Append one immutable row to the sync log.
    async fn append_outcome(&self, outcome: &SyncOutcome) -> Result<(), StoreError>;
    /// Most recent outcomes for a source, newest first.
    async fn recent_outcomes(
        &self,
        source_id: Uuid,
        limit: usize,
    ) -> Result<Vec<SyncOutcome>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// In-process [`DealStore`] with the same semantics as the Postgres store.
/// The test substrate, and useful for fixture-driven local runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryDealStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    sources: Vec<Source>,
    deals: Vec<Deal>,
    log: Vec<SyncOutcome>,
}

impl MemoryDealStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DealStore for MemoryDealStore {
    async fn list_sources(&self, only_active: bool) -> Result<Vec<Source>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .sources
            .iter()
            .filter(|s| !only_active || s.active)
            .cloned()
            .collect())
    }

    async fn get_source(&self, id: Uuid) -> Result<Source, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        inner
            .sources
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or(StoreError::SourceNotFound(id))
    }

    async fn find_source_by_name(&self, name: &str) -> Result<Option<Source>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .sources
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn upsert_source(&self, source: &Source) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        match inner.sources.iter_mut().find(|s| s.id == source.id) {
            Some(existing) => *existing = source.clone(),
            None => inner.sources.push(source.clone()),
        }
        Ok(())
    }

    async fn record_source_run(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        status: SyncStatus,
        deal_count: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let source = inner
            .sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StoreError::SourceNotFound(id))?;
        source.last_run_at = Some(at);
        source.last_run_status = Some(status);
        source.last_run_deal_count = Some(deal_count);
        Ok(())
    }

    async fn list_deals(&self) -> Result<Vec<Deal>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.deals.clone())
    }

    async fn get_deal(&self, id: Uuid) -> Result<Option<Deal>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.deals.iter().find(|d| d.id == id).cloned())
    }

    async fn find_deal_by_name(&self, normalized: &str) -> Result<Option<Deal>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .deals
            .iter()
            .filter(|d| d.normalized_name() == normalized)
            .max_by_key(|d| (d.current_source_priority, d.updated_at))
            .cloned())
    }

    async fn insert_deal(&self, deal: &Deal) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.deals.push(deal.clone());
        Ok(())
    }

    async fn update_deal(&self, deal: &Deal) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let existing = inner
            .deals
            .iter_mut()
            .find(|d| d.id == deal.id)
            .ok_or(StoreError::DealNotFound(deal.id))?;
        *existing = deal.clone();
        Ok(())
    }

    async fn append_outcome(&self, outcome: &SyncOutcome) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.log.push(outcome.clone());
        Ok(())
    }

    async fn recent_outcomes(
        &self,
        source_id: Uuid,
        limit: usize,
    ) -> Result<Vec<SyncOutcome>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .log
            .iter()
            .rev()
            .filter(|o| o.source_id == source_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgDealStore {
    pool: PgPool,
}

impl PgDealStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!().run(&self.pool).await?;
        Ok(())
    }

    fn source_from_row(row: &sqlx::postgres::PgRow) -> Result<Source, StoreError> {
        let id: Uuid = row.try_get("id")?;
        let config_json: serde_json::Value = row.try_get("extraction_config")?;
        let extraction: ExtractionConfig =
            serde_json::from_value(config_json).map_err(|e| StoreError::CorruptConfig {
                source_id: id,
                cause: e.to_string(),
            })?;
        let last_run_status: Option<String> = row.try_get("last_run_status")?;
        Ok(Source {
            id,
            name: row.try_get("name")?,
            endpoint: row.try_get("endpoint")?,
            priority: row.try_get("priority")?,
            active: row.try_get("active")?,
            extraction,
            last_run_at: row.try_get("last_run_at")?,
            last_run_status: last_run_status.as_deref().and_then(SyncStatus::parse),
            last_run_deal_count: row.try_get("last_run_deal_count")?,
        })
    }

    fn deal_from_row(row: &sqlx::postgres::PgRow) -> Result<Deal, StoreError> {
        Ok(Deal {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            reward_amount: row.try_get("reward_amount")?,
            required_direct_debits: row.try_get("required_direct_debits")?,
            min_pay_in: row.try_get("min_pay_in")?,
            debit_card_transactions: row.try_get("debit_card_transactions")?,
            expiry_date: row.try_get("expiry_date")?,
            time_to_payout: row.try_get("time_to_payout")?,
            active: row.try_get("active")?,
            current_source_name: row.try_get("current_source_name")?,
            current_source_priority: row.try_get("current_source_priority")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn outcome_from_row(row: &sqlx::postgres::PgRow) -> Result<SyncOutcome, StoreError> {
        let status: String = row.try_get("status")?;
        let errors: String = row.try_get("errors")?;
        Ok(SyncOutcome {
            id: row.try_get("id")?,
            source_id: row.try_get("source_id")?,
            source_name: row.try_get("source_name")?,
            found: row.try_get("found")?,
            added: row.try_get("added")?,
            updated: row.try_get("updated")?,
            deactivated: row.try_get("deactivated")?,
            status: SyncStatus::parse(&status).unwrap_or(SyncStatus::Failed),
            errors: errors
                .split('\n')
                .filter(|l| !l.is_empty())
                .map(ToString::to_string)
                .collect(),
            duration_ms: row.try_get("duration_ms")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl DealStore for PgDealStore {
    async fn list_sources(&self, only_active: bool) -> Result<Vec<Source>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, endpoint, priority, active, extraction_config,
                   last_run_at, last_run_status, last_run_deal_count
              FROM sources
             WHERE active OR NOT $1
             ORDER BY priority DESC, name
            "#,
        )
        .bind(only_active)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::source_from_row).collect()
    }

    async fn get_source(&self, id: Uuid) -> Result<Source, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, endpoint, priority, active, extraction_config,
                   last_run_at, last_run_status, last_run_deal_count
              FROM sources
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Self::source_from_row(&row),
            None => Err(StoreError::SourceNotFound(id)),
        }
    }

    async fn find_source_by_name(&self, name: &str) -> Result<Option<Source>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, endpoint, priority, active, extraction_config,
                   last_run_at, last_run_status, last_run_deal_count
              FROM sources
             WHERE lower(name) = lower($1)
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::source_from_row).transpose()
    }

    async fn upsert_source(&self, source: &Source) -> Result<(), StoreError> {
        let config_json = serde_json::to_value(&source.extraction).map_err(|e| {
            StoreError::CorruptConfig {
                source_id: source.id,
                cause: e.to_string(),
            }
        })?;
        sqlx::query(
            r#"
            INSERT INTO sources (id, name, endpoint, priority, active, extraction_config,
                                 last_run_at, last_run_status, last_run_deal_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE
               SET name = EXCLUDED.name,
                   endpoint = EXCLUDED.endpoint,
                   priority = EXCLUDED.priority,
                   active = EXCLUDED.active,
                   extraction_config = EXCLUDED.extraction_config
            "#,
        )
        .bind(source.id)
        .bind(&source.name)
        .bind(&source.endpoint)
        .bind(source.priority)
        .bind(source.active)
        .bind(config_json)
        .bind(source.last_run_at)
        .bind(source.last_run_status.map(|s| s.as_str()))
        .bind(source.last_run_deal_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_source_run(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        status: SyncStatus,
        deal_count: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sources
               SET last_run_at = $2,
                   last_run_status = $3,
                   last_run_deal_count = $4
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(status.as_str())
        .bind(deal_count)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SourceNotFound(id));
        }
        Ok(())
    }

    async fn list_deals(&self) -> Result<Vec<Deal>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, reward_amount, required_direct_debits, min_pay_in,
                   debit_card_transactions, expiry_date, time_to_payout, active,
                   current_source_name, current_source_priority, created_at, updated_at
              FROM deals
             ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::deal_from_row).collect()
    }

    async fn get_deal(&self, id: Uuid) -> Result<Option<Deal>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, reward_amount, required_direct_debits, min_pay_in,
                   debit_card_transactions, expiry_date, time_to_payout, active,
                   current_source_name, current_source_priority, created_at, updated_at
              FROM deals
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::deal_from_row).transpose()
    }

    async fn find_deal_by_name(&self, normalized: &str) -> Result<Option<Deal>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, reward_amount, required_direct_debits, min_pay_in,
                   debit_card_transactions, expiry_date, time_to_payout, active,
                   current_source_name, current_source_priority, created_at, updated_at
              FROM deals
             WHERE normalized_name = $1
             ORDER BY current_source_priority DESC, updated_at DESC
             LIMIT 1
            "#,
        )
        .bind(normalized)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::deal_from_row).transpose()
    }

    async fn insert_deal(&self, deal: &Deal) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO deals (id, name, normalized_name, reward_amount, required_direct_debits,
                               min_pay_in, debit_card_transactions, expiry_date, time_to_payout,
                               active, current_source_name, current_source_priority,
                               created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(deal.id)
        .bind(&deal.name)
        .bind(deal.normalized_name())
        .bind(deal.reward_amount)
        .bind(deal.required_direct_debits)
        .bind(deal.min_pay_in)
        .bind(deal.debit_card_transactions)
        .bind(deal.expiry_date)
        .bind(&deal.time_to_payout)
        .bind(deal.active)
        .bind(&deal.current_source_name)
        .bind(deal.current_source_priority)
        .bind(deal.created_at)
        .bind(deal.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_deal(&self, deal: &Deal) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE deals
               SET name = $2,
                   normalized_name = $3,
                   reward_amount = $4,
                   required_direct_debits = $5,
                   min_pay_in = $6,
                   debit_card_transactions = $7,
                   expiry_date = $8,
                   time_to_payout = $9,
                   active = $10,
                   current_source_name = $11,
                   current_source_priority = $12,
                   updated_at = $13
             WHERE id = $1
            "#,
        )
        .bind(deal.id)
        .bind(&deal.name)
        .bind(deal.normalized_name())
        .bind(deal.reward_amount)
        .bind(deal.required_direct_debits)
        .bind(deal.min_pay_in)
        .bind(deal.debit_card_transactions)
        .bind(deal.expiry_date)
        .bind(&deal.time_to_payout)
        .bind(deal.active)
        .bind(&deal.current_source_name)
        .bind(deal.current_source_priority)
        .bind(deal.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::DealNotFound(deal.id));
        }
        Ok(())
    }

    async fn append_outcome(&self, outcome: &SyncOutcome) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_log (id, source_id, source_name, found, added, updated,
                                  deactivated, status, errors, duration_ms, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(outcome.id)
        .bind(outcome.source_id)
        .bind(&outcome.source_name)
        .bind(outcome.found)
        .bind(outcome.added)
        .bind(outcome.updated)
        .bind(outcome.deactivated)
        .bind(outcome.status.as_str())
        .bind(outcome.errors.join("\n"))
        .bind(outcome.duration_ms)
        .bind(outcome.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_outcomes(
        &self,
        source_id: Uuid,
        limit: usize,
    ) -> Result<Vec<SyncOutcome>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_id, source_name, found, added, updated, deactivated,
                   status, errors, duration_ms, created_at
              FROM sync_log
             WHERE source_id = $1
             ORDER BY created_at DESC
             LIMIT $2
            "#,
        )
        .bind(source_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::outcome_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Raw-page snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed snapshots of raw fetched pages, kept so a
/// suspicious extraction can be replayed against the exact document it saw.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn extension_for(content_type: &str) -> &'static str {
        match content_type.split(';').next().unwrap_or("").trim() {
            "text/html" => "html",
            "application/json" => "json",
            "text/plain" => "txt",
            _ => "bin",
        }
    }

    fn snapshot_relative_path(
        source_name: &str,
        fetched_at: DateTime<Utc>,
        content_hash: &str,
        content_type: &str,
    ) -> PathBuf {
        let slug = source_name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect::<String>();
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(slug.trim_matches('-')).join(stamp).join(format!(
            "{content_hash}.{}",
            Self::extension_for(content_type)
        ))
    }

    /// Store a fetched page immutably: hash-addressed path, atomic temp-file
    /// rename, dedupe on identical content.
    pub async fn store_page(
        &self,
        source_name: &str,
        fetched_at: DateTime<Utc>,
        content_type: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            Self::snapshot_relative_path(source_name, fetched_at, &content_hash, content_type);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating snapshot directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            debug!(source = source_name, hash = %content_hash, "snapshot already stored");
            return Ok(StoredSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = absolute_path
            .parent()
            .unwrap_or(&self.root)
            .join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredSnapshot {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp snapshot {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP fetch with retry/backoff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_transport_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Exponential in the attempt index, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after {attempts} attempt(s): {source}")]
    Transport { attempts: u32, source: reqwest::Error },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
}

/// One fetched document, body decoded as text.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub requested_url: String,
    pub final_url: String,
    pub status: u16,
    pub content_type: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

/// Retrying fetcher built per source from its [`FetchOptions`].
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn for_options(options: &FetchOptions) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_millis(options.timeout_ms))
            .user_agent(options.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: BackoffPolicy::with_retries(options.retry_attempts),
        })
    }

    /// Fetch one document, retrying retryable failures with capped
    /// exponential backoff. The error carries the last underlying cause once
    /// retries are exhausted.
    pub async fn fetch(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        let mut attempt: u32 = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("text/html")
                            .to_string();
                        let body = resp.text().await.map_err(|source| FetchError::Transport {
                            attempts: attempt + 1,
                            source,
                        })?;
                        return Ok(FetchedDocument {
                            requested_url: url.to_string(),
                            final_url,
                            status: status.as_u16(),
                            content_type,
                            body,
                            fetched_at: Utc::now(),
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(url, status = status.as_u16(), attempt, "retrying fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Status {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_transport_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(url, attempt, error = %err, "retrying fetch after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Transport {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sdw_core::{DealDraft, ExtractionConfig, FetchOptions, ParsingConfig, SelectorConfig};
    use tempfile::tempdir;

    fn sample_source(name: &str, priority: i32) -> Source {
        Source {
            id: Uuid::new_v4(),
            name: name.to_string(),
            endpoint: format!("https://example.test/{name}"),
            priority,
            active: true,
            extraction: ExtractionConfig {
                selectors: SelectorConfig {
                    container: ".deal".to_string(),
                    name: ".name".to_string(),
                    reward: String::new(),
                    requirements: String::new(),
                    expiry: String::new(),
                },
                parsing: ParsingConfig::default(),
                options: FetchOptions::default(),
            },
            last_run_at: None,
            last_run_status: None,
            last_run_deal_count: None,
        }
    }

    fn sample_draft(name: &str, priority: i32) -> DealDraft {
        DealDraft {
            name: name.to_string(),
            reward_amount: 175.0,
            required_direct_debits: 2,
            min_pay_in: 1000.0,
            debit_card_transactions: 0,
            time_to_payout: String::new(),
            expiry_date: None,
            source_id: Uuid::new_v4(),
            source_name: "MoneyCompare".to_string(),
            source_priority: priority,
            raw_text: String::new(),
        }
    }

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, hour, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn memory_store_matches_by_normalized_name() {
        let store = MemoryDealStore::new();
        let deal = Deal::from_draft(&sample_draft("HSBC Advance", 5), ts(9));
        store.insert_deal(&deal).await.unwrap();

        let found = store.find_deal_by_name("hsbc advance").await.unwrap();
        assert_eq!(found.map(|d| d.id), Some(deal.id));
        assert!(store.find_deal_by_name("first direct").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_match_prefers_highest_priority_row() {
        let store = MemoryDealStore::new();
        let low = Deal::from_draft(&sample_draft("Halifax", 3), ts(9));
        let high = Deal::from_draft(&sample_draft("HALIFAX", 9), ts(10));
        store.insert_deal(&low).await.unwrap();
        store.insert_deal(&high).await.unwrap();

        let found = store.find_deal_by_name("halifax").await.unwrap().unwrap();
        assert_eq!(found.id, high.id);
    }

    #[tokio::test]
    async fn update_of_missing_deal_is_an_error() {
        let store = MemoryDealStore::new();
        let deal = Deal::from_draft(&sample_draft("Halifax", 3), ts(9));
        assert!(matches!(
            store.update_deal(&deal).await,
            Err(StoreError::DealNotFound(id)) if id == deal.id
        ));
    }

    #[tokio::test]
    async fn outcomes_come_back_newest_first_and_scoped_to_source() {
        let store = MemoryDealStore::new();
        let source_id = Uuid::new_v4();
        for hour in [9, 10, 11] {
            store
                .append_outcome(&SyncOutcome {
                    id: Uuid::new_v4(),
                    source_id,
                    source_name: "MoneyCompare".to_string(),
                    found: hour as i32,
                    added: 0,
                    updated: 0,
                    deactivated: 0,
                    status: SyncStatus::Success,
                    errors: vec![],
                    duration_ms: 10,
                    created_at: ts(hour),
                })
                .await
                .unwrap();
        }
        store
            .append_outcome(&SyncOutcome {
                id: Uuid::new_v4(),
                source_id: Uuid::new_v4(),
                source_name: "Other".to_string(),
                found: 99,
                added: 0,
                updated: 0,
                deactivated: 0,
                status: SyncStatus::Success,
                errors: vec![],
                duration_ms: 10,
                created_at: ts(12),
            })
            .await
            .unwrap();

        let outcomes = store.recent_outcomes(source_id, 2).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].found, 11);
        assert_eq!(outcomes[1].found, 10);
    }

    #[tokio::test]
    async fn record_source_run_updates_metadata() {
        let store = MemoryDealStore::new();
        let source = sample_source("MoneyCompare", 10);
        store.upsert_source(&source).await.unwrap();
        store
            .record_source_run(source.id, ts(9), SyncStatus::Partial, 4)
            .await
            .unwrap();

        let loaded = store.get_source(source.id).await.unwrap();
        assert_eq!(loaded.last_run_status, Some(SyncStatus::Partial));
        assert_eq!(loaded.last_run_deal_count, Some(4));
    }

    #[tokio::test]
    async fn snapshots_deduplicate_identical_content() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        let first = store
            .store_page("MoneyCompare", ts(9), "text/html", b"<html>same</html>")
            .await
            .expect("first snapshot");
        let second = store
            .store_page("MoneyCompare", ts(9), "text/html", b"<html>same</html>")
            .await
            .expect("second snapshot");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(first.absolute_path.exists());
        assert!(first.relative_path.to_string_lossy().ends_with(".html"));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_separates_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
