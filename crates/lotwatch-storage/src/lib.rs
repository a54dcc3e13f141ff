//! Fresh/permanent record stores and job persistence.
//!
//! Both record tiers are mutated only through insert-if-absent and
//! delete-by-id. Postgres implementations live in [`pg`]; the in-memory ones
//! in [`memory`] back dry runs and tests.

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use lotwatch_core::{CollectionJob, FreshRecord, PermanentRecord, SliceQuery};
use thiserror::Error;
use uuid::Uuid;

pub use memory::{MemoryFreshStore, MemoryJobRepository, MemoryPermanentStore};
pub use pg::{connect, run_migrations, PgFreshStore, PgJobRepository, PgPermanentStore};

pub const CRATE_NAME: &str = "lotwatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("could not decode stored row: {0}")]
    Decode(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// How often a model was seen for a make inside a sale-date window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCount {
    pub model: String,
    pub records: u64,
}

#[async_trait]
pub trait FreshStore: Send + Sync {
    /// Returns `true` when the row was written, `false` on a natural-key conflict.
    async fn insert_if_absent(&self, record: &FreshRecord) -> StoreResult<bool>;
    async fn count_matching(&self, slice: &SliceQuery) -> StoreResult<u64>;
    async fn select_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<FreshRecord>>;
    async fn delete_by_ids(&self, ids: &[Uuid]) -> StoreResult<u64>;
    /// Models seen for `make` with a sale date on or after `since`, most frequent first.
    async fn model_counts(
        &self,
        make: &str,
        since: NaiveDate,
        limit: usize,
    ) -> StoreResult<Vec<ModelCount>>;
    async fn count(&self) -> StoreResult<u64>;
    async fn count_fetched_since(&self, since: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait PermanentStore: Send + Sync {
    /// Returns `true` when the row was written, `false` when the key already existed.
    async fn insert_if_absent(&self, record: &PermanentRecord) -> StoreResult<bool>;
    async fn count_matching(&self, slice: &SliceQuery) -> StoreResult<u64>;
    async fn model_counts(
        &self,
        make: &str,
        since: NaiveDate,
        limit: usize,
    ) -> StoreResult<Vec<ModelCount>>;
    async fn count(&self) -> StoreResult<u64>;
}

/// Write-through job persistence. Jobs are upserted by id and never deleted.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn load_jobs(&self) -> StoreResult<Vec<CollectionJob>>;
    async fn save_job(&self, job: &CollectionJob) -> StoreResult<()>;
}

/// Merge per-tier model counts case-insensitively, keeping the first spelling
/// seen, ordered by combined frequency then name.
pub fn merge_model_counts(tiers: &[Vec<ModelCount>], limit: usize) -> Vec<ModelCount> {
    let mut merged: Vec<ModelCount> = Vec::new();
    for counts in tiers {
        for entry in counts {
            match merged
                .iter_mut()
                .find(|m| m.model.eq_ignore_ascii_case(&entry.model))
            {
                Some(existing) => existing.records += entry.records,
                None => merged.push(entry.clone()),
            }
        }
    }
    merged.sort_by(|a, b| {
        b.records
            .cmp(&a.records)
            .then_with(|| a.model.to_ascii_lowercase().cmp(&b.model.to_ascii_lowercase()))
    });
    merged.truncate(limit);
    merged
}
