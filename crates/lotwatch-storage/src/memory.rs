use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use lotwatch_core::{
    CollectionJob, FreshRecord, NaturalKey, PermanentRecord, SliceQuery, VehicleSale,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{FreshStore, JobRepository, ModelCount, PermanentStore, StoreError, StoreResult};

fn count_models<'a>(
    sales: impl Iterator<Item = &'a VehicleSale>,
    make: &str,
    since: NaiveDate,
    limit: usize,
) -> Vec<ModelCount> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for sale in sales {
        if !sale.make.eq_ignore_ascii_case(make) {
            continue;
        }
        if !sale.sale_date.is_some_and(|d| d >= since) {
            continue;
        }
        if let Some(model) = sale.model.as_deref().filter(|m| !m.trim().is_empty()) {
            *counts.entry(model.to_string()).or_default() += 1;
        }
    }
    let mut out = counts
        .into_iter()
        .map(|(model, records)| ModelCount { model, records })
        .collect::<Vec<_>>();
    out.sort_by(|a, b| b.records.cmp(&a.records).then_with(|| a.model.cmp(&b.model)));
    out.truncate(limit);
    out
}

/// Fresh tier held in process memory.
#[derive(Debug, Default)]
pub struct MemoryFreshStore {
    rows: Mutex<Vec<FreshRecord>>,
    fail_inserts: AtomicBool,
}

impl MemoryFreshStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent insert fail until reset.
    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub async fn all(&self) -> Vec<FreshRecord> {
        self.rows.lock().await.clone()
    }

    pub async fn contains(&self, key: &NaturalKey) -> bool {
        self.rows
            .lock()
            .await
            .iter()
            .any(|r| r.natural_key().as_ref() == Some(key))
    }
}

#[async_trait]
impl FreshStore for MemoryFreshStore {
    async fn insert_if_absent(&self, record: &FreshRecord) -> StoreResult<bool> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("fresh store writes disabled".into()));
        }
        let mut rows = self.rows.lock().await;
        if let Some(key) = record.natural_key() {
            if rows.iter().any(|r| r.natural_key().as_ref() == Some(&key)) {
                return Ok(false);
            }
        }
        rows.push(record.clone());
        Ok(true)
    }

    async fn count_matching(&self, slice: &SliceQuery) -> StoreResult<u64> {
        let rows = self.rows.lock().await;
        Ok(rows.iter().filter(|r| slice.matches(r.site, &r.sale)).count() as u64)
    }

    async fn select_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<FreshRecord>> {
        let rows = self.rows.lock().await;
        let mut expired = rows
            .iter()
            .filter(|r| r.is_expired(now))
            .cloned()
            .collect::<Vec<_>>();
        expired.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then(a.id.cmp(&b.id)));
        Ok(expired)
    }

    async fn delete_by_ids(&self, ids: &[Uuid]) -> StoreResult<u64> {
        let targets = ids.iter().collect::<HashSet<_>>();
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|r| !targets.contains(&r.id));
        Ok((before - rows.len()) as u64)
    }

    async fn model_counts(
        &self,
        make: &str,
        since: NaiveDate,
        limit: usize,
    ) -> StoreResult<Vec<ModelCount>> {
        let rows = self.rows.lock().await;
        Ok(count_models(rows.iter().map(|r| &r.sale), make, since, limit))
    }

    async fn count(&self) -> StoreResult<u64> {
        Ok(self.rows.lock().await.len() as u64)
    }

    async fn count_fetched_since(&self, since: DateTime<Utc>) -> StoreResult<u64> {
        let rows = self.rows.lock().await;
        Ok(rows.iter().filter(|r| r.fetched_at >= since).count() as u64)
    }
}

/// Permanent tier held in process memory, keyed by natural key.
#[derive(Debug, Default)]
pub struct MemoryPermanentStore {
    rows: Mutex<BTreeMap<NaturalKey, PermanentRecord>>,
    failing_lots: Mutex<HashSet<String>>,
}

impl MemoryPermanentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make inserts for `lot_id` fail until [`Self::clear_failures`] is called.
    pub async fn fail_inserts_for(&self, lot_id: &str) {
        self.failing_lots.lock().await.insert(lot_id.to_string());
    }

    pub async fn clear_failures(&self) {
        self.failing_lots.lock().await.clear();
    }

    pub async fn all(&self) -> Vec<PermanentRecord> {
        self.rows.lock().await.values().cloned().collect()
    }

    pub async fn contains(&self, key: &NaturalKey) -> bool {
        self.rows.lock().await.contains_key(key)
    }
}

#[async_trait]
impl PermanentStore for MemoryPermanentStore {
    async fn insert_if_absent(&self, record: &PermanentRecord) -> StoreResult<bool> {
        if self.failing_lots.lock().await.contains(&record.lot_id) {
            return Err(StoreError::Unavailable(format!(
                "permanent insert for lot {} refused",
                record.lot_id
            )));
        }
        let mut rows = self.rows.lock().await;
        let key = record.natural_key();
        if rows.contains_key(&key) {
            return Ok(false);
        }
        rows.insert(key, record.clone());
        Ok(true)
    }

    async fn count_matching(&self, slice: &SliceQuery) -> StoreResult<u64> {
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .filter(|r| slice.matches(r.site, &r.sale))
            .count() as u64)
    }

    async fn model_counts(
        &self,
        make: &str,
        since: NaiveDate,
        limit: usize,
    ) -> StoreResult<Vec<ModelCount>> {
        let rows = self.rows.lock().await;
        Ok(count_models(rows.values().map(|r| &r.sale), make, since, limit))
    }

    async fn count(&self) -> StoreResult<u64> {
        Ok(self.rows.lock().await.len() as u64)
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobRepository {
    jobs: Mutex<BTreeMap<Uuid, CollectionJob>>,
    fail_saves: AtomicBool,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub async fn get(&self, id: Uuid) -> Option<CollectionJob> {
        self.jobs.lock().await.get(&id).cloned()
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn load_jobs(&self) -> StoreResult<Vec<CollectionJob>> {
        let mut jobs = self.jobs.lock().await.values().cloned().collect::<Vec<_>>();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn save_job(&self, job: &CollectionJob) -> StoreResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("job repository writes disabled".into()));
        }
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(())
    }
}
