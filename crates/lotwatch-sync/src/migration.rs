use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use lotwatch_core::PermanentRecord;
use lotwatch_storage::{FreshStore, PermanentStore, StoreError};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub selected: usize,
    pub inserted: usize,
    pub already_present: usize,
    pub skipped_invalid: usize,
    pub insert_failures: usize,
    pub deleted: u64,
}

/// Moves expired fresh rows into the permanent tier: insert-if-absent for
/// every row first, then one delete over the rows that made it.
pub struct MigrationScheduler {
    fresh: Arc<dyn FreshStore>,
    permanent: Arc<dyn PermanentStore>,
    interval: Duration,
    sweep_lock: Mutex<()>,
}

impl MigrationScheduler {
    pub fn new(
        fresh: Arc<dyn FreshStore>,
        permanent: Arc<dyn PermanentStore>,
        interval: Duration,
    ) -> Self {
        Self {
            fresh,
            permanent,
            interval,
            sweep_lock: Mutex::new(()),
        }
    }

    pub async fn migrate_expired(&self) -> Result<MigrationReport, StoreError> {
        self.migrate_expired_at(Utc::now()).await
    }

    /// Sweep rows expired at `now`. Concurrent callers queue behind the sweep lock.
    pub async fn migrate_expired_at(&self, now: DateTime<Utc>) -> Result<MigrationReport, StoreError> {
        let _guard = self.sweep_lock.lock().await;
        self.sweep(now).await
    }

    /// Sweep unless another sweep holds the lock; `None` means the tick was skipped.
    pub async fn try_sweep(&self, now: DateTime<Utc>) -> Option<Result<MigrationReport, StoreError>> {
        let _guard = self.sweep_lock.try_lock().ok()?;
        Some(self.sweep(now).await)
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<MigrationReport, StoreError> {
        let expired = self.fresh.select_expired(now).await?;
        let mut report = MigrationReport {
            selected: expired.len(),
            ..Default::default()
        };
        let mut to_delete = Vec::with_capacity(expired.len());

        for row in &expired {
            let record = match PermanentRecord::from_fresh(row, now) {
                Ok(record) => record,
                Err(err) => {
                    warn!(error = %err, "skipping fresh row without natural key");
                    report.skipped_invalid += 1;
                    to_delete.push(row.id);
                    continue;
                }
            };
            match self.permanent.insert_if_absent(&record).await {
                Ok(true) => {
                    report.inserted += 1;
                    to_delete.push(row.id);
                }
                Ok(false) => {
                    report.already_present += 1;
                    to_delete.push(row.id);
                }
                Err(err) => {
                    report.insert_failures += 1;
                    warn!(
                        lot_id = %record.lot_id,
                        site = record.site,
                        error = %err,
                        "permanent insert failed, row kept for next sweep"
                    );
                }
            }
        }

        report.deleted = self.fresh.delete_by_ids(&to_delete).await?;
        info!(
            selected = report.selected,
            inserted = report.inserted,
            already_present = report.already_present,
            skipped_invalid = report.skipped_invalid,
            insert_failures = report.insert_failures,
            deleted = report.deleted,
            "migration sweep finished"
        );
        Ok(report)
    }

    /// Register the repeated sweep on a started `JobScheduler`.
    pub async fn spawn_interval(self: Arc<Self>) -> anyhow::Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating migration scheduler")?;
        let interval = self.interval;
        let this = self;
        let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
            let this = this.clone();
            Box::pin(async move {
                match this.try_sweep(Utc::now()).await {
                    None => warn!("previous migration sweep still running, skipping tick"),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => error!(error = %err, "migration sweep failed"),
                }
            })
        })
        .with_context(|| format!("creating migration job every {interval:?}"))?;
        sched.add(job).await.context("adding migration job")?;
        sched.start().await.context("starting migration scheduler")?;
        info!(interval_secs = interval.as_secs(), "migration sweep scheduled");
        Ok(sched)
    }
}
