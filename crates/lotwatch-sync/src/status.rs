use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lotwatch_core::{CollectionJob, JobStatus};
use lotwatch_storage::{FreshStore, PermanentStore, StoreError};
use serde::{Serialize, Serializer};

use crate::queue::JobCounts;
use crate::scheduler::SchedulerState;

/// Estimated time to drain the queue; "N/A" when it cannot be computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eta {
    NotAvailable,
    Remaining(Duration),
}

impl Eta {
    /// `remaining × mean duration ÷ cap`, or `NotAvailable` when any input is empty.
    pub fn estimate(remaining_jobs: usize, durations_ms: &[u64], concurrency_cap: usize) -> Self {
        if remaining_jobs == 0 || durations_ms.is_empty() || concurrency_cap == 0 {
            return Self::NotAvailable;
        }
        let total: u128 = durations_ms.iter().map(|d| u128::from(*d)).sum();
        let mean = total / durations_ms.len() as u128;
        let ms = mean * remaining_jobs as u128 / concurrency_cap as u128;
        Self::Remaining(Duration::from_millis(u64::try_from(ms).unwrap_or(u64::MAX)))
    }
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAvailable => f.write_str("N/A"),
            Self::Remaining(d) => {
                let secs = d.as_secs();
                let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
                if h > 0 {
                    write!(f, "{h}h {m:02}m {s:02}s")
                } else if m > 0 {
                    write!(f, "{m}m {s:02}s")
                } else {
                    write!(f, "{s}s")
                }
            }
        }
    }
}

impl Serialize for Eta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionStatus {
    pub state: SchedulerState,
    pub pending_jobs: usize,
    pub running_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub active_workers: usize,
    pub concurrency_cap: usize,
    pub permanent_records: u64,
    pub fresh_records: u64,
    pub records_added_last_24h: u64,
    pub eta: Eta,
    pub generated_at: DateTime<Utc>,
}

/// Queue-side inputs captured under the queue lock.
#[derive(Debug, Clone, Default)]
pub struct QueueView {
    pub counts: JobCounts,
    pub active_workers: usize,
    pub completed_durations_ms: Vec<u64>,
}

impl QueueView {
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a CollectionJob>, active_workers: usize) -> Self {
        let mut view = Self {
            active_workers,
            ..Default::default()
        };
        for job in jobs {
            view.counts.add(job.status);
            if job.status == JobStatus::Completed {
                if let Some(ms) = job.last_duration_ms {
                    view.completed_durations_ms.push(ms);
                }
            }
        }
        view
    }
}

/// Per-make rollup of model jobs and what they collected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MakeProgress {
    pub make: String,
    pub model_jobs: JobCounts,
    pub discovery_jobs: usize,
    pub discovered_models: u32,
    pub records_collected: u64,
    pub last_collected_at: Option<DateTime<Utc>>,
}

pub fn summarize_progress<'a>(jobs: impl IntoIterator<Item = &'a CollectionJob>) -> Vec<MakeProgress> {
    let mut by_make: BTreeMap<String, MakeProgress> = BTreeMap::new();
    for job in jobs {
        let entry = by_make
            .entry(job.key.make.to_ascii_lowercase())
            .or_insert_with(|| MakeProgress {
                make: job.key.make.clone(),
                model_jobs: JobCounts::default(),
                discovery_jobs: 0,
                discovered_models: 0,
                records_collected: 0,
                last_collected_at: None,
            });
        if job.key.is_discovery() {
            entry.discovery_jobs += 1;
            entry.discovered_models += job.discovered_model_count;
        } else {
            entry.model_jobs.add(job.status);
        }
        entry.records_collected += job.records_collected;
        entry.last_collected_at = entry.last_collected_at.max(job.last_collected_at);
    }
    by_make.into_values().collect()
}

/// Read-only aggregation over the queue and both record tiers.
pub struct StatusReporter {
    fresh: Arc<dyn FreshStore>,
    permanent: Arc<dyn PermanentStore>,
}

impl StatusReporter {
    pub fn new(fresh: Arc<dyn FreshStore>, permanent: Arc<dyn PermanentStore>) -> Self {
        Self { fresh, permanent }
    }

    pub async fn report(
        &self,
        view: QueueView,
        state: SchedulerState,
        concurrency_cap: usize,
        now: DateTime<Utc>,
    ) -> Result<CollectionStatus, StoreError> {
        let permanent_records = self.permanent.count().await?;
        let fresh_records = self.fresh.count().await?;
        let records_added_last_24h = self
            .fresh
            .count_fetched_since(now - chrono::Duration::hours(24))
            .await?;

        let remaining = view.counts.pending + view.counts.running;
        Ok(CollectionStatus {
            state,
            pending_jobs: view.counts.pending,
            running_jobs: view.counts.running,
            completed_jobs: view.counts.completed,
            failed_jobs: view.counts.failed,
            active_workers: view.active_workers,
            concurrency_cap,
            permanent_records,
            fresh_records,
            records_added_last_24h,
            eta: Eta::estimate(remaining, &view.completed_durations_ms, concurrency_cap),
            generated_at: now,
        })
    }
}
