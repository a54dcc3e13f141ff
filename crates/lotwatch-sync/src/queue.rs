use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use lotwatch_core::{CollectionJob, JobStatus, ValidatedEnqueue};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed
    }
}

/// How a dispatched job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Completed {
        records: u64,
        discovered_models: Option<u32>,
    },
    Failed(String),
}

/// All known jobs plus the set currently dispatched. Callers hold this under
/// one async mutex, so a claim and its active-set entry change together.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: HashMap<Uuid, CollectionJob>,
    active: HashSet<Uuid>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the job or update its options. A job that is not running goes
    /// back to `pending`; a running job keeps its status.
    pub fn upsert(&mut self, validated: ValidatedEnqueue, now: DateTime<Utc>) -> CollectionJob {
        let id = validated.key.job_id();
        let job = self.jobs.entry(id).or_insert_with(|| {
            CollectionJob::new(validated.key.clone(), validated.params, validated.priority, now)
        });
        job.params = validated.params;
        job.priority = validated.priority;
        if job.status != JobStatus::Running {
            job.status = JobStatus::Pending;
        }
        job.updated_at = now;
        job.clone()
    }

    /// Insert when no job with the same id exists. Returns whether it was added.
    pub fn ensure(&mut self, job: CollectionJob) -> bool {
        if self.jobs.contains_key(&job.id) {
            return false;
        }
        self.jobs.insert(job.id, job);
        true
    }

    pub fn get(&self, id: Uuid) -> Option<&CollectionJob> {
        self.jobs.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CollectionJob> {
        self.jobs.values()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn has_pending(&self) -> bool {
        self.jobs.values().any(|j| j.status == JobStatus::Pending)
    }

    /// Mark the best pending job `running` and add it to the active set.
    pub fn claim_next(&mut self, now: DateTime<Utc>) -> Option<CollectionJob> {
        let id = self
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && !self.active.contains(&j.id))
            .min_by(|a, b| a.dispatch_cmp(b))
            .map(|j| j.id)?;

        self.active.insert(id);
        let job = self.jobs.get_mut(&id)?;
        job.status = JobStatus::Running;
        job.updated_at = now;
        Some(job.clone())
    }

    /// Undo a claim whose dispatch never happened.
    pub fn release(&mut self, id: Uuid, now: DateTime<Utc>) {
        self.active.remove(&id);
        if let Some(job) = self.jobs.get_mut(&id) {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Pending;
                job.updated_at = now;
            }
        }
    }

    pub fn finish(
        &mut self,
        id: Uuid,
        result: JobResult,
        duration_ms: u64,
        now: DateTime<Utc>,
    ) -> Option<CollectionJob> {
        self.active.remove(&id);
        let job = self.jobs.get_mut(&id)?;
        job.last_collected_at = Some(now);
        job.last_duration_ms = Some(duration_ms);
        job.updated_at = now;
        match result {
            JobResult::Completed {
                records,
                discovered_models,
            } => {
                job.status = JobStatus::Completed;
                job.records_collected += records;
                job.last_error = None;
                if let Some(count) = discovered_models {
                    job.discovered_model_count = count;
                }
            }
            JobResult::Failed(err) => {
                job.status = JobStatus::Failed;
                job.last_error = Some(err);
            }
        }
        Some(job.clone())
    }

    /// Move every completed job back to `pending`; failed jobs stay put.
    pub fn recycle_completed(&mut self, now: DateTime<Utc>) -> Vec<CollectionJob> {
        self.jobs
            .values_mut()
            .filter(|j| j.status == JobStatus::Completed)
            .map(|j| {
                j.status = JobStatus::Pending;
                j.updated_at = now;
                j.clone()
            })
            .collect()
    }

    /// Every job, in dispatch order.
    pub fn snapshot(&self) -> Vec<CollectionJob> {
        let mut jobs = self.jobs.values().cloned().collect::<Vec<_>>();
        jobs.sort_by(|a, b| a.dispatch_cmp(b));
        jobs
    }

    pub fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for job in self.jobs.values() {
            counts.add(job.status);
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lotwatch_core::EnqueueOptions;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, minute, 0).single().unwrap()
    }

    fn validated(make: &str, model: Option<&str>, priority: u8) -> ValidatedEnqueue {
        EnqueueOptions {
            specific_model: model.map(Into::into),
            priority: Some(priority),
            ..Default::default()
        }
        .validate(make, 2026)
        .unwrap()
    }

    #[test]
    fn identical_keys_collapse_and_update_options() {
        let mut queue = JobQueue::new();
        queue.upsert(validated("Toyota", None, 2), ts(0));
        let updated = queue.upsert(validated("toyota ", None, 1), ts(1));
        assert_eq!(queue.snapshot().len(), 1);
        assert_eq!(updated.priority, 1);
        assert_eq!(updated.created_at, ts(0));
    }

    #[test]
    fn claims_follow_priority_and_skip_active() {
        let mut queue = JobQueue::new();
        queue.upsert(validated("Kia", None, 3), ts(0));
        queue.upsert(validated("Honda", Some("Civic"), 1), ts(1));
        queue.upsert(validated("Ford", None, 2), ts(2));

        let first = queue.claim_next(ts(3)).unwrap();
        let second = queue.claim_next(ts(3)).unwrap();
        assert_eq!(first.key.make, "Honda");
        assert_eq!(second.key.make, "Ford");
        assert_eq!(queue.active_count(), 2);
        assert_eq!(queue.counts().running, 2);

        queue.release(second.id, ts(4));
        assert_eq!(queue.active_count(), 1);
        assert_eq!(queue.get(second.id).unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn finish_records_outcome_and_recycle_skips_failed() {
        let mut queue = JobQueue::new();
        let ok = queue.upsert(validated("Honda", Some("Civic"), 1), ts(0));
        let bad = queue.upsert(validated("Honda", Some("Accord"), 1), ts(0));
        queue.claim_next(ts(1));
        queue.claim_next(ts(1));

        let done = queue
            .finish(
                ok.id,
                JobResult::Completed {
                    records: 35,
                    discovered_models: None,
                },
                1200,
                ts(2),
            )
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.records_collected, 35);
        assert_eq!(done.last_duration_ms, Some(1200));

        let failed = queue
            .finish(bad.id, JobResult::Failed("boom".into()), 10, ts(2))
            .unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
        assert_eq!(queue.active_count(), 0);

        let recycled = queue.recycle_completed(ts(3));
        assert_eq!(recycled.len(), 1);
        assert_eq!(recycled[0].id, ok.id);
        let counts = queue.counts();
        assert_eq!((counts.pending, counts.failed), (1, 1));
    }

    #[test]
    fn running_job_keeps_status_on_re_enqueue() {
        let mut queue = JobQueue::new();
        queue.upsert(validated("Honda", Some("Civic"), 2), ts(0));
        queue.claim_next(ts(1)).unwrap();
        let job = queue.upsert(validated("Honda", Some("Civic"), 1), ts(2));
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.priority, 1);
    }

    #[test]
    fn ensure_never_overwrites() {
        let mut queue = JobQueue::new();
        let job = queue.upsert(validated("Honda", Some("Civic"), 2), ts(0));
        let mut other = job.clone();
        other.priority = 9;
        assert!(!queue.ensure(other));
        assert_eq!(queue.get(job.id).unwrap().priority, 2);
    }
}
