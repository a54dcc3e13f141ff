use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{Datelike, Utc};
use futures_util::FutureExt;
use lotwatch_core::{CollectionJob, EnqueueOptions, JobStatus, ValidationError};
use lotwatch_storage::{JobRepository, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalogue::MakeCatalogue;
use crate::discovery::Discovery;
use crate::fetcher::{CollectionUnit, Fetcher};
use crate::queue::{JobQueue, JobResult};
use crate::status::{summarize_progress, CollectionStatus, MakeProgress, QueueView, StatusReporter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Completed jobs go back to `pending` once nothing else is pending.
    #[default]
    Continuous,
    /// Run every pending job once, then exit the loop.
    OneShot,
}

impl FromStr for RefreshMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continuous" => Ok(Self::Continuous),
            "one_shot" | "oneshot" | "one-shot" => Ok(Self::OneShot),
            other => Err(format!("unknown refresh mode {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Polling,
    Dispatching,
    Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub loop_backoff: Duration,
    pub refresh_mode: RefreshMode,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            poll_interval: Duration::from_millis(5000),
            loop_backoff: Duration::from_secs(60),
            refresh_mode: RefreshMode::Continuous,
        }
    }
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    /// The job is queued in memory but the repository write failed.
    #[error("job queued but not persisted: {0}")]
    Persist(#[from] StoreError),
}

enum Tick {
    Dispatched,
    Saturated,
    Recycled(usize),
    Idle,
    /// One-shot mode with nothing left to claim.
    Drained,
}

/// Owns the job queue and the dispatch loop. Clones share the same state.
#[derive(Clone)]
pub struct CollectionScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    settings: SchedulerSettings,
    fetcher: Arc<Fetcher>,
    discovery: Arc<Discovery>,
    repository: Arc<dyn JobRepository>,
    reporter: StatusReporter,
    queue: Mutex<JobQueue>,
    running: AtomicBool,
    state: watch::Sender<SchedulerState>,
    loop_slot: Mutex<LoopSlot>,
    /// Model jobs whose next run skips the coverage pre-check because a
    /// discovery probe just wrote rows for their make.
    skip_precheck: Mutex<HashSet<Uuid>>,
}

/// Whether a loop is alive, plus its handle when it was spawned by `start()`.
/// The loop clears `active` under this lock, so `start()` never re-arms a
/// loop that has already decided to exit.
#[derive(Default)]
struct LoopSlot {
    handle: Option<JoinHandle<()>>,
    active: bool,
}

impl CollectionScheduler {
    pub fn new(
        settings: SchedulerSettings,
        fetcher: Arc<Fetcher>,
        discovery: Arc<Discovery>,
        repository: Arc<dyn JobRepository>,
        reporter: StatusReporter,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            inner: Arc::new(Inner {
                settings: SchedulerSettings {
                    concurrency: settings.concurrency.max(1),
                    ..settings
                },
                fetcher,
                discovery,
                repository,
                reporter,
                queue: Mutex::new(JobQueue::new()),
                running: AtomicBool::new(false),
                state,
                loop_slot: Mutex::new(LoopSlot::default()),
                skip_precheck: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.inner.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SchedulerState) {
        self.inner.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    /// Validate and queue a job. Validation happens before any await, so a
    /// rejected call leaves the queue untouched.
    pub async fn enqueue(
        &self,
        make: &str,
        options: EnqueueOptions,
    ) -> Result<CollectionJob, EnqueueError> {
        let validated = options.validate(make, Utc::now().year())?;
        let job = self.inner.queue.lock().await.upsert(validated, Utc::now());
        info!(job_id = %job.id, key = %job.key, priority = job.priority, "job enqueued");
        self.inner.repository.save_job(&job).await?;
        Ok(job)
    }

    /// Insert one job per (make, model, site) from the catalogue, or one
    /// discovery job per (make, site) when the make has no model list.
    /// Existing jobs are left as they are.
    pub async fn seed_from_catalogue(
        &self,
        catalogue: &MakeCatalogue,
        defaults: &EnqueueOptions,
    ) -> Result<usize, EnqueueError> {
        let year = Utc::now().year();
        let mut created = Vec::new();
        for entry in &catalogue.makes {
            let models = if entry.needs_discovery() {
                vec![None]
            } else {
                entry.models.iter().cloned().map(Some).collect()
            };
            for &site in &entry.sites {
                for model in &models {
                    let validated = EnqueueOptions {
                        site: Some(site),
                        specific_model: model.clone(),
                        priority: Some(entry.tier),
                        ..defaults.clone()
                    }
                    .validate(&entry.make, year)?;
                    let job = CollectionJob::new(
                        validated.key,
                        validated.params,
                        validated.priority,
                        Utc::now(),
                    );
                    if self.inner.queue.lock().await.ensure(job.clone()) {
                        created.push(job);
                    }
                }
            }
        }

        for job in &created {
            self.inner.repository.save_job(job).await?;
        }
        info!(makes = catalogue.makes.len(), created = created.len(), "queue seeded from catalogue");
        Ok(created.len())
    }

    /// Reload persisted jobs. Jobs left `running` by a previous process go back to `pending`.
    pub async fn restore(&self) -> Result<usize, StoreError> {
        let jobs = self.inner.repository.load_jobs().await?;
        let mut restored = 0;
        let mut queue = self.inner.queue.lock().await;
        for mut job in jobs {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Pending;
            }
            if queue.ensure(job) {
                restored += 1;
            }
        }
        info!(restored, "jobs restored from repository");
        Ok(restored)
    }

    /// Spawn the dispatch loop. A loop that is still alive (including one
    /// draining after `stop()`) is re-armed instead of spawning a second one.
    pub async fn start(&self) {
        let mut slot = self.inner.loop_slot.lock().await;
        let was_running = self.inner.running.swap(true, Ordering::SeqCst);
        if slot.active {
            if !was_running {
                info!("collection loop re-armed");
            }
            return;
        }
        slot.active = true;
        let this = self.clone();
        slot.handle = Some(tokio::spawn(async move { this.run_loop().await }));
    }

    /// Ask the loop to exit at its next iteration. In-flight jobs finish.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            info!("collection loop stop requested");
        }
    }

    /// Stop and wait for the loop and its in-flight jobs to finish.
    pub async fn shutdown(&self) {
        self.stop();
        self.wait().await;
    }

    /// Wait for a spawned loop to exit on its own.
    pub async fn wait(&self) {
        let handle = self.inner.loop_slot.lock().await.handle.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "collection loop task failed");
            }
        }
    }

    /// Run the loop on the current task until the queue drains (one-shot
    /// mode) or `stop()` is called.
    pub async fn run_until_idle(&self) {
        {
            let mut slot = self.inner.loop_slot.lock().await;
            self.inner.running.store(true, Ordering::SeqCst);
            if slot.active {
                drop(slot);
                self.wait().await;
                return;
            }
            slot.active = true;
        }
        self.run_loop().await;
    }

    /// Dispatch loop body. Runs while the running flag is set; the caller
    /// marks the loop slot active first.
    async fn run_loop(&self) {
        let settings = self.inner.settings;
        let mut in_flight = JoinSet::new();
        info!(
            concurrency = settings.concurrency,
            mode = ?settings.refresh_mode,
            "collection loop started"
        );

        loop {
            while self.is_running() {
                while in_flight.try_join_next().is_some() {}

                self.set_state(SchedulerState::Polling);
                match self.tick(&mut in_flight).await {
                    Ok(Tick::Dispatched) => {}
                    Ok(Tick::Recycled(count)) => {
                        info!(recycled = count, "completed jobs returned to pending");
                        self.set_state(SchedulerState::Idle);
                    }
                    Ok(Tick::Saturated | Tick::Idle) => self.set_state(SchedulerState::Idle),
                    Ok(Tick::Drained) => {
                        self.set_state(SchedulerState::Idle);
                        if in_flight.is_empty() {
                            info!("queue drained");
                            self.inner.running.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                    Err(err) => {
                        self.set_state(SchedulerState::Backoff);
                        error!(
                            error = %format!("{err:#}"),
                            backoff_secs = settings.loop_backoff.as_secs(),
                            "collection loop error, backing off"
                        );
                        tokio::time::sleep(settings.loop_backoff).await;
                        continue;
                    }
                }
                tokio::time::sleep(settings.poll_interval).await;
            }

            while in_flight.join_next().await.is_some() {}

            // start() may have re-armed the flag while jobs were draining
            let mut slot = self.inner.loop_slot.lock().await;
            if self.is_running() {
                continue;
            }
            slot.active = false;
            break;
        }
        self.set_state(SchedulerState::Idle);
        info!("collection loop stopped");
    }

    async fn tick(&self, in_flight: &mut JoinSet<()>) -> anyhow::Result<Tick> {
        let now = Utc::now();
        let mut queue = self.inner.queue.lock().await;
        if queue.active_count() >= self.inner.settings.concurrency {
            return Ok(Tick::Saturated);
        }

        let Some(job) = queue.claim_next(now) else {
            if self.inner.settings.refresh_mode == RefreshMode::OneShot {
                return Ok(Tick::Drained);
            }
            let recycled = queue.recycle_completed(now);
            drop(queue);
            if recycled.is_empty() {
                return Ok(Tick::Idle);
            }
            for job in &recycled {
                self.inner
                    .repository
                    .save_job(job)
                    .await
                    .context("persisting recycled job")?;
            }
            return Ok(Tick::Recycled(recycled.len()));
        };
        drop(queue);

        if let Err(err) = self.inner.repository.save_job(&job).await {
            self.inner.queue.lock().await.release(job.id, Utc::now());
            return Err(err).context(format!("persisting claimed job {}", job.key));
        }

        self.set_state(SchedulerState::Dispatching);
        debug!(job_id = %job.id, key = %job.key, "dispatching job");
        let this = self.clone();
        in_flight.spawn(async move { this.execute(job).await });
        Ok(Tick::Dispatched)
    }

    async fn execute(&self, job: CollectionJob) {
        let started = Instant::now();
        let span = info_span!(
            "collection_job",
            job_id = %job.id,
            make = %job.key.make,
            model = job.key.model.as_deref().unwrap_or("*"),
            site = job.key.site
        );

        let result = AssertUnwindSafe(self.run_job(&job))
            .catch_unwind()
            .instrument(span)
            .await;
        let result = match result {
            Ok(Ok(done)) => done,
            Ok(Err(err)) => JobResult::Failed(format!("{err:#}")),
            Err(_) => JobResult::Failed("job panicked".to_string()),
        };

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let finished = self
            .inner
            .queue
            .lock()
            .await
            .finish(job.id, result, duration_ms, Utc::now());
        let Some(finished) = finished else {
            return;
        };

        match finished.status {
            JobStatus::Failed => warn!(
                job_id = %finished.id,
                key = %finished.key,
                error = finished.last_error.as_deref().unwrap_or_default(),
                "job failed"
            ),
            _ => info!(
                job_id = %finished.id,
                key = %finished.key,
                records_total = finished.records_collected,
                duration_ms,
                "job completed"
            ),
        }
        if let Err(err) = self.inner.repository.save_job(&finished).await {
            warn!(job_id = %finished.id, error = %err, "could not persist finished job");
        }
    }

    async fn run_job(&self, job: &CollectionJob) -> anyhow::Result<JobResult> {
        let today = Utc::now().date_naive();

        if job.key.is_discovery() {
            let found = self
                .inner
                .discovery
                .discover(&self.inner.fetcher, &job.key.make, job.key.site, &job.params, today)
                .await
                .context("discovering models")?;
            if found.probe.as_ref().is_some_and(|p| p.inserted > 0) {
                let mut skip = self.inner.skip_precheck.lock().await;
                skip.extend(found.models.iter().map(|m| job.key.with_model(m).job_id()));
            }
            let added = self.fan_out(job, &found.models).await;
            info!(models = found.models.len(), added, "discovery fanned out");
            return Ok(JobResult::Completed {
                records: found.probe.map(|p| p.inserted).unwrap_or(0),
                discovered_models: Some(u32::try_from(found.models.len()).unwrap_or(u32::MAX)),
            });
        }

        let unit = CollectionUnit::for_job(&job.key, &job.params, today);
        let outcome = if self.inner.skip_precheck.lock().await.remove(&job.id) {
            self.inner.fetcher.collect_unchecked(&unit).await
        } else {
            self.inner
                .fetcher
                .collect(&unit)
                .await
                .context("checking existing coverage")?
        };
        Ok(JobResult::Completed {
            records: outcome.inserted,
            discovered_models: None,
        })
    }

    /// Insert a model job per discovered model unless one already exists.
    async fn fan_out(&self, parent: &CollectionJob, models: &[String]) -> usize {
        let now = Utc::now();
        let created = {
            let mut queue = self.inner.queue.lock().await;
            models
                .iter()
                .map(|model| {
                    CollectionJob::new(parent.key.with_model(model), parent.params, parent.priority, now)
                })
                .filter(|child| queue.ensure(child.clone()))
                .collect::<Vec<_>>()
        };

        for child in &created {
            if let Err(err) = self.inner.repository.save_job(child).await {
                warn!(job_id = %child.id, key = %child.key, error = %err, "could not persist discovered job");
            }
        }
        created.len()
    }

    pub async fn get_status(&self) -> Result<CollectionStatus, StoreError> {
        let view = {
            let queue = self.inner.queue.lock().await;
            QueueView::from_jobs(queue.iter(), queue.active_count())
        };
        self.inner
            .reporter
            .report(view, self.state(), self.inner.settings.concurrency, Utc::now())
            .await
    }

    /// Every job in dispatch order.
    pub async fn get_queue_snapshot(&self) -> Vec<CollectionJob> {
        self.inner.queue.lock().await.snapshot()
    }

    pub async fn get_vehicle_progress_summary(&self) -> Vec<MakeProgress> {
        let queue = self.inner.queue.lock().await;
        summarize_progress(queue.iter())
    }
}
