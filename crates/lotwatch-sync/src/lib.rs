//! Ingestion orchestration: job queue and dispatch loop, discovery, paginated
//! fetching into the fresh tier, and the expiry migration into the permanent tier.

pub mod batch;
pub mod catalogue;
pub mod config;
pub mod discovery;
pub mod fetcher;
pub mod migration;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod status;

pub use batch::{AutoCollector, BatchReport, BatchSettings};
pub use catalogue::{MakeCatalogue, MakeEntry};
pub use config::IngestConfig;
pub use discovery::{Discovery, DiscoveryResult, DiscoverySettings};
pub use fetcher::{CollectionUnit, FetchSettings, Fetcher, StopReason, UnitOutcome};
pub use migration::{MigrationReport, MigrationScheduler};
pub use queue::{JobCounts, JobQueue, JobResult};
pub use runtime::{Runtime, Stores};
pub use scheduler::{
    CollectionScheduler, EnqueueError, RefreshMode, SchedulerSettings, SchedulerState,
};
pub use status::{CollectionStatus, Eta, MakeProgress, QueueView, StatusReporter};

pub const CRATE_NAME: &str = "lotwatch-sync";
