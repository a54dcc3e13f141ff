use std::sync::Arc;

use anyhow::{Context, Result};
use lotwatch_core::EnqueueOptions;
use lotwatch_storage::{
    connect, run_migrations, FreshStore, JobRepository, MemoryFreshStore, MemoryJobRepository,
    MemoryPermanentStore, PermanentStore, PgFreshStore, PgJobRepository, PgPermanentStore,
};
use lotwatch_vendor::{HttpVendorClient, VendorClient};
use tracing::{info, warn};

use crate::batch::AutoCollector;
use crate::catalogue::MakeCatalogue;
use crate::config::IngestConfig;
use crate::discovery::Discovery;
use crate::fetcher::Fetcher;
use crate::migration::MigrationScheduler;
use crate::scheduler::CollectionScheduler;
use crate::status::StatusReporter;

/// The three stores every component shares.
#[derive(Clone)]
pub struct Stores {
    pub fresh: Arc<dyn FreshStore>,
    pub permanent: Arc<dyn PermanentStore>,
    pub jobs: Arc<dyn JobRepository>,
}

impl Stores {
    /// Postgres when `DATABASE_URL` is set, in-memory otherwise.
    pub async fn from_config(config: &IngestConfig) -> Result<Self> {
        let Some(url) = config.database_url.as_deref() else {
            warn!("DATABASE_URL not set, using in-memory stores; nothing will persist");
            return Ok(Self::in_memory());
        };
        let pool = connect(url).await.context("connecting to postgres")?;
        run_migrations(&pool).await.context("applying migrations")?;
        info!("postgres stores ready");
        Ok(Self {
            fresh: Arc::new(PgFreshStore::new(pool.clone())),
            permanent: Arc::new(PgPermanentStore::new(pool.clone())),
            jobs: Arc::new(PgJobRepository::new(pool)),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            fresh: Arc::new(MemoryFreshStore::new()),
            permanent: Arc::new(MemoryPermanentStore::new()),
            jobs: Arc::new(MemoryJobRepository::new()),
        }
    }
}

/// Fully wired ingestion service.
pub struct Runtime {
    pub config: IngestConfig,
    pub stores: Stores,
    pub fetcher: Arc<Fetcher>,
    pub discovery: Arc<Discovery>,
    pub scheduler: CollectionScheduler,
    pub migration: Arc<MigrationScheduler>,
}

impl Runtime {
    pub async fn from_config(config: IngestConfig) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let stores = Stores::from_config(&config).await?;
        let vendor = HttpVendorClient::new(config.vendor_config()).context("building vendor client")?;
        Ok(Self::assemble(config, stores, Arc::new(vendor)))
    }

    pub fn assemble(config: IngestConfig, stores: Stores, vendor: Arc<dyn VendorClient>) -> Self {
        let fetcher = Arc::new(Fetcher::new(
            vendor,
            stores.fresh.clone(),
            stores.permanent.clone(),
            config.fetch_settings(),
        ));
        let discovery = Arc::new(Discovery::new(
            stores.fresh.clone(),
            stores.permanent.clone(),
            config.discovery_settings(),
        ));
        let scheduler = CollectionScheduler::new(
            config.scheduler_settings(),
            fetcher.clone(),
            discovery.clone(),
            stores.jobs.clone(),
            StatusReporter::new(stores.fresh.clone(), stores.permanent.clone()),
        );
        let migration = Arc::new(MigrationScheduler::new(
            stores.fresh.clone(),
            stores.permanent.clone(),
            config.migration_interval(),
        ));
        Self {
            config,
            stores,
            fetcher,
            discovery,
            scheduler,
            migration,
        }
    }

    pub fn load_catalogue(&self) -> Result<MakeCatalogue> {
        MakeCatalogue::load(&self.config.catalogue_path)
    }

    pub fn auto_collector(&self, catalogue: MakeCatalogue) -> AutoCollector {
        AutoCollector::new(
            self.fetcher.clone(),
            self.discovery.clone(),
            catalogue,
            EnqueueOptions::default(),
            self.config.batch_settings(),
        )
    }
}
