//! Core domain model for lotwatch: collection jobs and the two record tiers.

mod job;
mod record;

pub use job::{
    CollectionJob, CollectionParams, EnqueueOptions, JobKey, JobStatus, ValidatedEnqueue,
    ValidationError, DEFAULT_DAYS_BACK, DEFAULT_PRIORITY, DEFAULT_SITE, DEFAULT_YEAR_SPAN,
    KNOWN_SITES, MAX_DAYS_BACK, MIN_MODEL_YEAR,
};
pub use record::{
    FreshRecord, MissingNaturalKey, NaturalKey, PermanentRecord, SliceQuery, VehicleSale,
};

pub const CRATE_NAME: &str = "lotwatch-core";
