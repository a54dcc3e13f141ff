use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use lotwatch_core::{CollectionParams, FreshRecord, JobKey, SliceQuery};
use lotwatch_storage::{FreshStore, PermanentStore, StoreError};
use lotwatch_vendor::{BackoffPolicy, PageQuery, VendorClient, VendorError, VendorPage};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Pagination and retry knobs for one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchSettings {
    pub page_size: u32,
    pub max_pages: u32,
    pub page_delay_min: Duration,
    pub page_delay_max: Duration,
    pub rate_limit_backoff: Duration,
    /// 429 retries allowed on a single page before the unit is abandoned.
    pub max_rate_limit_retries: u32,
    pub transient_backoff: BackoffPolicy,
    pub retention: chrono::Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_pages: 10,
            page_delay_min: Duration::from_millis(2000),
            page_delay_max: Duration::from_millis(3000),
            rate_limit_backoff: Duration::from_secs(5),
            max_rate_limit_retries: 12,
            transient_backoff: BackoffPolicy::default(),
            retention: chrono::Duration::days(3),
        }
    }
}

/// One (make, model?, site, year range, sale-date window) fetch slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionUnit {
    pub make: String,
    pub model: Option<String>,
    pub site: i32,
    pub year_from: i32,
    pub year_to: i32,
    pub sale_from: NaiveDate,
    pub sale_to: NaiveDate,
}

impl CollectionUnit {
    pub fn for_job(key: &JobKey, params: &CollectionParams, today: NaiveDate) -> Self {
        let (sale_from, sale_to) = params.sale_window(today);
        Self {
            make: key.make.clone(),
            model: key.model.clone(),
            site: key.site,
            year_from: params.year_from,
            year_to: params.year_to,
            sale_from,
            sale_to,
        }
    }

    pub fn slice(&self) -> SliceQuery {
        SliceQuery {
            make: self.make.clone(),
            model: self.model.clone(),
            site: self.site,
            year_from: self.year_from,
            year_to: self.year_to,
            sale_from: self.sale_from,
            sale_to: self.sale_to,
        }
    }

    pub fn page_query(&self, page: u32, size: u32) -> PageQuery {
        PageQuery {
            make: self.make.clone(),
            model: self.model.clone(),
            site: self.site,
            year_from: self.year_from,
            year_to: self.year_to,
            sale_date_from: self.sale_from,
            sale_date_to: self.sale_to,
            page,
            size,
        }
    }
}

impl fmt::Display for CollectionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{} {}-{} [{}..{}]",
            self.make,
            self.model.as_deref().unwrap_or("*"),
            self.site,
            self.year_from,
            self.year_to,
            self.sale_from,
            self.sale_to
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum StopReason {
    /// Existing rows already cover the slice; no request was made.
    AlreadyCovered,
    /// The vendor returned an empty page.
    Exhausted,
    PageCap,
    RateLimitCeiling,
    TransientRetriesExhausted(String),
    Rejected(String),
}

impl StopReason {
    /// Whether the unit ended early and should be revisited on a later pass.
    pub fn abandoned(&self) -> bool {
        matches!(
            self,
            Self::RateLimitCeiling | Self::TransientRetriesExhausted(_) | Self::Rejected(_)
        )
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyCovered => f.write_str("already covered"),
            Self::Exhausted => f.write_str("exhausted"),
            Self::PageCap => f.write_str("page cap reached"),
            Self::RateLimitCeiling => f.write_str("rate-limit retry ceiling reached"),
            Self::TransientRetriesExhausted(err) => write!(f, "transient retries exhausted: {err}"),
            Self::Rejected(err) => write!(f, "rejected: {err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitOutcome {
    pub pages_fetched: u32,
    pub records_seen: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub write_failures: u64,
    /// Matching rows found by the pre-check when the unit was skipped.
    pub existing_rows: u64,
    pub stop: StopReason,
}

impl UnitOutcome {
    fn new(stop: StopReason) -> Self {
        Self {
            pages_fetched: 0,
            records_seen: 0,
            inserted: 0,
            duplicates: 0,
            write_failures: 0,
            existing_rows: 0,
            stop,
        }
    }

    pub fn skipped(&self) -> bool {
        self.stop == StopReason::AlreadyCovered
    }
}

/// Checks coverage for a unit, then pages through the vendor into the fresh tier.
pub struct Fetcher {
    vendor: Arc<dyn VendorClient>,
    fresh: Arc<dyn FreshStore>,
    permanent: Arc<dyn PermanentStore>,
    settings: FetchSettings,
}

impl Fetcher {
    pub fn new(
        vendor: Arc<dyn VendorClient>,
        fresh: Arc<dyn FreshStore>,
        permanent: Arc<dyn PermanentStore>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            vendor,
            fresh,
            permanent,
            settings,
        }
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Rows in either tier matching the unit's exact slice.
    pub async fn existing_rows(&self, unit: &CollectionUnit) -> Result<u64, StoreError> {
        let slice = unit.slice();
        let fresh = self.fresh.count_matching(&slice).await?;
        let permanent = self.permanent.count_matching(&slice).await?;
        Ok(fresh + permanent)
    }

    /// Skip the unit when any matching row exists, otherwise fetch it.
    pub async fn collect(&self, unit: &CollectionUnit) -> Result<UnitOutcome, StoreError> {
        let existing = self.existing_rows(unit).await?;
        if existing > 0 {
            debug!(unit = %unit, existing, "unit already covered, skipping");
            let mut outcome = UnitOutcome::new(StopReason::AlreadyCovered);
            outcome.existing_rows = existing;
            return Ok(outcome);
        }
        Ok(self.collect_unchecked(unit).await)
    }

    /// Fetch the unit without the coverage pre-check. Used for model units
    /// whose only matching rows may come from their make's probe page.
    pub async fn collect_unchecked(&self, unit: &CollectionUnit) -> UnitOutcome {
        let outcome = self.fetch_pages(unit, self.settings.max_pages).await;
        info!(
            unit = %unit,
            pages = outcome.pages_fetched,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            write_failures = outcome.write_failures,
            stop = %outcome.stop,
            "unit collected"
        );
        outcome
    }

    /// Fetch exactly one page without the coverage pre-check.
    pub async fn probe(&self, unit: &CollectionUnit) -> UnitOutcome {
        let outcome = self.fetch_pages(unit, 1).await;
        info!(unit = %unit, inserted = outcome.inserted, stop = %outcome.stop, "probe fetched");
        outcome
    }

    async fn fetch_pages(&self, unit: &CollectionUnit, max_pages: u32) -> UnitOutcome {
        let mut outcome = UnitOutcome::new(StopReason::PageCap);
        let mut page = 1;

        while page <= max_pages {
            let query = unit.page_query(page, self.settings.page_size);
            let body = match self.fetch_page_with_retry(&query).await {
                Ok(body) => body,
                Err(stop) => {
                    outcome.stop = stop;
                    return outcome;
                }
            };

            if body.is_empty() {
                outcome.stop = StopReason::Exhausted;
                return outcome;
            }

            outcome.pages_fetched += 1;
            self.store_page(unit, &body, &mut outcome).await;

            page += 1;
            if page <= max_pages {
                tokio::time::sleep(self.page_delay()).await;
            }
        }

        outcome
    }

    async fn fetch_page_with_retry(&self, query: &PageQuery) -> Result<VendorPage, StopReason> {
        let mut rate_limited = 0u32;
        let mut transient = 0usize;

        loop {
            match self.vendor.fetch_page(query).await {
                Ok(body) => return Ok(body),
                Err(VendorError::RateLimited) => {
                    rate_limited += 1;
                    if rate_limited > self.settings.max_rate_limit_retries {
                        warn!(
                            make = %query.make,
                            page = query.page,
                            retries = self.settings.max_rate_limit_retries,
                            "rate-limit ceiling hit, abandoning unit"
                        );
                        return Err(StopReason::RateLimitCeiling);
                    }
                    debug!(page = query.page, attempt = rate_limited, "rate limited, retrying page");
                    tokio::time::sleep(self.settings.rate_limit_backoff).await;
                }
                Err(VendorError::Transient(err)) => {
                    if transient >= self.settings.transient_backoff.max_retries {
                        warn!(make = %query.make, page = query.page, error = %err, "transient retries exhausted");
                        return Err(StopReason::TransientRetriesExhausted(err));
                    }
                    let delay = self.settings.transient_backoff.delay_for_attempt(transient);
                    transient += 1;
                    debug!(page = query.page, attempt = transient, error = %err, "transient vendor error, retrying page");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(make = %query.make, page = query.page, error = %err, "vendor rejected page");
                    return Err(StopReason::Rejected(err.to_string()));
                }
            }
        }
    }

    async fn store_page(&self, unit: &CollectionUnit, body: &VendorPage, outcome: &mut UnitOutcome) {
        let fetched_at = Utc::now();
        for record in &body.records {
            outcome.records_seen += 1;
            let site = record.site().unwrap_or(unit.site);
            let staged = FreshRecord::stage(
                record.lot_id(),
                site,
                record.to_sale(&unit.make),
                fetched_at,
                self.settings.retention,
            );
            match self.fresh.insert_if_absent(&staged).await {
                Ok(true) => outcome.inserted += 1,
                Ok(false) => outcome.duplicates += 1,
                Err(err) => {
                    outcome.write_failures += 1;
                    warn!(lot_id = ?staged.lot_id, site, error = %err, "fresh write failed, skipping record");
                }
            }
        }
    }

    fn page_delay(&self) -> Duration {
        let min = u64::try_from(self.settings.page_delay_min.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(self.settings.page_delay_max.as_millis()).unwrap_or(u64::MAX);
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}
