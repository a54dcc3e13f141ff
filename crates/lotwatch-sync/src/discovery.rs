use std::sync::Arc;

use chrono::NaiveDate;
use lotwatch_core::{CollectionParams, JobKey};
use lotwatch_storage::{merge_model_counts, FreshStore, PermanentStore, StoreError};
use serde::Serialize;
use tracing::{debug, info};

use crate::fetcher::{CollectionUnit, Fetcher, UnitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoverySettings {
    /// Upper bound on models returned per make.
    pub cap: usize,
    pub window_days: u32,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            cap: 100,
            window_days: 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryResult {
    pub models: Vec<String>,
    /// Set when the permanent tier had nothing and a probe page was fetched.
    pub probe: Option<UnitOutcome>,
}

/// Builds the candidate model list for a make from what the stores have seen.
///
/// Models the vendor has never returned for this make, and that are missing
/// from the single probe page, stay invisible until a later pass.
pub struct Discovery {
    fresh: Arc<dyn FreshStore>,
    permanent: Arc<dyn PermanentStore>,
    settings: DiscoverySettings,
}

impl Discovery {
    pub fn new(
        fresh: Arc<dyn FreshStore>,
        permanent: Arc<dyn PermanentStore>,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            fresh,
            permanent,
            settings,
        }
    }

    pub async fn discover(
        &self,
        fetcher: &Fetcher,
        make: &str,
        site: i32,
        params: &CollectionParams,
        today: NaiveDate,
    ) -> Result<DiscoveryResult, StoreError> {
        let since = today
            .checked_sub_days(chrono::Days::new(u64::from(self.settings.window_days)))
            .unwrap_or(NaiveDate::MIN);

        let known = self
            .permanent
            .model_counts(make, since, self.settings.cap)
            .await?;
        if !known.is_empty() {
            let models = merge_model_counts(&[known], self.settings.cap)
                .into_iter()
                .map(|m| m.model)
                .collect::<Vec<_>>();
            debug!(make, models = models.len(), "models found in permanent tier");
            return Ok(DiscoveryResult {
                models,
                probe: None,
            });
        }

        let unit = CollectionUnit::for_job(&JobKey::new(make, None, site), params, today);
        let probe = fetcher.probe(&unit).await;

        let permanent = self
            .permanent
            .model_counts(make, since, self.settings.cap)
            .await?;
        let fresh = self.fresh.model_counts(make, since, self.settings.cap).await?;
        let models = merge_model_counts(&[permanent, fresh], self.settings.cap)
            .into_iter()
            .map(|m| m.model)
            .collect::<Vec<_>>();

        info!(make, site, models = models.len(), probe_inserted = probe.inserted, "models discovered after probe");
        Ok(DiscoveryResult {
            models,
            probe: Some(probe),
        })
    }
}
