use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, Utc};
use futures_util::{stream, StreamExt};
use lotwatch_core::{EnqueueOptions, JobKey};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::catalogue::{MakeCatalogue, MakeEntry};
use crate::discovery::Discovery;
use crate::fetcher::{CollectionUnit, Fetcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub concurrency: usize,
    /// Start offset added per concurrency slot.
    pub stagger: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            stagger: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub tier: u8,
    pub units: usize,
    pub skipped: usize,
    pub abandoned: usize,
    pub records_inserted: u64,
    pub failed_units: usize,
    pub discovered_models: usize,
}

/// A unit plus whether it goes through the coverage pre-check. Units fanned
/// out from a probe page that wrote rows skip it, as those rows overlap
/// their slice.
struct BatchUnit {
    unit: CollectionUnit,
    checked: bool,
}

/// Runs every unit of one catalogue tier outside the job queue.
pub struct AutoCollector {
    fetcher: Arc<Fetcher>,
    discovery: Arc<Discovery>,
    catalogue: MakeCatalogue,
    defaults: EnqueueOptions,
    settings: BatchSettings,
}

impl AutoCollector {
    pub fn new(
        fetcher: Arc<Fetcher>,
        discovery: Arc<Discovery>,
        catalogue: MakeCatalogue,
        defaults: EnqueueOptions,
        settings: BatchSettings,
    ) -> Self {
        Self {
            fetcher,
            discovery,
            catalogue,
            defaults,
            settings: BatchSettings {
                concurrency: settings.concurrency.max(1),
                ..settings
            },
        }
    }

    pub async fn collect_tier(&self, tier: u8) -> BatchReport {
        let today = Utc::now().date_naive();
        let mut report = BatchReport {
            tier,
            ..Default::default()
        };

        let mut units = Vec::new();
        for entry in self.catalogue.in_tier(tier) {
            units.extend(self.units_for(entry, today, &mut report).await);
        }
        report.units = units.len();
        info!(tier, units = units.len(), "batch collection starting");

        let concurrency = self.settings.concurrency;
        let stagger = self.settings.stagger;
        let outcomes = stream::iter(units.into_iter().enumerate())
            .map(|(i, BatchUnit { unit, checked })| {
                let fetcher = self.fetcher.clone();
                let delay = stagger.saturating_mul((i % concurrency) as u32);
                let span = info_span!(
                    "batch_unit",
                    make = %unit.make,
                    model = unit.model.as_deref().unwrap_or("*"),
                    site = unit.site
                );
                async move {
                    tokio::time::sleep(delay).await;
                    let result = if checked {
                        fetcher.collect(&unit).await
                    } else {
                        Ok(fetcher.collect_unchecked(&unit).await)
                    };
                    (unit, result)
                }
                .instrument(span)
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;

        for (unit, result) in outcomes {
            match result {
                Ok(outcome) => {
                    report.records_inserted += outcome.inserted;
                    if outcome.skipped() {
                        report.skipped += 1;
                    } else if outcome.stop.abandoned() {
                        report.abandoned += 1;
                    }
                }
                Err(err) => {
                    report.failed_units += 1;
                    warn!(unit = %unit, error = %err, "batch unit failed");
                }
            }
        }

        info!(
            tier,
            units = report.units,
            skipped = report.skipped,
            inserted = report.records_inserted,
            failed = report.failed_units,
            "batch collection finished"
        );
        report
    }

    /// Fixed models expand directly; makes without a list go through discovery.
    async fn units_for(
        &self,
        entry: &MakeEntry,
        today: NaiveDate,
        report: &mut BatchReport,
    ) -> Vec<BatchUnit> {
        let mut units = Vec::new();
        for &site in &entry.sites {
            let options = EnqueueOptions {
                site: Some(site),
                ..self.defaults.clone()
            };
            let validated = match options.validate(&entry.make, today.year()) {
                Ok(validated) => validated,
                Err(err) => {
                    report.failed_units += 1;
                    warn!(make = %entry.make, site, error = %err, "invalid batch defaults");
                    continue;
                }
            };

            let mut checked = true;
            let models = if entry.needs_discovery() {
                match self
                    .discovery
                    .discover(&self.fetcher, &entry.make, site, &validated.params, today)
                    .await
                {
                    Ok(found) => {
                        report.discovered_models += found.models.len();
                        if let Some(probe) = found.probe {
                            report.records_inserted += probe.inserted;
                            checked = probe.inserted == 0;
                        }
                        found.models
                    }
                    Err(err) => {
                        report.failed_units += 1;
                        warn!(make = %entry.make, site, error = %err, "batch discovery failed");
                        continue;
                    }
                }
            } else {
                entry.models.clone()
            };

            units.extend(models.into_iter().map(|model| {
                let key = JobKey::new(&entry.make, Some(model), site);
                BatchUnit {
                    unit: CollectionUnit::for_job(&key, &validated.params, today),
                    checked,
                }
            }));
        }
        units
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotwatch_storage::{FreshStore, MemoryFreshStore, MemoryPermanentStore};
    use lotwatch_vendor::testing::{sample_records, ScriptedVendor};
    use lotwatch_vendor::VendorError;

    use crate::discovery::DiscoverySettings;
    use crate::fetcher::FetchSettings;

    struct Fixture {
        vendor: Arc<ScriptedVendor>,
        fresh: Arc<MemoryFreshStore>,
        collector: AutoCollector,
    }

    fn fixture(yaml: &str, settings: BatchSettings) -> Fixture {
        let vendor = Arc::new(ScriptedVendor::new());
        let fresh = Arc::new(MemoryFreshStore::new());
        let permanent = Arc::new(MemoryPermanentStore::new());
        let fetcher = Arc::new(Fetcher::new(
            vendor.clone(),
            fresh.clone(),
            permanent.clone(),
            FetchSettings {
                page_delay_min: Duration::from_millis(10),
                page_delay_max: Duration::from_millis(10),
                ..Default::default()
            },
        ));
        let discovery = Arc::new(Discovery::new(
            fresh.clone(),
            permanent,
            DiscoverySettings::default(),
        ));
        let collector = AutoCollector::new(
            fetcher,
            discovery,
            MakeCatalogue::from_yaml_str(yaml).unwrap(),
            EnqueueOptions::default(),
            settings,
        );
        Fixture {
            vendor,
            fresh,
            collector,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn collects_fixed_models_in_one_tier() {
        let f = fixture(
            "makes:\n  - make: Honda\n    models: [Civic, Accord]\n  - make: Kia\n    tier: 2\n    models: [Rio]\n",
            BatchSettings::default(),
        );
        let day = Utc::now().date_naive();
        f.vendor
            .push_records("Honda", Some("Civic"), 1, sample_records("Honda", "Civic", 2018, day, "c", 5));
        f.vendor
            .push_records("Honda", Some("Accord"), 1, sample_records("Honda", "Accord", 2019, day, "a", 3));

        let report = f.collector.collect_tier(1).await;
        assert_eq!(report.units, 2);
        assert_eq!(report.records_inserted, 8);
        assert_eq!(report.failed_units, 0);
        assert_eq!(f.fresh.count().await.unwrap(), 8);
        assert!(f.vendor.requested_pages("Kia", Some("Rio")).is_empty());

        let again = f.collector.collect_tier(1).await;
        assert_eq!((again.skipped, again.records_inserted), (2, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_expands_makes_without_models() {
        let f = fixture("makes:\n  - make: Subaru\n", BatchSettings::default());
        let day = Utc::now().date_naive();
        let mut probe = sample_records("Subaru", "Outback", 2019, day, "o", 2);
        probe.extend(sample_records("Subaru", "Forester", 2020, day, "f", 1));
        f.vendor.push_records("Subaru", None, 1, probe);

        let report = f.collector.collect_tier(1).await;
        assert_eq!(report.discovered_models, 2);
        assert_eq!(report.units, 2);
        assert_eq!(report.records_inserted, 3);
        assert_eq!(report.skipped, 0);
        assert_eq!(f.vendor.requested_pages("Subaru", Some("Outback")), vec![1]);
        assert_eq!(f.vendor.requested_pages("Subaru", Some("Forester")), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn discovered_models_collect_beyond_the_first_page() {
        let f = fixture("makes:\n  - make: Subaru\n", BatchSettings::default());
        let day = Utc::now().date_naive();
        f.vendor
            .push_records("Subaru", None, 1, sample_records("Subaru", "Outback", 2019, day, "o", 2));
        f.vendor.push_records(
            "Subaru",
            Some("Outback"),
            1,
            sample_records("Subaru", "Outback", 2019, day, "o", 2),
        );
        f.vendor.push_records(
            "Subaru",
            Some("Outback"),
            2,
            sample_records("Subaru", "Outback", 2019, day, "x", 3),
        );

        let report = f.collector.collect_tier(1).await;
        assert_eq!(report.units, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.records_inserted, 5);
        assert_eq!(f.vendor.requested_pages("Subaru", Some("Outback")), vec![1, 2, 3]);

        let again = f.collector.collect_tier(1).await;
        assert_eq!((again.skipped, again.records_inserted), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_unit_does_not_stop_the_batch() {
        let f = fixture(
            "makes:\n  - make: Honda\n    models: [Civic, Fit]\n",
            BatchSettings {
                concurrency: 1,
                stagger: Duration::from_millis(100),
            },
        );
        let day = Utc::now().date_naive();
        f.vendor.push(
            "Honda",
            Some("Civic"),
            1,
            Err(VendorError::Rejected {
                status: 400,
                body: "bad model".into(),
            }),
        );
        f.vendor
            .push_records("Honda", Some("Fit"), 1, sample_records("Honda", "Fit", 2017, day, "f", 4));

        let report = f.collector.collect_tier(1).await;
        assert_eq!(report.units, 2);
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.records_inserted, 4);
    }
}
