use std::sync::Arc;

use chrono::Utc;
use lotwatch_core::{EnqueueOptions, JobStatus, PermanentRecord, VehicleSale};
use lotwatch_storage::{
    FreshStore, MemoryFreshStore, MemoryJobRepository, MemoryPermanentStore, PermanentStore,
};
use lotwatch_sync::{IngestConfig, RefreshMode, Runtime, Stores};
use lotwatch_vendor::testing::{sample_records, ScriptedVendor};

fn older_sale(lot_id: &str, model: &str, days_ago: u64) -> PermanentRecord {
    let now = Utc::now();
    let sale_date = now
        .date_naive()
        .checked_sub_days(chrono::Days::new(days_ago))
        .unwrap();
    PermanentRecord {
        lot_id: lot_id.into(),
        site: 1,
        sale: VehicleSale {
            make: "Honda".into(),
            model: Some(model.into()),
            year: Some(2016),
            sale_date: Some(sale_date),
            ..Default::default()
        },
        first_seen_at: now - chrono::Duration::days(days_ago as i64),
        created_at: now,
    }
}

struct Harness {
    runtime: Runtime,
    vendor: Arc<ScriptedVendor>,
    fresh: Arc<MemoryFreshStore>,
    permanent: Arc<MemoryPermanentStore>,
}

fn harness() -> Harness {
    let vendor = Arc::new(ScriptedVendor::new());
    let fresh = Arc::new(MemoryFreshStore::new());
    let permanent = Arc::new(MemoryPermanentStore::new());
    let stores = Stores {
        fresh: fresh.clone(),
        permanent: permanent.clone(),
        jobs: Arc::new(MemoryJobRepository::new()),
    };
    let config = IngestConfig {
        refresh_mode: RefreshMode::OneShot,
        poll_interval_ms: 50,
        page_size: 25,
        ..IngestConfig::default()
    };
    Harness {
        runtime: Runtime::assemble(config, stores, vendor.clone()),
        vendor,
        fresh,
        permanent,
    }
}

#[tokio::test(start_paused = true)]
async fn honda_discovery_then_civic_collection() {
    let h = harness();
    // sold two months ago: visible to discovery, outside the 30-day sale window
    for (lot, model) in [("P-1", "Civic"), ("P-2", "Civic"), ("P-3", "Civic"), ("P-4", "Accord"), ("P-5", "Accord")] {
        h.permanent.insert_if_absent(&older_sale(lot, model, 60)).await.unwrap();
    }
    let today = Utc::now().date_naive();
    h.vendor
        .push_records("Honda", Some("Civic"), 1, sample_records("Honda", "Civic", 2018, today, "civic-a", 25));
    h.vendor
        .push_records("Honda", Some("Civic"), 2, sample_records("Honda", "Civic", 2019, today, "civic-b", 10));

    let scheduler = &h.runtime.scheduler;
    let discovery = scheduler
        .enqueue(
            "Honda",
            EnqueueOptions {
                site: Some(1),
                days_back: Some(30),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let before = scheduler.get_status().await.unwrap();
    assert_eq!((before.pending_jobs, before.completed_jobs), (1, 0));

    scheduler.run_until_idle().await;

    let snapshot = scheduler.get_queue_snapshot().await;
    let models = snapshot
        .iter()
        .filter_map(|j| j.key.model.clone())
        .collect::<Vec<_>>();
    assert_eq!(models.len(), 2);
    assert!(models.contains(&"Civic".to_string()));
    assert!(models.contains(&"Accord".to_string()));

    let parent = snapshot.iter().find(|j| j.id == discovery.id).unwrap();
    assert_eq!(parent.discovered_model_count, 2);
    let civic = snapshot
        .iter()
        .find(|j| j.key.model.as_deref() == Some("Civic"))
        .unwrap();
    assert_eq!(civic.status, JobStatus::Completed);
    assert_eq!(civic.records_collected, 35);

    assert_eq!(h.vendor.requested_pages("Honda", None), Vec::<u32>::new());
    assert_eq!(&h.vendor.requested_pages("Honda", Some("Civic"))[..2], &[1, 2]);

    let rows = h.fresh.all().await;
    assert_eq!(rows.len(), 35);
    for row in &rows {
        assert_eq!(row.expires_at - row.fetched_at, chrono::Duration::days(3));
        assert_eq!(row.sale.model.as_deref(), Some("Civic"));
    }

    let after = scheduler.get_status().await.unwrap();
    assert_eq!(after.pending_jobs, 0);
    assert_eq!(after.running_jobs, 0);
    assert_eq!(after.completed_jobs, 3);
    assert_eq!(after.fresh_records, 35);
    assert_eq!(after.records_added_last_24h, 35);
    assert_eq!(after.permanent_records, 5);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_page_is_retried_in_place() {
    let h = harness();
    let today = Utc::now().date_naive();
    h.vendor
        .push_records("Toyota", Some("Corolla"), 1, sample_records("Toyota", "Corolla", 2020, today, "a", 25));
    h.vendor.push("Toyota", Some("Corolla"), 2, Err(lotwatch_vendor::VendorError::RateLimited));
    h.vendor
        .push_records("Toyota", Some("Corolla"), 2, sample_records("Toyota", "Corolla", 2020, today, "b", 5));

    h.runtime
        .scheduler
        .enqueue(
            "Toyota",
            EnqueueOptions {
                specific_model: Some("Corolla".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.runtime.scheduler.run_until_idle().await;

    let pages = h.vendor.requested_pages("Toyota", Some("Corolla"));
    assert_eq!(&pages[..3], &[1, 2, 2]);
    assert_eq!(h.fresh.count().await.unwrap(), 30);
}

#[tokio::test(start_paused = true)]
async fn expired_rows_migrate_after_collection() {
    let h = harness();
    let today = Utc::now().date_naive();
    h.vendor
        .push_records("Mazda", Some("CX-5"), 1, sample_records("Mazda", "CX-5", 2021, today, "m", 4));
    h.runtime
        .scheduler
        .enqueue(
            "Mazda",
            EnqueueOptions {
                specific_model: Some("CX-5".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.runtime.scheduler.run_until_idle().await;
    assert_eq!(h.fresh.count().await.unwrap(), 4);

    let early = h.runtime.migration.migrate_expired().await.unwrap();
    assert_eq!(early.selected, 0);

    let later = Utc::now() + chrono::Duration::days(3) + chrono::Duration::seconds(1);
    let report = h.runtime.migration.migrate_expired_at(later).await.unwrap();
    assert_eq!((report.inserted, report.deleted), (4, 4));
    assert_eq!(h.fresh.count().await.unwrap(), 0);
    assert_eq!(h.permanent.count().await.unwrap(), 4);

    let status = h.runtime.scheduler.get_status().await.unwrap();
    assert_eq!(status.permanent_records, 4);
}
