use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use lotwatch_core::{
    CollectionJob, CollectionParams, FreshRecord, JobKey, JobStatus, PermanentRecord, SliceQuery,
    VehicleSale,
};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    FreshStore, JobRepository, ModelCount, PermanentStore, StoreError, StoreResult,
};

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

const SALE_COLUMNS: &str = "vin, year, make, model, series, odometer, primary_damage, \
    secondary_damage, title_type, location, sale_date, sale_status, final_bid, currency, \
    engine, transmission, drive, fuel, color, raw";

pub async fn connect(database_url: &str) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    info!("database migrations applied");
    Ok(())
}

fn placeholders(from: usize, count: usize) -> String {
    (from..from + count)
        .map(|n| format!("${n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn bind_sale<'q>(query: PgQuery<'q>, sale: &VehicleSale) -> PgQuery<'q> {
    query
        .bind(sale.vin.clone())
        .bind(sale.year)
        .bind(sale.make.clone())
        .bind(sale.model.clone())
        .bind(sale.series.clone())
        .bind(sale.odometer)
        .bind(sale.primary_damage.clone())
        .bind(sale.secondary_damage.clone())
        .bind(sale.title_type.clone())
        .bind(sale.location.clone())
        .bind(sale.sale_date)
        .bind(sale.sale_status.clone())
        .bind(sale.final_bid)
        .bind(sale.currency.clone())
        .bind(sale.engine.clone())
        .bind(sale.transmission.clone())
        .bind(sale.drive.clone())
        .bind(sale.fuel.clone())
        .bind(sale.color.clone())
        .bind(sale.raw.clone())
}

fn sale_from_row(row: &PgRow) -> Result<VehicleSale, sqlx::Error> {
    Ok(VehicleSale {
        vin: row.try_get("vin")?,
        year: row.try_get("year")?,
        make: row.try_get("make")?,
        model: row.try_get("model")?,
        series: row.try_get("series")?,
        odometer: row.try_get("odometer")?,
        primary_damage: row.try_get("primary_damage")?,
        secondary_damage: row.try_get("secondary_damage")?,
        title_type: row.try_get("title_type")?,
        location: row.try_get("location")?,
        sale_date: row.try_get("sale_date")?,
        sale_status: row.try_get("sale_status")?,
        final_bid: row.try_get("final_bid")?,
        currency: row.try_get("currency")?,
        engine: row.try_get("engine")?,
        transmission: row.try_get("transmission")?,
        drive: row.try_get("drive")?,
        fuel: row.try_get("fuel")?,
        color: row.try_get("color")?,
        raw: row.try_get("raw")?,
    })
}

fn non_negative(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

async fn count_slice(pool: &PgPool, table: &str, slice: &SliceQuery) -> StoreResult<u64> {
    let sql = format!(
        r#"
        SELECT COUNT(*) AS n
          FROM {table}
         WHERE site = $1
           AND lower(make) = lower($2)
           AND ($3::TEXT IS NULL OR lower(model) = lower($3))
           AND year BETWEEN $4 AND $5
           AND sale_date BETWEEN $6 AND $7
        "#
    );
    let row = sqlx::query(&sql)
        .bind(slice.site)
        .bind(&slice.make)
        .bind(slice.model.as_deref())
        .bind(slice.year_from)
        .bind(slice.year_to)
        .bind(slice.sale_from)
        .bind(slice.sale_to)
        .fetch_one(pool)
        .await?;
    Ok(non_negative(row.try_get("n")?))
}

async fn model_counts_in(
    pool: &PgPool,
    table: &str,
    make: &str,
    since: NaiveDate,
    limit: usize,
) -> StoreResult<Vec<ModelCount>> {
    let sql = format!(
        r#"
        SELECT model, COUNT(*) AS n
          FROM {table}
         WHERE lower(make) = lower($1)
           AND model IS NOT NULL
           AND btrim(model) <> ''
           AND sale_date >= $2
         GROUP BY model
         ORDER BY n DESC, model ASC
         LIMIT $3
        "#
    );
    let rows = sqlx::query(&sql)
        .bind(make)
        .bind(since)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(pool)
        .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(ModelCount {
            model: row.try_get("model")?,
            records: non_negative(row.try_get("n")?),
        });
    }
    Ok(out)
}

async fn count_table(pool: &PgPool, sql: &str) -> StoreResult<u64> {
    let row = sqlx::query(sql).fetch_one(pool).await?;
    Ok(non_negative(row.try_get("n")?))
}

#[derive(Debug, Clone)]
pub struct PgFreshStore {
    pool: PgPool,
}

impl PgFreshStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FreshStore for PgFreshStore {
    async fn insert_if_absent(&self, record: &FreshRecord) -> StoreResult<bool> {
        let sql = format!(
            "INSERT INTO fresh_records (id, lot_id, site, {SALE_COLUMNS}, fetched_at, expires_at) \
             VALUES ({}) ON CONFLICT (lot_id, site) DO NOTHING",
            placeholders(1, 25)
        );
        let query = sqlx::query(&sql)
            .bind(record.id)
            .bind(record.lot_id.clone())
            .bind(record.site);
        let result = bind_sale(query, &record.sale)
            .bind(record.fetched_at)
            .bind(record.expires_at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_matching(&self, slice: &SliceQuery) -> StoreResult<u64> {
        count_slice(&self.pool, "fresh_records", slice).await
    }

    async fn select_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<FreshRecord>> {
        let sql = format!(
            "SELECT id, lot_id, site, {SALE_COLUMNS}, fetched_at, expires_at \
               FROM fresh_records \
              WHERE expires_at <= $1 \
              ORDER BY expires_at, id"
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(FreshRecord {
                id: row.try_get("id")?,
                lot_id: row.try_get("lot_id")?,
                site: row.try_get("site")?,
                sale: sale_from_row(&row)?,
                fetched_at: row.try_get("fetched_at")?,
                expires_at: row.try_get("expires_at")?,
            });
        }
        Ok(out)
    }

    async fn delete_by_ids(&self, ids: &[Uuid]) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM fresh_records WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .execute(&self.pool)
            .await?;
        debug!(deleted = result.rows_affected(), "fresh rows deleted");
        Ok(result.rows_affected())
    }

    async fn model_counts(
        &self,
        make: &str,
        since: NaiveDate,
        limit: usize,
    ) -> StoreResult<Vec<ModelCount>> {
        model_counts_in(&self.pool, "fresh_records", make, since, limit).await
    }

    async fn count(&self) -> StoreResult<u64> {
        count_table(&self.pool, "SELECT COUNT(*) AS n FROM fresh_records").await
    }

    async fn count_fetched_since(&self, since: DateTime<Utc>) -> StoreResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM fresh_records WHERE fetched_at >= $1")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(non_negative(row.try_get("n")?))
    }
}

#[derive(Debug, Clone)]
pub struct PgPermanentStore {
    pool: PgPool,
}

impl PgPermanentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PermanentStore for PgPermanentStore {
    async fn insert_if_absent(&self, record: &PermanentRecord) -> StoreResult<bool> {
        let sql = format!(
            "INSERT INTO permanent_records (lot_id, site, {SALE_COLUMNS}, first_seen_at, created_at) \
             VALUES ({}) ON CONFLICT (lot_id, site) DO NOTHING",
            placeholders(1, 24)
        );
        let query = sqlx::query(&sql)
            .bind(record.lot_id.clone())
            .bind(record.site);
        let result = bind_sale(query, &record.sale)
            .bind(record.first_seen_at)
            .bind(record.created_at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_matching(&self, slice: &SliceQuery) -> StoreResult<u64> {
        count_slice(&self.pool, "permanent_records", slice).await
    }

    async fn model_counts(
        &self,
        make: &str,
        since: NaiveDate,
        limit: usize,
    ) -> StoreResult<Vec<ModelCount>> {
        model_counts_in(&self.pool, "permanent_records", make, since, limit).await
    }

    async fn count(&self) -> StoreResult<u64> {
        count_table(&self.pool, "SELECT COUNT(*) AS n FROM permanent_records").await
    }
}

#[derive(Debug, Clone)]
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn job_from_row(row: &PgRow) -> StoreResult<CollectionJob> {
    let status: String = row.try_get("status")?;
    let status = status.parse::<JobStatus>().map_err(StoreError::Decode)?;
    let priority: i16 = row.try_get("priority")?;
    let days_back: i32 = row.try_get("days_back")?;
    let discovered: i32 = row.try_get("discovered_model_count")?;
    let records: i64 = row.try_get("records_collected")?;
    let duration: Option<i64> = row.try_get("last_duration_ms")?;

    Ok(CollectionJob {
        id: row.try_get("id")?,
        key: JobKey::new(
            row.try_get::<String, _>("make")?,
            row.try_get("model")?,
            row.try_get("site")?,
        ),
        priority: u8::try_from(priority)
            .map_err(|_| StoreError::Decode(format!("priority {priority} out of range")))?,
        status,
        params: CollectionParams {
            year_from: row.try_get("year_from")?,
            year_to: row.try_get("year_to")?,
            days_back: u32::try_from(days_back)
                .map_err(|_| StoreError::Decode(format!("days_back {days_back} out of range")))?,
        },
        last_collected_at: row.try_get("last_collected_at")?,
        discovered_model_count: u32::try_from(discovered).unwrap_or(0),
        records_collected: non_negative(records),
        last_duration_ms: duration.map(non_negative),
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn load_jobs(&self) -> StoreResult<Vec<CollectionJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id, make, model, site, priority, status, year_from, year_to, days_back,
                   last_collected_at, discovered_model_count, records_collected,
                   last_duration_ms, last_error, created_at, updated_at
              FROM collection_jobs
             ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn save_job(&self, job: &CollectionJob) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO collection_jobs (
                id, make, model, site, priority, status, year_from, year_to, days_back,
                last_collected_at, discovered_model_count, records_collected,
                last_duration_ms, last_error, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (id) DO UPDATE SET
                priority = EXCLUDED.priority,
                status = EXCLUDED.status,
                year_from = EXCLUDED.year_from,
                year_to = EXCLUDED.year_to,
                days_back = EXCLUDED.days_back,
                last_collected_at = EXCLUDED.last_collected_at,
                discovered_model_count = EXCLUDED.discovered_model_count,
                records_collected = EXCLUDED.records_collected,
                last_duration_ms = EXCLUDED.last_duration_ms,
                last_error = EXCLUDED.last_error,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(job.id)
        .bind(&job.key.make)
        .bind(job.key.model.as_deref())
        .bind(job.key.site)
        .bind(i16::from(job.priority))
        .bind(job.status.as_str())
        .bind(job.params.year_from)
        .bind(job.params.year_to)
        .bind(i32::try_from(job.params.days_back).unwrap_or(i32::MAX))
        .bind(job.last_collected_at)
        .bind(i32::try_from(job.discovered_model_count).unwrap_or(i32::MAX))
        .bind(i64::try_from(job.records_collected).unwrap_or(i64::MAX))
        .bind(
            job.last_duration_ms
                .map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)),
        )
        .bind(job.last_error.as_deref())
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_sequential() {
        assert_eq!(placeholders(1, 3), "$1, $2, $3");
        assert_eq!(placeholders(4, 1), "$4");
    }

    #[test]
    fn sale_columns_cover_every_bound_attribute() {
        assert_eq!(SALE_COLUMNS.split(',').count(), 20);
    }

    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = connect(&url).await.expect("connect to DATABASE_URL");
        run_migrations(&pool).await.expect("apply migrations");
        Some(pool)
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL pointing at a disposable postgres"]
    async fn fresh_to_permanent_round_trip() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let fresh = PgFreshStore::new(pool.clone());
        let permanent = PgPermanentStore::new(pool.clone());

        let make = format!("Roundtrip{}", Uuid::new_v4().simple());
        let sale_date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let fetched_at = Utc::now() - chrono::Duration::days(10);
        let staged = FreshRecord::stage(
            Some(format!("lot-{}", Uuid::new_v4())),
            2,
            VehicleSale {
                make: make.clone(),
                model: Some("Civic".into()),
                year: Some(2018),
                sale_date: Some(sale_date),
                ..Default::default()
            },
            fetched_at,
            chrono::Duration::days(3),
        );

        assert!(fresh.insert_if_absent(&staged).await.unwrap());
        let mut again = staged.clone();
        again.id = Uuid::new_v4();
        assert!(!fresh.insert_if_absent(&again).await.unwrap());

        let slice = SliceQuery {
            make: make.to_lowercase(),
            model: Some("CIVIC".into()),
            site: 2,
            year_from: 2015,
            year_to: 2020,
            sale_from: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            sale_to: NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
        };
        assert_eq!(fresh.count_matching(&slice).await.unwrap(), 1);
        let counts = fresh.model_counts(&make, sale_date, 10).await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].records, 1);

        let expired = fresh.select_expired(Utc::now()).await.unwrap();
        let row = expired
            .iter()
            .find(|r| r.id == staged.id)
            .expect("staged row is past its expiry");
        assert_eq!(row.lot_id, staged.lot_id);
        assert_eq!(row.sale.make, make);
        assert_eq!(row.sale.sale_date, Some(sale_date));

        let record = PermanentRecord::from_fresh(row, Utc::now()).unwrap();
        assert!(permanent.insert_if_absent(&record).await.unwrap());
        assert!(!permanent.insert_if_absent(&record).await.unwrap());
        assert_eq!(permanent.count_matching(&slice).await.unwrap(), 1);

        assert_eq!(fresh.delete_by_ids(&[staged.id]).await.unwrap(), 1);
        assert_eq!(fresh.count_matching(&slice).await.unwrap(), 0);
        assert_eq!(fresh.delete_by_ids(&[]).await.unwrap(), 0);

        sqlx::query("DELETE FROM permanent_records WHERE make = $1")
            .bind(&make)
            .execute(&pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL pointing at a disposable postgres"]
    async fn jobs_round_trip_through_the_repository() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let repo = PgJobRepository::new(pool.clone());
        let make = format!("Roundtrip{}", Uuid::new_v4().simple());
        let params = CollectionParams {
            year_from: 2015,
            year_to: 2020,
            days_back: 30,
        };
        let mut job = CollectionJob::new(JobKey::new(&make, Some("Civic".into()), 1), params, 2, Utc::now());
        repo.save_job(&job).await.unwrap();

        job.status = JobStatus::Completed;
        job.records_collected = 42;
        job.last_error = Some("rate limited".into());
        repo.save_job(&job).await.unwrap();

        let loaded = repo.load_jobs().await.unwrap();
        let found = loaded.iter().find(|j| j.id == job.id).unwrap();
        assert_eq!(found.key, job.key);
        assert_eq!(found.status, JobStatus::Completed);
        assert_eq!(found.records_collected, 42);
        assert_eq!(found.params, params);
        assert_eq!(found.last_error.as_deref(), Some("rate limited"));

        sqlx::query("DELETE FROM collection_jobs WHERE id = $1")
            .bind(job.id)
            .execute(&pool)
            .await
            .unwrap();
    }
}
