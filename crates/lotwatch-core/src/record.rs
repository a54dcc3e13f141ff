use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Denormalized vehicle and sale attributes shared by both record tiers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VehicleSale {
    pub vin: Option<String>,
    pub year: Option<i32>,
    pub make: String,
    pub model: Option<String>,
    pub series: Option<String>,
    pub odometer: Option<i64>,
    pub primary_damage: Option<String>,
    pub secondary_damage: Option<String>,
    pub title_type: Option<String>,
    pub location: Option<String>,
    pub sale_date: Option<NaiveDate>,
    pub sale_status: Option<String>,
    pub final_bid: Option<f64>,
    pub currency: Option<String>,
    pub engine: Option<String>,
    pub transmission: Option<String>,
    pub drive: Option<String>,
    pub fuel: Option<String>,
    pub color: Option<String>,
    /// Vendor payload as received.
    pub raw: serde_json::Value,
}

/// (vendor lot id, site)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub lot_id: String,
    pub site: i32,
}

/// Staging copy of a vendor sale record, exclusive until `expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshRecord {
    pub id: Uuid,
    pub lot_id: Option<String>,
    pub site: i32,
    pub sale: VehicleSale,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FreshRecord {
    pub fn stage(
        lot_id: Option<String>,
        site: i32,
        sale: VehicleSale,
        fetched_at: DateTime<Utc>,
        retention: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            lot_id: lot_id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
            site,
            sale,
            fetched_at,
            expires_at: fetched_at + retention,
        }
    }

    pub fn natural_key(&self) -> Option<NaturalKey> {
        self.lot_id.as_ref().map(|lot_id| NaturalKey {
            lot_id: lot_id.clone(),
            site: self.site,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fresh record {record_id} has no vendor lot id")]
pub struct MissingNaturalKey {
    pub record_id: Uuid,
}

/// Canonical long-lived sale record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermanentRecord {
    pub lot_id: String,
    pub site: i32,
    pub sale: VehicleSale,
    pub first_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl PermanentRecord {
    pub fn from_fresh(fresh: &FreshRecord, now: DateTime<Utc>) -> Result<Self, MissingNaturalKey> {
        let key = fresh.natural_key().ok_or(MissingNaturalKey {
            record_id: fresh.id,
        })?;
        Ok(Self {
            lot_id: key.lot_id,
            site: key.site,
            sale: fresh.sale.clone(),
            first_seen_at: fresh.fetched_at,
            created_at: now,
        })
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            lot_id: self.lot_id.clone(),
            site: self.site,
        }
    }
}

/// The exact (make, model, site, window) tuple a fetch unit covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceQuery {
    pub make: String,
    /// `None` matches every model of the make.
    pub model: Option<String>,
    pub site: i32,
    pub year_from: i32,
    pub year_to: i32,
    pub sale_from: NaiveDate,
    pub sale_to: NaiveDate,
}

impl SliceQuery {
    pub fn matches(&self, site: i32, sale: &VehicleSale) -> bool {
        if site != self.site || !sale.make.eq_ignore_ascii_case(&self.make) {
            return false;
        }
        if let Some(model) = &self.model {
            match &sale.model {
                Some(m) if m.eq_ignore_ascii_case(model) => {}
                _ => return false,
            }
        }
        let year_ok = sale
            .year
            .is_some_and(|y| (self.year_from..=self.year_to).contains(&y));
        let date_ok = sale
            .sale_date
            .is_some_and(|d| (self.sale_from..=self.sale_to).contains(&d));
        year_ok && date_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sale(make: &str, model: &str, year: i32, day: u32) -> VehicleSale {
        VehicleSale {
            make: make.into(),
            model: Some(model.into()),
            year: Some(year),
            sale_date: NaiveDate::from_ymd_opt(2026, 3, day),
            ..Default::default()
        }
    }

    fn slice(model: Option<&str>) -> SliceQuery {
        SliceQuery {
            make: "Honda".into(),
            model: model.map(Into::into),
            site: 1,
            year_from: 2015,
            year_to: 2020,
            sale_from: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            sale_to: NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
        }
    }

    #[test]
    fn slice_matches_case_insensitively_inside_window() {
        assert!(slice(Some("civic")).matches(1, &sale("HONDA", "Civic", 2018, 10)));
        assert!(slice(None).matches(1, &sale("Honda", "Accord", 2015, 31)));
    }

    #[test]
    fn slice_rejects_outside_tuple() {
        let q = slice(Some("Civic"));
        assert!(!q.matches(2, &sale("Honda", "Civic", 2018, 10)));
        assert!(!q.matches(1, &sale("Honda", "Accord", 2018, 10)));
        assert!(!q.matches(1, &sale("Honda", "Civic", 2021, 10)));
        assert!(!q.matches(1, &VehicleSale {
            sale_date: None,
            ..sale("Honda", "Civic", 2018, 10)
        }));
    }

    #[test]
    fn staging_sets_expiry_and_normalizes_lot_id() {
        let fetched = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        let rec = FreshRecord::stage(Some("  ".into()), 1, VehicleSale::default(), fetched, Duration::days(3));
        assert_eq!(rec.expires_at, fetched + Duration::days(3));
        assert!(rec.lot_id.is_none());
        assert!(!rec.is_expired(fetched));
        assert!(rec.is_expired(rec.expires_at));
        assert_eq!(
            PermanentRecord::from_fresh(&rec, fetched),
            Err(MissingNaturalKey { record_id: rec.id })
        );
    }

    #[test]
    fn permanent_record_keeps_first_seen_time() {
        let fetched = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        let now = fetched + Duration::days(4);
        let rec = FreshRecord::stage(Some("L-1".into()), 2, VehicleSale::default(), fetched, Duration::days(3));
        let perm = PermanentRecord::from_fresh(&rec, now).unwrap();
        assert_eq!(perm.natural_key(), NaturalKey { lot_id: "L-1".into(), site: 2 });
        assert_eq!(perm.first_seen_at, fetched);
        assert_eq!(perm.created_at, now);
    }
}
