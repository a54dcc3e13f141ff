use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const MIN_MODEL_YEAR: i32 = 1990;
pub const MAX_DAYS_BACK: u32 = 365;
pub const KNOWN_SITES: [i32; 2] = [1, 2];

pub const DEFAULT_DAYS_BACK: u32 = 30;
pub const DEFAULT_YEAR_SPAN: i32 = 15;
pub const DEFAULT_SITE: i32 = 1;
pub const DEFAULT_PRIORITY: u8 = 1;

/// Identity of a collection job. A job without a model is a discovery job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub make: String,
    pub model: Option<String>,
    pub site: i32,
}

impl JobKey {
    pub fn new(make: impl Into<String>, model: Option<String>, site: i32) -> Self {
        let make = make.into().trim().to_string();
        let model = model
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());
        Self { make, model, site }
    }

    /// Deterministic job id; keys differing only by case map to the same job.
    pub fn job_id(&self) -> Uuid {
        let source = format!(
            "{}:{}:{}",
            self.make.to_ascii_lowercase(),
            self.model
                .as_deref()
                .map(str::to_ascii_lowercase)
                .unwrap_or_default(),
            self.site
        );
        Uuid::new_v5(&Uuid::NAMESPACE_OID, source.as_bytes())
    }

    pub fn is_discovery(&self) -> bool {
        self.model.is_none()
    }

    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self::new(self.make.clone(), Some(model.into()), self.site)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.make,
            self.model.as_deref().unwrap_or("*"),
            self.site
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status {other:?}")),
        }
    }
}

/// Year range and look-back window a job collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionParams {
    pub year_from: i32,
    pub year_to: i32,
    pub days_back: u32,
}

impl CollectionParams {
    /// Inclusive sale-date window ending at `today`.
    pub fn sale_window(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let from = today
            .checked_sub_days(Days::new(u64::from(self.days_back)))
            .unwrap_or(NaiveDate::MIN);
        (from, today)
    }
}

/// Caller-supplied options for `enqueue`; unset fields take defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    #[serde(default)]
    pub year_from: Option<i32>,
    #[serde(default)]
    pub year_to: Option<i32>,
    #[serde(default)]
    pub days_back: Option<u32>,
    #[serde(default)]
    pub site: Option<i32>,
    #[serde(default)]
    pub specific_model: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("make must not be blank")]
    EmptyMake,
    #[error("{field} {value} outside {min}..={max}")]
    YearOutOfRange {
        field: &'static str,
        value: i32,
        min: i32,
        max: i32,
    },
    #[error("year_to {year_to} is before year_from {year_from}")]
    YearRangeInverted { year_from: i32, year_to: i32 },
    #[error("days_back {value} outside 1..={max}")]
    DaysBackOutOfRange { value: u32, max: u32 },
    #[error("unknown auction site {0}")]
    UnknownSite(i32),
}

/// Output of a successful validation: everything needed to upsert a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedEnqueue {
    pub key: JobKey,
    pub params: CollectionParams,
    pub priority: u8,
}

impl EnqueueOptions {
    pub fn validate(
        &self,
        make: &str,
        current_year: i32,
    ) -> Result<ValidatedEnqueue, ValidationError> {
        let make = make.trim();
        if make.is_empty() {
            return Err(ValidationError::EmptyMake);
        }

        let year_from = self
            .year_from
            .unwrap_or((current_year - DEFAULT_YEAR_SPAN).max(MIN_MODEL_YEAR));
        let year_to = self.year_to.unwrap_or(current_year);
        for (field, value) in [("year_from", year_from), ("year_to", year_to)] {
            if !(MIN_MODEL_YEAR..=current_year).contains(&value) {
                return Err(ValidationError::YearOutOfRange {
                    field,
                    value,
                    min: MIN_MODEL_YEAR,
                    max: current_year,
                });
            }
        }
        if year_to < year_from {
            return Err(ValidationError::YearRangeInverted { year_from, year_to });
        }

        let days_back = self.days_back.unwrap_or(DEFAULT_DAYS_BACK);
        if !(1..=MAX_DAYS_BACK).contains(&days_back) {
            return Err(ValidationError::DaysBackOutOfRange {
                value: days_back,
                max: MAX_DAYS_BACK,
            });
        }

        let site = self.site.unwrap_or(DEFAULT_SITE);
        if !KNOWN_SITES.contains(&site) {
            return Err(ValidationError::UnknownSite(site));
        }

        Ok(ValidatedEnqueue {
            key: JobKey::new(make, self.specific_model.clone(), site),
            params: CollectionParams {
                year_from,
                year_to,
                days_back,
            },
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
        })
    }
}

/// One unit of ingestion work keyed by (make, model, site).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionJob {
    pub id: Uuid,
    pub key: JobKey,
    pub priority: u8,
    pub status: JobStatus,
    pub params: CollectionParams,
    pub last_collected_at: Option<DateTime<Utc>>,
    pub discovered_model_count: u32,
    pub records_collected: u64,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CollectionJob {
    pub fn new(key: JobKey, params: CollectionParams, priority: u8, now: DateTime<Utc>) -> Self {
        Self {
            id: key.job_id(),
            key,
            priority,
            status: JobStatus::Pending,
            params,
            last_collected_at: None,
            discovered_model_count: 0,
            records_collected: 0,
            last_duration_ms: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Dispatch order: lower tier first, then never-collected, then least recently collected.
    pub fn dispatch_cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| match (self.last_collected_at, other.last_collected_at) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(&b),
            })
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    #[test]
    fn rejects_year_below_floor() {
        let opts = EnqueueOptions {
            year_from: Some(1980),
            ..Default::default()
        };
        assert_eq!(
            opts.validate("Toyota", 2026),
            Err(ValidationError::YearOutOfRange {
                field: "year_from",
                value: 1980,
                min: MIN_MODEL_YEAR,
                max: 2026,
            })
        );
    }

    #[test]
    fn rejects_future_year_and_inverted_range() {
        let future = EnqueueOptions {
            year_to: Some(2027),
            ..Default::default()
        };
        assert!(matches!(
            future.validate("Ford", 2026),
            Err(ValidationError::YearOutOfRange { field: "year_to", .. })
        ));

        let inverted = EnqueueOptions {
            year_from: Some(2020),
            year_to: Some(2015),
            ..Default::default()
        };
        assert_eq!(
            inverted.validate("Ford", 2026),
            Err(ValidationError::YearRangeInverted {
                year_from: 2020,
                year_to: 2015
            })
        );
    }

    #[test]
    fn days_back_bounds_are_inclusive() {
        for (days, ok) in [(0, false), (1, true), (365, true), (366, false)] {
            let opts = EnqueueOptions {
                days_back: Some(days),
                ..Default::default()
            };
            assert_eq!(opts.validate("Kia", 2026).is_ok(), ok, "days_back={days}");
        }
    }

    #[test]
    fn defaults_fill_unset_fields() {
        let validated = EnqueueOptions::default().validate("  Honda ", 2026).unwrap();
        assert_eq!(validated.key, JobKey::new("Honda", None, DEFAULT_SITE));
        assert_eq!(
            validated.params,
            CollectionParams {
                year_from: 2011,
                year_to: 2026,
                days_back: DEFAULT_DAYS_BACK
            }
        );
        assert_eq!(validated.priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn blank_make_and_unknown_site_are_rejected() {
        assert_eq!(
            EnqueueOptions::default().validate("   ", 2026),
            Err(ValidationError::EmptyMake)
        );
        let opts = EnqueueOptions {
            site: Some(9),
            ..Default::default()
        };
        assert_eq!(opts.validate("Mazda", 2026), Err(ValidationError::UnknownSite(9)));
    }

    #[test]
    fn job_id_ignores_case_and_whitespace() {
        let a = JobKey::new("Honda", Some("Civic".into()), 1);
        let b = JobKey::new("honda ", Some(" CIVIC".into()), 1);
        let c = JobKey::new("Honda", Some("Civic".into()), 2);
        assert_eq!(a.job_id(), b.job_id());
        assert_ne!(a.job_id(), c.job_id());
        assert!(JobKey::new("Honda", Some("  ".into()), 1).is_discovery());
    }

    #[test]
    fn dispatch_prefers_tier_then_oldest_collection() {
        let params = CollectionParams {
            year_from: 2015,
            year_to: 2020,
            days_back: 30,
        };
        let mut tier2 = CollectionJob::new(JobKey::new("BMW", None, 1), params, 2, ts(1));
        let mut stale = CollectionJob::new(JobKey::new("Audi", None, 1), params, 1, ts(1));
        let fresh = CollectionJob::new(JobKey::new("Kia", None, 1), params, 1, ts(2));
        stale.last_collected_at = Some(ts(3));
        tier2.last_collected_at = None;

        let mut jobs = vec![tier2.clone(), stale.clone(), fresh.clone()];
        jobs.sort_by(CollectionJob::dispatch_cmp);
        let order: Vec<_> = jobs.iter().map(|j| j.key.make.as_str()).collect();
        assert_eq!(order, vec!["Kia", "Audi", "BMW"]);
    }

    #[test]
    fn sale_window_spans_days_back() {
        let params = CollectionParams {
            year_from: 2015,
            year_to: 2020,
            days_back: 30,
        };
        let today = NaiveDate::from_ymd_opt(2026, 3, 31).unwrap();
        assert_eq!(
            params.sale_window(today),
            (NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(), today)
        );
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }
}
