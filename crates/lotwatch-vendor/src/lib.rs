//! Vendor client contract + reqwest-backed implementation for the auction-data API.

mod http;
mod record;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, HttpVendorClient, HttpVendorConfig,
    RetryDisposition, SimpleTokenBucket, TokenBucketConfig,
};
pub use record::{parse_page_body, VendorRecord};

pub const CRATE_NAME: &str = "lotwatch-vendor";

/// One paginated request against the vendor listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageQuery {
    pub make: String,
    pub model: Option<String>,
    pub site: i32,
    pub year_from: i32,
    pub year_to: i32,
    pub sale_date_from: NaiveDate,
    pub sale_date_to: NaiveDate,
    pub page: u32,
    pub size: u32,
}

impl PageQuery {
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("make", self.make.clone())];
        if let Some(model) = &self.model {
            pairs.push(("model", model.clone()));
        }
        pairs.extend([
            ("site", self.site.to_string()),
            ("year_from", self.year_from.to_string()),
            ("year_to", self.year_to.to_string()),
            ("sale_date_from", self.sale_date_from.format("%Y-%m-%d").to_string()),
            ("sale_date_to", self.sale_date_to.format("%Y-%m-%d").to_string()),
            ("page", self.page.to_string()),
            ("size", self.size.to_string()),
        ]);
        pairs
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VendorPage {
    pub records: Vec<VendorRecord>,
    /// Total hit count when the vendor wraps results as `{data, count}`.
    pub total: Option<u64>,
}

impl VendorPage {
    pub fn new(records: Vec<VendorRecord>) -> Self {
        Self {
            records,
            total: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VendorError {
    #[error("rate limited by vendor (HTTP 429)")]
    RateLimited,
    #[error("transient vendor failure: {0}")]
    Transient(String),
    #[error("vendor rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("vendor request failed: {0}")]
    Request(String),
    #[error("could not decode vendor response: {0}")]
    Decode(String),
}

impl VendorError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::RateLimited | Self::Transient(_) => RetryDisposition::Retryable,
            Self::Rejected { .. } | Self::Request(_) | Self::Decode(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

#[async_trait]
pub trait VendorClient: Send + Sync {
    /// Fetch exactly one page. Implementations must not retry on their own;
    /// retry policy belongs to the caller.
    async fn fetch_page(&self, query: &PageQuery) -> Result<VendorPage, VendorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_skip_missing_model() {
        let query = PageQuery {
            make: "Honda".into(),
            model: None,
            site: 1,
            year_from: 2015,
            year_to: 2020,
            sale_date_from: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            sale_date_to: NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
            page: 2,
            size: 50,
        };
        let pairs = query.query_pairs();
        assert!(pairs.iter().all(|(k, _)| *k != "model"));
        assert!(pairs.contains(&("sale_date_from", "2026-03-01".to_string())));
        assert!(pairs.contains(&("page", "2".to_string())));

        let with_model = PageQuery {
            model: Some("Civic".into()),
            ..query
        };
        assert!(with_model.query_pairs().contains(&("model", "Civic".to_string())));
    }

    #[test]
    fn only_rate_limits_and_transients_are_retryable() {
        assert_eq!(VendorError::RateLimited.disposition(), RetryDisposition::Retryable);
        assert_eq!(
            VendorError::Transient("timeout".into()).disposition(),
            RetryDisposition::Retryable
        );
        assert_eq!(
            VendorError::Rejected {
                status: 404,
                body: String::new()
            }
            .disposition(),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            VendorError::Decode("eof".into()).disposition(),
            RetryDisposition::NonRetryable
        );
    }
}
