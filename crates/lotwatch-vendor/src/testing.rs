//! Scripted in-process vendor used by scheduler and fetcher tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::json;

use crate::{PageQuery, VendorClient, VendorError, VendorPage, VendorRecord};

type ScriptKey = (String, Option<String>, u32);

/// Replays queued responses per (make, model, page); unscripted requests get an
/// empty page. Every request is recorded in arrival order.
#[derive(Debug, Default)]
pub struct ScriptedVendor {
    script: Mutex<HashMap<ScriptKey, VecDeque<Result<VendorPage, VendorError>>>>,
    requests: Mutex<Vec<PageQuery>>,
}

fn script_key(make: &str, model: Option<&str>, page: u32) -> ScriptKey {
    (
        make.to_ascii_lowercase(),
        model.map(str::to_ascii_lowercase),
        page,
    )
}

impl ScriptedVendor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &self,
        make: &str,
        model: Option<&str>,
        page: u32,
        response: Result<VendorPage, VendorError>,
    ) {
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(script_key(make, model, page))
            .or_default()
            .push_back(response);
    }

    pub fn push_records(
        &self,
        make: &str,
        model: Option<&str>,
        page: u32,
        records: Vec<VendorRecord>,
    ) {
        self.push(make, model, page, Ok(VendorPage::new(records)));
    }

    pub fn requests(&self) -> Vec<PageQuery> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn requested_pages(&self, make: &str, model: Option<&str>) -> Vec<u32> {
        self.requests()
            .into_iter()
            .filter(|q| {
                q.make.eq_ignore_ascii_case(make)
                    && q.model.as_deref().map(str::to_ascii_lowercase)
                        == model.map(str::to_ascii_lowercase)
            })
            .map(|q| q.page)
            .collect()
    }
}

#[async_trait]
impl VendorClient for ScriptedVendor {
    async fn fetch_page(&self, query: &PageQuery) -> Result<VendorPage, VendorError> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(query.clone());
        let key = script_key(&query.make, query.model.as_deref(), query.page);
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(VendorPage::default()))
    }
}

/// `count` distinct sale records for one make/model, lot ids `{lot_prefix}-{n}`.
pub fn sample_records(
    make: &str,
    model: &str,
    year: i32,
    sale_date: NaiveDate,
    lot_prefix: &str,
    count: usize,
) -> Vec<VendorRecord> {
    (0..count)
        .map(|n| {
            VendorRecord(json!({
                "lot_id": format!("{lot_prefix}-{n}"),
                "make": make,
                "model": model,
                "year": year,
                "sale_date": sale_date.format("%Y-%m-%d").to_string(),
                "purchase_price": 1000 + n * 25,
                "odometer": 50_000 + n * 1_000,
            }))
        })
        .collect()
}
