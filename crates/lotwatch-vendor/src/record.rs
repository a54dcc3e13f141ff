use chrono::NaiveDate;
use lotwatch_core::VehicleSale;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{VendorError, VendorPage};

/// One sale record exactly as the vendor sent it. Field access is lenient:
/// the vendor mixes string and numeric encodings and renames fields between
/// API versions.
#[derive(Debug, Clone, PartialEq)]
pub struct VendorRecord(pub JsonValue);

#[derive(Deserialize)]
#[serde(untagged)]
enum PageBody {
    Bare(Vec<JsonValue>),
    Wrapped {
        data: Vec<JsonValue>,
        #[serde(default)]
        count: Option<u64>,
    },
}

/// Decode a listing response: either a bare JSON array or `{data: [...], count}`.
pub fn parse_page_body(body: &[u8]) -> Result<VendorPage, VendorError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(VendorPage::default());
    }
    let parsed: PageBody =
        serde_json::from_slice(body).map_err(|e| VendorError::Decode(e.to_string()))?;
    Ok(match parsed {
        PageBody::Bare(items) => VendorPage::new(items.into_iter().map(VendorRecord).collect()),
        PageBody::Wrapped { data, count } => VendorPage {
            records: data.into_iter().map(VendorRecord).collect(),
            total: count,
        },
    })
}

fn lookup<'a>(value: &'a JsonValue, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find(|v| !v.is_null())
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn json_text(value: &JsonValue, keys: &[&str]) -> Option<String> {
    match lookup(value, keys)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_i64(value: &JsonValue, keys: &[&str]) -> Option<i64> {
    match lookup(value, keys)? {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        JsonValue::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

fn json_f64(value: &JsonValue, keys: &[&str]) -> Option<f64> {
    match lookup(value, keys)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s
            .trim()
            .trim_start_matches('$')
            .replace(',', "")
            .parse()
            .ok(),
        _ => None,
    }
}

fn json_date(value: &JsonValue, keys: &[&str]) -> Option<NaiveDate> {
    let text = json_text(value, keys)?;
    let day = text.get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

impl VendorRecord {
    pub fn lot_id(&self) -> Option<String> {
        json_text(&self.0, &["lot_id", "lot_number", "lotNumber", "lot"])
    }

    pub fn site(&self) -> Option<i32> {
        json_i64(&self.0, &["site", "site_id"]).and_then(|s| i32::try_from(s).ok())
    }

    /// Map to the shared record attributes; `fallback_make` covers records
    /// that omit the make the unit was queried for.
    pub fn to_sale(&self, fallback_make: &str) -> VehicleSale {
        let v = &self.0;
        VehicleSale {
            vin: json_text(v, &["vin"]),
            year: json_i64(v, &["year", "model_year"]).and_then(|y| i32::try_from(y).ok()),
            make: json_text(v, &["make"]).unwrap_or_else(|| fallback_make.to_string()),
            model: json_text(v, &["model"]),
            series: json_text(v, &["series", "trim"]),
            odometer: json_i64(v, &["odometer", "mileage"]),
            primary_damage: json_text(v, &["damage_pr", "primary_damage"]),
            secondary_damage: json_text(v, &["damage_sec", "secondary_damage"]),
            title_type: json_text(v, &["document", "title_type"]),
            location: json_text(v, &["location", "auction_location"]),
            sale_date: json_date(v, &["sale_date", "auction_date"]),
            sale_status: json_text(v, &["sale_status", "status"]),
            final_bid: json_f64(v, &["purchase_price", "final_bid", "price"]),
            currency: json_text(v, &["currency"]),
            engine: json_text(v, &["engine"]),
            transmission: json_text(v, &["transmission"]),
            drive: json_text(v, &["drive"]),
            fuel: json_text(v, &["fuel"]),
            color: json_text(v, &["color"]),
            raw: v.clone(),
        }
    }
}
