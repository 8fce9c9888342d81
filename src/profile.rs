use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::EngineError;
use crate::limits::MAX_DURATION_MINUTES;
use crate::model::*;
use crate::source::ConfigStore;

/// Tenant profile as stored. Every field is optional; `normalize` turns it
/// into a complete `TenantConfig`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantConfigRecord {
    #[serde(default)]
    pub fixed_service_duration: Option<Minutes>,
    /// Weekday ("0" = Sunday) → hours for that weekday.
    #[serde(default)]
    pub hours_per_day: Option<BTreeMap<String, RawHours>>,
    #[serde(default)]
    pub working_days: Option<Vec<DayKey>>,
    /// Hours offered for booking. Take precedence over `business_hour_*`.
    #[serde(default)]
    pub availability_hour_open: Option<u32>,
    #[serde(default)]
    pub availability_hour_close: Option<u32>,
    #[serde(default)]
    pub business_hour_open: Option<u32>,
    #[serde(default)]
    pub business_hour_close: Option<u32>,
    #[serde(default)]
    pub buffer_minutes: Option<Minutes>,
    #[serde(default)]
    pub product_duration_enabled: Option<bool>,
    #[serde(default)]
    pub products: Option<Vec<ProductRecord>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawHours {
    pub open: Option<u32>,
    pub close: Option<u32>,
}

/// Weekdays arrive either as numbers or as numeric strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DayKey {
    Number(i64),
    Text(String),
}

impl DayKey {
    fn weekday(&self) -> Option<u8> {
        let n = match self {
            DayKey::Number(n) => *n,
            DayKey::Text(s) => s.trim().parse().ok()?,
        };
        (0..7).contains(&n).then_some(n as u8)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub duration: Option<Minutes>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub active: Option<bool>,
}

fn valid_bounds(open: u32, close: u32) -> Option<HourBounds> {
    (open < close && close <= 24).then_some(HourBounds::new(open, close))
}

fn valid_duration(minutes: Minutes) -> bool {
    minutes > 0 && minutes <= MAX_DURATION_MINUTES
}

/// Complete a raw profile with defaults. Invalid pieces fall back
/// individually and are logged.
pub fn normalize(record: &TenantConfigRecord) -> TenantConfig {
    let defaults = TenantConfig::default();

    let open = record
        .availability_hour_open
        .or(record.business_hour_open)
        .unwrap_or(defaults.global_hours.open);
    let close = record
        .availability_hour_close
        .or(record.business_hour_close)
        .unwrap_or(defaults.global_hours.close);
    let global_hours = valid_bounds(open, close).unwrap_or_else(|| {
        warn!(open, close, "invalid business hours, using defaults");
        defaults.global_hours
    });

    let mut weekday_hours = BTreeMap::new();
    for (key, raw) in record.hours_per_day.iter().flatten() {
        let weekday = DayKey::Text(key.clone()).weekday();
        let bounds = match (raw.open, raw.close) {
            (Some(open), Some(close)) => valid_bounds(open, close),
            _ => None,
        };
        match (weekday, bounds) {
            (Some(weekday), Some(bounds)) => {
                weekday_hours.insert(weekday, bounds);
            }
            _ => warn!(key = %key, "ignoring invalid per-day hours"),
        }
    }

    let working_days: BTreeSet<u8> = match &record.working_days {
        None => defaults.working_days,
        Some(days) => days
            .iter()
            .filter_map(|d| {
                let weekday = d.weekday();
                if weekday.is_none() {
                    warn!(day = ?d, "ignoring invalid working day");
                }
                weekday
            })
            .collect(),
    };

    let fixed = record
        .fixed_service_duration
        .filter(|m| valid_duration(*m))
        .unwrap_or(DEFAULT_DURATION);

    let products: Vec<Product> = if record.product_duration_enabled.unwrap_or(false) {
        record
            .products
            .iter()
            .flatten()
            .filter(|p| p.active.unwrap_or(true))
            .filter_map(|p| {
                let duration = p.duration.filter(|m| valid_duration(*m))?;
                Some(Product {
                    id: p.id.clone(),
                    name: p.name.clone().unwrap_or_else(|| p.id.clone()),
                    duration,
                    price: p.price,
                })
            })
            .collect()
    } else {
        Vec::new()
    };

    let duration_mode = if products.is_empty() {
        if record.product_duration_enabled.unwrap_or(false) {
            warn!("per-service durations enabled without usable products, using fixed duration");
        }
        DurationMode::Fixed(fixed)
    } else {
        DurationMode::PerService(products)
    };

    TenantConfig {
        duration_mode,
        weekday_hours,
        working_days,
        global_hours,
        buffer_minutes: record
            .buffer_minutes
            .unwrap_or(0)
            .clamp(0, MAX_DURATION_MINUTES),
    }
}

/// Reads `<dir>/<tenant>.json`. A missing file is an empty profile.
pub struct JsonConfigStore {
    dir: PathBuf,
}

impl JsonConfigStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl ConfigStore for JsonConfigStore {
    async fn get_config(&self, tenant: &str) -> Result<TenantConfigRecord, EngineError> {
        if tenant.contains(['/', '\\']) || tenant.starts_with('.') {
            return Err(EngineError::ConfigUnavailable(format!(
                "bad tenant name {tenant}"
            )));
        }
        let path = self.dir.join(format!("{tenant}.json"));
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TenantConfigRecord::default());
            }
            Err(e) => {
                return Err(EngineError::ConfigUnavailable(format!(
                    "{}: {e}",
                    path.display()
                )));
            }
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::ConfigUnavailable(format!("{}: {e}", path.display())))
    }
}
