//! Run configuration read from `INDEXGAP_*` environment variables.

use std::env;
use std::path::PathBuf;

use chrono::{Days, NaiveDate, Utc};

use crate::batching::DATE_FORMAT;
use crate::gaps::{GapPolicy, DEFAULT_TOLERATED_GAP_DAYS};
use crate::price_history::PriceHistoryConfig;
use crate::reference_source::{
    ReferenceSourceConfig, DEFAULT_LAST_MODIFIED_PATH, DEFAULT_REFERENCE_URL,
};

pub const DEFAULT_STORE_PATH: &str = "data/sqlite/stock_data.db";
pub const DEFAULT_LOOKBACK_MONTHS: u32 = 60;
pub const DEFAULT_END_DELAY_DAYS: i64 = -1;
pub const DEFAULT_MAX_PASSES: u32 = 3;
pub const MAX_LOOKBACK_MONTHS: u32 = 1200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub store_path: PathBuf,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub tolerated_gap_days: usize,
    pub max_passes: u32,
    pub http_timeout_ms: u64,
    pub http_max_retries: u32,
    pub reference_url: String,
    pub last_modified_path: PathBuf,
}

impl RunConfig {
    pub fn gap_policy(&self) -> GapPolicy {
        GapPolicy {
            tolerated_gap_days: self.tolerated_gap_days,
        }
    }

    pub fn price_history_config(&self) -> PriceHistoryConfig {
        PriceHistoryConfig {
            http_timeout_ms: self.http_timeout_ms,
            max_retries: self.http_max_retries,
            ..PriceHistoryConfig::default()
        }
    }

    pub fn reference_source_config(&self) -> ReferenceSourceConfig {
        ReferenceSourceConfig {
            url: self.reference_url.clone(),
            last_modified_path: self.last_modified_path.clone(),
            http_timeout_ms: self.http_timeout_ms,
            ..ReferenceSourceConfig::default()
        }
    }
}

pub fn default_window(
    today: NaiveDate,
    lookback_months: u32,
    end_delay_days: i64,
) -> (NaiveDate, NaiveDate) {
    let end = shift_days(today, end_delay_days);
    let span = Days::new(30 * u64::from(lookback_months.min(MAX_LOOKBACK_MONTHS)));
    let start = end.checked_sub_days(span).unwrap_or(NaiveDate::MIN);
    (start, end)
}

pub fn exchange_today() -> NaiveDate {
    Utc::now()
        .with_timezone(&chrono_tz::America::New_York)
        .date_naive()
}

pub fn run_config_from_env() -> RunConfig {
    run_config_from_env_at(exchange_today())
}

pub fn run_config_from_env_at(today: NaiveDate) -> RunConfig {
    let store_path = env_string("INDEXGAP_STORE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH));
    let lookback_months = env_parsed("INDEXGAP_LOOKBACK_MONTHS").unwrap_or(DEFAULT_LOOKBACK_MONTHS);
    let end_delay_days = env_parsed("INDEXGAP_END_DELAY_DAYS").unwrap_or(DEFAULT_END_DELAY_DAYS);

    let (default_start, default_end) = default_window(today, lookback_months, end_delay_days);
    let end = env_date("INDEXGAP_END_DATE").unwrap_or(default_end);
    let start = match env_date("INDEXGAP_START_DATE") {
        Some(start) => start,
        None if end != default_end => default_window(end, lookback_months, 0).0,
        None => default_start,
    };

    let defaults = PriceHistoryConfig::default();
    RunConfig {
        store_path,
        start,
        end,
        tolerated_gap_days: env_parsed("INDEXGAP_TOLERATED_GAP_DAYS")
            .unwrap_or(DEFAULT_TOLERATED_GAP_DAYS),
        max_passes: env_parsed("INDEXGAP_MAX_PASSES").unwrap_or(DEFAULT_MAX_PASSES),
        http_timeout_ms: env_parsed("INDEXGAP_HTTP_TIMEOUT_MS").unwrap_or(defaults.http_timeout_ms),
        http_max_retries: env_parsed("INDEXGAP_HTTP_MAX_RETRIES").unwrap_or(defaults.max_retries),
        reference_url: env_string("INDEXGAP_REFERENCE_URL")
            .unwrap_or_else(|| DEFAULT_REFERENCE_URL.to_string()),
        last_modified_path: env_string("INDEXGAP_LAST_MODIFIED_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LAST_MODIFIED_PATH)),
    }
}

fn shift_days(date: NaiveDate, delta: i64) -> NaiveDate {
    let days = Days::new(delta.unsigned_abs());
    let shifted = if delta >= 0 {
        date.checked_add_days(days)
    } else {
        date.checked_sub_days(days)
    };
    shifted.unwrap_or(date)
}

fn env_string(key: &str) -> Option<String> {
    let raw = env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key)?.parse().ok()
}

fn env_date(key: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(&env_string(key)?, DATE_FORMAT).ok()
}
