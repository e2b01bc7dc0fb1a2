//! Daily price-history download from the Yahoo Finance chart API.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveTime};
use chrono_tz::Tz;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::gaps::ObservedRow;

const YAHOO_CHART_BASE_URL: &str = "https://query2.finance.yahoo.com/v8/finance/chart";
const DEFAULT_EXCHANGE_TZ: Tz = chrono_tz::America::New_York;

pub type DailyBar = ObservedRow;

pub trait PriceHistoryFetcher {
    // start <= date < end_exclusive
    fn fetch_daily_bars(
        &self,
        entity_ids: &[String],
        start: NaiveDate,
        end_exclusive: NaiveDate,
    ) -> Result<Vec<DailyBar>, FetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceHistoryConfig {
    pub base_url: String,
    pub http_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub user_agent: String,
}

impl Default for PriceHistoryConfig {
    fn default() -> Self {
        Self {
            base_url: YAHOO_CHART_BASE_URL.to_string(),
            http_timeout_ms: 15_000,
            max_retries: 2,
            retry_backoff_ms: 200,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) indexgap/0.1".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid fetch range: start {start} is not before end {end_exclusive}")]
    InvalidRange {
        start: NaiveDate,
        end_exclusive: NaiveDate,
    },
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("failed to decode chart payload for {entity_id}: {message}")]
    Decode { entity_id: String, message: String },
    #[error("chart API error for {entity_id}: {code}: {description}")]
    Api {
        entity_id: String,
        code: String,
        description: String,
    },
    #[error("unknown exchange time zone '{0}'")]
    UnknownTimezone(String),
    #[error("all {attempted} tickers failed; last error: {last_error}")]
    AllFailed { attempted: usize, last_error: String },
}

trait HttpFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    fn new(cfg: &PriceHistoryConfig) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.http_timeout_ms))
            .user_agent(cfg.user_agent.clone())
            .build()
            .map_err(|err| FetchError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| FetchError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}"),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| FetchError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

pub struct YahooChartFetcher {
    cfg: PriceHistoryConfig,
    http: Box<dyn HttpFetcher + Send + Sync>,
}

impl YahooChartFetcher {
    pub fn new(cfg: PriceHistoryConfig) -> Result<Self, FetchError> {
        let http = ReqwestBlockingFetcher::new(&cfg)?;
        Ok(Self {
            cfg,
            http: Box::new(http),
        })
    }

    fn chart_url(&self, entity_id: &str, start: NaiveDate, end_exclusive: NaiveDate) -> String {
        format!(
            "{}/{}?period1={}&period2={}&interval=1d&events=history&includePrePost=false",
            self.cfg.base_url.trim_end_matches('/'),
            chart_symbol(entity_id),
            midnight_utc_epoch(start),
            midnight_utc_epoch(end_exclusive)
        )
    }

    fn fetch_one(
        &self,
        entity_id: &str,
        start: NaiveDate,
        end_exclusive: NaiveDate,
    ) -> Result<Vec<DailyBar>, FetchError> {
        let url = self.chart_url(entity_id, start, end_exclusive);
        let payload = retry(&self.cfg, || self.http.get_bytes(&url))?;
        let bars = parse_chart_payload(entity_id, &payload)?;
        Ok(bars
            .into_iter()
            .filter(|bar| bar.date >= start && bar.date < end_exclusive)
            .collect())
    }
}

impl PriceHistoryFetcher for YahooChartFetcher {
    fn fetch_daily_bars(
        &self,
        entity_ids: &[String],
        start: NaiveDate,
        end_exclusive: NaiveDate,
    ) -> Result<Vec<DailyBar>, FetchError> {
        if start >= end_exclusive {
            return Err(FetchError::InvalidRange {
                start,
                end_exclusive,
            });
        }
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut bars = Vec::new();
        let mut failed = 0usize;
        let mut last_error = None;

        for entity_id in entity_ids {
            match self.fetch_one(entity_id, start, end_exclusive) {
                Ok(mut fetched) => {
                    debug!(
                        component = "price_history",
                        event = "price_history.ticker.fetched",
                        entity_id = %entity_id,
                        rows = fetched.len()
                    );
                    bars.append(&mut fetched);
                }
                Err(err) => {
                    failed += 1;
                    warn!(
                        component = "price_history",
                        event = "price_history.ticker.failed",
                        entity_id = %entity_id,
                        error = %err
                    );
                    last_error = Some(err.to_string());
                }
            }
        }

        info!(
            component = "price_history",
            event = "price_history.fetch.finish",
            start = %start,
            end_exclusive = %end_exclusive,
            tickers = entity_ids.len(),
            failed_tickers = failed,
            rows = bars.len()
        );

        if failed == entity_ids.len() {
            return Err(FetchError::AllFailed {
                attempted: failed,
                last_error: last_error.unwrap_or_default(),
            });
        }

        Ok(bars)
    }
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<ChartApiError>,
}

#[derive(Debug, Deserialize)]
struct ChartApiError {
    code: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Vec<i64>,
    #[serde(default)]
    indicators: ChartIndicators,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    #[serde(default)]
    exchange_timezone_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChartIndicators {
    #[serde(default)]
    quote: Vec<ChartQuote>,
}

#[derive(Debug, Default, Deserialize)]
struct ChartQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

// A repeated date keeps the later bar.
fn parse_chart_payload(entity_id: &str, payload: &[u8]) -> Result<Vec<DailyBar>, FetchError> {
    let envelope: ChartEnvelope =
        serde_json::from_slice(payload).map_err(|err| FetchError::Decode {
            entity_id: entity_id.to_string(),
            message: err.to_string(),
        })?;

    if let Some(api_error) = envelope.chart.error {
        return Err(FetchError::Api {
            entity_id: entity_id.to_string(),
            code: api_error.code,
            description: api_error.description.unwrap_or_default(),
        });
    }

    let Some(result) = envelope.chart.result.and_then(|mut results| {
        if results.is_empty() {
            None
        } else {
            Some(results.swap_remove(0))
        }
    }) else {
        return Ok(Vec::new());
    };

    let tz = match result.meta.exchange_timezone_name.as_deref() {
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| FetchError::UnknownTimezone(name.to_string()))?,
        None => DEFAULT_EXCHANGE_TZ,
    };
    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();

    let mut by_date = BTreeMap::new();
    for (idx, ts) in result.timestamp.iter().enumerate() {
        let Some(utc) = DateTime::from_timestamp(*ts, 0) else {
            warn!(
                component = "price_history",
                event = "price_history.bar.invalid_timestamp",
                entity_id = %entity_id,
                timestamp = ts
            );
            continue;
        };
        let date = utc.with_timezone(&tz).date_naive();
        by_date.insert(
            date,
            DailyBar {
                entity_id: entity_id.to_string(),
                date,
                open: value_at(&quote.open, idx),
                high: value_at(&quote.high, idx),
                low: value_at(&quote.low, idx),
                close: value_at(&quote.close, idx),
                volume: value_at(&quote.volume, idx).map(|v| v.round() as i64),
            },
        );
    }

    Ok(by_date.into_values().collect())
}

fn value_at(series: &[Option<f64>], idx: usize) -> Option<f64> {
    series
        .get(idx)
        .copied()
        .flatten()
        .filter(|value| value.is_finite())
}

// Share classes use a dot in index tables and a dash on the chart API.
fn chart_symbol(entity_id: &str) -> String {
    entity_id.trim().replace('.', "-")
}

fn midnight_utc_epoch(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

fn retry<T>(
    cfg: &PriceHistoryConfig,
    mut f: impl FnMut() -> Result<T, FetchError>,
) -> Result<T, FetchError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= cfg.max_retries => return Err(err),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let sleep_ms = cfg.retry_backoff_ms.saturating_mul(1u64 << shift);
                debug!(
                    component = "price_history",
                    event = "price_history.request.retry",
                    attempt,
                    sleep_ms,
                    error = %err
                );
                std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockFetcher {
        responses: HashMap<String, Vec<u8>>,
        calls: Mutex<Vec<String>>,
    }

    impl MockFetcher {
        fn with(mut self, url: &str, body: &str) -> Self {
            self.responses.insert(url.to_string(), body.as_bytes().to_vec());
            self
        }
    }

    impl HttpFetcher for MockFetcher {
        fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.calls.lock().unwrap().push(url.to_string());
            self.responses
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::HttpRequest {
                    url: url.to_string(),
                    message: "missing mock response".to_string(),
                })
        }
    }

    fn cfg() -> PriceHistoryConfig {
        PriceHistoryConfig {
            base_url: "https://chart.test/v8".to_string(),
            max_retries: 1,
            retry_backoff_ms: 0,
            ..PriceHistoryConfig::default()
        }
    }

    fn fetcher(http: MockFetcher) -> YahooChartFetcher {
        YahooChartFetcher {
            cfg: cfg(),
            http: Box::new(http),
        }
    }

    fn d(month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, month, day).unwrap()
    }

    // 2024-03-08 and 2024-03-11 14:30 UTC session opens, with a null bar between.
    const TWO_BARS: &str = r#"{
        "chart": {
            "result": [{
                "meta": {"symbol": "BRK-B", "exchangeTimezoneName": "America/New_York"},
                "timestamp": [1709908200, 1710163800],
                "indicators": {"quote": [{
                    "open": [405.1, null],
                    "high": [410.0, null],
                    "low": [400.2, null],
                    "close": [408.8, null],
                    "volume": [3200100, null]
                }]}
            }],
            "error": null
        }
    }"#;

    #[test]
    fn chart_payload_dates_use_exchange_zone_and_keep_nulls_absent() {
        let bars = parse_chart_payload("BRK.B", TWO_BARS.as_bytes()).unwrap();

        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].entity_id, "BRK.B");
        assert_eq!(bars[0].date, d(3, 8));
        assert_eq!(bars[0].open, Some(405.1));
        assert_eq!(bars[0].volume, Some(3_200_100));
        assert_eq!(bars[1].date, d(3, 11));
        assert_eq!(bars[1].open, None);
        assert_eq!(bars[1].volume, None);
    }

    #[test]
    fn chart_api_error_is_reported() {
        let payload = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#;
        let err = parse_chart_payload("GONE", payload.as_bytes()).unwrap_err();
        assert!(matches!(err, FetchError::Api { ref code, .. } if code == "Not Found"));
    }

    #[test]
    fn unknown_time_zone_is_rejected() {
        let payload = r#"{"chart":{"result":[{"meta":{"exchangeTimezoneName":"Mars/Olympus"},"timestamp":[],"indicators":{"quote":[]}}],"error":null}}"#;
        let err = parse_chart_payload("AAA", payload.as_bytes()).unwrap_err();
        assert!(matches!(err, FetchError::UnknownTimezone(_)));
    }

    #[test]
    fn request_url_maps_share_class_and_uses_midnight_bounds() {
        let fetcher = fetcher(MockFetcher::default());
        let url = fetcher.chart_url("BRK.B", d(3, 8), d(3, 12));
        assert_eq!(
            url,
            "https://chart.test/v8/BRK-B?period1=1709856000&period2=1710201600&interval=1d&events=history&includePrePost=false"
        );
    }

    #[test]
    fn failing_ticker_is_skipped_when_another_succeeds() {
        let url_builder = fetcher(MockFetcher::default());
        let ok_url = url_builder.chart_url("BRK.B", d(3, 8), d(3, 12));

        let fetcher = fetcher(MockFetcher::default().with(&ok_url, TWO_BARS));
        let bars = fetcher
            .fetch_daily_bars(
                &["MISSING".to_string(), "BRK.B".to_string()],
                d(3, 8),
                d(3, 12),
            )
            .unwrap();

        assert_eq!(bars.len(), 2);
        assert!(bars.iter().all(|bar| bar.entity_id == "BRK.B"));
    }

    #[test]
    fn batch_fails_only_when_every_ticker_fails_after_retries() {
        let http = MockFetcher::default();
        let fetcher = fetcher(http);
        let err = fetcher
            .fetch_daily_bars(&["AAA".to_string()], d(3, 8), d(3, 12))
            .unwrap_err();
        assert!(matches!(err, FetchError::AllFailed { attempted: 1, .. }));
    }

    #[test]
    fn retry_attempts_max_retries_plus_one() {
        let http = MockFetcher::default();
        let mut calls = 0;
        let result: Result<(), FetchError> = retry(&cfg(), || {
            calls += 1;
            http.get_bytes("https://chart.test/none").map(|_| ())
        });
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }

    #[test]
    fn bars_outside_requested_range_are_dropped() {
        let url_builder = fetcher(MockFetcher::default());
        let url = url_builder.chart_url("AAA", d(3, 11), d(3, 12));
        let fetcher = fetcher(MockFetcher::default().with(&url, TWO_BARS));

        let bars = fetcher
            .fetch_daily_bars(&["AAA".to_string()], d(3, 11), d(3, 12))
            .unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].date, d(3, 11));
    }

    #[test]
    fn empty_range_is_rejected() {
        let fetcher = fetcher(MockFetcher::default());
        let err = fetcher
            .fetch_daily_bars(&["AAA".to_string()], d(3, 8), d(3, 8))
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidRange { .. }));
    }
}
