//! Index membership timelines and missing price-history ranges.
//!
//! - reference page -> membership change log + roster
//! - membership change log + roster -> per-day membership timeline
//! - timeline vs stored prices -> per-entity missing ranges
//! - missing ranges -> fetch batches, and the backfill loop around them

mod backfill;
mod batching;
mod calendar;
mod config;
mod gaps;
mod membership;
mod observability;
mod pipeline;
mod price_history;
mod reference_source;
mod store;
mod timeline;

pub use backfill::{run_backfill, BackfillError, BackfillReport, BackfillRequest};
pub use batching::{
    batch_by_range, batch_fingerprint, batches_by_date_key, FetchBatch, DATE_FORMAT,
};
pub use calendar::{
    is_nyse_trading_day, nyse_holidays, FixedCalendar, NyseCalendar, TradingCalendar,
};
pub use config::{
    default_window, exchange_today, run_config_from_env, run_config_from_env_at, RunConfig,
    DEFAULT_END_DELAY_DAYS, DEFAULT_LOOKBACK_MONTHS, DEFAULT_MAX_PASSES, DEFAULT_STORE_PATH,
    MAX_LOOKBACK_MONTHS,
};
pub use gaps::{
    detect_missing_ranges, GapPolicy, GapReport, MissingRange, ObservedRow,
    DEFAULT_TOLERATED_GAP_DAYS,
};
pub use membership::{
    clean_text, events_from_change_records, normalize_roster, parse_effective_date, ChangeRecord,
    MembershipAction, MembershipEvent, RosterEntity,
};
pub use observability::{
    init_logging, log_app_finish, log_app_start, log_run_config, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use pipeline::{get_missing_ranges, MissingRangePlan, PipelineError};
pub use price_history::{
    DailyBar, FetchError, PriceHistoryConfig, PriceHistoryFetcher, YahooChartFetcher,
};
pub use reference_source::{
    extract_table, refresh_reference_tables, HtmlTable, PageFetcher, PageResponse,
    ReferenceSourceConfig, ReferenceSourceError, RefreshOutcome, ReqwestPageFetcher,
    DEFAULT_LAST_MODIFIED_PATH, DEFAULT_REFERENCE_URL,
};
pub use store::{
    InMemorySources, MembershipSource, ObservedPriceSource, PriceSink, SqliteStore, StoreError,
};
pub use timeline::{
    build_membership_intervals, reconstruct_timeline, IntervalOrigin, MembershipInterval, Timeline,
    TimelineReport, TimelineRow,
};
