//! Repeated fetch-and-store passes until the missing-range plan is empty.

use chrono::{Days, NaiveDate};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::calendar::TradingCalendar;
use crate::gaps::GapPolicy;
use crate::pipeline::{get_missing_ranges, PipelineError};
use crate::price_history::PriceHistoryFetcher;
use crate::store::{MembershipSource, ObservedPriceSource, PriceSink, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillRequest {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub policy: GapPolicy,
    pub max_passes: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub passes: u32,
    pub batches_attempted: u64,
    pub batches_empty: u64,
    pub batches_failed: u64,
    pub rows_written: u64,
    pub remaining_ranges: usize,
    pub final_fingerprint: String,
}

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub fn run_backfill<S, F>(
    store: &mut S,
    fetcher: &F,
    calendar: &dyn TradingCalendar,
    request: &BackfillRequest,
) -> Result<BackfillReport, BackfillError>
where
    S: MembershipSource + ObservedPriceSource + PriceSink,
    F: PriceHistoryFetcher + ?Sized,
{
    let mut report = BackfillReport::default();
    let mut plan = get_missing_ranges(request.start, request.end, &*store, calendar, &request.policy)?;

    while !plan.is_empty() && report.passes < request.max_passes {
        report.passes += 1;
        let mut written = 0u64;

        for batch in &plan.batches {
            report.batches_attempted += 1;
            let end_exclusive = batch
                .last_missing_date
                .checked_add_days(Days::new(1))
                .unwrap_or(batch.last_missing_date);

            match fetcher.fetch_daily_bars(&batch.entity_ids, batch.first_missing_date, end_exclusive)
            {
                Ok(bars) if bars.is_empty() => {
                    report.batches_empty += 1;
                    warn!(
                        component = "backfill",
                        event = "backfill.batch.empty",
                        first_missing_date = %batch.first_missing_date,
                        last_missing_date = %batch.last_missing_date,
                        entities = batch.entity_ids.len()
                    );
                }
                Ok(bars) => {
                    written += store.upsert_daily_bars(&bars)? as u64;
                }
                Err(err) => {
                    report.batches_failed += 1;
                    warn!(
                        component = "backfill",
                        event = "backfill.batch.failed",
                        first_missing_date = %batch.first_missing_date,
                        last_missing_date = %batch.last_missing_date,
                        entities = batch.entity_ids.len(),
                        error = %err
                    );
                }
            }
        }

        report.rows_written += written;
        let previous_fingerprint = std::mem::take(&mut plan.fingerprint);
        plan = get_missing_ranges(request.start, request.end, &*store, calendar, &request.policy)?;

        info!(
            component = "backfill",
            event = "backfill.pass.finish",
            pass = report.passes,
            rows_written = written,
            remaining_ranges = plan.ranges.len()
        );

        if written == 0 || plan.fingerprint == previous_fingerprint {
            if !plan.is_empty() {
                warn!(
                    component = "backfill",
                    event = "backfill.no_progress",
                    pass = report.passes,
                    remaining_ranges = plan.ranges.len()
                );
            }
            break;
        }
    }

    report.remaining_ranges = plan.ranges.len();
    report.final_fingerprint = plan.fingerprint;

    info!(
        component = "backfill",
        event = "backfill.finish",
        passes = report.passes,
        batches_attempted = report.batches_attempted,
        batches_empty = report.batches_empty,
        batches_failed = report.batches_failed,
        rows_written = report.rows_written,
        remaining_ranges = report.remaining_ranges
    );

    Ok(report)
}
