//! End-to-end missing-range computation over the store readers.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::batching::{batch_by_range, batch_fingerprint, batches_by_date_key, FetchBatch};
use crate::calendar::TradingCalendar;
use crate::gaps::{detect_missing_ranges, GapPolicy, GapReport, MissingRange};
use crate::membership::{events_from_change_records, normalize_roster};
use crate::store::{MembershipSource, ObservedPriceSource, StoreError};
use crate::timeline::{reconstruct_timeline, TimelineReport};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid window: start {start} is after end {end}")]
    InvalidWindow { start: NaiveDate, end: NaiveDate },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingRangePlan {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub ranges: Vec<MissingRange>,
    pub batches: Vec<FetchBatch>,
    #[serde(skip)]
    pub by_date_key: BTreeMap<(String, String), Vec<String>>,
    pub fingerprint: String,
    pub timeline: TimelineReport,
    pub gaps: GapReport,
}

impl MissingRangePlan {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn entity_count(&self) -> usize {
        self.ranges.len()
    }
}

pub fn get_missing_ranges<S>(
    start: NaiveDate,
    end: NaiveDate,
    sources: &S,
    calendar: &dyn TradingCalendar,
    policy: &GapPolicy,
) -> Result<MissingRangePlan, PipelineError>
where
    S: MembershipSource + ObservedPriceSource + ?Sized,
{
    if start > end {
        return Err(PipelineError::InvalidWindow { start, end });
    }

    let events = events_from_change_records(&sources.read_change_records()?);
    let roster = normalize_roster(sources.read_roster()?);
    let trading_days = calendar.trading_days(start, end);
    let timeline = reconstruct_timeline(&events, &roster, &trading_days);

    let observed = sources.read_observed_rows(start, end)?;
    let (ranges, gaps) = detect_missing_ranges(&timeline, &observed, policy);

    let batches = batch_by_range(&ranges);
    let by_date_key = batches_by_date_key(&batches);
    let fingerprint = batch_fingerprint(&by_date_key);

    info!(
        component = "pipeline",
        event = "pipeline.plan.ready",
        start = %start,
        end = %end,
        trading_days = trading_days.len(),
        ranges = ranges.len(),
        batches = batches.len(),
        fingerprint = %fingerprint
    );

    Ok(MissingRangePlan {
        start,
        end,
        ranges,
        batches,
        by_date_key,
        fingerprint,
        timeline: timeline.report().clone(),
        gaps,
    })
}
