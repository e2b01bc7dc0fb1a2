//! Missing-data detection over the membership timeline.

use std::collections::HashSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::timeline::{Timeline, TimelineRow};

pub const DEFAULT_TOLERATED_GAP_DAYS: usize = 4;

// A row without an open price counts as missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedRow {
    pub entity_id: String,
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MissingRange {
    pub entity_id: String,
    pub first_missing_date: NaiveDate,
    pub last_missing_date: NaiveDate,
    pub missing_days: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapPolicy {
    pub tolerated_gap_days: usize,
}

impl Default for GapPolicy {
    fn default() -> Self {
        Self {
            tolerated_gap_days: DEFAULT_TOLERATED_GAP_DAYS,
        }
    }
}

impl GapPolicy {
    pub fn qualifies(&self, missing_days: usize) -> bool {
        missing_days > self.tolerated_gap_days
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapReport {
    pub timeline_rows: u64,
    pub observed_rows: u64,
    pub missing_rows: u64,
    pub candidate_runs: u64,
    pub suppressed_runs: u64,
    pub emitted_ranges: u64,
}

#[derive(Debug)]
struct Run<'a> {
    entity_id: &'a str,
    first: NaiveDate,
    last: NaiveDate,
    last_index: usize,
    count: usize,
}

pub fn detect_missing_ranges(
    timeline: &Timeline,
    observed: &[ObservedRow],
    policy: &GapPolicy,
) -> (Vec<MissingRange>, GapReport) {
    let mut report = GapReport {
        timeline_rows: timeline.rows().len() as u64,
        observed_rows: observed.len() as u64,
        ..GapReport::default()
    };

    let present: HashSet<(&str, NaiveDate)> = observed
        .iter()
        .filter(|row| row.open.is_some())
        .map(|row| (row.entity_id.trim(), row.date))
        .collect();
    let mut missing_rows = 0u64;
    let missing = timeline
        .rows()
        .iter()
        .filter(|row| !present.contains(&(row.entity_id.as_str(), row.date)))
        .inspect(|_| missing_rows += 1);
    let runs = consecutive_runs(timeline, missing);
    report.missing_rows = missing_rows;

    report.candidate_runs = runs.len() as u64;

    let mut ranges = Vec::new();
    for run in runs {
        if policy.qualifies(run.count) {
            ranges.push(MissingRange {
                entity_id: run.entity_id.to_string(),
                first_missing_date: run.first,
                last_missing_date: run.last,
                missing_days: run.count,
            });
        } else {
            report.suppressed_runs += 1;
            debug!(
                component = "gaps",
                event = "gaps.run.suppressed",
                entity_id = run.entity_id,
                first_missing_date = %run.first,
                last_missing_date = %run.last,
                missing_days = run.count,
                tolerated_gap_days = policy.tolerated_gap_days
            );
        }
    }
    report.emitted_ranges = ranges.len() as u64;

    info!(
        component = "gaps",
        event = "gaps.detect.finish",
        timeline_rows = report.timeline_rows,
        observed_rows = report.observed_rows,
        missing_rows = report.missing_rows,
        candidate_runs = report.candidate_runs,
        suppressed_runs = report.suppressed_runs,
        emitted_ranges = report.emitted_ranges,
        tolerated_gap_days = policy.tolerated_gap_days
    );

    (ranges, report)
}

fn consecutive_runs<'a>(
    timeline: &Timeline,
    missing: impl Iterator<Item = &'a TimelineRow>,
) -> Vec<Run<'a>> {
    let mut runs: Vec<Run<'a>> = Vec::new();
    for row in missing {
        let Some(index) = timeline.day_index(row.date) else {
            continue;
        };
        match runs.last_mut() {
            Some(run) if run.entity_id == row.entity_id && index == run.last_index + 1 => {
                run.last = row.date;
                run.last_index = index;
                run.count += 1;
            }
            _ => runs.push(Run {
                entity_id: &row.entity_id,
                first: row.date,
                last: row.date,
                last_index: index,
                count: 1,
            }),
        }
    }
    runs
}
