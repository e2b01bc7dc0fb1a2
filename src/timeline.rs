//! Dense index-membership timeline reconstruction.
//!
//! Sparse add/remove events plus the current roster become one row per
//! `(entity, trading day)` on which the entity was an index member.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::membership::{MembershipAction, MembershipEvent, RosterEntity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalOrigin {
    Added,
    ImplicitBeforeWindow,
    RosterOnly,
}

// Half-open [added_date, removed_date); `None` runs past the window end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipInterval {
    pub entity_id: String,
    pub added_date: NaiveDate,
    pub removed_date: Option<NaiveDate>,
    pub origin: IntervalOrigin,
}

impl MembershipInterval {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.added_date && self.removed_date.map_or(true, |removed| date < removed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimelineRow {
    pub entity_id: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineReport {
    pub entities: usize,
    pub intervals: usize,
    pub implicit_starts: usize,
    pub roster_only: usize,
    pub rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timeline {
    trading_days: Vec<NaiveDate>,
    intervals: Vec<MembershipInterval>,
    rows: Vec<TimelineRow>,
    report: TimelineReport,
}

impl Timeline {
    pub fn trading_days(&self) -> &[NaiveDate] {
        &self.trading_days
    }

    pub fn intervals(&self) -> &[MembershipInterval] {
        &self.intervals
    }

    pub fn rows(&self) -> &[TimelineRow] {
        &self.rows
    }

    pub fn report(&self) -> &TimelineReport {
        &self.report
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn day_index(&self, date: NaiveDate) -> Option<usize> {
        self.trading_days.binary_search(&date).ok()
    }

    pub fn intervals_for<'a>(
        &'a self,
        entity_id: &'a str,
    ) -> impl Iterator<Item = &'a MembershipInterval> + 'a {
        self.intervals
            .iter()
            .filter(move |interval| interval.entity_id == entity_id)
    }
}

// Same-day events apply removal first.
pub fn build_membership_intervals(
    events: &[MembershipEvent],
    roster: &[RosterEntity],
    window_start: NaiveDate,
) -> Vec<MembershipInterval> {
    let mut history: BTreeMap<&str, Vec<(NaiveDate, MembershipAction)>> = BTreeMap::new();
    for event in events {
        let entity_id = event.entity_id.trim();
        if entity_id.is_empty() {
            continue;
        }
        history
            .entry(entity_id)
            .or_default()
            .push((event.effective_date, event.action));
    }
    for entity in roster {
        let entity_id = entity.entity_id.trim();
        if !entity_id.is_empty() {
            history.entry(entity_id).or_default();
        }
    }

    let mut intervals = Vec::new();
    for (entity_id, mut entity_events) in history {
        if entity_events.is_empty() {
            intervals.push(MembershipInterval {
                entity_id: entity_id.to_string(),
                added_date: window_start,
                removed_date: None,
                origin: IntervalOrigin::RosterOnly,
            });
            continue;
        }

        entity_events.sort_unstable();
        entity_events.dedup();

        let mut open = match entity_events.first() {
            Some((_, MembershipAction::Removed)) => {
                Some((window_start, IntervalOrigin::ImplicitBeforeWindow))
            }
            _ => None,
        };

        for (date, action) in entity_events {
            if let Some((added_date, origin)) = open.take() {
                if added_date < date {
                    intervals.push(MembershipInterval {
                        entity_id: entity_id.to_string(),
                        added_date,
                        removed_date: Some(date),
                        origin,
                    });
                }
            }
            if action == MembershipAction::Added {
                open = Some((date, IntervalOrigin::Added));
            }
        }

        if let Some((added_date, origin)) = open {
            intervals.push(MembershipInterval {
                entity_id: entity_id.to_string(),
                added_date,
                removed_date: None,
                origin,
            });
        }
    }

    intervals
}

pub fn reconstruct_timeline(
    events: &[MembershipEvent],
    roster: &[RosterEntity],
    trading_days: &[NaiveDate],
) -> Timeline {
    let trading_days: Vec<NaiveDate> = trading_days
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let Some(&window_start) = trading_days.first() else {
        info!(
            component = "timeline",
            event = "timeline.build.empty_calendar",
            events = events.len(),
            roster = roster.len()
        );
        return Timeline::default();
    };

    let intervals = build_membership_intervals(events, roster, window_start);

    let mut rows = Vec::new();
    for interval in &intervals {
        let lo = trading_days.partition_point(|day| *day < interval.added_date);
        let hi = match interval.removed_date {
            Some(removed) => trading_days.partition_point(|day| *day < removed),
            None => trading_days.len(),
        };
        if lo >= hi {
            continue;
        }
        rows.extend(trading_days[lo..hi].iter().map(|date| TimelineRow {
            entity_id: interval.entity_id.clone(),
            date: *date,
        }));
    }

    let entities = intervals
        .iter()
        .map(|interval| interval.entity_id.as_str())
        .collect::<BTreeSet<_>>()
        .len();
    let report = TimelineReport {
        entities,
        intervals: intervals.len(),
        implicit_starts: intervals
            .iter()
            .filter(|interval| interval.origin == IntervalOrigin::ImplicitBeforeWindow)
            .count(),
        roster_only: intervals
            .iter()
            .filter(|interval| interval.origin == IntervalOrigin::RosterOnly)
            .count(),
        rows: rows.len(),
    };

    info!(
        component = "timeline",
        event = "timeline.build.finish",
        window_start = %window_start,
        trading_days = trading_days.len(),
        entities = report.entities,
        intervals = report.intervals,
        implicit_starts = report.implicit_starts,
        roster_only = report.roster_only,
        rows = report.rows
    );

    Timeline {
        trading_days,
        intervals,
        rows,
        report,
    }
}
