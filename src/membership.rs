//! Index membership inputs: raw change-log rows, roster rows, and the
//! chronological add/remove events derived from them.

use std::collections::HashSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const EFFECTIVE_DATE_FORMATS: [&str; 4] = ["%B %d, %Y", "%b %d, %Y", "%Y-%m-%d", "%m/%d/%Y"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipAction {
    // Declaration order is the same-day processing order: a removal and a
    // re-add of one ticker on one date must leave the ticker a member.
    Removed,
    Added,
}

impl MembershipAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Removed => "removed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub entity_id: String,
    pub action: MembershipAction,
    pub effective_date: NaiveDate,
    pub security_name: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub effective_date: String,
    #[serde(default)]
    pub added_ticker: Option<String>,
    #[serde(default)]
    pub added_security: Option<String>,
    #[serde(default)]
    pub removed_ticker: Option<String>,
    #[serde(default)]
    pub removed_security: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntity {
    #[serde(rename = "symbol", alias = "entity_id", alias = "ticker")]
    pub entity_id: String,
    #[serde(default)]
    pub security: Option<String>,
    #[serde(default)]
    pub gics_sector: Option<String>,
    #[serde(default)]
    pub gics_sub_industry: Option<String>,
    #[serde(default)]
    pub headquarters_location: Option<String>,
    #[serde(default)]
    pub date_added: Option<String>,
    #[serde(default)]
    pub cik: Option<String>,
    #[serde(default)]
    pub founded: Option<String>,
}

pub fn events_from_change_records(records: &[ChangeRecord]) -> Vec<MembershipEvent> {
    let mut seen = HashSet::with_capacity(records.len());
    let mut events = Vec::with_capacity(records.len() * 2);
    let mut malformed = 0usize;

    for record in records {
        let added = clean_text(record.added_ticker.as_deref());
        let removed = clean_text(record.removed_ticker.as_deref());

        let Some(effective_date) = parse_effective_date(&record.effective_date) else {
            malformed += 1;
            warn!(
                component = "membership",
                event = "membership.change.malformed_date",
                raw_effective_date = %record.effective_date,
                added_ticker = added.as_deref().unwrap_or(""),
                removed_ticker = removed.as_deref().unwrap_or("")
            );
            continue;
        };

        if !seen.insert((effective_date, added.clone(), removed.clone())) {
            continue;
        }

        let reason = clean_text(record.reason.as_deref());
        if let Some(entity_id) = added {
            events.push(MembershipEvent {
                entity_id,
                action: MembershipAction::Added,
                effective_date,
                security_name: clean_text(record.added_security.as_deref()),
                reason: reason.clone(),
            });
        }
        if let Some(entity_id) = removed {
            events.push(MembershipEvent {
                entity_id,
                action: MembershipAction::Removed,
                effective_date,
                security_name: clean_text(record.removed_security.as_deref()),
                reason,
            });
        }
    }

    debug!(
        component = "membership",
        event = "membership.events.built",
        change_rows = records.len(),
        malformed_rows = malformed,
        events = events.len()
    );

    events
}

pub fn normalize_roster(rows: Vec<RosterEntity>) -> Vec<RosterEntity> {
    let mut seen = HashSet::with_capacity(rows.len());
    rows.into_iter()
        .filter_map(|row| {
            let entity_id = clean_text(Some(&row.entity_id))?;
            if !seen.insert(entity_id.clone()) {
                return None;
            }
            Some(RosterEntity {
                entity_id,
                security: clean_text(row.security.as_deref()),
                gics_sector: clean_text(row.gics_sector.as_deref()),
                gics_sub_industry: clean_text(row.gics_sub_industry.as_deref()),
                headquarters_location: clean_text(row.headquarters_location.as_deref()),
                date_added: clean_text(row.date_added.as_deref()),
                cik: clean_text(row.cik.as_deref()),
                founded: clean_text(row.founded.as_deref()),
            })
        })
        .collect()
}

pub fn parse_effective_date(raw: &str) -> Option<NaiveDate> {
    let collapsed = collapse_whitespace(raw);
    if collapsed.is_empty() {
        return None;
    }
    EFFECTIVE_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(&collapsed, format).ok())
}

pub fn clean_text(raw: Option<&str>) -> Option<String> {
    let collapsed = collapse_whitespace(raw?);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
