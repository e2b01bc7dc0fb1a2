//! Groups missing ranges into multi-entity fetch batches.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::gaps::MissingRange;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FetchBatch {
    pub first_missing_date: NaiveDate,
    pub last_missing_date: NaiveDate,
    pub entity_ids: Vec<String>,
}

impl FetchBatch {
    pub fn date_key(&self) -> (String, String) {
        (
            self.first_missing_date.format(DATE_FORMAT).to_string(),
            self.last_missing_date.format(DATE_FORMAT).to_string(),
        )
    }
}

// Exact (first, last) equality; overlapping ranges stay apart.
pub fn batch_by_range(ranges: &[MissingRange]) -> Vec<FetchBatch> {
    let mut grouped: BTreeMap<(NaiveDate, NaiveDate), BTreeSet<&str>> = BTreeMap::new();
    for range in ranges {
        grouped
            .entry((range.first_missing_date, range.last_missing_date))
            .or_default()
            .insert(range.entity_id.as_str());
    }

    grouped
        .into_iter()
        .map(|((first, last), ids)| FetchBatch {
            first_missing_date: first,
            last_missing_date: last,
            entity_ids: ids.into_iter().map(str::to_string).collect(),
        })
        .collect()
}

pub fn batches_by_date_key(batches: &[FetchBatch]) -> BTreeMap<(String, String), Vec<String>> {
    batches
        .iter()
        .map(|batch| (batch.date_key(), batch.entity_ids.clone()))
        .collect()
}

pub fn batch_fingerprint(by_key: &BTreeMap<(String, String), Vec<String>>) -> String {
    let mut hasher = Sha256::new();
    for ((first, last), ids) in by_key {
        hasher.update(first.as_bytes());
        hasher.update(b"|");
        hasher.update(last.as_bytes());
        hasher.update(b"|");
        hasher.update(ids.join(",").as_bytes());
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}
