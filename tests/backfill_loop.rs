use std::cell::RefCell;
use std::collections::HashSet;

use chrono::NaiveDate;
use indexgap::{
    run_backfill, BackfillRequest, DailyBar, FetchError, FixedCalendar, GapPolicy, NyseCalendar,
    PriceHistoryFetcher, RosterEntity, SqliteStore, TradingCalendar,
};
use tempfile::tempdir;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn roster(ids: &[&str]) -> Vec<RosterEntity> {
    ids.iter()
        .map(|id| RosterEntity {
            entity_id: id.to_string(),
            ..RosterEntity::default()
        })
        .collect()
}

fn request(max_passes: u32) -> BackfillRequest {
    BackfillRequest {
        start: date(2024, 6, 3),
        end: date(2024, 6, 28),
        policy: GapPolicy::default(),
        max_passes,
    }
}

// Serves bars for known trading days, skipping tickers in `unknown` and
// days in `withheld` on the first call only.
struct ScriptedFetcher {
    trading_days: Vec<NaiveDate>,
    unknown: HashSet<String>,
    withheld: Vec<NaiveDate>,
    calls: RefCell<Vec<(Vec<String>, NaiveDate, NaiveDate)>>,
}

impl ScriptedFetcher {
    fn new(trading_days: Vec<NaiveDate>) -> Self {
        Self {
            trading_days,
            unknown: HashSet::new(),
            withheld: Vec::new(),
            calls: RefCell::new(Vec::new()),
        }
    }
}

impl PriceHistoryFetcher for ScriptedFetcher {
    fn fetch_daily_bars(
        &self,
        entity_ids: &[String],
        start: NaiveDate,
        end_exclusive: NaiveDate,
    ) -> Result<Vec<DailyBar>, FetchError> {
        let first_call = self.calls.borrow().is_empty();
        self.calls
            .borrow_mut()
            .push((entity_ids.to_vec(), start, end_exclusive));

        let known: Vec<&String> = entity_ids
            .iter()
            .filter(|id| !self.unknown.contains(*id))
            .collect();
        if known.is_empty() {
            return Err(FetchError::AllFailed {
                attempted: entity_ids.len(),
                last_error: "No data found, symbol may be delisted".to_string(),
            });
        }

        let mut bars = Vec::new();
        for id in known {
            for day in &self.trading_days {
                if *day < start || *day >= end_exclusive {
                    continue;
                }
                if first_call && self.withheld.contains(day) {
                    continue;
                }
                bars.push(DailyBar {
                    entity_id: id.clone(),
                    date: *day,
                    open: Some(50.0),
                    high: Some(51.0),
                    low: Some(49.0),
                    close: Some(50.5),
                    volume: Some(42_000),
                });
            }
        }
        Ok(bars)
    }
}

#[test]
fn backfill_fills_store_and_second_run_is_a_no_op() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stock_data.db");
    let mut store = SqliteStore::open(&path).unwrap();
    store.replace_roster(&roster(&["AAA", "BBB"])).unwrap();

    let days = NyseCalendar.trading_days(date(2024, 6, 3), date(2024, 6, 28));
    let fetcher = ScriptedFetcher::new(days.clone());

    let report = run_backfill(&mut store, &fetcher, &NyseCalendar, &request(3)).unwrap();
    assert_eq!(report.passes, 1);
    assert_eq!(report.remaining_ranges, 0);
    assert_eq!(report.rows_written, (days.len() * 2) as u64);
    assert_eq!(store.count_daily_prices().unwrap(), (days.len() * 2) as u64);

    {
        let calls = fetcher.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, date(2024, 6, 3));
        assert_eq!(calls[0].2, date(2024, 6, 29));
    }

    let again = run_backfill(&mut store, &fetcher, &NyseCalendar, &request(3)).unwrap();
    assert_eq!(again.passes, 0);
    assert_eq!(again.rows_written, 0);
    assert_eq!(fetcher.calls.borrow().len(), 1);
}

#[test]
fn second_pass_targets_only_the_remaining_hole() {
    let dir = tempdir().unwrap();
    let mut store = SqliteStore::open(&dir.path().join("stock_data.db")).unwrap();
    store.replace_roster(&roster(&["AAA"])).unwrap();

    let days = NyseCalendar.trading_days(date(2024, 6, 3), date(2024, 6, 28));
    let mut fetcher = ScriptedFetcher::new(days);
    // 2024-06-19 is the Juneteenth holiday, so these are six consecutive
    // trading days.
    fetcher.withheld = vec![
        date(2024, 6, 14),
        date(2024, 6, 17),
        date(2024, 6, 18),
        date(2024, 6, 20),
        date(2024, 6, 21),
        date(2024, 6, 24),
    ];

    let report = run_backfill(&mut store, &fetcher, &NyseCalendar, &request(3)).unwrap();

    assert_eq!(report.passes, 2);
    assert_eq!(report.remaining_ranges, 0);
    let calls = fetcher.calls.borrow();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].0, vec!["AAA".to_string()]);
    assert_eq!(calls[1].1, date(2024, 6, 14));
    assert_eq!(calls[1].2, date(2024, 6, 25));
}

#[test]
fn unknown_tickers_are_counted_and_the_loop_terminates() {
    let dir = tempdir().unwrap();
    let mut store = SqliteStore::open(&dir.path().join("stock_data.db")).unwrap();
    store.replace_roster(&roster(&["DELISTED"])).unwrap();

    let calendar =
        FixedCalendar::new(NyseCalendar.trading_days(date(2024, 6, 3), date(2024, 6, 28)));
    let mut fetcher = ScriptedFetcher::new(calendar.days().to_vec());
    fetcher.unknown.insert("DELISTED".to_string());

    let report = run_backfill(&mut store, &fetcher, &calendar, &request(10)).unwrap();

    assert_eq!(report.passes, 1);
    assert_eq!(report.batches_failed, 1);
    assert_eq!(report.rows_written, 0);
    assert_eq!(report.remaining_ranges, 1);
    assert_eq!(fetcher.calls.borrow().len(), 1);
}

#[test]
fn max_passes_caps_the_loop() {
    let dir = tempdir().unwrap();
    let mut store = SqliteStore::open(&dir.path().join("stock_data.db")).unwrap();
    store.replace_roster(&roster(&["AAA"])).unwrap();

    let fetcher = ScriptedFetcher::new(Vec::new());
    let report = run_backfill(&mut store, &fetcher, &NyseCalendar, &request(0)).unwrap();

    assert_eq!(report.passes, 0);
    assert_eq!(report.remaining_ranges, 1);
    assert!(fetcher.calls.borrow().is_empty());
}
