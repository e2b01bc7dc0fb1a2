//! Trading-day calendars.
//!
//! A calendar answers one question: which dates in `[start, end]` did the
//! market open? Both bounds are inclusive and the output is ascending and
//! duplicate-free.

use chrono::{Datelike, Days, NaiveDate, Weekday};

pub trait TradingCalendar {
    fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NyseCalendar;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixedCalendar {
    days: Vec<NaiveDate>,
}

// Closures outside the regular holiday schedule (weather, national mourning).
const UNSCHEDULED_CLOSURES: [(i32, u32, u32); 12] = [
    (1985, 9, 27),
    (1994, 4, 27),
    (2001, 9, 11),
    (2001, 9, 12),
    (2001, 9, 13),
    (2001, 9, 14),
    (2004, 6, 11),
    (2007, 1, 2),
    (2012, 10, 29),
    (2012, 10, 30),
    (2018, 12, 5),
    (2025, 1, 9),
];

impl TradingCalendar for NyseCalendar {
    fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let mut out = Vec::new();
        let mut holidays: (i32, Vec<NaiveDate>) = (start.year(), nyse_holidays(start.year()));
        let mut day = start;
        while day <= end {
            if day.year() != holidays.0 {
                holidays = (day.year(), nyse_holidays(day.year()));
            }
            if is_open(day, &holidays.1) {
                out.push(day);
            }
            day = match day.checked_add_days(Days::new(1)) {
                Some(next) => next,
                None => break,
            };
        }
        out
    }
}

impl FixedCalendar {
    pub fn new(days: impl IntoIterator<Item = NaiveDate>) -> Self {
        let mut days: Vec<NaiveDate> = days.into_iter().collect();
        days.sort_unstable();
        days.dedup();
        Self { days }
    }

    pub fn days(&self) -> &[NaiveDate] {
        &self.days
    }
}

impl TradingCalendar for FixedCalendar {
    fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        if end < start {
            return Vec::new();
        }
        let lo = self.days.partition_point(|day| *day < start);
        let hi = self.days.partition_point(|day| *day <= end);
        self.days[lo..hi].to_vec()
    }
}

pub fn is_nyse_trading_day(date: NaiveDate) -> bool {
    is_open(date, &nyse_holidays(date.year()))
}

fn is_open(date: NaiveDate, holidays: &[NaiveDate]) -> bool {
    if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    if UNSCHEDULED_CLOSURES.contains(&(date.year(), date.month(), date.day())) {
        return false;
    }
    !holidays.contains(&date)
}

pub fn nyse_holidays(year: i32) -> Vec<NaiveDate> {
    let mut out = Vec::with_capacity(10);

    // New Year's Day on a Saturday is not moved back into the prior year.
    if let Some(new_year) = NaiveDate::from_ymd_opt(year, 1, 1) {
        match new_year.weekday() {
            Weekday::Sat => {}
            Weekday::Sun => out.extend(new_year.checked_add_days(Days::new(1))),
            _ => out.push(new_year),
        }
    }

    if year >= 1998 {
        out.extend(NaiveDate::from_weekday_of_month_opt(
            year,
            1,
            Weekday::Mon,
            3,
        ));
    }
    out.extend(NaiveDate::from_weekday_of_month_opt(
        year,
        2,
        Weekday::Mon,
        3,
    ));
    out.extend(easter_sunday(year).and_then(|easter| easter.checked_sub_days(Days::new(2))));
    out.extend(last_weekday_of_month(year, 5, Weekday::Mon));
    if year >= 2022 {
        out.extend(observed(year, 6, 19));
    }
    out.extend(observed(year, 7, 4));
    out.extend(NaiveDate::from_weekday_of_month_opt(
        year,
        9,
        Weekday::Mon,
        1,
    ));
    out.extend(NaiveDate::from_weekday_of_month_opt(
        year,
        11,
        Weekday::Thu,
        4,
    ));
    out.extend(observed(year, 12, 25));

    out.sort_unstable();
    out
}

fn observed(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    match date.weekday() {
        Weekday::Sat => date.checked_sub_days(Days::new(1)),
        Weekday::Sun => date.checked_add_days(Days::new(1)),
        _ => Some(date),
    }
}

fn last_weekday_of_month(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let mut day = NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()?;
    while day.weekday() != weekday {
        day = day.pred_opt()?;
    }
    Some(day)
}

// Anonymous Gregorian algorithm.
fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}
