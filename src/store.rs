//! SQLite-backed relational store for membership tables and daily prices.

use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection};
use thiserror::Error;
use tracing::{info, warn};

use crate::batching::DATE_FORMAT;
use crate::gaps::ObservedRow;
use crate::membership::{ChangeRecord, RosterEntity};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait MembershipSource {
    fn read_change_records(&self) -> Result<Vec<ChangeRecord>, StoreError>;
    fn read_roster(&self) -> Result<Vec<RosterEntity>, StoreError>;
}

pub trait ObservedPriceSource {
    fn read_observed_rows(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ObservedRow>, StoreError>;
}

pub trait PriceSink {
    fn upsert_daily_bars(&mut self, rows: &[ObservedRow]) -> Result<usize, StoreError>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        ensure_schema(&conn)?;

        info!(
            component = "store",
            event = "store.open",
            path = %path.display()
        );

        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        ensure_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn replace_change_records(&mut self, records: &[ChangeRecord]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM index_changes", [])?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO index_changes (
                    effective_date,
                    added_ticker,
                    added_security,
                    removed_ticker,
                    removed_security,
                    reason
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
            )?;
            for record in records {
                stmt.execute(params![
                    record.effective_date,
                    record.added_ticker,
                    record.added_security,
                    record.removed_ticker,
                    record.removed_security,
                    record.reason,
                ])?;
            }
        }
        tx.commit()?;

        info!(
            component = "store",
            event = "store.write.index_changes",
            rows = records.len()
        );
        Ok(())
    }

    pub fn replace_roster(&mut self, rows: &[RosterEntity]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM index_constituents", [])?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO index_constituents (
                    symbol,
                    security,
                    gics_sector,
                    gics_sub_industry,
                    headquarters_location,
                    date_added,
                    cik,
                    founded
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.entity_id,
                    row.security,
                    row.gics_sector,
                    row.gics_sub_industry,
                    row.headquarters_location,
                    row.date_added,
                    row.cik,
                    row.founded,
                ])?;
            }
        }
        tx.commit()?;

        info!(
            component = "store",
            event = "store.write.index_constituents",
            rows = rows.len()
        );
        Ok(())
    }

    pub fn count_daily_prices(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM daily_prices", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl MembershipSource for SqliteStore {
    fn read_change_records(&self) -> Result<Vec<ChangeRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT
                effective_date,
                added_ticker,
                added_security,
                removed_ticker,
                removed_security,
                reason
            FROM index_changes
            ORDER BY rowid ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ChangeRecord {
                effective_date: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                added_ticker: row.get(1)?,
                added_security: row.get(2)?,
                removed_ticker: row.get(3)?,
                removed_security: row.get(4)?,
                reason: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn read_roster(&self) -> Result<Vec<RosterEntity>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT
                symbol,
                security,
                gics_sector,
                gics_sub_industry,
                headquarters_location,
                date_added,
                cik,
                founded
            FROM index_constituents
            ORDER BY rowid ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RosterEntity {
                entity_id: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                security: row.get(1)?,
                gics_sector: row.get(2)?,
                gics_sub_industry: row.get(3)?,
                headquarters_location: row.get(4)?,
                date_added: row.get(5)?,
                cik: row.get(6)?,
                founded: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl ObservedPriceSource for SqliteStore {
    fn read_observed_rows(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ObservedRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT ticker, price_date, open, high, low, close, volume
            FROM daily_prices
            WHERE substr(price_date, 1, 10) >= ?1
              AND substr(price_date, 1, 10) <= ?2
            ORDER BY ticker ASC, price_date ASC
            ",
        )?;
        let mut rows = stmt.query(params![
            start.format(DATE_FORMAT).to_string(),
            end.format(DATE_FORMAT).to_string()
        ])?;

        let mut out = Vec::new();
        let mut malformed = 0u64;
        while let Some(row) = rows.next()? {
            let entity_id: String = row.get(0)?;
            let raw_date: String = row.get(1)?;
            let Some(date) = parse_price_date(&raw_date) else {
                malformed += 1;
                warn!(
                    component = "store",
                    event = "store.read.malformed_date",
                    table = "daily_prices",
                    entity_id = %entity_id,
                    raw_date = %raw_date
                );
                continue;
            };
            out.push(ObservedRow {
                entity_id,
                date,
                open: row.get(2)?,
                high: row.get(3)?,
                low: row.get(4)?,
                close: row.get(5)?,
                volume: row.get(6)?,
            });
        }

        info!(
            component = "store",
            event = "store.read.daily_prices",
            start = %start,
            end = %end,
            rows = out.len(),
            malformed_rows = malformed
        );
        Ok(out)
    }
}

impl PriceSink for SqliteStore {
    fn upsert_daily_bars(&mut self, rows: &[ObservedRow]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO daily_prices (
                    ticker,
                    price_date,
                    open,
                    high,
                    low,
                    close,
                    volume
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(ticker, price_date) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume
                ",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.entity_id,
                    row.date.format(DATE_FORMAT).to_string(),
                    row.open,
                    row.high,
                    row.low,
                    row.close,
                    row.volume,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySources {
    pub changes: Vec<ChangeRecord>,
    pub roster: Vec<RosterEntity>,
    pub observed: Vec<ObservedRow>,
}

impl MembershipSource for InMemorySources {
    fn read_change_records(&self) -> Result<Vec<ChangeRecord>, StoreError> {
        Ok(self.changes.clone())
    }

    fn read_roster(&self) -> Result<Vec<RosterEntity>, StoreError> {
        Ok(self.roster.clone())
    }
}

impl ObservedPriceSource for InMemorySources {
    fn read_observed_rows(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ObservedRow>, StoreError> {
        Ok(self
            .observed
            .iter()
            .filter(|row| row.date >= start && row.date <= end)
            .cloned()
            .collect())
    }
}

impl PriceSink for InMemorySources {
    fn upsert_daily_bars(&mut self, rows: &[ObservedRow]) -> Result<usize, StoreError> {
        for row in rows {
            match self
                .observed
                .iter_mut()
                .find(|existing| existing.entity_id == row.entity_id && existing.date == row.date)
            {
                Some(existing) => *existing = row.clone(),
                None => self.observed.push(row.clone()),
            }
        }
        Ok(rows.len())
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS index_changes (
            effective_date TEXT NOT NULL,
            added_ticker TEXT,
            added_security TEXT,
            removed_ticker TEXT,
            removed_security TEXT,
            reason TEXT
        );

        CREATE TABLE IF NOT EXISTS index_constituents (
            symbol TEXT NOT NULL,
            security TEXT,
            gics_sector TEXT,
            gics_sub_industry TEXT,
            headquarters_location TEXT,
            date_added TEXT,
            cik TEXT,
            founded TEXT
        );

        CREATE TABLE IF NOT EXISTS daily_prices (
            ticker TEXT NOT NULL,
            price_date TEXT NOT NULL,
            open REAL,
            high REAL,
            low REAL,
            close REAL,
            volume INTEGER,
            PRIMARY KEY(ticker, price_date)
        ) WITHOUT ROWID;
        ",
    )?;
    Ok(())
}

fn parse_price_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    NaiveDate::parse_from_str(trimmed, DATE_FORMAT)
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
}
