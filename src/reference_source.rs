//! Membership tables from the reference web page.
//!
//! The page is fetched with a conditional GET keyed on the `Last-Modified`
//! value saved by the previous refresh. Its constituents and changes tables
//! are parsed from HTML, flattened into snake_case columns, and written over
//! the store's membership tables.

use std::path::{Path, PathBuf};

use scraper::{ElementRef, Html, Selector};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::membership::{ChangeRecord, RosterEntity};
use crate::store::{SqliteStore, StoreError};

pub const DEFAULT_REFERENCE_URL: &str =
    "https://en.wikipedia.org/wiki/List_of_S%26P_500_companies";
pub const DEFAULT_LAST_MODIFIED_PATH: &str = "data/raw/sp500_last_modified.txt";

const CONSTITUENTS_TABLE_ID: &str = "constituents";
const CHANGES_TABLE_ID: &str = "changes";
const MAX_CELL_SPAN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSourceConfig {
    pub url: String,
    pub last_modified_path: PathBuf,
    pub http_timeout_ms: u64,
    pub user_agent: String,
}

impl Default for ReferenceSourceConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REFERENCE_URL.to_string(),
            last_modified_path: PathBuf::from(DEFAULT_LAST_MODIFIED_PATH),
            http_timeout_ms: 15_000,
            user_agent: "indexgap/0.1 (membership refresh)".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReferenceSourceError {
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("unexpected HTTP status {status} for {url}")]
    UnexpectedStatus { url: String, status: u16 },
    #[error("invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },
    #[error("table '{0}' not found on reference page")]
    MissingTable(String),
    #[error("failed to map row of table '{table}': {message}")]
    Row { table: String, message: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageResponse {
    pub status: u16,
    pub body: String,
    pub last_modified: Option<String>,
}

pub trait PageFetcher {
    fn get_page(
        &self,
        url: &str,
        if_modified_since: Option<&str>,
    ) -> Result<PageResponse, ReferenceSourceError>;
}

pub struct ReqwestPageFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestPageFetcher {
    pub fn new(cfg: &ReferenceSourceConfig) -> Result<Self, ReferenceSourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.http_timeout_ms))
            .user_agent(cfg.user_agent.clone())
            .build()
            .map_err(|err| ReferenceSourceError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl PageFetcher for ReqwestPageFetcher {
    fn get_page(
        &self,
        url: &str,
        if_modified_since: Option<&str>,
    ) -> Result<PageResponse, ReferenceSourceError> {
        let mut request = self.client.get(url);
        if let Some(marker) = if_modified_since {
            request = request.header(reqwest::header::IF_MODIFIED_SINCE, marker);
        }
        let response = request
            .send()
            .map_err(|err| ReferenceSourceError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status().as_u16();
        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .map_err(|err| ReferenceSourceError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        Ok(PageResponse {
            status,
            body,
            last_modified,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    NotModified,
    Updated {
        roster_rows: usize,
        change_rows: usize,
        last_modified: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HtmlTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub dropped_rows: usize,
}

impl HtmlTable {
    pub fn records<T: DeserializeOwned>(
        &self,
        table_id: &str,
    ) -> Result<Vec<T>, ReferenceSourceError> {
        self.rows
            .iter()
            .map(|row| {
                let object: Map<String, Value> = self
                    .headers
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned().map(Value::String))
                    .collect();
                serde_json::from_value(Value::Object(object)).map_err(|err| {
                    ReferenceSourceError::Row {
                        table: table_id.to_string(),
                        message: err.to_string(),
                    }
                })
            })
            .collect()
    }
}

pub fn refresh_reference_tables(
    store: &mut SqliteStore,
    fetcher: &dyn PageFetcher,
    cfg: &ReferenceSourceConfig,
) -> Result<RefreshOutcome, ReferenceSourceError> {
    let marker = read_last_modified(&cfg.last_modified_path);
    let response = fetcher.get_page(&cfg.url, marker.as_deref())?;

    match response.status {
        304 => {
            info!(
                component = "reference_source",
                event = "reference.refresh.not_modified",
                url = %cfg.url,
                last_modified = marker.as_deref().unwrap_or("")
            );
            return Ok(RefreshOutcome::NotModified);
        }
        200 => {}
        status => {
            return Err(ReferenceSourceError::UnexpectedStatus {
                url: cfg.url.clone(),
                status,
            });
        }
    }

    let document = Html::parse_document(&response.body);
    let constituents = extract_table(&document, CONSTITUENTS_TABLE_ID)?;
    let changes = extract_table(&document, CHANGES_TABLE_ID)?;
    let roster: Vec<RosterEntity> = constituents.records(CONSTITUENTS_TABLE_ID)?;
    let change_records: Vec<ChangeRecord> = changes.records(CHANGES_TABLE_ID)?;

    store.replace_roster(&roster)?;
    store.replace_change_records(&change_records)?;

    if let Some(value) = response.last_modified.as_deref() {
        if let Err(err) = write_last_modified(&cfg.last_modified_path, value) {
            warn!(
                component = "reference_source",
                event = "reference.marker.write_failed",
                path = %cfg.last_modified_path.display(),
                last_modified = value,
                error = %err
            );
        }
    }

    info!(
        component = "reference_source",
        event = "reference.refresh.finish",
        url = %cfg.url,
        roster_rows = roster.len(),
        change_rows = change_records.len(),
        dropped_rows = constituents.dropped_rows + changes.dropped_rows,
        last_modified = response.last_modified.as_deref().unwrap_or("")
    );

    Ok(RefreshOutcome::Updated {
        roster_rows: roster.len(),
        change_rows: change_records.len(),
        last_modified: response.last_modified,
    })
}

pub fn extract_table(document: &Html, table_id: &str) -> Result<HtmlTable, ReferenceSourceError> {
    let table_selector = selector(&format!("table#{table_id}"))?;
    let table = document
        .select(&table_selector)
        .next()
        .ok_or_else(|| ReferenceSourceError::MissingTable(table_id.to_string()))?;
    parse_table(table, table_id)
}

fn parse_table(table: ElementRef<'_>, table_id: &str) -> Result<HtmlTable, ReferenceSourceError> {
    let tr = selector("tr")?;
    let th = selector("th")?;
    let td = selector("td")?;
    let th_or_td = selector("th, td")?;

    let mut header_rows = Vec::new();
    let mut data_rows = Vec::new();
    let mut header_ended = false;
    for row in table.select(&tr) {
        if !header_ended && row.select(&th).next().is_some() {
            header_rows.push(row);
        } else {
            header_ended = true;
            if row.select(&td).next().is_some() {
                data_rows.push(row);
            }
        }
    }

    let headers = flatten_headers(&header_rows, &th_or_td);

    let mut rows = Vec::with_capacity(data_rows.len());
    let mut dropped_rows = 0usize;
    for row in data_rows {
        let cells: Vec<String> = row.select(&td).map(cell_text).collect();
        if !headers.is_empty() && cells.len() != headers.len() {
            dropped_rows += 1;
            debug!(
                component = "reference_source",
                event = "reference.table.row_dropped",
                table = table_id,
                expected_cells = headers.len(),
                cells = cells.len()
            );
            continue;
        }
        rows.push(cells);
    }

    if dropped_rows > 0 {
        warn!(
            component = "reference_source",
            event = "reference.table.rows_dropped",
            table = table_id,
            dropped_rows
        );
    }

    Ok(HtmlTable {
        headers,
        rows,
        dropped_rows,
    })
}

// Lays header cells on a grid so rowspan/colspan cells fill every slot they
// cover, then joins the distinct texts down each column.
fn flatten_headers(header_rows: &[ElementRef<'_>], cells: &Selector) -> Vec<String> {
    let mut grid: Vec<Vec<Option<String>>> = vec![Vec::new(); header_rows.len()];

    for (r, row) in header_rows.iter().enumerate() {
        for cell in row.select(cells) {
            let mut c = 0;
            while grid[r].get(c).is_some_and(Option::is_some) {
                c += 1;
            }

            let text = cell_text(cell);
            let rowspan = span_attr(cell, "rowspan");
            let colspan = span_attr(cell, "colspan");
            for i in 0..rowspan {
                let rr = r + i;
                if grid.len() <= rr {
                    grid.resize(rr + 1, Vec::new());
                }
                for j in 0..colspan {
                    let cc = c + j;
                    if grid[rr].len() <= cc {
                        grid[rr].resize(cc + 1, None);
                    }
                    grid[rr][cc] = Some(text.clone());
                }
            }
        }
    }

    let width = grid.iter().map(Vec::len).max().unwrap_or(0);
    (0..width)
        .map(|c| {
            let mut parts: Vec<&str> = Vec::new();
            for row in &grid {
                if let Some(Some(text)) = row.get(c) {
                    if !parts.contains(&text.as_str()) {
                        parts.push(text);
                    }
                }
            }
            snake_case(&parts.join(" "))
        })
        .collect()
}

fn snake_case(raw: &str) -> String {
    raw.to_lowercase()
        .replace([' ', '-'], "_")
        .replace('.', "")
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

fn span_attr(cell: ElementRef<'_>, name: &str) -> usize {
    cell.value()
        .attr(name)
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .unwrap_or(1)
        .clamp(1, MAX_CELL_SPAN)
}

fn selector(raw: &str) -> Result<Selector, ReferenceSourceError> {
    Selector::parse(raw).map_err(|err| ReferenceSourceError::Selector {
        selector: raw.to_string(),
        message: format!("{err:?}"),
    })
}

fn read_last_modified(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let trimmed = raw.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Err(err) => {
            warn!(
                component = "reference_source",
                event = "reference.marker.read_failed",
                path = %path.display(),
                error = %err
            );
            None
        }
    }
}

fn write_last_modified(path: &Path, value: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MembershipSource;
    use std::sync::Mutex;

    const PAGE: &str = r#"
<html><body>
<table class="wikitable sortable" id="constituents">
  <tbody>
    <tr><th>Symbol</th><th>Security</th><th>GICS Sector</th><th>GICS Sub-Industry</th>
        <th>Headquarters Location</th><th>Date added</th><th>CIK</th><th>Founded</th></tr>
    <tr><td><a href="/x">MMM</a></td><td>3M</td><td>Industrials</td>
        <td>Industrial Conglomerates</td><td>Saint Paul, Minnesota</td>
        <td>1957-03-04</td><td>0000066740</td><td>1902</td></tr>
    <tr><td>AOS</td><td>A. O. Smith</td><td>Industrials</td><td>Building Products</td>
        <td>Milwaukee, Wisconsin</td><td>2017-07-26</td><td>0000091142</td><td>1916</td></tr>
  </tbody>
</table>
<table class="wikitable sortable" id="changes">
  <tbody>
    <tr><th rowspan="2">Effective Date</th><th colspan="2">Added</th>
        <th colspan="2">Removed</th><th rowspan="2">Reason</th></tr>
    <tr><th>Ticker</th><th>Security</th><th>Ticker</th><th>Security</th></tr>
    <tr><td>March 24, 2025</td><td>DASH</td><td>DoorDash</td><td>BWA</td>
        <td>BorgWarner</td><td>Market capitalization change.</td></tr>
    <tr><td>December 23, 2024</td><td>APO</td><td>Apollo Global Management</td>
        <td></td><td></td><td>Index rebalance.</td></tr>
    <tr><td colspan="3">Footnote row spanning a few cells</td></tr>
  </tbody>
</table>
</body></html>
"#;

    struct ScriptedPageFetcher {
        response: PageResponse,
        seen_markers: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedPageFetcher {
        fn new(status: u16, body: &str, last_modified: Option<&str>) -> Self {
            Self {
                response: PageResponse {
                    status,
                    body: body.to_string(),
                    last_modified: last_modified.map(str::to_string),
                },
                seen_markers: Mutex::new(Vec::new()),
            }
        }
    }

    impl PageFetcher for ScriptedPageFetcher {
        fn get_page(
            &self,
            _url: &str,
            if_modified_since: Option<&str>,
        ) -> Result<PageResponse, ReferenceSourceError> {
            self.seen_markers
                .lock()
                .unwrap()
                .push(if_modified_since.map(str::to_string));
            Ok(self.response.clone())
        }
    }

    fn config_in(dir: &Path) -> ReferenceSourceConfig {
        ReferenceSourceConfig {
            url: "https://reference.test/list".to_string(),
            last_modified_path: dir.join("raw/last_modified.txt"),
            ..ReferenceSourceConfig::default()
        }
    }

    #[test]
    fn multi_row_headers_flatten_to_snake_case_columns() {
        let document = Html::parse_document(PAGE);
        let table = extract_table(&document, "changes").unwrap();

        assert_eq!(
            table.headers,
            vec![
                "effective_date",
                "added_ticker",
                "added_security",
                "removed_ticker",
                "removed_security",
                "reason",
            ]
        );
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.dropped_rows, 1);
        assert_eq!(table.rows[1][3], "");
    }

    #[test]
    fn single_row_headers_map_onto_roster_rows() {
        let document = Html::parse_document(PAGE);
        let table = extract_table(&document, "constituents").unwrap();
        assert_eq!(table.headers[3], "gics_sub_industry");

        let roster: Vec<RosterEntity> = table.records("constituents").unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].entity_id, "MMM");
        assert_eq!(roster[1].security.as_deref(), Some("A. O. Smith"));
        assert_eq!(roster[0].date_added.as_deref(), Some("1957-03-04"));
    }

    #[test]
    fn missing_table_is_an_error() {
        let document = Html::parse_document("<html><body><p>moved</p></body></html>");
        let err = extract_table(&document, "changes").unwrap_err();
        assert!(matches!(err, ReferenceSourceError::MissingTable(id) if id == "changes"));
    }

    #[test]
    fn fresh_page_replaces_tables_and_saves_marker() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(dir.path());
        let mut store = SqliteStore::open_in_memory().unwrap();
        let fetcher =
            ScriptedPageFetcher::new(200, PAGE, Some("Tue, 01 Apr 2025 08:00:00 GMT"));

        let outcome = refresh_reference_tables(&mut store, &fetcher, &cfg).unwrap();

        assert_eq!(
            outcome,
            RefreshOutcome::Updated {
                roster_rows: 2,
                change_rows: 2,
                last_modified: Some("Tue, 01 Apr 2025 08:00:00 GMT".to_string()),
            }
        );
        assert_eq!(fetcher.seen_markers.lock().unwrap().as_slice(), &[None]);
        let changes = store.read_change_records().unwrap();
        assert_eq!(changes[0].effective_date, "March 24, 2025");
        assert_eq!(changes[0].removed_ticker.as_deref(), Some("BWA"));
        assert_eq!(store.read_roster().unwrap().len(), 2);
        assert_eq!(
            std::fs::read_to_string(&cfg.last_modified_path).unwrap(),
            "Tue, 01 Apr 2025 08:00:00 GMT"
        );
    }

    #[test]
    fn not_modified_page_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(dir.path());
        write_last_modified(&cfg.last_modified_path, "Tue, 01 Apr 2025 08:00:00 GMT\n").unwrap();

        let mut store = SqliteStore::open_in_memory().unwrap();
        let fetcher = ScriptedPageFetcher::new(304, "", None);

        let outcome = refresh_reference_tables(&mut store, &fetcher, &cfg).unwrap();

        assert_eq!(outcome, RefreshOutcome::NotModified);
        assert_eq!(
            fetcher.seen_markers.lock().unwrap().as_slice(),
            &[Some("Tue, 01 Apr 2025 08:00:00 GMT".to_string())]
        );
        assert!(store.read_change_records().unwrap().is_empty());
        assert!(store.read_roster().unwrap().is_empty());
    }

    #[test]
    fn unexpected_status_keeps_previous_marker() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_in(dir.path());
        write_last_modified(&cfg.last_modified_path, "old").unwrap();

        let mut store = SqliteStore::open_in_memory().unwrap();
        let fetcher = ScriptedPageFetcher::new(503, "", Some("new"));

        let err = refresh_reference_tables(&mut store, &fetcher, &cfg).unwrap_err();
        assert!(matches!(
            err,
            ReferenceSourceError::UnexpectedStatus { status: 503, .. }
        ));
        assert_eq!(
            std::fs::read_to_string(&cfg.last_modified_path).unwrap(),
            "old"
        );
    }
}
