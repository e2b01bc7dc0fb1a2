use std::path::{Path, PathBuf};
use std::time::Instant;

use indexgap::{
    init_logging, log_app_finish, log_app_start, logging_config_from_env,
    refresh_reference_tables, run_config_from_env, ChangeRecord, RefreshOutcome,
    ReqwestPageFetcher, RosterEntity, SqliteStore,
};
use serde::de::DeserializeOwned;
use tracing::info;

const COMPONENT: &str = "membership_import";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let started = Instant::now();
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start(COMPONENT, &logging);

    let csv_paths = parse_args()?;
    let cfg = run_config_from_env();
    let mut store = SqliteStore::open(&cfg.store_path)?;

    match csv_paths {
        Some((changes_path, roster_path)) => {
            let changes: Vec<ChangeRecord> = read_csv(&changes_path)?;
            let roster: Vec<RosterEntity> = read_csv(&roster_path)?;
            store.replace_change_records(&changes)?;
            store.replace_roster(&roster)?;

            info!(
                component = COMPONENT,
                event = "import.finish",
                store_path = %cfg.store_path.display(),
                change_rows = changes.len(),
                roster_rows = roster.len()
            );
            println!(
                "Imported {} change rows and {} roster rows into {}",
                changes.len(),
                roster.len(),
                cfg.store_path.display()
            );
        }
        None => {
            let source = cfg.reference_source_config();
            let fetcher = ReqwestPageFetcher::new(&source)?;
            match refresh_reference_tables(&mut store, &fetcher, &source)? {
                RefreshOutcome::NotModified => {
                    println!("Reference page unchanged since last refresh");
                }
                RefreshOutcome::Updated {
                    roster_rows,
                    change_rows,
                    ..
                } => {
                    println!(
                        "Refreshed {change_rows} change rows and {roster_rows} roster rows into {}",
                        cfg.store_path.display()
                    );
                }
            }
        }
    }

    log_app_finish(COMPONENT, started.elapsed().as_millis());
    Ok(())
}

fn parse_args() -> Result<Option<(PathBuf, PathBuf)>, Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    match (args.next(), args.next()) {
        (None, _) => Ok(None),
        (Some(changes), Some(roster)) => Ok(Some((PathBuf::from(changes), PathBuf::from(roster)))),
        _ => Err("usage: membership_import [<changes.csv> <constituents.csv>]".into()),
    }
}

fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, Box<dyn std::error::Error>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}
