use std::time::Instant;

use indexgap::{
    init_logging, log_app_finish, log_app_start, log_run_config, logging_config_from_env,
    run_backfill, run_config_from_env, BackfillRequest, NyseCalendar, SqliteStore,
    YahooChartFetcher,
};

const COMPONENT: &str = "price_backfill";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let started = Instant::now();
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start(COMPONENT, &logging);

    let cfg = run_config_from_env();
    log_run_config(COMPONENT, &cfg);

    let mut store = SqliteStore::open(&cfg.store_path)?;
    let fetcher = YahooChartFetcher::new(cfg.price_history_config())?;
    let request = BackfillRequest {
        start: cfg.start,
        end: cfg.end,
        policy: cfg.gap_policy(),
        max_passes: cfg.max_passes,
    };

    let report = run_backfill(&mut store, &fetcher, &NyseCalendar, &request)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    log_app_finish(COMPONENT, started.elapsed().as_millis());
    if report.remaining_ranges > 0 {
        eprintln!(
            "{} missing ranges remain after {} passes",
            report.remaining_ranges, report.passes
        );
    }
    Ok(())
}
