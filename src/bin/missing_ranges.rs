use std::time::Instant;

use indexgap::{
    get_missing_ranges, init_logging, log_app_finish, log_app_start, log_run_config,
    logging_config_from_env, run_config_from_env, NyseCalendar, SqliteStore,
};
use serde_json::json;

const COMPONENT: &str = "missing_ranges";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let started = Instant::now();
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start(COMPONENT, &logging);

    let cfg = run_config_from_env();
    log_run_config(COMPONENT, &cfg);

    let store = SqliteStore::open(&cfg.store_path)?;
    let plan = get_missing_ranges(cfg.start, cfg.end, &store, &NyseCalendar, &cfg.gap_policy())?;

    let batches: Vec<_> = plan
        .by_date_key
        .iter()
        .map(|((first, last), entity_ids)| {
            json!({
                "first_missing_date": first,
                "last_missing_date": last,
                "entity_ids": entity_ids,
            })
        })
        .collect();
    let output = json!({
        "start": plan.start,
        "end": plan.end,
        "fingerprint": plan.fingerprint,
        "timeline": plan.timeline,
        "gaps": plan.gaps,
        "batches": batches,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    log_app_finish(COMPONENT, started.elapsed().as_millis());
    Ok(())
}
