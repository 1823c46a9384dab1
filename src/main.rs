//! Pulse runner: load a business's normalized transactions from JSONL and
//! run the monitoring cycle, either once or on an interval.
//!
//! Environment:
//!   BUSINESS_ID         business to evaluate (default "default")
//!   TRANSACTIONS_PATH   JSONL file of NormalizedTransaction records
//!   OPENING_BALANCE     ledger opening balance (default 0)
//!   PULSE_FORCE         bypass the time gate ("1"/"true")
//!   PULSE_LOOP_SECS     re-pulse interval; 0 runs once and exits

use std::fs::File;
use std::io::{BufRead, BufReader};

use anyhow::{Context, Result};
use tokio::time::{sleep, Duration};

use finpulse::config::Config;
use finpulse::detectors::DetectorRegistry;
use finpulse::ledger::NormalizedTransaction;
use finpulse::logging::{log, obj, v_int, v_str, Domain, Level};
use finpulse::pulse::Orchestrator;
use finpulse::store::SignalStore;

/// Load transactions from a JSONL file, skipping blanks and comments.
/// Bad rows are counted and logged, not fatal: one mangled line should not
/// block monitoring of the rest of the book.
fn load_transactions(path: &str) -> Result<Vec<NormalizedTransaction>> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path))?;
    let mut txns = Vec::new();
    let mut bad_rows = 0u64;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<NormalizedTransaction>(trimmed) {
            Ok(txn) => txns.push(txn),
            Err(_) => bad_rows += 1,
        }
    }
    if bad_rows > 0 {
        log(
            Level::Warn,
            Domain::System,
            "bad_transaction_rows",
            obj(&[("path", v_str(path)), ("bad_rows", v_int(bad_rows as i64))]),
        );
    }
    Ok(txns)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let business_id = std::env::var("BUSINESS_ID").unwrap_or_else(|_| "default".to_string());
    let path = std::env::var("TRANSACTIONS_PATH")
        .unwrap_or_else(|_| "./transactions.jsonl".to_string());
    let opening_balance: f64 = std::env::var("OPENING_BALANCE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);
    let force = env_flag("PULSE_FORCE");
    let loop_secs: u64 = std::env::var("PULSE_LOOP_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut store = SignalStore::open(&cfg.sqlite_path)?;
    store.init()?;
    let mut orchestrator = Orchestrator::new(store, DetectorRegistry::standard(), cfg);

    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("business_id", v_str(&business_id)),
            ("transactions_path", v_str(&path)),
            ("loop_secs", v_int(loop_secs as i64)),
        ]),
    );

    loop {
        let transactions = load_transactions(&path)?;
        let outcome = orchestrator.pulse(&business_id, &transactions, opening_balance, force)?;
        println!("{}", serde_json::to_string(&outcome)?);
        if loop_secs == 0 {
            break;
        }
        sleep(Duration::from_secs(loop_secs)).await;
    }
    Ok(())
}
