//! Detector framework: pure, total, deterministic checks over the
//! transaction/ledger/facts snapshot.
//!
//! Detectors never touch persistence and never panic on thin data; when a
//! required input is insufficient they return an empty result and the skip
//! is visible in the debug log. The registry is an explicit value built at
//! startup and handed to the orchestrator, so tests can assemble their own.

mod drift;
mod expense_creep;
mod outflow_spike;
mod revenue;
mod runway;
mod structure;

pub use drift::{MonthlyNetDrift, SeasonalDeviation};
pub use expense_creep::ExpenseCreep;
pub use outflow_spike::OutflowSpike;
pub use revenue::{RevenueDecline, RevenueVolatility};
pub use runway::LowCashRunway;
pub use structure::{
    CliffConcentration, CounterpartyConcentration, SignalFlapping, TimingMismatch,
    UncategorizedRatio,
};

use std::collections::BTreeMap;
use std::fmt;

use chrono::{Duration, NaiveDate};

use crate::config::Config;
use crate::facts::Facts;
use crate::ledger::{LedgerRow, NormalizedTransaction};
use crate::signal::DetectedSignal;

/// Typed detector failure. One failing detector degrades only itself; the
/// orchestrator folds the error into a visible observation and keeps going.
#[derive(Debug, Clone)]
pub struct DetectorError {
    pub detector: &'static str,
    pub message: String,
}

impl DetectorError {
    pub fn new(detector: &'static str, message: impl Into<String>) -> Self {
        Self { detector, message: message.into() }
    }
}

impl fmt::Display for DetectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "detector {} failed: {}", self.detector, self.message)
    }
}

impl std::error::Error for DetectorError {}

/// Everything a detector may look at. All value objects; `flap_counts` is
/// precomputed by the orchestrator from the audit log so detectors stay pure.
pub struct DetectorContext<'a> {
    pub business_id: &'a str,
    pub transactions: &'a [NormalizedTransaction],
    pub ledger: &'a [LedgerRow],
    pub facts: &'a Facts,
    pub config: &'a Config,
    /// Recent status transitions per signal_id.
    pub flap_counts: &'a BTreeMap<String, u32>,
}

pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, ctx: &DetectorContext) -> Result<Vec<DetectedSignal>, DetectorError>;
}

/// Ordered collection of detectors, passed into the orchestrator.
pub struct DetectorRegistry {
    detectors: Vec<Box<dyn Detector>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self { detectors: Vec::new() }
    }

    /// The full production registry, in a fixed evaluation order.
    pub fn standard() -> Self {
        let mut reg = Self::new();
        reg.register(Box::new(ExpenseCreep));
        reg.register(Box::new(LowCashRunway));
        reg.register(Box::new(OutflowSpike));
        reg.register(Box::new(RevenueDecline));
        reg.register(Box::new(RevenueVolatility));
        reg.register(Box::new(MonthlyNetDrift));
        reg.register(Box::new(SeasonalDeviation));
        reg.register(Box::new(TimingMismatch));
        reg.register(Box::new(CliffConcentration));
        reg.register(Box::new(CounterpartyConcentration));
        reg.register(Box::new(UncategorizedRatio));
        reg.register(Box::new(SignalFlapping));
        reg
    }

    pub fn register(&mut self, detector: Box<dyn Detector>) {
        self.detectors.push(detector);
    }

    pub fn detectors(&self) -> &[Box<dyn Detector>] {
        &self.detectors
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Stable vendor key: counterparty hint when present, else the normalized
/// description. Lowercased and whitespace-collapsed so formatting changes in
/// the feed do not split a vendor's history.
pub(crate) fn vendor_key(txn: &NormalizedTransaction) -> String {
    let raw = txn
        .counterparty_hint
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(&txn.description);
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Anchor date for windowed detectors: the facts as-of date.
pub(crate) fn anchor_date(ctx: &DetectorContext) -> Option<NaiveDate> {
    ctx.facts.meta.as_of
}

/// Daily outflow totals over `[start, end]`, one entry per calendar day
/// (zero-filled) so trailing statistics see quiet days too.
pub(crate) fn daily_outflow(
    transactions: &[NormalizedTransaction],
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<(NaiveDate, f64)> {
    let mut by_day: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    let mut day = start;
    while day <= end {
        by_day.insert(day, 0.0);
        day += Duration::days(1);
    }
    for t in transactions {
        if t.date >= start && t.date <= end {
            let signed = t.signed_amount();
            if signed < 0.0 {
                *by_day.entry(t.date).or_insert(0.0) += -signed;
            }
        }
    }
    by_day.into_iter().collect()
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::facts;
    use crate::ledger;

    /// Build a context bundle for detector unit tests.
    pub struct CtxBundle {
        pub transactions: Vec<NormalizedTransaction>,
        pub ledger: Vec<LedgerRow>,
        pub facts: Facts,
        pub config: Config,
        pub flap_counts: BTreeMap<String, u32>,
    }

    impl CtxBundle {
        pub fn new(transactions: Vec<NormalizedTransaction>, opening_balance: f64) -> Self {
            Self::with_config(transactions, opening_balance, Config::from_env())
        }

        pub fn with_config(
            transactions: Vec<NormalizedTransaction>,
            opening_balance: f64,
            config: Config,
        ) -> Self {
            let ledger = ledger::build(&transactions, opening_balance);
            let facts = facts::compute(&transactions, &ledger, &config.facts_window_days());
            Self {
                transactions,
                ledger,
                facts,
                config,
                flap_counts: BTreeMap::new(),
            }
        }

        pub fn ctx(&self) -> DetectorContext<'_> {
            DetectorContext {
                business_id: "biz-test",
                transactions: &self.transactions,
                ledger: &self.ledger,
                facts: &self.facts,
                config: &self.config,
                flap_counts: &self.flap_counts,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{testutil::txn, Direction};

    #[test]
    fn vendor_key_prefers_hint_and_normalizes() {
        let mut t = txn("a", (2025, 1, 1), "ACME  Cloud   Hosting", 10.0, Direction::Outflow);
        assert_eq!(vendor_key(&t), "acme cloud hosting");
        t.counterparty_hint = Some("Acme Corp".to_string());
        assert_eq!(vendor_key(&t), "acme corp");
        t.counterparty_hint = Some("   ".to_string());
        assert_eq!(vendor_key(&t), "acme cloud hosting");
    }

    #[test]
    fn daily_outflow_zero_fills_quiet_days() {
        let txns = vec![
            txn("a", (2025, 1, 1), "Rent", 100.0, Direction::Outflow),
            txn("b", (2025, 1, 3), "Power", 50.0, Direction::Outflow),
            txn("c", (2025, 1, 2), "Sale", 70.0, Direction::Inflow),
        ];
        let start = chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let end = chrono::NaiveDate::from_ymd_opt(2025, 1, 3).unwrap();
        let days = daily_outflow(&txns, start, end);
        assert_eq!(days.len(), 3);
        assert_eq!(days[1].1, 0.0);
        assert_eq!(days[2].1, 50.0);
    }

    #[test]
    fn standard_registry_is_populated() {
        let reg = DetectorRegistry::standard();
        assert_eq!(reg.len(), 12);
        let mut names: Vec<&str> = reg.detectors().iter().map(|d| d.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 12, "detector names must be unique");
    }
}
