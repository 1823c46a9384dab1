//! Low cash runway: current cash divided by the trailing burn rate.

use serde_json::json;

use crate::fingerprint::{fingerprint, signal_id, FingerprintWindow};
use crate::signal::{DetectedSignal, EvidenceEntry, Severity};

use super::{Detector, DetectorContext, DetectorError};

pub struct LowCashRunway;

impl Detector for LowCashRunway {
    fn name(&self) -> &'static str {
        "low_cash_runway"
    }

    fn detect(&self, ctx: &DetectorContext) -> Result<Vec<DetectedSignal>, DetectorError> {
        let days = ctx.config.runway_window_days;
        let Some(window) = ctx.facts.windows.get(&days) else {
            return Ok(vec![]);
        };
        let cash = ctx.facts.current_cash;
        let burn_per_day = window.current.outflow / days as f64;
        // A runway estimate needs a real cash snapshot and positive burn.
        if !cash.is_finite() || cash <= 0.0 || burn_per_day <= 0.0 {
            return Ok(vec![]);
        }

        let runway_days = cash / burn_per_day;
        let severity = if runway_days < ctx.config.runway_critical_days {
            Severity::Critical
        } else if runway_days < ctx.config.runway_warn_days {
            Severity::Warning
        } else {
            return Ok(vec![]);
        };

        let fp = fingerprint(
            self.name(),
            ctx.business_id,
            "cash",
            Some(FingerprintWindow { start: window.current.start, end: window.current.end }),
        );
        Ok(vec![DetectedSignal {
            signal_id: signal_id(self.name(), &fp),
            signal_type: self.name().to_string(),
            fingerprint: fp,
            severity,
            title: format!("Cash covers about {:.0} more days", runway_days),
            summary: format!(
                "Cash of {:.2} against a {:.2}/day burn leaves roughly {:.0} days of runway",
                cash, burn_per_day, runway_days
            ),
            evidence: vec![
                EvidenceEntry::new("current_cash", "Current cash", json!(cash), "ledger")
                    .with_unit("usd"),
                EvidenceEntry::new("window_outflow", "Trailing outflow", json!(window.current.outflow), "facts")
                    .with_unit("usd"),
                EvidenceEntry::new("burn_per_day", "Daily burn", json!(burn_per_day), "derived")
                    .with_unit("usd"),
                EvidenceEntry::new("runway_days", "Runway", json!(runway_days), "derived")
                    .with_unit("days"),
                EvidenceEntry::new("window_days", "Window", json!(days), "config").with_unit("days"),
            ],
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::CtxBundle;
    use super::*;
    use crate::ledger::{testutil::txn, Direction, NormalizedTransaction};

    /// Trailing 30 days: $1,200 total outflow, no inflow. Opening balance
    /// sets current cash.
    fn burn_fixture(opening: f64) -> CtxBundle {
        let txns: Vec<NormalizedTransaction> = (1..=30u32)
            .map(|day| {
                txn(
                    &format!("o-{day}"),
                    (2025, 4, day),
                    "Payroll draw",
                    40.0,
                    Direction::Outflow,
                )
            })
            .collect();
        CtxBundle::new(txns, opening)
    }

    #[test]
    fn two_thousand_cash_at_forty_per_day_is_warning() {
        // Runway measures cash *now*: 3200 opening - 1200 burned leaves
        // current cash at 2000, i.e. 50 days at 40/day.
        let bundle = burn_fixture(3200.0);
        let signals = LowCashRunway.detect(&bundle.ctx()).unwrap();
        assert_eq!(signals.len(), 1);
        let runway = signals[0]
            .evidence
            .iter()
            .find(|e| e.key == "runway_days")
            .and_then(|e| e.value.as_f64())
            .unwrap();
        assert!((runway - 50.0).abs() < 1.0, "runway was {runway}");
        assert_eq!(signals[0].severity, Severity::Warning);
    }

    #[test]
    fn crossing_the_medium_threshold_flips_to_critical() {
        // Current cash 1000 at 40/day → 25 days, under the 30-day bar.
        let bundle = burn_fixture(2200.0);
        let signals = LowCashRunway.detect(&bundle.ctx()).unwrap();
        assert_eq!(signals[0].severity, Severity::Critical);
    }

    #[test]
    fn silent_without_positive_burn_or_cash() {
        let txns = vec![txn("i", (2025, 4, 1), "Sale", 500.0, Direction::Inflow)];
        let bundle = CtxBundle::new(txns, 1000.0);
        assert!(LowCashRunway.detect(&bundle.ctx()).unwrap().is_empty());

        let bundle = burn_fixture(0.0); // cash ends negative
        assert!(LowCashRunway.detect(&bundle.ctx()).unwrap().is_empty());
    }

    #[test]
    fn fires_even_when_configured_windows_omit_the_runway_window() {
        // The facts window set is the union of WINDOW_DAYS and the detector
        // windows, so a narrow WINDOW_DAYS override cannot mute this check.
        let mut config = crate::config::Config::from_env();
        config.window_days = vec![7, 14];
        let txns: Vec<NormalizedTransaction> = (1..=30u32)
            .map(|day| {
                txn(&format!("o-{day}"), (2025, 4, day), "Payroll draw", 40.0, Direction::Outflow)
            })
            .collect();
        let bundle = CtxBundle::with_config(txns, 2200.0, config);
        let signals = LowCashRunway.detect(&bundle.ctx()).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].severity, Severity::Critical);
    }

    #[test]
    fn healthy_runway_is_quiet() {
        let bundle = burn_fixture(101_200.0); // 100k cash → 2500 days
        assert!(LowCashRunway.detect(&bundle.ctx()).unwrap().is_empty());
    }
}
