//! Revenue detectors: window-over-window decline and weekly-bucket
//! volatility (coefficient of variation).

use chrono::Duration;
use serde_json::json;

use crate::facts::FlowWindow;
use crate::fingerprint::{fingerprint, signal_id, FingerprintWindow};
use crate::ledger::NormalizedTransaction;
use crate::signal::{DetectedSignal, EvidenceEntry, Severity};

use super::{Detector, DetectorContext, DetectorError};

pub struct RevenueDecline;

impl Detector for RevenueDecline {
    fn name(&self) -> &'static str {
        "revenue_decline"
    }

    fn detect(&self, ctx: &DetectorContext) -> Result<Vec<DetectedSignal>, DetectorError> {
        let days = ctx.config.revenue_window_days;
        let Some(pair) = ctx.facts.windows.get(&days) else {
            return Ok(vec![]);
        };
        let prior = pair.prior.inflow;
        let current = pair.current.inflow;
        // A decline against a trivial base is noise, not signal.
        if prior < ctx.config.revenue_min_prior_inflow {
            return Ok(vec![]);
        }
        let decline = (prior - current) / prior;
        if decline < ctx.config.revenue_decline_pct {
            return Ok(vec![]);
        }

        let fp = fingerprint(
            self.name(),
            ctx.business_id,
            "inflow",
            Some(FingerprintWindow { start: pair.current.start, end: pair.current.end }),
        );
        Ok(vec![DetectedSignal {
            signal_id: signal_id(self.name(), &fp),
            signal_type: self.name().to_string(),
            fingerprint: fp,
            severity: if decline >= 0.5 { Severity::Critical } else { Severity::Warning },
            title: format!("Revenue down {:.0}% window over window", decline * 100.0),
            summary: format!(
                "Inflow fell from {:.2} to {:.2} across consecutive {}-day windows",
                prior, current, days
            ),
            evidence: vec![
                EvidenceEntry::new("current_inflow", "Current window inflow", json!(current), "facts")
                    .with_unit("usd"),
                EvidenceEntry::new("prior_inflow", "Prior window inflow", json!(prior), "facts")
                    .with_unit("usd"),
                EvidenceEntry::new("decline_pct", "Decline pct", json!(decline), "derived"),
                EvidenceEntry::new("window_days", "Window", json!(days), "config").with_unit("days"),
            ],
        }])
    }
}

/// Weekly inflow buckets over a window, anchored at the window end so the
/// bucketing is reproducible.
fn weekly_inflow(transactions: &[NormalizedTransaction], window: &FlowWindow) -> Vec<f64> {
    let mut buckets = Vec::new();
    let mut end = window.end;
    while end >= window.start {
        let start = (end - Duration::days(6)).max(window.start);
        let total: f64 = transactions
            .iter()
            .filter(|t| t.date >= start && t.date <= end && t.signed_amount() > 0.0)
            .map(|t| t.signed_amount())
            .sum();
        buckets.push(total);
        end = start - Duration::days(1);
    }
    buckets.reverse();
    buckets
}

fn coefficient_of_variation(values: &[f64]) -> Option<f64> {
    if values.len() < 3 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return None;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(var.sqrt() / mean)
}

pub struct RevenueVolatility;

impl Detector for RevenueVolatility {
    fn name(&self) -> &'static str {
        "revenue_volatility"
    }

    fn detect(&self, ctx: &DetectorContext) -> Result<Vec<DetectedSignal>, DetectorError> {
        let days = ctx.config.revenue_window_days;
        let Some(pair) = ctx.facts.windows.get(&days) else {
            return Ok(vec![]);
        };
        let current_cv = coefficient_of_variation(&weekly_inflow(ctx.transactions, &pair.current));
        let prior_cv = coefficient_of_variation(&weekly_inflow(ctx.transactions, &pair.prior));
        let (Some(current_cv), Some(prior_cv)) = (current_cv, prior_cv) else {
            return Ok(vec![]);
        };
        if prior_cv <= 0.0 || current_cv / prior_cv < ctx.config.revenue_cv_ratio {
            return Ok(vec![]);
        }

        let fp = fingerprint(
            self.name(),
            ctx.business_id,
            "inflow",
            Some(FingerprintWindow { start: pair.current.start, end: pair.current.end }),
        );
        Ok(vec![DetectedSignal {
            signal_id: signal_id(self.name(), &fp),
            signal_type: self.name().to_string(),
            fingerprint: fp,
            severity: Severity::Warning,
            title: "Revenue has become choppier".to_string(),
            summary: format!(
                "Weekly inflow CV rose from {:.2} to {:.2} across consecutive {}-day windows",
                prior_cv, current_cv, days
            ),
            evidence: vec![
                EvidenceEntry::new("current_cv", "Current CV", json!(current_cv), "derived"),
                EvidenceEntry::new("prior_cv", "Prior CV", json!(prior_cv), "derived"),
                EvidenceEntry::new("cv_ratio", "CV ratio", json!(current_cv / prior_cv), "derived"),
                EvidenceEntry::new("window_days", "Window", json!(days), "config").with_unit("days"),
            ],
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::CtxBundle;
    use super::*;
    use crate::ledger::{testutil::txn, Direction};

    fn declining_fixture() -> CtxBundle {
        // Prior 30-day window: $400/week-ish, current: sharply lower.
        let mut txns = Vec::new();
        for day in 1..=30u32 {
            if day % 3 == 0 {
                txns.push(txn(&format!("p-{day}"), (2025, 6, day), "Invoice", 300.0, Direction::Inflow));
            }
        }
        for day in 1..=30u32 {
            if day % 6 == 0 {
                txns.push(txn(&format!("c-{day}"), (2025, 7, day), "Invoice", 150.0, Direction::Inflow));
            }
        }
        CtxBundle::new(txns, 0.0)
    }

    #[test]
    fn decline_fires_with_pct_evidence() {
        let bundle = declining_fixture();
        let signals = RevenueDecline.detect(&bundle.ctx()).unwrap();
        assert_eq!(signals.len(), 1);
        let decline = signals[0]
            .evidence
            .iter()
            .find(|e| e.key == "decline_pct")
            .and_then(|e| e.value.as_f64())
            .unwrap();
        // 3000 prior vs 750 current = 75% decline.
        assert!(decline > 0.7, "decline was {decline}");
        assert_eq!(signals[0].severity, Severity::Critical);
    }

    #[test]
    fn decline_ignores_trivial_base() {
        let txns = vec![
            txn("p", (2025, 6, 10), "Invoice", 100.0, Direction::Inflow),
            txn("c", (2025, 7, 10), "Invoice", 10.0, Direction::Inflow),
        ];
        let bundle = CtxBundle::new(txns, 0.0);
        assert!(RevenueDecline.detect(&bundle.ctx()).unwrap().is_empty());
    }

    #[test]
    fn weekly_buckets_cover_window() {
        let window = FlowWindow {
            start: chrono::NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
            end: chrono::NaiveDate::from_ymd_opt(2025, 7, 30).unwrap(),
            inflow: 0.0,
            outflow: 0.0,
            net: 0.0,
        };
        let buckets = weekly_inflow(&[], &window);
        // 30 days = 4 full weeks + a 2-day remainder bucket.
        assert_eq!(buckets.len(), 5);
    }

    #[test]
    fn volatility_fires_when_cv_jumps() {
        // Prior window: steady $500/week. Current: one huge week, rest dry.
        let mut txns = Vec::new();
        for day in [3u32, 10, 17, 24] {
            txns.push(txn(&format!("p-{day}"), (2025, 6, day), "Invoice", 500.0, Direction::Inflow));
        }
        txns.push(txn("c-big", (2025, 7, 28), "Invoice", 2000.0, Direction::Inflow));
        txns.push(txn("c-end", (2025, 7, 30), "Anchor sale", 10.0, Direction::Inflow));
        let bundle = CtxBundle::new(txns, 0.0);
        let signals = RevenueVolatility.detect(&bundle.ctx()).unwrap();
        assert_eq!(signals.len(), 1);
    }

    #[test]
    fn volatility_quiet_on_steady_inflow() {
        let mut txns = Vec::new();
        for day in 1..=30u32 {
            txns.push(txn(&format!("p-{day}"), (2025, 6, day), "Invoice", 100.0, Direction::Inflow));
            txns.push(txn(&format!("c-{day}"), (2025, 7, day), "Invoice", 100.0, Direction::Inflow));
        }
        let bundle = CtxBundle::new(txns, 0.0);
        assert!(RevenueVolatility.detect(&bundle.ctx()).unwrap().is_empty());
    }
}
