//! Unusual outflow spike: the latest day's outflow against its own
//! trailing mean/stdev.

use chrono::Duration;
use serde_json::json;

use crate::fingerprint::{fingerprint, signal_id, FingerprintWindow};
use crate::signal::{DetectedSignal, EvidenceEntry, Severity};

use super::{anchor_date, daily_outflow, Detector, DetectorContext, DetectorError};

/// Trailing days required before a mean/stdev is worth anything.
const MIN_TRAILING_DAYS: usize = 7;

pub struct OutflowSpike;

impl Detector for OutflowSpike {
    fn name(&self) -> &'static str {
        "outflow_spike"
    }

    fn detect(&self, ctx: &DetectorContext) -> Result<Vec<DetectedSignal>, DetectorError> {
        let Some(anchor) = anchor_date(ctx) else {
            return Ok(vec![]);
        };
        let days = ctx.config.spike_window_days as i64;
        // Clamp to observed history so zero-filled days before the first
        // transaction cannot dilute the trailing mean.
        let earliest = match ctx.transactions.iter().map(|t| t.date).min() {
            Some(d) => d,
            None => return Ok(vec![]),
        };
        let start = (anchor - Duration::days(days - 1)).max(earliest);
        let series = daily_outflow(ctx.transactions, start, anchor);

        let (last_day, latest) = match series.last() {
            Some(&(d, v)) => (d, v),
            None => return Ok(vec![]),
        };
        let trailing: Vec<f64> = series[..series.len() - 1].iter().map(|&(_, v)| v).collect();
        if trailing.len() < MIN_TRAILING_DAYS {
            return Ok(vec![]);
        }

        let n = trailing.len() as f64;
        let mean = trailing.iter().sum::<f64>() / n;
        let var = trailing.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let stdev = var.sqrt();

        if latest < ctx.config.spike_min_amount || mean <= 0.0 {
            return Ok(vec![]);
        }
        let sigma_hit = stdev > 0.0
            && latest > mean + ctx.config.spike_sigma_threshold * stdev;
        let mult_hit = latest > ctx.config.spike_mult_threshold * mean;
        if !sigma_hit && !mult_hit {
            return Ok(vec![]);
        }

        let z = if stdev > 0.0 { (latest - mean) / stdev } else { 0.0 };
        let fp = fingerprint(
            self.name(),
            ctx.business_id,
            &format!("day:{}", last_day.format("%Y-%m-%d")),
            Some(FingerprintWindow { start, end: anchor }),
        );
        Ok(vec![DetectedSignal {
            signal_id: signal_id(self.name(), &fp),
            signal_type: self.name().to_string(),
            fingerprint: fp,
            severity: if sigma_hit && mult_hit { Severity::Critical } else { Severity::Warning },
            title: format!("Unusually large outflow on {}", last_day.format("%Y-%m-%d")),
            summary: format!(
                "Outflow of {:.2} on {} against a trailing mean of {:.2} (z={:.1})",
                latest,
                last_day.format("%Y-%m-%d"),
                mean,
                z
            ),
            evidence: vec![
                EvidenceEntry::new("day", "Day", json!(last_day.format("%Y-%m-%d").to_string()), "transactions"),
                EvidenceEntry::new("day_outflow", "Day outflow", json!(latest), "transactions")
                    .with_unit("usd"),
                EvidenceEntry::new("trailing_mean", "Trailing mean", json!(mean), "derived")
                    .with_unit("usd"),
                EvidenceEntry::new("trailing_stdev", "Trailing stdev", json!(stdev), "derived")
                    .with_unit("usd"),
                EvidenceEntry::new("z_score", "Sigma distance", json!(z), "derived"),
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

    fn steady_then_spike(spike_amount: f64) -> Vec<NormalizedTransaction> {
        let mut txns: Vec<NormalizedTransaction> = (1..=29u32)
            .map(|day| {
                // Mild alternation so the trailing stdev is non-zero.
                let amount = if day % 2 == 0 { 110.0 } else { 90.0 };
                txn(&format!("d-{day}"), (2025, 5, day), "Ops spend", amount, Direction::Outflow)
            })
            .collect();
        txns.push(txn("spike", (2025, 5, 30), "Equipment purchase", spike_amount, Direction::Outflow));
        txns
    }

    #[test]
    fn fires_on_sigma_and_multiple_breach() {
        let bundle = CtxBundle::new(steady_then_spike(1200.0), 50_000.0);
        let signals = OutflowSpike.detect(&bundle.ctx()).unwrap();
        assert_eq!(signals.len(), 1);
        // 1200 vs mean ~100: 12x the mean and far past 3 sigma.
        assert_eq!(signals[0].severity, Severity::Critical);
        let z = signals[0]
            .evidence
            .iter()
            .find(|e| e.key == "z_score")
            .and_then(|e| e.value.as_f64())
            .unwrap();
        assert!(z > 3.0);
    }

    #[test]
    fn quiet_on_ordinary_day() {
        let bundle = CtxBundle::new(steady_then_spike(115.0), 50_000.0);
        assert!(OutflowSpike.detect(&bundle.ctx()).unwrap().is_empty());
    }

    #[test]
    fn requires_trailing_history() {
        let txns = vec![
            txn("a", (2025, 5, 29), "Ops spend", 100.0, Direction::Outflow),
            txn("b", (2025, 5, 30), "Equipment purchase", 5000.0, Direction::Outflow),
        ];
        let bundle = CtxBundle::new(txns, 50_000.0);
        // Two observed days leave one trailing day, under the minimum.
        assert!(OutflowSpike.detect(&bundle.ctx()).unwrap().is_empty());
    }
}
