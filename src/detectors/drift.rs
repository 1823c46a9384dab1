//! Baseline-driven detectors: monthly net drift against the robust band,
//! and deviation from the calendar-seasonal baseline.

use serde_json::json;

use crate::baseline::{self, Drift, SeasonalAssessment};
use crate::fingerprint::{fingerprint, signal_id};
use crate::logging::{log, obj, v_int, v_str, Domain, Level};
use crate::signal::{DetectedSignal, EvidenceEntry, Severity};

use super::{Detector, DetectorContext, DetectorError};

/// Months of history required before a band over monthly nets means much.
const MIN_MONTHS: usize = 4;

pub struct MonthlyNetDrift;

impl Detector for MonthlyNetDrift {
    fn name(&self) -> &'static str {
        "monthly_net_drift"
    }

    fn detect(&self, ctx: &DetectorContext) -> Result<Vec<DetectedSignal>, DetectorError> {
        let monthly = &ctx.facts.monthly;
        if monthly.len() < MIN_MONTHS {
            log(
                Level::Debug,
                Domain::Baseline,
                "drift_skipped_thin_history",
                obj(&[
                    ("business_id", v_str(ctx.business_id)),
                    ("months", v_int(monthly.len() as i64)),
                    ("required", v_int(MIN_MONTHS as i64)),
                ]),
            );
            return Ok(vec![]);
        }
        let (history, latest) = match monthly.split_last() {
            Some((latest, history)) => (history, latest),
            None => return Ok(vec![]),
        };
        let nets: Vec<f64> = history.iter().map(|m| m.net).collect();
        let Some(band) = baseline::robust_band(&nets, ctx.config.band_k) else {
            return Ok(vec![]);
        };
        let (drift, z) = baseline::assess_drift(latest.net, &band);
        if drift == Drift::None {
            return Ok(vec![]);
        }

        let month_key = format!("month:{}-{:02}", latest.year, latest.month);
        let fp = fingerprint(self.name(), ctx.business_id, &month_key, None);
        Ok(vec![DetectedSignal {
            signal_id: signal_id(self.name(), &fp),
            signal_type: self.name().to_string(),
            fingerprint: fp,
            severity: match drift {
                Drift::Severe => Severity::Critical,
                _ => Severity::Warning,
            },
            title: format!(
                "Monthly net cashflow drifting below its baseline ({:?})",
                drift
            ),
            summary: format!(
                "{}-{:02} net of {:.2} sits {:.1} bands below the {:.2} median over {} prior months",
                latest.year,
                latest.month,
                latest.net,
                -z,
                band.median,
                band.samples
            ),
            evidence: vec![
                EvidenceEntry::new("month", "Month", json!(month_key), "facts"),
                EvidenceEntry::new("net", "Month net", json!(latest.net), "facts").with_unit("usd"),
                EvidenceEntry::new("median", "Baseline median", json!(band.median), "baseline")
                    .with_unit("usd"),
                EvidenceEntry::new("mad", "Baseline MAD", json!(band.mad), "baseline").with_unit("usd"),
                EvidenceEntry::new("z", "Band distance", json!(z), "baseline"),
                EvidenceEntry::new("slope", "Trend slope", json!(band.slope), "baseline"),
                EvidenceEntry::new("penalty", "Drift penalty", json!(drift.penalty()), "baseline"),
            ],
        }])
    }
}

pub struct SeasonalDeviation;

impl Detector for SeasonalDeviation {
    fn name(&self) -> &'static str {
        "seasonal_deviation"
    }

    fn detect(&self, ctx: &DetectorContext) -> Result<Vec<DetectedSignal>, DetectorError> {
        let monthly = &ctx.facts.monthly;
        let Some((latest, history)) = monthly.split_last() else {
            return Ok(vec![]);
        };
        let (assessment, z) = baseline::assess_seasonal(
            history,
            latest.month,
            latest.net,
            ctx.config.seasonal_min_samples,
        );
        match assessment {
            SeasonalAssessment::InsufficientHistory => {
                log(
                    Level::Debug,
                    Domain::Baseline,
                    "seasonal_skipped_thin_history",
                    obj(&[
                        ("business_id", v_str(ctx.business_id)),
                        ("month", v_int(latest.month as i64)),
                        ("required", v_int(ctx.config.seasonal_min_samples as i64)),
                    ]),
                );
                return Ok(vec![]);
            }
            SeasonalAssessment::None => return Ok(vec![]),
            SeasonalAssessment::Mild | SeasonalAssessment::Severe => {}
        }

        let month_key = format!("month:{}-{:02}", latest.year, latest.month);
        let fp = fingerprint(self.name(), ctx.business_id, &month_key, None);
        Ok(vec![DetectedSignal {
            signal_id: signal_id(self.name(), &fp),
            signal_type: self.name().to_string(),
            fingerprint: fp,
            severity: match assessment {
                SeasonalAssessment::Severe => Severity::Warning,
                _ => Severity::Info,
            },
            title: format!(
                "{}-{:02} is running behind its usual season",
                latest.year, latest.month
            ),
            summary: format!(
                "Net of {:.2} is {:.1} bands under the historical median for month {}",
                latest.net, -z, latest.month
            ),
            evidence: vec![
                EvidenceEntry::new("month", "Month", json!(month_key), "facts"),
                EvidenceEntry::new("net", "Month net", json!(latest.net), "facts").with_unit("usd"),
                EvidenceEntry::new("z", "Band distance", json!(z), "baseline"),
                EvidenceEntry::new("penalty", "Seasonal penalty", json!(assessment.penalty()), "baseline"),
            ],
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::CtxBundle;
    use super::*;
    use crate::ledger::{testutil::txn, Direction, NormalizedTransaction};

    /// Steady +1000/month for `months` months, then a final month at `last_net`.
    fn monthly_series(months: u32, last_net: f64) -> Vec<NormalizedTransaction> {
        let mut txns = Vec::new();
        for m in 1..=months {
            txns.push(txn(
                &format!("in-{m}"),
                (2025, m, 10),
                "Invoice",
                1500.0,
                Direction::Inflow,
            ));
            txns.push(txn(
                &format!("out-{m}"),
                (2025, m, 20),
                "Rent",
                500.0,
                Direction::Outflow,
            ));
        }
        // Final month adjusted to hit last_net (base inflow 1500, outflow 500).
        let m = months + 1;
        txns.push(txn(&format!("in-{m}"), (2025, m, 10), "Invoice", 1500.0, Direction::Inflow));
        txns.push(txn(
            &format!("out-{m}"),
            (2025, m, 20),
            "Rent",
            1500.0 - last_net,
            Direction::Outflow,
        ));
        txns
    }

    #[test]
    fn drift_fires_when_latest_month_collapses() {
        // Five months of +1000, then -2000.
        let bundle = CtxBundle::new(monthly_series(5, -2000.0), 50_000.0);
        let signals = MonthlyNetDrift.detect(&bundle.ctx()).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].severity, Severity::Critical);
        let penalty = signals[0]
            .evidence
            .iter()
            .find(|e| e.key == "penalty")
            .and_then(|e| e.value.as_u64())
            .unwrap();
        assert_eq!(penalty, 7);
    }

    #[test]
    fn drift_quiet_on_constant_series() {
        let bundle = CtxBundle::new(monthly_series(5, 1000.0), 50_000.0);
        assert!(MonthlyNetDrift.detect(&bundle.ctx()).unwrap().is_empty());
    }

    #[test]
    fn drift_needs_history() {
        let bundle = CtxBundle::new(monthly_series(2, -2000.0), 50_000.0);
        assert!(MonthlyNetDrift.detect(&bundle.ctx()).unwrap().is_empty());
    }

    #[test]
    fn seasonal_needs_same_month_samples() {
        // Months 1..=6 of 2025 only: no prior year, so month 6 has no bucket.
        let bundle = CtxBundle::new(monthly_series(5, -2000.0), 50_000.0);
        assert!(SeasonalDeviation.detect(&bundle.ctx()).unwrap().is_empty());
    }

    #[test]
    fn seasonal_fires_against_prior_years() {
        // Junes of 2022-2024 netted +2000; June 2025 nets only +100.
        let mut txns: Vec<NormalizedTransaction> = [2022, 2023, 2024]
            .iter()
            .map(|&year| {
                txn(&format!("jun-{year}"), (year, 6, 10), "June revenue", 2000.0, Direction::Inflow)
            })
            .collect();
        txns.push(txn("jun-2025", (2025, 6, 10), "June revenue", 100.0, Direction::Inflow));
        let bundle = CtxBundle::new(txns, 0.0);
        let signals = SeasonalDeviation.detect(&bundle.ctx()).unwrap();
        assert_eq!(signals.len(), 1);
        assert!(signals[0].summary.contains("month 6"));
    }
}
