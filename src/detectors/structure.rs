//! Structural and hygiene detectors: timing mismatch, single-day cliffs,
//! counterparty concentration, uncategorized ratio, and signal flapping.
//!
//! Each is a closed-form ratio/threshold rule over the same trailing window
//! the facts aggregator already produces.

use std::collections::BTreeMap;

use serde_json::json;

use crate::facts::WindowPair;
use crate::fingerprint::{fingerprint, signal_id, FingerprintWindow};
use crate::signal::{DetectedSignal, EvidenceEntry, Severity};

use super::{vendor_key, Detector, DetectorContext, DetectorError};

fn trailing_pair<'a>(ctx: &'a DetectorContext) -> Option<&'a WindowPair> {
    ctx.facts.windows.get(&ctx.config.runway_window_days)
}

// ---------------------------------------------------------------------------
// Timing mismatch
// ---------------------------------------------------------------------------

/// Inflow vs outflow centroid-date gap: money leaving early in the window
/// while revenue lands late squeezes cash even when totals balance.
pub struct TimingMismatch;

impl Detector for TimingMismatch {
    fn name(&self) -> &'static str {
        "timing_mismatch"
    }

    fn detect(&self, ctx: &DetectorContext) -> Result<Vec<DetectedSignal>, DetectorError> {
        let Some(pair) = trailing_pair(ctx) else {
            return Ok(vec![]);
        };
        let (start, end) = (pair.current.start, pair.current.end);

        let mut in_weight = 0.0;
        let mut in_sum = 0.0;
        let mut out_weight = 0.0;
        let mut out_sum = 0.0;
        for t in ctx.transactions {
            if t.date < start || t.date > end {
                continue;
            }
            let offset = (t.date - start).num_days() as f64;
            let signed = t.signed_amount();
            if signed > 0.0 {
                in_weight += signed;
                in_sum += signed * offset;
            } else if signed < 0.0 {
                out_weight += -signed;
                out_sum += -signed * offset;
            }
        }
        if in_weight <= 0.0 || out_weight <= 0.0 {
            return Ok(vec![]);
        }
        let inflow_centroid = in_sum / in_weight;
        let outflow_centroid = out_sum / out_weight;
        let gap = inflow_centroid - outflow_centroid;
        if gap < ctx.config.timing_gap_days {
            return Ok(vec![]);
        }

        let fp = fingerprint(
            self.name(),
            ctx.business_id,
            "cash_timing",
            Some(FingerprintWindow { start, end }),
        );
        Ok(vec![DetectedSignal {
            signal_id: signal_id(self.name(), &fp),
            signal_type: self.name().to_string(),
            fingerprint: fp,
            severity: Severity::Warning,
            title: "Outflows land well before inflows".to_string(),
            summary: format!(
                "Amount-weighted inflow date trails outflow date by {:.1} days in the last {} days",
                gap,
                (end - start).num_days() + 1
            ),
            evidence: vec![
                EvidenceEntry::new("inflow_centroid_days", "Inflow centroid", json!(inflow_centroid), "derived")
                    .with_unit("days"),
                EvidenceEntry::new("outflow_centroid_days", "Outflow centroid", json!(outflow_centroid), "derived")
                    .with_unit("days"),
                EvidenceEntry::new("gap_days", "Centroid gap", json!(gap), "derived").with_unit("days"),
            ],
        }])
    }
}

// ---------------------------------------------------------------------------
// Single-day cliff concentration
// ---------------------------------------------------------------------------

pub struct CliffConcentration;

impl Detector for CliffConcentration {
    fn name(&self) -> &'static str {
        "outflow_cliff"
    }

    fn detect(&self, ctx: &DetectorContext) -> Result<Vec<DetectedSignal>, DetectorError> {
        let Some(pair) = trailing_pair(ctx) else {
            return Ok(vec![]);
        };
        let (start, end) = (pair.current.start, pair.current.end);
        let total = pair.current.outflow;
        if total < ctx.config.spike_min_amount {
            return Ok(vec![]);
        }

        let mut by_day: BTreeMap<chrono::NaiveDate, f64> = BTreeMap::new();
        for t in ctx.transactions {
            let signed = t.signed_amount();
            if signed < 0.0 && t.date >= start && t.date <= end {
                *by_day.entry(t.date).or_insert(0.0) += -signed;
            }
        }
        // A cliff needs other days to tower over.
        if by_day.len() < 5 {
            return Ok(vec![]);
        }
        let Some((&day, &peak)) = by_day.iter().max_by(|a, b| a.1.total_cmp(b.1)) else {
            return Ok(vec![]);
        };
        let share = peak / total;
        if share < ctx.config.cliff_share_threshold {
            return Ok(vec![]);
        }

        let fp = fingerprint(
            self.name(),
            ctx.business_id,
            &format!("day:{}", day.format("%Y-%m-%d")),
            Some(FingerprintWindow { start, end }),
        );
        Ok(vec![DetectedSignal {
            signal_id: signal_id(self.name(), &fp),
            signal_type: self.name().to_string(),
            fingerprint: fp,
            severity: Severity::Warning,
            title: format!("One day carries {:.0}% of recent outflow", share * 100.0),
            summary: format!(
                "{:.2} of the {:.2} spent in the window left on {}",
                peak,
                total,
                day.format("%Y-%m-%d")
            ),
            evidence: vec![
                EvidenceEntry::new("day", "Day", json!(day.format("%Y-%m-%d").to_string()), "transactions"),
                EvidenceEntry::new("day_outflow", "Day outflow", json!(peak), "transactions").with_unit("usd"),
                EvidenceEntry::new("window_outflow", "Window outflow", json!(total), "facts").with_unit("usd"),
                EvidenceEntry::new("share", "Share", json!(share), "derived"),
            ],
        }])
    }
}

// ---------------------------------------------------------------------------
// Counterparty concentration
// ---------------------------------------------------------------------------

/// Top-counterparty share of inflow (customer concentration) and outflow
/// (vendor dependency) over the trailing window.
pub struct CounterpartyConcentration;

impl CounterpartyConcentration {
    fn side_signal(
        &self,
        ctx: &DetectorContext,
        inflow_side: bool,
    ) -> Option<DetectedSignal> {
        let pair = trailing_pair(ctx)?;
        let (start, end) = (pair.current.start, pair.current.end);

        let mut by_vendor: BTreeMap<String, f64> = BTreeMap::new();
        let mut total = 0.0;
        for t in ctx.transactions {
            if t.date < start || t.date > end {
                continue;
            }
            let signed = t.signed_amount();
            let amount = if inflow_side { signed } else { -signed };
            if amount <= 0.0 {
                continue;
            }
            *by_vendor.entry(vendor_key(t)).or_insert(0.0) += amount;
            total += amount;
        }
        // Concentration across one or two counterparties is expected at
        // tiny scale; require a few distinct parties.
        if by_vendor.len() < 3 || total <= 0.0 {
            return None;
        }
        let (vendor, amount) = by_vendor
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(v, a)| (v.clone(), *a))?;
        let share = amount / total;
        if share < ctx.config.concentration_share_threshold {
            return None;
        }

        let side = if inflow_side { "inflow" } else { "outflow" };
        let fp = fingerprint(
            self.name(),
            ctx.business_id,
            &format!("{}:{}", side, vendor),
            Some(FingerprintWindow { start, end }),
        );
        Some(DetectedSignal {
            signal_id: signal_id(self.name(), &fp),
            signal_type: self.name().to_string(),
            fingerprint: fp,
            severity: Severity::Warning,
            title: if inflow_side {
                format!("{} drives {:.0}% of revenue", vendor, share * 100.0)
            } else {
                format!("{} takes {:.0}% of spending", vendor, share * 100.0)
            },
            summary: format!(
                "{} accounts for {:.2} of {:.2} {} in the trailing window",
                vendor, amount, total, side
            ),
            evidence: vec![
                EvidenceEntry::new("counterparty", "Counterparty", json!(vendor), "transactions"),
                EvidenceEntry::new("side", "Side", json!(side), "derived"),
                EvidenceEntry::new("amount", "Amount", json!(amount), "transactions").with_unit("usd"),
                EvidenceEntry::new("total", "Window total", json!(total), "facts").with_unit("usd"),
                EvidenceEntry::new("share", "Share", json!(share), "derived"),
            ],
        })
    }
}

impl Detector for CounterpartyConcentration {
    fn name(&self) -> &'static str {
        "counterparty_concentration"
    }

    fn detect(&self, ctx: &DetectorContext) -> Result<Vec<DetectedSignal>, DetectorError> {
        let mut out = Vec::new();
        if let Some(sig) = self.side_signal(ctx, true) {
            out.push(sig);
        }
        if let Some(sig) = self.side_signal(ctx, false) {
            out.push(sig);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Uncategorized ratio
// ---------------------------------------------------------------------------

pub struct UncategorizedRatio;

impl Detector for UncategorizedRatio {
    fn name(&self) -> &'static str {
        "uncategorized_ratio"
    }

    fn detect(&self, ctx: &DetectorContext) -> Result<Vec<DetectedSignal>, DetectorError> {
        let total = ctx.transactions.len();
        if total < ctx.config.uncategorized_min_txns {
            return Ok(vec![]);
        }
        let uncategorized = ctx
            .transactions
            .iter()
            .filter(|t| t.category.as_deref().map(str::trim).filter(|c| !c.is_empty()).is_none())
            .count();
        let ratio = uncategorized as f64 / total as f64;
        if ratio < ctx.config.uncategorized_ratio_threshold {
            return Ok(vec![]);
        }

        // Hygiene is about the book as a whole, not a window: no window in
        // the identity, so the signal stays the same instance as data grows.
        let fp = fingerprint(self.name(), ctx.business_id, "book", None);
        Ok(vec![DetectedSignal {
            signal_id: signal_id(self.name(), &fp),
            signal_type: self.name().to_string(),
            fingerprint: fp,
            severity: Severity::Info,
            title: format!("{:.0}% of transactions are uncategorized", ratio * 100.0),
            summary: format!(
                "{} of {} transactions have no category; downstream signals degrade",
                uncategorized, total
            ),
            evidence: vec![
                EvidenceEntry::new("uncategorized", "Uncategorized", json!(uncategorized), "transactions"),
                EvidenceEntry::new("total", "Total", json!(total), "transactions"),
                EvidenceEntry::new("ratio", "Ratio", json!(ratio), "derived"),
            ],
        }])
    }
}

// ---------------------------------------------------------------------------
// Signal flapping
// ---------------------------------------------------------------------------

/// A signal oscillating open/resolved faster than operators can react is a
/// health problem of the monitoring itself; surface it as its own signal.
pub struct SignalFlapping;

impl Detector for SignalFlapping {
    fn name(&self) -> &'static str {
        "signal_flapping"
    }

    fn detect(&self, ctx: &DetectorContext) -> Result<Vec<DetectedSignal>, DetectorError> {
        let mut out = Vec::new();
        for (flapping_id, &transitions) in ctx.flap_counts {
            if transitions < ctx.config.flap_transitions_threshold {
                continue;
            }
            // Identity carries the flapping signal, not the lookback window,
            // so one flapping episode reconciles as one instance.
            let fp = fingerprint(
                self.name(),
                ctx.business_id,
                &format!("signal:{}", flapping_id),
                None,
            );
            out.push(DetectedSignal {
                signal_id: signal_id(self.name(), &fp),
                signal_type: self.name().to_string(),
                fingerprint: fp,
                severity: Severity::Info,
                title: format!("Signal {} keeps flapping", flapping_id),
                summary: format!(
                    "{} status transitions in the last {} days; thresholds may sit on a boundary",
                    transitions, ctx.config.flap_lookback_days
                ),
                evidence: vec![
                    EvidenceEntry::new("signal_id", "Signal", json!(flapping_id), "audit_log"),
                    EvidenceEntry::new("transitions", "Transitions", json!(transitions), "audit_log"),
                    EvidenceEntry::new(
                        "lookback_days",
                        "Lookback",
                        json!(ctx.config.flap_lookback_days),
                        "config",
                    )
                    .with_unit("days"),
                ],
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::CtxBundle;
    use super::*;
    use crate::ledger::{testutil::txn, Direction, NormalizedTransaction};

    #[test]
    fn timing_mismatch_fires_on_early_outflows_late_inflows() {
        let mut txns = Vec::new();
        // Outflows in the first days of the window, inflows at the end.
        for day in 1..=4u32 {
            txns.push(txn(&format!("o-{day}"), (2025, 8, day), "Payroll", 500.0, Direction::Outflow));
        }
        for day in 27..=30u32 {
            txns.push(txn(&format!("i-{day}"), (2025, 8, day), "Invoice", 500.0, Direction::Inflow));
        }
        let bundle = CtxBundle::new(txns, 10_000.0);
        let signals = TimingMismatch.detect(&bundle.ctx()).unwrap();
        assert_eq!(signals.len(), 1);
        let gap = signals[0]
            .evidence
            .iter()
            .find(|e| e.key == "gap_days")
            .and_then(|e| e.value.as_f64())
            .unwrap();
        assert!(gap > 20.0);
    }

    #[test]
    fn timing_quiet_when_flows_interleave() {
        let mut txns = Vec::new();
        for day in 1..=30u32 {
            txns.push(txn(&format!("o-{day}"), (2025, 8, day), "Spend", 100.0, Direction::Outflow));
            txns.push(txn(&format!("i-{day}"), (2025, 8, day), "Sale", 100.0, Direction::Inflow));
        }
        let bundle = CtxBundle::new(txns, 10_000.0);
        assert!(TimingMismatch.detect(&bundle.ctx()).unwrap().is_empty());
    }

    #[test]
    fn cliff_fires_on_dominant_day() {
        let mut txns: Vec<NormalizedTransaction> = (1..=29u32)
            .map(|day| txn(&format!("o-{day}"), (2025, 8, day), "Ops", 20.0, Direction::Outflow))
            .collect();
        txns.push(txn("big", (2025, 8, 30), "Annual insurance", 2000.0, Direction::Outflow));
        let bundle = CtxBundle::new(txns, 10_000.0);
        let signals = CliffConcentration.detect(&bundle.ctx()).unwrap();
        assert_eq!(signals.len(), 1);
        assert!(signals[0].summary.contains("2025-08-30"));
    }

    #[test]
    fn concentration_fires_per_side() {
        let mut txns = Vec::new();
        for day in 1..=10u32 {
            let mut t = txn(&format!("i-{day}"), (2025, 8, day), "Invoice", 1000.0, Direction::Inflow);
            t.counterparty_hint = Some("BigCustomer".to_string());
            txns.push(t);
        }
        let mut small1 = txn("i-s1", (2025, 8, 12), "Invoice", 200.0, Direction::Inflow);
        small1.counterparty_hint = Some("SmallA".to_string());
        let mut small2 = txn("i-s2", (2025, 8, 13), "Invoice", 300.0, Direction::Inflow);
        small2.counterparty_hint = Some("SmallB".to_string());
        txns.push(small1);
        txns.push(small2);
        // Outflow side stays diverse.
        for (i, vendor) in ["V1", "V2", "V3", "V4"].iter().enumerate() {
            let mut t = txn(
                &format!("o-{i}"),
                (2025, 8, 15 + i as u32),
                "Bill",
                250.0,
                Direction::Outflow,
            );
            t.counterparty_hint = Some(vendor.to_string());
            txns.push(t);
        }
        let bundle = CtxBundle::new(txns, 10_000.0);
        let signals = CounterpartyConcentration.detect(&bundle.ctx()).unwrap();
        assert_eq!(signals.len(), 1, "only the inflow side is concentrated");
        assert!(signals[0].title.contains("bigcustomer"));
    }

    #[test]
    fn uncategorized_ratio_fires_above_threshold() {
        let mut txns = Vec::new();
        for day in 1..=25u32 {
            let mut t = txn(&format!("t-{day}"), (2025, 8, (day % 28) + 1), "Misc", 50.0, Direction::Outflow);
            if day <= 10 {
                t.category = Some("ops".to_string());
            }
            txns.push(t);
        }
        let bundle = CtxBundle::new(txns, 10_000.0);
        let signals = UncategorizedRatio.detect(&bundle.ctx()).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].severity, Severity::Info);
    }

    #[test]
    fn uncategorized_quiet_below_min_volume() {
        let txns = vec![txn("a", (2025, 8, 1), "Misc", 50.0, Direction::Outflow)];
        let bundle = CtxBundle::new(txns, 0.0);
        assert!(UncategorizedRatio.detect(&bundle.ctx()).unwrap().is_empty());
    }

    #[test]
    fn flapping_reads_precomputed_counts() {
        let txns = vec![txn("a", (2025, 8, 1), "Misc", 50.0, Direction::Outflow)];
        let mut bundle = CtxBundle::new(txns, 0.0);
        bundle.flap_counts.insert("low_cash_runway-abc123def456".to_string(), 6);
        bundle.flap_counts.insert("steady-signal".to_string(), 1);
        let signals = SignalFlapping.detect(&bundle.ctx()).unwrap();
        assert_eq!(signals.len(), 1);
        assert!(signals[0].title.contains("low_cash_runway"));
    }
}
