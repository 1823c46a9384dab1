//! Expense creep: a vendor's outflow in the recent N-day window versus the
//! immediately prior N-day window.

use std::collections::BTreeMap;

use chrono::Duration;
use serde_json::json;

use crate::fingerprint::{fingerprint, signal_id, FingerprintWindow};
use crate::signal::{DetectedSignal, EvidenceEntry, Severity};

use super::{anchor_date, vendor_key, Detector, DetectorContext, DetectorError};

pub struct ExpenseCreep;

impl Detector for ExpenseCreep {
    fn name(&self) -> &'static str {
        "expense_creep"
    }

    fn detect(&self, ctx: &DetectorContext) -> Result<Vec<DetectedSignal>, DetectorError> {
        let Some(anchor) = anchor_date(ctx) else {
            return Ok(vec![]);
        };
        let days = ctx.config.creep_window_days as i64;
        let current_start = anchor - Duration::days(days - 1);
        let prior_end = current_start - Duration::days(1);
        let prior_start = prior_end - Duration::days(days - 1);

        // Require full coverage of both windows before trusting a comparison.
        let earliest = ctx.transactions.iter().map(|t| t.date).min();
        match earliest {
            Some(d) if d <= prior_start => {}
            _ => return Ok(vec![]),
        }

        // (current, prior) outflow per vendor.
        let mut by_vendor: BTreeMap<String, (f64, f64)> = BTreeMap::new();
        for t in ctx.transactions {
            let signed = t.signed_amount();
            if signed >= 0.0 {
                continue;
            }
            let amount = -signed;
            let entry = by_vendor.entry(vendor_key(t)).or_insert((0.0, 0.0));
            if t.date >= current_start && t.date <= anchor {
                entry.0 += amount;
            } else if t.date >= prior_start && t.date <= prior_end {
                entry.1 += amount;
            }
        }

        let mut out = Vec::new();
        for (vendor, (current, prior)) in by_vendor {
            if prior <= 0.0 {
                // New vendors have no baseline; first-window spend is not creep.
                continue;
            }
            let delta = current - prior;
            let pct = delta / prior;
            if delta < ctx.config.creep_min_delta || pct < ctx.config.creep_threshold_pct {
                continue;
            }
            let fp = fingerprint(
                self.name(),
                ctx.business_id,
                &format!("vendor:{}", vendor),
                Some(FingerprintWindow { start: current_start, end: anchor }),
            );
            out.push(DetectedSignal {
                signal_id: signal_id(self.name(), &fp),
                signal_type: self.name().to_string(),
                fingerprint: fp,
                severity: if pct >= 2.0 * ctx.config.creep_threshold_pct {
                    Severity::Critical
                } else {
                    Severity::Warning
                },
                title: format!("Spending with {} is climbing", vendor),
                summary: format!(
                    "{} outflow rose {:.0}% ({:.2} → {:.2}) over the last {} days",
                    vendor,
                    pct * 100.0,
                    prior,
                    current,
                    days
                ),
                evidence: vec![
                    EvidenceEntry::new("vendor", "Vendor", json!(vendor), "transactions"),
                    EvidenceEntry::new("current_outflow", "Current window outflow", json!(current), "transactions")
                        .with_unit("usd"),
                    EvidenceEntry::new("prior_outflow", "Prior window outflow", json!(prior), "transactions")
                        .with_unit("usd"),
                    EvidenceEntry::new("delta", "Increase", json!(delta), "derived").with_unit("usd"),
                    EvidenceEntry::new("pct_change", "Increase pct", json!(pct), "derived"),
                    EvidenceEntry::new("window_days", "Window", json!(days), "config").with_unit("days"),
                ],
            });
        }
        Ok(out)
    }
}
