//! The pulse: one gated, idempotent monitoring cycle for one business.
//!
//! The whole cycle runs inside the business's exclusive write scope: gate
//! check → build ledger → integrity check → facts → run registry (failures
//! isolated per detector) → reconcile against the persisted state read in
//! the same scope → commit states + audits. Two pulses for one business
//! therefore serialize, and neither can double-record a detection.
//! Integrity failures propagate; everything a detector does wrong becomes
//! a visible observation instead of an abort.

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::config::Config;
use crate::detectors::{DetectorContext, DetectorRegistry};
use crate::facts;
use crate::fingerprint::{fingerprint, signal_id};
use crate::ledger::{self, NormalizedTransaction};
use crate::logging::{log, obj, v_int, v_num, v_str, Domain, Level};
use crate::signal::{
    payload_changed, AuditKind, DetectedSignal, EvidenceEntry, Severity, SignalState,
    SignalStatus,
};
use crate::store::{AuditDraft, PulseWrite, SignalStore};

pub const SYSTEM_ACTOR: &str = "system";

/// Result of one pulse invocation. A gated skip is a reported outcome, not
/// an error.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PulseOutcome {
    pub ran: bool,
    pub detectors_run: usize,
    pub detector_failures: usize,
    pub new_signals: usize,
    pub updated: usize,
    pub resolved: usize,
    pub reopened: usize,
}

impl PulseOutcome {
    fn skipped() -> Self {
        Self {
            ran: false,
            detectors_run: 0,
            detector_failures: 0,
            new_signals: 0,
            updated: 0,
            resolved: 0,
            reopened: 0,
        }
    }
}

pub struct Orchestrator {
    store: SignalStore,
    registry: DetectorRegistry,
    config: Config,
}

impl Orchestrator {
    pub fn new(store: SignalStore, registry: DetectorRegistry, config: Config) -> Self {
        Self { store, registry, config }
    }

    pub fn store(&self) -> &SignalStore {
        &self.store
    }

    /// Run one monitoring cycle. `force` bypasses the time gate, never the
    /// reconciliation rules.
    pub fn pulse(
        &mut self,
        business_id: &str,
        transactions: &[NormalizedTransaction],
        opening_balance: f64,
        force: bool,
    ) -> Result<PulseOutcome> {
        let started = Instant::now();
        let now = Utc::now();
        let Self { store, registry, config } = self;

        // The exclusive scope opens before any read. An early return drops
        // the transaction, which rolls back; nothing is persisted.
        let txn = store.begin_business_write()?;

        // 1. Gate.
        if !force {
            if let Some(last) = txn.last_pulse_at(business_id)? {
                let elapsed = now - last;
                if elapsed < Duration::seconds(config.pulse_min_interval_secs) {
                    log(
                        Level::Info,
                        Domain::Pulse,
                        "pulse_skipped",
                        obj(&[
                            ("business_id", v_str(business_id)),
                            ("elapsed_secs", v_int(elapsed.num_seconds())),
                            ("min_interval_secs", v_int(config.pulse_min_interval_secs)),
                        ]),
                    );
                    return Ok(PulseOutcome::skipped());
                }
            }
        }

        // 2. Ledger + integrity + facts. A corrupt ledger is fatal here.
        let ledger_rows = ledger::build(transactions, opening_balance);
        let summary = ledger::check(&ledger_rows, opening_balance)
            .with_context(|| format!("ledger integrity failure for {}", business_id))?;
        log(
            Level::Debug,
            Domain::Ledger,
            "ledger_checked",
            obj(&[
                ("business_id", v_str(business_id)),
                ("rows", v_int(summary.rows as i64)),
                ("net", v_num(summary.net)),
                ("final_balance", v_num(summary.final_balance)),
            ]),
        );
        let facts = facts::compute(transactions, &ledger_rows, &config.facts_window_days());
        log(
            Level::Debug,
            Domain::Facts,
            "facts_computed",
            obj(&[
                ("business_id", v_str(business_id)),
                ("months_covered", v_int(facts.meta.months_covered as i64)),
                ("windows", v_int(facts.windows.len() as i64)),
                ("current_cash", v_num(facts.current_cash)),
            ]),
        );

        // 3. Run the registry, isolating per-detector failures.
        let flap_counts = txn.recent_status_transitions(
            business_id,
            now - Duration::days(config.flap_lookback_days),
        )?;
        let ctx = DetectorContext {
            business_id,
            transactions,
            ledger: &ledger_rows,
            facts: &facts,
            config,
            flap_counts: &flap_counts,
        };
        let mut detections: Vec<DetectedSignal> = Vec::new();
        let mut failures = 0usize;
        for detector in registry.detectors() {
            match detector.detect(&ctx) {
                Ok(signals) => {
                    log(
                        Level::Debug,
                        Domain::Detector,
                        "detector_done",
                        obj(&[
                            ("detector", v_str(detector.name())),
                            ("signals", v_int(signals.len() as i64)),
                        ]),
                    );
                    detections.extend(signals);
                }
                Err(err) => {
                    failures += 1;
                    log(
                        Level::Warn,
                        Domain::Detector,
                        "detector_failed",
                        obj(&[
                            ("detector", v_str(detector.name())),
                            ("error", v_str(&err.message)),
                        ]),
                    );
                    detections.push(detector_error_signal(business_id, err.detector, &err.message));
                }
            }
        }

        // 4. Reconcile against state read inside the scope, 5. commit.
        let existing = txn.get_states(business_id)?;
        let (outcome, write) =
            reconcile(business_id, detections, &existing, now, registry.len(), failures);
        txn.apply(business_id, now, &write)?;
        txn.commit()?;

        for audit in &write.audits {
            log(
                Level::Debug,
                Domain::Audit,
                audit.kind.as_str(),
                obj(&[
                    ("business_id", v_str(business_id)),
                    ("signal_id", v_str(&audit.signal_id)),
                    ("actor", v_str(&audit.actor)),
                ]),
            );
        }
        log(
            Level::Info,
            Domain::Pulse,
            "pulse_done",
            obj(&[
                ("business_id", v_str(business_id)),
                ("detectors_run", v_int(outcome.detectors_run as i64)),
                ("detector_failures", v_int(outcome.detector_failures as i64)),
                ("new_signals", v_int(outcome.new_signals as i64)),
                ("updated", v_int(outcome.updated as i64)),
                ("resolved", v_int(outcome.resolved as i64)),
                ("reopened", v_int(outcome.reopened as i64)),
                ("elapsed_ms", v_int(started.elapsed().as_millis() as i64)),
            ]),
        );
        Ok(outcome)
    }

    /// Operator override. Legal target statuses are in_progress, snoozed,
    /// and resolved; the next pulse will not silently undo the change, but
    /// a recurring fingerprint reopens a resolved signal as usual.
    pub fn update_status(
        &mut self,
        business_id: &str,
        signal_id: &str,
        new_status: SignalStatus,
        reason: &str,
        actor: &str,
    ) -> Result<SignalState> {
        if new_status == SignalStatus::Open {
            bail!("operators cannot set a signal back to open; it reopens on recurrence");
        }
        let txn = self.store.begin_business_write()?;
        let Some(prev) = txn.get_state(business_id, signal_id)? else {
            bail!("no signal {} for business {}", signal_id, business_id);
        };
        let now = Utc::now();
        let mut next = prev.clone();
        next.status = new_status;
        next.updated_at = now;
        if new_status == SignalStatus::Resolved {
            next.resolved_at = Some(now);
            next.resolution_note = Some(reason.to_string());
        }
        txn.put_state_with_audit(
            &next,
            &AuditDraft {
                signal_id: signal_id.to_string(),
                kind: AuditKind::SignalStatusChanged,
                actor: actor.to_string(),
                reason: reason.to_string(),
                before_json: Some(prev.snapshot_json()),
                after_json: Some(next.snapshot_json()),
            },
            now,
        )?;
        txn.commit()?;
        log(
            Level::Info,
            Domain::Audit,
            "signal_status_changed",
            obj(&[
                ("business_id", v_str(business_id)),
                ("signal_id", v_str(signal_id)),
                ("status", v_str(next.status.as_str())),
                ("actor", v_str(actor)),
            ]),
        );
        Ok(next)
    }
}

/// Pure reconciliation: current detections against the persisted states,
/// producing the outcome counts and the staged writes. No store access, so
/// the caller controls the transaction boundaries.
fn reconcile(
    business_id: &str,
    detections: Vec<DetectedSignal>,
    existing: &[SignalState],
    now: DateTime<Utc>,
    detectors_run: usize,
    failures: usize,
) -> (PulseOutcome, PulseWrite) {
    // Dedupe within the cycle: one detection per fingerprint, keeping
    // the most severe.
    let mut by_fingerprint: BTreeMap<String, DetectedSignal> = BTreeMap::new();
    for det in detections {
        match by_fingerprint.get(&det.fingerprint) {
            Some(kept) if kept.severity >= det.severity => {}
            _ => {
                by_fingerprint.insert(det.fingerprint.clone(), det);
            }
        }
    }

    let mut write = PulseWrite::default();
    let mut outcome = PulseOutcome {
        ran: true,
        detectors_run,
        detector_failures: failures,
        new_signals: 0,
        updated: 0,
        resolved: 0,
        reopened: 0,
    };

    for (fp, det) in &by_fingerprint {
        match existing.iter().find(|s| &s.fingerprint == fp) {
            None => {
                let state = SignalState {
                    business_id: business_id.to_string(),
                    signal_id: det.signal_id.clone(),
                    signal_type: det.signal_type.clone(),
                    status: SignalStatus::Open,
                    severity: det.severity,
                    title: det.title.clone(),
                    summary: det.summary.clone(),
                    payload_json: det.payload_json(),
                    fingerprint: det.fingerprint.clone(),
                    detected_at: now,
                    last_seen_at: now,
                    resolved_at: None,
                    resolution_note: None,
                    updated_at: now,
                };
                write.audits.push(AuditDraft {
                    signal_id: state.signal_id.clone(),
                    kind: AuditKind::SignalDetected,
                    actor: SYSTEM_ACTOR.to_string(),
                    reason: "condition first observed".to_string(),
                    before_json: None,
                    after_json: Some(state.snapshot_json()),
                });
                write.states.push(state);
                outcome.new_signals += 1;
            }
            Some(prev) if prev.status.is_live() => {
                let mut next = prev.clone();
                let payload = det.payload_json();
                let changed = payload_changed(&prev.payload_json, &payload)
                    || prev.severity != det.severity;
                next.severity = det.severity;
                next.title = det.title.clone();
                next.summary = det.summary.clone();
                next.payload_json = payload;
                next.last_seen_at = now;
                if changed {
                    next.updated_at = now;
                    write.audits.push(AuditDraft {
                        signal_id: next.signal_id.clone(),
                        kind: AuditKind::SignalUpdated,
                        actor: SYSTEM_ACTOR.to_string(),
                        reason: "evidence changed materially".to_string(),
                        before_json: Some(prev.snapshot_json()),
                        after_json: Some(next.snapshot_json()),
                    });
                    outcome.updated += 1;
                }
                write.states.push(next);
            }
            Some(prev) => {
                // Resolved state whose condition is back: a fresh
                // detection event, not a silent resurrection.
                let mut next = prev.clone();
                next.status = SignalStatus::Open;
                next.severity = det.severity;
                next.title = det.title.clone();
                next.summary = det.summary.clone();
                next.payload_json = det.payload_json();
                next.detected_at = now;
                next.last_seen_at = now;
                next.resolved_at = None;
                next.resolution_note = None;
                next.updated_at = now;
                write.audits.push(AuditDraft {
                    signal_id: next.signal_id.clone(),
                    kind: AuditKind::SignalDetected,
                    actor: SYSTEM_ACTOR.to_string(),
                    reason: "condition recurred after resolution".to_string(),
                    before_json: Some(prev.snapshot_json()),
                    after_json: Some(next.snapshot_json()),
                });
                write.states.push(next);
                outcome.reopened += 1;
            }
        }
    }

    // Live states whose condition stopped firing resolve now.
    for prev in existing {
        if prev.status.is_live() && !by_fingerprint.contains_key(&prev.fingerprint) {
            let mut next = prev.clone();
            next.status = SignalStatus::Resolved;
            next.resolved_at = Some(now);
            next.resolution_note = Some("condition no longer observed".to_string());
            next.updated_at = now;
            write.audits.push(AuditDraft {
                signal_id: next.signal_id.clone(),
                kind: AuditKind::SignalResolved,
                actor: SYSTEM_ACTOR.to_string(),
                reason: "condition no longer observed".to_string(),
                before_json: Some(prev.snapshot_json()),
                after_json: Some(next.snapshot_json()),
            });
            write.states.push(next);
            outcome.resolved += 1;
        }
    }

    (outcome, write)
}

/// A detector failure folded into the signal stream so operators can see
/// "this specific check is degraded" without it aborting the pulse.
fn detector_error_signal(business_id: &str, detector: &str, message: &str) -> DetectedSignal {
    let fp = fingerprint("detector_error", business_id, detector, None);
    DetectedSignal {
        signal_id: signal_id("detector_error", &fp),
        signal_type: "detector_error".to_string(),
        fingerprint: fp,
        severity: Severity::Info,
        title: format!("Check '{}' is degraded", detector),
        summary: format!("Detector {} failed and was skipped this cycle", detector),
        evidence: vec![
            EvidenceEntry::new("detector", "Detector", json!(detector), "registry"),
            EvidenceEntry::new("error", "Error", json!(message), "registry"),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detector_error_signal_is_stable_per_detector() {
        let a = detector_error_signal("biz-1", "expense_creep", "boom");
        let b = detector_error_signal("biz-1", "expense_creep", "different message");
        // Same identity even when the message differs; the message is payload.
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.severity, Severity::Info);
        let c = detector_error_signal("biz-1", "runway", "boom");
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[test]
    fn reconcile_dedupes_by_fingerprint_keeping_most_severe() {
        let now = Utc::now();
        let mut a = detector_error_signal("biz-1", "x", "first");
        a.severity = Severity::Warning;
        let mut b = detector_error_signal("biz-1", "x", "second");
        b.severity = Severity::Info;
        let (outcome, write) = reconcile("biz-1", vec![a, b], &[], now, 1, 0);
        assert_eq!(outcome.new_signals, 1);
        assert_eq!(write.states.len(), 1);
        assert_eq!(write.states[0].severity, Severity::Warning);
    }

    #[test]
    fn reconcile_against_current_state_is_idempotent() {
        let now = Utc::now();
        let det = detector_error_signal("biz-1", "x", "boom");
        let (_, first) = reconcile("biz-1", vec![det.clone()], &[], now, 1, 0);
        let (outcome, second) = reconcile("biz-1", vec![det], &first.states, now, 1, 0);
        assert_eq!(outcome.new_signals, 0);
        assert_eq!(outcome.updated, 0);
        assert!(second.audits.is_empty());
    }
}
