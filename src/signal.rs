//! Signal value objects: ephemeral detections, persisted lifecycle state,
//! and append-only audit entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::fingerprint::canonical_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// One typed evidence entry. Evidence is an ordered list, not a map, so the
/// payload renders identically everywhere and still carries detector-specific
/// fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEntry {
    pub key: String,
    pub label: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Provenance: which input the value came from (e.g. "facts.windows.30").
    pub source: String,
    /// Optional join key back to a source event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
}

impl EvidenceEntry {
    pub fn new(key: &str, label: &str, value: Value, source: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            value,
            unit: None,
            source: source.to_string(),
            anchor: None,
        }
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn with_anchor(mut self, anchor: &str) -> Self {
        self.anchor = Some(anchor.to_string());
        self
    }
}

/// Ephemeral per-pulse detection. Reconciled against persisted state by
/// fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedSignal {
    pub signal_id: String,
    pub signal_type: String,
    pub fingerprint: String,
    pub severity: Severity,
    pub title: String,
    pub summary: String,
    pub evidence: Vec<EvidenceEntry>,
}

impl DetectedSignal {
    /// Canonical payload JSON, used for persistence and change comparison.
    pub fn payload_json(&self) -> String {
        canonical_json(&json!({ "evidence": self.evidence }))
    }
}

/// Round every numeric leaf to 2 decimals. Payload comparison uses this so
/// sub-cent jitter between pulses does not produce audit noise.
pub fn rounded_payload(value: &Value) -> Value {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                json!((f * 100.0).round() / 100.0)
            } else {
                value.clone()
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(rounded_payload).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), rounded_payload(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// True when two payloads differ beyond 2-decimal numeric rounding.
pub fn payload_changed(a: &str, b: &str) -> bool {
    let pa: Value = serde_json::from_str(a).unwrap_or(Value::Null);
    let pb: Value = serde_json::from_str(b).unwrap_or(Value::Null);
    canonical_json(&rounded_payload(&pa)) != canonical_json(&rounded_payload(&pb))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Open,
    /// Operator-only: acknowledged and being worked.
    InProgress,
    /// Operator-only: muted until the condition recurs or is resolved.
    Snoozed,
    Resolved,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Open => "open",
            SignalStatus::InProgress => "in_progress",
            SignalStatus::Snoozed => "snoozed",
            SignalStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(SignalStatus::Open),
            "in_progress" => Some(SignalStatus::InProgress),
            "snoozed" => Some(SignalStatus::Snoozed),
            "resolved" => Some(SignalStatus::Resolved),
            _ => None,
        }
    }

    /// Live states are still being observed by reconciliation.
    pub fn is_live(&self) -> bool {
        !matches!(self, SignalStatus::Resolved)
    }
}

/// Persisted lifecycle record, keyed (business_id, signal_id). Never
/// hard-deleted; history accrues in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalState {
    pub business_id: String,
    pub signal_id: String,
    pub signal_type: String,
    pub status: SignalStatus,
    pub severity: Severity,
    pub title: String,
    pub summary: String,
    pub payload_json: String,
    pub fingerprint: String,
    pub detected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SignalState {
    pub fn snapshot_json(&self) -> String {
        canonical_json(&json!({
            "status": self.status.as_str(),
            "severity": self.severity.as_str(),
            "title": self.title,
            "summary": self.summary,
            "fingerprint": self.fingerprint,
            "payload": serde_json::from_str::<Value>(&self.payload_json).unwrap_or(Value::Null),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    SignalDetected,
    SignalUpdated,
    SignalResolved,
    SignalStatusChanged,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::SignalDetected => "signal_detected",
            AuditKind::SignalUpdated => "signal_updated",
            AuditKind::SignalResolved => "signal_resolved",
            AuditKind::SignalStatusChanged => "signal_status_changed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "signal_detected" => Some(AuditKind::SignalDetected),
            "signal_updated" => Some(AuditKind::SignalUpdated),
            "signal_resolved" => Some(AuditKind::SignalResolved),
            "signal_status_changed" => Some(AuditKind::SignalStatusChanged),
            _ => None,
        }
    }
}

/// Write-once fact record of a state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub business_id: String,
    pub signal_id: String,
    pub kind: AuditKind,
    pub actor: String,
    pub reason: String,
    pub before_json: Option<String>,
    pub after_json: Option<String>,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_change_ignores_subcent_jitter() {
        let a = r#"{"evidence":[{"key":"delta","value":420.001}]}"#;
        let b = r#"{"evidence":[{"key":"delta","value":420.0041}]}"#;
        assert!(!payload_changed(a, b));
        let c = r#"{"evidence":[{"key":"delta","value":425.0}]}"#;
        assert!(payload_changed(a, c));
    }

    #[test]
    fn status_roundtrip_and_liveness() {
        for s in [
            SignalStatus::Open,
            SignalStatus::InProgress,
            SignalStatus::Snoozed,
            SignalStatus::Resolved,
        ] {
            assert_eq!(SignalStatus::parse(s.as_str()), Some(s));
        }
        assert!(SignalStatus::Snoozed.is_live());
        assert!(!SignalStatus::Resolved.is_live());
    }

    #[test]
    fn severity_is_ordered() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
    }

    #[test]
    fn evidence_serializes_in_order() {
        let sig = DetectedSignal {
            signal_id: "t-abc".to_string(),
            signal_type: "t".to_string(),
            fingerprint: "abc".to_string(),
            severity: Severity::Info,
            title: "t".to_string(),
            summary: "s".to_string(),
            evidence: vec![
                EvidenceEntry::new("z_first", "Z", serde_json::json!(1), "facts"),
                EvidenceEntry::new("a_second", "A", serde_json::json!(2), "facts"),
            ],
        };
        let payload = sig.payload_json();
        let z = payload.find("z_first").unwrap();
        let a = payload.find("a_second").unwrap();
        assert!(z < a, "evidence order must be preserved");
    }
}
