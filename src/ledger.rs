//! Running cash ledger: deterministic ordering plus an independent
//! integrity checker.
//!
//! The builder and the checker are deliberately separate: the checker
//! re-derives ordering and balance continuity from scratch so it can
//! validate ledgers built or stored elsewhere, not just our own output.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Tolerance for running-balance continuity. Amounts are dollars; anything
/// past a micro-cent is corruption, not float noise.
pub const BALANCE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inflow,
    Outflow,
}

/// A transaction as produced by the external normalizer. Immutable input;
/// `amount` is a magnitude, the sign lives in `direction`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedTransaction {
    pub source_event_id: String,
    pub occurred_at: DateTime<Utc>,
    pub date: NaiveDate,
    pub description: String,
    pub amount: f64,
    pub direction: Direction,
    pub account: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub counterparty_hint: Option<String>,
}

impl NormalizedTransaction {
    /// Signed amount: inflows positive, outflows negative.
    pub fn signed_amount(&self) -> f64 {
        match self.direction {
            Direction::Inflow => self.amount,
            Direction::Outflow => -self.amount,
        }
    }
}

/// One row of the running-balance ledger. Produced fresh each invocation,
/// never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRow {
    pub occurred_at: DateTime<Utc>,
    pub source_event_id: String,
    pub date: NaiveDate,
    pub description: String,
    /// Signed: inflows positive, outflows negative.
    pub amount: f64,
    pub category: String,
    pub balance: f64,
}

/// Summary produced by a successful integrity check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub rows: usize,
    pub inflow: f64,
    pub outflow: f64,
    pub net: f64,
    pub final_balance: f64,
}

/// Integrity failures are fatal for the invocation: signal computation on a
/// corrupt ledger would be misleading, so the caller decides what to do.
#[derive(Debug, Clone)]
pub enum LedgerIntegrityError {
    NonFiniteAmount { row: usize, source_event_id: String },
    OutOfOrder { row: usize },
    BalanceDiscontinuity { row: usize, expected: f64, actual: f64 },
    FlowMismatch { inflow: f64, outflow: f64, net: f64 },
    NetMismatch { net: f64, final_balance: f64, opening_balance: f64 },
}

impl fmt::Display for LedgerIntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerIntegrityError::NonFiniteAmount { row, source_event_id } => {
                write!(f, "non-finite amount at row {} ({})", row, source_event_id)
            }
            LedgerIntegrityError::OutOfOrder { row } => {
                write!(f, "ledger rows not in canonical order at row {}", row)
            }
            LedgerIntegrityError::BalanceDiscontinuity { row, expected, actual } => {
                write!(
                    f,
                    "balance discontinuity at row {}: expected {:.6}, found {:.6}",
                    row, expected, actual
                )
            }
            LedgerIntegrityError::FlowMismatch { inflow, outflow, net } => {
                write!(
                    f,
                    "inflow {:.6} + outflow {:.6} does not reconcile to net {:.6}",
                    inflow, outflow, net
                )
            }
            LedgerIntegrityError::NetMismatch { net, final_balance, opening_balance } => {
                write!(
                    f,
                    "net {:.6} != final {:.6} - opening {:.6}",
                    net, final_balance, opening_balance
                )
            }
        }
    }
}

impl std::error::Error for LedgerIntegrityError {}

/// Canonical ordering key: (occurred_at, description, amount, source_event_id).
/// The amount compares via total-order bits so a NaN cannot destabilize the
/// sort; non-finite amounts are then rejected by `check`.
fn row_key_cmp(
    a: (&DateTime<Utc>, &str, f64, &str),
    b: (&DateTime<Utc>, &str, f64, &str),
) -> Ordering {
    a.0.cmp(b.0)
        .then_with(|| a.1.cmp(b.1))
        .then_with(|| a.2.total_cmp(&b.2))
        .then_with(|| a.3.cmp(b.3))
}

/// Build the ordered running-balance ledger from an unordered transaction set.
///
/// Two runs over the same set produce identical output regardless of input
/// iteration order.
pub fn build(transactions: &[NormalizedTransaction], opening_balance: f64) -> Vec<LedgerRow> {
    let mut sorted: Vec<&NormalizedTransaction> = transactions.iter().collect();
    sorted.sort_by(|a, b| {
        row_key_cmp(
            (&a.occurred_at, &a.description, a.signed_amount(), &a.source_event_id),
            (&b.occurred_at, &b.description, b.signed_amount(), &b.source_event_id),
        )
    });

    let mut rows = Vec::with_capacity(sorted.len());
    let mut balance = opening_balance;
    for txn in sorted {
        let amount = txn.signed_amount();
        balance += amount;
        rows.push(LedgerRow {
            occurred_at: txn.occurred_at,
            source_event_id: txn.source_event_id.clone(),
            date: txn.date,
            description: txn.description.clone(),
            amount,
            category: txn
                .category
                .clone()
                .unwrap_or_else(|| "uncategorized".to_string()),
            balance,
        });
    }
    rows
}

/// Re-derive ordering and balance continuity from scratch and fail loudly
/// on any deviation. Side-effect-free.
pub fn check(
    ledger: &[LedgerRow],
    opening_balance: f64,
) -> Result<LedgerSummary, LedgerIntegrityError> {
    let mut inflow = 0.0;
    let mut outflow = 0.0;
    let mut expected = opening_balance;

    for (i, row) in ledger.iter().enumerate() {
        if !row.amount.is_finite() || !row.balance.is_finite() {
            return Err(LedgerIntegrityError::NonFiniteAmount {
                row: i,
                source_event_id: row.source_event_id.clone(),
            });
        }
        if i > 0 {
            let prev = &ledger[i - 1];
            let ord = row_key_cmp(
                (&prev.occurred_at, &prev.description, prev.amount, &prev.source_event_id),
                (&row.occurred_at, &row.description, row.amount, &row.source_event_id),
            );
            if ord == Ordering::Greater {
                return Err(LedgerIntegrityError::OutOfOrder { row: i });
            }
        }
        expected += row.amount;
        if (row.balance - expected).abs() > BALANCE_EPSILON {
            return Err(LedgerIntegrityError::BalanceDiscontinuity {
                row: i,
                expected,
                actual: row.balance,
            });
        }
        if row.amount >= 0.0 {
            inflow += row.amount;
        } else {
            outflow += row.amount;
        }
    }

    let net = ledger.iter().map(|r| r.amount).sum::<f64>();
    if (inflow + outflow - net).abs() > BALANCE_EPSILON {
        return Err(LedgerIntegrityError::FlowMismatch { inflow, outflow, net });
    }
    let final_balance = ledger.last().map(|r| r.balance).unwrap_or(opening_balance);
    if (net - (final_balance - opening_balance)).abs() > BALANCE_EPSILON {
        return Err(LedgerIntegrityError::NetMismatch { net, final_balance, opening_balance });
    }

    Ok(LedgerSummary {
        rows: ledger.len(),
        inflow,
        outflow,
        net,
        final_balance,
    })
}


#[cfg(test)]
mod tests {
    use super::testutil::txn;
    use super::*;

    fn sample() -> Vec<NormalizedTransaction> {
        vec![
            txn("e3", (2025, 3, 5), "Acme invoice", 1200.0, Direction::Inflow),
            txn("e1", (2025, 3, 1), "Rent", 900.0, Direction::Outflow),
            txn("e2", (2025, 3, 1), "Coffee", 6.5, Direction::Outflow),
            txn("e4", (2025, 3, 9), "Payroll", 2500.0, Direction::Outflow),
        ]
    }

    #[test]
    fn reconciles_to_final_balance() {
        let txns = sample();
        let ledger = build(&txns, 5000.0);
        let signed: f64 = txns.iter().map(|t| t.signed_amount()).sum();
        let final_balance = ledger.last().unwrap().balance;
        assert!((signed - (final_balance - 5000.0)).abs() < 1e-9);
    }

    #[test]
    fn order_independent_and_deterministic() {
        let txns = sample();
        let mut reversed = txns.clone();
        reversed.reverse();
        let a = build(&txns, 100.0);
        let b = build(&reversed, 100.0);
        let ja = serde_json::to_string(&a).unwrap();
        let jb = serde_json::to_string(&b).unwrap();
        assert_eq!(ja, jb);
    }

    #[test]
    fn check_accepts_own_output() {
        let ledger = build(&sample(), 250.0);
        let summary = check(&ledger, 250.0).expect("own output must pass");
        assert_eq!(summary.rows, 4);
        assert!((summary.inflow - 1200.0).abs() < 1e-9);
        assert!((summary.outflow + 3406.5).abs() < 1e-9);
    }

    #[test]
    fn check_catches_tampered_balance() {
        let mut ledger = build(&sample(), 0.0);
        ledger[2].balance += 10.0;
        let err = check(&ledger, 0.0).unwrap_err();
        assert!(matches!(err, LedgerIntegrityError::BalanceDiscontinuity { row: 2, .. }));
    }

    #[test]
    fn check_catches_out_of_order_rows() {
        let mut ledger = build(&sample(), 0.0);
        ledger.swap(0, 3);
        let err = check(&ledger, 0.0).unwrap_err();
        assert!(matches!(
            err,
            LedgerIntegrityError::OutOfOrder { .. }
                | LedgerIntegrityError::BalanceDiscontinuity { .. }
        ));
    }

    #[test]
    fn check_catches_non_finite_amount() {
        let mut ledger = build(&sample(), 0.0);
        ledger[1].amount = f64::NAN;
        let err = check(&ledger, 0.0).unwrap_err();
        assert!(matches!(err, LedgerIntegrityError::NonFiniteAmount { row: 1, .. }));
    }

    #[test]
    fn empty_ledger_passes() {
        let summary = check(&[], 42.0).unwrap();
        assert_eq!(summary.rows, 0);
        assert!((summary.final_balance - 42.0).abs() < 1e-9);
    }

    #[test]
    fn same_timestamp_ties_break_lexicographically() {
        let txns = vec![
            txn("b", (2025, 1, 1), "Zeta", 10.0, Direction::Outflow),
            txn("a", (2025, 1, 1), "Alpha", 10.0, Direction::Outflow),
        ];
        let ledger = build(&txns, 0.0);
        assert_eq!(ledger[0].description, "Alpha");
        assert_eq!(ledger[1].description, "Zeta");
    }
}
