//! Stable aggregates over transactions + ledger: monthly cashflow,
//! category totals, rolling window pairs.
//!
//! Pure computation. The rolling-window anchor is the max transaction date,
//! never wall-clock, so runs against historical fixtures reproduce exactly.

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ledger::{LedgerRow, NormalizedTransaction};

pub const DEFAULT_WINDOW_DAYS: [u32; 3] = [30, 60, 90];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyFlow {
    pub year: i32,
    pub month: u32,
    pub inflow: f64,
    pub outflow: f64,
    pub net: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryTotal {
    pub category: String,
    /// Signed sum: net inflow positive, net outflow negative.
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub inflow: f64,
    pub outflow: f64,
    pub net: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowPair {
    pub days: u32,
    pub current: FlowWindow,
    pub prior: FlowWindow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactsMeta {
    pub as_of: Option<NaiveDate>,
    pub txn_count: usize,
    pub months_covered: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Facts {
    pub current_cash: f64,
    pub monthly: Vec<MonthlyFlow>,
    pub categories: Vec<CategoryTotal>,
    pub windows: BTreeMap<u32, WindowPair>,
    pub meta: FactsMeta,
}

fn flow_over(
    transactions: &[NormalizedTransaction],
    start: NaiveDate,
    end: NaiveDate,
) -> FlowWindow {
    let mut inflow = 0.0;
    let mut outflow = 0.0;
    for t in transactions {
        if t.date >= start && t.date <= end {
            let signed = t.signed_amount();
            if signed >= 0.0 {
                inflow += signed;
            } else {
                outflow += -signed;
            }
        }
    }
    FlowWindow { start, end, inflow, outflow, net: inflow - outflow }
}

/// Rolling window pair anchored at `anchor`: current = [anchor-W+1, anchor],
/// prior = the immediately preceding W-day block.
pub fn window_pair(
    transactions: &[NormalizedTransaction],
    anchor: NaiveDate,
    days: u32,
) -> WindowPair {
    let w = Duration::days(days as i64);
    let current_start = anchor - w + Duration::days(1);
    let prior_end = current_start - Duration::days(1);
    let prior_start = prior_end - w + Duration::days(1);
    WindowPair {
        days,
        current: flow_over(transactions, current_start, anchor),
        prior: flow_over(transactions, prior_start, prior_end),
    }
}

/// Compute the full facts snapshot. Identical output for identical input.
pub fn compute(
    transactions: &[NormalizedTransaction],
    ledger: &[LedgerRow],
    window_days: &[u32],
) -> Facts {
    // Monthly cashflow, keyed (year, month) so iteration order is stable.
    let mut monthly_map: BTreeMap<(i32, u32), (f64, f64)> = BTreeMap::new();
    for t in transactions {
        let key = (t.occurred_at.year(), t.occurred_at.month());
        let entry = monthly_map.entry(key).or_insert((0.0, 0.0));
        let signed = t.signed_amount();
        if signed >= 0.0 {
            entry.0 += signed;
        } else {
            entry.1 += -signed;
        }
    }
    let monthly: Vec<MonthlyFlow> = monthly_map
        .into_iter()
        .map(|((year, month), (inflow, outflow))| MonthlyFlow {
            year,
            month,
            inflow,
            outflow,
            net: inflow - outflow,
        })
        .collect();

    // Category totals, descending absolute magnitude; ties on name.
    let mut cat_map: BTreeMap<String, f64> = BTreeMap::new();
    for t in transactions {
        let cat = t
            .category
            .clone()
            .unwrap_or_else(|| "uncategorized".to_string());
        *cat_map.entry(cat).or_insert(0.0) += t.signed_amount();
    }
    let mut categories: Vec<CategoryTotal> = cat_map
        .into_iter()
        .map(|(category, total)| CategoryTotal { category, total })
        .collect();
    categories.sort_by(|a, b| {
        b.total
            .abs()
            .total_cmp(&a.total.abs())
            .then_with(|| a.category.cmp(&b.category))
    });

    // Rolling windows, anchored at max transaction date.
    let anchor = transactions.iter().map(|t| t.date).max();
    let mut windows = BTreeMap::new();
    if let Some(anchor) = anchor {
        for &days in window_days {
            windows.insert(days, window_pair(transactions, anchor, days));
        }
    }

    let as_of = ledger
        .last()
        .map(|r| r.date)
        .or_else(|| transactions.iter().map(|t| t.date).max());

    Facts {
        current_cash: ledger.last().map(|r| r.balance).unwrap_or(0.0),
        meta: FactsMeta {
            as_of,
            txn_count: transactions.len(),
            months_covered: monthly.len(),
        },
        monthly,
        categories,
        windows,
    }
}
