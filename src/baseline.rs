//! Robust statistical baselines: median/MAD bands, OLS trend slope,
//! drift tiers, and calendar-seasonal baselines.
//!
//! MAD is used instead of stdev so a single outlier month cannot drag the
//! band. All functions are pure over their input sequence.

use serde::{Deserialize, Serialize};

use crate::facts::MonthlyFlow;

/// Floor on band width so flat history still yields a usable band.
pub const BAND_FLOOR: f64 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub median: f64,
    pub mad: f64,
    /// max(mad, BAND_FLOOR); never zero.
    pub band: f64,
    pub lower: f64,
    pub upper: f64,
    pub slope: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandStatus {
    BelowBand,
    InBand,
    AboveBand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Drift {
    None,
    Mild,
    Severe,
}

impl Drift {
    /// Fixed score penalty per tier.
    pub fn penalty(&self) -> u32 {
        match self {
            Drift::None => 0,
            Drift::Mild => 3,
            Drift::Severe => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeasonalAssessment {
    None,
    Mild,
    Severe,
    InsufficientHistory,
}

impl SeasonalAssessment {
    pub fn penalty(&self) -> u32 {
        match self {
            SeasonalAssessment::None => 0,
            SeasonalAssessment::Mild => 2,
            SeasonalAssessment::Severe => 5,
            SeasonalAssessment::InsufficientHistory => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeasonalBaseline {
    pub month: u32,
    pub median: f64,
    pub mad: f64,
    pub samples: usize,
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Median absolute deviation. Always >= 0.
pub fn mad(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = median(values);
    let deviations: Vec<f64> = values.iter().map(|v| (v - m).abs()).collect();
    median(&deviations)
}

/// Ordinary least-squares slope of value vs. index. 0.0 for < 2 points.
pub fn trend_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let nf = n as f64;
    let mean_x = (nf - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / nf;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, v) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (v - mean_y);
        den += dx * dx;
    }
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

/// Robust band around the median: [median - k*band, median + k*band].
/// Returns None for an empty series.
pub fn robust_band(values: &[f64], k: f64) -> Option<Baseline> {
    if values.is_empty() {
        return None;
    }
    let m = median(values);
    let d = mad(values);
    let band = d.max(BAND_FLOOR);
    Some(Baseline {
        median: m,
        mad: d,
        band,
        lower: m - k * band,
        upper: m + k * band,
        slope: trend_slope(values),
        samples: values.len(),
    })
}

pub fn classify(value: f64, baseline: &Baseline) -> BandStatus {
    if value < baseline.lower {
        BandStatus::BelowBand
    } else if value > baseline.upper {
        BandStatus::AboveBand
    } else {
        BandStatus::InBand
    }
}

/// Drift of `current` below the baseline median, in band units.
/// z >= -0.5 → none; -1.5 <= z < -0.5 → mild; z < -1.5 → severe.
pub fn assess_drift(current: f64, baseline: &Baseline) -> (Drift, f64) {
    let z = (current - baseline.median) / baseline.band;
    let tier = if z >= -0.5 {
        Drift::None
    } else if z >= -1.5 {
        Drift::Mild
    } else {
        Drift::Severe
    };
    (tier, z)
}

/// Seasonal baseline for one calendar month-of-year, bucketed over monthly
/// net history. Buckets with fewer than `min_samples` are not trusted.
pub fn seasonal_baseline(
    monthly: &[MonthlyFlow],
    month: u32,
    min_samples: usize,
) -> Option<SeasonalBaseline> {
    let nets: Vec<f64> = monthly
        .iter()
        .filter(|m| m.month == month)
        .map(|m| m.net)
        .collect();
    if nets.len() < min_samples {
        return None;
    }
    Some(SeasonalBaseline {
        month,
        median: median(&nets),
        mad: mad(&nets),
        samples: nets.len(),
    })
}

/// Assess `current` month net against its calendar bucket.
pub fn assess_seasonal(
    monthly: &[MonthlyFlow],
    month: u32,
    current: f64,
    min_samples: usize,
) -> (SeasonalAssessment, f64) {
    let Some(sb) = seasonal_baseline(monthly, month, min_samples) else {
        return (SeasonalAssessment::InsufficientHistory, 0.0);
    };
    let band = sb.mad.max(BAND_FLOOR);
    let z = (current - sb.median) / band;
    let tier = if z >= -0.5 {
        SeasonalAssessment::None
    } else if z >= -1.5 {
        SeasonalAssessment::Mild
    } else {
        SeasonalAssessment::Severe
    };
    (tier, z)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monthly_fixture(nets: &[(i32, u32, f64)]) -> Vec<MonthlyFlow> {
        nets.iter()
            .map(|&(year, month, net)| MonthlyFlow {
                year,
                month,
                inflow: net.max(0.0),
                outflow: (-net).max(0.0),
                net,
            })
            .collect()
    }

    #[test]
    fn median_handles_even_and_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn mad_nonnegative_and_band_never_zero() {
        let flat = [5.0, 5.0, 5.0, 5.0];
        assert!(mad(&flat) >= 0.0);
        let b = robust_band(&flat, 2.0).unwrap();
        assert!(b.band >= BAND_FLOOR);
        assert!(b.upper > b.lower);
    }

    #[test]
    fn constant_series_has_no_drift() {
        let flat = [100.0; 8];
        let b = robust_band(&flat, 2.0).unwrap();
        let (drift, z) = assess_drift(100.0, &b);
        assert_eq!(drift, Drift::None);
        assert_eq!(z, 0.0);
    }

    #[test]
    fn drift_tiers() {
        let b = robust_band(&[0.0, 10.0, 20.0, 30.0, 40.0], 2.0).unwrap();
        // median 20, mad 10
        let (none, _) = assess_drift(20.0, &b);
        assert_eq!(none, Drift::None);
        let (mild, z) = assess_drift(10.0, &b); // z = -1.0
        assert_eq!(mild, Drift::Mild);
        assert!((z + 1.0).abs() < 1e-9);
        let (severe, _) = assess_drift(-10.0, &b); // z = -3.0
        assert_eq!(severe, Drift::Severe);
        assert_eq!(severe.penalty(), 7);
    }

    #[test]
    fn slope_of_line_and_degenerate_inputs() {
        let line: Vec<f64> = (0..10).map(|i| 3.0 * i as f64 + 7.0).collect();
        assert!((trend_slope(&line) - 3.0).abs() < 1e-9);
        assert_eq!(trend_slope(&[5.0]), 0.0);
        assert_eq!(trend_slope(&[]), 0.0);
    }

    #[test]
    fn seasonal_requires_two_samples() {
        let hist = monthly_fixture(&[(2023, 1, 500.0), (2024, 1, 700.0), (2024, 2, 100.0)]);
        assert!(seasonal_baseline(&hist, 1, 2).is_some());
        let (outcome, _) = assess_seasonal(&hist, 2, 100.0, 2);
        assert_eq!(outcome, SeasonalAssessment::InsufficientHistory);
        assert_eq!(outcome.penalty(), 0);
    }

    #[test]
    fn seasonal_flags_depressed_month() {
        let hist = monthly_fixture(&[
            (2022, 6, 1000.0),
            (2023, 6, 1200.0),
            (2024, 6, 1100.0),
        ]);
        let (outcome, z) = assess_seasonal(&hist, 6, 200.0, 2);
        assert_eq!(outcome, SeasonalAssessment::Severe);
        assert!(z < -1.5);
        // And a constant seasonal history is quiet.
        let flat = monthly_fixture(&[(2022, 7, 300.0), (2023, 7, 300.0), (2024, 7, 300.0)]);
        let (quiet, _) = assess_seasonal(&flat, 7, 300.0, 2);
        assert_eq!(quiet, SeasonalAssessment::None);
    }
}
