//! Runtime configuration. Every tunable has an env override and a default
//! that matches the documented detector thresholds.

#[derive(Clone, Debug)]
pub struct Config {
    /// Sqlite database holding signal state, audit log, and pulse gate.
    pub sqlite_path: String,
    /// Minimum seconds between pulses for one business (the gate).
    pub pulse_min_interval_secs: i64,
    /// Rolling window sizes (days) produced by the facts aggregator.
    pub window_days: Vec<u32>,

    // Expense creep (per-vendor, current vs prior N-day window)
    pub creep_window_days: u32,
    pub creep_min_delta: f64,
    pub creep_threshold_pct: f64,

    // Cash runway
    pub runway_window_days: u32,
    pub runway_warn_days: f64,
    pub runway_critical_days: f64,

    // Outflow spike
    pub spike_window_days: u32,
    pub spike_sigma_threshold: f64,
    pub spike_mult_threshold: f64,
    pub spike_min_amount: f64,

    // Revenue decline / volatility
    pub revenue_window_days: u32,
    pub revenue_decline_pct: f64,
    pub revenue_cv_ratio: f64,
    pub revenue_min_prior_inflow: f64,

    // Structural / hygiene detectors
    pub timing_gap_days: f64,
    pub cliff_share_threshold: f64,
    pub concentration_share_threshold: f64,
    pub uncategorized_ratio_threshold: f64,
    pub uncategorized_min_txns: usize,
    pub flap_transitions_threshold: u32,
    pub flap_lookback_days: i64,

    // Baseline engine
    pub band_k: f64,
    pub seasonal_min_samples: usize,
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./finpulse.sqlite".to_string()),
            pulse_min_interval_secs: env_i64("PULSE_MIN_INTERVAL_SECS", 6 * 3600),
            window_days: std::env::var("WINDOW_DAYS")
                .ok()
                .map(|v| v.split(',').filter_map(|d| d.trim().parse().ok()).collect())
                .filter(|v: &Vec<u32>| !v.is_empty())
                .unwrap_or_else(|| vec![30, 60, 90]),
            creep_window_days: env_u32("CREEP_WINDOW_DAYS", 14),
            creep_min_delta: env_f64("CREEP_MIN_DELTA", 200.0),
            creep_threshold_pct: env_f64("CREEP_THRESHOLD_PCT", 0.35),
            runway_window_days: env_u32("RUNWAY_WINDOW_DAYS", 30),
            runway_warn_days: env_f64("RUNWAY_WARN_DAYS", 60.0),
            runway_critical_days: env_f64("RUNWAY_CRITICAL_DAYS", 30.0),
            spike_window_days: env_u32("SPIKE_WINDOW_DAYS", 30),
            spike_sigma_threshold: env_f64("SPIKE_SIGMA_TH", 3.0),
            spike_mult_threshold: env_f64("SPIKE_MULT_TH", 4.0),
            spike_min_amount: env_f64("SPIKE_MIN_AMOUNT", 250.0),
            revenue_window_days: env_u32("REVENUE_WINDOW_DAYS", 30),
            revenue_decline_pct: env_f64("REVENUE_DECLINE_PCT", 0.25),
            revenue_cv_ratio: env_f64("REVENUE_CV_RATIO", 1.8),
            revenue_min_prior_inflow: env_f64("REVENUE_MIN_PRIOR_INFLOW", 500.0),
            timing_gap_days: env_f64("TIMING_GAP_DAYS", 12.0),
            cliff_share_threshold: env_f64("CLIFF_SHARE_TH", 0.5),
            concentration_share_threshold: env_f64("CONCENTRATION_SHARE_TH", 0.6),
            uncategorized_ratio_threshold: env_f64("UNCATEGORIZED_RATIO_TH", 0.4),
            uncategorized_min_txns: env_u32("UNCATEGORIZED_MIN_TXNS", 20) as usize,
            flap_transitions_threshold: env_u32("FLAP_TRANSITIONS_TH", 4),
            flap_lookback_days: env_i64("FLAP_LOOKBACK_DAYS", 30),
            band_k: env_f64("BAND_K", 2.0),
            seasonal_min_samples: env_u32("SEASONAL_MIN_SAMPLES", 2) as usize,
        }
    }

    /// Window sizes the facts aggregator must produce: the configured set
    /// plus every size a detector reads, so narrowing `WINDOW_DAYS` cannot
    /// silently mute the windowed detectors.
    pub fn facts_window_days(&self) -> Vec<u32> {
        let mut days: std::collections::BTreeSet<u32> = self.window_days.iter().copied().collect();
        days.insert(self.runway_window_days);
        days.insert(self.revenue_window_days);
        days.into_iter().collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
