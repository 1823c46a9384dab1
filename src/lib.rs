//! finpulse: deterministic financial-health monitoring.
//!
//! Pipeline: normalized transactions → running-balance ledger → facts
//! aggregates → robust baselines → detector registry → gated "pulse"
//! reconciliation into a persisted, audited signal lifecycle.
//!
//! The core is synchronous and pure up to the persistence boundary; a pulse
//! is invoked by an external trigger and runs to completion. Determinism is
//! the ruling constraint: the same transaction set always yields the same
//! ledger bytes, the same fingerprints, and the same reconciliation result.

pub mod baseline;
pub mod config;
pub mod detectors;
pub mod facts;
pub mod fingerprint;
pub mod ledger;
pub mod logging;
pub mod pulse;
pub mod signal;
pub mod store;
