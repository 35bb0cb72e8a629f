//! Core market and model data types shared across the pipeline.
//!
//! Everything here is immutable once constructed: feeds build snapshots,
//! calibration builds parameter sets, and downstream stages only read them.

use crate::errors::{EngineError, EngineResult};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;

/// Standard index-option contract multiplier (dollars of notional per point).
pub const CONTRACT_MULTIPLIER: f64 = 100.0;

/// Days-per-year convention used for all time-to-expiry fractions.
pub const DAYS_PER_YEAR: f64 = 365.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionRight {
    Call,
    Put,
}

/// Identity of one listed option. Strike is stored in cents so the contract
/// can key hash maps without floating-point equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct OptionContract {
    pub underlying: String,
    pub right: OptionRight,
    pub strike_cents: i64,
    pub expiry: NaiveDate,
}

impl OptionContract {
    pub fn new(underlying: &str, right: OptionRight, strike: f64, expiry: NaiveDate) -> Self {
        Self {
            underlying: underlying.to_string(),
            right,
            strike_cents: (strike * 100.0).round() as i64,
            expiry,
        }
    }

    pub fn strike(&self) -> f64 {
        self.strike_cents as f64 / 100.0
    }

    /// Stable display key, e.g. `SPX_5000_2026-09-18_C`. Also the
    /// deterministic last-resort sort key for signal ranking.
    pub fn key(&self) -> String {
        let r = match self.right {
            OptionRight::Call => 'C',
            OptionRight::Put => 'P',
        };
        format!("{}_{}_{}_{}", self.underlying, self.strike(), self.expiry, r)
    }

    /// Whole calendar days until expiry, measured from `now`'s UTC date.
    pub fn days_to_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.expiry - now.date_naive()).num_days()
    }

    /// Time to expiry as a year fraction (ACT/365). Zero on expiry day,
    /// negative once expired.
    pub fn year_fraction(&self, now: DateTime<Utc>) -> f64 {
        self.days_to_expiry(now) as f64 / DAYS_PER_YEAR
    }
}

/// One side-complete quote for a contract as observed at snapshot time.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct OptionQuote {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub volume: i64,
    pub open_interest: i64,
    /// Exchange-reported implied vol for the quote mid, if available.
    pub implied_vol: f64,
}

impl OptionQuote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    /// Spread as a fraction of mid. Returns infinity for degenerate quotes
    /// so they fail any spread filter.
    pub fn spread_ratio(&self) -> f64 {
        let mid = self.mid();
        if mid > 0.0 {
            self.spread() / mid
        } else {
            f64::INFINITY
        }
    }

    pub fn is_two_sided(&self) -> bool {
        self.bid > 0.0 && self.ask > 0.0 && self.ask >= self.bid
    }
}

/// Point-in-time view of the option chain plus underlying context.
/// Produced by a feed, consumed read-only by every downstream stage.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub version: u64,
    pub underlying: String,
    pub spot: f64,
    pub risk_free_rate: f64,
    pub timestamp: DateTime<Utc>,
    pub quotes: HashMap<OptionContract, OptionQuote>,
}

impl MarketSnapshot {
    /// Age of this snapshot in seconds relative to `now` (never negative).
    pub fn age_secs(&self, now: DateTime<Utc>) -> f64 {
        ((now - self.timestamp).num_milliseconds() as f64 / 1000.0).max(0.0)
    }
}

/// A calibrated Heston parameter vector with provenance.
///
/// The five parameters:
/// - `kappa`: mean-reversion speed of variance
/// - `theta`: long-run variance
/// - `xi`:    volatility of variance
/// - `rho`:   spot/variance correlation
/// - `v0`:    instantaneous variance
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ParameterSet {
    pub kappa: f64,
    pub theta: f64,
    pub xi: f64,
    pub rho: f64,
    pub v0: f64,
    /// RMSE of the implied-vol fit that produced this set.
    pub rmse: f64,
    /// Monotonically increasing across accepted calibrations.
    pub version: u64,
    pub calibrated_at: DateTime<Utc>,
}

/// Calibration search box. Wider than typical index-vol fits on purpose:
/// the box constrains the optimizer, QC decides acceptance.
pub const PARAM_BOUNDS: [(f64, f64); 5] = [
    (0.1, 10.0),   // kappa
    (1e-4, 1.0),   // theta
    (0.01, 2.0),   // xi
    (-0.99, 0.99), // rho
    (1e-4, 1.0),   // v0
];

impl ParameterSet {
    /// Conservative index-vol starting point used before the first
    /// calibration completes: 20% vol, fast-ish mean reversion, equity skew.
    pub fn seed() -> Self {
        Self {
            kappa: 2.0,
            theta: 0.04,
            xi: 0.3,
            rho: -0.7,
            v0: 0.04,
            rmse: f64::NAN,
            version: 0,
            calibrated_at: Utc::now(),
        }
    }

    /// Construct a set, rejecting anything outside the admissible region.
    /// This is the only way calibration output enters the live path.
    pub fn validated(
        x: [f64; 5],
        rmse: f64,
        version: u64,
        calibrated_at: DateTime<Utc>,
    ) -> EngineResult<Self> {
        let names = ["kappa", "theta", "xi", "rho", "v0"];
        for i in 0..5 {
            if !x[i].is_finite() {
                return Err(EngineError::Calibration(format!("{} not finite", names[i])));
            }
            let (lo, hi) = PARAM_BOUNDS[i];
            if x[i] < lo || x[i] > hi {
                return Err(EngineError::Calibration(format!(
                    "{} = {:.6} outside [{lo}, {hi}]",
                    names[i], x[i]
                )));
            }
        }
        Ok(Self {
            kappa: x[0],
            theta: x[1],
            xi: x[2],
            rho: x[3],
            v0: x[4],
            rmse,
            version,
            calibrated_at,
        })
    }

    pub fn as_array(&self) -> [f64; 5] {
        [self.kappa, self.theta, self.xi, self.rho, self.v0]
    }

    /// Feller condition 2*kappa*theta >= xi^2. Violations are legal for
    /// short-dated surfaces but worth surfacing in logs.
    pub fn feller_satisfied(&self) -> bool {
        2.0 * self.kappa * self.theta >= self.xi * self.xi
    }
}

/// One open position in the book. Mutated only by the engine task in
/// response to fills.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Position {
    pub contract: OptionContract,
    /// Signed contract count: positive long, negative short.
    pub quantity: i64,
    pub avg_price: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
}

impl Position {
    /// Gross notional controlled by this position at the given mark.
    pub fn notional(&self, mark: f64) -> f64 {
        self.quantity.unsigned_abs() as f64 * mark * CONTRACT_MULTIPLIER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn contract_key_is_stable_and_hashable() {
        let a = OptionContract::new("SPX", OptionRight::Call, 5000.0, date(2026, 9, 18));
        let b = OptionContract::new("SPX", OptionRight::Call, 5000.0, date(2026, 9, 18));
        assert_eq!(a, b);
        assert_eq!(a.key(), "SPX_5000_2026-09-18_C");

        let mut map = HashMap::new();
        map.insert(a.clone(), 1);
        assert_eq!(map.get(&b), Some(&1));
    }

    #[test]
    fn year_fraction_zero_on_expiry_day() {
        let expiry = date(2026, 3, 20);
        let c = OptionContract::new("SPX", OptionRight::Put, 4800.0, expiry);
        let now = expiry.and_hms_opt(14, 30, 0).unwrap().and_utc();
        assert_eq!(c.year_fraction(now), 0.0);
        assert_eq!(c.days_to_expiry(now), 0);
    }

    #[test]
    fn quote_spread_ratio_degenerate_quote_is_infinite() {
        let q = OptionQuote {
            bid: 0.0,
            ask: 0.0,
            last: 0.0,
            volume: 0,
            open_interest: 0,
            implied_vol: 0.0,
        };
        assert!(q.spread_ratio().is_infinite());
        assert!(!q.is_two_sided());
    }

    #[test]
    fn parameter_set_rejects_out_of_bounds() {
        let now = Utc::now();
        // rho outside [-0.99, 0.99]
        let err = ParameterSet::validated([2.0, 0.04, 0.3, -1.5, 0.04], 0.01, 1, now);
        assert!(err.is_err());
        // NaN kappa
        let err = ParameterSet::validated([f64::NAN, 0.04, 0.3, -0.7, 0.04], 0.01, 1, now);
        assert!(err.is_err());
        // Valid set round-trips
        let ok = ParameterSet::validated([2.0, 0.04, 0.3, -0.7, 0.04], 0.01, 1, now).unwrap();
        assert_eq!(ok.as_array(), [2.0, 0.04, 0.3, -0.7, 0.04]);
        assert!(ok.feller_satisfied());
    }

    #[test]
    fn feller_violation_detected() {
        let now = Utc::now();
        let p = ParameterSet::validated([0.5, 0.02, 0.8, -0.5, 0.04], 0.01, 1, now).unwrap();
        // 2 * 0.5 * 0.02 = 0.02 < 0.64
        assert!(!p.feller_satisfied());
    }
}
