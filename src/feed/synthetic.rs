//! Deterministic synthetic option-chain generator.
//!
//! Spot follows geometric Brownian motion; quotes are Black-Scholes values
//! under a skewed vol surface, perturbed with small pricing noise so the
//! detector has genuine (if synthetic) mispricings to find. Seeded: the
//! same seed always produces the same session.

use super::MarketFeed;
use crate::config::AppConfig;
use crate::domain::{MarketSnapshot, OptionContract, OptionQuote, OptionRight};
use crate::errors::EngineResult;
use crate::pricing::black_scholes::bs_price;
use chrono::{Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal, Normal};

const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0;
/// Listed expiries offered, in days from today.
const EXPIRY_LADDER_DAYS: [i64; 5] = [14, 21, 28, 35, 42];
const STRIKE_STEP: f64 = 50.0;
/// Relative std-dev of quote-mid noise around fair value.
const PRICE_NOISE_SD: f64 = 0.02;

pub struct SyntheticFeed {
    underlying: String,
    rng: StdRng,
    spot: f64,
    drift: f64,
    vol: f64,
    rate: f64,
    strike_range_pct: f64,
    dt_years: f64,
}

impl SyntheticFeed {
    pub fn new(cfg: &AppConfig) -> Self {
        Self {
            underlying: cfg.underlying_symbol.clone(),
            rng: StdRng::seed_from_u64(cfg.feed_seed),
            spot: 5000.0,
            drift: cfg.feed_drift,
            vol: cfg.feed_vol,
            rate: cfg.risk_free_rate,
            strike_range_pct: cfg.strike_range_pct,
            dt_years: cfg.cycle_secs as f64 / SECONDS_PER_YEAR,
        }
    }

    /// Skewed surface: higher vol below spot (equity put skew), a mild
    /// smile in the wings, slight term-structure lift.
    fn surface_iv(&self, strike: f64, t: f64) -> f64 {
        let m = strike / self.spot;
        let skew = 0.3 * (1.0 - m);
        let smile = 0.5 * (m - 1.0) * (m - 1.0);
        let term = 0.02 * t.sqrt();
        (self.vol + skew + smile + term).clamp(0.05, 1.5)
    }

    fn step_spot(&mut self) {
        let z: f64 = self.rng.sample(rand_distr::StandardNormal);
        let dt = self.dt_years;
        self.spot *=
            ((self.drift - 0.5 * self.vol * self.vol) * dt + self.vol * dt.sqrt() * z).exp();
    }
}

impl MarketFeed for SyntheticFeed {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn next_snapshot(&mut self, version: u64) -> EngineResult<MarketSnapshot> {
        self.step_spot();
        let now = Utc::now();
        let today = now.date_naive();

        let noise = Normal::new(0.0, PRICE_NOISE_SD)
            .map_err(|e| crate::errors::EngineError::Feed(format!("noise dist: {e}")))?;
        let volume_dist = LogNormal::new(3.5, 1.0)
            .map_err(|e| crate::errors::EngineError::Feed(format!("volume dist: {e}")))?;

        let lo = ((self.spot * (1.0 - self.strike_range_pct)) / STRIKE_STEP).ceil() * STRIKE_STEP;
        let hi = ((self.spot * (1.0 + self.strike_range_pct)) / STRIKE_STEP).floor() * STRIKE_STEP;

        let mut quotes = std::collections::HashMap::new();
        for days in EXPIRY_LADDER_DAYS {
            let expiry = today + Duration::days(days);
            let t = days as f64 / 365.0;
            let mut strike = lo;
            while strike <= hi + 1e-9 {
                let iv = self.surface_iv(strike, t);
                for right in [OptionRight::Call, OptionRight::Put] {
                    let fair = bs_price(self.spot, strike, t, self.rate, iv, right);
                    if fair < 0.05 {
                        continue;
                    }
                    let mid = fair * (1.0 + noise.sample(&mut self.rng));
                    // Tighter markets near the money.
                    let atm_dist = ((strike / self.spot) - 1.0).abs();
                    let half_spread =
                        (mid * (0.01 + 0.15 * atm_dist)).max(0.025) / 2.0 + 0.025;
                    let volume =
                        (volume_dist.sample(&mut self.rng) * (1.0 - atm_dist * 4.0).max(0.1))
                            .round() as i64;
                    let quote = OptionQuote {
                        bid: (mid - half_spread).max(0.0),
                        ask: mid + half_spread,
                        last: mid,
                        volume,
                        open_interest: volume * 5 + self.rng.gen_range(0..100),
                        implied_vol: iv,
                    };
                    quotes.insert(
                        OptionContract::new(&self.underlying, right, strike, expiry),
                        quote,
                    );
                }
                strike += STRIKE_STEP;
            }
        }

        Ok(MarketSnapshot {
            version,
            underlying: self.underlying.clone(),
            spot: self.spot,
            risk_free_rate: self.rate,
            timestamp: now,
            quotes,
        })
    }
}
