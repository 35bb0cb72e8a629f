use crate::domain::{OptionContract, OptionRight, ParameterSet};
use crate::errors::{EngineError, EngineResult};
use crate::pricing::{intrinsic, OptionPricer, PricerKind, PricingResult};
use chrono::{DateTime, Utc};
use statrs::distribution::{Continuous, ContinuousCDF, Normal};

/// Black-Scholes vanilla pricing with analytic greeks.
///
/// Call = S*Phi(d1) - K*e^{-rT}*Phi(d2)
/// Put  = K*e^{-rT}*Phi(-d2) - S*Phi(-d1)
///
/// d1 = (ln(S/K) + (r + sigma^2/2)T) / (sigma*sqrt(T)),  d2 = d1 - sigma*sqrt(T)
///
/// Used as the reference model and as the inversion target when mapping
/// model prices back to implied vols during calibration.
pub struct BlackScholesPricer {
    /// Standard normal distribution (created once, reused)
    normal: Normal,
}

impl BlackScholesPricer {
    pub fn new() -> Self {
        // Normal::new(0, 1) only fails if std_dev <= 0; this is safe.
        let normal = Normal::new(0.0, 1.0).unwrap_or(Normal::standard());
        Self { normal }
    }
}

impl Default for BlackScholesPricer {
    fn default() -> Self {
        Self::new()
    }
}

impl OptionPricer for BlackScholesPricer {
    fn kind(&self) -> PricerKind {
        PricerKind::BlackScholes
    }

    /// Prices with flat vol sigma = sqrt(v0) from the parameter set.
    fn price(
        &self,
        params: &ParameterSet,
        spot: f64,
        rate: f64,
        contract: &OptionContract,
        now: DateTime<Utc>,
    ) -> EngineResult<PricingResult> {
        let strike = contract.strike();
        let t = contract.year_fraction(now);
        if t < 0.0 {
            return Err(EngineError::Numerical(format!(
                "contract {} already expired",
                contract.key()
            )));
        }
        let sigma = params.v0.sqrt();
        if sigma <= 0.0 || !sigma.is_finite() {
            return Err(EngineError::Numerical(format!(
                "non-positive vol {sigma} for {}",
                contract.key()
            )));
        }
        if spot <= 0.0 || strike <= 0.0 {
            return Err(EngineError::Numerical(format!(
                "non-positive spot/strike for {}",
                contract.key()
            )));
        }

        // Expiry-day degeneracy: intrinsic value, delta collapses to an
        // exercise indicator, all other sensitivities vanish.
        if t == 0.0 {
            let price = intrinsic(spot, strike, contract.right);
            let delta = match contract.right {
                OptionRight::Call if spot > strike => 1.0,
                OptionRight::Put if spot < strike => -1.0,
                _ => 0.0,
            };
            return Ok(PricingResult {
                contract: contract.clone(),
                price,
                delta,
                gamma: 0.0,
                theta: 0.0,
                vega: 0.0,
                rho: 0.0,
                model: PricerKind::BlackScholes,
                params_version: params.version,
            });
        }

        let sqrt_t = t.sqrt();
        let d1 = ((spot / strike).ln() + (rate + 0.5 * sigma * sigma) * t) / (sigma * sqrt_t);
        let d2 = d1 - sigma * sqrt_t;
        let disc = (-rate * t).exp();
        let nd1 = self.normal.cdf(d1);
        let nd2 = self.normal.cdf(d2);
        let pdf_d1 = self.normal.pdf(d1);

        let (price, delta, theta, rho_sens) = match contract.right {
            OptionRight::Call => {
                let price = spot * nd1 - strike * disc * nd2;
                let theta =
                    -(spot * pdf_d1 * sigma) / (2.0 * sqrt_t) - rate * strike * disc * nd2;
                (price, nd1, theta, strike * t * disc * nd2)
            }
            OptionRight::Put => {
                let price = strike * disc * (1.0 - nd2) - spot * (1.0 - nd1);
                let theta = -(spot * pdf_d1 * sigma) / (2.0 * sqrt_t)
                    + rate * strike * disc * (1.0 - nd2);
                (price, nd1 - 1.0, theta, -strike * t * disc * (1.0 - nd2))
            }
        };

        Ok(PricingResult {
            contract: contract.clone(),
            price,
            delta,
            gamma: pdf_d1 / (spot * sigma * sqrt_t),
            theta,
            vega: spot * pdf_d1 * sqrt_t,
            rho: rho_sens,
            model: PricerKind::BlackScholes,
            params_version: params.version,
        })
    }
}

/// Plain Black-Scholes price as a free function, for callers that do not
/// need greeks (surface construction, implied-vol inversion).
pub fn bs_price(spot: f64, strike: f64, t: f64, rate: f64, sigma: f64, right: OptionRight) -> f64 {
    if t <= 0.0 || sigma <= 0.0 {
        return intrinsic(spot, strike, right);
    }
    let normal = Normal::new(0.0, 1.0).unwrap_or(Normal::standard());
    let sqrt_t = t.sqrt();
    let d1 = ((spot / strike).ln() + (rate + 0.5 * sigma * sigma) * t) / (sigma * sqrt_t);
    let d2 = d1 - sigma * sqrt_t;
    let disc = (-rate * t).exp();
    match right {
        OptionRight::Call => spot * normal.cdf(d1) - strike * disc * normal.cdf(d2),
        OptionRight::Put => strike * disc * normal.cdf(-d2) - spot * normal.cdf(-d1),
    }
}

pub fn bs_vega(spot: f64, strike: f64, t: f64, rate: f64, sigma: f64) -> f64 {
    if t <= 0.0 || sigma <= 0.0 {
        return 0.0;
    }
    let normal = Normal::new(0.0, 1.0).unwrap_or(Normal::standard());
    let sqrt_t = t.sqrt();
    let d1 = ((spot / strike).ln() + (rate + 0.5 * sigma * sigma) * t) / (sigma * sqrt_t);
    spot * normal.pdf(d1) * sqrt_t
}

const IV_MAX_ITERS: usize = 20;
const IV_MIN: f64 = 0.01;
const IV_MAX: f64 = 2.0;

/// Newton-Raphson implied vol on Black-Scholes vega. Clamped to [1%, 200%];
/// prices outside the no-arbitrage band or with dead vega fail with a
/// numerical error rather than returning a junk vol.
pub fn implied_volatility(
    price: f64,
    spot: f64,
    strike: f64,
    t: f64,
    rate: f64,
    right: OptionRight,
) -> EngineResult<f64> {
    if t <= 0.0 {
        return Err(EngineError::Numerical("implied vol undefined at expiry".into()));
    }
    let floor = intrinsic(spot, strike, right);
    if price <= floor {
        return Err(EngineError::Numerical(format!(
            "price {price:.4} at or below intrinsic {floor:.4}"
        )));
    }

    let mut sigma: f64 = 0.3;
    for _ in 0..IV_MAX_ITERS {
        let model = bs_price(spot, strike, t, rate, sigma, right);
        let diff = model - price;
        if diff.abs() < 1e-8 {
            return Ok(sigma.clamp(IV_MIN, IV_MAX));
        }
        let vega = bs_vega(spot, strike, t, rate, sigma);
        if vega < 1e-10 {
            break;
        }
        sigma = (sigma - diff / vega).clamp(IV_MIN, IV_MAX);
    }

    // Accept the clamped result if it reprices reasonably; deep-OTM quotes
    // often converge in vega-space without hitting the tight tolerance.
    let model = bs_price(spot, strike, t, rate, sigma, right);
    if (model - price).abs() / price.max(1e-8) < 0.01 {
        Ok(sigma)
    } else {
        Err(EngineError::Numerical(format!(
            "implied vol failed to converge: target {price:.4}, repriced {model:.4}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn contract(right: OptionRight, strike: f64) -> OptionContract {
        OptionContract::new(
            "SPX",
            right,
            strike,
            NaiveDate::from_ymd_opt(2026, 12, 18).unwrap(),
        )
    }

    fn params_with_vol(sigma: f64) -> ParameterSet {
        let mut p = ParameterSet::seed();
        p.v0 = sigma * sigma;
        p
    }

    #[test]
    fn atm_call_matches_reference_value() {
        // S=100, K=100, T=0.5, r=0.03, sigma=0.2 -> C ~ 6.3698 (textbook value)
        let c = bs_price(100.0, 100.0, 0.5, 0.03, 0.2, OptionRight::Call);
        assert_relative_eq!(c, 6.3698, max_relative = 1e-3);
    }

    #[test]
    fn put_call_parity_holds() {
        let (s, k, t, r, sigma) = (5000.0, 5100.0, 0.25, 0.04, 0.18);
        let call = bs_price(s, k, t, r, sigma, OptionRight::Call);
        let put = bs_price(s, k, t, r, sigma, OptionRight::Put);
        assert_relative_eq!(call - put, s - k * (-r * t).exp(), epsilon = 1e-8);
    }

    #[test]
    fn expiry_day_is_intrinsic_with_indicator_delta() {
        let pricer = BlackScholesPricer::new();
        let now = NaiveDate::from_ymd_opt(2026, 12, 18)
            .unwrap()
            .and_hms_opt(15, 0, 0)
            .unwrap()
            .and_utc();
        let c = contract(OptionRight::Call, 4900.0);
        let r = pricer
            .price(&params_with_vol(0.2), 5000.0, 0.04, &c, now)
            .unwrap();
        assert_relative_eq!(r.price, 100.0, epsilon = 1e-12);
        assert_eq!(r.delta, 1.0);
        assert_eq!(r.vega, 0.0);
        assert_eq!(r.theta, 0.0);
        assert_eq!(r.gamma, 0.0);
    }

    #[test]
    fn zero_vol_rejected() {
        let pricer = BlackScholesPricer::new();
        let now = chrono::Utc::now();
        let mut p = ParameterSet::seed();
        p.v0 = 0.0;
        let c = contract(OptionRight::Call, 5000.0);
        assert!(pricer.price(&p, 5000.0, 0.04, &c, now).is_err());
    }

    #[test]
    fn implied_vol_recovers_input() {
        let (s, k, t, r) = (5000.0, 5200.0, 0.1, 0.04);
        for sigma in [0.12, 0.2, 0.45] {
            let price = bs_price(s, k, t, r, sigma, OptionRight::Call);
            let iv = implied_volatility(price, s, k, t, r, OptionRight::Call).unwrap();
            assert_relative_eq!(iv, sigma, max_relative = 1e-4);
        }
    }

    #[test]
    fn implied_vol_rejects_sub_intrinsic_price() {
        assert!(
            implied_volatility(50.0, 5000.0, 4900.0, 0.1, 0.04, OptionRight::Call).is_err(),
            "price below intrinsic (100) must not invert"
        );
    }

    #[test]
    fn call_greeks_have_expected_signs() {
        let pricer = BlackScholesPricer::new();
        let now = NaiveDate::from_ymd_opt(2026, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        let c = contract(OptionRight::Call, 5000.0);
        let r = pricer
            .price(&params_with_vol(0.2), 5000.0, 0.04, &c, now)
            .unwrap();
        assert!(r.delta > 0.0 && r.delta < 1.0);
        assert!(r.gamma > 0.0);
        assert!(r.vega > 0.0);
        assert!(r.theta < 0.0, "long ATM call bleeds theta, got {}", r.theta);
        assert!(r.rho > 0.0);
    }
}
