use crate::domain::{OptionContract, OptionRight, ParameterSet};
use crate::errors::{EngineError, EngineResult};
use crate::pricing::greeks::bump_and_reprice;
use crate::pricing::{intrinsic, OptionPricer, PricerKind, PricingResult};
use chrono::{DateTime, Utc};
use num_complex::Complex64;

/// Semi-analytic Heston pricing via the characteristic function.
///
/// Under Heston dynamics
///   dS = r S dt + sqrt(v) S dW_S
///   dv = kappa (theta - v) dt + xi sqrt(v) dW_v,   corr(dW_S, dW_v) = rho
///
/// the call price is S*P1 - K*e^{-rT}*P2 with
///   Pj = 1/2 + (1/pi) * Int_0^inf Re[ e^{-iu ln K} f_j(u) / (iu) ] du
///
/// using the "little Heston trap" branch of the characteristic function,
/// which stays numerically stable for long maturities. The integral is
/// evaluated with a fixed Gauss-Legendre rule on [0, U_MAX]; if the
/// integrand has not decayed below TAIL_TOL at the truncation point the
/// valuation fails loudly instead of returning a silently wrong price.
pub struct HestonPricer {
    /// Quadrature abscissae mapped to [0, U_MAX], with weights.
    nodes: Vec<(f64, f64)>,
    u_max: f64,
}

const QUAD_ORDER: usize = 192;
const U_MAX: f64 = 500.0;
const TAIL_TOL: f64 = 1e-8;

impl HestonPricer {
    pub fn new() -> Self {
        Self::with_quadrature(QUAD_ORDER, U_MAX)
    }

    pub fn with_quadrature(order: usize, u_max: f64) -> Self {
        let (xs, ws) = gauss_legendre(order);
        let nodes = xs
            .iter()
            .zip(ws.iter())
            .map(|(x, w)| (0.5 * u_max * (x + 1.0), 0.5 * u_max * w))
            .collect();
        Self { nodes, u_max }
    }

    /// Heston characteristic function phi(u) = E[e^{iu ln S_T}],
    /// little-trap branch.
    fn char_fn(p: &ParameterSet, spot: f64, rate: f64, t: f64, u: Complex64) -> Complex64 {
        let i = Complex64::new(0.0, 1.0);
        let xi2 = p.xi * p.xi;

        let b = p.kappa - p.rho * p.xi * i * u;
        let d = (b * b + xi2 * (i * u + u * u)).sqrt();
        let g = (b - d) / (b + d);

        let exp_dt = (-d * t).exp();
        let log_term = ((1.0 - g * exp_dt) / (1.0 - g)).ln();

        let a = i * u * (spot.ln() + rate * t)
            + (p.kappa * p.theta / xi2) * ((b - d) * t - 2.0 * log_term);
        let c = (p.v0 / xi2) * (b - d) * (1.0 - exp_dt) / (1.0 - g * exp_dt);

        (a + c).exp()
    }

    /// Exercise probabilities (P1, P2) under the stock and money-market
    /// numeraires respectively.
    fn probabilities(
        &self,
        p: &ParameterSet,
        spot: f64,
        strike: f64,
        rate: f64,
        t: f64,
    ) -> EngineResult<(f64, f64)> {
        let i = Complex64::new(0.0, 1.0);
        let ln_k = strike.ln();
        // phi(-i) = E[S_T] = S*e^{rT}; used to renormalize the P1 measure
        // change without evaluating the CF at a complex pole.
        let phi_minus_i = spot * (rate * t).exp();

        let integrand = |u: f64| -> EngineResult<(f64, f64)> {
            let uc = Complex64::new(u, 0.0);
            let twist = (-i * uc * ln_k).exp() / (i * uc);
            let phi2 = Self::char_fn(p, spot, rate, t, uc);
            let phi1 = Self::char_fn(p, spot, rate, t, uc - i) / phi_minus_i;
            let v1 = (twist * phi1).re;
            let v2 = (twist * phi2).re;
            if !v1.is_finite() || !v2.is_finite() {
                return Err(EngineError::Numerical(format!(
                    "heston integrand not finite at u={u:.3}"
                )));
            }
            Ok((v1, v2))
        };

        // Truncation check on the non-oscillatory envelope |phi|/u before
        // spending the full rule; the phase factor can have a coincidental
        // zero at any single abscissa.
        let uc_max = Complex64::new(self.u_max, 0.0);
        let tail2 = Self::char_fn(p, spot, rate, t, uc_max).norm() / self.u_max;
        let tail1 =
            Self::char_fn(p, spot, rate, t, uc_max - i).norm() / (phi_minus_i * self.u_max);
        if !tail1.is_finite() || !tail2.is_finite() || tail1 > TAIL_TOL || tail2 > TAIL_TOL {
            return Err(EngineError::Numerical(format!(
                "quadrature tail above tolerance at u={:.0}: {:.2e}, {:.2e}",
                self.u_max, tail1, tail2
            )));
        }

        let mut int1 = 0.0;
        let mut int2 = 0.0;
        for &(u, w) in &self.nodes {
            let (v1, v2) = integrand(u)?;
            int1 += w * v1;
            int2 += w * v2;
        }

        let p1 = 0.5 + int1 / std::f64::consts::PI;
        let p2 = 0.5 + int2 / std::f64::consts::PI;
        if !(-0.01..=1.01).contains(&p1) || !(-0.01..=1.01).contains(&p2) {
            return Err(EngineError::Numerical(format!(
                "heston probabilities out of range: P1={p1:.4}, P2={p2:.4}"
            )));
        }
        Ok((p1.clamp(0.0, 1.0), p2.clamp(0.0, 1.0)))
    }

    /// Call value by Fourier inversion; puts via parity.
    pub fn vanilla_price(
        &self,
        p: &ParameterSet,
        spot: f64,
        rate: f64,
        strike: f64,
        t: f64,
        right: OptionRight,
    ) -> EngineResult<f64> {
        if t < 0.0 {
            return Err(EngineError::Numerical("negative time to expiry".into()));
        }
        if t == 0.0 {
            return Ok(intrinsic(spot, strike, right));
        }
        if spot <= 0.0 || strike <= 0.0 {
            return Err(EngineError::Numerical("non-positive spot/strike".into()));
        }

        let (p1, p2) = self.probabilities(p, spot, strike, rate, t)?;
        let call = spot * p1 - strike * (-rate * t).exp() * p2;
        let price = match right {
            OptionRight::Call => call,
            OptionRight::Put => call - spot + strike * (-rate * t).exp(),
        };
        // A small negative from quadrature noise is floored; anything
        // materially below zero is a numerical failure.
        if price < -1e-6 * spot {
            return Err(EngineError::Numerical(format!(
                "negative heston price {price:.6} for strike {strike}"
            )));
        }
        Ok(price.max(0.0))
    }
}

impl Default for HestonPricer {
    fn default() -> Self {
        Self::new()
    }
}

impl OptionPricer for HestonPricer {
    fn kind(&self) -> PricerKind {
        PricerKind::Heston
    }

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
                model: PricerKind::Heston,
                params_version: params.version,
            });
        }

        let right = contract.right;
        let reprice = |s: f64, sigma: f64, tau: f64, r: f64| -> EngineResult<f64> {
            let mut bumped = *params;
            bumped.v0 = sigma * sigma;
            self.vanilla_price(&bumped, s, r, strike, tau, right)
        };

        let price = self.vanilla_price(params, spot, rate, strike, t, right)?;
        let g = bump_and_reprice(&reprice, spot, params.v0.sqrt(), t, rate)?;

        Ok(PricingResult {
            contract: contract.clone(),
            price,
            delta: g.delta,
            gamma: g.gamma,
            theta: g.theta,
            vega: g.vega,
            rho: g.rho,
            model: PricerKind::Heston,
            params_version: params.version,
        })
    }
}

/// Gauss-Legendre abscissae and weights on [-1, 1], by Newton iteration on
/// the Legendre recurrence. Runs once per pricer construction.
fn gauss_legendre(n: usize) -> (Vec<f64>, Vec<f64>) {
    let mut x = vec![0.0; n];
    let mut w = vec![0.0; n];
    let m = n.div_ceil(2);
    for i in 0..m {
        // Chebyshev estimate of the i-th root, then polish.
        let mut z = (std::f64::consts::PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        loop {
            let mut p0 = 1.0_f64;
            let mut p1 = 0.0_f64;
            for j in 0..n {
                let p2 = p1;
                p1 = p0;
                p0 = ((2 * j + 1) as f64 * z * p1 - j as f64 * p2) / (j + 1) as f64;
            }
            // p0 = P_n(z), p1 = P_{n-1}(z)
            let dp = n as f64 * (z * p0 - p1) / (z * z - 1.0);
            let z_prev = z;
            z -= p0 / dp;
            if (z - z_prev).abs() < 1e-14 {
                x[i] = -z;
                x[n - 1 - i] = z;
                w[i] = 2.0 / ((1.0 - z * z) * dp * dp);
                w[n - 1 - i] = w[i];
                break;
            }
        }
    }
    (x, w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::black_scholes::bs_price;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn params(kappa: f64, theta: f64, xi: f64, rho: f64, v0: f64) -> ParameterSet {
        let mut p = ParameterSet::seed();
        p.kappa = kappa;
        p.theta = theta;
        p.xi = xi;
        p.rho = rho;
        p.v0 = v0;
        p
    }

    #[test]
    fn quadrature_integrates_polynomials_exactly() {
        let (xs, ws) = gauss_legendre(16);
        // Int_{-1}^{1} x^4 dx = 2/5
        let s: f64 = xs.iter().zip(&ws).map(|(x, w)| w * x.powi(4)).sum();
        assert_relative_eq!(s, 0.4, epsilon = 1e-12);
        // Weights sum to the interval length
        assert_relative_eq!(ws.iter().sum::<f64>(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn degenerates_to_black_scholes_as_vol_of_vol_vanishes() {
        // With xi ~ 0 and v0 = theta the variance path is flat at v0, so the
        // model must collapse to Black-Scholes with sigma = sqrt(v0).
        let pricer = HestonPricer::new();
        let p = params(2.0, 0.04, 1e-3, 0.0, 0.04);
        for (strike, t) in [(100.0, 0.5), (110.0, 0.25), (95.0, 1.0)] {
            let heston = pricer
                .vanilla_price(&p, 100.0, 0.03, strike, t, OptionRight::Call)
                .unwrap();
            let bs = bs_price(100.0, strike, t, 0.03, 0.2, OptionRight::Call);
            assert_relative_eq!(heston, bs, epsilon = 1e-3);
        }
    }

    #[test]
    fn put_call_parity_holds() {
        let pricer = HestonPricer::new();
        let p = params(1.5, 0.05, 0.4, -0.6, 0.045);
        let (s, k, r, t) = (5000.0, 5100.0, 0.04, 0.25);
        let call = pricer
            .vanilla_price(&p, s, r, k, t, OptionRight::Call)
            .unwrap();
        let put = pricer
            .vanilla_price(&p, s, r, k, t, OptionRight::Put)
            .unwrap();
        assert_relative_eq!(call - put, s - k * (-r * t).exp(), epsilon = 1e-4 * s);
    }

    #[test]
    fn expiry_day_price_is_intrinsic() {
        let pricer = HestonPricer::new();
        let expiry = NaiveDate::from_ymd_opt(2026, 3, 20).unwrap();
        let now = expiry.and_hms_opt(14, 0, 0).unwrap().and_utc();
        let c = OptionContract::new("SPX", OptionRight::Put, 5200.0, expiry);
        let r = pricer
            .price(&params(2.0, 0.04, 0.3, -0.7, 0.04), 5000.0, 0.04, &c, now)
            .unwrap();
        assert_relative_eq!(r.price, 200.0, epsilon = 1e-9);
        assert_eq!(r.delta, -1.0);
        assert_eq!(r.vega, 0.0);
        assert_eq!(r.theta, 0.0);
    }

    #[test]
    fn greeks_have_sane_signs_for_atm_call() {
        let pricer = HestonPricer::new();
        let expiry = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let now = NaiveDate::from_ymd_opt(2026, 8, 21)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        let c = OptionContract::new("SPX", OptionRight::Call, 5000.0, expiry);
        let r = pricer
            .price(&params(2.0, 0.04, 0.3, -0.7, 0.04), 5000.0, 0.04, &c, now)
            .unwrap();
        assert!(r.price > 0.0);
        assert!(r.delta > 0.3 && r.delta < 0.8, "delta={}", r.delta);
        assert!(r.gamma > 0.0);
        assert!(r.vega > 0.0);
        assert!(r.theta < 0.0, "theta={}", r.theta);
    }

    #[test]
    fn equity_skew_prices_otm_puts_over_symmetric_model() {
        // Negative spot/vol correlation fattens the left tail, so an OTM put
        // must be worth more than under rho = 0, all else equal.
        let pricer = HestonPricer::new();
        let skewed = params(2.0, 0.04, 0.5, -0.8, 0.04);
        let flat = params(2.0, 0.04, 0.5, 0.0, 0.04);
        let (s, k, r, t) = (100.0, 85.0, 0.03, 0.25);
        let p_skew = pricer
            .vanilla_price(&skewed, s, r, k, t, OptionRight::Put)
            .unwrap();
        let p_flat = pricer
            .vanilla_price(&flat, s, r, k, t, OptionRight::Put)
            .unwrap();
        assert!(
            p_skew > p_flat,
            "skewed put {p_skew:.4} should exceed symmetric {p_flat:.4}"
        );
    }

    #[test]
    fn undersized_truncation_fails_loudly() {
        // At u_max = 5 the characteristic function has barely decayed, so
        // the envelope check must reject the valuation rather than integrate
        // a truncated tail.
        let pricer = HestonPricer::with_quadrature(64, 5.0);
        let p = params(2.0, 0.04, 0.3, -0.7, 0.04);
        let out = pricer.vanilla_price(&p, 5000.0, 0.04, 5000.0, 0.25, OptionRight::Call);
        assert!(out.is_err(), "truncated rule must not price silently");
    }

    #[test]
    fn longer_expiry_is_worth_more() {
        let pricer = HestonPricer::new();
        let p = params(2.0, 0.04, 0.3, -0.7, 0.04);
        let short = pricer
            .vanilla_price(&p, 5000.0, 0.04, 5000.0, 14.0 / 365.0, OptionRight::Call)
            .unwrap();
        let long = pricer
            .vanilla_price(&p, 5000.0, 0.04, 5000.0, 45.0 / 365.0, OptionRight::Call)
            .unwrap();
        assert!(long > short);
    }
}
