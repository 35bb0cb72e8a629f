use crate::errors::EngineResult;

/// Relative bump size shared by the spot, vol and time ladders.
const REL_BUMP: f64 = 1e-4;
/// Absolute bump for the rate (a relative bump degenerates at r = 0).
const RATE_BUMP: f64 = 1e-4;

/// Sensitivities produced by central finite differences.
#[derive(Debug, Clone, Copy)]
pub struct GreekSet {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
}

/// Central-difference greeks for any model exposed as a reprice closure
/// `f(spot, vol, t, rate) -> price`. Vol here is the instantaneous vol
/// sqrt(v0); callers translate bumps back into their parameter space.
///
/// Theta is reported per year with the usual sign convention
/// (theta = -dV/dT), so a long option decaying over time shows negative.
pub fn bump_and_reprice<F>(
    f: &F,
    spot: f64,
    sigma: f64,
    t: f64,
    rate: f64,
) -> EngineResult<GreekSet>
where
    F: Fn(f64, f64, f64, f64) -> EngineResult<f64>,
{
    let base = f(spot, sigma, t, rate)?;

    let hs = spot * REL_BUMP;
    let up = f(spot + hs, sigma, t, rate)?;
    let dn = f(spot - hs, sigma, t, rate)?;
    let delta = (up - dn) / (2.0 * hs);
    let gamma = (up - 2.0 * base + dn) / (hs * hs);

    let hv = sigma * REL_BUMP;
    let vega = (f(spot, sigma + hv, t, rate)? - f(spot, sigma - hv, t, rate)?) / (2.0 * hv);

    let ht = t * REL_BUMP;
    let theta = -(f(spot, sigma, t + ht, rate)? - f(spot, sigma, t - ht, rate)?) / (2.0 * ht);

    let rho =
        (f(spot, sigma, t, rate + RATE_BUMP)? - f(spot, sigma, t, rate - RATE_BUMP)?) / (2.0 * RATE_BUMP);

    Ok(GreekSet {
        delta,
        gamma,
        theta,
        vega,
        rho,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OptionRight;
    use crate::pricing::black_scholes::bs_price;
    use approx::assert_relative_eq;
    use statrs::distribution::{Continuous, ContinuousCDF, Normal};

    /// Finite differences on Black-Scholes must reproduce the analytic
    /// greeks; this pins the bump machinery independently of Heston.
    #[test]
    fn matches_analytic_black_scholes_greeks() {
        let (s, k, t, r, sigma) = (5000.0, 5100.0, 0.25, 0.04, 0.2);
        let f = |spot: f64, vol: f64, tau: f64, rate: f64| -> EngineResult<f64> {
            Ok(bs_price(spot, k, tau, rate, vol, OptionRight::Call))
        };
        let g = bump_and_reprice(&f, s, sigma, t, r).unwrap();

        let normal = Normal::new(0.0, 1.0).unwrap();
        let sqrt_t = t.sqrt();
        let d1 = ((s / k).ln() + (r + 0.5 * sigma * sigma) * t) / (sigma * sqrt_t);
        let d2 = d1 - sigma * sqrt_t;
        let disc = (-r * t).exp();

        assert_relative_eq!(g.delta, normal.cdf(d1), max_relative = 1e-5);
        assert_relative_eq!(
            g.gamma,
            normal.pdf(d1) / (s * sigma * sqrt_t),
            max_relative = 1e-3
        );
        assert_relative_eq!(g.vega, s * normal.pdf(d1) * sqrt_t, max_relative = 1e-5);
        assert_relative_eq!(
            g.theta,
            -(s * normal.pdf(d1) * sigma) / (2.0 * sqrt_t) - r * k * disc * normal.cdf(d2),
            max_relative = 1e-4
        );
        assert_relative_eq!(g.rho, k * t * disc * normal.cdf(d2), max_relative = 1e-5);
    }

    #[test]
    fn propagates_reprice_failures() {
        let f = |_: f64, _: f64, _: f64, _: f64| -> EngineResult<f64> {
            Err(crate::errors::EngineError::Numerical("boom".into()))
        };
        assert!(bump_and_reprice(&f, 100.0, 0.2, 0.5, 0.03).is_err());
    }
}
