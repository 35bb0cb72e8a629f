//! Heston surface calibration.
//!
//! Weighted least-squares fit of the five Heston parameters to the
//! implied-vol surface, warm-started from the previous accepted set with a
//! Tikhonov pull toward it. Acceptance is a quality gate: a fit whose RMSE
//! exceeds the configured threshold never reaches the live pricing path,
//! the engine keeps trading on the prior set instead.

use crate::config::AppConfig;
use crate::domain::{MarketSnapshot, OptionRight, ParameterSet, PARAM_BOUNDS};
use crate::optimizer::{nelder_mead, OptimOptions};
use crate::pricing::black_scholes::implied_volatility;
use crate::pricing::heston::HestonPricer;
use crate::state::EngineEvent;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// One implied-vol observation entering the fit.
#[derive(Debug, Clone, Copy)]
pub struct SurfacePoint {
    pub strike: f64,
    pub expiry_years: f64,
    pub market_iv: f64,
    /// Liquidity weight (volume based), normalized inside the objective.
    pub weight: f64,
}

#[derive(Debug, Clone)]
pub struct CalibrationOutcome {
    pub accepted: bool,
    /// The new set when accepted, the prior otherwise.
    pub params: ParameterSet,
    pub rmse: f64,
    pub iterations: usize,
    pub reason: Option<String>,
}

/// Penalty value for parameter vectors the pricer cannot evaluate.
const OBJECTIVE_PENALTY: f64 = 10.0;
/// Base Tikhonov strength; scaled adaptively by recent fit quality.
const ALPHA_0: f64 = 1e-4;
/// Reference residual for the adaptive scaling (2 vol points).
const RESID_REF: f64 = 0.02;
/// Minimum observations for a five-parameter fit.
const MIN_SURFACE_POINTS: usize = 5;

pub struct Calibrator {
    pricer: HestonPricer,
    rmse_threshold: f64,
    last_rmse: Option<f64>,
    pub rejections: u64,
}

impl Calibrator {
    pub fn new(rmse_threshold: f64) -> Self {
        Self {
            pricer: HestonPricer::new(),
            rmse_threshold,
            last_rmse: None,
            rejections: 0,
        }
    }

    /// Weighted implied-vol RMSE of a candidate vector against the surface.
    /// Points the model cannot reprice contribute the penalty value, so a
    /// region of parameter space that breaks the pricer is steered around
    /// rather than crashed into.
    fn surface_rmse(&self, x: &[f64; 5], surface: &[SurfacePoint], spot: f64, rate: f64) -> f64 {
        let params = ParameterSet {
            kappa: x[0],
            theta: x[1],
            xi: x[2],
            rho: x[3],
            v0: x[4],
            rmse: f64::NAN,
            version: 0,
            calibrated_at: Utc::now(),
        };

        let mut num = 0.0;
        let mut den = 0.0;
        for pt in surface {
            let err = match self
                .pricer
                .vanilla_price(&params, spot, rate, pt.strike, pt.expiry_years, OptionRight::Call)
                .and_then(|price| {
                    implied_volatility(price, spot, pt.strike, pt.expiry_years, rate, OptionRight::Call)
                }) {
                Ok(model_iv) => model_iv - pt.market_iv,
                Err(_) => OBJECTIVE_PENALTY,
            };
            num += pt.weight * err * err;
            den += pt.weight;
        }
        if den <= 0.0 {
            return OBJECTIVE_PENALTY;
        }
        (num / den).sqrt()
    }

    /// Fit the surface, warm-starting from `prior`.
    pub fn calibrate(
        &mut self,
        surface: &[SurfacePoint],
        spot: f64,
        rate: f64,
        prior: &ParameterSet,
        now: DateTime<Utc>,
    ) -> CalibrationOutcome {
        if surface.len() < MIN_SURFACE_POINTS {
            self.rejections += 1;
            return CalibrationOutcome {
                accepted: false,
                params: *prior,
                rmse: f64::NAN,
                iterations: 0,
                reason: Some(format!(
                    "insufficient surface: {} points, need {MIN_SURFACE_POINTS}",
                    surface.len()
                )),
            };
        }

        // Adaptive regularization: trust the prior more when recent fits
        // have been tight, less when they have been loose.
        let alpha = match self.last_rmse {
            Some(r) => ALPHA_0 * (r * r) / (RESID_REF * RESID_REF),
            None => ALPHA_0,
        };
        let prior_x = prior.as_array();

        let objective = |x: &[f64; 5]| -> f64 {
            let rmse = self.surface_rmse(x, surface, spot, rate);
            let mut reg = 0.0;
            for d in 0..5 {
                let scale = PARAM_BOUNDS[d].1 - PARAM_BOUNDS[d].0;
                let z = (x[d] - prior_x[d]) / scale;
                reg += z * z;
            }
            rmse + alpha * reg
        };

        let out = nelder_mead(
            objective,
            prior_x,
            &PARAM_BOUNDS,
            OptimOptions {
                max_iters: 200,
                tol: 1e-10,
            },
        );
        let rmse = self.surface_rmse(&out.x, surface, spot, rate);

        if rmse > self.rmse_threshold || !rmse.is_finite() {
            self.rejections += 1;
            return CalibrationOutcome {
                accepted: false,
                params: *prior,
                rmse,
                iterations: out.iterations,
                reason: Some(format!(
                    "rmse {:.4} above threshold {:.4} (converged={})",
                    rmse, self.rmse_threshold, out.converged
                )),
            };
        }

        match ParameterSet::validated(out.x, rmse, prior.version + 1, now) {
            Ok(params) => {
                if !params.feller_satisfied() {
                    tracing::warn!(
                        kappa = params.kappa,
                        theta = params.theta,
                        xi = params.xi,
                        "accepted parameters violate the Feller condition"
                    );
                }
                self.last_rmse = Some(rmse);
                CalibrationOutcome {
                    accepted: true,
                    params,
                    rmse,
                    iterations: out.iterations,
                    reason: None,
                }
            }
            Err(e) => {
                self.rejections += 1;
                CalibrationOutcome {
                    accepted: false,
                    params: *prior,
                    rmse,
                    iterations: out.iterations,
                    reason: Some(format!("validation failed: {e}")),
                }
            }
        }
    }
}

/// Extract the calibration surface from a snapshot: liquid two-sided call
/// quotes in the tradeable moneyness and expiry window, volume-weighted.
pub fn build_surface(snapshot: &MarketSnapshot, cfg: &AppConfig) -> Vec<SurfacePoint> {
    let now = snapshot.timestamp;
    let mut points: Vec<SurfacePoint> = snapshot
        .quotes
        .iter()
        .filter(|(c, q)| {
            let dte = c.days_to_expiry(now);
            let moneyness = snapshot.spot / c.strike();
            c.right == OptionRight::Call
                && q.is_two_sided()
                && q.volume > 0
                && q.implied_vol > 0.01
                && q.implied_vol < 2.0
                && dte >= cfg.min_dte_days
                && dte <= cfg.max_dte_days
                && (0.85..=1.15).contains(&moneyness)
        })
        .map(|(c, q)| SurfacePoint {
            strike: c.strike(),
            expiry_years: c.year_fraction(now),
            market_iv: q.implied_vol,
            weight: (q.volume as f64).max(1.0),
        })
        .collect();
    // Deterministic ordering, useful for reproducible objective values.
    points.sort_by(|a, b| {
        a.expiry_years
            .total_cmp(&b.expiry_years)
            .then(a.strike.total_cmp(&b.strike))
    });
    points
}

/// Slow-cycle calibration task. Pulls the latest snapshot, fits off the
/// async runtime on the blocking pool, and publishes accepted sets through
/// the watch channel the fast cycle reads. Never blocks pricing.
pub async fn run_calibration(
    cfg: AppConfig,
    snapshot_rx: watch::Receiver<Option<Arc<MarketSnapshot>>>,
    params_tx: watch::Sender<ParameterSet>,
    engine_tx: mpsc::Sender<EngineEvent>,
) {
    tracing::info!(
        interval_secs = cfg.calibration_interval_secs,
        rmse_threshold = cfg.calibration_rmse_threshold,
        "calibration task started"
    );

    let mut cal = Calibrator::new(cfg.calibration_rmse_threshold);
    let mut interval =
        tokio::time::interval(tokio::time::Duration::from_secs(cfg.calibration_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let snapshot = match snapshot_rx.borrow().clone() {
            Some(s) => s,
            None => {
                tracing::debug!("no snapshot yet, skipping calibration");
                continue;
            }
        };

        let surface = build_surface(&snapshot, &cfg);
        let prior = *params_tx.borrow();
        let spot = snapshot.spot;
        let rate = snapshot.risk_free_rate;
        let now = Utc::now();

        let joined = tokio::task::spawn_blocking(move || {
            let outcome = cal.calibrate(&surface, spot, rate, &prior, now);
            (cal, outcome)
        })
        .await;

        let outcome = match joined {
            Ok((c, outcome)) => {
                cal = c;
                outcome
            }
            Err(e) => {
                tracing::error!(error = %e, "calibration task panicked, resetting calibrator");
                cal = Calibrator::new(cfg.calibration_rmse_threshold);
                continue;
            }
        };

        if outcome.accepted {
            tracing::info!(
                version = outcome.params.version,
                rmse = outcome.rmse,
                iterations = outcome.iterations,
                kappa = outcome.params.kappa,
                theta = outcome.params.theta,
                xi = outcome.params.xi,
                rho = outcome.params.rho,
                v0 = outcome.params.v0,
                "calibration accepted"
            );
            params_tx.send_replace(outcome.params);
        } else {
            tracing::warn!(
                rmse = outcome.rmse,
                reason = outcome.reason.as_deref().unwrap_or("unknown"),
                "calibration rejected, keeping prior parameters"
            );
        }

        if engine_tx
            .send(EngineEvent::CalibrationFinished(Box::new(outcome)))
            .await
            .is_err()
        {
            tracing::error!("engine channel closed, calibration task shutting down");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::heston::HestonPricer;
    use approx::assert_relative_eq;

    fn truth() -> ParameterSet {
        let mut p = ParameterSet::seed();
        p.kappa = 2.0;
        p.theta = 0.04;
        p.xi = 0.3;
        p.rho = -0.7;
        p.v0 = 0.045;
        p.version = 3;
        p
    }

    /// Surface generated exactly by a known parameter set: price every
    /// point with the model, invert to implied vol.
    fn exact_surface(p: &ParameterSet, spot: f64, rate: f64) -> Vec<SurfacePoint> {
        let pricer = HestonPricer::new();
        let mut pts = Vec::new();
        for t in [14.0 / 365.0, 30.0 / 365.0, 45.0 / 365.0] {
            for rel in [0.90, 0.95, 1.0, 1.05, 1.10] {
                let strike = spot * rel;
                let price = pricer
                    .vanilla_price(p, spot, rate, strike, t, OptionRight::Call)
                    .unwrap();
                let iv = implied_volatility(price, spot, strike, t, rate, OptionRight::Call)
                    .unwrap();
                pts.push(SurfacePoint {
                    strike,
                    expiry_years: t,
                    market_iv: iv,
                    weight: 100.0,
                });
            }
        }
        pts
    }

    #[test]
    fn refitting_an_exact_surface_is_a_fixed_point() {
        let p = truth();
        let (spot, rate) = (5000.0, 0.04);
        let surface = exact_surface(&p, spot, rate);

        let mut cal = Calibrator::new(0.05);
        let out = cal.calibrate(&surface, spot, rate, &p, Utc::now());

        assert!(out.accepted, "reason: {:?}", out.reason);
        assert!(out.rmse < 1e-3, "rmse={}", out.rmse);
        assert_eq!(out.params.version, p.version + 1);
        assert_relative_eq!(out.params.kappa, p.kappa, max_relative = 0.05);
        assert_relative_eq!(out.params.theta, p.theta, max_relative = 0.05);
        assert_relative_eq!(out.params.v0, p.v0, max_relative = 0.05);
        assert_relative_eq!(out.params.rho, p.rho, max_relative = 0.05);
    }

    #[test]
    fn sparse_surface_is_rejected_and_prior_retained() {
        let p = truth();
        let mut cal = Calibrator::new(0.05);
        let surface = vec![SurfacePoint {
            strike: 5000.0,
            expiry_years: 0.1,
            market_iv: 0.2,
            weight: 1.0,
        }];
        let out = cal.calibrate(&surface, 5000.0, 0.04, &p, Utc::now());
        assert!(!out.accepted);
        assert_eq!(out.params.version, p.version);
        assert_eq!(cal.rejections, 1);
    }

    #[test]
    fn garbage_surface_fails_quality_gate() {
        // Implied vols no Heston fit can reproduce within threshold:
        // alternating 5% / 150% across adjacent strikes.
        let p = truth();
        let mut cal = Calibrator::new(0.05);
        let mut surface = Vec::new();
        for (i, rel) in [0.90, 0.95, 1.0, 1.05, 1.10].iter().enumerate() {
            surface.push(SurfacePoint {
                strike: 5000.0 * rel,
                expiry_years: 30.0 / 365.0,
                market_iv: if i % 2 == 0 { 0.05 } else { 1.5 },
                weight: 1.0,
            });
        }
        let out = cal.calibrate(&surface, 5000.0, 0.04, &p, Utc::now());
        assert!(!out.accepted);
        assert_eq!(out.params.version, p.version, "prior must be retained");
    }

    #[test]
    fn surface_extraction_filters_and_orders() {
        use crate::domain::{OptionContract, OptionQuote};
        use chrono::NaiveDate;
        use std::collections::HashMap;

        let cfg = test_config();
        let now = NaiveDate::from_ymd_opt(2026, 8, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();

        let mut quotes = HashMap::new();
        let good = OptionContract::new(
            "SPX",
            OptionRight::Call,
            5000.0,
            NaiveDate::from_ymd_opt(2026, 8, 21).unwrap(),
        );
        quotes.insert(
            good.clone(),
            OptionQuote {
                bid: 50.0,
                ask: 52.0,
                last: 51.0,
                volume: 120,
                open_interest: 500,
                implied_vol: 0.18,
            },
        );
        // Put: excluded from the fit.
        quotes.insert(
            OptionContract::new("SPX", OptionRight::Put, 5000.0, good.expiry),
            OptionQuote {
                bid: 40.0,
                ask: 42.0,
                last: 41.0,
                volume: 80,
                open_interest: 300,
                implied_vol: 0.19,
            },
        );
        // Expiring tomorrow: outside the DTE window.
        quotes.insert(
            OptionContract::new(
                "SPX",
                OptionRight::Call,
                5000.0,
                NaiveDate::from_ymd_opt(2026, 8, 2).unwrap(),
            ),
            OptionQuote {
                bid: 20.0,
                ask: 21.0,
                last: 20.5,
                volume: 200,
                open_interest: 100,
                implied_vol: 0.17,
            },
        );

        let snapshot = MarketSnapshot {
            version: 1,
            underlying: "SPX".into(),
            spot: 5000.0,
            risk_free_rate: 0.04,
            timestamp: now,
            quotes,
        };
        let surface = build_surface(&snapshot, &cfg);
        assert_eq!(surface.len(), 1);
        assert_relative_eq!(surface[0].market_iv, 0.18);
        assert_relative_eq!(surface[0].weight, 120.0);
    }

    fn test_config() -> AppConfig {
        let mut cfg = AppConfig::from_env().unwrap();
        cfg.min_dte_days = 7;
        cfg.max_dte_days = 45;
        cfg
    }
}
