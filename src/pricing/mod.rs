//! Valuation models behind a single trait so the engine stays
//! model-agnostic: the Heston Fourier pricer is the production model, the
//! Black-Scholes pricer is the closed-form reference used for sanity checks
//! and as a fallback configuration.

pub mod black_scholes;
pub mod greeks;
pub mod heston;

use crate::domain::{OptionContract, ParameterSet};
use crate::errors::EngineResult;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PricerKind {
    Heston,
    BlackScholes,
}

/// Theoretical value plus sensitivities for one contract.
/// Carries the parameter version so stale valuations are traceable.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PricingResult {
    pub contract: OptionContract,
    pub price: f64,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
    pub model: PricerKind,
    pub params_version: u64,
}

/// A pricing model. Implementations must be pure with respect to their
/// inputs: same (params, market, contract, now) always yields the same
/// result, with no interior mutability.
pub trait OptionPricer: Send + Sync {
    fn kind(&self) -> PricerKind;

    fn price(
        &self,
        params: &ParameterSet,
        spot: f64,
        rate: f64,
        contract: &OptionContract,
        now: DateTime<Utc>,
    ) -> EngineResult<PricingResult>;
}

/// Intrinsic value at expiry.
pub(crate) fn intrinsic(spot: f64, strike: f64, right: crate::domain::OptionRight) -> f64 {
    match right {
        crate::domain::OptionRight::Call => (spot - strike).max(0.0),
        crate::domain::OptionRight::Put => (strike - spot).max(0.0),
    }
}
