//! Portfolio tier: aggregate greek exposure and parametric VaR against the
//! whole book, including the marginal effect of the proposed trade.

use super::{
    AlertVec, RiskAction, RiskAlert, RiskContext, RiskLevel, RiskTier, RiskTierKind,
    TierAssessment,
};
use crate::domain::CONTRACT_MULTIPLIER;
use statrs::distribution::{ContinuousCDF, Normal};

pub struct PortfolioTier {
    pub max_net_delta: f64,
    pub max_net_gamma: f64,
    pub var_confidence: f64,
    pub max_var_pct: f64,
    /// z-quantile for the configured VaR confidence, precomputed.
    z: f64,
}

impl PortfolioTier {
    pub fn new(max_net_delta: f64, max_net_gamma: f64, var_confidence: f64, max_var_pct: f64) -> Self {
        let normal = Normal::new(0.0, 1.0).unwrap_or(Normal::standard());
        Self {
            max_net_delta,
            max_net_gamma,
            var_confidence,
            max_var_pct,
            z: normal.inverse_cdf(var_confidence),
        }
    }

    /// One-day parametric VaR: z * sigma_daily * portfolio value.
    pub fn value_at_risk(&self, portfolio_value: f64, daily_vol: f64) -> f64 {
        self.z * daily_vol * portfolio_value.max(0.0)
    }
}

impl RiskTier for PortfolioTier {
    fn assess(&self, ctx: &RiskContext) -> TierAssessment {
        let mut alerts = AlertVec::new();

        // Net exposure including the proposal's marginal greeks.
        let (mut net_delta, mut net_gamma) = (ctx.net_delta, ctx.net_gamma);
        if let Some(trade) = ctx.proposed {
            let qty = trade.quantity as f64 * CONTRACT_MULTIPLIER;
            net_delta += qty * trade.delta;
            net_gamma += qty * trade.gamma;
        }

        if net_delta.abs() > self.max_net_delta {
            let severity = if net_delta.abs() > 2.0 * self.max_net_delta {
                RiskLevel::High
            } else {
                RiskLevel::Elevated
            };
            alerts.push(RiskAlert {
                tier: RiskTierKind::Portfolio,
                severity,
                action: RiskAction::Hedge,
                metric: "net_delta",
                value: net_delta,
                limit: self.max_net_delta,
                message: format!(
                    "net delta {net_delta:.0} outside +/-{:.0}",
                    self.max_net_delta
                ),
            });
        }

        if net_gamma.abs() > self.max_net_gamma {
            alerts.push(RiskAlert {
                tier: RiskTierKind::Portfolio,
                severity: RiskLevel::Elevated,
                action: RiskAction::Reduce,
                metric: "net_gamma",
                value: net_gamma,
                limit: self.max_net_gamma,
                message: format!(
                    "net gamma {net_gamma:.1} outside +/-{:.0}",
                    self.max_net_gamma
                ),
            });
        }

        let var = self.value_at_risk(ctx.portfolio_value, ctx.portfolio_daily_vol);
        let var_limit = self.max_var_pct * ctx.portfolio_value.max(0.0);
        if var_limit > 0.0 && var > var_limit {
            let severity = if var > 2.0 * var_limit {
                RiskLevel::Critical
            } else {
                RiskLevel::High
            };
            let action = if severity == RiskLevel::Critical {
                RiskAction::Halt
            } else {
                RiskAction::Reduce
            };
            alerts.push(RiskAlert {
                tier: RiskTierKind::Portfolio,
                severity,
                action,
                metric: "value_at_risk",
                value: var,
                limit: var_limit,
                message: format!(
                    "{:.0}% one-day VaR {var:.0} exceeds limit {var_limit:.0}",
                    self.var_confidence * 100.0
                ),
            });
        }

        TierAssessment {
            tier: RiskTierKind::Portfolio,
            alerts,
            confidence: 1.0,
        }
    }
}
