//! Risk aggregation: runs every tier, takes the worst-case severity and
//! the strongest recommended action, and attaches a confidence score that
//! reflects how trustworthy the inputs were.

use super::compliance::ComplianceTier;
use super::portfolio::PortfolioTier;
use super::position::PositionTier;
use super::{
    AlertVec, RiskAction, RiskAssessment, RiskContext, RiskLevel, RiskTier, TierAssessment,
};
use crate::config::AppConfig;
use chrono::Utc;

pub struct RiskEngine {
    position: PositionTier,
    portfolio: PortfolioTier,
    compliance: ComplianceTier,
    /// Normalized tier confidence weights: position, portfolio, compliance.
    weights: [f64; 3],
}

impl RiskEngine {
    pub fn new(cfg: &AppConfig) -> Self {
        Self {
            position: PositionTier {
                max_position_notional: cfg.max_position_notional,
                max_concentration_pct: cfg.max_concentration_pct,
                stop_loss_pct: cfg.stop_loss_pct,
                take_profit_pct: cfg.take_profit_pct,
            },
            portfolio: PortfolioTier::new(
                cfg.max_portfolio_delta,
                cfg.max_portfolio_gamma,
                cfg.var_confidence,
                cfg.max_var_pct,
            ),
            compliance: ComplianceTier {
                max_daily_loss: cfg.max_daily_loss,
                max_contracts_total: cfg.max_contracts_total,
                max_contracts_per_name: cfg.max_contracts_per_name,
            },
            weights: cfg.normalized_risk_weights(),
        }
    }

    pub fn assess(&self, ctx: &RiskContext) -> RiskAssessment {
        let tiers = [
            self.position.assess(ctx),
            self.portfolio.assess(ctx),
            self.compliance.assess(ctx),
        ];
        aggregate(&tiers, self.weights, ctx.data_quality.factor())
    }
}

/// Worst-case aggregation. Severity is the max across all alerts, never an
/// average: one critical breach dominates any number of clean checks. The
/// action follows the same rule through its precedence ordering.
pub fn aggregate(
    tiers: &[TierAssessment],
    weights: [f64; 3],
    data_quality_factor: f64,
) -> RiskAssessment {
    let level = tiers
        .iter()
        .map(|t| t.severity())
        .max()
        .unwrap_or(RiskLevel::Normal);
    let action = tiers
        .iter()
        .map(|t| t.action())
        .max()
        .unwrap_or(RiskAction::Allow);

    let weighted: f64 = tiers
        .iter()
        .zip(weights.iter())
        .map(|(t, w)| w * t.confidence)
        .sum();
    let confidence = (weighted * data_quality_factor).clamp(0.0, 1.0);

    let mut alerts = AlertVec::new();
    for t in tiers {
        alerts.extend(t.alerts.iter().cloned());
    }

    RiskAssessment {
        level,
        action,
        alerts,
        confidence,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Position;
    use crate::risk::{DataQuality, RiskAlert, RiskTierKind};

    fn cfg() -> AppConfig {
        AppConfig::from_env().unwrap()
    }

    fn tier_with(severity: Option<(RiskLevel, RiskAction)>, kind: RiskTierKind) -> TierAssessment {
        let alerts = severity
            .map(|(sev, act)| {
                smallvec::smallvec![RiskAlert {
                    tier: kind,
                    severity: sev,
                    action: act,
                    metric: "test_metric",
                    value: 1.0,
                    limit: 0.5,
                    message: "test".into(),
                }]
            })
            .unwrap_or_default();
        TierAssessment {
            tier: kind,
            alerts,
            confidence: 1.0,
        }
    }

    fn ctx<'a>(positions: &'a [Position], daily_pnl: f64, staleness: f64) -> RiskContext<'a> {
        RiskContext {
            positions,
            proposed: None,
            portfolio_value: 100_000.0,
            daily_pnl,
            net_delta: 30_000.0,
            net_gamma: 100.0,
            portfolio_daily_vol: 0.02,
            spot: 5000.0,
            data_quality: DataQuality {
                staleness_factor: staleness,
                total_quotes: 20,
                usable_quotes: 20,
            },
        }
    }

    #[test]
    fn aggregation_is_worst_case_not_average() {
        // Two clean tiers cannot dilute one critical tier.
        let tiers = [
            tier_with(None, RiskTierKind::Position),
            tier_with(None, RiskTierKind::Portfolio),
            tier_with(
                Some((RiskLevel::Critical, RiskAction::Halt)),
                RiskTierKind::Compliance,
            ),
        ];
        let out = aggregate(&tiers, [1.0 / 3.0; 3], 1.0);
        assert_eq!(out.level, RiskLevel::Critical);
        assert_eq!(out.action, RiskAction::Halt);
    }

    #[test]
    fn severity_is_monotone_in_tier_severity() {
        // Raising any single tier's severity never lowers the aggregate.
        let levels = [
            RiskLevel::Normal,
            RiskLevel::Elevated,
            RiskLevel::High,
            RiskLevel::Critical,
        ];
        let mut prev = RiskLevel::Normal;
        for lvl in levels {
            let tiers = [
                tier_with(None, RiskTierKind::Position),
                tier_with(Some((lvl, RiskAction::Allow)), RiskTierKind::Portfolio),
                tier_with(None, RiskTierKind::Compliance),
            ];
            let out = aggregate(&tiers, [1.0 / 3.0; 3], 1.0);
            assert!(out.level >= prev, "{:?} regressed below {:?}", out.level, prev);
            prev = out.level;
        }
    }

    #[test]
    fn action_precedence_hedge_overrides_reduce() {
        let tiers = [
            tier_with(
                Some((RiskLevel::Elevated, RiskAction::Reduce)),
                RiskTierKind::Position,
            ),
            tier_with(
                Some((RiskLevel::Elevated, RiskAction::Hedge)),
                RiskTierKind::Portfolio,
            ),
            tier_with(None, RiskTierKind::Compliance),
        ];
        let out = aggregate(&tiers, [1.0 / 3.0; 3], 1.0);
        assert_eq!(out.action, RiskAction::Hedge);
        assert_eq!(out.level, RiskLevel::Elevated);
        assert_eq!(out.alerts.len(), 2);
    }

    #[test]
    fn healthy_book_normal_allow() {
        // $100k portfolio, +$1.5k on the day, modest delta: every tier clean.
        let engine = RiskEngine::new(&cfg());
        let positions = vec![Position {
            contract: crate::domain::OptionContract::new(
                "SPX",
                crate::domain::OptionRight::Call,
                5000.0,
                chrono::NaiveDate::from_ymd_opt(2026, 9, 18).unwrap(),
            ),
            quantity: 10,
            avg_price: 50.0,
            realized_pnl: 0.0,
            unrealized_pnl: 600.0,
        }];
        let out = engine.assess(&ctx(&positions, 1_500.0, 1.0));
        assert_eq!(out.level, RiskLevel::Normal);
        assert_eq!(out.action, RiskAction::Allow);
        assert!(out.alerts.is_empty(), "{:?}", out.alerts);
        assert!((out.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn stale_data_degrades_confidence_not_severity() {
        let engine = RiskEngine::new(&cfg());
        let fresh = engine.assess(&ctx(&[], 0.0, 1.0));
        let stale = engine.assess(&ctx(&[], 0.0, 0.25));
        assert_eq!(fresh.level, stale.level);
        assert!(stale.confidence < fresh.confidence);
        assert!((stale.confidence - 0.25).abs() < 1e-9);
    }
}
