//! Position tier: per-position notional, single-name concentration and
//! stop-loss/take-profit distance, including the position the proposed
//! trade would create.

use super::{
    AlertVec, ProposedTrade, RiskAction, RiskAlert, RiskContext, RiskLevel, RiskTier,
    RiskTierKind, TierAssessment,
};
use crate::domain::{Position, CONTRACT_MULTIPLIER};

pub struct PositionTier {
    pub max_position_notional: f64,
    pub max_concentration_pct: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
}

impl PositionTier {
    fn check_notional(&self, alerts: &mut AlertVec, notional: f64, label: &str) {
        if notional > self.max_position_notional {
            // Escalate with the size of the breach.
            let severity = if notional > 2.0 * self.max_position_notional {
                RiskLevel::Critical
            } else if notional > 1.5 * self.max_position_notional {
                RiskLevel::High
            } else {
                RiskLevel::Elevated
            };
            let action = if severity >= RiskLevel::High {
                RiskAction::Reduce
            } else {
                RiskAction::Allow
            };
            alerts.push(RiskAlert {
                tier: RiskTierKind::Position,
                severity,
                action,
                metric: "position_notional",
                value: notional,
                limit: self.max_position_notional,
                message: format!(
                    "{label} notional {notional:.0} exceeds limit {:.0}",
                    self.max_position_notional
                ),
            });
        }
    }

    fn check_pnl_distance(&self, alerts: &mut AlertVec, pos: &Position) {
        let basis = pos.quantity.unsigned_abs() as f64 * pos.avg_price * CONTRACT_MULTIPLIER;
        if basis <= 0.0 {
            return;
        }
        let pnl_frac = pos.unrealized_pnl / basis;
        if -pnl_frac >= self.stop_loss_pct {
            alerts.push(RiskAlert {
                tier: RiskTierKind::Position,
                severity: RiskLevel::High,
                action: RiskAction::Reduce,
                metric: "stop_loss",
                value: -pnl_frac,
                limit: self.stop_loss_pct,
                message: format!(
                    "{} down {:.1}% of entry basis, past the {:.0}% stop",
                    pos.contract.key(),
                    -pnl_frac * 100.0,
                    self.stop_loss_pct * 100.0
                ),
            });
        } else if pnl_frac >= self.take_profit_pct {
            alerts.push(RiskAlert {
                tier: RiskTierKind::Position,
                severity: RiskLevel::Elevated,
                action: RiskAction::Reduce,
                metric: "take_profit",
                value: pnl_frac,
                limit: self.take_profit_pct,
                message: format!(
                    "{} up {:.1}% of entry basis, past the {:.0}% take-profit",
                    pos.contract.key(),
                    pnl_frac * 100.0,
                    self.take_profit_pct * 100.0
                ),
            });
        }
    }

    fn check_concentration(&self, alerts: &mut AlertVec, ctx: &RiskContext) {
        if ctx.portfolio_value <= 0.0 {
            return;
        }
        for pos in ctx.positions {
            let notional = pos.notional(pos.avg_price);
            let frac = notional / ctx.portfolio_value;
            if frac > self.max_concentration_pct {
                alerts.push(RiskAlert {
                    tier: RiskTierKind::Position,
                    severity: RiskLevel::Elevated,
                    action: RiskAction::Reduce,
                    metric: "concentration",
                    value: frac,
                    limit: self.max_concentration_pct,
                    message: format!(
                        "{} is {:.0}% of portfolio value",
                        pos.contract.key(),
                        frac * 100.0
                    ),
                });
            }
        }
    }

    fn proposed_notional(trade: &ProposedTrade) -> f64 {
        trade.quantity.unsigned_abs() as f64 * trade.price * CONTRACT_MULTIPLIER
    }
}

impl RiskTier for PositionTier {
    fn assess(&self, ctx: &RiskContext) -> TierAssessment {
        let mut alerts = AlertVec::new();

        for pos in ctx.positions {
            self.check_notional(
                &mut alerts,
                pos.notional(pos.avg_price),
                &pos.contract.key(),
            );
            self.check_pnl_distance(&mut alerts, pos);
        }
        self.check_concentration(&mut alerts, ctx);

        if let Some(trade) = ctx.proposed {
            self.check_notional(&mut alerts, Self::proposed_notional(trade), "proposed");
        }

        TierAssessment {
            tier: RiskTierKind::Position,
            alerts,
            confidence: 1.0,
        }
    }
}
