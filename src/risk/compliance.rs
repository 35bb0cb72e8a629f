//! Compliance tier: hard operating limits. Daily loss, total contract
//! count and per-name contract caps. Breaches here are the strongest
//! containment signals the engine can receive.

use super::{
    AlertVec, RiskAction, RiskAlert, RiskContext, RiskLevel, RiskTier, RiskTierKind,
    TierAssessment,
};

pub struct ComplianceTier {
    pub max_daily_loss: f64,
    pub max_contracts_total: i64,
    pub max_contracts_per_name: i64,
}

impl RiskTier for ComplianceTier {
    fn assess(&self, ctx: &RiskContext) -> TierAssessment {
        let mut alerts = AlertVec::new();

        // Daily loss limit is a kill switch, not a dial.
        if ctx.daily_pnl <= -self.max_daily_loss {
            alerts.push(RiskAlert {
                tier: RiskTierKind::Compliance,
                severity: RiskLevel::Critical,
                action: RiskAction::Halt,
                metric: "daily_loss",
                value: ctx.daily_pnl,
                limit: -self.max_daily_loss,
                message: format!(
                    "daily P&L {:.0} breaches the {:.0} loss limit",
                    ctx.daily_pnl, self.max_daily_loss
                ),
            });
        } else if ctx.daily_pnl <= -0.8 * self.max_daily_loss {
            alerts.push(RiskAlert {
                tier: RiskTierKind::Compliance,
                severity: RiskLevel::High,
                action: RiskAction::Reduce,
                metric: "daily_loss",
                value: ctx.daily_pnl,
                limit: -self.max_daily_loss,
                message: format!(
                    "daily P&L {:.0} within 20% of the loss limit",
                    ctx.daily_pnl
                ),
            });
        }

        let mut total: i64 = ctx.positions.iter().map(|p| p.quantity.abs()).sum();
        if let Some(trade) = ctx.proposed {
            total += trade.quantity.abs();
        }
        if total > self.max_contracts_total {
            alerts.push(RiskAlert {
                tier: RiskTierKind::Compliance,
                severity: RiskLevel::High,
                action: RiskAction::Reduce,
                metric: "contracts_total",
                value: total as f64,
                limit: self.max_contracts_total as f64,
                message: format!(
                    "gross contract count {total} exceeds cap {}",
                    self.max_contracts_total
                ),
            });
        }

        if let Some(trade) = ctx.proposed {
            let existing: i64 = ctx
                .positions
                .iter()
                .filter(|p| p.contract == trade.contract)
                .map(|p| p.quantity.abs())
                .sum();
            let per_name = existing + trade.quantity.abs();
            if per_name > self.max_contracts_per_name {
                alerts.push(RiskAlert {
                    tier: RiskTierKind::Compliance,
                    severity: RiskLevel::Elevated,
                    action: RiskAction::Reduce,
                    metric: "contracts_per_name",
                    value: per_name as f64,
                    limit: self.max_contracts_per_name as f64,
                    message: format!(
                        "{} would hold {per_name} contracts, cap {}",
                        trade.contract.key(),
                        self.max_contracts_per_name
                    ),
                });
            }
        }

        TierAssessment {
            tier: RiskTierKind::Compliance,
            alerts,
            confidence: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OptionContract, OptionRight, Position};
    use crate::risk::{DataQuality, ProposedTrade};
    use chrono::NaiveDate;

    fn tier() -> ComplianceTier {
        ComplianceTier {
            max_daily_loss: 50_000.0,
            max_contracts_total: 25_000,
            max_contracts_per_name: 500,
        }
    }

    fn contract() -> OptionContract {
        OptionContract::new(
            "SPX",
            OptionRight::Call,
            5000.0,
            NaiveDate::from_ymd_opt(2026, 9, 18).unwrap(),
        )
    }

    fn ctx<'a>(
        positions: &'a [Position],
        proposed: Option<&'a ProposedTrade>,
        daily_pnl: f64,
    ) -> RiskContext<'a> {
        RiskContext {
            positions,
            proposed,
            portfolio_value: 1_000_000.0,
            daily_pnl,
            net_delta: 0.0,
            net_gamma: 0.0,
            portfolio_daily_vol: 0.02,
            spot: 5000.0,
            data_quality: DataQuality {
                staleness_factor: 1.0,
                total_quotes: 10,
                usable_quotes: 10,
            },
        }
    }

    #[test]
    fn daily_loss_breach_halts() {
        let out = tier().assess(&ctx(&[], None, -60_000.0));
        assert_eq!(out.severity(), RiskLevel::Critical);
        assert_eq!(out.action(), RiskAction::Halt);
    }

    #[test]
    fn approaching_daily_loss_warns() {
        let out = tier().assess(&ctx(&[], None, -45_000.0));
        assert_eq!(out.severity(), RiskLevel::High);
        assert_eq!(out.action(), RiskAction::Reduce);
    }

    #[test]
    fn profitable_day_is_clean() {
        let out = tier().assess(&ctx(&[], None, 1_500.0));
        assert!(out.alerts.is_empty());
    }

    #[test]
    fn per_name_cap_counts_existing_position() {
        let positions = vec![Position {
            contract: contract(),
            quantity: 480,
            avg_price: 50.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
        }];
        let proposed = ProposedTrade {
            contract: contract(),
            quantity: 30,
            price: 50.0,
            delta: 0.5,
            gamma: 0.001,
        };
        let out = tier().assess(&ctx(&positions, Some(&proposed), 0.0));
        assert!(out.alerts.iter().any(|a| a.metric == "contracts_per_name"));
        assert_eq!(out.action(), RiskAction::Reduce);
    }
}
