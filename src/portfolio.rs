//! Position book. Single-writer: only the engine task mutates it, and only
//! in response to fill events. Everything else sees cloned snapshots.

use crate::domain::{OptionContract, Position, CONTRACT_MULTIPLIER};
use crate::execution::FillEvent;
use crate::pricing::PricingResult;
use std::collections::HashMap;

#[derive(Debug)]
pub struct PortfolioBook {
    positions: HashMap<OptionContract, Position>,
    cash: f64,
    realized_today: f64,
}

impl PortfolioBook {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            positions: HashMap::new(),
            cash: initial_capital,
            realized_today: 0.0,
        }
    }

    /// Apply one fill. Increasing a position averages the entry price;
    /// reducing realizes P&L against the average; crossing through zero
    /// closes and re-opens at the fill price.
    pub fn apply_fill(&mut self, fill: &FillEvent) {
        self.cash -= fill.quantity as f64 * fill.price * CONTRACT_MULTIPLIER;

        let pos = self
            .positions
            .entry(fill.contract.clone())
            .or_insert_with(|| Position {
                contract: fill.contract.clone(),
                quantity: 0,
                avg_price: 0.0,
                realized_pnl: 0.0,
                unrealized_pnl: 0.0,
            });

        let old_qty = pos.quantity;
        let new_qty = old_qty + fill.quantity;

        if old_qty == 0 || old_qty.signum() == fill.quantity.signum() {
            // Same-direction add: volume-weighted entry.
            let old_abs = old_qty.abs() as f64;
            let add_abs = fill.quantity.abs() as f64;
            pos.avg_price =
                (pos.avg_price * old_abs + fill.price * add_abs) / (old_abs + add_abs);
        } else {
            // Reduction (possibly through zero): realize on the closed part.
            let closed = old_qty.abs().min(fill.quantity.abs()) as f64;
            let realized =
                (fill.price - pos.avg_price) * closed * old_qty.signum() as f64 * CONTRACT_MULTIPLIER;
            pos.realized_pnl += realized;
            self.realized_today += realized;
            if new_qty != 0 && new_qty.signum() != old_qty.signum() {
                // Flipped: remainder opens at the fill price.
                pos.avg_price = fill.price;
            }
        }
        pos.quantity = new_qty;

        if pos.quantity == 0 {
            pos.avg_price = 0.0;
            pos.unrealized_pnl = 0.0;
        }
    }

    /// Mark open positions against current theoretical values (falling back
    /// to the previous mark when a contract was not priced this cycle).
    pub fn mark_to_market(&mut self, marks: &HashMap<OptionContract, f64>) {
        for pos in self.positions.values_mut() {
            if pos.quantity == 0 {
                continue;
            }
            if let Some(mark) = marks.get(&pos.contract) {
                pos.unrealized_pnl =
                    (mark - pos.avg_price) * pos.quantity as f64 * CONTRACT_MULTIPLIER;
            }
        }
    }

    /// Dollar greeks of the standing book given this cycle's valuations.
    pub fn net_exposure(&self, pricing: &[PricingResult]) -> (f64, f64) {
        let by_contract: HashMap<&OptionContract, &PricingResult> =
            pricing.iter().map(|r| (&r.contract, r)).collect();
        let mut net_delta = 0.0;
        let mut net_gamma = 0.0;
        for pos in self.positions.values() {
            if pos.quantity == 0 {
                continue;
            }
            if let Some(r) = by_contract.get(&pos.contract) {
                let scale = pos.quantity as f64 * CONTRACT_MULTIPLIER;
                net_delta += scale * r.delta;
                net_gamma += scale * r.gamma;
            }
        }
        (net_delta, net_gamma)
    }

    pub fn positions(&self) -> Vec<Position> {
        let mut out: Vec<Position> = self
            .positions
            .values()
            .filter(|p| p.quantity != 0)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.contract.key().cmp(&b.contract.key()));
        out
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    pub fn realized_pnl(&self) -> f64 {
        self.positions.values().map(|p| p.realized_pnl).sum()
    }

    /// Cash plus marked option value.
    pub fn total_value(&self) -> f64 {
        let option_value: f64 = self
            .positions
            .values()
            .filter(|p| p.quantity != 0)
            .map(|p| (p.avg_price * p.quantity as f64 * CONTRACT_MULTIPLIER) + p.unrealized_pnl)
            .sum();
        self.cash + option_value
    }

    /// Realized + unrealized move since the session started.
    pub fn daily_pnl(&self) -> f64 {
        self.realized_today + self.unrealized_pnl()
    }

    /// Session rollover: realized-today resets, positions carry.
    pub fn roll_session(&mut self) {
        self.realized_today = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OptionRight;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn contract() -> OptionContract {
        OptionContract::new(
            "SPX",
            OptionRight::Call,
            5000.0,
            NaiveDate::from_ymd_opt(2026, 9, 18).unwrap(),
        )
    }

    fn fill(qty: i64, price: f64) -> FillEvent {
        FillEvent {
            action_id: "t".into(),
            contract: contract(),
            quantity: qty,
            price,
        }
    }

    #[test]
    fn buy_then_average_up() {
        let mut book = PortfolioBook::new(1_000_000.0);
        book.apply_fill(&fill(10, 10.0));
        book.apply_fill(&fill(10, 12.0));
        let positions = book.positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 20);
        assert_relative_eq!(positions[0].avg_price, 11.0);
        // Cash out: 10*10*100 + 10*12*100 = 22,000
        assert_relative_eq!(book.total_value(), 1_000_000.0, epsilon = 1e-9);
    }

    #[test]
    fn partial_close_realizes_pnl() {
        let mut book = PortfolioBook::new(1_000_000.0);
        book.apply_fill(&fill(10, 10.0));
        book.apply_fill(&fill(-4, 13.0));
        // Realized: (13 - 10) * 4 * 100 = 1200
        assert_relative_eq!(book.realized_pnl(), 1_200.0);
        assert_relative_eq!(book.daily_pnl(), 1_200.0);
        let positions = book.positions();
        assert_eq!(positions[0].quantity, 6);
        assert_relative_eq!(positions[0].avg_price, 10.0);
    }

    #[test]
    fn short_position_profits_when_price_falls() {
        let mut book = PortfolioBook::new(1_000_000.0);
        book.apply_fill(&fill(-10, 10.0));
        book.apply_fill(&fill(10, 7.0));
        // Short at 10, covered at 7: (7 - 10) * 10 * (-1) * 100 = +3000
        assert_relative_eq!(book.realized_pnl(), 3_000.0);
        assert!(book.positions().is_empty());
        assert_relative_eq!(book.total_value(), 1_003_000.0, epsilon = 1e-9);
    }

    #[test]
    fn flip_through_zero_reopens_at_fill_price() {
        let mut book = PortfolioBook::new(1_000_000.0);
        book.apply_fill(&fill(10, 10.0));
        book.apply_fill(&fill(-15, 12.0));
        let positions = book.positions();
        assert_eq!(positions[0].quantity, -5);
        assert_relative_eq!(positions[0].avg_price, 12.0);
        // Realized on the closed 10: (12 - 10) * 10 * 100 = 2000
        assert_relative_eq!(book.realized_pnl(), 2_000.0);
    }

    #[test]
    fn mark_to_market_updates_unrealized() {
        let mut book = PortfolioBook::new(1_000_000.0);
        book.apply_fill(&fill(10, 10.0));
        let marks: HashMap<_, _> = [(contract(), 11.5)].into_iter().collect();
        book.mark_to_market(&marks);
        assert_relative_eq!(book.unrealized_pnl(), 1_500.0);
        assert_relative_eq!(book.total_value(), 1_001_500.0, epsilon = 1e-9);
        assert_relative_eq!(book.daily_pnl(), 1_500.0);
    }

    #[test]
    fn session_roll_resets_daily_but_not_positions() {
        let mut book = PortfolioBook::new(1_000_000.0);
        book.apply_fill(&fill(10, 10.0));
        book.apply_fill(&fill(-10, 12.0));
        assert_relative_eq!(book.daily_pnl(), 2_000.0);
        book.roll_session();
        assert_relative_eq!(book.daily_pnl(), 0.0);
        assert_relative_eq!(book.realized_pnl(), 2_000.0, epsilon = 1e-9);
    }
}
