//! Execution boundary. The engine emits fully risk-approved actions; this
//! module owns what happens to them. The paper gate simulates an exchange:
//! probabilistic fills with slippage, asynchronous confirmations back into
//! the engine channel.

use crate::config::AppConfig;
use crate::domain::OptionContract;
use crate::state::EngineEvent;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionSide {
    Buy,
    Sell,
}

/// An order that has passed the risk gate. Quantity is always positive;
/// direction lives in `side`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApprovedAction {
    pub id: String,
    pub contract: OptionContract,
    pub side: ActionSide,
    pub quantity: i64,
    pub limit_price: f64,
    pub signal_magnitude_pct: f64,
}

impl ApprovedAction {
    pub fn new(
        contract: OptionContract,
        side: ActionSide,
        quantity: i64,
        limit_price: f64,
        signal_magnitude_pct: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            contract,
            side,
            quantity,
            limit_price,
            signal_magnitude_pct,
        }
    }

    /// Signed quantity: buys positive, sells negative.
    pub fn signed_quantity(&self) -> i64 {
        match self.side {
            ActionSide::Buy => self.quantity,
            ActionSide::Sell => -self.quantity,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FillEvent {
    pub action_id: String,
    pub contract: OptionContract,
    /// Signed contract count.
    pub quantity: i64,
    pub price: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionUpdate {
    Filled(FillEvent),
    Rejected { action_id: String, reason: String },
}

/// Paper execution gate. Fills against the limit price with configured
/// slippage, rejects the rest, and reports back asynchronously the way a
/// real gateway would.
pub async fn run_paper_gate(
    cfg: AppConfig,
    mut rx: mpsc::Receiver<ApprovedAction>,
    engine_tx: mpsc::Sender<EngineEvent>,
) {
    tracing::info!(
        fill_probability = cfg.fill_probability,
        slippage_pct = cfg.slippage_pct,
        "paper execution gate started"
    );
    let mut rng = StdRng::seed_from_u64(cfg.feed_seed ^ 0x5eed);

    while let Some(action) = rx.recv().await {
        // Simulated gateway latency.
        tokio::time::sleep(tokio::time::Duration::from_millis(rng.gen_range(20..120))).await;

        let update = if rng.gen::<f64>() < cfg.fill_probability {
            // Slippage always against us.
            let slip = action.limit_price * cfg.slippage_pct;
            let price = match action.side {
                ActionSide::Buy => action.limit_price + slip,
                ActionSide::Sell => (action.limit_price - slip).max(0.0),
            };
            tracing::info!(
                id = %action.id,
                contract = %action.contract.key(),
                side = ?action.side,
                quantity = action.quantity,
                price,
                "paper fill"
            );
            ExecutionUpdate::Filled(FillEvent {
                action_id: action.id.clone(),
                contract: action.contract.clone(),
                quantity: action.signed_quantity(),
                price,
            })
        } else {
            tracing::info!(
                id = %action.id,
                contract = %action.contract.key(),
                "paper reject (no liquidity)"
            );
            ExecutionUpdate::Rejected {
                action_id: action.id.clone(),
                reason: "no fill at limit".into(),
            }
        };

        if engine_tx
            .send(EngineEvent::Execution(update))
            .await
            .is_err()
        {
            tracing::error!("engine channel closed, paper gate shutting down");
            return;
        }
    }
    tracing::info!("action channel closed, paper gate shutting down");
}
