//! The engine task: owns the position book and all trading state, consumes
//! events from its bounded inbox, and runs the fast decision cycle.
//!
//! Cycle order: screen -> price (bounded concurrency) -> mark book ->
//! detect signals -> risk-gate each candidate order -> submit survivors.
//! The slow calibration loop runs elsewhere and only reaches this task
//! through the parameter watch channel and its result event.

use crate::config::AppConfig;
use crate::domain::{MarketSnapshot, OptionContract, ParameterSet, Position};
use crate::errors::EngineError;
use crate::execution::{ActionSide, ApprovedAction, ExecutionUpdate};
use crate::portfolio::PortfolioBook;
use crate::pricing::black_scholes::BlackScholesPricer;
use crate::pricing::heston::HestonPricer;
use crate::pricing::{OptionPricer, PricerKind, PricingResult};
use crate::risk::engine::RiskEngine;
use crate::risk::{
    DataQuality, ProposedTrade, RiskAction, RiskAssessment, RiskLevel, RiskTierKind,
};
use crate::signals::{generate_signals, Signal, SignalDirection};
use crate::state::{
    staleness_factor, AppState, EngineEvent, EngineSnapshot, EngineState, NotificationEvent,
};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Order slots per cycle; the ranked signal list is cut here.
const MAX_ORDERS_PER_CYCLE: usize = 5;
/// Crude leverage multiplier mapping model spot vol to a daily volatility
/// of portfolio value for parametric VaR.
const PORTFOLIO_VOL_SCALE: f64 = 2.0;
const TRADING_DAYS_PER_YEAR: f64 = 252.0;

pub struct Engine {
    state: Arc<AppState>,
    cfg: AppConfig,
    pricer: Arc<dyn OptionPricer>,
    risk: Arc<RiskEngine>,
    book: PortfolioBook,
    last_snapshot: Option<Arc<MarketSnapshot>>,
    params_rx: watch::Receiver<ParameterSet>,
    calib_snapshot_tx: watch::Sender<Option<Arc<MarketSnapshot>>>,
    gate_tx: mpsc::Sender<ApprovedAction>,
    engine_state: EngineState,
    last_risk: Option<RiskAssessment>,
    last_pricing: Vec<PricingResult>,
    last_signals: Vec<Signal>,
    staleness: f64,
    session_date: chrono::NaiveDate,
}

impl Engine {
    pub fn new(
        state: Arc<AppState>,
        params_rx: watch::Receiver<ParameterSet>,
        calib_snapshot_tx: watch::Sender<Option<Arc<MarketSnapshot>>>,
        gate_tx: mpsc::Sender<ApprovedAction>,
    ) -> Self {
        let cfg = state.config.clone();
        let pricer: Arc<dyn OptionPricer> = match cfg.pricer {
            PricerKind::Heston => Arc::new(HestonPricer::new()),
            PricerKind::BlackScholes => Arc::new(BlackScholesPricer::new()),
        };
        let risk = Arc::new(RiskEngine::new(&cfg));
        let book = PortfolioBook::new(cfg.initial_capital);
        Self {
            state,
            cfg,
            pricer,
            risk,
            book,
            last_snapshot: None,
            params_rx,
            calib_snapshot_tx,
            gate_tx,
            engine_state: EngineState::Starting,
            last_risk: None,
            last_pricing: Vec::new(),
            last_signals: Vec::new(),
            staleness: 1.0,
            session_date: Utc::now().date_naive(),
        }
    }

    /// Daily P&L is a per-UTC-session measure: the first cycle of a new day
    /// resets it while positions and lifetime realized P&L carry over.
    fn roll_session_if_new_day(&mut self, today: chrono::NaiveDate) {
        if today != self.session_date {
            tracing::info!(%today, "session roll, daily pnl reset");
            self.book.roll_session();
            self.session_date = today;
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<EngineEvent>) {
        tracing::info!(pricer = ?self.pricer.kind(), "engine task started");
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::Snapshot(snapshot) => self.on_snapshot(snapshot),
                EngineEvent::Tick => self.run_cycle().await,
                EngineEvent::CalibrationFinished(outcome) => self.on_calibration(*outcome),
                EngineEvent::Execution(update) => self.on_execution(update),
                EngineEvent::Shutdown => {
                    tracing::info!("engine shutting down");
                    break;
                }
            }
        }
        tracing::info!("engine event loop ended");
    }

    fn on_snapshot(&mut self, snapshot: Arc<MarketSnapshot>) {
        self.state.health.snapshot_seen(snapshot.timestamp);
        self.calib_snapshot_tx.send_replace(Some(Arc::clone(&snapshot)));
        self.last_snapshot = Some(snapshot);
    }

    fn on_calibration(&mut self, outcome: crate::calibration::CalibrationOutcome) {
        self.state.health.calibration_beat();
        if outcome.accepted {
            self.state
                .counters
                .calibrations_accepted
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.state
                .counters
                .calibrations_rejected
                .fetch_add(1, Ordering::Relaxed);
        }
        self.state.notify(NotificationEvent::Calibration {
            accepted: outcome.accepted,
            rmse: outcome.rmse,
            version: outcome.params.version,
            reason: outcome.reason,
        });
    }

    fn on_execution(&mut self, update: ExecutionUpdate) {
        match update {
            ExecutionUpdate::Filled(fill) => {
                self.book.apply_fill(&fill);
                self.state.counters.fills_applied.fetch_add(1, Ordering::Relaxed);
                self.state.notify(NotificationEvent::Fill {
                    action_id: fill.action_id.clone(),
                    contract: fill.contract.key(),
                    quantity: fill.quantity,
                    price: fill.price,
                });
            }
            ExecutionUpdate::Rejected { action_id, reason } => {
                self.state
                    .counters
                    .execution_rejects
                    .fetch_add(1, Ordering::Relaxed);
                self.state.notify(NotificationEvent::Rejection { action_id, reason });
            }
        }
    }

    fn set_state(&mut self, next: EngineState, reason: &str) {
        if self.engine_state != next {
            tracing::info!(from = ?self.engine_state, to = ?next, reason, "engine state change");
            self.engine_state = next;
            self.state.notify(NotificationEvent::EngineStateChanged {
                state: next,
                reason: reason.to_string(),
            });
        }
    }

    fn skip_cycle(&self, reason: &str) {
        self.state.counters.cycles_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(reason, "cycle skipped");
        self.state.notify(NotificationEvent::CycleSkipped {
            reason: reason.to_string(),
        });
    }

    async fn run_cycle(&mut self) {
        let started = std::time::Instant::now();

        let Some(snapshot) = self.last_snapshot.clone() else {
            self.skip_cycle("no market snapshot yet");
            return;
        };
        if self.engine_state == EngineState::Halted {
            self.skip_cycle("engine halted");
            return;
        }

        let now = Utc::now();
        self.roll_session_if_new_day(now.date_naive());
        let age = snapshot.age_secs(now);
        self.staleness = staleness_factor(age, self.cfg.stale_after_secs);
        if self.staleness < 1.0 {
            self.set_state(EngineState::Degraded, "stale market data");
        } else {
            self.set_state(EngineState::Running, "fresh market data");
        }

        let params = *self.params_rx.borrow();
        let universe = screen_contracts(&snapshot, &self.cfg);
        let usable = usable_quote_count(&snapshot);

        // ── Price the universe with bounded concurrency ──
        let spot = snapshot.spot;
        let rate = snapshot.risk_free_rate;
        let outcomes: Vec<Result<PricingResult, EngineError>> = stream::iter(universe)
            .map(|contract| {
                let pricer = Arc::clone(&self.pricer);
                async move {
                    tokio::task::spawn_blocking(move || {
                        pricer.price(&params, spot, rate, &contract, now)
                    })
                    .await
                    .map_err(EngineError::from)?
                }
            })
            .buffer_unordered(self.cfg.pricing_concurrency)
            .collect()
            .await;

        let mut pricing = Vec::with_capacity(outcomes.len());
        let mut failures: u64 = 0;
        for outcome in outcomes {
            match outcome {
                Ok(r) => pricing.push(r),
                Err(e) => {
                    failures += 1;
                    tracing::debug!(error = %e, "pricing failure");
                }
            }
        }
        pricing.sort_by(|a, b| a.contract.key().cmp(&b.contract.key()));
        self.state
            .counters
            .contracts_priced
            .fetch_add(pricing.len() as u64, Ordering::Relaxed);
        if failures > 0 {
            self.state.counters.pricing_failures.fetch_add(failures, Ordering::Relaxed);
            tracing::warn!(failures, priced = pricing.len(), "some contracts failed to price");
        }

        // ── Mark the book against market mids ──
        let marks: HashMap<OptionContract, f64> = snapshot
            .quotes
            .iter()
            .filter(|(_, q)| q.is_two_sided())
            .map(|(c, q)| (c.clone(), q.mid()))
            .collect();
        self.book.mark_to_market(&marks);
        let (net_delta, net_gamma) = self.book.net_exposure(&pricing);

        // ── Signals ──
        let signals = generate_signals(&snapshot, &pricing, &self.cfg, self.staleness);
        self.state
            .counters
            .signals_emitted
            .fetch_add(signals.len() as u64, Ordering::Relaxed);
        for s in signals.iter().take(MAX_ORDERS_PER_CYCLE) {
            self.state.notify(NotificationEvent::Signal {
                contract: s.contract.key(),
                direction: format!("{:?}", s.direction).to_lowercase(),
                magnitude_pct: s.magnitude_pct,
                strength: format!("{:?}", s.strength).to_lowercase(),
                confidence: s.confidence,
            });
        }

        let data_quality = DataQuality {
            staleness_factor: self.staleness,
            total_quotes: snapshot.quotes.len(),
            usable_quotes: usable,
        };
        let daily_vol = params.v0.sqrt() / TRADING_DAYS_PER_YEAR.sqrt() * PORTFOLIO_VOL_SCALE;

        // ── Standing-book assessment (no proposal) ──
        let baseline = self
            .assess_bounded(None, net_delta, net_gamma, daily_vol, spot, data_quality)
            .await;
        self.publish_alerts(&baseline);
        let halted = baseline.action == RiskAction::Halt;
        if halted {
            // A fail-closed verdict (the assessment itself timed out or
            // died) stands this cycle down without latching the engine;
            // a halt from a real tier is sticky until operator restart.
            let fail_closed =
                baseline.alerts.iter().all(|a| a.tier == RiskTierKind::Engine);
            if fail_closed {
                self.set_state(EngineState::Degraded, "risk assessment unavailable");
            } else {
                self.set_state(EngineState::Halted, "risk halt on standing book");
            }
        }
        self.last_risk = Some(baseline.clone());

        // ── Gate and submit orders ──
        if !halted {
            let by_contract: HashMap<&OptionContract, &PricingResult> =
                pricing.iter().map(|r| (&r.contract, r)).collect();
            let mut hedge_advised = false;

            for signal in signals.iter().take(MAX_ORDERS_PER_CYCLE) {
                let Some(result) = by_contract.get(&signal.contract) else {
                    continue;
                };
                let side = match signal.direction {
                    SignalDirection::Underpriced => ActionSide::Buy,
                    SignalDirection::Overpriced => ActionSide::Sell,
                };
                let base_qty = self.cfg.order_quantity;
                let signed = match side {
                    ActionSide::Buy => base_qty,
                    ActionSide::Sell => -base_qty,
                };
                let proposed = ProposedTrade {
                    contract: signal.contract.clone(),
                    quantity: signed,
                    price: signal.market_mid,
                    delta: result.delta,
                    gamma: result.gamma,
                };

                let verdict = self
                    .assess_bounded(
                        Some(proposed),
                        net_delta,
                        net_gamma,
                        daily_vol,
                        spot,
                        data_quality,
                    )
                    .await;
                self.publish_alerts(&verdict);
                self.last_risk = Some(verdict.clone());

                let mut qty = base_qty;
                match verdict.action {
                    RiskAction::Halt => {
                        self.state.counters.actions_blocked.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            contract = %signal.contract.key(),
                            "risk halt during gating, abandoning remaining orders"
                        );
                        break;
                    }
                    RiskAction::Hedge => {
                        if !hedge_advised {
                            hedge_advised = true;
                            self.state.notify(NotificationEvent::HedgeAdvised { net_delta });
                        }
                        qty = (qty / 2).max(0);
                    }
                    RiskAction::Reduce => {
                        qty = (qty / 2).max(0);
                    }
                    RiskAction::Allow => {}
                }
                qty = (qty as f64 * verdict.level.size_multiplier()).floor() as i64;
                if qty <= 0 {
                    self.state.counters.actions_blocked.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                let action = ApprovedAction::new(
                    signal.contract.clone(),
                    side,
                    qty,
                    signal.market_mid,
                    signal.magnitude_pct,
                );
                self.state.notify(NotificationEvent::ActionSubmitted {
                    id: action.id.clone(),
                    contract: action.contract.key(),
                    side: format!("{:?}", action.side).to_lowercase(),
                    quantity: action.quantity,
                    limit_price: action.limit_price,
                });
                if self.gate_tx.send(action).await.is_err() {
                    tracing::error!("execution gate channel closed");
                    break;
                }
                self.state.counters.actions_submitted.fetch_add(1, Ordering::Relaxed);
            }
        }

        // ── Publish the cycle snapshot ──
        self.last_pricing = pricing;
        self.last_signals = signals;
        let engine_snapshot = EngineSnapshot {
            engine_state: self.engine_state,
            underlying: snapshot.underlying.clone(),
            spot,
            snapshot_version: snapshot.version,
            snapshot_age_secs: age,
            staleness_factor: self.staleness,
            params,
            pricing: self.last_pricing.clone(),
            signals: self.last_signals.clone(),
            risk: self.last_risk.clone(),
            positions: self.book.positions(),
            portfolio_value: self.book.total_value(),
            realized_pnl: self.book.realized_pnl(),
            unrealized_pnl: self.book.unrealized_pnl(),
            daily_pnl: self.book.daily_pnl(),
            updated_at: Utc::now().to_rfc3339(),
        };
        self.state.snapshot_tx.send_replace(engine_snapshot);

        self.state.health.cycle_beat();
        self.state.counters.cycles_run.fetch_add(1, Ordering::Relaxed);
        self.state.counters.last_cycle_ms.store(
            started.elapsed().as_secs_f64() * 1000.0,
            portable_atomic::Ordering::Relaxed,
        );
    }

    /// Risk assessment on the blocking pool with a hard deadline. A timeout
    /// fails closed: the trade is treated as halted, never waved through.
    async fn assess_bounded(
        &self,
        proposed: Option<ProposedTrade>,
        net_delta: f64,
        net_gamma: f64,
        daily_vol: f64,
        spot: f64,
        data_quality: DataQuality,
    ) -> RiskAssessment {
        let risk = Arc::clone(&self.risk);
        let positions: Vec<Position> = self.book.positions();
        let portfolio_value = self.book.total_value();
        let daily_pnl = self.book.daily_pnl();
        let deadline = tokio::time::Duration::from_millis(self.cfg.risk_timeout_ms);

        let joined = tokio::time::timeout(
            deadline,
            tokio::task::spawn_blocking(move || {
                let ctx = crate::risk::RiskContext {
                    positions: &positions,
                    proposed: proposed.as_ref(),
                    portfolio_value,
                    daily_pnl,
                    net_delta,
                    net_gamma,
                    portfolio_daily_vol: daily_vol,
                    spot,
                    data_quality,
                };
                risk.assess(&ctx)
            }),
        )
        .await;

        match joined {
            Ok(Ok(assessment)) => assessment,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "risk assessment task failed, failing closed");
                fail_closed("risk assessment task failed")
            }
            Err(_) => {
                tracing::error!(
                    timeout_ms = self.cfg.risk_timeout_ms,
                    "risk assessment deadline exceeded, failing closed"
                );
                fail_closed("risk assessment deadline exceeded")
            }
        }
    }

    fn publish_alerts(&self, assessment: &RiskAssessment) {
        for alert in &assessment.alerts {
            tracing::warn!(
                tier = ?alert.tier,
                severity = ?alert.severity,
                action = ?alert.action,
                metric = alert.metric,
                value = alert.value,
                limit = alert.limit,
                "risk alert"
            );
            self.state.notify(NotificationEvent::RiskAlert {
                tier: format!("{:?}", alert.tier).to_lowercase(),
                severity: format!("{:?}", alert.severity).to_lowercase(),
                action: format!("{:?}", alert.action).to_lowercase(),
                message: alert.message.clone(),
            });
        }
    }
}

fn fail_closed(reason: &str) -> RiskAssessment {
    RiskAssessment {
        level: RiskLevel::Critical,
        action: RiskAction::Halt,
        alerts: smallvec::smallvec![crate::risk::RiskAlert {
            tier: crate::risk::RiskTierKind::Engine,
            severity: RiskLevel::Critical,
            action: RiskAction::Halt,
            metric: "risk_engine",
            value: 0.0,
            limit: 0.0,
            message: reason.to_string(),
        }],
        confidence: 0.0,
        timestamp: Utc::now(),
    }
}

/// Pricing universe for one cycle: two-sided quotes above the volume floor,
/// inside the expiry and strike windows. Deterministic order.
pub fn screen_contracts(snapshot: &MarketSnapshot, cfg: &AppConfig) -> Vec<OptionContract> {
    let now = snapshot.timestamp;
    let lo = snapshot.spot * (1.0 - cfg.strike_range_pct);
    let hi = snapshot.spot * (1.0 + cfg.strike_range_pct);
    let mut out: Vec<OptionContract> = snapshot
        .quotes
        .iter()
        .filter(|(c, q)| {
            let dte = c.days_to_expiry(now);
            q.is_two_sided()
                && q.volume >= cfg.min_volume
                && dte >= cfg.min_dte_days
                && dte <= cfg.max_dte_days
                && c.strike() >= lo
                && c.strike() <= hi
        })
        .map(|(c, _)| c.clone())
        .collect();
    out.sort_by_key(|c| c.key());
    out
}

/// Quote-level completeness for the data-quality discount: a quote counts
/// as usable when it is two-sided with traded volume, independent of the
/// configured screening windows.
fn usable_quote_count(snapshot: &MarketSnapshot) -> usize {
    snapshot
        .quotes
        .values()
        .filter(|q| q.is_two_sided() && q.volume > 0)
        .count()
}

/// Fast-cycle metronome: one `Tick` per cycle interval.
pub async fn run_ticker(cycle_secs: u64, engine_tx: mpsc::Sender<EngineEvent>) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(cycle_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if engine_tx.send(EngineEvent::Tick).await.is_err() {
            tracing::error!("engine channel closed, ticker stopping");
            return;
        }
    }
}
