//! Shared application state and the channel contracts between tasks.
//!
//! Ownership model: the engine task owns all mutable trading state. Other
//! tasks communicate with it through the bounded event channel, and observe
//! it through the watch snapshot and the broadcast notification stream.
//! Nothing here requires a lock on the hot path.

use crate::calibration::CalibrationOutcome;
use crate::config::AppConfig;
use crate::domain::{MarketSnapshot, ParameterSet, Position};
use crate::execution::ExecutionUpdate;
use crate::pricing::PricingResult;
use crate::risk::RiskAssessment;
use crate::signals::Signal;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

/// Engine inbox capacity. Bounded so a stuck engine applies backpressure
/// instead of ballooning memory.
pub const ENGINE_CHANNEL_CAPACITY: usize = 512;
/// Notification fan-out capacity; slow WS clients lag and drop.
pub const NOTIFY_CHANNEL_CAPACITY: usize = 2048;

/// Everything that can arrive in the engine task's inbox.
#[derive(Debug)]
pub enum EngineEvent {
    /// Fresh market snapshot from the feed.
    Snapshot(Arc<MarketSnapshot>),
    /// Fast-cycle trigger.
    Tick,
    /// Slow-cycle calibration result (accepted or rejected).
    CalibrationFinished(Box<CalibrationOutcome>),
    /// Asynchronous confirmation from the execution gate.
    Execution(ExecutionUpdate),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Starting,
    Running,
    /// Operating on stale or incomplete data; sizing discounted.
    Degraded,
    /// Compliance halt: no new orders until operator intervention.
    Halted,
}

/// Outbound events for WS clients and any other subscriber.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    Signal {
        contract: String,
        direction: String,
        magnitude_pct: f64,
        strength: String,
        confidence: f64,
    },
    RiskAlert {
        tier: String,
        severity: String,
        action: String,
        message: String,
    },
    Calibration {
        accepted: bool,
        rmse: f64,
        version: u64,
        reason: Option<String>,
    },
    ActionSubmitted {
        id: String,
        contract: String,
        side: String,
        quantity: i64,
        limit_price: f64,
    },
    Fill {
        action_id: String,
        contract: String,
        quantity: i64,
        price: f64,
    },
    Rejection {
        action_id: String,
        reason: String,
    },
    HedgeAdvised {
        net_delta: f64,
    },
    CycleSkipped {
        reason: String,
    },
    EngineStateChanged {
        state: EngineState,
        reason: String,
    },
}

/// Point-in-time view of the whole engine, published after every cycle.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineSnapshot {
    pub engine_state: EngineState,
    pub underlying: String,
    pub spot: f64,
    pub snapshot_version: u64,
    pub snapshot_age_secs: f64,
    pub staleness_factor: f64,
    pub params: ParameterSet,
    pub pricing: Vec<PricingResult>,
    pub signals: Vec<Signal>,
    pub risk: Option<RiskAssessment>,
    pub positions: Vec<Position>,
    pub portfolio_value: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub daily_pnl: f64,
    pub updated_at: String,
}

impl EngineSnapshot {
    pub fn initial(cfg: &AppConfig) -> Self {
        Self {
            engine_state: EngineState::Starting,
            underlying: cfg.underlying_symbol.clone(),
            spot: 0.0,
            snapshot_version: 0,
            snapshot_age_secs: 0.0,
            staleness_factor: 1.0,
            params: ParameterSet::seed(),
            pricing: Vec::new(),
            signals: Vec::new(),
            risk: None,
            positions: Vec::new(),
            portfolio_value: cfg.initial_capital,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            daily_pnl: 0.0,
            updated_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Lock-free performance counters, readable from the REST surface.
#[derive(Debug, Default)]
pub struct PerfCounters {
    pub cycles_run: AtomicU64,
    pub cycles_skipped: AtomicU64,
    pub snapshots_received: AtomicU64,
    pub contracts_priced: AtomicU64,
    pub pricing_failures: AtomicU64,
    pub signals_emitted: AtomicU64,
    pub actions_submitted: AtomicU64,
    pub actions_blocked: AtomicU64,
    pub fills_applied: AtomicU64,
    pub execution_rejects: AtomicU64,
    pub calibrations_accepted: AtomicU64,
    pub calibrations_rejected: AtomicU64,
    /// Wall time of the most recent fast cycle, milliseconds.
    pub last_cycle_ms: portable_atomic::AtomicF64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CounterSnapshot {
    pub cycles_run: u64,
    pub cycles_skipped: u64,
    pub snapshots_received: u64,
    pub contracts_priced: u64,
    pub pricing_failures: u64,
    pub signals_emitted: u64,
    pub actions_submitted: u64,
    pub actions_blocked: u64,
    pub fills_applied: u64,
    pub execution_rejects: u64,
    pub calibrations_accepted: u64,
    pub calibrations_rejected: u64,
    pub last_cycle_ms: f64,
}

impl PerfCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            cycles_run: self.cycles_run.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            snapshots_received: self.snapshots_received.load(Ordering::Relaxed),
            contracts_priced: self.contracts_priced.load(Ordering::Relaxed),
            pricing_failures: self.pricing_failures.load(Ordering::Relaxed),
            signals_emitted: self.signals_emitted.load(Ordering::Relaxed),
            actions_submitted: self.actions_submitted.load(Ordering::Relaxed),
            actions_blocked: self.actions_blocked.load(Ordering::Relaxed),
            fills_applied: self.fills_applied.load(Ordering::Relaxed),
            execution_rejects: self.execution_rejects.load(Ordering::Relaxed),
            calibrations_accepted: self.calibrations_accepted.load(Ordering::Relaxed),
            calibrations_rejected: self.calibrations_rejected.load(Ordering::Relaxed),
            last_cycle_ms: self.last_cycle_ms.load(portable_atomic::Ordering::Relaxed),
        }
    }
}

/// Component heartbeats plus the timestamp of the last market snapshot,
/// epoch milliseconds. Zero means never.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    feed_last_ms: AtomicU64,
    calibration_last_ms: AtomicU64,
    cycle_last_ms: AtomicU64,
    snapshot_ts_ms: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub feed_age_secs: Option<f64>,
    pub calibration_age_secs: Option<f64>,
    pub cycle_age_secs: Option<f64>,
    /// Age of the market data itself, as stamped by the feed.
    pub snapshot_age_secs: Option<f64>,
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

fn age_secs(last_ms: u64) -> Option<f64> {
    if last_ms == 0 {
        None
    } else {
        Some((now_ms().saturating_sub(last_ms)) as f64 / 1000.0)
    }
}

impl HealthRegistry {
    pub fn feed_beat(&self) {
        self.feed_last_ms.store(now_ms(), Ordering::Relaxed);
    }
    pub fn calibration_beat(&self) {
        self.calibration_last_ms.store(now_ms(), Ordering::Relaxed);
    }
    pub fn cycle_beat(&self) {
        self.cycle_last_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Record the feed timestamp of the snapshot the engine is working
    /// from. A live feed can still be delivering old data.
    pub fn snapshot_seen(&self, timestamp: chrono::DateTime<Utc>) {
        self.snapshot_ts_ms
            .store(timestamp.timestamp_millis().max(0) as u64, Ordering::Relaxed);
    }

    /// Liveness roll-up: unhealthy if the fast loop has missed several
    /// cycles, degraded if the feed has gone quiet or the snapshot data
    /// itself is past the staleness bound. Calibration age is informational
    /// (it is legitimately minutes old).
    pub fn report(&self, cfg: &AppConfig) -> HealthReport {
        let feed = age_secs(self.feed_last_ms.load(Ordering::Relaxed));
        let calibration = age_secs(self.calibration_last_ms.load(Ordering::Relaxed));
        let cycle = age_secs(self.cycle_last_ms.load(Ordering::Relaxed));
        let snapshot = age_secs(self.snapshot_ts_ms.load(Ordering::Relaxed));
        let data_stale =
            matches!(snapshot, Some(a) if staleness_factor(a, cfg.stale_after_secs) < 1.0);

        let cycle_limit = (cfg.cycle_secs * 3) as f64;
        let status = match (cycle, feed) {
            (Some(c), _) if c > cycle_limit => "unhealthy",
            (None, _) | (_, None) => "starting",
            (_, Some(f)) if f > cfg.stale_after_secs => "degraded",
            _ if data_stale => "degraded",
            _ => "healthy",
        };

        HealthReport {
            status,
            feed_age_secs: feed,
            calibration_age_secs: calibration,
            cycle_age_secs: cycle,
            snapshot_age_secs: snapshot,
        }
    }
}

/// Handles shared across tasks and the HTTP surface.
pub struct AppState {
    pub config: AppConfig,
    pub engine_tx: mpsc::Sender<EngineEvent>,
    pub notify_tx: broadcast::Sender<NotificationEvent>,
    pub snapshot_tx: watch::Sender<EngineSnapshot>,
    pub snapshot_rx: watch::Receiver<EngineSnapshot>,
    pub counters: PerfCounters,
    pub health: HealthRegistry,
}

impl AppState {
    /// Build the state plus the receiving half of the engine inbox (which
    /// only the engine task may hold).
    pub fn new(config: AppConfig) -> (Arc<Self>, mpsc::Receiver<EngineEvent>) {
        let (engine_tx, engine_rx) = mpsc::channel(ENGINE_CHANNEL_CAPACITY);
        let (notify_tx, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(EngineSnapshot::initial(&config));

        let state = Arc::new(Self {
            config,
            engine_tx,
            notify_tx,
            snapshot_tx,
            snapshot_rx,
            counters: PerfCounters::default(),
            health: HealthRegistry::default(),
        });
        (state, engine_rx)
    }

    /// Fire-and-forget notification; dropped when nobody is listening.
    pub fn notify(&self, event: NotificationEvent) {
        let _ = self.notify_tx.send(event);
    }
}

/// Linear staleness falloff: 1.0 up to `stale_after`, then down to a floor
/// of 0.25 at three times that age. Never zero: risk still gets assessed
/// on old data, just with little conviction.
pub fn staleness_factor(age_secs: f64, stale_after_secs: f64) -> f64 {
    if age_secs <= stale_after_secs {
        return 1.0;
    }
    let span = 2.0 * stale_after_secs;
    let over = (age_secs - stale_after_secs).min(span);
    1.0 - 0.75 * (over / span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_is_flat_then_linear_to_floor() {
        assert_eq!(staleness_factor(0.0, 30.0), 1.0);
        assert_eq!(staleness_factor(30.0, 30.0), 1.0);
        let mid = staleness_factor(60.0, 30.0);
        assert!((mid - 0.625).abs() < 1e-12, "mid={mid}");
        assert!((staleness_factor(90.0, 30.0) - 0.25).abs() < 1e-12);
        // Floor holds beyond 3x.
        assert!((staleness_factor(900.0, 30.0) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn counters_round_trip() {
        let c = PerfCounters::default();
        c.cycles_run.fetch_add(3, Ordering::Relaxed);
        c.signals_emitted.fetch_add(5, Ordering::Relaxed);
        let snap = c.snapshot();
        assert_eq!(snap.cycles_run, 3);
        assert_eq!(snap.signals_emitted, 5);
        assert_eq!(snap.fills_applied, 0);
    }

    #[test]
    fn health_starts_unreported() {
        let cfg = AppConfig::from_env().unwrap();
        let h = HealthRegistry::default();
        let report = h.report(&cfg);
        assert_eq!(report.status, "starting");
        assert!(report.feed_age_secs.is_none());

        h.feed_beat();
        h.cycle_beat();
        let report = h.report(&cfg);
        assert_eq!(report.status, "healthy");
        assert!(report.feed_age_secs.unwrap() < 1.0);
    }

    #[test]
    fn stale_snapshot_degrades_health_despite_live_heartbeats() {
        let cfg = AppConfig::from_env().unwrap();
        let h = HealthRegistry::default();
        h.feed_beat();
        h.cycle_beat();
        h.snapshot_seen(Utc::now());
        assert_eq!(h.report(&cfg).status, "healthy");

        // Tasks keep beating, but the data they carry is ten staleness
        // windows old.
        let old = Utc::now() - chrono::Duration::seconds(cfg.stale_after_secs as i64 * 10);
        h.snapshot_seen(old);
        let report = h.report(&cfg);
        assert_eq!(report.status, "degraded");
        assert!(report.snapshot_age_secs.unwrap() > cfg.stale_after_secs);
    }
}
