//! Tiered pre-trade risk: position, portfolio and compliance checks run on
//! every proposed order, their verdicts aggregated by worst-case severity.
//! Alerts are advisory output for operators; the action is binding on the
//! engine.

pub mod compliance;
pub mod engine;
pub mod portfolio;
pub mod position;

use crate::domain::{OptionContract, Position};
use chrono::{DateTime, Utc};
use smallvec::SmallVec;

/// Alert list sized for the common case: a tier trips at most a handful of
/// limits, so these stay on the stack.
pub type AlertVec = SmallVec<[RiskAlert; 4]>;

/// Ordinal severity. Derived `Ord` follows declaration order, so
/// `Normal < Elevated < High < Critical` and worst-case aggregation is
/// simply `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Normal,
    Elevated,
    High,
    Critical,
}

impl RiskLevel {
    /// Position-size multiplier applied to approved orders at this level.
    pub fn size_multiplier(self) -> f64 {
        match self {
            RiskLevel::Normal => 1.0,
            RiskLevel::Elevated => 0.75,
            RiskLevel::High => 0.5,
            RiskLevel::Critical => 0.0,
        }
    }
}

/// Containment actions with fixed precedence: a stronger action from any
/// tier overrides weaker ones, never the other way around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskAction {
    Allow,
    Reduce,
    Hedge,
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTierKind {
    Position,
    Portfolio,
    Compliance,
    /// Verdicts originating in the aggregator itself (fail-closed paths).
    Engine,
}

/// One limit breach (or near-breach) observed by a tier.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RiskAlert {
    pub tier: RiskTierKind,
    pub severity: RiskLevel,
    pub action: RiskAction,
    pub metric: &'static str,
    pub value: f64,
    pub limit: f64,
    pub message: String,
}

/// Verdict for one proposed trade (or the standing book when no trade is
/// proposed).
#[derive(Debug, Clone, serde::Serialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub action: RiskAction,
    pub alerts: AlertVec,
    /// [0, 1]: weighted tier confidence times the data-quality factor.
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// The order the engine wants to send, expressed in risk terms.
#[derive(Debug, Clone)]
pub struct ProposedTrade {
    pub contract: OptionContract,
    /// Signed contract count (positive buy, negative sell).
    pub quantity: i64,
    pub price: f64,
    pub delta: f64,
    pub gamma: f64,
}

/// Inputs to the staleness/completeness discount on risk confidence.
#[derive(Debug, Clone, Copy)]
pub struct DataQuality {
    /// 1.0 fresh, decaying toward the floor as the snapshot ages.
    pub staleness_factor: f64,
    pub total_quotes: usize,
    pub usable_quotes: usize,
}

impl DataQuality {
    pub fn factor(&self) -> f64 {
        let completeness = if self.total_quotes == 0 {
            0.0
        } else {
            self.usable_quotes as f64 / self.total_quotes as f64
        };
        (self.staleness_factor * completeness).clamp(0.0, 1.0)
    }
}

/// Everything a tier may inspect. Built once per assessment by the engine;
/// tiers never reach into live state themselves.
#[derive(Debug, Clone)]
pub struct RiskContext<'a> {
    pub positions: &'a [Position],
    pub proposed: Option<&'a ProposedTrade>,
    pub portfolio_value: f64,
    pub daily_pnl: f64,
    /// Dollar delta / gamma of the standing book.
    pub net_delta: f64,
    pub net_gamma: f64,
    /// Daily volatility estimate of portfolio value, for parametric VaR.
    pub portfolio_daily_vol: f64,
    pub spot: f64,
    pub data_quality: DataQuality,
}

/// Per-tier output: alerts plus the tier's own confidence in its inputs.
#[derive(Debug, Clone)]
pub struct TierAssessment {
    pub tier: RiskTierKind,
    pub alerts: AlertVec,
    pub confidence: f64,
}

impl TierAssessment {
    pub fn severity(&self) -> RiskLevel {
        self.alerts
            .iter()
            .map(|a| a.severity)
            .max()
            .unwrap_or(RiskLevel::Normal)
    }

    pub fn action(&self) -> RiskAction {
        self.alerts
            .iter()
            .map(|a| a.action)
            .max()
            .unwrap_or(RiskAction::Allow)
    }
}

/// A risk tier: pure assessment over the shared context.
pub trait RiskTier: Send + Sync {
    fn assess(&self, ctx: &RiskContext) -> TierAssessment;
}
