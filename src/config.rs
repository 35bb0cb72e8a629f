use crate::errors::{EngineError, EngineResult};
use crate::pricing::PricerKind;

#[derive(Debug, Clone)]
pub struct AppConfig {
    // ── Feed ──
    pub underlying_symbol: String,
    pub feed_seed: u64,
    pub feed_drift: f64,
    pub feed_vol: f64,
    pub risk_free_rate: f64,
    /// Snapshot older than this (seconds) is stale; confidence starts decaying.
    pub stale_after_secs: f64,

    // ── Contract screening ──
    pub min_dte_days: i64,
    pub max_dte_days: i64,
    pub strike_range_pct: f64,
    pub max_spread_ratio: f64,
    pub min_option_price: f64,
    pub min_volume: i64,
    pub min_open_interest: i64,

    // ── Signals ──
    pub min_mispricing_pct: f64,
    pub strong_mispricing_pct: f64,
    pub very_strong_mispricing_pct: f64,
    pub min_signal_confidence: f64,

    // ── Risk ──
    pub max_position_notional: f64,
    pub max_concentration_pct: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub max_portfolio_delta: f64,
    pub max_portfolio_gamma: f64,
    pub var_confidence: f64,
    pub max_var_pct: f64,
    pub max_daily_loss: f64,
    pub max_contracts_total: i64,
    pub max_contracts_per_name: i64,
    /// Tier weights for the aggregate risk confidence: position, portfolio,
    /// compliance. Normalized to sum to 1 during validation.
    pub risk_conf_weights: [f64; 3],
    pub risk_timeout_ms: u64,

    // ── Engine cadence ──
    pub cycle_secs: u64,
    pub calibration_interval_secs: u64,
    pub calibration_rmse_threshold: f64,
    pub pricing_concurrency: usize,
    pub pricer: PricerKind,

    // ── Execution ──
    pub initial_capital: f64,
    pub order_quantity: i64,
    pub fill_probability: f64,
    pub slippage_pct: f64,

    pub server_port: u16,
}

impl AppConfig {
    pub fn from_env() -> EngineResult<Self> {
        dotenvy::dotenv().ok();

        let pricer = match env_var_or("PRICER", "heston").to_lowercase().as_str() {
            "heston" => PricerKind::Heston,
            "black-scholes" | "black_scholes" | "bs" => PricerKind::BlackScholes,
            other => {
                return Err(EngineError::Config(format!("PRICER: unknown model '{other}'")))
            }
        };

        let cfg = Self {
            underlying_symbol: env_var_or("UNDERLYING_SYMBOL", "SPX"),
            feed_seed: parse("FEED_SEED", "42")?,
            feed_drift: parse("FEED_DRIFT", "0.05")?,
            feed_vol: parse("FEED_VOL", "0.18")?,
            risk_free_rate: parse("RISK_FREE_RATE", "0.04")?,
            stale_after_secs: parse("STALE_AFTER_SECS", "30")?,

            min_dte_days: parse("MIN_DTE_DAYS", "7")?,
            max_dte_days: parse("MAX_DTE_DAYS", "45")?,
            strike_range_pct: parse("STRIKE_RANGE_PCT", "0.15")?,
            max_spread_ratio: parse("MAX_SPREAD_RATIO", "0.10")?,
            min_option_price: parse("MIN_OPTION_PRICE", "0.50")?,
            min_volume: parse("MIN_VOLUME", "10")?,
            min_open_interest: parse("MIN_OPEN_INTEREST", "10")?,

            min_mispricing_pct: parse("MIN_MISPRICING_PCT", "5.0")?,
            strong_mispricing_pct: parse("STRONG_MISPRICING_PCT", "15.0")?,
            very_strong_mispricing_pct: parse("VERY_STRONG_MISPRICING_PCT", "25.0")?,
            min_signal_confidence: parse("MIN_SIGNAL_CONFIDENCE", "0.60")?,

            max_position_notional: parse("MAX_POSITION_NOTIONAL", "1000000")?,
            max_concentration_pct: parse("MAX_CONCENTRATION_PCT", "0.60")?,
            stop_loss_pct: parse("STOP_LOSS_PCT", "0.50")?,
            take_profit_pct: parse("TAKE_PROFIT_PCT", "1.00")?,
            max_portfolio_delta: parse("MAX_PORTFOLIO_DELTA", "100000")?,
            max_portfolio_gamma: parse("MAX_PORTFOLIO_GAMMA", "5000")?,
            var_confidence: parse("VAR_CONFIDENCE", "0.95")?,
            max_var_pct: parse("MAX_VAR_PCT", "0.05")?,
            max_daily_loss: parse("MAX_DAILY_LOSS", "50000")?,
            max_contracts_total: parse("MAX_CONTRACTS_TOTAL", "25000")?,
            max_contracts_per_name: parse("MAX_CONTRACTS_PER_NAME", "500")?,
            risk_conf_weights: [
                parse("RISK_CONF_WEIGHT_POSITION", "1.0")?,
                parse("RISK_CONF_WEIGHT_PORTFOLIO", "1.0")?,
                parse("RISK_CONF_WEIGHT_COMPLIANCE", "1.0")?,
            ],
            risk_timeout_ms: parse("RISK_TIMEOUT_MS", "250")?,

            cycle_secs: parse("CYCLE_SECS", "5")?,
            calibration_interval_secs: parse("CALIBRATION_INTERVAL_SECS", "300")?,
            calibration_rmse_threshold: parse("CALIBRATION_RMSE_THRESHOLD", "0.05")?,
            pricing_concurrency: parse("PRICING_CONCURRENCY", "8")?,
            pricer,

            initial_capital: parse("INITIAL_CAPITAL", "1000000")?,
            order_quantity: parse("ORDER_QUANTITY", "10")?,
            fill_probability: parse("FILL_PROBABILITY", "0.9")?,
            slippage_pct: parse("SLIPPAGE_PCT", "0.001")?,

            server_port: parse("SERVER_PORT", "3001")?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Cross-field consistency checks. A config that fails here must be
    /// fatal at startup rather than surfacing mid-session.
    pub fn validate(&self) -> EngineResult<()> {
        if self.min_dte_days < 0 || self.max_dte_days <= self.min_dte_days {
            return Err(EngineError::Config(format!(
                "DTE window [{}, {}] is empty",
                self.min_dte_days, self.max_dte_days
            )));
        }
        if !(self.min_mispricing_pct > 0.0
            && self.min_mispricing_pct < self.strong_mispricing_pct
            && self.strong_mispricing_pct < self.very_strong_mispricing_pct)
        {
            return Err(EngineError::Config(format!(
                "mispricing thresholds must be increasing: {} / {} / {}",
                self.min_mispricing_pct, self.strong_mispricing_pct, self.very_strong_mispricing_pct
            )));
        }
        if !(0.5..1.0).contains(&self.var_confidence) {
            return Err(EngineError::Config(format!(
                "VAR_CONFIDENCE {} outside (0.5, 1.0)",
                self.var_confidence
            )));
        }
        if self.pricing_concurrency == 0 {
            return Err(EngineError::Config("PRICING_CONCURRENCY must be >= 1".into()));
        }
        if self.cycle_secs == 0 || self.calibration_interval_secs == 0 {
            return Err(EngineError::Config("cycle intervals must be >= 1s".into()));
        }
        if !(0.0..=1.0).contains(&self.fill_probability) {
            return Err(EngineError::Config("FILL_PROBABILITY outside [0, 1]".into()));
        }
        if self.order_quantity <= 0 {
            return Err(EngineError::Config("ORDER_QUANTITY must be positive".into()));
        }
        let weight_sum: f64 = self.risk_conf_weights.iter().sum();
        if weight_sum <= 0.0 || self.risk_conf_weights.iter().any(|w| *w < 0.0) {
            return Err(EngineError::Config("risk confidence weights must be non-negative with positive sum".into()));
        }
        for pos in [
            self.stale_after_secs,
            self.strike_range_pct,
            self.max_spread_ratio,
            self.min_option_price,
            self.max_position_notional,
            self.max_daily_loss,
            self.initial_capital,
        ] {
            if pos <= 0.0 {
                return Err(EngineError::Config("limits and thresholds must be positive".into()));
            }
        }
        Ok(())
    }

    /// Normalized tier weights (position, portfolio, compliance).
    pub fn normalized_risk_weights(&self) -> [f64; 3] {
        let sum: f64 = self.risk_conf_weights.iter().sum();
        [
            self.risk_conf_weights[0] / sum,
            self.risk_conf_weights[1] / sum,
            self.risk_conf_weights[2] / sum,
        ]
    }
}

fn env_var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse<T: std::str::FromStr>(key: &str, default: &str) -> EngineResult<T>
where
    T::Err: std::fmt::Display,
{
    env_var_or(key, default)
        .parse::<T>()
        .map_err(|e| EngineError::Config(format!("{key}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> AppConfig {
        AppConfig {
            underlying_symbol: "SPX".into(),
            feed_seed: 42,
            feed_drift: 0.05,
            feed_vol: 0.18,
            risk_free_rate: 0.04,
            stale_after_secs: 30.0,
            min_dte_days: 7,
            max_dte_days: 45,
            strike_range_pct: 0.15,
            max_spread_ratio: 0.10,
            min_option_price: 0.50,
            min_volume: 10,
            min_open_interest: 10,
            min_mispricing_pct: 5.0,
            strong_mispricing_pct: 15.0,
            very_strong_mispricing_pct: 25.0,
            min_signal_confidence: 0.60,
            max_position_notional: 1_000_000.0,
            max_concentration_pct: 0.60,
            stop_loss_pct: 0.50,
            take_profit_pct: 1.00,
            max_portfolio_delta: 100_000.0,
            max_portfolio_gamma: 5_000.0,
            var_confidence: 0.95,
            max_var_pct: 0.05,
            max_daily_loss: 50_000.0,
            max_contracts_total: 25_000,
            max_contracts_per_name: 500,
            risk_conf_weights: [1.0, 1.0, 1.0],
            risk_timeout_ms: 250,
            cycle_secs: 5,
            calibration_interval_secs: 300,
            calibration_rmse_threshold: 0.05,
            pricing_concurrency: 8,
            pricer: PricerKind::Heston,
            initial_capital: 1_000_000.0,
            order_quantity: 10,
            fill_probability: 0.9,
            slippage_pct: 0.001,
            server_port: 3001,
        }
    }

    #[test]
    fn default_config_validates() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn non_increasing_thresholds_rejected() {
        let mut cfg = base();
        cfg.strong_mispricing_pct = 4.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_dte_window_rejected() {
        let mut cfg = base();
        cfg.max_dte_days = cfg.min_dte_days;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn risk_weights_normalize() {
        let mut cfg = base();
        cfg.risk_conf_weights = [2.0, 1.0, 1.0];
        let w = cfg.normalized_risk_weights();
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((w[0] - 0.5).abs() < 1e-12);
    }
}
