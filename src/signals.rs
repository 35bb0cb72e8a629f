//! Mispricing detection: compare market mids against model theoretical
//! values and rank the discrepancies.
//!
//! Pure function of its inputs. Given the same snapshot, parameter set and
//! pricing results it always emits the same signals in the same order, so a
//! cycle can be replayed exactly from its inputs.

use crate::config::AppConfig;
use crate::domain::{MarketSnapshot, OptionContract, OptionQuote};
use crate::pricing::PricingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalDirection {
    /// Market above model: sell candidate.
    Overpriced,
    /// Market below model: buy candidate.
    Underpriced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStrength {
    Weak,
    Medium,
    Strong,
    VeryStrong,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Signal {
    pub contract: OptionContract,
    pub direction: SignalDirection,
    /// Signed (market - model) / model, in percent.
    pub magnitude_pct: f64,
    pub strength: SignalStrength,
    /// [0, 1], already discounted for snapshot staleness.
    pub confidence: f64,
    pub market_mid: f64,
    pub theoretical: f64,
    pub snapshot_version: u64,
    pub params_version: u64,
}

/// Strength banding. The comparison uses the magnitude rounded to the
/// nearest percent so a 14.9% edge lands in the same band as 15%; raw
/// magnitudes still drive filtering and ranking.
fn band(magnitude_abs: f64, cfg: &AppConfig) -> SignalStrength {
    let m = magnitude_abs.round();
    if m >= cfg.very_strong_mispricing_pct {
        SignalStrength::VeryStrong
    } else if m >= cfg.strong_mispricing_pct {
        SignalStrength::Strong
    } else if m >= 2.0 * cfg.min_mispricing_pct {
        SignalStrength::Medium
    } else {
        SignalStrength::Weak
    }
}

/// Additive confidence score, built from observable quote quality and edge
/// size, then scaled by the staleness factor. Expressed in [0, 1].
fn confidence(quote: &OptionQuote, magnitude_abs: f64, staleness_factor: f64) -> f64 {
    let mut score: f64 = 50.0;

    if quote.volume >= 100 {
        score += 15.0;
    } else if quote.volume >= 50 {
        score += 10.0;
    } else if quote.volume >= 20 {
        score += 5.0;
    }

    let spread_ratio = quote.spread_ratio();
    if spread_ratio <= 0.02 {
        score += 15.0;
    } else if spread_ratio <= 0.05 {
        score += 10.0;
    } else if spread_ratio <= 0.08 {
        score += 5.0;
    }

    if quote.mid() >= 2.0 {
        score += 10.0;
    } else if quote.mid() >= 1.0 {
        score += 5.0;
    }

    if magnitude_abs >= 20.0 {
        score += 15.0;
    } else if magnitude_abs >= 15.0 {
        score += 10.0;
    } else if magnitude_abs >= 10.0 {
        score += 5.0;
    }

    (score.clamp(0.0, 100.0) / 100.0) * staleness_factor
}

/// Detect and rank mispricings for one cycle.
///
/// Ranking: |magnitude| descending, ties broken by volume, then open
/// interest, then the contract key, so the output order is total.
pub fn generate_signals(
    snapshot: &MarketSnapshot,
    pricing: &[PricingResult],
    cfg: &AppConfig,
    staleness_factor: f64,
) -> Vec<Signal> {
    let mut signals: Vec<(Signal, i64, i64)> = Vec::new();

    for result in pricing {
        let Some(quote) = snapshot.quotes.get(&result.contract) else {
            continue;
        };
        if !quote.is_two_sided() {
            continue;
        }
        let mid = quote.mid();
        let theo = result.price;
        if mid < cfg.min_option_price || theo <= 0.0 {
            continue;
        }
        if quote.spread_ratio() > cfg.max_spread_ratio {
            continue;
        }
        if quote.volume < cfg.min_volume || quote.open_interest < cfg.min_open_interest {
            continue;
        }

        let magnitude_pct = (mid - theo) / theo * 100.0;
        if magnitude_pct.abs() < cfg.min_mispricing_pct {
            continue;
        }

        let direction = if magnitude_pct > 0.0 {
            SignalDirection::Overpriced
        } else {
            SignalDirection::Underpriced
        };
        let conf = confidence(quote, magnitude_pct.abs(), staleness_factor);
        if conf < cfg.min_signal_confidence {
            continue;
        }

        signals.push((
            Signal {
                contract: result.contract.clone(),
                direction,
                magnitude_pct,
                strength: band(magnitude_pct.abs(), cfg),
                confidence: conf,
                market_mid: mid,
                theoretical: theo,
                snapshot_version: snapshot.version,
                params_version: result.params_version,
            },
            quote.volume,
            quote.open_interest,
        ));
    }

    signals.sort_by(|(a, va, oa), (b, vb, ob)| {
        b.magnitude_pct
            .abs()
            .total_cmp(&a.magnitude_pct.abs())
            .then(vb.cmp(va))
            .then(ob.cmp(oa))
            .then(a.contract.key().cmp(&b.contract.key()))
    });

    signals.into_iter().map(|(s, _, _)| s).collect()
}
