//! Position sizing: conservative Kelly for the directional leg plus a
//! separate capital budget for mergeable matched-pair inventory.
//!
//! The directional stake follows fractional Kelly on the calibrated low
//! estimate of the win probability, throttled by confidence and the regime
//! multiplier. The mergeable target only exists while a pair bought at
//! combined price < 1 still clears fees and gas.

use crate::config::SizingConfig;
use crate::types::Confidence;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

/// Inputs for one game's sizing decision
#[derive(Debug, Clone)]
pub struct SizingInputs {
    /// Best ask on the backed side
    pub dir_price: f64,
    /// Best ask on the opposite side; defaults to 1 - dir_price
    pub opp_price: Option<f64>,
    /// Conservative calibrated win probability
    pub p_low: f64,
    pub confidence: Confidence,
    /// Account balance available for sizing, USD
    pub balance_usd: f64,
    /// External de-risking lever in [0, 1]
    pub regime_multiplier: f64,
}

/// Share and dollar targets for one game
#[derive(Debug, Clone, PartialEq)]
pub struct SizingTargets {
    /// Directional-only stake, USD
    pub directional_usd: f64,
    /// Directional-only share count (D*)
    pub directional_shares: f64,
    /// Matched-pair share count (M*)
    pub mergeable_shares: f64,
    /// q_dir target = M* + D*
    pub q_dir_target: f64,
    /// q_opp target = M* (the hedge leg matches only the mergeable portion)
    pub q_opp_target: f64,
    /// Per-share merge edge after amortized fee + gas
    pub merge_edge_per_share: f64,
}

impl SizingTargets {
    pub fn zero() -> Self {
        Self {
            directional_usd: 0.0,
            directional_shares: 0.0,
            mergeable_shares: 0.0,
            q_dir_target: 0.0,
            q_opp_target: 0.0,
            merge_edge_per_share: 0.0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.q_dir_target <= 0.0 && self.q_opp_target <= 0.0
    }

    pub fn directional_shares_dec(&self) -> Decimal {
        Decimal::from_f64(self.directional_shares).unwrap_or(Decimal::ZERO)
    }

    pub fn mergeable_shares_dec(&self) -> Decimal {
        Decimal::from_f64(self.mergeable_shares).unwrap_or(Decimal::ZERO)
    }
}

/// Fractional-Kelly stake fraction for a binary payout bought at `price`.
///
/// b = 1/price - 1 is the net odds; the optimum (b*p - q) / b is floored
/// at zero so a negative edge sizes nothing.
pub fn kelly_fraction(p: f64, price: f64) -> f64 {
    if !(0.0..1.0).contains(&price) || price <= 0.0 || !(0.0..=1.0).contains(&p) {
        return 0.0;
    }
    let b = 1.0 / price - 1.0;
    if b <= 0.0 {
        return 0.0;
    }
    ((b * p - (1.0 - p)) / b).max(0.0)
}

/// Per-share profit of merging one matched pair bought at the given prices,
/// with fee + gas amortized over the configured share count.
pub fn merge_edge_per_share(dir_price: f64, opp_price: f64, config: &SizingConfig) -> f64 {
    let combined = dir_price + opp_price;
    let amortized_costs = if config.assumed_merge_shares > 0.0 {
        (config.expected_merge_fee_usd + config.expected_merge_gas_usd)
            / config.assumed_merge_shares
    } else {
        f64::INFINITY
    };
    1.0 - combined - amortized_costs
}

/// Sizing engine: turns calibrated probability + market prices into
/// directional and mergeable share targets.
pub struct SizingEngine {
    config: SizingConfig,
    /// Hedge-to-directional capital ratio published by the optimizer;
    /// caps matched-pair capital relative to the directional stake
    hedge_ratio: f64,
}

impl SizingEngine {
    pub fn new(config: SizingConfig, hedge_ratio: f64) -> Self {
        Self {
            config,
            hedge_ratio,
        }
    }

    /// Compute D* and M* for one game. A zeroed regime multiplier or a
    /// non-positive merge edge produces zero targets without error.
    pub fn compute_targets(&self, inputs: &SizingInputs) -> SizingTargets {
        let regime = inputs.regime_multiplier.clamp(0.0, 1.0);
        let dir_price = inputs.dir_price;
        if dir_price <= 0.0 || dir_price >= 1.0 {
            return SizingTargets::zero();
        }
        let opp_price = inputs.opp_price.unwrap_or(1.0 - dir_price).max(0.0);

        // Directional leg: fractional Kelly, throttled and capped
        let kelly = kelly_fraction(inputs.p_low, dir_price);
        let raw_usd = inputs.balance_usd
            * self.config.kelly_base_fraction
            * kelly
            * inputs.confidence.multiplier()
            * regime;
        let directional_usd = raw_usd
            .min(self.config.max_position_usd)
            .min(self.config.max_game_risk_usd)
            .max(0.0);
        let directional_shares = directional_usd / dir_price;

        // Mergeable leg: only while the pair still clears its costs
        let edge = merge_edge_per_share(dir_price, opp_price, &self.config);
        let combined = dir_price + opp_price;
        let mergeable_shares = if edge > 0.0 && combined > 0.0 {
            let remaining_risk = (self.config.max_game_risk_usd - directional_usd).max(0.0);
            let ratio_cap = self.hedge_ratio.max(0.0) * directional_usd / opp_price.max(1e-9)
                * combined;
            let merge_budget = self
                .config
                .merge_capital_usd
                .min(self.config.max_position_usd)
                .min(remaining_risk)
                .min(ratio_cap)
                * regime;
            merge_budget / combined
        } else {
            0.0
        };

        SizingTargets {
            directional_usd,
            directional_shares,
            mergeable_shares,
            q_dir_target: mergeable_shares + directional_shares,
            q_opp_target: mergeable_shares,
            merge_edge_per_share: edge,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SizingEngine {
        SizingEngine::new(
            SizingConfig {
                kelly_base_fraction: 0.25,
                max_position_usd: 100.0,
                max_game_risk_usd: 250.0,
                merge_capital_usd: 150.0,
                expected_merge_fee_usd: 0.0,
                expected_merge_gas_usd: 0.05,
                assumed_merge_shares: 100.0,
            },
            0.5,
        )
    }

    fn inputs() -> SizingInputs {
        SizingInputs {
            dir_price: 0.60,
            opp_price: Some(0.37),
            p_low: 0.66,
            confidence: Confidence::High,
            balance_usd: 1000.0,
            regime_multiplier: 1.0,
        }
    }

    #[test]
    fn test_kelly_fraction_known_values() {
        // p=0.66 at price 0.60: b = 2/3, kelly = (2/3*0.66 - 0.34) / (2/3) = 0.15
        let k = kelly_fraction(0.66, 0.60);
        assert!((k - 0.15).abs() < 1e-9);

        // No edge: p equal to price
        assert_eq!(kelly_fraction(0.60, 0.60), 0.0);
        // Negative edge floors at zero
        assert_eq!(kelly_fraction(0.40, 0.60), 0.0);
        // Degenerate prices size nothing
        assert_eq!(kelly_fraction(0.66, 0.0), 0.0);
        assert_eq!(kelly_fraction(0.66, 1.0), 0.0);
    }

    #[test]
    fn test_targets_shape() {
        let targets = engine().compute_targets(&inputs());
        assert!(targets.directional_shares > 0.0);
        assert!(targets.mergeable_shares > 0.0);
        assert!(
            (targets.q_dir_target - (targets.mergeable_shares + targets.directional_shares)).abs()
                < 1e-9
        );
        assert!((targets.q_opp_target - targets.mergeable_shares).abs() < 1e-9);
    }

    #[test]
    fn test_regime_zero_is_noop() {
        let mut i = inputs();
        i.regime_multiplier = 0.0;
        let targets = engine().compute_targets(&i);
        assert!(targets.is_zero());
        // Edge is still reported; only sizing is throttled
        assert!(targets.merge_edge_per_share > 0.0);
    }

    #[test]
    fn test_no_edge_no_merge_target() {
        let mut i = inputs();
        // Combined price 1.02: merging locks in a loss
        i.opp_price = Some(0.42);
        let targets = engine().compute_targets(&i);
        assert_eq!(targets.mergeable_shares, 0.0);
        assert_eq!(targets.q_opp_target, 0.0);
        assert!(targets.merge_edge_per_share <= 0.0);
        // Directional leg is unaffected
        assert!(targets.directional_shares > 0.0);
    }

    #[test]
    fn test_opp_price_defaults_to_complement() {
        let mut i = inputs();
        i.opp_price = None;
        let targets = engine().compute_targets(&i);
        // Combined = 1.0 exactly, so edge is -costs and M* = 0
        assert!(targets.merge_edge_per_share < 0.0);
        assert_eq!(targets.mergeable_shares, 0.0);
    }

    #[test]
    fn test_hedge_ratio_caps_mergeable_capital() {
        let full = engine().compute_targets(&inputs());

        let tight = SizingEngine::new(
            SizingConfig {
                expected_merge_fee_usd: 0.0,
                expected_merge_gas_usd: 0.05,
                assumed_merge_shares: 100.0,
                ..SizingConfig::default()
            },
            0.1,
        );
        let capped = tight.compute_targets(&inputs());
        assert!(capped.mergeable_shares < full.mergeable_shares);

        // Ratio zero means no matched-pair inventory at all
        let none = SizingEngine::new(SizingConfig::default(), 0.0);
        assert_eq!(none.compute_targets(&inputs()).mergeable_shares, 0.0);
    }

    #[test]
    fn test_position_cap_applies() {
        let mut i = inputs();
        i.balance_usd = 1_000_000.0;
        let targets = engine().compute_targets(&i);
        assert!(targets.directional_usd <= 100.0 + 1e-9);
    }

    #[test]
    fn test_confidence_throttles() {
        let high = engine().compute_targets(&inputs());
        let mut i = inputs();
        i.confidence = Confidence::Low;
        let low = engine().compute_targets(&i);
        assert!(low.directional_usd < high.directional_usd);
    }

    #[test]
    fn test_targets_never_negative() {
        for price in [0.05, 0.5, 0.95] {
            for p in [0.01, 0.5, 0.99] {
                for regime in [0.0, 0.5, 1.0] {
                    let t = engine().compute_targets(&SizingInputs {
                        dir_price: price,
                        opp_price: None,
                        p_low: p,
                        confidence: Confidence::Medium,
                        balance_usd: 500.0,
                        regime_multiplier: regime,
                    });
                    assert!(t.directional_shares >= 0.0);
                    assert!(t.mergeable_shares >= 0.0);
                    assert!(t.q_dir_target >= 0.0);
                    assert!(t.q_opp_target >= 0.0);
                }
            }
        }
    }
}
