//! Price Ladder Adaptation
//!
//! One projected-gradient step per epoch:
//!
//! ```text
//! grad_k = -sales_k + beta * 2 * (gini - target) + zeta * 2 * (1 - sold)
//! raw    = p - eta * grad
//! next   = project(raw)
//! ```
//!
//! `project` is total: whatever `raw` holds, the result satisfies
//! `0 < next[0] < next[1] < ... < next[K-1]`.

use serde::{Deserialize, Serialize};

use crate::config::MarketConfig;
use crate::error::ConfigError;

/// Smallest admissible price.
pub const PRICE_FLOOR: f64 = 1e-3;
/// Raw values are clamped here before projection so sums cannot overflow.
pub const PRICE_CEILING: f64 = 1e12;
/// Per-index offset turning a non-decreasing ladder into a strictly increasing one.
pub const STRICT_EPS: f64 = 1e-6;

/// A strictly increasing vector of positive tier prices.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct PriceVector(Vec<f64>);

impl PriceVector {
    pub fn new(prices: Vec<f64>) -> Result<Self, ConfigError> {
        let valid = !prices.is_empty()
            && prices.iter().all(|p| p.is_finite() && *p > 0.0)
            && prices.windows(2).all(|w| w[0] < w[1]);
        if valid {
            Ok(Self(prices))
        } else {
            Err(ConfigError::InvalidPrices(prices))
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<f64>> for PriceVector {
    type Error = ConfigError;

    fn try_from(prices: Vec<f64>) -> Result<Self, Self::Error> {
        Self::new(prices)
    }
}

impl From<PriceVector> for Vec<f64> {
    fn from(prices: PriceVector) -> Self {
        prices.0
    }
}

/// End-of-epoch statistics driving the ladder step.
#[derive(Clone, Debug, PartialEq)]
pub struct EpochStats {
    /// Units cleared per tier
    pub sales: Vec<f64>,
    pub revenue: f64,
    /// Gini coefficient of effective prices paid
    pub gini: f64,
    /// Fraction of total inventory sold, in [0, 1]
    pub fraction_sold: f64,
}

/// Gini coefficient of `values`. Negative entries count as zero.
pub fn gini(values: &[f64]) -> f64 {
    let mut sorted: Vec<f64> = values.iter().map(|v| v.max(0.0)).collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let n = sorted.len() as f64;
    let total: f64 = sorted.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return 0.0;
    }

    let weighted: f64 = sorted
        .iter()
        .enumerate()
        .map(|(i, &v)| (2.0 * (i as f64 + 1.0) - n - 1.0) * v)
        .sum();
    weighted / (n * total)
}

/// Least-squares non-decreasing fit (pool adjacent violators), unit weights.
pub fn isotonic_increasing(values: &[f64]) -> Vec<f64> {
    // each block: (sum, count)
    let mut blocks: Vec<(f64, usize)> = Vec::with_capacity(values.len());
    for &v in values {
        blocks.push((v, 1));
        while blocks.len() > 1 {
            let (s1, c1) = blocks[blocks.len() - 1];
            let (s0, c0) = blocks[blocks.len() - 2];
            if s0 / c0 as f64 <= s1 / c1 as f64 {
                break;
            }
            blocks.pop();
            let last = blocks.len() - 1;
            blocks[last] = (s0 + s1, c0 + c1);
        }
    }

    let mut out = Vec::with_capacity(values.len());
    for (sum, count) in blocks {
        out.extend(std::iter::repeat(sum / count as f64).take(count));
    }
    out
}

fn sanitize(x: f64) -> f64 {
    if x.is_nan() {
        PRICE_FLOOR
    } else {
        x.clamp(-PRICE_CEILING, PRICE_CEILING)
    }
}

/// Smallest value the next rung may take above `x`.
fn step_above(x: f64) -> f64 {
    let y = x + STRICT_EPS;
    if y > x {
        y
    } else {
        // eps vanished at this magnitude; move one ulp (x is positive and finite)
        f64::from_bits(x.to_bits() + 1)
    }
}

/// Project an arbitrary vector onto `0 < p_0 < p_1 < ... < p_{K-1}`.
pub fn project_sorted_positive(raw: &[f64]) -> Vec<f64> {
    let clean: Vec<f64> = raw.iter().map(|&x| sanitize(x)).collect();
    let mut out: Vec<f64> = isotonic_increasing(&clean)
        .into_iter()
        .enumerate()
        .map(|(i, p)| (p + STRICT_EPS * (i as f64 + 1.0)).max(PRICE_FLOOR))
        .collect();

    // floor clamping and rounding can reintroduce ties
    for i in 1..out.len() {
        let min_next = step_above(out[i - 1]);
        if out[i] < min_next {
            out[i] = min_next;
        }
    }
    out
}

/// Per-tier gradient of the ladder objective.
pub fn ladder_gradient(stats: &EpochStats, tiers: usize, cfg: &MarketConfig) -> Vec<f64> {
    let shared = cfg.gini_weight * 2.0 * (stats.gini - cfg.gini_target)
        + cfg.inventory_weight * 2.0 * (1.0 - stats.fraction_sold);
    (0..tiers)
        .map(|k| -stats.sales.get(k).copied().unwrap_or(0.0) + shared)
        .collect()
}

/// Next epoch's ladder. Revenue is reported in `stats` but does not enter the step.
pub fn update_prices(prices: &PriceVector, stats: &EpochStats, cfg: &MarketConfig) -> PriceVector {
    let grad = ladder_gradient(stats, prices.len(), cfg);
    let raw: Vec<f64> = prices
        .as_slice()
        .iter()
        .zip(&grad)
        .map(|(p, g)| p - cfg.step_size * g)
        .collect();
    PriceVector(project_sorted_positive(&raw))
}
