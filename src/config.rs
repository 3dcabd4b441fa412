//! Marketplace Configuration
//!
//! A `MarketConfig` is an immutable snapshot. The environment receives one at
//! construction and may be handed a new one through
//! `MarketplaceEnv::schedule_config`, which takes effect at the next epoch
//! boundary.

use rand_distr::LogNormal;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_TIERS: usize = 4;
pub const DEFAULT_SOLIDARITY_FACTOR: f64 = 0.20;
pub const DEFAULT_POVERTY_LINE: f64 = 1e4;

/// Parameters of the entropic optimal-transport solve.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RebateParams {
    /// Entropic regularization strength.
    pub reg: f64,
    pub max_iter: usize,
    /// L1 tolerance on the donor marginal.
    pub tol: f64,
}

impl Default for RebateParams {
    fn default() -> Self {
        Self {
            reg: 1e-3,
            max_iter: 1000,
            tol: 1e-9,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Number of price tiers (K)
    pub tiers: usize,
    /// Solidarity factor (lambda), fraction of each price step taken as reserve
    pub solidarity_factor: f64,
    /// Gini penalty weight (beta)
    pub gini_weight: f64,
    /// Inventory penalty weight (zeta)
    pub inventory_weight: f64,
    pub gini_target: f64,
    /// Epochs a minted token stays redistributable
    pub token_expiry: u64,
    /// Ladder step size (eta)
    pub step_size: f64,
    /// Units per tier per epoch
    pub unit_stock: u32,
    /// Buyers strictly below this income receive rebates
    pub poverty_line: f64,
    pub rebate: RebateParams,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            tiers: DEFAULT_TIERS,
            solidarity_factor: DEFAULT_SOLIDARITY_FACTOR,
            gini_weight: 400.0,
            inventory_weight: 50.0,
            gini_target: 0.25,
            token_expiry: 3,
            step_size: 0.10,
            unit_stock: 30,
            poverty_line: DEFAULT_POVERTY_LINE,
            rebate: RebateParams::default(),
        }
    }
}

impl MarketConfig {
    pub fn with_tiers(mut self, tiers: usize) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn with_solidarity_factor(mut self, lambda: f64) -> Self {
        self.solidarity_factor = lambda;
        self
    }

    pub fn with_unit_stock(mut self, unit_stock: u32) -> Self {
        self.unit_stock = unit_stock;
        self
    }

    pub fn with_poverty_line(mut self, poverty_line: f64) -> Self {
        self.poverty_line = poverty_line;
        self
    }

    pub fn with_token_expiry(mut self, token_expiry: u64) -> Self {
        self.token_expiry = token_expiry;
        self
    }

    /// Total units offered per epoch across all tiers.
    pub fn total_inventory(&self) -> f64 {
        self.unit_stock as f64 * self.tiers as f64
    }

    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers == 0 {
            return Err(ConfigError::NoTiers);
        }
        if !(0.0..=1.0).contains(&self.solidarity_factor) {
            return Err(ConfigError::SolidarityFactor(self.solidarity_factor));
        }
        for (name, value) in [
            ("gini_weight", self.gini_weight),
            ("inventory_weight", self.inventory_weight),
            ("gini_target", self.gini_target),
            ("step_size", self.step_size),
            ("rebate.tol", self.rebate.tol),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::NegativeParameter { name, value });
            }
        }
        if self.unit_stock == 0 {
            return Err(ConfigError::NoStock);
        }
        if !self.poverty_line.is_finite() {
            return Err(ConfigError::PovertyLine(self.poverty_line));
        }
        if !self.rebate.reg.is_finite() || self.rebate.reg <= 0.0 {
            return Err(ConfigError::Regularization(self.rebate.reg));
        }
        if self.rebate.max_iter == 0 {
            return Err(ConfigError::IterationCap);
        }
        Ok(())
    }

    /// Validate against a concrete ladder length.
    pub fn validate_for(&self, tiers: usize) -> Result<(), ConfigError> {
        self.validate()?;
        if self.tiers != tiers {
            return Err(ConfigError::TierMismatch {
                config: self.tiers,
                prices: tiers,
            });
        }
        Ok(())
    }
}

/// Log-normal sampler. Each parameter is checked on its own so the error
/// names the one that is wrong.
pub fn log_normal(
    mu_name: &'static str,
    mu: f64,
    sigma_name: &'static str,
    sigma: f64,
) -> Result<LogNormal<f64>, ConfigError> {
    if !mu.is_finite() {
        return Err(ConfigError::NonFinite {
            name: mu_name,
            value: mu,
        });
    }
    let bad_sigma = ConfigError::NegativeParameter {
        name: sigma_name,
        value: sigma,
    };
    if !sigma.is_finite() || sigma < 0.0 {
        return Err(bad_sigma);
    }
    LogNormal::new(mu, sigma).map_err(|_| bad_sigma)
}
