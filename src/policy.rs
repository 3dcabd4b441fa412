//! Reference Buyer Policies
//!
//! The environment only needs a mapping from an observation to an action.
//! Two baselines are provided:
//! - `TruthfulPolicy`: bid the full surplus on the highest affordable tier
//! - `MarginPolicy`: shade bids below surplus to keep a margin
//!
//! Any `FnMut(&Observation) -> Action` closure is also a policy.

use rand::prelude::*;
use rand_distr::{Distribution, LogNormal};

use crate::auction::solidarity_reserve;
use crate::config::log_normal;
use crate::error::ConfigError;
use crate::market::{Action, Observation};

/// Bid placed above the reserve when shading would undercut it.
pub const RESERVE_BUFFER: f64 = 0.01;
/// Location and scale of the log-normal shading noise.
pub const SHADE_NOISE_MU: f64 = -0.5;
pub const SHADE_NOISE_SIGMA: f64 = 0.4;

pub trait Policy {
    fn act(&mut self, obs: &Observation) -> Action;
}

impl<F> Policy for F
where
    F: FnMut(&Observation) -> Action,
{
    fn act(&mut self, obs: &Observation) -> Action {
        self(obs)
    }
}

/// A tier is affordable when income plus credit covers price plus reserve.
fn affordable(obs: &Observation, k: usize, reserve: f64) -> bool {
    obs.income >= obs.prices[k] + reserve - obs.credit
}

#[derive(Clone, Debug)]
pub struct TruthfulPolicy {
    pub solidarity_factor: f64,
}

impl TruthfulPolicy {
    pub fn new(solidarity_factor: f64) -> Self {
        Self { solidarity_factor }
    }
}

impl Policy for TruthfulPolicy {
    fn act(&mut self, obs: &Observation) -> Action {
        for k in (0..obs.tiers()).rev() {
            let reserve = solidarity_reserve(&obs.prices, k, self.solidarity_factor);
            if affordable(obs, k, reserve) {
                // credit can make a tier affordable above income; bids stay non-negative
                let surplus = (obs.income - obs.prices[k]).max(0.0);
                return Action::Bid {
                    tier: k,
                    amount: surplus,
                };
            }
        }
        Action::WalkAway
    }
}

/// Shades every affordable tier's surplus and picks the tier with the best
/// expected margin.
#[derive(Clone, Debug)]
pub struct MarginPolicy {
    pub solidarity_factor: f64,
    pub shade_factor: f64,
    /// Multiplicative shading noise; `None` shades deterministically
    noise: Option<LogNormal<f64>>,
    rng: StdRng,
}

impl MarginPolicy {
    pub fn new(solidarity_factor: f64, seed: u64) -> Result<Self, ConfigError> {
        let noise = log_normal(
            "shade_noise_mu",
            SHADE_NOISE_MU,
            "shade_noise_sigma",
            SHADE_NOISE_SIGMA,
        )?;
        Ok(Self {
            solidarity_factor,
            shade_factor: 0.7,
            noise: Some(noise),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn with_shade_factor(mut self, shade_factor: f64) -> Self {
        self.shade_factor = shade_factor;
        self
    }

    pub fn deterministic(mut self) -> Self {
        self.noise = None;
        self
    }

    fn shade_noise(&mut self) -> f64 {
        match &self.noise {
            Some(dist) => dist.sample(&mut self.rng),
            None => 1.0,
        }
    }
}

impl Policy for MarginPolicy {
    fn act(&mut self, obs: &Observation) -> Action {
        let mut best: Option<(usize, f64, f64)> = None;

        for k in (0..obs.tiers()).rev() {
            let reserve = solidarity_reserve(&obs.prices, k, self.solidarity_factor);
            if !affordable(obs, k, reserve) {
                continue;
            }
            let surplus = obs.income - obs.prices[k];
            let shaded = surplus * self.shade_factor * self.shade_noise();
            let bid = shaded.max(reserve + RESERVE_BUFFER);
            let margin = surplus - bid;

            if best.map_or(true, |(_, _, m)| margin > m) {
                best = Some((k, bid, margin));
            }
        }

        match best {
            Some((tier, amount, _)) => Action::Bid { tier, amount },
            None => Action::WalkAway,
        }
    }
}
