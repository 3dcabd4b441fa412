//! Per-Tier Auction Clearing
//!
//! Each tier is sold to a single winner through a second-price auction with a
//! per-bidder reserve:
//! 1. Bids are ranked by amount, highest first (ties keep submission order)
//! 2. The top bidder wins
//! 3. The winner pays `max(second-highest bid, own reserve)`
//!
//! The payment never depends on the winner's own bid, which makes truthful
//! bidding a dominant strategy (DSIC).

use std::collections::HashMap;

use crate::market::AgentId;

/// A single sealed bid for one tier.
#[derive(Clone, Debug, PartialEq)]
pub struct Bid {
    pub agent: AgentId,
    pub tier: usize,
    pub amount: f64,
}

impl Bid {
    pub fn new(agent: impl Into<AgentId>, tier: usize, amount: f64) -> Self {
        Self {
            agent: agent.into(),
            tier,
            amount,
        }
    }
}

/// Outcome of clearing one tier.
#[derive(Clone, Debug, PartialEq)]
pub struct Clearing {
    pub winner: AgentId,
    pub payment: f64,
    pub winning_bid: f64,
    pub second_bid: f64,
}

/// Solidarity levy for tier `k`: a `lambda` fraction of the tier's price step.
pub fn solidarity_reserve(prices: &[f64], k: usize, lambda: f64) -> f64 {
    let below = if k > 0 { prices[k - 1] } else { 0.0 };
    lambda * (prices[k] - below)
}

/// Clear one tier. Returns `None` for an empty bid set.
///
/// # Panics
/// If the winner has no entry in `reserves`. Callers build the reserve map from
/// the same bid set, so a missing entry is a broken invariant.
pub fn resolve_tier(bids: &[Bid], reserves: &HashMap<AgentId, f64>) -> Option<Clearing> {
    let mut ranked: Vec<&Bid> = bids.iter().collect();
    // sort_by is stable, so equal amounts keep submission order
    ranked.sort_by(|a, b| b.amount.total_cmp(&a.amount));

    let winner = *ranked.first()?;
    let second_bid = ranked.get(1).map_or(0.0, |b| b.amount);
    let reserve = match reserves.get(&winner.agent) {
        Some(r) => *r,
        None => panic!("no reserve entry for bidder {}", winner.agent),
    };

    Some(Clearing {
        winner: winner.agent.clone(),
        payment: second_bid.max(reserve),
        winning_bid: winner.amount,
        second_bid,
    })
}

/// Reserve map for every bidder in `bids`, all competing for tier `k`.
pub fn tier_reserves(
    bids: &[Bid],
    prices: &[f64],
    k: usize,
    lambda: f64,
) -> HashMap<AgentId, f64> {
    let reserve = solidarity_reserve(prices, k, lambda);
    bids.iter().map(|b| (b.agent.clone(), reserve)).collect()
}
