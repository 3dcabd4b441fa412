//! Marketplace Environment
//!
//! Owns buyer state and drives the day/night epoch cycle.
//!
//! ## Day
//! Every buyer submits exactly one action: a bid on one tier, or walk away.
//! Each submission is terminal for that buyer until the next day.
//!
//! ## Night
//! Runs once every buyer has acted:
//! 1. Clear each tier that received bids; mint the winner's payment
//! 2. Rebate live ledger value to buyers below the poverty line
//! 3. Expire ledger records older than the token horizon
//! 4. Measure the Gini of effective prices and step the price ladder
//! 5. Advance the epoch and open a fresh day
//!
//! Credits and prices are staged and only committed when the whole closure
//! succeeds. A failed closure leaves the day closed but intact: the queued
//! bids stay, and `close_night` retries it. Tiers whose levy already reached
//! the ledger are not minted again on retry.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auction::{resolve_tier, tier_reserves, Bid};
use crate::config::MarketConfig;
use crate::error::{ConfigError, MarketError};
use crate::ladder::{gini, update_prices, EpochStats, PriceVector};
use crate::ledger::TokenLedger;
use crate::rebate::{rebate, MASS_EPSILON};

pub type AgentId = String;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Buyer {
    pub income: f64,
    /// Accumulated fairness rebates
    pub credit: f64,
}

impl Buyer {
    pub fn new(income: f64) -> Self {
        Self {
            income,
            credit: 0.0,
        }
    }

    /// Highest tier this buyer can afford, scanning from the top:
    /// `income >= price[k] - credit`.
    pub fn assigned_tier(&self, prices: &[f64]) -> Option<usize> {
        (0..prices.len())
            .rev()
            .find(|&k| self.income >= prices[k] - self.credit)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Action {
    Bid { tier: usize, amount: f64 },
    WalkAway,
}

impl Action {
    /// Map the flat `(tier, amount)` encoding, where `tier == tiers` means walk away.
    pub fn from_raw(tier: usize, amount: f64, tiers: usize) -> Self {
        if tier == tiers {
            Self::WalkAway
        } else {
            Self::Bid { tier, amount }
        }
    }
}

/// What a buyer sees: the current ladder plus its own income and credit.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub prices: Vec<f64>,
    pub income: f64,
    pub credit: f64,
}

impl Observation {
    pub fn tiers(&self) -> usize {
        self.prices.len()
    }

    /// Flat encoding `prices ++ [income, credit]`.
    pub fn to_vec(&self) -> Vec<f64> {
        let mut v = self.prices.clone();
        v.push(self.income);
        v.push(self.credit);
        v
    }

    pub fn from_slice(obs: &[f64]) -> Option<Self> {
        if obs.len() < 3 {
            return None;
        }
        let (prices, tail) = obs.split_at(obs.len() - 2);
        Some(Self {
            prices: prices.to_vec(),
            income: tail[0],
            credit: tail[1],
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TierClearing {
    pub tier: usize,
    pub winner: AgentId,
    /// Clearing payment, minted into the ledger
    pub payment: f64,
    /// Listed tier price, booked as revenue
    pub price: f64,
}

/// Everything that happened during one night closure.
#[derive(Clone, Debug, PartialEq)]
pub struct EpochReport {
    pub epoch: u64,
    /// Ladder in effect during the epoch
    pub prices: Vec<f64>,
    /// Ladder for the next epoch
    pub next_prices: Vec<f64>,
    pub revenue: f64,
    pub sales: Vec<u32>,
    pub stock_remaining: Vec<u32>,
    pub clearings: Vec<TierClearing>,
    pub minted: f64,
    pub redistributed: f64,
    pub recipients: usize,
    pub expired: f64,
    pub gini: f64,
    pub fraction_sold: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StepOutcome {
    pub observations: BTreeMap<AgentId, Observation>,
    pub rewards: BTreeMap<AgentId, f64>,
    pub terminations: BTreeMap<AgentId, bool>,
    /// Present when this step completed the day and the night closure ran
    pub report: Option<EpochReport>,
}

pub struct MarketplaceEnv<L: TokenLedger> {
    buyers: BTreeMap<AgentId, Buyer>,
    prices: PriceVector,
    config: MarketConfig,
    pending_config: Option<MarketConfig>,
    ledger: L,
    epoch: u64,

    stock: Vec<u32>,
    sales: Vec<u32>,
    bids: Vec<Vec<Bid>>,
    acted: BTreeSet<AgentId>,
    /// Tiers whose levy is already on the ledger for the current epoch
    minted_tiers: Vec<bool>,
}

impl<L: TokenLedger> MarketplaceEnv<L> {
    pub fn new(
        incomes: BTreeMap<AgentId, f64>,
        initial_prices: Vec<f64>,
        config: MarketConfig,
        ledger: L,
    ) -> Result<Self, MarketError> {
        let prices = PriceVector::new(initial_prices)?;
        config.validate_for(prices.len())?;

        let mut buyers = BTreeMap::new();
        for (id, income) in incomes {
            if !income.is_finite() || income < 0.0 {
                return Err(MarketError::InvalidIncome(id));
            }
            buyers.insert(id, Buyer::new(income));
        }

        let tiers = prices.len();
        let mut env = Self {
            buyers,
            prices,
            config,
            pending_config: None,
            ledger,
            epoch: 0,
            stock: vec![0; tiers],
            sales: vec![0; tiers],
            bids: vec![Vec::new(); tiers],
            acted: BTreeSet::new(),
            minted_tiers: vec![false; tiers],
        };
        env.start_day();
        Ok(env)
    }

    /// Restart the current day and return fresh observations. The epoch
    /// counter is unchanged. Refused once any buyer has acted this epoch.
    pub fn reset(&mut self) -> Result<BTreeMap<AgentId, Observation>, MarketError> {
        if !self.acted.is_empty() {
            return Err(MarketError::DayInProgress {
                epoch: self.epoch,
                acted: self.acted.len(),
            });
        }
        self.start_day();
        Ok(self.observations())
    }

    /// Submit one action per listed buyer. Runs the night closure once every
    /// buyer has acted this epoch.
    pub fn step(
        &mut self,
        actions: BTreeMap<AgentId, Action>,
    ) -> Result<StepOutcome, MarketError> {
        let tiers = self.prices.len();
        for (agent, action) in &actions {
            if !self.buyers.contains_key(agent) {
                return Err(MarketError::UnknownAgent(agent.clone()));
            }
            if self.acted.contains(agent) {
                return Err(MarketError::AlreadyActed(agent.clone()));
            }
            if let Action::Bid { tier, amount } = *action {
                // tier == tiers is the flat walk-away sentinel
                if tier > tiers {
                    return Err(MarketError::InvalidTier {
                        agent: agent.clone(),
                        tier,
                        tiers,
                    });
                }
                if tier < tiers && (!amount.is_finite() || amount < 0.0) {
                    return Err(MarketError::InvalidBid {
                        agent: agent.clone(),
                        amount,
                    });
                }
            }
        }

        for (agent, action) in actions {
            if let Action::Bid { tier, amount } = action {
                if tier < tiers && self.stock[tier] > 0 {
                    self.bids[tier].push(Bid::new(agent.clone(), tier, amount));
                }
            }
            self.acted.insert(agent);
        }

        let terminations: BTreeMap<AgentId, bool> = self
            .buyers
            .keys()
            .map(|id| (id.clone(), self.acted.contains(id)))
            .collect();
        let rewards: BTreeMap<AgentId, f64> =
            self.buyers.keys().map(|id| (id.clone(), 0.0)).collect();

        let report = if self.acted.len() == self.buyers.len() {
            Some(self.night_closure()?)
        } else {
            None
        };

        Ok(StepOutcome {
            observations: self.observations(),
            rewards,
            terminations,
            report,
        })
    }

    /// Run the night closure for a day on which every buyer has acted. This
    /// is how a closure that failed inside `step` is retried.
    pub fn close_night(&mut self) -> Result<EpochReport, MarketError> {
        let waiting = self.buyers.len() - self.acted.len();
        if waiting > 0 {
            return Err(MarketError::DayOpen { waiting });
        }
        self.night_closure()
    }

    /// Queue a configuration snapshot for the next epoch boundary.
    pub fn schedule_config(&mut self, config: MarketConfig) -> Result<(), ConfigError> {
        config.validate_for(self.prices.len())?;
        self.pending_config = Some(config);
        Ok(())
    }

    pub fn observe(&self, agent: &str) -> Option<Observation> {
        self.buyers.get(agent).map(|b| Observation {
            prices: self.prices.as_slice().to_vec(),
            income: b.income,
            credit: b.credit,
        })
    }

    pub fn observations(&self) -> BTreeMap<AgentId, Observation> {
        self.buyers
            .keys()
            .filter_map(|id| self.observe(id).map(|o| (id.clone(), o)))
            .collect()
    }

    pub fn assigned_tier(&self, agent: &str) -> Option<usize> {
        self.buyers
            .get(agent)
            .and_then(|b| b.assigned_tier(self.prices.as_slice()))
    }

    pub fn buyer(&self, agent: &str) -> Option<&Buyer> {
        self.buyers.get(agent)
    }

    pub fn buyers(&self) -> &BTreeMap<AgentId, Buyer> {
        &self.buyers
    }

    pub fn has_acted(&self, agent: &str) -> bool {
        self.acted.contains(agent)
    }

    pub fn prices(&self) -> &PriceVector {
        &self.prices
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn stock(&self) -> &[u32] {
        &self.stock
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut L {
        &mut self.ledger
    }

    fn start_day(&mut self) {
        let tiers = self.prices.len();
        self.stock = vec![self.config.unit_stock; tiers];
        self.sales = vec![0; tiers];
        self.bids = vec![Vec::new(); tiers];
        self.acted.clear();
        self.minted_tiers = vec![false; tiers];
    }

    fn night_closure(&mut self) -> Result<EpochReport, MarketError> {
        let prices = self.prices.as_slice().to_vec();
        let lambda = self.config.solidarity_factor;
        let expiry = self.config.token_expiry;

        let mut stock = self.stock.clone();
        let mut sales = self.sales.clone();
        let mut revenue = 0.0;
        let mut clearings = Vec::new();

        for (tier, bids) in self.bids.iter().enumerate() {
            if bids.is_empty() {
                continue;
            }
            let reserves = tier_reserves(bids, &prices, tier, lambda);
            let Some(clearing) = resolve_tier(bids, &reserves) else {
                continue;
            };

            stock[tier] = stock[tier].saturating_sub(1);
            sales[tier] += 1;
            revenue += prices[tier];
            if !self.minted_tiers[tier] {
                self.ledger.mint(self.epoch, &clearing.winner, clearing.payment)?;
                self.minted_tiers[tier] = true;
            }

            debug!(
                epoch = self.epoch,
                tier,
                bidders = bids.len(),
                winner = %clearing.winner,
                payment = clearing.payment,
                "tier cleared"
            );
            clearings.push(TierClearing {
                tier,
                winner: clearing.winner,
                payment: clearing.payment,
                price: prices[tier],
            });
        }
        let minted: f64 = clearings.iter().map(|c| c.payment).sum();

        let mut buyers = self.buyers.clone();
        let (redistributed, recipients) = self.redistribute(&mut buyers)?;
        let expired = self.ledger.expire(self.epoch, expiry)?;

        let effective = effective_prices(&buyers, &prices);
        let measured_gini = gini(&effective);
        let remaining: u32 = stock.iter().sum();
        let fraction_sold = 1.0 - remaining as f64 / self.config.total_inventory();

        let stats = EpochStats {
            sales: sales.iter().map(|&s| s as f64).collect(),
            revenue,
            gini: measured_gini,
            fraction_sold,
        };
        let next_prices = update_prices(&self.prices, &stats, &self.config);

        let report = EpochReport {
            epoch: self.epoch,
            prices,
            next_prices: next_prices.as_slice().to_vec(),
            revenue,
            sales,
            stock_remaining: stock,
            clearings,
            minted,
            redistributed,
            recipients,
            expired,
            gini: measured_gini,
            fraction_sold,
        };
        info!(
            epoch = report.epoch,
            revenue = report.revenue,
            gini = report.gini,
            sold = report.fraction_sold,
            minted = report.minted,
            redistributed = report.redistributed,
            expired = report.expired,
            "epoch closed"
        );

        self.buyers = buyers;
        self.prices = next_prices;
        self.epoch += 1;
        if let Some(config) = self.pending_config.take() {
            info!(epoch = self.epoch, "applying scheduled config");
            self.config = config;
        }
        self.start_day();

        Ok(report)
    }

    /// Rebate live ledger value into the staged `buyers`. Returns the credited
    /// total and the number of recipients.
    fn redistribute(
        &self,
        buyers: &mut BTreeMap<AgentId, Buyer>,
    ) -> Result<(f64, usize), MarketError> {
        let rows = match self.ledger.load(self.epoch, self.config.token_expiry) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(epoch = self.epoch, error = %e, "ledger load failed, skipping rebate");
                return Ok((0.0, 0));
            }
        };

        let mut donor_income = Vec::with_capacity(rows.len());
        let mut donor_tokens = Vec::with_capacity(rows.len());
        for (donor, tokens) in &rows {
            match buyers.get(donor) {
                Some(b) => {
                    donor_income.push(b.income);
                    donor_tokens.push(*tokens);
                }
                None => debug!(donor = %donor, "ledger donor is not a buyer, skipping"),
            }
        }

        let recipient_ids: Vec<AgentId> = buyers
            .iter()
            .filter(|(_, b)| b.income < self.config.poverty_line)
            .map(|(id, _)| id.clone())
            .collect();
        let mass: f64 = donor_tokens.iter().sum();
        if mass < MASS_EPSILON || recipient_ids.is_empty() {
            return Ok((0.0, 0));
        }

        let recipient_income: Vec<f64> = recipient_ids
            .iter()
            .filter_map(|id| buyers.get(id).map(|b| b.income))
            .collect();
        let credits = rebate(
            &donor_income,
            &donor_tokens,
            &recipient_income,
            &self.config.rebate,
        )?;

        let mut total = 0.0;
        for (id, credit) in recipient_ids.iter().zip(credits) {
            if let Some(b) = buyers.get_mut(id) {
                b.credit += credit;
                total += credit;
            }
        }
        Ok((total, recipient_ids.len()))
    }
}

/// Price each buyer effectively pays at its assigned tier, net of credit.
/// Buyers who cannot afford any tier are left out.
pub fn effective_prices(buyers: &BTreeMap<AgentId, Buyer>, prices: &[f64]) -> Vec<f64> {
    buyers
        .values()
        .filter_map(|b| b.assigned_tier(prices).map(|k| prices[k] - b.credit))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::ledger::MemoryLedger;

    fn incomes(pairs: &[(&str, f64)]) -> BTreeMap<AgentId, f64> {
        pairs.iter().map(|(id, inc)| (id.to_string(), *inc)).collect()
    }

    fn actions(pairs: &[(&str, Action)]) -> BTreeMap<AgentId, Action> {
        pairs.iter().map(|(id, a)| (id.to_string(), *a)).collect()
    }

    fn one_tier_env() -> MarketplaceEnv<MemoryLedger> {
        let cfg = MarketConfig::default().with_tiers(1).with_unit_stock(1);
        MarketplaceEnv::new(
            incomes(&[("rich", 20.0), ("mid", 15.0)]),
            vec![10.0],
            cfg,
            MemoryLedger::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_single_tier_end_to_end() {
        let mut env = one_tier_env();
        let out = env
            .step(actions(&[
                ("rich", Action::Bid { tier: 0, amount: 10.0 }),
                ("mid", Action::Bid { tier: 0, amount: 5.0 }),
            ]))
            .unwrap();

        let report = out.report.expect("closure should run");
        assert_eq!(report.clearings.len(), 1);
        assert_eq!(report.clearings[0].winner, "rich");
        // second-highest bid 5 beats the reserve 0.2 * 10
        assert_eq!(report.clearings[0].payment, 5.0);
        assert_eq!(report.revenue, 10.0);
        assert_eq!(report.stock_remaining, vec![0]);
        assert_eq!(report.sales, vec![1]);
        assert_eq!(report.fraction_sold, 1.0);
        assert_eq!(env.epoch(), 1);

        // both buyers are under the poverty line; the minted 5 is shared out
        let credits: f64 = env.buyers().values().map(|b| b.credit).sum();
        assert!((credits - 5.0).abs() < 1e-6);
        assert!(out.terminations.values().all(|t| *t));
        assert!(out.rewards.values().all(|r| *r == 0.0));
    }

    #[test]
    fn test_lone_bidder_pays_reserve() {
        let mut env = one_tier_env();
        let out = env
            .step(actions(&[
                ("rich", Action::Bid { tier: 0, amount: 10.0 }),
                ("mid", Action::WalkAway),
            ]))
            .unwrap();
        let report = out.report.unwrap();
        assert!((report.clearings[0].payment - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_closure_waits_for_every_buyer() {
        let mut env = one_tier_env();
        let out = env
            .step(actions(&[("rich", Action::Bid { tier: 0, amount: 10.0 })]))
            .unwrap();
        assert!(out.report.is_none());
        assert!(out.terminations["rich"]);
        assert!(!out.terminations["mid"]);
        assert_eq!(env.epoch(), 0);

        let out = env.step(actions(&[("mid", Action::WalkAway)])).unwrap();
        assert!(out.report.is_some());
        assert_eq!(env.epoch(), 1);
    }

    #[test]
    fn test_rejects_second_action() {
        let mut env = one_tier_env();
        env.step(actions(&[("rich", Action::WalkAway)])).unwrap();
        assert!(matches!(
            env.step(actions(&[("rich", Action::WalkAway)])),
            Err(MarketError::AlreadyActed(_))
        ));
    }

    #[test]
    fn test_rejects_bad_actions_without_side_effects() {
        let mut env = one_tier_env();
        assert!(matches!(
            env.step(actions(&[("ghost", Action::WalkAway)])),
            Err(MarketError::UnknownAgent(_))
        ));
        assert!(matches!(
            env.step(actions(&[
                ("mid", Action::WalkAway),
                ("rich", Action::Bid { tier: 5, amount: 1.0 }),
            ])),
            Err(MarketError::InvalidTier { tier: 5, .. })
        ));
        assert!(matches!(
            env.step(actions(&[("rich", Action::Bid { tier: 0, amount: -1.0 })])),
            Err(MarketError::InvalidBid { .. })
        ));
        assert!(!env.has_acted("mid"));
    }

    #[test]
    fn test_flat_sentinel_walks_away() {
        assert_eq!(Action::from_raw(4, 3.0, 4), Action::WalkAway);
        assert_eq!(
            Action::from_raw(1, 3.0, 4),
            Action::Bid { tier: 1, amount: 3.0 }
        );

        let mut env = one_tier_env();
        let out = env
            .step(actions(&[
                ("rich", Action::Bid { tier: 1, amount: 0.0 }),
                ("mid", Action::WalkAway),
            ]))
            .unwrap();
        assert!(out.report.unwrap().clearings.is_empty());
    }

    #[test]
    fn test_assigned_tier_scans_from_top() {
        let b = Buyer {
            income: 12.0,
            credit: 4.0,
        };
        assert_eq!(b.assigned_tier(&[10.0, 15.0, 20.0]), Some(1));
        assert_eq!(Buyer::new(5.0).assigned_tier(&[10.0, 15.0]), None);
    }

    #[test]
    fn test_observation_layout() {
        let env = one_tier_env();
        let obs = env.observe("rich").unwrap();
        assert_eq!(obs.to_vec(), vec![10.0, 20.0, 0.0]);
        assert_eq!(Observation::from_slice(&obs.to_vec()), Some(obs));
    }

    #[test]
    fn test_rebate_only_reaches_poor_buyers() {
        let cfg = MarketConfig::default()
            .with_tiers(2)
            .with_unit_stock(1)
            .with_poverty_line(100.0);
        let mut env = MarketplaceEnv::new(
            incomes(&[("whale", 1e6), ("poor", 50.0)]),
            vec![10.0, 20.0],
            cfg,
            MemoryLedger::new(),
        )
        .unwrap();

        let out = env
            .step(actions(&[
                ("whale", Action::Bid { tier: 1, amount: 50.0 }),
                ("poor", Action::WalkAway),
            ]))
            .unwrap();
        let report = out.report.unwrap();

        assert_eq!(report.recipients, 1);
        assert_eq!(env.buyer("whale").unwrap().credit, 0.0);
        assert!((env.buyer("poor").unwrap().credit - report.minted).abs() < 1e-6);
    }

    #[test]
    fn test_live_tokens_are_redistributed_every_night_until_expiry() {
        let cfg = MarketConfig::default()
            .with_tiers(1)
            .with_unit_stock(1)
            .with_token_expiry(1)
            .with_poverty_line(100.0);
        let mut env = MarketplaceEnv::new(
            incomes(&[("whale", 1e6), ("poor", 50.0)]),
            vec![10.0],
            cfg,
            MemoryLedger::new(),
        )
        .unwrap();

        let first = env
            .step(actions(&[
                ("whale", Action::Bid { tier: 0, amount: 9.0 }),
                ("poor", Action::WalkAway),
            ]))
            .unwrap()
            .report
            .unwrap();
        let quiet = actions(&[("whale", Action::WalkAway), ("poor", Action::WalkAway)]);
        let second = env.step(quiet.clone()).unwrap().report.unwrap();
        let third = env.step(quiet).unwrap().report.unwrap();

        // epoch-0 tokens stay live at epoch 1 and are paid out again
        assert!(first.minted > 0.0);
        assert!((second.redistributed - first.minted).abs() < 1e-6);
        assert!((second.expired - 0.0).abs() < 1e-12);
        assert!((third.expired - first.minted).abs() < 1e-12);
        assert_eq!(third.redistributed, 0.0);
        assert!((env.buyer("poor").unwrap().credit - 2.0 * first.minted).abs() < 1e-6);
    }

    #[test]
    fn test_scheduled_config_waits_for_boundary() {
        let mut env = one_tier_env();
        let next = env.config().clone().with_unit_stock(5).with_solidarity_factor(0.5);
        env.schedule_config(next).unwrap();
        assert_eq!(env.config().unit_stock, 1);

        env.step(actions(&[("rich", Action::WalkAway)])).unwrap();
        assert_eq!(env.config().unit_stock, 1);

        env.step(actions(&[("mid", Action::WalkAway)])).unwrap();
        assert_eq!(env.config().unit_stock, 5);
        assert_eq!(env.stock(), &[5]);

        assert!(env
            .schedule_config(MarketConfig::default().with_tiers(3))
            .is_err());
    }

    #[test]
    fn test_prices_stay_ordered_over_many_epochs() {
        let cfg = MarketConfig::default().with_unit_stock(2);
        let mut env = MarketplaceEnv::new(
            incomes(&[("a", 5.0), ("b", 18.0), ("c", 30.0), ("d", 2e4)]),
            vec![10.0, 15.0, 20.0, 25.0],
            cfg,
            MemoryLedger::new(),
        )
        .unwrap();

        for _ in 0..20 {
            let acts = env
                .observations()
                .into_iter()
                .map(|(id, obs)| {
                    let action = match env.assigned_tier(&id) {
                        Some(k) => Action::Bid {
                            tier: k,
                            amount: (obs.income - obs.prices[k]).max(0.0),
                        },
                        None => Action::WalkAway,
                    };
                    (id, action)
                })
                .collect();
            let report = env.step(acts).unwrap().report.unwrap();
            assert!(report.stock_remaining.iter().all(|&s| s <= 2));
        }

        let p = env.prices().as_slice();
        assert!(p.iter().all(|x| *x > 0.0));
        assert!(p.windows(2).all(|w| w[0] < w[1]));
    }

    #[derive(Default)]
    struct FlakyLedger {
        inner: MemoryLedger,
        /// Mints allowed before every further mint fails; `None` is unlimited
        mint_budget: Option<usize>,
        fail_load: bool,
        fail_expire: bool,
    }

    fn broken() -> LedgerError {
        LedgerError::Io {
            path: "flaky".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk gone"),
        }
    }

    impl TokenLedger for FlakyLedger {
        fn mint(&mut self, epoch: u64, donor: &str, amount: f64) -> Result<(), LedgerError> {
            if let Some(left) = self.mint_budget.as_mut() {
                if *left == 0 {
                    return Err(broken());
                }
                *left -= 1;
            }
            self.inner.mint(epoch, donor, amount)
        }

        fn load(&self, epoch: u64, expiry: u64) -> Result<Vec<(AgentId, f64)>, LedgerError> {
            if self.fail_load {
                return Err(broken());
            }
            self.inner.load(epoch, expiry)
        }

        fn expire(&mut self, epoch: u64, expiry: u64) -> Result<f64, LedgerError> {
            if self.fail_expire {
                return Err(broken());
            }
            self.inner.expire(epoch, expiry)
        }

        fn reset(&mut self) -> Result<(), LedgerError> {
            self.inner.reset()
        }

        fn total_mass(&self) -> f64 {
            self.inner.total_mass()
        }
    }

    fn flaky_env(ledger: FlakyLedger) -> MarketplaceEnv<FlakyLedger> {
        let cfg = MarketConfig::default().with_tiers(1).with_unit_stock(1);
        MarketplaceEnv::new(
            incomes(&[("rich", 20.0), ("mid", 15.0)]),
            vec![10.0],
            cfg,
            ledger,
        )
        .unwrap()
    }

    #[test]
    fn test_mint_failure_aborts_closure() {
        let mut env = flaky_env(FlakyLedger {
            mint_budget: Some(0),
            ..FlakyLedger::default()
        });
        let err = env
            .step(actions(&[
                ("rich", Action::Bid { tier: 0, amount: 10.0 }),
                ("mid", Action::WalkAway),
            ]))
            .unwrap_err();

        assert!(matches!(err, MarketError::Ledger(_)));
        assert_eq!(env.epoch(), 0);
        assert_eq!(env.prices().as_slice(), &[10.0]);
        assert!(env.buyers().values().all(|b| b.credit == 0.0));
    }

    #[test]
    fn test_expire_failure_discards_staged_credits_and_retries_once() {
        let mut env = flaky_env(FlakyLedger {
            fail_expire: true,
            ..FlakyLedger::default()
        });
        let day = actions(&[
            ("rich", Action::Bid { tier: 0, amount: 10.0 }),
            ("mid", Action::WalkAway),
        ]);

        assert!(matches!(env.step(day.clone()), Err(MarketError::Ledger(_))));
        // the rebate ran before expiry failed; none of it is kept
        assert_eq!(env.epoch(), 0);
        assert_eq!(env.prices().as_slice(), &[10.0]);
        assert!(env.buyers().values().all(|b| b.credit == 0.0));
        assert!((env.ledger().total_mass() - 2.0).abs() < 1e-12);

        // the day stays closed to new actions and to a restart
        assert!(matches!(env.step(day), Err(MarketError::AlreadyActed(_))));
        assert!(matches!(
            env.reset(),
            Err(MarketError::DayInProgress { epoch: 0, acted: 2 })
        ));
        assert!(env.close_night().is_err());
        assert!((env.ledger().total_mass() - 2.0).abs() < 1e-12);

        env.ledger_mut().fail_expire = false;
        let report = env.close_night().unwrap();
        assert_eq!(report.epoch, 0);
        assert!((report.minted - 2.0).abs() < 1e-12);
        assert!((env.ledger().total_mass() - 2.0).abs() < 1e-12);
        assert_eq!(env.epoch(), 1);
        let credits: f64 = env.buyers().values().map(|b| b.credit).sum();
        assert!((credits - 2.0).abs() < 1e-6);
        assert!(env.reset().is_ok());
    }

    #[test]
    fn test_retry_after_partial_mint_skips_minted_tiers() {
        let cfg = MarketConfig::default().with_tiers(2).with_unit_stock(1);
        let mut env = MarketplaceEnv::new(
            incomes(&[("rich", 30.0), ("mid", 20.0)]),
            vec![10.0, 20.0],
            cfg,
            FlakyLedger {
                mint_budget: Some(1),
                ..FlakyLedger::default()
            },
        )
        .unwrap();

        // each lone bidder pays its reserve: 0.2 * 10 on both tiers
        let err = env
            .step(actions(&[
                ("rich", Action::Bid { tier: 1, amount: 10.0 }),
                ("mid", Action::Bid { tier: 0, amount: 10.0 }),
            ]))
            .unwrap_err();
        assert!(matches!(err, MarketError::Ledger(_)));
        assert_eq!(env.ledger().inner.records().len(), 1);

        env.ledger_mut().mint_budget = None;
        let report = env.close_night().unwrap();
        assert_eq!(report.clearings.len(), 2);
        assert!((report.minted - 4.0).abs() < 1e-12);

        let records = env.ledger().inner.records();
        assert_eq!(records.len(), 2);
        let donors: Vec<&str> = records.iter().map(|r| r.donor.as_str()).collect();
        assert_eq!(donors, vec!["mid", "rich"]);
    }

    #[test]
    fn test_close_night_waits_for_every_buyer() {
        let mut env = one_tier_env();
        env.step(actions(&[("rich", Action::WalkAway)])).unwrap();
        assert!(matches!(
            env.close_night(),
            Err(MarketError::DayOpen { waiting: 1 })
        ));
        assert!(matches!(env.reset(), Err(MarketError::DayInProgress { .. })));
        assert_eq!(env.epoch(), 0);
    }

    #[test]
    fn test_load_failure_skips_rebate() {
        let mut env = flaky_env(FlakyLedger {
            fail_load: true,
            ..FlakyLedger::default()
        });
        let report = env
            .step(actions(&[
                ("rich", Action::Bid { tier: 0, amount: 10.0 }),
                ("mid", Action::WalkAway),
            ]))
            .unwrap()
            .report
            .unwrap();

        assert_eq!(report.redistributed, 0.0);
        assert_eq!(env.epoch(), 1);
        assert!((env.ledger().total_mass() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_invalid_setup() {
        assert!(matches!(
            MarketplaceEnv::new(
                incomes(&[("a", 1.0)]),
                vec![10.0, 5.0],
                MarketConfig::default().with_tiers(2),
                MemoryLedger::new(),
            ),
            Err(MarketError::Config(ConfigError::InvalidPrices(_)))
        ));
        assert!(matches!(
            MarketplaceEnv::new(
                incomes(&[("a", 1.0)]),
                vec![10.0],
                MarketConfig::default(),
                MemoryLedger::new(),
            ),
            Err(MarketError::Config(ConfigError::TierMismatch { .. }))
        ));
        assert!(matches!(
            MarketplaceEnv::new(
                incomes(&[("a", -1.0)]),
                vec![10.0],
                MarketConfig::default().with_tiers(1),
                MemoryLedger::new(),
            ),
            Err(MarketError::InvalidIncome(_))
        ));
    }
}
