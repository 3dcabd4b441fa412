//! Batch Simulation
//!
//! Seeded multi-epoch runs of the marketplace with a population of
//! log-normally distributed incomes, one policy shared by every buyer.
//!
//! ## What We Measure
//! - Revenue per epoch
//! - Gini of effective prices paid
//! - Tokens minted, redistributed and expired
//! - Drift of the price ladder

use std::collections::BTreeMap;

use rand::prelude::*;
use rand_distr::Distribution;

use crate::config::{log_normal, MarketConfig};
use crate::error::{ConfigError, MarketError};
use crate::ledger::TokenLedger;
use crate::market::{AgentId, EpochReport, MarketplaceEnv};
use crate::policy::{MarginPolicy, Policy, TruthfulPolicy};

pub const DEFAULT_BUYERS: usize = 800;
pub const DEFAULT_EPOCHS: usize = 30;
pub const INITIAL_PRICES: [f64; 4] = [10.0, 15.0, 20.0, 25.0];

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PolicyKind {
    Truthful,
    Margin,
}

impl PolicyKind {
    pub fn all() -> Vec<Self> {
        vec![Self::Truthful, Self::Margin]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Truthful => "Truthful",
            Self::Margin => "Margin-Shading",
        }
    }

    pub fn build(
        &self,
        solidarity_factor: f64,
        seed: u64,
    ) -> Result<Box<dyn Policy>, ConfigError> {
        let policy: Box<dyn Policy> = match self {
            Self::Truthful => Box::new(TruthfulPolicy::new(solidarity_factor)),
            Self::Margin => Box::new(MarginPolicy::new(solidarity_factor, seed)?),
        };
        Ok(policy)
    }
}

#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub buyers: usize,
    pub epochs: usize,
    pub initial_prices: Vec<f64>,
    pub seed: u64,
    pub income_mu: f64,
    pub income_sigma: f64,
    pub policy: PolicyKind,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            buyers: DEFAULT_BUYERS,
            epochs: DEFAULT_EPOCHS,
            initial_prices: INITIAL_PRICES.to_vec(),
            seed: 42,
            income_mu: 3.0,
            income_sigma: 1.0,
            policy: PolicyKind::Truthful,
        }
    }
}

/// `n` buyers `b0..b{n-1}` with log-normal incomes.
pub fn generate_buyers(
    n: usize,
    mu: f64,
    sigma: f64,
    rng: &mut impl Rng,
) -> Result<BTreeMap<AgentId, f64>, ConfigError> {
    let dist = log_normal("income_mu", mu, "income_sigma", sigma)?;
    Ok((0..n).map(|i| (format!("b{i}"), dist.sample(rng))).collect())
}

/// One row of batch output.
#[derive(Clone, Debug, PartialEq)]
pub struct EpochKpi {
    pub epoch: u64,
    pub revenue: f64,
    pub gini: f64,
    pub units_sold: u32,
    pub minted: f64,
    pub redistributed: f64,
    pub expired: f64,
    pub prices: Vec<f64>,
}

impl From<&EpochReport> for EpochKpi {
    fn from(report: &EpochReport) -> Self {
        Self {
            epoch: report.epoch,
            revenue: report.revenue,
            gini: report.gini,
            units_sold: report.sales.iter().sum(),
            minted: report.minted,
            redistributed: report.redistributed,
            expired: report.expired,
            prices: report.next_prices.clone(),
        }
    }
}

/// Run one batch on `ledger`, which is truncated first so runs are reproducible.
pub fn run_batch<L: TokenLedger>(
    batch: &BatchConfig,
    market: MarketConfig,
    mut ledger: L,
) -> Result<Vec<EpochKpi>, MarketError> {
    ledger.reset()?;

    let mut rng = StdRng::seed_from_u64(batch.seed);
    let incomes = generate_buyers(batch.buyers, batch.income_mu, batch.income_sigma, &mut rng)?;
    let mut policy = batch.policy.build(market.solidarity_factor, rng.gen())?;
    let mut env = MarketplaceEnv::new(incomes, batch.initial_prices.clone(), market, ledger)?;

    let mut kpis = Vec::with_capacity(batch.epochs);
    for _ in 0..batch.epochs {
        let observations = env.reset()?;
        let actions = observations
            .iter()
            .map(|(id, obs)| (id.clone(), policy.act(obs)))
            .collect();
        let outcome = env.step(actions)?;
        if let Some(report) = outcome.report {
            kpis.push(EpochKpi::from(&report));
        }
    }
    Ok(kpis)
}

#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub epochs: usize,
    pub total_revenue: f64,
    pub avg_revenue: f64,
    pub avg_gini: f64,
    pub final_gini: f64,
    pub total_units: u32,
    pub total_minted: f64,
    pub total_redistributed: f64,
    pub total_expired: f64,
    pub final_prices: Vec<f64>,
}

pub fn aggregate_kpis(kpis: &[EpochKpi]) -> Option<BatchSummary> {
    let last = kpis.last()?;
    let n = kpis.len() as f64;
    let total_revenue: f64 = kpis.iter().map(|k| k.revenue).sum();

    Some(BatchSummary {
        epochs: kpis.len(),
        total_revenue,
        avg_revenue: total_revenue / n,
        avg_gini: kpis.iter().map(|k| k.gini).sum::<f64>() / n,
        final_gini: last.gini,
        total_units: kpis.iter().map(|k| k.units_sold).sum(),
        total_minted: kpis.iter().map(|k| k.minted).sum(),
        total_redistributed: kpis.iter().map(|k| k.redistributed).sum(),
        total_expired: kpis.iter().map(|k| k.expired).sum(),
        final_prices: last.prices.clone(),
    })
}

impl BatchSummary {
    pub fn print(&self) {
        println!("  Epochs:                  {}", self.epochs);
        println!("  Total revenue:           {:.2}", self.total_revenue);
        println!("  Avg revenue / epoch:     {:.2}", self.avg_revenue);
        println!("  Units sold:              {}", self.total_units);
        println!("  Avg Gini:                {:.4}", self.avg_gini);
        println!("  Final Gini:              {:.4}", self.final_gini);
        println!("  Tokens minted:           {:.2}", self.total_minted);
        println!("  Tokens redistributed:    {:.2}", self.total_redistributed);
        println!("  Tokens expired:          {:.2}", self.total_expired);
        println!("  Final prices:            {:.3?}", self.final_prices);
    }
}
