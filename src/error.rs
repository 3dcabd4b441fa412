//! Error types for the marketplace engine.

use std::path::PathBuf;

use thiserror::Error;

/// Rejected configuration snapshots.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("tier count must be at least 1")]
    NoTiers,
    #[error("tier count mismatch: config has {config}, price ladder has {prices}")]
    TierMismatch { config: usize, prices: usize },
    #[error("solidarity factor must lie in [0, 1], got {0}")]
    SolidarityFactor(f64),
    #[error("{name} must be finite and non-negative, got {value}")]
    NegativeParameter { name: &'static str, value: f64 },
    #[error("{name} must be finite, got {value}")]
    NonFinite { name: &'static str, value: f64 },
    #[error("unit stock must be at least 1")]
    NoStock,
    #[error("poverty line must be finite, got {0}")]
    PovertyLine(f64),
    #[error("rebate regularization must be positive and finite, got {0}")]
    Regularization(f64),
    #[error("rebate iteration cap must be at least 1")]
    IterationCap,
    #[error("price ladder must be non-empty, positive and strictly increasing: {0:?}")]
    InvalidPrices(Vec<f64>),
}

/// Token ledger failures. I/O problems are always surfaced to the caller.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode ledger record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt ledger record at {path:?} line {line}: {message}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("mint amount must be finite and non-negative, got {0}")]
    InvalidAmount(f64),
}

/// Boundary validation failures of the fairness rebate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RebateError {
    #[error("donor incomes ({incomes}) and donor tokens ({tokens}) differ in length")]
    LengthMismatch { incomes: usize, tokens: usize },
    #[error("donor token mass at index {index} must be finite and non-negative, got {value}")]
    InvalidMass { index: usize, value: f64 },
    #[error("income at index {index} must be finite and non-negative, got {value}")]
    InvalidIncome { index: usize, value: f64 },
}

/// Errors surfaced by the marketplace environment.
#[derive(Error, Debug)]
pub enum MarketError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Rebate(#[from] RebateError),
    #[error("unknown agent {0}")]
    UnknownAgent(String),
    #[error("agent {0} already acted this epoch")]
    AlreadyActed(String),
    #[error("agent {agent} chose tier {tier}, but only {tiers} tiers exist")]
    InvalidTier {
        agent: String,
        tier: usize,
        tiers: usize,
    },
    #[error("agent {agent} submitted invalid bid {amount}")]
    InvalidBid { agent: String, amount: f64 },
    #[error("agent {0} has a negative or non-finite income")]
    InvalidIncome(String),
    #[error("night closure needs every buyer to act, {waiting} still waiting")]
    DayOpen { waiting: usize },
    #[error("cannot restart epoch {epoch}: {acted} buyers already acted")]
    DayInProgress { epoch: u64, acted: usize },
}
