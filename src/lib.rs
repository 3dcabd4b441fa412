//! Tiered Solidarity Marketplace Simulation Library
//!
//! Buyers bid for a small number of price tiers. Each tier winner pays a
//! solidarity levy, the levy is rebated to low-income buyers through an
//! optimal-transport plan, and tier prices adapt every epoch.
//!
//! ## Modules
//!
//! - `auction`: second-price clearing with solidarity reserves
//! - `ledger`: durable token ledger of minted levies
//! - `rebate`: log-domain Sinkhorn fairness rebate
//! - `ladder`: projected-gradient price ladder and Gini measure
//! - `market`: day/night marketplace environment
//! - `policy`: reference buyer policies
//! - `simulation`: seeded batch runs and KPI aggregation
//! - `config`, `error`: configuration snapshots and error types
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin market --release
//! ```

pub mod auction;
pub mod config;
pub mod error;
pub mod ladder;
pub mod ledger;
pub mod market;
pub mod policy;
pub mod rebate;
pub mod simulation;
