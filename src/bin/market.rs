//! Tiered Marketplace Batch Simulation Binary
//!
//! Runs the default batch for every reference policy and prints the epoch
//! KPIs. Token ledgers live as JSON Lines files in the system temp directory.
//!
//! ## Usage
//! ```bash
//! cargo run --bin market --release
//! RUST_LOG=tassel_simulation=debug cargo run --bin market
//! ```

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use tassel_simulation::config::MarketConfig;
use tassel_simulation::ledger::FileLedger;
use tassel_simulation::simulation::{aggregate_kpis, run_batch, BatchConfig, PolicyKind};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let market = MarketConfig::default();
    let defaults = BatchConfig::default();

    println!("=======================================================");
    println!("  Tiered Solidarity Marketplace Simulation");
    println!("  Auction levy, OT rebate, adaptive price ladder");
    println!("=======================================================");
    println!();
    println!("Parameters:");
    println!("  Buyers: {}, Epochs: {}", defaults.buyers, defaults.epochs);
    println!("  Initial prices: {:?}", defaults.initial_prices);
    println!(
        "  Solidarity factor: {:.2}, Token expiry: {} epochs",
        market.solidarity_factor, market.token_expiry
    );
    println!();

    for policy in PolicyKind::all() {
        let batch = BatchConfig {
            policy,
            ..defaults.clone()
        };
        let path = std::env::temp_dir().join(format!(
            "tassel_ledger_{}.jsonl",
            policy.name().to_lowercase()
        ));
        let ledger = FileLedger::open(&path)
            .with_context(|| format!("failed to open token ledger {:?}", path))?;

        println!("Policy: {}", policy.name());
        println!("{}", "-".repeat(50));

        let kpis = run_batch(&batch, market.clone(), ledger)
            .with_context(|| format!("batch failed for {} policy", policy.name()))?;

        println!("| Epoch | Revenue  | Gini   | Sold | Minted  | Rebated | Expired |");
        println!("|-------|----------|--------|------|---------|---------|---------|");
        for k in &kpis {
            println!(
                "| {:5} | {:8.2} | {:.4} | {:4} | {:7.2} | {:7.2} | {:7.2} |",
                k.epoch, k.revenue, k.gini, k.units_sold, k.minted, k.redistributed, k.expired
            );
        }
        println!();

        if let Some(summary) = aggregate_kpis(&kpis) {
            summary.print();
        }
        println!();
    }

    Ok(())
}
