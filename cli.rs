use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use microgrid_market_engine::sim::{run_parallel, run_simulation, SimResult};
use microgrid_market_engine::types::MarketConfig;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "microgrid-market", about = "Microgrid double-auction market simulator")]
struct Cli {
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Simulate one week and print per-day market results.
	Run {
		#[arg(long, default_value_t = 0)]
		seed: u64,
		#[arg(long, default_value_t = 3)]
		users: usize,
		#[arg(long, default_value_t = 100_000.0)]
		ess_capacity: f64,
		#[arg(long, default_value_t = 0.5)]
		ess_initial_fill: f64,
		#[arg(long, default_value_t = 0.1)]
		bidding_factor: f64,
		/// Write the full per-slot report as JSON.
		#[arg(long)]
		report: Option<PathBuf>,
	},
	/// Run many seeds in parallel and print aggregate statistics.
	Batch {
		#[arg(long, default_value_t = 100)]
		simulations: usize,
		#[arg(long, default_value_t = 0)]
		seed_start: u64,
		#[arg(long, default_value_t = 3)]
		users: usize,
		#[arg(long, default_value_t = 100_000.0)]
		ess_capacity: f64,
		#[arg(long, default_value_t = 0.5)]
		ess_initial_fill: f64,
		#[arg(long, default_value_t = 0.1)]
		bidding_factor: f64,
	},
}

fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
		.init();

	let cli = Cli::parse();
	match cli.command {
		Commands::Run {
			seed,
			users,
			ess_capacity,
			ess_initial_fill,
			bidding_factor,
			report,
		} => run_cmd(
			market_config(ess_capacity, ess_initial_fill, bidding_factor),
			users,
			seed,
			report,
		),
		Commands::Batch {
			simulations,
			seed_start,
			users,
			ess_capacity,
			ess_initial_fill,
			bidding_factor,
		} => batch_cmd(
			market_config(ess_capacity, ess_initial_fill, bidding_factor),
			users,
			simulations,
			seed_start,
		),
	}
}

fn market_config(ess_capacity: f64, ess_initial_fill: f64, bidding_factor: f64) -> MarketConfig {
	MarketConfig {
		ess_capacity,
		ess_initial_fill,
		bidding_factor,
		..MarketConfig::default()
	}
}

fn run_cmd(config: MarketConfig, users: usize, seed: u64, report: Option<PathBuf>) -> Result<()> {
	let result = run_simulation(&config, users, seed).context("simulation failed")?;

	println!("\nDay    Cleared     Avg Price   Ext Price   Trades");
	println!("--------------------------------------------------");
	let days: Vec<usize> = {
		let mut d: Vec<usize> = result.slots.iter().map(|s| s.weekday).collect();
		d.dedup();
		d
	};
	for day in days {
		let slots: Vec<_> = result.slots.iter().filter(|s| s.weekday == day).collect();
		let cleared: f64 = slots.iter().map(|s| s.cleared_volume).sum();
		let avg_price = if cleared > 0.0 {
			slots.iter().map(|s| s.average_price * s.cleared_volume).sum::<f64>() / cleared
		} else {
			0.0
		};
		let ext_price =
			slots.iter().map(|s| s.external_price).sum::<f64>() / slots.len().max(1) as f64;
		let trades: usize = slots.iter().map(|s| s.trades).sum();
		println!("{:<6} {:>10.2} {:>11.2} {:>11.2} {:>8}", day, cleared, avg_price, ext_price, trades);
	}

	println!("\nMarket volume     {:>12.2}", result.total_market_volume());
	println!("Self-use volume   {:>12.2}", result.volumes.self_use);
	println!("External volume   {:>12.2}", result.volumes.from_external);
	println!("Stored volume     {:>12.2}", result.volumes.to_ess);
	println!("External bill     {:>12.2}", result.total_external_bill());
	println!("Final ESS energy  {:>12.2}", result.final_ess_energy);

	if let Some(path) = report {
		write_report(&path, &config, users, &result)?;
		println!("\nReport: {}", path.display());
	}

	Ok(())
}

fn batch_cmd(config: MarketConfig, users: usize, simulations: usize, seed_start: u64) -> Result<()> {
	let stats = run_parallel(&config, users, simulations, seed_start).context("batch failed")?;

	println!("\nSimulations          {:>12}", stats.simulations);
	println!("Mean market volume   {:>12.2}", stats.mean_market_volume);
	println!("Std market volume    {:>12.2}", stats.std_market_volume);
	println!("Mean avg price       {:>12.2}", stats.mean_average_price);
	println!("Mean self-use        {:>12.2}", stats.mean_self_use_volume);
	println!("Mean external        {:>12.2}", stats.mean_external_volume);
	println!("Mean stored          {:>12.2}", stats.mean_to_ess_volume);
	println!("Mean external bill   {:>12.2}", stats.mean_external_bill);

	Ok(())
}

fn write_report(path: &PathBuf, config: &MarketConfig, users: usize, result: &SimResult) -> Result<()> {
	let payload = json!({
		"seed": result.seed,
		"users": users,
		"config": {
			"ess_capacity": config.ess_capacity,
			"ess_initial_fill": config.ess_initial_fill,
			"ess_price_ratio": config.ess_price_ratio,
			"bidding_factor": config.bidding_factor,
			"seasonal_period": config.seasonal_period,
		},
		"slots": result.slots,
		"volumes": result.volumes,
		"bills": result.bills,
		"final_ess_energy": result.final_ess_energy,
	});
	fs::write(path, serde_json::to_vec_pretty(&payload)?)
		.with_context(|| format!("failed writing report to {}", path.display()))?;
	Ok(())
}
