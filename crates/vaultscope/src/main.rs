#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

use alloy::primitives::Address;
use clap::{Parser, Subcommand, ValueEnum};
use eyre::Context as _;
use serde::Serialize;
use std::{collections::BTreeMap, io::Write as _};
use tracing_subscriber::prelude::*;
use vaultscope::{
    chain::AlloyCaller, paths::VaultscopePaths, prices::token_key, store::ConfigStore, Vaultscope,
};

#[derive(Debug, Parser)]
#[command(name = "vaultscope")]
#[command(about = "Read lending-vault state and token prices over unreliable RPC nodes and price APIs.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DiscoverKind {
    /// Borrowers of a controller (`loans(i)`).
    Loans,
    /// Controllers of a factory (`controllers(i)`).
    Controllers,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print config/data/cache/log paths as JSON.
    Paths,
    /// Probe the configured RPC endpoints and print their status.
    Endpoints,
    /// USD price of one or more tokens (`null` when no source can price it).
    Price {
        #[arg(required = true)]
        tokens: Vec<Address>,
    },
    /// Enumerate an on-chain list until its end.
    Discover {
        contract: Address,
        #[arg(long, value_enum, default_value_t = DiscoverKind::Loans)]
        kind: DiscoverKind,
    },
    /// Aggregate debt and collateral of a lending controller, valued in USD.
    Vault { controller: Address },
    /// Summarize every controller of a factory and print grand totals.
    Factory { factory: Address },
    /// One user's position in one controller (`null` when they have no loan there).
    Position { controller: Address, user: Address },
    /// One user's positions across every controller of a factory.
    Positions { factory: Address, user: Address },
}

fn init_logging(paths: &VaultscopePaths) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let file_name = paths
        .log_file
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("vaultscope.log.jsonl");
    let file_appender = tracing_appender::rolling::never(&paths.data_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(env_filter.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

fn print_json(value: &impl Serialize) -> eyre::Result<()> {
    let s = serde_json::to_string_pretty(value).context("serialize output")?;
    writeln!(std::io::stdout().lock(), "{s}").context("write output")?;
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let paths = VaultscopePaths::discover()?;
    paths.ensure_dirs()?;
    let _log_guard = init_logging(&paths);

    let load_config = || {
        ConfigStore::new(&paths)
            .load_or_init_default()
            .context("load config")
    };

    match cli.cmd {
        Command::Paths => print_json(&serde_json::json!({
            "config_dir": paths.config_dir,
            "config_file": paths.config_file(),
            "data_dir": paths.data_dir,
            "cache_dir": paths.cache_dir,
            "log_file": paths.log_file,
        })),
        Command::Endpoints => {
            let cfg = load_config()?;
            let caller = std::sync::Arc::new(AlloyCaller::new(&cfg.rpc));
            let pool = Vaultscope::rpc_pool(&cfg, caller).await?;
            print_json(&pool.snapshot())
        }
        Command::Price { tokens } => {
            let cfg = load_config()?;
            let app = Vaultscope::connect(&cfg, &paths).await?;
            let prices = app.prices.get_prices(&tokens).await;
            let out: BTreeMap<String, Option<String>> = tokens
                .iter()
                .map(|t| (token_key(*t), prices.get(t).map(ToString::to_string)))
                .collect();
            print_json(&out)
        }
        Command::Discover { contract, kind } => {
            let cfg = load_config()?;
            let app = Vaultscope::connect(&cfg, &paths).await?;
            let found = match kind {
                DiscoverKind::Loans => app.lending.borrowers(contract).await,
                DiscoverKind::Controllers => app.lending.discover_controllers(contract).await,
            };
            print_json(&found)
        }
        Command::Vault { controller } => {
            let cfg = load_config()?;
            let app = Vaultscope::connect(&cfg, &paths).await?;
            let summary = app
                .lending
                .summarize(controller)
                .await
                .with_context(|| format!("summarize {controller:#x}"))?;
            print_json(&summary)
        }
        Command::Factory { factory } => {
            let cfg = load_config()?;
            let app = Vaultscope::connect(&cfg, &paths).await?;
            print_json(&app.lending.summarize_factory(factory).await)
        }
        Command::Position { controller, user } => {
            let cfg = load_config()?;
            let app = Vaultscope::connect(&cfg, &paths).await?;
            let position = app
                .lending
                .position(controller, user)
                .await
                .with_context(|| format!("read position of {user:#x} in {controller:#x}"))?;
            print_json(&position)
        }
        Command::Positions { factory, user } => {
            let cfg = load_config()?;
            let app = Vaultscope::connect(&cfg, &paths).await?;
            print_json(&app.lending.positions(factory, user).await)
        }
    }
}
