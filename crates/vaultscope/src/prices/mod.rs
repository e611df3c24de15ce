pub mod aggregator;
pub mod dex;
pub mod http;
pub mod index;
pub mod oracle;

use crate::{
    cache::TtlCache, config::VaultscopeConfig, contracts::ContractQueryService,
    errors::UpstreamError,
};
use alloy::primitives::Address;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

pub use aggregator::PriceAggregator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Oracle,
    DexQuote,
    IndexApi,
}

impl SourceKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Oracle => "oracle",
            Self::DexQuote => "dex_quote",
            Self::IndexApi => "index_api",
        }
    }
}

/// An independent provider of token/USD prices.
///
/// `Ok(None)` means the source has no price for this token and should not be retried; `Err`
/// is an upstream failure that the aggregator may retry within its time budget.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Stable identifier, also the source's cache namespace.
    fn name(&self) -> &'static str;

    async fn price_usd(&self, token: Address) -> Result<Option<Decimal>, UpstreamError>;
}

/// Lowercase `0x` form used for cache keys and config lookups.
pub fn token_key(token: Address) -> String {
    format!("{token:#x}")
}

/// Shared collaborators for building the configured sources.
pub struct SourceDeps {
    pub contracts: Arc<ContractQueryService>,
    pub price_cache: Arc<TtlCache<Decimal>>,
}

/// Instantiate the sources named in `prices.sources`, in that order.
///
/// Unknown names are a configuration error, as is ending up with no source at all.
pub fn build_sources(
    cfg: &VaultscopeConfig,
    deps: &SourceDeps,
) -> eyre::Result<Vec<Arc<dyn PriceSource>>> {
    let mut out: Vec<Arc<dyn PriceSource>> = Vec::with_capacity(cfg.prices.sources.len());
    for name in &cfg.prices.sources {
        let source: Arc<dyn PriceSource> = match name.trim().to_lowercase().as_str() {
            oracle::ChainlinkOracle::NAME => Arc::new(oracle::ChainlinkOracle::new(
                cfg,
                Arc::clone(&deps.contracts),
            )?),
            dex::CowSwapQuote::NAME => Arc::new(dex::CowSwapQuote::new(
                cfg,
                Arc::clone(&deps.contracts),
                Arc::clone(&deps.price_cache),
            )?),
            dex::OneInchQuote::NAME => {
                if cfg.http.oneinch_api_key.is_none() {
                    info!("1inch api key not configured; 1inch source disabled");
                }
                Arc::new(dex::OneInchQuote::new(cfg, Arc::clone(&deps.contracts))?)
            }
            index::CoinGeckoIndex::NAME => Arc::new(index::CoinGeckoIndex::new(
                cfg,
                Arc::clone(&deps.price_cache),
            )?),
            other => eyre::bail!("unknown price source in config: {other}"),
        };
        out.push(source);
    }
    if out.is_empty() {
        eyre::bail!("no usable price sources configured");
    }
    Ok(out)
}
