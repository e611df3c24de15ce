use crate::{
    cache::TtlCache,
    chain::{AlloyCaller, ContractCaller},
    config::VaultscopeConfig,
    contracts::{ContractQueryService, QuerySettings},
    lending::LendingReader,
    paths::VaultscopePaths,
    pool::{EndpointPool, PoolSettings},
    prices::{aggregator::AggregatorSettings, build_sources, PriceAggregator, SourceDeps},
    rate_limit::RateLimiter,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;

pub const CONTRACT_CACHE_FILE: &str = "contracts_cache.json";
pub const PRICE_CACHE_FILE: &str = "price_cache.json";

/// Everything a command needs, wired once per process.
#[derive(Debug)]
pub struct Vaultscope {
    pub contracts: Arc<ContractQueryService>,
    pub prices: Arc<PriceAggregator>,
    pub lending: LendingReader,
}

impl Vaultscope {
    /// Probe the configured RPC endpoints and build the query stack on the survivors.
    ///
    /// Fails only when no endpoint answers or no price source can be built.
    pub async fn connect(cfg: &VaultscopeConfig, paths: &VaultscopePaths) -> eyre::Result<Self> {
        let cache_dir = paths.cache_dir_or(cfg.cache.dir.as_deref());
        crate::fsutil::ensure_dir(&cache_dir)?;

        let caller: Arc<dyn ContractCaller> = Arc::new(AlloyCaller::new(&cfg.rpc));
        let pool = Self::rpc_pool(cfg, Arc::clone(&caller)).await?;
        Self::assemble(cfg, &cache_dir, caller, pool)
    }

    /// Probe the configured endpoints and keep those that answered.
    pub async fn rpc_pool(
        cfg: &VaultscopeConfig,
        caller: Arc<dyn ContractCaller>,
    ) -> eyre::Result<EndpointPool> {
        let endpoints = cfg.resolved_endpoints();
        let pool = EndpointPool::probed("rpc", endpoints, PoolSettings::from_rpc(&cfg.rpc), |url| {
            let caller = Arc::clone(&caller);
            async move { caller.probe(&url).await }
        })
        .await?;
        info!(endpoints = pool.len(), "rpc endpoint pool ready");
        Ok(pool)
    }

    /// Build the stack over an already constructed caller and pool.
    pub fn assemble(
        cfg: &VaultscopeConfig,
        cache_dir: &std::path::Path,
        caller: Arc<dyn ContractCaller>,
        pool: EndpointPool,
    ) -> eyre::Result<Self> {
        let limiter = Arc::new(RateLimiter::per_second(cfg.rate_limit.calls_per_second));
        info!(calls_per_second = limiter.limit(), "contract rate limit");
        let contracts = Arc::new(ContractQueryService::new(
            caller,
            Arc::new(pool),
            limiter,
            TtlCache::open(cache_dir, CONTRACT_CACHE_FILE),
            QuerySettings::from_config(cfg),
        ));

        let price_cache: Arc<TtlCache<Decimal>> =
            Arc::new(TtlCache::open(cache_dir, PRICE_CACHE_FILE));
        let sources = build_sources(
            cfg,
            &SourceDeps {
                contracts: Arc::clone(&contracts),
                price_cache: Arc::clone(&price_cache),
            },
        )?;
        let prices = Arc::new(PriceAggregator::new(
            sources,
            price_cache,
            AggregatorSettings::from_config(cfg),
        )?);

        let lending = LendingReader::new(cfg, cache_dir, Arc::clone(&contracts), Arc::clone(&prices));
        Ok(Self {
            contracts,
            prices,
            lending,
        })
    }
}
