use super::{token_key, PriceSource, SourceKind};
use crate::{
    chain::{IAggregatorV3, IFeedRegistry},
    config::VaultscopeConfig,
    contracts::ContractQueryService,
    errors::{ErrorClass, UpstreamError},
    retry::RetryPolicy,
};
use alloy::primitives::{address, Address};
use async_trait::async_trait;
use eyre::Context as _;
use rust_decimal::Decimal;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Denomination address the feed registry uses for USD.
const USD_DENOMINATION: Address = address!("0x0000000000000000000000000000000000000348");

/// On-chain Chainlink price feeds, located through the feed registry.
pub struct ChainlinkOracle {
    contracts: Arc<ContractQueryService>,
    registry: Address,
    eth_usd_feed: Address,
    weth: Address,
    feed_ttl: Option<Duration>,
    policy: RetryPolicy,
}

impl ChainlinkOracle {
    pub const NAME: &'static str = "chainlink";

    pub fn new(cfg: &VaultscopeConfig, contracts: Arc<ContractQueryService>) -> eyre::Result<Self> {
        let p = &cfg.prices;
        Ok(Self {
            contracts,
            registry: p
                .chainlink_feed_registry
                .parse()
                .context("parse prices.chainlink_feed_registry")?,
            eth_usd_feed: p
                .chainlink_eth_usd_feed
                .parse()
                .context("parse prices.chainlink_eth_usd_feed")?,
            weth: p.weth.parse().context("parse prices.weth")?,
            feed_ttl: crate::config::ttl(cfg.cache.oracle_feed_ttl_seconds),
            policy: RetryPolicy::price(&cfg.retry),
        })
    }

    async fn feed_for(&self, token: Address) -> Result<Option<Address>, UpstreamError> {
        if token == self.weth {
            return Ok(Some(self.eth_usd_feed));
        }
        let key = format!("{}:feed:{}", Self::NAME, token_key(token));
        let call = IFeedRegistry::getFeedCall {
            base: token,
            quote: USD_DENOMINATION,
        };
        match self
            .contracts
            .call_cached_with(self.registry, &call, Some(&key), self.feed_ttl, &self.policy)
            .await
        {
            Ok(feed) if feed == Address::ZERO => Ok(None),
            Ok(feed) => Ok(Some(feed)),
            Err(e) if e.class() == ErrorClass::NotFound => {
                debug!(token = %token, "no chainlink feed registered");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl PriceSource for ChainlinkOracle {
    fn kind(&self) -> SourceKind {
        SourceKind::Oracle
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn price_usd(&self, token: Address) -> Result<Option<Decimal>, UpstreamError> {
        let Some(feed) = self.feed_for(token).await? else {
            return Ok(None);
        };

        let decimals = self
            .contracts
            .call_cached_with(
                feed,
                &IAggregatorV3::decimalsCall {},
                None,
                self.feed_ttl,
                &self.policy,
            )
            .await?;
        let round = self
            .contracts
            .call_with(feed, &IAggregatorV3::latestRoundDataCall {}, &self.policy)
            .await?;

        if !round.answer.is_positive() {
            debug!(token = %token, feed = %feed, "feed answer is not positive");
            return Ok(None);
        }
        match crate::amount::base_units_to_decimal(round.answer.into_raw(), decimals) {
            Ok(price) => Ok(Some(price)),
            Err(e) => {
                warn!(feed = %feed, error = %e, "unusable feed answer");
                Ok(None)
            }
        }
    }
}
