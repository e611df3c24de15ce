use super::{http::HttpApi, token_key, PriceSource, SourceKind};
use crate::{
    cache::TtlCache,
    config::{self, PricesConfig, VaultscopeConfig},
    errors::UpstreamError,
};
use alloy::primitives::Address;
use async_trait::async_trait;
use eyre::Context as _;
use rust_decimal::Decimal;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::warn;

/// `{"<id>": {"<currency>": <number>}}`
type SimplePrice = BTreeMap<String, BTreeMap<String, Decimal>>;

const ETHEREUM_ID: &str = "ethereum";

/// CoinGecko simple-price index, quoted in ETH and converted to USD.
///
/// Stablecoins from `prices.stable_tokens` are answered from config without a request.
pub struct CoinGeckoIndex {
    api: HttpApi,
    cache: Arc<TtlCache<Decimal>>,
    prices_cfg: PricesConfig,
    ids: BTreeMap<String, String>,
    weth: Address,
    eth_price_ttl: Option<Duration>,
}

impl CoinGeckoIndex {
    pub const NAME: &'static str = "coingecko";

    pub fn new(cfg: &VaultscopeConfig, cache: Arc<TtlCache<Decimal>>) -> eyre::Result<Self> {
        Ok(Self {
            api: HttpApi::new(Self::NAME, &cfg.http.coingecko_base_urls, cfg)?,
            cache,
            prices_cfg: cfg.prices.clone(),
            ids: cfg
                .prices
                .coingecko_ids
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.clone()))
                .collect(),
            weth: cfg.prices.weth.parse().context("parse prices.weth")?,
            eth_price_ttl: config::ttl(cfg.cache.eth_price_ttl_seconds),
        })
    }

    async fn simple_price(&self, id: &str, currency: &str) -> Result<Option<Decimal>, UpstreamError> {
        let query = [("ids", id.to_owned()), ("vs_currencies", currency.to_owned())];
        let body: SimplePrice = self.api.get_json("/simple/price", &query, None).await?;
        Ok(body
            .get(id)
            .and_then(|quotes| quotes.get(currency))
            .copied()
            .filter(|p| *p > Decimal::ZERO))
    }

    async fn eth_usd(&self) -> Result<Option<Decimal>, UpstreamError> {
        let key = format!("{}:eth_usd", Self::NAME);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(Some(hit));
        }
        let price = self.simple_price(ETHEREUM_ID, "usd").await?;
        if let Some(p) = price {
            if let Err(e) = self.cache.set(&key, p, self.eth_price_ttl) {
                warn!(error = %e, "price cache write failed");
            }
        }
        Ok(price)
    }
}

#[async_trait]
impl PriceSource for CoinGeckoIndex {
    fn kind(&self) -> SourceKind {
        SourceKind::IndexApi
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn price_usd(&self, token: Address) -> Result<Option<Decimal>, UpstreamError> {
        let key = token_key(token);
        if let Some(p) = self.prices_cfg.stable_price(&key) {
            return Ok(Some(p));
        }
        if token == self.weth {
            return self.eth_usd().await;
        }
        let Some(id) = self.ids.get(&key) else {
            return Ok(None);
        };
        let Some(in_eth) = self.simple_price(id, "eth").await? else {
            return Ok(None);
        };
        let Some(eth_usd) = self.eth_usd().await? else {
            return Ok(None);
        };
        Ok(in_eth.checked_mul(eth_usd).filter(|p| *p > Decimal::ZERO))
    }
}
