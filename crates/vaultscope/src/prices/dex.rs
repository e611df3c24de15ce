use super::{http::HttpApi, PriceSource, SourceKind};
use crate::{
    amount::{api_amount_to_decimal, parse_base_units},
    cache::TtlCache,
    chain::IERC20,
    config::{self, VaultscopeConfig},
    contracts::ContractQueryService,
    errors::UpstreamError,
    retry::RetryPolicy,
};
use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use eyre::Context as _;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

const WETH_DECIMALS: u8 = 18;
const USDC_DECIMALS: u8 = 6;

/// Token decimals for sizing a one-token quote; unreadable tokens are assumed to use 18.
async fn token_decimals(
    contracts: &ContractQueryService,
    token: Address,
    policy: &RetryPolicy,
) -> u8 {
    let ttl = contracts.settings().contract_ttl;
    match contracts
        .call_cached_with(token, &IERC20::decimalsCall {}, None, ttl, policy)
        .await
    {
        Ok(d) => d,
        Err(e) => {
            debug!(token = %token, error = %e, "decimals unavailable; assuming 18");
            WETH_DECIMALS
        }
    }
}

fn one_token(decimals: u8) -> U256 {
    U256::from(10_u64).pow(U256::from(decimals))
}

fn positive(price: Decimal) -> Option<Decimal> {
    (price > Decimal::ZERO).then_some(price)
}

fn bad_amount(api: &str, e: &eyre::Report) -> UpstreamError {
    UpstreamError::NotFound(format!("{api}: unusable quote amount: {e:#}"))
}

#[derive(Debug, Deserialize)]
struct CowQuoteResponse {
    #[serde(default)]
    quote: Option<CowQuote>,
    #[serde(rename = "buyAmount", default)]
    buy_amount: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CowQuote {
    #[serde(rename = "buyAmount")]
    buy_amount: String,
}

impl CowQuoteResponse {
    fn buy_amount(&self) -> Option<&str> {
        self.quote
            .as_ref()
            .map(|q| q.buy_amount.as_str())
            .or(self.buy_amount.as_deref())
    }
}

/// CoW Protocol sell quotes, priced through WETH: token -> WETH -> USDC.
pub struct CowSwapQuote {
    api: HttpApi,
    contracts: Arc<ContractQueryService>,
    cache: Arc<TtlCache<Decimal>>,
    weth: Address,
    usdc: Address,
    eth_price_ttl: Option<Duration>,
    policy: RetryPolicy,
}

impl CowSwapQuote {
    pub const NAME: &'static str = "cowswap";

    pub fn new(
        cfg: &VaultscopeConfig,
        contracts: Arc<ContractQueryService>,
        cache: Arc<TtlCache<Decimal>>,
    ) -> eyre::Result<Self> {
        Ok(Self {
            api: HttpApi::new(Self::NAME, &cfg.http.cowswap_base_urls, cfg)?,
            contracts,
            cache,
            weth: cfg.prices.weth.parse().context("parse prices.weth")?,
            usdc: cfg.prices.usdc.parse().context("parse prices.usdc")?,
            eth_price_ttl: config::ttl(cfg.cache.eth_price_ttl_seconds),
            policy: RetryPolicy::price(&cfg.retry),
        })
    }

    async fn quote(&self, sell: Address, buy: Address, amount: U256) -> Result<U256, UpstreamError> {
        let body = json!({
            "sellToken": format!("{sell:#x}"),
            "buyToken": format!("{buy:#x}"),
            "sellAmountBeforeFee": amount.to_string(),
            "kind": "sell",
            "from": format!("{:#x}", Address::ZERO),
        });
        let resp: CowQuoteResponse = self.api.post_json("/api/v1/quote", &body).await?;
        let raw = resp
            .buy_amount()
            .ok_or_else(|| UpstreamError::NotFound("cowswap: quote without buyAmount".to_owned()))?;
        parse_base_units(raw).map_err(|e| bad_amount(Self::NAME, &e))
    }

    async fn eth_usd(&self) -> Result<Decimal, UpstreamError> {
        let key = format!("{}:eth_usd", Self::NAME);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }
        let out = self
            .quote(self.weth, self.usdc, one_token(WETH_DECIMALS))
            .await?;
        let price = crate::amount::base_units_to_decimal(out, USDC_DECIMALS)
            .map_err(|e| bad_amount(Self::NAME, &e))?;
        if price > Decimal::ZERO {
            if let Err(e) = self.cache.set(&key, price, self.eth_price_ttl) {
                warn!(error = %e, "price cache write failed");
            }
        }
        Ok(price)
    }

    async fn token_eth(&self, token: Address) -> Result<Decimal, UpstreamError> {
        if token == self.weth {
            return Ok(Decimal::ONE);
        }
        let decimals = token_decimals(&self.contracts, token, &self.policy).await;
        let out = self.quote(token, self.weth, one_token(decimals)).await?;
        crate::amount::base_units_to_decimal(out, WETH_DECIMALS)
            .map_err(|e| bad_amount(Self::NAME, &e))
    }
}

#[async_trait]
impl PriceSource for CowSwapQuote {
    fn kind(&self) -> SourceKind {
        SourceKind::DexQuote
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn price_usd(&self, token: Address) -> Result<Option<Decimal>, UpstreamError> {
        let eth_usd = self.eth_usd().await?;
        let token_eth = self.token_eth(token).await?;
        Ok(token_eth.checked_mul(eth_usd).and_then(positive))
    }
}

#[derive(Debug, Deserialize)]
struct OneInchQuoteResponse {
    #[serde(rename = "toTokenAmount", alias = "dstAmount")]
    to_token_amount: String,
}

/// 1inch aggregation quotes straight into USDC. Needs an API key; without one it prices nothing.
pub struct OneInchQuote {
    api: HttpApi,
    contracts: Arc<ContractQueryService>,
    api_key: Option<String>,
    usdc: Address,
    policy: RetryPolicy,
}

impl OneInchQuote {
    pub const NAME: &'static str = "oneinch";

    pub fn new(cfg: &VaultscopeConfig, contracts: Arc<ContractQueryService>) -> eyre::Result<Self> {
        Ok(Self {
            api: HttpApi::new(Self::NAME, &cfg.http.oneinch_base_urls, cfg)?,
            contracts,
            api_key: cfg
                .http
                .oneinch_api_key
                .clone()
                .filter(|k| !k.trim().is_empty()),
            usdc: cfg.prices.usdc.parse().context("parse prices.usdc")?,
            policy: RetryPolicy::price(&cfg.retry),
        })
    }
}

#[async_trait]
impl PriceSource for OneInchQuote {
    fn kind(&self) -> SourceKind {
        SourceKind::DexQuote
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn price_usd(&self, token: Address) -> Result<Option<Decimal>, UpstreamError> {
        let Some(key) = self.api_key.as_deref() else {
            return Ok(None);
        };
        let decimals = token_decimals(&self.contracts, token, &self.policy).await;
        let query = [
            ("src", format!("{token:#x}")),
            ("dst", format!("{:#x}", self.usdc)),
            ("amount", one_token(decimals).to_string()),
        ];
        let resp: OneInchQuoteResponse = self
            .api
            .get_json("/swap/v5.2/1/quote", &query, Some(key))
            .await?;
        let price = api_amount_to_decimal(&resp.to_token_amount, USDC_DECIMALS)
            .map_err(|e| bad_amount(Self::NAME, &e))?;
        Ok(positive(price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::CallRequest,
        config::BatchConfig,
        contracts::tests::{service, FakeCaller},
    };
    use alloy::primitives::Bytes;
    use mockito::Matcher;
    use std::str::FromStr as _;

    const TOKEN: Address = alloy::primitives::address!("0x1111111111111111111111111111111111111111");

    fn decimals_node(decimals: u8) -> Arc<FakeCaller> {
        Arc::new(FakeCaller::new(move |_req: &CallRequest| {
            Ok(Bytes::from(<alloy::sol_types::sol_data::Uint<8> as alloy::sol_types::SolType>::abi_encode(&decimals)))
        }))
    }

    fn config_for(base: &str) -> VaultscopeConfig {
        let mut cfg = VaultscopeConfig::default();
        cfg.http.cowswap_base_urls = vec![base.to_owned()];
        cfg.http.oneinch_base_urls = vec![base.to_owned()];
        cfg
    }

    #[tokio::test]
    async fn cowswap_prices_through_weth_and_caches_eth_usd() -> eyre::Result<()> {
        let mut server = mockito::Server::new_async().await;
        let cfg = config_for(&server.url());
        let eth_leg = server
            .mock("POST", "/api/v1/quote")
            .match_body(Matcher::PartialJson(json!({ "sellToken": cfg.prices.weth.to_lowercase() })))
            .with_status(200)
            .with_body(r#"{"quote":{"buyAmount":"2500000000"}}"#)
            .expect(1)
            .create_async()
            .await;
        let token_leg = server
            .mock("POST", "/api/v1/quote")
            .match_body(Matcher::PartialJson(json!({
                "sellToken": format!("{TOKEN:#x}"),
                "sellAmountBeforeFee": "1000000",
            })))
            .with_status(200)
            .with_body(r#"{"buyAmount":"500000000000000000"}"#)
            .expect(2)
            .create_async()
            .await;

        let td = tempfile::tempdir()?;
        let contracts = Arc::new(service(td.path(), decimals_node(6), BatchConfig::default())?);
        let cache = Arc::new(TtlCache::open(td.path(), "price_cache.json"));
        let src = CowSwapQuote::new(&cfg, contracts, Arc::clone(&cache))?;

        for _ in 0..2 {
            let price = src.price_usd(TOKEN).await?;
            assert_eq!(price, Some(Decimal::from_str("1250")?));
        }
        assert_eq!(cache.get("cowswap:eth_usd"), Some(Decimal::from(2500)));
        eth_leg.assert_async().await;
        token_leg.assert_async().await;
        Ok(())
    }

    #[tokio::test]
    async fn cowswap_unsupported_token_is_not_found() -> eyre::Result<()> {
        let mut server = mockito::Server::new_async().await;
        let cfg = config_for(&server.url());
        let _eth = server
            .mock("POST", "/api/v1/quote")
            .match_body(Matcher::PartialJson(json!({ "sellToken": cfg.prices.weth.to_lowercase() })))
            .with_status(200)
            .with_body(r#"{"quote":{"buyAmount":"2500000000"}}"#)
            .create_async()
            .await;
        let _token = server
            .mock("POST", "/api/v1/quote")
            .match_body(Matcher::PartialJson(json!({ "sellToken": format!("{TOKEN:#x}") })))
            .with_status(400)
            .with_body(r#"{"errorType":"NoLiquidity"}"#)
            .create_async()
            .await;

        let td = tempfile::tempdir()?;
        let contracts = Arc::new(service(td.path(), decimals_node(18), BatchConfig::default())?);
        let cache = Arc::new(TtlCache::open(td.path(), "price_cache.json"));
        let src = CowSwapQuote::new(&cfg, contracts, cache)?;

        let err = src
            .price_usd(TOKEN)
            .await
            .err()
            .ok_or_else(|| eyre::eyre!("expected a quote failure"))?;
        assert_eq!(err.class(), crate::errors::ErrorClass::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn oneinch_without_key_prices_nothing() -> eyre::Result<()> {
        let server = mockito::Server::new_async().await;
        let td = tempfile::tempdir()?;
        let node = decimals_node(18);
        let contracts = Arc::new(service(td.path(), Arc::clone(&node), BatchConfig::default())?);
        let src = OneInchQuote::new(&config_for(&server.url()), contracts)?;

        assert_eq!(src.price_usd(TOKEN).await?, None);
        assert_eq!(
            node.calls.load(std::sync::atomic::Ordering::SeqCst),
            0,
            "no chain reads without a key"
        );
        Ok(())
    }

    #[tokio::test]
    async fn oneinch_quotes_into_usdc_with_bearer_key() -> eyre::Result<()> {
        let mut server = mockito::Server::new_async().await;
        let mut cfg = config_for(&server.url());
        cfg.http.oneinch_api_key = Some("k-123".to_owned());
        let m = server
            .mock("GET", "/swap/v5.2/1/quote")
            .match_header("authorization", "Bearer k-123")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("src".into(), format!("{TOKEN:#x}")),
                Matcher::UrlEncoded("amount".into(), "1000000000000000000".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"toTokenAmount":"3012500000"}"#)
            .create_async()
            .await;

        let td = tempfile::tempdir()?;
        let contracts = Arc::new(service(td.path(), decimals_node(18), BatchConfig::default())?);
        let src = OneInchQuote::new(&cfg, contracts)?;

        assert_eq!(src.price_usd(TOKEN).await?, Some(Decimal::from_str("3012.5")?));
        m.assert_async().await;
        Ok(())
    }
}
