use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

pub const WETH_ADDRESS: &str = "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2";
pub const USDC_ADDRESS: &str = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48";

/// One configured upstream endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
    /// Scales the per-endpoint request quota before rotation.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

const fn default_weight() -> u32 {
    1
}

impl EndpointConfig {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_owned(),
            url: url.to_owned(),
            weight: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Ethereum mainnet RPC endpoints, in preference order. `${VAR}` placeholders are expanded
    /// from the environment at startup.
    pub endpoints: Vec<EndpointConfig>,
    /// Requests served by one endpoint before rotating to the next (multiplied by its weight).
    pub requests_per_endpoint: u32,
    /// Consecutive errors that disable an endpoint.
    pub error_threshold: u32,
    /// How long a disabled endpoint sits out before it is reconsidered.
    pub cooldown_seconds: u64,
    /// Liveness probe attempts per endpoint at startup.
    pub probe_attempts: u32,
    pub request_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
}

/// A single default endpoint used by the table-driven [`RpcConfig::default()`].
struct EndpointDef {
    name: &'static str,
    url: &'static str,
}

const ETHEREUM_ENDPOINTS: &[EndpointDef] = &[
    EndpointDef {
        name: "llamarpc",
        url: "https://eth.llamarpc.com",
    },
    EndpointDef {
        name: "publicnode",
        url: "https://ethereum-rpc.publicnode.com",
    },
    EndpointDef {
        name: "ankr",
        url: "https://rpc.ankr.com/eth",
    },
    EndpointDef {
        name: "cloudflare",
        url: "https://cloudflare-eth.com",
    },
];

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoints: ETHEREUM_ENDPOINTS
                .iter()
                .map(|d| EndpointConfig::new(d.name, d.url))
                .collect(),
            requests_per_endpoint: 10,
            error_threshold: 3,
            cooldown_seconds: 5 * 60,
            probe_attempts: 3,
            request_timeout_seconds: 30,
            connect_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Shared budget for contract calls across all RPC endpoints.
    pub calls_per_second: u32,
    /// Budget for each HTTP price API.
    pub price_api_calls_per_second: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls_per_second: 10,
            price_api_calls_per_second: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub price_timeout_seconds: u64,
    /// 0 means unbounded: keep rotating endpoints until the call succeeds.
    pub rpc_timeout_seconds: u64,
    pub discovery_timeout_seconds: u64,
    /// Budget for one batch item or token metadata read. A read that outlasts it comes back
    /// empty; 0 falls back to unbounded retrying.
    pub batch_timeout_seconds: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Immediate retries on a fresh endpoint after a rate-limit signal, before backing off.
    pub max_rotations: u32,
    pub jitter_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            price_timeout_seconds: 15,
            rpc_timeout_seconds: 0,
            discovery_timeout_seconds: 300,
            batch_timeout_seconds: 60,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_rotations: 3,
            jitter_max_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Consecutive empty or reverted reads that end a discovery loop.
    pub failure_threshold: u32,
    /// Hard cap on indices probed by one loop.
    pub max_index: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            max_index: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub group_size: usize,
    pub group_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            group_size: 20,
            group_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Overrides `<data_dir>/cache`.
    pub dir: Option<std::path::PathBuf>,
    /// Contract call results. 0 keeps entries until the file is removed.
    pub contract_ttl_seconds: u64,
    pub token_ttl_seconds: u64,
    pub loan_ttl_seconds: u64,
    pub price_ttl_seconds: u64,
    pub eth_price_ttl_seconds: u64,
    pub oracle_feed_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            contract_ttl_seconds: 0,
            token_ttl_seconds: 12 * 60 * 60,
            loan_ttl_seconds: 4 * 60 * 60,
            price_ttl_seconds: 5 * 60,
            eth_price_ttl_seconds: 5 * 60,
            oracle_feed_ttl_seconds: 7 * 24 * 60 * 60,
        }
    }
}

/// Cache TTL from a seconds knob; 0 disables expiry.
pub const fn ttl(seconds: u64) -> Option<Duration> {
    if seconds == 0 {
        None
    } else {
        Some(Duration::from_secs(seconds))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Take the first positive price in priority order.
    #[default]
    FirstSuccess,
    /// Query every source and average positive prices by source weight.
    WeightedAverage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricesConfig {
    /// Source names in priority order: `chainlink`, `cowswap`, `oneinch`, `coingecko`.
    pub sources: Vec<String>,
    pub merge_policy: MergePolicy,
    /// Per-source weights for [`MergePolicy::WeightedAverage`]; missing sources weigh 1.
    pub weights: BTreeMap<String, u32>,
    /// Fixed USD prices for known stablecoins, keyed by lowercase address.
    pub stable_tokens: BTreeMap<String, Decimal>,
    /// CoinGecko ids keyed by lowercase token address.
    pub coingecko_ids: BTreeMap<String, String>,
    pub chainlink_feed_registry: String,
    pub chainlink_eth_usd_feed: String,
    pub weth: String,
    pub usdc: String,
}

impl Default for PricesConfig {
    fn default() -> Self {
        let stable_tokens = [
            (USDC_ADDRESS, Decimal::ONE),
            ("0xdAC17F958D2ee523a2206206994597C13D831ec7", Decimal::ONE),
            ("0x6B175474E89094C44Da98b954EedeAC495271d0F", Decimal::ONE),
            ("0xf939E0A03FB07F59A73314E73794Be0E57ac1b4E", Decimal::ONE),
            ("0x853d955aCEf822Db058eb8505911ED77F175b99e", Decimal::ONE),
        ]
        .into_iter()
        .map(|(a, p)| (a.to_lowercase(), p))
        .collect();

        let coingecko_ids = [
            (WETH_ADDRESS, "weth"),
            ("0x2260FAC5E5542a773Aa44fBCfeDf7C193bc2C599", "wrapped-bitcoin"),
            ("0xae7ab96520DE3A18E5e111B5EaAb095312D7fE84", "staked-ether"),
            ("0x7f39C581F595B53c5cb19bD0b3f8dA6c935E2Ca0", "wrapped-steth"),
            ("0xD533a949740bb3306d119CC777fa900bA034cd52", "curve-dao-token"),
        ]
        .into_iter()
        .map(|(a, id)| (a.to_lowercase(), id.to_owned()))
        .collect();

        Self {
            sources: ["chainlink", "cowswap", "oneinch", "coingecko"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            merge_policy: MergePolicy::FirstSuccess,
            weights: BTreeMap::new(),
            stable_tokens,
            coingecko_ids,
            chainlink_feed_registry: "0x47Fb2585D2C56Fe188D0E6ec628a38b74fCeeeDf".into(),
            chainlink_eth_usd_feed: "0x5f4eC3Df9cbd43714FE2740f5E3616155c5b8419".into(),
            weth: WETH_ADDRESS.into(),
            usdc: USDC_ADDRESS.into(),
        }
    }
}

impl PricesConfig {
    /// Fixed USD price of a stablecoin. Addresses match regardless of checksum casing.
    pub fn stable_price(&self, token: &str) -> Option<Decimal> {
        self.stable_tokens
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(token))
            .map(|(_, p)| *p)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// CowSwap order-book API base URLs (mainnet).
    pub cowswap_base_urls: Vec<String>,
    /// 1inch API base URLs.
    pub oneinch_base_urls: Vec<String>,
    /// Optional 1inch API key. If unset, the 1inch source is disabled.
    pub oneinch_api_key: Option<String>,
    /// CoinGecko API base URLs (keyless tier).
    pub coingecko_base_urls: Vec<String>,
    pub request_timeout_seconds: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            cowswap_base_urls: vec!["https://api.cow.fi/mainnet".into()],
            oneinch_base_urls: vec!["https://api.1inch.dev".into()],
            oneinch_api_key: None,
            coingecko_base_urls: vec!["https://api.coingecko.com/api/v3".into()],
            request_timeout_seconds: 20,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultscopeConfig {
    pub rpc: RpcConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub discovery: DiscoveryConfig,
    pub batch: BatchConfig,
    pub cache: CacheConfig,
    pub prices: PricesConfig,
    pub http: HttpConfig,
}

impl VaultscopeConfig {
    /// RPC endpoints with `${VAR}` placeholders expanded; entries that cannot be resolved are
    /// skipped with a warning.
    pub fn resolved_endpoints(&self) -> Vec<EndpointConfig> {
        self.rpc
            .endpoints
            .iter()
            .filter_map(|ep| match expand_env(&ep.url, |k| std::env::var(k).ok()) {
                Some(url) => Some(EndpointConfig {
                    url,
                    ..ep.clone()
                }),
                None => {
                    warn!(endpoint = %ep.name, "skipping endpoint with unresolved environment placeholder");
                    None
                }
            })
            .collect()
    }
}

/// Expand `${NAME}` placeholders using `lookup`. Returns `None` when any placeholder is unset,
/// empty or unterminated.
pub fn expand_env(input: &str, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        let (head, tail) = rest.split_at(start);
        out.push_str(head);
        let body = tail.get(2..)?;
        let end = body.find('}')?;
        let name = body.get(..end)?;
        let value = lookup(name.trim()).filter(|v| !v.trim().is_empty())?;
        out.push_str(value.trim());
        rest = body.get(end.saturating_add(1)..)?;
    }
    out.push_str(rest);
    Some(out)
}
