use super::{token_key, PriceSource, SourceKind};
use crate::{
    cache::TtlCache,
    config::{self, MergePolicy, VaultscopeConfig},
    retry::{with_retry, RetryPolicy},
};
use alloy::primitives::Address;
use futures::future::join_all;
use rust_decimal::Decimal;
use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Knobs for [`PriceAggregator`], read from `[prices]`, `[retry]` and `[cache]`.
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub price_ttl: Option<Duration>,
    pub policy: RetryPolicy,
    pub merge: MergePolicy,
    pub weights: BTreeMap<String, u32>,
}

impl AggregatorSettings {
    pub fn from_config(cfg: &VaultscopeConfig) -> Self {
        Self {
            price_ttl: config::ttl(cfg.cache.price_ttl_seconds),
            policy: RetryPolicy::price(&cfg.retry),
            merge: cfg.prices.merge_policy,
            weights: cfg.prices.weights.clone(),
        }
    }

    /// Weight by source name, then by source kind, defaulting to 1.
    fn weight_of(&self, source: &str, kind: SourceKind) -> u32 {
        self.weights
            .get(source)
            .or_else(|| self.weights.get(kind.as_str()))
            .copied()
            .unwrap_or(1)
    }
}

/// Token/USD prices from an ordered list of sources behind a shared cache.
///
/// A token no source can price yields `None`; callers treat that as "value unknown".
pub struct PriceAggregator {
    sources: Vec<Arc<dyn PriceSource>>,
    cache: Arc<TtlCache<Decimal>>,
    settings: AggregatorSettings,
}

impl fmt::Debug for PriceAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriceAggregator")
            .field(
                "sources",
                &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("cache", &self.cache.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl PriceAggregator {
    pub fn new(
        sources: Vec<Arc<dyn PriceSource>>,
        cache: Arc<TtlCache<Decimal>>,
        settings: AggregatorSettings,
    ) -> eyre::Result<Self> {
        if sources.is_empty() {
            eyre::bail!("price aggregator needs at least one source");
        }
        Ok(Self {
            sources,
            cache,
            settings,
        })
    }

    /// Configured sources in consultation order.
    pub fn sources(&self) -> Vec<(&'static str, SourceKind)> {
        self.sources.iter().map(|s| (s.name(), s.kind())).collect()
    }

    pub async fn get_price(&self, token: Address) -> Option<Decimal> {
        let key = token_key(token);
        if let Some(hit) = self.cache.get(&key) {
            debug!(token = %key, "price cache hit");
            return Some(hit);
        }

        let price = match self.settings.merge {
            MergePolicy::FirstSuccess => self.first_success(token).await,
            MergePolicy::WeightedAverage => self.weighted_average(token).await,
        };

        match price {
            Some(p) => {
                self.remember(&key, p);
                Some(p)
            }
            None => {
                info!(token = %key, "no source could price token");
                None
            }
        }
    }

    /// Prices for many tokens at once. Tokens without a price are left out of the map.
    pub async fn get_prices(&self, tokens: &[Address]) -> BTreeMap<Address, Decimal> {
        let mut unique = tokens.to_vec();
        unique.sort_unstable();
        unique.dedup();
        let prices = join_all(unique.iter().map(|t| self.get_price(*t))).await;
        unique
            .into_iter()
            .zip(prices)
            .filter_map(|(t, p)| p.map(|p| (t, p)))
            .collect()
    }

    async fn first_success(&self, token: Address) -> Option<Decimal> {
        for source in &self.sources {
            if let Some(p) = self.from_source(source.as_ref(), token).await {
                debug!(token = %token, source = source.name(), price = %p, "priced");
                return Some(p);
            }
        }
        None
    }

    async fn weighted_average(&self, token: Address) -> Option<Decimal> {
        let quotes = join_all(
            self.sources
                .iter()
                .map(|s| async move { (s.name(), s.kind(), self.from_source(s.as_ref(), token).await) }),
        )
        .await;

        let mut total = Decimal::ZERO;
        let mut weight_sum = Decimal::ZERO;
        for (name, kind, price) in quotes {
            let Some(p) = price else { continue };
            let w = Decimal::from(self.settings.weight_of(name, kind));
            if w.is_zero() {
                continue;
            }
            total = total.checked_add(p.checked_mul(w)?)?;
            weight_sum = weight_sum.checked_add(w)?;
        }
        if weight_sum.is_zero() {
            return None;
        }
        total.checked_div(weight_sum).map(|p| p.normalize())
    }

    /// One source under the price retry policy, with its own cache namespace.
    async fn from_source(&self, source: &dyn PriceSource, token: Address) -> Option<Decimal> {
        let key = format!("{}:{}", source.name(), token_key(token));
        if let Some(hit) = self.cache.get(&key) {
            return Some(hit);
        }

        let price = with_retry(&self.settings.policy, source.name(), || source.price_usd(token))
            .await
            .flatten()
            .filter(|p| *p > Decimal::ZERO)?;
        self.remember(&key, price);
        Some(price)
    }

    fn remember(&self, key: &str, price: Decimal) {
        if let Err(e) = self.cache.set(key, price, self.settings.price_ttl) {
            warn!(key, error = %e, "price cache write failed");
        }
    }
}
