use crate::{
    cache::TtlCache,
    chain::{decode, CallRequest, ContractCaller},
    config::{BatchConfig, DiscoveryConfig, VaultscopeConfig},
    errors::{ErrorClass, UpstreamError},
    pool::EndpointPool,
    rate_limit::RateLimiter,
    retry::{retry_classified, RetryPolicy},
};
use alloy::{
    primitives::{Address, Bytes, U256},
    sol_types::SolCall,
};
use futures::future::join_all;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub rpc_policy: RetryPolicy,
    /// Finite budget for batch items and token metadata, where a failure only empties one slot.
    pub batch_policy: RetryPolicy,
    pub discovery_policy: RetryPolicy,
    /// TTL for [`ContractQueryService::call_cached`]; `None` keeps results until invalidated.
    pub contract_ttl: Option<Duration>,
    pub batch: BatchConfig,
    pub discovery: DiscoveryConfig,
}

impl QuerySettings {
    pub fn from_config(cfg: &VaultscopeConfig) -> Self {
        Self {
            rpc_policy: RetryPolicy::rpc(&cfg.retry),
            batch_policy: RetryPolicy::batch(&cfg.retry),
            discovery_policy: RetryPolicy::discovery(&cfg.retry),
            contract_ttl: crate::config::ttl(cfg.cache.contract_ttl_seconds),
            batch: cfg.batch.clone(),
            discovery: cfg.discovery.clone(),
        }
    }
}

/// Cached, rate limited, retried contract reads over a pool of RPC endpoints.
pub struct ContractQueryService {
    caller: Arc<dyn ContractCaller>,
    pool: Arc<EndpointPool>,
    limiter: Arc<RateLimiter>,
    cache: TtlCache<String>,
    settings: QuerySettings,
}

impl std::fmt::Debug for ContractQueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractQueryService")
            .field("pool", &self.pool.label())
            .field("cache", &self.cache.name())
            .finish_non_exhaustive()
    }
}

impl ContractQueryService {
    pub fn new(
        caller: Arc<dyn ContractCaller>,
        pool: Arc<EndpointPool>,
        limiter: Arc<RateLimiter>,
        cache: TtlCache<String>,
        settings: QuerySettings,
    ) -> Self {
        Self {
            caller,
            pool,
            limiter,
            cache,
            settings,
        }
    }

    pub fn pool(&self) -> &EndpointPool {
        &self.pool
    }

    pub const fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    /// One attempt: wait for a rate-limit slot, pick an endpoint, call, report the outcome.
    async fn attempt(&self, request: &CallRequest) -> Result<Bytes, UpstreamError> {
        self.limiter.acquire().await;
        let ep = self.pool.select().await;
        match self.caller.call(&ep.url, request).await {
            Ok(out) => {
                self.pool.report_success(&ep);
                Ok(out)
            }
            Err(e) => {
                debug!(endpoint = %ep.name, call = request.label, error = %e, "contract call failed");
                self.pool.report_failure(&ep, e.class());
                Err(e)
            }
        }
    }

    /// Uncached call under `policy`.
    pub async fn call_raw(
        &self,
        request: &CallRequest,
        policy: &RetryPolicy,
    ) -> Result<Bytes, UpstreamError> {
        retry_classified(policy, request.label, || self.attempt(request)).await
    }

    pub async fn call_with<C: SolCall>(
        &self,
        to: Address,
        call: &C,
        policy: &RetryPolicy,
    ) -> Result<C::Return, UpstreamError> {
        let raw = self.call_raw(&CallRequest::new(to, call), policy).await?;
        decode::<C>(&raw)
    }

    /// Cached call returning raw return data. Only non-empty successful results are stored.
    pub async fn call_raw_cached(
        &self,
        request: &CallRequest,
        cache_key: Option<&str>,
        ttl: Option<Duration>,
        policy: &RetryPolicy,
    ) -> Result<Bytes, UpstreamError> {
        let key = cache_key.map_or_else(|| request.cache_key(), str::to_owned);
        if let Some(hit) = self.cache.get(&key) {
            match hex::decode(hit.trim_start_matches("0x")) {
                Ok(bytes) => return Ok(Bytes::from(bytes)),
                Err(e) => warn!(key = %key, error = %e, "dropping undecodable cache entry"),
            }
        }

        let raw = self.call_raw(request, policy).await?;
        if !raw.is_empty() {
            if let Err(e) = self.cache.set(&key, format!("0x{}", hex::encode(&raw)), ttl) {
                warn!(error = %e, "contract cache write failed; continuing with live result");
            }
        }
        Ok(raw)
    }

    pub async fn call_cached_with<C: SolCall>(
        &self,
        to: Address,
        call: &C,
        cache_key: Option<&str>,
        ttl: Option<Duration>,
        policy: &RetryPolicy,
    ) -> Result<C::Return, UpstreamError> {
        let request = CallRequest::new(to, call);
        let raw = self
            .call_raw_cached(&request, cache_key, ttl, policy)
            .await?;
        decode::<C>(&raw)
    }

    /// Cached typed call with the configured contract TTL and RPC retry policy.
    pub async fn call_cached<C: SolCall>(
        &self,
        to: Address,
        call: &C,
        cache_key: Option<&str>,
    ) -> Result<C::Return, UpstreamError> {
        self.call_cached_with(
            to,
            call,
            cache_key,
            self.settings.contract_ttl,
            &self.settings.rpc_policy,
        )
        .await
    }

    /// Independent cached reads, fanned out per group and run group after group.
    ///
    /// The result has one slot per request; a failed read leaves its own slot empty. Each item
    /// runs under the batch retry budget, so one failing read cannot hold up its group.
    pub async fn batch_call_raw_cached(&self, requests: &[CallRequest]) -> Vec<Option<Bytes>> {
        let group_size = self.settings.batch.group_size.max(1);
        let delay = Duration::from_millis(self.settings.batch.group_delay_ms);
        let groups = requests.len().div_ceil(group_size);
        let mut out = Vec::with_capacity(requests.len());

        for (gi, group) in requests.chunks(group_size).enumerate() {
            let results = join_all(group.iter().map(|req| async move {
                match self
                    .call_raw_cached(
                        req,
                        None,
                        self.settings.contract_ttl,
                        &self.settings.batch_policy,
                    )
                    .await
                {
                    Ok(raw) => Some(raw),
                    Err(e) => {
                        debug!(call = req.label, to = %req.to, class = e.code(), error = %e, "batch item failed");
                        None
                    }
                }
            }))
            .await;
            out.extend(results);

            if gi.saturating_add(1) < groups && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        out
    }

    pub async fn batch_call_cached<C: SolCall>(
        &self,
        calls: &[(Address, C)],
    ) -> Vec<Option<C::Return>> {
        let requests: Vec<CallRequest> = calls
            .iter()
            .map(|(to, call)| CallRequest::new(*to, call))
            .collect();
        let raw = self.batch_call_raw_cached(&requests).await;
        let decoded: Vec<Option<C::Return>> = raw
            .into_iter()
            .map(|r| r.and_then(|b| decode::<C>(&b).ok()))
            .collect();
        let failed = decoded.iter().filter(|r| r.is_none()).count();
        if failed > 0 {
            info!(total = decoded.len(), failed, "batch finished with missing items");
        }
        decoded
    }

    /// Enumerate array-style storage by reading `index_call(0)`, `index_call(1)`, ...
    ///
    /// Stops at the first zero address, after `failure_threshold` consecutive empty or reverted
    /// reads, or when rate limiting outlasts the discovery retry budget. Whatever was collected
    /// up to that point is returned.
    pub async fn discover<C, F>(&self, to: Address, index_call: F) -> Vec<Address>
    where
        C: SolCall<Return = Address>,
        F: Fn(U256) -> C,
    {
        let threshold = self.settings.discovery.failure_threshold.max(1);
        let mut found = Vec::new();
        let mut failures = 0_u32;

        for i in 0..self.settings.discovery.max_index {
            let call = index_call(U256::from(i));
            match self
                .call_with(to, &call, &self.settings.discovery_policy)
                .await
            {
                Ok(addr) if addr == Address::ZERO => {
                    debug!(contract = %to, index = i, "zero address; end of list");
                    break;
                }
                Ok(addr) => {
                    failures = 0;
                    found.push(addr);
                }
                Err(e)
                    if e.class() == ErrorClass::Unavailable
                        && e.root_class() == ErrorClass::RateLimited =>
                {
                    warn!(contract = %to, index = i, error = %e, "rate limited past rotation budget; stopping discovery");
                    break;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    debug!(contract = %to, index = i, failures, error = %e, "empty read during discovery");
                    if failures >= threshold {
                        debug!(contract = %to, index = i, "failure threshold reached; stopping discovery");
                        break;
                    }
                }
            }
        }

        info!(contract = %to, found = found.len(), "discovery finished");
        found
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        chain::{IController, IERC20},
        config::EndpointConfig,
        pool::PoolSettings,
    };
    use alloy::sol_types::SolValue as _;
    use async_trait::async_trait;
    use eyre::Context as _;
    use std::sync::atomic::{AtomicU32, Ordering};

    type Responder = dyn Fn(&CallRequest) -> Result<Bytes, UpstreamError> + Send + Sync;

    /// In-memory node answering every call with a closure.
    pub(crate) struct FakeCaller {
        respond: Box<Responder>,
        pub(crate) calls: AtomicU32,
    }

    impl FakeCaller {
        pub(crate) fn new(
            respond: impl Fn(&CallRequest) -> Result<Bytes, UpstreamError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                respond: Box::new(respond),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ContractCaller for FakeCaller {
        async fn call(
            &self,
            _endpoint_url: &str,
            request: &CallRequest,
        ) -> Result<Bytes, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.respond)(request)
        }

        async fn probe(&self, _endpoint_url: &str) -> Result<(), UpstreamError> {
            Ok(())
        }
    }

    pub(crate) fn settings(batch: BatchConfig) -> QuerySettings {
        let mut settings = QuerySettings::from_config(&VaultscopeConfig::default());
        settings.batch = batch;
        for policy in [
            &mut settings.rpc_policy,
            &mut settings.batch_policy,
            &mut settings.discovery_policy,
        ] {
            policy.jitter_max_ms = 0;
        }
        settings
    }

    pub(crate) fn service(
        dir: &std::path::Path,
        caller: Arc<FakeCaller>,
        batch: BatchConfig,
    ) -> eyre::Result<ContractQueryService> {
        service_with(dir, caller, settings(batch))
    }

    pub(crate) fn service_with(
        dir: &std::path::Path,
        caller: Arc<FakeCaller>,
        settings: QuerySettings,
    ) -> eyre::Result<ContractQueryService> {
        let pool = EndpointPool::new(
            "rpc",
            vec![
                EndpointConfig::new("a", "http://a.invalid"),
                EndpointConfig::new("b", "http://b.invalid"),
            ],
            PoolSettings::default(),
        )?;
        Ok(ContractQueryService::new(
            caller,
            Arc::new(pool),
            Arc::new(RateLimiter::per_second(1_000)),
            TtlCache::open(dir, "contracts_cache.json"),
            settings,
        ))
    }

    fn word(addr: Address) -> Bytes {
        Bytes::from(addr.abi_encode())
    }

    fn index_of(req: &CallRequest) -> Result<u64, UpstreamError> {
        let call = IController::loansCall::abi_decode(&req.calldata)
            .map_err(|e| UpstreamError::Transient(format!("{e}")))?;
        u64::try_from(call.i).map_err(|e| UpstreamError::Transient(format!("{e}")))
    }

    fn addr_for(i: u64) -> Address {
        Address::left_padding_from(&i.saturating_add(1).to_be_bytes())
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_stops_at_zero_address() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        let caller = Arc::new(FakeCaller::new(|req| {
            let i = index_of(req)?;
            Ok(word(if i < 5 { addr_for(i) } else { Address::ZERO }))
        }));
        let svc = service(td.path(), Arc::clone(&caller), BatchConfig::default())?;

        let found = svc
            .discover(Address::repeat_byte(0xcc), |i| IController::loansCall { i })
            .await;
        assert_eq!(found, (0..5).map(addr_for).collect::<Vec<_>>());
        assert_eq!(caller.calls.load(Ordering::SeqCst), 6, "one read past the end");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_skips_isolated_reverts_and_stops_at_threshold() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        let caller = Arc::new(FakeCaller::new(|req| {
            let i = index_of(req)?;
            match i {
                0 | 2 => Ok(word(addr_for(i))),
                1 => Err(UpstreamError::classify("execution reverted")),
                _ => Ok(Bytes::new()),
            }
        }));
        let svc = service(td.path(), Arc::clone(&caller), BatchConfig::default())?;

        let found = svc
            .discover(Address::repeat_byte(0xcc), |i| IController::loansCall { i })
            .await;
        assert_eq!(found, vec![addr_for(0), addr_for(2)]);
        assert_eq!(
            caller.calls.load(Ordering::SeqCst),
            13,
            "three good reads then ten empty ones"
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_ends_when_rate_limits_exhaust_the_budget() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        let caller = Arc::new(FakeCaller::new(|req| {
            let i = index_of(req)?;
            if i < 2 {
                Ok(word(addr_for(i)))
            } else {
                Err(UpstreamError::classify("HTTP error 429"))
            }
        }));
        let svc = service(td.path(), Arc::clone(&caller), BatchConfig::default())?;

        let found = svc
            .discover(Address::repeat_byte(0xcc), |i| IController::loansCall { i })
            .await;
        assert_eq!(found, vec![addr_for(0), addr_for(1)], "partial result survives");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn batch_failure_only_empties_its_own_slot() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        let bad = Address::repeat_byte(3);
        let caller = Arc::new(FakeCaller::new(move |req| {
            if req.to == bad {
                Err(UpstreamError::classify("execution reverted"))
            } else {
                Ok(Bytes::from(<alloy::sol_types::sol_data::Uint<8> as alloy::sol_types::SolType>::abi_encode(&18_u8)))
            }
        }));
        let svc = service(td.path(), caller, BatchConfig::default())?;

        let calls: Vec<(Address, IERC20::decimalsCall)> = (1..=5_u8)
            .map(|b| (Address::repeat_byte(b), IERC20::decimalsCall {}))
            .collect();
        let out = svc.batch_call_cached(&calls).await;
        assert_eq!(out, vec![Some(18), Some(18), None, Some(18), Some(18)]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn batch_item_that_keeps_failing_comes_back_empty() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        let bad = Address::repeat_byte(3);
        let caller = Arc::new(FakeCaller::new(move |req| {
            if req.to == bad {
                Err(UpstreamError::Transient("connection reset".into()))
            } else {
                Ok(Bytes::from(<alloy::sol_types::sol_data::Uint<8> as alloy::sol_types::SolType>::abi_encode(&18_u8)))
            }
        }));
        let svc = service(td.path(), Arc::clone(&caller), BatchConfig::default())?;
        let budget = svc
            .settings()
            .batch_policy
            .timeout
            .ok_or_else(|| eyre::eyre!("batch policy must be bounded"))?;
        assert_eq!(svc.settings().rpc_policy.timeout, None, "default rpc policy is unbounded");

        let calls: Vec<(Address, IERC20::decimalsCall)> = (1..=5_u8)
            .map(|b| (Address::repeat_byte(b), IERC20::decimalsCall {}))
            .collect();
        let start = tokio::time::Instant::now();
        let out = tokio::time::timeout(
            Duration::from_secs(24 * 60 * 60),
            svc.batch_call_cached(&calls),
        )
        .await
        .context("batch must finish")?;
        assert_eq!(out, vec![Some(18), Some(18), None, Some(18), Some(18)]);
        assert!(
            start.elapsed() < budget + Duration::from_secs(1),
            "failing item gave up after {:?}",
            start.elapsed()
        );
        assert!(
            caller.calls.load(Ordering::SeqCst) > 5,
            "the failing item was retried before giving up"
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_counts_exhausted_transient_reads_toward_threshold() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        let caller = Arc::new(FakeCaller::new(|req| {
            let i = index_of(req)?;
            if i == 0 {
                Ok(word(addr_for(i)))
            } else {
                Err(UpstreamError::Transient("connection reset".into()))
            }
        }));
        let mut cfg = settings(BatchConfig::default());
        cfg.discovery.failure_threshold = 2;
        let budget = cfg
            .discovery_policy
            .timeout
            .ok_or_else(|| eyre::eyre!("discovery policy must be bounded"))?;
        let svc = service_with(td.path(), caller, cfg)?;

        let start = tokio::time::Instant::now();
        let found = svc
            .discover(Address::repeat_byte(0xcc), |i| IController::loansCall { i })
            .await;
        assert_eq!(found, vec![addr_for(0)], "reads before the outage survive");
        let elapsed = start.elapsed();
        assert!(
            elapsed >= budget * 2 && elapsed < budget * 3,
            "two indices each used up the discovery budget, took {elapsed:?}"
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn batch_groups_run_sequentially_with_delay() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        let caller = Arc::new(FakeCaller::new(|_req| Ok(Bytes::from(<alloy::sol_types::sol_data::Uint<8> as alloy::sol_types::SolType>::abi_encode(&6_u8)))));
        let svc = service(
            td.path(),
            caller,
            BatchConfig {
                group_size: 20,
                group_delay_ms: 500,
            },
        )?;

        let calls: Vec<(Address, IERC20::decimalsCall)> = (0..45_u64)
            .map(|i| (addr_for(i), IERC20::decimalsCall {}))
            .collect();
        let start = tokio::time::Instant::now();
        let out = svc.batch_call_cached(&calls).await;
        assert_eq!(out.len(), 45);
        assert!(out.iter().all(|r| *r == Some(6)));
        assert_eq!(
            start.elapsed(),
            Duration::from_millis(1_000),
            "two pauses between three groups"
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cached_call_hits_the_node_once() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        let caller = Arc::new(FakeCaller::new(|_req| Ok(Bytes::from(<alloy::sol_types::sol_data::Uint<8> as alloy::sol_types::SolType>::abi_encode(&8_u8)))));
        let svc = service(td.path(), Arc::clone(&caller), BatchConfig::default())?;

        let token = Address::repeat_byte(9);
        let a = svc
            .call_cached(token, &IERC20::decimalsCall {}, None)
            .await?;
        let b = svc
            .call_cached(token, &IERC20::decimalsCall {}, None)
            .await?;
        assert_eq!((a, b), (8, 8));
        assert_eq!(caller.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_endpoint_is_rotated_out() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        let caller = Arc::new(FakeCaller::new(|_req| Ok(Bytes::from(<alloy::sol_types::sol_data::Uint<8> as alloy::sol_types::SolType>::abi_encode(&8_u8)))));
        let svc = service(td.path(), caller, BatchConfig::default())?;
        let first = svc.pool().select().await;
        svc.pool().report_failure(&first, ErrorClass::RateLimited);
        let next = svc.pool().select().await;
        assert_ne!(first.name, next.name);
        Ok(())
    }
}
