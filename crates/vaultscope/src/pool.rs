use crate::{
    config::{EndpointConfig, RpcConfig},
    errors::{ErrorClass, UpstreamError},
};
use futures::future::join_all;
use serde::Serialize;
use std::{
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Requests served by the current endpoint before rotating, multiplied by its weight.
    pub requests_per_endpoint: u32,
    pub error_threshold: u32,
    pub cooldown: Duration,
    pub probe_attempts: u32,
}

impl PoolSettings {
    pub fn from_rpc(cfg: &RpcConfig) -> Self {
        Self {
            requests_per_endpoint: cfg.requests_per_endpoint,
            error_threshold: cfg.error_threshold,
            cooldown: Duration::from_secs(cfg.cooldown_seconds),
            probe_attempts: cfg.probe_attempts,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_rpc(&RpcConfig::default())
    }
}

/// Handle to one pool member, handed out by [`EndpointPool::select`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: usize,
    pub name: String,
    pub url: String,
    pub weight: u32,
}

#[derive(Debug)]
struct EndpointState {
    endpoint: Endpoint,
    active: bool,
    consecutive_errors: u32,
    disabled_until: Option<Instant>,
    last_used_at: Option<Instant>,
    requests_since_switch: u32,
}

#[derive(Debug)]
struct PoolState {
    endpoints: Vec<EndpointState>,
    current: usize,
}

/// Diagnostic row for one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub url: String,
    pub weight: u32,
    pub active: bool,
    pub current: bool,
    pub consecutive_errors: u32,
    pub requests_since_switch: u32,
    pub cooldown_remaining_ms: Option<u64>,
    pub idle_ms: Option<u64>,
}

/// Interchangeable upstream endpoints with weighted round-robin selection.
///
/// Each endpoint is `ACTIVE` until it signals a rate limit or fails `error_threshold` times in a
/// row, then sits out for `cooldown` and comes back with its error count reset. Endpoints are
/// never removed after construction.
#[derive(Debug)]
pub struct EndpointPool {
    label: String,
    settings: PoolSettings,
    state: Mutex<PoolState>,
}

impl EndpointPool {
    pub fn new(
        label: &str,
        endpoints: Vec<EndpointConfig>,
        settings: PoolSettings,
    ) -> eyre::Result<Self> {
        if endpoints.is_empty() {
            eyre::bail!("no usable endpoints for {label}");
        }
        let endpoints = endpoints
            .into_iter()
            .enumerate()
            .map(|(id, ep)| EndpointState {
                endpoint: Endpoint {
                    id,
                    name: ep.name,
                    url: ep.url,
                    weight: ep.weight.max(1),
                },
                active: true,
                consecutive_errors: 0,
                disabled_until: None,
                last_used_at: None,
                requests_since_switch: 0,
            })
            .collect();
        Ok(Self {
            label: label.to_owned(),
            settings,
            state: Mutex::new(PoolState {
                endpoints,
                current: 0,
            }),
        })
    }

    /// Build a pool from the endpoints that answer `probe` within `probe_attempts` tries.
    ///
    /// Unreachable endpoints are dropped for the lifetime of the pool. Losing all of them is a
    /// configuration failure.
    pub async fn probed<F, Fut>(
        label: &str,
        endpoints: Vec<EndpointConfig>,
        settings: PoolSettings,
        probe: F,
    ) -> eyre::Result<Self>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<(), UpstreamError>>,
    {
        let configured = endpoints.len();
        let attempts = settings.probe_attempts.max(1);
        let probe = &probe;
        let results = join_all(endpoints.iter().map(|ep| async move {
            for attempt in 1..=attempts {
                match probe(ep.url.clone()).await {
                    Ok(()) => return true,
                    Err(e) => {
                        debug!(endpoint = %ep.name, attempt, error = %e, "liveness probe failed");
                        if attempt < attempts {
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
            false
        }))
        .await;

        let live: Vec<EndpointConfig> = endpoints
            .into_iter()
            .zip(results)
            .filter_map(|(ep, ok)| {
                if !ok {
                    warn!(pool = label, endpoint = %ep.name, "dropping unreachable endpoint");
                }
                ok.then_some(ep)
            })
            .collect();
        if live.is_empty() {
            eyre::bail!(
                "no usable endpoints for {label}: all {configured} failed the liveness probe"
            );
        }
        info!(pool = label, live = live.len(), configured, "endpoint pool ready");
        Self::new(label, live, settings)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn quota(&self, ep: &Endpoint) -> u32 {
        self.settings
            .requests_per_endpoint
            .max(1)
            .saturating_mul(ep.weight)
    }

    fn reactivate_expired(&self, st: &mut PoolState, now: Instant) {
        for s in &mut st.endpoints {
            if !s.active && s.disabled_until.is_some_and(|t| now >= t) {
                s.active = true;
                s.consecutive_errors = 0;
                s.disabled_until = None;
                s.requests_since_switch = 0;
                info!(pool = %self.label, endpoint = %s.endpoint.name, "endpoint re-enabled after cooldown");
            }
        }
    }

    /// Next active endpoint after `from` in round-robin order, `from` itself last.
    fn next_active(st: &PoolState, from: usize) -> Option<usize> {
        let n = st.endpoints.len();
        (1..=n)
            .map(|i| (from + i) % n)
            .find(|&i| st.endpoints.get(i).is_some_and(|s| s.active))
    }

    /// Pick an endpoint without waiting. `None` when every endpoint is cooling down.
    pub fn try_select(&self) -> Option<Endpoint> {
        let now = Instant::now();
        let mut st = self.lock();
        self.reactivate_expired(&mut st, now);

        let current_ok = st
            .endpoints
            .get(st.current)
            .is_some_and(|s| s.active && s.requests_since_switch < self.quota(&s.endpoint));
        if !current_ok {
            let next = Self::next_active(&st, st.current)?;
            st.current = next;
            if let Some(s) = st.endpoints.get_mut(next) {
                s.requests_since_switch = 0;
            }
        }

        let current = st.current;
        let s = st.endpoints.get_mut(current)?;
        s.requests_since_switch = s.requests_since_switch.saturating_add(1);
        s.last_used_at = Some(now);
        Some(s.endpoint.clone())
    }

    /// Pick an endpoint, waiting out cooldowns when all are disabled.
    pub async fn select(&self) -> Endpoint {
        loop {
            if let Some(ep) = self.try_select() {
                return ep;
            }
            let wait = self
                .next_reactivation()
                .map_or(self.settings.cooldown, |t| {
                    t.saturating_duration_since(Instant::now())
                })
                .min(self.settings.cooldown)
                .max(Duration::from_millis(1));
            warn!(pool = %self.label, wait_ms = wait.as_millis(), "all endpoints disabled; waiting for cooldown");
            tokio::time::sleep(wait).await;
        }
    }

    fn next_reactivation(&self) -> Option<Instant> {
        self.lock()
            .endpoints
            .iter()
            .filter_map(|s| s.disabled_until)
            .min()
    }

    pub fn is_available(&self) -> bool {
        let mut st = self.lock();
        self.reactivate_expired(&mut st, Instant::now());
        st.endpoints.iter().any(|s| s.active)
    }

    /// Take `endpoint` out of rotation for one cooldown period.
    pub fn disable(&self, endpoint: &Endpoint) {
        let now = Instant::now();
        let mut st = self.lock();
        let Some(s) = st.endpoints.get_mut(endpoint.id) else {
            return;
        };
        if !s.active {
            return;
        }
        s.active = false;
        s.disabled_until = Some(now + self.settings.cooldown);
        warn!(
            pool = %self.label,
            endpoint = %s.endpoint.name,
            errors = s.consecutive_errors,
            cooldown_secs = self.settings.cooldown.as_secs(),
            "endpoint disabled"
        );
        if st.current == endpoint.id {
            if let Some(next) = Self::next_active(&st, endpoint.id) {
                st.current = next;
                if let Some(n) = st.endpoints.get_mut(next) {
                    n.requests_since_switch = 0;
                }
            }
        }
    }

    /// Record a failed call. Rate limits disable at once; other failures count toward the error
    /// threshold. `NotFound` is an answer, not a failure of the endpoint.
    pub fn report_failure(&self, endpoint: &Endpoint, class: ErrorClass) {
        match class {
            ErrorClass::NotFound => {}
            ErrorClass::RateLimited => self.disable(endpoint),
            ErrorClass::Transient | ErrorClass::Unavailable => {
                let trip = {
                    let mut st = self.lock();
                    st.endpoints.get_mut(endpoint.id).is_some_and(|s| {
                        s.consecutive_errors = s.consecutive_errors.saturating_add(1);
                        s.consecutive_errors >= self.settings.error_threshold.max(1)
                    })
                };
                if trip {
                    self.disable(endpoint);
                }
            }
        }
    }

    pub fn report_success(&self, endpoint: &Endpoint) {
        if let Some(s) = self.lock().endpoints.get_mut(endpoint.id) {
            s.consecutive_errors = 0;
        }
    }

    pub fn snapshot(&self) -> Vec<EndpointStatus> {
        let now = Instant::now();
        let mut st = self.lock();
        self.reactivate_expired(&mut st, now);
        let current = st.current;
        st.endpoints
            .iter()
            .map(|s| EndpointStatus {
                name: s.endpoint.name.clone(),
                url: s.endpoint.url.clone(),
                weight: s.endpoint.weight,
                active: s.active,
                current: s.endpoint.id == current,
                consecutive_errors: s.consecutive_errors,
                requests_since_switch: s.requests_since_switch,
                cooldown_remaining_ms: s.disabled_until.map(|t| {
                    u64::try_from(t.saturating_duration_since(now).as_millis()).unwrap_or(u64::MAX)
                }),
                idle_ms: s.last_used_at.map(|t| {
                    u64::try_from(now.saturating_duration_since(t).as_millis()).unwrap_or(u64::MAX)
                }),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().endpoints.is_empty()
    }
}
