use crate::{
    config::{EndpointConfig, VaultscopeConfig},
    errors::{ErrorClass, UpstreamError},
    pool::{EndpointPool, PoolSettings},
    rate_limit::RateLimiter,
};
use eyre::Context as _;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

fn allow_insecure_http() -> bool {
    std::env::var("VAULTSCOPE_ALLOW_INSECURE_HTTP")
        .ok()
        .is_some_and(|v| {
            matches!(
                v.as_str(),
                "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON"
            )
        })
}

pub fn is_loopback_http(url: &str) -> bool {
    fn host_prefix_ok(s: &str, prefix: &str) -> bool {
        if !s.starts_with(prefix) {
            return false;
        }
        matches!(s.as_bytes().get(prefix.len()), None | Some(b':' | b'/'))
    }
    let u = url.trim();
    host_prefix_ok(u, "http://127.0.0.1")
        || host_prefix_ok(u, "http://localhost")
        || host_prefix_ok(u, "http://[::1]")
}

/// A JSON price API reached through its own endpoint pool and rate limiter.
///
/// Selection never waits: when every base URL is cooling down the call fails fast with
/// `Unavailable`, so the aggregator's time budget is the only bound on a price lookup.
#[derive(Debug)]
pub struct HttpApi {
    name: &'static str,
    client: Client,
    pool: EndpointPool,
    limiter: RateLimiter,
}

impl HttpApi {
    pub fn new(name: &'static str, base_urls: &[String], cfg: &VaultscopeConfig) -> eyre::Result<Self> {
        let mut endpoints = Vec::with_capacity(base_urls.len());
        for (i, raw) in base_urls.iter().enumerate() {
            let base = raw.trim().trim_end_matches('/');
            if !base.starts_with("https://") && !is_loopback_http(base) && !allow_insecure_http() {
                eyre::bail!(
                    "{name} base url must use https (or loopback); set VAULTSCOPE_ALLOW_INSECURE_HTTP=1 to override"
                );
            }
            endpoints.push(EndpointConfig::new(&format!("{name}-{i}"), base));
        }

        let settings = PoolSettings {
            requests_per_endpoint: cfg.rpc.requests_per_endpoint,
            error_threshold: cfg.rpc.error_threshold,
            cooldown: Duration::from_secs(cfg.rpc.cooldown_seconds),
            probe_attempts: 0,
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.http.request_timeout_seconds))
            .connect_timeout(Duration::from_secs(cfg.rpc.connect_timeout_seconds))
            .build()
            .context("build http client")?;

        Ok(Self {
            name,
            client,
            pool: EndpointPool::new(name, endpoints, settings)?,
            limiter: RateLimiter::per_second(cfg.rate_limit.price_api_calls_per_second),
        })
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub fn pool(&self) -> &EndpointPool {
        &self.pool
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        bearer: Option<&str>,
    ) -> Result<T, UpstreamError> {
        self.send(path, |client, url| {
            let req = client
                .get(url)
                .query(query)
                .header("accept", "application/json");
            match bearer {
                Some(key) => req.bearer_auth(key),
                None => req,
            }
        })
        .await
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, UpstreamError> {
        self.send(path, |client, url| client.post(url).json(body)).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        path: &str,
        build: impl Fn(&Client, String) -> RequestBuilder,
    ) -> Result<T, UpstreamError> {
        self.limiter.acquire().await;
        let ep = self.pool.try_select().ok_or_else(|| {
            UpstreamError::unavailable(
                ErrorClass::RateLimited,
                format!("{}: every endpoint is cooling down", self.name),
            )
        })?;
        let url = format!("{}{path}", ep.url);
        let res = self.exchange(build(&self.client, url)).await;

        match &res {
            Ok(_) => self.pool.report_success(&ep),
            Err(e) => {
                debug!(api = self.name, endpoint = %ep.name, error = %e, "price api call failed");
                self.pool.report_failure(&ep, e.class());
            }
        }
        res
    }

    async fn exchange<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, UpstreamError> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(UpstreamError::from_status(status, self.name));
        }
        let body = resp.bytes().await?;
        serde_json::from_slice::<T>(&body).map_err(|e| {
            UpstreamError::NotFound(format!("{}: unexpected response body: {e}", self.name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Pong {
        ok: bool,
    }

    fn api(base: &str) -> eyre::Result<HttpApi> {
        HttpApi::new("test", &[base.to_owned()], &VaultscopeConfig::default())
    }

    #[test]
    fn plain_http_is_refused_for_remote_hosts() {
        assert!(api("http://prices.example").is_err());
        assert!(api("https://prices.example").is_ok());
        assert!(api("http://127.0.0.1:9000").is_ok());
    }

    #[tokio::test]
    async fn decodes_json_and_classifies_throttling() -> eyre::Result<()> {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("GET", "/ping")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;
        let api = api(&server.url())?;
        let pong: Pong = api.get_json("/ping", &[], None).await?;
        assert!(pong.ok);
        ok.assert_async().await;

        let _limited = server
            .mock("GET", "/busy")
            .with_status(429)
            .create_async()
            .await;
        let err = api
            .get_json::<Pong>("/busy", &[], None)
            .await
            .err()
            .ok_or_else(|| eyre::eyre!("expected 429 to fail"))?;
        assert_eq!(err.class(), ErrorClass::RateLimited);

        let next = api
            .get_json::<Pong>("/ping", &[], None)
            .await
            .err()
            .ok_or_else(|| eyre::eyre!("expected pool to be cooling down"))?;
        assert_eq!(
            next.class(),
            ErrorClass::Unavailable,
            "single endpoint disabled after a 429"
        );
        Ok(())
    }
}
