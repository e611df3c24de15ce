use crate::{
    config::{EndpointConfig, VaultscopeConfig},
    paths::VaultscopePaths,
};
use eyre::Context as _;
use std::{fs, path::PathBuf};

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

/// Parse `VAULTSCOPE_RPC_URLS`: comma separated, each entry either `url` or `name=url`.
fn parse_endpoint_list(s: &str) -> Vec<EndpointConfig> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .enumerate()
        .map(|(i, t)| match t.split_once('=') {
            Some((name, url)) if url.contains("://") && !name.contains("://") => {
                EndpointConfig::new(name.trim(), url.trim())
            }
            _ => EndpointConfig::new(&format!("env-{i}"), t),
        })
        .collect()
}

/// Apply environment variable overrides to the config.
fn apply_env_overrides(cfg: &mut VaultscopeConfig) {
    /// Helper: if an env var is set and non-empty, apply `setter` with the trimmed value.
    fn apply_env(var: &str, setter: impl FnOnce(&str)) {
        if let Ok(u) = std::env::var(var) {
            let t = u.trim();
            if !t.is_empty() {
                setter(t);
            }
        }
    }

    apply_env("VAULTSCOPE_RPC_URLS", |v| {
        let eps = parse_endpoint_list(v);
        if !eps.is_empty() {
            cfg.rpc.endpoints = eps;
        }
    });
    apply_env("VAULTSCOPE_ONEINCH_API_KEY", |v| {
        cfg.http.oneinch_api_key = Some(v.to_owned());
    });
    apply_env("VAULTSCOPE_CACHE_DIR", |v| {
        cfg.cache.dir = Some(PathBuf::from(v));
    });
    apply_env("VAULTSCOPE_CALLS_PER_SECOND", |v| {
        if let Ok(n) = v.parse::<u32>() {
            if n > 0 {
                cfg.rate_limit.calls_per_second = n;
            }
        }
    });
    apply_env("VAULTSCOPE_PRICE_TIMEOUT_SECONDS", |v| {
        if let Ok(n) = v.parse::<u64>() {
            cfg.retry.price_timeout_seconds = n;
        }
    });
}

impl ConfigStore {
    pub fn new(paths: &VaultscopePaths) -> Self {
        Self {
            path: paths.config_file(),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Load `config.toml`, writing the defaults on first run. Environment overrides apply to the
    /// returned value only and are never persisted.
    pub fn load_or_init_default(&self) -> eyre::Result<VaultscopeConfig> {
        if !self.path.exists() {
            let mut cfg = VaultscopeConfig::default();
            self.save(&cfg)?;
            apply_env_overrides(&mut cfg);
            return Ok(cfg);
        }

        let s = fs::read_to_string(&self.path).context("read config.toml")?;
        let mut cfg: VaultscopeConfig = toml::from_str(&s).context("parse config.toml")?;
        apply_env_overrides(&mut cfg);
        Ok(cfg)
    }

    pub fn save(&self, cfg: &VaultscopeConfig) -> eyre::Result<()> {
        if let Some(parent) = self.path.parent() {
            crate::fsutil::ensure_dir(parent)?;
        }
        let s = toml::to_string_pretty(cfg).context("serialize config.toml")?;
        crate::fsutil::write_string_atomic(&self.path, &s).context("write config.toml")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_list_accepts_named_and_bare_urls() {
        let eps = parse_endpoint_list("main=https://a.example, https://b.example/?k=v ,");
        assert_eq!(eps.len(), 2);
        assert_eq!(eps.first().map(|e| e.name.as_str()), Some("main"));
        assert_eq!(
            eps.first().map(|e| e.url.as_str()),
            Some("https://a.example")
        );
        assert_eq!(
            eps.get(1).map(|e| e.url.as_str()),
            Some("https://b.example/?k=v")
        );
    }

    #[test]
    fn first_run_writes_defaults_and_reload_parses() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        let paths = VaultscopePaths::from_dirs(td.path().join("cfg"), td.path().join("data"));
        let store = ConfigStore::new(&paths);

        let first = store.load_or_init_default()?;
        assert!(store.path().exists());

        let second = store.load_or_init_default()?;
        assert_eq!(
            first.retry.max_delay_ms, second.retry.max_delay_ms,
            "reloaded config matches the written defaults"
        );
        Ok(())
    }

    #[test]
    fn broken_config_is_a_fatal_error() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        let paths = VaultscopePaths::from_dirs(td.path().join("cfg"), td.path().join("data"));
        fs::create_dir_all(&paths.config_dir).context("mkdir")?;
        fs::write(paths.config_file(), "rpc = [").context("write broken config")?;
        assert!(ConfigStore::new(&paths).load_or_init_default().is_err());
        Ok(())
    }
}
