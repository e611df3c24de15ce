use directories::ProjectDirs;
use eyre::ContextCompat as _;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct VaultscopePaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub log_file: PathBuf,
}

impl VaultscopePaths {
    pub fn discover() -> eyre::Result<Self> {
        // Test/CI override knobs.
        if let (Ok(data_dir), Ok(config_dir)) = (
            std::env::var("VAULTSCOPE_DATA_DIR"),
            std::env::var("VAULTSCOPE_CONFIG_DIR"),
        ) {
            return Ok(Self::from_dirs(
                PathBuf::from(config_dir),
                PathBuf::from(data_dir),
            ));
        }

        // Linux: ~/.config/vaultscope and ~/.local/share/vaultscope
        let proj =
            ProjectDirs::from("", "", "vaultscope").context("failed to resolve project dirs")?;
        Ok(Self::from_dirs(
            proj.config_dir().to_path_buf(),
            proj.data_dir().to_path_buf(),
        ))
    }

    pub fn from_dirs(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        let cache_dir = data_dir.join("cache");
        let log_file = data_dir.join("vaultscope.log.jsonl");
        Self {
            config_dir,
            data_dir,
            cache_dir,
            log_file,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Cache directory, honoring an explicit override from the config file.
    pub fn cache_dir_or(&self, override_dir: Option<&Path>) -> PathBuf {
        override_dir.map_or_else(|| self.cache_dir.clone(), Path::to_path_buf)
    }

    pub fn ensure_dirs(&self) -> eyre::Result<()> {
        crate::fsutil::ensure_dir(&self.config_dir)?;
        crate::fsutil::ensure_dir(&self.data_dir)?;
        Ok(())
    }
}
