use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
pub const ENV_DATA_DIR: &str = "SNAPSCAN_DATA_DIR";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub detector: DetectorConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub uploads_dir: PathBuf,
    pub detected_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// Base used when building the `url` of an upload response, e.g.
    /// `https://detect.example.com`. Derived from the request when unset.
    pub public_url: Option<String>,
    /// Allowed CORS origins. Empty means permissive.
    pub cors_origins: Vec<String>,
}

/// How the external detection worker is launched.
///
/// The worker is invoked as `program [args...] <input> <output>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DetectorConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UploadConfig {
    pub max_bytes: usize,
    pub cleanup_on_failure: bool,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            uploads_dir: PathBuf::from("uploads"),
            detected_dir: PathBuf::from("detected"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
            public_url: None,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            args: vec!["detector/main.py".to_string()],
            working_dir: None,
            timeout_secs: None,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            cleanup_on_failure: false,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.detector.program.as_os_str().is_empty() {
            bail!("detector.program must not be empty");
        }
        if self.detector.timeout_secs == Some(0) {
            bail!("detector.timeout_secs must be greater than zero when set");
        }
        if self.upload.max_bytes == 0 {
            bail!("upload.max_bytes must be greater than zero");
        }
        if self.paths.uploads_dir == self.paths.detected_dir {
            bail!(
                "paths.uploads_dir and paths.detected_dir must differ (both are '{}')",
                self.paths.uploads_dir.display()
            );
        }
        if let Some(public_url) = self.server.public_url.as_deref() {
            let lower = public_url.to_ascii_lowercase();
            if !lower.starts_with("http://") && !lower.starts_with("https://") {
                bail!("server.public_url must start with http:// or https:// (got '{public_url}')");
            }
        }
        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. SNAPSCAN_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml on first run.
/// An existing config file is never touched.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
