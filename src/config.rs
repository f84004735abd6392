//! Language server launch configuration.
//!
//! Resolution order for [`ServerConfig::load`]:
//! 1. `$LSP_PROBE_CONFIG` (JSON file)
//! 2. `<config_dir>/lsp-probe/server.json` if it exists
//! 3. `LSP_PROBE_*` environment variables

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Environment variable pointing at a JSON config file.
pub const CONFIG_ENV: &str = "LSP_PROBE_CONFIG";
/// Server command (required when configuring from the environment).
pub const SERVER_ENV: &str = "LSP_PROBE_SERVER";
/// Whitespace-separated server arguments.
pub const ARGS_ENV: &str = "LSP_PROBE_ARGS";
/// Working directory for the server process.
pub const CWD_ENV: &str = "LSP_PROBE_CWD";
/// Project root passed in `initialize`.
pub const ROOT_ENV: &str = "LSP_PROBE_ROOT";
/// Prefix of variables forwarded to the server: `LSP_PROBE_ENV_FOO=1` sets `FOO=1`.
pub const ENV_PREFIX: &str = "LSP_PROBE_ENV_";

/// How to launch the language server and what project to point it at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Program to run.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Overrides applied on top of the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub root_path: Option<PathBuf>,
}

impl ServerConfig {
    /// Run a server from its source checkout with `cargo run -q`.
    pub fn cargo_run(server_dir: impl Into<PathBuf>) -> Self {
        let mut env = BTreeMap::new();
        env.insert("RUST_BACKTRACE".to_string(), "1".to_string());
        Self {
            command: "cargo".to_string(),
            args: vec!["run".to_string(), "-q".to_string()],
            working_dir: Some(server_dir.into()),
            env,
            root_path: None,
        }
    }

    /// Read a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: ServerConfig = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config from `LSP_PROBE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let mut config = ServerConfig::default();
        let mut command = None;

        for (key, value) in vars {
            if let Some(name) = key.strip_prefix(ENV_PREFIX) {
                if !name.is_empty() {
                    config.env.insert(name.to_string(), value);
                }
                continue;
            }
            match key.as_str() {
                SERVER_ENV => command = Some(value),
                ARGS_ENV => config.args = value.split_whitespace().map(String::from).collect(),
                CWD_ENV => config.working_dir = Some(PathBuf::from(value)),
                ROOT_ENV => config.root_path = Some(PathBuf::from(value)),
                _ => {}
            }
        }

        config.command = command.ok_or_else(|| {
            anyhow!(
                "No language server configured: set {} or {}",
                SERVER_ENV,
                CONFIG_ENV
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve configuration from file or environment.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            debug!("Loading config from ${}: {}", CONFIG_ENV, path);
            return Self::from_file(Path::new(&path));
        }

        if let Some(path) = default_config_path().filter(|p| p.exists()) {
            debug!("Loading config from {}", path.display());
            return Self::from_file(&path);
        }

        Self::from_env()
    }

    fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(anyhow!("Language server command must not be empty"));
        }
        Ok(())
    }
}

/// Default config file location.
///
/// `~/.config/lsp-probe/server.json` on Linux,
/// `~/Library/Application Support/lsp-probe/server.json` on macOS.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("lsp-probe").join("server.json"))
}
