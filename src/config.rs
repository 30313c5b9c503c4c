//! Engine configuration types and loading
//!
//! This is the engine's own config, not the process definition: where the
//! workspace lives, whether code tools may run, which model to fall back
//! to, and the defaults merged under every agent's config.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Project directory tools and validation run against
    pub workspace: PathBuf,

    /// Gate for all step-input enrichment tools
    #[serde(rename = "code-tools")]
    pub code_tools: bool,

    /// Whether `ask_user` may prompt a human
    pub interactive: bool,

    /// Default tracing filter when RUST_LOG is unset
    #[serde(rename = "log-level")]
    pub log_level: String,

    /// Agent log file tailed into step results
    #[serde(rename = "agent-log")]
    pub agent_log: Option<PathBuf>,

    /// Config entries merged under every agent's own config
    #[serde(rename = "agent-defaults")]
    pub agent_defaults: HashMap<String, String>,

    /// Model used when neither the agent nor the process names one
    #[serde(rename = "default-model")]
    pub default_model: String,

    /// External command that runs agent tasks: receives the prompt on
    /// stdin, prints the agent output on stdout
    #[serde(rename = "agent-command")]
    pub agent_command: Option<String>,

    /// Silence progress output (same effect as SUPPRESS_PROGRESS=1)
    #[serde(rename = "suppress-progress")]
    pub suppress_progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            code_tools: true,
            interactive: false,
            log_level: "info".to_string(),
            agent_log: None,
            agent_defaults: HashMap::new(),
            default_model: "claude-sonnet-4".to_string(),
            agent_command: None,
            suppress_progress: false,
        }
    }
}

impl Config {
    /// Load configuration with the fallback chain: explicit path,
    /// `.conductor.yml` in the working directory, the user config dir,
    /// then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".conductor.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("conductor").join("conductor.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}
