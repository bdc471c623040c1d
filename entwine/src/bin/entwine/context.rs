use anyhow::{Context, Result};
use entwine::{Grant, PolicyAuthorizer, Schema};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "entwine.toml";
const HIDDEN_CONFIG_FILE: &str = ".entwine/config.toml";

/// Project context for entwine operations
pub struct ProjectContext {
    /// Directory holding the config file
    pub project_root: PathBuf,
    /// Path to config file
    pub config_path: PathBuf,
    /// Loaded configuration
    pub config: EntwineConfig,
}

/// Configuration stored in entwine.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntwineConfig {
    #[serde(default)]
    pub entwine: EntwineSettings,
    #[serde(default)]
    pub redis: RedisSettings,
    #[serde(default)]
    pub grants: Vec<Grant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntwineSettings {
    /// Schema file, relative to the project root
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Key prefix for every Redis key
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for EntwineSettings {
    fn default() -> Self {
        Self {
            schema: default_schema(),
            prefix: default_prefix(),
        }
    }
}

fn default_schema() -> String {
    "schema.toml".to_string()
}

fn default_prefix() -> String {
    "entwine".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "${REDIS_URL}".to_string()
}

impl ProjectContext {
    /// Find and load project context from current directory or ancestors
    pub fn find() -> Result<Self> {
        let current_dir = std::env::current_dir().context("Failed to get current directory")?;
        Self::find_from(&current_dir)
    }

    /// Find project context starting from the given directory
    pub fn find_from(start: &Path) -> Result<Self> {
        let (project_root, config_path) = Self::find_config(start)?;
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config: EntwineConfig =
            toml::from_str(&content).with_context(|| format!("Failed to parse {}", config_path.display()))?;

        Ok(Self {
            project_root,
            config_path,
            config,
        })
    }

    /// Walk upward until a directory holds `entwine.toml` or `.entwine/config.toml`
    fn find_config(start: &Path) -> Result<(PathBuf, PathBuf)> {
        let mut current = start.to_path_buf();

        loop {
            for candidate in [CONFIG_FILE, HIDDEN_CONFIG_FILE] {
                let path = current.join(candidate);
                if path.exists() {
                    return Ok((current, path));
                }
            }

            if !current.pop() {
                anyhow::bail!(
                    "Could not find {CONFIG_FILE} in {start:?} or any parent directory. \
                     Is this an entwine project?"
                );
            }
        }
    }

    pub fn schema_path(&self) -> PathBuf {
        self.project_root.join(&self.config.entwine.schema)
    }

    pub fn load_schema(&self) -> Result<Schema> {
        let path = self.schema_path();
        Schema::from_toml_file(&path).with_context(|| format!("Failed to load schema from {}", path.display()))
    }

    pub fn prefix(&self) -> &str {
        &self.config.entwine.prefix
    }

    /// `None` when no grants are configured, meaning every actor may write.
    pub fn authorizer(&self) -> Option<PolicyAuthorizer> {
        if self.config.grants.is_empty() {
            None
        } else {
            Some(PolicyAuthorizer::new(self.config.grants.clone()))
        }
    }

    /// Get the Redis URL, expanding environment variables
    pub fn redis_url(&self) -> Result<String> {
        expand_env(&self.config.redis.url)
    }
}

fn expand_env(value: &str) -> Result<String> {
    match value.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
        Some(var_name) => {
            std::env::var(var_name).with_context(|| format!("Environment variable {var_name} not set"))
        }
        None => Ok(value.to_string()),
    }
}
