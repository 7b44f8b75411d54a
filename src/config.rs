//! Configuration loading and management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::schedule::{self, RetryConfig};
use crate::workflow::template::{self, WorkflowTemplate, STANDARD_TEMPLATE};
use crate::workflow::{FailurePolicy, FileStore, MemoryStore, WorkflowStore};
use crate::{Error, Result};

/// Directory holding local configuration and state
pub const CONFIG_DIR: &str = ".conductor";

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Workflow template file; the built-in standard delivery template otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// Orchestrator behaviour
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Retry policy for failed automated gate checks
    #[serde(default)]
    pub retry: RetryConfig,

    /// Where workflow records and vote logs live
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            template: None,
            orchestrator: OrchestratorConfig::default(),
            retry: RetryConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file or default locations
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(|| {
            // Try .conductor/config.toml in current directory
            let local = PathBuf::from(CONFIG_DIR).join("config.toml");
            if local.exists() {
                return Some(local);
            }

            // Try ~/.conductor/config.toml
            dirs::home_dir().map(|h| h.join(CONFIG_DIR).join("config.toml"))
        });

        let config = match config_path {
            Some(p) if p.exists() => Self::parse(&std::fs::read_to_string(&p)?)?,
            Some(p) if path.is_some() => {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )))
            }
            _ => Config::default(),
        };
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        schedule::parse_timezone(&self.orchestrator.default_timezone)?;
        self.retry.validate()?;
        Ok(())
    }

    /// The configured template, or the built-in one
    pub fn load_template(&self) -> Result<WorkflowTemplate> {
        match &self.template {
            Some(path) => WorkflowTemplate::load(&expand_path(path)),
            None => template::default_template(),
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy {
            fail_on_rejected_review: self.orchestrator.fail_on_rejected_review,
        }
    }

    /// Build the configured store
    pub fn open_store(&self) -> Arc<dyn WorkflowStore> {
        match self.store.kind {
            StoreKind::Memory => Arc::new(MemoryStore::new()),
            StoreKind::File => Arc::new(FileStore::new(self.store.path())),
        }
    }
}

/// Orchestrator behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// IANA timezone for task schedules that do not name one
    #[serde(default = "default_timezone")]
    pub default_timezone: String,

    /// Re-attempt `advance` when an event may have completed a phase
    #[serde(default = "default_true")]
    pub auto_advance: bool,

    /// Treat a rejected manual or agent review as irrecoverable
    #[serde(default)]
    pub fail_on_rejected_review: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_timezone: default_timezone(),
            auto_advance: true,
            fail_on_rejected_review: false,
        }
    }
}

/// Storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Lost on exit
    Memory,
    /// YAML records and JSON-lines vote logs on disk
    #[default]
    File,
}

/// Store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    /// Directory for the file store; `~` is expanded
    #[serde(default = "default_store_dir")]
    pub directory: String,
}

fn default_store_dir() -> String {
    format!("{}/state", CONFIG_DIR)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            directory: default_store_dir(),
        }
    }
}

impl StoreConfig {
    pub fn path(&self) -> PathBuf {
        expand_path(&self.directory)
    }
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

/// Initialize the .conductor directory under `base`.
///
/// Writes a default config pointing at an editable copy of the standard
/// template. Existing files are left alone. Returns the files created.
pub fn init(base: &Path) -> Result<Vec<PathBuf>> {
    let conductor_dir = base.join(CONFIG_DIR);
    let templates_dir = conductor_dir.join("templates");
    let mut created = Vec::new();

    if !templates_dir.exists() {
        std::fs::create_dir_all(&templates_dir)?;
    }

    let template_path = templates_dir.join("standard-delivery.toml");
    if !template_path.exists() {
        std::fs::write(&template_path, STANDARD_TEMPLATE)?;
        created.push(template_path);
    }

    // Create default config if it doesn't exist
    let config_path = conductor_dir.join("config.toml");
    if !config_path.exists() {
        let config = Config {
            template: Some(format!("{}/templates/standard-delivery.toml", CONFIG_DIR)),
            ..Config::default()
        };
        let config_str =
            toml::to_string_pretty(&config).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(&config_path, config_str)?;
        created.push(config_path);
    }

    let state_dir = conductor_dir.join("state");
    if !state_dir.exists() {
        std::fs::create_dir_all(&state_dir)?;
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.orchestrator.default_timezone, "UTC");
        assert!(config.orchestrator.auto_advance);
        assert!(!config.failure_policy().fail_on_rejected_review);
        assert_eq!(config.store.kind, StoreKind::File);
        assert_eq!(config.store.path(), PathBuf::from(".conductor/state"));
        assert_eq!(config.load_template().unwrap().name, "standard-delivery");
    }

    #[test]
    fn test_parse_partial_config() {
        let config = Config::parse(
            r#"
[orchestrator]
default_timezone = "America/New_York"
fail_on_rejected_review = true

[retry]
max_attempts = 5
initial_delay_seconds = 30
max_delay_seconds = 600
backoff_multiplier = 1.5

[store]
kind = "memory"
"#,
        )
        .unwrap();

        assert_eq!(config.orchestrator.default_timezone, "America/New_York");
        assert!(config.orchestrator.auto_advance);
        assert!(config.failure_policy().fail_on_rejected_review);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.store.kind, StoreKind::Memory);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(Config::parse("[orchestrator]\ndefault_timezone = \"Mars/Olympus\"\n").is_err());
        assert!(Config::parse(
            "[retry]\nmax_attempts = 0\ninitial_delay_seconds = 1\nmax_delay_seconds = 2\nbackoff_multiplier = 2.0\n"
        )
        .is_err());
    }

    #[test]
    fn test_tilde_expansion() {
        let store = StoreConfig {
            kind: StoreKind::File,
            directory: "~/conductor-state".to_string(),
        };
        if let Some(home) = dirs::home_dir() {
            assert_eq!(store.path(), home.join("conductor-state"));
        }
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            Config::load(Some(&missing)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_init_writes_config_and_template() {
        let dir = TempDir::new().unwrap();
        let created = init(dir.path()).unwrap();
        assert_eq!(created.len(), 2);

        let config_path = dir.path().join(".conductor/config.toml");
        let config = Config::load(Some(&config_path)).unwrap();
        assert_eq!(
            config.template.as_deref(),
            Some(".conductor/templates/standard-delivery.toml")
        );
        let template =
            WorkflowTemplate::load(&dir.path().join(".conductor/templates/standard-delivery.toml"))
                .unwrap();
        assert_eq!(template.phases.len(), 9);

        // Second run leaves everything in place
        assert!(init(dir.path()).unwrap().is_empty());
    }
}
