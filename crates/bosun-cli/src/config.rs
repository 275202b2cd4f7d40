//! Configuration file management for bosun.
//!
//! The config directory holds everything bosun owns on disk: the config
//! file, the task database, and the singleton lock. Resolution chain for
//! the directory: CLI flag > `BOSUN_DIR` env (legacy alias
//! `OPENFLEET_DIR`) > `~/.config/bosun`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use bosun_core::branch::{
    CleanupOptions, DEFAULT_CLEANUP_PREFIXES, DEFAULT_PROTECTED_BRANCHES,
};
use bosun_core::executor::ProfileConfig;
use bosun_core::kanban::SyncPolicy;
use bosun_core::kanban::shared_state::SharedStateMode;
use bosun_core::maintenance::SweepConfig;
use bosun_core::router::{DistributionMode, FailoverStrategy, RouterPolicy};

/// Environment variable naming the config directory.
pub const DIR_ENV: &str = "BOSUN_DIR";

/// Legacy brand alias for [`DIR_ENV`]. Read, never written; data is
/// never migrated between the two names.
pub const DIR_ENV_ALIAS: &str = "OPENFLEET_DIR";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub repo: RepoSection,
    #[serde(default)]
    pub executors: Vec<ProfileConfig>,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub kanban: Option<KanbanSection>,
    #[serde(default)]
    pub maintenance: MaintenanceSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RepoSection {
    /// Root of the supervised repository; defaults to the current
    /// directory.
    pub root: Option<PathBuf>,
    /// Base branch task attempts fork from.
    pub base_branch: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RouterSection {
    #[serde(default)]
    pub distribution: DistributionMode,
    #[serde(default)]
    pub failover: FailoverStrategy,
    pub max_retries: Option<u32>,
    pub cooldown_minutes: Option<u64>,
    pub disable_on_consecutive_failures: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KanbanSection {
    /// Exactly one backend per deployment: github | jira | vk.
    pub backend: String,
    #[serde(default)]
    pub policy: SyncPolicy,
    #[serde(default)]
    pub github: Option<GithubSection>,
    #[serde(default)]
    pub jira: Option<JiraSection>,
    #[serde(default)]
    pub vk: Option<VkSection>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GithubSection {
    pub repo: String,
    pub project_owner: Option<String>,
    pub project_number: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JiraSection {
    pub base_url: String,
    pub email: String,
    pub api_token: String,
    pub project_key: String,
    #[serde(default = "default_issue_type")]
    pub issue_type: String,
    pub parent_key: Option<String>,
    #[serde(default)]
    pub shared_state_mode: SharedStateMode,
}

fn default_issue_type() -> String {
    "Task".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VkSection {
    pub base_url: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MaintenanceSection {
    pub sync_branches: Option<Vec<String>>,
    pub push_max_age_minutes: Option<u64>,
    pub archive_age_days: Option<u64>,
    pub cleanup_prefixes: Option<Vec<String>>,
    pub protected_branches: Option<Vec<String>>,
    pub min_age_hours: Option<u64>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Resolve the config directory: CLI flag > `BOSUN_DIR` >
/// `OPENFLEET_DIR` > `~/.config/bosun`.
pub fn config_dir(cli_dir: Option<&PathBuf>) -> PathBuf {
    if let Some(dir) = cli_dir {
        return dir.clone();
    }
    for var in [DIR_ENV, DIR_ENV_ALIAS] {
        if let Ok(dir) = std::env::var(var) {
            if !dir.trim().is_empty() {
                return PathBuf::from(dir);
            }
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("bosun")
}

/// Path to the config file inside a config directory.
pub fn config_path(config_dir: &std::path::Path) -> PathBuf {
    config_dir.join("config.toml")
}

// -----------------------------------------------------------------------
// Read
// -----------------------------------------------------------------------

/// Load the config file; a missing file yields defaults.
pub fn load_config(config_dir: &std::path::Path) -> Result<ConfigFile> {
    let path = config_path(config_dir);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigFile::default()),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read config file at {}", path.display()));
        }
    };
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

// -----------------------------------------------------------------------
// Derived runtime settings
// -----------------------------------------------------------------------

impl ConfigFile {
    pub fn repo_root(&self) -> PathBuf {
        self.repo
            .root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn base_branch(&self) -> String {
        self.repo
            .base_branch
            .clone()
            .unwrap_or_else(|| "main".to_string())
    }

    pub fn router_policy(&self) -> RouterPolicy {
        let defaults = RouterPolicy::default();
        RouterPolicy {
            max_retries: self.router.max_retries.unwrap_or(defaults.max_retries),
            cooldown_minutes: self
                .router
                .cooldown_minutes
                .unwrap_or(defaults.cooldown_minutes),
            disable_on_consecutive_failures: self
                .router
                .disable_on_consecutive_failures
                .unwrap_or(defaults.disable_on_consecutive_failures),
        }
    }

    pub fn cleanup_options(&self, dry_run: bool) -> CleanupOptions {
        let defaults = CleanupOptions::default();
        CleanupOptions {
            prefixes: self
                .maintenance
                .cleanup_prefixes
                .clone()
                .unwrap_or_else(|| {
                    DEFAULT_CLEANUP_PREFIXES.iter().map(|s| s.to_string()).collect()
                }),
            protected_branches: self
                .maintenance
                .protected_branches
                .clone()
                .unwrap_or_else(|| {
                    DEFAULT_PROTECTED_BRANCHES.iter().map(|s| s.to_string()).collect()
                }),
            min_age: self
                .maintenance
                .min_age_hours
                .map(|h| Duration::from_secs(h * 3600))
                .unwrap_or(defaults.min_age),
            dry_run,
        }
    }

    pub fn sweep_config(&self) -> SweepConfig {
        let defaults = SweepConfig::default();
        SweepConfig {
            push_max_age: self
                .maintenance
                .push_max_age_minutes
                .map(|m| Duration::from_secs(m * 60))
                .unwrap_or(defaults.push_max_age),
            sync_branches: self
                .maintenance
                .sync_branches
                .clone()
                .unwrap_or(defaults.sync_branches),
            cleanup: self.cleanup_options(false),
            archive_age: self
                .maintenance
                .archive_age_days
                .map(|d| Duration::from_secs(d * 24 * 3600))
                .unwrap_or(defaults.archive_age),
            child_pid: None,
        }
    }
}
