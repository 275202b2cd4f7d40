//! Database location resolution.
//!
//! The task store lives at `{config_dir}/tasks.db`. The config directory
//! itself is resolved by the caller (CLI flag > `BOSUN_DIR` env > default)
//! and passed in here.

use std::path::{Path, PathBuf};

/// Resolved database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
}

impl DbConfig {
    /// Database file name inside the config directory.
    pub const DB_FILE_NAME: &'static str = "tasks.db";

    /// Build a config pointing at `{config_dir}/tasks.db`.
    pub fn in_config_dir(config_dir: impl AsRef<Path>) -> Self {
        Self {
            db_path: config_dir.as_ref().join(Self::DB_FILE_NAME),
        }
    }

    /// Build a config with an explicit database file path.
    pub fn at_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_path_is_under_config_dir() {
        let cfg = DbConfig::in_config_dir("/tmp/bosun");
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/bosun/tasks.db"));
    }
}
