use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// SQLite journal modes accepted by `PRAGMA journal_mode`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    Delete,
    Truncate,
    Persist,
    Memory,
    #[default]
    Wal,
    Off,
}

impl JournalMode {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Delete => "DELETE",
            Self::Truncate => "TRUNCATE",
            Self::Persist => "PERSIST",
            Self::Memory => "MEMORY",
            Self::Wal => "WAL",
            Self::Off => "OFF",
        }
    }
}

/// Connection settings for [`crate::SqliteStore::open_with`].
///
/// Missing keys in a YAML document fall back to the defaults used by
/// [`crate::SqliteStore::open`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StoreOptions {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
    pub journal_mode: JournalMode,
    pub foreign_keys: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from(":memory:"),
            busy_timeout_ms: 5000,
            journal_mode: JournalMode::Wal,
            foreign_keys: true,
        }
    }
}

impl StoreOptions {
    #[must_use]
    pub fn at(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            ..Self::default()
        }
    }

    /// # Errors
    /// Returns an error when the document is not valid YAML or has unknown keys.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("failed to parse store options")
    }

    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read store options at {}", path.display()))?;
        Self::from_yaml_str(&raw)
            .with_context(|| format!("invalid store options in {}", path.display()))
    }

    pub(crate) fn pragmas(&self) -> String {
        format!(
            "PRAGMA journal_mode = {};
             PRAGMA foreign_keys = {};
             PRAGMA busy_timeout = {};",
            self.journal_mode.as_sql(),
            if self.foreign_keys { "ON" } else { "OFF" },
            self.busy_timeout_ms
        )
    }
}
