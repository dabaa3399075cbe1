//! Store configuration from the environment.
//!
//! The store root defaults to `$XDG_CACHE_HOME/dune/db` and can be replaced
//! wholesale with `DUNE_CACHE_ROOT` (absolute paths only). The storage mode
//! selects whether build trees share inodes with the store (`hardlink`) or
//! carry copies (`copy`).

use std::env;
use std::path::PathBuf;

use crate::error::CacheError;

/// How promoted and restored files relate to store entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
    /// Build trees hard-link store entries; link count gates liveness.
    #[default]
    Hardlink,
    /// Build trees carry copies; each restore bumps the entry's ctime so
    /// "unused" approximates "old".
    Copy,
}

impl StorageMode {
    pub fn parse(s: &str) -> Result<StorageMode, CacheError> {
        match s {
            "hardlink" => Ok(StorageMode::Hardlink),
            "copy" => Ok(StorageMode::Copy),
            other => Err(CacheError::User(format!(
                "invalid DUNE_CACHE_STORAGE_MODE {:?}; expected \"hardlink\" or \"copy\"",
                other
            ))),
        }
    }
}

/// Resolved store configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub root: PathBuf,
    pub storage_mode: StorageMode,
}

impl CacheConfig {
    /// Resolve from `DUNE_CACHE_ROOT`, `XDG_CACHE_HOME`, `HOME`, and
    /// `DUNE_CACHE_STORAGE_MODE`.
    pub fn from_env() -> Result<CacheConfig, CacheError> {
        let root = resolve_root(
            env::var("DUNE_CACHE_ROOT").ok().as_deref(),
            env::var("XDG_CACHE_HOME").ok().as_deref(),
            env::var("HOME").ok().as_deref(),
        )?;
        let storage_mode = match env::var("DUNE_CACHE_STORAGE_MODE") {
            Ok(mode) => StorageMode::parse(&mode)?,
            Err(_) => StorageMode::default(),
        };
        Ok(CacheConfig { root, storage_mode })
    }

    /// A config rooted at an explicit directory, hardlink mode.
    pub fn with_root(root: PathBuf) -> CacheConfig {
        CacheConfig {
            root,
            storage_mode: StorageMode::default(),
        }
    }

    pub fn with_storage_mode(mut self, mode: StorageMode) -> CacheConfig {
        self.storage_mode = mode;
        self
    }
}

fn resolve_root(
    cache_root: Option<&str>,
    xdg_cache_home: Option<&str>,
    home: Option<&str>,
) -> Result<PathBuf, CacheError> {
    if let Some(root) = cache_root {
        let root = PathBuf::from(root);
        if !root.is_absolute() {
            return Err(CacheError::User(format!(
                "DUNE_CACHE_ROOT must be an absolute path, got {:?}",
                root
            )));
        }
        return Ok(root);
    }
    let cache_home = match xdg_cache_home {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => match home {
            Some(home) if !home.is_empty() => PathBuf::from(home).join(".cache"),
            _ => {
                return Err(CacheError::User(
                    "cannot locate the cache directory: neither XDG_CACHE_HOME nor HOME is set"
                        .to_string(),
                ))
            }
        },
    };
    Ok(cache_home.join("dune").join("db"))
}
