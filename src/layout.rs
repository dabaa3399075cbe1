//! On-disk layout of the store.
//!
//! ```text
//! <root>/
//!   temp/                         staging for atomic renames
//!   files/v<Vf>/<aa>/<hex>        file entries; <aa> = hex[0..2]
//!   meta/v<Vm>/<aa>/<hex>         metadata entries
//!   values/v<Vv>/<aa>/<hex>       reserved
//! ```
//!
//! Entry filenames are the full lowercase hex encoding of the entry digest;
//! the two-character shard keeps per-directory fanout at 256 or less.
//! Readers ignore any sibling whose name is not canonical hex.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::digest::Digest;
use crate::error::{is_not_found, CacheError};
use crate::version::{FileVersion, MetadataVersion, ValueVersion};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Path resolution for a store root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: PathBuf) -> Layout {
        Layout { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staging directory for atomic renames.
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// A fresh staging path, unique within this store across processes.
    /// Process id plus an in-process counter; two staged files can never
    /// collide without a pid reuse inside one store lifetime.
    pub fn temp_file(&self) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.temp_dir().join(format!("{}-{:06}", process::id(), n))
    }

    /// Versioned file entry directory, `<root>/files/v<N>`.
    pub fn file_dir(&self, version: FileVersion) -> PathBuf {
        self.root.join("files").join(version.dir_name())
    }

    /// Versioned metadata directory, `<root>/meta/v<N>`.
    pub fn metadata_dir(&self, version: MetadataVersion) -> PathBuf {
        self.root.join("meta").join(version.dir_name())
    }

    /// Versioned value directory, `<root>/values/v<N>`.
    pub fn value_dir(&self, version: ValueVersion) -> PathBuf {
        self.root.join("values").join(version.dir_name())
    }

    /// Full path of the file entry for `digest` under `version`.
    pub fn file_path(&self, version: FileVersion, digest: &Digest) -> PathBuf {
        path_of(&self.file_dir(version), &digest.to_hex())
    }

    /// Full path of the metadata entry for `digest` under `version`.
    pub fn metadata_path(&self, version: MetadataVersion, digest: &Digest) -> PathBuf {
        path_of(&self.metadata_dir(version), &digest.to_hex())
    }

    /// Idempotently create the scaffolding every write goes through: `temp/`
    /// and the current-version subtree of each artifact kind.
    pub fn create_cache_directories(&self) -> std::io::Result<()> {
        fs::create_dir_all(self.temp_dir())?;
        fs::create_dir_all(self.file_dir(FileVersion::CURRENT))?;
        fs::create_dir_all(self.metadata_dir(MetadataVersion::CURRENT))?;
        fs::create_dir_all(self.value_dir(ValueVersion::CURRENT))?;
        Ok(())
    }

    /// Enumerate `(entry_path, digest)` pairs under a versioned storage
    /// directory. Intermediate directories whose name is not a length-2
    /// lowercase hex string are skipped, as is any leaf whose name does not
    /// parse as a canonical digest. A missing storage directory yields the
    /// empty list.
    pub fn list_entries(storage_dir: &Path) -> Result<Vec<(PathBuf, Digest)>, CacheError> {
        let shards = match fs::read_dir(storage_dir) {
            Ok(iter) => iter,
            Err(e) if is_not_found(&e) => return Ok(Vec::new()),
            Err(e) => {
                return Err(CacheError::User(format!(
                    "cannot read cache directory {}: {}",
                    storage_dir.display(),
                    e
                )))
            }
        };

        let mut entries = Vec::new();
        for shard in shards {
            let shard = match shard {
                Ok(s) => s,
                Err(e) if is_not_found(&e) => continue,
                Err(e) => {
                    return Err(CacheError::User(format!(
                        "cannot read cache directory {}: {}",
                        storage_dir.display(),
                        e
                    )))
                }
            };
            let shard_name = shard.file_name();
            if !is_shard_name(&shard_name.to_string_lossy()) {
                continue;
            }
            let leaves = match fs::read_dir(shard.path()) {
                Ok(iter) => iter,
                Err(e) if is_not_found(&e) => continue,
                Err(e) => {
                    return Err(CacheError::User(format!(
                        "cannot read cache directory {}: {}",
                        shard.path().display(),
                        e
                    )))
                }
            };
            for leaf in leaves {
                let leaf = match leaf {
                    Ok(l) => l,
                    Err(e) if is_not_found(&e) => continue,
                    Err(e) => {
                        return Err(CacheError::User(format!(
                            "cannot read cache directory {}: {}",
                            shard.path().display(),
                            e
                        )))
                    }
                };
                let name = leaf.file_name();
                if let Some(digest) = name.to_str().and_then(Digest::from_hex) {
                    entries.push((leaf.path(), digest));
                }
            }
        }
        Ok(entries)
    }
}

/// `<dir>/<hex[0..2]>/<hex>`.
fn path_of(dir: &Path, hex: &str) -> PathBuf {
    debug_assert!(hex.len() >= 2);
    dir.join(&hex[..2]).join(hex)
}

fn is_shard_name(name: &str) -> bool {
    name.len() == 2 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
