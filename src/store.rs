//! Store operations: promote produced files, restore them into build trees.
//!
//! All visible transitions are atomic renames or `link(2)` calls, so promote
//! and restore are safe against concurrent callers in other processes with
//! no lock file. Entries are staged under `temp/` and renamed into place;
//! a staged file that cannot be renamed is unlinked on the way out.
//!
//! A file entry is immutable once in place and is destroyed only by the
//! trimmer. Its link count is `1 + k` where `k` is the number of live hard
//! links from build trees; `k = 0` marks it unused.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::{CacheConfig, StorageMode};
use crate::digest::{Digest, FileDigest, RuleDigest};
use crate::error::{is_not_found, CacheError};
use crate::layout::Layout;
use crate::metadata::{self, FileRef, MetadataFile, Record};
use crate::version::{FileVersion, MetadataVersion};

/// One produced file a rule wants promoted.
#[derive(Debug, Clone)]
pub struct Output {
    /// Basename of the target relative to the rule's build directory.
    pub name: String,
    /// Where the produced file currently lives.
    pub path: PathBuf,
    /// Whether the target is executable; part of the entry's identity.
    pub executable: bool,
}

/// Outcome of a restore.
#[derive(Debug)]
pub enum RestoreResult {
    /// Every output was linked into the build directory, in metadata order.
    Restored(Vec<PathBuf>),
    /// No metadata entry for this rule digest.
    NotFound,
}

/// Read-only store occupancy numbers.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub file_entries: usize,
    pub total_bytes: u64,
    /// Bytes held by entries with no build-tree links.
    pub unused_bytes: u64,
}

/// A handle on the on-disk store.
#[derive(Debug)]
pub struct CacheStore {
    layout: Layout,
    mode: StorageMode,
    /// `0o666 & !umask`, sampled once from a freshly created file.
    entry_mode: u32,
}

impl CacheStore {
    /// Open the store, creating its directory scaffolding idempotently.
    pub fn open(config: CacheConfig) -> Result<CacheStore, CacheError> {
        let layout = Layout::new(config.root);
        layout.create_cache_directories()?;
        let entry_mode = sample_default_mode(&layout)?;
        Ok(CacheStore {
            layout,
            mode: config.storage_mode,
            entry_mode,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Promote a rule's outputs into the store.
    ///
    /// Each output is keyed by its executable-aware digest; outputs whose
    /// entry already exists are not copied again. The metadata entry is
    /// written last, so a concurrent restore observes either all outputs or
    /// none. A pre-existing metadata entry for the same rule digest wins and
    /// the new record is discarded: the rule digest uniquely identifies the
    /// inputs, so any such entry is correct.
    pub fn promote(&self, rule: RuleDigest, outputs: &[Output]) -> Result<(), CacheError> {
        let mut files = Vec::with_capacity(outputs.len());
        for output in outputs {
            let name = metadata::validate_name(output.name.as_bytes())
                .map_err(|e| CacheError::User(e.to_string()))?;
            let digest = FileDigest(Digest::file_with_executable_bit(
                &output.path,
                output.executable,
            )?);
            files.push((output, FileRef { name, digest }));
        }

        for (output, file_ref) in &files {
            self.store_file_entry(output, file_ref.digest)?;
        }

        let record = MetadataFile::of_files(files.into_iter().map(|(_, f)| f).collect());
        self.store_metadata_entry(rule, &record)
    }

    /// Restore a rule's outputs into `build_dir`.
    ///
    /// Returns `NotFound` when no metadata entry exists. Returns a corrupt
    /// error when the metadata does not parse or references a missing file
    /// entry; partial links are not rolled back since the caller re-executes
    /// the rule and overwrites them. A restore racing a trim of the same
    /// entry observes `ENOENT` on `link(2)` and is reported the same way.
    pub fn restore(&self, rule: RuleDigest, build_dir: &Path) -> Result<RestoreResult, CacheError> {
        let meta_path = self
            .layout
            .metadata_path(MetadataVersion::CURRENT, &rule.0);
        let bytes = match fs::read(&meta_path) {
            Ok(bytes) => bytes,
            Err(e) if is_not_found(&e) => return Ok(RestoreResult::NotFound),
            Err(e) => return Err(e.into()),
        };
        let parsed = MetadataFile::parse(&bytes)
            .map_err(|e| CacheError::Corrupt(format!("{}: {}", meta_path.display(), e)))?;
        let files = match parsed.record {
            Record::Files(files) => files,
            Record::Value(_) => {
                return Err(CacheError::Corrupt(format!(
                    "{}: value record cannot be restored into a build tree",
                    meta_path.display()
                )))
            }
        };

        let file_version = MetadataVersion::CURRENT.file_version();
        let mut restored = Vec::with_capacity(files.len());
        for FileRef { name, digest } in files {
            let entry = self.layout.file_path(file_version, &digest.0);
            let dest = build_dir.join(&name);
            match self.mode {
                StorageMode::Hardlink => {
                    match fs::remove_file(&dest) {
                        Ok(()) => {}
                        Err(e) if is_not_found(&e) => {}
                        Err(e) => return Err(e.into()),
                    }
                    match fs::hard_link(&entry, &dest) {
                        Ok(()) => {}
                        Err(e) if is_not_found(&e) => {
                            return Err(CacheError::Corrupt(format!(
                                "{}: missing file entry {}",
                                meta_path.display(),
                                digest
                            )))
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                StorageMode::Copy => {
                    match fs::copy(&entry, &dest) {
                        Ok(_) => {}
                        Err(e) if is_not_found(&e) => {
                            return Err(CacheError::Corrupt(format!(
                                "{}: missing file entry {}",
                                meta_path.display(),
                                digest
                            )))
                        }
                        Err(e) => return Err(e.into()),
                    }
                    bump_ctime(&entry)?;
                }
            }
            restored.push(dest);
        }
        Ok(RestoreResult::Restored(restored))
    }

    /// Occupancy numbers across all supported file-store versions.
    pub fn stats(&self) -> Result<StoreStats, CacheError> {
        let mut stats = StoreStats {
            file_entries: 0,
            total_bytes: 0,
            unused_bytes: 0,
        };
        for &version in FileVersion::all() {
            for (path, _) in Layout::list_entries(&self.layout.file_dir(version))? {
                let meta = match fs::symlink_metadata(&path) {
                    Ok(meta) => meta,
                    Err(e) if is_not_found(&e) => continue,
                    Err(e) => return Err(e.into()),
                };
                stats.file_entries += 1;
                stats.total_bytes += meta.len();
                if meta.nlink() == 1 {
                    stats.unused_bytes += meta.len();
                }
            }
        }
        Ok(stats)
    }

    fn store_file_entry(&self, output: &Output, digest: FileDigest) -> Result<(), CacheError> {
        let entry = self.layout.file_path(FileVersion::CURRENT, &digest.0);
        if entry.symlink_metadata().is_ok() {
            return Ok(());
        }

        let temp = self.layout.temp_file();
        let staged = match self.mode {
            // Linking the produced file makes the build tree share the
            // entry's inode, so the entry starts out live.
            StorageMode::Hardlink => {
                fs::hard_link(&output.path, &temp).or_else(|_| fs::copy(&output.path, &temp).map(|_| ()))
            }
            StorageMode::Copy => fs::copy(&output.path, &temp).map(|_| ()),
        };
        if let Err(e) = staged {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        let mut mode = self.entry_mode;
        if output.executable {
            mode |= (mode & 0o444) >> 2;
        }
        if let Err(e) = fs::set_permissions(&temp, fs::Permissions::from_mode(mode)) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        if let Some(parent) = entry.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                let _ = fs::remove_file(&temp);
                return Err(e.into());
            }
        }
        match fs::rename(&temp, &entry) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = fs::remove_file(&temp);
                // A concurrent promote may have won the rename.
                if entry.symlink_metadata().is_ok() {
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
        }
    }

    fn store_metadata_entry(&self, rule: RuleDigest, record: &MetadataFile) -> Result<(), CacheError> {
        let entry = self
            .layout
            .metadata_path(MetadataVersion::CURRENT, &rule.0);
        if entry.symlink_metadata().is_ok() {
            return Ok(());
        }

        let temp = self.layout.temp_file();
        if let Err(e) = fs::write(&temp, record.to_bytes()) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        if let Some(parent) = entry.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                let _ = fs::remove_file(&temp);
                return Err(e.into());
            }
        }
        match fs::rename(&temp, &entry) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = fs::remove_file(&temp);
                if entry.symlink_metadata().is_ok() {
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
        }
    }
}

/// Re-applying an entry's own permissions updates its ctime without touching
/// content, marking it recently used for the trimmer. In hardlink mode the
/// kernel does this for us when build-tree links appear and disappear.
fn bump_ctime(entry: &Path) -> Result<(), CacheError> {
    let meta = match fs::symlink_metadata(entry) {
        Ok(meta) => meta,
        Err(e) if is_not_found(&e) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    match fs::set_permissions(entry, meta.permissions()) {
        Ok(()) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Learn `0o666 & !umask` by creating a throwaway file and reading its mode.
fn sample_default_mode(layout: &Layout) -> Result<u32, CacheError> {
    let probe = layout.temp_file();
    let file = fs::File::create(&probe)?;
    let mode = file.metadata()?.permissions().mode() & 0o777;
    drop(file);
    let _ = fs::remove_file(&probe);
    Ok(mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> CacheStore {
        CacheStore::open(CacheConfig::with_root(dir.path().join("db"))).unwrap()
    }

    #[test]
    fn test_open_creates_scaffolding() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.layout().temp_dir().is_dir());
        assert!(store.layout().file_dir(FileVersion::CURRENT).is_dir());
    }

    #[test]
    fn test_entry_mode_has_no_exec_bits() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert_eq!(store.entry_mode & 0o111, 0);
        assert_ne!(store.entry_mode & 0o400, 0);
    }

    #[test]
    fn test_promote_rejects_path_separator_in_name() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let produced = dir.path().join("out");
        fs::write(&produced, "x").unwrap();
        let err = store
            .promote(
                RuleDigest(Digest::of_bytes(b"rule")),
                &[Output {
                    name: "sub/out".to_string(),
                    path: produced,
                    executable: false,
                }],
            )
            .unwrap_err();
        assert!(matches!(err, CacheError::User(_)));
    }

    #[test]
    fn test_promote_missing_source_is_io_error() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let err = store
            .promote(
                RuleDigest(Digest::of_bytes(b"rule")),
                &[Output {
                    name: "out".to_string(),
                    path: dir.path().join("absent"),
                    executable: false,
                }],
            )
            .unwrap_err();
        assert!(matches!(err, CacheError::Io(_)));
    }

    #[test]
    fn test_stats_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let stats = store.stats().unwrap();
        assert_eq!(stats.file_entries, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.unused_bytes, 0);
    }
}
