//! Two-phase reclamation of store bytes.
//!
//! Phase A sweeps broken metadata across all supported metadata versions:
//! records that do not parse, or whose referenced file entries are missing
//! under the paired file-store version. Phase B evicts unused file entries
//! (link count exactly 1) in ctime order until the byte goal is met. `ctime`
//! is bumped by `unlink(2)` of a sibling link, so an entry whose last
//! build-tree link disappeared recently sorts as recently unused.
//!
//! The trimmer is the sole mutator that may unlink store entries. It never
//! walks `values/`, never compacts, and treats a concurrent unlink of an
//! entry it was about to visit as normal, not an error.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{is_not_found, CacheError};
use crate::layout::Layout;
use crate::metadata::{MetadataFile, Record};
use crate::version::{FileVersion, MetadataVersion};

/// What a trim invocation is asked to achieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimGoal {
    /// Reduce the overhead size (bytes held by unused file entries) to at
    /// most this many bytes.
    Size(u64),
    /// Free at least this many bytes.
    Freed(u64),
}

/// Outcome of a trim or garbage-collect run. Partial progress is reported:
/// a run that stops early still accounts the bytes it freed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrimResult {
    pub freed_bytes: u64,
    pub removed_file_entries: usize,
    pub removed_metadata_entries: usize,
    /// Non-fatal per-entry failures, skipped without aborting the sweep.
    pub warnings: Vec<String>,
}

/// A file entry eligible for eviction.
#[derive(Debug)]
struct UnusedEntry {
    path: PathBuf,
    size: u64,
    ctime: (i64, i64),
}

/// Trims a store laid out under a single root.
#[derive(Debug)]
pub struct Trimmer {
    layout: Layout,
    should_stop: Option<Arc<AtomicBool>>,
}

impl Trimmer {
    pub fn new(layout: Layout) -> Trimmer {
        Trimmer {
            layout,
            should_stop: None,
        }
    }

    /// Consult this flag before each unlink; when it flips, the sweep stops
    /// and reports the progress made so far.
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Trimmer {
        self.should_stop = Some(flag);
        self
    }

    /// Run both phases. Creates nothing: an absent store trims to zero.
    pub fn trim(&self, goal: TrimGoal) -> Result<TrimResult, CacheError> {
        let mut result = TrimResult::default();
        self.sweep_broken_metadata(&mut result)?;
        self.evict_unused_files(goal, &mut result)?;
        Ok(result)
    }

    /// Phase A alone: drop broken metadata, never touch live file entries.
    pub fn garbage_collect(&self) -> Result<TrimResult, CacheError> {
        let mut result = TrimResult::default();
        self.sweep_broken_metadata(&mut result)?;
        Ok(result)
    }

    /// Total bytes held by unused file entries across all supported
    /// versions. Read-only.
    pub fn overhead_size(&self) -> Result<u64, CacheError> {
        let mut result = TrimResult::default();
        let unused = self.collect_unused(&mut result)?;
        Ok(unused.iter().map(|e| e.size).sum())
    }

    fn stop_requested(&self) -> bool {
        self.should_stop
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Delete metadata entries that fail to parse or reference file entries
    /// missing under their version's paired file store. Value records are
    /// kept. Entries that vanish mid-sweep are skipped without credit.
    fn sweep_broken_metadata(&self, result: &mut TrimResult) -> Result<(), CacheError> {
        for &metadata_version in MetadataVersion::all() {
            let file_version = metadata_version.file_version();
            let dir = self.layout.metadata_dir(metadata_version);
            for (path, _digest) in Layout::list_entries(&dir)? {
                let bytes = match fs::read(&path) {
                    Ok(bytes) => bytes,
                    Err(e) if is_not_found(&e) => continue,
                    Err(e) => {
                        result
                            .warnings
                            .push(format!("cannot read {}: {}", path.display(), e));
                        continue;
                    }
                };
                let broken = match MetadataFile::parse(&bytes) {
                    Err(_) => true,
                    Ok(MetadataFile {
                        record: Record::Value(_),
                    }) => false,
                    Ok(MetadataFile {
                        record: Record::Files(files),
                    }) => {
                        let mut missing = false;
                        for file in &files {
                            let entry = self.layout.file_path(file_version, &file.digest.0);
                            match fs::symlink_metadata(&entry) {
                                Ok(_) => {}
                                Err(e) if is_not_found(&e) => {
                                    missing = true;
                                    break;
                                }
                                Err(e) => {
                                    result.warnings.push(format!(
                                        "cannot stat {}: {}",
                                        entry.display(),
                                        e
                                    ));
                                }
                            }
                        }
                        missing
                    }
                };
                if !broken {
                    continue;
                }
                let size = match fs::symlink_metadata(&path) {
                    Ok(meta) => meta.len(),
                    Err(e) if is_not_found(&e) => continue,
                    Err(e) => {
                        result
                            .warnings
                            .push(format!("cannot stat {}: {}", path.display(), e));
                        continue;
                    }
                };
                // Credit the bytes even if a concurrent trimmer unlinked
                // first; both observed the same broken entry.
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if is_not_found(&e) => {}
                    Err(e) => {
                        result
                            .warnings
                            .push(format!("cannot unlink {}: {}", path.display(), e));
                        continue;
                    }
                }
                result.freed_bytes += size;
                result.removed_metadata_entries += 1;
            }
        }
        Ok(())
    }

    /// Enumerate unused file entries (link count exactly 1) across all
    /// supported file-store versions.
    fn collect_unused(&self, result: &mut TrimResult) -> Result<Vec<UnusedEntry>, CacheError> {
        use std::os::unix::fs::MetadataExt;

        let mut unused = Vec::new();
        for &version in FileVersion::all() {
            let dir = self.layout.file_dir(version);
            for (path, _digest) in Layout::list_entries(&dir)? {
                let meta = match fs::symlink_metadata(&path) {
                    Ok(meta) => meta,
                    Err(e) if is_not_found(&e) => continue,
                    Err(e) => {
                        result
                            .warnings
                            .push(format!("cannot stat {}: {}", path.display(), e));
                        continue;
                    }
                };
                if meta.nlink() != 1 {
                    continue;
                }
                unused.push(UnusedEntry {
                    path,
                    size: meta.len(),
                    ctime: (meta.ctime(), meta.ctime_nsec()),
                });
            }
        }
        Ok(unused)
    }

    /// Phase B: unlink unused entries oldest-ctime-first until the goal is
    /// met. Ties break by path so concurrent trimmers visit entries in the
    /// same order.
    fn evict_unused_files(&self, goal: TrimGoal, result: &mut TrimResult) -> Result<(), CacheError> {
        let mut unused = self.collect_unused(result)?;
        unused.sort_by(|a, b| a.ctime.cmp(&b.ctime).then_with(|| a.path.cmp(&b.path)));

        let overhead: u64 = unused.iter().map(|e| e.size).sum();
        // The freed goal counts Phase A credits; the size goal bounds what
        // unused entries may keep holding.
        let bytes_to_free = match goal {
            TrimGoal::Freed(target) => target.saturating_sub(result.freed_bytes),
            TrimGoal::Size(limit) => overhead.saturating_sub(limit),
        };

        let mut evicted = 0u64;
        for entry in unused {
            if evicted >= bytes_to_free {
                break;
            }
            if self.stop_requested() {
                break;
            }
            match fs::remove_file(&entry.path) {
                Ok(()) => {}
                Err(e) if is_not_found(&e) => continue,
                Err(e) => {
                    result
                        .warnings
                        .push(format!("cannot unlink {}: {}", entry.path.display(), e));
                    continue;
                }
            }
            evicted += entry.size;
            result.freed_bytes += entry.size;
            result.removed_file_entries += 1;
        }
        Ok(())
    }
}
