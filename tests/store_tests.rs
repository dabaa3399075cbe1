//! Promote/restore correctness tests against a temporary store root.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use dune_cache::{
    CacheConfig, CacheError, CacheStore, Digest, FileVersion, Output, RestoreResult, RuleDigest,
    StorageMode,
};

fn open_store(temp_dir: &TempDir) -> CacheStore {
    CacheStore::open(CacheConfig::with_root(temp_dir.path().join("db"))).unwrap()
}

fn open_copy_store(temp_dir: &TempDir) -> CacheStore {
    let config = CacheConfig::with_root(temp_dir.path().join("db"))
        .with_storage_mode(StorageMode::Copy);
    CacheStore::open(config).unwrap()
}

fn rule(seed: &[u8]) -> RuleDigest {
    RuleDigest(Digest::of_bytes(seed))
}

fn write_output(dir: &Path, name: &str, content: &[u8]) -> Output {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    Output {
        name: name.to_string(),
        path,
        executable: false,
    }
}

/// The executable-aware entry digest, recomputed from first principles.
fn entry_digest(content: &[u8], executable: bool) -> Digest {
    let content_digest = Digest::of_bytes(content);
    let mut combined = Vec::with_capacity(17);
    combined.extend_from_slice(content_digest.as_bytes());
    combined.push(executable as u8);
    Digest::of_bytes(&combined)
}

fn entry_path(store: &CacheStore, content: &[u8], executable: bool) -> PathBuf {
    store
        .layout()
        .file_path(FileVersion::CURRENT, &entry_digest(content, executable))
}

// =============================================================================
// Executable bits key distinct entries
// =============================================================================

#[test]
fn test_same_content_differing_executable_bits_are_distinct_entries() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let build = temp_dir.path().join("build");
    fs::create_dir_all(&build).unwrap();

    let non_exe = write_output(&build, "non-exe", b"content\n");
    let mut exe = write_output(&build, "exe", b"content\n");
    exe.executable = true;

    store.promote(rule(b"rule-non-exe"), &[non_exe]).unwrap();
    store.promote(rule(b"rule-exe"), &[exe]).unwrap();

    let non_exe_entry = entry_path(&store, b"content\n", false);
    let exe_entry = entry_path(&store, b"content\n", true);
    assert_ne!(non_exe_entry, exe_entry);
    assert!(non_exe_entry.is_file());
    assert!(exe_entry.is_file());

    // The historical digests for these two entries, pinned.
    assert!(non_exe_entry.ends_with(Path::new("62/6274851067c88e9990e912be27cce386")));
    assert!(exe_entry.ends_with(Path::new("5e/5e5bb3a0ec0e689e19a59c3ee3d7fca8")));

    // The executable bit is carried by the entry's mode.
    let non_exe_mode = fs::metadata(&non_exe_entry).unwrap().permissions().mode();
    let exe_mode = fs::metadata(&exe_entry).unwrap().permissions().mode();
    assert_eq!(non_exe_mode & 0o111, 0);
    assert_ne!(exe_mode & 0o100, 0);
}

// =============================================================================
// Round trip
// =============================================================================

#[test]
fn test_promote_then_restore_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let build = temp_dir.path().join("build");
    fs::create_dir_all(&build).unwrap();

    let output = write_output(&build, "lib.a", b"object code");
    store.promote(rule(b"compile lib"), &[output]).unwrap();

    let restore_dir = temp_dir.path().join("fresh-build");
    fs::create_dir_all(&restore_dir).unwrap();
    let result = store.restore(rule(b"compile lib"), &restore_dir).unwrap();

    match result {
        RestoreResult::Restored(files) => {
            assert_eq!(files, vec![restore_dir.join("lib.a")]);
            assert_eq!(fs::read(&files[0]).unwrap(), b"object code");
            // Hard link: restored file shares the entry's inode.
            let entry = entry_path(&store, b"object code", false);
            assert_eq!(
                fs::metadata(&files[0]).unwrap().ino(),
                fs::metadata(&entry).unwrap().ino()
            );
        }
        RestoreResult::NotFound => panic!("expected a cache hit"),
    }
}

#[test]
fn test_restore_unknown_rule_is_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let build = temp_dir.path().join("build");
    fs::create_dir_all(&build).unwrap();

    let result = store.restore(rule(b"never promoted"), &build).unwrap();
    assert!(matches!(result, RestoreResult::NotFound));
}

#[test]
fn test_restore_observes_all_outputs_or_none() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let build = temp_dir.path().join("build");
    fs::create_dir_all(&build).unwrap();

    let outputs = vec![
        write_output(&build, "multi_a", b"payload a"),
        write_output(&build, "multi_b", b"payload b"),
    ];
    store.promote(rule(b"multi"), &outputs).unwrap();

    let restore_dir = temp_dir.path().join("fresh-build");
    fs::create_dir_all(&restore_dir).unwrap();
    match store.restore(rule(b"multi"), &restore_dir).unwrap() {
        RestoreResult::Restored(files) => {
            assert_eq!(files.len(), 2);
            assert_eq!(fs::read(restore_dir.join("multi_a")).unwrap(), b"payload a");
            assert_eq!(fs::read(restore_dir.join("multi_b")).unwrap(), b"payload b");
        }
        RestoreResult::NotFound => panic!("expected a cache hit"),
    }
}

// =============================================================================
// Corruption
// =============================================================================

#[test]
fn test_restore_with_missing_file_entry_is_corrupt() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let build = temp_dir.path().join("build");
    fs::create_dir_all(&build).unwrap();

    let output = write_output(&build, "out", b"gone soon");
    store.promote(rule(b"r"), &[output]).unwrap();

    // Simulate a trim racing the restore.
    fs::remove_file(entry_path(&store, b"gone soon", false)).unwrap();
    fs::remove_file(build.join("out")).unwrap();

    let err = store.restore(rule(b"r"), &build).unwrap_err();
    assert!(matches!(err, CacheError::Corrupt(_)));
}

// =============================================================================
// Idempotence and first-writer-wins
// =============================================================================

#[test]
fn test_promote_is_idempotent_and_does_not_recopy() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let build = temp_dir.path().join("build");
    fs::create_dir_all(&build).unwrap();

    let output = write_output(&build, "out", b"stable bytes");
    store.promote(rule(b"r"), &[output.clone()]).unwrap();

    let entry = entry_path(&store, b"stable bytes", false);
    let inode_before = fs::metadata(&entry).unwrap().ino();

    store.promote(rule(b"r"), &[output]).unwrap();
    assert_eq!(fs::metadata(&entry).unwrap().ino(), inode_before);
}

#[test]
fn test_first_metadata_writer_wins() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let build = temp_dir.path().join("build");
    fs::create_dir_all(&build).unwrap();

    let first = write_output(&build, "out", b"first bytes");
    store.promote(rule(b"same inputs"), &[first]).unwrap();

    // A second promotion under the same rule digest is discarded.
    let mut second = write_output(&build, "out.attempt2", b"second bytes");
    second.name = "out".to_string();
    store.promote(rule(b"same inputs"), &[second]).unwrap();

    let restore_dir = temp_dir.path().join("fresh-build");
    fs::create_dir_all(&restore_dir).unwrap();
    match store.restore(rule(b"same inputs"), &restore_dir).unwrap() {
        RestoreResult::Restored(files) => {
            assert_eq!(fs::read(&files[0]).unwrap(), b"first bytes");
        }
        RestoreResult::NotFound => panic!("expected a cache hit"),
    }
}

// =============================================================================
// Link-count bookkeeping
// =============================================================================

#[test]
fn test_hardlink_promote_shares_inode_with_build_tree() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let build = temp_dir.path().join("build");
    fs::create_dir_all(&build).unwrap();

    let output = write_output(&build, "out", b"linked bytes");
    store.promote(rule(b"r"), &[output]).unwrap();

    let entry = entry_path(&store, b"linked bytes", false);
    assert_eq!(fs::metadata(&entry).unwrap().nlink(), 2);

    // Dropping the build-tree link leaves the entry unused.
    fs::remove_file(build.join("out")).unwrap();
    assert_eq!(fs::metadata(&entry).unwrap().nlink(), 1);
}

#[test]
fn test_copy_mode_restore_leaves_entry_unused() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_copy_store(&temp_dir);
    let build = temp_dir.path().join("build");
    fs::create_dir_all(&build).unwrap();

    let output = write_output(&build, "out", b"copied bytes");
    store.promote(rule(b"r"), &[output]).unwrap();

    let entry = entry_path(&store, b"copied bytes", false);
    assert_eq!(fs::metadata(&entry).unwrap().nlink(), 1);

    let restore_dir = temp_dir.path().join("fresh-build");
    fs::create_dir_all(&restore_dir).unwrap();
    match store.restore(rule(b"r"), &restore_dir).unwrap() {
        RestoreResult::Restored(files) => {
            assert_eq!(fs::read(&files[0]).unwrap(), b"copied bytes");
            // A copy, not a link.
            assert_eq!(fs::metadata(&entry).unwrap().nlink(), 1);
            assert_ne!(
                fs::metadata(&files[0]).unwrap().ino(),
                fs::metadata(&entry).unwrap().ino()
            );
        }
        RestoreResult::NotFound => panic!("expected a cache hit"),
    }
}

// =============================================================================
// Stats
// =============================================================================

#[test]
fn test_stats_distinguish_used_from_unused() {
    let temp_dir = TempDir::new().unwrap();
    let store = open_store(&temp_dir);
    let build = temp_dir.path().join("build");
    fs::create_dir_all(&build).unwrap();

    store
        .promote(rule(b"a"), &[write_output(&build, "kept", b"kept bytes!")])
        .unwrap();
    store
        .promote(rule(b"b"), &[write_output(&build, "dropped", b"dropped")])
        .unwrap();
    fs::remove_file(build.join("dropped")).unwrap();

    let stats = store.stats().unwrap();
    assert_eq!(stats.file_entries, 2);
    assert_eq!(stats.total_bytes, 11 + 7);
    assert_eq!(stats.unused_bytes, 7);
}
