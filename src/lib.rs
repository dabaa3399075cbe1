//! Shared content-addressed build cache.
//!
//! A process-external store on the local filesystem that memoizes the
//! outputs of reproducible build rules across workspaces. Multiple
//! concurrent build processes promote produced files into the store,
//! restore them into build trees via hard links, and trim the store under
//! a disk budget. The filesystem is the only concurrency medium: all
//! visible transitions are atomic renames or `link(2)` calls, and link
//! counts are the sole liveness signal.

pub mod config;
pub mod digest;
pub mod error;
pub mod layout;
pub mod metadata;
pub mod store;
pub mod trim;
pub mod version;

pub use config::{CacheConfig, StorageMode};
pub use digest::{Digest, FileDigest, RuleDigest};
pub use error::CacheError;
pub use layout::Layout;
pub use metadata::{FileRef, MetadataError, MetadataFile, Record};
pub use store::{CacheStore, Output, RestoreResult, StoreStats};
pub use trim::{TrimGoal, TrimResult, Trimmer};
pub use version::{FileVersion, MetadataVersion, ValueVersion};
