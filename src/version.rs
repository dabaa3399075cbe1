//! On-disk format versions.
//!
//! Two monotone version sequences: one for the file store, one for metadata,
//! plus a reserved one for values. The writer targets exactly one current
//! version per artifact kind; older versions may remain on disk from prior
//! installations and are read-only except for trimming. Each metadata
//! version pairs with exactly one file-store version.
//!
//! Bump the file version when a digest scheme changes (and with it the
//! metadata version that pairs with it); bump the metadata version alone
//! when only the codec or its fields change. New versions are added by
//! appending rows here.

/// File-store format versions (`files/v<N>/`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileVersion {
    V2,
    V3,
    V4,
}

impl FileVersion {
    /// The version new file entries are written to.
    pub const CURRENT: FileVersion = FileVersion::V4;

    /// All versions readers and the trimmer enumerate, oldest first.
    pub fn all() -> &'static [FileVersion] {
        &[FileVersion::V2, FileVersion::V3, FileVersion::V4]
    }

    /// Directory name under `files/`.
    pub fn dir_name(self) -> &'static str {
        match self {
            FileVersion::V2 => "v2",
            FileVersion::V3 => "v3",
            FileVersion::V4 => "v4",
        }
    }
}

/// Metadata format versions (`meta/v<N>/`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataVersion {
    V3,
    V4,
    V5,
}

impl MetadataVersion {
    /// The version new metadata entries are written to.
    pub const CURRENT: MetadataVersion = MetadataVersion::V5;

    /// All versions readers and the trimmer enumerate, oldest first.
    pub fn all() -> &'static [MetadataVersion] {
        &[MetadataVersion::V3, MetadataVersion::V4, MetadataVersion::V5]
    }

    /// Directory name under `meta/`.
    pub fn dir_name(self) -> &'static str {
        match self {
            MetadataVersion::V3 => "v3",
            MetadataVersion::V4 => "v4",
            MetadataVersion::V5 => "v5",
        }
    }

    /// The file-store version whose entries this metadata version references.
    pub fn file_version(self) -> FileVersion {
        match self {
            MetadataVersion::V3 => FileVersion::V2,
            MetadataVersion::V4 => FileVersion::V3,
            MetadataVersion::V5 => FileVersion::V4,
        }
    }
}

/// Value storage versions (`values/v<N>/`). Reserved; never trimmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueVersion {
    V3,
}

impl ValueVersion {
    pub const CURRENT: ValueVersion = ValueVersion::V3;

    /// Directory name under `values/`.
    pub fn dir_name(self) -> &'static str {
        match self {
            ValueVersion::V3 => "v3",
        }
    }
}
