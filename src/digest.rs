//! Content digests keying the store.
//!
//! The canonical digest is 128 bits (MD5), hex-encoded in paths. Callers must
//! not depend on cryptographic strength, only on collision unlikelihood for
//! build inputs. File entries are keyed by an executable-aware digest that
//! binds the executable bit into the identity, so two otherwise-identical
//! files with differing executable bits are distinct entries.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use md5::{Digest as _, Md5};
use serde::Serialize;

/// A 128-bit content digest. Ordered byte-lexicographically; two digests are
/// equal iff they denote the same byte sequence.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 16]);

/// Length of the canonical lowercase hex encoding.
pub const HEX_LEN: usize = 32;

impl Digest {
    /// Digest of a byte sequence.
    pub fn of_bytes(bytes: &[u8]) -> Digest {
        let mut hasher = Md5::new();
        hasher.update(bytes);
        Digest(hasher.finalize().into())
    }

    /// Digest of a file's contents, streamed in 64 KiB chunks.
    pub fn of_file(path: &Path) -> io::Result<Digest> {
        let mut file = File::open(path)?;
        let mut hasher = Md5::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(Digest(hasher.finalize().into()))
    }

    /// Executable-aware digest of a regular file: the content digest's raw
    /// 16 bytes followed by a single trailer byte (`\x01` when executable,
    /// `\x00` otherwise), digested again.
    ///
    /// A path that unexpectedly resolves to a directory falls back to the
    /// stat-tuple placeholder digest.
    pub fn file_with_executable_bit(path: &Path, executable: bool) -> io::Result<Digest> {
        let meta = std::fs::metadata(path)?;
        if meta.is_dir() {
            return Ok(Digest::of_directory_stats(&meta));
        }
        let content = Digest::of_file(path)?;
        let mut combined = [0u8; 17];
        combined[..16].copy_from_slice(&content.0);
        combined[16] = executable as u8;
        Ok(Digest::of_bytes(&combined))
    }

    /// Placeholder digest for a path that unexpectedly resolves to a
    /// directory: a fixed-width little-endian encoding of the stat tuple
    /// `(size, mode, mtime, ctime)`, digested. The time fields make this
    /// non-reproducible across machines; callers should avoid handing
    /// directories to the executable-aware digest in the first place.
    pub fn of_directory_stats(meta: &std::fs::Metadata) -> Digest {
        use std::os::unix::fs::MetadataExt;
        let mut encoded = [0u8; 28];
        encoded[0..8].copy_from_slice(&meta.size().to_le_bytes());
        encoded[8..12].copy_from_slice(&meta.mode().to_le_bytes());
        encoded[12..20].copy_from_slice(&meta.mtime().to_le_bytes());
        encoded[20..28].copy_from_slice(&meta.ctime().to_le_bytes());
        Digest::of_bytes(&encoded)
    }

    /// Digest of a structured value via its canonical serialization. The
    /// output depends solely on the value tree, never on storage sharing of
    /// equal subvalues inside the caller.
    pub fn generic<T: Serialize>(value: &T) -> Result<Digest, serde_json::Error> {
        let encoded = serde_json::to_vec(value)?;
        Ok(Digest::of_bytes(&encoded))
    }

    /// Parse a canonical-width lowercase hex string. Uppercase digits, wrong
    /// length, or non-hex bytes all yield `None`.
    pub fn from_hex(s: &str) -> Option<Digest> {
        if s.len() != HEX_LEN {
            return None;
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return None;
        }
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Digest(bytes))
    }

    /// Lowercase hex encoding, `HEX_LEN` characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The raw 16 bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

/// Digest identifying one rule execution's input set; chosen by the build
/// system, same shape as a file digest but a distinct type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleDigest(pub Digest);

/// Digest naming a single file entry (content plus executable bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileDigest(pub Digest);

impl RuleDigest {
    pub fn from_hex(s: &str) -> Option<RuleDigest> {
        Digest::from_hex(s).map(RuleDigest)
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

impl FileDigest {
    pub fn from_hex(s: &str) -> Option<FileDigest> {
        Digest::from_hex(s).map(FileDigest)
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

impl fmt::Display for RuleDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for FileDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
