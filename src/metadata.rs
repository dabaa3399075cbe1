//! Canonical textual codec for metadata entries.
//!
//! A metadata entry binds a rule digest to the complete set of outputs of one
//! rule instance. The on-disk form is a canonical s-expression: atoms are
//! length-prefixed (`<len>:<bytes>`, decimal length, no whitespace), lists
//! are parenthesized. An artifacts record reads
//!
//! ```text
//! ((8:metadata)(5:files(<name><digest>)(<name><digest>)...))
//! ```
//!
//! where each `<name>` is a target basename and each `<digest>` the
//! 32-character lowercase hex of a file digest. A second record kind,
//! `value`, carries a single digest; it is parsed and kept but never
//! hard-linked and never gates trimming. The `metadata` header list may
//! carry trailing items from newer writers; they are tolerated and ignored.
//! Encoded records are small, typically under 200 bytes.

use thiserror::Error;

use crate::digest::{Digest, FileDigest};

/// Errors from parsing or validating a metadata record.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEnd(usize),

    #[error("invalid token length at byte {0}")]
    InvalidLength(usize),

    #[error("unexpected character at byte {0}")]
    UnexpectedCharacter(usize),

    #[error("malformed metadata record: {0}")]
    Malformed(String),

    #[error("invalid digest token: {0:?}")]
    InvalidDigest(String),

    #[error("invalid target name: {0:?}")]
    InvalidName(String),
}

/// One output of a rule: the target's basename and its file digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub name: String,
    pub digest: FileDigest,
}

/// The payload of a metadata entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// The ordered outputs of one rule instance.
    Files(Vec<FileRef>),
    /// Reserved record kind; kept by the trimmer, never restored.
    Value(Digest),
}

/// A parsed metadata entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFile {
    pub record: Record,
}

impl MetadataFile {
    pub fn of_files(files: Vec<FileRef>) -> MetadataFile {
        MetadataFile {
            record: Record::Files(files),
        }
    }

    /// Parse the canonical form. Trailing bytes after the record are an
    /// error; so is any digest or name that fails validation.
    pub fn parse(input: &[u8]) -> Result<MetadataFile, MetadataError> {
        let mut parser = Parser { input, pos: 0 };
        let sexp = parser.parse_sexp()?;
        if parser.pos != input.len() {
            return Err(MetadataError::UnexpectedCharacter(parser.pos));
        }
        MetadataFile::of_sexp(sexp)
    }

    /// Serialize to the canonical form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.push(b'(');
        out.push(b'(');
        write_atom(&mut out, b"metadata");
        out.push(b')');
        out.push(b'(');
        match &self.record {
            Record::Files(files) => {
                write_atom(&mut out, b"files");
                for file in files {
                    out.push(b'(');
                    write_atom(&mut out, file.name.as_bytes());
                    write_atom(&mut out, file.digest.to_hex().as_bytes());
                    out.push(b')');
                }
            }
            Record::Value(digest) => {
                write_atom(&mut out, b"value");
                write_atom(&mut out, digest.to_hex().as_bytes());
            }
        }
        out.push(b')');
        out.push(b')');
        out
    }

    fn of_sexp(sexp: Sexp) -> Result<MetadataFile, MetadataError> {
        let items = match sexp {
            Sexp::List(items) => items,
            Sexp::Atom(_) => {
                return Err(MetadataError::Malformed(
                    "top-level form is not a list".to_string(),
                ))
            }
        };
        let [header, body] = match <[Sexp; 2]>::try_from(items) {
            Ok(items) => items,
            Err(items) => {
                return Err(MetadataError::Malformed(format!(
                    "expected 2 top-level items, found {}",
                    items.len()
                )))
            }
        };
        check_header(header)?;
        let record = parse_record(body)?;
        Ok(MetadataFile { record })
    }
}

fn check_header(sexp: Sexp) -> Result<(), MetadataError> {
    match sexp {
        Sexp::List(items) if matches!(items.first(), Some(Sexp::Atom(a)) if a == b"metadata") => {
            Ok(())
        }
        _ => Err(MetadataError::Malformed(
            "missing metadata header".to_string(),
        )),
    }
}

fn parse_record(sexp: Sexp) -> Result<Record, MetadataError> {
    let items = match sexp {
        Sexp::List(items) => items,
        Sexp::Atom(_) => return Err(MetadataError::Malformed("record is not a list".to_string())),
    };
    match items.first() {
        Some(Sexp::Atom(tag)) if tag == b"files" => {
            let mut files = Vec::with_capacity(items.len() - 1);
            for item in &items[1..] {
                files.push(parse_file_ref(item)?);
            }
            Ok(Record::Files(files))
        }
        Some(Sexp::Atom(tag)) if tag == b"value" => {
            if items.len() != 2 {
                return Err(MetadataError::Malformed(
                    "value record must carry exactly one digest".to_string(),
                ));
            }
            Ok(Record::Value(parse_digest_atom(&items[1])?))
        }
        _ => Err(MetadataError::Malformed(
            "record tag is neither files nor value".to_string(),
        )),
    }
}

fn parse_file_ref(sexp: &Sexp) -> Result<FileRef, MetadataError> {
    let items = match sexp {
        Sexp::List(items) if items.len() == 2 => items,
        _ => {
            return Err(MetadataError::Malformed(
                "file entry is not a (name digest) pair".to_string(),
            ))
        }
    };
    let name = match &items[0] {
        Sexp::Atom(bytes) => validate_name(bytes)?,
        Sexp::List(_) => return Err(MetadataError::Malformed("name is not an atom".to_string())),
    };
    let digest = parse_digest_atom(&items[1])?;
    Ok(FileRef {
        name,
        digest: FileDigest(digest),
    })
}

fn parse_digest_atom(sexp: &Sexp) -> Result<Digest, MetadataError> {
    let bytes = match sexp {
        Sexp::Atom(bytes) => bytes,
        Sexp::List(_) => {
            return Err(MetadataError::Malformed(
                "digest is not an atom".to_string(),
            ))
        }
    };
    let text = String::from_utf8_lossy(bytes);
    Digest::from_hex(&text).ok_or_else(|| MetadataError::InvalidDigest(text.into_owned()))
}

/// Target names are basenames relative to the rule's build directory: never
/// empty, never containing a path separator or NUL.
pub fn validate_name(bytes: &[u8]) -> Result<String, MetadataError> {
    let invalid = || MetadataError::InvalidName(String::from_utf8_lossy(bytes).into_owned());
    let name = std::str::from_utf8(bytes).map_err(|_| invalid())?;
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(invalid());
    }
    Ok(name.to_string())
}

enum Sexp {
    Atom(Vec<u8>),
    List(Vec<Sexp>),
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn parse_sexp(&mut self) -> Result<Sexp, MetadataError> {
        match self.peek()? {
            b'(' => {
                self.pos += 1;
                let mut items = Vec::new();
                loop {
                    if self.peek()? == b')' {
                        self.pos += 1;
                        return Ok(Sexp::List(items));
                    }
                    items.push(self.parse_sexp()?);
                }
            }
            b'0'..=b'9' => self.parse_atom(),
            _ => Err(MetadataError::UnexpectedCharacter(self.pos)),
        }
    }

    fn parse_atom(&mut self) -> Result<Sexp, MetadataError> {
        let start = self.pos;
        let mut len: usize = 0;
        loop {
            match self.peek()? {
                digit @ b'0'..=b'9' => {
                    // Canonical form never zero-pads lengths.
                    if self.pos > start && len == 0 {
                        return Err(MetadataError::InvalidLength(start));
                    }
                    len = len
                        .checked_mul(10)
                        .and_then(|n| n.checked_add((digit - b'0') as usize))
                        .ok_or(MetadataError::InvalidLength(start))?;
                    self.pos += 1;
                }
                b':' => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(MetadataError::UnexpectedCharacter(self.pos)),
            }
        }
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.input.len())
            .ok_or(MetadataError::UnexpectedEnd(self.input.len()))?;
        let bytes = self.input[self.pos..end].to_vec();
        self.pos = end;
        Ok(Sexp::Atom(bytes))
    }

    fn peek(&self) -> Result<u8, MetadataError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(MetadataError::UnexpectedEnd(self.pos))
    }
}

fn write_atom(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}
