//! Content-addressed, write-once result cache shared by every stage.
//!
//! Entries are keyed by fingerprints of their true inputs, published with a
//! temp-write-then-rename so a crashed writer can never leave a partial entry
//! visible, and never overwritten once complete. A well-formed entry is
//! completion proof; an unreadable one is reported as corruption so the
//! caller can discard it and recompute.

use std::error::Error;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::fingerprint::Fingerprint;

/// Leading bytes of every binary cache blob.
const BLOB_MAGIC: &[u8; 4] = b"PMC1";

/// Cache sections, one directory per artifact kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSection {
    /// Per-shard embedding matrices (binary blobs).
    Embeddings,
    /// Serialized ANN indexes (binary blobs).
    Indexes,
    /// Neighbor lists from kNN search (JSONL records).
    NnResults,
    /// Scored candidate pairs per search unit (JSONL records).
    Pairs,
    /// Final named dataset artifacts (JSONL records).
    Datasets,
}

impl CacheSection {
    fn dir_name(self) -> &'static str {
        match self {
            CacheSection::Embeddings => "embeddings",
            CacheSection::Indexes => "indexes",
            CacheSection::NnResults => "nn_results",
            CacheSection::Pairs => "pairs",
            CacheSection::Datasets => "datasets",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            CacheSection::Embeddings | CacheSection::Indexes => "bin",
            CacheSection::NnResults | CacheSection::Pairs | CacheSection::Datasets => "jsonl",
        }
    }
}

/// Errors raised by cache reads and writes.
#[derive(Debug)]
pub enum CacheError {
    /// An entry exists but failed integrity validation.
    Corruption {
        /// Entry on disk.
        path: PathBuf,
        /// What failed to validate.
        detail: String,
    },
    /// Underlying filesystem failure.
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Corruption { path, detail } => {
                write!(f, "corrupt cache entry {}: {detail}", path.display())
            }
            CacheError::Io { path, source } => {
                write!(f, "cache io error on {}: {source}", path.display())
            }
        }
    }
}

impl Error for CacheError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CacheError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn corruption(path: &Path, detail: impl Into<String>) -> Self {
        CacheError::Corruption {
            path: path.to_path_buf(),
            detail: detail.into(),
        }
    }
}

/// Directory-backed result cache.
pub struct ResultCache {
    root: PathBuf,
}

impl ResultCache {
    /// Opens (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        for section in [
            CacheSection::Embeddings,
            CacheSection::Indexes,
            CacheSection::NnResults,
            CacheSection::Pairs,
            CacheSection::Datasets,
        ] {
            let dir = root.join(section.dir_name());
            fs::create_dir_all(&dir).map_err(|source| CacheError::io(&dir, source))?;
        }
        Ok(Self { root })
    }

    /// Cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the entry for `key` within `section`.
    pub fn entry_path(&self, section: CacheSection, key: &Fingerprint) -> PathBuf {
        self.named_path(section, &key.to_hex())
    }

    fn named_path(&self, section: CacheSection, name: &str) -> PathBuf {
        self.root
            .join(section.dir_name())
            .join(format!("{name}.{}", section.extension()))
    }

    /// Whether a completed entry exists for `key`.
    pub fn contains(&self, section: CacheSection, key: &Fingerprint) -> bool {
        self.entry_path(section, key).is_file()
    }

    /// Loads a binary blob entry, `None` on miss.
    pub fn load_blob<T: DeserializeOwned>(
        &self,
        section: CacheSection,
        key: &Fingerprint,
    ) -> Result<Option<T>, CacheError> {
        let path = self.entry_path(section, key);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(CacheError::io(&path, err)),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|source| CacheError::io(&path, source))?;

        if bytes.len() < BLOB_MAGIC.len() + 4 || &bytes[..BLOB_MAGIC.len()] != BLOB_MAGIC {
            return Err(CacheError::corruption(&path, "missing blob header"));
        }
        let payload = &bytes[BLOB_MAGIC.len()..bytes.len() - 4];
        let tail = &bytes[bytes.len() - 4..];
        let stored_crc = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let mut hasher = Crc32::new();
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            return Err(CacheError::corruption(&path, "crc mismatch"));
        }
        let value = bincode::deserialize(payload)
            .map_err(|err| CacheError::corruption(&path, format!("undecodable payload: {err}")))?;
        Ok(Some(value))
    }

    /// Stores a binary blob entry.
    ///
    /// Returns `true` when the entry was newly written, `false` when a
    /// completed entry already existed (write-once: the existing entry wins).
    pub fn store_blob<T: Serialize>(
        &self,
        section: CacheSection,
        key: &Fingerprint,
        value: &T,
    ) -> Result<bool, CacheError> {
        let path = self.entry_path(section, key);
        let payload = bincode::serialize(value).map_err(|err| {
            CacheError::io(&path, io::Error::new(io::ErrorKind::InvalidData, err))
        })?;
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        self.publish(&path, |out| {
            out.write_all(BLOB_MAGIC)?;
            out.write_all(&payload)?;
            out.write_all(&crc.to_le_bytes())
        })
    }

    /// Loads a JSONL record entry, `None` on miss.
    pub fn load_records<T: DeserializeOwned>(
        &self,
        section: CacheSection,
        key: &Fingerprint,
    ) -> Result<Option<Vec<T>>, CacheError> {
        let path = self.entry_path(section, key);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(CacheError::io(&path, err)),
        };
        let reader = BufReader::new(file);
        let mut rows = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| CacheError::io(&path, source))?;
            if line.trim().is_empty() {
                continue;
            }
            let row = serde_json::from_str(&line).map_err(|err| {
                CacheError::corruption(&path, format!("bad record at line {}: {err}", line_no + 1))
            })?;
            rows.push(row);
        }
        Ok(Some(rows))
    }

    /// Stores a JSONL record entry; write-once like [`ResultCache::store_blob`].
    pub fn store_records<T: Serialize>(
        &self,
        section: CacheSection,
        key: &Fingerprint,
        rows: &[T],
    ) -> Result<bool, CacheError> {
        let path = self.entry_path(section, key);
        self.write_jsonl(&path, rows, false)
    }

    /// Writes a named artifact (e.g. the final dataset), replacing any
    /// previous artifact of the same name.
    pub fn store_named_records<T: Serialize>(
        &self,
        section: CacheSection,
        name: &str,
        rows: &[T],
    ) -> Result<PathBuf, CacheError> {
        let path = self.named_path(section, name);
        self.write_jsonl(&path, rows, true)?;
        Ok(path)
    }

    /// Removes an entry, typically after detecting corruption.
    pub fn discard(&self, section: CacheSection, key: &Fingerprint) -> Result<(), CacheError> {
        let path = self.entry_path(section, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CacheError::io(&path, err)),
        }
    }

    fn write_jsonl<T: Serialize>(
        &self,
        path: &Path,
        rows: &[T],
        replace: bool,
    ) -> Result<bool, CacheError> {
        let wrote = self.publish_inner(path, replace, |out| {
            for row in rows {
                serde_json::to_writer(&mut *out, row)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                out.write_all(b"\n")?;
            }
            Ok(())
        })?;
        Ok(wrote)
    }

    fn publish(
        &self,
        path: &Path,
        write: impl FnOnce(&mut BufWriter<&mut File>) -> io::Result<()>,
    ) -> Result<bool, CacheError> {
        self.publish_inner(path, false, write)
    }

    /// Writes to a temp file in the destination directory, then renames into
    /// place. Entries are content-addressed, so two racing writers produce
    /// identical bytes and a lost rename race is harmless.
    fn publish_inner(
        &self,
        path: &Path,
        replace: bool,
        write: impl FnOnce(&mut BufWriter<&mut File>) -> io::Result<()>,
    ) -> Result<bool, CacheError> {
        if !replace && path.is_file() {
            return Ok(false);
        }
        let dir = path.parent().unwrap_or(&self.root);
        let mut temp =
            NamedTempFile::new_in(dir).map_err(|source| CacheError::io(dir, source))?;
        {
            let mut out = BufWriter::new(temp.as_file_mut());
            write(&mut out).map_err(|source| CacheError::io(path, source))?;
            out.flush().map_err(|source| CacheError::io(path, source))?;
        }
        temp.as_file()
            .sync_all()
            .map_err(|source| CacheError::io(path, source))?;
        temp.persist(path)
            .map_err(|err| CacheError::io(path, err.error))?;
        Ok(true)
    }
}
