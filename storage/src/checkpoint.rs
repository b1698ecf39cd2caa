//! Checkpoint files.
//!
//! A checkpoint of a table-space is two kinds of files:
//!
//! ```text
//! <data_dir>/<tablespace>/
//! ├── checkpoint.json                  # CheckpointMetadata, replaced atomically
//! ├── tables/<table>.<lsn>/
//! │   └── 0000000000000004.page        # page images (see `file`)
//! └── snapshots/<table>.<lsn>/
//!     └── pk.0000000000000042.idx      # key -> page snapshot taken at lsn 42
//! ```
//!
//! `<table>.<lsn>` is the storage key of a table: its name plus the lsn of
//! the log record that created it, so a re-created table never shares files
//! with its predecessor.
//!
//! Key snapshot format, little-endian:
//!
//! ```text
//! magic "TDBK" | version u16 | lsn u64 | count u64
//! count x ( key_len u32 | key | page_id u64 )
//! crc32 u32 over everything before it
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes};
use serde::{Deserialize, Serialize};
use tabledb_core::TableSchema;

use crate::page::{Key, PageId};
use crate::table::PageMeta;
use crate::transaction::TransactionId;
use crate::wal::Lsn;
use crate::{Result, StorageError};

pub const METADATA_FILE: &str = "checkpoint.json";
const SNAPSHOT_MAGIC: [u8; 4] = *b"TDBK";
const SNAPSHOT_VERSION: u16 = 1;
const SNAPSHOT_PREFIX: &str = "pk.";
const SNAPSHOT_EXTENSION: &str = "idx";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCheckpoint {
    pub schema: TableSchema,
    pub storage_key: String,
    pub next_page_id: PageId,
    pub pages: Vec<PageMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Every log record up to and including this lsn is reflected in the
    /// checkpoint.
    pub lsn: Lsn,
    pub next_transaction_id: TransactionId,
    pub tables: Vec<TableCheckpoint>,
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    // Directory fsync is not available everywhere; a failure is not fatal.
    match File::open(dir) {
        Ok(d) => d.sync_all().or(Ok(())),
        Err(_) => Ok(()),
    }
}

/// Writes `data` to `path` through a temp file and rename.
fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

pub fn write_metadata(dir: &Path, metadata: &CheckpointMetadata) -> Result<()> {
    fs::create_dir_all(dir)?;
    let json = serde_json::to_vec_pretty(metadata)?;
    write_atomically(&dir.join(METADATA_FILE), &json)
}

/// `None` when the table-space was never checkpointed.
pub fn read_metadata(dir: &Path) -> Result<Option<CheckpointMetadata>> {
    let path = dir.join(METADATA_FILE);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| StorageError::RecoveryFailure(format!("unreadable {}: {}", path.display(), e)))
}

pub fn snapshot_path(table_dir: &Path, lsn: Lsn) -> PathBuf {
    table_dir.join(format!("{}{:016}.{}", SNAPSHOT_PREFIX, lsn, SNAPSHOT_EXTENSION))
}

fn parse_snapshot_name(path: &Path) -> Option<Lsn> {
    if path.extension()?.to_str()? != SNAPSHOT_EXTENSION {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(SNAPSHOT_PREFIX)?
        .parse()
        .ok()
}

pub fn write_key_snapshot(table_dir: &Path, lsn: Lsn, keys: &[(Key, PageId)]) -> Result<()> {
    fs::create_dir_all(table_dir)?;
    let size: usize = keys.iter().map(|(k, _)| k.len() + 12).sum();
    let mut buf = Vec::with_capacity(26 + size);
    buf.put_slice(&SNAPSHOT_MAGIC);
    buf.put_u16_le(SNAPSHOT_VERSION);
    buf.put_u64_le(lsn);
    buf.put_u64_le(keys.len() as u64);
    for (key, page_id) in keys {
        buf.put_u32_le(key.len() as u32);
        buf.put_slice(key);
        buf.put_u64_le(*page_id);
    }
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    write_atomically(&snapshot_path(table_dir, lsn), &buf)
}

pub fn read_key_snapshot(table_dir: &Path, lsn: Lsn) -> Result<Vec<(Key, PageId)>> {
    let path = snapshot_path(table_dir, lsn);
    let failure = |reason: &str| {
        StorageError::RecoveryFailure(format!("key snapshot {}: {}", path.display(), reason))
    };

    let mut data = Vec::new();
    File::open(&path)
        .and_then(|mut f| f.read_to_end(&mut data))
        .map_err(|e| failure(&e.to_string()))?;
    if data.len() < 26 {
        return Err(failure("truncated header"));
    }
    let (body, mut trailer) = data.split_at(data.len() - 4);
    if crc32fast::hash(body) != trailer.get_u32_le() {
        return Err(failure("checksum mismatch"));
    }

    let mut buf = body;
    if buf[..4] != SNAPSHOT_MAGIC {
        return Err(failure("wrong magic number"));
    }
    buf.advance(4);
    let version = buf.get_u16_le();
    if version > SNAPSHOT_VERSION {
        return Err(failure(&format!("unsupported version {}", version)));
    }
    if buf.get_u64_le() != lsn {
        return Err(failure("lsn does not match file name"));
    }
    let count = buf.get_u64_le() as usize;
    let mut keys = Vec::with_capacity(count.min(1 << 20));
    for _ in 0..count {
        if buf.remaining() < 4 {
            return Err(failure("truncated entry"));
        }
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len + 8 {
            return Err(failure("truncated entry"));
        }
        let key = Bytes::copy_from_slice(&buf[..len]);
        buf.advance(len);
        keys.push((key, buf.get_u64_le()));
    }
    if buf.has_remaining() {
        return Err(failure("trailing bytes"));
    }
    Ok(keys)
}

/// Removes key snapshots other than the one taken at `keep`.
pub fn purge_snapshots(table_dir: &Path, keep: Lsn) -> Result<usize> {
    if !table_dir.exists() {
        return Ok(0);
    }
    let mut purged = 0;
    for entry in fs::read_dir(table_dir)? {
        let path = entry?.path();
        if matches!(parse_snapshot_name(&path), Some(lsn) if lsn != keep) {
            fs::remove_file(&path)?;
            purged += 1;
        }
    }
    Ok(purged)
}
