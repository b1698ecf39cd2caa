// storage/src/wal/mod.rs

//! Commit log.
//!
//! A segmented, append-only log of DDL and committed write sets. Every
//! committed transaction is exactly one frame, so replay applies a
//! transaction either whole or not at all; uncommitted work is never logged.
//!
//! ```text
//! log_dir/
//! ├── txlog.0000000001
//! └── txlog.0000000002     # current segment, started at open or checkpoint
//! ```
//!
//! Frame format:
//!
//! ```text
//! +------------+-------------+----------------------------------+
//! | len u32 LE | crc32 u32 LE | payload: lsn u64 | kind u8 | ... |
//! +------------+-------------+----------------------------------+
//! ```
//!
//! A short or checksum-failing frame at the end of the last segment is a torn
//! write from a crash: replay stops there and the segment is truncated. The
//! same damage in an older segment is a recovery failure.
//!
//! A failed append cuts the segment back to its length before the frame, so
//! later frames never follow a torn one. If that cut fails too the log is
//! poisoned and refuses further appends until the engine is reopened.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes};
use log::{debug, error, warn};
use parking_lot::Mutex;
use tabledb_core::{IndexDefinition, TableSchema};

use crate::transaction::TransactionId;
use crate::{Result, StorageError};

pub type Lsn = u64;

const SEGMENT_PREFIX: &str = "txlog.";
const FRAME_HEADER_SIZE: usize = 8;

mod kind {
    pub const CREATE_TABLE: u8 = 1;
    pub const CREATE_INDEX: u8 = 2;
    pub const DROP_TABLE: u8 = 3;
    pub const COMMIT: u8 = 4;
}

mod op {
    pub const PUT: u8 = 1;
    pub const DELETE: u8 = 2;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Put { table: String, key: Bytes, value: Bytes },
    Delete { table: String, key: Bytes },
}

impl Mutation {
    pub fn table(&self) -> &str {
        match self {
            Mutation::Put { table, .. } | Mutation::Delete { table, .. } => table,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    CreateTable(TableSchema),
    CreateIndex { table: String, index: IndexDefinition },
    DropTable(String),
    Commit {
        transaction_id: TransactionId,
        mutations: Vec<Mutation>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub entry: LogEntry,
}

/// Everything read back from the log directory at startup.
#[derive(Debug, Default)]
pub struct ReplayLog {
    pub records: Vec<LogRecord>,
    pub last_lsn: Lsn,
    pub last_segment: u64,
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| StorageError::RecordTooLarge {
        size: len,
        max: u32::MAX as usize,
    })
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    put_bytes(buf, s.as_bytes())
}

fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) -> Result<()> {
    buf.put_u32_le(len_u32(b.len())?);
    buf.put_slice(b);
    Ok(())
}

fn get_bytes(buf: &mut &[u8]) -> Option<Bytes> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return None;
    }
    let out = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Some(out)
}

fn get_string(buf: &mut &[u8]) -> Option<String> {
    String::from_utf8(get_bytes(buf)?.to_vec()).ok()
}

impl LogRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        payload.put_u64_le(self.lsn);
        match &self.entry {
            LogEntry::CreateTable(schema) => {
                payload.put_u8(kind::CREATE_TABLE);
                put_bytes(&mut payload, &serde_json::to_vec(schema)?)?;
            }
            LogEntry::CreateIndex { table, index } => {
                payload.put_u8(kind::CREATE_INDEX);
                put_str(&mut payload, table)?;
                put_bytes(&mut payload, &serde_json::to_vec(index)?)?;
            }
            LogEntry::DropTable(table) => {
                payload.put_u8(kind::DROP_TABLE);
                put_str(&mut payload, table)?;
            }
            LogEntry::Commit {
                transaction_id,
                mutations,
            } => {
                payload.put_u8(kind::COMMIT);
                payload.put_u64_le(*transaction_id);
                payload.put_u32_le(len_u32(mutations.len())?);
                for mutation in mutations {
                    match mutation {
                        Mutation::Put { table, key, value } => {
                            payload.put_u8(op::PUT);
                            put_str(&mut payload, table)?;
                            put_bytes(&mut payload, key)?;
                            put_bytes(&mut payload, value)?;
                        }
                        Mutation::Delete { table, key } => {
                            payload.put_u8(op::DELETE);
                            put_str(&mut payload, table)?;
                            put_bytes(&mut payload, key)?;
                        }
                    }
                }
            }
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.put_u32_le(len_u32(payload.len())?);
        frame.put_u32_le(crc32fast::hash(&payload));
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decodes a checksum-verified payload. `None` means malformed.
    fn decode_payload(mut buf: &[u8]) -> Option<Self> {
        if buf.remaining() < 9 {
            return None;
        }
        let lsn = buf.get_u64_le();
        let entry = match buf.get_u8() {
            kind::CREATE_TABLE => {
                LogEntry::CreateTable(serde_json::from_slice(&get_bytes(&mut buf)?).ok()?)
            }
            kind::CREATE_INDEX => {
                let table = get_string(&mut buf)?;
                let index = serde_json::from_slice(&get_bytes(&mut buf)?).ok()?;
                LogEntry::CreateIndex { table, index }
            }
            kind::DROP_TABLE => LogEntry::DropTable(get_string(&mut buf)?),
            kind::COMMIT => {
                if buf.remaining() < 12 {
                    return None;
                }
                let transaction_id = buf.get_u64_le();
                let count = buf.get_u32_le() as usize;
                let mut mutations = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    if !buf.has_remaining() {
                        return None;
                    }
                    let mutation = match buf.get_u8() {
                        op::PUT => Mutation::Put {
                            table: get_string(&mut buf)?,
                            key: get_bytes(&mut buf)?,
                            value: get_bytes(&mut buf)?,
                        },
                        op::DELETE => Mutation::Delete {
                            table: get_string(&mut buf)?,
                            key: get_bytes(&mut buf)?,
                        },
                        _ => return None,
                    };
                    mutations.push(mutation);
                }
                LogEntry::Commit {
                    transaction_id,
                    mutations,
                }
            }
            _ => return None,
        };
        if buf.has_remaining() {
            return None;
        }
        Some(LogRecord { lsn, entry })
    }
}

/// What the appender needs from a segment file.
trait SegmentFile: Write {
    fn length(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl SegmentFile for File {
    fn length(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

enum FrameWriteError {
    /// The file is back at its length before the frame.
    RolledBack(io::Error),
    /// Part of the frame may still be in the file.
    Torn { error: io::Error, cleanup: io::Error },
}

/// Appends one frame, syncing if asked. On any failure the file is cut back
/// to where the frame started.
fn write_frame<F: SegmentFile>(file: &mut F, frame: &[u8], sync: bool) -> std::result::Result<(), FrameWriteError> {
    let start = file.length().map_err(FrameWriteError::RolledBack)?;
    let written = file
        .write_all(frame)
        .and_then(|_| if sync { file.sync() } else { Ok(()) });
    match written {
        Ok(()) => Ok(()),
        Err(error) => match file.truncate(start) {
            Ok(()) => Err(FrameWriteError::RolledBack(error)),
            Err(cleanup) => Err(FrameWriteError::Torn { error, cleanup }),
        },
    }
}

struct LogWriter {
    file: File,
    segment: u64,
    next_lsn: Lsn,
    poisoned: Option<String>,
}

impl LogWriter {
    fn check_usable(&self) -> Result<()> {
        match &self.poisoned {
            Some(reason) => Err(StorageError::CommitLogPoisoned(reason.clone())),
            None => Ok(()),
        }
    }
}

pub struct CommitLog {
    dir: PathBuf,
    sync_on_append: bool,
    writer: Mutex<LogWriter>,
}

impl CommitLog {
    fn segment_path(dir: &Path, segment: u64) -> PathBuf {
        dir.join(format!("{}{:010}", SEGMENT_PREFIX, segment))
    }

    fn list_segments(dir: &Path) -> Result<Vec<u64>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut segments = Vec::new();
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            if let Some(seq) = name
                .to_str()
                .and_then(|n| n.strip_prefix(SEGMENT_PREFIX))
                .and_then(|n| n.parse::<u64>().ok())
            {
                segments.push(seq);
            }
        }
        segments.sort_unstable();
        Ok(segments)
    }

    /// Reads every valid record from `dir`, truncating a torn tail in the
    /// newest segment.
    pub fn read_all(dir: &Path) -> Result<ReplayLog> {
        let segments = Self::list_segments(dir)?;
        let mut replay = ReplayLog::default();
        for (pos, &segment) in segments.iter().enumerate() {
            let is_last = pos + 1 == segments.len();
            let path = Self::segment_path(dir, segment);
            let mut data = Vec::new();
            File::open(&path)?.read_to_end(&mut data)?;

            let mut offset = 0usize;
            while offset < data.len() {
                match Self::read_frame(&data[offset..]) {
                    Some((record, consumed)) => {
                        if record.lsn <= replay.last_lsn {
                            return Err(StorageError::RecoveryFailure(format!(
                                "log sequence went backwards at {} in {}",
                                record.lsn,
                                path.display()
                            )));
                        }
                        replay.last_lsn = record.lsn;
                        replay.records.push(record);
                        offset += consumed;
                    }
                    None if is_last => {
                        warn!(
                            "Torn frame at offset {} of {}, truncating {} bytes",
                            offset,
                            path.display(),
                            data.len() - offset
                        );
                        let file = OpenOptions::new().write(true).open(&path)?;
                        file.set_len(offset as u64)?;
                        file.sync_all()?;
                        break;
                    }
                    None => {
                        return Err(StorageError::RecoveryFailure(format!(
                            "corrupt frame at offset {} of {}",
                            offset,
                            path.display()
                        )));
                    }
                }
            }
            replay.last_segment = segment;
        }
        debug!(
            "Read {} log records from {} segments (last lsn {})",
            replay.records.len(),
            segments.len(),
            replay.last_lsn
        );
        Ok(replay)
    }

    fn read_frame(data: &[u8]) -> Option<(LogRecord, usize)> {
        if data.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let mut header = &data[..FRAME_HEADER_SIZE];
        let len = header.get_u32_le() as usize;
        let crc = header.get_u32_le();
        let end = FRAME_HEADER_SIZE.checked_add(len)?;
        if data.len() < end {
            return None;
        }
        let payload = &data[FRAME_HEADER_SIZE..end];
        if crc32fast::hash(payload) != crc {
            return None;
        }
        Some((LogRecord::decode_payload(payload)?, end))
    }

    /// Opens a fresh segment after `last_segment`; the next appended record
    /// gets `next_lsn`.
    pub fn open(dir: &Path, last_segment: u64, next_lsn: Lsn, sync_on_append: bool) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let segment = last_segment + 1;
        let file = Self::create_segment(dir, segment)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            sync_on_append,
            writer: Mutex::new(LogWriter {
                file,
                segment,
                next_lsn,
                poisoned: None,
            }),
        })
    }

    fn create_segment(dir: &Path, segment: u64) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::segment_path(dir, segment))?)
    }

    /// Appends one record. The LSN is consumed only when the frame is fully
    /// written (and synced, if configured).
    pub fn append(&self, entry: LogEntry) -> Result<Lsn> {
        let mut writer = self.writer.lock();
        writer.check_usable()?;
        let record = LogRecord {
            lsn: writer.next_lsn,
            entry,
        };
        let frame = record.encode()?;
        match write_frame(&mut writer.file, &frame, self.sync_on_append) {
            Ok(()) => {
                writer.next_lsn += 1;
                Ok(record.lsn)
            }
            Err(FrameWriteError::RolledBack(e)) => {
                warn!("Append of lsn {} failed, segment rolled back: {}", record.lsn, e);
                Err(e.into())
            }
            Err(FrameWriteError::Torn { error, cleanup }) => {
                let reason = format!(
                    "segment {} at lsn {}: {} (truncate failed: {})",
                    writer.segment, record.lsn, error, cleanup
                );
                error!("Commit log poisoned, {}", reason);
                writer.poisoned = Some(reason.clone());
                Err(StorageError::CommitLogPoisoned(reason))
            }
        }
    }

    /// LSN of the last appended record (0 when nothing was ever logged).
    pub fn last_lsn(&self) -> Lsn {
        self.writer.lock().next_lsn - 1
    }

    pub fn current_segment(&self) -> u64 {
        self.writer.lock().segment
    }

    /// Syncs the current segment and starts a new one; returns the new
    /// segment number.
    pub fn roll(&self) -> Result<u64> {
        let mut writer = self.writer.lock();
        writer.check_usable()?;
        writer.file.sync_all()?;
        let segment = writer.segment + 1;
        writer.file = Self::create_segment(&self.dir, segment)?;
        writer.segment = segment;
        Ok(segment)
    }

    /// Deletes every segment numbered below `segment`.
    pub fn drop_segments_before(&self, segment: u64) -> Result<usize> {
        let mut dropped = 0;
        for seq in Self::list_segments(&self.dir)? {
            if seq < segment {
                fs::remove_file(Self::segment_path(&self.dir, seq))?;
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    pub fn sync(&self) -> Result<()> {
        self.writer.lock().file.sync_all()?;
        Ok(())
    }
}
