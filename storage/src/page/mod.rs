// storage/src/page/mod.rs

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Buf, BufMut, Bytes};
use parking_lot::RwLock;

use crate::{Result, StorageError};

pub type PageId = u64;

/// Record keys are shared between pages and the primary-key index.
pub type Key = Bytes;

const PAGE_MAGIC: [u8; 4] = *b"TDBP";
const PAGE_FORMAT_VERSION: u16 = 1;

/// Serialized page header:
///
/// ```text
/// magic [4] | version u16 | page_id u64 | record_count u32 | checksum u32
/// ```
pub const PAGE_HEADER_SIZE: usize = 4 + 2 + 8 + 4 + 4;
const CHECKSUM_OFFSET: usize = PAGE_HEADER_SIZE - 4;

/// Per-record framing: key length u32 + value length u32.
pub const RECORD_OVERHEAD: usize = 8;

/// A logical page: an ordered set of records whose serialized form never
/// exceeds `max_size` bytes.
///
/// Only pages that were never flushed are mutated; once a page reaches the
/// page store its content is immutable and the table manager tracks
/// superseded records separately.
pub struct RecordPage {
    id: PageId,
    max_size: usize,
    records: RwLock<BTreeMap<Key, Bytes>>,
    used: AtomicUsize,
}

impl RecordPage {
    pub fn new(id: PageId, max_size: usize) -> Self {
        Self {
            id,
            max_size,
            records: RwLock::new(BTreeMap::new()),
            used: AtomicUsize::new(PAGE_HEADER_SIZE),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn record_size(key: &[u8], value: &[u8]) -> usize {
        RECORD_OVERHEAD + key.len() + value.len()
    }

    /// Largest record an empty page of `max_size` bytes can hold.
    pub fn max_record_size(max_size: usize) -> usize {
        max_size.saturating_sub(PAGE_HEADER_SIZE)
    }

    /// Serialized size in bytes, header included.
    pub fn serialized_size(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.records.read().get(key).cloned()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.records.read().contains_key(key)
    }

    /// Inserts or replaces a record. Returns `false`, leaving the page
    /// untouched, when the result would exceed the page size.
    pub fn try_put(&self, key: Key, value: Bytes) -> bool {
        let mut records = self.records.write();
        let replaced = records
            .get(&key)
            .map(|old| Self::record_size(&key, old))
            .unwrap_or(0);
        let added = Self::record_size(&key, &value);
        let used = self.used.load(Ordering::Acquire);
        if used - replaced + added > self.max_size {
            return false;
        }
        records.insert(key, value);
        self.used.store(used - replaced + added, Ordering::Release);
        true
    }

    pub fn remove(&self, key: &[u8]) -> Option<Bytes> {
        let mut records = self.records.write();
        let removed = records.remove(key)?;
        self.used
            .fetch_sub(Self::record_size(key, &removed), Ordering::AcqRel);
        Some(removed)
    }

    /// Copies out every record, in key order.
    pub fn entries(&self) -> Vec<(Key, Bytes)> {
        self.records
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn fill_percentage(&self) -> f32 {
        (self.serialized_size() as f32 / self.max_size as f32) * 100.0
    }

    pub fn serialize(&self) -> Vec<u8> {
        let records = self.records.read();
        let mut buf = Vec::with_capacity(self.serialized_size());
        buf.put_slice(&PAGE_MAGIC);
        buf.put_u16_le(PAGE_FORMAT_VERSION);
        buf.put_u64_le(self.id);
        buf.put_u32_le(records.len() as u32);
        buf.put_u32_le(0); // checksum placeholder
        for (key, value) in records.iter() {
            buf.put_u32_le(key.len() as u32);
            buf.put_u32_le(value.len() as u32);
            buf.put_slice(key);
            buf.put_slice(value);
        }
        let checksum = Self::checksum(&buf);
        buf[CHECKSUM_OFFSET..PAGE_HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parses a stored page image, verifying magic, id and checksum.
    pub fn deserialize(table: &str, id: PageId, data: &[u8], max_size: usize) -> Result<Self> {
        let corrupt = |reason: String| StorageError::CorruptPage {
            table: table.to_string(),
            page_id: id,
            reason,
        };

        if data.len() < PAGE_HEADER_SIZE {
            return Err(corrupt(format!("{} bytes is shorter than a header", data.len())));
        }
        let mut header = &data[..PAGE_HEADER_SIZE];
        if header[..4] != PAGE_MAGIC {
            return Err(corrupt("wrong magic number".to_string()));
        }
        header.advance(4);
        let version = header.get_u16_le();
        if version > PAGE_FORMAT_VERSION {
            return Err(corrupt(format!("unsupported page version {}", version)));
        }
        let stored_id = header.get_u64_le();
        if stored_id != id {
            return Err(corrupt(format!("page carries id {}", stored_id)));
        }
        let count = header.get_u32_le() as usize;
        let stored_checksum = header.get_u32_le();
        if Self::checksum(data) != stored_checksum {
            return Err(StorageError::ChecksumMismatch(id));
        }

        let mut records = BTreeMap::new();
        let mut body = &data[PAGE_HEADER_SIZE..];
        for _ in 0..count {
            if body.remaining() < RECORD_OVERHEAD {
                return Err(corrupt("truncated record header".to_string()));
            }
            let key_len = body.get_u32_le() as usize;
            let value_len = body.get_u32_le() as usize;
            if body.remaining() < key_len + value_len {
                return Err(corrupt("truncated record".to_string()));
            }
            let key = Bytes::copy_from_slice(&body[..key_len]);
            body.advance(key_len);
            let value = Bytes::copy_from_slice(&body[..value_len]);
            body.advance(value_len);
            records.insert(key, value);
        }
        if body.has_remaining() {
            return Err(corrupt(format!("{} trailing bytes", body.remaining())));
        }

        Ok(Self {
            id,
            max_size,
            records: RwLock::new(records),
            used: AtomicUsize::new(data.len()),
        })
    }

    /// CRC32 over the whole image with the checksum field skipped.
    fn checksum(data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data[..CHECKSUM_OFFSET]);
        hasher.update(&data[PAGE_HEADER_SIZE..]);
        hasher.finalize()
    }
}

impl std::fmt::Debug for RecordPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordPage")
            .field("id", &self.id)
            .field("records", &self.len())
            .field("serialized_size", &self.serialized_size())
            .field("max_size", &self.max_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_page_creation() {
        let page = RecordPage::new(42, 4096);
        assert_eq!(page.id(), 42);
        assert!(page.is_empty());
        assert_eq!(page.serialized_size(), PAGE_HEADER_SIZE);
    }

    #[test]
    fn test_put_get_and_replace() {
        let page = RecordPage::new(1, 4096);
        assert!(page.try_put(b("k1"), b("Hello, World!")));
        assert!(page.try_put(b("k2"), b("Second record with more data")));
        assert_eq!(page.get(b"k1").unwrap(), b("Hello, World!"));

        let before = page.serialized_size();
        assert!(page.try_put(b("k1"), b("short")));
        assert_eq!(page.len(), 2);
        assert_eq!(page.serialized_size(), before - "Hello, World!".len() + "short".len());
    }

    #[test]
    fn test_remove_reclaims_space() {
        let page = RecordPage::new(1, 4096);
        page.try_put(b("gone"), b("Delete me"));
        assert_eq!(page.remove(b"gone").unwrap(), b("Delete me"));
        assert!(page.get(b"gone").is_none());
        assert_eq!(page.serialized_size(), PAGE_HEADER_SIZE);
        assert!(page.remove(b"gone").is_none());
    }

    #[test]
    fn test_page_fills_up() {
        let page = RecordPage::new(1, 1024);
        let value = Bytes::from(vec![b'X'; 100]);
        let mut count = 0;
        while page.try_put(Bytes::from(format!("key{:04}", count)), value.clone()) {
            count += 1;
        }
        // (1024 - 22) / (8 + 7 + 100)
        assert_eq!(count, 8);
        assert!(page.serialized_size() <= 1024);
        assert!(page.fill_percentage() > 85.0);
    }

    #[test]
    fn test_serialized_image_matches_accounted_size() {
        let page = RecordPage::new(9, 4096);
        page.try_put(b("a"), b("1"));
        page.try_put(b("b"), b("22"));
        let image = page.serialize();
        assert_eq!(image.len(), page.serialized_size());

        let loaded = RecordPage::deserialize("t", 9, &image, 4096).unwrap();
        assert_eq!(loaded.entries(), page.entries());
        assert_eq!(loaded.serialized_size(), image.len());
    }

    #[test]
    fn test_flipped_byte_fails_checksum() {
        let page = RecordPage::new(3, 4096);
        page.try_put(b("key"), b("value"));
        let mut image = page.serialize();
        let last = image.len() - 1;
        image[last] ^= 0xFF;
        assert!(matches!(
            RecordPage::deserialize("t", 3, &image, 4096),
            Err(StorageError::ChecksumMismatch(3))
        ));
    }

    #[test]
    fn test_wrong_page_id_is_corrupt() {
        let image = RecordPage::new(3, 4096).serialize();
        assert!(matches!(
            RecordPage::deserialize("t", 4, &image, 4096),
            Err(StorageError::CorruptPage { page_id: 4, .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_serialized_size_never_exceeds_max(
            ops in proptest::collection::vec((0u8..32, 0usize..300, any::<bool>()), 1..200),
            max in 128usize..2048,
        ) {
            let page = RecordPage::new(1, max);
            for (k, len, remove) in ops {
                let key = Bytes::from(vec![k]);
                if remove {
                    page.remove(&key);
                } else {
                    page.try_put(key, Bytes::from(vec![0xAB; len]));
                }
                prop_assert!(page.serialized_size() <= max);
            }
            prop_assert_eq!(page.serialize().len(), page.serialized_size());
        }
    }
}
