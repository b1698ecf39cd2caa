// storage/src/file/mod.rs

//! Page store: durable home of serialized page images.
//!
//! Every flushed page is written exactly once under its own id; page ids are
//! never reused, so a page referenced by the last checkpoint is never
//! overwritten by later flushes.

mod memory;

pub use memory::MemoryPageStore;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::page::PageId;
use crate::Result;

const PAGE_FILE_EXTENSION: &str = "page";

pub trait PageStore: Send + Sync {
    fn write_page(&self, table: &str, page_id: PageId, data: &[u8]) -> Result<()>;

    fn read_page(&self, table: &str, page_id: PageId) -> Result<Vec<u8>>;

    fn delete_page(&self, table: &str, page_id: PageId) -> Result<()>;

    /// Ids of every page image stored for `table`, in ascending order.
    fn list_pages(&self, table: &str) -> Result<Vec<PageId>>;

    /// Removes every page of `table`.
    fn drop_table(&self, table: &str) -> Result<()>;

    /// Every table that has pages stored, sorted.
    fn list_tables(&self) -> Result<Vec<String>>;
}

/// One file per page under `<root>/<table>/`.
pub struct FilePageStore {
    root: PathBuf,
}

impl FilePageStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    fn page_path(&self, table: &str, page_id: PageId) -> PathBuf {
        self.table_dir(table)
            .join(format!("{:016}.{}", page_id, PAGE_FILE_EXTENSION))
    }

    fn parse_page_file(path: &Path) -> Option<PageId> {
        if path.extension()?.to_str()? != PAGE_FILE_EXTENSION {
            return None;
        }
        path.file_stem()?.to_str()?.parse().ok()
    }
}

impl PageStore for FilePageStore {
    fn write_page(&self, table: &str, page_id: PageId, data: &[u8]) -> Result<()> {
        let dir = self.table_dir(table);
        fs::create_dir_all(&dir)?;

        // Write to a temp name and rename so a torn write never leaves a
        // half-written page under a valid id.
        let path = self.page_path(table, page_id);
        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(data)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_page(&self, table: &str, page_id: PageId) -> Result<Vec<u8>> {
        let mut file = File::open(self.page_path(table, page_id))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    fn delete_page(&self, table: &str, page_id: PageId) -> Result<()> {
        match fs::remove_file(self.page_path(table, page_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_pages(&self, table: &str) -> Result<Vec<PageId>> {
        let dir = self.table_dir(table);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if let Some(id) = Self::parse_page_file(&path) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        match fs::remove_dir_all(self.table_dir(table)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        let mut tables = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    tables.push(name.to_string());
                }
            }
        }
        tables.sort();
        Ok(tables)
    }
}
