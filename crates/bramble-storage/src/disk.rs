//! Disk manager for page-level file I/O.

use bramble_buffer::PageStore;
use bramble_common::page::{PageId, PAGE_SIZE};
use bramble_common::{BrambleError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Path of the data file.
    pub data_path: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./data/bramble.db"),
            fsync_enabled: true,
        }
    }
}

/// State of the open data file.
struct DataFile {
    file: File,
    /// Number of pages the file has been extended to.
    num_pages: u32,
}

/// Manages reading and writing pages of a single data file.
///
/// Page ids are allocated monotonically by extending the file; deallocated
/// ids go to a freelist and are handed out again before the file grows.
/// Page 0 is reserved for the header page and created with the file.
pub struct DiskManager {
    config: DiskManagerConfig,
    data: Mutex<DataFile>,
    free_pages: Mutex<Vec<PageId>>,
}

impl DiskManager {
    /// Opens or creates the data file.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        if let Some(parent) = config.data_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.data_path)?;

        let file_size = file.metadata()?.len();
        let mut data = DataFile {
            file,
            num_pages: (file_size / PAGE_SIZE as u64) as u32,
        };

        // A fresh file reserves page 0 for the header page.
        if data.num_pages == 0 {
            data.file.seek(SeekFrom::Start(0))?;
            data.file.write_all(&[0u8; PAGE_SIZE])?;
            if config.fsync_enabled {
                data.file.sync_all()?;
            }
            data.num_pages = 1;
        }

        Ok(Self {
            config,
            data: Mutex::new(data),
            free_pages: Mutex::new(Vec::new()),
        })
    }

    /// Returns the data file path.
    pub fn data_path(&self) -> &Path {
        &self.config.data_path
    }

    /// Returns the number of pages in the file.
    pub fn num_pages(&self) -> u32 {
        self.data.lock().num_pages
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.data.lock().file.sync_all()?;
        Ok(())
    }
}

impl PageStore for DiskManager {
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        let mut data = self.data.lock();
        if !page_id.is_valid() || page_id.0 >= data.num_pages {
            return Err(BrambleError::PageOutOfBounds(page_id));
        }

        data.file.seek(SeekFrom::Start(page_id.file_offset()))?;
        data.file.read_exact(&mut buf[..PAGE_SIZE])?;
        Ok(())
    }

    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        if !page_id.is_valid() {
            return Err(BrambleError::PageOutOfBounds(page_id));
        }

        data.file.seek(SeekFrom::Start(page_id.file_offset()))?;
        data.file.write_all(&buf[..PAGE_SIZE])?;
        if self.config.fsync_enabled {
            data.file.sync_all()?;
        }

        // Writing past the end extends the file.
        if page_id.0 >= data.num_pages {
            data.num_pages = page_id.0 + 1;
        }
        Ok(())
    }

    fn allocate_page(&self) -> Result<PageId> {
        if let Some(page_id) = self.free_pages.lock().pop() {
            return Ok(page_id);
        }

        let mut data = self.data.lock();
        let page_id = PageId(data.num_pages);

        // Extend the file with a zeroed page.
        data.file.seek(SeekFrom::Start(page_id.file_offset()))?;
        data.file.write_all(&[0u8; PAGE_SIZE])?;
        if self.config.fsync_enabled {
            data.file.sync_all()?;
        }
        data.num_pages = page_id.0 + 1;

        Ok(page_id)
    }

    fn deallocate_page(&self, page_id: PageId) {
        self.free_pages.lock().push(page_id);
    }
}
