//! The header page: a record table mapping index names to root page ids.
//!
//! Page 0 of the data file is reserved for this table. Each record is a
//! fixed 36 bytes: a zero-padded 32-byte name followed by the root page
//! id. The tree writes a record whenever its root changes, so an index
//! can be reopened by name.

use bramble_common::page::{PageId, PAGE_SIZE};
use bramble_common::{BrambleError, Result};

const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;

/// Maximum number of index records the header page can hold.
pub const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

fn padded_name(name: &str) -> [u8; NAME_SIZE] {
    let mut padded = [0u8; NAME_SIZE];
    let bytes = name.as_bytes();
    let len = bytes.len().min(NAME_SIZE);
    padded[..len].copy_from_slice(&bytes[..len]);
    padded
}

fn record_offset(index: usize) -> usize {
    RECORDS_OFFSET + index * RECORD_SIZE
}

fn record_count(data: &[u8]) -> usize {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize
}

fn find_record(data: &[u8], name: &[u8; NAME_SIZE]) -> Option<usize> {
    (0..record_count(data)).find(|&i| {
        let off = record_offset(i);
        &data[off..off + NAME_SIZE] == name
    })
}

/// Read-only view of the header page.
pub struct Header<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Number of registered indexes.
    pub fn record_count(&self) -> usize {
        record_count(self.data)
    }

    /// Looks up the root page id recorded for an index name.
    pub fn get_root(&self, name: &str) -> Option<PageId> {
        let padded = padded_name(name);
        find_record(self.data, &padded).map(|i| {
            let off = record_offset(i) + NAME_SIZE;
            PageId(u32::from_le_bytes([
                self.data[off],
                self.data[off + 1],
                self.data[off + 2],
                self.data[off + 3],
            ]))
        })
    }
}

/// Mutable view of the header page.
pub struct HeaderMut<'a> {
    data: &'a mut [u8],
}

impl<'a> HeaderMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    /// Records the root page id for an index name, updating the existing
    /// record or appending a new one. Idempotent across sessions.
    pub fn put_root(&mut self, name: &str, root: PageId) -> Result<()> {
        let padded = padded_name(name);

        let index = match find_record(self.data, &padded) {
            Some(i) => i,
            None => {
                let count = record_count(self.data);
                if count >= MAX_RECORDS {
                    return Err(BrambleError::HeaderFull);
                }
                let off = record_offset(count);
                self.data[off..off + NAME_SIZE].copy_from_slice(&padded);
                self.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4]
                    .copy_from_slice(&(count as u32 + 1).to_le_bytes());
                count
            }
        };

        let off = record_offset(index) + NAME_SIZE;
        self.data[off..off + 4].copy_from_slice(&root.0.to_le_bytes());
        Ok(())
    }
}
