//! Collaborator contract for the page-addressable secondary store.

use bramble_common::page::PageId;
use bramble_common::Result;

/// A byte-addressable page store the buffer pool reads and writes through.
///
/// Implementations provide stable page ids: `allocate_page` hands them out
/// monotonically, and `deallocate_page` returns an id to a freelist from
/// which future allocations may recycle it.
pub trait PageStore: Send + Sync {
    /// Reads a page into the provided buffer.
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()>;

    /// Writes a page from the provided buffer.
    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()>;

    /// Allocates a new page id.
    fn allocate_page(&self) -> Result<PageId>;

    /// Returns a page id to the store's freelist.
    fn deallocate_page(&self, page_id: PageId);
}
