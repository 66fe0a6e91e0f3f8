//! Page pool: fixed-size aligned buffers with shared ownership
//!
//! Every cached block and every in-flight I/O buffer is one page. Pages are
//! allocated block-size aligned so the local transport can hand them to
//! direct I/O unchanged.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{UmbraFSError, UmbraFSResult};
use crate::format::constants::BLOCK_SIZE;

/// One block-size buffer, aligned to the block size
pub struct Page {
    ptr: NonNull<u8>,
}

// The pointer is uniquely owned and only aliased through &self/&mut self.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    fn layout() -> Layout {
        // BLOCK_SIZE is a power of two, so this cannot fail
        Layout::from_size_align(BLOCK_SIZE, BLOCK_SIZE).unwrap()
    }

    /// Allocate a zero-filled page
    pub fn zeroed() -> UmbraFSResult<Self> {
        let ptr = unsafe { alloc_zeroed(Self::layout()) };
        match NonNull::new(ptr) {
            Some(ptr) => Ok(Page { ptr }),
            None => Err(UmbraFSError::OutOfMemory),
        }
    }

    /// Page contents
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), BLOCK_SIZE) }
    }

    /// Mutable page contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), BLOCK_SIZE) }
    }

    /// Raw pointer for descriptor-based I/O. The caller must keep the page
    /// alive and unaliased for the duration of the transfer.
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Overwrite the whole page with one byte value
    pub fn fill(&mut self, byte: u8) {
        self.as_mut_slice().fill(byte);
    }

    /// Copy `src` into the page start, zero-filling the tail
    pub fn copy_from(&mut self, src: &[u8]) {
        let n = src.len().min(BLOCK_SIZE);
        let slice = self.as_mut_slice();
        slice[..n].copy_from_slice(&src[..n]);
        slice[n..].fill(0);
    }
}

impl Clone for Page {
    fn clone(&self) -> Self {
        let mut page = Page::zeroed().expect("page allocation failed");
        page.as_mut_slice().copy_from_slice(self.as_slice());
        page
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), Self::layout()) };
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Page({} bytes)", BLOCK_SIZE)
    }
}

/// Pool of reusable pages
///
/// Freed pages are kept on a bounded free list; allocation prefers the list
/// and falls back to the allocator. Pages handed out are always zero-filled.
pub struct PagePool {
    free: Mutex<Vec<Page>>,
    max_free: usize,
    allocated: AtomicU64,
    recycled: AtomicU64,
}

/// Page pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub free_pages: usize,
    pub allocated: u64,
    pub recycled: u64,
}

impl PagePool {
    /// Create a pool keeping at most `max_free` pages on the free list
    pub fn new(max_free: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_free,
            allocated: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
        }
    }

    /// Take a zero-filled page from the pool
    pub fn alloc(&self) -> UmbraFSResult<Page> {
        let recycled = self.free.lock().unwrap().pop();
        match recycled {
            Some(mut page) => {
                self.recycled.fetch_add(1, Ordering::Relaxed);
                page.fill(0);
                Ok(page)
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Page::zeroed()
            }
        }
    }

    /// Return a page to the pool
    pub fn free(&self, page: Page) {
        let mut free = self.free.lock().unwrap();
        if free.len() < self.max_free {
            free.push(page);
        }
        // Otherwise the page is dropped and its memory returned
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            free_pages: self.free.lock().unwrap().len(),
            allocated: self.allocated.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
        }
    }
}

impl Default for PagePool {
    fn default() -> Self {
        // Enough slack for a full local transport queue plus readahead
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_alignment() {
        let page = Page::zeroed().unwrap();
        assert_eq!(page.as_slice().len(), BLOCK_SIZE);
        assert_eq!(page.as_ptr() as usize % BLOCK_SIZE, 0);
    }

    #[test]
    fn test_page_fill_and_copy() {
        let mut page = Page::zeroed().unwrap();
        page.fill(0xAB);
        assert!(page.as_slice().iter().all(|&b| b == 0xAB));

        page.copy_from(b"hello");
        assert_eq!(&page.as_slice()[..5], b"hello");
        assert!(page.as_slice()[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pool_recycles_zeroed() {
        let pool = PagePool::new(4);
        let mut page = pool.alloc().unwrap();
        page.fill(0xFF);
        pool.free(page);

        let page = pool.alloc().unwrap();
        assert!(page.as_slice().iter().all(|&b| b == 0));

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.recycled, 1);
    }

    #[test]
    fn test_pool_bounded_free_list() {
        let pool = PagePool::new(1);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        pool.free(a);
        pool.free(b);
        assert_eq!(pool.stats().free_pages, 1);
    }
}
