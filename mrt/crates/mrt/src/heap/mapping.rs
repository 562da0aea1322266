//! Heap Mapping - Anonymous memory backing the managed heap
//!
//! One page-aligned anonymous mapping is reserved at start-up through
//! memmap2. The runtime addresses it only through raw object addresses, so
//! the mapping hands out its base once and keeps the handle alive.

use crate::error::{MrtError, Result};
use memmap2::{MmapMut, MmapOptions};

/// Round `size` up to the system page size
pub fn align_to_page(size: usize) -> usize {
    let page = page_size::get();
    size.div_ceil(page).max(1) * page
}

/// HeapMapping - owner of an anonymous mapping
pub struct HeapMapping {
    /// Keeps the mapping alive; memory is accessed through `base`
    _mmap: MmapMut,
    base: usize,
    size: usize,
}

impl HeapMapping {
    /// Create anonymous memory mapping
    ///
    /// Memory is zero-initialised by the OS.
    ///
    /// # Arguments
    /// * `size` - Size in bytes (rounded up to page boundary)
    pub fn anonymous(size: usize) -> Result<Self> {
        let aligned_size = align_to_page(size);

        let mut mmap = MmapOptions::new()
            .len(aligned_size)
            .map_anon()
            .map_err(|e| {
                MrtError::HeapInitialization(format!("Failed to create anonymous mapping: {}", e))
            })?;

        let base = mmap.as_mut_ptr() as usize;

        Ok(Self {
            _mmap: mmap,
            base,
            size: aligned_size,
        })
    }

    /// Base address of the mapping
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size of the mapping in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last mapped byte
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Check if address is inside the mapping
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }
}

// The raw base is only dereferenced under the heap's allocation protocol.
unsafe impl Send for HeapMapping {}
unsafe impl Sync for HeapMapping {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_mapping_creation() {
        let mapping = HeapMapping::anonymous(4096).unwrap();
        assert!(mapping.size() >= 4096);
        assert_eq!(mapping.size() % page_size::get(), 0);
        assert!(mapping.contains(mapping.base()));
        assert!(!mapping.contains(mapping.end()));
    }

    #[test]
    fn test_mapping_is_zeroed_and_writable() {
        let mapping = HeapMapping::anonymous(8192).unwrap();
        unsafe {
            let p = mapping.base() as *mut u64;
            assert_eq!(*p, 0);
            *p = 0xFEED;
            assert_eq!(*p, 0xFEED);
        }
    }

    #[test]
    fn test_align_to_page() {
        let page = page_size::get();
        assert_eq!(align_to_page(1), page);
        assert_eq!(align_to_page(page), page);
        assert_eq!(align_to_page(page + 1), 2 * page);
    }
}
