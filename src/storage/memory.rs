//! In-RAM storage driver with media emulation.
//!
//! Beyond serving as a fast test double, this driver can enforce the write
//! discipline of the flash media the engine targets, which turns the
//! erase-before-write invariant into a mechanically checked property:
//!
//! - `NandStrict`: a page may be written exactly once per erase cycle.
//! - `NorOverwrite`: rewrites are legal only if every bit change is 1 -> 0
//!   (`new & old == new`), the rule NOR and dataflash parts obey.
//! - `Unrestricted`: plain RAM, no checks (starts zeroed like a file).
//!
//! Erase fills the range with 0xFF and re-arms the per-page write marks.

use eyre::{bail, ensure, Result};

use crate::bitarr::BitArray;

use super::{PageId, StorageDriver};

/// Which physical medium's write rules to emulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaProfile {
    Unrestricted,
    NandStrict,
    NorOverwrite,
}

pub struct MemStorage {
    data: Vec<u8>,
    /// Pages written since their last erase.
    written: BitArray,
    profile: MediaProfile,
    capacity_pages: u32,
    page_size: usize,
}

impl MemStorage {
    pub fn new(capacity_pages: u32, page_size: usize, profile: MediaProfile) -> Self {
        let fill = match profile {
            MediaProfile::Unrestricted => 0x00,
            _ => 0xFF, // factory-erased flash
        };
        Self {
            data: vec![fill; capacity_pages as usize * page_size],
            written: BitArray::new(capacity_pages as usize, false),
            profile,
            capacity_pages,
            page_size,
        }
    }

    fn page_range(&self, page: PageId) -> std::ops::Range<usize> {
        let start = page as usize * self.page_size;
        start..start + self.page_size
    }

    /// Whether `page` has been written since its last erase.
    pub fn is_written(&self, page: PageId) -> bool {
        self.written.get(page as usize)
    }
}

impl StorageDriver for MemStorage {
    fn read_page(&mut self, page: PageId, page_size: usize, buf: &mut [u8]) -> Result<()> {
        ensure!(
            page < self.capacity_pages,
            "read of page {} beyond capacity {}",
            page,
            self.capacity_pages
        );
        ensure!(page_size == self.page_size, "page size mismatch");
        buf[..page_size].copy_from_slice(&self.data[self.page_range(page)]);
        Ok(())
    }

    fn write_page(&mut self, page: PageId, page_size: usize, buf: &[u8]) -> Result<()> {
        ensure!(
            page < self.capacity_pages,
            "write of page {} beyond capacity {}",
            page,
            self.capacity_pages
        );
        ensure!(page_size == self.page_size, "page size mismatch");

        if self.written.get(page as usize) {
            match self.profile {
                MediaProfile::Unrestricted => {}
                MediaProfile::NandStrict => {
                    bail!("page {page} rewritten without erase on NAND-strict media")
                }
                MediaProfile::NorOverwrite => {
                    let range = self.page_range(page);
                    let old = &self.data[range];
                    for (i, (&n, &o)) in buf[..page_size].iter().zip(old).enumerate() {
                        ensure!(
                            n & o == n,
                            "non-monotone overwrite of page {page} at byte {i}: {o:#04x} -> {n:#04x}"
                        );
                    }
                }
            }
        }

        let range = self.page_range(page);
        self.data[range].copy_from_slice(&buf[..page_size]);
        self.written.set(page as usize);
        Ok(())
    }

    fn erase_pages(&mut self, start: PageId, end: PageId) -> Result<()> {
        ensure!(start <= end, "inverted erase range {start}..={end}");
        ensure!(
            end < self.capacity_pages,
            "erase of page {} beyond capacity {}",
            end,
            self.capacity_pages
        );
        let byte_start = start as usize * self.page_size;
        let byte_end = (end as usize + 1) * self.page_size;
        self.data[byte_start..byte_end].fill(0xFF);
        for p in start..=end {
            self.written.clear(p as usize);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn capacity_pages(&self) -> u32 {
        self.capacity_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erased_pages_read_all_ones() {
        let mut storage = MemStorage::new(4, 64, MediaProfile::NandStrict);
        let mut out = vec![0u8; 64];
        storage.read_page(0, 64, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn nand_strict_rejects_rewrite_without_erase() {
        let mut storage = MemStorage::new(4, 64, MediaProfile::NandStrict);
        let page = vec![0x55u8; 64];
        storage.write_page(1, 64, &page).unwrap();
        assert!(storage.write_page(1, 64, &page).is_err());

        storage.erase_pages(0, 3).unwrap();
        storage.write_page(1, 64, &page).unwrap();
    }

    #[test]
    fn nor_allows_bit_clearing_rewrites_only() {
        let mut storage = MemStorage::new(4, 64, MediaProfile::NorOverwrite);
        let mut page = vec![0xF0u8; 64];
        storage.write_page(2, 64, &page).unwrap();

        // Clearing bits is fine.
        page[0] = 0x70;
        storage.write_page(2, 64, &page).unwrap();

        // Setting a cleared bit back is not.
        page[0] = 0xF0;
        assert!(storage.write_page(2, 64, &page).is_err());
    }

    #[test]
    fn erase_resets_write_marks_and_contents() {
        let mut storage = MemStorage::new(8, 32, MediaProfile::NorOverwrite);
        storage.write_page(5, 32, &vec![0u8; 32]).unwrap();
        assert!(storage.is_written(5));

        storage.erase_pages(4, 7).unwrap();
        assert!(!storage.is_written(5));
        let mut out = vec![0u8; 32];
        storage.read_page(5, 32, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0xFF));
    }
}
