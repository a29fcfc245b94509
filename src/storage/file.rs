//! File-backed storage driver.
//!
//! Pages map to fixed offsets in a single file, which is extended to full
//! capacity at creation so reads of never-written pages return zero bytes.
//! Files have no erase-before-write constraint, so `erase_pages` is a no-op;
//! the page buffer still runs its compaction cycle on top of this driver
//! when the configured mode asks for it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};

use super::{PageId, StorageDriver};

pub struct FileStorage {
    file: File,
    capacity_pages: u32,
    page_size: usize,
}

impl FileStorage {
    /// Creates (or truncates) the backing file sized to `capacity_pages`.
    pub fn create(path: &Path, capacity_pages: u32, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create storage file {}", path.display()))?;
        file.set_len(capacity_pages as u64 * page_size as u64)
            .wrap_err("failed to size storage file")?;
        Ok(Self {
            file,
            capacity_pages,
            page_size,
        })
    }

    /// Opens an existing backing file; capacity is derived from its length.
    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open storage file {}", path.display()))?;
        let len = file.metadata().wrap_err("failed to stat storage file")?.len();
        ensure!(
            len % page_size as u64 == 0,
            "storage file length {} is not a multiple of page size {}",
            len,
            page_size
        );
        Ok(Self {
            file,
            capacity_pages: (len / page_size as u64) as u32,
            page_size,
        })
    }

    fn seek_to(&mut self, page: PageId) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(page as u64 * self.page_size as u64))
            .wrap_err_with(|| format!("failed to seek to page {page}"))?;
        Ok(())
    }
}

impl StorageDriver for FileStorage {
    fn read_page(&mut self, page: PageId, page_size: usize, buf: &mut [u8]) -> Result<()> {
        ensure!(
            page < self.capacity_pages,
            "read of page {} beyond capacity {}",
            page,
            self.capacity_pages
        );
        ensure!(page_size == self.page_size, "page size mismatch");
        self.seek_to(page)?;
        self.file
            .read_exact(&mut buf[..page_size])
            .wrap_err_with(|| format!("failed to read page {page}"))?;
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
        self.seek_to(page)?;
        self.file
            .write_all(&buf[..page_size])
            .wrap_err_with(|| format!("failed to write page {page}"))?;
        Ok(())
    }

    fn erase_pages(&mut self, _start: PageId, _end: PageId) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data().wrap_err("failed to sync storage file")
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }

    fn capacity_pages(&self) -> u32 {
        self.capacity_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_pages_at_fixed_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.bin");
        let mut storage = FileStorage::create(&path, 8, 512).unwrap();

        let page_a = vec![0xAB; 512];
        let page_b = vec![0x17; 512];
        storage.write_page(3, 512, &page_a).unwrap();
        storage.write_page(7, 512, &page_b).unwrap();

        let mut out = vec![0u8; 512];
        storage.read_page(3, 512, &mut out).unwrap();
        assert_eq!(out, page_a);
        storage.read_page(7, 512, &mut out).unwrap();
        assert_eq!(out, page_b);
    }

    #[test]
    fn unwritten_pages_read_as_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.bin");
        let mut storage = FileStorage::create(&path, 4, 256).unwrap();

        let mut out = vec![0xFFu8; 256];
        storage.read_page(2, 256, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.bin");
        let mut storage = FileStorage::create(&path, 4, 256).unwrap();

        let buf = vec![0u8; 256];
        assert!(storage.write_page(4, 256, &buf).is_err());
        let mut out = vec![0u8; 256];
        assert!(storage.read_page(9, 256, &mut out).is_err());
    }

    #[test]
    fn reopen_preserves_contents_and_capacity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.bin");
        {
            let mut storage = FileStorage::create(&path, 6, 128).unwrap();
            storage.write_page(5, 128, &vec![9u8; 128]).unwrap();
            storage.close().unwrap();
        }
        let mut reopened = FileStorage::open(&path, 128).unwrap();
        assert_eq!(reopened.capacity_pages(), 6);
        let mut out = vec![0u8; 128];
        reopened.read_page(5, 128, &mut out).unwrap();
        assert_eq!(out, vec![9u8; 128]);
    }
}
