//! # Engine Configuration
//!
//! Everything the engine needs to know before it allocates: page geometry,
//! record geometry, buffering, erase-block size, storage mode and the key
//! comparator. All memory budgets derive from these values at `Tree::create`
//! time; nothing here changes after initialisation.
//!
//! ## Knob relationships
//!
//! ```text
//! page_size ─┬─> sorted capacity   = (page_size - header) / record_size
//!            └─> overwrite capacity = (page_size - header) * 8
//!                                     / (record_size * 8 + 2)
//! buffer_frames      >= 2   (frame 0 is scratch; frame 1 serves the root
//!                            once at least 3 frames exist)
//! erase_block_pages  >= 1   and must divide the driver's capacity
//! mapping_bytes            only meaningful in copy-on-write mode;
//!                           8 bytes per mapping slot
//! ```

use std::cmp::Ordering;

use eyre::{ensure, Result};

/// How the engine is allowed to touch previously written pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Byte-addressable media (files): nodes are rewritten at the same
    /// physical page.
    UpdateInPlace,
    /// Erase-before-write media (NAND): every rewrite goes to a fresh page
    /// and the mapping table redirects stale parent pointers.
    CopyOnWrite,
    /// NOR/dataflash: a written page may be rewritten as long as every bit
    /// change is 1 -> 0, which the slot bitmaps exploit.
    InPageOverwrite,
}

impl Mode {
    /// Whether reclaiming space requires block erases.
    pub fn requires_erase(self) -> bool {
        !matches!(self, Mode::UpdateInPlace)
    }

    /// Fill byte for a freshly initialised frame: erased NOR reads all-ones,
    /// the sorted layouts start from zeroed pages.
    pub fn erased_fill(self) -> u8 {
        match self {
            Mode::InPageOverwrite => 0xFF,
            _ => 0x00,
        }
    }

    /// Whether nodes use the bitmap/unsorted record layout.
    pub fn overwrite_layout(self) -> bool {
        matches!(self, Mode::InPageOverwrite)
    }
}

/// Total order over fixed-size key byte strings.
pub type KeyCompare = fn(&[u8], &[u8]) -> Ordering;

/// Compares 4-byte little-endian unsigned keys.
pub fn compare_u32_le(a: &[u8], b: &[u8]) -> Ordering {
    let ka = u32::from_le_bytes(a[..4].try_into().unwrap());
    let kb = u32::from_le_bytes(b[..4].try_into().unwrap());
    ka.cmp(&kb)
}

/// Lexicographic byte comparison.
pub fn compare_bytes(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Static configuration for one tree instance.
#[derive(Clone)]
pub struct TreeConfig {
    pub page_size: usize,
    pub key_size: usize,
    pub data_size: usize,
    pub buffer_frames: usize,
    pub erase_block_pages: usize,
    pub mode: Mode,
    /// Mapping-table budget in bytes; 0 disables the table.
    pub mapping_bytes: usize,
    pub compare: KeyCompare,
}

impl std::fmt::Debug for TreeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeConfig")
            .field("page_size", &self.page_size)
            .field("key_size", &self.key_size)
            .field("data_size", &self.data_size)
            .field("buffer_frames", &self.buffer_frames)
            .field("erase_block_pages", &self.erase_block_pages)
            .field("mode", &self.mode)
            .field("mapping_bytes", &self.mapping_bytes)
            .finish()
    }
}

impl TreeConfig {
    /// A 512-byte-page configuration matching the reference workloads:
    /// 4-byte keys, 12-byte values, 3 frames, 8-page erase blocks.
    pub fn small(mode: Mode) -> Self {
        Self {
            page_size: 512,
            key_size: 4,
            data_size: 12,
            buffer_frames: 3,
            erase_block_pages: 8,
            mode,
            mapping_bytes: if mode == Mode::CopyOnWrite { 1024 } else { 0 },
            compare: compare_u32_le,
        }
    }

    pub fn record_size(&self) -> usize {
        self.key_size + self.data_size
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.key_size > 0, "key size must be non-zero");
        ensure!(self.data_size > 0, "data size must be non-zero");
        ensure!(
            self.buffer_frames >= 2,
            "need at least 2 buffer frames, got {}",
            self.buffer_frames
        );
        ensure!(
            self.erase_block_pages >= 1,
            "erase block must be at least one page"
        );
        ensure!(
            self.page_size >= 64 && self.page_size % 2 == 0,
            "unsupported page size {}",
            self.page_size
        );
        if self.mode != Mode::CopyOnWrite {
            ensure!(
                self.mapping_bytes == 0,
                "mapping table is only used in copy-on-write mode"
            );
        }
        Ok(())
    }
}
