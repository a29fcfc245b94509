//! # flashtree — a B+-tree index engine for small devices
//!
//! flashtree stores fixed-size key/value records in a page-oriented B+-tree
//! designed to run correctly on three very different kinds of block storage:
//!
//! - **Files** (byte-addressable): nodes are updated in place.
//! - **NAND-style flash** (erase-before-write, no in-place updates): nodes
//!   are copied on write and a small virtual-mapping table keeps stale
//!   parent pointers resolvable without rewriting every ancestor.
//! - **NOR / dataflash** (bit-clearing overwrites allowed): records are
//!   slotted into pages under free/valid bitmaps so most inserts are a
//!   single in-place page overwrite.
//!
//! The engine allocates all of its memory at initialisation — a fixed frame
//! pool, one block-sized relocation scratch, the free-page map and the
//! mapping table — and performs no allocation on the put/get path.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Tree (put / get / range iteration)       │
//! │   active path · mapping table · codecs   │
//! ├──────────────────────────────────────────┤
//! │ PageBuffer (frames · placement · erase)  │
//! │   free map · erased window · compaction  │
//! ├──────────────────────────────────────────┤
//! │ StorageDriver (file · RAM · flash)       │
//! └──────────────────────────────────────────┘
//! ```
//!
//! The buffer and the tree are mutually recursive by design: placing a page
//! may trigger block compaction, which relocates live pages and calls back
//! into the tree to repair child pointers, which may in turn write pages.
//! The [`buffer::RelocationHooks`] trait carries that contract; hook methods
//! receive the buffer back so the borrow checker, not convention, rules out
//! stale frame pointers.
//!
//! ## Quick start
//!
//! ```no_run
//! use flashtree::{MediaProfile, MemStorage, Mode, Tree, TreeConfig};
//!
//! # fn main() -> eyre::Result<()> {
//! let storage = MemStorage::new(1024, 512, MediaProfile::NandStrict);
//! let config = TreeConfig::small(Mode::CopyOnWrite);
//! let mut tree = Tree::create(config, Box::new(storage))?;
//!
//! tree.put(&7u32.to_le_bytes(), b"hello flash!")?;
//! let mut out = [0u8; 12];
//! assert!(tree.get(&7u32.to_le_bytes(), &mut out)?);
//! # Ok(())
//! # }
//! ```

pub mod bitarr;
pub mod buffer;
pub mod config;
pub mod storage;
pub mod tree;

pub use buffer::{BufferStats, FrameId, PageBuffer, PageStatus, RelocationHooks, SpaceOutcome};
pub use config::{compare_bytes, compare_u32_le, KeyCompare, Mode, TreeConfig};
pub use storage::{FileStorage, MediaProfile, MemStorage, PageId, StorageDriver};
pub use tree::{IterBounds, PutResult, Tree, TreeIterator};
