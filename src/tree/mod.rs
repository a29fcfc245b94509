//! # B+-Tree Core
//!
//! Ordered fixed-size key/value storage over the page buffer. The tree
//! owns the mapping table and the cached active path; the buffer owns
//! physical placement. Three write disciplines share one node contract:
//!
//! - update-in-place (files): slack inserts rewrite the node at its page,
//! - copy-on-write (NAND): every rewrite relocates, the mapping table
//!   absorbs the ancestor rewrites,
//! - in-page overwrite (NOR): slot bitmaps turn most inserts into a single
//!   same-page overwrite.
//!
//! Module layout follows the data: `node` is the page codec, `mapping` the
//! virtual-mapping table, `tree` the operations, `iter` range iteration.

pub mod mapping;
pub mod node;

mod iter;
#[allow(clippy::module_inception)]
mod tree;

pub use iter::{IterBounds, TreeIterator};
pub use tree::{PutResult, Tree};
