//! # Page Buffer and Space Manager
//!
//! A fixed pool of page frames fronts the storage driver and owns every
//! physical-placement decision: which frame serves a read, which physical
//! page receives a write, and when a block is compacted and erased to make
//! room. The tree never talks to the driver directly.
//!
//! ## Frame policy
//!
//! Frame 0 is a scratch frame: callers that intend to mutate a node force
//! it there with [`PageBuffer::read_into`], and relocation stages pages
//! through it. Reads never cache into frame 0.
//!
//! With two frames, frame 1 serves every read. With three or more, frame 1
//! is reserved for the root page (the hottest page by far) and frames 2..
//! rotate round-robin, skipping the frame that produced the last hit.
//!
//! ## Placement
//!
//! Fresh writes take the next free page at the write cursor. On
//! erase-before-write media the cursor lives inside the *erased window* —
//! the run of pages ahead of the cursor that are known erased — and skips
//! pages that are live, not erased since their last write (a page freed
//! after its block was swallowed full-live), or whose physical id is still
//! named by a mapping (those slots must not be reused until the mapping
//! dies, or a stale parent pointer would resolve into foreign data).
//!
//! ## `ensure_space`
//!
//! Guarantees the next `n` cursor writes succeed. When the window runs
//! short it compacts the erase block just past the window end:
//!
//! 1. classify every page of the block through the tree
//!    ([`RelocationHooks::classify`]),
//! 2. copy still-reachable pages into the block scratch,
//! 3. erase the block,
//! 4. write each saved page back to its own slot, staging it through frame
//!    0 so the tree may refresh stale child pointers in the staged image
//!    first ([`RelocationHooks::page_moved`]) — one write per page, which
//!    erase-before-write media require,
//! 5. re-check, advancing past full-live blocks, and give up with
//!    [`SpaceOutcome::Full`] only after a whole device lap.
//!
//! Reachable-but-remapped pages are dropped without a save but their slots
//! stay unavailable (see placement above).
//!
//! The cursor and window end are monotonically increasing sequence numbers
//! (physical page = seq mod capacity), so wraparound needs no special
//! cases and `erased - cursor` is always the window length.
//!
//! ## Reentrancy
//!
//! `classify` descends the tree, reading pages through this same buffer —
//! its frames are clobbered freely during `ensure_space`. `page_moved` runs
//! between staging and write-back and must confine itself to the staged
//! frame and the tree's own state: it must not issue buffer I/O. Callers
//! never hold a frame slice across a buffer call; they re-read instead.

use eyre::{bail, ensure, Result, WrapErr};
use tracing::{debug, trace};

use crate::bitarr::BitArray;
use crate::config::{Mode, TreeConfig};
use crate::storage::{PageId, StorageDriver};
use crate::tree::node::PageHeader;

/// Index of a frame in the buffer pool.
pub type FrameId = usize;

/// What the tree knows about a physical page during relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// Not reachable from the tree: erase without saving.
    Unreachable,
    /// Superseded, but a mapping still names this physical id: erase
    /// without saving, keep the slot out of circulation.
    Remapped,
    /// Current tree content: must be saved across the erase.
    Reachable,
}

/// Result of [`PageBuffer::ensure_space`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceOutcome {
    Ok,
    /// No page anywhere in the device can be reclaimed.
    Full,
}

/// The tree-side half of the buffer/tree contract.
pub trait RelocationHooks {
    /// Classifies a physical page. May read pages through `buffer` (a tree
    /// descent); any frame may be evicted in the process.
    fn classify(&mut self, buffer: &mut PageBuffer, page: PageId) -> Result<PageStatus>;

    /// A saved page is about to be rewritten at `curr` (`prev == curr` when
    /// it returns to its own slot, which is the normal case); its staged
    /// image is in `frame`. The hook may patch the image — refreshing stale
    /// child pointers drains the mapping table for free — and must update
    /// any tree state keyed by physical id. It must not issue buffer I/O:
    /// the buffer writes the staged frame immediately after this returns.
    fn page_moved(
        &mut self,
        buffer: &mut PageBuffer,
        prev: PageId,
        curr: PageId,
        frame: FrameId,
    ) -> Result<()>;
}

/// Buffer activity counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct BufferStats {
    pub reads: u64,
    pub writes: u64,
    pub overwrites: u64,
    pub hits: u64,
    pub erases: u64,
    pub moves: u64,
}

/// Per-page relocation plan inside one erase block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockPlan {
    AlreadyFree,
    Drop,
    Reserve,
    Save,
}

pub struct PageBuffer {
    storage: Box<dyn StorageDriver>,
    /// One contiguous allocation of `frames * page_size` bytes.
    frames: Vec<u8>,
    /// Physical page cached per frame; frame 0 is scratch and never cached.
    status: Vec<Option<PageId>>,
    page_size: usize,
    num_frames: usize,
    mode: Mode,
    capacity: u32,
    erase_block: usize,
    /// free = nothing references the page: writable if also erased,
    /// reclaimable by its block's next erase otherwise.
    free: BitArray,
    /// erased = not written since the last erase of its block. Placement
    /// requires free AND erased; a page freed inside a block the window
    /// swallowed full-live stays unwritable until that block is erased.
    erased: BitArray,
    next_logical: u32,
    /// Monotonic write cursor; physical page = `cursor % capacity`.
    cursor: u64,
    /// Monotonic exclusive end of the erased window.
    erased_until: u64,
    root_page: Option<PageId>,
    last_hit: Option<PageId>,
    next_frame: usize,
    /// Block-sized relocation scratch.
    scratch: Vec<u8>,
    plan: Vec<BlockPlan>,
    stats: BufferStats,
}

impl PageBuffer {
    pub fn new(config: &TreeConfig, storage: Box<dyn StorageDriver>) -> Result<Self> {
        let capacity = storage.capacity_pages();
        ensure!(capacity > 0, "storage declares zero capacity");
        if config.mode.requires_erase() {
            ensure!(
                capacity as usize % config.erase_block_pages == 0,
                "capacity {} is not a whole number of {}-page erase blocks",
                capacity,
                config.erase_block_pages
            );
        }
        debug!(
            frames = config.buffer_frames,
            page_size = config.page_size,
            capacity,
            "initializing page buffer"
        );
        Ok(Self {
            storage,
            frames: vec![0u8; config.buffer_frames * config.page_size],
            status: vec![None; config.buffer_frames],
            page_size: config.page_size,
            num_frames: config.buffer_frames,
            mode: config.mode,
            capacity,
            erase_block: config.erase_block_pages,
            // A fresh device is fully writable: files read as zeros, flash
            // ships erased.
            free: BitArray::new(capacity as usize, true),
            erased: BitArray::new(capacity as usize, true),
            next_logical: 0,
            cursor: 0,
            erased_until: capacity as u64,
            root_page: None,
            last_hit: None,
            next_frame: 2,
            scratch: vec![0u8; config.erase_block_pages * config.page_size],
            plan: vec![BlockPlan::AlreadyFree; config.erase_block_pages],
            stats: BufferStats::default(),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn capacity_pages(&self) -> u32 {
        self.capacity
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    pub fn clear_stats(&mut self) {
        self.stats = BufferStats::default();
    }

    pub fn frame(&self, frame: FrameId) -> &[u8] {
        let start = frame * self.page_size;
        &self.frames[start..start + self.page_size]
    }

    pub fn frame_mut(&mut self, frame: FrameId) -> &mut [u8] {
        let start = frame * self.page_size;
        &mut self.frames[start..start + self.page_size]
    }

    /// Tells the buffer where the root lives so reads of it can be pinned
    /// to frame 1. Called by the tree whenever the root moves.
    pub fn note_root(&mut self, root: PageId) {
        self.root_page = Some(root);
    }

    pub fn is_free(&self, page: PageId) -> bool {
        self.free.get(page as usize)
    }

    /// Marks a physical page reclaimable: nothing in the tree or the
    /// mapping table references it any more. On erase media it becomes
    /// writable again only once its block is erased.
    pub fn set_free(&mut self, page: PageId) {
        self.free.set(page as usize);
    }

    /// Returns a frame containing `page`, reading from storage only on a
    /// miss.
    pub fn read(&mut self, page: PageId) -> Result<FrameId> {
        ensure!(page < self.capacity, "read of page {page} beyond capacity");
        for f in 1..self.num_frames {
            if self.status[f] == Some(page) {
                self.stats.hits += 1;
                self.last_hit = Some(page);
                return Ok(f);
            }
        }

        let frame = if self.num_frames == 2 {
            1
        } else if self.root_page == Some(page) {
            1
        } else if self.num_frames == 3 {
            2
        } else if let Some(f) = (2..self.num_frames).find(|&f| self.status[f].is_none()) {
            f
        } else {
            // Round-robin over frames 2.., skipping the last-hit page.
            let mut f = self.next_frame;
            self.next_frame += 1;
            loop {
                if f >= self.num_frames {
                    f = 2;
                    self.next_frame = 3;
                }
                if self.status[f] != self.last_hit {
                    break;
                }
                f += 1;
            }
            f
        };

        self.read_into(page, frame)?;
        Ok(frame)
    }

    /// Reads `page` into a specific frame, bypassing the pick policy. Used
    /// by callers that will mutate the node (conventionally into frame 0).
    pub fn read_into(&mut self, page: PageId, frame: FrameId) -> Result<()> {
        ensure!(page < self.capacity, "read of page {page} beyond capacity");
        let start = frame * self.page_size;
        self.storage
            .read_page(page, self.page_size, &mut self.frames[start..start + self.page_size])
            .wrap_err_with(|| format!("failed to read page {page}"))?;
        self.status[frame] = if frame == 0 { None } else { Some(page) };
        self.stats.reads += 1;
        Ok(())
    }

    /// Fills a frame with the mode's erased pattern and detaches it from
    /// any cached page.
    pub fn init_frame(&mut self, frame: FrameId) -> &mut [u8] {
        self.status[frame] = None;
        let fill = self.mode.erased_fill();
        let start = frame * self.page_size;
        let slice = &mut self.frames[start..start + self.page_size];
        slice.fill(fill);
        slice
    }

    /// Stamps the next logical id into the frame's header, places it at the
    /// next free physical page and persists it. Marking the page live is
    /// atomic with the write.
    pub fn write(&mut self, frame: FrameId) -> Result<PageId> {
        let page = self.place()?;
        let logical = self.next_logical;
        self.next_logical += 1;
        PageHeader::from_bytes_mut(self.frame_mut(frame))?.set_logical_id(logical);

        let start = frame * self.page_size;
        self.storage
            .write_page(page, self.page_size, &self.frames[start..start + self.page_size])
            .wrap_err_with(|| format!("failed to write page {page}"))?;
        self.stats.writes += 1;

        // Any stale cache of this physical id predates the erase cycle.
        for f in 1..self.num_frames {
            if f != frame && self.status[f] == Some(page) {
                self.status[f] = None;
            }
        }
        self.status[frame] = if frame == 0 { None } else { Some(page) };
        Ok(page)
    }

    /// Rewrites `page` in place from `frame`. Legal on byte-addressable
    /// media, and in in-page-overwrite mode when the caller guarantees the
    /// new image clears bits only. Other frames caching the page are
    /// refreshed.
    pub fn overwrite(&mut self, frame: FrameId, page: PageId) -> Result<()> {
        ensure!(
            self.mode != Mode::CopyOnWrite,
            "in-place overwrite is not legal on copy-on-write media"
        );
        let start = frame * self.page_size;
        self.storage
            .write_page(page, self.page_size, &self.frames[start..start + self.page_size])
            .wrap_err_with(|| format!("failed to overwrite page {page}"))?;
        self.stats.overwrites += 1;

        for f in 1..self.num_frames {
            if f != frame && self.status[f] == Some(page) {
                let src = frame * self.page_size;
                let dst = f * self.page_size;
                self.frames.copy_within(src..src + self.page_size, dst);
            }
        }
        Ok(())
    }

    /// Writes a frame back to a specific physical page, bypassing the
    /// cursor. Relocation only: the slot was just erased and keeps its
    /// logical id.
    fn write_direct(&mut self, frame: FrameId, page: PageId) -> Result<()> {
        let start = frame * self.page_size;
        self.storage
            .write_page(page, self.page_size, &self.frames[start..start + self.page_size])
            .wrap_err_with(|| format!("failed to write back page {page}"))?;
        self.free.clear(page as usize);
        self.erased.clear(page as usize);
        self.stats.moves += 1;
        Ok(())
    }

    /// Picks the next physical page for a cursor write and marks it live.
    fn place(&mut self) -> Result<PageId> {
        if !self.mode.requires_erase() {
            // Byte-addressable media: any free page will do; scan from the
            // cursor and wrap.
            let cap = self.capacity as usize;
            let start = (self.cursor % cap as u64) as usize;
            let found = self
                .free
                .first_set_in(start, cap)
                .or_else(|| self.free.first_set_in(0, start));
            let Some(page) = found else {
                bail!("no free page left on update-in-place storage");
            };
            let advance = if page >= start {
                (page - start) as u64 + 1
            } else {
                (cap - start + page) as u64 + 1
            };
            self.cursor += advance;
            self.free.clear(page);
            self.erased.clear(page);
            return Ok(page as PageId);
        }

        while self.cursor < self.erased_until {
            let page = (self.cursor % self.capacity as u64) as PageId;
            self.cursor += 1;
            if self.free.get(page as usize) && self.erased.get(page as usize) {
                self.free.clear(page as usize);
                self.erased.clear(page as usize);
                return Ok(page);
            }
            // Live, reserved, or freed-but-not-erased: skip it.
        }
        bail!("write cursor overran the erased window; ensure_space was not honoured")
    }

    /// Pages the cursor can still write without erasing, counted with an
    /// early exit at `limit`.
    fn free_ahead(&self, limit: usize) -> usize {
        if !self.mode.requires_erase() {
            return self
                .free
                .count_ones_in(0, self.capacity as usize)
                .min(limit);
        }
        let mut n = 0;
        let mut seq = self.cursor;
        while seq < self.erased_until && n < limit {
            let page = (seq % self.capacity as u64) as usize;
            if self.free.get(page) && self.erased.get(page) {
                n += 1;
            }
            seq += 1;
        }
        n
    }

    /// Guarantees the next `n` cursor writes succeed, compacting and
    /// erasing blocks as needed. Idempotent once it returns `Ok`.
    pub fn ensure_space(&mut self, n: usize, hooks: &mut dyn RelocationHooks) -> Result<SpaceOutcome> {
        if !self.mode.requires_erase() {
            return Ok(if self.free_ahead(n) >= n {
                SpaceOutcome::Ok
            } else {
                SpaceOutcome::Full
            });
        }

        let blocks_total = self.capacity as usize / self.erase_block;
        let mut blocks_scanned = 0;

        while self.free_ahead(n) < n {
            if blocks_scanned >= blocks_total
                || self.erased_until - self.cursor >= self.capacity as u64
            {
                debug!(n, "ensure_space found no reclaimable block");
                return Ok(SpaceOutcome::Full);
            }
            blocks_scanned += 1;

            let e_start = (self.erased_until % self.capacity as u64) as PageId;
            let e_end = e_start + self.erase_block as u32 - 1;
            trace!(e_start, e_end, "considering erase block");

            // Classify the block. Reachable pages are snapshotted into the
            // scratch before the erase destroys them.
            let mut full_live = true;
            for i in 0..self.erase_block {
                let page = e_start + i as u32;
                if self.free.get(page as usize) {
                    self.plan[i] = BlockPlan::AlreadyFree;
                    full_live = false;
                    continue;
                }
                self.plan[i] = match hooks.classify(self, page)? {
                    PageStatus::Unreachable => {
                        full_live = false;
                        BlockPlan::Drop
                    }
                    PageStatus::Remapped => {
                        full_live = false;
                        BlockPlan::Reserve
                    }
                    PageStatus::Reachable => BlockPlan::Save,
                };
                if self.plan[i] == BlockPlan::Save {
                    let start = i * self.page_size;
                    self.storage
                        .read_page(page, self.page_size, &mut self.scratch[start..start + self.page_size])
                        .wrap_err_with(|| format!("failed to snapshot page {page}"))?;
                }
            }

            if full_live {
                // Nothing reclaimable here; the window swallows the block
                // as-is (its pages stay live and the cursor skips them).
                trace!(e_start, "block is full-live, skipping");
                self.erased_until += self.erase_block as u64;
                continue;
            }

            self.storage
                .erase_pages(e_start, e_end)
                .wrap_err_with(|| format!("failed to erase block {e_start}..={e_end}"))?;
            self.stats.erases += 1;
            self.erased_until += self.erase_block as u64;
            for page in e_start..=e_end {
                self.erased.set(page as usize);
            }

            // On-disk content changed under any frame caching this block.
            for f in 1..self.num_frames {
                if let Some(p) = self.status[f] {
                    if p >= e_start && p <= e_end {
                        self.status[f] = None;
                    }
                }
            }

            for i in 0..self.erase_block {
                let page = e_start + i as u32;
                match self.plan[i] {
                    BlockPlan::AlreadyFree => {}
                    BlockPlan::Drop => self.free.set(page as usize),
                    // Reserved slots stay non-free so placement skips them
                    // until their mapping dies.
                    BlockPlan::Reserve => {}
                    BlockPlan::Save => {
                        let start = i * self.page_size;
                        self.status[0] = None;
                        self.frames[..self.page_size]
                            .copy_from_slice(&self.scratch[start..start + self.page_size]);
                        hooks.page_moved(self, page, page, 0)?;
                        self.write_direct(0, page)?;
                    }
                }
            }
            debug!(e_start, e_end, "erased and compacted block");
        }
        Ok(SpaceOutcome::Ok)
    }

    /// Scans every page header to rebuild the free map and locate the most
    /// recent root. Returns `None` on a blank device.
    ///
    /// Best effort: assumes a quiescent shutdown, as crash journaling is
    /// out of scope.
    pub fn recover(&mut self) -> Result<Option<PageId>> {
        let mut best: Option<(PageId, u32)> = None;
        let mut max_logical: Option<u32> = None;

        for page in 0..self.capacity {
            self.read_into(page, 0)?;
            let header = PageHeader::from_bytes(self.frame(0))?;
            let is_blank = header.is_blank();
            let logical = header.logical_id();
            let is_root = header.is_root();
            if is_blank {
                self.free.set(page as usize);
                continue;
            }
            self.free.clear(page as usize);
            self.erased.clear(page as usize);
            max_logical = Some(max_logical.map_or(logical, |m| m.max(logical)));
            if is_root && best.map_or(true, |(_, l)| logical > l) {
                best = Some((page, logical));
            }
        }

        let Some((root, root_logical)) = best else {
            debug!("recovery found no root; device is blank");
            return Ok(None);
        };
        self.next_logical = max_logical.unwrap_or(0).wrapping_add(1);

        // Park the cursor on the first free page after the root's block and
        // re-derive the erased window as the free run from there.
        let start = root as u64 + 1;
        let mut cursor = start + self.capacity as u64; // fallback: no free page
        for i in 0..self.capacity as u64 {
            let page = ((start + i) % self.capacity as u64) as usize;
            if self.free.get(page) {
                cursor = start + i;
                break;
            }
        }
        self.cursor = cursor;
        let mut erased = cursor;
        while erased - cursor < self.capacity as u64
            && self.free.get((erased % self.capacity as u64) as usize)
        {
            erased += 1;
        }
        self.erased_until = erased;
        self.root_page = Some(root);
        debug!(root, root_logical, "recovered tree root");
        Ok(Some(root))
    }

    /// Frees every page the tree walk did not mark live. Run once after
    /// recovery so stale copy-on-write garbage is reclaimable again.
    pub(crate) fn retain_live(&mut self, live: &BitArray) {
        for page in 0..self.capacity as usize {
            if !live.get(page) {
                self.free.set(page);
            }
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        self.storage.flush()
    }

    pub fn close(&mut self) -> Result<()> {
        debug!(
            reads = self.stats.reads,
            writes = self.stats.writes,
            overwrites = self.stats.overwrites,
            hits = self.stats.hits,
            erases = self.stats.erases,
            "closing page buffer"
        );
        self.storage.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreeConfig;
    use crate::storage::{MediaProfile, MemStorage};
    use crate::tree::node::PAGE_HEADER_SIZE;

    struct AllUnreachable;

    impl RelocationHooks for AllUnreachable {
        fn classify(&mut self, _buffer: &mut PageBuffer, _page: PageId) -> Result<PageStatus> {
            Ok(PageStatus::Unreachable)
        }

        fn page_moved(
            &mut self,
            _buffer: &mut PageBuffer,
            _prev: PageId,
            _curr: PageId,
            _frame: FrameId,
        ) -> Result<()> {
            Ok(())
        }
    }

    /// Pages in `live` are reachable; records every move.
    struct FixedLive {
        live: Vec<PageId>,
        moved: Vec<(PageId, PageId)>,
    }

    impl RelocationHooks for FixedLive {
        fn classify(&mut self, _buffer: &mut PageBuffer, page: PageId) -> Result<PageStatus> {
            Ok(if self.live.contains(&page) {
                PageStatus::Reachable
            } else {
                PageStatus::Unreachable
            })
        }

        fn page_moved(
            &mut self,
            _buffer: &mut PageBuffer,
            prev: PageId,
            curr: PageId,
            _frame: FrameId,
        ) -> Result<()> {
            self.moved.push((prev, curr));
            Ok(())
        }
    }

    fn buffer(mode: Mode, capacity: u32, frames: usize) -> PageBuffer {
        let mut config = TreeConfig::small(mode);
        config.buffer_frames = frames;
        config.mapping_bytes = 0;
        if mode == Mode::CopyOnWrite {
            config.mapping_bytes = 1024;
        }
        let storage = MemStorage::new(
            capacity,
            config.page_size,
            if mode.requires_erase() {
                MediaProfile::NandStrict
            } else {
                MediaProfile::Unrestricted
            },
        );
        PageBuffer::new(&config, Box::new(storage)).unwrap()
    }

    fn write_marked(buf: &mut PageBuffer, marker: u8) -> PageId {
        let frame = 0;
        buf.init_frame(frame);
        buf.frame_mut(frame)[PAGE_HEADER_SIZE] = marker;
        buf.write(frame).unwrap()
    }

    #[test]
    fn writes_advance_the_cursor_sequentially() {
        let mut buf = buffer(Mode::CopyOnWrite, 64, 3);
        assert_eq!(write_marked(&mut buf, 1), 0);
        assert_eq!(write_marked(&mut buf, 2), 1);
        assert_eq!(write_marked(&mut buf, 3), 2);
        assert_eq!(buf.stats().writes, 3);
        assert!(!buf.is_free(0));
        assert!(buf.is_free(3));
    }

    #[test]
    fn logical_ids_are_stamped_monotonically() {
        let mut buf = buffer(Mode::CopyOnWrite, 64, 3);
        for expected in 0..5u32 {
            buf.init_frame(0);
            let page = buf.write(0).unwrap();
            buf.read_into(page, 0).unwrap();
            let header = PageHeader::from_bytes(buf.frame(0)).unwrap();
            assert_eq!(header.logical_id(), expected);
        }
    }

    #[test]
    fn read_hits_cached_frames() {
        let mut buf = buffer(Mode::CopyOnWrite, 64, 4);
        let p = write_marked(&mut buf, 7);
        let f1 = buf.read(p).unwrap();
        let hits_before = buf.stats().hits;
        let f2 = buf.read(p).unwrap();
        assert_eq!(f1, f2);
        assert_eq!(buf.stats().hits, hits_before + 1);
        assert_eq!(buf.frame(f2)[PAGE_HEADER_SIZE], 7);
    }

    #[test]
    fn root_reads_pin_to_frame_one() {
        let mut buf = buffer(Mode::CopyOnWrite, 64, 4);
        let root = write_marked(&mut buf, 9);
        buf.note_root(root);
        assert_eq!(buf.read(root).unwrap(), 1);
        // Other pages rotate through frames 2...
        let other = write_marked(&mut buf, 3);
        assert!(buf.read(other).unwrap() >= 2);
    }

    #[test]
    fn two_frame_pool_reads_into_frame_one() {
        let mut buf = buffer(Mode::CopyOnWrite, 64, 2);
        let a = write_marked(&mut buf, 1);
        let b = write_marked(&mut buf, 2);
        assert_eq!(buf.read(a).unwrap(), 1);
        assert_eq!(buf.read(b).unwrap(), 1);
    }

    #[test]
    fn overwrite_rejected_on_copy_on_write_media() {
        let mut buf = buffer(Mode::CopyOnWrite, 64, 3);
        let p = write_marked(&mut buf, 1);
        buf.read_into(p, 0).unwrap();
        assert!(buf.overwrite(0, p).is_err());
    }

    #[test]
    fn overwrite_refreshes_other_frames_caching_the_page() {
        let mut buf = buffer(Mode::InPageOverwrite, 64, 4);
        let p = write_marked(&mut buf, 0xFF);
        let cached = buf.read(p).unwrap();
        assert_eq!(buf.frame(cached)[PAGE_HEADER_SIZE], 0xFF);

        buf.read_into(p, 0).unwrap();
        buf.frame_mut(0)[PAGE_HEADER_SIZE] = 0x0F; // clears bits only
        buf.overwrite(0, p).unwrap();
        assert_eq!(buf.frame(cached)[PAGE_HEADER_SIZE], 0x0F);
        assert_eq!(buf.stats().overwrites, 1);
    }

    #[test]
    fn ensure_space_reclaims_unreachable_blocks_after_wrap() {
        // 4 blocks of 8 pages. Fill the device, then ask for room: every
        // page classifies unreachable, so the oldest block is erased.
        let mut buf = buffer(Mode::CopyOnWrite, 32, 3);
        for i in 0..32 {
            write_marked(&mut buf, i as u8);
        }
        assert!(buf.free_ahead(1) == 0);

        let outcome = buf.ensure_space(8, &mut AllUnreachable).unwrap();
        assert_eq!(outcome, SpaceOutcome::Ok);
        assert_eq!(buf.stats().erases, 1);
        // The reclaimed block is writable again and the cursor wraps onto it.
        let p = write_marked(&mut buf, 99);
        assert_eq!(p, 0);
    }

    #[test]
    fn ensure_space_saves_reachable_pages_in_place() {
        let mut buf = buffer(Mode::CopyOnWrite, 32, 3);
        for i in 0..32 {
            write_marked(&mut buf, i as u8);
        }
        let mut hooks = FixedLive {
            live: vec![2, 5],
            moved: vec![],
        };
        assert_eq!(buf.ensure_space(6, &mut hooks).unwrap(), SpaceOutcome::Ok);
        assert_eq!(hooks.moved, vec![(2, 2), (5, 5)]);

        // Saved pages kept their contents and stayed live.
        buf.read_into(2, 0).unwrap();
        assert_eq!(buf.frame(0)[PAGE_HEADER_SIZE], 2);
        assert!(!buf.is_free(2));
        assert!(buf.is_free(3));

        // The cursor skips the surviving pages when it reaches them.
        let mut placed = Vec::new();
        for i in 0..6 {
            placed.push(write_marked(&mut buf, 100 + i));
        }
        assert!(!placed.contains(&2));
        assert!(!placed.contains(&5));
    }

    #[test]
    fn ensure_space_is_idempotent_once_satisfied() {
        let mut buf = buffer(Mode::CopyOnWrite, 32, 3);
        for i in 0..32 {
            write_marked(&mut buf, i as u8);
        }
        buf.ensure_space(8, &mut AllUnreachable).unwrap();
        let stats = buf.stats();
        let cursor = buf.cursor;
        let erased = buf.erased_until;

        buf.ensure_space(8, &mut AllUnreachable).unwrap();
        assert_eq!(buf.stats().erases, stats.erases);
        assert_eq!(buf.stats().moves, stats.moves);
        assert_eq!(buf.cursor, cursor);
        assert_eq!(buf.erased_until, erased);
    }

    #[test]
    fn ensure_space_reports_full_when_everything_is_live() {
        let mut buf = buffer(Mode::CopyOnWrite, 32, 3);
        for i in 0..32 {
            write_marked(&mut buf, i as u8);
        }
        let mut hooks = FixedLive {
            live: (0..32).collect(),
            moved: vec![],
        };
        assert_eq!(buf.ensure_space(1, &mut hooks).unwrap(), SpaceOutcome::Full);
        assert!(hooks.moved.is_empty());
    }

    #[test]
    fn update_in_place_mode_counts_total_free_pages() {
        let mut buf = buffer(Mode::UpdateInPlace, 8, 3);
        for i in 0..6 {
            write_marked(&mut buf, i as u8);
        }
        assert_eq!(buf.ensure_space(2, &mut AllUnreachable).unwrap(), SpaceOutcome::Ok);
        assert_eq!(buf.ensure_space(3, &mut AllUnreachable).unwrap(), SpaceOutcome::Full);
    }

    #[test]
    fn remapped_slots_are_not_reused_after_erase() {
        struct OneRemapped;
        impl RelocationHooks for OneRemapped {
            fn classify(&mut self, _b: &mut PageBuffer, page: PageId) -> Result<PageStatus> {
                Ok(if page == 1 {
                    PageStatus::Remapped
                } else {
                    PageStatus::Unreachable
                })
            }
            fn page_moved(
                &mut self,
                _b: &mut PageBuffer,
                _p: PageId,
                _c: PageId,
                _f: FrameId,
            ) -> Result<()> {
                Ok(())
            }
        }

        let mut buf = buffer(Mode::CopyOnWrite, 32, 3);
        for i in 0..32 {
            write_marked(&mut buf, i as u8);
        }
        buf.ensure_space(7, &mut OneRemapped).unwrap();
        assert!(!buf.is_free(1));

        let mut placed = Vec::new();
        for i in 0..7 {
            placed.push(write_marked(&mut buf, i));
        }
        assert!(!placed.contains(&1));
    }

    #[test]
    fn recover_finds_latest_root_and_rebuilds_free_map() {
        let mut config = TreeConfig::small(Mode::CopyOnWrite);
        config.mapping_bytes = 1024;
        let storage = MemStorage::new(32, config.page_size, MediaProfile::NandStrict);
        let mut buf = PageBuffer::new(&config, Box::new(storage)).unwrap();

        // Two root-flagged pages; the later logical id wins.
        for i in 0..3u8 {
            buf.init_frame(0);
            let header = PageHeader::from_bytes_mut(buf.frame_mut(0)).unwrap();
            header.set_root(i != 1);
            buf.write(0).unwrap();
        }

        // Rebuild a fresh buffer over the same storage image.
        let snapshot = {
            let mut copy = vec![0u8; 32 * config.page_size];
            for p in 0..32u32 {
                buf.read_into(p, 0).unwrap();
                let start = p as usize * config.page_size;
                copy[start..start + config.page_size].copy_from_slice(buf.frame(0));
            }
            copy
        };
        let mut storage = MemStorage::new(32, config.page_size, MediaProfile::Unrestricted);
        for p in 0..32u32 {
            use crate::storage::StorageDriver;
            let start = p as usize * config.page_size;
            storage
                .write_page(p, config.page_size, &snapshot[start..start + config.page_size])
                .unwrap();
        }
        let mut recovered = PageBuffer::new(&config, Box::new(storage)).unwrap();
        let root = recovered.recover().unwrap();
        assert_eq!(root, Some(2));
        assert!(!recovered.is_free(0));
        assert!(!recovered.is_free(2));
        assert!(recovered.is_free(10));
        assert_eq!(recovered.next_logical, 3);
    }
}
