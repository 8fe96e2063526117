//! Physical frame allocator.
//!
//! Unlike a single global bitmap, each usable region gets its own Memory
//! Chunk Control Block (MCCB, §3.3): a bitmap living inside the first pages
//! of the region it describes. This avoids a separate bootstrap allocation
//! for the bitmap itself — the region is large enough to describe itself —
//! at the cost of a few pages of "control block waste" per region, which
//! [`Statistics`] reports.

use funnyos_core::addr::{PhysAddr, ZERO_PAGE_INDEX};
use funnyos_core::kwarn;

use crate::memmap::{MemoryClass, MemoryRegion, RegionList};

const PAGE_SIZE: u64 = 4096;
const BITS_PER_WORD: u64 = 64;

/// A region's self-referential bitmap allocator.
///
/// The first `control_block_page_span` pages of the region hold the bitmap
/// itself (rounded up to a whole number of pages); the remaining
/// `allocable_pages_count` pages are what the bitmap actually tracks. Bit
/// `0` means free, `1` means allocated — the control block's own pages are
/// marked allocated up front so they're never handed out.
struct Mccb {
    /// Physical address of page 0 of the region (also bitmap bit index 0).
    /// This is `region.start` rounded up to a page boundary, not
    /// necessarily `region.start` itself — region bases aren't guaranteed
    /// page-aligned.
    first_page: PhysAddr,
    /// Bytes between `region.start` and `first_page`, wasted to alignment.
    /// Folded into [`Self::control_block_waste_bytes`] rather than its own
    /// counter, since it's bookkeeping overhead of the same control block.
    relative_offset: u64,
    /// Total pages from `first_page` onward, including the control block's
    /// own pages.
    total_pages: u64,
    /// Pages actually available to hand out (`total_pages - span`).
    allocable_pages_count: u64,
    /// Pages currently free.
    free_pages: u64,
    /// How many of the leading pages are occupied by the bitmap itself.
    control_block_page_span: u64,
    /// Pointer to the bitmap, word-addressed, covering all `total_pages`
    /// bits (including the control block's own, permanently-allocated
    /// leading pages). Lives at `region.start`, which may be up to
    /// `PAGE_SIZE - 1` bytes before `first_page`.
    bitmap: *mut u64,
    bitmap_words: usize,
}

impl Mccb {
    fn word_count(pages: u64) -> usize {
        pages.div_ceil(BITS_PER_WORD) as usize
    }

    /// Builds a control block over `region`, whose first pages are
    /// reinterpreted as the bitmap. `phys_to_virt` dereferences physical
    /// addresses so the bitmap can actually be written.
    ///
    /// # Safety
    ///
    /// `region` must not overlap any other live MCCB or any memory the
    /// kernel is otherwise using, and `phys_to_virt` must make the region's
    /// own pages writable.
    unsafe fn init(region: &MemoryRegion, phys_to_virt: impl Fn(PhysAddr) -> PhysAddr) -> Self {
        let first_page = region.start.align_up(PAGE_SIZE);
        let relative_offset = first_page.as_u64() - region.start.as_u64();
        // Pages counted from `first_page`, not `region.start` — the bitmap
        // only needs to track pages that can actually be handed out as
        // page-aligned frames.
        let total_pages = (region.end.as_u64() - first_page.as_u64()) / PAGE_SIZE;
        let bitmap_words = Self::word_count(total_pages);
        let bitmap_bytes = bitmap_words as u64 * 8;
        // The `relative_offset` bytes before `first_page` are already
        // wasted to alignment and can hold part of the bitmap for free;
        // only the remainder needs whole pages of its own.
        let span = bitmap_bytes.saturating_sub(relative_offset).div_ceil(PAGE_SIZE);
        let allocable_pages_count = total_pages - span;
        let bitmap = phys_to_virt(region.start).as_mut_ptr::<u64>();

        // SAFETY: the region is at least `span` pages long (from
        // `first_page`) and not in use by anything else, per caller
        // contract.
        unsafe {
            for i in 0..bitmap_words {
                bitmap.add(i).write(0);
            }
        }

        let mut mccb = Self {
            first_page,
            relative_offset,
            total_pages,
            allocable_pages_count,
            free_pages: allocable_pages_count,
            control_block_page_span: span,
            bitmap,
            bitmap_words,
        };

        // Pre-allocate the control block's own pages so they're never
        // handed out or freed back.
        for frame in 0..span {
            mccb.mark_allocated(frame);
        }
        mccb
    }

    fn bit(&self, index: u64) -> bool {
        let word = (index / BITS_PER_WORD) as usize;
        let bit = index % BITS_PER_WORD;
        // SAFETY: `word` < bitmap_words by construction of every caller.
        unsafe { (self.bitmap.add(word).read() >> bit) & 1 == 1 }
    }

    fn mark_allocated(&mut self, index: u64) {
        let word = (index / BITS_PER_WORD) as usize;
        let bit = index % BITS_PER_WORD;
        // SAFETY: `word` < bitmap_words by construction of every caller.
        unsafe {
            let ptr = self.bitmap.add(word);
            ptr.write(ptr.read() | (1 << bit));
        }
    }

    fn mark_free(&mut self, index: u64) {
        let word = (index / BITS_PER_WORD) as usize;
        let bit = index % BITS_PER_WORD;
        // SAFETY: `word` < bitmap_words by construction of every caller.
        unsafe {
            let ptr = self.bitmap.add(word);
            ptr.write(ptr.read() & !(1 << bit));
        }
    }

    /// Finds `count` contiguous free frames, marks them allocated, and
    /// returns the physical address of the first one.
    fn allocate(&mut self, count: u64) -> Option<PhysAddr> {
        if count == 0 || self.free_pages < count {
            return None;
        }
        let mut run_start = None;
        let mut run_len = 0u64;
        for i in self.control_block_page_span..self.total_pages {
            if self.bit(i) {
                run_start = None;
                run_len = 0;
                continue;
            }
            if run_start.is_none() {
                run_start = Some(i);
            }
            run_len += 1;
            if run_len == count {
                let start = run_start.unwrap();
                for frame in start..start + count {
                    self.mark_allocated(frame);
                }
                self.free_pages -= count;
                return Some(self.first_page + start * PAGE_SIZE);
            }
        }
        None
    }

    /// Frees `count` frames starting at `addr`. Returns `false` (without
    /// modifying state) if any frame in the range is already free, outside
    /// this region, or inside the control block's own reserved span —
    /// invalid-free and double-free per §7 are reported by the caller via
    /// [`kwarn!`], not panics.
    fn free(&mut self, addr: PhysAddr, count: u64) -> bool {
        let Some(offset) = (addr.as_u64().checked_sub(self.first_page.as_u64())) else {
            return false;
        };
        if offset % PAGE_SIZE != 0 {
            return false;
        }
        let start = offset / PAGE_SIZE;
        if start < self.control_block_page_span || start + count > self.total_pages {
            return false;
        }
        for frame in start..start + count {
            if !self.bit(frame) {
                return false;
            }
        }
        for frame in start..start + count {
            self.mark_free(frame);
        }
        self.free_pages += count;
        true
    }

    fn contains(&self, addr: PhysAddr) -> bool {
        let end = self.first_page.as_u64() + self.total_pages * PAGE_SIZE;
        addr.as_u64() >= self.first_page.as_u64() && addr.as_u64() < end
    }

    fn control_block_waste_bytes(&self) -> u64 {
        self.control_block_page_span * PAGE_SIZE + self.relative_offset
    }
}

const MAX_MCCBS: usize = crate::memmap::MAX_REGIONS;

/// Allocation/free statistics, accumulated across every region's MCCB.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statistics {
    /// Bytes spent on each region's control block: its bitmap's own pages,
    /// rounded up, plus the alignment gap between the region's raw start
    /// and its first page-aligned frame.
    pub control_block_waste: u64,
    /// Bytes lost to a region's length not dividing evenly into pages.
    pub unusable_unaligned_memory: u64,
    /// Bytes lost to regions too small to host even a minimal control block.
    pub unusable_fragmented_memory: u64,
    /// Bytes below the lowest address the allocator is willing to track.
    pub unusable_low_memory: u64,
    /// Bytes occupied by the loaded kernel image.
    pub kernel_image_size: u64,
    /// Bytes currently marked reclaimable but not yet reclaimed.
    pub total_reclaimable_memory: u64,
    /// Bytes currently available for allocation.
    pub total_available_memory: u64,
}

/// Smallest region (in pages) worth giving its own MCCB; anything smaller
/// after accounting for bitmap overhead is unusable-fragmented.
const MIN_REGION_PAGES: u64 = 2;

/// Low memory the allocator never hands out, regardless of what the
/// bootloader's memory map reports as available there. A fixed cost of
/// doing business on this platform, not something derived from any region.
const RESERVED_LOW_MEMORY: u64 = 1024 * 1024;

/// The physical frame allocator.
///
/// Owns one [`Mccb`] per usable region. `allocate_pages`/`free_pages` scan
/// regions in address order and delegate to the first one that can satisfy
/// the request — this crate never merges allocations across region
/// boundaries, matching the self-referential-MCCB design (§9).
pub struct PhysicalMemoryManager {
    mccbs: planck_noalloc::vec::ArrayVec<Mccb, MAX_MCCBS>,
    stats: Statistics,
}

impl PhysicalMemoryManager {
    /// An empty manager, ready for [`Self::initialize`].
    pub const fn new() -> Self {
        Self { mccbs: planck_noalloc::vec::ArrayVec::new(), stats: Statistics::new() }
    }

    /// Builds one MCCB per `Available` region in `regions`, skipping ones
    /// too small to be worth tracking (counted in `stats` instead).
    ///
    /// # Safety
    ///
    /// Every `Available` region in `regions` must be genuinely free, and
    /// `phys_to_virt` must make each region's own pages writable (as
    /// [`Mccb::init`] requires).
    pub unsafe fn initialize(&mut self, regions: &RegionList, phys_to_virt: impl Fn(PhysAddr) -> PhysAddr + Copy) {
        self.stats.unusable_low_memory = RESERVED_LOW_MEMORY;
        for region in regions.iter() {
            match region.class {
                MemoryClass::Available => {
                    if region.len() < MIN_REGION_PAGES * PAGE_SIZE {
                        self.stats.unusable_fragmented_memory += region.len();
                        continue;
                    }
                    // SAFETY: forwarded from caller.
                    let mccb = unsafe { Mccb::init(region, phys_to_virt) };
                    self.stats.unusable_unaligned_memory += region.end.as_u64() % PAGE_SIZE;
                    self.stats.control_block_waste += mccb.control_block_waste_bytes();
                    self.stats.total_available_memory += mccb.free_pages * PAGE_SIZE;
                    self.mccbs.push(mccb);
                }
                MemoryClass::AcpiReclaim | MemoryClass::PageTableReclaimable | MemoryClass::LongMemReclaimable => {
                    self.stats.total_reclaimable_memory += region.len();
                }
                MemoryClass::KernelImage => {
                    self.stats.kernel_image_size += region.len();
                }
                MemoryClass::Reserved | MemoryClass::AcpiNvs | MemoryClass::Unknown => {}
            }
        }
    }

    /// Marks a previously reclaimable region as now available, giving it an
    /// MCCB of its own. Used once the kernel has parsed ACPI tables (or
    /// torn down the bootloader's own page tables) and the backing memory
    /// is safe to allocate from.
    ///
    /// # Safety
    ///
    /// Same as [`Self::initialize`]: `region` must genuinely be free now.
    pub unsafe fn reclaim(&mut self, region: &MemoryRegion, phys_to_virt: impl Fn(PhysAddr) -> PhysAddr) {
        if region.len() < MIN_REGION_PAGES * PAGE_SIZE {
            self.stats.unusable_fragmented_memory += region.len();
            return;
        }
        self.stats.total_reclaimable_memory = self.stats.total_reclaimable_memory.saturating_sub(region.len());
        // SAFETY: forwarded from caller.
        let mccb = unsafe { Mccb::init(region, phys_to_virt) };
        self.stats.unusable_unaligned_memory += region.end.as_u64() % PAGE_SIZE;
        self.stats.control_block_waste += mccb.control_block_waste_bytes();
        self.stats.total_available_memory += mccb.free_pages * PAGE_SIZE;
        self.mccbs.push(mccb);
    }

    /// Allocates `count` contiguous pages. `count == 0` returns
    /// [`ZERO_PAGE_INDEX`] without touching any region, matching the
    /// zero-page-allocation sentinel (§3.4).
    pub fn allocate_pages(&mut self, count: u64) -> Option<PhysAddr> {
        if count == 0 {
            return Some(ZERO_PAGE_INDEX);
        }
        for mccb in self.mccbs.iter_mut() {
            if let Some(addr) = mccb.allocate(count) {
                self.stats.total_available_memory -= count * PAGE_SIZE;
                return Some(addr);
            }
        }
        None
    }

    /// Frees `count` pages starting at `addr`. A no-op for
    /// [`ZERO_PAGE_INDEX`] (matching the zero-page allocation contract).
    /// Frees that don't correspond to a live, fully-allocated run are
    /// reported via [`kwarn!`] and otherwise ignored rather than panicking
    /// — an invalid or double free must not be allowed to corrupt another
    /// region's bitmap.
    pub fn free_pages(&mut self, addr: PhysAddr, count: u64) {
        if addr.is_zero_page_index() || count == 0 {
            return;
        }
        for mccb in self.mccbs.iter_mut() {
            if mccb.contains(addr) {
                if mccb.free(addr, count) {
                    self.stats.total_available_memory += count * PAGE_SIZE;
                } else {
                    kwarn!("pmm: invalid or double free at {addr:?} ({count} pages)");
                }
                return;
            }
        }
        kwarn!("pmm: free of {addr:?} outside any tracked region");
    }

    /// A snapshot of the allocator's bookkeeping counters.
    pub const fn statistics(&self) -> Statistics {
        self.stats
    }
}

impl Default for PhysicalMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    const fn new() -> Self {
        Self {
            control_block_waste: 0,
            unusable_unaligned_memory: 0,
            unusable_fragmented_memory: 0,
            unusable_low_memory: 0,
            kernel_image_size: 0,
            total_reclaimable_memory: 0,
            total_available_memory: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memmap::MAX_REGIONS;

    /// A scratch buffer standing in for physical memory in these tests;
    /// `phys_to_virt` is the identity function over offsets into it.
    struct Backing {
        bytes: std::vec::Vec<u8>,
        base: u64,
    }

    impl Backing {
        fn new(pages: u64) -> Self {
            let len = (pages * PAGE_SIZE) as usize;
            let mut bytes = std::vec![0u8; len + PAGE_SIZE as usize];
            let base = bytes.as_mut_ptr() as u64;
            let base = (base + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            Self { bytes, base }
        }

        fn region(&self) -> MemoryRegion {
            let pages = (self.bytes.len() as u64 - PAGE_SIZE) / PAGE_SIZE;
            MemoryRegion {
                start: PhysAddr::new_truncate(self.base),
                end: PhysAddr::new_truncate(self.base + pages * PAGE_SIZE),
                class: MemoryClass::Available,
            }
        }

        fn identity(addr: PhysAddr) -> PhysAddr {
            addr
        }
    }

    #[test]
    fn allocate_and_free_round_trip() {
        let backing = Backing::new(16);
        let mut regions: RegionList = planck_noalloc::vec::ArrayVec::<_, MAX_REGIONS>::new();
        regions.push(backing.region());

        let mut pmm = PhysicalMemoryManager::new();
        unsafe { pmm.initialize(&regions, Backing::identity) };

        let before = pmm.statistics().total_available_memory;
        let addr = pmm.allocate_pages(2).expect("allocation should succeed");
        assert!(addr.as_u64() >= backing.base);
        assert_eq!(pmm.statistics().total_available_memory, before - 2 * PAGE_SIZE);

        pmm.free_pages(addr, 2);
        assert_eq!(pmm.statistics().total_available_memory, before);
    }

    #[test]
    fn zero_page_allocation_returns_sentinel() {
        let mut pmm = PhysicalMemoryManager::new();
        assert_eq!(pmm.allocate_pages(0), Some(ZERO_PAGE_INDEX));
        // Freeing the sentinel is a documented no-op, never a double-free.
        pmm.free_pages(ZERO_PAGE_INDEX, 0);
    }

    #[test]
    fn double_free_is_rejected_not_corrupting() {
        let backing = Backing::new(16);
        let mut regions: RegionList = planck_noalloc::vec::ArrayVec::<_, MAX_REGIONS>::new();
        regions.push(backing.region());

        let mut pmm = PhysicalMemoryManager::new();
        unsafe { pmm.initialize(&regions, Backing::identity) };

        let addr = pmm.allocate_pages(1).unwrap();
        pmm.free_pages(addr, 1);
        let before = pmm.statistics().total_available_memory;
        pmm.free_pages(addr, 1); // double free: rejected, stats unchanged
        assert_eq!(pmm.statistics().total_available_memory, before);
    }

    #[test]
    fn tiny_region_is_marked_fragmented_not_tracked() {
        let mut regions: RegionList = planck_noalloc::vec::ArrayVec::<_, MAX_REGIONS>::new();
        regions.push(MemoryRegion {
            start: PhysAddr::new_truncate(0x1000),
            end: PhysAddr::new_truncate(0x2000),
            class: MemoryClass::Available,
        });
        let mut pmm = PhysicalMemoryManager::new();
        unsafe { pmm.initialize(&regions, |a| a) };
        assert_eq!(pmm.statistics().unusable_fragmented_memory, 0x1000);
        assert_eq!(pmm.allocate_pages(1), None);
    }
}
