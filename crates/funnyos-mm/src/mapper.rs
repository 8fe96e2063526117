//! Architecture-independent mapping traits and flags.
//!
//! [`vmm`](crate::vmm) implements [`PageMapper`] concretely for the x86-64
//! 4-level page-table hierarchy; this module only fixes the contract a
//! mapper must satisfy and the bookkeeping ([`MapFlush`]) that keeps TLB
//! invalidation from being forgotten.

use core::sync::atomic::{AtomicPtr, Ordering};

use bitflags::bitflags;
use funnyos_core::addr::VirtAddr;
use funnyos_core::paging::{Page, PageSize, PhysFrame, Size4KiB};

bitflags! {
    /// Attributes attached to a page-table mapping.
    ///
    /// Collapses hadron's five-flag set down to the three the page-table
    /// entry layout actually needs here (§3.6): writability, executability
    /// (inverted into the NX bit), and kernel-only access, which also
    /// implies the mapping is global.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Mapping is writable.
        const WRITABLE = 1 << 0;
        /// Mapping is executable (clears the NX bit).
        const EXECUTABLE = 1 << 1;
        /// Mapping is supervisor-only and marked global.
        const KERNEL = 1 << 2;
    }
}

/// Why an `unmap` call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    /// No mapping exists at the given page.
    NotMapped,
    /// A mapping exists but at a different page size.
    SizeMismatch,
}

type TlbFlushFn = fn(VirtAddr);

fn null_tlb_flush(_addr: VirtAddr) {}

static TLB_FLUSH_FN: AtomicPtr<()> = AtomicPtr::new(null_tlb_flush as *mut ());

/// Registers the architecture's TLB invalidation routine.
///
/// # Safety
///
/// `f` must actually invalidate the TLB entry for the address it is given,
/// on this CPU, without requiring anything else to be set up first.
pub unsafe fn register_tlb_flush(f: TlbFlushFn) {
    TLB_FLUSH_FN.store(f as *mut (), Ordering::Release);
}

fn load_tlb_flush() -> TlbFlushFn {
    let ptr = TLB_FLUSH_FN.load(Ordering::Acquire);
    // SAFETY: only `register_tlb_flush` ever stores into TLB_FLUSH_FN.
    unsafe { core::mem::transmute(ptr) }
}

/// A pending TLB invalidation for a mapping that was just changed.
///
/// Every `map`/`unmap`/`update_flags` call returns one of these instead of
/// flushing internally, so a caller installing many mappings in a batch (the
/// bootloader's initial address space setup) can defer every flush to a
/// single `flush_all` at the end. Dropping it without calling [`flush`] or
/// [`ignore`] is a mistake the `#[must_use]` catches at compile time — there
/// is no safe default.
///
/// [`flush`]: MapFlush::flush
/// [`ignore`]: MapFlush::ignore
#[must_use = "a mapping was changed; call flush() or ignore() explicitly"]
pub struct MapFlush<S: PageSize> {
    page: Page<S>,
}

impl<S: PageSize> MapFlush<S> {
    /// Wraps a page whose mapping just changed.
    pub const fn new(page: Page<S>) -> Self {
        Self { page }
    }

    /// Invalidates the TLB entry for this mapping on the current CPU.
    pub fn flush(self) {
        load_tlb_flush()(self.page.start_address());
        core::mem::forget(self);
    }

    /// Discards the flush, asserting the caller will invalidate the TLB
    /// some other way (e.g. a batched `flush_all`, or the mapping was never
    /// live in any CPU's TLB to begin with).
    pub fn ignore(self) {
        core::mem::forget(self);
    }
}

impl<S: PageSize> Drop for MapFlush<S> {
    fn drop(&mut self) {
        debug_assert!(false, "MapFlush dropped without flush() or ignore()");
    }
}

/// Installs and removes mappings in a page-table hierarchy rooted at a given
/// physical frame.
///
/// # Safety
///
/// Implementors must guarantee that `map` never aliases a physical frame
/// already mapped writable elsewhere without the caller's knowledge, and
/// that `root` is interpreted consistently with the hierarchy the
/// implementation actually walks.
pub unsafe trait PageMapper<S: PageSize> {
    /// Maps `page` to `frame` with `flags`, using `alloc` to obtain any
    /// intermediate page-table frames the walk needs to allocate.
    ///
    /// # Safety
    ///
    /// `frame` must be valid for the lifetime of the mapping, and `root`
    /// must be the physical address of a page-table hierarchy this mapper
    /// is prepared to walk.
    unsafe fn map(
        &mut self,
        root: funnyos_core::addr::PhysAddr,
        page: Page<S>,
        frame: PhysFrame<S>,
        flags: MapFlags,
        alloc: &mut dyn FnMut() -> PhysFrame<Size4KiB>,
    ) -> Result<MapFlush<S>, MapError>;

    /// Removes the mapping for `page`, returning the frame it pointed to.
    ///
    /// # Safety
    ///
    /// `root` must be the physical address of a page-table hierarchy this
    /// mapper is prepared to walk.
    unsafe fn unmap(
        &mut self,
        root: funnyos_core::addr::PhysAddr,
        page: Page<S>,
    ) -> Result<(PhysFrame<S>, MapFlush<S>), UnmapError>;

    /// Changes the flags of an existing mapping without touching its frame.
    ///
    /// # Safety
    ///
    /// `root` must be the physical address of a page-table hierarchy this
    /// mapper is prepared to walk.
    unsafe fn update_flags(
        &mut self,
        root: funnyos_core::addr::PhysAddr,
        page: Page<S>,
        flags: MapFlags,
    ) -> Result<MapFlush<S>, UnmapError>;
}

/// Translates virtual addresses through a page-table hierarchy without
/// modifying it.
///
/// # Safety
///
/// Implementors must only read the hierarchy, never allocate or mutate it.
pub unsafe trait PageTranslator {
    /// Translates `addr` to a physical address, or `None` if unmapped.
    ///
    /// # Safety
    ///
    /// `root` must be the physical address of a page-table hierarchy this
    /// translator is prepared to walk.
    unsafe fn translate_addr(
        &self,
        root: funnyos_core::addr::PhysAddr,
        addr: VirtAddr,
    ) -> Option<funnyos_core::addr::PhysAddr>;
}

/// Why a `map` call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The page is already mapped to a different frame.
    AlreadyMapped,
    /// `alloc` could not produce a page-table frame.
    FrameAllocationFailed,
    /// An intermediate table entry exists but refers to a larger page size
    /// than the one being mapped (e.g. mapping a 4 KiB page where a 2 MiB
    /// page is already installed).
    HugePageConflict,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_flags_kernel_implies_no_user_bit() {
        let flags = MapFlags::KERNEL | MapFlags::WRITABLE;
        assert!(flags.contains(MapFlags::KERNEL));
        assert!(flags.contains(MapFlags::WRITABLE));
        assert!(!flags.contains(MapFlags::EXECUTABLE));
    }

    #[test]
    fn tlb_flush_defaults_to_noop_until_registered() {
        // Just exercises the default without panicking; a registered flush
        // function is validated in vmm's own tests via a real page table.
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(0x1000));
        MapFlush::new(page).ignore();
    }
}
