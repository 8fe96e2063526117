//! Thin wiring for the boot-stage dataflow (§2): raw E820 → normalized
//! regions → PMM → BIOS-call-backed disk reads → FAT32-loaded kernel image.
//!
//! Rendering, serial logging, the PS/2 decoder, and the sector-sized MBR
//! loader shim that gets this binary running in the first place are out of
//! scope here (§2's external-collaborator list) — this crate starts from
//! "already in protected/long mode, BIOS trampoline installed" and ends at
//! "kernel image loaded into memory", leaving the final jump to it
//! unspecified, the same way the BIOS trampoline's own bytes are
//! unspecified (§4.D).

#![no_std]
#![no_main]

mod e820;

use funnyos_bios::GdtSelectors;
use funnyos_disk::{drive, fat32::Fat32Volume, read::BiosDrive, RealModeBuffer};
use funnyos_mm::memmap;
use funnyos_mm::pmm::PhysicalMemoryManager;

/// Below 1 MiB boot-time staging buffer for disk address packets and
/// directory/FAT sector reads. Sized for one FAT32 cluster's worth of
/// sectors at a conservative 512-byte sector size.
const STAGING_BUFFER_LEN: usize = 16 * 1024;

/// The bootloader's direct-mapped-memory boundary (§4.A boundary split):
/// 1 GiB while still in the bootloader, widened to 4 GiB once the kernel
/// takes over.
const BOOTLOADER_DIRECT_MAP_BOUNDARY: u64 = 1 << 30;

#[unsafe(no_mangle)]
pub extern "C" fn _start() -> ! {
    boot_main()
}

fn boot_main() -> ! {
    // SAFETY: this buffer's storage (provided by the linker image or a
    // fixed low-memory reservation) is valid for the bootloader's entire
    // runtime and below 1 MiB; its address is set up before `_start` runs.
    static mut STAGING_STORAGE: [u8; STAGING_BUFFER_LEN] = [0; STAGING_BUFFER_LEN];
    let staging_segment = 0x0000u16;
    let staging_offset = {
        // SAFETY: single-threaded boot context, no concurrent access.
        let ptr = unsafe { core::ptr::addr_of_mut!(STAGING_STORAGE) } as usize;
        assert!(ptr <= 0xFFFF, "staging buffer must live below 64 KiB for a zero-segment offset");
        ptr as u16
    };

    funnyos_bios::setup_call_bios_interface(GdtSelectors {
        code64: 0x08,
        data64: 0x10,
        code16: 0x18,
        data16: 0x20,
    });

    let raw_entries = e820::collect::<64>(staging_segment, staging_offset);
    let regions = memmap::normalize(&raw_entries, BOOTLOADER_DIRECT_MAP_BOUNDARY);

    let mut pmm = PhysicalMemoryManager::new();
    // SAFETY: `regions` was just normalized from a live E820 map and no
    // frame in it has been handed out yet.
    unsafe {
        pmm.initialize(&regions, |addr| addr);
    }

    // SAFETY: `STAGING_STORAGE` is valid for the runtime of this function
    // and reachable from real mode at `staging_segment:staging_offset`.
    let mut staging = unsafe { RealModeBuffer::new(staging_segment, staging_offset, STAGING_BUFFER_LEN) };
    let descriptor = drive::probe(0x80, &mut staging);
    let mut disk = BiosDrive::new(descriptor, &mut staging);

    let mut sector_buf = [0u8; 512];
    let mut cluster_buf = [0u8; 4096];
    let mut volume = match Fat32Volume::open(&mut disk, 1, &mut sector_buf) {
        Ok(volume) => volume,
        Err(_) => halt(),
    };

    let file = match volume.open_file(b"KERNEL  BIN", &mut cluster_buf) {
        Ok(file) => file,
        Err(_) => halt(),
    };

    let frame_count = file.size_bytes().div_ceil(4096) as u64;
    let destination = match pmm.allocate_pages(frame_count) {
        Some(addr) if !addr.is_zero_page_index() => addr,
        _ => halt(),
    };

    // SAFETY: `destination` was just allocated by the PMM for
    // `frame_count` pages and is identity-mapped at this boot stage.
    let destination_slice = unsafe {
        core::slice::from_raw_parts_mut(destination.as_u64() as *mut u8, file.size_bytes() as usize)
    };

    if volume
        .read_file(&file, destination_slice, &mut cluster_buf)
        .is_err()
    {
        halt();
    }

    // Handing off to the loaded kernel image is an architecture-specific
    // long jump this crate does not prescribe, matching the BIOS
    // trampoline's own contract-not-bytes scoping (§4.D).
    halt();
}

fn halt() -> ! {
    loop {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: HLT is always safe with interrupts in whatever state
        // they're in at this point in boot; it just stops fetching.
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
