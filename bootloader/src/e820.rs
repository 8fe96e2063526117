//! `INT 15h, EAX=E820h` memory-map collection, feeding §4.A's normalizer.
//!
//! Per §6.1: `acpi_flags` defaults to `0b01` (don't-ignore, non-volatile)
//! when a BIOS reports "no ACPI extended attributes" by returning a CX of
//! 20 bytes instead of 24.

use funnyos_bios::{call_bios, BiosRegisters};
use funnyos_mm::memmap::RawMapEntry;
use planck_noalloc::vec::ArrayVec;

const SMAP_SIGNATURE: u32 = 0x534D_4150;
const DEFAULT_ACPI_FLAGS: u32 = 0b01;

/// Runs the E820 continuation loop to completion, collecting every entry
/// the firmware reports.
///
/// `scratch` must be at least 24 bytes and reachable by real-mode BIOS
/// code (below 1 MiB); the BIOS writes each entry there via `ES:DI`.
pub fn collect<const N: usize>(
    scratch_segment: u16,
    scratch_offset: u16,
) -> ArrayVec<RawMapEntry, N> {
    let mut entries = ArrayVec::new();
    let mut continuation = 0u32;

    loop {
        let regs = BiosRegisters::new()
            .with_ax(0xE820)
            .with_edx(SMAP_SIGNATURE)
            .with_ecx(24)
            .with_ebx(continuation)
            .with_es_di(scratch_segment, scratch_offset);

        let result = match call_bios(0x15, regs) {
            Ok(regs) => regs,
            Err(_) => break,
        };

        if result.eax != SMAP_SIGNATURE {
            break;
        }

        // SAFETY: the buffer at scratch_segment:scratch_offset was just
        // filled by the BIOS call above with at least `ecx` bytes.
        let entry = unsafe { read_entry(scratch_segment, scratch_offset, result.ecx) };
        if entries.push(entry).is_err() {
            break;
        }

        continuation = result.ebx;
        if continuation == 0 {
            break;
        }
    }

    entries
}

/// # Safety
///
/// `segment:offset` must address a live, BIOS-written E820 entry buffer of
/// at least `written_len` bytes (20 or 24).
unsafe fn read_entry(segment: u16, offset: u16, written_len: u32) -> RawMapEntry {
    let address = ((segment as usize) << 4) + offset as usize;
    let ptr = address as *const u8;
    // SAFETY: caller's contract.
    let bytes = unsafe { core::slice::from_raw_parts(ptr, written_len as usize) };

    let base = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let length = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    let region_type = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
    let acpi_flags = if written_len >= 24 {
        u32::from_le_bytes(bytes[20..24].try_into().unwrap())
    } else {
        DEFAULT_ACPI_FLAGS
    };

    RawMapEntry {
        base,
        length,
        region_type,
        acpi_flags,
    }
}
