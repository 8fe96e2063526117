//! Drive identification and INT 13h extension probing (§3.8), grounded on
//! `BiosDriveInterface.cpp`'s probe sequence.

use funnyos_bios::{call_bios, BiosRegisters};

/// Default sector size assumed for CHS-only drives, which don't report one.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// What a drive's INT 13h extension probe found, plus its CHS geometry for
/// the fallback read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveDescriptor {
    /// BIOS drive number (e.g. `0x80` for the first hard disk).
    pub drive_number: u8,
    /// `AH=42h`/`43h` packet reads are available.
    pub supports_edd_packets: bool,
    /// `AH=48h`/`4Eh` enhanced parameter queries are available.
    pub supports_enhanced_params: bool,
    /// The packet format supports a 64-bit flat destination address.
    pub supports_edd_flat64: bool,
    pub sector_size: u32,
    pub total_sectors: u64,
    pub sectors_per_track: u16,
    pub heads_per_cylinder: u16,
    pub max_cylinder: u16,
}

/// A below-1 MiB buffer the BIOS can write into from real mode: disk
/// address packets, EDD parameter buffers, and staged sector data all live
/// here. Owned and statically allocated by the bootloader; this crate only
/// borrows it (§5's "real-mode staging buffer is... singleton").
pub struct RealModeBuffer {
    segment: u16,
    base_offset: u16,
    /// Resolved once at construction; kept separate from `segment`/
    /// `base_offset` so the real-mode pair can stay small even though the
    /// address this process dereferences (identity-mapped low memory) is
    /// a full pointer width.
    address: usize,
    len: usize,
}

impl RealModeBuffer {
    /// `segment:base_offset` must address memory below 1 MiB that is valid
    /// for BIOS real-mode code to read and write for the buffer's `len`
    /// bytes, for as long as this value exists.
    ///
    /// # Safety
    ///
    /// The caller must guarantee the above.
    pub unsafe fn new(segment: u16, base_offset: u16, len: usize) -> Self {
        let address = ((segment as usize) << 4) + base_offset as usize;
        Self {
            segment,
            base_offset,
            address,
            len,
        }
    }

    /// Real-mode segment:offset pair BIOS calls should be given to reach
    /// the start of this buffer.
    pub const fn segment_offset(&self) -> (u16, u16) {
        (self.segment, self.base_offset)
    }

    /// Linear address of the buffer, for building 64-bit flat pointers.
    pub const fn linear_address(&self) -> u32 {
        self.address as u32
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.address as *mut u8
    }

    /// Copies `data` into the buffer at byte offset `at`.
    pub fn write(&mut self, at: usize, data: &[u8]) {
        assert!(at + data.len() <= self.len, "real-mode buffer overrun");
        // SAFETY: bounds checked above, and `new`'s caller promised this
        // range is valid for the buffer's lifetime.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.as_mut_ptr().add(at), data.len());
        }
    }

    /// Copies `len` bytes out of the buffer at byte offset `at` into `out`.
    pub fn read(&self, at: usize, out: &mut [u8]) {
        assert!(at + out.len() <= self.len, "real-mode buffer overrun");
        // SAFETY: bounds checked above.
        unsafe {
            core::ptr::copy_nonoverlapping(
                (self.address as *const u8).add(at),
                out.as_mut_ptr(),
                out.len(),
            );
        }
    }

    #[cfg(test)]
    fn from_host_ptr(ptr: *mut u8, len: usize) -> Self {
        Self {
            segment: 0,
            base_offset: 0,
            address: ptr as usize,
            len,
        }
    }
}

const EXTENSIONS_PRESENT_MAGIC: u16 = 0xAA55;

/// Runs the INT 13h extension probe and parameter query for `drive_number`,
/// falling back to legacy CHS geometry (`AH=08h`) when extensions aren't
/// reported or the enhanced parameter call fails.
pub fn probe(drive_number: u8, buffer: &mut RealModeBuffer) -> DriveDescriptor {
    let extension_probe = call_bios(
        0x13,
        BiosRegisters::new()
            .with_ah(0x41)
            .with_bx(0x55AA)
            .with_dl(drive_number),
    );

    let mut supports_edd_packets = false;
    let mut supports_enhanced_params = false;
    let mut supports_edd_flat64 = false;

    if let Ok(regs) = extension_probe {
        if regs.bx() == EXTENSIONS_PRESENT_MAGIC {
            supports_edd_packets = regs.cx() & (1 << 0) != 0;
            supports_enhanced_params = regs.cx() & (1 << 2) != 0;
            supports_edd_flat64 = regs.cx() & (1 << 3) != 0;
        }
    }

    if supports_enhanced_params {
        if let Some(descriptor) = probe_enhanced_params(drive_number, buffer) {
            return DriveDescriptor {
                supports_edd_packets,
                supports_enhanced_params,
                supports_edd_flat64,
                ..descriptor
            };
        }
    }

    probe_legacy_chs(drive_number)
}

/// `AH=48h` — Get Drive Parameters (EDD). Writes a result buffer whose
/// first word the caller must pre-load with its own size.
fn probe_enhanced_params(drive_number: u8, buffer: &mut RealModeBuffer) -> Option<DriveDescriptor> {
    const RESULT_BUFFER_SIZE: usize = 0x1E;
    let mut scratch = [0u8; RESULT_BUFFER_SIZE];
    scratch[0..2].copy_from_slice(&(RESULT_BUFFER_SIZE as u16).to_le_bytes());
    buffer.write(0, &scratch);

    let (segment, offset) = buffer.segment_offset();
    let result = call_bios(
        0x13,
        BiosRegisters::new()
            .with_ah(0x48)
            .with_dl(drive_number)
            .with_es_di(segment, offset),
    );
    result.ok()?;

    buffer.read(0, &mut scratch);
    let sector_size = u16::from_le_bytes([scratch[0x18], scratch[0x19]]) as u32;
    let total_sectors = u64::from_le_bytes(scratch[0x10..0x18].try_into().ok()?);

    Some(DriveDescriptor {
        drive_number,
        supports_edd_packets: false,
        supports_enhanced_params: true,
        supports_edd_flat64: false,
        sector_size: if sector_size == 0 {
            DEFAULT_SECTOR_SIZE
        } else {
            sector_size
        },
        total_sectors,
        sectors_per_track: 0,
        heads_per_cylinder: 0,
        max_cylinder: 0,
    })
}

/// `AH=08h` — Get Drive Parameters (legacy CHS).
fn probe_legacy_chs(drive_number: u8) -> DriveDescriptor {
    let regs = call_bios(0x13, BiosRegisters::new().with_ah(0x08).with_dl(drive_number))
        .unwrap_or_else(|err| match err {
            funnyos_bios::BiosCallError::CarrySet(regs) => regs,
        });

    let sectors_per_track = (regs.cl() & 0x3F) as u16;
    let max_cylinder = (((regs.cl() & 0xC0) as u16) << 2) | regs.ch() as u16;
    let heads_per_cylinder = regs.dh() as u16 + 1;

    DriveDescriptor {
        drive_number,
        supports_edd_packets: false,
        supports_enhanced_params: false,
        supports_edd_flat64: false,
        sector_size: DEFAULT_SECTOR_SIZE,
        total_sectors: 0,
        sectors_per_track: sectors_per_track.max(1),
        heads_per_cylinder: heads_per_cylinder.max(1),
        max_cylinder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_chs_parsing_splits_cylinder_high_bits_correctly() {
        // CL = 0b11_000010 -> sectors_per_track = 2, cylinder high bits = 0b11
        let regs = BiosRegisters::new()
            .with_cl(0b1100_0010)
            .with_ch(0x50)
            .with_dh(3);

        let sectors_per_track = (regs.cl() & 0x3F) as u16;
        let max_cylinder = (((regs.cl() & 0xC0) as u16) << 2) | regs.ch() as u16;
        let heads = regs.dh() as u16 + 1;

        assert_eq!(sectors_per_track, 2);
        assert_eq!(max_cylinder, 0x350);
        assert_eq!(heads, 4);
    }

    #[test]
    fn real_mode_buffer_round_trips_bytes() {
        let mut backing = [0u8; 64];
        let mut buffer = RealModeBuffer::from_host_ptr(backing.as_mut_ptr(), 64);
        buffer.write(4, &[1, 2, 3, 4]);
        let mut out = [0u8; 4];
        buffer.read(4, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
    }
}
