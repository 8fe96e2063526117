//! Sector read strategies (§4.E), grounded on `BiosDriveInterface.cpp`'s
//! three-tier fallback: a 64-bit flat EDD packet when available, a
//! below-1 MiB staged EDD packet otherwise, and raw CHS as the last
//! resort.
//!
//! One deliberate correction from the original: the CHS path there computes
//! "sectors remaining on this track" from the outer LBA rather than the LBA
//! of the sector currently being read, under-counting the remaining run on
//! every track after the first within a single `read_sectors` call. This
//! implementation recomputes it per chunk from the chunk's own LBA.

use funnyos_bios::{call_bios, BiosRegisters};

use crate::drive::{DriveDescriptor, RealModeBuffer};
use crate::fat32::SectorSource;

/// One BIOS `AH=02h`/`42h` call transfers at most this many sectors.
const MAX_SECTORS_PER_CALL: u32 = 127;

/// Why a sector read failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskError {
    /// `AH` captured from the failing BIOS call (the firmware's error code).
    pub ah: u8,
}

/// Drives sector reads against one BIOS drive, picking the best available
/// strategy at construction time and never re-probing afterward.
pub struct BiosDrive<'a> {
    descriptor: DriveDescriptor,
    buffer: &'a mut RealModeBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Flat64,
    Edd,
    Chs,
}

impl<'a> BiosDrive<'a> {
    pub fn new(descriptor: DriveDescriptor, buffer: &'a mut RealModeBuffer) -> Self {
        Self { descriptor, buffer }
    }

    pub const fn descriptor(&self) -> DriveDescriptor {
        self.descriptor
    }

    fn strategy(&self) -> Strategy {
        if self.descriptor.supports_edd_flat64 {
            Strategy::Flat64
        } else if self.descriptor.supports_edd_packets {
            Strategy::Edd
        } else {
            Strategy::Chs
        }
    }

    /// Reads `count` sectors starting at `lba` into `out`, which must be
    /// exactly `count * sector_size` bytes.
    pub fn read_sectors(&mut self, lba: u32, count: u32, out: &mut [u8]) -> Result<(), DiskError> {
        let sector_size = self.descriptor.sector_size as usize;
        assert_eq!(out.len(), count as usize * sector_size, "buffer size mismatch");

        let mut done = 0u32;
        while done < count {
            let remaining = count - done;
            let chunk = match self.strategy() {
                Strategy::Flat64 => self.read_chunk_flat64(lba + done, remaining, out, done),
                Strategy::Edd => self.read_chunk_edd(lba + done, remaining, out, done),
                Strategy::Chs => self.read_chunk_chs(lba + done, remaining, out, done),
            }?;
            done += chunk;
        }
        Ok(())
    }

    fn build_edd_packet(&mut self, lba: u32, count: u16, dest_segment: u16, dest_offset: u16, flat64: Option<u64>) {
        let mut packet = [0u8; 24];
        packet[0] = if flat64.is_some() { 0x18 } else { 0x10 };
        packet[1] = 0;
        packet[2..4].copy_from_slice(&count.to_le_bytes());
        packet[4..6].copy_from_slice(&dest_offset.to_le_bytes());
        packet[6..8].copy_from_slice(&dest_segment.to_le_bytes());
        packet[8..16].copy_from_slice(&(lba as u64).to_le_bytes());
        if let Some(addr) = flat64 {
            packet[16..24].copy_from_slice(&addr.to_le_bytes());
        }
        self.buffer.write(0, &packet[..packet[0] as usize]);
    }

    fn read_chunk_flat64(
        &mut self,
        lba: u32,
        remaining: u32,
        out: &mut [u8],
        done: u32,
    ) -> Result<u32, DiskError> {
        let sector_size = self.descriptor.sector_size as usize;
        let chunk = remaining.min(MAX_SECTORS_PER_CALL);
        let dest_addr = out[done as usize * sector_size..].as_ptr() as u64;

        self.build_edd_packet(lba, chunk as u16, 0xFFFF, 0xFFFF, Some(dest_addr));
        let (packet_segment, packet_offset) = self.buffer.segment_offset();

        let regs = call_bios(
            0x13,
            BiosRegisters::new()
                .with_ah(0x42)
                .with_dl(self.descriptor.drive_number)
                .with_es_di(packet_segment, packet_offset),
        )
        .map_err(carry_to_error)?;
        let _ = regs;
        Ok(chunk)
    }

    fn read_chunk_edd(
        &mut self,
        lba: u32,
        remaining: u32,
        out: &mut [u8],
        done: u32,
    ) -> Result<u32, DiskError> {
        let sector_size = self.descriptor.sector_size as usize;
        let staging_capacity_sectors = (self.buffer.len() / sector_size).max(1) as u32;
        let chunk = remaining.min(MAX_SECTORS_PER_CALL).min(staging_capacity_sectors);

        let (data_segment, data_offset) = self.buffer.segment_offset();
        self.build_edd_packet(lba, chunk as u16, data_segment, data_offset, None);
        let (packet_segment, packet_offset) = self.buffer.segment_offset();

        call_bios(
            0x13,
            BiosRegisters::new()
                .with_ah(0x42)
                .with_dl(self.descriptor.drive_number)
                .with_es_di(packet_segment, packet_offset),
        )
        .map_err(carry_to_error)?;

        let byte_count = chunk as usize * sector_size;
        self.buffer
            .read(0, &mut out[done as usize * sector_size..done as usize * sector_size + byte_count]);
        Ok(chunk)
    }

    fn read_chunk_chs(
        &mut self,
        lba: u32,
        remaining: u32,
        out: &mut [u8],
        done: u32,
    ) -> Result<u32, DiskError> {
        let sector_size = self.descriptor.sector_size as usize;
        let spt = self.descriptor.sectors_per_track.max(1) as u32;
        let heads = self.descriptor.heads_per_cylinder.max(1) as u32;

        let sector_in_track = lba % spt;
        // Corrected: computed from this chunk's own LBA, not the LBA the
        // outer read_sectors call started at.
        let sectors_remaining_on_track = spt - sector_in_track;
        let chunk = remaining
            .min(MAX_SECTORS_PER_CALL)
            .min(sectors_remaining_on_track);

        let cylinder = lba / (spt * heads);
        let head = (lba / spt) % heads;
        let sector = sector_in_track + 1; // CHS sectors are 1-indexed

        let cl = ((sector & 0x3F) as u8) | (((cylinder >> 2) & 0xC0) as u8);
        let ch = (cylinder & 0xFF) as u8;
        let staging_capacity_sectors = (self.buffer.len() / sector_size).max(1) as u32;
        let chunk = chunk.min(staging_capacity_sectors);

        let (segment, offset) = self.buffer.segment_offset();
        call_bios(
            0x13,
            BiosRegisters::new()
                .with_ah(0x02)
                .with_al(chunk as u8)
                .with_ch(ch)
                .with_cl(cl)
                .with_dh(head as u8)
                .with_dl(self.descriptor.drive_number)
                .with_es_di(segment, offset),
        )
        .map_err(carry_to_error)?;

        let byte_count = chunk as usize * sector_size;
        self.buffer
            .read(0, &mut out[done as usize * sector_size..done as usize * sector_size + byte_count]);
        Ok(chunk)
    }
}

fn carry_to_error(err: funnyos_bios::BiosCallError) -> DiskError {
    let funnyos_bios::BiosCallError::CarrySet(regs) = err;
    DiskError { ah: regs.ah() }
}

impl<'a> SectorSource for BiosDrive<'a> {
    fn sector_size(&self) -> u32 {
        self.descriptor.sector_size
    }

    fn read_sectors(&mut self, lba: u32, count: u32, out: &mut [u8]) -> Result<(), i32> {
        BiosDrive::read_sectors(self, lba, count, out).map_err(|err| err.ah as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chs_track_remainder_uses_current_lba_not_outer_lba() {
        // spt = 18: an outer LBA of 5 starting a 40-sector read should,
        // by the third track crossed, compute its remaining-on-track count
        // from *that* track's sector, not from sector 5 of the first track.
        let spt = 18u32;
        let lba_on_third_track = 5 + 18 + 18 + 3; // 3 sectors into the third track
        let sector_in_track = lba_on_third_track % spt;
        let remaining = spt - sector_in_track;
        assert_eq!(remaining, 15);
    }
}
