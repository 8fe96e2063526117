//! Turns a raw BIOS E820 memory map into a canonical, non-overlapping region
//! list the physical memory manager can build control blocks over.
//!
//! The raw map handed up by the bootloader's INT 15h, EAX=E820h collection
//! loop routinely contains duplicate and overlapping entries — different
//! BIOSes report the same physical range under more than one type, and some
//! report zero-length entries outright. [`normalize`] resolves overlaps by a
//! per-class weight, coalesces adjacent same-class regions, and splits the
//! list at the kernel's direct-mapped-memory boundary.

use funnyos_core::addr::PhysAddr;
use planck_noalloc::vec::ArrayVec;

/// Upper bound on the number of regions a single normalization can produce.
///
/// A handful of raw E820 entries (rarely more than ~30 on real firmware) can
/// each be split at most once by overlap resolution and once more by the
/// boundary split, which comfortably fits under this cap.
pub const MAX_REGIONS: usize = 128;

/// A single entry as collected from INT 15h, EAX=E820h.
#[derive(Debug, Clone, Copy)]
pub struct RawMapEntry {
    /// Physical base address of the range.
    pub base: u64,
    /// Length of the range in bytes.
    pub length: u64,
    /// BIOS-reported region type (1 = Available, 2 = Reserved, ...).
    pub region_type: u32,
    /// ACPI 3.0 extended attributes, or `0` if the BIOS doesn't report them.
    pub acpi_flags: u32,
}

/// Bit 0 of the ACPI extended attributes: clear means "ignore this entry".
const ACPI_DONT_IGNORE: u32 = 0b01;

/// The classification assigned to a [`MemoryRegion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryClass {
    /// Free and immediately allocable.
    Available,
    /// Never allocable; owned by firmware or chipset.
    Reserved,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaim,
    /// ACPI non-volatile storage; never reclaimable.
    AcpiNvs,
    /// Occupied by the loaded kernel image.
    KernelImage,
    /// Bootloader page tables; reclaimable once the kernel installs its own.
    PageTableReclaimable,
    /// Above the kernel's direct-map boundary; reclaimable once extended.
    LongMemReclaimable,
    /// Unrecognized region type, or an entry whose ACPI flags say to ignore it.
    Unknown,
}

impl MemoryClass {
    /// The weight used to resolve overlaps between two usable regions.
    /// `Available` is `0`, any reclaimable class is `1`, everything else is
    /// excluded from overlap resolution entirely (see [`Self::is_usable`]).
    const fn weight(self) -> u32 {
        match self {
            Self::Available => 0,
            Self::AcpiReclaim | Self::PageTableReclaimable | Self::LongMemReclaimable => 1,
            Self::Reserved | Self::AcpiNvs | Self::KernelImage | Self::Unknown => u32::MAX,
        }
    }

    /// Usable classes participate in overlap resolution; everything else is
    /// left exactly as the BIOS reported it.
    const fn is_usable(self) -> bool {
        self.weight() != u32::MAX
    }
}

/// Maps a raw E820 type/flags pair onto a [`MemoryClass`].
pub fn classify(region_type: u32, acpi_flags: u32) -> MemoryClass {
    let flags = if acpi_flags == 0 { ACPI_DONT_IGNORE } else { acpi_flags };
    if flags & ACPI_DONT_IGNORE == 0 {
        return MemoryClass::Unknown;
    }
    match region_type {
        1 => MemoryClass::Available,
        2 => MemoryClass::Reserved,
        3 => MemoryClass::AcpiReclaim,
        4 => MemoryClass::AcpiNvs,
        _ => MemoryClass::Unknown,
    }
}

/// A normalized, half-open physical address range with a single class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Inclusive start of the range.
    pub start: PhysAddr,
    /// Exclusive end of the range.
    pub end: PhysAddr,
    /// The region's class.
    pub class: MemoryClass,
}

impl MemoryRegion {
    /// Length of the region in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// `true` if the region is empty.
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    const fn invalidated() -> Self {
        Self {
            start: PhysAddr::zero(),
            end: PhysAddr::zero(),
            class: MemoryClass::Unknown,
        }
    }

    fn is_invalidated(&self) -> bool {
        self.start.as_u64() == 0 && self.end.as_u64() == 0
    }
}

/// The region list produced by [`normalize`].
pub type RegionList = ArrayVec<MemoryRegion, MAX_REGIONS>;

/// Builds the canonical region list from a raw E820 map.
///
/// `direct_map_boundary` is the physical address above which memory is not
/// part of the kernel's initial direct mapping (`0x1_0000_0000` for the
/// 4 GiB kernel-stage boundary, `0x4000_0000` for the 1 GiB bootloader-stage
/// one — see [`split_at_boundary`]).
pub fn normalize(entries: &[RawMapEntry], direct_map_boundary: u64) -> RegionList {
    let mut regions = RegionList::new();
    for entry in entries {
        if entry.length == 0 {
            continue;
        }
        regions.push(MemoryRegion {
            start: PhysAddr::new_truncate(entry.base),
            end: PhysAddr::new_truncate(entry.base + entry.length),
            class: classify(entry.region_type, entry.acpi_flags),
        });
    }

    resolve_overlaps(&mut regions);
    remove_invalidated(&mut regions);
    coalesce_adjacent(&mut regions);
    split_at_boundary(&mut regions, direct_map_boundary);
    regions
}

#[derive(Clone, Copy)]
enum OverlapCase {
    /// `r` is fully covered by `o`.
    Inside,
    /// `o` is fully covered by `r`; `r` must be split around the hole.
    Contains,
    /// Only `r`'s start falls inside `o`.
    StartIn,
    /// Only `r`'s last byte falls inside `o`.
    EndIn,
}

fn overlap_case(r: (u64, u64), o: (u64, u64)) -> Option<OverlapCase> {
    let (rs, re) = r;
    let (os, oe) = o;
    if rs >= oe || os >= re {
        return None;
    }
    if rs >= os && re <= oe {
        return Some(OverlapCase::Inside);
    }
    if os >= rs && oe <= re {
        return Some(OverlapCase::Contains);
    }
    if rs >= os && rs < oe {
        Some(OverlapCase::StartIn)
    } else {
        Some(OverlapCase::EndIn)
    }
}

/// Resolves overlaps between usable regions.
///
/// Regions are compared in list order: for a pair `(i, j)` with `i < j`,
/// region `i` is held fixed and region `j` is clipped, split, or
/// invalidated around it. Equal-weight pairs are skipped outright — two
/// regions of the same class never displace one another. This runs to a
/// fixed point since a split can introduce a new region (appended at the
/// end) that itself needs to be checked against its neighbors.
fn resolve_overlaps(regions: &mut RegionList) {
    loop {
        let mut changed = false;
        let mut i = 0;
        while i < regions.len() {
            if regions[i].is_invalidated() || !regions[i].class.is_usable() {
                i += 1;
                continue;
            }
            let mut j = i + 1;
            while j < regions.len() {
                if regions[j].is_invalidated() || !regions[j].class.is_usable() {
                    j += 1;
                    continue;
                }
                if regions[i].class.weight() == regions[j].class.weight() {
                    j += 1;
                    continue;
                }

                let o = regions[i];
                let r = regions[j];
                match overlap_case((r.start.as_u64(), r.end.as_u64()), (o.start.as_u64(), o.end.as_u64())) {
                    None => {}
                    Some(OverlapCase::Inside) => {
                        regions[j] = MemoryRegion::invalidated();
                        changed = true;
                    }
                    Some(OverlapCase::StartIn) => {
                        regions[j].start = o.end;
                        changed = true;
                    }
                    Some(OverlapCase::EndIn) => {
                        regions[j].end = o.start;
                        changed = true;
                    }
                    Some(OverlapCase::Contains) => {
                        let high = MemoryRegion {
                            start: o.end,
                            end: r.end,
                            class: r.class,
                        };
                        regions[j].end = o.start;
                        regions.push(high);
                        changed = true;
                    }
                }
                j += 1;
            }
            i += 1;
        }
        if !changed {
            break;
        }
    }
}

fn remove_invalidated(regions: &mut RegionList) {
    let mut i = 0;
    while i < regions.len() {
        if regions[i].is_invalidated() || regions[i].is_empty() {
            regions.remove(i);
        } else {
            i += 1;
        }
    }
}

/// Repeatedly merges exactly-adjacent, same-class regions into one.
fn coalesce_adjacent(regions: &mut RegionList) {
    loop {
        let mut merged = false;
        let mut i = 0;
        'outer: while i < regions.len() {
            let mut j = 0;
            while j < regions.len() {
                if i != j && regions[i].class == regions[j].class && regions[i].end == regions[j].start {
                    regions[i].end = regions[j].end;
                    regions.remove(j);
                    merged = true;
                    continue 'outer;
                }
                j += 1;
            }
            i += 1;
        }
        if !merged {
            break;
        }
    }
}

/// Splits or retags `Available` regions around `boundary`.
///
/// A region straddling the boundary is split into a low `Available` half and
/// a high `LongMemReclaimable` half; a region entirely above the boundary is
/// retagged wholesale.
fn split_at_boundary(regions: &mut RegionList, boundary: u64) {
    let boundary = PhysAddr::new_truncate(boundary);
    let mut i = 0;
    while i < regions.len() {
        if regions[i].class != MemoryClass::Available {
            i += 1;
            continue;
        }
        let region = regions[i];
        if region.start >= boundary {
            regions[i].class = MemoryClass::LongMemReclaimable;
        } else if region.end > boundary {
            regions[i].end = boundary;
            regions.push(MemoryRegion {
                start: boundary,
                end: region.end,
                class: MemoryClass::LongMemReclaimable,
            });
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: u64, end: u64, class: MemoryClass) -> MemoryRegion {
        MemoryRegion {
            start: PhysAddr::new_truncate(start),
            end: PhysAddr::new_truncate(end),
            class,
        }
    }

    /// Scenario 1: an ACPI-reclaim region overlapping two Available regions
    /// on either side resolves to three adjacent, non-overlapping regions.
    #[test]
    fn overlap_resolution_scenario_1() {
        let entries = [
            RawMapEntry { base: 0x1000, length: 0x1000, region_type: 1, acpi_flags: 0 },
            RawMapEntry { base: 0x1500, length: 0x2000, region_type: 3, acpi_flags: 0 },
            RawMapEntry { base: 0x3000, length: 0x1000, region_type: 1, acpi_flags: 0 },
        ];

        let regions = normalize(&entries, 0x1_0000_0000);
        assert_eq!(regions.len(), 3);
        assert_eq!(regions.as_slice()[0], region(0x1000, 0x2000, MemoryClass::Available));
        assert_eq!(regions.as_slice()[1], region(0x2000, 0x3500, MemoryClass::AcpiReclaim));
        assert_eq!(regions.as_slice()[2], region(0x3500, 0x4000, MemoryClass::Available));
    }

    /// Scenario 2: an Available region straddling the 4 GiB boundary is split
    /// into an Available low half and a LongMemReclaimable high half.
    #[test]
    fn boundary_split_scenario_2() {
        let entries = [RawMapEntry {
            base: 0xFFF0_0000,
            length: 0x1_2000_0000 - 0xFFF0_0000,
            region_type: 1,
            acpi_flags: 0,
        }];

        let regions = normalize(&entries, 0x1_0000_0000);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions.as_slice()[0], region(0xFFF0_0000, 0x1_0000_0000, MemoryClass::Available));
        assert_eq!(
            regions.as_slice()[1],
            region(0x1_0000_0000, 0x1_2000_0000, MemoryClass::LongMemReclaimable)
        );
    }

    #[test]
    fn zero_length_entries_are_dropped() {
        let entries = [RawMapEntry { base: 0x1000, length: 0, region_type: 1, acpi_flags: 0 }];
        assert!(normalize(&entries, 0x1_0000_0000).is_empty());
    }

    #[test]
    fn adjacent_same_class_regions_coalesce() {
        let entries = [
            RawMapEntry { base: 0x1000, length: 0x1000, region_type: 1, acpi_flags: 0 },
            RawMapEntry { base: 0x2000, length: 0x1000, region_type: 1, acpi_flags: 0 },
        ];
        let regions = normalize(&entries, 0x1_0000_0000);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions.as_slice()[0], region(0x1000, 0x3000, MemoryClass::Available));
    }

    #[test]
    fn equal_weight_overlap_is_left_untouched() {
        // Two Available entries overlapping shouldn't happen on real firmware,
        // but the tie-break rule says neither displaces the other: they are
        // not exactly adjacent, so coalescing leaves them as reported.
        let entries = [
            RawMapEntry { base: 0x1000, length: 0x2000, region_type: 1, acpi_flags: 0 },
            RawMapEntry { base: 0x2500, length: 0x1b00, region_type: 1, acpi_flags: 0 },
        ];
        let regions = normalize(&entries, 0x1_0000_0000);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions.as_slice()[0], region(0x1000, 0x3000, MemoryClass::Available));
        assert_eq!(regions.as_slice()[1], region(0x2500, 0x4000, MemoryClass::Available));
    }

    #[test]
    fn ignored_acpi_entry_is_classified_unknown() {
        assert_eq!(classify(1, 0b10), MemoryClass::Unknown);
        assert_eq!(classify(1, 0b01), MemoryClass::Available);
        assert_eq!(classify(1, 0), MemoryClass::Available);
    }
}
