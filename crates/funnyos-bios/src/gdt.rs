//! GDT selector bookkeeping for the real-mode trampoline (§4.D), grounded on
//! `RealMode.hpp`'s `GDTInfo` and `BIOS.hpp`'s `SetupCallBiosInterface`.
//!
//! The trampoline needs to know which GDT selectors correspond to 64-bit
//! code/data and legacy 16-bit code/data so it can reload `CS`/`DS` while
//! switching rings; the kernel's GDT is built elsewhere (`funnyos-mm`
//! doesn't own segmentation), so this module just holds the four selector
//! values the trampoline reads at call time.

use core::sync::atomic::{AtomicU16, Ordering};

/// The four GDT selectors the long-mode/real-mode switch reloads.
///
/// Named after the modes they select into, not the registers they get
/// loaded into, since which register each lands in is an x86 calling
/// convention detail the trampoline alone needs to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GdtSelectors {
    pub code64: u16,
    pub data64: u16,
    pub code16: u16,
    pub data16: u16,
}

static CODE64: AtomicU16 = AtomicU16::new(0);
static DATA64: AtomicU16 = AtomicU16::new(0);
static CODE16: AtomicU16 = AtomicU16::new(0);
static DATA16: AtomicU16 = AtomicU16::new(0);

/// Publishes the selectors the trampoline will read on its next call.
pub(crate) fn install(selectors: GdtSelectors) {
    CODE64.store(selectors.code64, Ordering::Release);
    DATA64.store(selectors.data64, Ordering::Release);
    CODE16.store(selectors.code16, Ordering::Release);
    DATA16.store(selectors.data16, Ordering::Release);
}

/// Reads back the selectors most recently installed by
/// [`crate::setup_call_bios_interface`].
///
/// Meant for the trampoline implementation, which lives outside this crate
/// (see the [module docs](crate) on [`crate::TrampolineFn`]).
pub fn current() -> GdtSelectors {
    GdtSelectors {
        code64: CODE64.load(Ordering::Acquire),
        data64: DATA64.load(Ordering::Acquire),
        code16: CODE16.load(Ordering::Acquire),
        data16: DATA16.load(Ordering::Acquire),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installed_selectors_round_trip() {
        let selectors = GdtSelectors {
            code64: 0x08,
            data64: 0x10,
            code16: 0x18,
            data16: 0x20,
        };
        install(selectors);
        assert_eq!(current(), selectors);
    }
}
