//! The real-mode BIOS call bridge (§4.D).
//!
//! The bootloader spends most of its life in protected/long mode but still
//! needs BIOS services (disk reads, the E820 memory map) that only exist in
//! real mode. [`call_bios`] is the trampoline contract: drop to real mode,
//! load the requested registers, fire the interrupt, capture the result,
//! return to long mode. The original C implementation expressed register
//! selection with a `printf`-style format string parsed at runtime
//! (`"eax, bh, es:di, =ecx"`); here the same contract is a typed builder
//! over [`BiosRegisters`], so register selection is a compile-time field
//! access instead of a runtime parse that can silently no-op on a malformed
//! format string.

#![cfg_attr(not(test), no_std)]

pub mod gdt;
pub mod registers;

pub use gdt::GdtSelectors;
pub use registers::BiosRegisters;

use core::sync::atomic::{compiler_fence, AtomicPtr, Ordering};

/// The exact bytes shared with the real-mode trampoline: the register
/// state plus the two fields §3.7 says the snapshot carries alongside it
/// — the GDT selector indices and the pending interrupt vector.
///
/// This is the actual FFI contract; [`BiosRegisters`] is the ergonomic
/// subset of it application code builds and reads.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrampolineSnapshot {
    pub registers: BiosRegisters,
    pub interrupt_number: u8,
    pub selector_code64: u16,
    pub selector_data64: u16,
    pub selector_code16: u16,
    pub selector_data16: u16,
}

/// Signature of the architecture-specific trampoline that actually performs
/// the real-mode/long-mode switch and fires the interrupt.
///
/// Implemented in hand-assembled real-mode code outside what stable inline
/// asm can express (a full segment/mode switch): far jump to 16-bit code,
/// disable paging and long mode, load the snapshot's registers, `INT n`,
/// save registers back into the snapshot, re-enter long mode, return.
/// Registered once at startup via [`set_trampoline`], mirroring how the
/// logging sink is registered in `funnyos-core`.
pub type TrampolineFn = unsafe extern "C" fn(snapshot: *mut TrampolineSnapshot) -> bool;

unsafe extern "C" fn null_trampoline(_snapshot: *mut TrampolineSnapshot) -> bool {
    false
}

static TRAMPOLINE_FN: AtomicPtr<()> = AtomicPtr::new(null_trampoline as *mut ());

/// Registers the real-mode trampoline.
///
/// # Safety
///
/// `f` must be the address of actual, correctly assembled real-mode
/// switching code — see the module docs. The C-visible state before and
/// after a call must be exactly the snapshot it is given; it must not
/// mutate any caller-owned memory besides that.
pub unsafe fn set_trampoline(f: TrampolineFn) {
    TRAMPOLINE_FN.store(f as *mut (), Ordering::Release);
}

fn load_trampoline() -> TrampolineFn {
    let ptr = TRAMPOLINE_FN.load(Ordering::Acquire);
    // SAFETY: only `set_trampoline` ever stores into TRAMPOLINE_FN.
    unsafe { core::mem::transmute(ptr) }
}

/// Why [`call_bios`] failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiosCallError {
    /// The BIOS service set the carry flag, signaling failure. Carries the
    /// register state at return, since BIOS services often stuff an error
    /// code into `AH` alongside the carry flag.
    CarrySet(BiosRegisters),
}

/// Calls BIOS interrupt `interrupt` with `regs` loaded into the real-mode
/// register file, returning the register state after the call.
///
/// The snapshot's interrupt number and GDT selectors (whatever was most
/// recently installed via [`setup_call_bios_interface`]) are set here, not
/// by the caller — `regs` only ever needs to carry the general-purpose and
/// segment state a particular BIOS function documents.
///
/// `Err` iff the carry flag was set on return (§4.D failure semantics); the
/// error variant still carries the returned registers, since many BIOS
/// calls report a specific failure code in `AH` even on the error path.
///
/// A `compiler_fence` follows the trampoline call: the trampoline mutates
/// memory (the register buffer, possibly a disk transfer buffer) through
/// paths the optimizer cannot see, and reordering around a real mode
/// switch would be a logic bug, not just a performance one.
pub fn call_bios(interrupt: u8, regs: BiosRegisters) -> Result<BiosRegisters, BiosCallError> {
    let selectors = gdt::current();
    let mut snapshot = TrampolineSnapshot {
        registers: regs,
        interrupt_number: interrupt,
        selector_code64: selectors.code64,
        selector_data64: selectors.data64,
        selector_code16: selectors.code16,
        selector_data16: selectors.data16,
    };

    let trampoline = load_trampoline();
    // SAFETY: the trampoline is expected to save/restore everything it
    // needs to safely round-trip through real mode and back, touching only
    // the snapshot it's given.
    let carry_clear = unsafe { trampoline(&mut snapshot) };
    compiler_fence(Ordering::SeqCst);

    if carry_clear {
        Ok(snapshot.registers)
    } else {
        Err(BiosCallError::CarrySet(snapshot.registers))
    }
}

/// Installs the GDT selectors [`call_bios`]'s trampoline uses to reload
/// segment registers when switching between long mode and real mode.
pub fn setup_call_bios_interface(selectors: GdtSelectors) {
    gdt::install(selectors);
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn fake_success(snapshot: *mut TrampolineSnapshot) -> bool {
        // SAFETY: test-only trampoline; `snapshot` is a valid pointer from call_bios.
        unsafe { (*snapshot).registers.eax = 0x0000_1234 };
        true
    }

    unsafe extern "C" fn fake_failure(snapshot: *mut TrampolineSnapshot) -> bool {
        // SAFETY: test-only trampoline; `snapshot` is a valid pointer from call_bios.
        unsafe { (*snapshot).registers.eax = 0x0000_00FF };
        false
    }

    unsafe extern "C" fn echoes_selectors(snapshot: *mut TrampolineSnapshot) -> bool {
        // SAFETY: test-only trampoline; `snapshot` is a valid pointer from call_bios.
        unsafe {
            (*snapshot).registers.ecx = (*snapshot).selector_code16 as u32;
            (*snapshot).registers.edx = (*snapshot).interrupt_number as u32;
        }
        true
    }

    #[test]
    fn successful_call_returns_registers() {
        unsafe { set_trampoline(fake_success) };
        let result = call_bios(0x13, BiosRegisters::new()).unwrap();
        assert_eq!(result.eax, 0x1234);
    }

    #[test]
    fn carry_set_is_reported_as_error_with_registers() {
        unsafe { set_trampoline(fake_failure) };
        let err = call_bios(0x13, BiosRegisters::new()).unwrap_err();
        let BiosCallError::CarrySet(regs) = err;
        assert_eq!(regs.eax, 0x00FF);
    }

    #[test]
    fn call_bios_threads_interrupt_number_and_selectors_into_the_snapshot() {
        setup_call_bios_interface(GdtSelectors {
            code64: 0x08,
            data64: 0x10,
            code16: 0x18,
            data16: 0x20,
        });
        unsafe { set_trampoline(echoes_selectors) };
        let result = call_bios(0x15, BiosRegisters::new()).unwrap();
        assert_eq!(result.ecx, 0x18);
        assert_eq!(result.edx, 0x15);
    }
}
