//! Synchronization primitives for a single-threaded, cooperative kernel.
//!
//! The concurrency model (see the repository's design notes) never runs two
//! call chains concurrently, but the bootloader and kernel still reach for a
//! lock around singleton state (the BIOS register snapshot, the real-mode
//! staging buffer, the physical memory manager) so that the owning type can
//! be a `static` without `unsafe` at every call site.

mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
