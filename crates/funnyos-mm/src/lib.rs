//! Physical and virtual memory management.
//!
//! [`memmap`] turns a raw BIOS E820 map into a canonical region list,
//! [`pmm`] manages frame allocation out of that list via per-region control
//! blocks, and [`vmm`] builds the 4-level page-table hierarchy that maps
//! those frames into the kernel's address space.

#![cfg_attr(not(test), no_std)]

pub mod mapper;
pub mod memmap;
pub mod pmm;
pub mod vmm;
