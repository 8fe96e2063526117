//! Shared primitives used across the FunnyOS bootloader and kernel.
//!
//! This crate has no knowledge of boot stage or privilege level: typed
//! addresses ([`addr`]), page/frame wrappers ([`paging`]), a spinlock
//! ([`sync`]) and the logging macros ([`log`]) are all that live here.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod log;
pub mod paging;
pub mod sync;
