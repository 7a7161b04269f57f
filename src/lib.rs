#![cfg_attr(not(test), no_std)]
#![feature(abi_x86_interrupt)]

// --- EXTERNAL CRATES ---
extern crate alloc;

// --- MODULES ---
// Logging first so every other module can use the klog macros.
#[macro_use]
pub mod logger;

pub mod allocator;
pub mod apic;
pub mod config;
pub mod frame;
pub mod gdt;
pub mod hal;
pub mod interrupts;
pub mod memory;
pub mod percpu;
pub mod process;
pub mod programs;
pub mod runqueue;
pub mod scheduler;
pub mod serial;
pub mod smp;
pub mod state;
pub mod syscall;
pub mod userspace;
pub mod writer;
