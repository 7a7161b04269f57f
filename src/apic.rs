//! Local APIC: per-core timer, end-of-interrupt and IPIs.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use volatile::VolatilePtr;
use x86_64::registers::model_specific::Msr;

use crate::interrupts::{SPURIOUS_VECTOR, TIMER_VECTOR};
use crate::{memory, state};

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_BASE_GLOBAL_ENABLE: u64 = 1 << 11;
const APIC_BASE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

// Register offsets
const REG_ID: usize = 0x20;
const REG_TPR: usize = 0x80;
const REG_EOI: usize = 0xB0;
const REG_SPURIOUS: usize = 0xF0;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_TIMER_ICR: usize = 0x380;
const REG_TIMER_DCR: usize = 0x3E0;

const SPURIOUS_ENABLE: u32 = 1 << 8;
const LVT_MASKED: u32 = 1 << 16;
const TIMER_PERIODIC: u32 = 1 << 17;
const TIMER_DIV_16: u32 = 0x3;
const ICR_DELIVERY_STATUS: u32 = 1 << 12;
const ICR_LEVEL_ASSERT: u32 = 1 << 14;
const ICR_ALL_EXCLUDING_SELF: u32 = 0x3 << 18;

/// Virtual address of the register page; 0 until [`init`].
static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);
static TIMER_INITIAL_COUNT: AtomicU32 = AtomicU32::new(0x20_0000);

fn register(offset: usize) -> Option<VolatilePtr<'static, u32>> {
    let base = LAPIC_BASE.load(Ordering::Acquire);
    if base == 0 {
        return None;
    }
    let ptr = NonNull::new((base as usize + offset) as *mut u32)?;
    // SAFETY: the page is mapped uncached by `init` and never unmapped.
    Some(unsafe { VolatilePtr::new(ptr) })
}

fn read(offset: usize) -> u32 {
    register(offset).map_or(0, |r| r.read())
}

fn write(offset: usize, value: u32) {
    if let Some(r) = register(offset) {
        r.write(value);
    }
}

/// Maps the register page. BSP only, before any core calls [`enable`].
pub fn init() -> Result<(), memory::MapError> {
    let phys = unsafe { Msr::new(IA32_APIC_BASE).read() } & APIC_BASE_ADDR_MASK;
    let virt = state::phys_to_virt(phys);
    unsafe { memory::map_mmio_page(virt, phys)? };
    LAPIC_BASE.store(virt, Ordering::Release);
    klog_debug!("lapic: phys {:#x} mapped at {:#x}", phys, virt);
    Ok(())
}

/// Software-enables the calling core's APIC and accepts every priority.
pub fn enable() {
    let mut base_msr = Msr::new(IA32_APIC_BASE);
    unsafe {
        let value = base_msr.read();
        if value & APIC_BASE_GLOBAL_ENABLE == 0 {
            base_msr.write(value | APIC_BASE_GLOBAL_ENABLE);
        }
    }
    write(REG_TPR, 0);
    write(REG_SPURIOUS, SPURIOUS_ENABLE | SPURIOUS_VECTOR as u32);
}

pub fn id() -> u32 {
    read(REG_ID) >> 24
}

pub fn eoi() {
    write(REG_EOI, 0);
}

pub fn set_timer_initial_count(count: u32) {
    TIMER_INITIAL_COUNT.store(count.max(1), Ordering::Relaxed);
}

/// Starts the periodic scheduler tick on the calling core.
pub fn arm_timer() {
    write(REG_TIMER_DCR, TIMER_DIV_16);
    write(REG_LVT_TIMER, TIMER_PERIODIC | TIMER_VECTOR as u32);
    write(REG_TIMER_ICR, TIMER_INITIAL_COUNT.load(Ordering::Relaxed));
}

pub fn disarm_timer() {
    write(REG_LVT_TIMER, LVT_MASKED | TIMER_VECTOR as u32);
    write(REG_TIMER_ICR, 0);
}

/// Fixed IPI with `vector` to every core but the caller.
pub fn send_ipi_all_but_self(vector: u8) {
    if register(REG_ICR_LOW).is_none() {
        return;
    }
    while read(REG_ICR_LOW) & ICR_DELIVERY_STATUS != 0 {
        core::hint::spin_loop();
    }
    write(REG_ICR_HIGH, 0);
    write(REG_ICR_LOW, ICR_ALL_EXCLUDING_SELF | ICR_LEVEL_ASSERT | vector as u32);
}
