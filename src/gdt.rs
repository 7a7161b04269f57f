use core::cell::UnsafeCell;
use spin::Once;
use x86_64::VirtAddr;
use x86_64::structures::tss::TaskStateSegment;
use x86_64::structures::gdt::{GlobalDescriptorTable, Descriptor, SegmentSelector};

use crate::percpu::{CoreId, MAX_CORES};

// Fixed layout, identical on every core:
//   0 null | 1 kernel code | 2 kernel data | 3 user data | 4 user code | 5-6 TSS
// User data sits below user code so SYSRET/STAR arithmetic works.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_DATA_SELECTOR: u16 = 0x18 | 3;
pub const USER_CODE_SELECTOR: u16 = 0x20 | 3;
pub const TSS_SELECTOR: u16 = 0x28;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const IST_STACK_SIZE: usize = 4096 * 5;

#[repr(C, align(16))]
struct IstStack(UnsafeCell<[u8; IST_STACK_SIZE]>);

// SAFETY: only the CPU touches these, through the TSS.
unsafe impl Sync for IstStack {}

struct TssSlot(UnsafeCell<TaskStateSegment>);

// SAFETY: slot N is written only by core N (or the BSP before N starts).
unsafe impl Sync for TssSlot {}

static DOUBLE_FAULT_STACKS: [IstStack; MAX_CORES] =
    [const { IstStack(UnsafeCell::new([0; IST_STACK_SIZE])) }; MAX_CORES];

static TSS: [TssSlot; MAX_CORES] =
    [const { TssSlot(UnsafeCell::new(TaskStateSegment::new())) }; MAX_CORES];

static GDT: [Once<GlobalDescriptorTable>; MAX_CORES] = [const { Once::new() }; MAX_CORES];

fn build_table(slot: usize) -> GlobalDescriptorTable {
    let mut gdt = GlobalDescriptorTable::new();
    let code = gdt.add_entry(Descriptor::kernel_code_segment());
    let data = gdt.add_entry(Descriptor::kernel_data_segment());
    let user_data = gdt.add_entry(Descriptor::user_data_segment());
    let user_code = gdt.add_entry(Descriptor::user_code_segment());
    // SAFETY: the TSS is a static that outlives the table. It is mutated
    // later (rsp0) through the raw pointer only.
    let tss = gdt.add_entry(unsafe { Descriptor::tss_segment_unchecked(TSS[slot].0.get()) });

    debug_assert_eq!(code.0, KERNEL_CODE_SELECTOR);
    debug_assert_eq!(data.0, KERNEL_DATA_SELECTOR);
    debug_assert_eq!(user_data.0 | 3, USER_DATA_SELECTOR);
    debug_assert_eq!(user_code.0 | 3, USER_CODE_SELECTOR);
    debug_assert_eq!(tss.0, TSS_SELECTOR);
    gdt
}

/// Builds and loads this core's GDT and TSS. Call once, on `core` itself.
pub fn install(core: CoreId) {
    use x86_64::instructions::tables::load_tss;
    use x86_64::instructions::segmentation::{CS, DS, ES, SS, Segment};

    let slot = core.index();
    let df_stack = DOUBLE_FAULT_STACKS[slot].0.get() as u64;
    unsafe {
        (*TSS[slot].0.get()).interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
            VirtAddr::new(df_stack + IST_STACK_SIZE as u64);
    }

    let gdt = GDT[slot].call_once(|| build_table(slot));
    gdt.load();
    unsafe {
        CS::set_reg(SegmentSelector(KERNEL_CODE_SELECTOR));
        SS::set_reg(SegmentSelector(KERNEL_DATA_SELECTOR));
        DS::set_reg(SegmentSelector(0));
        ES::set_reg(SegmentSelector(0));
        load_tss(SegmentSelector(TSS_SELECTOR));
    }
}

/// Points the TSS ring-0 stack (used for interrupts from ring 3) at `top`.
pub fn set_privileged_stack(core: CoreId, top: u64) {
    unsafe {
        (*TSS[core.index()].0.get()).privilege_stack_table[0] = VirtAddr::new(top);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_fit_sysret_layout() {
        // SYSRET loads SS from base + 8 and CS from base + 16.
        let sysret_base = USER_DATA_SELECTOR - 8;
        assert_eq!(sysret_base + 16, USER_CODE_SELECTOR);
        assert_eq!(KERNEL_CODE_SELECTOR + 8, KERNEL_DATA_SELECTOR);
    }

    #[test]
    fn user_selectors_request_ring_three() {
        assert_eq!(USER_CODE_SELECTOR & 3, 3);
        assert_eq!(USER_DATA_SELECTOR & 3, 3);
        assert_eq!(KERNEL_CODE_SELECTOR & 3, 0);
        assert_eq!(TSS_SELECTOR >> 3, 5);
    }
}
