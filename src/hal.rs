//! The real [`Machine`]: one zero-sized handle per call site, all state in
//! the CPU and the statics behind it.

use x86_64::VirtAddr;
use x86_64::registers::control::Cr3;
use x86_64::registers::model_specific::FsBase;
use x86_64::structures::paging::PhysFrame;

use crate::frame::SyscallFrame;
use crate::interrupts::WAKEUP_VECTOR;
use crate::percpu::CoreId;
use crate::scheduler::{Machine, TransferFault};
use crate::{apic, gdt, memory, percpu, smp, userspace};

#[derive(Clone, Copy, Debug, Default)]
pub struct X86Machine;

impl Machine for X86Machine {
    fn online_cores(&self) -> usize {
        smp::online_cores()
    }

    fn set_kernel_stack(&self, core: CoreId, top: u64) {
        gdt::set_privileged_stack(core, top);
        percpu::set_syscall_stack(core, top);
    }

    fn read_tls_base(&self) -> u64 {
        FsBase::read().as_u64()
    }

    fn write_tls_base(&self, base: u64) {
        FsBase::write(VirtAddr::new_truncate(base));
    }

    fn activate_address_space(&self, root: u64) {
        let (active, flags) = Cr3::read();
        if root == 0 || active.start_address().as_u64() == root {
            return;
        }
        let Ok(frame) = PhysFrame::from_start_address(x86_64::PhysAddr::new(root)) else {
            klog_error!("refusing unaligned page table root {:#x}", root);
            return;
        };
        unsafe { Cr3::write(frame, flags) };
    }

    fn user_page_accessible(&self, page: u64) -> bool {
        memory::user_page_accessible(page)
    }

    fn wake_cores(&self) {
        if smp::online_cores() > 1 {
            apic::send_ipi_all_but_self(WAKEUP_VECTOR);
        }
    }

    fn enter_user(&self, _core: CoreId, frame: &SyscallFrame) -> TransferFault {
        userspace::resume(frame)
    }

    fn idle(&self) {
        // Wake on the next tick or IPI, then go back to running with
        // interrupts off so nothing preempts the dispatch path.
        x86_64::instructions::interrupts::enable_and_hlt();
        x86_64::instructions::interrupts::disable();
    }
}
