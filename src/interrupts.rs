use core::arch::global_asm;
use lazy_static::lazy_static;
use pic8259::ChainedPics;
use x86_64::VirtAddr;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::frame::{self, InterruptFrame};
use crate::hal::X86Machine;
use crate::scheduler::{Resched, SCHEDULER};
use crate::{apic, gdt, percpu, userspace};

pub const TIMER_VECTOR: u8 = 0x20;
pub const WAKEUP_VECTOR: u8 = 0xF0;
pub const SPURIOUS_VECTOR: u8 = 0xFF;

// The legacy PICs are parked out of the way before being masked, so a stray
// IRQ can never alias the APIC timer vector.
const PIC_OFFSET: u8 = 0xE0;

extern "C" {
    fn kairos_timer_entry();
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
            idt[TIMER_VECTOR as usize]
                .set_handler_addr(VirtAddr::new(kairos_timer_entry as usize as u64));
        }
        idt[WAKEUP_VECTOR as usize].set_handler_fn(wakeup_handler);
        idt[SPURIOUS_VECTOR as usize].set_handler_fn(spurious_handler);
        idt
    };
}

/// Loads the shared IDT on the calling core.
pub fn init_idt() {
    IDT.load();
}

/// Remaps and masks both 8259s. The local APIC takes over from here.
pub fn disable_legacy_pic() {
    unsafe {
        let mut pics = ChainedPics::new(PIC_OFFSET, PIC_OFFSET + 8);
        pics.initialize();
        pics.disable();
    }
}

// --- EXCEPTIONS ---

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    klog_warn!("breakpoint at {:#x}", stack_frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    panic!("invalid opcode\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn general_protection_handler(stack_frame: InterruptStackFrame, error_code: u64) {
    panic!("general protection fault (error {:#x})\n{:#?}", error_code, stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;
    panic!(
        "page fault at {:#x} ({:?})\n{:#?}",
        Cr2::read().as_u64(),
        error_code,
        stack_frame
    );
}

extern "x86-interrupt" fn double_fault_handler(stack_frame: InterruptStackFrame, _error_code: u64) -> ! {
    panic!("double fault\n{:#?}", stack_frame);
}

// --- DEVICE VECTORS ---

extern "x86-interrupt" fn wakeup_handler(_stack_frame: InterruptStackFrame) {
    // Only here to break a core out of `hlt`.
    apic::eoi();
}

extern "x86-interrupt" fn spurious_handler(_stack_frame: InterruptStackFrame) {}

// --- TIMER ---
//
// Saves every general-purpose register in `InterruptFrame` order. A tick
// from ring 3 lands on the running process's privileged stack (TSS.rsp0);
// the stub leaves that stack at once and runs the handler on the core's
// own stack, because the process may be requeued and picked up by another
// core before this one is done. A tick from ring 0 stays where it is and
// returns normally.
global_asm!(
    ".global kairos_timer_entry",
    "kairos_timer_entry:",
    "test qword ptr [rsp + 8], 3",
    "jz 2f",
    "swapgs",
    "cld",
    "push rax",
    "push rbx",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push rbp",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov rdi, rsp",
    "mov rsp, qword ptr gs:[{core_stack}]",
    "call kairos_user_tick",
    "ud2",
    "2:",
    "push rax",
    "push rbx",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push rbp",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov rdi, rsp",
    "cld",
    "call kairos_kernel_tick",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rbp",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rbx",
    "pop rax",
    "iretq",
    core_stack = const percpu::CORE_LOCAL_CORE_STACK,
);

/// Tick taken in ring 3. Runs on the core stack and never returns into
/// the stub: it either resumes a process or falls into the run loop.
#[no_mangle]
extern "C" fn kairos_user_tick(saved: *const InterruptFrame) -> ! {
    // Copy out before anything else: `saved` lives on a stack this core may
    // no longer own after the reschedule.
    let mut trap = unsafe { *saved };
    apic::eoi();

    let core = percpu::current();
    let hw = X86Machine;
    match SCHEDULER.on_tick(core, &mut trap, &hw) {
        Resched::Resume => match frame::capture(&trap) {
            Some(next) => userspace::resume(&next),
            None => SCHEDULER.run(core, &hw),
        },
        Resched::Idle => SCHEDULER.run(core, &hw),
    }
}

/// Tick taken in ring 0 (idle loop or kernel code).
#[no_mangle]
extern "C" fn kairos_kernel_tick(saved: *mut InterruptFrame) {
    apic::eoi();
    let core = percpu::current();
    let trap = unsafe { &mut *saved };
    let _ = SCHEDULER.on_tick(core, trap, &X86Machine);
}
