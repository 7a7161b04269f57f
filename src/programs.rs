//! Built-in ring-3 demo workload.

use alloc::vec;

use crate::memory;
use crate::process::{ProcessImage, KERNEL_STACK_SIZE};
use crate::scheduler::{Machine, SCHEDULER};
use crate::state;

const PAGE_SIZE: u64 = 4096;
const CODE_BASE: u64 = 0x40_0000;
const STACK_BASE: u64 = 0x80_0000;
// Each process gets its own 64 KiB window for code and for stack.
const SLOT_STRIDE: u64 = 0x1_0000;

/// Counts in rbx forever, yielding every 2^20 increments.
///
/// ```text
///     xor  ebx, ebx
/// 1:  inc  rbx
///     test ebx, 0xfffff
///     jnz  1b
///     xor  eax, eax      ; yield
///     syscall
///     jmp  1b
/// ```
const SPINNER: &[u8] = &[
    0x31, 0xdb, 0x48, 0xff, 0xc3, 0xf7, 0xc3, 0xff, 0xff, 0x0f, 0x00, 0x75, 0xf5, 0x31, 0xc0,
    0x0f, 0x05, 0xeb, 0xef,
];

/// Yields eight times, then exits.
///
/// ```text
///     mov  r12d, 8
/// 1:  xor  eax, eax      ; yield
///     syscall
///     dec  r12d
///     jnz  1b
///     mov  eax, 1        ; exit
///     syscall
///     ud2
/// ```
const WORKER: &[u8] = &[
    0x41, 0xbc, 0x08, 0x00, 0x00, 0x00, 0x31, 0xc0, 0x0f, 0x05, 0x41, 0xff, 0xcc, 0x75, 0xf7,
    0xb8, 0x01, 0x00, 0x00, 0x00, 0x0f, 0x05, 0x0f, 0x0b,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Program {
    Spinner,
    Worker,
}

impl Program {
    /// Demo slots alternate spinner, worker, spinner, ...
    pub fn for_slot(slot: usize) -> Program {
        if slot % 2 == 0 {
            Program::Spinner
        } else {
            Program::Worker
        }
    }

    pub fn code(self) -> &'static [u8] {
        match self {
            Program::Spinner => SPINNER,
            Program::Worker => WORKER,
        }
    }
}

/// Where slot `slot` lives: (code base, initial stack pointer).
pub fn layout(slot: usize) -> (u64, u64) {
    let offset = slot as u64 * SLOT_STRIDE;
    (CODE_BASE + offset, STACK_BASE + offset + PAGE_SIZE)
}

/// Copies `program` into a fresh user page, gives it a stack page and a
/// heap-allocated kernel stack, and spawns it.
fn load(slot: usize, program: Program, address_space: u64, hw: &impl Machine) -> Option<u64> {
    let (code_base, stack_top) = layout(slot);

    let code_phys = memory::alloc_frame()?.as_u64();
    let stack_phys = memory::alloc_frame()?.as_u64();
    let code = program.code();
    unsafe {
        core::ptr::copy_nonoverlapping(
            code.as_ptr(),
            state::phys_to_virt(code_phys) as *mut u8,
            code.len(),
        );
        if let Err(e) = memory::map_user_page(code_base, code_phys) {
            klog_error!("demo {}: mapping code failed: {}", slot, e);
            return None;
        }
        if let Err(e) = memory::map_user_page(stack_top - PAGE_SIZE, stack_phys) {
            klog_error!("demo {}: mapping stack failed: {}", slot, e);
            return None;
        }
    }

    // Lives as long as the kernel; slots are not reclaimed at exit.
    let kernel_stack = vec![0u8; KERNEL_STACK_SIZE].leak();
    let kernel_stack_top = (kernel_stack.as_ptr() as u64 + KERNEL_STACK_SIZE as u64) & !0xF;

    let image = ProcessImage {
        entry: code_base,
        user_stack_top: stack_top,
        kernel_stack_top,
        address_space,
    };
    let handle = SCHEDULER.spawn(&image, hw)?;
    SCHEDULER.pid_of(handle)
}

/// Spawns `count` demo processes. Returns how many made it.
pub fn spawn_demo(count: usize, hw: &impl Machine) -> usize {
    let (root, _) = x86_64::registers::control::Cr3::read();
    let address_space = root.start_address().as_u64();

    let mut spawned = 0;
    for slot in 0..count {
        let program = Program::for_slot(slot);
        match load(slot, program, address_space, hw) {
            Some(pid) => {
                klog_info!("demo: pid {} runs {:?}", pid, program);
                spawned += 1;
            }
            None => {
                klog_warn!("demo: slot {} not started", slot);
                break;
            }
        }
    }
    spawned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_alternate_programs() {
        assert_eq!(Program::for_slot(0), Program::Spinner);
        assert_eq!(Program::for_slot(1), Program::Worker);
        assert_eq!(Program::for_slot(4), Program::Spinner);
    }

    #[test]
    fn programs_fit_in_one_page_and_end_in_a_jump_or_trap() {
        for program in [Program::Spinner, Program::Worker] {
            let code = program.code();
            assert!(code.len() as u64 <= PAGE_SIZE);
            let tail = &code[code.len() - 2..];
            assert!(*tail == [0xeb, 0xef] || *tail == [0x0f, 0x0b]);
        }
    }

    #[test]
    fn slot_windows_do_not_overlap() {
        let (code0, stack0) = layout(0);
        let (code1, stack1) = layout(1);
        assert_eq!(code1 - code0, SLOT_STRIDE);
        assert_eq!(stack1 - stack0, SLOT_STRIDE);
        assert!(code0 + PAGE_SIZE <= code1);
        assert!(layout(crate::process::MAX_PROCS - 1).0 < STACK_BASE);
    }
}
