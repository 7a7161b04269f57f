//! `SYSCALL` entry and the system call table.
//!
//! | rax | call   | arguments        | returns                 |
//! |-----|--------|------------------|-------------------------|
//! | 0   | yield  |                  | 0                       |
//! | 1   | exit   | rdi = status     | does not return         |
//! | 2   | getpid |                  | pid                     |
//! | 3   | write  | rdi = buf, rsi = len | bytes written       |
//! | 4   | kill   | rdi = pid        | 0, or `u64::MAX`        |
//!
//! Anything else returns `u64::MAX`.

use alloc::string::String;
use core::arch::global_asm;

use crate::frame::SyscallFrame;
use crate::percpu::{self, CoreId};
use crate::scheduler::{Machine, Resched, Scheduler};

pub const ERROR: u64 = u64::MAX;
pub const MAX_WRITE: usize = 256;
const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;
const PAGE_SIZE: u64 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum Syscall {
    Yield = 0,
    Exit = 1,
    GetPid = 2,
    Write = 3,
    Kill = 4,
}

impl Syscall {
    pub fn from_number(number: u64) -> Option<Syscall> {
        Some(match number {
            0 => Syscall::Yield,
            1 => Syscall::Exit,
            2 => Syscall::GetPid,
            3 => Syscall::Write,
            4 => Syscall::Kill,
            _ => return None,
        })
    }
}

/// Handles the call in `frame.rax` for the process running on `core`.
/// On `Resume`, `frame` holds what to return to (the caller, or someone
/// else after a switch).
pub fn dispatch<M: Machine>(
    sched: &Scheduler,
    core: CoreId,
    frame: &mut SyscallFrame,
    hw: &M,
) -> Resched {
    let current = sched.cores().current_process(core);
    let Some(call) = Syscall::from_number(frame.rax) else {
        klog_debug!("unknown syscall {:#x}", frame.rax);
        frame.rax = ERROR;
        return Resched::Resume;
    };

    match call {
        Syscall::Yield => {
            frame.rax = 0;
            sched.reschedule(core, frame, hw)
        }
        Syscall::Exit => {
            if let Some(process) = current {
                klog_debug!(
                    "pid {} exited with status {}",
                    sched.pid_of(process).unwrap_or(0),
                    frame.rdi as i64
                );
                sched.terminate(process);
            }
            sched.reschedule(core, frame, hw)
        }
        Syscall::GetPid => {
            frame.rax = current.and_then(|p| sched.pid_of(p)).unwrap_or(0);
            Resched::Resume
        }
        Syscall::Write => {
            let pid = current.and_then(|p| sched.pid_of(p)).unwrap_or(0);
            frame.rax = match user_bytes(frame.rdi, frame.rsi, hw) {
                Some(bytes) => {
                    let text = String::from_utf8_lossy(bytes);
                    klog_info!("[pid {}] {}", pid, text.trim_end());
                    bytes.len() as u64
                }
                None => ERROR,
            };
            Resched::Resume
        }
        Syscall::Kill => {
            let Some(target) = sched.terminate_pid(frame.rdi) else {
                frame.rax = ERROR;
                return Resched::Resume;
            };
            frame.rax = 0;
            if Some(target) == current {
                sched.reschedule(core, frame, hw)
            } else {
                Resched::Resume
            }
        }
    }
}

/// Borrows up to [`MAX_WRITE`] bytes of user memory. `None` for null,
/// anything reaching into the upper half, or any page ring 3 could not read
/// itself.
fn user_bytes<M: Machine>(ptr: u64, len: u64, hw: &M) -> Option<&'static [u8]> {
    let len = len.min(MAX_WRITE as u64);
    let end = ptr.checked_add(len)?;
    if ptr == 0 || end > USER_SPACE_END {
        return None;
    }
    let mut page = ptr & !(PAGE_SIZE - 1);
    while page < end {
        if !hw.user_page_accessible(page) {
            return None;
        }
        page += PAGE_SIZE;
    }
    // SAFETY: every page of the range is mapped and user-readable in the
    // running process's address space.
    Some(unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) })
}

// --- HARDWARE ENTRY ---

extern "C" {
    fn kairos_syscall_entry();
}

/// Enables `SYSCALL` on the calling core.
pub fn init() {
    use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
    use x86_64::registers::rflags::RFlags;
    use x86_64::structures::gdt::SegmentSelector;
    use x86_64::VirtAddr;

    use crate::gdt;

    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
    }
    if let Err(e) = Star::write(
        SegmentSelector(gdt::USER_CODE_SELECTOR),
        SegmentSelector(gdt::USER_DATA_SELECTOR),
        SegmentSelector(gdt::KERNEL_CODE_SELECTOR),
        SegmentSelector(gdt::KERNEL_DATA_SELECTOR),
    ) {
        klog_error!("syscall: STAR rejected: {}", e);
    }
    LStar::write(VirtAddr::new(kairos_syscall_entry as usize as u64));
    // Entered with interrupts off, direction forward, no single-step.
    SFMask::write(RFlags::INTERRUPT_FLAG | RFlags::DIRECTION_FLAG | RFlags::TRAP_FLAG);
}

// rcx = user rip, r11 = user rflags. The frame is built on the running
// process's privileged stack in `SyscallFrame` order, then the handler runs
// on the core stack, as the timer does.
global_asm!(
    ".global kairos_syscall_entry",
    "kairos_syscall_entry:",
    "swapgs",
    "mov qword ptr gs:[{user_rsp}], rsp",
    "mov rsp, qword ptr gs:[{kernel_rsp}]",
    "push r11",
    "push qword ptr gs:[{user_rsp}]",
    "push rcx",
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
    "call kairos_syscall",
    "ud2",
    user_rsp = const percpu::CORE_LOCAL_USER_RSP,
    kernel_rsp = const percpu::CORE_LOCAL_KERNEL_RSP,
    core_stack = const percpu::CORE_LOCAL_CORE_STACK,
);

#[no_mangle]
extern "C" fn kairos_syscall(saved: *const SyscallFrame) -> ! {
    use crate::hal::X86Machine;
    use crate::scheduler::SCHEDULER;

    let mut frame = unsafe { *saved };
    let core = percpu::current();
    let hw = X86Machine;
    match dispatch(&SCHEDULER, core, &mut frame, &hw) {
        Resched::Resume => crate::userspace::resume(&frame),
        Resched::Idle => SCHEDULER.run(core, &hw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessState;
    use crate::scheduler::mock::{image, scheduler_with_cores, MockMachine};

    fn core0() -> CoreId {
        CoreId::from_index(0)
    }

    fn call(number: u64, arg0: u64, arg1: u64) -> SyscallFrame {
        let mut frame = SyscallFrame::fresh(0x1000, 0x2000);
        frame.rax = number;
        frame.rdi = arg0;
        frame.rsi = arg1;
        frame
    }

    #[test]
    fn getpid_returns_running_pid() {
        let hw = MockMachine::new(1);
        let sched = scheduler_with_cores(1);
        sched.spawn(&image(0x1000), &hw).unwrap();
        sched.dispatch_next(core0(), &hw).unwrap();

        let mut frame = call(2, 0, 0);
        assert_eq!(dispatch(&sched, core0(), &mut frame, &hw), Resched::Resume);
        assert_eq!(frame.rax, 1);
    }

    #[test]
    fn unknown_number_fails() {
        let hw = MockMachine::new(1);
        let sched = scheduler_with_cores(1);
        let mut frame = call(99, 0, 0);
        assert_eq!(dispatch(&sched, core0(), &mut frame, &hw), Resched::Resume);
        assert_eq!(frame.rax, ERROR);
    }

    #[test]
    fn yield_returns_zero_to_the_yielder() {
        let hw = MockMachine::new(1);
        let sched = scheduler_with_cores(1);
        let a = sched.spawn(&image(0x1000), &hw).unwrap();
        let _b = sched.spawn(&image(0x2000), &hw).unwrap();
        let (_, mut frame) = sched.dispatch_next(core0(), &hw).unwrap();

        frame.rax = Syscall::Yield as u64;
        assert_eq!(dispatch(&sched, core0(), &mut frame, &hw), Resched::Resume);
        assert_eq!(frame.rip, 0x2000);

        frame.rax = Syscall::Yield as u64;
        dispatch(&sched, core0(), &mut frame, &hw);
        assert_eq!(sched.cores().current_process(core0()), Some(a));
        assert_eq!(frame.rax, 0);
    }

    #[test]
    fn exit_terminates_and_idles() {
        let hw = MockMachine::new(1);
        let sched = scheduler_with_cores(1);
        let p = sched.spawn(&image(0x1000), &hw).unwrap();
        sched.dispatch_next(core0(), &hw).unwrap();

        let mut frame = call(1, 0, 0);
        assert_eq!(dispatch(&sched, core0(), &mut frame, &hw), Resched::Idle);
        assert_eq!(sched.state_of(p), Some(ProcessState::Terminated));
    }

    #[test]
    fn kill_other_process_by_pid() {
        let hw = MockMachine::new(1);
        let sched = scheduler_with_cores(1);
        let _a = sched.spawn(&image(0x1000), &hw).unwrap();
        let b = sched.spawn(&image(0x2000), &hw).unwrap();
        sched.dispatch_next(core0(), &hw).unwrap();

        let mut frame = call(4, 2, 0);
        assert_eq!(dispatch(&sched, core0(), &mut frame, &hw), Resched::Resume);
        assert_eq!(frame.rax, 0);
        assert_eq!(sched.state_of(b), Some(ProcessState::Terminated));

        let mut again = call(4, 2, 0);
        dispatch(&sched, core0(), &mut again, &hw);
        assert_eq!(again.rax, ERROR);

        let mut missing = call(4, 42, 0);
        dispatch(&sched, core0(), &mut missing, &hw);
        assert_eq!(missing.rax, ERROR);
    }

    #[test]
    fn write_is_bounded_and_checked() {
        let hw = MockMachine::new(1);
        let sched = scheduler_with_cores(1);

        let message = [b'x'; 300];
        hw.map_user(message.as_ptr() as u64, message.len() as u64);
        let mut frame = call(3, message.as_ptr() as u64, message.len() as u64);
        dispatch(&sched, core0(), &mut frame, &hw);
        assert_eq!(frame.rax, MAX_WRITE as u64);

        let mut null = call(3, 0, 4);
        dispatch(&sched, core0(), &mut null, &hw);
        assert_eq!(null.rax, ERROR);

        let mut kernel = call(3, 0xffff_8000_0000_0000, 4);
        dispatch(&sched, core0(), &mut kernel, &hw);
        assert_eq!(kernel.rax, ERROR);
    }

    #[test]
    fn write_from_unmapped_memory_fails_without_reading() {
        let hw = MockMachine::new(1);
        let sched = scheduler_with_cores(1);

        let mut unmapped = call(3, 0x1234, 4);
        assert_eq!(dispatch(&sched, core0(), &mut unmapped, &hw), Resched::Resume);
        assert_eq!(unmapped.rax, ERROR);

        // Mapped first page, unmapped second: the whole write is refused.
        hw.map_user(0x40_0000, 0x1000);
        let mut straddling = call(3, 0x40_0ff0, 0x20);
        dispatch(&sched, core0(), &mut straddling, &hw);
        assert_eq!(straddling.rax, ERROR);

        let mut empty = call(3, 0x1234, 0);
        dispatch(&sched, core0(), &mut empty, &hw);
        assert_eq!(empty.rax, 0);
    }
}
