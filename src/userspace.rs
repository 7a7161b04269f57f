// src/userspace.rs
use core::arch::asm;

use crate::frame::{SyscallFrame, RFLAGS_IF};
use crate::gdt;

// Status flags (CF PF AF ZF SF DF OF) plus AC and ID survive; IOPL, NT,
// TF, RF and VM do not.
const USER_RFLAGS_KEEP: u64 = 0x0CD5 | RFLAGS_AC | RFLAGS_ID;
const RFLAGS_AC: u64 = 1 << 18;
const RFLAGS_ID: u64 = 1 << 21;
const RFLAGS_RESERVED_ONE: u64 = 1 << 1;

/// RFLAGS a process is entered with.
pub fn sanitize_rflags(rflags: u64) -> u64 {
    (rflags & USER_RFLAGS_KEEP) | RFLAGS_RESERVED_ONE | RFLAGS_IF
}

/// One-way transfer into ring 3. Restores every general-purpose register
/// from `frame` and `iretq`s to its rip/rsp with interrupts enabled.
pub fn resume(frame: &SyscallFrame) -> ! {
    let saved = *frame;
    let rflags = sanitize_rflags(saved.rflags);

    unsafe {
        asm!(
            "cli",
            "push {user_ss}",
            "push qword ptr [rdi + 128]", // rsp
            "push {rflags}",
            "push {user_cs}",
            "push qword ptr [rdi + 120]", // rip
            "mov r15, [rdi + 0]",
            "mov r14, [rdi + 8]",
            "mov r13, [rdi + 16]",
            "mov r12, [rdi + 24]",
            "mov r11, [rdi + 32]",
            "mov r10, [rdi + 40]",
            "mov r9, [rdi + 48]",
            "mov r8, [rdi + 56]",
            "mov rbp, [rdi + 64]",
            "mov rsi, [rdi + 80]",
            "mov rdx, [rdi + 88]",
            "mov rcx, [rdi + 96]",
            "mov rbx, [rdi + 104]",
            "mov rax, [rdi + 112]",
            "mov rdi, [rdi + 72]",
            "swapgs",
            "iretq",
            in("rdi") &saved as *const SyscallFrame,
            rflags = in(reg) rflags,
            user_ss = const gdt::USER_DATA_SELECTOR,
            user_cs = const gdt::USER_CODE_SELECTOR,
            options(noreturn)
        );
    }
}

/// Switches to the stack at `stack_top` and calls `entry(arg)` there.
pub fn enter_on_stack(stack_top: u64, entry: extern "C" fn(u64) -> !, arg: u64) -> ! {
    unsafe {
        asm!(
            "mov rsp, {top}",
            "xor ebp, ebp",
            "call {entry}",
            "ud2",
            top = in(reg) stack_top & !0xF,
            entry = in(reg) entry,
            in("rdi") arg,
            options(noreturn)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rflags_are_sanitized() {
        // IOPL=3, NT, TF set by a hostile frame.
        let hostile = 0x3000 | (1 << 14) | (1 << 8) | 0x1;
        let clean = sanitize_rflags(hostile);
        assert_eq!(clean, 0x1 | RFLAGS_RESERVED_ONE | RFLAGS_IF);
        assert_eq!(sanitize_rflags(0), 0x202);
    }

    #[test]
    fn user_settable_ac_and_id_survive() {
        let flags = RFLAGS_AC | RFLAGS_ID | (1 << 16) | (1 << 17);
        assert_eq!(
            sanitize_rflags(flags),
            RFLAGS_AC | RFLAGS_ID | RFLAGS_RESERVED_ONE | RFLAGS_IF
        );
    }
}
