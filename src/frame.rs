//! Register snapshots for the two ways a process enters the kernel.
//!
//! `SYSCALL` entry stores a [`SyscallFrame`]; interrupts store an
//! [`InterruptFrame`]. The scheduler only ever works on the syscall shape,
//! so timer preemption goes through [`capture`] and [`apply`].

use crate::gdt;

/// Interrupt-enable bit in RFLAGS.
pub const RFLAGS_IF: u64 = 1 << 9;

/// RFLAGS for a process that has never run: IF set plus the always-one bit 1.
pub const INITIAL_RFLAGS: u64 = 0x202;

/// Size of [`SyscallFrame`] in machine words. Part of the syscall ABI.
pub const SYSCALL_FRAME_WORDS: usize = 18;

/// Copies the fifteen general-purpose registers between the frame shapes.
macro_rules! copy_gprs {
    ($dst:expr, $src:expr) => {{
        $dst.r15 = $src.r15;
        $dst.r14 = $src.r14;
        $dst.r13 = $src.r13;
        $dst.r12 = $src.r12;
        $dst.r11 = $src.r11;
        $dst.r10 = $src.r10;
        $dst.r9 = $src.r9;
        $dst.r8 = $src.r8;
        $dst.rbp = $src.rbp;
        $dst.rdi = $src.rdi;
        $dst.rsi = $src.rsi;
        $dst.rdx = $src.rdx;
        $dst.rcx = $src.rcx;
        $dst.rbx = $src.rbx;
        $dst.rax = $src.rax;
    }};
}

/// Unified frame. Field order matches the pushes in the syscall entry stub
/// and the loads in `userspace::resume`; do not reorder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SyscallFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
}

const _: () = assert!(core::mem::size_of::<SyscallFrame>() == SYSCALL_FRAME_WORDS * 8);

impl SyscallFrame {
    /// Frame for a process's first run: everything zero except where to
    /// start and which stack to use.
    pub const fn fresh(entry: u64, stack_top: u64) -> Self {
        SyscallFrame {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            rip: entry,
            rsp: stack_top,
            rflags: INITIAL_RFLAGS,
        }
    }
}

/// What the timer entry stub leaves on the stack: general-purpose registers
/// pushed by software, then the hardware interrupt frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const _: () = assert!(core::mem::size_of::<InterruptFrame>() == 20 * 8);

impl InterruptFrame {
    /// True if the trap interrupted ring 3.
    #[inline]
    pub fn from_user(&self) -> bool {
        self.cs & 0x3 == 0x3
    }
}

/// Converts an interrupt frame into the unified shape. `None` for traps
/// taken at kernel privilege: there are no user registers to preserve.
pub fn capture(trap: &InterruptFrame) -> Option<SyscallFrame> {
    if !trap.from_user() {
        return None;
    }
    let mut frame = SyscallFrame::default();
    copy_gprs!(frame, trap);
    frame.rip = trap.rip;
    frame.rsp = trap.rsp;
    frame.rflags = trap.rflags;
    Some(frame)
}

/// Writes a unified frame back into an interrupt frame. The return always
/// lands in ring 3 with interrupts enabled, whatever the frame's origin.
pub fn apply(frame: &SyscallFrame, trap: &mut InterruptFrame) {
    copy_gprs!(trap, frame);
    trap.rip = frame.rip;
    trap.rsp = frame.rsp;
    trap.rflags = frame.rflags | RFLAGS_IF;
    trap.cs = gdt::USER_CODE_SELECTOR as u64;
    trap.ss = gdt::USER_DATA_SELECTOR as u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    fn user_trap(seed: u64) -> InterruptFrame {
        InterruptFrame {
            r15: seed ^ 0x0f,
            r14: seed ^ 0x0e,
            r13: seed ^ 0x0d,
            r12: seed ^ 0x0c,
            r11: seed ^ 0x0b,
            r10: seed ^ 0x0a,
            r9: seed ^ 0x09,
            r8: seed ^ 0x08,
            rbp: seed ^ 0x07,
            rdi: seed ^ 0x06,
            rsi: seed ^ 0x05,
            rdx: seed ^ 0x04,
            rcx: seed ^ 0x03,
            rbx: seed ^ 0x02,
            rax: seed ^ 0x01,
            rip: 0x40_1000,
            cs: gdt::USER_CODE_SELECTOR as u64,
            rflags: 0x46, // IF clear on purpose
            rsp: 0x7fff_f000,
            ss: gdt::USER_DATA_SELECTOR as u64,
        }
    }

    #[test]
    fn frame_is_eighteen_words() {
        assert_eq!(core::mem::size_of::<SyscallFrame>(), 144);
    }

    #[test]
    fn asm_offsets_match_layout() {
        assert_eq!(offset_of!(SyscallFrame, r15), 0);
        assert_eq!(offset_of!(SyscallFrame, rdi), 72);
        assert_eq!(offset_of!(SyscallFrame, rax), 112);
        assert_eq!(offset_of!(SyscallFrame, rip), 120);
        assert_eq!(offset_of!(SyscallFrame, rsp), 128);
        assert_eq!(offset_of!(SyscallFrame, rflags), 136);
        assert_eq!(offset_of!(InterruptFrame, rip), 120);
        assert_eq!(offset_of!(InterruptFrame, cs), 128);
    }

    #[test]
    fn capture_then_apply_preserves_registers() {
        for seed in [0u64, 0xdead_beef_0000_0000, u64::MAX] {
            let original = user_trap(seed);
            let unified = capture(&original).unwrap();

            let mut restored = InterruptFrame::default();
            apply(&unified, &mut restored);

            let mut expected = original;
            expected.rflags |= RFLAGS_IF;
            assert_eq!(restored, expected);
            // Only the IF bit may differ.
            assert_eq!(restored.rflags ^ original.rflags, RFLAGS_IF);
        }
    }

    #[test]
    fn kernel_traps_are_not_captured() {
        let mut trap = user_trap(1);
        trap.cs = gdt::KERNEL_CODE_SELECTOR as u64;
        assert!(!trap.from_user());
        assert_eq!(capture(&trap), None);
    }

    #[test]
    fn apply_forces_user_selectors_and_interrupts() {
        let mut trap = InterruptFrame {
            cs: gdt::KERNEL_CODE_SELECTOR as u64,
            ss: gdt::KERNEL_DATA_SELECTOR as u64,
            ..InterruptFrame::default()
        };
        apply(&SyscallFrame::fresh(0x1000, 0x2000), &mut trap);
        assert!(trap.from_user());
        assert_eq!(trap.ss, gdt::USER_DATA_SELECTOR as u64);
        assert_eq!(trap.rflags & RFLAGS_IF, RFLAGS_IF);
        assert_eq!((trap.rip, trap.rsp), (0x1000, 0x2000));
    }

    #[test]
    fn fresh_frame_starts_clean() {
        let f = SyscallFrame::fresh(0xAAAA, 0xBBBB);
        assert_eq!(f.rip, 0xAAAA);
        assert_eq!(f.rsp, 0xBBBB);
        assert_eq!(f.rflags, INITIAL_RFLAGS);
        assert_eq!(f.rax, 0);
    }
}
