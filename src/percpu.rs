//! Per-CPU registry.
//!
//! One slot per physical core, handed out densely at bring-up and never
//! reclaimed. The registry itself is plain data and every lookup takes an
//! explicit [`CoreId`]; the only ambient piece is [`current`], which reads
//! the index a core published about itself through its GS base.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::process::ProcessHandle;

/// Hard limit on cores the kernel will drive.
pub const MAX_CORES: usize = 16;

const NO_PROCESS: usize = usize::MAX;

/// Dense scheduling index of a registered core (`0..registered_count`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoreId(usize);

impl CoreId {
    /// Only the registry mints ids for real cores; tests and bring-up code
    /// that already validated the index use this.
    pub const fn from_index(index: usize) -> Self {
        CoreId(index)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Snapshot of what the registry knows about one core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreInfo {
    pub id: CoreId,
    /// Local APIC id.
    pub hw_id: u32,
    /// Processor id reported by the boot protocol.
    pub firmware_id: u32,
}

/// Returned by [`CoreRegistry::register`] when all slots are taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryFull;

impl core::fmt::Display for RegistryFull {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "core registry full ({} slots)", MAX_CORES)
    }
}

struct CoreSlot {
    registered: AtomicBool,
    hw_id: AtomicU32,
    firmware_id: AtomicU32,
    current: AtomicUsize,
}

impl CoreSlot {
    const fn new() -> Self {
        CoreSlot {
            registered: AtomicBool::new(false),
            hw_id: AtomicU32::new(0),
            firmware_id: AtomicU32::new(0),
            current: AtomicUsize::new(NO_PROCESS),
        }
    }
}

pub struct CoreRegistry {
    slots: [CoreSlot; MAX_CORES],
    count: AtomicUsize,
}

impl CoreRegistry {
    pub const fn new() -> Self {
        CoreRegistry {
            slots: [const { CoreSlot::new() }; MAX_CORES],
            count: AtomicUsize::new(0),
        }
    }

    /// Claims the next free slot. Does not deduplicate: callers that may see
    /// the same core twice check [`find_by_hw_id`](Self::find_by_hw_id) first.
    pub fn register(&self, hw_id: u32, firmware_id: u32) -> Result<CoreId, RegistryFull> {
        let mut index = self.count.load(Ordering::Acquire);
        loop {
            if index >= MAX_CORES {
                return Err(RegistryFull);
            }
            match self.count.compare_exchange_weak(
                index,
                index + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(seen) => index = seen,
            }
        }

        let slot = &self.slots[index];
        slot.hw_id.store(hw_id, Ordering::Relaxed);
        slot.firmware_id.store(firmware_id, Ordering::Relaxed);
        slot.current.store(NO_PROCESS, Ordering::Relaxed);
        // A slot is claimed once; a second store would be a registry bug.
        let was_registered = slot.registered.swap(true, Ordering::Release);
        debug_assert!(!was_registered);
        Ok(CoreId(index))
    }

    /// Linear scan. Bring-up only.
    pub fn find_by_hw_id(&self, hw_id: u32) -> Option<CoreId> {
        self.slots
            .iter()
            .take(self.registered_count())
            .position(|slot| {
                slot.registered.load(Ordering::Acquire)
                    && slot.hw_id.load(Ordering::Relaxed) == hw_id
            })
            .map(CoreId)
    }

    pub fn registered_count(&self) -> usize {
        self.count.load(Ordering::Acquire).min(MAX_CORES)
    }

    pub fn is_registered(&self, core: CoreId) -> bool {
        self.slots
            .get(core.0)
            .is_some_and(|slot| slot.registered.load(Ordering::Acquire))
    }

    pub fn info(&self, core: CoreId) -> Option<CoreInfo> {
        if !self.is_registered(core) {
            return None;
        }
        let slot = &self.slots[core.0];
        Some(CoreInfo {
            id: core,
            hw_id: slot.hw_id.load(Ordering::Relaxed),
            firmware_id: slot.firmware_id.load(Ordering::Relaxed),
        })
    }

    /// Process running on `core`, if any. Lock-free; only `core` writes it.
    #[inline]
    pub fn current_process(&self, core: CoreId) -> Option<ProcessHandle> {
        match self.slots[core.0].current.load(Ordering::Acquire) {
            NO_PROCESS => None,
            index => Some(ProcessHandle::from_index(index)),
        }
    }

    #[inline]
    pub fn set_current_process(&self, core: CoreId, process: Option<ProcessHandle>) {
        let raw = process.map_or(NO_PROCESS, |p| p.index());
        self.slots[core.0].current.store(raw, Ordering::Release);
    }
}

impl Default for CoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Hardware anchor
// ---------------------------------------------------------------------------

/// Block each core reaches through its GS base while in the kernel. The
/// entry stubs address it by offset, so the layout is fixed.
#[repr(C, align(64))]
pub struct CoreLocal {
    self_ptr: AtomicU64,
    /// Privileged stack of the running process, loaded by `syscall` entry.
    kernel_rsp: AtomicU64,
    /// Scratch slot for the user stack pointer during `syscall` entry.
    user_rsp: AtomicU64,
    /// Top of this core's own stack; trap handlers run here.
    core_stack_top: AtomicU64,
    index: AtomicU64,
}

pub const CORE_LOCAL_KERNEL_RSP: usize = 8;
pub const CORE_LOCAL_USER_RSP: usize = 16;
pub const CORE_LOCAL_CORE_STACK: usize = 24;
pub const CORE_LOCAL_INDEX: usize = 32;

const _: () = {
    assert!(core::mem::offset_of!(CoreLocal, kernel_rsp) == CORE_LOCAL_KERNEL_RSP);
    assert!(core::mem::offset_of!(CoreLocal, user_rsp) == CORE_LOCAL_USER_RSP);
    assert!(core::mem::offset_of!(CoreLocal, core_stack_top) == CORE_LOCAL_CORE_STACK);
    assert!(core::mem::offset_of!(CoreLocal, index) == CORE_LOCAL_INDEX);
};

impl CoreLocal {
    const fn new() -> Self {
        CoreLocal {
            self_ptr: AtomicU64::new(0),
            kernel_rsp: AtomicU64::new(0),
            user_rsp: AtomicU64::new(0),
            core_stack_top: AtomicU64::new(0),
            index: AtomicU64::new(0),
        }
    }
}

static CORE_LOCAL: [CoreLocal; MAX_CORES] = [const { CoreLocal::new() }; MAX_CORES];

/// Makes `core` discoverable through [`current`] on the calling CPU. Must
/// run exactly once per core, on that core, before it takes any trap.
pub fn publish(core: CoreId, core_stack_top: u64) {
    use x86_64::VirtAddr;
    use x86_64::registers::model_specific::{GsBase, KernelGsBase};

    let local = &CORE_LOCAL[core.0];
    let base = local as *const CoreLocal as u64;
    local.self_ptr.store(base, Ordering::Relaxed);
    local.core_stack_top.store(core_stack_top, Ordering::Relaxed);
    local.index.store(core.0 as u64, Ordering::Relaxed);

    // Kernel runs with GS = CoreLocal; `swapgs` on the way out parks it in
    // KERNEL_GS_BASE and hands user mode a zero GS.
    GsBase::write(VirtAddr::new(base));
    KernelGsBase::write(VirtAddr::new(0));
}

/// The calling core. O(1), no locks. Only valid in kernel mode after
/// [`publish`].
#[inline]
pub fn current() -> CoreId {
    let index: u64;
    unsafe {
        core::arch::asm!(
            "mov {}, gs:[{off}]",
            out(reg) index,
            off = const CORE_LOCAL_INDEX,
            options(nostack, preserves_flags, readonly)
        );
    }
    CoreId(index as usize)
}

/// Stack the `syscall` entry stub switches to for `core`.
pub fn set_syscall_stack(core: CoreId, top: u64) {
    CORE_LOCAL[core.0].kernel_rsp.store(top, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_hands_out_dense_indices() {
        let registry = CoreRegistry::new();
        let a = registry.register(0, 0).unwrap();
        let b = registry.register(4, 1).unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));
        assert_eq!(registry.registered_count(), 2);
        assert_eq!(
            registry.info(b),
            Some(CoreInfo { id: b, hw_id: 4, firmware_id: 1 })
        );
    }

    #[test]
    fn register_fails_cleanly_when_full() {
        let registry = CoreRegistry::new();
        for hw in 0..MAX_CORES as u32 {
            registry.register(hw, hw).unwrap();
        }
        assert_eq!(registry.register(99, 99), Err(RegistryFull));
        assert_eq!(registry.registered_count(), MAX_CORES);
        assert_eq!(registry.find_by_hw_id(99), None);
    }

    #[test]
    fn duplicate_hw_ids_create_two_cores() {
        let registry = CoreRegistry::new();
        let first = registry.register(7, 0).unwrap();
        let second = registry.register(7, 1).unwrap();
        assert_ne!(first, second);
        // Lookup finds the first match.
        assert_eq!(registry.find_by_hw_id(7), Some(first));
    }

    #[test]
    fn current_process_round_trips() {
        let registry = CoreRegistry::new();
        let core = registry.register(0, 0).unwrap();
        assert_eq!(registry.current_process(core), None);

        let p = ProcessHandle::from_index(3);
        registry.set_current_process(core, Some(p));
        assert_eq!(registry.current_process(core), Some(p));
        registry.set_current_process(core, None);
        assert_eq!(registry.current_process(core), None);
    }

    #[test]
    fn unregistered_slots_have_no_info() {
        let registry = CoreRegistry::new();
        assert!(!registry.is_registered(CoreId::from_index(0)));
        assert_eq!(registry.info(CoreId::from_index(0)), None);
        assert!(!registry.is_registered(CoreId::from_index(MAX_CORES + 3)));
    }
}
