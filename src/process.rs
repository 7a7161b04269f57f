use crate::frame::SyscallFrame;

/// Slots in the process table. Every run queue has the same capacity.
pub const MAX_PROCS: usize = 64;

/// Size of each process's privileged (ring 0) stack.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Stable index into the process table. Non-owning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessHandle(usize);

impl ProcessHandle {
    pub const fn from_index(index: usize) -> Self {
        ProcessHandle(index)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Terminated,
}

/// Everything the loader knows about a process before it first runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessImage {
    pub entry: u64,
    pub user_stack_top: u64,
    pub kernel_stack_top: u64,
    /// Physical address of the top-level page table.
    pub address_space: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct Process {
    pub pid: u64,
    pub state: ProcessState,
    /// Sticky core index, picked at first admission.
    pub preferred_cpu: Option<usize>,
    /// `false` until the first save: `context` is meaningless and the
    /// process starts at `user_ip`/`user_sp`.
    pub has_context: bool,
    pub context: SyscallFrame,
    pub user_ip: u64,
    pub user_sp: u64,
    /// FS base, swapped on every switch.
    pub fs_base: u64,
    pub address_space: u64,
    pub kernel_stack_top: u64,
    in_use: bool,
}

impl Process {
    const fn vacant() -> Self {
        Process {
            pid: 0,
            state: ProcessState::Terminated,
            preferred_cpu: None,
            has_context: false,
            context: SyscallFrame::fresh(0, 0),
            user_ip: 0,
            user_sp: 0,
            fs_base: 0,
            address_space: 0,
            kernel_stack_top: 0,
            in_use: false,
        }
    }

    /// The frame to resume this process with.
    pub fn frame(&self) -> SyscallFrame {
        if self.has_context {
            self.context
        } else {
            SyscallFrame::fresh(self.user_ip, self.user_sp)
        }
    }

    /// Stores a snapshot taken when the process left the CPU.
    pub fn save(&mut self, frame: &SyscallFrame, fs_base: u64) {
        self.context = *frame;
        self.has_context = true;
        self.user_ip = frame.rip;
        self.user_sp = frame.rsp;
        self.fs_base = fs_base;
    }

    fn discard_context(&mut self) {
        self.has_context = false;
        self.context = SyscallFrame::default();
    }

    pub fn is_live(&self) -> bool {
        self.in_use && self.state != ProcessState::Terminated
    }
}

/// Returned when every slot is live or still referenced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableFull;

impl core::fmt::Display for TableFull {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "process table full ({} slots)", MAX_PROCS)
    }
}

/// Fixed arena of processes. Owns every `Process`; everything else holds
/// a [`ProcessHandle`].
pub struct ProcessTable {
    slots: [Process; MAX_PROCS],
    next_pid: u64,
}

impl ProcessTable {
    pub const fn new() -> Self {
        ProcessTable {
            slots: [const { Process::vacant() }; MAX_PROCS],
            next_pid: 1,
        }
    }

    /// Fills the first reusable slot. A slot is reusable when it was never
    /// used, or holds a terminated process that `referenced` no longer
    /// reports as sitting in a queue or on a core.
    pub fn allocate(
        &mut self,
        image: &ProcessImage,
        referenced: impl Fn(ProcessHandle) -> bool,
    ) -> Result<ProcessHandle, TableFull> {
        let index = self
            .slots
            .iter()
            .enumerate()
            .position(|(i, slot)| {
                !slot.in_use
                    || (slot.state == ProcessState::Terminated
                        && !referenced(ProcessHandle(i)))
            })
            .ok_or(TableFull)?;

        let pid = self.next_pid;
        self.next_pid += 1;

        // Enters Ready only when admitted.
        self.slots[index] = Process {
            pid,
            state: ProcessState::Ready,
            preferred_cpu: None,
            has_context: false,
            context: SyscallFrame::default(),
            user_ip: image.entry,
            user_sp: image.user_stack_top,
            fs_base: 0,
            address_space: image.address_space,
            kernel_stack_top: image.kernel_stack_top,
            in_use: true,
        };
        Ok(ProcessHandle(index))
    }

    pub fn get(&self, handle: ProcessHandle) -> Option<&Process> {
        self.slots.get(handle.0).filter(|p| p.in_use)
    }

    pub fn get_mut(&mut self, handle: ProcessHandle) -> Option<&mut Process> {
        self.slots.get_mut(handle.0).filter(|p| p.in_use)
    }

    /// Marks the process terminated and drops its saved context. Returns
    /// false if it was already terminated or the handle is stale.
    pub fn terminate(&mut self, handle: ProcessHandle) -> bool {
        match self.get_mut(handle) {
            Some(p) if p.state != ProcessState::Terminated => {
                p.state = ProcessState::Terminated;
                p.discard_context();
                true
            }
            _ => false,
        }
    }

    pub fn find_by_pid(&self, pid: u64) -> Option<ProcessHandle> {
        self.slots
            .iter()
            .position(|p| p.in_use && p.pid == pid)
            .map(ProcessHandle)
    }

    /// [`find_by_pid`](Self::find_by_pid) then [`terminate`](Self::terminate)
    /// in one borrow of the table. `None` if no live process has `pid`.
    pub fn terminate_pid(&mut self, pid: u64) -> Option<ProcessHandle> {
        let handle = self.find_by_pid(pid)?;
        self.terminate(handle).then_some(handle)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::INITIAL_RFLAGS;

    fn image(entry: u64) -> ProcessImage {
        ProcessImage {
            entry,
            user_stack_top: 0x80_0000,
            kernel_stack_top: 0xffff_8000_0001_0000,
            address_space: 0x1000,
        }
    }

    #[test]
    fn pids_are_unique_and_start_at_one() {
        let mut table = ProcessTable::new();
        let a = table.allocate(&image(1), |_| false).unwrap();
        let b = table.allocate(&image(2), |_| false).unwrap();
        assert_eq!(table.get(a).unwrap().pid, 1);
        assert_eq!(table.get(b).unwrap().pid, 2);
        assert_eq!(table.find_by_pid(2), Some(b));
        assert_eq!(table.find_by_pid(9), None);
    }

    #[test]
    fn fresh_process_materialises_initial_frame() {
        let mut table = ProcessTable::new();
        let h = table.allocate(&image(0x40_0000), |_| false).unwrap();
        let frame = table.get(h).unwrap().frame();
        assert_eq!(frame.rip, 0x40_0000);
        assert_eq!(frame.rsp, 0x80_0000);
        assert_eq!(frame.rflags, INITIAL_RFLAGS);
    }

    #[test]
    fn save_switches_to_resumed_context() {
        let mut table = ProcessTable::new();
        let h = table.allocate(&image(0x40_0000), |_| false).unwrap();
        let mut snapshot = SyscallFrame::fresh(0x40_0123, 0x7f_f000);
        snapshot.rbx = 42;

        let p = table.get_mut(h).unwrap();
        p.save(&snapshot, 0xdead_0000);
        assert!(p.has_context);
        assert_eq!(p.frame(), snapshot);
        assert_eq!((p.user_ip, p.user_sp, p.fs_base), (0x40_0123, 0x7f_f000, 0xdead_0000));
    }

    #[test]
    fn terminate_is_one_shot_and_drops_context() {
        let mut table = ProcessTable::new();
        let h = table.allocate(&image(1), |_| false).unwrap();
        table.get_mut(h).unwrap().save(&SyscallFrame::fresh(5, 6), 0);

        assert!(table.terminate(h));
        assert!(!table.terminate(h));
        let p = table.get(h).unwrap();
        assert_eq!(p.state, ProcessState::Terminated);
        assert!(!p.has_context);
        assert!(!p.is_live());
    }

    #[test]
    fn terminate_pid_hits_only_live_matches() {
        let mut table = ProcessTable::new();
        let a = table.allocate(&image(1), |_| false).unwrap();
        let b = table.allocate(&image(2), |_| false).unwrap();

        assert_eq!(table.terminate_pid(2), Some(b));
        assert_eq!(table.terminate_pid(2), None);
        assert_eq!(table.terminate_pid(7), None);
        assert_eq!(table.get(a).unwrap().state, ProcessState::Ready);

        // The freed slot comes back under a new pid; the old one stays dead.
        let c = table.allocate(&image(3), |_| false).unwrap();
        assert_eq!(c, b);
        assert_eq!(table.terminate_pid(2), None);
        assert_eq!(table.get(c).unwrap().state, ProcessState::Ready);
    }

    #[test]
    fn referenced_terminated_slots_are_not_reused() {
        let mut table = ProcessTable::new();
        let first = table.allocate(&image(1), |_| false).unwrap();
        table.terminate(first);

        let second = table.allocate(&image(2), |h| h == first).unwrap();
        assert_ne!(second, first);

        let third = table.allocate(&image(3), |_| false).unwrap();
        assert_eq!(third, first);
        assert_eq!(table.get(third).unwrap().pid, 3);
    }

    #[test]
    fn allocation_fails_when_full() {
        let mut table = ProcessTable::new();
        for i in 0..MAX_PROCS {
            table.allocate(&image(i as u64), |_| false).unwrap();
        }
        assert_eq!(table.allocate(&image(0), |_| false), Err(TableFull));
    }
}
