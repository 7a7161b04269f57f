//! Preemptive SMP scheduler.
//!
//! Two entry paths converge on [`Scheduler::reschedule`]: the syscall path,
//! whose registers already arrive as a [`SyscallFrame`], and the timer path,
//! which goes through [`frame::capture`]/[`frame::apply`] first. Everything
//! the scheduler needs from the CPU goes through the [`Machine`] trait, so
//! all of the decision logic runs on the host in tests.
//!
//! Locks: the process table, then the run queues. Never the other way round.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::frame::{self, InterruptFrame, SyscallFrame};
use crate::percpu::{CoreId, CoreRegistry};
use crate::process::{ProcessHandle, ProcessImage, ProcessState, ProcessTable};
use crate::runqueue::{RunQueueSet, Source};

/// Marker returned by [`Machine::enter_user`] if the one-way transfer comes
/// back. On real hardware it never does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferFault;

/// Everything the scheduler asks of the processor it runs on.
pub trait Machine {
    /// Cores that finished bring-up and take part in scheduling.
    fn online_cores(&self) -> usize;
    /// Stack the CPU switches to when `core` traps out of ring 3.
    fn set_kernel_stack(&self, core: CoreId, top: u64);
    fn read_tls_base(&self) -> u64;
    fn write_tls_base(&self, base: u64);
    fn activate_address_space(&self, root: u64);
    /// Whether ring 3 may read the 4 KiB page at `page` in the active
    /// address space.
    fn user_page_accessible(&self, page: u64) -> bool;
    /// Nudges halted cores so they look at the queues again.
    fn wake_cores(&self);
    /// Drops to ring 3 with `frame`. Only returns if something is broken.
    fn enter_user(&self, core: CoreId, frame: &SyscallFrame) -> TransferFault;
    /// Sleeps until the next interrupt.
    fn idle(&self);
}

/// What the trap path does after a reschedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resched {
    /// Return to ring 3 with the (possibly replaced) frame.
    Resume,
    /// Nothing left to run on this core; fall into the idle loop.
    Idle,
}

/// Outcome of one pass of the run loop that came back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Idled,
    TransferReturned(ProcessHandle),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub admissions: u64,
    /// Admissions lost to a full queue.
    pub dropped: u64,
    pub switches: u64,
    /// Selections served from another core's queue.
    pub steals: u64,
    /// Terminated entries thrown away on pop.
    pub purged: u64,
}

struct Counters {
    admissions: AtomicU64,
    dropped: AtomicU64,
    switches: AtomicU64,
    steals: AtomicU64,
    purged: AtomicU64,
}

impl Counters {
    const fn new() -> Self {
        Counters {
            admissions: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            switches: AtomicU64::new(0),
            steals: AtomicU64::new(0),
            purged: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Scheduler {
    cores: CoreRegistry,
    procs: Mutex<ProcessTable>,
    queues: Mutex<RunQueueSet>,
    next_core: AtomicUsize,
    counters: Counters,
}

/// The kernel's scheduler. Tests build their own.
pub static SCHEDULER: Scheduler = Scheduler::new();

impl Scheduler {
    pub const fn new() -> Self {
        Scheduler {
            cores: CoreRegistry::new(),
            procs: Mutex::new(ProcessTable::new()),
            queues: Mutex::new(RunQueueSet::new()),
            next_core: AtomicUsize::new(0),
            counters: Counters::new(),
        }
    }

    pub fn cores(&self) -> &CoreRegistry {
        &self.cores
    }

    /// Registers a core for bring-up. Logs and returns `None` when the
    /// registry is full; the caller skips that core.
    pub fn register_core(&self, hw_id: u32, firmware_id: u32) -> Option<CoreId> {
        match self.cores.register(hw_id, firmware_id) {
            Ok(core) => Some(core),
            Err(e) => {
                klog_warn!("{}; skipping APIC id {}", e, hw_id);
                None
            }
        }
    }

    pub fn stats(&self) -> Stats {
        let c = &self.counters;
        Stats {
            admissions: c.admissions.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            switches: c.switches.load(Ordering::Relaxed),
            steals: c.steals.load(Ordering::Relaxed),
            purged: c.purged.load(Ordering::Relaxed),
        }
    }

    /// Cores eligible for admission and stealing.
    fn span<M: Machine>(&self, hw: &M) -> usize {
        self.cores
            .registered_count()
            .min(hw.online_cores())
            .max(1)
    }

    // ------------------------------------------------------------------
    // Process lifecycle
    // ------------------------------------------------------------------

    /// Creates a process from `image` and admits it.
    pub fn spawn<M: Machine>(&self, image: &ProcessImage, hw: &M) -> Option<ProcessHandle> {
        let handle = {
            let mut procs = self.procs.lock();
            let mut queues = self.queues.lock();
            let referenced = |h: ProcessHandle| queues.contains(h) || self.is_current_anywhere(h);
            let handle = match procs.allocate(image, referenced) {
                Ok(h) => h,
                Err(e) => {
                    klog_warn!("spawn failed: {}", e);
                    return None;
                }
            };
            if !self.admit_locked(&mut procs, &mut queues, handle, hw) {
                procs.terminate(handle);
                return None;
            }
            if let Some(p) = procs.get(handle) {
                klog_debug!(
                    "spawned pid {} entry {:#x} on core {:?}",
                    p.pid,
                    p.user_ip,
                    p.preferred_cpu
                );
            }
            handle
        };
        hw.wake_cores();
        Some(handle)
    }

    /// Marks a process terminated. Its queue entry, if any, is dropped the
    /// next time someone pops it; a core running it keeps going until its
    /// next trap.
    pub fn terminate(&self, process: ProcessHandle) -> bool {
        self.procs.lock().terminate(process)
    }

    /// Looks up and terminates `pid` under one lock, so a slot reused in
    /// between can not be hit instead.
    pub fn terminate_pid(&self, pid: u64) -> Option<ProcessHandle> {
        self.procs.lock().terminate_pid(pid)
    }

    pub fn pid_of(&self, process: ProcessHandle) -> Option<u64> {
        self.procs.lock().get(process).map(|p| p.pid)
    }

    pub fn state_of(&self, process: ProcessHandle) -> Option<ProcessState> {
        self.procs.lock().get(process).map(|p| p.state)
    }

    fn is_current_anywhere(&self, process: ProcessHandle) -> bool {
        (0..self.cores.registered_count())
            .any(|i| self.cores.current_process(CoreId::from_index(i)) == Some(process))
    }

    // ------------------------------------------------------------------
    // Admission and selection
    // ------------------------------------------------------------------

    /// Queues `process` exactly once and leaves it Ready. No-op for
    /// terminated processes.
    pub fn admit<M: Machine>(&self, process: ProcessHandle, hw: &M) {
        let mut procs = self.procs.lock();
        let mut queues = self.queues.lock();
        self.admit_locked(&mut procs, &mut queues, process, hw);
    }

    /// True if `process` ends up in a run queue.

    fn admit_locked<M: Machine>(
        &self,
        procs: &mut ProcessTable,
        queues: &mut RunQueueSet,
        process: ProcessHandle,
        hw: &M,
    ) -> bool {
        let Some(p) = procs.get_mut(process) else { return false };
        if p.state == ProcessState::Terminated {
            return false;
        }

        let mut queued = true;
        if !queues.contains(process) {
            let span = self.span(hw);
            let target = match p.preferred_cpu {
                Some(cpu) if cpu < span => cpu,
                _ => {
                    let cpu = self.next_core.fetch_add(1, Ordering::Relaxed) % span;
                    p.preferred_cpu = Some(cpu);
                    cpu
                }
            };
            match queues.push(CoreId::from_index(target), process) {
                Ok(()) => Counters::bump(&self.counters.admissions),
                Err(e) => {
                    Counters::bump(&self.counters.dropped);
                    klog_warn!("pid {} not admitted to core {}: {}", p.pid, target, e);
                    queued = false;
                }
            }
        }
        p.state = ProcessState::Ready;
        queued
    }

    /// Pops the next queued handle for `core`, stealing on a local miss.
    /// May return a terminated process; [`reschedule`](Self::reschedule)
    /// filters those out.
    pub fn select<M: Machine>(&self, core: CoreId, hw: &M) -> Option<ProcessHandle> {
        let span = self.span(hw);
        let (process, source) = self.queues.lock().select(core, span)?;
        if let Source::Stolen(_) = source {
            Counters::bump(&self.counters.steals);
        }
        Some(process)
    }

    fn select_live<M: Machine>(
        &self,
        procs: &ProcessTable,
        queues: &mut RunQueueSet,
        core: CoreId,
        hw: &M,
    ) -> Option<ProcessHandle> {
        let span = self.span(hw);
        while let Some((process, source)) = queues.select(core, span) {
            match procs.get(process) {
                Some(p) if p.is_live() => {
                    if let Source::Stolen(from) = source {
                        Counters::bump(&self.counters.steals);
                        klog_trace!("core {} stole pid {} from core {}", core.index(), p.pid, from.index());
                    }
                    return Some(process);
                }
                _ => Counters::bump(&self.counters.purged),
            }
        }
        None
    }

    /// Makes `next` the running process on `core` and returns the frame to
    /// enter it with.
    fn install<M: Machine>(
        &self,
        procs: &mut ProcessTable,
        core: CoreId,
        next: ProcessHandle,
        previous: Option<ProcessHandle>,
        hw: &M,
    ) -> Option<SyscallFrame> {
        let p = procs.get_mut(next)?;
        p.state = ProcessState::Running;
        self.cores.set_current_process(core, Some(next));
        hw.set_kernel_stack(core, p.kernel_stack_top);
        hw.write_tls_base(p.fs_base);
        hw.activate_address_space(p.address_space);
        if previous != Some(next) {
            Counters::bump(&self.counters.switches);
            klog_trace!("core {} -> pid {}", core.index(), p.pid);
        }
        Some(p.frame())
    }

    // ------------------------------------------------------------------
    // Rescheduling
    // ------------------------------------------------------------------

    /// Saves the running process from `frame`, requeues it, and replaces
    /// `frame` with whatever `core` should run next.
    pub fn reschedule<M: Machine>(&self, core: CoreId, frame: &mut SyscallFrame, hw: &M) -> Resched {
        let mut procs = self.procs.lock();
        let mut queues = self.queues.lock();

        let current = self.cores.current_process(core);
        if let Some(cur) = current {
            let mut live = false;
            if let Some(p) = procs.get_mut(cur) {
                if p.state != ProcessState::Terminated {
                    p.save(frame, hw.read_tls_base());
                    live = true;
                }
            }
            if live && !self.admit_locked(&mut procs, &mut queues, cur, hw) {
                // No room to requeue: it keeps the core rather than being lost.
                if let Some(p) = procs.get_mut(cur) {
                    p.state = ProcessState::Running;
                }
                return Resched::Resume;
            }
        }

        let next = self.select_live(&procs, &mut queues, core, hw);
        if let Some(replacement) =
            next.and_then(|n| self.install(&mut procs, core, n, current, hw))
        {
            *frame = replacement;
            return Resched::Resume;
        }

        self.cores.set_current_process(core, None);
        Resched::Idle
    }

    /// Timer path for a trap taken in ring 3. Kernel-mode traps are left
    /// alone.
    pub fn reschedule_from_interrupt<M: Machine>(
        &self,
        core: CoreId,
        trap: &mut InterruptFrame,
        hw: &M,
    ) -> Resched {
        let Some(mut unified) = frame::capture(trap) else {
            return Resched::Resume;
        };
        let outcome = self.reschedule(core, &mut unified, hw);
        if outcome == Resched::Resume {
            frame::apply(&unified, trap);
        }
        outcome
    }

    /// Periodic tick.
    pub fn on_tick<M: Machine>(&self, core: CoreId, trap: &mut InterruptFrame, hw: &M) -> Resched {
        if trap.from_user() {
            return self.reschedule_from_interrupt(core, trap, hw);
        }
        // Ring 0 has no user frame to swap out; the run loop picks the
        // parked process up again on its next pass.
        if self.cores.current_process(core).is_some() {
            self.park(core, hw);
        }
        Resched::Resume
    }

    /// Hands the process owning `core` back to the queues without touching
    /// its saved context, and leaves the core with nothing current.
    pub fn park<M: Machine>(&self, core: CoreId, hw: &M) {
        let Some(current) = self.cores.current_process(core) else { return };
        let mut procs = self.procs.lock();
        let mut queues = self.queues.lock();
        let requeued = self.admit_locked(&mut procs, &mut queues, current, hw);
        match procs.get_mut(current) {
            // Nowhere to put it; it stays on this core.
            Some(p) if !requeued && p.state != ProcessState::Terminated => {
                p.state = ProcessState::Running;
            }
            _ => self.cores.set_current_process(core, None),
        }
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Picks and installs the next process for an idle `core`.
    pub fn dispatch_next<M: Machine>(
        &self,
        core: CoreId,
        hw: &M,
    ) -> Option<(ProcessHandle, SyscallFrame)> {
        let mut procs = self.procs.lock();
        let mut queues = self.queues.lock();
        let previous = self.cores.current_process(core);
        let next = self.select_live(&procs, &mut queues, core, hw)?;
        let frame = self.install(&mut procs, core, next, previous, hw)?;
        Some((next, frame))
    }

    /// One pass of the run loop. Only returns when the core idled or the
    /// transfer into a process came back.
    pub fn step<M: Machine>(&self, core: CoreId, hw: &M) -> Step {
        match self.dispatch_next(core, hw) {
            Some((process, frame)) => {
                let TransferFault = hw.enter_user(core, &frame);
                self.transfer_returned(core, process);
                Step::TransferReturned(process)
            }
            None => {
                hw.idle();
                Step::Idled
            }
        }
    }

    fn transfer_returned(&self, core: CoreId, process: ProcessHandle) {
        let mut procs = self.procs.lock();
        let pid = procs.get(process).map_or(0, |p| p.pid);
        klog_error!(
            "core {}: transfer into pid {} returned; terminating it",
            core.index(),
            pid
        );
        procs.terminate(process);
        self.cores.set_current_process(core, None);
    }

    /// Per-core scheduling loop.
    pub fn run<M: Machine>(&self, core: CoreId, hw: &M) -> ! {
        klog_info!("core {} entering run loop, {:?}", core.index(), self.stats());
        loop {
            self.step(core, hw);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::vec::Vec;

    /// Records every hardware request instead of touching the CPU.
    pub struct MockMachine {
        pub online: AtomicUsize,
        pub tls: AtomicU64,
        pub kernel_stacks: Mutex<Vec<(CoreId, u64)>>,
        pub address_spaces: Mutex<Vec<u64>>,
        pub user_pages: Mutex<Vec<u64>>,
        pub entered: Mutex<Vec<(CoreId, SyscallFrame)>>,
        pub idles: AtomicUsize,
        pub wakes: AtomicUsize,
    }

    impl MockMachine {
        pub fn new(online: usize) -> Self {
            MockMachine {
                online: AtomicUsize::new(online),
                tls: AtomicU64::new(0),
                kernel_stacks: Mutex::new(Vec::new()),
                address_spaces: Mutex::new(Vec::new()),
                user_pages: Mutex::new(Vec::new()),
                entered: Mutex::new(Vec::new()),
                idles: AtomicUsize::new(0),
                wakes: AtomicUsize::new(0),
            }
        }

        /// Marks every page touching `[start, start + len)` user-readable.
        pub fn map_user(&self, start: u64, len: u64) {
            let mut pages = self.user_pages.lock();
            let mut page = start & !0xfff;
            while page < start + len {
                pages.push(page);
                page += 0x1000;
            }
        }
    }

    impl Machine for MockMachine {
        fn online_cores(&self) -> usize {
            self.online.load(Ordering::SeqCst)
        }

        fn set_kernel_stack(&self, core: CoreId, top: u64) {
            self.kernel_stacks.lock().push((core, top));
        }

        fn read_tls_base(&self) -> u64 {
            self.tls.load(Ordering::SeqCst)
        }

        fn write_tls_base(&self, base: u64) {
            self.tls.store(base, Ordering::SeqCst);
        }

        fn activate_address_space(&self, root: u64) {
            self.address_spaces.lock().push(root);
        }

        fn user_page_accessible(&self, page: u64) -> bool {
            self.user_pages.lock().contains(&page)
        }

        fn wake_cores(&self) {
            self.wakes.fetch_add(1, Ordering::SeqCst);
        }

        fn enter_user(&self, core: CoreId, frame: &SyscallFrame) -> TransferFault {
            self.entered.lock().push((core, *frame));
            TransferFault
        }

        fn idle(&self) {
            self.idles.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Scheduler with `cores` registered cores (APIC ids 0..cores).
    pub fn scheduler_with_cores(cores: usize) -> Scheduler {
        let sched = Scheduler::new();
        for i in 0..cores {
            sched.register_core(i as u32, i as u32);
        }
        sched
    }

    pub fn image(entry: u64) -> ProcessImage {
        ProcessImage {
            entry,
            user_stack_top: entry + 0x10_0000,
            kernel_stack_top: 0xffff_9000_0000_0000 + entry,
            address_space: 0x20_0000,
        }
    }
}
