//! Per-core FIFO run queues.
//!
//! The whole set sits behind one lock in the scheduler: the membership check
//! and the push have to happen in the same critical section, or two cores
//! could queue the same process on two different queues.

use crate::percpu::{CoreId, MAX_CORES};
use crate::process::{ProcessHandle, MAX_PROCS};

/// Returned by [`RunQueue::push`] when the buffer is at capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFull;

impl core::fmt::Display for QueueFull {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "run queue full ({} entries)", MAX_PROCS)
    }
}

/// Bounded ring buffer of process handles.
#[derive(Clone, Copy)]
pub struct RunQueue {
    entries: [usize; MAX_PROCS],
    head: usize,
    len: usize,
}

impl RunQueue {
    pub const fn new() -> Self {
        RunQueue {
            entries: [0; MAX_PROCS],
            head: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, process: ProcessHandle) -> Result<(), QueueFull> {
        if self.len == MAX_PROCS {
            return Err(QueueFull);
        }
        let tail = (self.head + self.len) % MAX_PROCS;
        self.entries[tail] = process.index();
        self.len += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<ProcessHandle> {
        if self.len == 0 {
            return None;
        }
        let index = self.entries[self.head];
        self.head = (self.head + 1) % MAX_PROCS;
        self.len -= 1;
        Some(ProcessHandle::from_index(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = ProcessHandle> + '_ {
        (0..self.len).map(move |i| {
            ProcessHandle::from_index(self.entries[(self.head + i) % MAX_PROCS])
        })
    }

    pub fn contains(&self, process: ProcessHandle) -> bool {
        self.iter().any(|p| p == process)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a selected process came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Local,
    Stolen(CoreId),
}

/// One queue per possible core.
pub struct RunQueueSet {
    queues: [RunQueue; MAX_CORES],
}

impl RunQueueSet {
    pub const fn new() -> Self {
        RunQueueSet {
            queues: [const { RunQueue::new() }; MAX_CORES],
        }
    }

    pub fn queue(&self, core: CoreId) -> &RunQueue {
        &self.queues[core.index()]
    }

    pub fn push(&mut self, core: CoreId, process: ProcessHandle) -> Result<(), QueueFull> {
        self.queues[core.index()].push(process)
    }

    /// Index of the core whose queue holds `process`.
    pub fn position(&self, process: ProcessHandle) -> Option<CoreId> {
        self.queues
            .iter()
            .position(|q| q.contains(process))
            .map(CoreId::from_index)
    }

    pub fn contains(&self, process: ProcessHandle) -> bool {
        self.position(process).is_some()
    }

    /// Total entries across every queue.
    pub fn len(&self) -> usize {
        self.queues.iter().map(RunQueue::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Local queue first; on a miss, the first non-empty queue among the
    /// `online` cores in ascending index order.
    pub fn select(&mut self, core: CoreId, online: usize) -> Option<(ProcessHandle, Source)> {
        if let Some(p) = self.queues[core.index()].pop() {
            return Some((p, Source::Local));
        }
        (0..online.min(MAX_CORES))
            .filter(|&i| i != core.index())
            .find_map(|i| {
                self.queues[i]
                    .pop()
                    .map(|p| (p, Source::Stolen(CoreId::from_index(i))))
            })
    }
}

impl Default for RunQueueSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(i: usize) -> ProcessHandle {
        ProcessHandle::from_index(i)
    }

    fn core(i: usize) -> CoreId {
        CoreId::from_index(i)
    }

    #[test]
    fn queue_is_fifo_across_wraparound() {
        let mut q = RunQueue::new();
        for round in 0..3 {
            for i in 0..MAX_PROCS - 1 {
                q.push(h(i + round)).unwrap();
            }
            for i in 0..MAX_PROCS - 1 {
                assert_eq!(q.pop(), Some(h(i + round)));
            }
        }
        assert!(q.is_empty());
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn push_fails_at_capacity() {
        let mut q = RunQueue::new();
        for i in 0..MAX_PROCS {
            q.push(h(i)).unwrap();
        }
        assert_eq!(q.push(h(0)), Err(QueueFull));
        assert_eq!(q.len(), MAX_PROCS);
    }

    #[test]
    fn local_work_is_never_stolen_over() {
        let mut set = RunQueueSet::new();
        set.push(core(2), h(7)).unwrap();
        set.push(core(0), h(1)).unwrap();

        assert_eq!(set.select(core(2), 4), Some((h(7), Source::Local)));
        assert_eq!(set.queue(core(0)).len(), 1);
    }

    #[test]
    fn steal_scans_in_ascending_order() {
        let mut set = RunQueueSet::new();
        set.push(core(3), h(30)).unwrap();
        set.push(core(1), h(10)).unwrap();

        assert_eq!(set.select(core(2), 4), Some((h(10), Source::Stolen(core(1)))));
        assert_eq!(set.select(core(2), 4), Some((h(30), Source::Stolen(core(3)))));
        assert_eq!(set.select(core(2), 4), None);
    }

    #[test]
    fn steal_ignores_offline_cores() {
        let mut set = RunQueueSet::new();
        set.push(core(5), h(50)).unwrap();
        assert_eq!(set.select(core(0), 2), None);
        assert_eq!(set.position(h(50)), Some(core(5)));
    }
}
