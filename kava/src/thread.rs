//! VM thread records and the scheduler's lists.

use std::ops::{Index, IndexMut};

use bitflags::bitflags;

use crate::cell::Ref;
use crate::class::ClassId;
use crate::frame::Registers;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl ThreadId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct ThreadStatus: u8 {
        const RUNNABLE = 1 << 0;
        const BLOCKED = 1 << 1;
        const WAITING = 1 << 2;
        const TIMED = 1 << 3;
        const SLEEPING = 1 << 4;
        const TERMINATED = 1 << 5;
        const SUSPENDED = 1 << 6;
    }
}

/// Action taken when a timed-list entry expires.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimedCallback {
    SleepTimeout,
    WaitTimeout,
}

#[derive(Debug)]
pub struct VmThread {
    pub id: ThreadId,
    /// The `java.lang.Thread` this VM thread runs.
    pub object: Ref,
    pub regs: Registers,
    /// Bottom segment of the stack list.
    pub stack_head: Ref,
    pub stack_cells: usize,
    pub status: ThreadStatus,
    pub priority: u32,
    pub daemon: bool,
    /// Monitor depth to restore when ownership comes back after `wait`.
    pub saved_depth: u32,
    pub interrupted: bool,
    /// Throwable raised at the thread's next safepoint.
    pub pending: Ref,
    /// Object whose wait queue holds this thread.
    pub waiting_on: Ref,
    /// Object whose lock queue holds this thread.
    pub blocked_on: Ref,
    /// Monitor handed over while queued to enter a synchronized native; the
    /// re-executed invoke consumes it instead of entering again.
    pub native_monitor: Ref,
    /// Class whose initialization by another thread this one waits for.
    pub blocked_on_class: Option<ClassId>,
    /// Milliseconds since VM start.
    pub wake_time: u64,
    pub callback: Option<TimedCallback>,
    pub at_breakpoint: bool,
    pub single_step: bool,
    pub dispatching_uncaught: bool,
    pub is_main: bool,
}

impl VmThread {
    pub fn new(id: ThreadId, object: Ref) -> Self {
        Self {
            id,
            object,
            regs: Registers::default(),
            stack_head: Ref::NULL,
            stack_cells: 0,
            status: ThreadStatus::empty(),
            priority: 5,
            daemon: false,
            saved_depth: 0,
            interrupted: false,
            pending: Ref::NULL,
            waiting_on: Ref::NULL,
            blocked_on: Ref::NULL,
            native_monitor: Ref::NULL,
            blocked_on_class: None,
            wake_time: 0,
            callback: None,
            at_breakpoint: false,
            single_step: false,
            dispatching_uncaught: false,
            is_main: false,
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.status.contains(ThreadStatus::TERMINATED)
    }
}

pub struct Threads {
    slots: Vec<Option<VmThread>>,
    /// Round-robin order of runnable threads.
    pub runnable: Vec<ThreadId>,
    /// Threads awaiting a wall-clock event.
    pub timed: Vec<ThreadId>,
    pub active: usize,
    pub non_daemon: usize,
    pub started: u32,
}

impl Threads {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            runnable: Vec::new(),
            timed: Vec::new(),
            active: 0,
            non_daemon: 0,
            started: 0,
        }
    }

    /// Takes the lowest free slot. A terminated thread's id is reused once
    /// its `eetop` reads terminated and its monitors are forgotten.
    pub fn create(&mut self, object: Ref) -> ThreadId {
        match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                let id = ThreadId(index as u32);
                self.slots[index] = Some(VmThread::new(id, object));
                id
            }
            None => {
                let id = ThreadId(self.slots.len() as u32);
                self.slots.push(Some(VmThread::new(id, object)));
                id
            }
        }
    }

    pub fn get(&self, id: ThreadId) -> Option<&VmThread> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut VmThread> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, id: ThreadId) -> Option<VmThread> {
        self.unlink_runnable(id);
        self.remove_timed(id);
        self.slots.get_mut(id.index())?.take()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VmThread> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut VmThread> {
        self.slots.iter_mut().flatten()
    }

    pub fn ids(&self) -> Vec<ThreadId> {
        self.iter().map(|t| t.id).collect()
    }

    // ── runnable list ──────────────────────────────────────────────

    pub fn is_runnable(&self, id: ThreadId) -> bool {
        self.runnable.contains(&id)
    }

    /// Appends `id` to the runnable list and marks it runnable, clearing
    /// every blocking status bit.
    pub fn make_runnable(&mut self, id: ThreadId) {
        if let Some(thread) = self.get_mut(id) {
            thread.status = ThreadStatus::RUNNABLE
                | (thread.status & ThreadStatus::SUSPENDED);
            thread.blocked_on = Ref::NULL;
            thread.blocked_on_class = None;
            if thread.status.contains(ThreadStatus::SUSPENDED) {
                return;
            }
        }
        if !self.runnable.contains(&id) {
            self.runnable.push(id);
        }
    }

    pub fn unlink_runnable(&mut self, id: ThreadId) {
        self.runnable.retain(|&t| t != id);
    }

    /// Removes `id` from the runnable list with the given blocked status.
    pub fn block(&mut self, id: ThreadId, status: ThreadStatus) {
        self.unlink_runnable(id);
        if let Some(thread) = self.get_mut(id) {
            thread.status = status | (thread.status & ThreadStatus::SUSPENDED);
        }
    }

    /// Successor of `current` in round-robin order, or the head when
    /// `current` is no longer runnable.
    pub fn next_runnable(&self, current: ThreadId) -> Option<ThreadId> {
        if self.runnable.is_empty() {
            return None;
        }
        match self.runnable.iter().position(|&t| t == current) {
            Some(at) => Some(self.runnable[(at + 1) % self.runnable.len()]),
            None => Some(self.runnable[0]),
        }
    }

    // ── timed list ─────────────────────────────────────────────────

    pub fn add_timed(&mut self, id: ThreadId, wake_time: u64, callback: TimedCallback) {
        if let Some(thread) = self.get_mut(id) {
            thread.wake_time = wake_time;
            thread.callback = Some(callback);
        }
        if !self.timed.contains(&id) {
            self.timed.push(id);
        }
    }

    pub fn remove_timed(&mut self, id: ThreadId) {
        self.timed.retain(|&t| t != id);
        if let Some(thread) = self.get_mut(id) {
            thread.callback = None;
        }
    }

    pub fn earliest_wake(&self) -> Option<u64> {
        self.timed
            .iter()
            .filter_map(|&t| self.get(t))
            .map(|t| t.wake_time)
            .min()
    }

    /// Entries whose wake time has passed, removed from the list.
    pub fn take_expired(&mut self, now: u64) -> Vec<(ThreadId, TimedCallback)> {
        let mut expired = Vec::new();
        let mut remaining = Vec::with_capacity(self.timed.len());
        for &id in &self.timed {
            match self.slots.get(id.index()).and_then(Option::as_ref) {
                Some(thread) if thread.wake_time <= now => {
                    if let Some(callback) = thread.callback {
                        expired.push((id, callback));
                    }
                }
                Some(_) => remaining.push(id),
                None => {}
            }
        }
        self.timed = remaining;
        for (id, _) in &expired {
            if let Some(thread) = self.get_mut(*id) {
                thread.callback = None;
            }
        }
        expired
    }
}

impl Default for Threads {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<ThreadId> for Threads {
    type Output = VmThread;

    fn index(&self, id: ThreadId) -> &VmThread {
        match self.get(id) {
            Some(thread) => thread,
            None => panic!("thread {id:?} does not exist"),
        }
    }
}

impl IndexMut<ThreadId> for Threads {
    fn index_mut(&mut self, id: ThreadId) -> &mut VmThread {
        match self.get_mut(id) {
            Some(thread) => thread,
            None => panic!("thread {id:?} does not exist"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_successor() {
        let mut threads = Threads::new();
        let a = threads.create(Ref::NULL);
        let b = threads.create(Ref::NULL);
        let c = threads.create(Ref::NULL);
        for id in [a, b, c] {
            threads.make_runnable(id);
        }
        assert_eq!(threads.next_runnable(a), Some(b));
        assert_eq!(threads.next_runnable(c), Some(a));
        threads.block(b, ThreadStatus::BLOCKED);
        assert_eq!(threads.next_runnable(b), Some(a));
        assert_eq!(threads[b].status, ThreadStatus::BLOCKED);
        assert_eq!(threads.next_runnable(a), Some(c));
    }

    #[test]
    fn timed_expiry() {
        let mut threads = Threads::new();
        let a = threads.create(Ref::NULL);
        let b = threads.create(Ref::NULL);
        threads.add_timed(a, 100, TimedCallback::SleepTimeout);
        threads.add_timed(b, 50, TimedCallback::WaitTimeout);
        assert_eq!(threads.earliest_wake(), Some(50));
        assert_eq!(threads.take_expired(60), vec![(b, TimedCallback::WaitTimeout)]);
        assert_eq!(threads.timed, vec![a]);
        assert!(threads.take_expired(99).is_empty());
        assert_eq!(threads.take_expired(100).len(), 1);
        assert!(threads.timed.is_empty());
    }

    #[test]
    fn dead_thread_slots_are_reused() {
        let mut threads = Threads::new();
        let main = threads.create(Ref::NULL);
        for _ in 0..1000 {
            let worker = threads.create(Ref::NULL);
            threads.make_runnable(worker);
            assert!(threads.remove(worker).is_some());
        }
        assert_eq!(threads.slots.len(), 2);

        let a = threads.create(Ref::NULL);
        let b = threads.create(Ref::NULL);
        threads.remove(a);
        assert_eq!(threads.create(Ref::NULL), a);
        assert!(threads.get(b).is_some());
        assert_eq!(threads.ids(), vec![main, a, b]);
        assert!(!threads.is_runnable(a));
    }

    #[test]
    fn suspended_threads_stay_off_the_runnable_list() {
        let mut threads = Threads::new();
        let a = threads.create(Ref::NULL);
        threads[a].status = ThreadStatus::SUSPENDED;
        threads.make_runnable(a);
        assert!(!threads.is_runnable(a));
        assert!(threads[a].status.contains(ThreadStatus::RUNNABLE));
    }
}
