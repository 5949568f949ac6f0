use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::cell::Ref;
use crate::thread::ThreadId;

/// Lock record attached to an object the first time it is synchronized on.
#[derive(Debug, Default)]
pub struct Monitor {
    pub object: Ref,
    pub owner: Option<ThreadId>,
    pub depth: u32,
    /// Threads contending for ownership.
    pub lock_queue: VecDeque<ThreadId>,
    /// Threads in `Object.wait`.
    pub wait_queue: VecDeque<ThreadId>,
}

impl Monitor {
    pub fn is_idle(&self) -> bool {
        self.owner.is_none() && self.lock_queue.is_empty() && self.wait_queue.is_empty()
    }
}

/// Monitors in use, plus zeroed records ready for reuse.
#[derive(Debug, Default)]
pub struct MonitorCache {
    monitors: Vec<Monitor>,
    free: Vec<usize>,
    by_object: FxHashMap<Ref, usize>,
}

impl MonitorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, object: Ref) -> Option<&Monitor> {
        self.by_object.get(&object).map(|&i| &self.monitors[i])
    }

    pub fn get_mut(&mut self, object: Ref) -> Option<&mut Monitor> {
        let index = *self.by_object.get(&object)?;
        Some(&mut self.monitors[index])
    }

    /// The monitor of `object`, attaching a cached one if it has none.
    pub fn attach(&mut self, object: Ref) -> &mut Monitor {
        let index = match self.by_object.get(&object) {
            Some(&index) => index,
            None => {
                let index = match self.free.pop() {
                    Some(index) => index,
                    None => {
                        self.monitors.push(Monitor::default());
                        self.monitors.len() - 1
                    }
                };
                self.monitors[index].object = object;
                self.by_object.insert(object, index);
                index
            }
        };
        &mut self.monitors[index]
    }

    /// Returns the monitor of `object` to the cache if nothing refers to it.
    pub fn release_if_idle(&mut self, object: Ref) {
        let Some(&index) = self.by_object.get(&object) else {
            return;
        };
        if self.monitors[index].is_idle() {
            self.monitors[index] = Monitor::default();
            self.by_object.remove(&object);
            self.free.push(index);
        }
    }

    pub fn in_use(&self) -> impl Iterator<Item = &Monitor> {
        self.by_object.values().map(|&i| &self.monitors[i])
    }

    pub fn in_use_count(&self) -> usize {
        self.by_object.len()
    }

    pub fn cached_count(&self) -> usize {
        self.free.len()
    }

    /// Removes `thread` from every queue, e.g. when it terminates.
    pub fn forget_thread(&mut self, thread: ThreadId) {
        for &index in self.by_object.values() {
            let monitor = &mut self.monitors[index];
            monitor.lock_queue.retain(|&t| t != thread);
            monitor.wait_queue.retain(|&t| t != thread);
        }
    }
}
