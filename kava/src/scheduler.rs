//! Cooperative scheduling: monitors, wait/notify, sleep, interrupt and the
//! thread life cycle.
//!
//! Exactly one VM thread runs at a time. Anything that suspends a thread
//! only takes it off the runnable list and zeroes the timeslice; the
//! interpreter loop then switches to the next runnable thread.

use std::time::Duration;

use log::{debug, error, trace};

use crate::Vm;
use crate::cell::{Cell, Ref};
use crate::class::MethodId;
use crate::debug::DebugEvent;
use crate::error::{ExitCode, VmError, VmResult};
use crate::frame::{Callback, KILL_PC, Registers};
use crate::thread::{ThreadId, ThreadStatus, TimedCallback};

/// `Thread.eetop` of a thread that has run to completion.
pub const EETOP_TERMINATED: i32 = -1;

impl Vm {
    // ── stacks ─────────────────────────────────────────────────────

    /// Gives `thread` its first stack segment. Registers point at the empty
    /// segment; the first frame pushed becomes the bottom frame.
    pub(crate) fn prepare_thread_stack(&mut self, thread: ThreadId) -> VmResult<()> {
        let segment = self.new_stack_segment(thread, self.settings.stack_segment_cells)?;
        let regs = Registers {
            sp: segment.index() + 1,
            pc: KILL_PC,
            ppc: 0,
            method: MethodId::WEDGE,
            locals: 0,
            segment,
        };
        self.threads[thread].stack_head = segment;
        if thread == self.current {
            self.regs = regs;
        } else {
            self.threads[thread].regs = regs;
        }
        Ok(())
    }

    /// Returns every segment of a finished thread to the heap.
    fn release_stack(&mut self, thread: ThreadId) {
        let mut segment = self.threads[thread].stack_head;
        while !segment.is_null() {
            let next = self.heap.field(segment, 0).reference();
            self.heap.free(segment);
            segment = next;
        }
        let t = &mut self.threads[thread];
        t.stack_head = Ref::NULL;
        t.stack_cells = 0;
        t.regs = Registers::default();
        if thread == self.current {
            self.regs = Registers::default();
        }
    }

    /// Thread id recorded in a `java.lang.Thread`, if it is running.
    pub(crate) fn thread_of(&self, object: Ref) -> Option<ThreadId> {
        let eetop = self.int_field(object, self.known.thread_eetop);
        (eetop > 0).then(|| ThreadId(eetop as u32 - 1))
    }

    /// Creates the `java.lang.Thread` object of the bootstrap thread.
    pub(crate) fn attach_main_thread_object(&mut self) -> VmResult<()> {
        let main = self.current;
        self.scoped(|vm| {
            let object = vm.new_object(vm.known.thread)?;
            vm.root(object)?;
            let name = vm.intern("main")?;
            vm.set_ref_field(object, vm.known.thread_name, name);
            vm.set_int_field(object, vm.known.thread_priority, 5);
            vm.set_int_field(object, vm.known.thread_eetop, main.0 as i32 + 1);
            vm.threads[main].object = object;
            Ok(())
        })
    }

    // ── monitors ───────────────────────────────────────────────────

    /// Gives `thread` ownership of a free monitor, restoring the depth it
    /// held before a `wait`.
    fn acquire(&mut self, object: Ref, thread: ThreadId) {
        let saved = std::mem::take(&mut self.threads[thread].saved_depth);
        let monitor = self.monitors.attach(object);
        monitor.owner = Some(thread);
        monitor.depth = saved.max(1);
    }

    /// Enters `object`'s monitor on behalf of `thread`. Returns `false` when
    /// the thread had to queue; it owns the monitor by the time it runs
    /// again.
    pub(crate) fn monitor_enter(&mut self, object: Ref, thread: ThreadId) -> bool {
        let owner = self.monitors.attach(object).owner;
        match owner {
            None => {
                self.acquire(object, thread);
                true
            }
            Some(owner) if owner == thread => {
                self.monitors.attach(object).depth += 1;
                true
            }
            Some(_) => {
                self.monitors.attach(object).lock_queue.push_back(thread);
                self.threads.block(thread, ThreadStatus::BLOCKED);
                self.threads[thread].blocked_on = object;
                if thread == self.current {
                    self.timeslice = 0;
                }
                trace!("{thread:?} blocked on {object:?}");
                false
            }
        }
    }

    pub(crate) fn monitor_exit(&mut self, object: Ref) -> VmResult<()> {
        if !self.owns(object, self.current) {
            return Err(self.throw_new("java/lang/IllegalMonitorStateException", None));
        }
        let released = self.monitors.get_mut(object).is_some_and(|monitor| {
            monitor.depth -= 1;
            monitor.depth == 0
        });
        if released {
            self.promote(object);
        }
        Ok(())
    }

    /// Releases `object`'s monitor and hands it to the head of its lock
    /// queue, if any.
    fn promote(&mut self, object: Ref) {
        let Some(monitor) = self.monitors.get_mut(object) else {
            return;
        };
        monitor.owner = None;
        monitor.depth = 0;
        match monitor.lock_queue.pop_front() {
            Some(next) => {
                self.acquire(object, next);
                self.threads.make_runnable(next);
                trace!("monitor {object:?} passed to {next:?}");
            }
            None => self.monitors.release_if_idle(object),
        }
    }

    pub(crate) fn owns(&self, object: Ref, thread: ThreadId) -> bool {
        self.monitors
            .get(object)
            .is_some_and(|m| m.owner == Some(thread))
    }

    /// Takes the monitor again after leaving a wait queue, or queues for it.
    fn reacquire(&mut self, object: Ref, thread: ThreadId) {
        let free = self.monitors.get(object).is_none_or(|m| m.owner.is_none());
        if free {
            self.acquire(object, thread);
            self.threads.make_runnable(thread);
        } else {
            self.monitors.attach(object).lock_queue.push_back(thread);
            self.threads.block(thread, ThreadStatus::BLOCKED);
            self.threads[thread].blocked_on = object;
        }
    }

    // ── wait / notify ──────────────────────────────────────────────

    /// `Object.wait(millis)`; zero waits until notified.
    pub(crate) fn wait(&mut self, object: Ref, millis: i64) -> VmResult<()> {
        let current = self.current;
        if millis < 0 {
            return Err(self.throw_new("java/lang/IllegalArgumentException", Some("timeout value is negative")));
        }
        if !self.owns(object, current) {
            return Err(self.throw_new("java/lang/IllegalMonitorStateException", None));
        }
        if std::mem::take(&mut self.threads[current].interrupted) {
            return Err(self.throw_new("java/lang/InterruptedException", None));
        }
        let depth = match self.monitors.get_mut(object) {
            Some(monitor) => {
                monitor.wait_queue.push_back(current);
                monitor.depth
            }
            None => return Err(VmError::internal("owned monitor vanished")),
        };
        let thread = &mut self.threads[current];
        thread.saved_depth = depth;
        thread.waiting_on = object;
        if millis > 0 {
            let wake = self.now_millis() + millis as u64;
            self.threads
                .block(current, ThreadStatus::WAITING | ThreadStatus::TIMED);
            self.threads
                .add_timed(current, wake, TimedCallback::WaitTimeout);
        } else {
            self.threads.block(current, ThreadStatus::WAITING);
        }
        self.timeslice = 0;
        self.promote(object);
        Ok(())
    }

    pub(crate) fn notify(&mut self, object: Ref, all: bool) -> VmResult<()> {
        if !self.owns(object, self.current) {
            return Err(self.throw_new("java/lang/IllegalMonitorStateException", None));
        }
        self.wake_waiters(object, all);
        Ok(())
    }

    fn wake_waiters(&mut self, object: Ref, all: bool) {
        loop {
            let Some(waiter) = self
                .monitors
                .get_mut(object)
                .and_then(|m| m.wait_queue.pop_front())
            else {
                break;
            };
            self.threads.remove_timed(waiter);
            self.threads[waiter].waiting_on = Ref::NULL;
            self.reacquire(object, waiter);
            if !all {
                break;
            }
        }
    }

    /// Timed-list callback of a waiter whose timeout elapsed (or who was
    /// interrupted).
    fn wait_timeout(&mut self, thread: ThreadId) {
        let object = self.threads[thread].waiting_on;
        if object.is_null() {
            self.threads.make_runnable(thread);
            return;
        }
        if let Some(monitor) = self.monitors.get_mut(object) {
            monitor.wait_queue.retain(|&t| t != thread);
        }
        self.threads[thread].waiting_on = Ref::NULL;
        self.reacquire(object, thread);
    }

    // ── sleep / interrupt ──────────────────────────────────────────

    pub(crate) fn sleep(&mut self, millis: i64) -> VmResult<()> {
        let current = self.current;
        if millis < 0 {
            return Err(self.throw_new("java/lang/IllegalArgumentException", Some("timeout value is negative")));
        }
        if std::mem::take(&mut self.threads[current].interrupted) {
            return Err(self.throw_new("java/lang/InterruptedException", Some("sleep interrupted")));
        }
        self.timeslice = 0;
        if millis == 0 {
            return Ok(());
        }
        let wake = self.now_millis() + millis as u64;
        self.threads
            .block(current, ThreadStatus::TIMED | ThreadStatus::SLEEPING);
        self.threads
            .add_timed(current, wake, TimedCallback::SleepTimeout);
        Ok(())
    }

    /// Sets the interrupt flag; a sleeping or waiting target wakes at the
    /// next switch and throws `InterruptedException`.
    pub(crate) fn interrupt(&mut self, thread: ThreadId) -> VmResult<()> {
        let status = self.threads[thread].status;
        self.threads[thread].interrupted = true;
        let callback = if status.contains(ThreadStatus::SLEEPING) {
            TimedCallback::SleepTimeout
        } else if status.contains(ThreadStatus::WAITING) {
            TimedCallback::WaitTimeout
        } else {
            return Ok(());
        };
        let exception = self.new_throwable("java/lang/InterruptedException", None)?;
        let t = &mut self.threads[thread];
        t.pending = exception;
        t.interrupted = false;
        self.threads.add_timed(thread, 0, callback);
        Ok(())
    }

    // ── timed list ─────────────────────────────────────────────────

    pub(crate) fn fire_timed(&mut self) {
        if self.threads.timed.is_empty() {
            return;
        }
        let now = self.now_millis();
        for (thread, callback) in self.threads.take_expired(now) {
            match callback {
                TimedCallback::SleepTimeout => self.threads.make_runnable(thread),
                TimedCallback::WaitTimeout => self.wait_timeout(thread),
            }
        }
    }

    // ── switching ──────────────────────────────────────────────────

    /// Saves the running thread's registers and loads the next runnable
    /// thread's, waiting on the timed list when nothing can run.
    pub(crate) fn switch_thread(&mut self) -> VmResult<()> {
        self.fire_timed();
        self.flush_debug_events();
        loop {
            if let Some(next) = self.threads.next_runnable(self.current) {
                if next != self.current {
                    if let Some(outgoing) = self.threads.get_mut(self.current) {
                        outgoing.regs = self.regs;
                    }
                    self.regs = self.threads[next].regs;
                    self.current = next;
                }
                self.timeslice = self.threads[next].priority.max(1) * self.settings.quantum;
                return Ok(());
            }
            let Some(wake) = self.threads.earliest_wake() else {
                error!("no runnable or waiting threads");
                return Err(VmError::fatal(
                    ExitCode::NoRunnableOrWaitingThreads,
                    "deadlock: no runnable or waiting threads",
                ));
            };
            let now = self.now_millis();
            if wake > now {
                std::thread::sleep(Duration::from_millis(wake - now));
            }
            self.fire_timed();
        }
    }

    // ── life cycle ─────────────────────────────────────────────────

    /// `Thread.start`: builds the new thread's stack (termination wedge plus
    /// a `run` frame) and makes it runnable.
    pub(crate) fn start_thread(&mut self, object: Ref) -> VmResult<()> {
        if self.int_field(object, self.known.thread_eetop) != 0 {
            return Err(self.throw_new("java/lang/IllegalThreadStateException", None));
        }
        let class = self.class_of(object);
        let Some(run) = self.select_virtual(class, "run", "()V") else {
            return Err(self.throw_new("java/lang/AbstractMethodError", Some("run")));
        };
        let daemon = self.int_field(object, self.known.thread_daemon) != 0;
        let priority = self.int_field(object, self.known.thread_priority).clamp(1, 10) as u32;

        let id = self.threads.create(object);
        self.threads[id].daemon = daemon;
        self.threads[id].priority = priority;
        if let Err(e) = self.prepare_thread_stack(id) {
            self.threads.remove(id);
            return Err(e);
        }
        let base = self.threads[id].regs;
        let frames = self
            .push_frame_on(id, base, KILL_PC, MethodId::WEDGE, Ref::NULL)
            .and_then(|wedge| {
                self.heap
                    .set_cell(wedge.locals, Cell::from_int(Callback::ThreadExit as i32));
                self.heap.set_cell(wedge.locals + 1, Cell::ZERO);
                let mut caller = wedge;
                self.heap.set_cell(caller.sp, Cell::from_ref(object));
                caller.sp += 1;
                let synchronized = self.classes.method(run).is_synchronized();
                let monitor = if synchronized { object } else { Ref::NULL };
                self.push_frame_on(id, caller, 0, run, monitor)
            });
        let regs = match frames {
            Ok(regs) => regs,
            Err(e) => {
                self.release_stack(id);
                self.threads.remove(id);
                return Err(e);
            }
        };
        self.threads[id].regs = regs;
        self.set_int_field(object, self.known.thread_eetop, id.0 as i32 + 1);
        self.threads.active += 1;
        self.threads.started += 1;
        if !daemon {
            self.threads.non_daemon += 1;
        }

        let synchronized = self.classes.method(run).is_synchronized();
        if !synchronized || self.monitor_enter(object, id) {
            self.threads.make_runnable(id);
        }
        debug!("started {id:?} ({})", self.classes.describe(run));
        self.post_event(DebugEvent::ThreadStart { thread: id });
        Ok(())
    }

    /// Runs when the running thread returns into its bottom wedge.
    pub(crate) fn terminate_thread(&mut self) {
        let id = self.current;
        let (object, daemon, is_main, uncaught) = {
            let t = &self.threads[id];
            (t.object, t.daemon, t.is_main, t.dispatching_uncaught)
        };
        if is_main && uncaught {
            self.exit_code = ExitCode::Uncaught;
        }
        if !object.is_null() {
            self.set_int_field(object, self.known.thread_eetop, EETOP_TERMINATED);
            // join() waits on the thread object
            self.wake_waiters(object, true);
        }
        self.post_event(DebugEvent::ThreadDeath { thread: id });
        self.release_stack(id);
        self.monitors.forget_thread(id);
        self.threads.active = self.threads.active.saturating_sub(1);
        if !daemon {
            self.threads.non_daemon = self.threads.non_daemon.saturating_sub(1);
        }
        self.threads.remove(id);
        self.timeslice = 0;
        debug!("{id:?} terminated, {} non-daemon threads left", self.threads.non_daemon);
    }

    // ── debugger suspension ────────────────────────────────────────

    pub fn suspend_thread(&mut self, thread: ThreadId) {
        if let Some(t) = self.threads.get_mut(thread) {
            t.status |= ThreadStatus::SUSPENDED;
            self.threads.unlink_runnable(thread);
            if thread == self.current {
                self.timeslice = 0;
            }
        }
    }

    pub fn resume_thread(&mut self, thread: ThreadId) {
        if let Some(t) = self.threads.get_mut(thread) {
            t.status.remove(ThreadStatus::SUSPENDED);
            if t.status.contains(ThreadStatus::RUNNABLE) {
                self.threads.make_runnable(thread);
            }
        }
    }
}
