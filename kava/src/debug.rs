//! Debugger event surface.
//!
//! The VM reports typed events to a [`DebugSink`]; how they reach a remote
//! debugger is the sink's business. Breakpoints are installed by rewriting
//! the instruction's opcode to `breakpoint` and remembering the displaced
//! byte here.

use log::debug;
use rustc_hash::FxHashMap;

use crate::Vm;
use crate::cell::Ref;
use crate::class::{ClassId, MethodId};
use crate::opcodes::BREAKPOINT;
use crate::thread::ThreadId;

#[derive(Debug, Clone, PartialEq)]
pub enum DebugEvent {
    VmStart,
    VmDeath,
    ThreadStart {
        thread: ThreadId,
    },
    ThreadDeath {
        thread: ThreadId,
    },
    ClassPrepare {
        class: ClassId,
        name: String,
    },
    /// Carries a copy of the name; the class is gone by delivery time.
    ClassUnload {
        name: String,
    },
    SingleStep {
        thread: ThreadId,
        method: MethodId,
        pc: u32,
    },
    Breakpoint {
        thread: ThreadId,
        method: MethodId,
        pc: u32,
    },
    Exception {
        thread: ThreadId,
        exception: Ref,
        method: MethodId,
        pc: u32,
        /// Handler that will catch it, if any.
        catch: Option<(MethodId, u32)>,
    },
}

/// What the thread that raised an event does next.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DebugAction {
    #[default]
    Continue,
    /// Suspend the thread until [`Vm::resume_thread`].
    Suspend,
}

pub trait DebugSink {
    fn event(&mut self, event: &DebugEvent) -> DebugAction;
}

/// Default sink: logs every event and never suspends.
pub struct LogSink;

impl DebugSink for LogSink {
    fn event(&mut self, event: &DebugEvent) -> DebugAction {
        debug!("debug event: {event:?}");
        DebugAction::Continue
    }
}

pub struct Debugger {
    sink: Box<dyn DebugSink>,
    /// Displaced opcodes by (method, pc).
    breakpoints: FxHashMap<(MethodId, u32), u8>,
    /// Events delivered at the next thread switch.
    queued: Vec<DebugEvent>,
}

impl Debugger {
    pub fn new(sink: Box<dyn DebugSink>) -> Self {
        Self {
            sink,
            breakpoints: FxHashMap::default(),
            queued: Vec::new(),
        }
    }

    pub fn set_sink(&mut self, sink: Box<dyn DebugSink>) {
        self.sink = sink;
    }

    pub fn post(&mut self, event: &DebugEvent) -> DebugAction {
        self.sink.event(event)
    }

    pub fn queue(&mut self, event: DebugEvent) {
        self.queued.push(event);
    }

    fn flush(&mut self) {
        for event in std::mem::take(&mut self.queued) {
            self.sink.event(&event);
        }
    }

    pub fn displaced(&self, method: MethodId, pc: u32) -> Option<u8> {
        self.breakpoints.get(&(method, pc)).copied()
    }

    pub(crate) fn forget_class(&mut self, class: ClassId) {
        self.breakpoints.retain(|(m, _), _| m.class != class);
    }
}

impl Vm {
    pub fn debugging(&self) -> bool {
        self.debugger.is_some()
    }

    pub(crate) fn flush_debug_events(&mut self) {
        if let Some(debugger) = &mut self.debugger {
            debugger.flush();
        }
    }

    /// Posts an event raised by the running thread, suspending it if the
    /// sink asks to.
    pub(crate) fn post_thread_event(&mut self, event: DebugEvent) {
        let action = match &mut self.debugger {
            Some(debugger) => debugger.post(&event),
            None => return,
        };
        if action == DebugAction::Suspend {
            self.suspend_thread(self.current);
        }
    }

    /// Installs a breakpoint at `pc` of `method`. Fails when there is no
    /// debugger, the method has no bytecode or `pc` is out of range.
    pub fn set_breakpoint(&mut self, method: MethodId, pc: u32) -> bool {
        let Some(debugger) = &mut self.debugger else {
            return false;
        };
        let Some(code) = self
            .classes
            .get_mut(method.class)
            .and_then(|c| c.methods.get_mut(method.index as usize))
            .and_then(|m| m.code_mut())
        else {
            return false;
        };
        let Some(byte) = code.bytes.get_mut(pc as usize) else {
            return false;
        };
        if *byte != BREAKPOINT {
            debugger.breakpoints.insert((method, pc), *byte);
            *byte = BREAKPOINT;
        }
        true
    }

    pub fn clear_breakpoint(&mut self, method: MethodId, pc: u32) -> bool {
        let Some(debugger) = &mut self.debugger else {
            return false;
        };
        let Some(original) = debugger.breakpoints.remove(&(method, pc)) else {
            return false;
        };
        if let Some(code) = self
            .classes
            .get_mut(method.class)
            .and_then(|c| c.methods.get_mut(method.index as usize))
            .and_then(|m| m.code_mut())
        {
            code.bytes[pc as usize] = original;
        }
        true
    }

    pub fn set_single_step(&mut self, thread: ThreadId, enabled: bool) {
        if let Some(t) = self.threads.get_mut(thread) {
            t.single_step = enabled;
        }
    }
}
