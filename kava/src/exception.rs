//! Throwables raised by the VM, handler search and stack unwinding.
//!
//! Unwinding happens in two steps: the handler is located first (so that a
//! debugger sees the exception with its catch site before any frame is
//! popped), then frames are popped up to the handler, releasing the monitors
//! of synchronized methods on the way. Callback wedges bound the search: a
//! class-initialization wedge turns the exception into an initialization
//! failure, and the thread-exit wedge hands it to
//! `Thread.dispatchUncaughtException`.

use log::debug;

use crate::Vm;
use crate::cell::{Cell, Ref};
use crate::class::{Class, ClassId, ClassState, Constant, MethodBody, MethodId};
use crate::debug::DebugEvent;
use crate::error::{ExitCode, VmError, VmResult};
use crate::frame::{Callback, FrameInfo};

/// Where the handler search for a throwable stopped.
enum Stop {
    Handler { depth: usize, pc: u32 },
    Clinit { depth: usize },
    ThreadExit { depth: usize },
}

impl Vm {
    // ── creating throwables ────────────────────────────────────────

    /// A fresh throwable of a bootstrap exception class with `message` and
    /// the current thread's backtrace. Exception classes are never loaded
    /// here; a missing one is a VM bug.
    pub fn new_throwable(&mut self, class: &str, message: Option<&str>) -> VmResult<Ref> {
        let Some(id) = self.classes.lookup(class, Ref::NULL) else {
            return Err(VmError::internal(format!("exception class {class} is not loaded")));
        };
        self.scoped(|vm| {
            let throwable = vm.new_object(id)?;
            vm.root(throwable)?;
            if let Some(message) = message {
                let text = vm.new_string(message)?;
                vm.set_ref_field(throwable, vm.known.throwable_message, text);
            }
            vm.fill_backtrace(throwable)?;
            Ok(throwable)
        })
    }

    /// [`Vm::new_throwable`] wrapped for `return Err(vm.throw_new(..))`.
    pub fn throw_new(&mut self, class: &str, message: Option<&str>) -> VmError {
        match self.new_throwable(class, message) {
            Ok(throwable) => VmError::Throw(throwable),
            Err(e) => e,
        }
    }

    /// Records the running thread's stack in `throwable`'s backtrace field,
    /// leaving out the frames that are constructing it.
    pub(crate) fn fill_backtrace(&mut self, throwable: Ref) -> VmResult<()> {
        let text = self.backtrace_text();
        let backtrace = self.new_string(&text)?;
        self.set_ref_field(throwable, self.known.throwable_backtrace, backtrace);
        Ok(())
    }

    fn backtrace_text(&self) -> String {
        if self.regs.locals == 0 {
            return String::new();
        }
        let throwable = self.known.throwable;
        let mut lines = Vec::new();
        let mut constructing = true;
        for frame in self.frames_from(self.regs) {
            if frame.method.is_wedge() {
                continue;
            }
            let Some(class) = self.classes.get(frame.method.class) else {
                continue;
            };
            let method = self.classes.method(frame.method);
            if constructing
                && (method.name == "<init>" || method.name == "fillInStackTrace")
                && self.classes.is_subclass(class.id, throwable)
            {
                continue;
            }
            constructing = false;
            let location = match (&method.body, &class.source_file) {
                (MethodBody::Native(_), _) => "Native Method".to_string(),
                (MethodBody::Bytecode(code), Some(file)) => match code.line_at(frame.pc) {
                    Some(line) => format!("{file}:{line}"),
                    None => file.clone(),
                },
                _ => "Unknown Source".to_string(),
            };
            lines.push(format!("\tat {}.{}({location})", class.java_name(), method.name));
        }
        lines.join("\n")
    }

    /// `java.lang.RuntimeException: message`, as `Throwable.toString`.
    pub(crate) fn describe_throwable(&self, throwable: Ref) -> String {
        let name = self.classes[self.class_of(throwable)].java_name();
        let message = self.ref_field(throwable, self.known.throwable_message);
        if message.is_null() {
            name
        } else {
            format!("{name}: {}", self.string_value(message))
        }
    }

    /// Full report of a throwable and its causes.
    pub(crate) fn stack_trace_text(&self, throwable: Ref) -> String {
        let mut text = String::new();
        let mut seen = Vec::new();
        let mut cursor = throwable;
        while !cursor.is_null() && !seen.contains(&cursor) {
            if !seen.is_empty() {
                text.push_str("Caused by: ");
            }
            text.push_str(&self.describe_throwable(cursor));
            text.push('\n');
            let backtrace = self.ref_field(cursor, self.known.throwable_backtrace);
            if !backtrace.is_null() {
                let lines = self.string_value(backtrace);
                if !lines.is_empty() {
                    text.push_str(&lines);
                    text.push('\n');
                }
            }
            seen.push(cursor);
            cursor = self.ref_field(cursor, self.known.throwable_cause);
        }
        text
    }

    /// Prints `Exception in thread "name" ...` to the console.
    pub(crate) fn report_uncaught(&mut self, thread: Ref, throwable: Ref) {
        if throwable.is_null() {
            return;
        }
        let name = match thread.non_null() {
            Some(thread) => self.string_value(self.ref_field(thread, self.known.thread_name)),
            None => "main".to_string(),
        };
        debug!("uncaught {} in thread {name}", self.describe_throwable(throwable));
        if self.console.is_present() {
            let report = format!("Exception in thread \"{name}\" {}", self.stack_trace_text(throwable));
            self.console.write(&report);
        }
    }

    // ── handler search ─────────────────────────────────────────────

    fn catch_matches(&self, class: &Class, index: u16, thrown: ClassId) -> bool {
        let target = match class.constants.get(index as usize) {
            Some(Constant::Class {
                resolved: Some(id), ..
            }) => Some(*id),
            // an unloaded catch type has no instances
            Some(Constant::Class { name, .. }) => self.loaded_class(name, class.loader),
            _ => None,
        };
        target.is_some_and(|t| self.is_assignable(thrown, t))
    }

    /// Handler pc in `method` covering `pc` for `exception`.
    fn find_handler(&self, method: MethodId, pc: u32, exception: Ref) -> Option<u32> {
        let code = self.classes.method(method).code()?;
        let class = &self.classes[method.class];
        let thrown = self.class_of(exception);
        code.handlers
            .iter()
            .find(|h| {
                (h.start_pc as u32..h.end_pc as u32).contains(&pc)
                    && (h.catch_type == 0 || self.catch_matches(class, h.catch_type, thrown))
            })
            .map(|h| h.handler_pc as u32)
    }

    fn locate(&self, frames: &[FrameInfo], exception: Ref) -> VmResult<Stop> {
        for (depth, frame) in frames.iter().enumerate() {
            if frame.method.is_wedge() {
                match Callback::from_cell(self.heap.cell(frame.locals)) {
                    Some(Callback::NewInstance) => continue,
                    Some(Callback::ClinitDone) => return Ok(Stop::Clinit { depth }),
                    Some(Callback::ThreadExit) => return Ok(Stop::ThreadExit { depth }),
                    None => return Err(VmError::internal("corrupt callback wedge")),
                }
            }
            if let Some(pc) = self.find_handler(frame.method, frame.pc, exception) {
                return Ok(Stop::Handler { depth, pc });
            }
        }
        Err(VmError::internal("thread stack has no exit wedge"))
    }

    // ── unwinding ──────────────────────────────────────────────────

    /// Delivers `exception` on the running thread: transfers control to the
    /// nearest handler, fails a class initialization, or starts uncaught
    /// exception dispatch.
    pub(crate) fn throw_exception(&mut self, mut exception: Ref) -> VmResult<()> {
        'search: loop {
            let frames = self.frames_from(self.regs);
            let stop = self.locate(&frames, exception)?;

            if self.debugger.is_some() {
                let catch = match stop {
                    Stop::Handler { depth, pc } => Some((frames[depth].method, pc)),
                    _ => None,
                };
                let top = frames.iter().find(|f| !f.method.is_wedge()).copied().unwrap_or(frames[0]);
                self.post_thread_event(DebugEvent::Exception {
                    thread: self.current,
                    exception,
                    method: top.method,
                    pc: top.pc,
                    catch,
                });
            }

            let depth = match stop {
                Stop::Handler { depth, .. } | Stop::Clinit { depth } | Stop::ThreadExit { depth } => depth,
            };
            for frame in &frames[..depth] {
                let monitor = frame.monitor;
                self.pop_frame();
                if frame.method.is_wedge() || monitor.is_null() {
                    continue;
                }
                if self.owns(monitor, self.current) {
                    self.monitor_exit(monitor)?;
                } else {
                    // the method gave up its own monitor
                    exception = self.new_throwable("java/lang/IllegalMonitorStateException", None)?;
                    continue 'search;
                }
            }

            match stop {
                Stop::Handler { pc, .. } => {
                    let method = self.classes.method(self.regs.method);
                    let locals = method.max_locals.max(method.arg_cells) as usize;
                    self.regs.sp = self.regs.locals + locals;
                    self.push_ref(exception);
                    self.regs.pc = pc;
                    return Ok(());
                }
                Stop::Clinit { .. } => {
                    exception = self.fail_initialization(exception)?;
                }
                Stop::ThreadExit { .. } => return self.dispatch_uncaught(exception),
            }
        }
    }

    /// Unwinds through a class-initialization wedge: the class becomes
    /// erroneous and the exception is wrapped unless it is an `Error`.
    fn fail_initialization(&mut self, exception: Ref) -> VmResult<Ref> {
        let class = ClassId(self.local(1).raw() as u32);
        self.pop_frame();
        if let Some(c) = self.classes.get_mut(class) {
            c.state = ClassState::Error;
        }
        self.wake_class_waiters(class);
        debug!("initialization of {} failed", self.classes[class].name);
        if self.instance_of(exception, self.known.error) {
            return Ok(exception);
        }
        self.scoped(|vm| {
            vm.root(exception)?;
            let wrapper = vm.new_throwable("java/lang/ExceptionInInitializerError", None)?;
            vm.set_ref_field(wrapper, vm.known.throwable_cause, exception);
            Ok(wrapper)
        })
    }

    /// The thread's stack is down to its exit wedge. The first time, run
    /// `dispatchUncaughtException`; if that throws too, report and stop the
    /// VM.
    fn dispatch_uncaught(&mut self, exception: Ref) -> VmResult<()> {
        let current = self.current;
        let (object, dispatching) = {
            let t = &self.threads[current];
            (t.object, t.dispatching_uncaught)
        };
        let handler = object.non_null().and_then(|object| {
            self.select_virtual(
                self.class_of(object),
                "dispatchUncaughtException",
                "(Ljava/lang/Throwable;)V",
            )
        });
        let handler = match handler {
            Some(handler) if !dispatching => handler,
            _ => {
                self.report_uncaught(object, exception);
                self.exit_code = ExitCode::Uncaught;
                if dispatching {
                    return Err(VmError::fatal(
                        ExitCode::Uncaught,
                        "exception escaped the uncaught exception handler",
                    ));
                }
                self.threads[current].dispatching_uncaught = true;
                self.terminate_thread();
                return Ok(());
            }
        };
        self.threads[current].dispatching_uncaught = true;
        self.push(Cell::from_ref(object));
        self.push(Cell::from_ref(exception));
        if let Err(e) = self.push_frame(0, handler, Ref::NULL) {
            self.regs.sp -= 2;
            self.report_uncaught(object, exception);
            self.terminate_thread();
            return match e {
                VmError::Throw(_) => Ok(()),
                other => Err(other),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ClassBuilder;
    use crate::classfile::MethodAccess;
    use crate::config::VmSettings;
    use crate::opcodes::*;
    use crate::testkit;

    #[test]
    fn throwables_carry_message_and_class() {
        let mut vm = Vm::new(VmSettings::default()).unwrap();
        let npe = vm.new_throwable("java/lang/NullPointerException", Some("x is null")).unwrap();
        assert_eq!(vm.describe_throwable(npe), "java.lang.NullPointerException: x is null");
        let bare = vm.new_throwable("java/lang/ArithmeticException", None).unwrap();
        assert_eq!(vm.describe_throwable(bare), "java.lang.ArithmeticException");
    }

    #[test]
    fn unknown_exception_classes_are_fatal() {
        let mut vm = Vm::new(VmSettings::default()).unwrap();
        assert!(matches!(
            vm.new_throwable("p/NotAnException", None),
            Err(VmError::Fatal { code: ExitCode::Internal, .. })
        ));
    }

    #[test]
    fn stack_trace_lists_causes() {
        let mut vm = Vm::new(VmSettings::default()).unwrap();
        let cause = vm.new_throwable("java/lang/IllegalStateException", Some("inner")).unwrap();
        vm.root_permanent(cause).unwrap();
        let outer = vm.new_throwable("java/lang/RuntimeException", Some("outer")).unwrap();
        vm.set_ref_field(outer, vm.known.throwable_cause, cause);
        let text = vm.stack_trace_text(outer);
        assert_eq!(
            text,
            "java.lang.RuntimeException: outer\nCaused by: java.lang.IllegalStateException: inner\n"
        );
    }

    /// `thrower` throws from inside a try block whose handler returns 7;
    /// `outer` calls a method that throws without a local handler.
    fn handler_class(vm: &mut Vm) -> ClassId {
        let mut b = ClassBuilder::new("p/Catch", Some("java/lang/Object"));
        b.source_file("Catch.java");
        b.method(MethodAccess::STATIC, "thrower", "()I", |c| {
            let start = c.label();
            let end = c.label();
            let handler = c.label();
            c.bind(start);
            c.line(10);
            c.construct("java/lang/IllegalStateException");
            c.op(ATHROW);
            c.bind(end);
            c.bind(handler);
            c.line(12);
            c.op(POP);
            c.iconst(7);
            c.op(IRETURN);
            c.try_catch(start, end, handler, Some("java/lang/RuntimeException"));
        });
        b.method(MethodAccess::STATIC, "boom", "()V", |c| {
            c.line(20);
            c.construct("java/lang/RuntimeException");
            c.op(ATHROW);
        });
        b.method(MethodAccess::STATIC, "main", "([Ljava/lang/String;)V", |c| {
            c.invokestatic("p/Catch", "boom", "()V");
            c.op(RETURN);
        });
        vm.define_class(&b.build(), Ref::NULL).unwrap()
    }

    #[test]
    fn caught_exceptions_resume_at_the_handler() {
        let (mut vm, out) = testkit::vm();
        handler_class(&mut vm);
        testkit::main_class(&mut vm, "p/Caller", |c| {
            c.invokestatic("p/Catch", "thrower", "()I");
            c.invokestatic("t/Out", "print", "(I)V");
            c.op(RETURN);
        });
        assert_eq!(vm.run_main("p/Caller", &[]), ExitCode::Success);
        assert_eq!(testkit::output(&out), "7\n");
    }

    #[test]
    fn uncaught_exceptions_reach_the_console() {
        let (mut vm, buffer) = testkit::vm();
        handler_class(&mut vm);
        let code = vm.run_main("p.Catch", &[]);
        assert_eq!(code, ExitCode::Uncaught);
        let out = testkit::output(&buffer);
        assert!(out.starts_with("Exception in thread \"main\" java.lang.RuntimeException\n"), "{out}");
        assert!(out.contains("\tat p.Catch.boom(Catch.java:20)"), "{out}");
        assert!(out.contains("\tat p.Catch.main(Unknown Source)") || out.contains("\tat p.Catch.main(Catch.java)"), "{out}");
    }
}
