//! Method entry and exit, callback wedges and class initialization.

use log::{debug, trace};

use crate::Vm;
use crate::cell::{Cell, Ref};
use crate::class::{ClassId, ClassState, MethodBody, MethodId};
use crate::error::{VmError, VmResult};
use crate::frame::Callback;
use crate::natives::{NativeArgs, NativeValue};
use crate::thread::ThreadStatus;

/// Outcome of an initialization check made by a resolving instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum InitStatus {
    /// The class may be used right away.
    Ready,
    /// `<clinit>` frames were pushed; the instruction runs again once they
    /// return.
    Pushed,
    /// Another thread is initializing the class; this one waits for it.
    Blocked,
}

impl Vm {
    // ── class initialization ───────────────────────────────────────

    fn usable_by_current(&self, class: ClassId) -> bool {
        match self.classes[class].state {
            ClassState::Initialized => true,
            ClassState::Initializing(thread) => thread == self.current,
            _ => false,
        }
    }

    /// Makes sure `class` is initialized before the instruction at `ppc`
    /// uses it, scheduling `<clinit>` of the class and of its uninitialized
    /// superclasses (superclasses run first).
    pub(crate) fn ensure_initialized(&mut self, class: ClassId) -> VmResult<InitStatus> {
        if self.usable_by_current(class) {
            return Ok(InitStatus::Ready);
        }

        // nothing is pushed unless the whole chain can proceed
        let mut cursor = Some(class);
        while let Some(id) = cursor {
            let c = &self.classes[id];
            match c.state {
                ClassState::Initializing(owner) if owner != self.current => {
                    let current = self.current;
                    self.threads.block(current, ThreadStatus::BLOCKED);
                    self.threads[current].blocked_on_class = Some(id);
                    self.timeslice = 0;
                    trace!("{current:?} waits for initialization of {}", c.name);
                    return Ok(InitStatus::Blocked);
                }
                ClassState::Error => {
                    let message = format!("Could not initialize class {}", c.java_name());
                    return Err(self.throw_new("java/lang/NoClassDefFoundError", Some(&message)));
                }
                _ => {}
            }
            cursor = c.super_class;
        }

        let c = &self.classes[class];
        let clinit = c
            .declared_method("<clinit>", "()V")
            .map(|index| MethodId::new(class, index));
        let super_pending = c.super_class.filter(|&s| !self.usable_by_current(s));

        let Some(clinit) = clinit else {
            return match super_pending {
                // the instruction comes back here once the superclass is done
                Some(s) => self.ensure_initialized(s),
                None => {
                    self.classes[class].state = ClassState::Initialized;
                    debug!("initialized {}", self.classes[class].name);
                    Ok(InitStatus::Ready)
                }
            };
        };

        self.classes[class].state = ClassState::Initializing(self.current);
        self.push_wedge(self.regs.ppc, Callback::ClinitDone, Cell(class.0 as u64))?;
        self.push_frame(0, clinit, Ref::NULL)?;
        trace!("running {}", self.classes.describe(clinit));
        if let Some(s) = super_pending {
            self.ensure_initialized(s)?;
        }
        Ok(InitStatus::Pushed)
    }

    /// Schedules initialization of the main class above the `main` frame,
    /// which starts once it completes.
    pub(crate) fn initialize_for_launch(&mut self, class: ClassId) -> VmResult<()> {
        self.regs.ppc = 0;
        self.ensure_initialized(class).map(|_| ())
    }

    /// Makes runnable every thread waiting for `class` to finish (or fail)
    /// initialization.
    pub(crate) fn wake_class_waiters(&mut self, class: ClassId) {
        let waiting: Vec<_> = self
            .threads
            .iter()
            .filter(|t| t.blocked_on_class == Some(class))
            .map(|t| t.id)
            .collect();
        for thread in waiting {
            self.threads.make_runnable(thread);
        }
    }

    // ── invocation ─────────────────────────────────────────────────

    /// Calls `method` with its arguments on top of the operand stack.
    /// `next_pc` is where the caller continues.
    pub(crate) fn invoke(&mut self, method: MethodId, next_pc: u32) -> VmResult<()> {
        let m = self.classes.method(method);
        let (synchronized, is_static, arg_cells) = (m.is_synchronized(), m.is_static(), m.arg_cells as usize);
        match m.body {
            MethodBody::Abstract => {
                let message = self.classes.describe(method);
                Err(self.throw_new("java/lang/AbstractMethodError", Some(&message)))
            }
            MethodBody::Native(_) => self.invoke_native(method, next_pc),
            MethodBody::Bytecode(_) => {
                let monitor = if !synchronized {
                    Ref::NULL
                } else if is_static {
                    self.mirror_of(method.class)?
                } else {
                    self.peek(arg_cells - 1).reference()
                };
                self.push_frame(next_pc, method, monitor)?;
                if !monitor.is_null() {
                    // a blocked thread owns the monitor when it runs again
                    self.monitor_enter(monitor, self.current);
                }
                Ok(())
            }
        }
    }

    fn invoke_native(&mut self, method: MethodId, next_pc: u32) -> VmResult<()> {
        let function = self.bind_native(method)?;
        let m = self.classes.method(method);
        let (arg_cells, synchronized, is_static) =
            (m.arg_cells as usize, m.is_synchronized(), m.is_static());
        let base = self.regs.sp - arg_cells;

        let monitor = if !synchronized {
            Ref::NULL
        } else if is_static {
            self.mirror_of(method.class)?
        } else {
            self.heap.cell(base).reference()
        };
        if !monitor.is_null() {
            let current = self.current;
            let handed_over = self.threads[current].native_monitor == monitor;
            self.threads[current].native_monitor = Ref::NULL;
            let entered = (handed_over && self.owns(monitor, current))
                || self.monitor_enter(monitor, current);
            if !entered {
                // queued: the invoke runs again once the monitor is handed over
                self.threads[current].native_monitor = monitor;
                self.regs.pc = self.regs.ppc;
                return Ok(());
            }
        }

        self.regs.pc = next_pc;
        let args = NativeArgs {
            base,
            count: arg_cells,
        };
        let result = function(self, &args);
        if !monitor.is_null() && self.owns(monitor, self.current) {
            self.monitor_exit(monitor)?;
        }
        let value = result?;
        if value != NativeValue::Frames {
            self.regs.sp = base;
        }
        match value {
            NativeValue::Void | NativeValue::Frames => {}
            NativeValue::Int(v) => self.push_int(v),
            NativeValue::Long(v) => self.push_long(v),
            NativeValue::Float(v) => self.push_float(v),
            NativeValue::Double(v) => self.push_double(v),
            NativeValue::Ref(v) => self.push_ref(v),
        }
        Ok(())
    }

    /// Runs `<init>()V` of `class` on a fresh instance from inside a native,
    /// which must have dropped its own arguments and then return
    /// [`NativeValue::Frames`]. The instance lands on the caller's stack when
    /// the constructor returns.
    pub(crate) fn construct_from_native(&mut self, class: ClassId) -> VmResult<NativeValue> {
        let Some(init) = self.classes[class]
            .declared_method("<init>", "()V")
            .map(|index| MethodId::new(class, index))
        else {
            let name = self.classes[class].java_name();
            return Err(self.throw_new("java/lang/InstantiationException", Some(&name)));
        };
        self.scoped(|vm| {
            let object = vm.new_object(class)?;
            vm.root(object)?;
            vm.push_wedge(vm.regs.pc, Callback::NewInstance, Cell::from_ref(object))?;
            vm.push_ref(object);
            vm.invoke(init, 0)?;
            Ok(NativeValue::Frames)
        })
    }

    // ── returns ────────────────────────────────────────────────────

    /// Leaves the running frame, handing its top `cells` operand cells to
    /// the caller (or to the wedge below it).
    pub(crate) fn return_value(&mut self, cells: usize) -> VmResult<()> {
        let value = match cells {
            0 => None,
            1 => Some(self.peek(0)),
            _ => Some(self.peek(1)),
        };
        let monitor = self.frame_monitor(self.regs.locals);
        if !monitor.is_null() {
            self.monitor_exit(monitor)?;
        }
        self.pop_frame();
        if self.regs.method.is_wedge() {
            return self.enter_wedge();
        }
        match (cells, value) {
            (1, Some(v)) => self.push(v),
            (2, Some(v)) => self.push_wide(v),
            _ => {}
        }
        Ok(())
    }

    /// Execution returned into a callback wedge: run its callback.
    fn enter_wedge(&mut self) -> VmResult<()> {
        let arg = self.local(1);
        match Callback::from_cell(self.local(0)) {
            Some(Callback::ThreadExit) => {
                self.terminate_thread();
                Ok(())
            }
            Some(Callback::ClinitDone) => {
                let class = ClassId(arg.raw() as u32);
                self.pop_frame();
                if let Some(c) = self.classes.get_mut(class) {
                    c.state = ClassState::Initialized;
                    debug!("initialized {}", c.name);
                }
                self.wake_class_waiters(class);
                Ok(())
            }
            Some(Callback::NewInstance) => {
                self.pop_frame();
                self.push(arg);
                Ok(())
            }
            None => Err(VmError::internal("corrupt callback wedge")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ClassBuilder;
    use crate::classfile::{FieldAccess, MethodAccess};
    use crate::error::ExitCode;
    use crate::opcodes::*;
    use crate::testkit;

    fn capturing() -> (Vm, std::sync::Arc<parking_lot::Mutex<String>>) {
        testkit::vm()
    }

    /// Each `<clinit>` prints its own marker before reading what it needs.
    #[test]
    fn superclass_initializers_run_first() {
        let (mut vm, out) = capturing();
        let mut a = ClassBuilder::new("t/A", Some("java/lang/Object"));
        a.field(FieldAccess::STATIC, "x", "I");
        a.method(MethodAccess::STATIC, "<clinit>", "()V", |c| {
            c.iconst(1).invokestatic("t/Out", "print", "(I)V");
            c.iconst(10).putstatic("t/A", "x", "I");
            c.op(RETURN);
        });
        let mut b = ClassBuilder::new("t/B", Some("t/A"));
        b.field(FieldAccess::STATIC, "y", "I");
        b.method(MethodAccess::STATIC, "<clinit>", "()V", |c| {
            c.iconst(2).invokestatic("t/Out", "print", "(I)V");
            c.getstatic("t/A", "x", "I").iconst(1).op(IADD).putstatic("t/B", "y", "I");
            c.op(RETURN);
        });
        b.method(MethodAccess::PUBLIC | MethodAccess::STATIC, "main", "([Ljava/lang/String;)V", |c| {
            c.getstatic("t/B", "y", "I").invokestatic("t/Out", "print", "(I)V");
            c.getstatic("t/B", "y", "I").invokestatic("t/Out", "print", "(I)V");
            c.op(RETURN);
        });
        vm.define_class(&a.build(), Ref::NULL).unwrap();
        let b = vm.define_class(&b.build(), Ref::NULL).unwrap();

        assert_eq!(vm.run_main("t/B", &[]), ExitCode::Success);
        assert_eq!(out.lock().as_str(), "1\n2\n11\n11\n");
        assert_eq!(vm.classes[b].state, ClassState::Initialized);
    }

    #[test]
    fn failed_initialization_is_remembered() {
        let (mut vm, out) = capturing();
        let mut bad = ClassBuilder::new("t/Bad", Some("java/lang/Object"));
        bad.field(FieldAccess::STATIC, "x", "I");
        bad.method(MethodAccess::STATIC, "<clinit>", "()V", |c| {
            c.iconst(1).iconst(0).op(IDIV).putstatic("t/Bad", "x", "I");
            c.op(RETURN);
        });
        let mut main = ClassBuilder::new("t/Main", Some("java/lang/Object"));
        main.method(MethodAccess::PUBLIC | MethodAccess::STATIC, "main", "([Ljava/lang/String;)V", |c| {
            let (s1, e1, h1, s2, e2, h2) = (c.label(), c.label(), c.label(), c.label(), c.label(), c.label());
            c.bind(s1);
            c.getstatic("t/Bad", "x", "I").op(POP);
            c.bind(e1);
            c.goto(s2);
            c.bind(h1);
            c.op(POP).iconst(1).invokestatic("t/Out", "print", "(I)V");
            c.bind(s2);
            c.getstatic("t/Bad", "x", "I").op(POP);
            c.bind(e2);
            c.op(RETURN);
            c.bind(h2);
            c.op(POP).iconst(2).invokestatic("t/Out", "print", "(I)V");
            c.op(RETURN);
            c.try_catch(s1, e1, h1, Some("java/lang/ExceptionInInitializerError"));
            c.try_catch(s2, e2, h2, Some("java/lang/NoClassDefFoundError"));
        });
        let bad = vm.define_class(&bad.build(), Ref::NULL).unwrap();
        vm.define_class(&main.build(), Ref::NULL).unwrap();

        assert_eq!(vm.run_main("t/Main", &[]), ExitCode::Success);
        assert_eq!(out.lock().as_str(), "1\n2\n");
        assert_eq!(vm.classes[bad].state, ClassState::Error);
    }

    #[test]
    fn synchronized_methods_release_their_monitor() {
        let (mut vm, out) = capturing();
        let mut c = ClassBuilder::new("t/Sync", Some("java/lang/Object"));
        c.method(
            MethodAccess::STATIC | MethodAccess::SYNCHRONIZED,
            "twice",
            "(I)I",
            |c| {
                c.iload(0).iconst(2).op(IMUL).op(IRETURN);
            },
        );
        c.method(MethodAccess::PUBLIC | MethodAccess::STATIC, "main", "([Ljava/lang/String;)V", |c| {
            c.iconst(21).invokestatic("t/Sync", "twice", "(I)I");
            c.invokestatic("t/Out", "print", "(I)V");
            c.op(RETURN);
        });
        vm.define_class(&c.build(), Ref::NULL).unwrap();
        assert_eq!(vm.run_main("t/Sync", &[]), ExitCode::Success);
        assert_eq!(out.lock().as_str(), "42\n");
        assert_eq!(vm.monitors.in_use_count(), 0);
    }

    fn touch(vm: &mut Vm, _: &NativeArgs) -> VmResult<NativeValue> {
        vm.console.write_line("7");
        Ok(NativeValue::Void)
    }

    /// Prints 1 when exactly one thread sits in the lock's queue, blocked
    /// and off the runnable list, waiting to enter a native.
    fn queued(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
        let lock = args.reference(vm, 0);
        let waiters: Vec<_> = vm
            .monitors
            .get(lock)
            .map(|m| m.lock_queue.iter().copied().collect())
            .unwrap_or_default();
        let parked = match waiters.as_slice() {
            &[t] => {
                vm.threads[t].status == ThreadStatus::BLOCKED
                    && !vm.threads.is_runnable(t)
                    && vm.threads[t].native_monitor == lock
            }
            _ => false,
        };
        vm.console.write_line(if parked { "1" } else { "0" });
        Ok(NativeValue::Void)
    }

    #[test]
    fn contended_synchronized_native_queues_for_the_monitor() {
        let (mut vm, out) = capturing();
        vm.register_native("t/Lock", "touch", "()V", touch);
        vm.register_native("t/Lock", "queued", "(Ljava/lang/Object;)V", queued);
        let mut lock = ClassBuilder::new("t/Lock", Some("java/lang/Object"));
        lock.default_constructor()
            .field(FieldAccess::PUBLIC | FieldAccess::STATIC, "it", "Lt/Lock;")
            .native(MethodAccess::PUBLIC | MethodAccess::SYNCHRONIZED, "touch", "()V")
            .native(MethodAccess::PUBLIC | MethodAccess::STATIC, "queued", "(Ljava/lang/Object;)V");
        vm.define_class(&lock.build(), Ref::NULL).unwrap();

        let mut worker = ClassBuilder::new("t/Worker", Some("java/lang/Thread"));
        worker.default_constructor();
        worker.method(MethodAccess::PUBLIC, "run", "()V", |c| {
            c.getstatic("t/Lock", "it", "Lt/Lock;").invokevirtual("t/Lock", "touch", "()V");
            c.op(RETURN);
        });
        vm.define_class(&worker.build(), Ref::NULL).unwrap();

        testkit::main_class(&mut vm, "t/Main", |c| {
            c.construct("t/Lock").op(DUP).putstatic("t/Lock", "it", "Lt/Lock;").astore(1);
            c.aload(1).op(MONITORENTER);
            c.construct("t/Worker").op(DUP).astore(2);
            c.invokevirtual("java/lang/Thread", "start", "()V");
            // the worker runs while main sleeps holding the lock
            c.ldc_long(10).invokestatic("java/lang/Thread", "sleep", "(J)V");
            c.aload(1).invokestatic("t/Lock", "queued", "(Ljava/lang/Object;)V");
            c.iconst(2).invokestatic("t/Out", "print", "(I)V");
            c.aload(1).op(MONITOREXIT);
            c.aload(2).invokevirtual("java/lang/Thread", "join", "()V");
            c.iconst(3).invokestatic("t/Out", "print", "(I)V");
            c.op(RETURN);
        });

        assert_eq!(vm.run_main("t/Main", &[]), ExitCode::Success);
        assert_eq!(testkit::output(&out), "1\n2\n7\n3\n");
        assert_eq!(vm.monitors.in_use_count(), 0);
    }
}
