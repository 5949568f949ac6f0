//! `java.lang.Thread`. Scheduling itself lives in the scheduler; these
//! natives only translate between thread objects and VM threads.

use super::NativeDesc;
use crate::Vm;
use crate::cell::Ref;
use crate::error::VmResult;
use crate::natives::{NativeArgs, NativeValue};

const THREAD: &str = "java/lang/Thread";

pub(super) const NATIVES: &[NativeDesc] = &[
    NativeDesc::new(THREAD, "start", "()V", start),
    NativeDesc::new(THREAD, "currentThread", "()Ljava/lang/Thread;", current_thread),
    NativeDesc::new(THREAD, "sleep", "(J)V", sleep),
    NativeDesc::new(THREAD, "yield", "()V", yield_now),
    NativeDesc::new(THREAD, "interrupt", "()V", interrupt),
    NativeDesc::new(THREAD, "isInterrupted", "()Z", is_interrupted),
    NativeDesc::new(THREAD, "interrupted", "()Z", interrupted),
    NativeDesc::new(THREAD, "isAlive", "()Z", is_alive),
    NativeDesc::new(THREAD, "printUncaught", "(Ljava/lang/Throwable;)V", print_uncaught),
];

fn start(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    vm.start_thread(args.reference(vm, 0))?;
    Ok(NativeValue::Void)
}

fn current_thread(vm: &mut Vm, _args: &NativeArgs) -> VmResult<NativeValue> {
    let object = vm.threads.get(vm.current).map_or(Ref::NULL, |t| t.object);
    Ok(NativeValue::Ref(object))
}

fn sleep(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    vm.sleep(args.long(vm, 0))?;
    Ok(NativeValue::Void)
}

fn yield_now(vm: &mut Vm, _args: &NativeArgs) -> VmResult<NativeValue> {
    vm.timeslice = 0;
    Ok(NativeValue::Void)
}

fn interrupt(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    // interrupting a thread that is not running has no effect
    if let Some(thread) = vm.thread_of(args.reference(vm, 0)) {
        vm.interrupt(thread)?;
    }
    Ok(NativeValue::Void)
}

fn is_interrupted(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let interrupted = vm
        .thread_of(args.reference(vm, 0))
        .and_then(|id| vm.threads.get(id))
        .is_some_and(|t| t.interrupted);
    Ok(interrupted.into())
}

fn interrupted(vm: &mut Vm, _args: &NativeArgs) -> VmResult<NativeValue> {
    let current = vm.current;
    let was = vm
        .threads
        .get_mut(current)
        .is_some_and(|t| std::mem::take(&mut t.interrupted));
    Ok(was.into())
}

fn is_alive(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    Ok(vm.thread_of(args.reference(vm, 0)).is_some().into())
}

fn print_uncaught(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let thread = args.reference(vm, 0);
    let throwable = args.reference(vm, 1);
    vm.report_uncaught(thread, throwable);
    Ok(NativeValue::Void)
}

#[cfg(test)]
mod tests {
    use crate::builder::ClassBuilder;
    use crate::cell::Ref;
    use crate::classfile::MethodAccess;
    use crate::opcodes::*;
    use crate::testkit;

    const THREAD: &str = "java/lang/Thread";

    fn worker(vm: &mut crate::Vm, name: &str, run: impl FnOnce(&mut crate::builder::CodeBuilder<'_>)) {
        let mut b = ClassBuilder::new(name, Some(THREAD));
        b.default_constructor()
            .method(MethodAccess::PUBLIC, "run", "()V", run);
        vm.define_class(&b.build(), Ref::NULL).unwrap();
    }

    #[test]
    fn join_waits_for_the_thread_to_finish() {
        let (mut vm, out) = testkit::vm();
        worker(&mut vm, "p/Worker", |c| {
            c.ldc_long(5).invokestatic(THREAD, "sleep", "(J)V");
            c.iconst(1).invokestatic("t/Out", "print", "(I)V").op(RETURN);
        });
        testkit::main_class(&mut vm, "p/Main", |c| {
            c.construct("p/Worker").astore(1);
            c.aload(1).invokevirtual(THREAD, "start", "()V");
            c.aload(1).invokevirtual(THREAD, "join", "()V");
            c.aload(1)
                .invokevirtual(THREAD, "isAlive", "()Z")
                .invokestatic("t/Out", "print", "(I)V");
            c.iconst(2).invokestatic("t/Out", "print", "(I)V").op(RETURN);
        });
        vm.run_main("p/Main", &[]);
        assert_eq!(testkit::output(&out), "1\n0\n2\n");
    }

    #[test]
    fn starting_twice_is_illegal() {
        let (mut vm, out) = testkit::vm();
        worker(&mut vm, "p/Idle", |c| {
            c.op(RETURN);
        });
        testkit::main_class(&mut vm, "p/Main", |c| {
            c.construct("p/Idle").astore(1);
            c.aload(1).invokevirtual(THREAD, "start", "()V");
            let (start, end, handler) = (c.label(), c.label(), c.label());
            c.bind(start);
            c.aload(1).invokevirtual(THREAD, "start", "()V");
            c.bind(end).op(RETURN);
            c.bind(handler).op(POP).iconst(9).invokestatic("t/Out", "print", "(I)V").op(RETURN);
            c.try_catch(start, end, handler, Some("java/lang/IllegalThreadStateException"));
        });
        vm.run_main("p/Main", &[]);
        assert_eq!(testkit::output(&out), "9\n");
    }

    #[test]
    fn names_and_interrupt_status() {
        let (mut vm, out) = testkit::vm();
        testkit::main_class(&mut vm, "p/Main", |c| {
            c.invokestatic(THREAD, "currentThread", "()Ljava/lang/Thread;").astore(1);
            c.aload(1)
                .invokevirtual(THREAD, "getName", "()Ljava/lang/String;")
                .invokestatic("t/Out", "print", "(Ljava/lang/String;)V");
            c.construct(THREAD)
                .invokevirtual(THREAD, "getName", "()Ljava/lang/String;")
                .invokestatic("t/Out", "print", "(Ljava/lang/String;)V");
            c.aload(1).invokevirtual(THREAD, "interrupt", "()V");
            c.aload(1)
                .invokevirtual(THREAD, "isInterrupted", "()Z")
                .invokestatic("t/Out", "print", "(I)V");
            c.invokestatic(THREAD, "interrupted", "()Z")
                .invokestatic("t/Out", "print", "(I)V");
            c.invokestatic(THREAD, "interrupted", "()Z")
                .invokestatic("t/Out", "print", "(I)V");
            c.op(RETURN);
        });
        vm.run_main("p/Main", &[]);
        assert_eq!(testkit::output(&out), "main\nThread-0\n1\n1\n0\n");
    }
}
