//! End-to-end programs assembled in-process and run through the public API.

use std::sync::Arc;
use std::time::Instant;

use kava::opcodes::*;
use kava::{
    ClassBuilder, CodeBuilder, Console, ExitCode, FieldAccess, MethodAccess, NativeArgs,
    NativeValue, Ref, Vm, VmResult, VmSettings,
};
use parking_lot::Mutex;

const MAIN: &str = "([Ljava/lang/String;)V";
const THREAD: &str = "java/lang/Thread";
const OBJECT: &str = "java/lang/Object";

fn print_int(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    vm.console().write_line(&args.int(vm, 0).to_string());
    Ok(NativeValue::Void)
}

fn print_long(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    vm.console().write_line(&args.long(vm, 0).to_string());
    Ok(NativeValue::Void)
}

fn out_class() -> ClassBuilder {
    let mut out = ClassBuilder::new("t/Out", Some(OBJECT));
    let access = MethodAccess::PUBLIC | MethodAccess::STATIC;
    out.native(access, "print", "(I)V").native(access, "print", "(J)V");
    out
}

fn start(settings: VmSettings) -> (Vm, Arc<Mutex<String>>) {
    let (console, buffer) = Console::capture();
    let mut vm = Vm::new(VmSettings { console, ..settings }).unwrap();
    vm.register_native("t/Out", "print", "(I)V", print_int);
    vm.register_native("t/Out", "print", "(J)V", print_long);
    (vm, buffer)
}

fn vm() -> (Vm, Arc<Mutex<String>>) {
    let (mut vm, buffer) = start(VmSettings::default());
    vm.define_class(&out_class().build(), Ref::NULL).unwrap();
    (vm, buffer)
}

fn print(c: &mut CodeBuilder<'_>) {
    c.invokestatic("t/Out", "print", "(I)V");
}

fn main_method(b: &mut ClassBuilder, body: impl FnOnce(&mut CodeBuilder<'_>)) {
    b.method(MethodAccess::PUBLIC | MethodAccess::STATIC, "main", MAIN, body);
}

fn thread_class(vm: &mut Vm, name: &str, run: impl FnOnce(&mut CodeBuilder<'_>)) {
    let mut b = ClassBuilder::new(name, Some(THREAD));
    b.default_constructor()
        .method(MethodAccess::PUBLIC, "run", "()V", run);
    vm.define_class(&b.build(), Ref::NULL).unwrap();
}

fn counter_main(c: &mut CodeBuilder<'_>) {
    c.iconst(0).istore(1);
    let top = c.here();
    let done = c.label();
    c.iload(1).iconst(10).branch(IF_ICMPGE, done);
    c.iload(1);
    print(c);
    c.iinc(1, 1).goto(top);
    c.bind(done).op(RETURN);
}

#[test]
fn counter_program() {
    let (mut vm, out) = vm();
    let mut b = ClassBuilder::new("p/Counter", Some(OBJECT));
    main_method(&mut b, counter_main);
    vm.define_class(&b.build(), Ref::NULL).unwrap();

    assert_eq!(vm.run_main("p.Counter", &[]), ExitCode::Success);
    let expected: String = (0..10).map(|i| format!("{i}\n")).collect();
    assert_eq!(*out.lock(), expected);
}

#[test]
fn ordered_locking_from_two_threads() {
    let (mut vm, out) = vm();
    let statics = FieldAccess::PUBLIC | FieldAccess::STATIC;
    let mut shared = ClassBuilder::new("p/Shared", Some(OBJECT));
    shared
        .field(statics, "m1", "Ljava/lang/Object;")
        .field(statics, "m2", "Ljava/lang/Object;")
        .field(statics, "count", "I");
    vm.define_class(&shared.build(), Ref::NULL).unwrap();

    thread_class(&mut vm, "p/Adder", |c| {
        c.iconst(0).istore(1);
        let top = c.here();
        let done = c.label();
        c.iload(1).iconst(1000).branch(IF_ICMPGE, done);
        c.getstatic("p/Shared", "m1", "Ljava/lang/Object;")
            .op(DUP)
            .astore(2)
            .op(MONITORENTER);
        c.getstatic("p/Shared", "m2", "Ljava/lang/Object;")
            .op(DUP)
            .astore(3)
            .op(MONITORENTER);
        c.getstatic("p/Shared", "count", "I")
            .iconst(1)
            .op(IADD)
            .putstatic("p/Shared", "count", "I");
        c.aload(3).op(MONITOREXIT);
        c.aload(2).op(MONITOREXIT);
        c.iinc(1, 1).goto(top);
        c.bind(done).op(RETURN);
    });

    let mut b = ClassBuilder::new("p/Main", Some(OBJECT));
    main_method(&mut b, |c| {
        c.construct(OBJECT).putstatic("p/Shared", "m1", "Ljava/lang/Object;");
        c.construct(OBJECT).putstatic("p/Shared", "m2", "Ljava/lang/Object;");
        c.construct("p/Adder").astore(1);
        c.construct("p/Adder").astore(2);
        c.aload(1).invokevirtual(THREAD, "start", "()V");
        c.aload(2).invokevirtual(THREAD, "start", "()V");
        c.aload(1).invokevirtual(THREAD, "join", "()V");
        c.aload(2).invokevirtual(THREAD, "join", "()V");
        c.getstatic("p/Shared", "count", "I");
        print(c);
        c.op(RETURN);
    });
    vm.define_class(&b.build(), Ref::NULL).unwrap();

    assert_eq!(vm.run_main("p/Main", &[]), ExitCode::Success);
    assert_eq!(*out.lock(), "2000\n");
}

#[test]
fn wait_notify_rendezvous() {
    let (mut vm, out) = vm();
    let statics = FieldAccess::PUBLIC | FieldAccess::STATIC;
    let mut shared = ClassBuilder::new("p/Flag", Some(OBJECT));
    shared
        .field(statics, "lock", "Ljava/lang/Object;")
        .field(statics, "ready", "Z");
    vm.define_class(&shared.build(), Ref::NULL).unwrap();

    thread_class(&mut vm, "p/Waiter", |c| {
        c.getstatic("p/Flag", "lock", "Ljava/lang/Object;")
            .op(DUP)
            .astore(1)
            .op(MONITORENTER);
        let check = c.here();
        let done = c.label();
        c.getstatic("p/Flag", "ready", "Z").branch(IFNE, done);
        c.aload(1).invokevirtual(OBJECT, "wait", "()V");
        c.goto(check);
        c.bind(done);
        c.getstatic("p/Flag", "ready", "Z");
        print(c);
        // still the owner: notify would throw otherwise
        c.aload(1).invokevirtual(OBJECT, "notify", "()V");
        c.aload(1).op(MONITOREXIT).op(RETURN);
    });

    let mut b = ClassBuilder::new("p/Main", Some(OBJECT));
    main_method(&mut b, |c| {
        c.construct(OBJECT).putstatic("p/Flag", "lock", "Ljava/lang/Object;");
        c.construct("p/Waiter").astore(1);
        c.aload(1).invokevirtual(THREAD, "start", "()V");
        c.ldc_long(10).invokestatic(THREAD, "sleep", "(J)V");
        c.getstatic("p/Flag", "lock", "Ljava/lang/Object;")
            .op(DUP)
            .astore(2)
            .op(MONITORENTER);
        c.iconst(1).putstatic("p/Flag", "ready", "Z");
        c.aload(2).invokevirtual(OBJECT, "notify", "()V");
        c.aload(2).op(MONITOREXIT);
        c.aload(1).invokevirtual(THREAD, "join", "()V");
        c.iconst(2);
        print(c);
        c.op(RETURN);
    });
    vm.define_class(&b.build(), Ref::NULL).unwrap();

    assert_eq!(vm.run_main("p/Main", &[]), ExitCode::Success);
    assert_eq!(*out.lock(), "1\n2\n");
}

#[test]
fn timed_sleep_resumes_after_the_deadline() {
    let (mut vm, out) = vm();
    let mut b = ClassBuilder::new("p/Sleeper", Some(OBJECT));
    main_method(&mut b, |c| {
        c.invokestatic("java/lang/System", "currentTimeMillis", "()J").lstore(1);
        c.ldc_long(100).invokestatic(THREAD, "sleep", "(J)V");
        c.invokestatic("java/lang/System", "currentTimeMillis", "()J")
            .lload(1)
            .op(LSUB)
            .invokestatic("t/Out", "print", "(J)V");
        c.op(RETURN);
    });
    vm.define_class(&b.build(), Ref::NULL).unwrap();

    let began = Instant::now();
    assert_eq!(vm.run_main("p/Sleeper", &[]), ExitCode::Success);
    let wall = began.elapsed().as_millis();
    let slept: u128 = out.lock().trim().parse().unwrap();
    assert!(slept >= 100, "slept {slept} ms");
    assert!(wall >= 100, "wall {wall} ms");
    assert!(slept < 300, "slept {slept} ms");
}

#[test]
fn uncaught_exception_in_a_worker_leaves_main_running() {
    let (mut vm, out) = vm();
    thread_class(&mut vm, "p/Thrower", |c| {
        c.new_object("java/lang/RuntimeException")
            .op(DUP)
            .ldc_string("boom");
        c.invokespecial(
            "java/lang/RuntimeException",
            "<init>",
            "(Ljava/lang/String;)V",
        );
        c.op(ATHROW);
    });
    let mut b = ClassBuilder::new("p/Main", Some(OBJECT));
    main_method(&mut b, |c| {
        c.construct("p/Thrower").astore(1);
        c.aload(1).invokevirtual(THREAD, "start", "()V");
        c.aload(1).invokevirtual(THREAD, "join", "()V");
        c.iconst(7);
        print(c);
        c.op(RETURN);
    });
    vm.define_class(&b.build(), Ref::NULL).unwrap();

    assert_eq!(vm.run_main("p/Main", &[]), ExitCode::Success);
    let text = out.lock().clone();
    assert!(
        text.starts_with("Exception in thread \"Thread-0\" java.lang.RuntimeException: boom\n"),
        "{text}"
    );
    assert!(text.contains("\tat p.Thrower.run"), "{text}");
    assert!(text.ends_with("7\n"), "{text}");
}

#[test]
fn garbage_is_reclaimed_under_pressure() {
    let (mut vm, out) = start(VmSettings {
        heap_size: 256 * 1024,
        ..Default::default()
    });
    vm.define_class(&out_class().build(), Ref::NULL).unwrap();
    let mut b = ClassBuilder::new("p/Churn", Some(OBJECT));
    main_method(&mut b, |c| {
        c.iconst(0).istore(1);
        let top = c.here();
        let done = c.label();
        c.iload(1).iconst(10_000).branch(IF_ICMPGE, done);
        // 50 ints: a 200 byte payload
        c.iconst(50).newarray(T_INT).astore(2);
        c.iinc(1, 1).goto(top);
        c.bind(done);
        c.iload(1);
        print(c);
        c.op(RETURN);
    });
    vm.define_class(&b.build(), Ref::NULL).unwrap();

    assert_eq!(vm.run_main("p/Churn", &[]), ExitCode::Success);
    assert_eq!(*out.lock(), "10000\n");
    assert!(vm.gc_cycles() > 0);
    assert!(vm.heap_stats().is_balanced());
}

#[test]
fn static_initializers_run_in_dependency_order() {
    let (mut vm, out) = vm();
    let statics = FieldAccess::PUBLIC | FieldAccess::STATIC;

    let mut d = ClassBuilder::new("p/D", Some(OBJECT));
    d.field(statics, "v", "I")
        .method(MethodAccess::STATIC, "<clinit>", "()V", |c| {
            c.iconst(1);
            print(c);
            c.iconst(42).putstatic("p/D", "v", "I").op(RETURN);
        })
        .method(
            MethodAccess::PUBLIC | MethodAccess::STATIC,
            "value",
            "()I",
            |c| {
                c.getstatic("p/D", "v", "I").op(IRETURN);
            },
        );
    vm.define_class(&d.build(), Ref::NULL).unwrap();

    let mut cls = ClassBuilder::new("p/C", Some(OBJECT));
    cls.field(statics, "f", "I")
        .method(MethodAccess::STATIC, "<clinit>", "()V", |c| {
            c.invokestatic("p/D", "value", "()I").putstatic("p/C", "f", "I");
            c.iconst(2);
            print(c);
            c.op(RETURN);
        });
    vm.define_class(&cls.build(), Ref::NULL).unwrap();

    let mut b = ClassBuilder::new("p/Main", Some(OBJECT));
    main_method(&mut b, |c| {
        c.getstatic("p/C", "f", "I");
        print(c);
        c.getstatic("p/C", "f", "I");
        print(c);
        c.op(RETURN);
    });
    vm.define_class(&b.build(), Ref::NULL).unwrap();

    assert_eq!(vm.run_main("p/Main", &[]), ExitCode::Success);
    assert_eq!(*out.lock(), "1\n2\n42\n42\n");
}

#[test]
fn classes_load_from_a_classpath_directory() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = ClassBuilder::new("p/Counter", Some(OBJECT));
    main_method(&mut b, counter_main);
    for (name, class) in [("p/Counter", b.build()), ("t/Out", out_class().build())] {
        let path = dir.path().join(format!("{name}.class"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, class.to_bytes()).unwrap();
    }

    let (mut vm, out) = start(VmSettings {
        classpath: vec![dir.path().to_path_buf()],
        ..Default::default()
    });
    assert_eq!(vm.run_main("p.Counter", &[]), ExitCode::Success);
    assert_eq!(out.lock().lines().count(), 10);
}

#[test]
fn missing_main_class_is_an_uncaught_error() {
    let (mut vm, out) = vm();
    assert_eq!(vm.run_main("p/Nowhere", &[]), ExitCode::Uncaught);
    let text = out.lock().clone();
    assert!(text.contains("java.lang.NoClassDefFoundError: p.Nowhere"), "{text}");
}
