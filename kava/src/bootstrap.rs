//! The bootstrap class set.
//!
//! The `java.lang` classes the core refers to by name are assembled in
//! memory and defined by the bootstrap loader, in dependency order, before
//! anything else runs. Their natives come from [`crate::builtins`]. None of
//! them has a `<clinit>`, so all start out initialized; statics that need
//! objects (`System.out`, the property table) are filled in at the end.

use log::debug;

use crate::Vm;
use crate::builder::ClassBuilder;
use crate::builtins;
use crate::cell::Ref;
use crate::class::{ClassId, ClassState, ElemType};
use crate::classfile::{ClassAccess, FieldAccess, MethodAccess};
use crate::error::{VmError, VmResult};
use crate::opcodes::*;

const OBJECT: &str = "java/lang/Object";
const STRING: &str = "java/lang/String";
const CLASS: &str = "java/lang/Class";
const CLASS_LOADER: &str = "java/lang/ClassLoader";
const THREAD: &str = "java/lang/Thread";
const RUNNABLE: &str = "java/lang/Runnable";
const HANDLER: &str = "java/lang/Thread$UncaughtExceptionHandler";
const THROWABLE: &str = "java/lang/Throwable";
const SYSTEM: &str = "java/lang/System";
const PRINT_STREAM: &str = "java/io/PrintStream";
const SERIALIZABLE: &str = "java/io/Serializable";
const CLONEABLE: &str = "java/lang/Cloneable";
const WEAK_REFERENCE: &str = "java/lang/ref/WeakReference";

const PUBLIC: MethodAccess = MethodAccess::PUBLIC;
const PUBLIC_FINAL: MethodAccess = MethodAccess::PUBLIC.union(MethodAccess::FINAL);
const PUBLIC_STATIC: MethodAccess = MethodAccess::PUBLIC.union(MethodAccess::STATIC);
const PRIVATE: FieldAccess = FieldAccess::PRIVATE;

const MESSAGE_CAUSE: &str = "(Ljava/lang/String;Ljava/lang/Throwable;)V";

/// Throwable subclasses as (class, superclass), parents first.
const THROWABLES: &[(&str, &str)] = &[
    ("java/lang/Exception", THROWABLE),
    ("java/lang/Error", THROWABLE),
    ("java/lang/RuntimeException", "java/lang/Exception"),
    ("java/lang/ArithmeticException", "java/lang/RuntimeException"),
    ("java/lang/ArrayStoreException", "java/lang/RuntimeException"),
    ("java/lang/ClassCastException", "java/lang/RuntimeException"),
    ("java/lang/IllegalArgumentException", "java/lang/RuntimeException"),
    ("java/lang/IllegalThreadStateException", "java/lang/IllegalArgumentException"),
    ("java/lang/NumberFormatException", "java/lang/IllegalArgumentException"),
    ("java/lang/IllegalMonitorStateException", "java/lang/RuntimeException"),
    ("java/lang/IllegalStateException", "java/lang/RuntimeException"),
    ("java/lang/IndexOutOfBoundsException", "java/lang/RuntimeException"),
    ("java/lang/ArrayIndexOutOfBoundsException", "java/lang/IndexOutOfBoundsException"),
    ("java/lang/StringIndexOutOfBoundsException", "java/lang/IndexOutOfBoundsException"),
    ("java/lang/NegativeArraySizeException", "java/lang/RuntimeException"),
    ("java/lang/NullPointerException", "java/lang/RuntimeException"),
    ("java/lang/UnsupportedOperationException", "java/lang/RuntimeException"),
    ("java/lang/SecurityException", "java/lang/RuntimeException"),
    ("java/lang/ClassNotFoundException", "java/lang/Exception"),
    ("java/lang/CloneNotSupportedException", "java/lang/Exception"),
    ("java/lang/IllegalAccessException", "java/lang/Exception"),
    ("java/lang/InstantiationException", "java/lang/Exception"),
    ("java/lang/InterruptedException", "java/lang/Exception"),
    ("java/lang/LinkageError", "java/lang/Error"),
    ("java/lang/ClassCircularityError", "java/lang/LinkageError"),
    ("java/lang/ClassFormatError", "java/lang/LinkageError"),
    ("java/lang/UnsupportedClassVersionError", "java/lang/ClassFormatError"),
    ("java/lang/ExceptionInInitializerError", "java/lang/LinkageError"),
    ("java/lang/NoClassDefFoundError", "java/lang/LinkageError"),
    ("java/lang/UnsatisfiedLinkError", "java/lang/LinkageError"),
    ("java/lang/VerifyError", "java/lang/LinkageError"),
    ("java/lang/IncompatibleClassChangeError", "java/lang/LinkageError"),
    ("java/lang/AbstractMethodError", "java/lang/IncompatibleClassChangeError"),
    ("java/lang/IllegalAccessError", "java/lang/IncompatibleClassChangeError"),
    ("java/lang/InstantiationError", "java/lang/IncompatibleClassChangeError"),
    ("java/lang/NoSuchFieldError", "java/lang/IncompatibleClassChangeError"),
    ("java/lang/NoSuchMethodError", "java/lang/IncompatibleClassChangeError"),
    ("java/lang/VirtualMachineError", "java/lang/Error"),
    ("java/lang/InternalError", "java/lang/VirtualMachineError"),
    ("java/lang/OutOfMemoryError", "java/lang/VirtualMachineError"),
    ("java/lang/StackOverflowError", "java/lang/VirtualMachineError"),
    ("java/lang/AssertionError", "java/lang/Error"),
    ("java/lang/ThreadDeath", "java/lang/Error"),
];

pub(crate) fn bootstrap(vm: &mut Vm) -> VmResult<()> {
    for native in builtins::default_natives() {
        vm.register_native(native.class, native.name, native.descriptor, native.func);
    }

    vm.known.object = define(vm, object_class())?;
    vm.known.serializable = define(vm, ClassBuilder::interface(SERIALIZABLE))?;
    vm.known.cloneable = define(vm, ClassBuilder::interface(CLONEABLE))?;
    for elem in ElemType::PRIMITIVES {
        let id = vm.define_primitive_class(elem)?;
        vm.known.primitives.push((elem, id));
    }
    vm.known.char_array = vm.primitive_array_class(ElemType::Char)?;

    vm.known.string = define(vm, string_class())?;
    vm.known.string_value = slot(vm, vm.known.string, "value")?;
    vm.known.class = define(vm, class_class())?;
    vm.known.class_data = slot(vm, vm.known.class, "classData")?;
    vm.known.class_loader = define(vm, class_loader_class())?;
    vm.known.loader_parent = slot(vm, vm.known.class_loader, "parent")?;
    vm.known.loader_classes = slot(vm, vm.known.class_loader, "classes")?;
    vm.known.loader_count = slot(vm, vm.known.class_loader, "count")?;

    vm.known.throwable = define(vm, throwable_class())?;
    vm.known.throwable_message = slot(vm, vm.known.throwable, "detailMessage")?;
    vm.known.throwable_cause = slot(vm, vm.known.throwable, "cause")?;
    vm.known.throwable_backtrace = slot(vm, vm.known.throwable, "backtrace")?;
    for &(name, parent) in THROWABLES {
        let id = define(vm, exception_class(name, parent))?;
        if name == "java/lang/Error" {
            vm.known.error = id;
        }
    }

    let mut runnable = ClassBuilder::interface(RUNNABLE);
    runnable.declare(PUBLIC | MethodAccess::ABSTRACT, "run", "()V");
    define(vm, runnable)?;
    let mut handler = ClassBuilder::interface(HANDLER);
    handler.declare(
        PUBLIC | MethodAccess::ABSTRACT,
        "uncaughtException",
        "(Ljava/lang/Thread;Ljava/lang/Throwable;)V",
    );
    define(vm, handler)?;
    vm.known.thread = define(vm, thread_class())?;
    vm.known.thread_name = slot(vm, vm.known.thread, "name")?;
    vm.known.thread_priority = slot(vm, vm.known.thread, "priority")?;
    vm.known.thread_daemon = slot(vm, vm.known.thread, "daemon")?;
    vm.known.thread_target = slot(vm, vm.known.thread, "target")?;
    vm.known.thread_eetop = slot(vm, vm.known.thread, "eetop")?;

    let print_stream = define(vm, print_stream_class())?;
    vm.known.system = define(vm, system_class())?;
    vm.known.weak_reference = define(vm, weak_reference_class())?;
    vm.known.weak_referent = slot(vm, vm.known.weak_reference, "referent")?;

    let ids: Vec<ClassId> = vm.classes.iter().map(|c| c.id).collect();
    for id in ids {
        vm.classes[id].state = ClassState::Initialized;
    }

    vm.app_loader = vm.new_class_loader(Ref::NULL)?;
    vm.root_permanent(vm.app_loader)?;
    vm.oom = vm.new_throwable("java/lang/OutOfMemoryError", Some("Java heap space"))?;
    vm.root_permanent(vm.oom)?;
    vm.soe = vm.new_throwable("java/lang/StackOverflowError", None)?;
    vm.root_permanent(vm.soe)?;

    let system = vm.known.system;
    for stream in ["out", "err"] {
        let object = vm.new_object(print_stream)?;
        vm.set_static_ref(system, stream, object);
    }
    let props = system_properties(vm)?;
    vm.set_static_ref(system, "props", props);

    debug!("bootstrap: {} classes, {} natives", vm.classes.len(), vm.natives.len());
    Ok(())
}

fn define(vm: &mut Vm, builder: ClassBuilder) -> VmResult<ClassId> {
    vm.define_class(&builder.build(), Ref::NULL)
}

fn slot(vm: &Vm, class: ClassId, name: &str) -> VmResult<u32> {
    vm.instance_slot(class, name)
        .ok_or_else(|| VmError::internal(format!("bootstrap field {name} is missing")))
}

/// A builder whose backtraces name `Simple.java` as the source file.
fn class(name: &str, super_name: &str) -> ClassBuilder {
    let mut builder = ClassBuilder::new(name, Some(super_name));
    builder.source_file(&source_file(name));
    builder
}

fn source_file(name: &str) -> String {
    let simple = name.rsplit('/').next().unwrap_or(name);
    let outer = simple.split('$').next().unwrap_or(simple);
    format!("{outer}.java")
}

fn object_class() -> ClassBuilder {
    let mut b = ClassBuilder::new(OBJECT, None);
    b.source_file("Object.java");
    b.method(PUBLIC, "<init>", "()V", |c| {
        c.op(RETURN);
    })
    .native(PUBLIC_FINAL, "getClass", "()Ljava/lang/Class;")
    .native(PUBLIC, "hashCode", "()I")
    .method(PUBLIC, "equals", "(Ljava/lang/Object;)Z", |c| {
        let differ = c.label();
        c.aload(0).aload(1).branch(IF_ACMPNE, differ);
        c.iconst(1).op(IRETURN);
        c.bind(differ).iconst(0).op(IRETURN);
    })
    .native(MethodAccess::PROTECTED, "clone", "()Ljava/lang/Object;")
    .native(PUBLIC, "toString", "()Ljava/lang/String;")
    .native(PUBLIC_FINAL, "notify", "()V")
    .native(PUBLIC_FINAL, "notifyAll", "()V")
    .native(PUBLIC_FINAL, "wait", "(J)V")
    .method(PUBLIC_FINAL, "wait", "()V", |c| {
        c.aload(0).op(LCONST_0).invokevirtual(OBJECT, "wait", "(J)V").op(RETURN);
    });
    b
}

fn string_class() -> ClassBuilder {
    let mut b = class(STRING, OBJECT);
    b.access(ClassAccess::PUBLIC | ClassAccess::FINAL | ClassAccess::SUPER)
        .implements(SERIALIZABLE)
        .field(PRIVATE | FieldAccess::FINAL, "value", "[C")
        .default_constructor()
        .native(PUBLIC, "<init>", "([C)V")
        .native(PUBLIC, "length", "()I")
        .native(PUBLIC, "charAt", "(I)C")
        .native(PUBLIC, "equals", "(Ljava/lang/Object;)Z")
        .native(PUBLIC, "hashCode", "()I")
        .native(PUBLIC, "intern", "()Ljava/lang/String;")
        .native(PUBLIC, "concat", "(Ljava/lang/String;)Ljava/lang/String;")
        .native(PUBLIC, "toCharArray", "()[C")
        .method(PUBLIC, "toString", "()Ljava/lang/String;", |c| {
            c.aload(0).op(ARETURN);
        })
        .native(PUBLIC_STATIC, "valueOf", "(I)Ljava/lang/String;")
        .native(PUBLIC_STATIC, "valueOf", "(J)Ljava/lang/String;")
        .native(PUBLIC_STATIC, "valueOf", "(C)Ljava/lang/String;")
        .native(PUBLIC_STATIC, "valueOf", "(Z)Ljava/lang/String;")
        .method(PUBLIC_STATIC, "valueOf", "(Ljava/lang/Object;)Ljava/lang/String;", |c| {
            let present = c.label();
            c.aload(0).branch(IFNONNULL, present);
            c.ldc_string("null").op(ARETURN);
            c.bind(present)
                .aload(0)
                .invokevirtual(OBJECT, "toString", "()Ljava/lang/String;")
                .op(ARETURN);
        });
    b
}

fn class_class() -> ClassBuilder {
    let mut b = class(CLASS, OBJECT);
    b.access(ClassAccess::PUBLIC | ClassAccess::FINAL | ClassAccess::SUPER)
        .implements(SERIALIZABLE)
        .field(PRIVATE | FieldAccess::TRANSIENT, "classData", "Ljava/lang/Object;")
        .native(PUBLIC, "getName", "()Ljava/lang/String;")
        .native(PUBLIC_STATIC, "forName", "(Ljava/lang/String;)Ljava/lang/Class;")
        .native(PUBLIC, "newInstance", "()Ljava/lang/Object;")
        .native(PUBLIC, "isInterface", "()Z")
        .native(PUBLIC, "isArray", "()Z")
        .native(PUBLIC, "isPrimitive", "()Z")
        .native(PUBLIC, "isInstance", "(Ljava/lang/Object;)Z")
        .native(PUBLIC, "isAssignableFrom", "(Ljava/lang/Class;)Z")
        .native(PUBLIC, "getSuperclass", "()Ljava/lang/Class;")
        .native(PUBLIC, "getComponentType", "()Ljava/lang/Class;")
        .native(PUBLIC, "getClassLoader", "()Ljava/lang/ClassLoader;")
        .native(PUBLIC, "desiredAssertionStatus", "()Z")
        .method(PUBLIC, "toString", "()Ljava/lang/String;", |c| {
            let (plain, named) = (c.label(), c.label());
            c.aload(0).invokevirtual(CLASS, "isInterface", "()Z").branch(IFEQ, plain);
            c.ldc_string("interface ").goto(named);
            c.bind(plain).ldc_string("class ");
            c.bind(named)
                .aload(0)
                .invokevirtual(CLASS, "getName", "()Ljava/lang/String;")
                .invokevirtual(STRING, "concat", "(Ljava/lang/String;)Ljava/lang/String;")
                .op(ARETURN);
        });
    b
}

fn class_loader_class() -> ClassBuilder {
    let mut b = class(CLASS_LOADER, OBJECT);
    b.field(PRIVATE | FieldAccess::FINAL, "parent", "Ljava/lang/ClassLoader;")
        .field(PRIVATE, "classes", "[Ljava/lang/Class;")
        .field(PRIVATE, "count", "I")
        .method(
            MethodAccess::PROTECTED,
            "<init>",
            "(Ljava/lang/ClassLoader;)V",
            |c| {
                c.aload(0).invokespecial(OBJECT, "<init>", "()V");
                c.aload(0)
                    .aload(1)
                    .putfield(CLASS_LOADER, "parent", "Ljava/lang/ClassLoader;")
                    .op(RETURN);
            },
        )
        .method(MethodAccess::PROTECTED, "<init>", "()V", |c| {
            c.aload(0)
                .invokestatic(CLASS_LOADER, "getSystemClassLoader", "()Ljava/lang/ClassLoader;")
                .invokespecial(CLASS_LOADER, "<init>", "(Ljava/lang/ClassLoader;)V")
                .op(RETURN);
        })
        .method(PUBLIC_FINAL, "getParent", "()Ljava/lang/ClassLoader;", |c| {
            c.aload(0)
                .getfield(CLASS_LOADER, "parent", "Ljava/lang/ClassLoader;")
                .op(ARETURN);
        })
        .native(PUBLIC_STATIC, "getSystemClassLoader", "()Ljava/lang/ClassLoader;")
        .native(PUBLIC, "loadClass", "(Ljava/lang/String;)Ljava/lang/Class;");
    b
}

fn throwable_class() -> ClassBuilder {
    const MESSAGE: (&str, &str, &str) = (THROWABLE, "detailMessage", "Ljava/lang/String;");
    const CAUSE: (&str, &str, &str) = (THROWABLE, "cause", "Ljava/lang/Throwable;");
    let mut b = class(THROWABLE, OBJECT);
    b.implements(SERIALIZABLE)
        .field(PRIVATE, MESSAGE.1, MESSAGE.2)
        .field(PRIVATE, CAUSE.1, CAUSE.2)
        .field(PRIVATE | FieldAccess::TRANSIENT, "backtrace", "Ljava/lang/Object;")
        .method(PUBLIC, "<init>", "()V", |c| {
            c.aload(0).invokespecial(OBJECT, "<init>", "()V");
            c.aload(0)
                .invokevirtual(THROWABLE, "fillInStackTrace", "()Ljava/lang/Throwable;")
                .op(POP)
                .op(RETURN);
        })
        .method(PUBLIC, "<init>", "(Ljava/lang/String;)V", |c| {
            c.aload(0).invokespecial(THROWABLE, "<init>", "()V");
            c.aload(0).aload(1).putfield(MESSAGE.0, MESSAGE.1, MESSAGE.2).op(RETURN);
        })
        .method(PUBLIC, "<init>", MESSAGE_CAUSE, |c| {
            c.aload(0).aload(1).invokespecial(THROWABLE, "<init>", "(Ljava/lang/String;)V");
            c.aload(0).aload(2).putfield(CAUSE.0, CAUSE.1, CAUSE.2).op(RETURN);
        })
        .method(PUBLIC, "<init>", "(Ljava/lang/Throwable;)V", |c| {
            let done = c.label();
            c.aload(0).invokespecial(THROWABLE, "<init>", "()V");
            c.aload(0).aload(1).putfield(CAUSE.0, CAUSE.1, CAUSE.2);
            c.aload(1).branch(IFNULL, done);
            c.aload(0)
                .aload(1)
                .invokevirtual(THROWABLE, "toString", "()Ljava/lang/String;")
                .putfield(MESSAGE.0, MESSAGE.1, MESSAGE.2);
            c.bind(done).op(RETURN);
        })
        .method(PUBLIC, "getMessage", "()Ljava/lang/String;", |c| {
            c.aload(0).getfield(MESSAGE.0, MESSAGE.1, MESSAGE.2).op(ARETURN);
        })
        .method(PUBLIC, "getLocalizedMessage", "()Ljava/lang/String;", |c| {
            c.aload(0)
                .invokevirtual(THROWABLE, "getMessage", "()Ljava/lang/String;")
                .op(ARETURN);
        })
        .method(PUBLIC, "getCause", "()Ljava/lang/Throwable;", |c| {
            c.aload(0).getfield(CAUSE.0, CAUSE.1, CAUSE.2).op(ARETURN);
        })
        .method(
            PUBLIC,
            "initCause",
            "(Ljava/lang/Throwable;)Ljava/lang/Throwable;",
            |c| {
                let unset = c.label();
                c.aload(0).getfield(CAUSE.0, CAUSE.1, CAUSE.2).branch(IFNULL, unset);
                c.new_object("java/lang/IllegalStateException").op(DUP);
                c.ldc_string("Can't overwrite cause");
                c.invokespecial("java/lang/IllegalStateException", "<init>", "(Ljava/lang/String;)V");
                c.op(ATHROW);
                c.bind(unset).aload(0).aload(1).putfield(CAUSE.0, CAUSE.1, CAUSE.2);
                c.aload(0).op(ARETURN);
            },
        )
        .native(PUBLIC, "fillInStackTrace", "()Ljava/lang/Throwable;")
        .native(PUBLIC, "printStackTrace", "()V")
        .native(PUBLIC, "toString", "()Ljava/lang/String;");
    b
}

/// A throwable class whose four constructors delegate to `parent`'s.
fn exception_class(name: &str, parent: &str) -> ClassBuilder {
    let mut b = class(name, parent);
    b.method(PUBLIC, "<init>", "()V", |c| {
        c.aload(0).invokespecial(parent, "<init>", "()V").op(RETURN);
    })
    .method(PUBLIC, "<init>", "(Ljava/lang/String;)V", |c| {
        c.aload(0)
            .aload(1)
            .invokespecial(parent, "<init>", "(Ljava/lang/String;)V")
            .op(RETURN);
    })
    .method(PUBLIC, "<init>", MESSAGE_CAUSE, |c| {
        c.aload(0)
            .aload(1)
            .aload(2)
            .invokespecial(parent, "<init>", MESSAGE_CAUSE)
            .op(RETURN);
    })
    .method(PUBLIC, "<init>", "(Ljava/lang/Throwable;)V", |c| {
        c.aload(0)
            .aload(1)
            .invokespecial(parent, "<init>", "(Ljava/lang/Throwable;)V")
            .op(RETURN);
    });
    b
}

fn thread_class() -> ClassBuilder {
    const NAME: (&str, &str, &str) = (THREAD, "name", "Ljava/lang/String;");
    const PRIORITY: (&str, &str, &str) = (THREAD, "priority", "I");
    const DAEMON: (&str, &str, &str) = (THREAD, "daemon", "Z");
    const TARGET: (&str, &str, &str) = (THREAD, "target", "Ljava/lang/Runnable;");
    const HANDLER_FIELD: (&str, &str, &str) = (
        THREAD,
        "uncaughtExceptionHandler",
        "Ljava/lang/Thread$UncaughtExceptionHandler;",
    );
    const SEQ: (&str, &str, &str) = (THREAD, "threadSeq", "I");

    let mut b = class(THREAD, OBJECT);
    b.implements(RUNNABLE)
        .field(PRIVATE, NAME.1, NAME.2)
        .field(PRIVATE, PRIORITY.1, PRIORITY.2)
        .field(PRIVATE, DAEMON.1, DAEMON.2)
        .field(PRIVATE, TARGET.1, TARGET.2)
        .field(PRIVATE, "eetop", "I")
        .field(PRIVATE, HANDLER_FIELD.1, HANDLER_FIELD.2)
        .field(PRIVATE | FieldAccess::STATIC, SEQ.1, SEQ.2);
    for (name, value) in [("MIN_PRIORITY", 1), ("NORM_PRIORITY", 5), ("MAX_PRIORITY", 10)] {
        b.constant_field(FieldAccess::PUBLIC, name, "I", crate::builder::ConstValue::Int(value));
    }

    b.method(PUBLIC, "<init>", "()V", |c| {
        let orphan = c.label();
        c.aload(0).invokespecial(OBJECT, "<init>", "()V");
        c.aload(0).iconst(5).putfield(PRIORITY.0, PRIORITY.1, PRIORITY.2);
        // name = "Thread-" + threadSeq++
        c.aload(0).ldc_string("Thread-");
        c.getstatic(SEQ.0, SEQ.1, SEQ.2)
            .op(DUP)
            .iconst(1)
            .op(IADD)
            .putstatic(SEQ.0, SEQ.1, SEQ.2);
        c.invokestatic(STRING, "valueOf", "(I)Ljava/lang/String;")
            .invokevirtual(STRING, "concat", "(Ljava/lang/String;)Ljava/lang/String;")
            .putfield(NAME.0, NAME.1, NAME.2);
        c.invokestatic(THREAD, "currentThread", "()Ljava/lang/Thread;").astore(1);
        c.aload(1).branch(IFNULL, orphan);
        c.aload(0)
            .aload(1)
            .getfield(DAEMON.0, DAEMON.1, DAEMON.2)
            .putfield(DAEMON.0, DAEMON.1, DAEMON.2);
        c.bind(orphan).op(RETURN);
    })
    .method(PUBLIC, "<init>", "(Ljava/lang/Runnable;)V", |c| {
        c.aload(0).invokespecial(THREAD, "<init>", "()V");
        c.aload(0).aload(1).putfield(TARGET.0, TARGET.1, TARGET.2).op(RETURN);
    })
    .method(PUBLIC, "<init>", "(Ljava/lang/String;)V", |c| {
        c.aload(0).invokespecial(THREAD, "<init>", "()V");
        c.aload(0).aload(1).putfield(NAME.0, NAME.1, NAME.2).op(RETURN);
    })
    .method(
        PUBLIC,
        "<init>",
        "(Ljava/lang/Runnable;Ljava/lang/String;)V",
        |c| {
            c.aload(0).aload(1).invokespecial(THREAD, "<init>", "(Ljava/lang/Runnable;)V");
            c.aload(0).aload(2).putfield(NAME.0, NAME.1, NAME.2).op(RETURN);
        },
    )
    .method(PUBLIC, "run", "()V", |c| {
        let none = c.label();
        c.aload(0).getfield(TARGET.0, TARGET.1, TARGET.2).op(DUP).branch(IFNULL, none);
        c.invokeinterface(RUNNABLE, "run", "()V").op(RETURN);
        c.bind(none).op(POP).op(RETURN);
    })
    .method(
        PUBLIC_FINAL | MethodAccess::SYNCHRONIZED,
        "join",
        "()V",
        |c| {
            let (check, done) = (c.label(), c.label());
            c.bind(check)
                .aload(0)
                .invokevirtual(THREAD, "isAlive", "()Z")
                .branch(IFEQ, done);
            c.aload(0).op(LCONST_0).invokevirtual(OBJECT, "wait", "(J)V").goto(check);
            c.bind(done).op(RETURN);
        },
    )
    .method(PUBLIC_FINAL, "getName", "()Ljava/lang/String;", |c| {
        c.aload(0).getfield(NAME.0, NAME.1, NAME.2).op(ARETURN);
    })
    .method(PUBLIC_FINAL, "setName", "(Ljava/lang/String;)V", |c| {
        c.aload(0).aload(1).putfield(NAME.0, NAME.1, NAME.2).op(RETURN);
    })
    .method(PUBLIC_FINAL, "getPriority", "()I", |c| {
        c.aload(0).getfield(PRIORITY.0, PRIORITY.1, PRIORITY.2).op(IRETURN);
    })
    .method(PUBLIC_FINAL, "setPriority", "(I)V", |c| {
        let (bad, ok) = (c.label(), c.label());
        c.iload(1).iconst(1).branch(IF_ICMPLT, bad);
        c.iload(1).iconst(10).branch(IF_ICMPLE, ok);
        c.bind(bad).construct("java/lang/IllegalArgumentException").op(ATHROW);
        c.bind(ok).aload(0).iload(1).putfield(PRIORITY.0, PRIORITY.1, PRIORITY.2).op(RETURN);
    })
    .method(PUBLIC_FINAL, "isDaemon", "()Z", |c| {
        c.aload(0).getfield(DAEMON.0, DAEMON.1, DAEMON.2).op(IRETURN);
    })
    .method(PUBLIC_FINAL, "setDaemon", "(Z)V", |c| {
        let idle = c.label();
        c.aload(0).invokevirtual(THREAD, "isAlive", "()Z").branch(IFEQ, idle);
        c.construct("java/lang/IllegalThreadStateException").op(ATHROW);
        c.bind(idle).aload(0).iload(1).putfield(DAEMON.0, DAEMON.1, DAEMON.2).op(RETURN);
    })
    .method(
        PUBLIC,
        "getUncaughtExceptionHandler",
        "()Ljava/lang/Thread$UncaughtExceptionHandler;",
        |c| {
            c.aload(0)
                .getfield(HANDLER_FIELD.0, HANDLER_FIELD.1, HANDLER_FIELD.2)
                .op(ARETURN);
        },
    )
    .method(
        PUBLIC,
        "setUncaughtExceptionHandler",
        "(Ljava/lang/Thread$UncaughtExceptionHandler;)V",
        |c| {
            c.aload(0)
                .aload(1)
                .putfield(HANDLER_FIELD.0, HANDLER_FIELD.1, HANDLER_FIELD.2)
                .op(RETURN);
        },
    )
    // entered from the bottom of a thread's stack with the escaping throwable
    .method(MethodAccess::FINAL, "dispatchUncaughtException", "(Ljava/lang/Throwable;)V", |c| {
        let report = c.label();
        c.aload(0)
            .getfield(HANDLER_FIELD.0, HANDLER_FIELD.1, HANDLER_FIELD.2)
            .op(DUP)
            .branch(IFNULL, report);
        c.aload(0).aload(1);
        c.invokeinterface(HANDLER, "uncaughtException", "(Ljava/lang/Thread;Ljava/lang/Throwable;)V");
        c.op(RETURN);
        c.bind(report).op(POP).aload(0).aload(1);
        c.invokespecial(THREAD, "printUncaught", "(Ljava/lang/Throwable;)V");
        c.op(RETURN);
    })
    .native(MethodAccess::PRIVATE, "printUncaught", "(Ljava/lang/Throwable;)V")
    .native(PUBLIC, "start", "()V")
    .native(PUBLIC_STATIC, "currentThread", "()Ljava/lang/Thread;")
    .native(PUBLIC_STATIC, "sleep", "(J)V")
    .native(PUBLIC_STATIC, "yield", "()V")
    .native(PUBLIC, "interrupt", "()V")
    .native(PUBLIC, "isInterrupted", "()Z")
    .native(PUBLIC_STATIC, "interrupted", "()Z")
    .native(PUBLIC_FINAL, "isAlive", "()Z");
    b
}

fn print_stream_class() -> ClassBuilder {
    let mut b = class(PRINT_STREAM, OBJECT);
    for name in ["print", "println"] {
        for descriptor in ["(Ljava/lang/String;)V", "(I)V", "(J)V", "(C)V", "(Z)V"] {
            b.native(PUBLIC, name, descriptor);
        }
        b.method(PUBLIC, name, "(Ljava/lang/Object;)V", |c| {
            c.aload(0)
                .aload(1)
                .invokestatic(STRING, "valueOf", "(Ljava/lang/Object;)Ljava/lang/String;")
                .invokevirtual(PRINT_STREAM, name, "(Ljava/lang/String;)V")
                .op(RETURN);
        });
    }
    b.native(PUBLIC, "println", "()V");
    b
}

fn system_class() -> ClassBuilder {
    let stream = FieldAccess::PUBLIC | FieldAccess::STATIC | FieldAccess::FINAL;
    let mut b = class(SYSTEM, OBJECT);
    b.access(ClassAccess::PUBLIC | ClassAccess::FINAL | ClassAccess::SUPER)
        .field(stream, "out", "Ljava/io/PrintStream;")
        .field(stream, "err", "Ljava/io/PrintStream;")
        .field(PRIVATE | FieldAccess::STATIC, "props", "[Ljava/lang/String;")
        .native(PUBLIC_STATIC, "currentTimeMillis", "()J")
        .native(PUBLIC_STATIC, "nanoTime", "()J")
        .native(
            PUBLIC_STATIC,
            "arraycopy",
            "(Ljava/lang/Object;ILjava/lang/Object;II)V",
        )
        .native(PUBLIC_STATIC, "exit", "(I)V")
        .native(PUBLIC_STATIC, "gc", "()V")
        .native(PUBLIC_STATIC, "identityHashCode", "(Ljava/lang/Object;)I")
        .native(PUBLIC_STATIC, "getProperty", "(Ljava/lang/String;)Ljava/lang/String;")
        .native(
            PUBLIC_STATIC,
            "getProperty",
            "(Ljava/lang/String;Ljava/lang/String;)Ljava/lang/String;",
        );
    b
}

fn weak_reference_class() -> ClassBuilder {
    const REFERENT: (&str, &str, &str) = (WEAK_REFERENCE, "referent", "Ljava/lang/Object;");
    let mut b = class(WEAK_REFERENCE, OBJECT);
    b.field(PRIVATE, REFERENT.1, REFERENT.2)
        .method(PUBLIC, "<init>", "(Ljava/lang/Object;)V", |c| {
            c.aload(0).invokespecial(OBJECT, "<init>", "()V");
            c.aload(0).aload(1).putfield(REFERENT.0, REFERENT.1, REFERENT.2).op(RETURN);
        })
        .method(PUBLIC, "get", "()Ljava/lang/Object;", |c| {
            c.aload(0).getfield(REFERENT.0, REFERENT.1, REFERENT.2).op(ARETURN);
        })
        .method(PUBLIC, "clear", "()V", |c| {
            c.aload(0)
                .op(ACONST_NULL)
                .putfield(REFERENT.0, REFERENT.1, REFERENT.2)
                .op(RETURN);
        });
    b
}

/// `System.props` as alternating keys and values; `-D` definitions come
/// first so they shadow the defaults.
fn system_properties(vm: &mut Vm) -> VmResult<Ref> {
    let settings = &vm.settings;
    let join = |paths: &[std::path::PathBuf]| {
        paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":")
    };
    let defaults = [
        ("java.version", "1.6".to_string()),
        ("java.vm.name", "kava".to_string()),
        ("java.vm.version", env!("CARGO_PKG_VERSION").to_string()),
        ("java.class.path", join(&settings.classpath)),
        ("sun.boot.class.path", join(&settings.boot_classpath)),
        (
            "java.home",
            settings.home.as_ref().map(|h| h.display().to_string()).unwrap_or_default(),
        ),
        ("os.name", std::env::consts::OS.to_string()),
        ("os.arch", std::env::consts::ARCH.to_string()),
        ("file.separator", "/".to_string()),
        ("path.separator", ":".to_string()),
        ("line.separator", "\n".to_string()),
    ];
    let mut entries = settings.properties.clone();
    for (key, value) in defaults {
        if !entries.iter().any(|(k, _)| k == key) {
            entries.push((key.to_string(), value));
        }
    }

    vm.scoped(|vm| {
        let string_array = vm.array_class_of(vm.known.string)?;
        let props = vm.new_ref_array(string_array, entries.len() * 2)?;
        vm.root(props)?;
        for (i, (key, value)) in entries.iter().enumerate() {
            let key = vm.new_string(key)?;
            vm.array_store_ref(props, 2 * i, key);
            let value = vm.new_string(value)?;
            vm.array_store_ref(props, 2 * i + 1, value);
        }
        Ok(props)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmSettings;

    #[test]
    fn core_classes_are_initialized_and_known() {
        let vm = Vm::new(VmSettings::default()).unwrap();
        for (id, name) in [
            (vm.known.object, OBJECT),
            (vm.known.string, STRING),
            (vm.known.thread, THREAD),
            (vm.known.error, "java/lang/Error"),
            (vm.known.weak_reference, WEAK_REFERENCE),
        ] {
            assert_eq!(vm.classes[id].name, name);
            assert_eq!(vm.classes[id].state, ClassState::Initialized);
        }
        assert!(vm.classes[vm.known.weak_reference].weak);
        assert_eq!(vm.known.primitives.len(), ElemType::PRIMITIVES.len());
        assert!(vm.instance_of(vm.oom, vm.known.error));
    }

    #[test]
    fn every_exception_the_core_throws_exists() {
        let vm = Vm::new(VmSettings::default()).unwrap();
        for &(name, parent) in THROWABLES {
            let id = vm.classes.lookup(name, Ref::NULL).unwrap();
            let parent = vm.classes.lookup(parent, Ref::NULL).unwrap();
            assert_eq!(vm.classes[id].super_class, Some(parent), "{name}");
        }
    }

    #[test]
    fn source_files_use_the_outer_class() {
        assert_eq!(source_file(HANDLER), "Thread.java");
        assert_eq!(source_file(OBJECT), "Object.java");
    }
}
