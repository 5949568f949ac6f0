//! `java.lang.Throwable`.

use super::NativeDesc;
use crate::Vm;
use crate::error::VmResult;
use crate::natives::{NativeArgs, NativeValue};

const THROWABLE: &str = "java/lang/Throwable";

pub(super) const NATIVES: &[NativeDesc] = &[
    NativeDesc::new(
        THROWABLE,
        "fillInStackTrace",
        "()Ljava/lang/Throwable;",
        fill_in_stack_trace,
    ),
    NativeDesc::new(THROWABLE, "printStackTrace", "()V", print_stack_trace),
    NativeDesc::new(THROWABLE, "toString", "()Ljava/lang/String;", to_string),
];

fn fill_in_stack_trace(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let this = args.reference(vm, 0);
    vm.fill_backtrace(this)?;
    Ok(NativeValue::Ref(this))
}

fn print_stack_trace(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let text = vm.stack_trace_text(args.reference(vm, 0));
    vm.console.write(&text);
    Ok(NativeValue::Void)
}

fn to_string(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let text = vm.describe_throwable(args.reference(vm, 0));
    Ok(NativeValue::Ref(vm.new_string(&text)?))
}

#[cfg(test)]
mod tests {
    use crate::opcodes::*;
    use crate::testkit;

    #[test]
    fn causes_and_descriptions() {
        let (mut vm, out) = testkit::vm();
        testkit::main_class(&mut vm, "p/Main", |c| {
            c.new_object("java/lang/IllegalStateException").op(DUP).ldc_string("inner");
            c.invokespecial("java/lang/IllegalStateException", "<init>", "(Ljava/lang/String;)V");
            c.astore(1);
            c.new_object("java/lang/RuntimeException").op(DUP).ldc_string("outer").aload(1);
            c.invokespecial(
                "java/lang/RuntimeException",
                "<init>",
                "(Ljava/lang/String;Ljava/lang/Throwable;)V",
            );
            c.astore(2);
            c.aload(2)
                .invokevirtual("java/lang/Throwable", "toString", "()Ljava/lang/String;")
                .invokestatic("t/Out", "print", "(Ljava/lang/String;)V");
            c.aload(2)
                .invokevirtual("java/lang/Throwable", "getCause", "()Ljava/lang/Throwable;")
                .invokevirtual("java/lang/Throwable", "getMessage", "()Ljava/lang/String;")
                .invokestatic("t/Out", "print", "(Ljava/lang/String;)V");
            c.op(RETURN);
        });
        vm.run_main("p/Main", &[]);
        assert_eq!(
            testkit::output(&out),
            "java.lang.RuntimeException: outer\ninner\n"
        );
    }

    #[test]
    fn print_stack_trace_names_the_throwing_method() {
        let (mut vm, out) = testkit::vm();
        testkit::main_class(&mut vm, "p/Main", |c| {
            c.construct("java/lang/Error")
                .invokevirtual("java/lang/Throwable", "printStackTrace", "()V");
            c.op(RETURN);
        });
        vm.run_main("p/Main", &[]);
        let text = testkit::output(&out);
        assert!(text.starts_with("java.lang.Error\n"), "{text}");
        assert!(text.contains("\tat p.Main.main"), "{text}");
    }
}
