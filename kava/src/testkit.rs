//! Shared fixtures for unit tests: a VM whose console is captured and a
//! `t/Out` class with `print` natives for ints, longs and strings.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::Vm;
use crate::builder::{ClassBuilder, CodeBuilder};
use crate::cell::Ref;
use crate::class::ClassId;
use crate::classfile::MethodAccess;
use crate::config::VmSettings;
use crate::console::Console;
use crate::error::VmResult;
use crate::natives::{NativeArgs, NativeValue};

pub(crate) const MAIN: &str = "([Ljava/lang/String;)V";

fn print_int(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let value = args.int(vm, 0);
    vm.console.write_line(&value.to_string());
    Ok(NativeValue::Void)
}

fn print_long(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let value = args.long(vm, 0);
    vm.console.write_line(&value.to_string());
    Ok(NativeValue::Void)
}

fn print_string(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    let text = vm.string_value(args.reference(vm, 0));
    vm.console.write_line(&text);
    Ok(NativeValue::Void)
}

pub(crate) fn vm_with(settings: VmSettings) -> (Vm, Arc<Mutex<String>>) {
    let (console, buffer) = Console::capture();
    let mut vm = Vm::new(VmSettings { console, ..settings }).unwrap();
    vm.register_native("t/Out", "print", "(I)V", print_int);
    vm.register_native("t/Out", "print", "(J)V", print_long);
    vm.register_native("t/Out", "print", "(Ljava/lang/String;)V", print_string);
    let mut out = ClassBuilder::new("t/Out", Some("java/lang/Object"));
    let access = MethodAccess::PUBLIC | MethodAccess::STATIC;
    out.native(access, "print", "(I)V")
        .native(access, "print", "(J)V")
        .native(access, "print", "(Ljava/lang/String;)V");
    vm.define_class(&out.build(), Ref::NULL).unwrap();
    (vm, buffer)
}

pub(crate) fn vm() -> (Vm, Arc<Mutex<String>>) {
    vm_with(VmSettings::default())
}

/// Defines `name` with a static `main` assembled by `body`.
pub(crate) fn main_class(vm: &mut Vm, name: &str, body: impl FnOnce(&mut CodeBuilder<'_>)) -> ClassId {
    let mut b = ClassBuilder::new(name, Some("java/lang/Object"));
    b.method(MethodAccess::PUBLIC | MethodAccess::STATIC, "main", MAIN, body);
    vm.define_class(&b.build(), Ref::NULL).unwrap()
}

pub(crate) fn output(buffer: &Arc<Mutex<String>>) -> String {
    buffer.lock().clone()
}
