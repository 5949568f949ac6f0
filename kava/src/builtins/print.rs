//! `java.io.PrintStream`. `System.out` and `System.err` both write to the
//! VM console.

use super::NativeDesc;
use crate::Vm;
use crate::error::VmResult;
use crate::natives::{NativeArgs, NativeValue};

const STREAM: &str = "java/io/PrintStream";

pub(super) const NATIVES: &[NativeDesc] = &[
    NativeDesc::new(STREAM, "print", "(Ljava/lang/String;)V", print_string),
    NativeDesc::new(STREAM, "println", "(Ljava/lang/String;)V", println_string),
    NativeDesc::new(STREAM, "print", "(I)V", print_int),
    NativeDesc::new(STREAM, "println", "(I)V", println_int),
    NativeDesc::new(STREAM, "print", "(J)V", print_long),
    NativeDesc::new(STREAM, "println", "(J)V", println_long),
    NativeDesc::new(STREAM, "print", "(C)V", print_char),
    NativeDesc::new(STREAM, "println", "(C)V", println_char),
    NativeDesc::new(STREAM, "print", "(Z)V", print_bool),
    NativeDesc::new(STREAM, "println", "(Z)V", println_bool),
    NativeDesc::new(STREAM, "println", "()V", println),
];

fn emit(vm: &Vm, text: &str, newline: bool) -> VmResult<NativeValue> {
    if newline {
        vm.console.write_line(text);
    } else {
        vm.console.write(text);
    }
    Ok(NativeValue::Void)
}

fn string_arg(vm: &Vm, args: &NativeArgs) -> String {
    vm.string_value(args.reference(vm, 1))
}

fn char_arg(vm: &Vm, args: &NativeArgs) -> String {
    char::decode_utf16([args.int(vm, 1) as u16])
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

fn bool_arg(vm: &Vm, args: &NativeArgs) -> &'static str {
    if args.int(vm, 1) != 0 { "true" } else { "false" }
}

fn print_string(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    emit(vm, &string_arg(vm, args), false)
}

fn println_string(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    emit(vm, &string_arg(vm, args), true)
}

fn print_int(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    emit(vm, &args.int(vm, 1).to_string(), false)
}

fn println_int(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    emit(vm, &args.int(vm, 1).to_string(), true)
}

fn print_long(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    emit(vm, &args.long(vm, 1).to_string(), false)
}

fn println_long(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    emit(vm, &args.long(vm, 1).to_string(), true)
}

fn print_char(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    emit(vm, &char_arg(vm, args), false)
}

fn println_char(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    emit(vm, &char_arg(vm, args), true)
}

fn print_bool(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    emit(vm, bool_arg(vm, args), false)
}

fn println_bool(vm: &mut Vm, args: &NativeArgs) -> VmResult<NativeValue> {
    emit(vm, bool_arg(vm, args), true)
}

fn println(vm: &mut Vm, _args: &NativeArgs) -> VmResult<NativeValue> {
    emit(vm, "", true)
}
