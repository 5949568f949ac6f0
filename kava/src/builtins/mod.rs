//! Native methods of the bootstrap class library.
//!
//! Each area of `java.lang` keeps its natives in its own file; this module
//! collects them into one table that the bootstrap registers before any
//! class can link against them.

mod class;
mod object;
mod print;
mod string;
mod system;
mod thread;
mod throwable;

use crate::Vm;
use crate::cell::Ref;
use crate::error::VmResult;
use crate::natives::NativeFn;

pub(crate) use object::identity_hash;

/// One native binding: `class.name descriptor` is implemented by `func`.
#[derive(Debug, Clone, Copy)]
pub struct NativeDesc {
    pub class: &'static str,
    pub name: &'static str,
    pub descriptor: &'static str,
    pub func: NativeFn,
}

impl NativeDesc {
    pub const fn new(
        class: &'static str,
        name: &'static str,
        descriptor: &'static str,
        func: NativeFn,
    ) -> Self {
        Self {
            class,
            name,
            descriptor,
            func,
        }
    }
}

pub fn default_natives() -> Vec<NativeDesc> {
    let mut natives = Vec::new();
    natives.extend_from_slice(object::NATIVES);
    natives.extend_from_slice(class::NATIVES);
    natives.extend_from_slice(string::NATIVES);
    natives.extend_from_slice(system::NATIVES);
    natives.extend_from_slice(thread::NATIVES);
    natives.extend_from_slice(throwable::NATIVES);
    natives.extend_from_slice(print::NATIVES);
    natives
}

/// `value`, or a `NullPointerException` when it is null.
fn non_null(vm: &mut Vm, value: Ref) -> VmResult<Ref> {
    match value.non_null() {
        Some(value) => Ok(value),
        None => Err(vm.throw_new("java/lang/NullPointerException", None)),
    }
}

fn throw<T>(vm: &mut Vm, class: &str, message: &str) -> VmResult<T> {
    Err(vm.throw_new(class, Some(message)))
}
