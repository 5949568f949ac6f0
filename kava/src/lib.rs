//! kava: an embeddable virtual machine for Java 6 class files.
//!
//! One [`Vm`] owns a fixed-size mark-sweep heap, green threads scheduled
//! cooperatively by bytecode count, and a single interpreter loop. Nothing is
//! global, so several VMs can live in one process.

mod bootstrap;
pub mod builder;
pub mod builtins;
pub mod cell;
pub mod class;
pub mod classfile;
pub mod config;
pub mod console;
pub mod debug;
pub mod descriptor;
pub mod error;
mod exception;
pub mod frame;
mod gc;
pub mod heap;
mod interpreter;
mod invoke;
pub mod loader;
pub mod monitor;
pub mod natives;
mod object;
pub mod opcodes;
mod resolve;
pub mod roots;
mod scheduler;
pub mod thread;
mod vm;

#[cfg(test)]
mod testkit;

pub use builder::{ClassBuilder, CodeBuilder, ConstValue, Label};
pub use cell::{Cell, Ref};
pub use class::{ClassId, MethodId};
pub use classfile::{ClassAccess, ClassFile, FieldAccess, MethodAccess};
pub use config::VmSettings;
pub use console::Console;
pub use debug::{DebugAction, DebugEvent, DebugSink};
pub use error::{ExitCode, VmError, VmResult};
pub use heap::HeapStats;
pub use natives::{NativeArgs, NativeFn, NativeValue};
pub use thread::ThreadId;
pub use vm::{KnownClasses, Vm};
