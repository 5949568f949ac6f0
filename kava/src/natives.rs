//! Native method interface.
//!
//! A native receives the VM and a view of its argument cells, which stay on
//! the caller's operand stack for the whole call so that they remain visible
//! to the collector. The returned [`NativeValue`] replaces them.

use rustc_hash::FxHashMap;

use crate::Vm;
use crate::cell::{Cell, Ref};
use crate::error::VmResult;

pub type NativeFn = fn(&mut Vm, &NativeArgs) -> VmResult<NativeValue>;

/// What a native call leaves on the caller's stack.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum NativeValue {
    Void,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Ref(Ref),
    /// The native rearranged frames itself (pushed a method, asked for the
    /// invoke to be retried, ...); the stack is left alone.
    Frames,
}

impl From<bool> for NativeValue {
    fn from(value: bool) -> Self {
        NativeValue::Int(value as i32)
    }
}

/// Argument cells of a native call, indexed by cell: a `long` or `double`
/// argument takes two indices, and `this` is index 0 of instance methods.
#[derive(Debug, Copy, Clone)]
pub struct NativeArgs {
    pub(crate) base: usize,
    pub(crate) count: usize,
}

impl NativeArgs {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn cell(&self, vm: &Vm, index: usize) -> Cell {
        debug_assert!(index < self.count);
        vm.heap.cell(self.base + index)
    }

    pub fn int(&self, vm: &Vm, index: usize) -> i32 {
        self.cell(vm, index).int()
    }

    pub fn long(&self, vm: &Vm, index: usize) -> i64 {
        self.cell(vm, index).long()
    }

    pub fn float(&self, vm: &Vm, index: usize) -> f32 {
        self.cell(vm, index).float()
    }

    pub fn double(&self, vm: &Vm, index: usize) -> f64 {
        self.cell(vm, index).double()
    }

    pub fn reference(&self, vm: &Vm, index: usize) -> Ref {
        self.cell(vm, index).reference()
    }
}

type NativeKey = (String, String, String);

/// Natives by (class, name, descriptor).
#[derive(Default)]
pub struct NativeRegistry {
    functions: FxHashMap<NativeKey, NativeFn>,
}

impl NativeRegistry {
    pub fn with_capacity(buckets: usize) -> Self {
        Self {
            functions: FxHashMap::with_capacity_and_hasher(buckets, Default::default()),
        }
    }

    /// Registers `function`; a later registration for the same method wins.
    pub fn register(&mut self, class: &str, name: &str, descriptor: &str, function: NativeFn) {
        self.functions.insert(
            (class.to_string(), name.to_string(), descriptor.to_string()),
            function,
        );
    }

    pub fn lookup(&self, class: &str, name: &str, descriptor: &str) -> Option<NativeFn> {
        self.functions
            .get(&(class.to_string(), name.to_string(), descriptor.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
