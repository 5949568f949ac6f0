//! Transient and permanent root stacks.
//!
//! Any VM routine that holds a reference across a further allocation pushes it
//! here first. Transient roots belong to the innermost scope opened with
//! [`Vm::scoped`](crate::Vm::scoped) and disappear when that scope exits, on
//! both the normal and the throwing path. Permanent roots live as long as the
//! VM.

use crate::cell::Ref;
use crate::error::{ExitCode, VmError, VmResult};

#[derive(Debug)]
pub struct RootStack {
    slots: Vec<Ref>,
    limit: usize,
    name: &'static str,
}

impl RootStack {
    pub fn new(name: &'static str, limit: usize) -> Self {
        Self {
            slots: Vec::with_capacity(limit.min(1024)),
            limit,
            name,
        }
    }

    /// Registers `value` and returns its slot so callers may update it later.
    pub fn push(&mut self, value: Ref) -> VmResult<usize> {
        if self.slots.len() >= self.limit {
            return Err(VmError::fatal(
                ExitCode::Internal,
                format!("{} root stack overflow ({} slots)", self.name, self.limit),
            ));
        }
        self.slots.push(value);
        Ok(self.slots.len() - 1)
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn truncate(&mut self, depth: usize) {
        self.slots.truncate(depth);
    }

    #[inline]
    pub fn get(&self, slot: usize) -> Ref {
        self.slots[slot]
    }

    #[inline]
    pub fn set(&mut self, slot: usize, value: Ref) {
        self.slots[slot] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = Ref> + '_ {
        self.slots.iter().copied()
    }
}

#[derive(Debug)]
pub struct Roots {
    pub permanent: RootStack,
    pub transient: RootStack,
}

impl Roots {
    pub fn new(permanent: usize, transient: usize) -> Self {
        Self {
            permanent: RootStack::new("permanent", permanent),
            transient: RootStack::new("transient", transient),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Ref> + '_ {
        self.permanent.iter().chain(self.transient.iter())
    }
}
