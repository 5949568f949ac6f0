//! Mark-sweep collection.
//!
//! Marking is exact for heap objects (the class layout says which cells hold
//! references) and conservative for thread stacks: every cell between a
//! frame's locals and its stack pointer that names a live chunk keeps that
//! chunk alive.

use log::{debug, error};

use crate::Vm;
use crate::cell::{Cell, Ref};
use crate::class::{
    ClassId, ClassKind, ClassPool, Constant, DATA_CLASS_ID, DATA_LOADER, DATA_MIRROR, DATA_STATICS,
};
use crate::error::{ExitCode, VmError, VmResult};
use crate::frame::walk;
use crate::heap::{AllocKind, Heap};
use crate::object::{ARRAY_HEADER, OBJECT_HEADER};

/// Gray set of a marking pass.
struct Marker<'a> {
    heap: &'a mut Heap,
    classes: &'a ClassPool,
    /// Instance slot of `WeakReference.referent`.
    referent: u32,
    gray: Vec<Ref>,
    weak: Vec<Ref>,
}

impl Marker<'_> {
    /// Marks the chunk named by `raw` if it is one.
    fn mark_raw(&mut self, raw: u64) {
        if self.heap.live_chunk(raw).is_some() {
            let chunk = Ref::from_index(raw as usize);
            if self.heap.mark(chunk) {
                self.gray.push(chunk);
            }
        }
    }

    fn mark(&mut self, chunk: Ref) {
        if !chunk.is_null() {
            self.mark_raw(chunk.index() as u64);
        }
    }

    fn mark_class(&mut self, id: ClassId) {
        let classes = self.classes;
        if let Some(class) = classes.get(id) {
            let data = class.data;
            self.mark(data);
        }
    }

    fn drain(&mut self) {
        while let Some(chunk) = self.gray.pop() {
            self.scan(chunk);
        }
    }

    fn scan(&mut self, chunk: Ref) {
        match self.heap.kind(chunk) {
            AllocKind::Object | AllocKind::WeakRef => {
                let weak = self.heap.kind(chunk) == AllocKind::WeakRef;
                if weak {
                    self.weak.push(chunk);
                }
                let id = ClassId(self.heap.field(chunk, 0).raw() as u32);
                let classes = self.classes;
                let Some(class) = classes.get(id) else {
                    return;
                };
                self.mark(class.data);
                for &slot in &class.ref_slots {
                    if weak && slot == self.referent {
                        continue;
                    }
                    let value = self.heap.field(chunk, OBJECT_HEADER + slot as usize);
                    self.mark_raw(value.raw());
                }
            }
            AllocKind::RefArray => {
                self.mark_class(ClassId(self.heap.field(chunk, 0).raw() as u32));
                let length = self.heap.field(chunk, 1).int() as usize;
                for i in 0..length {
                    let value = self.heap.field(chunk, ARRAY_HEADER + i);
                    self.mark_raw(value.raw());
                }
            }
            AllocKind::PrimArray => {
                self.mark_class(ClassId(self.heap.field(chunk, 0).raw() as u32));
            }
            AllocKind::ClassData => self.scan_class_data(chunk),
            AllocKind::StackSegment | AllocKind::Free => {}
        }
    }

    fn scan_class_data(&mut self, data: Ref) {
        let mirror = self.heap.field(data, DATA_MIRROR);
        let loader = self.heap.field(data, DATA_LOADER);
        self.mark_raw(mirror.raw());
        self.mark_raw(loader.raw());
        let id = ClassId(self.heap.field(data, DATA_CLASS_ID).raw() as u32);
        let classes = self.classes;
        let Some(class) = classes.get(id) else {
            return;
        };
        if class.data != data {
            return;
        }
        for &slot in &class.static_ref_slots {
            let value = self.heap.field(data, DATA_STATICS + slot as usize);
            self.mark_raw(value.raw());
        }
        if let Some(s) = class.super_class {
            self.mark_class(s);
        }
        for &i in &class.interfaces {
            self.mark_class(i);
        }
        if let ClassKind::Array {
            component: Some(component),
            ..
        } = class.kind
        {
            self.mark_class(component);
        }
        for constant in &class.constants {
            match constant {
                Constant::Class {
                    resolved: Some(target),
                    ..
                } => self.mark_class(*target),
                Constant::String { resolved, .. } => self.mark(*resolved),
                Constant::Field {
                    resolved: Some(target),
                    ..
                } => self.mark_class(target.class),
                Constant::Method {
                    resolved,
                    cache,
                    special,
                    ..
                } => {
                    for method in resolved.iter().chain(special) {
                        self.mark_class(method.class);
                    }
                    if let Some((receiver, selected)) = cache {
                        if classes.contains(*receiver) {
                            self.mark_class(*receiver);
                        }
                        self.mark_class(selected.class);
                    }
                }
                _ => {}
            }
        }
    }
}

impl Vm {
    /// Allocates `words` zeroed payload words, collecting once on failure.
    /// A second failure throws the pre-allocated `OutOfMemoryError`.
    pub(crate) fn allocate(&mut self, words: usize, kind: AllocKind) -> VmResult<Ref> {
        if let Some(chunk) = self.heap.alloc(words, kind) {
            return Ok(chunk);
        }
        self.collect_garbage();
        match self.heap.alloc(words, kind) {
            Some(chunk) => Ok(chunk),
            None => Err(self.out_of_memory()),
        }
    }

    pub(crate) fn out_of_memory(&mut self) -> VmError {
        match self.oom.non_null() {
            Some(oom) => VmError::Throw(oom),
            None => {
                error!("heap exhausted during startup");
                VmError::fatal(ExitCode::OutOfMemory, "out of memory")
            }
        }
    }

    /// Runs a full mark-sweep cycle.
    pub fn collect_garbage(&mut self) {
        self.gc_cycles += 1;
        self.shrink_stacks();

        let mut marker = Marker {
            heap: &mut self.heap,
            classes: &self.classes,
            referent: self.known.weak_referent,
            gray: Vec::new(),
            weak: Vec::new(),
        };

        for root in self.roots.iter() {
            marker.mark(root);
        }
        marker.mark(self.app_loader);
        marker.mark(self.oom);
        marker.mark(self.soe);
        for &string in self.strings.values() {
            marker.mark(string);
        }
        for class in self.classes.iter() {
            if class.loader.is_null() {
                marker.mark(class.data);
            }
        }
        for monitor in self.monitors.in_use() {
            marker.mark(monitor.object);
        }

        for thread in self.threads.iter() {
            marker.mark(thread.object);
            marker.mark(thread.pending);
            marker.mark(thread.waiting_on);
            marker.mark(thread.blocked_on);
            marker.mark(thread.native_monitor);
            let regs = if thread.id == self.current {
                self.regs
            } else {
                thread.regs
            };
            if regs.segment.is_null() {
                continue;
            }
            // segments from the head up to the one in use
            let mut segment = thread.stack_head;
            while !segment.is_null() {
                marker.mark(segment);
                if segment == regs.segment {
                    break;
                }
                segment = marker.heap.field(segment, 0).reference();
            }
            if regs.locals == 0 {
                continue;
            }
            for frame in walk(marker.heap, regs) {
                if !frame.method.is_wedge() {
                    marker.mark_class(frame.method.class);
                }
                marker.mark(frame.monitor);
                for index in frame.locals..frame.sp {
                    let raw = marker.heap.cell(index).raw();
                    marker.mark_raw(raw);
                }
            }
        }
        marker.drain();

        // referents reachable only through weak references are cleared
        let referent = marker.referent as usize;
        for weak in std::mem::take(&mut marker.weak) {
            let value = marker.heap.field(weak, OBJECT_HEADER + referent).reference();
            if !value.is_null() && !marker.heap.is_marked(value) {
                marker
                    .heap
                    .set_field(weak, OBJECT_HEADER + referent, Cell::ZERO);
            }
        }

        let mut unloaded = Vec::new();
        let mut dead_loaders = Vec::new();
        let classes = &self.classes;
        let class_loader = self.known.class_loader;
        let stats = self.heap.sweep(&mut |heap, chunk, kind| match kind {
            AllocKind::ClassData => {
                let id = ClassId(heap.field(chunk, DATA_CLASS_ID).raw() as u32);
                if classes.get(id).is_some_and(|c| c.data == chunk) {
                    unloaded.push(id);
                }
            }
            AllocKind::Object => {
                let id = ClassId(heap.field(chunk, 0).raw() as u32);
                if classes.contains(id) && classes.is_subclass(id, class_loader) {
                    dead_loaders.push(chunk);
                }
            }
            _ => {}
        });

        for loader in dead_loaders {
            self.classes.forget_loader(loader);
        }
        for &id in &unloaded {
            self.unload_class(id);
        }
        debug!(
            "gc #{}: freed {} chunks ({} words), {} live, {} classes unloaded",
            self.gc_cycles,
            stats.freed_chunks,
            stats.freed_words,
            stats.live_chunks,
            unloaded.len()
        );
    }

    /// Unlinks every segment above the one each thread is using; nothing
    /// refers to them once the link is cut.
    fn shrink_stacks(&mut self) {
        for id in self.threads.ids() {
            let regs = self.thread_regs(id);
            if regs.segment.is_null() {
                continue;
            }
            let mut next = self.heap.field(regs.segment, 0).reference();
            let mut released = 0;
            while !next.is_null() {
                released += self.heap.payload_words(next) - 1;
                next = self.heap.field(next, 0).reference();
            }
            self.heap.set_field(regs.segment, 0, Cell::ZERO);
            let thread = &mut self.threads[id];
            thread.stack_cells = thread.stack_cells.saturating_sub(released);
        }
    }
}
