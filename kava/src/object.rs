//! Objects, arrays and strings on the heap.
//!
//! Payload word 0 of every instance holds its class id. Instance fields follow
//! from word 1. Arrays keep their length in word 1 and elements from word 2;
//! primitive elements are packed at their natural width.

use crate::Vm;
use crate::cell::{Cell, Ref};
use crate::class::{ClassId, ClassKind, DATA_STATICS, ElemType};
use crate::error::VmResult;
use crate::heap::{AllocKind, WORD_BYTES};

pub const OBJECT_HEADER: usize = 1;
pub const ARRAY_HEADER: usize = 2;

impl Vm {
    // ── instances ──────────────────────────────────────────────────

    pub fn new_object(&mut self, class: ClassId) -> VmResult<Ref> {
        let c = &self.classes[class];
        let kind = if c.weak { AllocKind::WeakRef } else { AllocKind::Object };
        let words = OBJECT_HEADER + c.instance_cells as usize;
        let object = self.allocate(words, kind)?;
        self.heap.set_field(object, 0, Cell(class.0 as u64));
        Ok(object)
    }

    #[inline]
    pub fn class_of(&self, object: Ref) -> ClassId {
        ClassId(self.heap.field(object, 0).raw() as u32)
    }

    #[inline]
    pub(crate) fn field_cell(&self, object: Ref, slot: u32) -> Cell {
        self.heap.field(object, OBJECT_HEADER + slot as usize)
    }

    #[inline]
    pub(crate) fn set_field_cell(&mut self, object: Ref, slot: u32, value: Cell) {
        self.heap.set_field(object, OBJECT_HEADER + slot as usize, value);
    }

    pub(crate) fn ref_field(&self, object: Ref, slot: u32) -> Ref {
        self.field_cell(object, slot).reference()
    }

    pub(crate) fn set_ref_field(&mut self, object: Ref, slot: u32, value: Ref) {
        self.set_field_cell(object, slot, Cell::from_ref(value));
    }

    pub(crate) fn int_field(&self, object: Ref, slot: u32) -> i32 {
        self.field_cell(object, slot).int()
    }

    pub(crate) fn set_int_field(&mut self, object: Ref, slot: u32, value: i32) {
        self.set_field_cell(object, slot, Cell::from_int(value));
    }

    /// Slot of the instance field `name` declared by `class` or a superclass.
    pub(crate) fn instance_slot(&self, class: ClassId, name: &str) -> Option<u32> {
        let mut cursor = Some(class);
        while let Some(id) = cursor {
            let c = &self.classes[id];
            if let Some(field) = c.fields.iter().find(|f| f.name == name && !f.is_static()) {
                return Some(field.slot);
            }
            cursor = c.super_class;
        }
        None
    }

    /// Metadata offset of the static field `name` declared by `class`.
    fn static_offset(&self, class: ClassId, name: &str) -> Option<usize> {
        self.classes[class]
            .fields
            .iter()
            .find(|f| f.is_static() && f.name == name)
            .map(|f| DATA_STATICS + f.slot as usize)
    }

    pub(crate) fn static_ref(&self, class: ClassId, name: &str) -> Ref {
        match self.static_offset(class, name) {
            Some(offset) => self.heap.field(self.classes[class].data, offset).reference(),
            None => Ref::NULL,
        }
    }

    pub(crate) fn set_static_ref(&mut self, class: ClassId, name: &str, value: Ref) {
        if let Some(offset) = self.static_offset(class, name) {
            let data = self.classes[class].data;
            self.heap.set_field(data, offset, Cell::from_ref(value));
        }
    }

    // ── arrays ─────────────────────────────────────────────────────

    /// Allocates a zeroed array of `class` (an array class).
    pub fn new_array(&mut self, class: ClassId, length: usize) -> VmResult<Ref> {
        match self.classes[class].kind {
            ClassKind::Array {
                elem: ElemType::Reference,
                ..
            } => self.new_ref_array(class, length),
            ClassKind::Array { elem, .. } => self.new_prim_array(class, elem, length),
            _ => Err(crate::error::VmError::internal(format!(
                "{} is not an array class",
                self.classes[class].name
            ))),
        }
    }

    pub fn new_ref_array(&mut self, class: ClassId, length: usize) -> VmResult<Ref> {
        let array = match ARRAY_HEADER.checked_add(length) {
            Some(words) => self.allocate(words, AllocKind::RefArray)?,
            None => return Err(self.out_of_memory()),
        };
        self.heap.set_field(array, 0, Cell(class.0 as u64));
        self.heap.set_field(array, 1, Cell::from_int(length as i32));
        Ok(array)
    }

    fn new_prim_array(&mut self, class: ClassId, elem: ElemType, length: usize) -> VmResult<Ref> {
        let words = length
            .checked_mul(elem.width())
            .map(|bytes| ARRAY_HEADER + bytes.div_ceil(WORD_BYTES));
        let array = match words {
            Some(words) => self.allocate(words, AllocKind::PrimArray)?,
            None => return Err(self.out_of_memory()),
        };
        self.heap.set_field(array, 0, Cell(class.0 as u64));
        self.heap.set_field(array, 1, Cell::from_int(length as i32));
        Ok(array)
    }

    #[inline]
    pub fn array_length(&self, array: Ref) -> usize {
        self.heap.field(array, 1).int() as usize
    }

    pub(crate) fn array_elem(&self, array: Ref) -> ElemType {
        match self.classes[self.class_of(array)].kind {
            ClassKind::Array { elem, .. } => elem,
            _ => ElemType::Reference,
        }
    }

    #[inline]
    fn elements(array: Ref) -> usize {
        array.index() + ARRAY_HEADER
    }

    pub fn array_load_ref(&self, array: Ref, index: usize) -> Ref {
        self.heap.cell(Self::elements(array) + index).reference()
    }

    pub fn array_store_ref(&mut self, array: Ref, index: usize, value: Ref) {
        self.heap
            .set_cell(Self::elements(array) + index, Cell::from_ref(value));
    }

    /// Element `index` widened to its stack form.
    pub(crate) fn array_load(&self, array: Ref, elem: ElemType, index: usize) -> Cell {
        if elem == ElemType::Reference {
            return self.heap.cell(Self::elements(array) + index);
        }
        let raw = self
            .heap
            .load_packed(Self::elements(array), index, elem.width());
        elem.to_cell(raw)
    }

    pub(crate) fn array_store(&mut self, array: Ref, elem: ElemType, index: usize, value: Cell) {
        if elem == ElemType::Reference {
            self.heap.set_cell(Self::elements(array) + index, value);
            return;
        }
        let raw = match elem {
            ElemType::Boolean => (value.int() & 1) as u64,
            _ => value.raw(),
        };
        self.heap
            .store_packed(Self::elements(array), index, elem.width(), raw);
    }

    /// Copies `count` elements between arrays of the same element type,
    /// handling overlap.
    pub(crate) fn array_copy(
        &mut self,
        src: Ref,
        src_pos: usize,
        dst: Ref,
        dst_pos: usize,
        count: usize,
    ) {
        let elem = self.array_elem(src);
        if src == dst && src_pos < dst_pos {
            for i in (0..count).rev() {
                let value = self.array_load(src, elem, src_pos + i);
                self.array_store(dst, elem, dst_pos + i, value);
            }
        } else {
            for i in 0..count {
                let value = self.array_load(src, elem, src_pos + i);
                self.array_store(dst, elem, dst_pos + i, value);
            }
        }
    }

    /// Shallow copy of an object or array.
    pub(crate) fn shallow_clone(&mut self, object: Ref) -> VmResult<Ref> {
        let words = self.heap.payload_words(object);
        let kind = self.heap.kind(object);
        let copy = self.allocate(words, kind)?;
        self.heap.copy_cells(object.index(), copy.index(), words);
        Ok(copy)
    }

    // ── assignability ──────────────────────────────────────────────

    /// Can a value of class `from` be stored where `to` is expected?
    pub fn is_assignable(&self, from: ClassId, to: ClassId) -> bool {
        if from == to {
            return true;
        }
        let source = &self.classes[from];
        let target = &self.classes[to];
        match (source.kind, target.kind) {
            (ClassKind::Array { .. }, ClassKind::Instance) => {
                to == self.known.object || to == self.known.cloneable || to == self.known.serializable
            }
            (
                ClassKind::Array {
                    elem: from_elem,
                    component: from_component,
                },
                ClassKind::Array {
                    elem: to_elem,
                    component: to_component,
                },
            ) => match (from_component, to_component) {
                (Some(f), Some(t)) => self.is_assignable(f, t),
                (None, None) => from_elem == to_elem,
                _ => false,
            },
            (ClassKind::Instance, ClassKind::Instance) if target.is_interface() => {
                self.classes.implements(from, to)
            }
            (ClassKind::Instance, ClassKind::Instance) => {
                (!source.is_interface() && self.classes.is_subclass(from, to))
                    || (source.is_interface() && to == self.known.object)
            }
            _ => false,
        }
    }

    pub fn instance_of(&self, object: Ref, class: ClassId) -> bool {
        !object.is_null() && self.is_assignable(self.class_of(object), class)
    }

    // ── strings ────────────────────────────────────────────────────

    /// A fresh, uninterned `java.lang.String`.
    pub fn new_string(&mut self, text: &str) -> VmResult<Ref> {
        let units: Vec<u16> = text.encode_utf16().collect();
        self.new_string_utf16(&units)
    }

    pub(crate) fn new_string_utf16(&mut self, units: &[u16]) -> VmResult<Ref> {
        self.scoped(|vm| {
            let char_array = vm.primitive_array_class(ElemType::Char)?;
            let value = vm.new_array(char_array, units.len())?;
            vm.root(value)?;
            for (i, &unit) in units.iter().enumerate() {
                vm.heap
                    .store_packed(Self::elements(value), i, 2, unit as u64);
            }
            let string = vm.new_object(vm.known.string)?;
            vm.set_ref_field(string, vm.known.string_value, value);
            Ok(string)
        })
    }

    pub(crate) fn string_units(&self, string: Ref) -> Vec<u16> {
        let value = self.ref_field(string, self.known.string_value);
        if value.is_null() {
            return Vec::new();
        }
        (0..self.array_length(value))
            .map(|i| self.heap.load_packed(Self::elements(value), i, 2) as u16)
            .collect()
    }

    /// Rust copy of a `java.lang.String`; null reads as `"null"`.
    pub fn string_value(&self, string: Ref) -> String {
        if string.is_null() {
            return "null".to_string();
        }
        String::from_utf16_lossy(&self.string_units(string))
    }

    /// The canonical string for `text`, created and pinned on first use.
    pub fn intern(&mut self, text: &str) -> VmResult<Ref> {
        if let Some(&string) = self.strings.get(text) {
            return Ok(string);
        }
        let string = self.new_string(text)?;
        self.root_permanent(string)?;
        self.strings.insert(text.to_string(), string);
        Ok(string)
    }
}
