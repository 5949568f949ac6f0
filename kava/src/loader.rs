//! Class loading, linking and unloading.
//!
//! The bootstrap loader is the null reference. Every other loader is a
//! `java.lang.ClassLoader` instance; the classes it defines are appended to
//! its `classes` array so that they stay alive exactly as long as the loader
//! object does.

use std::fs;
use std::path::PathBuf;

use log::{debug, trace, warn};

use crate::Vm;
use crate::cell::{Cell, Ref};
use crate::class::{
    Class, ClassId, ClassKind, ClassState, Code, Constant, DATA_CLASS_ID, DATA_LOADER,
    DATA_MIRROR, DATA_STATICS, ElemType, Field, Method, MethodBody,
};
use crate::classfile::{ClassAccess, ClassFile, ClassFileError, CpInfo, FieldAccess, MethodAccess};
use crate::debug::DebugEvent;
use crate::descriptor::{MethodShape, field_kind};
use crate::error::VmResult;
use crate::heap::AllocKind;

/// Directories searched for `name.class` files.
#[derive(Debug, Clone, Default)]
pub struct ClassPath {
    dirs: Vec<PathBuf>,
}

impl ClassPath {
    pub fn new(entries: &[PathBuf]) -> Self {
        let mut dirs = Vec::with_capacity(entries.len());
        for entry in entries {
            let archive = entry
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("jar") || e.eq_ignore_ascii_case("zip"));
            if archive {
                warn!("skipping classpath entry {}: archives are not supported", entry.display());
                continue;
            }
            dirs.push(entry.clone());
        }
        Self { dirs }
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Bytes of the class file for the internal name `name`.
    pub fn find(&self, name: &str) -> Option<Vec<u8>> {
        if name.is_empty() || name.contains("..") || name.starts_with('/') {
            return None;
        }
        for dir in &self.dirs {
            let path = dir.join(format!("{name}.class"));
            if let Ok(bytes) = fs::read(&path) {
                trace!("found {name} at {}", path.display());
                return Some(bytes);
            }
        }
        None
    }
}

fn runtime_constants(cf: &ClassFile) -> Result<Vec<Constant>, ClassFileError> {
    cf.constant_pool
        .iter()
        .map(|info| {
            Ok(match info {
                CpInfo::Unusable => Constant::Unusable,
                CpInfo::Utf8(text) => Constant::Utf8(text.clone()),
                CpInfo::Integer(v) => Constant::Int(*v),
                CpInfo::Float(v) => Constant::Float(*v),
                CpInfo::Long(v) => Constant::Long(*v),
                CpInfo::Double(v) => Constant::Double(*v),
                CpInfo::Class(name) => Constant::Class {
                    name: cf.utf8(*name)?.to_string(),
                    resolved: None,
                },
                CpInfo::String(text) => Constant::String {
                    text: cf.utf8(*text)?.to_string(),
                    resolved: Ref::NULL,
                },
                CpInfo::FieldRef {
                    class,
                    name_and_type,
                } => {
                    cf.class_name(*class)?;
                    let (name, descriptor) = cf.name_and_type(*name_and_type)?;
                    Constant::Field {
                        class: *class,
                        name: name.to_string(),
                        descriptor: descriptor.to_string(),
                        resolved: None,
                    }
                }
                CpInfo::MethodRef {
                    class,
                    name_and_type,
                }
                | CpInfo::InterfaceMethodRef {
                    class,
                    name_and_type,
                } => {
                    cf.class_name(*class)?;
                    let (name, descriptor) = cf.name_and_type(*name_and_type)?;
                    Constant::Method {
                        class: *class,
                        name: name.to_string(),
                        descriptor: descriptor.to_string(),
                        interface: matches!(info, CpInfo::InterfaceMethodRef { .. }),
                        resolved: None,
                        cache: None,
                        special: None,
                    }
                }
                CpInfo::NameAndType { .. } => Constant::NameAndType,
            })
        })
        .collect()
}

fn runtime_methods(cf: &ClassFile) -> Result<Vec<Method>, ClassFileError> {
    let mut methods = Vec::with_capacity(cf.methods.len());
    for info in &cf.methods {
        let name = cf.utf8(info.name)?.to_string();
        let descriptor = cf.utf8(info.descriptor)?.to_string();
        let shape = MethodShape::parse(&descriptor)
            .ok_or(ClassFileError::Malformed("bad method descriptor"))?;
        let is_static = info.access.contains(MethodAccess::STATIC);
        let arg_cells = shape.param_cells() + usize::from(!is_static);
        if arg_cells > 255 {
            return Err(ClassFileError::Malformed("too many argument cells"));
        }
        let (body, max_locals, max_stack) = if info.access.contains(MethodAccess::NATIVE) {
            (MethodBody::Native(None), arg_cells as u16, 0)
        } else if info.access.contains(MethodAccess::ABSTRACT) {
            (MethodBody::Abstract, arg_cells as u16, 0)
        } else {
            let code = info
                .code
                .as_ref()
                .ok_or(ClassFileError::Malformed("method without Code attribute"))?;
            if code.code.is_empty() {
                return Err(ClassFileError::Malformed("empty Code attribute"));
            }
            let len = code.code.len();
            if code.exception_table.iter().any(|e| {
                e.start_pc >= e.end_pc || e.end_pc as usize > len || e.handler_pc as usize >= len
            }) {
                return Err(ClassFileError::Malformed("exception table out of range"));
            }
            let body = MethodBody::Bytecode(Code {
                bytes: code.code.clone(),
                handlers: code.exception_table.clone(),
                lines: code.line_numbers.clone(),
            });
            (body, code.max_locals, code.max_stack)
        };
        methods.push(Method {
            name,
            descriptor,
            access: info.access,
            arg_cells: arg_cells as u16,
            ret_cells: shape.ret_cells() as u8,
            max_locals,
            max_stack,
            body,
        });
    }
    Ok(methods)
}

impl Vm {
    // ── lookup ─────────────────────────────────────────────────────

    /// Loads `name` (internal form) through `loader`, throwing
    /// `NoClassDefFoundError` when no loader in the delegation chain has it.
    pub fn load_class(&mut self, name: &str, loader: Ref) -> VmResult<ClassId> {
        match self.find_class(name, loader)? {
            Some(id) => Ok(id),
            None => Err(self.throw_new("java/lang/NoClassDefFoundError", Some(&name.replace('/', ".")))),
        }
    }

    /// Parent-first delegation. `None` when the class exists nowhere.
    pub(crate) fn find_class(&mut self, name: &str, loader: Ref) -> VmResult<Option<ClassId>> {
        if let Some(id) = self.classes.lookup(name, loader) {
            return Ok(Some(id));
        }
        if name.starts_with('[') {
            return self.load_array_class(name, loader).map(Some);
        }
        if loader.is_null() {
            return match self.boot_classpath.find(name) {
                Some(bytes) => self.define_class_bytes(&bytes, Ref::NULL).map(Some),
                None => Ok(None),
            };
        }
        let parent = self.ref_field(loader, self.known.loader_parent);
        if let Some(id) = self.find_class(name, parent)? {
            self.classes.record_initiating(name, loader, id);
            return Ok(Some(id));
        }
        if loader == self.app_loader {
            if let Some(bytes) = self.classpath.find(name) {
                return self.define_class_bytes(&bytes, loader).map(Some);
            }
        }
        Ok(None)
    }

    /// Array class whose component is `component`.
    pub fn array_class_of(&mut self, component: ClassId) -> VmResult<ClassId> {
        let class = &self.classes[component];
        let name = match class.kind {
            ClassKind::Array { .. } => format!("[{}", class.name),
            ClassKind::Primitive(elem) => format!("[{}", elem.descriptor()),
            ClassKind::Instance => format!("[L{};", class.name),
        };
        let loader = class.loader;
        self.load_array_class(&name, loader)
    }

    /// Array class for a primitive element type.
    pub(crate) fn primitive_array_class(&mut self, elem: ElemType) -> VmResult<ClassId> {
        if elem == ElemType::Char && self.known.char_array != ClassId::default() {
            return Ok(self.known.char_array);
        }
        self.load_array_class(&format!("[{}", elem.descriptor()), Ref::NULL)
    }

    fn load_array_class(&mut self, name: &str, loader: Ref) -> VmResult<ClassId> {
        if let Some(id) = self.classes.lookup(name, loader) {
            return Ok(id);
        }
        let element = &name[1..];
        let tag = element.as_bytes().first().copied().unwrap_or(0);
        let (elem, component) = match tag {
            b'L' => {
                let Some(inner) = element.strip_prefix('L').and_then(|e| e.strip_suffix(';')) else {
                    return Err(self.throw_new("java/lang/NoClassDefFoundError", Some(name)));
                };
                (ElemType::Reference, Some(self.load_class(inner, loader)?))
            }
            b'[' => (ElemType::Reference, Some(self.load_class(element, loader)?)),
            _ => match ElemType::from_descriptor(tag) {
                Some(elem) if element.len() == 1 => (elem, None),
                _ => return Err(self.throw_new("java/lang/NoClassDefFoundError", Some(name))),
            },
        };
        let defining = component.map_or(Ref::NULL, |c| self.classes[c].loader);
        if let Some(id) = self.classes.lookup(name, defining) {
            self.classes.record_initiating(name, loader, id);
            return Ok(id);
        }

        let access = match component {
            Some(c) => self.classes[c].access & ClassAccess::PUBLIC,
            None => ClassAccess::PUBLIC,
        } | ClassAccess::FINAL
            | ClassAccess::ABSTRACT;
        let mut class = Class {
            id: self.classes.next_id(),
            name: name.to_string(),
            kind: ClassKind::Array { elem, component },
            access,
            super_class: Some(self.known.object),
            interfaces: vec![self.known.cloneable, self.known.serializable],
            fields: Vec::new(),
            methods: Vec::new(),
            constants: Vec::new(),
            loader: defining,
            state: ClassState::Initialized,
            data: Ref::NULL,
            instance_cells: 0,
            ref_slots: Vec::new(),
            static_cells: 0,
            static_ref_slots: Vec::new(),
            source_file: None,
            weak: false,
        };
        self.scoped(|vm| {
            let data = vm.new_class_data(class.id, defining, 0)?;
            vm.root(data)?;
            class.data = data;
            let id = vm.classes.insert(class);
            if !defining.is_null() {
                vm.register_with_loader(id, defining)?;
            }
            if loader != defining {
                vm.classes.record_initiating(name, loader, id);
            }
            trace!("created array class {name}");
            Ok(id)
        })
    }

    /// Defines one of the primitive pseudo-classes (`int`, `boolean`, ...).
    pub(crate) fn define_primitive_class(&mut self, elem: ElemType) -> VmResult<ClassId> {
        let id = self.classes.next_id();
        let data = self.new_class_data(id, Ref::NULL, 0)?;
        self.classes.insert(Class {
            id,
            name: elem.primitive_name().to_string(),
            kind: ClassKind::Primitive(elem),
            access: ClassAccess::PUBLIC | ClassAccess::FINAL | ClassAccess::ABSTRACT,
            super_class: None,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            constants: Vec::new(),
            loader: Ref::NULL,
            state: ClassState::Initialized,
            data,
            instance_cells: 0,
            ref_slots: Vec::new(),
            static_cells: 0,
            static_ref_slots: Vec::new(),
            source_file: None,
            weak: false,
        });
        Ok(id)
    }

    fn new_class_data(&mut self, id: ClassId, loader: Ref, static_cells: usize) -> VmResult<Ref> {
        let data = self.allocate(DATA_STATICS + static_cells, AllocKind::ClassData)?;
        self.heap.set_field(data, DATA_CLASS_ID, Cell(id.0 as u64));
        self.heap.set_field(data, DATA_LOADER, Cell::from_ref(loader));
        Ok(data)
    }

    // ── definition ─────────────────────────────────────────────────

    pub fn define_class_bytes(&mut self, bytes: &[u8], loader: Ref) -> VmResult<ClassId> {
        match ClassFile::parse(bytes) {
            Ok(cf) => self.define_class(&cf, loader),
            Err(e) => Err(self.class_file_error(e)),
        }
    }

    fn class_file_error(&mut self, e: ClassFileError) -> crate::error::VmError {
        let class = match e {
            ClassFileError::UnsupportedVersion { .. } => "java/lang/UnsupportedClassVersionError",
            _ => "java/lang/ClassFormatError",
        };
        self.throw_new(class, Some(&e.to_string()))
    }

    /// Defines and links a class in `loader`, which the caller keeps
    /// reachable. Statics are prepared; initialization happens on first
    /// active use.
    pub fn define_class(&mut self, cf: &ClassFile, loader: Ref) -> VmResult<ClassId> {
        let name = match cf.name() {
            Ok(name) => name.to_string(),
            Err(e) => return Err(self.class_file_error(e)),
        };
        if self.classes.lookup(&name, loader).is_some() {
            return Err(self.throw_new(
                "java/lang/LinkageError",
                Some(&format!("duplicate class definition for {}", name.replace('/', "."))),
            ));
        }
        if self.loading.iter().any(|(n, l)| *n == name && *l == loader) {
            return Err(self.throw_new("java/lang/ClassCircularityError", Some(&name.replace('/', "."))));
        }
        self.loading.push((name.clone(), loader));
        let result = self.scoped(|vm| vm.link_class(cf, &name, loader));
        self.loading.pop();
        result
    }

    fn link_class(&mut self, cf: &ClassFile, name: &str, loader: Ref) -> VmResult<ClassId> {
        let parsed = runtime_constants(cf).and_then(|constants| {
            let methods = runtime_methods(cf)?;
            let super_name = cf.super_name()?.map(str::to_string);
            let interfaces = cf
                .interfaces
                .iter()
                .map(|&i| cf.class_name(i).map(str::to_string))
                .collect::<Result<Vec<_>, _>>()?;
            let source_file = cf.source_file.map(|i| cf.utf8(i).map(str::to_string)).transpose()?;
            Ok((constants, methods, super_name, interfaces, source_file))
        });
        let (constants, methods, super_name, interface_names, source_file) = match parsed {
            Ok(parts) => parts,
            Err(e) => return Err(self.class_file_error(e)),
        };

        let super_class = match super_name {
            Some(super_name) => {
                let id = self.load_class(&super_name, loader)?;
                let super_entry = &self.classes[id];
                if super_entry.is_interface() || super_entry.is_array() {
                    return Err(self.throw_new(
                        "java/lang/IncompatibleClassChangeError",
                        Some(&format!("{} has interface {} as super class", name, super_name)),
                    ));
                }
                if super_entry.access.contains(ClassAccess::FINAL) {
                    return Err(self.throw_new(
                        "java/lang/VerifyError",
                        Some(&format!("{name} cannot inherit from final class {super_name}")),
                    ));
                }
                Some(id)
            }
            None if name == "java/lang/Object" => None,
            None => {
                return Err(self.throw_new("java/lang/ClassFormatError", Some(&format!("{name} has no super class"))));
            }
        };

        let mut interfaces = Vec::with_capacity(interface_names.len());
        for iface in &interface_names {
            let id = self.load_class(iface, loader)?;
            if !self.classes[id].is_interface() {
                return Err(self.throw_new(
                    "java/lang/IncompatibleClassChangeError",
                    Some(&format!("{name} implements non-interface {iface}")),
                ));
            }
            interfaces.push(id);
        }

        // Layout: inherited instance cells first.
        let (mut instance_cells, mut ref_slots, weak) = match super_class {
            Some(s) => {
                let s = &self.classes[s];
                (s.instance_cells, s.ref_slots.clone(), s.weak)
            }
            None => (0, Vec::new(), false),
        };
        let mut static_cells = 0u32;
        let mut static_ref_slots = Vec::new();
        let mut fields = Vec::with_capacity(cf.fields.len());
        for info in &cf.fields {
            let (field_name, descriptor) = match (cf.utf8(info.name), cf.utf8(info.descriptor)) {
                (Ok(n), Ok(d)) => (n.to_string(), d.to_string()),
                (Err(e), _) | (_, Err(e)) => return Err(self.class_file_error(e)),
            };
            let Some(kind) = field_kind(&descriptor) else {
                return Err(self.class_file_error(ClassFileError::Malformed("bad field descriptor")));
            };
            let slot = if info.access.contains(FieldAccess::STATIC) {
                let slot = static_cells;
                static_cells += kind.cells() as u32;
                if kind.is_reference() {
                    static_ref_slots.push(slot);
                }
                slot
            } else {
                let slot = instance_cells;
                instance_cells += kind.cells() as u32;
                if kind.is_reference() {
                    ref_slots.push(slot);
                }
                slot
            };
            fields.push(Field {
                name: field_name,
                descriptor,
                access: info.access,
                kind,
                slot,
                constant_value: info.constant_value,
            });
        }

        let id = self.classes.next_id();
        let data = self.new_class_data(id, loader, static_cells as usize)?;
        self.root(data)?;
        let class = Class {
            id,
            name: name.to_string(),
            kind: ClassKind::Instance,
            access: cf.access,
            super_class,
            interfaces,
            fields,
            methods,
            constants,
            loader,
            state: ClassState::Loaded,
            data,
            instance_cells,
            ref_slots,
            static_cells,
            static_ref_slots,
            source_file,
            weak: weak || name == "java/lang/ref/WeakReference",
        };
        self.classes.insert(class);
        self.prepare_constant_statics(id)?;
        if !loader.is_null() {
            self.register_with_loader(id, loader)?;
        }

        debug!(
            "defined {} ({} instance cells, {} static cells, loader {:?})",
            name, instance_cells, static_cells, loader
        );
        self.post_event(DebugEvent::ClassPrepare {
            class: id,
            name: name.to_string(),
        });
        Ok(id)
    }

    /// Stores `ConstantValue` attributes into their static cells.
    fn prepare_constant_statics(&mut self, id: ClassId) -> VmResult<()> {
        let class = &self.classes[id];
        let pending: Vec<(u32, Constant)> = class
            .fields
            .iter()
            .filter(|f| f.is_static())
            .filter_map(|f| {
                let index = f.constant_value? as usize;
                class.constants.get(index).map(|c| (f.slot, c.clone()))
            })
            .collect();
        let data = class.data;
        for (slot, constant) in pending {
            let value = match constant {
                Constant::Int(v) => Cell::from_int(v),
                Constant::Float(v) => Cell::from_float(v),
                Constant::Long(v) => Cell::from_long(v),
                Constant::Double(v) => Cell::from_double(v),
                Constant::String { text, .. } => Cell::from_ref(self.intern(&text)?),
                _ => {
                    return Err(self.throw_new("java/lang/ClassFormatError", Some("bad ConstantValue attribute")));
                }
            };
            self.heap.set_field(data, DATA_STATICS + slot as usize, value);
        }
        Ok(())
    }

    // ── loaders and mirrors ────────────────────────────────────────

    /// Creates a class loader delegating to `parent` (null for the
    /// bootstrap loader). Classes enter it only through [`Vm::define_class`].
    pub fn new_class_loader(&mut self, parent: Ref) -> VmResult<Ref> {
        let loader = self.new_object(self.known.class_loader)?;
        self.set_ref_field(loader, self.known.loader_parent, parent);
        Ok(loader)
    }

    /// The `java.lang.Class` object of `class`, created on first use.
    pub(crate) fn mirror_of(&mut self, class: ClassId) -> VmResult<Ref> {
        let data = self.classes[class].data;
        let mirror = self.heap.field(data, DATA_MIRROR).reference();
        if !mirror.is_null() {
            return Ok(mirror);
        }
        let mirror = self.new_object(self.known.class)?;
        self.set_ref_field(mirror, self.known.class_data, data);
        self.heap.set_field(data, DATA_MIRROR, Cell::from_ref(mirror));
        Ok(mirror)
    }

    /// Class named by a `java.lang.Class` object.
    pub(crate) fn class_of_mirror(&self, mirror: Ref) -> Option<ClassId> {
        let data = self.ref_field(mirror, self.known.class_data).non_null()?;
        let id = ClassId(self.heap.field(data, DATA_CLASS_ID).raw() as u32);
        self.classes.contains(id).then_some(id)
    }

    /// Appends the mirror of `class` to `loader`'s class array, growing it
    /// as needed.
    fn register_with_loader(&mut self, class: ClassId, loader: Ref) -> VmResult<()> {
        self.scoped(|vm| {
            vm.root(loader)?;
            let mirror = vm.mirror_of(class)?;
            vm.root(mirror)?;
            let count = vm.int_field(loader, vm.known.loader_count) as usize;
            let mut array = vm.ref_field(loader, vm.known.loader_classes);
            let capacity = if array.is_null() { 0 } else { vm.array_length(array) };
            if count >= capacity {
                let object_array = vm.array_class_of(vm.known.class)?;
                let grown = vm.new_ref_array(object_array, (capacity * 2).max(8))?;
                if !array.is_null() {
                    vm.heap.copy_cells(array.index() + 2, grown.index() + 2, count);
                }
                vm.set_ref_field(loader, vm.known.loader_classes, grown);
                array = grown;
            }
            vm.array_store_ref(array, count, mirror);
            vm.set_int_field(loader, vm.known.loader_count, count as i32 + 1);
            Ok(())
        })
    }

    // ── unloading ──────────────────────────────────────────────────

    /// Drops a class whose metadata chunk the collector freed.
    pub(crate) fn unload_class(&mut self, id: ClassId) {
        let Some(class) = self.classes.remove(id) else {
            return;
        };
        if let Some(debugger) = &mut self.debugger {
            debugger.forget_class(id);
        }
        debug!("unloaded {}", class.name);
        if let Some(debugger) = &mut self.debugger {
            debugger.queue(DebugEvent::ClassUnload { name: class.name });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ClassBuilder;
    use crate::config::VmSettings;
    use crate::error::VmError;

    fn vm() -> Vm {
        Vm::new(VmSettings::default()).unwrap()
    }

    fn thrown_class(vm: &Vm, result: VmResult<ClassId>) -> String {
        match result {
            Err(VmError::Throw(t)) => vm.classes[vm.class_of(t)].name.clone(),
            other => panic!("expected a throw, got {other:?}"),
        }
    }

    #[test]
    fn archives_are_skipped() {
        let path = ClassPath::new(&["lib/a.jar".into(), "classes".into(), "b.ZIP".into()]);
        assert_eq!(path.len(), 1);
    }

    #[test]
    fn layout_inherits_super_cells() {
        let mut vm = vm();
        let mut a = ClassBuilder::new("p/A", Some("java/lang/Object"));
        a.field(FieldAccess::PRIVATE, "x", "J")
            .field(FieldAccess::PRIVATE, "o", "Ljava/lang/Object;");
        let a = vm.define_class(&a.build(), Ref::NULL).unwrap();
        let mut b = ClassBuilder::new("p/B", Some("p/A"));
        b.field(FieldAccess::PUBLIC, "s", "Ljava/lang/String;")
            .field(FieldAccess::STATIC, "count", "I");
        let b = vm.define_class(&b.build(), Ref::NULL).unwrap();

        assert_eq!(vm.classes[a].instance_cells, 3);
        assert_eq!(vm.classes[a].ref_slots, vec![2]);
        let b = &vm.classes[b];
        assert_eq!(b.instance_cells, 4);
        assert_eq!(b.ref_slots, vec![2, 3]);
        assert_eq!(b.static_cells, 1);
        assert!(b.static_ref_slots.is_empty());
    }

    #[test]
    fn constant_values_are_prepared() {
        let mut vm = vm();
        let mut c = ClassBuilder::new("p/K", Some("java/lang/Object"));
        c.constant_field(FieldAccess::PUBLIC, "N", "I", crate::builder::ConstValue::Int(42))
            .constant_field(
                FieldAccess::PUBLIC,
                "S",
                "Ljava/lang/String;",
                crate::builder::ConstValue::String("hi"),
            );
        let id = vm.define_class(&c.build(), Ref::NULL).unwrap();
        let data = vm.classes[id].data;
        assert_eq!(vm.heap.field(data, DATA_STATICS).int(), 42);
        let s = vm.heap.field(data, DATA_STATICS + 1).reference();
        assert_eq!(vm.string_value(s), "hi");
        assert_eq!(s, vm.intern("hi").unwrap());
    }

    #[test]
    fn array_classes_follow_their_component() {
        let mut vm = vm();
        let ints = vm.load_class("[I", Ref::NULL).unwrap();
        assert!(matches!(
            vm.classes[ints].kind,
            ClassKind::Array {
                elem: ElemType::Int,
                component: None
            }
        ));
        let nested = vm.load_class("[[Ljava/lang/String;", vm.app_loader).unwrap();
        assert_eq!(vm.classes[nested].loader, Ref::NULL);
        assert_eq!(vm.load_class("[[Ljava/lang/String;", Ref::NULL).unwrap(), nested);
        let string_array = vm.array_class_of(vm.known.string).unwrap();
        assert_eq!(vm.classes[string_array].name, "[Ljava/lang/String;");
    }

    #[test]
    fn missing_and_malformed_classes_throw() {
        let mut vm = vm();
        let missing = vm.load_class("no/Such", vm.app_loader);
        assert_eq!(thrown_class(&vm, missing), "java/lang/NoClassDefFoundError");

        let garbage = vm.define_class_bytes(&[0xca, 0xfe, 0xba, 0xbe, 0, 0], Ref::NULL);
        assert_eq!(thrown_class(&vm, garbage), "java/lang/ClassFormatError");

        let mut cf = ClassBuilder::new("p/New", Some("java/lang/Object")).build();
        cf.major_version = 51;
        let bytes = cf.to_bytes();
        let too_new = vm.define_class_bytes(&bytes, Ref::NULL);
        assert_eq!(thrown_class(&vm, too_new), "java/lang/UnsupportedClassVersionError");
    }

    #[test]
    fn duplicate_definition_is_a_linkage_error() {
        let mut vm = vm();
        let cf = ClassBuilder::new("p/Twice", Some("java/lang/Object")).build();
        vm.define_class(&cf, Ref::NULL).unwrap();
        let again = vm.define_class(&cf, Ref::NULL);
        assert_eq!(thrown_class(&vm, again), "java/lang/LinkageError");
    }

    #[test]
    fn final_and_interface_supers_are_rejected() {
        let mut vm = vm();
        let sub = ClassBuilder::new("p/S", Some("java/lang/String")).build();
        let result = vm.define_class(&sub, Ref::NULL);
        assert_eq!(thrown_class(&vm, result), "java/lang/VerifyError");

        let bad = ClassBuilder::new("p/R", Some("java/lang/Runnable")).build();
        let result = vm.define_class(&bad, Ref::NULL);
        assert_eq!(thrown_class(&vm, result), "java/lang/IncompatibleClassChangeError");
    }

    #[test]
    fn custom_loaders_delegate_and_register() {
        let mut vm = vm();
        let loader = vm.new_class_loader(Ref::NULL).unwrap();
        vm.root_permanent(loader).unwrap();
        let cf = ClassBuilder::new("p/Mine", Some("java/lang/Object")).build();
        let mine = vm.define_class(&cf, loader).unwrap();
        assert_eq!(vm.classes[mine].loader, loader);
        assert_eq!(vm.find_class("java/lang/String", loader).unwrap(), Some(vm.known.string));
        assert_eq!(vm.int_field(loader, vm.known.loader_count), 1);
        let mirror = vm.mirror_of(mine).unwrap();
        assert_eq!(vm.class_of_mirror(mirror), Some(mine));
        // invisible to the application loader
        assert_eq!(vm.find_class("p/Mine", vm.app_loader).unwrap(), None);
    }
}
