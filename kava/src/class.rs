//! Runtime class model and the global class pool.

use std::ops::{Index, IndexMut};

use rustc_hash::FxHashMap;

use crate::cell::{Cell, Ref};
use crate::classfile::{ClassAccess, ExceptionEntry, FieldAccess, LineNumber, MethodAccess};
use crate::descriptor::ValueKind;
use crate::natives::NativeFn;
use crate::opcodes::{T_BOOLEAN, T_BYTE, T_CHAR, T_DOUBLE, T_FLOAT, T_INT, T_LONG, T_SHORT};
use crate::thread::ThreadId;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

impl ClassId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A method, named by its class and its position in the method table.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct MethodId {
    pub class: ClassId,
    pub index: u32,
}

impl MethodId {
    /// The callback-wedge pseudo-method.
    pub const WEDGE: MethodId = MethodId {
        class: ClassId(u32::MAX),
        index: 0,
    };

    pub fn new(class: ClassId, index: usize) -> Self {
        Self {
            class,
            index: index as u32,
        }
    }

    #[inline]
    pub fn is_wedge(self) -> bool {
        self.class.0 == u32::MAX
    }

    pub fn to_cell(self) -> Cell {
        Cell(((self.class.0 as u64) << 32) | self.index as u64)
    }

    pub fn from_cell(cell: Cell) -> Self {
        Self {
            class: ClassId((cell.0 >> 32) as u32),
            index: cell.0 as u32,
        }
    }
}

/// Element storage of arrays; also the primitive classes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ElemType {
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
    Reference,
}

impl ElemType {
    pub const PRIMITIVES: [ElemType; 8] = [
        ElemType::Boolean,
        ElemType::Char,
        ElemType::Float,
        ElemType::Double,
        ElemType::Byte,
        ElemType::Short,
        ElemType::Int,
        ElemType::Long,
    ];

    /// `newarray` operand codes.
    pub fn from_atype(atype: u8) -> Option<Self> {
        Some(match atype {
            T_BOOLEAN => ElemType::Boolean,
            T_CHAR => ElemType::Char,
            T_FLOAT => ElemType::Float,
            T_DOUBLE => ElemType::Double,
            T_BYTE => ElemType::Byte,
            T_SHORT => ElemType::Short,
            T_INT => ElemType::Int,
            T_LONG => ElemType::Long,
            _ => return None,
        })
    }

    pub fn from_descriptor(tag: u8) -> Option<Self> {
        Some(match tag {
            b'Z' => ElemType::Boolean,
            b'C' => ElemType::Char,
            b'F' => ElemType::Float,
            b'D' => ElemType::Double,
            b'B' => ElemType::Byte,
            b'S' => ElemType::Short,
            b'I' => ElemType::Int,
            b'J' => ElemType::Long,
            b'L' | b'[' => ElemType::Reference,
            _ => return None,
        })
    }

    pub fn descriptor(self) -> char {
        match self {
            ElemType::Boolean => 'Z',
            ElemType::Char => 'C',
            ElemType::Float => 'F',
            ElemType::Double => 'D',
            ElemType::Byte => 'B',
            ElemType::Short => 'S',
            ElemType::Int => 'I',
            ElemType::Long => 'J',
            ElemType::Reference => 'L',
        }
    }

    pub fn primitive_name(self) -> &'static str {
        match self {
            ElemType::Boolean => "boolean",
            ElemType::Char => "char",
            ElemType::Float => "float",
            ElemType::Double => "double",
            ElemType::Byte => "byte",
            ElemType::Short => "short",
            ElemType::Int => "int",
            ElemType::Long => "long",
            ElemType::Reference => "reference",
        }
    }

    /// Packed element width in bytes.
    pub fn width(self) -> usize {
        match self {
            ElemType::Boolean | ElemType::Byte => 1,
            ElemType::Char | ElemType::Short => 2,
            ElemType::Float | ElemType::Int => 4,
            ElemType::Double | ElemType::Long | ElemType::Reference => 8,
        }
    }

    /// Widens a raw packed element to its stack form.
    pub fn to_cell(self, raw: u64) -> Cell {
        match self {
            ElemType::Byte => Cell::from_int(raw as u8 as i8 as i32),
            ElemType::Short => Cell::from_int(raw as u16 as i16 as i32),
            ElemType::Boolean | ElemType::Char | ElemType::Int | ElemType::Float => {
                Cell(raw & 0xffff_ffff)
            }
            ElemType::Long | ElemType::Double | ElemType::Reference => Cell(raw),
        }
    }

    pub fn value_kind(self) -> ValueKind {
        match self {
            ElemType::Long => ValueKind::Long,
            ElemType::Double => ValueKind::Double,
            ElemType::Float => ValueKind::Float,
            ElemType::Reference => ValueKind::Reference,
            _ => ValueKind::Int,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClassState {
    Loaded,
    Initializing(ThreadId),
    Initialized,
    Error,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClassKind {
    Instance,
    Primitive(ElemType),
    Array {
        elem: ElemType,
        /// `None` for primitive components.
        component: Option<ClassId>,
    },
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub descriptor: String,
    pub access: FieldAccess,
    pub kind: ValueKind,
    /// Cell offset among instance fields, or static slot index.
    pub slot: u32,
    pub constant_value: Option<u16>,
}

impl Field {
    pub fn is_static(&self) -> bool {
        self.access.contains(FieldAccess::STATIC)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Code {
    /// Mutable so that resolved instructions can be rewritten to fast forms
    /// and breakpoints installed.
    pub bytes: Vec<u8>,
    pub handlers: Vec<ExceptionEntry>,
    pub lines: Vec<LineNumber>,
}

impl Code {
    pub fn line_at(&self, pc: u32) -> Option<u16> {
        self.lines
            .iter()
            .filter(|l| l.start_pc as u32 <= pc)
            .max_by_key(|l| l.start_pc)
            .map(|l| l.line)
    }
}

#[derive(Clone)]
pub enum MethodBody {
    Bytecode(Code),
    /// Bound lazily on first invocation.
    Native(Option<NativeFn>),
    Abstract,
}

impl std::fmt::Debug for MethodBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodBody::Bytecode(code) => write!(f, "Bytecode({} bytes)", code.bytes.len()),
            MethodBody::Native(bound) => write!(f, "Native(bound: {})", bound.is_some()),
            MethodBody::Abstract => write!(f, "Abstract"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub descriptor: String,
    pub access: MethodAccess,
    /// Includes `this` for instance methods.
    pub arg_cells: u16,
    pub ret_cells: u8,
    pub max_locals: u16,
    pub max_stack: u16,
    pub body: MethodBody,
}

impl Method {
    pub fn is_static(&self) -> bool {
        self.access.contains(MethodAccess::STATIC)
    }

    pub fn is_synchronized(&self) -> bool {
        self.access.contains(MethodAccess::SYNCHRONIZED)
    }

    pub fn is_private(&self) -> bool {
        self.access.contains(MethodAccess::PRIVATE)
    }

    pub fn is_abstract(&self) -> bool {
        self.access.contains(MethodAccess::ABSTRACT)
    }

    pub fn code(&self) -> Option<&Code> {
        match &self.body {
            MethodBody::Bytecode(code) => Some(code),
            _ => None,
        }
    }

    pub fn code_mut(&mut self) -> Option<&mut Code> {
        match &mut self.body {
            MethodBody::Bytecode(code) => Some(code),
            _ => None,
        }
    }

    /// Cells a frame for this method occupies above its save cells.
    pub fn frame_cells(&self) -> usize {
        self.max_locals.max(self.arg_cells) as usize + self.max_stack as usize
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FieldTarget {
    /// Declaring class.
    pub class: ClassId,
    pub slot: u32,
    pub kind: ValueKind,
    pub is_static: bool,
    pub is_final: bool,
}

/// Runtime constant pool entry, carrying its resolution cache.
#[derive(Debug, Clone)]
pub enum Constant {
    Unusable,
    Utf8(String),
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class {
        name: String,
        resolved: Option<ClassId>,
    },
    String {
        text: String,
        resolved: Ref,
    },
    Field {
        class: u16,
        name: String,
        descriptor: String,
        resolved: Option<FieldTarget>,
    },
    Method {
        class: u16,
        name: String,
        descriptor: String,
        interface: bool,
        resolved: Option<MethodId>,
        /// Last receiver class seen at a virtual call site and its selection.
        cache: Option<(ClassId, MethodId)>,
        /// `invokespecial` selection; independent of the receiver.
        special: Option<MethodId>,
    },
    NameAndType,
}

// Layout of the class-metadata chunk.
pub const DATA_CLASS_ID: usize = 0;
pub const DATA_MIRROR: usize = 1;
pub const DATA_LOADER: usize = 2;
pub const DATA_STATICS: usize = 3;

#[derive(Debug, Clone)]
pub struct Class {
    pub id: ClassId,
    pub name: String,
    pub kind: ClassKind,
    pub access: ClassAccess,
    pub super_class: Option<ClassId>,
    pub interfaces: Vec<ClassId>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub constants: Vec<Constant>,
    /// Defining loader; null for the bootstrap loader.
    pub loader: Ref,
    pub state: ClassState,
    /// Class-metadata chunk: id, mirror, loader, statics.
    pub data: Ref,
    pub instance_cells: u32,
    /// Instance cell offsets holding references, inherited ones included.
    pub ref_slots: Vec<u32>,
    pub static_cells: u32,
    pub static_ref_slots: Vec<u32>,
    pub source_file: Option<String>,
    /// Instances are weak references.
    pub weak: bool,
}

impl Class {
    pub fn is_interface(&self) -> bool {
        self.access.contains(ClassAccess::INTERFACE)
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ClassKind::Array { .. })
    }

    pub fn declared_method(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.methods
            .iter()
            .position(|m| m.name == name && m.descriptor == descriptor)
    }

    pub fn declared_field(&self, name: &str, descriptor: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|f| f.name == name && f.descriptor == descriptor)
    }

    pub fn package(&self) -> &str {
        match self.name.rfind('/') {
            Some(end) => &self.name[..end],
            None => "",
        }
    }

    /// Dotted name as reported by `Class.getName`.
    pub fn java_name(&self) -> String {
        self.name.replace('/', ".")
    }
}

/// All loaded classes. Ids are never reused so that stale ids in unloaded
/// metadata can't alias a newer class.
pub struct ClassPool {
    classes: Vec<Option<Class>>,
    by_name: FxHashMap<(String, Ref), ClassId>,
}

impl ClassPool {
    pub fn with_capacity(buckets: usize) -> Self {
        Self {
            classes: Vec::with_capacity(buckets),
            by_name: FxHashMap::with_capacity_and_hasher(buckets, Default::default()),
        }
    }

    pub fn next_id(&self) -> ClassId {
        ClassId(self.classes.len() as u32)
    }

    pub fn insert(&mut self, class: Class) -> ClassId {
        let id = self.next_id();
        debug_assert_eq!(class.id, id);
        self.by_name.insert((class.name.clone(), class.loader), id);
        self.classes.push(Some(class));
        id
    }

    /// Records that `loader` initiated loading of `id` under `name`.
    pub fn record_initiating(&mut self, name: &str, loader: Ref, id: ClassId) {
        self.by_name.insert((name.to_string(), loader), id);
    }

    pub fn lookup(&self, name: &str, loader: Ref) -> Option<ClassId> {
        self.by_name.get(&(name.to_string(), loader)).copied()
    }

    pub fn get(&self, id: ClassId) -> Option<&Class> {
        self.classes.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ClassId) -> Option<&mut Class> {
        self.classes.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn contains(&self, id: ClassId) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: ClassId) -> Option<Class> {
        let class = self.classes.get_mut(id.index())?.take()?;
        self.by_name.retain(|_, v| *v != id);
        Some(class)
    }

    /// Drops the initiating-loader entries of a collected loader object.
    pub fn forget_loader(&mut self, loader: Ref) {
        self.by_name.retain(|(_, l), _| *l != loader);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Class> {
        self.classes.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.classes.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn method(&self, id: MethodId) -> &Method {
        &self[id.class].methods[id.index as usize]
    }

    pub fn method_mut(&mut self, id: MethodId) -> &mut Method {
        &mut self[id.class].methods[id.index as usize]
    }

    /// `Class.method(descriptor)` for logs and backtraces.
    pub fn describe(&self, id: MethodId) -> String {
        if id.is_wedge() {
            return "<wedge>".to_string();
        }
        match self.get(id.class) {
            Some(class) => {
                let method = &class.methods[id.index as usize];
                format!("{}.{}{}", class.java_name(), method.name, method.descriptor)
            }
            None => format!("<unloaded {id:?}>"),
        }
    }

    pub fn is_subclass(&self, mut class: ClassId, of: ClassId) -> bool {
        loop {
            if class == of {
                return true;
            }
            match self[class].super_class {
                Some(next) => class = next,
                None => return false,
            }
        }
    }

    /// Does `class` (or a superclass, or a superinterface) implement `iface`?
    pub fn implements(&self, class: ClassId, iface: ClassId) -> bool {
        let mut cursor = Some(class);
        while let Some(current) = cursor {
            if current == iface {
                return true;
            }
            let entry = &self[current];
            if entry
                .interfaces
                .iter()
                .any(|&i| self.implements(i, iface))
            {
                return true;
            }
            cursor = entry.super_class;
        }
        false
    }
}

impl Index<ClassId> for ClassPool {
    type Output = Class;

    fn index(&self, id: ClassId) -> &Class {
        match self.get(id) {
            Some(class) => class,
            None => panic!("class {id:?} is not loaded"),
        }
    }
}

impl IndexMut<ClassId> for ClassPool {
    fn index_mut(&mut self, id: ClassId) -> &mut Class {
        match self.get_mut(id) {
            Some(class) => class,
            None => panic!("class {id:?} is not loaded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn bare_class(id: u32, name: &str, super_class: Option<ClassId>) -> Class {
        Class {
            id: ClassId(id),
            name: name.to_string(),
            kind: ClassKind::Instance,
            access: ClassAccess::PUBLIC,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            constants: Vec::new(),
            loader: Ref::NULL,
            state: ClassState::Loaded,
            data: Ref::NULL,
            instance_cells: 0,
            ref_slots: Vec::new(),
            static_cells: 0,
            static_ref_slots: Vec::new(),
            source_file: None,
            weak: false,
        }
    }

    #[test]
    fn method_id_packs_into_a_cell() {
        let id = MethodId::new(ClassId(7), 3);
        assert_eq!(MethodId::from_cell(id.to_cell()), id);
        assert!(MethodId::from_cell(MethodId::WEDGE.to_cell()).is_wedge());
    }

    #[test]
    fn pool_lookup_and_unload() {
        let mut pool = ClassPool::with_capacity(8);
        let object = pool.insert(bare_class(0, "java/lang/Object", None));
        let mut iface = bare_class(1, "I", Some(object));
        iface.access |= ClassAccess::INTERFACE;
        let iface = pool.insert(iface);
        let mut a = bare_class(2, "p/A", Some(object));
        a.interfaces.push(iface);
        let a = pool.insert(a);
        let b = pool.insert(bare_class(3, "p/B", Some(a)));

        assert_eq!(pool.lookup("p/A", Ref::NULL), Some(a));
        assert!(pool.is_subclass(b, object));
        assert!(!pool.is_subclass(a, b));
        assert!(pool.implements(b, iface));
        assert_eq!(pool[b].package(), "p");

        pool.record_initiating("p/B", Ref::from_index(40), b);
        pool.remove(b);
        assert_eq!(pool.lookup("p/B", Ref::NULL), None);
        assert_eq!(pool.lookup("p/B", Ref::from_index(40)), None);
        assert_eq!(pool.next_id(), ClassId(4));
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn elements_widen() {
        assert_eq!(ElemType::Byte.to_cell(0xff).int(), -1);
        assert_eq!(ElemType::Char.to_cell(0xffff).int(), 0xffff);
        assert_eq!(ElemType::Short.to_cell(0x8000).int(), -32768);
        assert_eq!(ElemType::from_atype(10), Some(ElemType::Int));
    }

    #[test]
    fn line_lookup() {
        let code = Code {
            bytes: vec![0; 10],
            handlers: Vec::new(),
            lines: vec![
                LineNumber { start_pc: 0, line: 3 },
                LineNumber { start_pc: 4, line: 5 },
            ],
        };
        assert_eq!(code.line_at(2), Some(3));
        assert_eq!(code.line_at(9), Some(5));
    }
}
