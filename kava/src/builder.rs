//! In-process class assembler.
//!
//! Produces [`ClassFile`] values directly, so synthesized classes go through
//! the same definition path as classes read from disk.

use crate::classfile::{
    ClassAccess, ClassFile, CodeAttribute, CpInfo, ExceptionEntry, FieldAccess, FieldInfo,
    LineNumber, MAX_MAJOR_VERSION, MethodAccess, MethodInfo,
};
use crate::descriptor::{MethodShape, ValueKind};
use crate::opcodes::*;

#[derive(Debug, Default)]
pub struct ConstantPoolBuilder {
    entries: Vec<CpInfo>,
}

impl ConstantPoolBuilder {
    pub fn new() -> Self {
        Self {
            entries: vec![CpInfo::Unusable],
        }
    }

    fn add(&mut self, entry: CpInfo) -> u16 {
        if let Some(index) = self.entries.iter().position(|e| *e == entry) {
            return index as u16;
        }
        let wide = entry.is_wide();
        self.entries.push(entry);
        let index = self.entries.len() - 1;
        if wide {
            self.entries.push(CpInfo::Unusable);
        }
        index as u16
    }

    pub fn utf8(&mut self, text: &str) -> u16 {
        self.add(CpInfo::Utf8(text.to_string()))
    }

    pub fn class(&mut self, name: &str) -> u16 {
        let name = self.utf8(name);
        self.add(CpInfo::Class(name))
    }

    pub fn string(&mut self, text: &str) -> u16 {
        let text = self.utf8(text);
        self.add(CpInfo::String(text))
    }

    pub fn integer(&mut self, value: i32) -> u16 {
        self.add(CpInfo::Integer(value))
    }

    pub fn float(&mut self, value: f32) -> u16 {
        self.add(CpInfo::Float(value))
    }

    pub fn long(&mut self, value: i64) -> u16 {
        self.add(CpInfo::Long(value))
    }

    pub fn double(&mut self, value: f64) -> u16 {
        self.add(CpInfo::Double(value))
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name = self.utf8(name);
        let descriptor = self.utf8(descriptor);
        self.add(CpInfo::NameAndType { name, descriptor })
    }

    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class = self.class(class);
        let name_and_type = self.name_and_type(name, descriptor);
        self.add(CpInfo::FieldRef {
            class,
            name_and_type,
        })
    }

    pub fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class = self.class(class);
        let name_and_type = self.name_and_type(name, descriptor);
        self.add(CpInfo::MethodRef {
            class,
            name_and_type,
        })
    }

    pub fn interface_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        let class = self.class(class);
        let name_and_type = self.name_and_type(name, descriptor);
        self.add(CpInfo::InterfaceMethodRef {
            class,
            name_and_type,
        })
    }

    pub fn into_entries(self) -> Vec<CpInfo> {
        self.entries
    }
}

/// Compile-time value of a `static final` field.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ConstValue<'a> {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(&'a str),
}

pub struct ClassBuilder {
    pool: ConstantPoolBuilder,
    access: ClassAccess,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<FieldInfo>,
    methods: Vec<MethodInfo>,
    source_file: Option<u16>,
}

impl ClassBuilder {
    pub fn new(name: &str, super_name: Option<&str>) -> Self {
        let mut pool = ConstantPoolBuilder::new();
        let this_class = pool.class(name);
        let super_class = super_name.map_or(0, |s| pool.class(s));
        Self {
            pool,
            access: ClassAccess::PUBLIC | ClassAccess::SUPER,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            source_file: None,
        }
    }

    /// An interface extending `java/lang/Object`.
    pub fn interface(name: &str) -> Self {
        let mut builder = Self::new(name, Some("java/lang/Object"));
        builder.access = ClassAccess::PUBLIC | ClassAccess::INTERFACE | ClassAccess::ABSTRACT;
        builder
    }

    pub fn access(&mut self, access: ClassAccess) -> &mut Self {
        self.access = access;
        self
    }

    pub fn implements(&mut self, name: &str) -> &mut Self {
        let index = self.pool.class(name);
        self.interfaces.push(index);
        self
    }

    pub fn source_file(&mut self, name: &str) -> &mut Self {
        self.source_file = Some(self.pool.utf8(name));
        self
    }

    pub fn pool(&mut self) -> &mut ConstantPoolBuilder {
        &mut self.pool
    }

    pub fn field(&mut self, access: FieldAccess, name: &str, descriptor: &str) -> &mut Self {
        let name = self.pool.utf8(name);
        let descriptor = self.pool.utf8(descriptor);
        self.fields.push(FieldInfo {
            access,
            name,
            descriptor,
            constant_value: None,
        });
        self
    }

    pub fn constant_field(
        &mut self,
        access: FieldAccess,
        name: &str,
        descriptor: &str,
        value: ConstValue<'_>,
    ) -> &mut Self {
        let value = match value {
            ConstValue::Int(v) => self.pool.integer(v),
            ConstValue::Long(v) => self.pool.long(v),
            ConstValue::Float(v) => self.pool.float(v),
            ConstValue::Double(v) => self.pool.double(v),
            ConstValue::String(v) => self.pool.string(v),
        };
        let name = self.pool.utf8(name);
        let descriptor = self.pool.utf8(descriptor);
        self.fields.push(FieldInfo {
            access: access | FieldAccess::STATIC | FieldAccess::FINAL,
            name,
            descriptor,
            constant_value: Some(value),
        });
        self
    }

    /// Adds a method with a bytecode body assembled by `body`.
    pub fn method(
        &mut self,
        access: MethodAccess,
        name: &str,
        descriptor: &str,
        body: impl FnOnce(&mut CodeBuilder<'_>),
    ) -> &mut Self {
        let params = MethodShape::parse(descriptor).map_or(0, |s| s.param_cells());
        let arg_cells = params + usize::from(!access.contains(MethodAccess::STATIC));
        let mut code = CodeBuilder::new(&mut self.pool, arg_cells as u16);
        body(&mut code);
        let code = code.finish();
        let name = self.pool.utf8(name);
        let descriptor = self.pool.utf8(descriptor);
        self.methods.push(MethodInfo {
            access,
            name,
            descriptor,
            code: Some(code),
        });
        self
    }

    /// Adds a method without a body (native or abstract).
    pub fn declare(&mut self, access: MethodAccess, name: &str, descriptor: &str) -> &mut Self {
        let name = self.pool.utf8(name);
        let descriptor = self.pool.utf8(descriptor);
        self.methods.push(MethodInfo {
            access,
            name,
            descriptor,
            code: None,
        });
        self
    }

    pub fn native(&mut self, access: MethodAccess, name: &str, descriptor: &str) -> &mut Self {
        self.declare(access | MethodAccess::NATIVE, name, descriptor)
    }

    /// `<init>()V` calling the superclass no-arg constructor.
    pub fn default_constructor(&mut self) -> &mut Self {
        let super_name = match self.pool.entries.get(self.super_class as usize) {
            Some(CpInfo::Class(name)) => match &self.pool.entries[*name as usize] {
                CpInfo::Utf8(text) => text.clone(),
                _ => "java/lang/Object".to_string(),
            },
            _ => "java/lang/Object".to_string(),
        };
        self.method(MethodAccess::PUBLIC, "<init>", "()V", |c| {
            c.aload(0);
            c.invokespecial(&super_name, "<init>", "()V");
            c.op(RETURN);
        })
    }

    pub fn build(self) -> ClassFile {
        ClassFile {
            minor_version: 0,
            major_version: MAX_MAJOR_VERSION,
            constant_pool: self.pool.into_entries(),
            access: self.access,
            this_class: self.this_class,
            super_class: self.super_class,
            interfaces: self.interfaces,
            fields: self.fields,
            methods: self.methods,
            source_file: self.source_file,
        }
    }
}

/// A branch target. Create with [`CodeBuilder::label`], place with
/// [`CodeBuilder::bind`]; both forward and backward references resolve when
/// the method is finished.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug)]
struct Fixup {
    /// Position of the offset bytes.
    at: usize,
    /// Start of the branching instruction (base for the relative offset).
    base: usize,
    label: Label,
    wide: bool,
}

pub struct CodeBuilder<'a> {
    pool: &'a mut ConstantPoolBuilder,
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    handlers: Vec<(Label, Label, Label, u16)>,
    lines: Vec<LineNumber>,
    max_stack: u16,
    max_locals: u16,
}

impl<'a> CodeBuilder<'a> {
    fn new(pool: &'a mut ConstantPoolBuilder, arg_cells: u16) -> Self {
        Self {
            pool,
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            handlers: Vec::new(),
            lines: Vec::new(),
            max_stack: 8,
            max_locals: arg_cells,
        }
    }

    pub fn pool(&mut self) -> &mut ConstantPoolBuilder {
        &mut *self.pool
    }

    /// Current byte offset in the code array.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn max_stack(&mut self, cells: u16) -> &mut Self {
        self.max_stack = cells;
        self
    }

    pub fn max_locals(&mut self, cells: u16) -> &mut Self {
        self.max_locals = self.max_locals.max(cells);
        self
    }

    fn touch_local(&mut self, index: u16, kind: ValueKind) {
        self.max_locals = self.max_locals.max(index + kind.cells() as u16);
    }

    // ── emit helpers ───────────────────────────────────────────────

    pub fn op(&mut self, op: u8) -> &mut Self {
        self.code.push(op);
        self
    }

    fn u1(&mut self, v: u8) {
        self.code.push(v);
    }

    fn u2(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_be_bytes());
    }

    fn u4(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_be_bytes());
    }

    fn op_u2(&mut self, op: u8, index: u16) -> &mut Self {
        self.u1(op);
        self.u2(index);
        self
    }

    pub fn line(&mut self, line: u16) -> &mut Self {
        self.lines.push(LineNumber {
            start_pc: self.code.len() as u16,
            line,
        });
        self
    }

    // ── constants ──────────────────────────────────────────────────

    pub fn iconst(&mut self, value: i32) -> &mut Self {
        match value {
            -1..=5 => self.op((ICONST_0 as i32 + value) as u8),
            v if i8::try_from(v).is_ok() => {
                self.u1(BIPUSH);
                self.u1(v as i8 as u8);
                self
            }
            v if i16::try_from(v).is_ok() => {
                self.u1(SIPUSH);
                self.u2(v as i16 as u16);
                self
            }
            v => {
                let index = self.pool.integer(v);
                self.ldc_index(index)
            }
        }
    }

    fn ldc_index(&mut self, index: u16) -> &mut Self {
        if index <= u8::MAX as u16 {
            self.u1(LDC);
            self.u1(index as u8);
            self
        } else {
            self.op_u2(LDC_W, index)
        }
    }

    pub fn ldc_string(&mut self, text: &str) -> &mut Self {
        let index = self.pool.string(text);
        self.ldc_index(index)
    }

    pub fn ldc_float(&mut self, value: f32) -> &mut Self {
        let index = self.pool.float(value);
        self.ldc_index(index)
    }

    pub fn ldc_class(&mut self, name: &str) -> &mut Self {
        let index = self.pool.class(name);
        self.ldc_index(index)
    }

    pub fn ldc_long(&mut self, value: i64) -> &mut Self {
        let index = self.pool.long(value);
        self.op_u2(LDC2_W, index)
    }

    pub fn ldc_double(&mut self, value: f64) -> &mut Self {
        let index = self.pool.double(value);
        self.op_u2(LDC2_W, index)
    }

    // ── locals ─────────────────────────────────────────────────────

    fn local_op(&mut self, short_base: u8, op: u8, index: u16, kind: ValueKind) -> &mut Self {
        self.touch_local(index, kind);
        if index <= 3 {
            self.op(short_base + index as u8)
        } else if index <= u8::MAX as u16 {
            self.u1(op);
            self.u1(index as u8);
            self
        } else {
            self.u1(WIDE);
            self.op_u2(op, index)
        }
    }

    pub fn iload(&mut self, index: u16) -> &mut Self {
        self.local_op(ILOAD_0, ILOAD, index, ValueKind::Int)
    }

    pub fn lload(&mut self, index: u16) -> &mut Self {
        self.local_op(LLOAD_0, LLOAD, index, ValueKind::Long)
    }

    pub fn fload(&mut self, index: u16) -> &mut Self {
        self.local_op(FLOAD_0, FLOAD, index, ValueKind::Float)
    }

    pub fn dload(&mut self, index: u16) -> &mut Self {
        self.local_op(DLOAD_0, DLOAD, index, ValueKind::Double)
    }

    pub fn aload(&mut self, index: u16) -> &mut Self {
        self.local_op(ALOAD_0, ALOAD, index, ValueKind::Reference)
    }

    pub fn istore(&mut self, index: u16) -> &mut Self {
        self.local_op(ISTORE_0, ISTORE, index, ValueKind::Int)
    }

    pub fn lstore(&mut self, index: u16) -> &mut Self {
        self.local_op(LSTORE_0, LSTORE, index, ValueKind::Long)
    }

    pub fn fstore(&mut self, index: u16) -> &mut Self {
        self.local_op(FSTORE_0, FSTORE, index, ValueKind::Float)
    }

    pub fn dstore(&mut self, index: u16) -> &mut Self {
        self.local_op(DSTORE_0, DSTORE, index, ValueKind::Double)
    }

    pub fn astore(&mut self, index: u16) -> &mut Self {
        self.local_op(ASTORE_0, ASTORE, index, ValueKind::Reference)
    }

    pub fn iinc(&mut self, index: u16, delta: i16) -> &mut Self {
        self.touch_local(index, ValueKind::Int);
        if index <= u8::MAX as u16 && i8::try_from(delta).is_ok() {
            self.u1(IINC);
            self.u1(index as u8);
            self.u1(delta as i8 as u8);
        } else {
            self.u1(WIDE);
            self.u1(IINC);
            self.u2(index);
            self.u2(delta as u16);
        }
        self
    }

    // ── members ────────────────────────────────────────────────────

    pub fn getstatic(&mut self, class: &str, name: &str, desc: &str) -> &mut Self {
        let index = self.pool.field_ref(class, name, desc);
        self.op_u2(GETSTATIC, index)
    }

    pub fn putstatic(&mut self, class: &str, name: &str, desc: &str) -> &mut Self {
        let index = self.pool.field_ref(class, name, desc);
        self.op_u2(PUTSTATIC, index)
    }

    pub fn getfield(&mut self, class: &str, name: &str, desc: &str) -> &mut Self {
        let index = self.pool.field_ref(class, name, desc);
        self.op_u2(GETFIELD, index)
    }

    pub fn putfield(&mut self, class: &str, name: &str, desc: &str) -> &mut Self {
        let index = self.pool.field_ref(class, name, desc);
        self.op_u2(PUTFIELD, index)
    }

    pub fn invokevirtual(&mut self, class: &str, name: &str, desc: &str) -> &mut Self {
        let index = self.pool.method_ref(class, name, desc);
        self.op_u2(INVOKEVIRTUAL, index)
    }

    pub fn invokespecial(&mut self, class: &str, name: &str, desc: &str) -> &mut Self {
        let index = self.pool.method_ref(class, name, desc);
        self.op_u2(INVOKESPECIAL, index)
    }

    pub fn invokestatic(&mut self, class: &str, name: &str, desc: &str) -> &mut Self {
        let index = self.pool.method_ref(class, name, desc);
        self.op_u2(INVOKESTATIC, index)
    }

    pub fn invokeinterface(&mut self, class: &str, name: &str, desc: &str) -> &mut Self {
        let index = self.pool.interface_method_ref(class, name, desc);
        let count = MethodShape::parse(desc).map_or(0, |s| s.param_cells()) + 1;
        self.op_u2(INVOKEINTERFACE, index);
        self.u1(count as u8);
        self.u1(0);
        self
    }

    // ── objects and arrays ─────────────────────────────────────────

    pub fn new_object(&mut self, class: &str) -> &mut Self {
        let index = self.pool.class(class);
        self.op_u2(NEW, index)
    }

    /// `new C; dup; invokespecial C.<init>()V`.
    pub fn construct(&mut self, class: &str) -> &mut Self {
        self.new_object(class);
        self.op(DUP);
        self.invokespecial(class, "<init>", "()V")
    }

    /// `atype` uses the `newarray` element codes (4 = boolean .. 11 = long).
    pub fn newarray(&mut self, atype: u8) -> &mut Self {
        self.u1(NEWARRAY);
        self.u1(atype);
        self
    }

    pub fn anewarray(&mut self, class: &str) -> &mut Self {
        let index = self.pool.class(class);
        self.op_u2(ANEWARRAY, index)
    }

    pub fn multianewarray(&mut self, descriptor: &str, dims: u8) -> &mut Self {
        let index = self.pool.class(descriptor);
        self.op_u2(MULTIANEWARRAY, index);
        self.u1(dims);
        self
    }

    pub fn checkcast(&mut self, class: &str) -> &mut Self {
        let index = self.pool.class(class);
        self.op_u2(CHECKCAST, index)
    }

    pub fn instanceof(&mut self, class: &str) -> &mut Self {
        let index = self.pool.class(class);
        self.op_u2(INSTANCEOF, index)
    }

    // ── control flow ───────────────────────────────────────────────

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.code.len());
        self
    }

    /// A label bound at the current offset.
    pub fn here(&mut self) -> Label {
        let label = self.label();
        self.bind(label);
        label
    }

    fn offset_to(&mut self, base: usize, label: Label, wide: bool) {
        let at = self.code.len();
        self.fixups.push(Fixup {
            at,
            base,
            label,
            wide,
        });
        if wide { self.u4(0) } else { self.u2(0) }
    }

    /// Any two-byte-offset branch: `if*`, `if_icmp*`, `if_acmp*`, `goto`,
    /// `jsr`, `ifnull`, `ifnonnull`.
    pub fn branch(&mut self, op: u8, target: Label) -> &mut Self {
        let base = self.code.len();
        self.u1(op);
        self.offset_to(base, target, false);
        self
    }

    pub fn goto(&mut self, target: Label) -> &mut Self {
        self.branch(GOTO, target)
    }

    pub fn goto_w(&mut self, target: Label) -> &mut Self {
        let base = self.code.len();
        self.u1(GOTO_W);
        self.offset_to(base, target, true);
        self
    }

    pub fn jsr_w(&mut self, target: Label) -> &mut Self {
        let base = self.code.len();
        self.u1(JSR_W);
        self.offset_to(base, target, true);
        self
    }

    fn switch_padding(&mut self) {
        while self.code.len() % 4 != 0 {
            self.u1(0);
        }
    }

    pub fn tableswitch(&mut self, low: i32, default: Label, targets: &[Label]) -> &mut Self {
        let base = self.code.len();
        self.u1(TABLESWITCH);
        self.switch_padding();
        self.offset_to(base, default, true);
        self.u4(low as u32);
        self.u4((low + targets.len() as i32 - 1) as u32);
        for target in targets {
            self.offset_to(base, *target, true);
        }
        self
    }

    /// Pairs are sorted by key before emission.
    pub fn lookupswitch(&mut self, default: Label, pairs: &[(i32, Label)]) -> &mut Self {
        let base = self.code.len();
        let mut pairs = pairs.to_vec();
        pairs.sort_by_key(|(key, _)| *key);
        self.u1(LOOKUPSWITCH);
        self.switch_padding();
        self.offset_to(base, default, true);
        self.u4(pairs.len() as u32);
        for (key, target) in pairs {
            self.u4(key as u32);
            self.offset_to(base, target, true);
        }
        self
    }

    /// Registers a handler for `[start, end)`. `catch_type` of `None`
    /// catches everything.
    pub fn try_catch(
        &mut self,
        start: Label,
        end: Label,
        handler: Label,
        catch_type: Option<&str>,
    ) -> &mut Self {
        let catch_type = catch_type.map_or(0, |name| self.pool.class(name));
        self.handlers.push((start, end, handler, catch_type));
        self
    }

    fn resolve(&self, label: Label) -> usize {
        match self.labels[label.0] {
            Some(offset) => offset,
            None => panic!("label {} used but never bound", label.0),
        }
    }

    fn finish(self) -> CodeAttribute {
        let mut code = self.code.clone();
        for fixup in &self.fixups {
            let delta = self.resolve(fixup.label) as i64 - fixup.base as i64;
            if fixup.wide {
                code[fixup.at..fixup.at + 4].copy_from_slice(&(delta as i32).to_be_bytes());
            } else {
                let delta = i16::try_from(delta).unwrap_or_else(|_| {
                    panic!("branch offset {delta} out of range, use goto_w")
                });
                code[fixup.at..fixup.at + 2].copy_from_slice(&delta.to_be_bytes());
            }
        }
        let exception_table = self
            .handlers
            .iter()
            .map(|(start, end, handler, catch_type)| ExceptionEntry {
                start_pc: self.resolve(*start) as u16,
                end_pc: self.resolve(*end) as u16,
                handler_pc: self.resolve(*handler) as u16,
                catch_type: *catch_type,
            })
            .collect();
        CodeAttribute {
            max_stack: self.max_stack,
            max_locals: self.max_locals,
            code,
            exception_table,
            line_numbers: self.lines,
        }
    }
}
