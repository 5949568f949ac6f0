//! Class file reader and writer (versions up to 50.0).

use bitflags::bitflags;
use thiserror::Error;

pub const MAGIC: u32 = 0xCAFE_BABE;
pub const MAX_MAJOR_VERSION: u16 = 50;
pub const MIN_MAJOR_VERSION: u16 = 45;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassFileError {
    #[error("truncated class file at offset {0}")]
    Truncated(usize),
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported class file version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("unknown constant pool tag {tag} at index {index}")]
    BadTag { index: usize, tag: u8 },
    #[error("constant pool index {0} has the wrong type")]
    BadConstant(u16),
    #[error("malformed modified UTF-8 in constant {0}")]
    BadUtf8(usize),
    #[error("malformed class file: {0}")]
    Malformed(&'static str),
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct ClassAccess: u16 {
        const PUBLIC = 0x0001;
        const FINAL = 0x0010;
        const SUPER = 0x0020;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct FieldAccess: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const VOLATILE = 0x0040;
        const TRANSIENT = 0x0080;
        const SYNTHETIC = 0x1000;
        const ENUM = 0x4000;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct MethodAccess: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const BRIDGE = 0x0040;
        const VARARGS = 0x0080;
        const NATIVE = 0x0100;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CpInfo {
    /// Slot 0 and the shadow slot after a long or double.
    Unusable,
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class(u16),
    String(u16),
    FieldRef { class: u16, name_and_type: u16 },
    MethodRef { class: u16, name_and_type: u16 },
    InterfaceMethodRef { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
}

impl CpInfo {
    fn tag(&self) -> u8 {
        match self {
            CpInfo::Unusable => 0,
            CpInfo::Utf8(_) => 1,
            CpInfo::Integer(_) => 3,
            CpInfo::Float(_) => 4,
            CpInfo::Long(_) => 5,
            CpInfo::Double(_) => 6,
            CpInfo::Class(_) => 7,
            CpInfo::String(_) => 8,
            CpInfo::FieldRef { .. } => 9,
            CpInfo::MethodRef { .. } => 10,
            CpInfo::InterfaceMethodRef { .. } => 11,
            CpInfo::NameAndType { .. } => 12,
        }
    }

    pub fn is_wide(&self) -> bool {
        matches!(self, CpInfo::Long(_) | CpInfo::Double(_))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    /// Pool index of the caught class, 0 for catch-all.
    pub catch_type: u16,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LineNumber {
    pub start_pc: u16,
    pub line: u16,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionEntry>,
    pub line_numbers: Vec<LineNumber>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub access: FieldAccess,
    pub name: u16,
    pub descriptor: u16,
    pub constant_value: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodInfo {
    pub access: MethodAccess,
    pub name: u16,
    pub descriptor: u16,
    pub code: Option<CodeAttribute>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: Vec<CpInfo>,
    pub access: ClassAccess,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub source_file: Option<u16>,
}

impl ClassFile {
    pub fn utf8(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.constant_pool.get(index as usize) {
            Some(CpInfo::Utf8(text)) => Ok(text),
            _ => Err(ClassFileError::BadConstant(index)),
        }
    }

    pub fn class_name(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.constant_pool.get(index as usize) {
            Some(CpInfo::Class(name)) => self.utf8(*name),
            _ => Err(ClassFileError::BadConstant(index)),
        }
    }

    pub fn name(&self) -> Result<&str, ClassFileError> {
        self.class_name(self.this_class)
    }

    pub fn super_name(&self) -> Result<Option<&str>, ClassFileError> {
        if self.super_class == 0 {
            Ok(None)
        } else {
            self.class_name(self.super_class).map(Some)
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str), ClassFileError> {
        match self.constant_pool.get(index as usize) {
            Some(CpInfo::NameAndType { name, descriptor }) => {
                Ok((self.utf8(*name)?, self.utf8(*descriptor)?))
            }
            _ => Err(ClassFileError::BadConstant(index)),
        }
    }

    // ── Reading ─────────────────────────────────────────────────────

    pub fn parse(bytes: &[u8]) -> Result<ClassFile, ClassFileError> {
        let mut r = Reader { bytes, pos: 0 };
        let magic = r.u4()?;
        if magic != MAGIC {
            return Err(ClassFileError::BadMagic(magic));
        }
        let minor_version = r.u2()?;
        let major_version = r.u2()?;
        if !(MIN_MAJOR_VERSION..=MAX_MAJOR_VERSION).contains(&major_version) {
            return Err(ClassFileError::UnsupportedVersion {
                major: major_version,
                minor: minor_version,
            });
        }

        let count = r.u2()? as usize;
        let mut constant_pool = Vec::with_capacity(count);
        constant_pool.push(CpInfo::Unusable);
        while constant_pool.len() < count {
            let index = constant_pool.len();
            let tag = r.u1()?;
            let entry = match tag {
                1 => {
                    let len = r.u2()? as usize;
                    let raw = r.bytes(len)?;
                    CpInfo::Utf8(decode_modified_utf8(raw).ok_or(ClassFileError::BadUtf8(index))?)
                }
                3 => CpInfo::Integer(r.u4()? as i32),
                4 => CpInfo::Float(f32::from_bits(r.u4()?)),
                5 => CpInfo::Long(r.u8()? as i64),
                6 => CpInfo::Double(f64::from_bits(r.u8()?)),
                7 => CpInfo::Class(r.u2()?),
                8 => CpInfo::String(r.u2()?),
                9 => CpInfo::FieldRef {
                    class: r.u2()?,
                    name_and_type: r.u2()?,
                },
                10 => CpInfo::MethodRef {
                    class: r.u2()?,
                    name_and_type: r.u2()?,
                },
                11 => CpInfo::InterfaceMethodRef {
                    class: r.u2()?,
                    name_and_type: r.u2()?,
                },
                12 => CpInfo::NameAndType {
                    name: r.u2()?,
                    descriptor: r.u2()?,
                },
                tag => return Err(ClassFileError::BadTag { index, tag }),
            };
            let wide = entry.is_wide();
            constant_pool.push(entry);
            if wide {
                constant_pool.push(CpInfo::Unusable);
            }
        }
        if constant_pool.len() != count {
            return Err(ClassFileError::Malformed("wide constant overruns the pool"));
        }

        let mut class = ClassFile {
            minor_version,
            major_version,
            constant_pool,
            access: ClassAccess::from_bits_retain(r.u2()?),
            this_class: r.u2()?,
            super_class: r.u2()?,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            source_file: None,
        };

        let interfaces = r.u2()?;
        for _ in 0..interfaces {
            class.interfaces.push(r.u2()?);
        }

        let fields = r.u2()?;
        for _ in 0..fields {
            let access = FieldAccess::from_bits_retain(r.u2()?);
            let name = r.u2()?;
            let descriptor = r.u2()?;
            let mut constant_value = None;
            let attributes = r.u2()?;
            for _ in 0..attributes {
                let (attr, body) = r.attribute()?;
                if class.utf8(attr)? == "ConstantValue" {
                    let mut body = Reader { bytes: body, pos: 0 };
                    constant_value = Some(body.u2()?);
                }
            }
            class.fields.push(FieldInfo {
                access,
                name,
                descriptor,
                constant_value,
            });
        }

        let methods = r.u2()?;
        for _ in 0..methods {
            let access = MethodAccess::from_bits_retain(r.u2()?);
            let name = r.u2()?;
            let descriptor = r.u2()?;
            let mut code = None;
            let attributes = r.u2()?;
            for _ in 0..attributes {
                let (attr, body) = r.attribute()?;
                if class.utf8(attr)? == "Code" {
                    code = Some(class.parse_code(body)?);
                }
            }
            class.methods.push(MethodInfo {
                access,
                name,
                descriptor,
                code,
            });
        }

        let attributes = r.u2()?;
        for _ in 0..attributes {
            let (attr, body) = r.attribute()?;
            if class.utf8(attr)? == "SourceFile" {
                let mut body = Reader { bytes: body, pos: 0 };
                class.source_file = Some(body.u2()?);
            }
        }
        Ok(class)
    }

    fn parse_code(&self, body: &[u8]) -> Result<CodeAttribute, ClassFileError> {
        let mut r = Reader { bytes: body, pos: 0 };
        let max_stack = r.u2()?;
        let max_locals = r.u2()?;
        let len = r.u4()? as usize;
        if len == 0 || len >= 65536 {
            return Err(ClassFileError::Malformed("code length out of range"));
        }
        let code = r.bytes(len)?.to_vec();
        let handlers = r.u2()?;
        let mut exception_table = Vec::with_capacity(handlers as usize);
        for _ in 0..handlers {
            exception_table.push(ExceptionEntry {
                start_pc: r.u2()?,
                end_pc: r.u2()?,
                handler_pc: r.u2()?,
                catch_type: r.u2()?,
            });
        }
        let mut line_numbers = Vec::new();
        let attributes = r.u2()?;
        for _ in 0..attributes {
            let (attr, body) = r.attribute()?;
            if self.utf8(attr)? == "LineNumberTable" {
                let mut body = Reader { bytes: body, pos: 0 };
                let count = body.u2()?;
                for _ in 0..count {
                    line_numbers.push(LineNumber {
                        start_pc: body.u2()?,
                        line: body.u2()?,
                    });
                }
            }
        }
        Ok(CodeAttribute {
            max_stack,
            max_locals,
            code,
            exception_table,
            line_numbers,
        })
    }

    // ── Writing ─────────────────────────────────────────────────────

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut pool = self.constant_pool.clone();
        let code_name = utf8_index(&mut pool, "Code");
        let constant_value_name = utf8_index(&mut pool, "ConstantValue");
        let source_file_name = utf8_index(&mut pool, "SourceFile");
        let lines_name = utf8_index(&mut pool, "LineNumberTable");

        let mut w = Writer::default();
        w.u4(MAGIC);
        w.u2(self.minor_version);
        w.u2(self.major_version);
        w.u2(pool.len() as u16);
        for entry in pool.iter().skip(1) {
            if matches!(entry, CpInfo::Unusable) {
                continue;
            }
            w.u1(entry.tag());
            match entry {
                CpInfo::Unusable => {}
                CpInfo::Utf8(text) => {
                    let raw = encode_modified_utf8(text);
                    w.u2(raw.len() as u16);
                    w.bytes(&raw);
                }
                CpInfo::Integer(v) => w.u4(*v as u32),
                CpInfo::Float(v) => w.u4(v.to_bits()),
                CpInfo::Long(v) => w.u8(*v as u64),
                CpInfo::Double(v) => w.u8(v.to_bits()),
                CpInfo::Class(i) | CpInfo::String(i) => w.u2(*i),
                CpInfo::FieldRef {
                    class,
                    name_and_type,
                }
                | CpInfo::MethodRef {
                    class,
                    name_and_type,
                }
                | CpInfo::InterfaceMethodRef {
                    class,
                    name_and_type,
                } => {
                    w.u2(*class);
                    w.u2(*name_and_type);
                }
                CpInfo::NameAndType { name, descriptor } => {
                    w.u2(*name);
                    w.u2(*descriptor);
                }
            }
        }

        w.u2(self.access.bits());
        w.u2(self.this_class);
        w.u2(self.super_class);
        w.u2(self.interfaces.len() as u16);
        for i in &self.interfaces {
            w.u2(*i);
        }

        w.u2(self.fields.len() as u16);
        for field in &self.fields {
            w.u2(field.access.bits());
            w.u2(field.name);
            w.u2(field.descriptor);
            match field.constant_value {
                Some(value) => {
                    w.u2(1);
                    w.u2(constant_value_name);
                    w.u4(2);
                    w.u2(value);
                }
                None => w.u2(0),
            }
        }

        w.u2(self.methods.len() as u16);
        for method in &self.methods {
            w.u2(method.access.bits());
            w.u2(method.name);
            w.u2(method.descriptor);
            let Some(code) = &method.code else {
                w.u2(0);
                continue;
            };
            w.u2(1);
            w.u2(code_name);
            let mut body = Writer::default();
            body.u2(code.max_stack);
            body.u2(code.max_locals);
            body.u4(code.code.len() as u32);
            body.bytes(&code.code);
            body.u2(code.exception_table.len() as u16);
            for e in &code.exception_table {
                body.u2(e.start_pc);
                body.u2(e.end_pc);
                body.u2(e.handler_pc);
                body.u2(e.catch_type);
            }
            if code.line_numbers.is_empty() {
                body.u2(0);
            } else {
                body.u2(1);
                body.u2(lines_name);
                body.u4(2 + 4 * code.line_numbers.len() as u32);
                body.u2(code.line_numbers.len() as u16);
                for l in &code.line_numbers {
                    body.u2(l.start_pc);
                    body.u2(l.line);
                }
            }
            w.u4(body.out.len() as u32);
            w.bytes(&body.out);
        }

        match self.source_file {
            Some(index) => {
                w.u2(1);
                w.u2(source_file_name);
                w.u4(2);
                w.u2(index);
            }
            None => w.u2(0),
        }
        w.out
    }
}

fn utf8_index(pool: &mut Vec<CpInfo>, text: &str) -> u16 {
    if let Some(index) = pool
        .iter()
        .position(|e| matches!(e, CpInfo::Utf8(t) if t == text))
    {
        return index as u16;
    }
    pool.push(CpInfo::Utf8(text.to_string()));
    (pool.len() - 1) as u16
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8], ClassFileError> {
        let end = self.pos + len;
        if end > self.bytes.len() {
            return Err(ClassFileError::Truncated(self.pos));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u1(&mut self) -> Result<u8, ClassFileError> {
        Ok(self.bytes(1)?[0])
    }

    fn u2(&mut self) -> Result<u16, ClassFileError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u4(&mut self) -> Result<u32, ClassFileError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u8(&mut self) -> Result<u64, ClassFileError> {
        let hi = self.u4()? as u64;
        let lo = self.u4()? as u64;
        Ok((hi << 32) | lo)
    }

    fn attribute(&mut self) -> Result<(u16, &'a [u8]), ClassFileError> {
        let name = self.u2()?;
        let len = self.u4()? as usize;
        Ok((name, self.bytes(len)?))
    }
}

#[derive(Default)]
struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn u1(&mut self, v: u8) {
        self.out.push(v);
    }

    fn u2(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    fn u4(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    fn u8(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.out.extend_from_slice(v);
    }
}

/// Decodes the JVM's modified UTF-8: NUL is two bytes and supplementary
/// characters arrive as surrogate pairs of three-byte sequences.
pub fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i] as u16;
        if b & 0x80 == 0 {
            if b == 0 {
                return None;
            }
            units.push(b);
            i += 1;
        } else if b & 0xe0 == 0xc0 {
            let b2 = *bytes.get(i + 1)? as u16;
            if b2 & 0xc0 != 0x80 {
                return None;
            }
            units.push(((b & 0x1f) << 6) | (b2 & 0x3f));
            i += 2;
        } else if b & 0xf0 == 0xe0 {
            let b2 = *bytes.get(i + 1)? as u16;
            let b3 = *bytes.get(i + 2)? as u16;
            if b2 & 0xc0 != 0x80 || b3 & 0xc0 != 0x80 {
                return None;
            }
            units.push(((b & 0x0f) << 12) | ((b2 & 0x3f) << 6) | (b3 & 0x3f));
            i += 3;
        } else {
            return None;
        }
    }
    Some(String::from_utf16_lossy(&units))
}

pub fn encode_modified_utf8(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for unit in text.encode_utf16() {
        match unit {
            0x0001..=0x007f => out.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                out.push(0xc0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                out.push(0xe0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modified_utf8_nul_and_supplementary() {
        let text = "a\u{0}\u{e9}\u{1F600}";
        let raw = encode_modified_utf8(text);
        assert_eq!(&raw[..3], &[b'a', 0xc0, 0x80]);
        // supplementary characters become two three-byte surrogates
        assert_eq!(raw.len(), 1 + 2 + 2 + 6);
        assert_eq!(decode_modified_utf8(&raw).as_deref(), Some(text));
    }

    #[test]
    fn rejects_raw_nul() {
        assert_eq!(decode_modified_utf8(&[b'a', 0]), None);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        assert_eq!(
            ClassFile::parse(&[0, 0, 0, 0, 0, 0, 0, 50]),
            Err(ClassFileError::BadMagic(0))
        );
        let mut bytes = MAGIC.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 51]);
        assert_eq!(
            ClassFile::parse(&bytes),
            Err(ClassFileError::UnsupportedVersion { major: 51, minor: 0 })
        );
    }

    #[test]
    fn truncated_input() {
        let mut bytes = MAGIC.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 50, 0, 5]);
        assert!(matches!(
            ClassFile::parse(&bytes),
            Err(ClassFileError::Truncated(_))
        ));
    }

    #[test]
    fn wide_constants_take_two_slots() {
        let mut bytes = MAGIC.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 50]);
        // pool: #1 Long, #2 shadow, #3 Utf8 "A", #4 Class #3
        bytes.extend_from_slice(&[0, 5]);
        bytes.extend_from_slice(&[5, 0, 0, 0, 0, 0, 0, 0, 7]);
        bytes.extend_from_slice(&[1, 0, 1, b'A']);
        bytes.extend_from_slice(&[7, 0, 3]);
        // access, this, super, no interfaces/fields/methods/attributes
        bytes.extend_from_slice(&[0, 0x21, 0, 4, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let class = ClassFile::parse(&bytes).unwrap();
        assert_eq!(class.constant_pool[1], CpInfo::Long(7));
        assert_eq!(class.constant_pool[2], CpInfo::Unusable);
        assert_eq!(class.name().unwrap(), "A");
        assert_eq!(class.super_name().unwrap(), None);
        assert_eq!(class.access, ClassAccess::PUBLIC | ClassAccess::SUPER);
    }
}
