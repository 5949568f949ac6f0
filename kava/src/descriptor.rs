//! Field and method descriptor helpers.

/// Storage shape of a single value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl ValueKind {
    pub fn cells(self) -> usize {
        match self {
            ValueKind::Long | ValueKind::Double => 2,
            _ => 1,
        }
    }

    pub fn is_reference(self) -> bool {
        self == ValueKind::Reference
    }
}

/// Kind of the field type starting at the front of `desc`.
pub fn field_kind(desc: &str) -> Option<ValueKind> {
    match desc.as_bytes().first()? {
        b'B' | b'C' | b'I' | b'S' | b'Z' => Some(ValueKind::Int),
        b'J' => Some(ValueKind::Long),
        b'F' => Some(ValueKind::Float),
        b'D' => Some(ValueKind::Double),
        b'L' | b'[' => Some(ValueKind::Reference),
        _ => None,
    }
}

/// Length in bytes of the field type at the front of `desc`.
fn field_len(desc: &[u8]) -> Option<usize> {
    match desc.first()? {
        b'B' | b'C' | b'I' | b'S' | b'Z' | b'J' | b'F' | b'D' => Some(1),
        b'L' => desc.iter().position(|&b| b == b';').map(|end| end + 1),
        b'[' => field_len(&desc[1..]).map(|len| len + 1),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodShape {
    pub params: Vec<ValueKind>,
    /// `None` for void.
    pub ret: Option<ValueKind>,
}

impl MethodShape {
    pub fn parse(desc: &str) -> Option<Self> {
        let bytes = desc.as_bytes();
        if bytes.first() != Some(&b'(') {
            return None;
        }
        let mut params = Vec::new();
        let mut at = 1;
        while *bytes.get(at)? != b')' {
            let len = field_len(&bytes[at..])?;
            params.push(field_kind(&desc[at..])?);
            at += len;
        }
        let ret_desc = &desc[at + 1..];
        let ret = if ret_desc == "V" {
            None
        } else {
            if field_len(ret_desc.as_bytes())? != ret_desc.len() {
                return None;
            }
            Some(field_kind(ret_desc)?)
        };
        Some(Self { params, ret })
    }

    pub fn param_cells(&self) -> usize {
        self.params.iter().map(|p| p.cells()).sum()
    }

    pub fn ret_cells(&self) -> usize {
        self.ret.map_or(0, ValueKind::cells)
    }
}

/// Argument cells of a call, counting `this` for instance methods.
pub fn arg_cells(desc: &str, is_static: bool) -> Option<usize> {
    let shape = MethodShape::parse(desc)?;
    Some(shape.param_cells() + usize::from(!is_static))
}

/// Class name named by an array or object descriptor element:
/// `Ljava/lang/String;` → `java/lang/String`, `[I` → `[I`.
pub fn class_name_of(desc: &str) -> Option<&str> {
    if let Some(rest) = desc.strip_prefix('L') {
        rest.strip_suffix(';')
    } else if desc.starts_with('[') {
        Some(desc)
    } else {
        None
    }
}
