use std::fmt;

/// Reference to a heap chunk payload, expressed as a word index into the heap.
/// Index 0 is reserved so that the zero pattern is `null`.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ref(u32);

impl Ref {
    pub const NULL: Ref = Ref(0);

    #[inline]
    pub const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// `None` for null, which keeps call sites free of sentinel checks.
    #[inline]
    pub fn non_null(self) -> Option<Ref> {
        if self.is_null() { None } else { Some(self) }
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "@{}", self.0)
        }
    }
}

/// The universal storage unit. Stack slots, locals, fields and statics are all
/// cells. Category-2 values (long, double) keep their full 64 bits in the lower
/// of the two cells they occupy; the upper cell is padding and reads as zero.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Cell(pub u64);

impl Cell {
    pub const ZERO: Cell = Cell(0);

    #[inline]
    pub const fn from_int(value: i32) -> Self {
        Self(value as u32 as u64)
    }

    #[inline]
    pub const fn int(self) -> i32 {
        self.0 as u32 as i32
    }

    #[inline]
    pub const fn from_long(value: i64) -> Self {
        Self(value as u64)
    }

    #[inline]
    pub const fn long(self) -> i64 {
        self.0 as i64
    }

    #[inline]
    pub fn from_float(value: f32) -> Self {
        Self(value.to_bits() as u64)
    }

    #[inline]
    pub fn float(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }

    #[inline]
    pub fn from_double(value: f64) -> Self {
        Self(value.to_bits())
    }

    #[inline]
    pub fn double(self) -> f64 {
        f64::from_bits(self.0)
    }

    #[inline]
    pub const fn from_ref(value: Ref) -> Self {
        Self(value.0 as u64)
    }

    #[inline]
    pub const fn reference(self) -> Ref {
        Ref(self.0 as u32)
    }

    #[inline]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cell({:#x})", self.0)
    }
}
