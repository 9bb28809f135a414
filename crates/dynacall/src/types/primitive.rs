//! Primitive C types
//!
//! Defines:
//! - `Primitive`: the fixed set of scalar machine representations
//! - `PrimitiveType`: a primitive together with the token it was named by
//! - `Raw`: a scalar in transit between host values and native memory
//!
//! Token mapping (platform dependent widths follow the host C ABI):
//! - `char`, `int8` → Int8; `uchar`, `byte`, `uint8` → UInt8
//! - `short`, `int16` → Int16; `int`, `int32` → Int32
//! - `long`, `ulong`, `size_t` → 32 or 64 bits
//! - `pointer` → untyped address; `string`, `CString` → `char*`

use std::hash::{Hash, Hasher};
use std::mem::{align_of, size_of};
use std::os::raw::{c_int, c_long, c_longlong, c_short};
use std::ptr;

/// Scalar machine representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Void,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    /// One byte, 0 or 1
    Bool,
    /// Untyped address (`void*`)
    Pointer,
    /// Null-terminated string (`char*`)
    CString,
}

const fn signed_of_width(bytes: usize) -> Primitive {
    match bytes {
        1 => Primitive::Int8,
        2 => Primitive::Int16,
        4 => Primitive::Int32,
        _ => Primitive::Int64,
    }
}

const fn unsigned_of_width(bytes: usize) -> Primitive {
    match bytes {
        1 => Primitive::UInt8,
        2 => Primitive::UInt16,
        4 => Primitive::UInt32,
        _ => Primitive::UInt64,
    }
}

impl Primitive {
    /// The representation of C `int` on this platform
    pub const fn c_int() -> Self {
        signed_of_width(size_of::<c_int>())
    }

    pub const fn c_uint() -> Self {
        unsigned_of_width(size_of::<c_int>())
    }

    /// The representation of C `long` on this platform
    pub const fn c_long() -> Self {
        signed_of_width(size_of::<c_long>())
    }

    pub const fn c_ulong() -> Self {
        unsigned_of_width(size_of::<c_long>())
    }

    pub const fn size_t() -> Self {
        unsigned_of_width(size_of::<usize>())
    }

    /// Size in bytes
    pub const fn size(self) -> usize {
        match self {
            Primitive::Void => 0,
            Primitive::Int8 | Primitive::UInt8 | Primitive::Bool => 1,
            Primitive::Int16 | Primitive::UInt16 => 2,
            Primitive::Int32 | Primitive::UInt32 => 4,
            Primitive::Float => size_of::<f32>(),
            Primitive::Int64 | Primitive::UInt64 => 8,
            Primitive::Double => size_of::<f64>(),
            Primitive::Pointer | Primitive::CString => size_of::<usize>(),
        }
    }

    /// Alignment in bytes
    pub const fn align(self) -> usize {
        match self {
            Primitive::Void | Primitive::Int8 | Primitive::UInt8 | Primitive::Bool => 1,
            Primitive::Int16 | Primitive::UInt16 => align_of::<u16>(),
            Primitive::Int32 | Primitive::UInt32 => align_of::<u32>(),
            Primitive::Float => align_of::<f32>(),
            Primitive::Int64 | Primitive::UInt64 => align_of::<u64>(),
            Primitive::Double => align_of::<f64>(),
            Primitive::Pointer | Primitive::CString => align_of::<usize>(),
        }
    }

    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            Primitive::Int8
                | Primitive::UInt8
                | Primitive::Int16
                | Primitive::UInt16
                | Primitive::Int32
                | Primitive::UInt32
                | Primitive::Int64
                | Primitive::UInt64
        )
    }

    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            Primitive::Int8 | Primitive::Int16 | Primitive::Int32 | Primitive::Int64
        )
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Primitive::Float | Primitive::Double)
    }

    pub const fn is_address(self) -> bool {
        matches!(self, Primitive::Pointer | Primitive::CString)
    }

    /// Inclusive value range of an integer primitive
    pub fn int_bounds(self) -> Option<(i128, i128)> {
        let bounds = match self {
            Primitive::Int8 => (i8::MIN as i128, i8::MAX as i128),
            Primitive::UInt8 => (0, u8::MAX as i128),
            Primitive::Int16 => (i16::MIN as i128, i16::MAX as i128),
            Primitive::UInt16 => (0, u16::MAX as i128),
            Primitive::Int32 => (i32::MIN as i128, i32::MAX as i128),
            Primitive::UInt32 => (0, u32::MAX as i128),
            Primitive::Int64 => (i64::MIN as i128, i64::MAX as i128),
            Primitive::UInt64 => (0, u64::MAX as i128),
            Primitive::Bool => (0, 1),
            _ => return None,
        };
        Some(bounds)
    }

    /// Write `raw` into native memory at `dst`
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of `self.size()` bytes. The value must
    /// already be range checked for this primitive; integers are truncated to
    /// the primitive's width.
    pub(crate) unsafe fn store(self, dst: *mut u8, raw: Raw) {
        match self {
            Primitive::Void => {}
            Primitive::Int8 | Primitive::UInt8 => ptr::write_unaligned(dst, raw.bits() as u8),
            Primitive::Int16 | Primitive::UInt16 => {
                ptr::write_unaligned(dst.cast::<u16>(), raw.bits() as u16)
            }
            Primitive::Int32 | Primitive::UInt32 => {
                ptr::write_unaligned(dst.cast::<u32>(), raw.bits() as u32)
            }
            Primitive::Int64 | Primitive::UInt64 => ptr::write_unaligned(dst.cast::<u64>(), raw.bits()),
            Primitive::Bool => ptr::write_unaligned(dst, (raw.bits() != 0) as u8),
            Primitive::Float => ptr::write_unaligned(dst.cast::<f32>(), raw.as_f64() as f32),
            Primitive::Double => ptr::write_unaligned(dst.cast::<f64>(), raw.as_f64()),
            Primitive::Pointer | Primitive::CString => {
                ptr::write_unaligned(dst.cast::<usize>(), raw.bits() as usize)
            }
        }
    }

    /// Read a scalar of this primitive from native memory at `src`
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `self.size()` bytes.
    pub(crate) unsafe fn load(self, src: *const u8) -> Raw {
        match self {
            Primitive::Void => Raw::Unsigned(0),
            Primitive::Int8 => Raw::Signed(ptr::read_unaligned(src.cast::<i8>()) as i64),
            Primitive::UInt8 => Raw::Unsigned(ptr::read_unaligned(src) as u64),
            Primitive::Int16 => Raw::Signed(ptr::read_unaligned(src.cast::<i16>()) as i64),
            Primitive::UInt16 => Raw::Unsigned(ptr::read_unaligned(src.cast::<u16>()) as u64),
            Primitive::Int32 => Raw::Signed(ptr::read_unaligned(src.cast::<i32>()) as i64),
            Primitive::UInt32 => Raw::Unsigned(ptr::read_unaligned(src.cast::<u32>()) as u64),
            Primitive::Int64 => Raw::Signed(ptr::read_unaligned(src.cast::<i64>())),
            Primitive::UInt64 => Raw::Unsigned(ptr::read_unaligned(src.cast::<u64>())),
            Primitive::Bool => Raw::Unsigned((ptr::read_unaligned(src) != 0) as u64),
            Primitive::Float => Raw::Float(ptr::read_unaligned(src.cast::<f32>()) as f64),
            Primitive::Double => Raw::Float(ptr::read_unaligned(src.cast::<f64>())),
            Primitive::Pointer | Primitive::CString => {
                Raw::Address(ptr::read_unaligned(src.cast::<usize>()))
            }
        }
    }

    /// Narrow a full-width return register to this primitive
    ///
    /// libffi widens integral return values smaller than a machine word, so
    /// only the low bytes carry the value.
    pub(crate) fn narrow(self, word: u64) -> Raw {
        match self {
            Primitive::Int8 => Raw::Signed(word as u8 as i8 as i64),
            Primitive::UInt8 => Raw::Unsigned(word as u8 as u64),
            Primitive::Int16 => Raw::Signed(word as u16 as i16 as i64),
            Primitive::UInt16 => Raw::Unsigned(word as u16 as u64),
            Primitive::Int32 => Raw::Signed(word as u32 as i32 as i64),
            Primitive::UInt32 => Raw::Unsigned(word as u32 as u64),
            Primitive::Int64 => Raw::Signed(word as i64),
            Primitive::Bool => Raw::Unsigned((word as u8 != 0) as u64),
            Primitive::Pointer | Primitive::CString => Raw::Address(word as usize),
            _ => Raw::Unsigned(word),
        }
    }
}

/// A primitive as named in a declaration
///
/// `int` and `int32` share a representation but keep their own names, so
/// diagnostics echo what the user wrote. Equality compares representation
/// only.
#[derive(Debug, Clone, Copy)]
pub struct PrimitiveType {
    pub name: &'static str,
    pub kind: Primitive,
}

impl PartialEq for PrimitiveType {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for PrimitiveType {}

impl Hash for PrimitiveType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
    }
}

/// Resolve a primitive token
///
/// # Examples
///
/// ```
/// # use dynacall::types::{lookup_primitive, Primitive};
/// assert_eq!(lookup_primitive("int").unwrap().kind, Primitive::Int32);
/// assert_eq!(lookup_primitive("uchar").unwrap().kind, Primitive::UInt8);
/// assert!(lookup_primitive("quaternion").is_none());
/// ```
pub fn lookup_primitive(token: &str) -> Option<PrimitiveType> {
    let (name, kind) = match token {
        "void" => ("void", Primitive::Void),
        "int8" => ("int8", Primitive::Int8),
        "uint8" => ("uint8", Primitive::UInt8),
        "int16" => ("int16", Primitive::Int16),
        "uint16" => ("uint16", Primitive::UInt16),
        "int32" => ("int32", Primitive::Int32),
        "uint32" => ("uint32", Primitive::UInt32),
        "int64" => ("int64", Primitive::Int64),
        "uint64" => ("uint64", Primitive::UInt64),
        "float" => ("float", Primitive::Float),
        "double" => ("double", Primitive::Double),
        "char" => ("char", Primitive::Int8),
        "uchar" => ("uchar", Primitive::UInt8),
        "byte" => ("byte", Primitive::UInt8),
        "short" => ("short", signed_of_width(size_of::<c_short>())),
        "ushort" => ("ushort", unsigned_of_width(size_of::<c_short>())),
        "int" => ("int", Primitive::c_int()),
        "uint" => ("uint", Primitive::c_uint()),
        "long" => ("long", Primitive::c_long()),
        "ulong" => ("ulong", Primitive::c_ulong()),
        "longlong" => ("longlong", signed_of_width(size_of::<c_longlong>())),
        "ulonglong" => ("ulonglong", unsigned_of_width(size_of::<c_longlong>())),
        "size_t" => ("size_t", Primitive::size_t()),
        "bool" => ("bool", Primitive::Bool),
        "pointer" => ("pointer", Primitive::Pointer),
        "char*" | "string" | "CString" => ("char*", Primitive::CString),
        _ => return None,
    };
    Some(PrimitiveType { name, kind })
}

/// A scalar on its way into or out of native memory
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Raw {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Address(usize),
}

impl Raw {
    /// Two's complement bit pattern, for integer stores
    pub(crate) fn bits(self) -> u64 {
        match self {
            Raw::Signed(v) => v as u64,
            Raw::Unsigned(v) => v,
            Raw::Float(v) => v as i64 as u64,
            Raw::Address(a) => a as u64,
        }
    }

    pub(crate) fn as_f64(self) -> f64 {
        match self {
            Raw::Signed(v) => v as f64,
            Raw::Unsigned(v) => v as f64,
            Raw::Float(v) => v,
            Raw::Address(a) => a as f64,
        }
    }
}
