//! Host-side values exchanged with native code
//!
//! `Value` is what callers pass as arguments, what calls return, and what
//! callback host functions receive. Numbers compare across variants, so a
//! returned `Value::Int(42)` equals `42`, `42u64` and `42.0`.

use crate::callback::Callback;
use crate::reference::Reference;
use std::fmt;
use std::sync::Arc;

/// Opaque native address
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Pointer(usize);

impl Pointer {
    pub const fn null() -> Self {
        Pointer(0)
    }

    pub const fn from_addr(addr: usize) -> Self {
        Pointer(addr)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Pointer(ptr as usize)
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer arithmetic in bytes
    pub const fn offset(self, bytes: isize) -> Self {
        Pointer(self.0.wrapping_add_signed(bytes))
    }
}

impl fmt::Debug for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pointer({:#x})", self.0)
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A value crossing the native boundary
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(Arc<str>),
    Pointer(Pointer),
    /// Typed view of native memory
    Ref(Reference),
    /// Array literal, or a decoded array
    Array(Vec<Value>),
    /// Struct or union literal, or a decoded record, in field order
    Record(Vec<(String, Value)>),
    Callback(Callback),
}

impl Value {
    /// Build a record literal
    ///
    /// # Examples
    ///
    /// ```
    /// # use dynacall::Value;
    /// let rec = Value::record([("index", Value::from(4)), ("flag", Value::from(true))]);
    /// assert_eq!(rec.get("index"), Some(&Value::Int(4)));
    /// ```
    pub fn record<K, I>(fields: I) -> Value
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build an array literal
    pub fn array<T, I>(items: I) -> Value
    where
        T: Into<Value>,
        I: IntoIterator<Item = T>,
    {
        Value::Array(items.into_iter().map(Into::into).collect())
    }

    /// Name of the variant, for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) | Value::UInt(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Pointer(_) => "pointer",
            Value::Ref(_) => "reference",
            Value::Array(_) => "array",
            Value::Record(_) => "record",
            Value::Callback(_) => "callback",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v),
            Value::UInt(v) => i64::try_from(v).ok(),
            Value::Bool(b) => Some(b as i64),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Int(v) => u64::try_from(v).ok(),
            Value::UInt(v) => Some(v),
            Value::Bool(b) => Some(b as u64),
            _ => None,
        }
    }

    /// Any number as a float
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Int(v) => Some(v as f64),
            Value::UInt(v) => Some(v as f64),
            Value::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<Pointer> {
        match self {
            Value::Pointer(p) => Some(*p),
            Value::Ref(r) => Some(r.address()),
            Value::Callback(cb) => Some(cb.code_ptr()),
            Value::Null => Some(Pointer::null()),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Field of a record
    pub fn get(&self, field: &str) -> Option<&Value> {
        match self {
            Value::Record(fields) => fields.iter().find(|(k, _)| k == field).map(|(_, v)| v),
            _ => None,
        }
    }
}

fn numbers_equal(a: &Value, b: &Value) -> Option<bool> {
    let eq = match (a, b) {
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::UInt(x), Value::UInt(y)) => x == y,
        (Value::Int(x), Value::UInt(y)) | (Value::UInt(y), Value::Int(x)) => {
            u64::try_from(*x).is_ok_and(|x| x == *y)
        }
        (Value::Float(x), other) | (other, Value::Float(x)) => other.as_f64()? == *x,
        _ => return None,
    };
    Some(eq)
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if let Some(eq) = numbers_equal(self, other) {
            return eq;
        }
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Pointer(a), Value::Pointer(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a.address() == b.address() && a.ty() == b.ty(),
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Callback(a), Value::Callback(b)) => a.code_ptr() == b.code_ptr(),
            _ => false,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident as $conv:ty),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v as $conv)
                }
            }

            impl PartialEq<$ty> for Value {
                fn eq(&self, other: &$ty) -> bool {
                    *self == Value::from(*other)
                }
            }
        )*
    };
}

value_from! {
    i8 => Int as i64,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int as i64,
    isize => Int as i64,
    u8 => UInt as u64,
    u16 => UInt as u64,
    u32 => UInt as u64,
    u64 => UInt as u64,
    usize => UInt as u64,
    f32 => Float as f64,
    f64 => Float as f64,
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl PartialEq<bool> for Value {
    fn eq(&self, other: &bool) -> bool {
        self.as_bool() == Some(*other)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Arc::from(s))
    }
}

impl PartialEq<&str> for Value {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == Some(*other)
    }
}

impl From<Pointer> for Value {
    fn from(p: Pointer) -> Self {
        Value::Pointer(p)
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Value::Ref(r)
    }
}

impl From<&Reference> for Value {
    fn from(r: &Reference) -> Self {
        Value::Ref(r.clone())
    }
}

impl From<Callback> for Value {
    fn from(cb: Callback) -> Self {
        Value::Callback(cb)
    }
}

impl From<&Callback> for Value {
    fn from(cb: &Callback) -> Self {
        Value::Callback(cb.clone())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers_compare_across_variants() {
        assert_eq!(Value::Int(42), Value::UInt(42));
        assert_eq!(Value::Int(42), 42.0);
        assert_eq!(Value::UInt(7), 7i32);
        assert_ne!(Value::Int(-1), Value::UInt(u64::MAX));
        assert_ne!(Value::Float(0.5), 0);
    }

    #[test]
    fn test_record_access() {
        let rec = Value::record([("a", Value::from(1)), ("b", Value::from("x"))]);
        assert_eq!(rec.get("b"), Some(&Value::from("x")));
        assert_eq!(rec.get("c"), None);
    }

    #[test]
    fn test_pointer_offset_wraps() {
        let p = Pointer::from_addr(16);
        assert_eq!(p.offset(-8).addr(), 8);
        assert_eq!(Pointer::null().offset(-1).addr(), usize::MAX);
        assert_eq!(format!("{:?}", p), "Pointer(0x10)");
    }

    #[test]
    fn test_option_maps_to_null() {
        assert!(Value::from(None::<i32>).is_null());
        assert_eq!(Value::from(Some(3u8)), 3);
    }
}
