//! Type system - descriptions of native memory layouts
//!
//! A [`Type`] says how many bytes a native value occupies, how it must be
//! aligned, and how it is encoded. Types are immutable and cheap to clone;
//! composites share their layout through `Arc`.
//!
//! # Example
//!
//! ```
//! use dynacall::types::Type;
//!
//! let point = Type::structure([("x", Type::int()), ("y", Type::double())]).unwrap();
//! assert_eq!(point.size() % point.align(), 0);
//! assert_eq!(point.align(), Type::double().align());
//! ```

pub mod layout;
pub mod primitive;
pub mod registry;

pub use layout::{align_up, ArrayType, Field, StructType, UnionType};
pub use primitive::{lookup_primitive, Primitive, PrimitiveType, Raw};
pub use registry::{TypeRegistry, TypeSpec};

use crate::error::TypeError;
use std::fmt;
use std::sync::Arc;

/// Layout and encoding of a native value
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Primitive(PrimitiveType),
    Array(Arc<ArrayType>),
    Struct(Arc<StructType>),
    Union(Arc<UnionType>),
    /// Typed pointer (`T*`)
    Pointer(Arc<Type>),
    /// Named type with unknown layout, only usable behind a pointer
    Opaque(Arc<str>),
}

impl Type {
    const fn prim(name: &'static str, kind: Primitive) -> Type {
        Type::Primitive(PrimitiveType { name, kind })
    }

    pub fn void() -> Type {
        Self::prim("void", Primitive::Void)
    }

    pub fn bool() -> Type {
        Self::prim("bool", Primitive::Bool)
    }

    pub fn char() -> Type {
        Self::prim("char", Primitive::Int8)
    }

    pub fn uchar() -> Type {
        Self::prim("uchar", Primitive::UInt8)
    }

    pub fn int() -> Type {
        Self::prim("int", Primitive::c_int())
    }

    pub fn uint() -> Type {
        Self::prim("uint", Primitive::c_uint())
    }

    pub fn long() -> Type {
        Self::prim("long", Primitive::c_long())
    }

    pub fn ulong() -> Type {
        Self::prim("ulong", Primitive::c_ulong())
    }

    pub fn int64() -> Type {
        Self::prim("int64", Primitive::Int64)
    }

    pub fn uint64() -> Type {
        Self::prim("uint64", Primitive::UInt64)
    }

    pub fn size_t() -> Type {
        Self::prim("size_t", Primitive::size_t())
    }

    pub fn float() -> Type {
        Self::prim("float", Primitive::Float)
    }

    pub fn double() -> Type {
        Self::prim("double", Primitive::Double)
    }

    /// Untyped address (`void*`)
    pub fn pointer() -> Type {
        Self::prim("pointer", Primitive::Pointer)
    }

    /// Null-terminated string (`char*`)
    pub fn c_string() -> Type {
        Self::prim("char*", Primitive::CString)
    }

    /// Resolve a type token against the built-in primitives
    ///
    /// Accepts everything [`TypeRegistry::resolve`] accepts except
    /// user-registered names.
    pub fn named(token: &str) -> Result<Type, TypeError> {
        TypeRegistry::new().resolve(token)
    }

    pub fn pointer_to(target: Type) -> Type {
        Type::Pointer(Arc::new(target))
    }

    /// Fixed-length array
    pub fn array(element: Type, length: usize) -> Result<Type, TypeError> {
        Ok(Type::Array(Arc::new(ArrayType::new(element, Some(length))?)))
    }

    /// Array whose length is supplied when a buffer is created
    pub fn unsized_array(element: Type) -> Result<Type, TypeError> {
        Ok(Type::Array(Arc::new(ArrayType::new(element, None)?)))
    }

    pub fn structure<I, N>(fields: I) -> Result<Type, TypeError>
    where
        I: IntoIterator<Item = (N, Type)>,
        N: Into<String>,
    {
        let members = fields.into_iter().map(|(n, t)| (n.into(), t)).collect();
        Ok(Type::Struct(Arc::new(StructType::new(None, members)?)))
    }

    pub fn named_structure<I, N>(name: &str, fields: I) -> Result<Type, TypeError>
    where
        I: IntoIterator<Item = (N, Type)>,
        N: Into<String>,
    {
        let members = fields.into_iter().map(|(n, t)| (n.into(), t)).collect();
        Ok(Type::Struct(Arc::new(StructType::new(
            Some(name.to_string()),
            members,
        )?)))
    }

    pub fn union<I, N>(fields: I) -> Result<Type, TypeError>
    where
        I: IntoIterator<Item = (N, Type)>,
        N: Into<String>,
    {
        let members = fields.into_iter().map(|(n, t)| (n.into(), t)).collect();
        Ok(Type::Union(Arc::new(UnionType::new(None, members)?)))
    }

    pub fn named_union<I, N>(name: &str, fields: I) -> Result<Type, TypeError>
    where
        I: IntoIterator<Item = (N, Type)>,
        N: Into<String>,
    {
        let members = fields.into_iter().map(|(n, t)| (n.into(), t)).collect();
        Ok(Type::Union(Arc::new(UnionType::new(
            Some(name.to_string()),
            members,
        )?)))
    }

    pub fn opaque(name: &str) -> Type {
        Type::Opaque(Arc::from(name))
    }

    /// Size in bytes; zero for `void`, opaque types and unsized arrays
    pub fn size(&self) -> usize {
        match self {
            Type::Primitive(p) => p.kind.size(),
            Type::Array(a) => a.size(),
            Type::Struct(s) => s.size(),
            Type::Union(u) => u.size(),
            Type::Pointer(_) => Primitive::Pointer.size(),
            Type::Opaque(_) => 0,
        }
    }

    /// Alignment in bytes, always a power of two
    pub fn align(&self) -> usize {
        match self {
            Type::Primitive(p) => p.kind.align(),
            Type::Array(a) => a.align(),
            Type::Struct(s) => s.align(),
            Type::Union(u) => u.align(),
            Type::Pointer(_) => Primitive::Pointer.align(),
            Type::Opaque(_) => 1,
        }
    }

    /// Size of a type that must occupy memory
    pub fn sized(&self) -> Result<usize, TypeError> {
        match self.size() {
            0 => Err(TypeError::Unsized(self.name())),
            n => Ok(n),
        }
    }

    /// Display name as it would be written in a signature
    pub fn name(&self) -> String {
        match self {
            Type::Primitive(p) => p.name.to_string(),
            Type::Array(a) => match a.length() {
                Some(len) => format!("{}[{}]", a.element().name(), len),
                None => format!("{}[]", a.element().name()),
            },
            Type::Struct(s) => match s.name() {
                Some(name) => name.to_string(),
                None => describe_members("struct", s.fields()),
            },
            Type::Union(u) => match u.name() {
                Some(name) => name.to_string(),
                None => describe_members("union", u.fields()),
            },
            Type::Pointer(target) => format!("{}*", target.name()),
            Type::Opaque(name) => name.to_string(),
        }
    }

    pub fn primitive(&self) -> Option<Primitive> {
        match self {
            Type::Primitive(p) => Some(p.kind),
            _ => None,
        }
    }

    pub fn is_void(&self) -> bool {
        self.primitive() == Some(Primitive::Void)
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Type::Array(_) | Type::Struct(_) | Type::Union(_))
    }

    /// Whether values of this type occupy an address-sized slot
    pub fn is_address(&self) -> bool {
        matches!(self, Type::Pointer(_)) || self.primitive().is_some_and(Primitive::is_address)
    }

    /// Target of a typed pointer
    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Type::Pointer(target) => Some(target),
            _ => None,
        }
    }

    /// Element of an array type
    pub fn element(&self) -> Option<&Type> {
        match self {
            Type::Array(a) => Some(a.element()),
            _ => None,
        }
    }

    /// Members of a struct or union
    pub fn fields(&self) -> &[Field] {
        match self {
            Type::Struct(s) => s.fields(),
            Type::Union(u) => u.fields(),
            _ => &[],
        }
    }

    /// Check that the type can appear as a function argument
    ///
    /// Arrays decay to pointers, so unsized arrays are accepted here.
    pub fn check_argument(&self) -> Result<(), TypeError> {
        match self {
            Type::Array(_) => Ok(()),
            Type::Opaque(_) => Err(TypeError::NotPassable(self.name())),
            _ if self.is_void() => Err(TypeError::NotPassable(self.name())),
            _ => Ok(()),
        }
    }

    /// Check that the type can be returned from a function
    pub fn check_return(&self) -> Result<(), TypeError> {
        match self {
            Type::Array(_) | Type::Opaque(_) => Err(TypeError::NotPassable(self.name())),
            _ => Ok(()),
        }
    }
}

fn describe_members(kind: &str, fields: &[Field]) -> String {
    let members: Vec<String> = fields
        .iter()
        .map(|f| format!("{}: {}", f.name, f.ty.name()))
        .collect();
    format!("{} {{ {} }}", kind, members.join(", "))
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_names() {
        let rec = Type::structure([("a", Type::int()), ("b", Type::pointer_to(Type::char()))]).unwrap();
        assert_eq!(rec.name(), "struct { a: int, b: char* }");
        assert_eq!(Type::unsized_array(Type::long()).unwrap().name(), "long[]");
        assert_eq!(Type::array(Type::uchar(), 3).unwrap().name(), "uchar[3]");
    }

    #[test]
    fn test_array_layout() {
        let arr = Type::array(Type::long(), 5).unwrap();
        assert_eq!(arr.size(), 5 * std::mem::size_of::<std::os::raw::c_long>());
        assert_eq!(arr.align(), Type::long().align());
    }

    #[test]
    fn test_void_cannot_be_an_element() {
        assert_eq!(
            Type::array(Type::void(), 2).unwrap_err(),
            TypeError::Unsized("void".to_string())
        );
    }

    #[test]
    fn test_unsized_array_is_not_a_field() {
        let err = Type::structure([("items", Type::unsized_array(Type::int()).unwrap())]).unwrap_err();
        assert_eq!(err, TypeError::ZeroSizedField("items".to_string()));
    }

    #[test]
    fn test_passability() {
        assert!(Type::void().check_argument().is_err());
        assert!(Type::void().check_return().is_ok());
        assert!(Type::opaque("FILE").check_argument().is_err());
        assert!(Type::pointer_to(Type::opaque("FILE")).check_argument().is_ok());
    }
}
