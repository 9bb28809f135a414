//! Named types and type tokens
//!
//! Signatures name their types with tokens such as `"int"`, `"char*"`,
//! `"double[4]"` or a user-registered `"TRecWithArray"`. A [`TypeRegistry`]
//! turns those tokens into [`Type`]s.

use super::{lookup_primitive, Type};
use crate::error::TypeError;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;

/// Type as written in a declaration: a token or an already built type
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSpec {
    Name(String),
    Type(Type),
}

impl TypeSpec {
    pub fn resolve(&self, registry: &TypeRegistry) -> Result<Type, TypeError> {
        match self {
            TypeSpec::Name(token) => registry.resolve(token),
            TypeSpec::Type(ty) => Ok(ty.clone()),
        }
    }
}

impl From<&str> for TypeSpec {
    fn from(token: &str) -> Self {
        TypeSpec::Name(token.to_string())
    }
}

impl From<String> for TypeSpec {
    fn from(token: String) -> Self {
        TypeSpec::Name(token)
    }
}

impl From<Type> for TypeSpec {
    fn from(ty: Type) -> Self {
        TypeSpec::Type(ty)
    }
}

impl From<&Type> for TypeSpec {
    fn from(ty: &Type) -> Self {
        TypeSpec::Type(ty.clone())
    }
}

impl<'de> Deserialize<'de> for TypeSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(TypeSpec::Name)
    }
}

/// Name → type table, pre-seeded with the primitive tokens
///
/// # Examples
///
/// ```
/// # use dynacall::types::{TypeRegistry, Type};
/// let mut registry = TypeRegistry::new();
/// registry.define_struct("Point", &[("x", "int"), ("y", "int")]).unwrap();
///
/// let ptr = registry.resolve("Point*").unwrap();
/// assert_eq!(ptr.pointee().unwrap().size(), 2 * Type::int().size());
/// ```
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    named: HashMap<String, Type>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `ty` under `name`
    ///
    /// Primitive tokens and names already taken are rejected.
    pub fn register(&mut self, name: impl Into<String>, ty: Type) -> Result<(), TypeError> {
        let name = name.into();
        if lookup_primitive(&name).is_some() || self.named.contains_key(&name) {
            return Err(TypeError::AlreadyRegistered(name));
        }
        log::debug!("registered type '{}' ({} bytes)", name, ty.size());
        self.named.insert(name, ty);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Type> {
        self.named.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        lookup_primitive(name).is_some() || self.named.contains_key(name)
    }

    /// Resolve a type token
    ///
    /// Grammar: a primitive or registered name, optionally followed by
    /// `[N]` or `[]` array suffixes and `*` pointer suffixes.
    pub fn resolve(&self, token: &str) -> Result<Type, TypeError> {
        let token = token.trim();
        if let Some(prim) = lookup_primitive(token) {
            return Ok(Type::Primitive(prim));
        }
        if let Some(inner) = token.strip_suffix('*') {
            return Ok(Type::pointer_to(self.resolve(inner)?));
        }
        if let Some(inner) = token.strip_suffix(']') {
            let open = inner
                .rfind('[')
                .ok_or_else(|| TypeError::UnknownType(token.to_string()))?;
            let element = self.resolve(&inner[..open])?;
            let length = inner[open + 1..].trim();
            if length.is_empty() {
                return Type::unsized_array(element);
            }
            let length = length
                .parse::<usize>()
                .map_err(|_| TypeError::UnknownType(token.to_string()))?;
            return Type::array(element, length);
        }
        self.named
            .get(token)
            .cloned()
            .ok_or_else(|| TypeError::UnknownType(token.to_string()))
    }

    /// Build and register a named struct from `(field, token)` pairs
    ///
    /// A field may refer to the struct itself only through a pointer; such
    /// pointers target an opaque type of the same name.
    pub fn define_struct(&mut self, name: &str, fields: &[(&str, &str)]) -> Result<Type, TypeError> {
        let members = self.resolve_members(name, fields)?;
        let ty = Type::named_structure(name, members)?;
        self.register(name, ty.clone())?;
        Ok(ty)
    }

    /// Build and register a named union from `(field, token)` pairs
    pub fn define_union(&mut self, name: &str, fields: &[(&str, &str)]) -> Result<Type, TypeError> {
        let members = self.resolve_members(name, fields)?;
        let ty = Type::named_union(name, members)?;
        self.register(name, ty.clone())?;
        Ok(ty)
    }

    fn resolve_members(&self, owner: &str, fields: &[(&str, &str)]) -> Result<Vec<(String, Type)>, TypeError> {
        fields
            .iter()
            .map(|(field, token)| Ok((field.to_string(), self.resolve_member(owner, token)?)))
            .collect()
    }

    fn resolve_member(&self, owner: &str, token: &str) -> Result<Type, TypeError> {
        let token = token.trim();
        let base = token.trim_end_matches(|c: char| c == '*' || c.is_whitespace());
        if base != owner {
            return self.resolve(token);
        }
        let depth = token.len() - token.trim_end_matches('*').len();
        if depth == 0 {
            return Err(TypeError::SelfReferential(owner.to_string()));
        }
        let mut ty = Type::opaque(owner);
        for _ in 0..depth {
            ty = Type::pointer_to(ty);
        }
        Ok(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Primitive;
    use rstest::rstest;

    #[rstest]
    #[case("int*", "int*")]
    #[case("char**", "char**")]
    #[case("void *", "void*")]
    #[case("double[4]", "double[4]")]
    #[case("uint8[]", "uint8[]")]
    #[case("string", "char*")]
    fn test_resolve_tokens(#[case] token: &str, #[case] name: &str) {
        let registry = TypeRegistry::new();
        assert_eq!(registry.resolve(token).unwrap().name(), name);
    }

    #[test]
    fn test_char_pointer_is_a_string() {
        let registry = TypeRegistry::new();
        let ty = registry.resolve("char*").unwrap();
        assert_eq!(ty.primitive(), Some(Primitive::CString));
        let ptr = registry.resolve("char**").unwrap();
        assert_eq!(ptr.pointee().and_then(Type::primitive), Some(Primitive::CString));
    }

    #[test]
    fn test_unknown_token() {
        let registry = TypeRegistry::new();
        assert_eq!(
            registry.resolve("quaternion*").unwrap_err(),
            TypeError::UnknownType("quaternion".to_string())
        );
        assert!(registry.resolve("int[x]").is_err());
    }

    #[test]
    fn test_self_reference_requires_pointer() {
        let mut registry = TypeRegistry::new();
        let err = registry
            .define_struct("Node", &[("value", "int"), ("next", "Node")])
            .unwrap_err();
        assert_eq!(err, TypeError::SelfReferential("Node".to_string()));

        let node = registry
            .define_struct("Node", &[("value", "int"), ("next", "Node*")])
            .unwrap();
        assert_eq!(node.fields()[1].ty, Type::pointer_to(Type::opaque("Node")));
        assert!(registry.contains("Node"));
    }

    #[test]
    fn test_primitives_cannot_be_shadowed() {
        let mut registry = TypeRegistry::new();
        assert_eq!(
            registry.register("int", Type::long()).unwrap_err(),
            TypeError::AlreadyRegistered("int".to_string())
        );
    }
}
