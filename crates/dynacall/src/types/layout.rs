//! Composite layouts
//!
//! Field placement follows the C rules: each field starts at the running
//! offset rounded up to its own alignment, and the composite's size is
//! rounded up to its strictest member alignment.

use super::Type;
use crate::error::TypeError;
use std::collections::HashSet;

/// A named member of a struct or union
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: Type,
    pub offset: usize,
}

/// Round `offset` up to the next multiple of `align`
pub fn align_up(offset: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    offset.checked_add(align - 1).map(|v| v & !(align - 1))
}

fn validate_members(kind: &'static str, members: &[(String, Type)]) -> Result<(), TypeError> {
    if members.is_empty() {
        return Err(TypeError::EmptyComposite(kind));
    }
    let mut seen = HashSet::new();
    for (name, ty) in members {
        if !seen.insert(name.as_str()) {
            return Err(TypeError::DuplicateField(name.clone()));
        }
        if ty.size() == 0 {
            return Err(TypeError::ZeroSizedField(name.clone()));
        }
    }
    Ok(())
}

/// Fixed-layout record
#[derive(Debug, Clone, PartialEq)]
pub struct StructType {
    name: Option<String>,
    fields: Vec<Field>,
    size: usize,
    align: usize,
}

impl StructType {
    pub(crate) fn new(name: Option<String>, members: Vec<(String, Type)>) -> Result<Self, TypeError> {
        validate_members("struct", &members)?;
        let label = || name.clone().unwrap_or_else(|| "struct".to_string());

        let mut fields = Vec::with_capacity(members.len());
        let mut offset = 0usize;
        let mut align = 1usize;
        for (field_name, ty) in members {
            let field_align = ty.align();
            offset = align_up(offset, field_align).ok_or_else(|| TypeError::LayoutOverflow(label()))?;
            let next = offset
                .checked_add(ty.size())
                .ok_or_else(|| TypeError::LayoutOverflow(label()))?;
            fields.push(Field {
                name: field_name,
                ty,
                offset,
            });
            offset = next;
            align = align.max(field_align);
        }
        let size = align_up(offset, align).ok_or_else(|| TypeError::LayoutOverflow(label()))?;

        Ok(Self {
            name,
            fields,
            size,
            align,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }
}

/// Overlapping record; every member sits at offset zero
#[derive(Debug, Clone, PartialEq)]
pub struct UnionType {
    name: Option<String>,
    fields: Vec<Field>,
    size: usize,
    align: usize,
}

impl UnionType {
    pub(crate) fn new(name: Option<String>, members: Vec<(String, Type)>) -> Result<Self, TypeError> {
        validate_members("union", &members)?;

        let align = members.iter().map(|(_, ty)| ty.align()).max().unwrap_or(1);
        let widest = members.iter().map(|(_, ty)| ty.size()).max().unwrap_or(0);
        let size = align_up(widest, align).ok_or_else(|| {
            TypeError::LayoutOverflow(name.clone().unwrap_or_else(|| "union".to_string()))
        })?;
        let fields = members
            .into_iter()
            .map(|(name, ty)| Field {
                name,
                ty,
                offset: 0,
            })
            .collect();

        Ok(Self {
            name,
            fields,
            size,
            align,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The member that dictates the union's alignment
    pub fn widest_aligned(&self) -> &Field {
        // Construction guarantees at least one member.
        let mut best = &self.fields[0];
        for field in &self.fields[1..] {
            let (a, b) = (field.ty.align(), best.ty.align());
            if a > b || (a == b && field.ty.size() > best.ty.size()) {
                best = field;
            }
        }
        best
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }
}

/// Homogeneous sequence, optionally without a fixed length
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayType {
    element: Type,
    length: Option<usize>,
}

impl ArrayType {
    pub(crate) fn new(element: Type, length: Option<usize>) -> Result<Self, TypeError> {
        if element.size() == 0 {
            return Err(TypeError::Unsized(element.name()));
        }
        if let Some(len) = length {
            if element.size().checked_mul(len).is_none() {
                return Err(TypeError::LayoutOverflow(format!("{}[{}]", element.name(), len)));
            }
        }
        Ok(Self { element, length })
    }

    pub fn element(&self) -> &Type {
        &self.element
    }

    /// `None` for arrays whose length is fixed only when a buffer is created
    pub fn length(&self) -> Option<usize> {
        self.length
    }

    /// Zero for unsized arrays
    pub fn size(&self) -> usize {
        self.length.map_or(0, |len| len * self.element.size())
    }

    pub fn align(&self) -> usize {
        self.element.align()
    }
}
