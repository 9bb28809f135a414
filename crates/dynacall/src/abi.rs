//! Lowering of [`Type`]s to libffi call descriptions
//!
//! libffi has no union or array types. Unions become a struct holding their
//! most-aligned member padded with bytes up to the union's size; arrays
//! embedded in composites become that many repeated element fields. Arrays
//! in argument position decay to pointers, as in C.
//!
//! The padding bytes classify as integers, so a union holding floating-point
//! members passes by value only when it has no integer members and its
//! most-aligned member spans the whole union. Other unions must be passed
//! by pointer.

use crate::error::TypeError;
use crate::types::{Primitive, Type};
use libffi::low;
use libffi::middle::{Cif, Type as FfiType};

fn lower_primitive(kind: Primitive) -> FfiType {
    match kind {
        Primitive::Void => FfiType::void(),
        Primitive::Int8 => FfiType::i8(),
        Primitive::UInt8 | Primitive::Bool => FfiType::u8(),
        Primitive::Int16 => FfiType::i16(),
        Primitive::UInt16 => FfiType::u16(),
        Primitive::Int32 => FfiType::i32(),
        Primitive::UInt32 => FfiType::u32(),
        Primitive::Int64 => FfiType::i64(),
        Primitive::UInt64 => FfiType::u64(),
        Primitive::Float => FfiType::f32(),
        Primitive::Double => FfiType::f64(),
        Primitive::Pointer | Primitive::CString => FfiType::pointer(),
    }
}

/// Lower a type passed or stored by value
pub(crate) fn lower(ty: &Type) -> Result<FfiType, TypeError> {
    Ok(match ty {
        Type::Primitive(p) => lower_primitive(p.kind),
        Type::Pointer(_) => FfiType::pointer(),
        Type::Struct(st) => {
            let mut members = Vec::with_capacity(st.fields().len());
            for field in st.fields() {
                lower_into(&field.ty, &mut members)?;
            }
            FfiType::structure(members)
        }
        Type::Union(un) => {
            let widest = un.widest_aligned();
            if has_float(ty) && (has_integer(ty) || widest.ty.size() < un.size()) {
                return Err(TypeError::NotPassable(ty.name()));
            }
            let mut members = vec![lower(&widest.ty)?];
            members.extend((widest.ty.size()..un.size()).map(|_| FfiType::u8()));
            FfiType::structure(members)
        }
        Type::Array(arr) => {
            let mut members = Vec::new();
            lower_into(ty, &mut members)?;
            if members.is_empty() {
                return Err(TypeError::NotPassable(arr.element().name()));
            }
            FfiType::structure(members)
        }
        Type::Opaque(_) => return Err(TypeError::NotPassable(ty.name())),
    })
}

fn has_float(ty: &Type) -> bool {
    match ty {
        Type::Primitive(p) => p.kind.is_float(),
        Type::Array(arr) => has_float(arr.element()),
        Type::Struct(_) | Type::Union(_) => ty.fields().iter().any(|f| has_float(&f.ty)),
        Type::Pointer(_) | Type::Opaque(_) => false,
    }
}

fn has_integer(ty: &Type) -> bool {
    match ty {
        Type::Primitive(p) => !p.kind.is_float() && p.kind != Primitive::Void,
        Type::Pointer(_) => true,
        Type::Array(arr) => has_integer(arr.element()),
        Type::Struct(_) | Type::Union(_) => ty.fields().iter().any(|f| has_integer(&f.ty)),
        Type::Opaque(_) => false,
    }
}

/// Append the member list of a composite field, flattening arrays
fn lower_into(ty: &Type, members: &mut Vec<FfiType>) -> Result<(), TypeError> {
    match ty {
        Type::Array(arr) => {
            let len = arr.length().ok_or_else(|| TypeError::Unsized(ty.name()))?;
            for _ in 0..len {
                lower_into(arr.element(), members)?;
            }
        }
        other => members.push(lower(other)?),
    }
    Ok(())
}

/// Lower a type in argument position
pub(crate) fn lower_argument(ty: &Type) -> Result<FfiType, TypeError> {
    ty.check_argument()?;
    match ty {
        Type::Array(_) => Ok(FfiType::pointer()),
        other => lower(other),
    }
}

/// Prepared call interface for one signature
///
/// The CIF is immutable after preparation and only read by libffi, so one
/// instance is shared by every thread calling the same binding.
pub(crate) struct CallInterface {
    cif: Cif,
}

// SAFETY: libffi never writes to a prepared `ffi_cif`; the referenced type
// descriptions are owned by the `Cif` and live as long as it does.
unsafe impl Send for CallInterface {}
unsafe impl Sync for CallInterface {}

impl CallInterface {
    pub(crate) fn new(args: &[Type], ret: &Type) -> Result<Self, TypeError> {
        ret.check_return()?;
        let lowered_args = args.iter().map(lower_argument).collect::<Result<Vec<_>, _>>()?;
        let lowered_ret = lower(ret)?;
        Ok(Self {
            cif: Cif::new(lowered_args, lowered_ret),
        })
    }

    pub(crate) fn as_raw_ptr(&self) -> *mut low::ffi_cif {
        self.cif.as_raw_ptr()
    }

    pub(crate) fn cif(&self) -> &Cif {
        &self.cif
    }
}
