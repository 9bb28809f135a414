//! Value marshaling - host values ↔ native memory
//!
//! Encoding writes a [`Value`] into memory laid out as a [`Type`]; decoding
//! reads it back. Composites recurse field by field or element by element.
//!
//! # Memory Safety
//!
//! - Strings, temporary buffers and callbacks created while encoding are
//!   pinned in the `MarshalContext` and live as long as it does, or, for
//!   writes into a [`Reference`], as long as the slot referring to them
//! - Numeric conversions are range checked and never wrap silently
//! - Decoding a null `char*` yields `Value::Null`

use crate::error::{MarshalError, TypeError};
use crate::reference::{Pin, Reference};
use crate::types::{Primitive, PrimitiveType, Raw, Type};
use crate::value::{Pointer, Value};
use libffi::low::{ffi_arg, ffi_sarg};
use std::ffi::{CStr, CString};
use std::mem::size_of;
use std::os::raw::c_char;
use std::ptr;

/// How non-integral numbers become integers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Conversion {
    /// Fractional values are rejected
    #[default]
    Strict,
    /// Fractional values truncate toward zero, as a C cast does
    Truncate,
}

fn mismatch(expected: &Type, value: &Value) -> MarshalError {
    MarshalError::TypeMismatch {
        expected: expected.name(),
        got: value.kind().to_string(),
    }
}

fn prim_mismatch(prim: &PrimitiveType, value: &Value) -> MarshalError {
    MarshalError::TypeMismatch {
        expected: prim.name.to_string(),
        got: value.kind().to_string(),
    }
}

fn buffer_error(ty: &Type, err: TypeError) -> MarshalError {
    MarshalError::TypeMismatch {
        expected: ty.name(),
        got: err.to_string(),
    }
}

/// Whether a reference to `actual` may stand in for a `target*`
fn pointee_matches(target: &Type, actual: &Type) -> bool {
    if target.is_void() || matches!(target, Type::Opaque(_)) || target == actual {
        return true;
    }
    if actual.element() == Some(target) {
        return true;
    }
    match target.element() {
        Some(element) => actual.element() == Some(element) || actual == element,
        None => false,
    }
}

/// Integer primitive narrower than the libffi return register, if any
fn widened(ty: &Type) -> Option<PrimitiveType> {
    match ty {
        Type::Primitive(p)
            if (p.kind.is_integer() || p.kind == Primitive::Bool)
                && p.kind.size() < size_of::<ffi_arg>() =>
        {
            Some(*p)
        }
        _ => None,
    }
}

/// Bytes a return buffer must provide for `ty`
pub(crate) fn return_slot_size(ty: &Type) -> usize {
    ty.size().max(size_of::<ffi_arg>())
}

/// What an encoded slot refers to outside the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum SlotKind {
    /// A pointer or `char*` slot
    Address,
    /// Bytes copied from a reference, which may hold pointers of its own
    Copy,
}

/// A slot written by [`MarshalContext::encode`] and the allocation it keeps alive
pub(crate) struct PinnedSlot {
    pub(crate) kind: SlotKind,
    pub(crate) addr: usize,
    pub(crate) pin: Option<Pin>,
}

struct SlotWrite {
    kind: SlotKind,
    addr: usize,
    pin: Option<usize>,
}

/// Encoding state for one call or one write
///
/// Owns every allocation made on behalf of the encoded values.
pub(crate) struct MarshalContext {
    pins: Vec<Pin>,
    slots: Vec<SlotWrite>,
    conversion: Conversion,
}

impl MarshalContext {
    pub(crate) fn new() -> Self {
        Self::with_conversion(Conversion::Strict)
    }

    pub(crate) fn with_conversion(conversion: Conversion) -> Self {
        Self {
            pins: Vec::new(),
            slots: Vec::new(),
            conversion,
        }
    }

    pub(crate) fn into_pins(self) -> Vec<Pin> {
        self.pins
    }

    /// Pins grouped by the slot that refers to them
    ///
    /// Every slot written is listed, including those left holding nothing
    /// that needs to stay alive.
    pub(crate) fn into_slots(self) -> Vec<PinnedSlot> {
        let mut pins: Vec<Option<Pin>> = self.pins.into_iter().map(Some).collect();
        self.slots
            .into_iter()
            .map(|slot| PinnedSlot {
                kind: slot.kind,
                addr: slot.addr,
                pin: slot.pin.and_then(|i| pins.get_mut(i).and_then(Option::take)),
            })
            .collect()
    }

    /// Attribute the pin pushed since `held`, if any, to the slot at `dst`
    fn mark(&mut self, kind: SlotKind, dst: *mut u8, held: usize) {
        let pin = (self.pins.len() > held).then(|| self.pins.len() - 1);
        self.slots.push(SlotWrite {
            kind,
            addr: dst as usize,
            pin,
        });
    }

    /// Encode `value` as `ty` at `dst`
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of `ty.size()` bytes.
    pub(crate) unsafe fn encode(&mut self, ty: &Type, value: &Value, dst: *mut u8) -> Result<(), MarshalError> {
        match ty {
            Type::Primitive(prim) => {
                let raw = match prim.kind {
                    Primitive::Void if value.is_null() => return Ok(()),
                    Primitive::Void => return Err(prim_mismatch(prim, value)),
                    Primitive::Bool => to_bool(prim, value)?,
                    Primitive::Float | Primitive::Double => to_float(prim, value)?,
                    Primitive::Pointer | Primitive::CString => {
                        let held = self.pins.len();
                        let addr = if prim.kind == Primitive::Pointer {
                            self.address_of(value, None)?
                        } else {
                            self.c_string(value)?
                        };
                        self.mark(SlotKind::Address, dst, held);
                        Raw::Address(addr)
                    }
                    _ => self.to_integer(prim, value)?,
                };
                prim.kind.store(dst, raw);
                Ok(())
            }
            Type::Pointer(target) => {
                let held = self.pins.len();
                let addr = self.address_of(value, Some(target))?;
                self.mark(SlotKind::Address, dst, held);
                Primitive::Pointer.store(dst, Raw::Address(addr));
                Ok(())
            }
            Type::Array(arr) => match value {
                Value::Array(items) => {
                    if let Some(len) = arr.length() {
                        if items.len() != len {
                            return Err(MarshalError::LengthMismatch {
                                expected: len,
                                got: items.len(),
                            });
                        }
                    }
                    let step = arr.element().size();
                    for (i, item) in items.iter().enumerate() {
                        self.encode(arr.element(), item, dst.add(i * step))?;
                    }
                    Ok(())
                }
                Value::Ref(src) => self.copy_from(ty, src, dst),
                _ => Err(mismatch(ty, value)),
            },
            Type::Struct(_) | Type::Union(_) => match value {
                Value::Record(entries) => {
                    for (name, item) in entries {
                        let field = ty
                            .fields()
                            .iter()
                            .find(|f| &f.name == name)
                            .ok_or_else(|| MarshalError::UnknownField(name.clone()))?;
                        self.encode(&field.ty, item, dst.add(field.offset))?;
                    }
                    Ok(())
                }
                Value::Ref(src) => self.copy_from(ty, src, dst),
                _ => Err(mismatch(ty, value)),
            },
            Type::Opaque(_) => Err(mismatch(ty, value)),
        }
    }

    /// Encode a function argument; arrays are passed by address
    ///
    /// # Safety
    ///
    /// As for [`MarshalContext::encode`], with arrays needing a pointer-sized slot.
    pub(crate) unsafe fn encode_argument(&mut self, ty: &Type, value: &Value, dst: *mut u8) -> Result<(), MarshalError> {
        if let Type::Array(_) = ty {
            let addr = self.address_of(value, Some(ty))?;
            Primitive::Pointer.store(dst, Raw::Address(addr));
            return Ok(());
        }
        self.encode(ty, value, dst)
    }

    /// Encode a value returned to native code
    ///
    /// Small integers fill the whole return register.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of [`return_slot_size`] bytes.
    pub(crate) unsafe fn encode_return(&mut self, ty: &Type, value: &Value, dst: *mut u8) -> Result<(), MarshalError> {
        if ty.is_void() {
            return Ok(());
        }
        if let Some(prim) = widened(ty) {
            let raw = match prim.kind {
                Primitive::Bool => to_bool(&prim, value)?,
                _ => self.to_integer(&prim, value)?,
            };
            if prim.kind.is_signed() {
                ptr::write_unaligned(dst.cast::<ffi_sarg>(), raw.bits() as i64 as ffi_sarg);
            } else {
                ptr::write_unaligned(dst.cast::<ffi_arg>(), raw.bits() as ffi_arg);
            }
            return Ok(());
        }
        self.encode(ty, value, dst)
    }

    /// Copy the bytes behind a reference of exactly the type `ty`
    ///
    /// The source stays alive while the copy may point into its own pins.
    unsafe fn copy_from(&mut self, ty: &Type, src: &Reference, dst: *mut u8) -> Result<(), MarshalError> {
        if src.ty() != ty {
            return Err(MarshalError::TypeMismatch {
                expected: ty.name(),
                got: src.ty().name(),
            });
        }
        ptr::copy(src.as_ptr(), dst, ty.size());
        let held = self.pins.len();
        if src.holds_pins() {
            self.pins.push(Pin::Buffer(src.clone()));
        }
        self.mark(SlotKind::Copy, dst, held);
        Ok(())
    }

    fn to_integer(&self, prim: &PrimitiveType, value: &Value) -> Result<Raw, MarshalError> {
        let (min, max) = prim.kind.int_bounds().ok_or_else(|| prim_mismatch(prim, value))?;
        let n: i128 = match *value {
            Value::Int(v) => v as i128,
            Value::UInt(v) => v as i128,
            Value::Bool(b) => b as i128,
            Value::Float(f) => {
                if !f.is_finite() {
                    return Err(MarshalError::NumberOutOfRange {
                        value: f.to_string(),
                        target: prim.name.to_string(),
                    });
                }
                let whole = f.trunc();
                if whole != f && self.conversion == Conversion::Strict {
                    return Err(MarshalError::FractionalNumber {
                        value: f,
                        target: prim.name.to_string(),
                    });
                }
                whole as i128
            }
            _ => return Err(prim_mismatch(prim, value)),
        };
        if n < min || n > max {
            let shown = match *value {
                Value::Float(f) => f.to_string(),
                _ => n.to_string(),
            };
            return Err(MarshalError::NumberOutOfRange {
                value: shown,
                target: prim.name.to_string(),
            });
        }
        Ok(if prim.kind.is_signed() {
            Raw::Signed(n as i64)
        } else {
            Raw::Unsigned(n as u64)
        })
    }

    fn c_string(&mut self, value: &Value) -> Result<usize, MarshalError> {
        match value {
            Value::String(s) => Ok(self.pin_c_string(s)?),
            Value::Null => Ok(0),
            Value::Pointer(p) => Ok(p.addr()),
            Value::Ref(r) => {
                self.pins.push(Pin::Buffer(r.clone()));
                Ok(r.address().addr())
            }
            _ => Err(mismatch(&Type::c_string(), value)),
        }
    }

    fn pin_c_string(&mut self, s: &str) -> Result<usize, MarshalError> {
        let c_string = CString::new(s).map_err(|e| MarshalError::InvalidString(format!("String contains null byte: {}", e)))?;
        let addr = c_string.as_ptr() as usize;
        self.pins.push(Pin::String(c_string));
        Ok(addr)
    }

    /// Address for a pointer slot, with `target` the declared pointee
    fn address_of(&mut self, value: &Value, target: Option<&Type>) -> Result<usize, MarshalError> {
        match value {
            Value::Null => Ok(0),
            Value::Pointer(p) => Ok(p.addr()),
            Value::Ref(r) => {
                if let Some(target) = target {
                    if !pointee_matches(target, r.ty()) {
                        return Err(MarshalError::TypeMismatch {
                            expected: format!("{}*", target.name()),
                            got: format!("{}*", r.ty().name()),
                        });
                    }
                }
                self.pins.push(Pin::Buffer(r.clone()));
                Ok(r.address().addr())
            }
            Value::Callback(cb) if target.map_or(true, Type::is_void) => {
                self.pins.push(Pin::Callback(cb.clone()));
                Ok(cb.code_ptr().addr())
            }
            Value::String(s)
                if target.map_or(true, |t| {
                    matches!(t.primitive(), Some(Primitive::Int8 | Primitive::UInt8))
                }) =>
            {
                self.pin_c_string(s)
            }
            Value::Array(_) | Value::Record(_) if target.is_some_and(|t| t.size() > 0 || t.element().is_some()) => {
                let target = target.cloned().unwrap_or_else(Type::void);
                let ty = match (&target, value) {
                    (Type::Array(arr), Value::Array(items)) if arr.length().is_none() => {
                        Type::array(arr.element().clone(), items.len())
                    }
                    (Type::Array(_), _) => Ok(target.clone()),
                    (_, Value::Array(items)) => Type::array(target.clone(), items.len()),
                    _ => Ok(target.clone()),
                }
                .map_err(|e| buffer_error(&target, e))?;
                let buffer = Reference::alloc(&ty).map_err(|e| buffer_error(&ty, e))?;
                buffer.store(value)?;
                let addr = buffer.address().addr();
                self.pins.push(Pin::Buffer(buffer));
                Ok(addr)
            }
            _ => Err(match target {
                Some(t) => mismatch(&Type::pointer_to(t.clone()), value),
                None => mismatch(&Type::pointer(), value),
            }),
        }
    }
}

fn to_bool(prim: &PrimitiveType, value: &Value) -> Result<Raw, MarshalError> {
    match *value {
        Value::Bool(b) => Ok(Raw::Unsigned(b as u64)),
        Value::Int(v) => Ok(Raw::Unsigned((v != 0) as u64)),
        Value::UInt(v) => Ok(Raw::Unsigned((v != 0) as u64)),
        _ => Err(prim_mismatch(prim, value)),
    }
}

fn to_float(prim: &PrimitiveType, value: &Value) -> Result<Raw, MarshalError> {
    let f = value.as_f64().ok_or_else(|| prim_mismatch(prim, value))?;
    if prim.kind == Primitive::Float && f.is_finite() && f.abs() > f32::MAX as f64 {
        return Err(MarshalError::NumberOutOfRange {
            value: f.to_string(),
            target: prim.name.to_string(),
        });
    }
    Ok(Raw::Float(f))
}

fn scalar_value(kind: Primitive, raw: Raw) -> Result<Value, MarshalError> {
    Ok(match kind {
        Primitive::Void => Value::Null,
        Primitive::Bool => Value::Bool(raw.bits() != 0),
        Primitive::Float | Primitive::Double => Value::Float(raw.as_f64()),
        Primitive::Pointer => Value::Pointer(Pointer::from_addr(raw.bits() as usize)),
        Primitive::CString => {
            let addr = raw.bits() as usize;
            if addr == 0 {
                Value::Null
            } else {
                // SAFETY: a non-null `char*` is trusted to be NUL-terminated.
                let s = unsafe { CStr::from_ptr(addr as *const c_char) };
                let s = s
                    .to_str()
                    .map_err(|e| MarshalError::InvalidString(format!("Invalid UTF-8: {}", e)))?;
                Value::from(s)
            }
        }
        k if k.is_signed() => Value::Int(raw.bits() as i64),
        _ => Value::UInt(raw.bits()),
    })
}

/// Decode a `ty` at `src`; composites are copied into owned memory
///
/// # Safety
///
/// `src` must be valid for reads of `ty.size()` bytes.
pub(crate) unsafe fn decode(ty: &Type, src: *const u8) -> Result<Value, MarshalError> {
    match ty {
        Type::Primitive(prim) => scalar_value(prim.kind, prim.kind.load(src)),
        Type::Pointer(_) => Ok(Value::Pointer(Pointer::from_addr(
            Primitive::Pointer.load(src).bits() as usize,
        ))),
        Type::Array(_) | Type::Struct(_) | Type::Union(_) => {
            let copy = Reference::alloc(ty).map_err(|e| buffer_error(ty, e))?;
            ptr::copy_nonoverlapping(src, copy.as_ptr(), ty.size());
            Ok(Value::Ref(copy))
        }
        Type::Opaque(_) => Err(MarshalError::TypeMismatch {
            expected: "sized type".to_string(),
            got: ty.name(),
        }),
    }
}

/// Decode an argument received by a callback; arrays arrive by address
///
/// # Safety
///
/// As for [`decode`]; array arguments must point to valid arrays.
pub(crate) unsafe fn decode_argument(ty: &Type, src: *const u8) -> Result<Value, MarshalError> {
    match ty {
        Type::Array(arr) => {
            let addr = Pointer::from_addr(Primitive::Pointer.load(src).bits() as usize);
            if addr.is_null() {
                Ok(Value::Null)
            } else if arr.length().is_some() {
                Ok(Value::Ref(Reference::borrowed(addr, ty.clone())))
            } else {
                Ok(Value::Pointer(addr))
            }
        }
        _ => decode(ty, src),
    }
}

/// Decode a native return value from its libffi return buffer
///
/// # Safety
///
/// `src` must be valid for reads of [`return_slot_size`] bytes.
pub(crate) unsafe fn decode_return(ty: &Type, src: *const u8) -> Result<Value, MarshalError> {
    if let Some(prim) = widened(ty) {
        let word = ptr::read_unaligned(src.cast::<ffi_arg>()) as u64;
        return scalar_value(prim.kind, prim.kind.narrow(word));
    }
    decode(ty, src)
}

/// Decode a `ty` at `src` entirely into host values
///
/// # Safety
///
/// `src` must be valid for reads of `ty.size()` bytes.
pub(crate) unsafe fn decode_deep(ty: &Type, src: *const u8) -> Result<Value, MarshalError> {
    match ty {
        Type::Array(arr) => {
            let len = arr
                .length()
                .ok_or_else(|| MarshalError::UnknownLength(arr.element().name()))?;
            let step = arr.element().size();
            let items = (0..len)
                .map(|i| decode_deep(arr.element(), src.add(i * step)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(items))
        }
        Type::Struct(_) | Type::Union(_) => {
            let fields = ty
                .fields()
                .iter()
                .map(|f| Ok((f.name.clone(), decode_deep(&f.ty, src.add(f.offset))?)))
                .collect::<Result<Vec<_>, MarshalError>>()?;
            Ok(Value::Record(fields))
        }
        _ => decode(ty, src),
    }
}
