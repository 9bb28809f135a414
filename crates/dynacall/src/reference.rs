//! Typed views over native memory
//!
//! A [`Reference`] pairs an address with a [`Type`]. Memory is either owned
//! (allocated here, freed when the last view drops) or borrowed (supplied by
//! native code, never freed). Sub-views created with [`Reference::element`]
//! or [`Reference::field`] share the parent's memory and keep it alive.
//!
//! # Example
//!
//! ```
//! use dynacall::{Reference, Type, Value};
//!
//! let rec = Type::structure([("values", Type::array(Type::int(), 3).unwrap()), ("index", Type::uint())]).unwrap();
//! let buf = Reference::alloc(&rec).unwrap();
//! buf.set_field("index", &Value::from(4)).unwrap();
//! buf.field("values").unwrap().set(1, &Value::from(-7)).unwrap();
//!
//! assert_eq!(buf.get_field("index").unwrap(), 4);
//! assert_eq!(buf.field("values").unwrap().get(1).unwrap(), -7);
//! ```

use crate::callback::Callback;
use crate::error::{Error, MarshalError, TypeError};
use crate::marshal::{self, MarshalContext, PinnedSlot, SlotKind};
use crate::types::{Primitive, Type};
use crate::value::{Pointer, Value};
use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::fmt;
use std::os::raw::c_char;
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError};

/// Allocation kept alive by the memory it is referenced from
pub(crate) enum Pin {
    String(CString),
    Buffer(Reference),
    Callback(Callback),
}

impl Pin {
    /// Address native code sees for the pinned allocation
    pub(crate) fn address(&self) -> usize {
        match self {
            Pin::String(s) => s.as_ptr() as usize,
            Pin::Buffer(r) => r.address().addr(),
            Pin::Callback(cb) => cb.code_ptr().addr(),
        }
    }

    fn keeps(&self, memory: &Arc<Memory>) -> bool {
        matches!(self, Pin::Buffer(r) if Arc::ptr_eq(&r.memory, memory))
    }
}

struct Memory {
    base: *mut u8,
    /// Known length in bytes; `None` for borrowed memory
    extent: Option<usize>,
    /// Set when this crate allocated the memory
    layout: Option<Layout>,
    /// Allocations this memory points into, by the offset of the slot
    /// holding the pointer
    pins: Mutex<HashMap<(SlotKind, usize), Pin>>,
}

// SAFETY: `Memory` is a plain byte region. Concurrent access to its contents
// carries the same rules as in C and is the caller's responsibility.
unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

impl Memory {
    fn allocate(ty: &Type) -> Result<Memory, TypeError> {
        let size = ty.sized()?;
        let layout = Layout::from_size_align(size, ty.align())
            .map_err(|_| TypeError::LayoutOverflow(ty.name()))?;
        // SAFETY: `layout` has a non-zero size.
        let base = unsafe { alloc::alloc_zeroed(layout) };
        if base.is_null() {
            alloc::handle_alloc_error(layout);
        }
        Ok(Memory {
            base,
            extent: Some(size),
            layout: Some(layout),
            pins: Mutex::new(HashMap::new()),
        })
    }

    fn borrowed(base: *mut u8) -> Memory {
        Memory {
            base,
            extent: None,
            layout: None,
            pins: Mutex::new(HashMap::new()),
        }
    }

    /// Record what each rewritten slot now refers to
    ///
    /// A slot's previous pin is released once the slot no longer needs it.
    fn pin(self: &Arc<Self>, slots: Vec<PinnedSlot>) {
        if slots.is_empty() {
            return;
        }
        let base = self.base as usize;
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        for slot in slots {
            let key = (slot.kind, slot.addr.wrapping_sub(base));
            // A view of this same memory needs no pin to stay alive.
            match slot.pin.filter(|pin| !pin.keeps(self)) {
                Some(pin) => {
                    pins.insert(key, pin);
                }
                None => {
                    pins.remove(&key);
                }
            }
        }
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: allocated in `Memory::allocate` with this layout.
            unsafe { alloc::dealloc(self.base, layout) }
        }
    }
}

/// Typed view of native memory
#[derive(Clone)]
pub struct Reference {
    memory: Arc<Memory>,
    offset: usize,
    ty: Type,
}

impl Reference {
    fn new(memory: Memory, ty: Type) -> Self {
        Self {
            memory: Arc::new(memory),
            offset: 0,
            ty,
        }
    }

    fn view(&self, offset: usize, ty: Type) -> Self {
        Self {
            memory: Arc::clone(&self.memory),
            offset: self.offset + offset,
            ty,
        }
    }

    /// Allocate zeroed memory for one value of `ty`
    pub fn alloc(ty: &Type) -> Result<Reference, TypeError> {
        Ok(Self::new(Memory::allocate(ty)?, ty.clone()))
    }

    /// Allocate a `length`-element array of `element`
    pub fn alloc_array(element: &Type, length: usize) -> Result<Reference, TypeError> {
        Self::alloc(&Type::array(element.clone(), length)?)
    }

    /// Allocate and initialize from a host value
    ///
    /// An unsized array type takes its length from an array literal.
    pub fn from_value(ty: &Type, value: &Value) -> Result<Reference, Error> {
        let ty = match (ty, value) {
            (Type::Array(arr), Value::Array(items)) if arr.length().is_none() => {
                Type::array(arr.element().clone(), items.len())?
            }
            (Type::Array(arr), Value::Ref(src)) if arr.length().is_none() => src.ty.clone(),
            _ => ty.clone(),
        };
        let reference = Self::alloc(&ty)?;
        reference.store(value)?;
        Ok(reference)
    }

    /// Instantiate an array of `element` holding `values`
    pub fn array_of(element: &Type, values: &[Value]) -> Result<Reference, Error> {
        Self::from_value(
            &Type::array(element.clone(), values.len())?,
            &Value::Array(values.to_vec()),
        )
    }

    /// Allocate a NUL-terminated copy of `s`
    pub fn alloc_c_string(s: &str) -> Result<Reference, Error> {
        let reference = Self::alloc_array(&Type::char(), s.len() + 1)?;
        write_c_string(&reference, s)?;
        Ok(reference)
    }

    /// Wrap memory owned by someone else
    ///
    /// # Safety
    ///
    /// `address` must point to memory that holds a value of `ty` and stays
    /// valid for as long as the reference or any view derived from it is used.
    pub unsafe fn borrowed(address: Pointer, ty: Type) -> Reference {
        Self::new(Memory::borrowed(address.as_ptr()), ty)
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn address(&self) -> Pointer {
        Pointer::from_ptr(self.as_ptr())
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.memory.base.wrapping_add(self.offset)
    }

    pub fn size(&self) -> usize {
        self.ty.size()
    }

    /// Number of elements of an array reference
    pub fn len(&self) -> Option<usize> {
        match &self.ty {
            Type::Array(arr) => arr.length(),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Whether this crate allocated the underlying memory
    pub fn is_owned(&self) -> bool {
        self.memory.layout.is_some()
    }

    /// Bytes available from this view to the end of its allocation
    pub fn extent(&self) -> Option<usize> {
        self.memory.extent.map(|e| e.saturating_sub(self.offset))
    }

    fn check_span(&self, offset: usize, size: usize) -> Result<(), MarshalError> {
        if let Some(extent) = self.extent() {
            if offset.checked_add(size).map_or(true, |end| end > extent) {
                return Err(MarshalError::OutOfExtent {
                    offset: offset as isize,
                    size,
                    extent,
                });
            }
        }
        Ok(())
    }

    /// Read a value of `ty` at a byte offset
    ///
    /// Scalars decode to host values; composites come back as views.
    pub fn read(&self, offset: usize, ty: &Type) -> Result<Value, MarshalError> {
        self.check_span(offset, ty.size())?;
        if ty.is_composite() {
            return Ok(Value::Ref(self.view(offset, ty.clone())));
        }
        // SAFETY: the span was checked against the known extent; borrowed
        // memory is trusted per `Reference::borrowed`.
        unsafe { marshal::decode(ty, self.as_ptr().add(offset)) }
    }

    /// Write a value of `ty` at a byte offset
    ///
    /// An unsized array covers as many bytes as the value being written.
    pub fn write(&self, offset: usize, ty: &Type, value: &Value) -> Result<(), MarshalError> {
        self.check_span(offset, written_size(ty, value))?;
        let mut ctx = MarshalContext::new();
        // SAFETY: as in `read`.
        unsafe { ctx.encode(ty, value, self.as_ptr().add(offset))? };
        self.memory.pin(ctx.into_slots());
        Ok(())
    }

    /// Whether the memory keeps other allocations alive
    pub(crate) fn holds_pins(&self) -> bool {
        !self.memory.pins.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    #[cfg(test)]
    fn pinned(&self) -> usize {
        self.memory.pins.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Overwrite the whole referenced value
    pub fn store(&self, value: &Value) -> Result<(), MarshalError> {
        self.write(0, &self.ty, value)
    }

    fn element_slot(&self, index: usize) -> Result<(usize, &Type), MarshalError> {
        match &self.ty {
            Type::Array(arr) => {
                if let Some(len) = arr.length() {
                    if index >= len {
                        return Err(MarshalError::IndexOutOfBounds { index, len });
                    }
                }
                let offset = index
                    .checked_mul(arr.element().size())
                    .ok_or(MarshalError::IndexOutOfBounds {
                        index,
                        len: usize::MAX,
                    })?;
                Ok((offset, arr.element()))
            }
            other => Err(MarshalError::TypeMismatch {
                expected: "array".to_string(),
                got: other.name(),
            }),
        }
    }

    fn field_slot(&self, name: &str) -> Result<(usize, &Type), MarshalError> {
        let field = match &self.ty {
            Type::Struct(st) => st.field(name),
            Type::Union(un) => un.field(name),
            other => {
                return Err(MarshalError::TypeMismatch {
                    expected: "struct or union".to_string(),
                    got: other.name(),
                })
            }
        };
        field
            .map(|f| (f.offset, &f.ty))
            .ok_or_else(|| MarshalError::UnknownField(name.to_string()))
    }

    /// Array element at `index`
    pub fn get(&self, index: usize) -> Result<Value, MarshalError> {
        let (offset, ty) = self.element_slot(index)?;
        self.read(offset, ty)
    }

    pub fn set(&self, index: usize, value: &Value) -> Result<(), MarshalError> {
        let (offset, ty) = self.element_slot(index)?;
        self.write(offset, ty, value)
    }

    /// View of the array element at `index`
    pub fn element(&self, index: usize) -> Result<Reference, MarshalError> {
        let (offset, ty) = self.element_slot(index)?;
        let ty = ty.clone();
        self.check_span(offset, ty.size())?;
        Ok(self.view(offset, ty))
    }

    pub fn get_field(&self, name: &str) -> Result<Value, MarshalError> {
        let (offset, ty) = self.field_slot(name)?;
        self.read(offset, ty)
    }

    pub fn set_field(&self, name: &str, value: &Value) -> Result<(), MarshalError> {
        let (offset, ty) = self.field_slot(name)?;
        self.write(offset, ty, value)
    }

    /// View of the struct or union member `name`
    pub fn field(&self, name: &str) -> Result<Reference, MarshalError> {
        let (offset, ty) = self.field_slot(name)?;
        let ty = ty.clone();
        self.check_span(offset, ty.size())?;
        Ok(self.view(offset, ty))
    }

    /// Decode the whole value, composites included, into host values
    pub fn to_value(&self) -> Result<Value, MarshalError> {
        self.check_span(0, self.ty.size())?;
        // SAFETY: span checked above.
        unsafe { marshal::decode_deep(&self.ty, self.as_ptr()) }
    }

    /// Copy of the referenced bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, MarshalError> {
        let size = self.ty.size();
        self.check_span(0, size)?;
        let mut bytes = vec![0u8; size];
        // SAFETY: span checked above; `bytes` is a fresh allocation.
        unsafe { ptr::copy_nonoverlapping(self.as_ptr(), bytes.as_mut_ptr(), size) };
        Ok(bytes)
    }

    /// Same type, `bytes` further along in memory
    pub fn offset(&self, bytes: isize) -> Result<Reference, MarshalError> {
        let Some(extent) = self.memory.extent else {
            // SAFETY: borrowed memory carries no bounds to check against.
            return Ok(unsafe { Self::borrowed(self.address().offset(bytes), self.ty.clone()) });
        };
        let target = (self.offset as isize).checked_add(bytes);
        match target {
            Some(t) if t >= 0 && (t as usize) <= extent => Ok(Self {
                memory: Arc::clone(&self.memory),
                offset: t as usize,
                ty: self.ty.clone(),
            }),
            _ => Err(MarshalError::OutOfExtent {
                offset: bytes,
                size: 0,
                extent: self.extent().unwrap_or(0),
            }),
        }
    }

    /// Reinterpret the memory as `ty`
    pub fn cast(&self, ty: Type) -> Result<Reference, MarshalError> {
        self.check_span(0, ty.size())?;
        Ok(self.view(0, ty))
    }

    /// Follow a typed pointer
    ///
    /// # Safety
    ///
    /// The stored address is trusted: it must be null or point to a valid
    /// value of the pointee type for as long as the returned view is used.
    pub unsafe fn deref(&self) -> Result<Reference, MarshalError> {
        let target = self
            .ty
            .pointee()
            .ok_or_else(|| MarshalError::TypeMismatch {
                expected: "typed pointer".to_string(),
                got: self.ty.name(),
            })?
            .clone();
        self.deref_as(target)
    }

    /// Follow the address stored here, interpreting the target as `ty`
    ///
    /// # Safety
    ///
    /// As for [`Reference::deref`], with `ty` as the pointee type.
    pub unsafe fn deref_as(&self, ty: Type) -> Result<Reference, MarshalError> {
        if !self.ty.is_address() {
            return Err(MarshalError::TypeMismatch {
                expected: "pointer".to_string(),
                got: self.ty.name(),
            });
        }
        if ty.size() == 0 {
            return Err(MarshalError::TypeMismatch {
                expected: "sized pointee".to_string(),
                got: ty.name(),
            });
        }
        self.check_span(0, Primitive::Pointer.size())?;
        // SAFETY: span checked above.
        let raw = Primitive::Pointer.load(self.as_ptr());
        let address = Pointer::from_addr(raw.bits() as usize);
        if address.is_null() {
            return Err(MarshalError::NullPointer);
        }
        Ok(Self::borrowed(address, ty))
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("type", &self.ty.name())
            .field("address", &self.address())
            .field("owned", &self.is_owned())
            .finish()
    }
}

/// Bytes a write of `value` as `ty` touches
fn written_size(ty: &Type, value: &Value) -> usize {
    match (ty, value) {
        (Type::Array(arr), Value::Array(items)) if arr.length().is_none() => {
            items.len().saturating_mul(arr.element().size())
        }
        (Type::Array(arr), Value::Ref(src)) if arr.length().is_none() => src.size(),
        _ => ty.size(),
    }
}

/// Read the NUL-terminated string at `ptr`
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated byte sequence.
pub unsafe fn read_c_string(ptr: Pointer) -> Result<String, MarshalError> {
    if ptr.is_null() {
        return Err(MarshalError::NullPointer);
    }
    CStr::from_ptr(ptr.as_ptr::<c_char>())
        .to_str()
        .map(str::to_string)
        .map_err(|e| MarshalError::InvalidString(e.to_string()))
}

/// Write `s` and its terminator into the buffer behind `target`
///
/// The buffer must hold at least `s.len() + 1` bytes.
pub fn write_c_string(target: &Reference, s: &str) -> Result<(), MarshalError> {
    let bytes = CString::new(s).map_err(|e| MarshalError::InvalidString(e.to_string()))?;
    let bytes = bytes.as_bytes_with_nul();
    let capacity = target.extent().unwrap_or_else(|| target.size());
    if bytes.len() > capacity {
        return Err(MarshalError::OutOfExtent {
            offset: 0,
            size: bytes.len(),
            extent: capacity,
        });
    }
    // SAFETY: capacity checked above.
    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), target.as_ptr(), bytes.len()) };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_alloc_is_zeroed() {
        let buf = Reference::alloc(&Type::array(Type::int64(), 4).unwrap()).unwrap();
        assert_eq!(buf.to_bytes().unwrap(), vec![0u8; 32]);
        assert!(buf.is_owned());
    }

    #[test]
    fn test_views_share_memory() {
        let arr = Reference::alloc_array(&Type::int(), 3).unwrap();
        let second = arr.element(1).unwrap();
        second.store(&Value::from(9)).unwrap();
        assert_eq!(arr.get(1).unwrap(), 9);
        assert_eq!(second.address().addr(), arr.address().addr() + Type::int().size());
    }

    #[test]
    fn test_index_past_length_rejected() {
        let arr = Reference::alloc_array(&Type::int(), 2).unwrap();
        assert_eq!(
            arr.get(2).unwrap_err(),
            MarshalError::IndexOutOfBounds { index: 2, len: 2 }
        );
    }

    #[test]
    fn test_cast_larger_than_extent_rejected() {
        let small = Reference::alloc(&Type::int()).unwrap();
        assert!(matches!(
            small.cast(Type::double()),
            Err(MarshalError::OutOfExtent { .. })
        ));
        assert!(small.cast(Type::array(Type::uchar(), 4).unwrap()).is_ok());
    }

    #[test]
    fn test_offset_walks_an_array() {
        let arr = Reference::array_of(&Type::int(), &[1.into(), 2.into(), 3.into()]).unwrap();
        let first = arr.element(0).unwrap();
        let third = first.offset(2 * Type::int().size() as isize).unwrap();
        assert_eq!(third.to_value().unwrap(), 3);
        assert!(first.offset(-1).is_err());
        assert!(third.offset(64).is_err());
    }

    #[test]
    fn test_string_field_stays_alive() {
        let ty = Type::structure([("name", Type::c_string())]).unwrap();
        let rec = Reference::alloc(&ty).unwrap();
        rec.set_field("name", &Value::from("hello")).unwrap();
        assert_eq!(rec.get_field("name").unwrap(), "hello");
    }

    #[test]
    fn test_deref_typed_pointer() {
        let target = Reference::from_value(&Type::double(), &Value::from(2.5)).unwrap();
        let slot = Reference::alloc(&Type::pointer_to(Type::double())).unwrap();
        slot.store(&Value::from(&target)).unwrap();
        assert_eq!(unsafe { slot.deref() }.unwrap().to_value().unwrap(), 2.5);

        let empty = Reference::alloc(&Type::pointer_to(Type::double())).unwrap();
        assert_eq!(unsafe { empty.deref() }.unwrap_err(), MarshalError::NullPointer);
    }

    #[test]
    fn test_overwriting_a_string_field_replaces_its_pin() {
        let ty = Type::structure([("name", Type::c_string()), ("alias", Type::c_string())]).unwrap();
        let rec = Reference::alloc(&ty).unwrap();
        rec.set_field("alias", &Value::from("kept")).unwrap();
        for i in 0..100 {
            rec.set_field("name", &Value::from(format!("name-{}", i))).unwrap();
        }
        assert_eq!(rec.pinned(), 2);
        assert_eq!(rec.get_field("name").unwrap(), "name-99");
        assert_eq!(rec.get_field("alias").unwrap(), "kept");

        // Clearing a field releases only that field's string.
        rec.store(&Value::record([("name", Value::Null)])).unwrap();
        assert_eq!(rec.pinned(), 1);
        assert_eq!(rec.get_field("alias").unwrap(), "kept");
    }

    #[test]
    fn test_pointer_to_own_memory_is_not_pinned() {
        let slot = Reference::alloc(&Type::pointer()).unwrap();
        slot.store(&Value::from(&slot)).unwrap();
        assert_eq!(slot.pinned(), 0);
        assert_eq!(Arc::strong_count(&slot.memory), 1);
    }

    #[test]
    fn test_copied_record_keeps_its_source_strings() {
        let ty = Type::structure([("name", Type::c_string())]).unwrap();
        let copy = Reference::alloc(&ty).unwrap();
        {
            let source = Reference::from_value(&ty, &Value::record([("name", Value::from("shared"))])).unwrap();
            copy.store(&Value::from(&source)).unwrap();
        }
        assert_eq!(copy.get_field("name").unwrap(), "shared");
        assert_eq!(copy.pinned(), 1);
    }

    #[test]
    fn test_unsized_view_cannot_outgrow_its_buffer() {
        let small = Reference::alloc(&Type::int64()).unwrap();
        let view = small.cast(Type::unsized_array(Type::int64()).unwrap()).unwrap();
        assert!(view.store(&Value::array([7i64])).is_ok());
        assert_eq!(small.to_value().unwrap(), 7);
        assert_eq!(
            view.store(&Value::array([1i64, 2])).unwrap_err(),
            MarshalError::OutOfExtent {
                offset: 0,
                size: 16,
                extent: 8
            }
        );
    }

    #[test]
    fn test_c_string_buffer_capacity() {
        let buf = Reference::alloc_array(&Type::char(), 4).unwrap();
        write_c_string(&buf, "abc").unwrap();
        assert_eq!(unsafe { read_c_string(buf.address()) }.unwrap(), "abc");
        assert!(write_c_string(&buf, "abcd").is_err());
    }
}
