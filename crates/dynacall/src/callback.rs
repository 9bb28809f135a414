//! Callbacks - native-callable function pointers backed by Rust closures
//!
//! A [`Callback`] owns a libffi closure whose code pointer can be handed to
//! native code wherever a function pointer is expected. When native code
//! calls it, the trampoline decodes the arguments, runs the host function on
//! the calling thread and encodes its return value.
//!
//! # Lifetime
//!
//! The code pointer is valid while any clone of the `Callback` exists. Native
//! code that keeps the pointer past the call it was passed to (registered
//! handlers, async completion hooks) requires the caller to keep a clone
//! alive for as long as the pointer may still be called.
//!
//! Strings and buffers returned to native code stay valid until the last
//! clone drops, so a caller may hold one result across later invocations.
//! Each distinct returned string is allocated once.
//!
//! # Failures
//!
//! Errors and panics in the host function cannot unwind through native
//! frames. They are logged, kept for [`Callback::take_error`], and the native
//! caller receives a zeroed return value.

use crate::abi::CallInterface;
use crate::error::{Error, MarshalError, Result, RuntimeError};
use crate::marshal::{self, Conversion, MarshalContext};
use crate::reference::Pin;
use crate::types::{Primitive, Raw, Type, TypeRegistry, TypeSpec};
use crate::value::{Pointer, Value};
use libffi::low::{self, ffi_cif, ffi_closure, CodePtr};
use std::any::Any;
use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type HostFn = dyn Fn(&[Value]) -> Result<Value> + Send + Sync;

/// Everything the trampoline reads while native code calls it
struct CallbackState {
    args: Vec<Type>,
    ret: Type,
    host: Box<HostFn>,
    calls: AtomicU64,
    last_error: Mutex<Option<Error>>,
    // Returned strings, one copy per distinct value.
    strings: Mutex<HashMap<Arc<str>, CString>>,
    // Other allocations behind returned pointers, by address.
    returned: Mutex<HashMap<usize, Pin>>,
}

impl CallbackState {
    /// # Safety
    ///
    /// `args` holds one pointer per declared argument and `result` covers the
    /// return slot.
    unsafe fn dispatch(&self, args: *const *const c_void, result: *mut u8) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let mut values = Vec::with_capacity(self.args.len());
        for (i, ty) in self.args.iter().enumerate() {
            let src = *args.add(i) as *const u8;
            values.push(marshal::decode_argument(ty, src)?);
        }

        let value = (self.host)(&values)?;
        if self.ret.is_void() {
            return Ok(());
        }

        if let (Some(Primitive::CString), Value::String(s)) = (self.ret.primitive(), &value) {
            let addr = self.intern(s)?;
            Primitive::CString.store(result, Raw::Address(addr));
            return Ok(());
        }

        let mut ctx = MarshalContext::with_conversion(Conversion::Truncate);
        ctx.encode_return(&self.ret, &value, result)?;
        let pins = ctx.into_pins();
        if !pins.is_empty() {
            let mut returned = self.returned.lock().unwrap_or_else(PoisonError::into_inner);
            for pin in pins {
                returned.insert(pin.address(), pin);
            }
        }
        Ok(())
    }

    /// Address of a NUL-terminated copy of `s` that lives as long as the callback
    fn intern(&self, s: &Arc<str>) -> std::result::Result<usize, MarshalError> {
        let mut strings = self.strings.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = strings.get(&**s) {
            return Ok(existing.as_ptr() as usize);
        }
        let c_string = CString::new(s.as_bytes()).map_err(|e| MarshalError::InvalidString(e.to_string()))?;
        let addr = c_string.as_ptr() as usize;
        strings.insert(Arc::clone(s), c_string);
        Ok(addr)
    }

    /// # Safety
    ///
    /// `result` covers the return slot.
    unsafe fn fail(&self, error: Error, result: *mut u8) {
        log::error!("callback {} failed: {}", self.describe(), error);
        if !self.ret.is_void() {
            std::ptr::write_bytes(result, 0, marshal::return_slot_size(&self.ret));
        }
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    fn describe(&self) -> String {
        let args: Vec<String> = self.args.iter().map(Type::name).collect();
        format!("{} ({})", self.ret.name(), args.join(", "))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}

unsafe extern "C" fn trampoline(
    _cif: &ffi_cif,
    result: &mut u8,
    args: *const *const c_void,
    state: &CallbackState,
) {
    let result: *mut u8 = result;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| state.dispatch(args, result)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => state.fail(e, result),
        Err(payload) => state.fail(RuntimeError::Callback(panic_message(payload.as_ref())).into(), result),
    }
}

/// The closure and everything it points into
struct Trampoline {
    closure: *mut ffi_closure,
    code: Pointer,
    // Boxed so the addresses handed to libffi stay put.
    _interface: Box<CallInterface>,
    state: Box<CallbackState>,
}

// SAFETY: the closure is immutable once prepared and only freed on drop; the
// state it references is Send + Sync.
unsafe impl Send for Trampoline {}
unsafe impl Sync for Trampoline {}

impl Drop for Trampoline {
    fn drop(&mut self) {
        log::trace!("freeing callback at {}", self.code);
        // SAFETY: allocated by `closure_alloc` and freed exactly once.
        unsafe { low::closure_free(self.closure) };
    }
}

/// Host function callable from native code
///
/// # Example
///
/// ```
/// use dynacall::{Callback, Value};
///
/// let add = Callback::new("int", ["int", "int"], |args: &[Value]| {
///     Ok(Value::from(args[0].as_i64().unwrap_or(0) + args[1].as_i64().unwrap_or(0)))
/// })
/// .unwrap();
/// let f: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(add.code_ptr().as_ptr::<()>()) };
/// assert_eq!(f(2, 3), 5);
/// assert_eq!(add.calls(), 1);
/// ```
#[derive(Clone)]
pub struct Callback {
    inner: Arc<Trampoline>,
}

impl Callback {
    /// Create a callback whose types are primitive tokens or [`Type`]s
    pub fn new<R, A, I, F>(ret: R, args: I, host: F) -> Result<Callback>
    where
        R: Into<TypeSpec>,
        A: Into<TypeSpec>,
        I: IntoIterator<Item = A>,
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Self::with_registry(&TypeRegistry::new(), ret, args, host)
    }

    /// Create a callback whose type tokens may name types in `registry`
    pub fn with_registry<R, A, I, F>(registry: &TypeRegistry, ret: R, args: I, host: F) -> Result<Callback>
    where
        R: Into<TypeSpec>,
        A: Into<TypeSpec>,
        I: IntoIterator<Item = A>,
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        let ret = Into::<TypeSpec>::into(ret).resolve(registry)?;
        let args = args
            .into_iter()
            .map(|spec| Into::<TypeSpec>::into(spec).resolve(registry))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for ty in &args {
            ty.check_argument()?;
        }
        let interface = Box::new(CallInterface::new(&args, &ret)?);

        let state = Box::new(CallbackState {
            args,
            ret,
            host: Box::new(host),
            calls: AtomicU64::new(0),
            last_error: Mutex::new(None),
            strings: Mutex::new(HashMap::new()),
            returned: Mutex::new(HashMap::new()),
        });

        let (closure, code) = low::closure_alloc();
        if closure.is_null() {
            return Err(RuntimeError::Callback("closure allocation failed".to_string()).into());
        }
        // SAFETY: the CIF and state are boxed and owned by the trampoline,
        // which frees the closure before dropping either.
        let prepared = unsafe {
            low::prep_closure(
                closure,
                interface.as_raw_ptr(),
                trampoline,
                &*state as *const CallbackState,
                CodePtr(code.as_mut_ptr()),
            )
        };
        if let Err(e) = prepared {
            // SAFETY: allocated above and not yet shared.
            unsafe { low::closure_free(closure) };
            return Err(RuntimeError::Callback(format!("closure preparation failed: {:?}", e)).into());
        }

        let code = Pointer::from_ptr(code.as_ptr());
        log::debug!("created callback {} at {}", state.describe(), code);
        Ok(Callback {
            inner: Arc::new(Trampoline {
                closure,
                code,
                _interface: interface,
                state,
            }),
        })
    }

    /// Address native code calls
    pub fn code_ptr(&self) -> Pointer {
        self.inner.code
    }

    pub fn arg_types(&self) -> &[Type] {
        &self.inner.state.args
    }

    pub fn return_type(&self) -> &Type {
        &self.inner.state.ret
    }

    /// Number of times native code has called this callback
    pub fn calls(&self) -> u64 {
        self.inner.state.calls.load(Ordering::Relaxed)
    }

    /// The most recent failure, clearing it
    pub fn take_error(&self) -> Option<Error> {
        self.inner
            .state
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({} @ {})", self.inner.state.describe(), self.inner.code)
    }
}
