//! Function bindings - one resolved symbol plus its prepared call interface
//!
//! Calling a binding happens in two steps so the work can be split across
//! threads: [`Binding::prepare`] marshals arguments on the issuing thread,
//! then [`Binding::invoke`] performs the native call wherever it is sent.

use super::signature::{ErrorConvention, Signature};
use crate::abi::CallInterface;
use crate::error::{Error, RuntimeError, TypeError};
use crate::marshal::{self, MarshalContext};
use crate::reference::Pin;
use crate::types::{Type, TypeRegistry};
use crate::value::{Pointer, Value};
use libffi::middle::CodePtr;
use std::ffi::c_void;
use std::fmt;
use std::mem::size_of;

/// Number of `u64` words covering `bytes`, never zero
fn words(bytes: usize) -> usize {
    ((bytes + size_of::<u64>() - 1) / size_of::<u64>()).max(1)
}

/// Immutable description of one callable native function
pub struct Binding {
    name: String,
    address: Pointer,
    args: Vec<Type>,
    ret: Type,
    convention: ErrorConvention,
    interface: CallInterface,
}

/// Arguments marshaled for one call, with everything they point to
pub(crate) struct PreparedCall {
    // u64 words keep every slot 8-byte aligned.
    slots: Vec<Vec<u64>>,
    _pins: Vec<Pin>,
}

impl Binding {
    /// Resolve `signature` and prepare the call interface
    pub(crate) fn new(
        name: &str,
        address: Pointer,
        signature: &Signature,
        registry: &TypeRegistry,
    ) -> Result<Self, TypeError> {
        let args = signature
            .args
            .iter()
            .map(|spec| spec.resolve(registry))
            .collect::<Result<Vec<_>, _>>()?;
        let ret = signature.ret.resolve(registry)?;
        let interface = CallInterface::new(&args, &ret)?;
        Ok(Self {
            name: name.to_string(),
            address,
            args,
            ret,
            convention: signature.convention,
            interface,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Pointer {
        self.address
    }

    pub fn arg_types(&self) -> &[Type] {
        &self.args
    }

    pub fn return_type(&self) -> &Type {
        &self.ret
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// Marshal `args` into native argument slots
    pub(crate) fn prepare(&self, args: &[Value]) -> Result<PreparedCall, Error> {
        if args.len() != self.args.len() {
            return Err(TypeError::ArityMismatch {
                function: self.name.clone(),
                expected: self.args.len(),
                got: args.len(),
            }
            .into());
        }

        let mut ctx = MarshalContext::new();
        let mut slots = Vec::with_capacity(args.len());
        for (ty, value) in self.args.iter().zip(args) {
            let size = match ty {
                Type::Array(_) => size_of::<usize>(),
                _ => ty.size(),
            };
            let mut slot = vec![0u64; words(size)];
            // SAFETY: the slot covers `size` bytes.
            unsafe { ctx.encode_argument(ty, value, slot.as_mut_ptr().cast())? };
            slots.push(slot);
        }
        log::trace!("marshaled {} argument(s) for '{}'", slots.len(), self.name);

        Ok(PreparedCall {
            slots,
            _pins: ctx.into_pins(),
        })
    }

    /// Call the native function
    ///
    /// # Safety
    ///
    /// The address must still be mapped, which the owning library's lease
    /// guarantees, and the declared signature must match the native one.
    pub(crate) unsafe fn invoke(&self, mut call: PreparedCall) -> Result<Value, Error> {
        let mut arg_ptrs: Vec<*mut c_void> = call
            .slots
            .iter_mut()
            .map(|slot| slot.as_mut_ptr().cast::<c_void>())
            .collect();
        let mut ret = vec![0u64; words(marshal::return_slot_size(&self.ret))];
        let code = CodePtr(self.address.as_ptr());

        libffi::raw::ffi_call(
            self.interface.as_raw_ptr(),
            Some(*code.as_fun()),
            ret.as_mut_ptr().cast::<c_void>(),
            arg_ptrs.as_mut_ptr(),
        );
        // Read before anything else can clobber the thread's errno.
        let os_error = std::io::Error::last_os_error().raw_os_error();

        // Strings returned by the call may point into argument buffers, so
        // decode while the call's pins are still held.
        let value = marshal::decode_return(&self.ret, ret.as_ptr().cast::<u8>())?;
        drop(call);
        self.check_convention(value, os_error)
    }

    fn check_convention(&self, value: Value, os_error: Option<i32>) -> Result<Value, Error> {
        let failed_with = match self.convention {
            ErrorConvention::None => None,
            ErrorConvention::NegativeReturn => value
                .as_i64()
                .filter(|v| *v < 0)
                .map(|v| v.checked_neg().and_then(|c| i32::try_from(c).ok()).unwrap_or(i32::MAX)),
            ErrorConvention::NullReturn => {
                let null = value.is_null() || value.as_pointer().is_some_and(Pointer::is_null);
                null.then(|| os_error.unwrap_or(0))
            }
        };
        match failed_with {
            Some(code) => {
                log::debug!("'{}' reported failure code {}", self.name, code);
                Err(RuntimeError::Native {
                    function: self.name.clone(),
                    code,
                }
                .into())
            }
            None => Ok(value),
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.args.iter().map(Type::name).collect();
        write!(
            f,
            "{} {}({}) @ {}",
            self.ret.name(),
            self.name,
            args.join(", "),
            self.address
        )
    }
}
