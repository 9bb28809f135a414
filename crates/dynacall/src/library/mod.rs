//! Library binder - loads a native image and binds its functions
//!
//! ```no_run
//! use dynacall::library::{Library, LibraryOptions, SignatureMap};
//! use dynacall::Value;
//!
//! let signatures = SignatureMap::new().with("abs", "int", ["int"]);
//! let libc = Library::load("libc.so.6", &signatures, LibraryOptions::default()).unwrap();
//! let abs = libc.func("abs").unwrap();
//! assert_eq!(abs.call(&[Value::from(-3)]).unwrap(), 3);
//! ```
//!
//! # Lifecycle
//!
//! Every call holds a lease on its library from argument marshaling until
//! the native function returns. [`Library::release`] stops new leases at
//! once, then waits for the outstanding ones ([`ReleasePolicy::Drain`]) or
//! fails while any remain ([`ReleasePolicy::Reject`]). Dropping the last
//! handle and the last [`ForeignFunction`] unloads the image.

pub mod binding;
pub mod image;
pub mod signature;

pub use binding::Binding;
pub use image::{default_search_paths, resolve_library_path, DynamicLibrary, NativeImage, SymbolTable};
pub use signature::{ErrorConvention, Signature, SignatureMap};

use crate::config;
use crate::dispatch::ForeignFunction;
use crate::error::{LinkError, Result, RuntimeError};
use crate::types::TypeRegistry;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// What [`Library::release`] does while calls are in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePolicy {
    /// Wait for in-flight calls to finish, then unload
    #[default]
    Drain,
    /// Refuse with [`RuntimeError::PendingCalls`]
    Reject,
}

impl std::str::FromStr for ReleasePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "drain" => Ok(ReleasePolicy::Drain),
            "reject" => Ok(ReleasePolicy::Reject),
            other => Err(format!("expected 'drain' or 'reject', got '{}'", other)),
        }
    }
}

/// Binding options
#[derive(Debug, Clone)]
pub struct LibraryOptions {
    /// Make [`ForeignFunction::invoke`] asynchronous for every binding
    pub async_default: bool,
    pub release_policy: ReleasePolicy,
    /// Resolves the type tokens used in signatures
    pub registry: Arc<TypeRegistry>,
    /// Directories tried before the system loader's own lookup
    pub search_paths: Vec<PathBuf>,
}

impl Default for LibraryOptions {
    /// Defaults come from the process configuration
    fn default() -> Self {
        let cfg = config::global();
        let mut search_paths = cfg.library.search_paths.clone();
        search_paths.extend(default_search_paths());
        Self {
            async_default: false,
            release_policy: cfg.release_policy(),
            registry: Arc::new(TypeRegistry::new()),
            search_paths,
        }
    }
}

impl LibraryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asynchronous(mut self, async_default: bool) -> Self {
        self.async_default = async_default;
        self
    }

    pub fn release_policy(mut self, policy: ReleasePolicy) -> Self {
        self.release_policy = policy;
        self
    }

    pub fn registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn search_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_paths.insert(0, dir.into());
        self
    }
}

struct HandleState {
    image: Option<Box<dyn NativeImage>>,
    closing: bool,
    pending: usize,
}

pub(crate) struct LibraryShared {
    name: String,
    functions: HashMap<String, Arc<Binding>>,
    order: Vec<String>,
    async_default: bool,
    policy: ReleasePolicy,
    state: Mutex<HandleState>,
    drained: Condvar,
}

impl LibraryShared {
    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn async_default(&self) -> bool {
        self.async_default
    }

    /// Reserve the image for one call
    pub(crate) fn acquire(self: &Arc<Self>) -> std::result::Result<Lease, RuntimeError> {
        let mut state = self.lock();
        if state.image.is_none() || state.closing {
            return Err(RuntimeError::Released(self.name.clone()));
        }
        state.pending += 1;
        Ok(Lease {
            shared: Arc::clone(self),
        })
    }

    fn release(&self) -> std::result::Result<(), RuntimeError> {
        let mut state = self.lock();
        if state.image.is_none() {
            return Ok(());
        }
        if state.pending > 0 && self.policy == ReleasePolicy::Reject {
            log::warn!(
                "refusing to release '{}' with {} call(s) in flight",
                self.name,
                state.pending
            );
            return Err(RuntimeError::PendingCalls {
                library: self.name.clone(),
                pending: state.pending,
            });
        }
        state.closing = true;
        while state.pending > 0 {
            log::debug!("draining {} call(s) on '{}'", state.pending, self.name);
            state = self.drained.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        let image = state.image.take();
        drop(state);
        drop(image);
        log::debug!("released library '{}'", self.name);
        Ok(())
    }
}

/// Permission to use a library's image for the duration of one call
pub(crate) struct Lease {
    shared: Arc<LibraryShared>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.pending -= 1;
        if state.pending == 0 {
            self.shared.drained.notify_all();
        }
    }
}

/// Handle to a loaded native image and its bound functions
#[derive(Clone)]
pub struct Library {
    shared: Arc<LibraryShared>,
}

impl Library {
    /// Load the library at `path` and bind every entry of `signatures`
    pub fn load(path: &str, signatures: &SignatureMap, options: LibraryOptions) -> Result<Library> {
        let image = DynamicLibrary::open_with(path, &options.search_paths)?;
        Self::bind(Box::new(image), signatures, options)
    }

    /// Bind every entry of `signatures` against an already open image
    pub fn bind(image: Box<dyn NativeImage>, signatures: &SignatureMap, options: LibraryOptions) -> Result<Library> {
        let mut functions = HashMap::with_capacity(signatures.len());
        let mut order = Vec::with_capacity(signatures.len());
        for (name, signature) in signatures.iter() {
            let address = image.symbol(name)?;
            let binding = Binding::new(name, address, signature, &options.registry)?;
            log::debug!("bound {:?}", binding);
            functions.insert(name.to_string(), Arc::new(binding));
            order.push(name.to_string());
        }

        Ok(Library {
            shared: Arc::new(LibraryShared {
                name: image.name().to_string(),
                functions,
                order,
                async_default: options.async_default,
                policy: options.release_policy,
                state: Mutex::new(HandleState {
                    image: Some(image),
                    closing: false,
                    pending: 0,
                }),
                drained: Condvar::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The bound function `name`
    pub fn func(&self, name: &str) -> std::result::Result<ForeignFunction, LinkError> {
        self.shared
            .functions
            .get(name)
            .map(|binding| ForeignFunction::new(Arc::clone(&self.shared), Arc::clone(binding)))
            .ok_or_else(|| LinkError::NotBound(name.to_string()))
    }

    /// Call `name` synchronously
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        self.func(name)?.call(args)
    }

    /// Names of the bound functions in declaration order
    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.shared.order.iter().map(String::as_str)
    }

    pub fn is_async_default(&self) -> bool {
        self.shared.async_default
    }

    pub fn release_policy(&self) -> ReleasePolicy {
        self.shared.policy
    }

    /// Calls currently holding a lease
    pub fn pending_calls(&self) -> usize {
        self.shared.lock().pending
    }

    pub fn is_released(&self) -> bool {
        let state = self.shared.lock();
        state.image.is_none() || state.closing
    }

    /// Unload the image
    ///
    /// Idempotent. Must not be called from inside a call on the same
    /// library under [`ReleasePolicy::Drain`], which would wait on itself.
    pub fn release(&self) -> std::result::Result<(), RuntimeError> {
        self.shared.release()
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("name", &self.shared.name)
            .field("functions", &self.shared.order)
            .field("released", &self.is_released())
            .finish()
    }
}
