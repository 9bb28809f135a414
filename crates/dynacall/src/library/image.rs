//! Native images - where symbol addresses come from
//!
//! [`DynamicLibrary`] opens a shared object with `libloading`, resolving short
//! names with the platform's naming conventions. [`SymbolTable`] serves
//! functions that are already linked into the process.

use crate::error::LinkError;
use crate::value::Pointer;
use libloading::Library;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Source of native symbol addresses
pub trait NativeImage: Send + Sync {
    /// Name used in diagnostics
    fn name(&self) -> &str;

    /// Address of the exported symbol `symbol`
    fn symbol(&self, symbol: &str) -> Result<Pointer, LinkError>;
}

/// Platform library search directories
///
/// - Linux: /usr/lib, /usr/local/lib, /lib (plus lib64 variants)
/// - macOS: /usr/lib, /usr/local/lib, /opt/homebrew/lib
/// - Windows: the system directory
///
/// The current directory is searched first on every platform.
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd);
    }

    #[cfg(target_os = "linux")]
    {
        paths.extend(["/usr/lib", "/usr/local/lib", "/lib"].map(PathBuf::from));
        if cfg!(target_pointer_width = "64") {
            paths.extend(["/usr/lib64", "/lib64"].map(PathBuf::from));
        }
    }

    #[cfg(target_os = "macos")]
    {
        paths.extend(["/usr/lib", "/usr/local/lib", "/opt/homebrew/lib"].map(PathBuf::from));
    }

    #[cfg(target_os = "windows")]
    {
        match std::env::var("SystemRoot") {
            Ok(root) => paths.push(PathBuf::from(root).join("System32")),
            Err(_) => paths.push(PathBuf::from("C:\\Windows\\System32")),
        }
    }

    paths
}

/// File names a short library name may go by, most likely first
fn candidate_file_names(name: &str) -> Vec<String> {
    let (prefixes, extensions): (&[&str], &[&str]) = if cfg!(target_os = "windows") {
        (&["", "lib"], &["dll"])
    } else if cfg!(target_os = "macos") {
        (&["lib", ""], &["dylib", "so"])
    } else {
        (&["lib", ""], &["so"])
    };

    let mut names = vec![name.to_string()];
    for prefix in prefixes {
        for ext in extensions {
            let candidate = format!("{}{}.{}", prefix, name, ext);
            if candidate != name {
                names.push(candidate);
            }
        }
    }
    names
}

/// Find the file for `name` in `search_paths`
///
/// A name containing a path separator is used as given.
pub fn resolve_library_path(name: &str, search_paths: &[PathBuf]) -> Option<PathBuf> {
    let path = Path::new(name);
    if path.components().count() > 1 || path.is_absolute() {
        return path.exists().then(|| path.to_path_buf());
    }
    let candidates = candidate_file_names(name);
    search_paths
        .iter()
        .flat_map(|dir| candidates.iter().map(move |file| dir.join(file)))
        .find(|full| full.is_file())
}

/// Shared library opened with the system loader
///
/// # Safety
///
/// Opening a library runs its initialization code in this process. Only load
/// libraries you trust.
pub struct DynamicLibrary {
    name: String,
    path: Option<PathBuf>,
    library: Library,
}

impl DynamicLibrary {
    /// Open `name` using the default search paths
    pub fn open(name: &str) -> Result<Self, LinkError> {
        Self::open_with(name, &default_search_paths())
    }

    /// Open `name`, trying `search_paths` before the system loader's own
    /// lookup (so `"libc.so.6"` or `"kernel32"` still resolve)
    pub fn open_with(name: &str, search_paths: &[PathBuf]) -> Result<Self, LinkError> {
        if let Some(path) = resolve_library_path(name, search_paths) {
            // SAFETY: see the type-level safety note.
            let library = unsafe { Library::new(&path) }.map_err(|e| LinkError::LoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            log::debug!("opened library '{}' at {}", name, path.display());
            return Ok(Self {
                name: name.to_string(),
                path: Some(path),
                library,
            });
        }

        // SAFETY: see the type-level safety note.
        match unsafe { Library::new(name) } {
            Ok(library) => {
                log::debug!("opened library '{}' through the system loader", name);
                Ok(Self {
                    name: name.to_string(),
                    path: None,
                    library,
                })
            }
            Err(e) => {
                log::debug!("could not open library '{}': {}", name, e);
                Err(LinkError::LibraryNotFound(name.to_string()))
            }
        }
    }

    /// File the library was loaded from, when found through a search path
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl NativeImage for DynamicLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn symbol(&self, symbol: &str) -> Result<Pointer, LinkError> {
        // SAFETY: the address is only ever called through a CIF built from
        // the declared signature.
        let found = unsafe { self.library.get::<unsafe extern "C" fn()>(symbol.as_bytes()) };
        match found {
            Ok(sym) => Ok(Pointer::from_addr(*sym as usize)),
            Err(_) => Err(LinkError::SymbolNotFound {
                library: self.name.clone(),
                symbol: symbol.to_string(),
            }),
        }
    }
}

impl fmt::Debug for DynamicLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicLibrary")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for DynamicLibrary {
    fn drop(&mut self) {
        log::debug!("unloading library '{}'", self.name);
    }
}

/// Symbols registered by hand
///
/// # Example
///
/// ```
/// # use dynacall::library::{NativeImage, SymbolTable};
/// extern "C" fn twice(x: i32) -> i32 {
///     x * 2
/// }
///
/// let table = SymbolTable::new("builtins").with("twice", twice as *const ());
/// assert!(table.symbol("twice").is_ok());
/// assert!(table.symbol("thrice").is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    name: String,
    symbols: HashMap<String, Pointer>,
}

impl SymbolTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbols: HashMap::new(),
        }
    }

    pub fn insert(&mut self, symbol: impl Into<String>, address: *const ()) {
        self.symbols.insert(symbol.into(), Pointer::from_ptr(address));
    }

    pub fn with(mut self, symbol: impl Into<String>, address: *const ()) -> Self {
        self.insert(symbol, address);
        self
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl NativeImage for SymbolTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn symbol(&self, symbol: &str) -> Result<Pointer, LinkError> {
        self.symbols
            .get(symbol)
            .copied()
            .ok_or_else(|| LinkError::SymbolNotFound {
                library: self.name.clone(),
                symbol: symbol.to_string(),
            })
    }
}
