//! Function signatures
//!
//! A [`SignatureMap`] lists the functions to bind, each as
//! `name -> [returnType, [argType, ...]]`, optionally followed by an
//! [`ErrorConvention`] (`"none"`, `"negative_return"` or `"null_return"`).
//! Maps are built in code or read from JSON or TOML:
//!
//! ```
//! # use dynacall::library::{ErrorConvention, SignatureMap};
//! let map = SignatureMap::from_toml_str(r#"
//! mul = ["int", ["int", "int"]]
//! getString = ["char*", []]
//! getenv = ["char*", ["char*"], "null_return"]
//! "#).unwrap();
//! assert_eq!(map.len(), 3);
//! assert_eq!(map.get("getenv").unwrap().convention, ErrorConvention::NullReturn);
//! ```

use crate::types::TypeSpec;
use serde::Deserialize;
use std::collections::BTreeMap;

/// How a native function reports failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorConvention {
    /// Return values are passed through untouched
    #[default]
    None,
    /// A negative integer return means failure; its magnitude is the code
    NegativeReturn,
    /// A null pointer return means failure; the code is the OS error
    NullReturn,
}

/// Return and argument types of one function
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "SignatureEntry")]
pub struct Signature {
    pub ret: TypeSpec,
    pub args: Vec<TypeSpec>,
    pub convention: ErrorConvention,
}

impl Signature {
    pub fn new<R, A, I>(ret: R, args: I) -> Self
    where
        R: Into<TypeSpec>,
        A: Into<TypeSpec>,
        I: IntoIterator<Item = A>,
    {
        Self {
            ret: ret.into(),
            args: args.into_iter().map(Into::into).collect(),
            convention: ErrorConvention::None,
        }
    }

    pub fn with_error_convention(mut self, convention: ErrorConvention) -> Self {
        self.convention = convention;
        self
    }
}

/// A signature as written in a JSON or TOML map
#[derive(Deserialize)]
#[serde(untagged)]
enum SignatureEntry {
    Plain(TypeSpec, Vec<TypeSpec>),
    WithConvention(TypeSpec, Vec<TypeSpec>, ErrorConvention),
}

impl From<SignatureEntry> for Signature {
    fn from(entry: SignatureEntry) -> Self {
        match entry {
            SignatureEntry::Plain(ret, args) => Signature::new(ret, args),
            SignatureEntry::WithConvention(ret, args, convention) => {
                Signature::new(ret, args).with_error_convention(convention)
            }
        }
    }
}

/// Ordered collection of named signatures
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "BTreeMap<String, Signature>")]
pub struct SignatureMap {
    entries: Vec<(String, Signature)>,
}

impl SignatureMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace `name`
    pub fn insert(&mut self, name: impl Into<String>, signature: Signature) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = signature,
            None => self.entries.push((name, signature)),
        }
    }

    /// Builder form of [`SignatureMap::insert`]
    pub fn with<R, A, I>(mut self, name: impl Into<String>, ret: R, args: I) -> Self
    where
        R: Into<TypeSpec>,
        A: Into<TypeSpec>,
        I: IntoIterator<Item = A>,
    {
        self.insert(name, Signature::new(ret, args));
        self
    }

    pub fn with_signature(mut self, name: impl Into<String>, signature: Signature) -> Self {
        self.insert(name, signature);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Signature> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Signature)> {
        self.entries.iter().map(|(n, s)| (n.as_str(), s))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_toml_str(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }
}

impl From<BTreeMap<String, Signature>> for SignatureMap {
    fn from(map: BTreeMap<String, Signature>) -> Self {
        Self {
            entries: map.into_iter().collect(),
        }
    }
}
