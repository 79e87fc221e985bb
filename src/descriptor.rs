use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::contract::FunctionContract;
use crate::error::{EngineError, Result};
use crate::handle::FileHandle;
use crate::store::{is_reference, ContentStore, FileFingerprint};

/// Descriptor format version; identity-bearing like a contract version.
pub const API_VERSION: &str = "0.2.0";

/// A value supplied for a declared (or undeclared) argument name.
#[derive(Debug, Clone)]
pub enum ArgValue {
    /// Local filesystem path.
    Path(PathBuf),
    /// Content-store reference (`sha256://...`).
    Reference(String),
    /// An existing file handle.
    Handle(FileHandle),
    /// For outputs: `true` asks the engine to allocate a scratch destination.
    Allocate(bool),
    /// Arbitrary structured value.
    Value(Value),
}

/// Arguments for one call, keyed by declared name.
///
/// Supply order is irrelevant: the map is ordered, and the descriptor encoding
/// is canonical regardless of how arguments were inserted.
#[derive(Debug, Clone, Default)]
pub struct CallArguments {
    values: BTreeMap<String, ArgValue>,
}

impl CallArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.values.insert(name.into(), ArgValue::Path(path.into()));
        self
    }

    pub fn reference(mut self, name: impl Into<String>, reference: impl Into<String>) -> Self {
        self.values
            .insert(name.into(), ArgValue::Reference(reference.into()));
        self
    }

    pub fn handle(mut self, name: impl Into<String>, handle: FileHandle) -> Self {
        self.values.insert(name.into(), ArgValue::Handle(handle));
        self
    }

    /// Request an engine-allocated scratch destination for an output.
    pub fn allocate(mut self, name: impl Into<String>) -> Self {
        self.values.insert(name.into(), ArgValue::Allocate(true));
        self
    }

    pub fn value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values
            .insert(name.into(), ArgValue::Value(value.into()));
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: ArgValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArgValue)> {
        self.values.iter()
    }
}

/// Canonical, hashable identity of one call.
///
/// Inputs appear as content fingerprints (never paths), outputs as presence
/// markers, parameters verbatim. All maps are BTree-ordered, so the JSON
/// encoding is stable and the hash is independent of argument-supply order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallDescriptor {
    pub api_version: String,
    pub name: String,
    pub version: String,
    pub input_files: BTreeMap<String, FileFingerprint>,
    pub output_files: BTreeMap<String, bool>,
    pub parameters: BTreeMap<String, Value>,
}

impl CallDescriptor {
    /// Deterministic hash of the canonical encoding, via the store adapter.
    pub fn canonical_hash(&self, store: &dyn ContentStore) -> String {
        let value = serde_json::to_value(self).expect("descriptor encoding cannot fail");
        store.canonical_hash(&value)
    }
}

/// Arguments resolved to concrete local values, ready for dispatch.
#[derive(Debug, Default)]
pub struct ResolvedCall {
    /// Input name → local byte source.
    pub inputs: BTreeMap<String, PathBuf>,
    /// Output name → writable destination handle.
    pub outputs: BTreeMap<String, FileHandle>,
    /// Parameter name → resolved value (post-default), plus undeclared
    /// keywords passed through verbatim.
    pub parameters: BTreeMap<String, Value>,
}

impl ResolvedCall {
    /// Delete any engine-owned scratch outputs. Used on every path where the
    /// allocated destinations will not be persisted.
    pub fn discard_temporary_outputs(&mut self) {
        for handle in self.outputs.values_mut() {
            handle.discard();
        }
    }
}

/// Resolve a call against its contract, producing the descriptor and the
/// concrete argument set.
///
/// Validation failures happen here, before anything executes, so they never
/// leave partial side effects.
pub fn build_descriptor(
    contract: &FunctionContract,
    args: &CallArguments,
    store: &dyn ContentStore,
) -> Result<(CallDescriptor, ResolvedCall)> {
    let mut descriptor = CallDescriptor {
        api_version: API_VERSION.to_string(),
        name: contract.name.clone(),
        version: contract.version.clone(),
        input_files: BTreeMap::new(),
        output_files: BTreeMap::new(),
        parameters: BTreeMap::new(),
    };
    let mut resolved = ResolvedCall::default();

    for spec in &contract.inputs {
        match args.get(&spec.name) {
            None | Some(ArgValue::Value(Value::Null)) => {
                if spec.required {
                    return Err(EngineError::MissingRequiredInput(spec.name.clone()));
                }
            }
            Some(arg) => {
                let path = resolve_input(&spec.name, arg, store)?;
                let fingerprint = store.fingerprint(&path).map_err(|_| {
                    EngineError::UnresolvableInputFile {
                        name: spec.name.clone(),
                        reference: path.display().to_string(),
                    }
                })?;
                trace!(
                    function = %contract.name,
                    input = %spec.name,
                    sha256 = %fingerprint.sha256,
                    "fingerprinted input"
                );
                descriptor.input_files.insert(spec.name.clone(), fingerprint);
                resolved.inputs.insert(spec.name.clone(), path);
            }
        }
    }

    for spec in &contract.outputs {
        let handle = match args.get(&spec.name) {
            None
            | Some(ArgValue::Value(Value::Null))
            | Some(ArgValue::Allocate(false))
            | Some(ArgValue::Value(Value::Bool(false))) => {
                if spec.required {
                    resolved.discard_temporary_outputs();
                    return Err(EngineError::MissingRequiredOutput(spec.name.clone()));
                }
                continue;
            }
            Some(ArgValue::Allocate(true)) | Some(ArgValue::Value(Value::Bool(true))) => {
                FileHandle::temporary()?
            }
            Some(ArgValue::Path(path)) => FileHandle::borrowed(path.clone()),
            Some(ArgValue::Value(Value::String(s))) if !is_reference(s) => {
                FileHandle::borrowed(s.clone())
            }
            Some(ArgValue::Handle(handle)) if handle.path().is_some() => handle.clone(),
            // References (in any form) and handles without a writable path are
            // immutable: they cannot receive output bytes.
            Some(_) => {
                resolved.discard_temporary_outputs();
                return Err(EngineError::InvalidOutputTarget {
                    name: spec.name.clone(),
                })
            }
        };
        descriptor.output_files.insert(spec.name.clone(), true);
        resolved.outputs.insert(spec.name.clone(), handle);
    }

    for spec in &contract.parameters {
        let value = match args.get(&spec.name) {
            None | Some(ArgValue::Value(Value::Null)) => {
                if spec.required && spec.default.is_none() {
                    resolved.discard_temporary_outputs();
                    return Err(EngineError::MissingRequiredParameter(spec.name.clone()));
                }
                spec.default.clone().unwrap_or(Value::Null)
            }
            Some(arg) => arg_to_value(arg),
        };
        descriptor
            .parameters
            .insert(spec.name.clone(), value.clone());
        resolved.parameters.insert(spec.name.clone(), value);
    }

    // Undeclared keywords still shape the cache key: they are recorded
    // verbatim and passed through, just not contract-validated.
    for (name, arg) in args.iter() {
        if contract.declares(name) {
            continue;
        }
        let value = arg_to_value(arg);
        descriptor.parameters.insert(name.clone(), value.clone());
        resolved.parameters.insert(name.clone(), value);
    }

    Ok((descriptor, resolved))
}

/// Resolve one input argument to a local byte source.
fn resolve_input(name: &str, arg: &ArgValue, store: &dyn ContentStore) -> Result<PathBuf> {
    let unresolvable = |reference: String| EngineError::UnresolvableInputFile {
        name: name.to_string(),
        reference,
    };

    match arg {
        ArgValue::Path(path) => Ok(path.clone()),
        ArgValue::Value(Value::String(s)) if !is_reference(s) => Ok(PathBuf::from(s)),
        ArgValue::Reference(reference) => store
            .load_file(reference)
            .ok()
            .flatten()
            .ok_or_else(|| unresolvable(reference.clone())),
        ArgValue::Value(Value::String(s)) => store
            .load_file(s)
            .ok()
            .flatten()
            .ok_or_else(|| unresolvable(s.clone())),
        ArgValue::Handle(handle) => {
            if let Some(path) = handle.path() {
                return Ok(path.to_path_buf());
            }
            match handle.reference() {
                Some(reference) => store
                    .load_file(reference)
                    .ok()
                    .flatten()
                    .ok_or_else(|| unresolvable(reference.to_string())),
                None => Err(unresolvable("<empty handle>".to_string())),
            }
        }
        other => Err(unresolvable(format!("{:?}", other))),
    }
}

/// Collapse any argument form into the descriptor's parameter encoding.
fn arg_to_value(arg: &ArgValue) -> Value {
    match arg {
        ArgValue::Value(v) => v.clone(),
        ArgValue::Path(p) => Value::String(p.display().to_string()),
        ArgValue::Reference(r) => Value::String(r.clone()),
        ArgValue::Allocate(b) => Value::Bool(*b),
        ArgValue::Handle(h) => match (h.path(), h.reference()) {
            (Some(p), _) => Value::String(p.display().to_string()),
            (None, Some(r)) => Value::String(r.to_string()),
            (None, None) => Value::Null,
        },
    }
}
