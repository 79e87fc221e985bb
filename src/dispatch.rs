use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::capture::{OutputCapture, RuntimeInfo, TeeWriter};
use crate::contract::RegisteredFunction;
use crate::descriptor::ResolvedCall;
use crate::error::{EngineError, Result};
use crate::sandbox::{self, SandboxRequest};

/// The signature of a registered native function body.
///
/// The body receives its resolved arguments and tee'd console streams through
/// the context and returns its structured value; errors propagate to the
/// caller unmodified and suppress record storage.
pub type NativeBody =
    Box<dyn Fn(&mut CallContext) -> anyhow::Result<Value> + Send + Sync>;

/// Everything a native body sees of one call: resolved local paths, resolved
/// parameters, and the captured console streams.
pub struct CallContext {
    inputs: BTreeMap<String, PathBuf>,
    outputs: BTreeMap<String, PathBuf>,
    parameters: BTreeMap<String, Value>,
    pub stdout: TeeWriter,
    pub stderr: TeeWriter,
}

impl CallContext {
    pub fn input(&self, name: &str) -> anyhow::Result<&Path> {
        self.inputs
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| anyhow!("input not supplied: {}", name))
    }

    pub fn output(&self, name: &str) -> anyhow::Result<&Path> {
        self.outputs
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| anyhow!("output not supplied: {}", name))
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    pub fn param_as<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let value = self
            .param(name)
            .ok_or_else(|| anyhow!("parameter not supplied: {}", name))?;
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Sandbox settings the dispatcher needs when a container is requested.
pub struct SandboxSettings<'a> {
    pub engine: &'a str,
    pub store_root: &'a Path,
}

/// Chooses local vs. sandboxed execution and wraps both in output capture.
pub struct Dispatcher<'a> {
    sandbox: SandboxSettings<'a>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(sandbox: SandboxSettings<'a>) -> Self {
        Self { sandbox }
    }

    /// Execute the function body, returning its value and captured console
    /// output. Exceptions from the body are not caught here: they propagate
    /// as execution failures and no record is stored for the call.
    pub fn run(
        &self,
        function: &RegisteredFunction,
        resolved: &ResolvedCall,
        container_image: Option<&str>,
    ) -> Result<(Value, RuntimeInfo)> {
        match container_image {
            None => self.run_local(function, resolved),
            Some(image) => self.run_sandboxed(function, resolved, image),
        }
    }

    fn run_local(
        &self,
        function: &RegisteredFunction,
        resolved: &ResolvedCall,
    ) -> Result<(Value, RuntimeInfo)> {
        debug!(
            operation = "dispatch.run",
            function = %function.contract.name,
            "executing locally"
        );

        let capture = OutputCapture::new();
        let mut context = CallContext {
            inputs: resolved.inputs.clone(),
            outputs: resolved
                .outputs
                .iter()
                .filter_map(|(name, handle)| {
                    handle.path().map(|p| (name.clone(), p.to_path_buf()))
                })
                .collect(),
            parameters: resolved.parameters.clone(),
            stdout: capture.stdout_writer(),
            stderr: capture.stderr_writer(),
        };

        let value = (function.body)(&mut context).map_err(EngineError::Execution)?;
        Ok((value, capture.finish()))
    }

    fn run_sandboxed(
        &self,
        function: &RegisteredFunction,
        resolved: &ResolvedCall,
        image: &str,
    ) -> Result<(Value, RuntimeInfo)> {
        let source = function
            .source
            .as_ref()
            .ok_or_else(|| EngineError::SourceUnavailable {
                name: function.contract.name.clone(),
            })?;

        debug!(
            operation = "dispatch.run",
            function = %function.contract.name,
            image = %image,
            "executing in container"
        );

        sandbox::run_in_container(&SandboxRequest {
            engine: self.sandbox.engine,
            image,
            store_root: self.sandbox.store_root,
            function_name: &function.contract.name,
            source,
            resolved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::FunctionContract;
    use crate::handle::FileHandle;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn settings(store_root: &Path) -> SandboxSettings<'_> {
        SandboxSettings {
            engine: "docker",
            store_root,
        }
    }

    #[test]
    fn test_local_run_captures_output_and_value() {
        let temp = TempDir::new().unwrap();
        let function = RegisteredFunction {
            contract: FunctionContract::builder("add", "1")
                .parameter("x")
                .parameter("y")
                .build(),
            body: Box::new(|ctx| {
                let x: i64 = ctx.param_as("x")?;
                let y: i64 = ctx.param_as("y")?;
                writeln!(ctx.stdout, "adding {} and {}", x, y)?;
                Ok(serde_json::json!(x + y))
            }),
            source: None,
        };

        let mut resolved = ResolvedCall::default();
        resolved.parameters.insert("x".into(), serde_json::json!(4));
        resolved.parameters.insert("y".into(), serde_json::json!(5));

        let dispatcher = Dispatcher::new(settings(temp.path()));
        let (value, info) = dispatcher.run(&function, &resolved, None).unwrap();

        assert_eq!(value, serde_json::json!(9));
        assert_eq!(info.stdout, "adding 4 and 5\n");
        assert_eq!(info.stderr, "");
    }

    #[test]
    fn test_local_run_writes_declared_output() {
        let temp = TempDir::new().unwrap();
        let out_path = temp.path().join("result.txt");

        let function = RegisteredFunction {
            contract: FunctionContract::builder("emit", "1").output("result").build(),
            body: Box::new(|ctx| {
                fs::write(ctx.output("result")?, b"written by body")?;
                Ok(Value::Null)
            }),
            source: None,
        };

        let mut resolved = ResolvedCall::default();
        resolved
            .outputs
            .insert("result".into(), FileHandle::borrowed(&out_path));

        let dispatcher = Dispatcher::new(settings(temp.path()));
        dispatcher.run(&function, &resolved, None).unwrap();

        assert_eq!(fs::read(&out_path).unwrap(), b"written by body");
    }

    #[test]
    fn test_body_error_propagates() {
        let temp = TempDir::new().unwrap();
        let function = RegisteredFunction {
            contract: FunctionContract::builder("fails", "1").build(),
            body: Box::new(|_| Err(anyhow!("deliberate failure"))),
            source: None,
        };

        let dispatcher = Dispatcher::new(settings(temp.path()));
        let err = dispatcher
            .run(&function, &ResolvedCall::default(), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Execution(_)));
    }

    #[test]
    fn test_container_without_source_is_rejected() {
        let temp = TempDir::new().unwrap();
        let function = RegisteredFunction {
            contract: FunctionContract::builder("native_only", "1").build(),
            body: Box::new(|_| Ok(Value::Null)),
            source: None,
        };

        let dispatcher = Dispatcher::new(settings(temp.path()));
        let err = dispatcher
            .run(&function, &ResolvedCall::default(), Some("acme/img:1"))
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceUnavailable { name } if name == "native_only"));
    }
}
