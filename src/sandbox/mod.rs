//! Sandboxed execution: Pack -> Generate Scripts -> Launch -> Collect -> Cleanup.
//!
//! The whole working tree lives in a call-scoped temporary directory whose
//! RAII guard removes it on every exit path, packaging failures and container
//! failures included.

pub mod pack;
pub mod script;

pub use pack::SourceUnit;

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::capture::{OutputCapture, RuntimeInfo, TeeWriter};
use crate::descriptor::ResolvedCall;
use crate::error::{EngineError, Result};
use script::{
    DriverScript, EnvScript, EnvVar, LaunchPlan, MountSpec, GUEST_CALL_DIR, GUEST_INPUTS_DIR,
    GUEST_OUTPUTS_DIR, GUEST_STORE_DIR, STORE_DIR_ENV,
};

/// One sandboxed invocation.
pub struct SandboxRequest<'a> {
    /// Container engine command or path from configuration.
    pub engine: &'a str,
    /// Container image to run in.
    pub image: &'a str,
    /// Host content-store root, bind-mounted for the function's own loads.
    pub store_root: &'a Path,
    /// Fixed name the packaged entry point re-exports.
    pub function_name: &'a str,
    pub source: &'a SourceUnit,
    pub resolved: &'a ResolvedCall,
}

#[derive(Deserialize)]
struct RetvalEnvelope {
    retval: Value,
}

/// Everything derived from the resolved arguments before launch: the
/// in-container kwargs bundle, the bind mounts, and the staged-output
/// copy-back list.
struct CallMapping {
    kwargs: BTreeMap<String, Value>,
    mounts: Vec<MountSpec>,
    outputs_to_copy: Vec<(PathBuf, PathBuf)>,
}

/// Run one call inside a container, returning its decoded return value and
/// captured console output.
pub fn run_in_container(request: &SandboxRequest) -> Result<(Value, RuntimeInfo)> {
    let temp = tempfile::Builder::new()
        .prefix("speicher_sandbox_")
        .tempdir()?;

    // Pack
    pack::package_source(request.source, request.function_name, temp.path())
        .map_err(EngineError::Sandbox)?;

    // Generate scripts
    let staging = temp.path().join("outputs");
    fs::create_dir(&staging)?;
    let mapping = map_arguments(request.resolved, request.store_root, temp.path(), &staging);

    fs::write(
        temp.path().join("kwargs.json"),
        serde_json::to_vec(&mapping.kwargs).map_err(|e| EngineError::Sandbox(e.into()))?,
    )?;

    let driver = DriverScript {
        function: request.function_name.to_string(),
    };
    fs::write(temp.path().join("run.py"), driver.render())?;

    let env_script = EnvScript {
        env: vec![
            EnvVar {
                name: STORE_DIR_ENV.to_string(),
                value: GUEST_STORE_DIR.to_string(),
            },
            EnvVar {
                name: "PYTHONPATH".to_string(),
                value: format!("{}/function_src/_local_modules", GUEST_CALL_DIR),
            },
        ],
        runtime: request.source.runtime.clone(),
        driver: format!("{}/run.py", GUEST_CALL_DIR),
    };
    fs::write(temp.path().join("run.sh"), env_script.render())?;

    // Resolve the engine from PATH, falling back to the configured name as-is.
    let engine_path =
        which::which(request.engine).unwrap_or_else(|_| PathBuf::from(request.engine));

    let plan = LaunchPlan {
        engine: engine_path,
        image: request.image.to_string(),
        mounts: mapping.mounts,
        command: vec!["bash".to_string(), format!("{}/run.sh", GUEST_CALL_DIR)],
    };
    let launcher = temp.path().join("launch.sh");
    fs::write(&launcher, plan.render())?;

    // Launch
    info!(
        operation = "sandbox.launch",
        function = %request.function_name,
        image = %request.image,
        "launching container"
    );

    let capture = OutputCapture::new();
    let mut child = Command::new("bash")
        .arg(&launcher)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let out_thread = tee_stream(
        child.stdout.take().expect("stdout was piped"),
        capture.stdout_writer(),
    );
    let err_thread = tee_stream(
        child.stderr.take().expect("stderr was piped"),
        capture.stderr_writer(),
    );

    let status = child.wait()?;
    let _ = out_thread.join();
    let _ = err_thread.join();
    let runtime_info = capture.finish();

    // Collect
    if !status.success() {
        let code = status.code().unwrap_or(-1);
        return Err(EngineError::ContainerExecutionFailed { code });
    }

    let retval_bytes = fs::read(temp.path().join("retval.json"))?;
    let envelope: RetvalEnvelope = serde_json::from_slice(&retval_bytes)
        .map_err(|e| EngineError::Sandbox(anyhow::anyhow!("invalid result file: {}", e)))?;

    for (staged, destination) in &mapping.outputs_to_copy {
        if staged.exists() {
            fs::copy(staged, destination)?;
            debug!(
                operation = "sandbox.collect",
                "copied {} -> {}",
                staged.display(),
                destination.display()
            );
        }
    }

    // Cleanup happens when `temp` drops, on this and every earlier return.
    Ok((envelope.retval, runtime_info))
}

/// Rewrite file-valued arguments to their fixed in-container paths and build
/// the corresponding bind mounts.
fn map_arguments(
    resolved: &ResolvedCall,
    store_root: &Path,
    call_dir: &Path,
    staging: &Path,
) -> CallMapping {
    let mut kwargs = resolved.parameters.clone();
    let mut mounts = vec![
        MountSpec {
            host: store_root.to_path_buf(),
            guest: GUEST_STORE_DIR.to_string(),
            readonly: false,
        },
        MountSpec {
            host: call_dir.to_path_buf(),
            guest: GUEST_CALL_DIR.to_string(),
            readonly: false,
        },
    ];

    for (name, host_path) in &resolved.inputs {
        let guest = format!("{}/{}{}", GUEST_INPUTS_DIR, name, extension_of(host_path));
        kwargs.insert(name.clone(), Value::String(guest.clone()));
        mounts.push(MountSpec {
            host: host_path.clone(),
            guest,
            readonly: true,
        });
    }

    mounts.push(MountSpec {
        host: staging.to_path_buf(),
        guest: GUEST_OUTPUTS_DIR.to_string(),
        readonly: false,
    });

    let mut outputs_to_copy = Vec::new();
    for (name, handle) in &resolved.outputs {
        let destination = match handle.path() {
            Some(path) => path.to_path_buf(),
            None => continue,
        };
        let ext = extension_of(&destination);
        kwargs.insert(
            name.clone(),
            Value::String(format!("{}/{}{}", GUEST_OUTPUTS_DIR, name, ext)),
        );
        outputs_to_copy.push((staging.join(format!("{}{}", name, ext)), destination));
    }

    CallMapping {
        kwargs,
        mounts,
        outputs_to_copy,
    }
}

/// Preserve the host file's extension on its fixed in-container name.
fn extension_of(path: &Path) -> String {
    match path.extension() {
        Some(ext) => format!(".{}", ext.to_string_lossy()),
        None => String::new(),
    }
}

/// Forward a child stream to the real one while buffering it in full.
fn tee_stream<R: Read + Send + 'static>(
    mut reader: R,
    mut writer: TeeWriter,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        use std::io::Write;
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = writer.write_all(&buf[..n]);
                }
                Err(_) => break,
            }
        }
    })
}
