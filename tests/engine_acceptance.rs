//! Acceptance tests for the memoization engine.
//!
//! Each test builds a fully isolated engine (own store and record log in a
//! temp directory) and drives it through the library API.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use speicher::{
    CallArguments, CallOptions, ContentStore, Engine, EngineConfig, EngineError, FunctionContract,
};

/// Isolated engine plus the side-effect counter of its registered functions.
struct TestWorkspace {
    temp_dir: TempDir,
    engine: Engine,
    invocations: Arc<AtomicUsize>,
}

impl TestWorkspace {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.store.dir = temp_dir.path().join("store");
        config.record_log.dir = temp_dir.path().join("record-log");

        Self {
            temp_dir,
            engine: Engine::new(config).unwrap(),
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    fn create_file(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    /// `add(x, y)`: returns x + y, printing a progress line.
    fn register_add(&mut self, version: &str) {
        let counter = Arc::clone(&self.invocations);
        self.engine.register(
            FunctionContract::builder("add", version)
                .parameter("x")
                .parameter("y")
                .build(),
            Box::new(move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                let x: i64 = ctx.param_as("x")?;
                let y: i64 = ctx.param_as("y")?;
                writeln!(ctx.stdout, "computing {} + {}", x, y)?;
                Ok(serde_json::json!(x + y))
            }),
        );
    }

    /// `checksum(data) -> digest`: reads a declared input, writes a declared
    /// output, and reports on both streams.
    fn register_checksum(&mut self) {
        let counter = Arc::clone(&self.invocations);
        self.engine.register(
            FunctionContract::builder("checksum", "1")
                .input("data")
                .output("digest")
                .parameter_with_default("label", "sum")
                .build(),
            Box::new(move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                let bytes = fs::read(ctx.input("data")?)?;
                let total: u64 = bytes.iter().map(|b| *b as u64).sum();
                let label: String = ctx.param_as("label")?;

                fs::write(ctx.output("digest")?, format!("{}:{}", label, total))?;
                writeln!(ctx.stdout, "{} bytes summed", bytes.len())?;
                writeln!(ctx.stderr, "labelled {}", label)?;
                Ok(serde_json::json!(total))
            }),
        );
    }
}

#[test]
fn test_identical_call_is_served_from_cache() {
    let mut workspace = TestWorkspace::new();
    workspace.register_add("1");

    let args = || CallArguments::new().value("x", 4).value("y", 5);

    let first = workspace
        .engine
        .call("add", "1", args(), CallOptions::default())
        .unwrap();
    assert_eq!(first.return_value, serde_json::json!(9));
    assert!(!first.from_cache);
    assert_eq!(workspace.invocations(), 1);

    let second = workspace
        .engine
        .call("add", "1", args(), CallOptions::default())
        .unwrap();
    assert_eq!(second.return_value, serde_json::json!(9));
    assert!(second.from_cache);
    // The underlying body did not run again.
    assert_eq!(workspace.invocations(), 1);
    assert_eq!(second.descriptor_hash, first.descriptor_hash);
}

#[test]
fn test_argument_supply_order_does_not_matter() {
    let mut workspace = TestWorkspace::new();
    workspace.register_add("1");

    workspace
        .engine
        .call(
            "add",
            "1",
            CallArguments::new().value("x", 4).value("y", 5),
            CallOptions::default(),
        )
        .unwrap();

    let reordered = workspace
        .engine
        .call(
            "add",
            "1",
            CallArguments::new().value("y", 5).value("x", 4),
            CallOptions::default(),
        )
        .unwrap();

    assert!(reordered.from_cache);
    assert_eq!(workspace.invocations(), 1);
}

#[test]
fn test_version_bump_invalidates_cache() {
    let mut workspace = TestWorkspace::new();
    workspace.register_add("1");
    workspace.register_add("2");

    let args = || CallArguments::new().value("x", 4).value("y", 5);

    let v1 = workspace
        .engine
        .call("add", "1", args(), CallOptions::default())
        .unwrap();
    let v2 = workspace
        .engine
        .call("add", "2", args(), CallOptions::default())
        .unwrap();

    assert_ne!(v1.descriptor_hash, v2.descriptor_hash);
    assert!(!v2.from_cache);
    assert_eq!(workspace.invocations(), 2);
}

#[test]
fn test_force_run_always_executes_and_records() {
    let mut workspace = TestWorkspace::new();
    workspace.register_add("1");

    let args = || CallArguments::new().value("x", 4).value("y", 5);

    workspace
        .engine
        .call("add", "1", args(), CallOptions::default())
        .unwrap();
    let forced = workspace
        .engine
        .call("add", "1", args(), CallOptions::forced())
        .unwrap();

    assert!(!forced.from_cache);
    assert_eq!(workspace.invocations(), 2);

    // The forced run inserted its own record; later calls still hit.
    let after = workspace
        .engine
        .call("add", "1", args(), CallOptions::default())
        .unwrap();
    assert!(after.from_cache);
    assert_eq!(workspace.invocations(), 2);
}

#[test]
fn test_cache_hit_round_trip_is_lossless() {
    let mut workspace = TestWorkspace::new();
    workspace.register_checksum();
    let input = workspace.create_file("data.bin", &[1, 2, 3, 4]);
    let output = workspace.temp_dir.path().join("digest.txt");

    let args = || {
        CallArguments::new()
            .path("data", &input)
            .path("digest", &output)
    };

    let fresh = workspace
        .engine
        .call("checksum", "1", args(), CallOptions::default())
        .unwrap();
    let cached = workspace
        .engine
        .call("checksum", "1", args(), CallOptions::default())
        .unwrap();

    assert_eq!(workspace.invocations(), 1);
    assert_eq!(cached.return_value, fresh.return_value);
    assert_eq!(cached.runtime_info.stdout, "4 bytes summed\n");
    assert_eq!(cached.runtime_info.stderr, "labelled sum\n");
    assert_eq!(cached.runtime_info, fresh.runtime_info);

    // Output content survives the round trip byte for byte.
    let restored = cached.output("digest").unwrap().path().unwrap();
    assert_eq!(fs::read(restored).unwrap(), fs::read(&output).unwrap());
    assert_eq!(fs::read(restored).unwrap(), b"sum:10");
}

#[test]
fn test_unreachable_blobs_trigger_reexecution() {
    let mut workspace = TestWorkspace::new();
    workspace.register_add("1");

    let args = || CallArguments::new().value("x", 4).value("y", 5);

    workspace
        .engine
        .call("add", "1", args(), CallOptions::default())
        .unwrap();
    assert_eq!(workspace.invocations(), 1);

    // Wipe the blob store; the record now references unreachable content.
    let objects = workspace.temp_dir.path().join("store/objects");
    fs::remove_dir_all(&objects).unwrap();
    fs::create_dir_all(&objects).unwrap();

    let rerun = workspace
        .engine
        .call("add", "1", args(), CallOptions::default())
        .unwrap();

    // Treated as a miss, not an error.
    assert!(!rerun.from_cache);
    assert_eq!(rerun.return_value, serde_json::json!(9));
    assert_eq!(workspace.invocations(), 2);
}

#[test]
fn test_allocated_output_is_persisted_and_cleaned() {
    let mut workspace = TestWorkspace::new();
    let seen_path: Arc<Mutex<Option<PathBuf>>> = Arc::new(Mutex::new(None));

    let observer = Arc::clone(&seen_path);
    workspace.engine.register(
        FunctionContract::builder("emit", "1").output("result").build(),
        Box::new(move |ctx| {
            let path = ctx.output("result")?.to_path_buf();
            fs::write(&path, b"emitted bytes")?;
            *observer.lock().unwrap() = Some(path);
            Ok(serde_json::Value::Null)
        }),
    );

    let result = workspace
        .engine
        .call(
            "emit",
            "1",
            CallArguments::new().allocate("result"),
            CallOptions::default(),
        )
        .unwrap();

    let scratch = seen_path.lock().unwrap().clone().unwrap();
    // The scratch path the function wrote to is gone...
    assert!(!scratch.exists());

    // ...and the bytes are fetchable by content reference.
    let handle = result.output("result").unwrap();
    assert!(handle.path().is_none());
    let reference = handle.reference().unwrap();
    assert_eq!(
        workspace.engine.store().load_bytes(reference).unwrap().unwrap(),
        b"emitted bytes"
    );
}

#[test]
fn test_unwritten_optional_output_is_dropped() {
    let mut workspace = TestWorkspace::new();
    workspace.engine.register(
        FunctionContract::builder("quiet", "1")
            .optional_output("extra")
            .build(),
        Box::new(|_| Ok(serde_json::json!("done"))),
    );

    let result = workspace
        .engine
        .call(
            "quiet",
            "1",
            CallArguments::new().allocate("extra"),
            CallOptions::default(),
        )
        .unwrap();

    // Allocated but never written: deleted without being persisted.
    assert!(result.output("extra").is_none());
}

#[test]
fn test_missing_required_input_fails_before_execution() {
    let mut workspace = TestWorkspace::new();
    workspace.register_checksum();

    let err = workspace
        .engine
        .call(
            "checksum",
            "1",
            CallArguments::new().allocate("digest"),
            CallOptions::default(),
        )
        .unwrap_err();

    assert!(matches!(err, EngineError::MissingRequiredInput(name) if name == "data"));
    assert_eq!(workspace.invocations(), 0);
}

#[test]
fn test_execution_failure_stores_no_record() {
    let mut workspace = TestWorkspace::new();
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&attempts);
    workspace.engine.register(
        FunctionContract::builder("flaky", "1").build(),
        Box::new(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                anyhow::bail!("transient failure");
            }
            Ok(serde_json::json!("recovered"))
        }),
    );

    let err = workspace
        .engine
        .call("flaky", "1", CallArguments::new(), CallOptions::default())
        .unwrap_err();
    assert!(matches!(err, EngineError::Execution(_)));

    // No record was stored for the failed call: the retry executes.
    let retry = workspace
        .engine
        .call("flaky", "1", CallArguments::new(), CallOptions::default())
        .unwrap();
    assert!(!retry.from_cache);
    assert_eq!(retry.return_value, serde_json::json!("recovered"));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn test_input_identity_is_content_not_path() {
    let mut workspace = TestWorkspace::new();
    workspace.register_checksum();

    let first = workspace.create_file("first.bin", &[7, 7]);
    let renamed = workspace.create_file("renamed.bin", &[7, 7]);
    let out = workspace.temp_dir.path().join("digest.txt");

    workspace
        .engine
        .call(
            "checksum",
            "1",
            CallArguments::new().path("data", &first).path("digest", &out),
            CallOptions::default(),
        )
        .unwrap();

    // Same bytes under a different path: still a hit.
    let hit = workspace
        .engine
        .call(
            "checksum",
            "1",
            CallArguments::new()
                .path("data", &renamed)
                .path("digest", &out),
            CallOptions::default(),
        )
        .unwrap();

    assert!(hit.from_cache);
    assert_eq!(workspace.invocations(), 1);
}
