use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::capture;
use crate::codec::CallResult;
use crate::config::EngineConfig;
use crate::contract::{FunctionContract, FunctionRegistry};
use crate::descriptor::{build_descriptor, CallArguments};
use crate::dispatch::{Dispatcher, NativeBody, SandboxSettings};
use crate::error::{EngineError, Result};
use crate::gate::CacheGate;
use crate::record::{RecordLog, RocksRecordLog};
use crate::sandbox::SourceUnit;
use crate::store::{ContentStore, FilesystemStore};

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Skip the cache lookup; the call always executes and always inserts a
    /// fresh record.
    pub force_run: bool,
    /// Run inside this container image instead of in-process.
    pub container: Option<String>,
}

impl CallOptions {
    pub fn forced() -> Self {
        Self {
            force_run: true,
            container: None,
        }
    }

    pub fn in_container(image: impl Into<String>) -> Self {
        Self {
            force_run: false,
            container: Some(image.into()),
        }
    }
}

/// The memoization engine: registry, cache gate, and execution dispatch
/// behind one facade.
///
/// A single call executes synchronously on the invoking thread. Independent
/// calls may run concurrently from separate threads; the store and log are
/// shared and safe for concurrent use. Two concurrent calls with the same
/// descriptor hash are not coordinated: both may execute, both insert a
/// record, and read-time recency picks the winner.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn ContentStore>,
    log: Arc<dyn RecordLog>,
    registry: FunctionRegistry,
}

impl Engine {
    /// Build an engine with the default filesystem store and RocksDB record
    /// log at the configured locations.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let store = FilesystemStore::new(&config.store.dir).map_err(EngineError::Storage)?;
        let log = RocksRecordLog::open(&config.record_log.dir).map_err(EngineError::Storage)?;
        Ok(Self::with_components(config, Arc::new(store), Arc::new(log)))
    }

    /// Build an engine over externally constructed components.
    pub fn with_components(
        config: EngineConfig,
        store: Arc<dyn ContentStore>,
        log: Arc<dyn RecordLog>,
    ) -> Self {
        Self {
            config,
            store,
            log,
            registry: FunctionRegistry::new(),
        }
    }

    pub fn store(&self) -> &dyn ContentStore {
        &*self.store
    }

    pub fn register(&mut self, contract: FunctionContract, body: NativeBody) {
        self.registry.register(contract, body);
    }

    pub fn register_with_source(
        &mut self,
        contract: FunctionContract,
        body: NativeBody,
        source: SourceUnit,
    ) {
        self.registry.register_with_source(contract, body, source);
    }

    /// Invoke a registered function through the cache gate.
    ///
    /// Hit: the recorded result is reconstructed, its console output replayed
    /// on the real streams, and the body never runs. Miss: the body executes
    /// (locally or sandboxed), populated outputs are persisted into the
    /// content store, and a fresh record is appended.
    pub fn call(
        &self,
        name: &str,
        version: &str,
        args: CallArguments,
        options: CallOptions,
    ) -> Result<CallResult> {
        let function =
            self.registry
                .get(name, version)
                .ok_or_else(|| EngineError::FunctionNotRegistered {
                    name: name.to_string(),
                    version: version.to_string(),
                })?;

        let (descriptor, mut resolved) = build_descriptor(&function.contract, &args, &*self.store)?;
        let descriptor_hash = descriptor.canonical_hash(&*self.store);

        let gate = CacheGate::new(&*self.log, &*self.store);
        if let Some(result) = gate.lookup(&descriptor_hash, options.force_run) {
            // Scratch destinations allocated during resolution are unused on
            // a hit; no temporary path outlives the call.
            resolved.discard_temporary_outputs();
            capture::replay(&result.runtime_info);
            return Ok(result);
        }

        let dispatcher = Dispatcher::new(SandboxSettings {
            engine: &self.config.sandbox.engine,
            store_root: &self.config.store.dir,
        });
        let (return_value, runtime_info) =
            match dispatcher.run(function, &resolved, options.container.as_deref()) {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Execution failed: no record, no leftover scratch files.
                    resolved.discard_temporary_outputs();
                    return Err(e);
                }
            };

        let mut outputs = BTreeMap::new();
        for (output_name, mut handle) in resolved.outputs {
            if handle.is_populated() {
                handle.persist(&*self.store).map_err(EngineError::Storage)?;
                outputs.insert(output_name, handle);
            } else {
                // Allocated but never written, e.g. an ignored optional
                // output: deleted without being persisted.
                handle.discard();
            }
        }

        let result = CallResult {
            descriptor,
            descriptor_hash: descriptor_hash.clone(),
            runtime_info,
            return_value,
            outputs,
            from_cache: false,
        };
        gate.store(&result)?;

        info!(
            operation = "engine.call",
            function = %name,
            descriptor_hash = %descriptor_hash,
            "call executed and recorded"
        );
        Ok(result)
    }
}
