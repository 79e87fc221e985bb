// Library interface for speicher: content-addressed function memoization and
// sandboxed execution. Integration tests and embedding applications use these
// modules directly.

pub mod capture;
pub mod codec;
pub mod config;
pub mod contract;
pub mod descriptor;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod gate;
pub mod handle;
pub mod logging;
pub mod record;
pub mod sandbox;
pub mod store;

// Re-export commonly used types
pub use capture::RuntimeInfo;
pub use codec::{CallResult, StoredRecord};
pub use config::EngineConfig;
pub use contract::{ContractBuilder, FunctionContract, FunctionRegistry};
pub use descriptor::{build_descriptor, ArgValue, CallArguments, CallDescriptor};
pub use dispatch::{CallContext, NativeBody};
pub use engine::{CallOptions, Engine};
pub use error::EngineError;
pub use gate::CacheGate;
pub use handle::FileHandle;
pub use record::{RecordLog, RocksRecordLog};
pub use sandbox::SourceUnit;
pub use store::{ContentStore, FileFingerprint, FilesystemStore};
