// SPDX-License-Identifier: GPL-3.0

//! Runtime execution.
//!
//! Every interaction with the state-transition runtime is an [`ExecutionTask`]. Tasks are
//! submitted to an [`ExecutionQueue`], which runs them one at a time on a dedicated worker
//! thread hosting a [`RuntimeEngine`]. While a task runs, the engine reads storage through
//! [`HostStorage`]; the queue answers those reads from the storage stack of the block that
//! submitted the task.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          ExecutionQueue                              │
//! │                                                                      │
//! │  add_and_run_task ──► FIFO ──► dispatcher (tokio task)               │
//! │                                    │            ▲                    │
//! │                          task      │            │ storage requests   │
//! │                                    ▼            │                    │
//! │                         ┌─────────────────────────────┐              │
//! │                         │ worker thread               │              │
//! │                         │   RuntimeEngine::execute    │              │
//! │                         │   (SmoldotEngine)           │              │
//! │                         └─────────────────────────────┘              │
//! │                                    │                                 │
//! │                                    ▼                                 │
//! │                      on_complete(Result<TaskOutput>)                 │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ExecutorError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subxt::config::substrate::H256;

mod engine;
mod proof;
mod queue;

pub use engine::SmoldotEngine;
pub use queue::{ExecutionQueue, TaskStorage};

/// Signature mock mode for testing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SignatureMockMode {
	/// No mock - verify all signatures normally.
	#[default]
	None,
	/// Accept signatures starting with magic bytes `0xdeadbeef` (padded with `0xcd`).
	///
	/// Real signatures are still verified normally, but transactions with magic signatures
	/// bypass verification. Useful to impersonate any account on a fork.
	MagicSignature,
	/// Accept all signatures as valid.
	AlwaysValid,
}

/// Configuration for runtime execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
	/// Signature mock mode for testing.
	pub signature_mock: SignatureMockMode,
	/// Whether to allow unresolved imports in the runtime.
	pub allow_unresolved_imports: bool,
	/// Maximum log level (0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace).
	pub max_log_level: u32,
	/// Value to return for storage proof size queries.
	pub storage_proof_size: u64,
	/// Number of heap pages. `None` reads `:heappages` from storage, falling back to the
	/// executor default.
	pub heap_pages: Option<u32>,
}

impl Default for ExecutorConfig {
	fn default() -> Self {
		Self {
			signature_mock: SignatureMockMode::None,
			allow_unresolved_imports: false,
			max_log_level: 3, // Info
			storage_proof_size: 0,
			heap_pages: None,
		}
	}
}

/// Trie layout used to compute a state root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrieVersion {
	/// Values are always stored inline.
	#[default]
	V0,
	/// Values longer than 32 bytes are stored by hash.
	V1,
}

impl From<u8> for TrieVersion {
	fn from(state_version: u8) -> Self {
		if state_version == 0 { TrieVersion::V0 } else { TrieVersion::V1 }
	}
}

/// A unit of work for the runtime engine.
#[derive(Debug, Clone)]
pub enum ExecutionTask {
	/// Read the version of a runtime.
	RuntimeVersion {
		/// The runtime WASM code.
		code: Arc<[u8]>,
	},
	/// Fetch the SCALE-encoded metadata of a runtime.
	Metadata {
		/// The runtime WASM code.
		code: Arc<[u8]>,
	},
	/// Run one or more runtime calls in sequence.
	///
	/// Each call observes the storage changes of the calls before it. The output is the
	/// last call's output, the storage diff is the accumulated diff of all calls.
	Call {
		/// The runtime WASM code.
		code: Arc<[u8]>,
		/// Hash of the block the calls run on top of.
		block_hash: H256,
		/// `(method, SCALE-encoded arguments)` pairs.
		calls: Vec<(String, Vec<u8>)>,
	},
	/// Compute the root of a trie holding `entries`.
	StateRoot {
		/// The trie entries.
		entries: Vec<(Vec<u8>, Vec<u8>)>,
		/// Trie layout.
		version: TrieVersion,
	},
	/// Apply `updates` to the trie described by a proof and build a proof of the result.
	CreateProof {
		/// The original proof nodes.
		nodes: Vec<Vec<u8>>,
		/// Updated entries. `None` removes the key.
		updates: Vec<(Vec<u8>, Option<Vec<u8>>)>,
	},
	/// Verify a proof against `root` and read its entries.
	DecodeProof {
		/// The expected trie root.
		root: H256,
		/// The proof nodes.
		nodes: Vec<Vec<u8>>,
	},
}

impl ExecutionTask {
	/// Short name of the task kind, used in logs and errors.
	pub fn kind(&self) -> &'static str {
		match self {
			ExecutionTask::RuntimeVersion { .. } => "RuntimeVersion",
			ExecutionTask::Metadata { .. } => "Metadata",
			ExecutionTask::Call { .. } => "Call",
			ExecutionTask::StateRoot { .. } => "StateRoot",
			ExecutionTask::CreateProof { .. } => "CreateProof",
			ExecutionTask::DecodeProof { .. } => "DecodeProof",
		}
	}
}

/// What a task produced.
#[derive(Debug, Clone)]
pub enum TaskOutput {
	/// Output of [`ExecutionTask::RuntimeVersion`].
	RuntimeVersion(RuntimeVersion),
	/// Output of [`ExecutionTask::Metadata`]: the raw `Metadata_metadata` return value.
	Metadata(Vec<u8>),
	/// Output of [`ExecutionTask::Call`].
	Call(RuntimeCallResult),
	/// Output of [`ExecutionTask::StateRoot`].
	StateRoot(H256),
	/// Output of [`ExecutionTask::CreateProof`].
	Proof {
		/// Root of the updated trie.
		root: H256,
		/// The new proof nodes.
		nodes: Vec<Vec<u8>>,
	},
	/// Output of [`ExecutionTask::DecodeProof`], ordered by key.
	Entries(Vec<(Vec<u8>, Vec<u8>)>),
}

/// Result of a runtime call execution.
#[derive(Debug, Clone, Default)]
pub struct RuntimeCallResult {
	/// The output bytes returned by the runtime function.
	pub output: Vec<u8>,
	/// Storage changes made during execution.
	///
	/// Each entry is `(key, value)` where `value` is `None` for deletions.
	pub storage_diff: Vec<(Vec<u8>, Option<Vec<u8>>)>,
	/// Offchain storage changes made during execution.
	pub offchain_storage_diff: Vec<(Vec<u8>, Option<Vec<u8>>)>,
	/// Log messages emitted by the runtime.
	pub logs: Vec<RuntimeLog>,
}

/// A log message emitted by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLog {
	/// The log message.
	pub message: String,
	/// Log level (1=error, 2=warn, 3=info, 4=debug, 5=trace).
	pub level: Option<u32>,
	/// Log target (e.g., "runtime", "pallet_balances").
	pub target: Option<String>,
}

/// Runtime version information.
///
/// Serializes with the field names of `state_getRuntimeVersion`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeVersion {
	/// Spec name (e.g., "polkadot", "kusama").
	pub spec_name: String,
	/// Implementation name.
	pub impl_name: String,
	/// Authoring version.
	pub authoring_version: u32,
	/// Spec version.
	pub spec_version: u32,
	/// Implementation version.
	pub impl_version: u32,
	/// Transaction version.
	pub transaction_version: u32,
	/// State version (0 or 1).
	pub state_version: u8,
}

/// Storage the engine reads while a task runs.
///
/// Calls block the worker thread until the owning block's stack has answered.
pub trait HostStorage {
	/// The value of `key`, or `None` if it has none.
	fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, ExecutorError>;

	/// The first key under `prefix` strictly greater than `key`.
	fn next_key(&mut self, prefix: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>, ExecutorError>;
}

/// The state-transition engine.
///
/// Engines live on the queue's worker thread and never move between threads.
pub trait RuntimeEngine {
	/// Run one task to completion.
	///
	/// An `Err` fails the task only; the engine keeps serving subsequent tasks.
	fn execute(
		&mut self,
		task: ExecutionTask,
		host: &mut dyn HostStorage,
	) -> Result<TaskOutput, ExecutorError>;
}

/// Builds a fresh engine. Called on the worker thread each time a worker is provisioned.
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn RuntimeEngine> + Send + Sync>;

/// A factory producing [`SmoldotEngine`]s with `config`.
pub fn smoldot_engine_factory(config: ExecutorConfig) -> EngineFactory {
	Arc::new(move || Box::new(SmoldotEngine::new(config.clone())) as Box<dyn RuntimeEngine>)
}
