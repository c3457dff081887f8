// SPDX-License-Identifier: GPL-3.0

//! The smoldot-backed [`RuntimeEngine`].
//!
//! smoldot already implements the Substrate host functions (storage, crypto, hashing,
//! allocation, logging), so runtime calls only have to answer its storage requests. Those
//! are routed to [`HostStorage`], i.e. back into the storage stack of the submitting block.
//!
//! ```text
//! execute(Call) ──► Create VM Prototype ──► Start runtime_call
//!                                                 │
//!                                                 ▼
//!                                ┌────────── Event Loop ──────────┐
//!                                ▼                ▼               ▼
//!                       StorageGet/NextKey  SignatureVerify     LogEmit
//!                                │                │               │
//!                          HostStorage      Verify or mock   forward to `log`
//!                                └────────────────┬───────────────┘
//!                                                 ▼
//!                                   Finished ──► RuntimeCallResult
//! ```

use super::{
	ExecutionTask, ExecutorConfig, HostStorage, RuntimeCallResult, RuntimeEngine, RuntimeLog,
	RuntimeVersion, SignatureMockMode, TaskOutput, TrieVersion, proof,
};
use crate::{
	error::ExecutorError,
	strings::{
		executor::{magic_signature, runtime_api, storage_prefixes, targets},
		storage::keys,
	},
};
use log::{Level, debug, log, trace};
use smoldot::{
	executor::{
		self,
		host::{Config as HostConfig, HostVmPrototype, LogEmitInfo},
		runtime_call::{self, OffchainContext, RuntimeCall},
		storage_diff::TrieDiff,
		vm::{ExecHint, HeapPages},
	},
	trie::{TrieEntryVersion, bytes_to_nibbles, nibbles_to_bytes_suffix_extend},
};
use sp_core::Blake2Hasher;
use sp_trie::{LayoutV0, LayoutV1, TrieConfiguration};
use std::{collections::BTreeMap, iter, ops::Bound};
use subxt::config::substrate::H256;

type Changes = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Runs [`ExecutionTask`]s with smoldot's executor.
///
/// A fresh VM is instantiated per runtime call, so the engine holds no state between
/// tasks besides its configuration.
#[derive(Debug, Clone, Default)]
pub struct SmoldotEngine {
	config: ExecutorConfig,
}

impl SmoldotEngine {
	/// Create an engine with the given configuration.
	pub fn new(config: ExecutorConfig) -> Self {
		Self { config }
	}

	/// The engine configuration.
	pub fn config(&self) -> &ExecutorConfig {
		&self.config
	}

	/// Heap pages for a VM: the configured value, else `:heappages`, else the default.
	fn heap_pages(&self, host: &mut dyn HostStorage) -> Result<HeapPages, ExecutorError> {
		if let Some(pages) = self.config.heap_pages {
			return Ok(HeapPages::from(pages));
		}
		let Some(raw) = host.get(keys::HEAP_PAGES)? else {
			return Ok(executor::DEFAULT_HEAP_PAGES);
		};
		let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
			ExecutorError::InvalidHeapPages {
				message: format!("expected 8 bytes, found {}", raw.len()),
			}
		})?;
		let pages = u32::try_from(u64::from_le_bytes(bytes)).map_err(|e| {
			ExecutorError::InvalidHeapPages { message: e.to_string() }
		})?;
		Ok(HeapPages::from(pages))
	}

	fn prototype(
		&self,
		code: &[u8],
		heap_pages: HeapPages,
		allow_unresolved_imports: bool,
	) -> Result<HostVmPrototype, ExecutorError> {
		Ok(HostVmPrototype::new(HostConfig {
			module: code,
			heap_pages,
			exec_hint: ExecHint::ValidateAndExecuteOnce,
			allow_unresolved_imports,
		})?)
	}

	/// Read the version from the WASM custom sections (or `Core_version`).
	fn runtime_version(
		&self,
		code: &[u8],
		host: &mut dyn HostStorage,
	) -> Result<RuntimeVersion, ExecutorError> {
		let prototype = self.prototype(code, self.heap_pages(host)?, true)?;
		let version = prototype.runtime_version().decode();

		Ok(RuntimeVersion {
			spec_name: version.spec_name.to_string(),
			impl_name: version.impl_name.to_string(),
			authoring_version: version.authoring_version,
			spec_version: version.spec_version,
			impl_version: version.impl_version,
			transaction_version: version.transaction_version.unwrap_or(0),
			state_version: version.state_version.map(|v| v.into()).unwrap_or(0),
		})
	}

	/// Run `calls` in order, each on top of the changes of the previous ones.
	fn calls(
		&self,
		code: &[u8],
		block_hash: H256,
		calls: &[(String, Vec<u8>)],
		host: &mut dyn HostStorage,
	) -> Result<RuntimeCallResult, ExecutorError> {
		let heap_pages = self.heap_pages(host)?;
		let mut changes = Changes::new();
		let mut offchain_changes = Changes::new();
		let mut logs = Vec::new();
		let mut output = Vec::new();

		for (method, args) in calls {
			debug!("Calling `{method}` on top of {block_hash:?}");
			output = self.call(
				code,
				heap_pages,
				method,
				args,
				host,
				&mut changes,
				&mut offchain_changes,
				&mut logs,
			)?;
		}

		Ok(RuntimeCallResult {
			output,
			storage_diff: changes.into_iter().collect(),
			offchain_storage_diff: offchain_changes.into_iter().collect(),
			logs,
		})
	}

	/// Execute one runtime call. On success its storage changes are merged into `changes`.
	#[allow(clippy::too_many_arguments)]
	fn call(
		&self,
		code: &[u8],
		heap_pages: HeapPages,
		method: &str,
		args: &[u8],
		host: &mut dyn HostStorage,
		changes: &mut Changes,
		offchain_changes: &mut Changes,
		logs: &mut Vec<RuntimeLog>,
	) -> Result<Vec<u8>, ExecutorError> {
		let vm_proto = self.prototype(code, heap_pages, self.config.allow_unresolved_imports)?;

		let mut vm = runtime_call::run(runtime_call::Config {
			virtual_machine: vm_proto,
			function_to_call: method,
			parameter: iter::once(args),
			storage_main_trie_changes: TrieDiff::default(),
			max_log_level: self.config.max_log_level,
			calculate_trie_changes: false,
			storage_proof_size_behavior:
				runtime_call::StorageProofSizeBehavior::ConstantReturnValue(
					self.config.storage_proof_size,
				),
		})
		.map_err(|(err, _)| ExecutorError::StartError {
			method: method.to_string(),
			message: err.to_string(),
		})?;

		loop {
			vm = match vm {
				RuntimeCall::Finished(result) => {
					let success = result.map_err(|err| ExecutorError::RuntimeError {
						method: method.to_string(),
						message: err.to_string(),
					})?;
					success.storage_changes.storage_changes_iter_unordered().for_each(
						|(child, key, value)| {
							let key = match child {
								Some(child) =>
									prefixed_child_key(child.iter().copied(), key.iter().copied()),
								None => key.to_vec(),
							};
							changes.insert(key, value.map(|v| v.to_vec()));
						},
					);
					return Ok(success.virtual_machine.value().as_ref().to_vec());
				},

				RuntimeCall::StorageGet(req) => {
					let key = match req.child_trie() {
						Some(child) => prefixed_child_key(
							child.as_ref().iter().copied(),
							req.key().as_ref().iter().copied(),
						),
						None => req.key().as_ref().to_vec(),
					};
					// Changes of earlier calls in the same task shadow the host.
					let value = match changes.get(&key) {
						Some(value) => value.clone(),
						None => host.get(&key)?,
					};
					req.inject_value(value.as_ref().map(|v| (iter::once(v), TrieEntryVersion::V1)))
				},

				RuntimeCall::ClosestDescendantMerkleValue(req) => req.resume_unknown(),

				RuntimeCall::NextKey(req) =>
					if req.branch_nodes() {
						req.inject_key(None::<Vec<_>>.map(|x| x.into_iter()))
					} else {
						let child_prefix = req
							.child_trie()
							.map(|child| {
								prefixed_child_key(child.as_ref().iter().copied(), iter::empty())
							})
							.unwrap_or_default();
						let prefix = [
							child_prefix.as_slice(),
							&nibbles_to_bytes_suffix_extend(req.prefix()).collect::<Vec<_>>(),
						]
						.concat();
						let key = [
							child_prefix.as_slice(),
							&nibbles_to_bytes_suffix_extend(req.key()).collect::<Vec<_>>(),
						]
						.concat();

						// Child trie requests expect keys relative to the child trie.
						let next = next_key(changes, host, &prefix, &key)?
							.map(|k| k.into_iter().skip(child_prefix.len()).collect::<Vec<_>>());
						req.inject_key(next.map(|k| bytes_to_nibbles(k.into_iter())))
					},

				RuntimeCall::SignatureVerification(req) => match self.config.signature_mock {
					SignatureMockMode::MagicSignature =>
						if is_magic_signature(req.signature().as_ref()) {
							req.resume_success()
						} else {
							req.verify_and_resume()
						},
					SignatureMockMode::AlwaysValid => req.resume_success(),
					SignatureMockMode::None => req.verify_and_resume(),
				},

				RuntimeCall::OffchainStorageSet(req) => {
					offchain_changes.insert(
						req.key().as_ref().to_vec(),
						req.value().map(|x| x.as_ref().to_vec()),
					);
					req.resume()
				},

				RuntimeCall::Offchain(ctx) => match ctx {
					OffchainContext::StorageGet(req) => {
						let value = offchain_changes.get(req.key().as_ref()).cloned().flatten();
						req.inject_value(value)
					},
					OffchainContext::StorageSet(req) => {
						let key = req.key().as_ref().to_vec();
						let replace = match (offchain_changes.get(&key), req.old_value()) {
							(Some(Some(current)), Some(old)) => old.as_ref().eq(current),
							_ => true,
						};
						if replace {
							offchain_changes.insert(key, req.value().map(|x| x.as_ref().to_vec()));
						}
						req.resume(replace)
					},
					OffchainContext::Timestamp(req) => {
						let timestamp = std::time::SystemTime::now()
							.duration_since(std::time::UNIX_EPOCH)
							.map(|d| d.as_millis() as u64)
							.unwrap_or(0);
						req.inject_timestamp(timestamp)
					},
					OffchainContext::RandomSeed(req) => {
						let seed = sp_core::blake2_256(
							&std::time::SystemTime::now()
								.duration_since(std::time::UNIX_EPOCH)
								.map(|d| d.as_nanos().to_le_bytes())
								.unwrap_or([0u8; 16]),
						);
						req.inject_random_seed(seed)
					},
					// Offchain workers cannot submit transactions on a fork.
					OffchainContext::SubmitTransaction(req) => req.resume(false),
				},

				RuntimeCall::LogEmit(req) => {
					logs.push(forward_log(req.info()));
					req.resume()
				},
			}
		}
	}
}

impl RuntimeEngine for SmoldotEngine {
	fn execute(
		&mut self,
		task: ExecutionTask,
		host: &mut dyn HostStorage,
	) -> Result<TaskOutput, ExecutorError> {
		trace!("Executing {} task", task.kind());
		match task {
			ExecutionTask::RuntimeVersion { code } =>
				self.runtime_version(&code, host).map(TaskOutput::RuntimeVersion),
			ExecutionTask::Metadata { code } => {
				let heap_pages = self.heap_pages(host)?;
				let output = self.call(
					&code,
					heap_pages,
					runtime_api::METADATA,
					&[],
					host,
					&mut Changes::new(),
					&mut Changes::new(),
					&mut Vec::new(),
				)?;
				Ok(TaskOutput::Metadata(output))
			},
			ExecutionTask::Call { code, block_hash, calls } =>
				self.calls(&code, block_hash, &calls, host).map(TaskOutput::Call),
			ExecutionTask::StateRoot { entries, version } =>
				Ok(TaskOutput::StateRoot(state_root(entries, version))),
			ExecutionTask::CreateProof { nodes, updates } => {
				let (root, nodes) = proof::create_proof(&nodes, updates)?;
				Ok(TaskOutput::Proof { root: H256::from(root), nodes })
			},
			ExecutionTask::DecodeProof { root, nodes } =>
				proof::decode_proof(root.as_fixed_bytes(), &nodes).map(TaskOutput::Entries),
		}
	}
}

/// Root of a trie holding `entries`.
fn state_root(entries: Vec<(Vec<u8>, Vec<u8>)>, version: TrieVersion) -> H256 {
	let root = match version {
		TrieVersion::V0 => LayoutV0::<Blake2Hasher>::trie_root(entries),
		TrieVersion::V1 => LayoutV1::<Blake2Hasher>::trie_root(entries),
	};
	H256::from_slice(root.as_ref())
}

/// First live key under `prefix` after `key`, seen through `changes`.
fn next_key(
	changes: &Changes,
	host: &mut dyn HostStorage,
	prefix: &[u8],
	key: &[u8],
) -> Result<Option<Vec<u8>>, ExecutorError> {
	let mut cursor = key.to_vec();
	let from_host = loop {
		match host.next_key(prefix, &cursor)? {
			Some(next) if matches!(changes.get(&next), Some(None)) => cursor = next,
			next => break next,
		}
	};
	let from_changes = changes
		.range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
		.skip_while(|(k, _)| k.as_slice() < prefix)
		.take_while(|(k, _)| k.starts_with(prefix))
		.find(|(_, v)| v.is_some())
		.map(|(k, _)| k.clone());

	Ok(match (from_host, from_changes) {
		(Some(a), Some(b)) => Some(a.min(b)),
		(a, b) => a.or(b),
	})
}

/// Forward a runtime log line to `log` and keep a copy for the call result.
fn forward_log(info: LogEmitInfo<'_>) -> RuntimeLog {
	match info {
		LogEmitInfo::Num(v) => {
			debug!(target: targets::RUNTIME, "{v}");
			RuntimeLog { message: format!("{}", v), level: None, target: None }
		},
		LogEmitInfo::Utf8(v) => {
			debug!(target: targets::RUNTIME, "{v}");
			RuntimeLog { message: v.to_string(), level: None, target: None }
		},
		LogEmitInfo::Hex(v) => {
			debug!(target: targets::RUNTIME, "{v}");
			RuntimeLog { message: v.to_string(), level: None, target: None }
		},
		LogEmitInfo::Log { log_level, target, message } => {
			let level = match log_level {
				1 => Level::Error,
				2 => Level::Warn,
				3 => Level::Info,
				4 => Level::Debug,
				_ => Level::Trace,
			};
			log!(target: targets::RUNTIME, level, "{target}: {message}");
			RuntimeLog {
				message: message.to_string(),
				level: Some(log_level),
				target: Some(target.to_string()),
			}
		},
	}
}

/// Create a prefixed key for child storage access.
fn prefixed_child_key(child: impl Iterator<Item = u8>, key: impl Iterator<Item = u8>) -> Vec<u8> {
	[storage_prefixes::DEFAULT_CHILD_STORAGE, &child.collect::<Vec<_>>(), &key.collect::<Vec<_>>()]
		.concat()
}

/// Check if a signature is a magic test signature.
///
/// Magic signatures start with `0xdeadbeef` and are padded with `0xcd`.
fn is_magic_signature(signature: &[u8]) -> bool {
	signature.starts_with(magic_signature::PREFIX) &&
		signature[magic_signature::PREFIX.len()..]
			.iter()
			.all(|&b| b == magic_signature::PADDING)
}
