// SPDX-License-Identifier: GPL-3.0

//! Block structure for forked blockchain state.
//!
//! A [`Block`] is identified by its number and hash. Everything else about it is derived
//! on first use and memoized: the header and extrinsics (fetched from the upstream node
//! for blocks of the live chain), and the runtime state computed from its `:code`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Block                                │
//! │                                                                 │
//! │   (number, hash)                                                │
//! │        │                                                        │
//! │        ├──► header ──► parent() ──► BlockIndex (weak)           │
//! │        ├──► extrinsics                                          │
//! │        │                                                        │
//! │        └──► StorageStack ──► :code                              │
//! │                                │                                │
//! │                                ├──► runtime_version             │
//! │                                └──► metadata ──► registry       │
//! │                                         └──────► decorated      │
//! │                                                                 │
//! │   set_code() drops everything derived from :code               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let block = blockchain.head().await;
//!
//! // Read storage
//! let value = block.get(&key).await?;
//!
//! // Run a runtime call and commit its writes
//! let result = block.call("Core_version", vec![]).await?;
//! block.apply_storage_diff(&result.storage_diff).await;
//! ```

use crate::{
	StorageCache, Upstream,
	error::{BlockError, ErrorKind},
	executor::{ExecutionQueue, RuntimeCallResult, RuntimeVersion},
	header::Header,
	metadata::{ChainProperties, DecoratedMetadata, ForkMetadata, TypeRegistry},
	storage::{
		RemoteStorageLayer, StorageDiff, StorageProvider, StorageStack, StorageValue,
	},
	strings::storage::{keys, paging::PREFETCH_PAGE_SIZE},
};
use async_trait::async_trait;
use log::debug;
use std::{
	collections::{BTreeMap, BTreeSet},
	sync::{Arc, Weak},
};
use subxt::config::substrate::H256;
use tokio::sync::{Mutex, OnceCell, RwLock};

/// Resolves blocks by hash for parent lookups.
///
/// Blocks only hold a weak reference to their index, so dropping the chain releases every
/// block it registered.
#[async_trait]
pub trait BlockIndex: Send + Sync {
	/// The block with the given hash, or `None` if it is not part of the chain.
	async fn block_by_hash(&self, hash: H256) -> Result<Option<Arc<Block>>, BlockError>;

	/// Token and address settings of the chain.
	async fn chain_properties(&self) -> Result<ChainProperties, BlockError>;
}

/// A storage entry written by a block, next to its value before the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
	/// The storage key.
	pub key: Vec<u8>,
	/// Value in the state the block was built on.
	pub previous: Option<Vec<u8>>,
	/// Value in the block's current view.
	pub current: Option<Vec<u8>>,
}

/// State derived from the runtime code. Reset as a whole when the code changes.
#[derive(Default)]
struct RuntimeState {
	code: Option<Arc<[u8]>>,
	/// Stack revision at which `code` was last compared with `:code`.
	checked_at: Option<u64>,
	version: Option<RuntimeVersion>,
	metadata: Option<ForkMetadata>,
	registry: Option<TypeRegistry>,
	decorated: Option<DecoratedMetadata>,
}

/// A block in a forked blockchain.
///
/// Shared as `Arc<Block>`; all mutation goes through the storage stack behind a lock.
///
/// Lock order: the runtime state mutex is always taken before the storage stack lock.
/// The stack lock is never held while awaiting the execution queue, since the queue
/// serves the engine's storage reads from the same stack.
pub struct Block {
	number: u32,
	hash: H256,
	header: OnceCell<Header>,
	extrinsics: OnceCell<Vec<Vec<u8>>>,
	upstream: Option<Arc<dyn Upstream>>,
	storage: Arc<RwLock<StorageStack>>,
	/// Writes the block was created with, on top of the stack's provider.
	committed: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
	runtime: Mutex<RuntimeState>,
	queue: ExecutionQueue,
	index: Weak<dyn BlockIndex>,
}

impl std::fmt::Debug for Block {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Block")
			.field("number", &self.number)
			.field("hash", &self.hash)
			.field("local", &self.upstream.is_none())
			.finish_non_exhaustive()
	}
}

impl Block {
	/// A block of the live chain.
	///
	/// Nothing is fetched until requested: the header and body come from `upstream`, and
	/// storage is read through a [`RemoteStorageLayer`] pinned at `hash`.
	///
	/// # Arguments
	///
	/// * `number` - Block number
	/// * `hash` - Block hash
	/// * `upstream` - The live chain
	/// * `cache` - Storage cache shared by the fork
	/// * `queue` - Queue running this block's runtime tasks
	/// * `index` - Chain index resolving the parent
	pub fn from_upstream(
		number: u32,
		hash: H256,
		upstream: Arc<dyn Upstream>,
		cache: StorageCache,
		queue: ExecutionQueue,
		index: Weak<dyn BlockIndex>,
	) -> Self {
		let remote = RemoteStorageLayer::new(upstream.clone(), cache, hash);
		Self {
			number,
			hash,
			header: OnceCell::new(),
			extrinsics: OnceCell::new(),
			upstream: Some(upstream),
			storage: Arc::new(RwLock::new(StorageStack::new(Arc::new(remote)))),
			committed: BTreeMap::new(),
			runtime: Mutex::new(RuntimeState::default()),
			queue,
			index,
		}
	}

	/// A block built locally, with a known header and body.
	///
	/// The hash is the hash of `header`.
	pub fn local(
		header: Header,
		extrinsics: Vec<Vec<u8>>,
		storage: StorageStack,
		queue: ExecutionQueue,
		index: Weak<dyn BlockIndex>,
	) -> Self {
		Self {
			number: header.number,
			hash: header.hash(),
			header: OnceCell::new_with(Some(header)),
			extrinsics: OnceCell::new_with(Some(extrinsics)),
			upstream: None,
			storage: Arc::new(RwLock::new(storage)),
			committed: BTreeMap::new(),
			runtime: Mutex::new(RuntimeState::default()),
			queue,
			index,
		}
	}

	/// Seed the header of a block of the live chain, when it is already known.
	pub(crate) fn with_header(mut self, header: Header) -> Self {
		self.header = OnceCell::new_with(Some(header));
		self
	}

	/// Declare the writes the block was created with.
	///
	/// They must already be in the stack; [`uncommitted_diff`](Self::uncommitted_diff)
	/// reports everything else.
	pub(crate) fn with_committed(mut self, diff: &StorageDiff) -> Self {
		self.committed = diff.iter().cloned().collect();
		self
	}

	/// The block number.
	pub fn number(&self) -> u32 {
		self.number
	}

	/// The block hash.
	pub fn hash(&self) -> H256 {
		self.hash
	}

	/// Whether this block was built locally rather than read from the live chain.
	pub fn is_local(&self) -> bool {
		self.upstream.is_none()
	}

	/// The storage stack of this block.
	///
	/// Use it to push, pop and fold layers. Do not hold the lock across calls into the
	/// block's runtime methods. Runtime-derived values are checked against `:code` on
	/// their next use, so the code may be written here as well as through
	/// [`set_code`](Self::set_code).
	pub fn storage(&self) -> &Arc<RwLock<StorageStack>> {
		&self.storage
	}

	/// The block header, fetched once from the upstream node.
	pub async fn header(&self) -> Result<&Header, BlockError> {
		self.header
			.get_or_try_init(|| async {
				let Some(upstream) = &self.upstream else {
					return Err(BlockError::HeaderNotFound(self.hash));
				};
				upstream.header(self.hash).await?.ok_or(BlockError::HeaderNotFound(self.hash))
			})
			.await
	}

	/// The encoded extrinsics of this block, fetched once from the upstream node.
	pub async fn extrinsics(&self) -> Result<&[Vec<u8>], BlockError> {
		let extrinsics = self
			.extrinsics
			.get_or_try_init(|| async {
				let Some(upstream) = &self.upstream else {
					return Err(BlockError::HeaderNotFound(self.hash));
				};
				upstream.block_body(self.hash).await?.ok_or(BlockError::HeaderNotFound(self.hash))
			})
			.await?;
		Ok(extrinsics)
	}

	/// The parent block, resolved through the chain index.
	///
	/// `None` for block `#0` or once the chain index has been dropped.
	pub async fn parent(&self) -> Result<Option<Arc<Block>>, BlockError> {
		if self.number == 0 {
			return Ok(None);
		}
		let parent_hash = self.header().await?.parent_hash;
		match self.index.upgrade() {
			Some(index) => index.block_by_hash(parent_hash).await,
			None => Ok(None),
		}
	}

	/// Token and address settings of the chain this block belongs to.
	///
	/// Resolved through the chain index; a detached block asks its upstream node, and a
	/// detached local block falls back to the defaults.
	pub async fn chain_properties(&self) -> Result<ChainProperties, BlockError> {
		if let Some(index) = self.index.upgrade() {
			return index.chain_properties().await;
		}
		match &self.upstream {
			Some(upstream) => Ok(ChainProperties::from(&upstream.system_properties().await?)),
			None => Ok(ChainProperties::default()),
		}
	}

	/// Value of `key` in this block's current view.
	///
	/// Deleted keys and keys without a value are both reported as `None`.
	pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BlockError> {
		let value = self.storage.read().await.get(key, false).await?;
		Ok(value.and_then(StorageValue::into_value))
	}

	/// A page of keys under `prefix`, strictly greater than `start_key`.
	pub async fn get_keys_paged(
		&self,
		prefix: &[u8],
		page_size: u32,
		start_key: Option<&[u8]>,
	) -> Result<Vec<Vec<u8>>, BlockError> {
		Ok(self.storage.read().await.get_keys_paged(prefix, page_size, start_key).await?)
	}

	/// Pending writes on top of this block's base state.
	pub async fn storage_diff(&self) -> StorageDiff {
		self.storage.read().await.storage_diff()
	}

	/// [`storage_diff`](Self::storage_diff) with the value each key had before.
	///
	/// Previous values are read from the state the block was built on: the parent's view
	/// for a locally built block, the live chain's state for a block of the live chain.
	pub async fn storage_diff_with_previous(&self) -> Result<Vec<StorageChange>, BlockError> {
		let stack = self.storage.read().await;
		let mut changes = Vec::new();
		for (key, current) in stack.storage_diff() {
			let previous = stack.provider().get(&key, false).await?;
			changes.push(StorageChange {
				key,
				previous: previous.and_then(StorageValue::into_value),
				current,
			});
		}
		Ok(changes)
	}

	/// Changes of the current view that are not part of the writes the block was
	/// created with.
	///
	/// Writing the result over a fresh copy of the block reproduces its current view.
	/// Prefix deletions are expanded into the keys they cover.
	pub async fn uncommitted_diff(&self) -> Result<StorageDiff, BlockError> {
		let stack = self.storage.read().await;
		let provider = stack.provider();
		let flat = stack.flatten();

		let mut candidates: BTreeSet<Vec<u8>> = flat.entries().map(|(k, _)| k.to_vec()).collect();
		candidates.extend(self.committed.keys().cloned());
		for prefix in flat.deleted_prefixes() {
			let mut cursor: Option<Vec<u8>> = None;
			loop {
				let page =
					provider.get_keys_paged(prefix, PREFETCH_PAGE_SIZE, cursor.as_deref()).await?;
				let Some(last) = page.last().cloned() else {
					break;
				};
				candidates.extend(page);
				cursor = Some(last);
			}
		}

		let mut diff = Vec::new();
		for key in candidates {
			let current = stack.get(&key, false).await?.and_then(StorageValue::into_value);
			let created = match self.committed.get(&key) {
				Some(value) => value.clone(),
				None => provider.get(&key, false).await?.and_then(StorageValue::into_value),
			};
			if current != created {
				diff.push((key, current));
			}
		}
		Ok(diff)
	}

	/// Write `diff` into the active layer of the stack.
	///
	/// Writing `:code` drops every runtime-derived value.
	pub async fn apply_storage_diff(&self, diff: &StorageDiff) {
		let entries: Vec<(&[u8], Option<&[u8]>)> =
			diff.iter().map(|(k, v)| (k.as_slice(), v.as_deref())).collect();
		self.storage.write().await.set_batch(&entries);
	}

	/// Replace the runtime code of this block.
	///
	/// Pushes a layer writing `:code` and drops the runtime version, metadata, registry
	/// and decorated metadata. Header and extrinsics are unaffected.
	pub async fn set_code(&self, code: Vec<u8>) {
		let mut runtime = self.runtime.lock().await;
		let mut stack = self.storage.write().await;
		stack.push_layer().set(keys::CODE, Some(&code));
		*runtime = RuntimeState {
			code: Some(code.into()),
			checked_at: Some(stack.revision()),
			..Default::default()
		};
		debug!("Runtime code of block #{} overridden", self.number);
	}

	/// The current code, dropping derived state memoized for a different one.
	async fn ensure_code(&self, runtime: &mut RuntimeState) -> Result<Arc<[u8]>, BlockError> {
		let stack = self.storage.read().await;
		if runtime.checked_at != Some(stack.revision()) {
			let current = stack.get(keys::CODE, false).await?.and_then(StorageValue::into_value);
			let changed = match (&runtime.code, &current) {
				(Some(known), Some(current)) => known.as_ref() != current.as_slice(),
				(None, None) => false,
				_ => true,
			};
			if changed {
				if runtime.code.is_some() {
					debug!("Runtime code of block #{} changed in storage", self.number);
				}
				*runtime =
					RuntimeState { code: current.map(Arc::from), ..Default::default() };
			}
			runtime.checked_at = Some(stack.revision());
		}
		runtime.code.clone().ok_or(BlockError::RuntimeCodeNotFound)
	}

	async fn ensure_metadata(&self, runtime: &mut RuntimeState) -> Result<ForkMetadata, BlockError> {
		let code = self.ensure_code(runtime).await?;
		if let Some(metadata) = &runtime.metadata {
			return Ok(metadata.clone());
		}
		let bytes = self.queue.metadata(code, Some(self.storage.clone())).await?;
		let metadata = ForkMetadata::try_from(bytes)?;
		runtime.metadata = Some(metadata.clone());
		Ok(metadata)
	}

	/// The runtime code of this block.
	pub async fn code(&self) -> Result<Arc<[u8]>, BlockError> {
		let mut runtime = self.runtime.lock().await;
		self.ensure_code(&mut runtime).await
	}

	/// Version of this block's runtime.
	pub async fn runtime_version(&self) -> Result<RuntimeVersion, BlockError> {
		let mut runtime = self.runtime.lock().await;
		let code = self.ensure_code(&mut runtime).await?;
		if let Some(version) = &runtime.version {
			return Ok(version.clone());
		}
		let version = self.queue.runtime_version(code).await?;
		runtime.version = Some(version.clone());
		Ok(version)
	}

	/// Metadata of this block's runtime.
	pub async fn metadata(&self) -> Result<ForkMetadata, BlockError> {
		let mut runtime = self.runtime.lock().await;
		self.ensure_metadata(&mut runtime).await
	}

	/// Type registry of this block's metadata, carrying the chain's properties.
	pub async fn registry(&self) -> Result<TypeRegistry, BlockError> {
		let mut runtime = self.runtime.lock().await;
		let metadata = self.ensure_metadata(&mut runtime).await?;
		if let Some(registry) = &runtime.registry {
			return Ok(registry.clone());
		}
		let registry = metadata.registry(self.chain_properties().await?);
		runtime.registry = Some(registry.clone());
		Ok(registry)
	}

	/// This block's metadata, decorated for building storage keys.
	pub async fn decorated(&self) -> Result<DecoratedMetadata, BlockError> {
		let mut runtime = self.runtime.lock().await;
		let metadata = self.ensure_metadata(&mut runtime).await?;
		if let Some(decorated) = &runtime.decorated {
			return Ok(decorated.clone());
		}
		let decorated = metadata.decorate();
		runtime.decorated = Some(decorated.clone());
		Ok(decorated)
	}

	/// Execute a runtime call on top of this block.
	///
	/// The call reads this block's current view; its writes are returned in
	/// [`RuntimeCallResult::storage_diff`] and not applied. A call the runtime fails
	/// yields [`BlockError::RuntimeCall`].
	///
	/// # Arguments
	///
	/// * `method` - Runtime API method, e.g. `Core_version`
	/// * `args` - SCALE-encoded arguments
	pub async fn call(&self, method: &str, args: Vec<u8>) -> Result<RuntimeCallResult, BlockError> {
		let code = self.code().await?;
		self.queue
			.call(code, self.hash, method, args, Some(self.storage.clone()))
			.await
			.map_err(|e| match e.kind() {
				ErrorKind::RuntimeCallFault =>
					BlockError::RuntimeCall { method: method.to_string(), message: e.to_string() },
				_ => BlockError::Executor(e),
			})
	}
}
