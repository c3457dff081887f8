// SPDX-License-Identifier: GPL-3.0

//! Blockchain manager for forked chains.
//!
//! This module provides the [`Blockchain`] struct, the main entry point for creating and
//! extending a local fork of a live chain. It maps block numbers and hashes to
//! [`Block`]s, tracks the head, registers locally built blocks and replays them from a
//! [`BlockLog`] when a fork is resumed.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Blockchain                               │
//! │                                                                 │
//! │   fork() ──────► Resolve fork point (number, hash, finalized)   │
//! │                        │                                        │
//! │                        ▼                                        │
//! │              Register fork point Block as head                  │
//! │                        │                                        │
//! │                        ▼                                        │
//! │              Replay BlockLog entries after the head             │
//! │              (non-consecutive log: warn, clear, start clean)    │
//! │                        │                                        │
//! │                        ▼                                        │
//! │              Ready: new_block() / set_head() / lookups          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Blocks up to the fork point are read from the live chain on demand; blocks after it
//! only exist locally.
//!
//! # Example
//!
//! ```ignore
//! use pop_fork_core::{Blockchain, ForkPoint, ForkRpcClient, MemoryBlockLog};
//!
//! let upstream = Arc::new(ForkRpcClient::connect(&endpoint).await?);
//! let factory = smoldot_engine_factory(ExecutorConfig::default());
//! let blockchain =
//! 	Blockchain::fork(upstream, factory, ForkPoint::Finalized, Arc::new(MemoryBlockLog::default()))
//! 		.await?;
//!
//! let head = blockchain.head().await;
//! let value = head.get(&key).await?;
//! ```

use crate::{
	Header, StorageCache, Upstream,
	block::{Block, BlockIndex},
	error::{BlockError, BlockchainError, RpcClientError},
	executor::{EngineFactory, ExecutionQueue},
	metadata::ChainProperties,
	storage::{StorageDiff, StorageStack},
};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::{
	collections::{BTreeMap, HashMap},
	sync::{Arc, Weak},
};
use subxt::config::substrate::H256;
use tokio::sync::{Mutex, OnceCell, RwLock, broadcast};

/// Capacity for the blockchain event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Where to fork the live chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkPoint {
	/// The canonical block at this height.
	Number(u32),
	/// The block with this hash.
	Hash(H256),
	/// The latest finalized block.
	Finalized,
}

impl From<u32> for ForkPoint {
	fn from(number: u32) -> Self {
		Self::Number(number)
	}
}

impl From<H256> for ForkPoint {
	fn from(hash: H256) -> Self {
		Self::Hash(hash)
	}
}

/// Events emitted by the blockchain when state changes.
///
/// Subscribe to these events via [`Blockchain::subscribe_events`].
#[derive(Debug, Clone)]
pub enum BlockchainEvent {
	/// A new block was registered and is now the head.
	NewBlock {
		/// The new block's hash.
		hash: H256,
		/// The new block's number.
		number: u32,
		/// The parent block's hash.
		parent_hash: H256,
		/// Storage keys modified by the block.
		modified_keys: Vec<Vec<u8>>,
	},
}

/// A locally built block as stored in a [`BlockLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedBlock {
	/// The block number.
	pub number: u32,
	/// The block hash.
	pub hash: H256,
	/// The block header.
	pub header: Header,
	/// The encoded extrinsics.
	pub extrinsics: Vec<Vec<u8>>,
	/// Storage written by the block on top of its parent's recorded state.
	pub storage_diff: StorageDiff,
}

/// Durable record of the blocks built on top of a fork point.
#[async_trait]
pub trait BlockLog: Send + Sync {
	/// Record a newly built block.
	async fn append(&self, block: PersistedBlock) -> Result<(), BlockchainError>;

	/// Every recorded block with a number greater than `number`, in ascending order.
	async fn blocks_after(&self, number: u32) -> Result<Vec<PersistedBlock>, BlockchainError>;

	/// Forget every recorded block.
	async fn clear(&self) -> Result<(), BlockchainError>;
}

/// A [`BlockLog`] kept in memory. Survives dropping a [`Blockchain`] when shared.
#[derive(Debug, Default)]
pub struct MemoryBlockLog {
	blocks: Mutex<Vec<PersistedBlock>>,
}

impl MemoryBlockLog {
	/// A log holding `blocks`.
	pub fn with_blocks(blocks: Vec<PersistedBlock>) -> Self {
		Self { blocks: Mutex::new(blocks) }
	}

	/// Number of recorded blocks.
	pub async fn len(&self) -> usize {
		self.blocks.lock().await.len()
	}

	/// Whether no block is recorded.
	pub async fn is_empty(&self) -> bool {
		self.blocks.lock().await.is_empty()
	}
}

#[async_trait]
impl BlockLog for MemoryBlockLog {
	async fn append(&self, block: PersistedBlock) -> Result<(), BlockchainError> {
		self.blocks.lock().await.push(block);
		Ok(())
	}

	async fn blocks_after(&self, number: u32) -> Result<Vec<PersistedBlock>, BlockchainError> {
		let mut blocks: Vec<PersistedBlock> =
			self.blocks.lock().await.iter().filter(|b| b.number > number).cloned().collect();
		blocks.sort_by_key(|b| b.number);
		Ok(blocks)
	}

	async fn clear(&self) -> Result<(), BlockchainError> {
		self.blocks.lock().await.clear();
		Ok(())
	}
}

/// Blocks known to a fork, by hash and by canonical number.
struct ChainIndex {
	this: Weak<ChainIndex>,
	upstream: Arc<dyn Upstream>,
	cache: StorageCache,
	queue: ExecutionQueue,
	fork_number: u32,
	blocks: RwLock<HashMap<H256, Arc<Block>>>,
	canonical: RwLock<BTreeMap<u32, H256>>,
	properties: OnceCell<ChainProperties>,
}

impl ChainIndex {
	fn new(
		upstream: Arc<dyn Upstream>,
		cache: StorageCache,
		queue: ExecutionQueue,
		fork_number: u32,
	) -> Arc<Self> {
		Arc::new_cyclic(|this| Self {
			this: this.clone(),
			upstream,
			cache,
			queue,
			fork_number,
			blocks: RwLock::new(HashMap::new()),
			canonical: RwLock::new(BTreeMap::new()),
			properties: OnceCell::new(),
		})
	}

	fn weak(&self) -> Weak<dyn BlockIndex> {
		self.this.clone()
	}

	fn upstream_block(&self, header: &Header) -> Block {
		Block::from_upstream(
			header.number,
			header.hash(),
			self.upstream.clone(),
			self.cache.clone(),
			self.queue.clone(),
			self.weak(),
		)
		.with_header(header.clone())
	}

	async fn insert(&self, block: Arc<Block>) -> Arc<Block> {
		self.blocks.write().await.entry(block.hash()).or_insert(block).clone()
	}

	/// Local blocks first, then blocks of the live chain up to the fork point.
	async fn lookup(&self, hash: H256) -> Result<Option<Arc<Block>>, RpcClientError> {
		if let Some(block) = self.blocks.read().await.get(&hash) {
			return Ok(Some(block.clone()));
		}
		let Some(header) = self.upstream.header(hash).await? else {
			return Ok(None);
		};
		if header.number > self.fork_number {
			return Ok(None);
		}
		Ok(Some(self.insert(Arc::new(self.upstream_block(&header))).await))
	}

	/// Chain properties, read once from the live chain.
	async fn properties(&self) -> Result<&ChainProperties, RpcClientError> {
		self.properties
			.get_or_try_init(|| async {
				let properties = self.upstream.system_properties().await?;
				Ok::<_, RpcClientError>(ChainProperties::from(&properties))
			})
			.await
	}

	async fn lookup_number(&self, number: u32) -> Result<Option<Arc<Block>>, RpcClientError> {
		let local = self.canonical.read().await.get(&number).copied();
		if let Some(hash) = local {
			return self.lookup(hash).await;
		}
		if number > self.fork_number {
			return Ok(None);
		}
		match self.upstream.block_hash_at(number).await? {
			Some(hash) => self.lookup(hash).await,
			None => Ok(None),
		}
	}
}

#[async_trait]
impl BlockIndex for ChainIndex {
	async fn block_by_hash(&self, hash: H256) -> Result<Option<Arc<Block>>, BlockError> {
		Ok(self.lookup(hash).await?)
	}

	async fn chain_properties(&self) -> Result<ChainProperties, BlockError> {
		Ok(self.properties().await?.clone())
	}
}

/// A local fork of a live chain.
///
/// Dropping the blockchain drops its chain index; blocks still held elsewhere keep
/// working but can no longer resolve their parent.
pub struct Blockchain {
	index: Arc<ChainIndex>,
	head: RwLock<Arc<Block>>,
	fork_point: H256,
	block_log: Arc<dyn BlockLog>,
	event_tx: broadcast::Sender<BlockchainEvent>,
}

impl std::fmt::Debug for Blockchain {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Blockchain")
			.field("fork_point", &self.fork_point)
			.field("fork_number", &self.index.fork_number)
			.finish_non_exhaustive()
	}
}

impl Blockchain {
	/// Fork a live chain.
	///
	/// # Arguments
	///
	/// * `upstream` - The live chain
	/// * `engine_factory` - Builds the runtime engine of the execution queue
	/// * `fork_point` - Block to fork from
	/// * `block_log` - Record of locally built blocks; blocks after the fork point are
	///   replayed
	pub async fn fork(
		upstream: Arc<dyn Upstream>,
		engine_factory: EngineFactory,
		fork_point: ForkPoint,
		block_log: Arc<dyn BlockLog>,
	) -> Result<Self, BlockchainError> {
		let hash = match fork_point {
			ForkPoint::Number(number) => upstream
				.block_hash_at(number)
				.await?
				.ok_or(BlockchainError::BlockNumberNotFound(number))?,
			ForkPoint::Hash(hash) => hash,
			ForkPoint::Finalized => upstream.finalized_head().await?,
		};
		let header =
			upstream.header(hash).await?.ok_or(BlockchainError::BlockHashNotFound(hash))?;
		info!("Forking at block #{} ({hash:?})", header.number);

		let queue = ExecutionQueue::new(engine_factory);
		let index = ChainIndex::new(upstream, StorageCache::in_memory(), queue, header.number);
		let head = index.insert(Arc::new(index.upstream_block(&header))).await;
		index.canonical.write().await.insert(header.number, hash);

		let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
		let blockchain = Self {
			index,
			head: RwLock::new(head),
			fork_point: hash,
			block_log,
			event_tx,
		};
		blockchain.resume().await?;
		Ok(blockchain)
	}

	/// Replay the blocks recorded after the fork point.
	async fn resume(&self) -> Result<(), BlockchainError> {
		let head = self.head().await;
		let persisted = self.block_log.blocks_after(head.number()).await?;
		if persisted.is_empty() {
			return Ok(());
		}

		let (mut number, mut parent) = (head.number(), head.hash());
		for block in &persisted {
			let consecutive = block.number == number + 1 &&
				block.header.number == block.number &&
				block.header.parent_hash == parent &&
				block.header.hash() == block.hash;
			if !consecutive {
				warn!(
					"Block log is not consecutive after #{number} (found #{} {:?}), starting clean",
					block.number, block.hash
				);
				self.block_log.clear().await?;
				return Ok(());
			}
			number = block.number;
			parent = block.hash;
		}

		for block in persisted {
			let parent = self.head().await;
			let new = self.build(&parent, block.header, block.extrinsics, &block.storage_diff).await;
			self.register(new).await;
		}
		info!("Resumed {} blocks from the block log, head is #{number}", number - head.number());
		Ok(())
	}

	/// Create the block on top of `parent` without registering it.
	async fn build(
		&self,
		parent: &Block,
		header: Header,
		extrinsics: Vec<Vec<u8>>,
		storage_diff: &StorageDiff,
	) -> Arc<Block> {
		let base = parent.storage().read().await.snapshot();
		let mut stack = StorageStack::new(Arc::new(base));
		let entries: Vec<(&[u8], Option<&[u8]>)> =
			storage_diff.iter().map(|(k, v)| (k.as_slice(), v.as_deref())).collect();
		stack.push_layer().set_batch(&entries);

		Arc::new(
			Block::local(header, extrinsics, stack, self.index.queue.clone(), self.index.weak())
				.with_committed(storage_diff),
		)
	}

	/// Make `block` known, canonical and the head.
	async fn register(&self, block: Arc<Block>) {
		let block = self.index.insert(block).await;
		let mut canonical = self.index.canonical.write().await;
		canonical.retain(|number, _| *number < block.number());
		canonical.insert(block.number(), block.hash());
		drop(canonical);
		*self.head.write().await = block;
	}

	/// Hash of the block the chain was forked at.
	pub fn fork_point(&self) -> H256 {
		self.fork_point
	}

	/// Number of the block the chain was forked at.
	pub fn fork_point_number(&self) -> u32 {
		self.index.fork_number
	}

	/// The execution queue shared by every block of this chain.
	pub fn queue(&self) -> &ExecutionQueue {
		&self.index.queue
	}

	/// Subscribe to blockchain events.
	///
	/// # Example
	///
	/// ```ignore
	/// let mut events = blockchain.subscribe_events();
	/// while let Ok(event) = events.recv().await {
	///     match event {
	///         BlockchainEvent::NewBlock { hash, number, .. } => {
	///             println!("New block #{number}: {hash:?}");
	///         },
	///     }
	/// }
	/// ```
	pub fn subscribe_events(&self) -> broadcast::Receiver<BlockchainEvent> {
		self.event_tx.subscribe()
	}

	/// The current head block.
	pub async fn head(&self) -> Arc<Block> {
		self.head.read().await.clone()
	}

	/// The block with the given hash.
	///
	/// Local blocks are answered first; otherwise the live chain is asked, for blocks up
	/// to the fork point.
	pub async fn block_by_hash(&self, hash: H256) -> Result<Option<Arc<Block>>, BlockchainError> {
		Ok(self.index.lookup(hash).await?)
	}

	/// The canonical block at `number`.
	pub async fn block_by_number(&self, number: u32) -> Result<Option<Arc<Block>>, BlockchainError> {
		Ok(self.index.lookup_number(number).await?)
	}

	/// Make the block with the given hash the head.
	///
	/// The canonical mapping is rewritten to follow the new head back to where it joins
	/// the previous canonical chain.
	pub async fn set_head(&self, hash: H256) -> Result<Arc<Block>, BlockchainError> {
		let block =
			self.block_by_hash(hash).await?.ok_or(BlockchainError::BlockHashNotFound(hash))?;

		let mut route = vec![(block.number(), block.hash())];
		let mut current = block.clone();
		while current.number() > self.index.fork_number {
			let Some(parent) = current.parent().await? else {
				break;
			};
			let known = self.index.canonical.read().await.get(&parent.number()).copied();
			if known == Some(parent.hash()) {
				break;
			}
			route.push((parent.number(), parent.hash()));
			current = parent;
		}

		let mut canonical = self.index.canonical.write().await;
		canonical.retain(|number, _| *number <= block.number());
		canonical.extend(route);
		drop(canonical);

		debug!("Head set to #{} ({hash:?})", block.number());
		*self.head.write().await = block.clone();
		Ok(block)
	}

	/// Register a block built on top of `parent` and make it the head.
	///
	/// The block's base state is a snapshot of the parent's current view; `storage_diff`
	/// is written in a layer above it. Writes still pending on the parent become part of
	/// the block: they are recorded with `storage_diff` in the block log, so a resumed
	/// fork rebuilds the same state, and are reported in the block's own diff. A
	/// [`BlockchainEvent::NewBlock`] is emitted.
	///
	/// # Arguments
	///
	/// * `parent` - Hash of the parent block
	/// * `header` - Header of the new block; must name `parent` and follow its number
	/// * `extrinsics` - Encoded extrinsics of the new block
	/// * `storage_diff` - Storage written by the new block
	pub async fn new_block(
		&self,
		parent: H256,
		header: Header,
		extrinsics: Vec<Vec<u8>>,
		storage_diff: StorageDiff,
	) -> Result<Arc<Block>, BlockchainError> {
		let parent_block =
			self.block_by_hash(parent).await?.ok_or(BlockchainError::ParentNotFound(parent))?;
		if header.parent_hash != parent {
			return Err(BlockchainError::ParentHashMismatch {
				expected: parent,
				found: header.parent_hash,
			});
		}
		if header.number != parent_block.number().saturating_add(1) {
			return Err(BlockchainError::NonConsecutiveBlock {
				parent: parent_block.number(),
				number: header.number,
			});
		}

		let mut effective: BTreeMap<Vec<u8>, Option<Vec<u8>>> =
			parent_block.uncommitted_diff().await?.into_iter().collect();
		effective.extend(storage_diff);
		let storage_diff: StorageDiff = effective.into_iter().collect();

		let hash = header.hash();
		let number = header.number;
		let block = self.build(&parent_block, header.clone(), extrinsics.clone(), &storage_diff).await;
		self.block_log
			.append(PersistedBlock {
				number,
				hash,
				header,
				extrinsics,
				storage_diff: storage_diff.clone(),
			})
			.await?;
		self.register(block.clone()).await;

		debug!("New block #{number} ({hash:?}) with {} storage changes", storage_diff.len());
		let _ = self.event_tx.send(BlockchainEvent::NewBlock {
			hash,
			number,
			parent_hash: parent,
			modified_keys: storage_diff.into_iter().map(|(key, _)| key).collect(),
		});
		Ok(block)
	}

	/// Token and address settings of the live chain.
	pub async fn properties(&self) -> Result<&ChainProperties, BlockchainError> {
		Ok(self.index.properties().await?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		ErrorKind,
		storage::StorageValue,
		testing::{MockEngine, MockUpstream},
	};

	async fn fork(upstream: &Arc<MockUpstream>, log: Arc<MemoryBlockLog>) -> Blockchain {
		Blockchain::fork(upstream.clone(), MockEngine::factory(), ForkPoint::Finalized, log)
			.await
			.unwrap()
	}

	fn child_of(parent: &Block) -> Header {
		Header::next(parent.hash(), parent.number(), vec![])
	}

	fn set(key: &str, value: &str) -> (Vec<u8>, Option<Vec<u8>>) {
		(key.as_bytes().to_vec(), Some(value.as_bytes().to_vec()))
	}

	#[tokio::test]
	async fn fork_resolves_every_kind_of_fork_point() {
		let upstream = Arc::new(MockUpstream::new().with_chain_length(5));
		let log = || Arc::new(MemoryBlockLog::default());

		let chain = fork(&upstream, log()).await;
		assert_eq!(chain.head().await.number(), 4);
		assert_eq!(chain.fork_point(), upstream.head_hash());

		let hash = upstream.hash_at(2).unwrap();
		let chain = Blockchain::fork(upstream.clone(), MockEngine::factory(), 2.into(), log())
			.await
			.unwrap();
		assert_eq!(chain.fork_point(), hash);

		let chain = Blockchain::fork(upstream.clone(), MockEngine::factory(), hash.into(), log())
			.await
			.unwrap();
		assert_eq!(chain.fork_point_number(), 2);
	}

	#[tokio::test]
	async fn unknown_fork_point_is_not_found() {
		let upstream = Arc::new(MockUpstream::new());
		let err = Blockchain::fork(
			upstream.clone(),
			MockEngine::factory(),
			ForkPoint::Number(10),
			Arc::new(MemoryBlockLog::default()),
		)
		.await
		.unwrap_err();
		assert!(matches!(err, BlockchainError::BlockNumberNotFound(10)));
		assert_eq!(err.kind(), ErrorKind::NotFound);
	}

	#[tokio::test]
	async fn upstream_failures_are_transient() {
		let upstream = Arc::new(MockUpstream::new());
		upstream.fail_requests(true);
		let err = Blockchain::fork(
			upstream.clone(),
			MockEngine::factory(),
			ForkPoint::Finalized,
			Arc::new(MemoryBlockLog::default()),
		)
		.await
		.unwrap_err();
		assert_eq!(err.kind(), ErrorKind::TransientIo);
	}

	#[tokio::test]
	async fn new_block_becomes_head_over_parent_state() {
		let upstream = Arc::new(MockUpstream::new().with_storage([("alice", "100")]));
		let chain = fork(&upstream, Arc::new(MemoryBlockLog::default())).await;
		let parent = chain.head().await;
		parent.storage().write().await.push_layer().set(b"pending", Some(b"yes"));

		let block = chain
			.new_block(parent.hash(), child_of(&parent), vec![], vec![set("bob", "50")])
			.await
			.unwrap();

		assert_eq!(chain.head().await.hash(), block.hash());
		assert_eq!(block.number(), parent.number() + 1);
		assert_eq!(block.get(b"alice").await.unwrap(), Some(b"100".to_vec()));
		assert_eq!(block.get(b"bob").await.unwrap(), Some(b"50".to_vec()));
		assert_eq!(block.get(b"pending").await.unwrap(), Some(b"yes".to_vec()));
		assert_eq!(block.storage_diff().await, vec![set("bob", "50"), set("pending", "yes")]);
		assert_eq!(parent.get(b"bob").await.unwrap(), None);
	}

	#[tokio::test]
	async fn resume_keeps_writes_pending_on_the_parent() {
		let upstream = Arc::new(
			MockUpstream::new().with_storage([("alice", "100"), ("tmp:a", "1"), ("tmp:b", "2")]),
		);
		let log = Arc::new(MemoryBlockLog::default());
		let hash = {
			let chain = fork(&upstream, log.clone()).await;
			let parent = chain.head().await;
			let mut stack = parent.storage().write().await;
			let layer = stack.push_layer();
			layer.set(b"pending", Some(b"yes"));
			layer.delete_prefix(b"tmp:");
			drop(stack);

			let block = chain
				.new_block(parent.hash(), child_of(&parent), vec![], vec![set("bob", "50")])
				.await
				.unwrap();
			// Pending writes on a local head are carried the same way.
			block.storage().write().await.push_layer().set(b"alice", Some(b"1"));
			chain.new_block(block.hash(), child_of(&block), vec![], vec![]).await.unwrap().hash()
		};

		let chain = fork(&upstream, log.clone()).await;
		let head = chain.head().await;
		assert_eq!(head.hash(), hash);
		assert_eq!(head.get(b"pending").await.unwrap(), Some(b"yes".to_vec()));
		assert_eq!(head.get(b"bob").await.unwrap(), Some(b"50".to_vec()));
		assert_eq!(head.get(b"alice").await.unwrap(), Some(b"1".to_vec()));
		assert_eq!(head.get(b"tmp:a").await.unwrap(), None);
		assert!(head.get_keys_paged(b"tmp:", 10, None).await.unwrap().is_empty());

		let first = chain.block_by_number(3).await.unwrap().unwrap();
		assert_eq!(first.get(b"alice").await.unwrap(), Some(b"100".to_vec()));
		assert_eq!(first.get(b"pending").await.unwrap(), Some(b"yes".to_vec()));
	}

	#[tokio::test]
	async fn new_block_rejects_wrong_parents() {
		let upstream = Arc::new(MockUpstream::new());
		let chain = fork(&upstream, Arc::new(MemoryBlockLog::default())).await;
		let head = chain.head().await;

		let unknown = H256::repeat_byte(0xaa);
		let err = chain.new_block(unknown, child_of(&head), vec![], vec![]).await.unwrap_err();
		assert!(matches!(err, BlockchainError::ParentNotFound(_)));

		let mut skipped = child_of(&head);
		skipped.number += 1;
		let err = chain.new_block(head.hash(), skipped, vec![], vec![]).await.unwrap_err();
		assert!(matches!(err, BlockchainError::NonConsecutiveBlock { .. }));
		assert_eq!(err.kind(), ErrorKind::InvariantViolation);

		let stray = Header::next(unknown, head.number(), vec![]);
		let err = chain.new_block(head.hash(), stray, vec![], vec![]).await.unwrap_err();
		assert!(matches!(err, BlockchainError::ParentHashMismatch { .. }));
	}

	#[tokio::test]
	async fn lookups_cover_local_and_upstream_blocks() {
		let upstream = Arc::new(MockUpstream::new());
		let chain = fork(&upstream, Arc::new(MemoryBlockLog::default())).await;
		let head = chain.head().await;
		let block = chain.new_block(head.hash(), child_of(&head), vec![], vec![]).await.unwrap();

		let by_number = chain.block_by_number(3).await.unwrap().unwrap();
		assert_eq!(by_number.hash(), block.hash());
		let genesis = chain.block_by_number(0).await.unwrap().unwrap();
		assert_eq!(Some(genesis.hash()), upstream.hash_at(0));
		assert!(chain.block_by_number(4).await.unwrap().is_none());

		let parent = block.parent().await.unwrap().unwrap();
		assert_eq!(parent.hash(), head.hash());
		let grandparent = parent.parent().await.unwrap().unwrap();
		assert_eq!(Some(grandparent.hash()), upstream.hash_at(1));
		assert!(chain.block_by_hash(H256::repeat_byte(0xaa)).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn new_block_emits_event() {
		let upstream = Arc::new(MockUpstream::new());
		let chain = fork(&upstream, Arc::new(MemoryBlockLog::default())).await;
		let mut events = chain.subscribe_events();
		let head = chain.head().await;

		let block = chain
			.new_block(head.hash(), child_of(&head), vec![], vec![set("k", "v")])
			.await
			.unwrap();

		let BlockchainEvent::NewBlock { hash, number, parent_hash, modified_keys } =
			events.recv().await.unwrap();
		assert_eq!(hash, block.hash());
		assert_eq!(number, 3);
		assert_eq!(parent_hash, head.hash());
		assert_eq!(modified_keys, vec![b"k".to_vec()]);
	}

	#[tokio::test]
	async fn set_head_switches_branches() {
		let upstream = Arc::new(MockUpstream::new());
		let chain = fork(&upstream, Arc::new(MemoryBlockLog::default())).await;
		let root = chain.head().await;

		let a1 = chain
			.new_block(root.hash(), child_of(&root), vec![], vec![set("branch", "a")])
			.await
			.unwrap();
		let a2 = chain.new_block(a1.hash(), child_of(&a1), vec![], vec![]).await.unwrap();

		let mut header = child_of(&root);
		header.extrinsics_root = H256::repeat_byte(0xbb);
		let b1 =
			chain.new_block(root.hash(), header, vec![], vec![set("branch", "b")]).await.unwrap();
		assert_eq!(chain.head().await.hash(), b1.hash());
		assert!(chain.block_by_number(a2.number()).await.unwrap().is_none());

		chain.set_head(a2.hash()).await.unwrap();
		assert_eq!(chain.head().await.hash(), a2.hash());
		assert_eq!(chain.block_by_number(a1.number()).await.unwrap().unwrap().hash(), a1.hash());
		assert_eq!(chain.head().await.get(b"branch").await.unwrap(), Some(b"a".to_vec()));

		let err = chain.set_head(H256::repeat_byte(0xcc)).await.unwrap_err();
		assert!(matches!(err, BlockchainError::BlockHashNotFound(_)));
	}

	#[tokio::test]
	async fn resume_replays_the_block_log() {
		let upstream = Arc::new(MockUpstream::new());
		let log = Arc::new(MemoryBlockLog::default());
		let (first, second) = {
			let chain = fork(&upstream, log.clone()).await;
			let head = chain.head().await;
			let first = chain
				.new_block(head.hash(), child_of(&head), vec![vec![1]], vec![set("k", "1")])
				.await
				.unwrap();
			let second = chain
				.new_block(first.hash(), child_of(&first), vec![vec![2]], vec![set("k", "2")])
				.await
				.unwrap();
			(first.hash(), second.hash())
		};
		assert_eq!(log.len().await, 2);

		let chain = fork(&upstream, log.clone()).await;
		let head = chain.head().await;
		assert_eq!(head.hash(), second);
		assert_eq!(head.number(), 4);
		assert_eq!(head.get(b"k").await.unwrap(), Some(b"2".to_vec()));
		assert_eq!(head.extrinsics().await.unwrap(), &[vec![2u8]]);
		assert_eq!(chain.block_by_number(3).await.unwrap().unwrap().hash(), first);
		assert_eq!(log.len().await, 2);
	}

	#[tokio::test]
	async fn resume_with_gap_starts_clean() {
		let upstream = Arc::new(MockUpstream::new());
		let head_hash = upstream.head_hash();
		let header = Header::next(head_hash, 3, vec![]);
		let log = Arc::new(MemoryBlockLog::with_blocks(vec![PersistedBlock {
			number: 4,
			hash: header.hash(),
			header,
			extrinsics: vec![],
			storage_diff: vec![set("k", "v")],
		}]));

		let chain = fork(&upstream, log.clone()).await;
		assert_eq!(chain.head().await.hash(), head_hash);
		assert!(log.is_empty().await);
		assert_eq!(chain.head().await.get(b"k").await.unwrap(), None);
	}

	#[tokio::test]
	async fn deleted_keys_stay_deleted_in_children() {
		let upstream = Arc::new(MockUpstream::new().with_storage([("gone", "1")]));
		let chain = fork(&upstream, Arc::new(MemoryBlockLog::default())).await;
		let head = chain.head().await;

		let block = chain
			.new_block(head.hash(), child_of(&head), vec![], vec![(b"gone".to_vec(), None)])
			.await
			.unwrap();
		let child = chain.new_block(block.hash(), child_of(&block), vec![], vec![]).await.unwrap();

		assert_eq!(child.get(b"gone").await.unwrap(), None);
		assert_eq!(
			child.storage().read().await.get(b"gone", false).await.unwrap(),
			Some(StorageValue::Deleted)
		);
	}

	#[tokio::test]
	async fn properties_are_read_once() {
		let upstream = Arc::new(MockUpstream::new());
		let chain = fork(&upstream, Arc::new(MemoryBlockLog::default())).await;
		let properties = chain.properties().await.unwrap();
		assert_eq!(properties.ss58_format, 42);
		assert_eq!(properties.token_decimals, vec![12]);
		assert_eq!(properties.token_symbols, vec!["UNIT".to_string()]);

		upstream.fail_requests(true);
		assert!(chain.properties().await.is_ok());
	}

	#[tokio::test]
	async fn local_blocks_resolve_properties_through_the_chain() {
		let upstream = Arc::new(MockUpstream::new());
		let chain = fork(&upstream, Arc::new(MemoryBlockLog::default())).await;
		let head = chain.head().await;
		let block = chain.new_block(head.hash(), child_of(&head), vec![], vec![]).await.unwrap();
		assert!(block.is_local());

		let properties = block.chain_properties().await.unwrap();
		assert_eq!(&properties, chain.properties().await.unwrap());
		assert_eq!(properties.token_symbols, vec!["UNIT".to_string()]);

		upstream.fail_requests(true);
		assert_eq!(head.chain_properties().await.unwrap(), properties);
	}
}
