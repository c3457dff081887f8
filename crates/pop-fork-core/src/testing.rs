// SPDX-License-Identifier: GPL-3.0

//! Shared testing utilities.
//!
//! In-memory stand-ins for the three external seams of the crate: the upstream node
//! ([`MockUpstream`]), a base storage provider ([`MemoryProvider`]) and the runtime engine
//! ([`MockEngine`], with [`MemoryHost`] to drive engines directly).

use crate::{
	Header,
	error::{ExecutorError, RpcClientError, StorageError},
	executor::{
		EngineFactory, ExecutionTask, HostStorage, RuntimeCallResult, RuntimeEngine, RuntimeLog,
		RuntimeVersion, TaskOutput,
	},
	storage::{StorageProvider, StorageValue},
	strings::{
		rpc::{methods, properties},
		storage::keys,
	},
	upstream::{SystemProperties, Upstream},
};
use async_trait::async_trait;
use scale::Encode;
use std::{
	collections::BTreeMap,
	ops::Bound,
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicUsize, Ordering},
	},
	thread,
	time::Duration,
};
use subxt::config::substrate::H256;

/// Up to `count` keys of `map` under `prefix`, strictly after `start_key`.
fn keys_paged<V>(
	map: &BTreeMap<Vec<u8>, V>,
	prefix: &[u8],
	count: u32,
	start_key: Option<&[u8]>,
) -> Vec<Vec<u8>> {
	let lower = match start_key {
		Some(start) if start >= prefix => Bound::Excluded(start),
		_ => Bound::Included(prefix),
	};
	map.range::<[u8], _>((lower, Bound::Unbounded))
		.map(|(key, _)| key)
		.take_while(|key| key.starts_with(prefix))
		.take(count as usize)
		.cloned()
		.collect()
}

fn collect_entries<K: Into<Vec<u8>>, V: Into<Vec<u8>>>(
	entries: impl IntoIterator<Item = (K, V)>,
) -> BTreeMap<Vec<u8>, Vec<u8>> {
	entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

/// A [`StorageProvider`] over a fixed map.
#[derive(Debug, Default, Clone)]
pub struct MemoryProvider {
	entries: BTreeMap<Vec<u8>, Vec<u8>>,
	remote: bool,
}

impl MemoryProvider {
	/// A provider holding `entries`.
	pub fn new<K: Into<Vec<u8>>, V: Into<Vec<u8>>>(entries: impl IntoIterator<Item = (K, V)>) -> Self {
		Self { entries: collect_entries(entries), remote: false }
	}

	/// An empty provider that behaves as if every read needed a remote fetch: `cache_only`
	/// reads resolve to [`StorageValue::Unknown`].
	pub fn cache_only_unknown() -> Self {
		Self { entries: BTreeMap::new(), remote: true }
	}
}

#[async_trait]
impl StorageProvider for MemoryProvider {
	async fn get(&self, key: &[u8], cache_only: bool) -> Result<Option<StorageValue>, StorageError> {
		if cache_only && self.remote {
			return Ok(Some(StorageValue::Unknown));
		}
		Ok(self.entries.get(key).cloned().map(StorageValue::Present))
	}

	async fn get_keys_paged(
		&self,
		prefix: &[u8],
		page_size: u32,
		start_key: Option<&[u8]>,
	) -> Result<Vec<Vec<u8>>, StorageError> {
		Ok(keys_paged(&self.entries, prefix, page_size, start_key))
	}
}

/// A [`HostStorage`] over a fixed map, for driving engines without a queue.
#[derive(Debug, Default, Clone)]
pub struct MemoryHost {
	entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryHost {
	/// A host holding `entries`.
	pub fn new<K: Into<Vec<u8>>, V: Into<Vec<u8>>>(entries: impl IntoIterator<Item = (K, V)>) -> Self {
		Self { entries: collect_entries(entries) }
	}
}

impl HostStorage for MemoryHost {
	fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, ExecutorError> {
		Ok(self.entries.get(key).cloned())
	}

	fn next_key(&mut self, prefix: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>, ExecutorError> {
		Ok(keys_paged(&self.entries, prefix, 1, Some(key)).into_iter().next())
	}
}

/// An in-memory chain implementing [`Upstream`].
///
/// Blocks `#0..#n` are chained by parent hash; every block has the same storage and a
/// body holding one extrinsic, the SCALE-encoded block number. The head is also the
/// finalized block.
#[derive(Debug)]
pub struct MockUpstream {
	headers: Vec<Header>,
	storage: BTreeMap<Vec<u8>, Vec<u8>>,
	metadata: Vec<u8>,
	properties: SystemProperties,
	max_page_size: u32,
	fail: AtomicBool,
	header_requests: AtomicUsize,
	storage_requests: AtomicUsize,
	keys_requests: AtomicUsize,
}

impl Default for MockUpstream {
	fn default() -> Self {
		Self::new()
	}
}

impl MockUpstream {
	/// Runtime code stored under `:code` by default.
	pub const CODE: &'static [u8] = b"mock-runtime";

	/// A chain of three blocks whose storage only holds [`Self::CODE`].
	pub fn new() -> Self {
		let mut properties = SystemProperties::new();
		properties.insert(properties::SS58_FORMAT.into(), 42.into());
		properties.insert(properties::TOKEN_DECIMALS.into(), 12.into());
		properties.insert(properties::TOKEN_SYMBOL.into(), "UNIT".into());

		Self {
			headers: Self::chain(3),
			storage: collect_entries([(keys::CODE, Self::CODE)]),
			metadata: vec![],
			properties,
			max_page_size: u32::MAX,
			fail: AtomicBool::new(false),
			header_requests: AtomicUsize::new(0),
			storage_requests: AtomicUsize::new(0),
			keys_requests: AtomicUsize::new(0),
		}
	}

	fn chain(length: u32) -> Vec<Header> {
		let mut headers = vec![Header {
			parent_hash: H256::zero(),
			number: 0,
			state_root: H256::repeat_byte(0x11),
			extrinsics_root: H256::zero(),
			digest: vec![],
		}];
		for _ in 1..length.max(1) {
			let parent = &headers[headers.len() - 1];
			let mut header = Header::next(parent.hash(), parent.number, vec![]);
			header.state_root = H256::repeat_byte(0x11);
			headers.push(header);
		}
		headers
	}

	/// Replace the chain with `length` blocks.
	pub fn with_chain_length(mut self, length: u32) -> Self {
		self.headers = Self::chain(length);
		self
	}

	/// Add storage entries, visible at every block.
	pub fn with_storage<K: Into<Vec<u8>>, V: Into<Vec<u8>>>(
		mut self,
		entries: impl IntoIterator<Item = (K, V)>,
	) -> Self {
		self.storage.extend(collect_entries(entries));
		self
	}

	/// Raw metadata returned by [`Upstream::metadata`].
	pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
		self.metadata = metadata;
		self
	}

	/// Serve at most `max` keys per `storage_keys_paged` request, whatever the count asked.
	pub fn with_max_page_size(mut self, max: u32) -> Self {
		self.max_page_size = max;
		self
	}

	/// Make every subsequent request fail (or succeed again).
	pub fn fail_requests(&self, fail: bool) {
		self.fail.store(fail, Ordering::SeqCst);
	}

	/// Hash of the latest block.
	pub fn head_hash(&self) -> H256 {
		self.headers[self.headers.len() - 1].hash()
	}

	/// Hash of block `number`, if the chain is that long.
	pub fn hash_at(&self, number: u32) -> Option<H256> {
		self.headers.get(number as usize).map(Header::hash)
	}

	/// Number of `header` requests served.
	pub fn header_requests(&self) -> usize {
		self.header_requests.load(Ordering::SeqCst)
	}

	/// Number of `storage` and `storage_batch` requests served.
	pub fn storage_requests(&self) -> usize {
		self.storage_requests.load(Ordering::SeqCst)
	}

	/// Number of `storage_keys_paged` requests served.
	pub fn keys_requests(&self) -> usize {
		self.keys_requests.load(Ordering::SeqCst)
	}

	fn check(&self, method: &'static str) -> Result<(), RpcClientError> {
		if self.fail.load(Ordering::SeqCst) {
			return Err(RpcClientError::RequestFailed {
				method,
				message: "mock upstream unavailable".to_string(),
			});
		}
		Ok(())
	}

	fn position(&self, hash: H256) -> Option<usize> {
		self.headers.iter().position(|header| header.hash() == hash)
	}
}

#[async_trait]
impl Upstream for MockUpstream {
	async fn header(&self, hash: H256) -> Result<Option<Header>, RpcClientError> {
		self.check(methods::CHAIN_GET_HEADER)?;
		self.header_requests.fetch_add(1, Ordering::SeqCst);
		Ok(self.position(hash).map(|i| self.headers[i].clone()))
	}

	async fn block_body(&self, hash: H256) -> Result<Option<Vec<Vec<u8>>>, RpcClientError> {
		self.check(methods::CHAIN_GET_BLOCK)?;
		Ok(self.position(hash).map(|i| vec![(i as u32).encode()]))
	}

	async fn storage(&self, key: &[u8], _at: H256) -> Result<Option<Vec<u8>>, RpcClientError> {
		self.check(methods::STATE_GET_STORAGE)?;
		self.storage_requests.fetch_add(1, Ordering::SeqCst);
		Ok(self.storage.get(key).cloned())
	}

	async fn storage_batch(
		&self,
		keys: &[&[u8]],
		_at: H256,
	) -> Result<Vec<Option<Vec<u8>>>, RpcClientError> {
		self.check(methods::STATE_QUERY_STORAGE_AT)?;
		self.storage_requests.fetch_add(1, Ordering::SeqCst);
		Ok(keys.iter().map(|key| self.storage.get(*key).cloned()).collect())
	}

	async fn storage_keys_paged(
		&self,
		prefix: &[u8],
		count: u32,
		start_key: Option<&[u8]>,
		_at: H256,
	) -> Result<Vec<Vec<u8>>, RpcClientError> {
		self.check(methods::STATE_GET_KEYS_PAGED)?;
		self.keys_requests.fetch_add(1, Ordering::SeqCst);
		Ok(keys_paged(&self.storage, prefix, count.min(self.max_page_size), start_key))
	}

	async fn metadata(&self, _at: H256) -> Result<Vec<u8>, RpcClientError> {
		self.check(methods::STATE_GET_METADATA)?;
		Ok(self.metadata.clone())
	}

	async fn system_properties(&self) -> Result<SystemProperties, RpcClientError> {
		self.check(methods::SYSTEM_PROPERTIES)?;
		Ok(self.properties.clone())
	}

	async fn block_hash_at(&self, number: u32) -> Result<Option<H256>, RpcClientError> {
		self.check(methods::CHAIN_GET_BLOCK_HASH)?;
		Ok(self.hash_at(number))
	}

	async fn finalized_head(&self) -> Result<H256, RpcClientError> {
		self.check(methods::CHAIN_GET_FINALIZED_HEAD)?;
		Ok(self.head_hash())
	}
}

/// A scripted [`RuntimeEngine`].
///
/// The runtime version reports the code as `spec_name` and its length as `spec_version`.
/// Metadata is [`Self::METADATA`]. Call methods:
///
/// | Method | Behaviour |
/// |--------|-----------|
/// | `echo` | returns the arguments |
/// | `sleep:<ms>` | blocks the worker, then returns the arguments |
/// | `read` | returns the value of the key given as arguments (empty if none) |
/// | `keys` | returns the keys under the prefix given as arguments, `,`-separated |
/// | `set:<key>` | writes the arguments to `key` |
/// | `delete:<key>` | deletes `key` |
/// | `log` | emits the arguments as a runtime log line |
/// | `fail` | fails the call |
/// | `panic` | kills the worker thread |
///
/// Calls within one task see the writes of the calls before them.
#[derive(Debug, Default)]
pub struct MockEngine;

impl MockEngine {
	/// Metadata returned by the `Metadata` task (before length prefixing).
	pub const METADATA: &'static [u8] = b"mock-metadata";

	/// A factory for the execution queue.
	pub fn factory() -> EngineFactory {
		Arc::new(|| Box::new(MockEngine) as Box<dyn RuntimeEngine>)
	}

	fn calls(
		calls: Vec<(String, Vec<u8>)>,
		host: &mut dyn HostStorage,
	) -> Result<RuntimeCallResult, ExecutorError> {
		let mut changes: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
		let mut logs = Vec::new();
		let mut output = Vec::new();

		for (method, args) in calls {
			output = match (method.as_str(), method.split_once(':')) {
				(_, Some(("sleep", ms))) => {
					thread::sleep(Duration::from_millis(ms.parse().unwrap_or(0)));
					args
				},
				(_, Some(("set", key))) => {
					changes.insert(key.as_bytes().to_vec(), Some(args));
					vec![]
				},
				(_, Some(("delete", key))) => {
					changes.insert(key.as_bytes().to_vec(), None);
					vec![]
				},
				("echo", _) => args,
				("read", _) => match changes.get(&args) {
					Some(value) => value.clone().unwrap_or_default(),
					None => host.get(&args)?.unwrap_or_default(),
				},
				("keys", _) => {
					let mut found = Vec::new();
					let mut cursor = args.clone();
					while let Some(next) = host.next_key(&args, &cursor)? {
						found.push(next.clone());
						cursor = next;
					}
					found.join(&b',')
				},
				("log", _) => {
					logs.push(RuntimeLog {
						message: String::from_utf8_lossy(&args).into_owned(),
						level: Some(3),
						target: Some("mock".to_string()),
					});
					vec![]
				},
				("panic", _) => panic!("mock engine worker lost"),
				_ =>
					return Err(ExecutorError::RuntimeError {
						method: method.clone(),
						message: "mock runtime trapped".to_string(),
					}),
			};
		}

		Ok(RuntimeCallResult {
			output,
			storage_diff: changes.into_iter().collect(),
			offchain_storage_diff: vec![],
			logs,
		})
	}
}

impl RuntimeEngine for MockEngine {
	fn execute(
		&mut self,
		task: ExecutionTask,
		host: &mut dyn HostStorage,
	) -> Result<TaskOutput, ExecutorError> {
		match task {
			ExecutionTask::RuntimeVersion { code } => Ok(TaskOutput::RuntimeVersion(RuntimeVersion {
				spec_name: String::from_utf8_lossy(&code).into_owned(),
				spec_version: code.len() as u32,
				..Default::default()
			})),
			ExecutionTask::Metadata { .. } => Ok(TaskOutput::Metadata(Self::METADATA.to_vec().encode())),
			ExecutionTask::Call { calls, .. } => Self::calls(calls, host).map(TaskOutput::Call),
			other => Err(ExecutorError::UnsupportedTask(other.kind())),
		}
	}
}
