// SPDX-License-Identifier: GPL-3.0

//! In-memory storage cache for fork operations.
//!
//! Remote storage at a given block never changes, so every value fetched from a live
//! chain is kept here keyed by `(block hash, key)` and never invalidated. The cache is
//! shared between all blocks forked from the same endpoint and is safe for concurrent
//! readers.

use crate::error::CacheError;
use std::{
	collections::HashMap,
	sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use subxt::config::substrate::H256;

type Entries = HashMap<(H256, Vec<u8>), Option<Vec<u8>>>;

#[derive(Default)]
struct Inner {
	storage: Entries,
	/// Last key fetched by an interrupted prefix prefetch, or `None` once finished.
	prefixes: HashMap<(H256, Vec<u8>), Option<Vec<u8>>>,
}

/// Shared, read-through cache for storage values fetched from live chains.
///
/// Cloning is cheap; clones share the same entries.
#[derive(Clone, Default)]
pub struct StorageCache {
	inner: Arc<RwLock<Inner>>,
}

impl std::fmt::Debug for StorageCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StorageCache").finish_non_exhaustive()
	}
}

impl StorageCache {
	/// Create an empty cache.
	pub fn in_memory() -> Self {
		Self::default()
	}

	fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, CacheError> {
		self.inner.read().map_err(|e| CacheError::Lock(e.to_string()))
	}

	fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, CacheError> {
		self.inner.write().map_err(|e| CacheError::Lock(e.to_string()))
	}

	/// Get a cached storage value.
	///
	/// # Returns
	/// * `Ok(Some(Some(value)))` - Cached with a value
	/// * `Ok(Some(None))` - Cached as empty (the key has no value at this block)
	/// * `Ok(None)` - Not in cache (unknown)
	pub fn get(&self, block_hash: H256, key: &[u8]) -> Result<Option<Option<Vec<u8>>>, CacheError> {
		Ok(self.read()?.storage.get(&(block_hash, key.to_vec())).cloned())
	}

	/// Cache a storage value.
	///
	/// # Arguments
	/// * `block_hash` - The block hash this storage is from
	/// * `key` - The storage key
	/// * `value` - The storage value, or None if the key has no value (empty)
	pub fn set(&self, block_hash: H256, key: &[u8], value: Option<&[u8]>) -> Result<(), CacheError> {
		self.write()?
			.storage
			.insert((block_hash, key.to_vec()), value.map(|v| v.to_vec()));
		Ok(())
	}

	/// Get multiple cached storage values in a batch.
	///
	/// Returns results in the same order as the input keys.
	pub fn get_batch(
		&self,
		block_hash: H256,
		keys: &[&[u8]],
	) -> Result<Vec<Option<Option<Vec<u8>>>>, CacheError> {
		if keys.is_empty() {
			return Ok(vec![]);
		}
		let inner = self.read()?;
		Ok(keys
			.iter()
			.map(|key| inner.storage.get(&(block_hash, key.to_vec())).cloned())
			.collect())
	}

	/// Cache multiple storage values in a batch.
	///
	/// The batch is applied under a single lock, so readers see either none or all of it.
	pub fn set_batch(
		&self,
		block_hash: H256,
		entries: &[(&[u8], Option<&[u8]>)],
	) -> Result<(), CacheError> {
		if entries.is_empty() {
			return Ok(());
		}
		let mut inner = self.write()?;
		for (key, value) in entries {
			inner.storage.insert((block_hash, key.to_vec()), value.map(|v| v.to_vec()));
		}
		Ok(())
	}

	/// Cached keys under `prefix` that hold a value, in ascending order.
	pub fn get_keys_by_prefix(
		&self,
		block_hash: H256,
		prefix: &[u8],
	) -> Result<Vec<Vec<u8>>, CacheError> {
		let inner = self.read()?;
		let mut keys: Vec<Vec<u8>> = inner
			.storage
			.iter()
			.filter(|((block, key), value)| {
				*block == block_hash && key.starts_with(prefix) && value.is_some()
			})
			.map(|((_, key), _)| key.clone())
			.collect();
		keys.sort();
		Ok(keys)
	}

	/// Number of cached keys under `prefix` that hold a value.
	pub fn count_keys_by_prefix(&self, block_hash: H256, prefix: &[u8]) -> Result<usize, CacheError> {
		Ok(self.get_keys_by_prefix(block_hash, prefix)?.len())
	}

	/// Progress of a prefix prefetch.
	///
	/// # Returns
	/// * `Ok(None)` - The prefix was never prefetched
	/// * `Ok(Some(Some(key)))` - Prefetch was interrupted after `key`
	/// * `Ok(Some(None))` - The whole prefix is cached
	pub fn prefix_progress(
		&self,
		block_hash: H256,
		prefix: &[u8],
	) -> Result<Option<Option<Vec<u8>>>, CacheError> {
		Ok(self.read()?.prefixes.get(&(block_hash, prefix.to_vec())).cloned())
	}

	/// Record the progress of a prefix prefetch. `None` marks it complete.
	pub fn set_prefix_progress(
		&self,
		block_hash: H256,
		prefix: &[u8],
		last_key: Option<&[u8]>,
	) -> Result<(), CacheError> {
		self.write()?
			.prefixes
			.insert((block_hash, prefix.to_vec()), last_key.map(|k| k.to_vec()));
		Ok(())
	}

	/// Clear all cached data for a specific block.
	pub fn clear_block(&self, hash: H256) -> Result<(), CacheError> {
		let mut inner = self.write()?;
		inner.storage.retain(|(block, _), _| *block != hash);
		inner.prefixes.retain(|(block, _), _| *block != hash);
		Ok(())
	}
}
