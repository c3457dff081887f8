// SPDX-License-Identifier: GPL-3.0

//! Remote storage layer for lazy-loading state from live chains.
//!
//! This module provides the [`RemoteStorageLayer`] which transparently fetches storage
//! from a live chain via RPC when values aren't in the local cache. This enables
//! "lazy forking" where state is fetched on-demand rather than requiring a full sync.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    RemoteStorageLayer                           │
//! │                                                                 │
//! │   get(key) ─────► Cache Hit? ──── Yes ────► Return cached value │
//! │                        │                                        │
//! │                        No ──── cache_only? ──► Unknown          │
//! │                        │                                        │
//! │                        ▼                                        │
//! │                 Fetch from RPC, store in cache, return          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use super::{StorageProvider, StorageValue};
use crate::{
	StorageCache, Upstream, error::StorageError, strings::storage::paging::PREFETCH_BATCH_SIZE,
};
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use subxt::config::substrate::H256;

/// Remote storage layer that lazily fetches state from a live chain.
///
/// Provides a cache-through abstraction: reads check the shared cache first,
/// and only fetch from the upstream node when the value isn't cached. Fetched
/// values, including empty ones, are cached for subsequent reads.
///
/// Cloning is cheap: the upstream client and the cache are both reference counted.
#[derive(Clone)]
pub struct RemoteStorageLayer {
	rpc: Arc<dyn Upstream>,
	cache: StorageCache,
	block_hash: H256,
}

impl RemoteStorageLayer {
	/// Create a new remote storage layer.
	///
	/// # Arguments
	/// * `rpc` - Client connected to the live chain
	/// * `cache` - Storage cache shared by every layer of the fork
	/// * `block_hash` - Block hash to query state at
	pub fn new(rpc: Arc<dyn Upstream>, cache: StorageCache, block_hash: H256) -> Self {
		Self { rpc, cache, block_hash }
	}

	/// Get the block hash this layer is querying.
	pub fn block_hash(&self) -> H256 {
		self.block_hash
	}

	/// Get a reference to the underlying cache.
	pub fn cache(&self) -> &StorageCache {
		&self.cache
	}

	/// Get a storage value, fetching from RPC if not cached.
	///
	/// # Returns
	/// * `Ok(Some(value))` - Storage exists with value
	/// * `Ok(None)` - Storage key doesn't exist (empty)
	/// * `Err(_)` - RPC or cache error
	pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
		if let Some(cached) = self.cache.get(self.block_hash, key)? {
			return Ok(cached);
		}

		let value = self.rpc.storage(key, self.block_hash).await?;
		self.cache.set(self.block_hash, key, value.as_deref())?;

		Ok(value)
	}

	/// Get multiple storage values in a batch, fetching uncached keys from RPC.
	///
	/// # Returns
	/// A vector of optional values, in the same order as the input keys.
	pub async fn get_batch(&self, keys: &[&[u8]]) -> Result<Vec<Option<Vec<u8>>>, StorageError> {
		if keys.is_empty() {
			return Ok(vec![]);
		}

		let cached_results = self.cache.get_batch(self.block_hash, keys)?;

		let mut uncached_indices: Vec<usize> = Vec::new();
		let mut uncached_keys: Vec<&[u8]> = Vec::new();
		for (i, cached) in cached_results.iter().enumerate() {
			if cached.is_none() {
				uncached_indices.push(i);
				uncached_keys.push(keys[i]);
			}
		}

		let mut results: Vec<Option<Vec<u8>>> =
			cached_results.into_iter().map(|c| c.flatten()).collect();
		if uncached_keys.is_empty() {
			return Ok(results);
		}

		let fetched_values = self.rpc.storage_batch(&uncached_keys, self.block_hash).await?;

		let cache_entries: Vec<(&[u8], Option<&[u8]>)> = uncached_keys
			.iter()
			.zip(fetched_values.iter())
			.map(|(k, v)| (*k, v.as_deref()))
			.collect();
		self.cache.set_batch(self.block_hash, &cache_entries)?;

		for (idx, value) in uncached_indices.into_iter().zip(fetched_values) {
			results[idx] = value;
		}

		Ok(results)
	}

	/// Prefetch every key under `prefix` together with its value (resumable).
	///
	/// If a previous prefetch of the same prefix was interrupted, this one continues
	/// after the last key it cached.
	///
	/// # Arguments
	/// * `prefix` - Storage key prefix to match
	/// * `page_size` - Number of keys to list per RPC call
	///
	/// # Returns
	/// The number of cached keys holding a value under this prefix.
	pub async fn prefetch_prefix(&self, prefix: &[u8], page_size: u32) -> Result<usize, StorageError> {
		let mut start_key = match self.cache.prefix_progress(self.block_hash, prefix)? {
			Some(None) => return Ok(self.cache.count_keys_by_prefix(self.block_hash, prefix)?),
			Some(Some(last)) => Some(last),
			None => None,
		};

		loop {
			let keys = self
				.rpc
				.storage_keys_paged(prefix, page_size, start_key.as_deref(), self.block_hash)
				.await?;
			let Some(last_key) = keys.last().cloned() else {
				break;
			};

			for chunk in keys.chunks(PREFETCH_BATCH_SIZE) {
				let key_refs: Vec<&[u8]> = chunk.iter().map(|k| k.as_slice()).collect();
				self.get_batch(&key_refs).await?;
			}
			self.cache.set_prefix_progress(self.block_hash, prefix, Some(&last_key))?;
			debug!("Prefetched {} keys under 0x{}", keys.len(), hex::encode(prefix));
			// Nodes may cap pages below `page_size`; only an empty page ends the listing.
			start_key = Some(last_key);
		}

		self.cache.set_prefix_progress(self.block_hash, prefix, None)?;
		Ok(self.cache.count_keys_by_prefix(self.block_hash, prefix)?)
	}

	/// Get all keys for a prefix, prefetching them first if needed.
	pub async fn get_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StorageError> {
		self.prefetch_prefix(prefix, crate::strings::storage::paging::PREFETCH_PAGE_SIZE)
			.await?;
		Ok(self.cache.get_keys_by_prefix(self.block_hash, prefix)?)
	}
}

#[async_trait]
impl StorageProvider for RemoteStorageLayer {
	async fn get(&self, key: &[u8], cache_only: bool) -> Result<Option<StorageValue>, StorageError> {
		if cache_only {
			return Ok(match self.cache.get(self.block_hash, key)? {
				Some(value) => value.map(StorageValue::Present),
				None => Some(StorageValue::Unknown),
			});
		}
		Ok(RemoteStorageLayer::get(self, key).await?.map(StorageValue::Present))
	}

	async fn get_keys_paged(
		&self,
		prefix: &[u8],
		page_size: u32,
		start_key: Option<&[u8]>,
	) -> Result<Vec<Vec<u8>>, StorageError> {
		Ok(self.rpc.storage_keys_paged(prefix, page_size, start_key, self.block_hash).await?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		error::{ErrorKind, RpcClientError},
		testing::MockUpstream,
	};

	fn layer(upstream: &Arc<MockUpstream>) -> RemoteStorageLayer {
		RemoteStorageLayer::new(upstream.clone(), StorageCache::in_memory(), upstream.head_hash())
	}

	#[test]
	fn error_display_rpc() {
		let err = StorageError::Rpc(RpcClientError::InvalidResponse("test".to_string()));
		assert!(err.to_string().contains("RPC error"));
	}

	#[tokio::test]
	async fn get_fetches_and_caches() {
		let upstream = Arc::new(MockUpstream::new().with_storage([("key", "value")]));
		let layer = layer(&upstream);

		assert_eq!(layer.get(b"key").await.unwrap(), Some(b"value".to_vec()));
		assert_eq!(
			layer.cache().get(layer.block_hash(), b"key").unwrap(),
			Some(Some(b"value".to_vec()))
		);
		assert_eq!(layer.get(b"key").await.unwrap(), Some(b"value".to_vec()));
		assert_eq!(upstream.storage_requests(), 1);
	}

	#[tokio::test]
	async fn get_caches_empty_values() {
		let upstream = Arc::new(MockUpstream::new());
		let layer = layer(&upstream);

		assert_eq!(layer.get(b"missing").await.unwrap(), None);
		assert_eq!(layer.cache().get(layer.block_hash(), b"missing").unwrap(), Some(None));
		assert_eq!(layer.get(b"missing").await.unwrap(), None);
		assert_eq!(upstream.storage_requests(), 1);
	}

	#[tokio::test]
	async fn get_batch_fetches_only_uncached() {
		let upstream = Arc::new(MockUpstream::new().with_storage([("k1", "v1"), ("k2", "v2")]));
		let layer = layer(&upstream);
		layer.get(b"k1").await.unwrap();

		let keys: Vec<&[u8]> = vec![b"k1", b"k2", b"k3"];
		let results = layer.get_batch(&keys).await.unwrap();
		assert_eq!(results, vec![Some(b"v1".to_vec()), Some(b"v2".to_vec()), None]);
		assert_eq!(upstream.storage_requests(), 2);

		for key in keys {
			assert!(layer.cache().get(layer.block_hash(), key).unwrap().is_some());
		}
	}

	#[tokio::test]
	async fn cache_only_distinguishes_unknown_from_absent() {
		let upstream = Arc::new(MockUpstream::new().with_storage([("key", "value")]));
		let layer = layer(&upstream);

		assert_eq!(
			StorageProvider::get(&layer, b"key", true).await.unwrap(),
			Some(StorageValue::Unknown)
		);
		assert_eq!(upstream.storage_requests(), 0);

		layer.get(b"key").await.unwrap();
		layer.get(b"missing").await.unwrap();
		assert_eq!(
			StorageProvider::get(&layer, b"key", true).await.unwrap(),
			Some(StorageValue::Present(b"value".to_vec()))
		);
		assert_eq!(StorageProvider::get(&layer, b"missing", true).await.unwrap(), None);
	}

	#[tokio::test]
	async fn fetch_failures_propagate_as_transient() {
		let upstream = Arc::new(MockUpstream::new());
		upstream.fail_requests(true);
		let layer = layer(&upstream);

		let err = layer.get(b"key").await.unwrap_err();
		assert_eq!(err.kind(), ErrorKind::TransientIo);
		// Nothing was cached for the failed read.
		assert_eq!(layer.cache().get(layer.block_hash(), b"key").unwrap(), None);
	}

	#[tokio::test]
	async fn prefetch_prefix_caches_all_pages() {
		let entries: Vec<(String, String)> =
			(0..25).map(|i| (format!("pre{i:02}"), format!("v{i}"))).collect();
		let upstream = Arc::new(MockUpstream::new().with_storage(entries).with_storage([("other", "x")]));
		let layer = layer(&upstream);

		assert_eq!(layer.prefetch_prefix(b"pre", 10).await.unwrap(), 25);
		assert_eq!(
			layer.cache().get(layer.block_hash(), b"pre07").unwrap(),
			Some(Some(b"v7".to_vec()))
		);
		assert_eq!(layer.cache().get(layer.block_hash(), b"other").unwrap(), None);

		// A finished prefix is not listed again.
		let listed = upstream.keys_requests();
		assert_eq!(layer.get_keys(b"pre").await.unwrap().len(), 25);
		assert_eq!(upstream.keys_requests(), listed);
	}

	#[tokio::test]
	async fn prefetch_prefix_survives_capped_pages() {
		let entries: Vec<(String, String)> =
			(0..25).map(|i| (format!("pre{i:02}"), format!("v{i}"))).collect();
		let upstream = Arc::new(MockUpstream::new().with_storage(entries).with_max_page_size(4));
		let layer = layer(&upstream);

		assert_eq!(layer.prefetch_prefix(b"pre", 10).await.unwrap(), 25);
		assert_eq!(
			layer.cache().get(layer.block_hash(), b"pre24").unwrap(),
			Some(Some(b"v24".to_vec()))
		);
		// Seven capped pages, then the empty one.
		assert_eq!(upstream.keys_requests(), 8);
		assert_eq!(layer.cache().prefix_progress(layer.block_hash(), b"pre").unwrap(), Some(None));
	}

	#[tokio::test]
	async fn prefetch_prefix_resumes_after_last_key() {
		let entries: Vec<(String, String)> =
			(0..10).map(|i| (format!("pre{i:02}"), format!("v{i}"))).collect();
		let upstream = Arc::new(MockUpstream::new().with_storage(entries));
		let layer = layer(&upstream);
		layer.cache().set_prefix_progress(layer.block_hash(), b"pre", Some(b"pre04")).unwrap();

		layer.prefetch_prefix(b"pre", 100).await.unwrap();
		assert_eq!(layer.cache().get(layer.block_hash(), b"pre03").unwrap(), None);
		assert!(layer.cache().get(layer.block_hash(), b"pre05").unwrap().is_some());
	}
}
