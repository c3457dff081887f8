// SPDX-License-Identifier: GPL-3.0

//! Self-contained base storage for locally built blocks.

use super::{StorageLayer, StorageProvider, StorageValue, merge_keys_paged};
use crate::error::StorageError;
use async_trait::async_trait;
use std::sync::Arc;

/// A frozen overlay, optionally chained to the provider it was taken from.
///
/// Blocks produced locally use a snapshot of their parent's view as their base: the
/// parent's pending writes are copied in, and everything else is still answered by the
/// parent's provider (ultimately the remote chain). Without a parent the snapshot is a
/// complete state on its own, as for a genesis block.
#[derive(Clone)]
pub struct SnapshotStorage {
	layer: Arc<StorageLayer>,
	parent: Option<Arc<dyn StorageProvider>>,
}

impl SnapshotStorage {
	/// Create a snapshot of `layer` over an optional `parent`.
	pub fn new(layer: StorageLayer, parent: Option<Arc<dyn StorageProvider>>) -> Self {
		Self { layer: Arc::new(layer), parent }
	}

	/// A standalone snapshot holding exactly `entries`.
	pub fn from_entries(entries: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>) -> Self {
		let diff = entries.into_iter().map(|(k, v)| (k, Some(v))).collect();
		Self::new(StorageLayer::from_diff(diff), None)
	}
}

#[async_trait]
impl StorageProvider for SnapshotStorage {
	async fn get(&self, key: &[u8], cache_only: bool) -> Result<Option<StorageValue>, StorageError> {
		if let Some(verdict) = self.layer.get(key) {
			return Ok(Some(verdict));
		}
		match &self.parent {
			Some(parent) => parent.get(key, cache_only).await,
			None => Ok(None),
		}
	}

	async fn get_keys_paged(
		&self,
		prefix: &[u8],
		page_size: u32,
		start_key: Option<&[u8]>,
	) -> Result<Vec<Vec<u8>>, StorageError> {
		merge_keys_paged(&[self.layer.as_ref()], self.parent.as_deref(), prefix, page_size, start_key).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::MemoryProvider;

	#[tokio::test]
	async fn standalone_snapshot_answers_alone() {
		let snapshot =
			SnapshotStorage::from_entries([(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]);
		assert_eq!(snapshot.get(b"a", false).await.unwrap(), Some(StorageValue::Present(b"1".to_vec())));
		assert_eq!(snapshot.get(b"c", false).await.unwrap(), None);
		assert_eq!(
			snapshot.get_keys_paged(b"", 10, Some(b"a")).await.unwrap(),
			vec![b"b".to_vec()]
		);
	}

	#[tokio::test]
	async fn chained_snapshot_masks_parent() {
		let parent: Arc<dyn StorageProvider> =
			Arc::new(MemoryProvider::new([("a", "1"), ("b", "2"), ("c", "3")]));
		let mut layer = StorageLayer::new();
		layer.delete(b"b");
		layer.set(b"d", Some(b"4"));
		let snapshot = SnapshotStorage::new(layer, Some(parent));

		assert_eq!(snapshot.get(b"a", false).await.unwrap(), Some(StorageValue::Present(b"1".to_vec())));
		assert_eq!(snapshot.get(b"b", false).await.unwrap(), Some(StorageValue::Deleted));
		assert_eq!(
			snapshot.get_keys_paged(b"", 10, None).await.unwrap(),
			vec![b"a".to_vec(), b"c".to_vec(), b"d".to_vec()]
		);
	}
}
