// SPDX-License-Identifier: GPL-3.0

//! The per-block stack of overlays.

use super::{
	SnapshotStorage, StorageDiff, StorageLayer, StorageProvider, StorageValue, merge_keys_paged,
};
use crate::error::StorageError;
use std::{collections::BTreeMap, sync::Arc};

/// Copy-on-write storage of one block.
///
/// Writes go to the top-most pushed layer, or to the base override table when no layer
/// is pushed. The provider and every layer beneath the top are never mutated, so
/// [`pop_layer`](Self::pop_layer) is an exact rollback.
///
/// # Example
///
/// ```ignore
/// let mut stack = StorageStack::new(provider);
/// stack.push_layer().set(b"key", Some(b"value"));
/// assert_eq!(stack.get(b"key", false).await?, Some(StorageValue::Present(b"value".to_vec())));
/// stack.pop_layer();
/// ```
pub struct StorageStack {
	provider: Arc<dyn StorageProvider>,
	base: StorageLayer,
	layers: Vec<StorageLayer>,
	revision: u64,
}

impl std::fmt::Debug for StorageStack {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StorageStack")
			.field("base", &self.base)
			.field("layers", &self.layers)
			.finish_non_exhaustive()
	}
}

impl StorageStack {
	/// Create a stack with no pushed layers over `provider`.
	pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
		Self { provider, base: StorageLayer::new(), layers: Vec::new(), revision: 0 }
	}

	/// The base provider.
	pub fn provider(&self) -> &Arc<dyn StorageProvider> {
		&self.provider
	}

	/// Number of pushed layers, not counting the base override table.
	pub fn depth(&self) -> usize {
		self.layers.len()
	}

	/// Counter bumped by every operation that may change the stack's view.
	///
	/// Equal revisions guarantee an unchanged view; a pushed layer counts as a change since
	/// it is handed out for writing.
	pub fn revision(&self) -> u64 {
		self.revision
	}

	/// Push a fresh, empty layer and return it for writing.
	pub fn push_layer(&mut self) -> &mut StorageLayer {
		self.revision += 1;
		self.layers.push(StorageLayer::new());
		let top = self.layers.len() - 1;
		&mut self.layers[top]
	}

	/// Discard the top-most layer and everything written to it.
	pub fn pop_layer(&mut self) -> Option<StorageLayer> {
		self.revision += 1;
		self.layers.pop()
	}

	/// Merge the top-most layer into the one beneath it (or into the base override table)
	/// and drop it.
	pub fn fold(&mut self) -> Result<(), StorageError> {
		let top = self.layers.pop().ok_or(StorageError::NothingToFold)?;
		self.active_mut().merge(top);
		Ok(())
	}

	fn active_mut(&mut self) -> &mut StorageLayer {
		self.revision += 1;
		match self.layers.last_mut() {
			Some(layer) => layer,
			None => &mut self.base,
		}
	}

	/// Set a value in the active layer. `None` deletes the key.
	pub fn set(&mut self, key: &[u8], value: Option<&[u8]>) {
		self.active_mut().set(key, value);
	}

	/// Set many values in the active layer.
	pub fn set_batch(&mut self, entries: &[(&[u8], Option<&[u8]>)]) {
		self.active_mut().set_batch(entries);
	}

	/// Delete a key in the active layer.
	pub fn delete(&mut self, key: &[u8]) {
		self.active_mut().delete(key);
	}

	/// Delete every key under `prefix` in the active layer.
	pub fn delete_prefix(&mut self, prefix: &[u8]) {
		self.active_mut().delete_prefix(prefix);
	}

	/// Overlays from the top-most layer down to the base override table.
	fn overlays(&self) -> Vec<&StorageLayer> {
		self.layers.iter().rev().chain(std::iter::once(&self.base)).collect()
	}

	/// Resolve a key.
	///
	/// # Returns
	/// * `Ok(Some(StorageValue::Present(_)))` - The key has a value
	/// * `Ok(Some(StorageValue::Deleted))` - An overlay deleted the key
	/// * `Ok(Some(StorageValue::Unknown))` - `cache_only` was set and the provider would have
	///   needed a remote fetch
	/// * `Ok(None)` - The key has no value anywhere
	pub async fn get(
		&self,
		key: &[u8],
		cache_only: bool,
	) -> Result<Option<StorageValue>, StorageError> {
		if let Some(verdict) = self.layers.iter().rev().find_map(|layer| layer.get(key)) {
			return Ok(Some(verdict));
		}
		if let Some(verdict) = self.base.get(key) {
			return Ok(Some(verdict));
		}
		self.provider.get(key, cache_only).await
	}

	/// A page of live keys under `prefix`, strictly greater than `start_key`.
	///
	/// Overlay keys and the provider's listing are merged; the top-most verdict decides
	/// whether a key is live, and deleted keys are never returned.
	pub async fn get_keys_paged(
		&self,
		prefix: &[u8],
		page_size: u32,
		start_key: Option<&[u8]>,
	) -> Result<Vec<Vec<u8>>, StorageError> {
		merge_keys_paged(&self.overlays(), Some(self.provider.as_ref()), prefix, page_size, start_key)
			.await
	}

	/// The first live key under `prefix` strictly greater than `key`.
	pub async fn next_key(&self, prefix: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
		Ok(self.get_keys_paged(prefix, 1, Some(key)).await?.into_iter().next())
	}

	/// Pending writes of all pushed layers, flattened and ordered by key.
	///
	/// `None` marks a deletion. The base override table is not part of the diff, but
	/// prefix deletions still report the base keys they cover.
	pub fn storage_diff(&self) -> StorageDiff {
		let mut flattened: BTreeMap<Vec<u8>, Option<Vec<u8>>> =
			self.base.entries().map(|(k, v)| (k.to_vec(), v.map(|v| v.to_vec()))).collect();
		let base_keys: Vec<Vec<u8>> = flattened.keys().cloned().collect();
		for layer in &self.layers {
			layer.apply_onto(&mut flattened);
		}
		// Base entries untouched by any layer are not pending writes.
		for key in base_keys {
			let touched = self.layers.iter().any(|layer| layer.get(&key).is_some());
			if !touched {
				flattened.remove(&key);
			}
		}
		flattened.into_iter().collect()
	}

	/// The base override table and every pushed layer collapsed into one layer.
	pub fn flatten(&self) -> StorageLayer {
		let mut flat = self.base.clone();
		for layer in &self.layers {
			flat.merge(layer.clone());
		}
		flat
	}

	/// A frozen copy of this stack's current view, for use as another stack's provider.
	pub fn snapshot(&self) -> SnapshotStorage {
		SnapshotStorage::new(self.flatten(), Some(self.provider.clone()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::MemoryProvider;

	fn stack_with(entries: &[(&str, &str)]) -> StorageStack {
		StorageStack::new(Arc::new(MemoryProvider::new(entries.iter().copied())))
	}

	fn present(value: &[u8]) -> Option<StorageValue> {
		Some(StorageValue::Present(value.to_vec()))
	}

	#[tokio::test]
	async fn reads_fall_through_to_provider() {
		let stack = stack_with(&[("key1", "val1")]);
		assert_eq!(stack.get(b"key1", false).await.unwrap(), present(b"val1"));
		assert_eq!(stack.get(b"key2", false).await.unwrap(), None);
	}

	#[tokio::test]
	async fn top_most_verdict_wins() {
		let mut stack = stack_with(&[("key", "base")]);
		stack.push_layer().set(b"key", Some(b"l1"));
		stack.push_layer().delete(b"key");
		assert_eq!(stack.get(b"key", false).await.unwrap(), Some(StorageValue::Deleted));

		stack.push_layer().set(b"key", Some(b"l3"));
		assert_eq!(stack.get(b"key", false).await.unwrap(), present(b"l3"));
	}

	#[tokio::test]
	async fn writes_only_touch_the_top_layer() {
		let mut stack = stack_with(&[]);
		stack.push_layer().set(b"key", Some(b"l1"));
		stack.push_layer();
		stack.set(b"key", Some(b"l2"));
		stack.pop_layer();
		assert_eq!(stack.get(b"key", false).await.unwrap(), present(b"l1"));
	}

	#[tokio::test]
	async fn pop_restores_pre_push_reads() {
		let mut stack = stack_with(&[("a", "1"), ("b", "2")]);
		stack.push_layer().set(b"c", Some(b"3"));

		let keys: [&[u8]; 4] = [b"a", b"b", b"c", b"d"];
		let mut before = Vec::new();
		for key in keys {
			before.push(stack.get(key, false).await.unwrap());
		}

		let layer = stack.push_layer();
		layer.set(b"a", Some(b"changed"));
		layer.delete(b"b");
		layer.delete_prefix(b"c");
		layer.set(b"d", Some(b"new"));
		stack.pop_layer();

		for (key, expected) in keys.into_iter().zip(before) {
			assert_eq!(stack.get(key, false).await.unwrap(), expected);
		}
	}

	#[tokio::test]
	async fn fold_then_pop_matches_writing_beneath() {
		let mut folded = stack_with(&[("a", "1")]);
		folded.push_layer().set(b"b", Some(b"2"));
		let top = folded.push_layer();
		top.set(b"a", Some(b"x"));
		top.delete(b"b");
		folded.fold().unwrap();

		let mut direct = stack_with(&[("a", "1")]);
		let layer = direct.push_layer();
		layer.set(b"b", Some(b"2"));
		layer.set(b"a", Some(b"x"));
		layer.delete(b"b");

		for key in [&b"a"[..], b"b"] {
			assert_eq!(folded.get(key, false).await.unwrap(), direct.get(key, false).await.unwrap());
		}
		assert_eq!(folded.depth(), 1);

		// Popping the folded layer drops both writes together.
		folded.pop_layer();
		assert_eq!(folded.get(b"a", false).await.unwrap(), present(b"1"));
		assert_eq!(folded.get(b"b", false).await.unwrap(), None);
	}

	#[tokio::test]
	async fn revision_tracks_view_changes() {
		let mut stack = stack_with(&[]);
		let start = stack.revision();
		stack.get(b"a", false).await.unwrap();
		stack.storage_diff();
		assert_eq!(stack.revision(), start);

		stack.push_layer().set(b"a", Some(b"1"));
		let pushed = stack.revision();
		assert!(pushed > start);
		stack.set(b"b", Some(b"2"));
		assert!(stack.revision() > pushed);
		let written = stack.revision();
		stack.pop_layer();
		assert!(stack.revision() > written);
	}

	#[tokio::test]
	async fn fold_without_layer_fails() {
		let mut stack = stack_with(&[]);
		assert!(matches!(stack.fold(), Err(StorageError::NothingToFold)));
	}

	#[tokio::test]
	async fn fold_into_base_overrides() {
		let mut stack = stack_with(&[("a", "1")]);
		stack.push_layer().set(b"a", Some(b"2"));
		stack.fold().unwrap();
		assert_eq!(stack.depth(), 0);
		assert_eq!(stack.get(b"a", false).await.unwrap(), present(b"2"));
		assert!(stack.storage_diff().is_empty());
	}

	#[tokio::test]
	async fn delete_prefix_hides_provider_keys() {
		let mut stack = stack_with(&[("pfx1", "1"), ("pfx2", "2"), ("other", "3")]);
		stack.push_layer().delete_prefix(b"pfx");
		assert_eq!(stack.get(b"pfx1", false).await.unwrap(), Some(StorageValue::Deleted));
		assert_eq!(stack.get(b"other", false).await.unwrap(), present(b"3"));
		assert!(stack.get_keys_paged(b"pfx", 10, None).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn storage_diff_flattens_layers_in_key_order() {
		let mut stack = stack_with(&[("remote", "r")]);
		stack.set(b"base", Some(b"b"));
		let l1 = stack.push_layer();
		l1.set(b"k2", Some(b"v2"));
		l1.set(b"k1", Some(b"v1"));
		let l2 = stack.push_layer();
		l2.delete(b"k2");
		l2.delete(b"remote");
		l2.set(b"k3", Some(b"v3"));

		assert_eq!(
			stack.storage_diff(),
			vec![
				(b"k1".to_vec(), Some(b"v1".to_vec())),
				(b"k2".to_vec(), None),
				(b"k3".to_vec(), Some(b"v3".to_vec())),
				(b"remote".to_vec(), None),
			]
		);
	}

	#[tokio::test]
	async fn storage_diff_reports_prefix_deleted_base_keys() {
		let mut stack = stack_with(&[]);
		stack.set(b"pfx-base", Some(b"b"));
		stack.push_layer().delete_prefix(b"pfx");
		assert_eq!(stack.storage_diff(), vec![(b"pfx-base".to_vec(), None)]);
	}

	#[tokio::test]
	async fn paging_merges_overlays_with_provider() {
		let mut stack = stack_with(&[("p1", "x"), ("p3", "x"), ("p5", "x"), ("q1", "x")]);
		let layer = stack.push_layer();
		layer.set(b"p2", Some(b"y"));
		layer.delete(b"p3");
		layer.set(b"p6", Some(b"y"));

		let keys = stack.get_keys_paged(b"p", 10, None).await.unwrap();
		assert_eq!(keys, vec![b"p1".to_vec(), b"p2".to_vec(), b"p5".to_vec(), b"p6".to_vec()]);

		let page = stack.get_keys_paged(b"p", 2, Some(b"p1")).await.unwrap();
		assert_eq!(page, vec![b"p2".to_vec(), b"p5".to_vec()]);

		assert_eq!(stack.next_key(b"p", b"p2").await.unwrap(), Some(b"p5".to_vec()));
		assert_eq!(stack.next_key(b"p", b"p6").await.unwrap(), None);
	}

	#[tokio::test]
	async fn paging_is_exhaustive_across_pages() {
		let provider_keys: Vec<Vec<u8>> = (0..50u8).map(|i| vec![b'k', i * 2]).collect();
		let provider = MemoryProvider::new(provider_keys.iter().map(|k| (k.clone(), b"v".to_vec())));
		let mut stack = StorageStack::new(Arc::new(provider));
		let layer = stack.push_layer();
		for i in 0..50u8 {
			// Odd keys live only in the overlay; every fifth provider key is deleted.
			layer.set(&[b'k', i * 2 + 1], Some(b"o"));
			if i % 5 == 0 {
				layer.delete(&[b'k', i * 2]);
			}
		}

		let mut seen = Vec::new();
		let mut cursor: Option<Vec<u8>> = None;
		loop {
			let page = stack.get_keys_paged(b"k", 7, cursor.as_deref()).await.unwrap();
			if page.is_empty() {
				break;
			}
			assert!(page.len() <= 7);
			cursor = page.last().cloned();
			seen.extend(page);
		}

		let mut expected: Vec<Vec<u8>> = (0..100u8)
			.filter(|n| n % 2 == 1 || (n / 2) % 5 != 0)
			.map(|n| vec![b'k', n])
			.collect();
		expected.sort();
		assert_eq!(seen, expected);
	}

	#[tokio::test]
	async fn next_key_walks_large_overlays() {
		let mut stack = stack_with(&[("n:0000", "p")]);
		let lower = stack.push_layer();
		for i in 1..3000u32 {
			lower.set(format!("n:{i:04}").as_bytes(), Some(b"l"));
		}
		let upper = stack.push_layer();
		for i in (0..3000u32).filter(|i| i % 3 == 0) {
			upper.delete(format!("n:{i:04}").as_bytes());
		}

		let mut walked = 0;
		let mut key = b"n:".to_vec();
		while let Some(next) = stack.next_key(b"n:", &key).await.unwrap() {
			assert!(next > key);
			key = next;
			walked += 1;
		}
		assert_eq!(walked, 2000);
		assert_eq!(key, b"n:2999".to_vec());
	}

	#[tokio::test]
	async fn cache_only_reports_unknown() {
		let stack = StorageStack::new(Arc::new(MemoryProvider::cache_only_unknown()));
		assert_eq!(stack.get(b"key", true).await.unwrap(), Some(StorageValue::Unknown));
	}

	#[tokio::test]
	async fn snapshot_freezes_current_view() {
		let mut stack = stack_with(&[("a", "1"), ("b", "2")]);
		let layer = stack.push_layer();
		layer.set(b"a", Some(b"x"));
		layer.delete(b"b");
		let child = StorageStack::new(Arc::new(stack.snapshot()));

		stack.pop_layer();
		assert_eq!(child.get(b"a", false).await.unwrap(), present(b"x"));
		assert_eq!(child.get(b"b", false).await.unwrap(), Some(StorageValue::Deleted));
		assert_eq!(child.get_keys_paged(b"", 10, None).await.unwrap(), vec![b"a".to_vec()]);
	}
}
