// SPDX-License-Identifier: GPL-3.0

//! A single copy-on-write overlay.

use super::{StorageDiff, StorageValue};
use std::{collections::BTreeMap, ops::Bound};

/// One overlay of pending writes.
///
/// Holds explicit verdicts per key (a value, or `None` for a deletion) and the prefixes
/// deleted wholesale. A `delete_prefix` drops the layer's own earlier writes under the
/// prefix, so explicit entries always take precedence over the layer's prefixes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageLayer {
	entries: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
	deleted_prefixes: Vec<Vec<u8>>,
}

impl StorageLayer {
	/// Create an empty layer.
	pub fn new() -> Self {
		Self::default()
	}

	/// Build a layer from a storage diff.
	pub fn from_diff(diff: StorageDiff) -> Self {
		Self { entries: diff.into_iter().collect(), deleted_prefixes: Vec::new() }
	}

	/// Set a storage value. `None` deletes the key.
	pub fn set(&mut self, key: &[u8], value: Option<&[u8]>) {
		self.entries.insert(key.to_vec(), value.map(|v| v.to_vec()));
	}

	/// Set many values at once.
	pub fn set_batch(&mut self, entries: &[(&[u8], Option<&[u8]>)]) {
		for (key, value) in entries {
			self.set(key, *value);
		}
	}

	/// Delete a key.
	pub fn delete(&mut self, key: &[u8]) {
		self.entries.insert(key.to_vec(), None);
	}

	/// Delete every key starting with `prefix`, including keys of the layers beneath.
	pub fn delete_prefix(&mut self, prefix: &[u8]) {
		self.entries.retain(|key, _| !key.starts_with(prefix));
		if !self.deleted_prefixes.iter().any(|p| prefix.starts_with(p)) {
			self.deleted_prefixes.retain(|p| !p.starts_with(prefix));
			self.deleted_prefixes.push(prefix.to_vec());
		}
	}

	/// The verdict this layer holds for `key`, if any.
	///
	/// # Returns
	/// * `Some(StorageValue::Present(_))` - The layer sets the key
	/// * `Some(StorageValue::Deleted)` - The layer deletes the key or one of its prefixes
	/// * `None` - The layer says nothing; look beneath
	pub fn get(&self, key: &[u8]) -> Option<StorageValue> {
		match self.entries.get(key) {
			Some(value) => Some(StorageValue::from(value.clone())),
			None if self.is_prefix_deleted(key) => Some(StorageValue::Deleted),
			None => None,
		}
	}

	fn is_prefix_deleted(&self, key: &[u8]) -> bool {
		self.deleted_prefixes.iter().any(|prefix| key.starts_with(prefix))
	}

	/// Keys with an explicit entry that start with `prefix` and are strictly greater than
	/// `start_key`, in ascending order. Deletions are included.
	pub fn keys_after<'a>(
		&'a self,
		prefix: &'a [u8],
		start_key: Option<&'a [u8]>,
	) -> impl Iterator<Item = &'a [u8]> + 'a {
		let lower = match start_key {
			Some(start) if start >= prefix => Bound::Excluded(start),
			_ => Bound::Included(prefix),
		};
		self.entries
			.range::<[u8], _>((lower, Bound::Unbounded))
			.map(|(key, _)| key.as_slice())
			.take_while(move |key| key.starts_with(prefix))
	}

	/// Apply `other` on top of this layer, as if its writes had been made here.
	pub fn merge(&mut self, other: StorageLayer) {
		for prefix in &other.deleted_prefixes {
			self.delete_prefix(prefix);
		}
		self.entries.extend(other.entries);
	}

	/// Replay this layer's writes onto a flattened view of the layers beneath.
	///
	/// Deleted prefixes turn every matching key already present in `target` into a
	/// deletion; keys never seen below stay unrepresented.
	pub(crate) fn apply_onto(&self, target: &mut BTreeMap<Vec<u8>, Option<Vec<u8>>>) {
		for (key, value) in target.iter_mut() {
			if self.is_prefix_deleted(key) {
				*value = None;
			}
		}
		target.extend(self.entries.iter().map(|(k, v)| (k.clone(), v.clone())));
	}

	/// Explicit entries of this layer, ordered by key.
	pub fn entries(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> {
		self.entries.iter().map(|(k, v)| (k.as_slice(), v.as_deref()))
	}

	/// Prefixes deleted by this layer.
	pub fn deleted_prefixes(&self) -> &[Vec<u8>] {
		&self.deleted_prefixes
	}

	/// Whether this layer holds no writes at all.
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty() && self.deleted_prefixes.is_empty()
	}
}
