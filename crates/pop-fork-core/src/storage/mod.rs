// SPDX-License-Identifier: GPL-3.0

//! Layered, copy-on-write block storage.
//!
//! Every block owns a [`StorageStack`]: an ordered list of in-memory [`StorageLayer`]s on
//! top of an immutable base [`StorageProvider`]. Reads walk the layers top-down and fall
//! through to the provider; writes only ever touch the top layer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         StorageStack                            │
//! │                                                                 │
//! │   ┌──────────────┐   set / delete / delete_prefix               │
//! │   │ layer n (top)│◄──────────────────────────────               │
//! │   ├──────────────┤                                              │
//! │   │     ...      │   get(key): first verdict wins               │
//! │   ├──────────────┤   (Present or Deleted)                       │
//! │   │   layer 0    │                                              │
//! │   ├──────────────┤                                              │
//! │   │ base overrides│◄── fold() of the last pushed layer          │
//! │   └──────┬───────┘                                              │
//! │          ▼                                                      │
//! │   ┌─────────────────────────────┐                               │
//! │   │ StorageProvider             │                               │
//! │   │  RemoteStorageLayer (RPC)   │                               │
//! │   │  SnapshotStorage (local)    │                               │
//! │   └─────────────────────────────┘                               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::StorageError;
use async_trait::async_trait;
use std::collections::BTreeSet;

mod layer;
mod remote;
mod snapshot;
mod stack;

pub use layer::StorageLayer;
pub use remote::RemoteStorageLayer;
pub use snapshot::SnapshotStorage;
pub use stack::StorageStack;

/// A storage diff: `None` marks a deleted key. Ordered by key.
pub type StorageDiff = Vec<(Vec<u8>, Option<Vec<u8>>)>;

/// The resolution of a storage key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageValue {
	/// The key holds this value.
	Present(Vec<u8>),
	/// The key was deleted by an overlay.
	Deleted,
	/// The value was not available without a remote fetch.
	Unknown,
}

impl StorageValue {
	/// The value, if present. Deleted and unknown keys yield `None`.
	pub fn into_value(self) -> Option<Vec<u8>> {
		match self {
			StorageValue::Present(value) => Some(value),
			StorageValue::Deleted | StorageValue::Unknown => None,
		}
	}

	/// Whether this is a deletion verdict.
	pub fn is_deleted(&self) -> bool {
		matches!(self, StorageValue::Deleted)
	}
}

impl From<Option<Vec<u8>>> for StorageValue {
	fn from(value: Option<Vec<u8>>) -> Self {
		value.map_or(StorageValue::Deleted, StorageValue::Present)
	}
}

/// The immutable base beneath a block's overlays.
///
/// Providers answer with `Ok(None)` when the key has no value, never with an error.
#[async_trait]
pub trait StorageProvider: Send + Sync {
	/// Resolve a key.
	///
	/// With `cache_only`, a provider that would need a remote fetch answers
	/// `Some(StorageValue::Unknown)` instead.
	async fn get(&self, key: &[u8], cache_only: bool) -> Result<Option<StorageValue>, StorageError>;

	/// Up to `page_size` live keys starting with `prefix`, strictly greater than
	/// `start_key`, in ascending order. A page shorter than `page_size` is not a signal of
	/// exhaustion; only an empty page is.
	async fn get_keys_paged(
		&self,
		prefix: &[u8],
		page_size: u32,
		start_key: Option<&[u8]>,
	) -> Result<Vec<Vec<u8>>, StorageError>;
}

/// Merge overlay keys with a provider's paginated listing.
///
/// `overlays` are ordered top-most first; for every key the first overlay holding a
/// verdict decides. Provider pages are requested until the result page is determined
/// or the provider returns an empty page.
pub(crate) async fn merge_keys_paged(
	overlays: &[&StorageLayer],
	provider: Option<&dyn StorageProvider>,
	prefix: &[u8],
	page_size: u32,
	start_key: Option<&[u8]>,
) -> Result<Vec<Vec<u8>>, StorageError> {
	if page_size == 0 {
		return Ok(vec![]);
	}
	let limit = page_size as usize;
	let verdict = |key: &[u8]| overlays.iter().find_map(|layer| layer.get(key));

	// Only the first `limit` live keys of each overlay can make it into the page.
	let mut keys = BTreeSet::new();
	for layer in overlays {
		let live = layer
			.keys_after(prefix, start_key)
			.filter(|key| matches!(verdict(*key), Some(StorageValue::Present(_))))
			.take(limit);
		keys.extend(live.map(<[u8]>::to_vec));
	}
	truncate(&mut keys, limit);

	let Some(provider) = provider else {
		return Ok(keys.into_iter().collect());
	};

	let mut cursor = start_key.map(|key| key.to_vec());
	loop {
		let page = provider.get_keys_paged(prefix, page_size, cursor.as_deref()).await?;
		let Some(last) = page.last().cloned() else {
			break;
		};
		for key in page {
			if !verdict(key.as_slice()).is_some_and(|v| v.is_deleted()) {
				keys.insert(key);
			}
		}
		truncate(&mut keys, limit);
		// Every key up to `last` is now known, so a full page there settles the answer.
		if keys.len() == limit && keys.last().is_some_and(|key| *key <= last) {
			break;
		}
		cursor = Some(last);
	}

	Ok(keys.into_iter().collect())
}

fn truncate(keys: &mut BTreeSet<Vec<u8>>, limit: usize) {
	while keys.len() > limit {
		keys.pop_last();
	}
}
