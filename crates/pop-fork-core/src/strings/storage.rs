// SPDX-License-Identifier: GPL-3.0

//! String constants for the storage layers.

/// Well-known storage keys.
pub mod keys {
	/// The `:code` storage key containing the runtime WASM blob.
	pub const CODE: &[u8] = b":code";
	/// The `:heappages` storage key overriding the runtime heap size.
	pub const HEAP_PAGES: &[u8] = b":heappages";
}

/// Page sizes used when listing keys from the upstream node.
pub mod paging {
	/// Number of keys requested per `state_getKeysPaged` call while prefetching.
	pub const PREFETCH_PAGE_SIZE: u32 = 1000;
	/// Number of values requested per `state_queryStorageAt` call while prefetching.
	pub const PREFETCH_BATCH_SIZE: usize = 100;
}
