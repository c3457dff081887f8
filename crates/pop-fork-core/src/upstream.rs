// SPDX-License-Identifier: GPL-3.0

//! The remote node a fork reads from.
//!
//! Everything a fork ever asks of the live chain goes through [`Upstream`]. The production
//! implementation is [`crate::ForkRpcClient`]; tests substitute an in-memory chain.

use crate::{Header, error::RpcClientError};
use async_trait::async_trait;
use subxt::config::substrate::H256;

/// Chain properties as returned by `system_properties`.
pub type SystemProperties = serde_json::Map<String, serde_json::Value>;

/// Read-only access to a live chain.
///
/// All queries are pinned to an explicit block hash, so answers for the same arguments
/// never change and may be cached indefinitely.
#[async_trait]
pub trait Upstream: Send + Sync {
	/// Header of the block with the given hash, or `None` if the node does not know it.
	async fn header(&self, hash: H256) -> Result<Option<Header>, RpcClientError>;

	/// Encoded extrinsics of the block with the given hash, or `None` if unknown.
	async fn block_body(&self, hash: H256) -> Result<Option<Vec<Vec<u8>>>, RpcClientError>;

	/// A single storage value. `None` means the key has no value at `at`.
	async fn storage(&self, key: &[u8], at: H256) -> Result<Option<Vec<u8>>, RpcClientError>;

	/// Several storage values, returned in the order of `keys`.
	async fn storage_batch(
		&self,
		keys: &[&[u8]],
		at: H256,
	) -> Result<Vec<Option<Vec<u8>>>, RpcClientError>;

	/// Up to `count` keys starting with `prefix` and strictly greater than `start_key`,
	/// in ascending order.
	async fn storage_keys_paged(
		&self,
		prefix: &[u8],
		count: u32,
		start_key: Option<&[u8]>,
		at: H256,
	) -> Result<Vec<Vec<u8>>, RpcClientError>;

	/// Raw runtime metadata at a block.
	async fn metadata(&self, at: H256) -> Result<Vec<u8>, RpcClientError>;

	/// Chain properties (token decimals, symbols, ss58 format).
	async fn system_properties(&self) -> Result<SystemProperties, RpcClientError>;

	/// Hash of the canonical block at `number`, or `None` if there is none yet.
	async fn block_hash_at(&self, number: u32) -> Result<Option<H256>, RpcClientError>;

	/// Hash of the latest finalized block.
	async fn finalized_head(&self) -> Result<H256, RpcClientError>;
}
