// SPDX-License-Identifier: GPL-3.0

//! RPC client wrapper for connecting to live Polkadot-SDK chains.
//!
//! [`ForkRpcClient`] wraps subxt's [`LegacyRpcMethods`] and implements [`Upstream`], the
//! read-only view of the live chain a fork is built on. Only the calls a fork needs are
//! exposed, and subxt's generic errors are mapped to [`RpcClientError`] with the failing
//! method attached.
//!
//! # Why Legacy RPCs?
//!
//! Legacy RPCs (`state_*`, `chain_*`) work with every Polkadot SDK node and follow a plain
//! request/response pattern. The newer `chainHead_v1_*` and `archive_v1_*` specifications
//! need follow/unfollow and pin/unpin bookkeeping, which buys nothing when every query is
//! already pinned to an explicit block hash.

use crate::{
	Header,
	error::rpc::RpcClientError,
	strings::rpc::methods,
	upstream::{SystemProperties, Upstream},
};
use async_trait::async_trait;
use subxt::{
	SubstrateConfig,
	backend::{legacy::LegacyRpcMethods, rpc::RpcClient},
	config::substrate::H256,
};
use url::Url;

/// RPC client wrapper for fork operations.
///
/// Wraps subxt's [`LegacyRpcMethods`] to provide a focused API for fetching state
/// from live Polkadot-SDK chains. See the module-level documentation for why this
/// wrapper exists rather than using `LegacyRpcMethods` directly.
///
/// # Example
///
/// ```ignore
/// use pop_fork_core::{ForkRpcClient, Upstream};
///
/// let client = ForkRpcClient::connect(&"wss://rpc.polkadot.io".parse()?).await?;
/// let block_hash = client.finalized_head().await?;
/// let metadata = client.metadata(block_hash).await?;
/// let storage_value = client.storage(&key, block_hash).await?;
/// ```
#[derive(Clone, Debug)]
pub struct ForkRpcClient {
	legacy: LegacyRpcMethods<SubstrateConfig>,
	endpoint: Url,
}

impl ForkRpcClient {
	/// Connect to a live Polkadot-SDK chain.
	///
	/// # Arguments
	/// * `endpoint` - WebSocket URL of the chain's RPC endpoint (e.g., `wss://rpc.polkadot.io`)
	///
	/// # Example
	/// ```ignore
	/// let client = ForkRpcClient::connect(&"wss://rpc.polkadot.io".parse()?).await?;
	/// ```
	pub async fn connect(endpoint: &Url) -> Result<Self, RpcClientError> {
		let client = RpcClient::from_url(endpoint.as_str()).await.map_err(|e| {
			RpcClientError::ConnectionFailed {
				endpoint: endpoint.to_string(),
				message: e.to_string(),
			}
		})?;

		let legacy = LegacyRpcMethods::new(client);

		Ok(Self { legacy, endpoint: endpoint.clone() })
	}

	/// Get the endpoint URL this client is connected to.
	pub fn endpoint(&self) -> &Url {
		&self.endpoint
	}
}

#[async_trait]
impl Upstream for ForkRpcClient {
	/// Get block header by hash.
	///
	/// Returns the header for the specified block, which contains the parent hash,
	/// state root, extrinsics root, and digest.
	async fn header(&self, hash: H256) -> Result<Option<Header>, RpcClientError> {
		let header = self.legacy.chain_get_header(Some(hash)).await.map_err(|e| {
			RpcClientError::RequestFailed { method: methods::CHAIN_GET_HEADER, message: e.to_string() }
		})?;
		header
			.map(Header::try_from)
			.transpose()
			.map_err(|e| RpcClientError::InvalidResponse(format!("Undecodable header: {e}")))
	}

	async fn block_body(&self, hash: H256) -> Result<Option<Vec<Vec<u8>>>, RpcClientError> {
		let block = self.legacy.chain_get_block(Some(hash)).await.map_err(|e| {
			RpcClientError::RequestFailed { method: methods::CHAIN_GET_BLOCK, message: e.to_string() }
		})?;
		Ok(block.map(|details| details.block.extrinsics.into_iter().map(|xt| xt.0).collect()))
	}

	/// Get a single storage value at a specific block.
	///
	/// # Arguments
	/// * `key` - The storage key (raw bytes)
	/// * `at` - The block hash to query state at
	///
	/// # Returns
	/// * `Ok(Some(value))` - Storage exists with value
	/// * `Ok(None)` - Storage key doesn't exist (empty)
	/// * `Err(_)` - RPC error
	async fn storage(&self, key: &[u8], at: H256) -> Result<Option<Vec<u8>>, RpcClientError> {
		self.legacy.state_get_storage(key, Some(at)).await.map_err(|e| {
			RpcClientError::RequestFailed {
				method: methods::STATE_GET_STORAGE,
				message: e.to_string(),
			}
		})
	}

	/// Get multiple storage values in a single batch request.
	///
	/// More efficient than multiple individual `storage()` calls when fetching
	/// many keys at once.
	///
	/// # Returns
	/// A vector of optional values, in the same order as the input keys.
	async fn storage_batch(
		&self,
		keys: &[&[u8]],
		at: H256,
	) -> Result<Vec<Option<Vec<u8>>>, RpcClientError> {
		if keys.is_empty() {
			return Ok(vec![]);
		}

		let result = self
			.legacy
			.state_query_storage_at(keys.iter().copied(), Some(at))
			.await
			.map_err(|e| RpcClientError::RequestFailed {
				method: methods::STATE_QUERY_STORAGE_AT,
				message: e.to_string(),
			})?;

		// Build a map of key -> value from the response
		let mut changes: std::collections::HashMap<Vec<u8>, Option<Vec<u8>>> = result
			.into_iter()
			.flat_map(|change_set| {
				change_set.changes.into_iter().map(|(k, v)| {
					let key_bytes = k.0.to_vec();
					let value_bytes = v.map(|v| v.0.to_vec());
					(key_bytes, value_bytes)
				})
			})
			.collect();

		// Return values in the same order as input keys.
		// Use remove() to avoid cloning potentially large storage values.
		// Note: If duplicate keys are passed, only the first occurrence gets the value.
		let values = keys.iter().map(|key| changes.remove(*key).flatten()).collect();

		Ok(values)
	}

	/// Get storage keys matching a prefix, with pagination.
	///
	/// # Arguments
	/// * `prefix` - The storage key prefix to match
	/// * `count` - Maximum number of keys to return
	/// * `start_key` - Optional key to start after (for pagination)
	/// * `at` - The block hash to query state at
	async fn storage_keys_paged(
		&self,
		prefix: &[u8],
		count: u32,
		start_key: Option<&[u8]>,
		at: H256,
	) -> Result<Vec<Vec<u8>>, RpcClientError> {
		self.legacy
			.state_get_keys_paged(prefix, count, start_key, Some(at))
			.await
			.map_err(|e| RpcClientError::RequestFailed {
				method: methods::STATE_GET_KEYS_PAGED,
				message: e.to_string(),
			})
	}

	/// Get runtime metadata at a specific block.
	///
	/// Returns the raw metadata bytes which can be parsed using `subxt::Metadata`.
	async fn metadata(&self, at: H256) -> Result<Vec<u8>, RpcClientError> {
		let metadata = self.legacy.state_get_metadata(Some(at)).await.map_err(|e| {
			RpcClientError::RequestFailed {
				method: methods::STATE_GET_METADATA,
				message: e.to_string(),
			}
		})?;

		Ok(metadata.into_raw())
	}

	/// Get system properties (token decimals, symbols, etc.).
	async fn system_properties(&self) -> Result<SystemProperties, RpcClientError> {
		self.legacy
			.system_properties()
			.await
			.map_err(|e| RpcClientError::RequestFailed {
				method: methods::SYSTEM_PROPERTIES,
				message: e.to_string(),
			})
	}

	async fn block_hash_at(&self, number: u32) -> Result<Option<H256>, RpcClientError> {
		self.legacy.chain_get_block_hash(Some(number.into())).await.map_err(|e| {
			RpcClientError::RequestFailed {
				method: methods::CHAIN_GET_BLOCK_HASH,
				message: e.to_string(),
			}
		})
	}

	/// Get the latest finalized block hash.
	///
	/// This is typically the starting point for forking - we fork from the latest
	/// finalized state to ensure consistency.
	async fn finalized_head(&self) -> Result<H256, RpcClientError> {
		self.legacy
			.chain_get_finalized_head()
			.await
			.map_err(|e| RpcClientError::RequestFailed {
				method: methods::CHAIN_GET_FINALIZED_HEAD,
				message: e.to_string(),
			})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_display_connection_failed() {
		let err = RpcClientError::ConnectionFailed {
			endpoint: "wss://example.com".to_string(),
			message: "connection refused".to_string(),
		};
		assert_eq!(err.to_string(), "Failed to connect to wss://example.com: connection refused");
	}

	#[test]
	fn error_display_request_failed() {
		let err = RpcClientError::RequestFailed {
			method: methods::STATE_GET_STORAGE,
			message: "connection reset".to_string(),
		};
		assert_eq!(
			err.to_string(),
			format!("RPC request `{}` failed: connection reset", methods::STATE_GET_STORAGE)
		);
	}

	#[test]
	fn error_display_invalid_response() {
		let err = RpcClientError::InvalidResponse("missing field".to_string());
		assert_eq!(err.to_string(), "Invalid RPC response: missing field");
	}

	#[test]
	fn request_failures_are_transient() {
		let err = RpcClientError::RequestFailed {
			method: methods::CHAIN_GET_HEADER,
			message: "timeout".to_string(),
		};
		assert_eq!(err.kind(), crate::ErrorKind::TransientIo);
	}

	#[tokio::test]
	async fn connect_to_invalid_endpoint_fails() {
		// Use a port that's unlikely to have anything listening
		let endpoint: Url = "ws://127.0.0.1:19999".parse().unwrap();
		let result = ForkRpcClient::connect(&endpoint).await;

		assert!(result.is_err());
		let err = result.unwrap_err();
		assert!(
			matches!(err, RpcClientError::ConnectionFailed { .. }),
			"Expected ConnectionFailed, got: {err:?}"
		);
	}

	/// Tests against a running node. The endpoint is read from `POP_FORK_TEST_ENDPOINT`
	/// and defaults to a local dev node.
	#[cfg(feature = "integration-tests")]
	mod sequential {
		use super::*;

		/// System pallet prefix: twox128("System")
		const SYSTEM_PALLET_PREFIX: &str = "26aa394eea5630e07c48ae0c9558cef7";

		/// System::Number storage key: twox128("System") ++ twox128("Number")
		const SYSTEM_NUMBER_KEY: &str =
			"26aa394eea5630e07c48ae0c9558cef702a5c1b19ab7a04f536c519aca4983ac";

		async fn client() -> ForkRpcClient {
			let endpoint = std::env::var("POP_FORK_TEST_ENDPOINT")
				.unwrap_or_else(|_| "ws://127.0.0.1:9944".to_string());
			ForkRpcClient::connect(&endpoint.parse().unwrap()).await.unwrap()
		}

		#[tokio::test]
		async fn fetch_header_and_body() {
			let client = client().await;
			let hash = client.finalized_head().await.unwrap();
			let header = client.header(hash).await.unwrap().unwrap();
			assert_eq!(header.hash(), hash);
			assert!(client.block_body(hash).await.unwrap().is_some());
			assert_eq!(client.block_hash_at(header.number).await.unwrap(), Some(hash));
		}

		#[tokio::test]
		async fn fetch_storage() {
			let client = client().await;
			let hash = client.finalized_head().await.unwrap();

			let key = hex::decode(SYSTEM_NUMBER_KEY).unwrap();
			assert!(client.storage(&key, hash).await.unwrap().is_some());
			// Non-existent storage returns None, not an error
			assert!(client.storage(&[0xff; 32], hash).await.unwrap().is_none());
		}

		#[tokio::test]
		async fn fetch_storage_batch_with_mixed_keys() {
			let client = client().await;
			let hash = client.finalized_head().await.unwrap();

			let key = hex::decode(SYSTEM_NUMBER_KEY).unwrap();
			let missing = vec![0xff; 32];
			let values = client.storage_batch(&[key.as_slice(), missing.as_slice()], hash).await.unwrap();

			assert_eq!(values.len(), 2);
			assert!(values[0].is_some(), "System::Number should exist");
			assert!(values[1].is_none(), "Fabricated key should not exist");
			assert!(client.storage_batch(&[], hash).await.unwrap().is_empty());
		}

		#[tokio::test]
		async fn fetch_storage_keys_paged() {
			let client = client().await;
			let hash = client.finalized_head().await.unwrap();

			let prefix = hex::decode(SYSTEM_PALLET_PREFIX).unwrap();
			let keys = client.storage_keys_paged(&prefix, 10, None, hash).await.unwrap();

			assert!(!keys.is_empty());
			for key in &keys {
				assert!(key.starts_with(&prefix));
			}
		}

		#[tokio::test]
		async fn fetch_metadata_and_properties() {
			let client = client().await;
			let hash = client.finalized_head().await.unwrap();
			assert!(client.metadata(hash).await.unwrap().len() > 1000);
			let _properties = client.system_properties().await.unwrap();
		}

		#[tokio::test]
		async fn fetch_header_non_existent_block_returns_none() {
			let client = client().await;
			let header = client.header(H256::from([0xde; 32])).await.unwrap();
			assert!(header.is_none());
		}
	}
}
