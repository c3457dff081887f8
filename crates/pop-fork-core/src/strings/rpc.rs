// SPDX-License-Identifier: GPL-3.0

//! String constants for the RPC client module.

/// JSON-RPC method names used for error reporting.
///
/// These match the actual RPC method names in the Polkadot SDK JSON-RPC specification.
pub mod methods {
	pub const CHAIN_GET_BLOCK: &str = "chain_getBlock";
	pub const CHAIN_GET_BLOCK_HASH: &str = "chain_getBlockHash";
	pub const CHAIN_GET_FINALIZED_HEAD: &str = "chain_getFinalisedHead";
	pub const CHAIN_GET_HEADER: &str = "chain_getHeader";
	pub const STATE_GET_STORAGE: &str = "state_getStorage";
	pub const STATE_QUERY_STORAGE_AT: &str = "state_queryStorageAt";
	pub const STATE_GET_KEYS_PAGED: &str = "state_getKeysPaged";
	pub const STATE_GET_METADATA: &str = "state_getMetadata";
	pub const SYSTEM_PROPERTIES: &str = "system_properties";
}

/// Keys of the `system_properties` response.
pub mod properties {
	pub const SS58_FORMAT: &str = "ss58Format";
	pub const TOKEN_DECIMALS: &str = "tokenDecimals";
	pub const TOKEN_SYMBOL: &str = "tokenSymbol";
}
