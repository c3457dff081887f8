// SPDX-License-Identifier: GPL-3.0

use super::{BlockError, ErrorKind, RpcClientError, StorageError};
use subxt::config::substrate::H256;
use thiserror::Error;

/// Errors that can occur when working with the chain index.
#[derive(Debug, Error)]
pub enum BlockchainError {
	/// Block materialization failed.
	#[error("Block error: {0}")]
	Block(#[from] BlockError),

	/// RPC error while resolving blocks upstream.
	#[error("RPC error: {0}")]
	Rpc(#[from] RpcClientError),

	/// Storage error while building block state.
	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),

	/// Block not found at the specified hash.
	#[error("Block not found: {0:?}")]
	BlockHashNotFound(H256),

	/// Block not found at the specified height.
	#[error("Block not found at height {0}")]
	BlockNumberNotFound(u32),

	/// The parent of a new block is not known to the index.
	#[error("Parent block not found: {0:?}")]
	ParentNotFound(H256),

	/// The header names another block as its parent.
	#[error("Header parent {found:?} does not match {expected:?}")]
	ParentHashMismatch {
		/// The parent the block was submitted under.
		expected: H256,
		/// The parent hash found in the header.
		found: H256,
	},

	/// The header's number does not follow its parent's.
	#[error("Block #{number} cannot follow parent #{parent}")]
	NonConsecutiveBlock {
		/// Number of the parent block.
		parent: u32,
		/// Number found in the new header.
		number: u32,
	},

	/// The block log failed to read or write.
	#[error("Block log error: {0}")]
	BlockLog(String),
}

impl BlockchainError {
	/// Classify this error.
	pub fn kind(&self) -> ErrorKind {
		match self {
			BlockchainError::Block(e) => e.kind(),
			BlockchainError::Rpc(e) => e.kind(),
			BlockchainError::Storage(e) => e.kind(),
			BlockchainError::BlockHashNotFound(_) |
			BlockchainError::BlockNumberNotFound(_) |
			BlockchainError::ParentNotFound(_) => ErrorKind::NotFound,
			BlockchainError::ParentHashMismatch { .. } |
			BlockchainError::NonConsecutiveBlock { .. } => ErrorKind::InvariantViolation,
			BlockchainError::BlockLog(_) => ErrorKind::Internal,
		}
	}
}
