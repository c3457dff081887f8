// SPDX-License-Identifier: GPL-3.0

//! Storage layer error types.

use super::{CacheError, ErrorKind, RpcClientError};
use thiserror::Error;

/// Errors that can occur when reading or writing through a storage layer stack.
#[derive(Debug, Error)]
pub enum StorageError {
	/// RPC error while fetching from the upstream node.
	#[error("RPC error: {0}")]
	Rpc(#[from] RpcClientError),
	/// Cache error.
	#[error("Cache error: {0}")]
	Cache(#[from] CacheError),
	/// `fold` was called while no overlay layer was pushed.
	#[error("No overlay layer to fold")]
	NothingToFold,
}

impl StorageError {
	/// Classify this error.
	pub fn kind(&self) -> ErrorKind {
		match self {
			StorageError::Rpc(e) => e.kind(),
			StorageError::Cache(e) => e.kind(),
			StorageError::NothingToFold => ErrorKind::InvariantViolation,
		}
	}
}
