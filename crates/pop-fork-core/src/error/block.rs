// SPDX-License-Identifier: GPL-3.0

use super::{ErrorKind, ExecutorError, MetadataError, RpcClientError, StorageError};
use subxt::config::substrate::H256;
use thiserror::Error;

/// Errors that can occur when working with blocks.
#[derive(Debug, Error)]
pub enum BlockError {
	/// RPC error while fetching block data.
	#[error("RPC error: {0}")]
	Rpc(#[from] RpcClientError),

	/// Storage layer error.
	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),

	/// The execution queue could not run a task.
	#[error("Executor error: {0}")]
	Executor(#[from] ExecutorError),

	/// Metadata could not be decoded or queried.
	#[error("Metadata error: {0}")]
	Metadata(#[from] MetadataError),

	/// The upstream node has no header for this block.
	#[error("Header not found: {0:?}")]
	HeaderNotFound(H256),

	/// Runtime code not found in storage.
	#[error("Runtime code not found in storage")]
	RuntimeCodeNotFound,

	/// The runtime failed the call. No storage change was committed.
	#[error("Runtime call `{method}` failed: {message}")]
	RuntimeCall {
		/// The runtime method that was called.
		method: String,
		/// The message reported by the engine.
		message: String,
	},

	/// Raw block data could not be decoded.
	#[error("Failed to decode {what}: {message}")]
	Decode {
		/// What was being decoded.
		what: &'static str,
		/// The decoder's message.
		message: String,
	},
}

impl BlockError {
	/// Classify this error.
	pub fn kind(&self) -> ErrorKind {
		match self {
			BlockError::Rpc(e) => e.kind(),
			BlockError::Storage(e) => e.kind(),
			BlockError::Executor(e) => e.kind(),
			BlockError::Metadata(e) => e.kind(),
			BlockError::HeaderNotFound(_) | BlockError::RuntimeCodeNotFound => ErrorKind::NotFound,
			BlockError::RuntimeCall { .. } => ErrorKind::RuntimeCallFault,
			BlockError::Decode { .. } => ErrorKind::Internal,
		}
	}
}
