// SPDX-License-Identifier: GPL-3.0

use super::{ErrorKind, RpcClientError};
use thiserror::Error;

/// Errors that can occur when decoding or querying runtime metadata.
#[derive(Debug, Error)]
pub enum MetadataError {
	/// Metadata could not be fetched from the upstream node.
	#[error("RPC error: {0}")]
	Rpc(#[from] RpcClientError),
	/// The runtime returned bytes that are not valid metadata.
	#[error("Failed to decode metadata: {0}")]
	Decode(String),
	/// No pallet with this name exists in the metadata.
	#[error("Pallet not found: {0}")]
	PalletNotFound(String),
	/// The pallet declares no storage.
	#[error("Pallet {0} has no storage")]
	NoStorage(String),
	/// The pallet has no storage entry with this name.
	#[error("Storage entry not found: {pallet}::{entry}")]
	StorageEntryNotFound {
		/// Name of the pallet.
		pallet: String,
		/// Name of the missing entry.
		entry: String,
	},
}

impl MetadataError {
	/// Classify this error.
	pub fn kind(&self) -> ErrorKind {
		match self {
			MetadataError::Rpc(e) => e.kind(),
			MetadataError::Decode(_) => ErrorKind::Internal,
			MetadataError::PalletNotFound(_) |
			MetadataError::NoStorage(_) |
			MetadataError::StorageEntryNotFound { .. } => ErrorKind::NotFound,
		}
	}
}
