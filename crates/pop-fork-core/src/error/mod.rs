// SPDX-License-Identifier: GPL-3.0

//! Error types for fork operations.
//!
//! This module contains all error types used throughout the `pop-fork-core` crate,
//! organized by context:
//!
//! - [`block::BlockError`] - Errors from block materialization and runtime calls.
//! - [`blockchain::BlockchainError`] - Errors from the chain index.
//! - [`cache::CacheError`] - Errors from the in-memory storage cache.
//! - [`executor::ExecutorError`] - Errors from the execution queue and runtime engine.
//! - [`metadata::MetadataError`] - Errors from decoding and querying runtime metadata.
//! - [`rpc::RpcClientError`] - Errors from RPC client operations.
//! - [`storage::StorageError`] - Errors from the storage layer stack and its providers.
//!
//! Every error can be classified with `kind()`, which callers use to decide whether an
//! operation is worth retrying or must be surfaced as-is.

pub mod block;
pub mod blockchain;
pub mod cache;
pub mod executor;
pub mod metadata;
pub mod rpc;
pub mod storage;

pub use block::BlockError;
pub use blockchain::BlockchainError;
pub use cache::CacheError;
pub use executor::ExecutorError;
pub use metadata::MetadataError;
pub use rpc::RpcClientError;
pub use storage::StorageError;

/// Coarse classification of every error produced by this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
	/// The upstream node could not be reached or failed to answer. Retrying may succeed.
	TransientIo,
	/// The requested block, key, pallet or entry does not exist.
	NotFound,
	/// The runtime rejected or failed a call. Nothing was committed.
	RuntimeCallFault,
	/// An internal invariant was broken (e.g. folding an empty stack, non-consecutive log).
	InvariantViolation,
	/// Anything else: decoding failures, lost workers, poisoned locks.
	Internal,
}
