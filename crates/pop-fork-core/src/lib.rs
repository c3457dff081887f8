// SPDX-License-Identifier: GPL-3.0

//! Core of local forks of live Polkadot SDK chains.
//!
//! This crate virtualizes the state of a live chain: blocks are materialized lazily from
//! a remote node, their storage is copy-on-write, and every call into the runtime goes
//! through a single-flight execution queue.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Blockchain                              │
//! │        fork point, head, number/hash index, block log           │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Block                                 │
//! │   header, extrinsics, code ──► runtime version, metadata        │
//! └─────────────────────────────────────────────────────────────────┘
//!                 │                                 │
//!                 ▼                                 ▼
//! ┌───────────────────────────────┐  ┌──────────────────────────────┐
//! │        StorageStack           │  │       ExecutionQueue         │
//! │  ┌─────────┐  ┌────────────┐  │  │  FIFO ──► worker thread      │
//! │  │ layers  │─▶│  provider  │  │◄─┤  (RuntimeEngine)             │
//! │  └─────────┘  └─────┬──────┘  │  │  storage reads served from   │
//! │                     │         │  │  the submitting block        │
//! └─────────────────────┼─────────┘  └──────────────────────────────┘
//!                       ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │            Upstream (live RPC) + StorageCache                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod block;
mod blockchain;
mod cache;
pub mod error;
pub mod executor;
mod header;
pub mod metadata;
mod rpc;
pub mod storage;
mod strings;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod upstream;

pub use block::{Block, BlockIndex, StorageChange};
pub use blockchain::{
	BlockLog, Blockchain, BlockchainEvent, ForkPoint, MemoryBlockLog, PersistedBlock,
};
pub use cache::StorageCache;
pub use error::{
	BlockError, BlockchainError, CacheError, ErrorKind, ExecutorError, MetadataError,
	RpcClientError, StorageError,
};
pub use executor::{
	ExecutionQueue, ExecutionTask, ExecutorConfig, RuntimeCallResult, RuntimeEngine,
	RuntimeVersion, SignatureMockMode, smoldot_engine_factory,
};
pub use header::{DigestItem, Header};
pub use metadata::{ChainProperties, DecoratedMetadata, ForkMetadata, StorageHasher, TypeRegistry};
pub use rpc::ForkRpcClient;
pub use storage::{StorageDiff, StorageLayer, StorageStack, StorageValue};
pub use upstream::{SystemProperties, Upstream};
