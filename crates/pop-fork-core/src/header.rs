// SPDX-License-Identifier: GPL-3.0

//! Block header types.
//!
//! Headers are kept in their SCALE shape so that the hash of a header is always the
//! `blake2_256` of exactly the bytes a node would produce for it.

use scale::{Decode, Encode};
use sp_core::hashing::blake2_256;
use subxt::config::substrate::{DynamicHasher256, H256, SubstrateHeader};

/// Consensus engine identifier (4-byte ASCII).
///
/// Common identifiers:
/// - `*b"aura"` - Aura consensus
/// - `*b"BABE"` - Babe consensus
/// - `*b"FRNK"` - GRANDPA finality
pub type ConsensusEngineId = [u8; 4];

/// Well-known consensus engine identifiers.
pub mod consensus_engine {
	use super::ConsensusEngineId;

	/// Aura consensus engine identifier.
	pub const AURA: ConsensusEngineId = *b"aura";

	/// Babe consensus engine identifier.
	pub const BABE: ConsensusEngineId = *b"BABE";

	/// GRANDPA finality engine identifier.
	pub const GRANDPA: ConsensusEngineId = *b"FRNK";
}

/// Digest item for block headers.
///
/// Digest items contain consensus-related information that is included
/// in the block header but not part of the main block body.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum DigestItem {
	/// An "other" digest item.
	///
	/// For runtime-specific data that doesn't fit other categories.
	#[codec(index = 0)]
	Other(Vec<u8>),

	/// A consensus digest item.
	///
	/// These are produced during block execution for consensus-related data.
	#[codec(index = 4)]
	Consensus(ConsensusEngineId, Vec<u8>),

	/// A seal digest item.
	///
	/// These are added after block execution, typically containing signatures.
	#[codec(index = 5)]
	Seal(ConsensusEngineId, Vec<u8>),

	/// A pre-runtime digest item.
	///
	/// These are produced by the consensus engine before block execution.
	/// Common uses include slot numbers for Aura/Babe.
	#[codec(index = 6)]
	PreRuntime(ConsensusEngineId, Vec<u8>),

	/// Signals that the runtime code or heap pages changed in this block.
	#[codec(index = 8)]
	RuntimeEnvironmentUpdated,
}

/// A block header.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Header {
	/// Hash of the parent block.
	pub parent_hash: H256,
	/// Block number.
	#[codec(compact)]
	pub number: u32,
	/// Root of the state trie after this block.
	pub state_root: H256,
	/// Root of the extrinsics trie of this block.
	pub extrinsics_root: H256,
	/// Digest items.
	pub digest: Vec<DigestItem>,
}

impl Header {
	/// Create a header for the block following `parent_hash` at `parent_number`.
	///
	/// `state_root` and `extrinsics_root` are left zeroed; they are filled in by the runtime
	/// when the block is finalized.
	///
	/// # Arguments
	///
	/// * `parent_hash` - Hash of the parent block
	/// * `parent_number` - Number of the parent block
	/// * `digest` - Digest items to include (e.g., slot information)
	pub fn next(parent_hash: H256, parent_number: u32, digest: Vec<DigestItem>) -> Self {
		Self {
			parent_hash,
			number: parent_number.saturating_add(1),
			state_root: H256::zero(),
			extrinsics_root: H256::zero(),
			digest,
		}
	}

	/// The block hash: `blake2_256` of the SCALE-encoded header.
	pub fn hash(&self) -> H256 {
		H256::from(blake2_256(&self.encode()))
	}
}

impl TryFrom<SubstrateHeader<u32, DynamicHasher256>> for Header {
	type Error = scale::Error;

	fn try_from(header: SubstrateHeader<u32, DynamicHasher256>) -> Result<Self, Self::Error> {
		Header::decode(&mut header.encode().as_slice())
	}
}
