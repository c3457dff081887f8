// SPDX-License-Identifier: GPL-3.0

//! Runtime metadata and the views derived from it.
//!
//! A block's metadata is decoded once into [`ForkMetadata`]; the [`TypeRegistry`] and the
//! [`DecoratedMetadata`] used to build storage keys are derived from it.

use crate::{
	Upstream,
	error::MetadataError,
	strings::rpc::properties,
	upstream::SystemProperties,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sp_core::hashing::{blake2_128, blake2_256, twox_64, twox_128, twox_256};
use subxt::{Metadata, config::substrate::H256, ext::codec::Decode};

/// Wrapper around [`Metadata`] for forking specific operations
#[derive(Debug, Clone)]
pub struct ForkMetadata(Metadata);

impl ForkMetadata {
	/// Fetch and decode the metadata the upstream node reports at `at`.
	///
	/// # Arguments
	/// - upstream - The remote chain
	/// - at - Block hash to read the metadata at
	pub async fn from_upstream(upstream: &dyn Upstream, at: H256) -> Result<Self, MetadataError> {
		let metadata_bytes = upstream.metadata(at).await?;
		Self::try_from(metadata_bytes)
	}

	/// The decoded metadata.
	pub fn inner(&self) -> &Metadata {
		&self.0
	}

	/// Names of all pallets, in declaration order.
	pub fn pallet_names(&self) -> Vec<&str> {
		self.0.pallets().map(|pallet| pallet.name()).collect()
	}

	/// The type registry of this metadata, for a chain with the given properties.
	pub fn registry(&self, properties: ChainProperties) -> TypeRegistry {
		TypeRegistry { metadata: self.0.clone(), properties }
	}

	/// The storage-key view of this metadata.
	pub fn decorate(&self) -> DecoratedMetadata {
		DecoratedMetadata(self.0.clone())
	}
}

impl TryFrom<&[u8]> for ForkMetadata {
	type Error = MetadataError;

	fn try_from(mut bytes: &[u8]) -> Result<Self, Self::Error> {
		let metadata =
			Metadata::decode(&mut bytes).map_err(|e| MetadataError::Decode(e.to_string()))?;
		Ok(Self(metadata))
	}
}

impl TryFrom<Vec<u8>> for ForkMetadata {
	type Error = MetadataError;

	fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
		Self::try_from(bytes.as_slice())
	}
}

/// The portable type registry carried by the metadata, together with the chain
/// properties needed to render addresses and balances.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
	metadata: Metadata,
	properties: ChainProperties,
}

impl TypeRegistry {
	/// Number of registered types.
	pub fn len(&self) -> usize {
		self.metadata.types().types.len()
	}

	/// Properties of the chain the registry belongs to.
	pub fn properties(&self) -> &ChainProperties {
		&self.properties
	}

	/// Whether the registry holds no types.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// The `::`-joined path of type `id`, e.g. `frame_system::AccountInfo`.
	///
	/// `None` if the id is unknown; an empty string for types without a path.
	pub fn type_path(&self, id: u32) -> Option<String> {
		self.metadata.types().resolve(id).map(|ty| ty.path.segments.join("::"))
	}
}

/// Metadata decorated for building storage keys.
#[derive(Debug, Clone)]
pub struct DecoratedMetadata(Metadata);

impl DecoratedMetadata {
	/// The index of a pallet, as used in call and event encoding.
	pub fn pallet_index(&self, pallet: &str) -> Result<u8, MetadataError> {
		self.0
			.pallet_by_name(pallet)
			.map(|p| p.index())
			.ok_or_else(|| MetadataError::PalletNotFound(pallet.to_string()))
	}

	/// Build the storage key of `pallet::entry` for the given map keys.
	///
	/// # Arguments
	/// * `pallet` - Pallet name, e.g. `System`
	/// * `entry` - Storage entry name, e.g. `Account`
	/// * `keys` - One `(hasher, encoded key)` pair per map key; empty for plain values
	pub fn storage_key(
		&self,
		pallet: &str,
		entry: &str,
		keys: &[(StorageHasher, &[u8])],
	) -> Result<Vec<u8>, MetadataError> {
		let pallet_metadata = self
			.0
			.pallet_by_name(pallet)
			.ok_or_else(|| MetadataError::PalletNotFound(pallet.to_string()))?;
		let storage = pallet_metadata
			.storage()
			.ok_or_else(|| MetadataError::NoStorage(pallet.to_string()))?;
		let entry_metadata = storage.entry_by_name(entry).ok_or_else(|| {
			MetadataError::StorageEntryNotFound { pallet: pallet.to_string(), entry: entry.to_string() }
		})?;

		let mut key = storage_prefix(storage.prefix(), entry_metadata.name());
		for (hasher, data) in keys {
			key.extend(hasher.hash(data));
		}
		Ok(key)
	}

	/// The `(pallet, entry)` a raw storage key belongs to.
	///
	/// `None` for keys outside every declared storage entry, such as `:code`.
	pub fn decode_key(&self, key: &[u8]) -> Option<(&str, &str)> {
		let entries = self.0.pallets().flat_map(|pallet| {
			let name = pallet.name();
			pallet.storage().into_iter().flat_map(move |storage| {
				storage.entries().iter().map(move |entry| (name, storage.prefix(), entry.name()))
			})
		});
		find_entry(entries, key)
	}
}

/// The entry whose prefix starts `key`. Entry prefixes all have the same length, so at
/// most one matches.
///
/// `entries` holds `(pallet name, pallet storage prefix, entry name)`.
fn find_entry<'a>(
	entries: impl IntoIterator<Item = (&'a str, &'a str, &'a str)>,
	key: &[u8],
) -> Option<(&'a str, &'a str)> {
	entries
		.into_iter()
		.find(|(_, prefix, entry)| key.starts_with(&storage_prefix(prefix, entry)))
		.map(|(pallet, _, entry)| (pallet, entry))
}

/// `twox_128(pallet_prefix) ++ twox_128(entry)`, the prefix of every key of an entry.
pub fn storage_prefix(pallet_prefix: &str, entry: &str) -> Vec<u8> {
	[twox_128(pallet_prefix.as_bytes()), twox_128(entry.as_bytes())].concat()
}

/// Hashers applied to storage map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageHasher {
	/// 128-bit Blake2.
	Blake2_128,
	/// 256-bit Blake2.
	Blake2_256,
	/// 128-bit Blake2 followed by the raw key.
	Blake2_128Concat,
	/// 128-bit xxHash.
	Twox128,
	/// 256-bit xxHash.
	Twox256,
	/// 64-bit xxHash followed by the raw key.
	Twox64Concat,
	/// The raw key.
	Identity,
}

impl StorageHasher {
	/// Hash an encoded key.
	pub fn hash(&self, data: &[u8]) -> Vec<u8> {
		match self {
			StorageHasher::Blake2_128 => blake2_128(data).to_vec(),
			StorageHasher::Blake2_256 => blake2_256(data).to_vec(),
			StorageHasher::Blake2_128Concat => [&blake2_128(data)[..], data].concat(),
			StorageHasher::Twox128 => twox_128(data).to_vec(),
			StorageHasher::Twox256 => twox_256(data).to_vec(),
			StorageHasher::Twox64Concat => [&twox_64(data)[..], data].concat(),
			StorageHasher::Identity => data.to_vec(),
		}
	}
}

/// Token and address settings of a chain, from `system_properties`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainProperties {
	/// SS58 address prefix.
	pub ss58_format: u16,
	/// Decimals of each token.
	pub token_decimals: Vec<u8>,
	/// Symbol of each token.
	pub token_symbols: Vec<String>,
}

impl Default for ChainProperties {
	fn default() -> Self {
		Self { ss58_format: 42, token_decimals: vec![], token_symbols: vec![] }
	}
}

impl From<&SystemProperties> for ChainProperties {
	/// Scalar and list forms are both accepted; missing or malformed fields fall back to
	/// the defaults.
	fn from(props: &SystemProperties) -> Self {
		fn list(value: Option<&Value>) -> Vec<&Value> {
			match value {
				Some(Value::Array(items)) => items.iter().collect(),
				Some(Value::Null) | None => vec![],
				Some(other) => vec![other],
			}
		}

		let ss58_format = props
			.get(properties::SS58_FORMAT)
			.and_then(Value::as_u64)
			.and_then(|v| u16::try_from(v).ok())
			.unwrap_or(42);
		let token_decimals = list(props.get(properties::TOKEN_DECIMALS))
			.into_iter()
			.filter_map(|v| v.as_u64().and_then(|d| u8::try_from(d).ok()))
			.collect();
		let token_symbols = list(props.get(properties::TOKEN_SYMBOL))
			.into_iter()
			.filter_map(|v| v.as_str().map(str::to_string))
			.collect();

		Self { ss58_format, token_decimals, token_symbols }
	}
}
