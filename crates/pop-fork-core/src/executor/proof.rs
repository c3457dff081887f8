// SPDX-License-Identifier: GPL-3.0

//! Merkle trie proof manipulation.
//!
//! Used by parachain forks to rewrite the relay chain state proof carried by the
//! validation data inherent: decode the proof, apply updates, and re-encode a proof of the
//! updated trie with its new root.

use crate::error::ExecutorError;
use log::{debug, trace};
use scale::Encode;
use smoldot::trie::{
	Nibble, all_nibbles, bytes_to_nibbles, nibbles_to_bytes_suffix_extend,
	proof_decode::{self, StorageValue},
	proof_encode::ProofBuilder,
	trie_node, trie_structure,
};
use std::collections::BTreeMap;

/// Merkle value placeholder for children; `make_coherent` computes the real ones.
const EMPTY: &[u8] = &[];

fn proof_error(message: impl Into<String>) -> ExecutorError {
	ExecutorError::Proof { message: message.into() }
}

fn decode(nodes: &[Vec<u8>]) -> Result<proof_decode::DecodedTrieProof<Vec<u8>>, ExecutorError> {
	let config = proof_decode::Config::<Vec<u8>> { proof: nodes.encode() };
	proof_decode::decode_and_verify_proof(config).map_err(|e| proof_error(e.to_string()))
}

/// Decode a merkle proof and return all entries of the trie rooted at `trie_root_hash`.
///
/// Entries whose value is not part of the proof are skipped.
pub(crate) fn decode_proof(
	trie_root_hash: &[u8; 32],
	nodes: &[Vec<u8>],
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ExecutorError> {
	if nodes.is_empty() {
		return Ok(vec![]);
	}
	let decoded = decode(nodes)?;

	let mut entries = BTreeMap::new();
	for (key, entry) in decoded.iter_ordered() {
		if *key.trie_root_hash != *trie_root_hash {
			continue;
		}
		if let StorageValue::Known { value, .. } = entry.trie_node_info.storage_value {
			let key_bytes: Vec<u8> = nibbles_to_bytes_suffix_extend(key.key).collect();
			entries.insert(key_bytes, value.to_vec());
		}
	}

	Ok(entries.into_iter().collect())
}

/// Apply `updates` to the trie described by `nodes` and build a proof of the result.
///
/// Updates are inserted first. Inline entries of the original proof are then copied when
/// not overridden; hashed values cannot be re-encoded and are dropped. Values are always
/// encoded unhashed.
///
/// # Returns
///
/// A tuple of (new_root_hash, new_proof_nodes).
pub(crate) fn create_proof(
	nodes: &[Vec<u8>],
	updates: Vec<(Vec<u8>, Option<Vec<u8>>)>,
) -> Result<([u8; 32], Vec<Vec<u8>>), ExecutorError> {
	let updates: BTreeMap<Vec<u8>, Option<Vec<u8>>> = updates.into_iter().collect();
	let mut trie = trie_structure::TrieStructure::<Vec<u8>>::new();
	let mut deletes: Vec<Vec<u8>> = vec![];

	for (key, value) in updates {
		match value {
			Some(value) => {
				if let trie_structure::Entry::Vacant(vacant) =
					trie.node(bytes_to_nibbles(key.iter().copied()))
				{
					vacant.insert_storage_value().insert(value, vec![]);
				}
			},
			None => deletes.push(key),
		}
	}

	if !nodes.is_empty() {
		let decoded = decode(nodes)?;
		let (mut copied, mut skipped) = (0usize, 0usize);
		for (entry_key, entry) in decoded.iter_ordered() {
			let key_nibbles: Vec<Nibble> = entry_key.key.collect();
			let trie_structure::Entry::Vacant(vacant) = trie.node(key_nibbles.into_iter()) else {
				continue;
			};
			match entry.trie_node_info.storage_value {
				StorageValue::Known { value, inline: true } => {
					vacant.insert_storage_value().insert(value.to_vec(), vec![]);
					copied += 1;
				},
				StorageValue::Known { inline: false, .. } | StorageValue::HashKnownValueMissing(_) =>
					skipped += 1,
				StorageValue::None => {},
			}
		}
		debug!("Copied {copied} proof entries, skipped {skipped} hashed or incomplete");
	}

	for key in deletes {
		if let trie_structure::Entry::Occupied(occupied) =
			trie.node(bytes_to_nibbles(key.iter().copied()))
		{
			if let Some(storage) = occupied.into_storage() {
				storage.remove();
			}
		}
	}

	let missing = || proof_error("trie node vanished while encoding");
	let mut proof_builder = ProofBuilder::new();
	for node_index in trie.clone().iter_unordered() {
		let key: Vec<Nibble> = trie.node_full_key_by_index(node_index).ok_or_else(missing)?.collect();
		let mut node = trie.node_by_index(node_index).ok_or_else(missing)?;

		let mut children: [Option<&[u8]>; 16] = [None; 16];
		for (slot, nibble) in children.iter_mut().zip(all_nibbles()) {
			if node.child_user_data(nibble).is_some() {
				*slot = Some(EMPTY);
			}
		}
		let partial_key: Vec<Nibble> = node.partial_key().collect();
		let storage_value = node.into_storage().map(|mut storage| storage.user_data().clone());

		let decoded_node = trie_node::Decoded {
			children,
			partial_key: partial_key.into_iter(),
			storage_value: match &storage_value {
				Some(value) => trie_node::StorageValue::Unhashed(&value[..]),
				None => trie_node::StorageValue::None,
			},
		};
		let node_value = trie_node::encode_to_vec(decoded_node)
			.map_err(|e| proof_error(format!("Failed to encode node: {e:?}")))?;

		proof_builder.set_node_value(&key, &node_value, None);
	}

	if proof_builder.missing_node_values().next().is_some() {
		return Err(proof_error("Proof has missing node values"));
	}

	proof_builder.make_coherent();
	let trie_root_hash = proof_builder
		.trie_root_hash()
		.ok_or_else(|| proof_error("Failed to compute trie root hash"))?;

	// `build` yields the node count followed by alternating lengths and nodes.
	let new_nodes: Vec<Vec<u8>> = proof_builder
		.build()
		.skip(1)
		.enumerate()
		.filter(|(i, _)| i % 2 != 0)
		.map(|(_, chunk)| chunk.as_ref().to_vec())
		.collect();

	trace!(
		"Built proof with root 0x{}: {} nodes, {} bytes",
		hex::encode(trie_root_hash),
		new_nodes.len(),
		new_nodes.iter().map(|n| n.len()).sum::<usize>()
	);

	Ok((trie_root_hash, new_nodes))
}
