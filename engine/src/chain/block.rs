// Copyright 2025 Palisade Network Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! The block forming the main chain. The body is consensus-agnostic;
//! weight, entropy and the miner signature carry the consensus-specific
//! parts. Bookkeeping metadata (total weight, looseness, chain label)
//! is neither serialized nor hashed.

use palisade_primitives::{
	codec::{CodecError, WireReader, WireWriter},
	sha256, Address, Digest, Identity,
};
use palisade_beacon::BlockEntropy;
use serde::{Deserialize, Serialize};

/// Hash every chain walk terminates on.
pub const GENESIS_DIGEST: Digest = Digest(*b"palisade genesis digest.........");

/// Merkle root the storage engine starts from.
pub const GENESIS_MERKLE_ROOT: Digest = Digest(*b"palisade genesis merkle root....");

/// Layout of a single transaction as provided by the block packer.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionLayout {
	pub digest: Digest,
	pub charge: u64,
}

pub type Slice = Vec<TransactionLayout>;
pub type Slices = Vec<Slice>;

mod field_id {
	pub const WEIGHT: u8 = 1;
	pub const TOTAL_WEIGHT: u8 = 2;
	pub const MINER_SIGNATURE: u8 = 3;
	pub const HASH: u8 = 4;
	pub const PREVIOUS_HASH: u8 = 5;
	pub const MERKLE_HASH: u8 = 6;
	pub const BLOCK_NUMBER: u8 = 7;
	pub const MINER_ID: u8 = 8;
	pub const LOG2_NUM_LANES: u8 = 9;
	pub const SLICES: u8 = 10;
	pub const DAG_EPOCH: u8 = 11;
	pub const TIMESTAMP: u8 = 12;
	pub const BLOCK_ENTROPY: u8 = 13;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
	/// Hash of the previous block.
	pub previous_hash: Digest,
	/// Merkle state hash across all shards.
	pub merkle_hash: Digest,
	/// Height from genesis.
	pub block_number: u64,
	/// Identity of the miner that generated the block.
	pub miner_id: Identity,
	/// log2 of the number of lanes.
	pub log2_num_lanes: u32,
	/// The slice lists.
	pub slices: Slices,
	/// Opaque DAG epoch marker, kept for wire compatibility.
	pub dag_epoch: u64,
	/// Seconds since the unix epoch.
	pub timestamp: u64,
	/// Entropy determining miner priority for the next block.
	pub block_entropy: BlockEntropy,
	/// Block weight (rank of the miner within qual).
	pub weight: u64,

	/// Hash over the body fields above.
	pub hash: Digest,
	/// Miner's signature over `hash`.
	pub miner_signature: Vec<u8>,

	/// Cumulative weight from genesis. Metadata: not hashed, not on the
	/// wire.
	#[serde(skip)]
	pub total_weight: u64,
	/// Whether the parent is currently unknown. Metadata.
	#[serde(skip)]
	pub is_loose: bool,
	/// Label of the heaviest chain this block once belonged to.
	/// Metadata.
	#[serde(skip)]
	pub chain_label: u64,
}

impl Default for Block {
	fn default() -> Self {
		Block {
			previous_hash: Digest::EMPTY,
			merkle_hash: Digest::EMPTY,
			block_number: 0,
			miner_id: Identity::from_address(Address([0u8; palisade_primitives::ADDRESS_LEN])),
			log2_num_lanes: 0,
			slices: Vec::new(),
			dag_epoch: 0,
			timestamp: 0,
			block_entropy: BlockEntropy::default(),
			weight: 1,
			hash: Digest::EMPTY,
			miner_signature: Vec::new(),
			total_weight: 1,
			is_loose: false,
			chain_label: 0,
		}
	}
}

impl Block {
	/// The genesis block, identical on every node.
	pub fn genesis() -> Block {
		let mut genesis = Block {
			previous_hash: GENESIS_DIGEST,
			merkle_hash: GENESIS_MERKLE_ROOT,
			..Block::default()
		};
		genesis.update_digest();
		genesis
	}

	pub fn is_genesis(&self) -> bool {
		self.block_number == 0
	}

	pub fn transaction_count(&self) -> usize {
		self.slices.iter().map(Vec::len).sum()
	}

	/// Serialization the hash commits to: every body field, none of the
	/// metadata, and neither the hash nor the signature over it.
	fn hashable_wire(&self) -> Vec<u8> {
		WireWriter::new()
			.field(field_id::WEIGHT, &self.weight)
			.field(field_id::PREVIOUS_HASH, &self.previous_hash)
			.field(field_id::MERKLE_HASH, &self.merkle_hash)
			.field(field_id::BLOCK_NUMBER, &self.block_number)
			.field(field_id::MINER_ID, &self.miner_id)
			.field(field_id::LOG2_NUM_LANES, &self.log2_num_lanes)
			.field(field_id::SLICES, &self.slices)
			.field(field_id::DAG_EPOCH, &self.dag_epoch)
			.field(field_id::TIMESTAMP, &self.timestamp)
			.field(field_id::BLOCK_ENTROPY, &self.block_entropy.to_wire())
			.finish()
	}

	/// Recompute `hash` from the current body fields.
	pub fn update_digest(&mut self) {
		self.hash = sha256(self.hashable_wire());
	}

	/// True when the stored hash matches the body.
	pub fn digest_matches(&self) -> bool {
		self.hash == sha256(self.hashable_wire())
	}

	pub fn verify_miner_signature(&self) -> bool {
		!self.hash.is_empty() &&
			self.miner_id.verify(self.hash.as_bytes(), &self.miner_signature)
	}

	/// Deterministic full wire encoding, field ids ascending.
	pub fn to_wire(&self) -> Vec<u8> {
		WireWriter::new()
			.field(field_id::WEIGHT, &self.weight)
			.field(field_id::TOTAL_WEIGHT, &self.total_weight)
			.field(field_id::MINER_SIGNATURE, &self.miner_signature)
			.field(field_id::HASH, &self.hash)
			.field(field_id::PREVIOUS_HASH, &self.previous_hash)
			.field(field_id::MERKLE_HASH, &self.merkle_hash)
			.field(field_id::BLOCK_NUMBER, &self.block_number)
			.field(field_id::MINER_ID, &self.miner_id)
			.field(field_id::LOG2_NUM_LANES, &self.log2_num_lanes)
			.field(field_id::SLICES, &self.slices)
			.field(field_id::DAG_EPOCH, &self.dag_epoch)
			.field(field_id::TIMESTAMP, &self.timestamp)
			.field(field_id::BLOCK_ENTROPY, &self.block_entropy.to_wire())
			.finish()
	}

	pub fn from_wire(bytes: &[u8]) -> Result<Block, CodecError> {
		let mut reader = WireReader::new(bytes);
		let weight = reader.field(field_id::WEIGHT)?;
		let total_weight = reader.field(field_id::TOTAL_WEIGHT)?;
		let miner_signature = reader.field(field_id::MINER_SIGNATURE)?;
		let hash = reader.field(field_id::HASH)?;
		let previous_hash = reader.field(field_id::PREVIOUS_HASH)?;
		let merkle_hash = reader.field(field_id::MERKLE_HASH)?;
		let block_number = reader.field(field_id::BLOCK_NUMBER)?;
		let miner_id = reader.field(field_id::MINER_ID)?;
		let log2_num_lanes = reader.field(field_id::LOG2_NUM_LANES)?;
		let slices = reader.field(field_id::SLICES)?;
		let dag_epoch = reader.field(field_id::DAG_EPOCH)?;
		let timestamp = reader.field(field_id::TIMESTAMP)?;
		let entropy_bytes: Vec<u8> = reader.field(field_id::BLOCK_ENTROPY)?;
		reader.finish()?;

		Ok(Block {
			previous_hash,
			merkle_hash,
			block_number,
			miner_id,
			log2_num_lanes,
			slices,
			dag_epoch,
			timestamp,
			block_entropy: BlockEntropy::from_wire(&entropy_bytes)?,
			weight,
			hash,
			miner_signature,
			total_weight,
			is_loose: false,
			chain_label: 0,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use palisade_primitives::Prover;

	fn sample_block() -> Block {
		let prover = Prover::generate();
		let mut block = Block {
			previous_hash: sha256(b"previous"),
			merkle_hash: sha256(b"merkle"),
			block_number: 7,
			miner_id: prover.identity(),
			log2_num_lanes: 2,
			slices: vec![
				vec![TransactionLayout { digest: sha256(b"tx1"), charge: 10 }],
				vec![
					TransactionLayout { digest: sha256(b"tx2"), charge: 5 },
					TransactionLayout { digest: sha256(b"tx3"), charge: 1 },
				],
			],
			timestamp: 1_700_000_000,
			weight: 3,
			..Block::default()
		};
		block.block_entropy.block_number = 7;
		block.block_entropy.group_signature = vec![9u8; 48];
		block.update_digest();
		block.miner_signature = prover.sign(block.hash.as_bytes());
		block
	}

	#[test]
	fn wire_round_trip_preserves_hash() {
		let block = sample_block();
		let decoded = Block::from_wire(&block.to_wire()).unwrap();
		assert_eq!(decoded.hash, block.hash);
		assert!(decoded.digest_matches());
		assert!(decoded.verify_miner_signature());
		assert_eq!(decoded.slices, block.slices);
	}

	#[test]
	fn hash_ignores_metadata() {
		let mut block = sample_block();
		let original = block.hash;
		block.total_weight = 999;
		block.is_loose = true;
		block.chain_label = 5;
		block.update_digest();
		assert_eq!(block.hash, original);
	}

	#[test]
	fn hash_covers_body_fields() {
		let mut block = sample_block();
		let original = block.hash;
		block.timestamp += 1;
		block.update_digest();
		assert_ne!(block.hash, original);
	}

	#[test]
	fn tampered_body_fails_digest_check() {
		let mut block = sample_block();
		block.weight += 1;
		assert!(!block.digest_matches());
	}

	#[test]
	fn genesis_is_stable() {
		assert_eq!(Block::genesis().hash, Block::genesis().hash);
		assert!(Block::genesis().is_genesis());
		assert_eq!(Block::genesis().previous_hash, GENESIS_DIGEST);
	}

	#[test]
	fn transaction_count_sums_slices() {
		assert_eq!(sample_block().transaction_count(), 3);
	}
}
