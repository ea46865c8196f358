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

//! Per-block randomness packet. On blocks that begin an aeon it also
//! carries the qualified set, the group public key and the qualified
//! members' confirmation signatures over the digest of those fields.

use std::collections::{BTreeMap, BTreeSet};

use palisade_primitives::{
	codec::{CodecError, WireReader, WireWriter},
	sha256, Address, Digest,
};
use serde::{Deserialize, Serialize};

/// Signed notarisation key: `(public key, ECDSA signature over it)`.
pub type SignedNotarisationKey = (Vec<u8>, Vec<u8>);

/// Aggregate block notarisation: `(signature, contributing qual indices)`.
pub type AggregateSignature = (Vec<u8>, BTreeSet<u32>);

mod field_id {
	pub const QUALIFIED: u8 = 1;
	pub const GROUP_PUBLIC_KEY: u8 = 2;
	pub const BLOCK_NUMBER: u8 = 3;
	pub const CONFIRMATIONS: u8 = 4;
	pub const GROUP_SIGNATURE: u8 = 5;
	pub const NOTARISATION_KEYS: u8 = 6;
	pub const NOTARISATION: u8 = 7;
	pub const NOTARISATION_MEMBERS: u8 = 8;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireBlockEntropy", into = "WireBlockEntropy")]
pub struct BlockEntropy {
	/// Addresses that completed the DKG for this aeon. Populated on
	/// aeon-beginning blocks only.
	pub qualified: BTreeSet<Address>,
	/// Signed notarisation keys of the qualified members (aeon beginning
	/// only, optional feature).
	pub aeon_notarisation_keys: BTreeMap<Address, SignedNotarisationKey>,
	/// The group public key of the aeon (aeon beginning only).
	pub group_public_key: Vec<u8>,
	/// The block this entropy belongs to.
	pub block_number: u64,
	/// Hash of the aeon-beginning fields. Not serialized; restored on
	/// deserialize whenever confirmations are present.
	pub digest: Digest,
	/// Qual-index keyed ECDSA signatures over `digest` (aeon beginning
	/// only).
	pub confirmations: BTreeMap<u16, Vec<u8>>,
	/// Threshold group signature over the previous block's entropy hash.
	pub group_signature: Vec<u8>,
	/// Aggregate notarisation of the block (optional feature).
	pub block_notarisation: AggregateSignature,
}

impl BlockEntropy {
	/// Copy the fields that carry over into the next block's entropy.
	/// The digest and confirmations do not: they describe an aeon
	/// beginning only.
	pub fn select_copy(&mut self, rhs: &BlockEntropy) {
		self.qualified = rhs.qualified.clone();
		self.group_public_key = rhs.group_public_key.clone();
		self.block_number = rhs.block_number;
		self.group_signature = rhs.group_signature.clone();
	}

	/// The entropy of this block as a hash.
	pub fn entropy_as_sha256(&self) -> Digest {
		sha256(&self.group_signature)
	}

	/// The entropy of this block as a u64: the first eight bytes of
	/// [`Self::entropy_as_sha256`], little endian.
	pub fn entropy_as_u64(&self) -> u64 {
		let hash = self.entropy_as_sha256();
		u64::from_le_bytes(hash.as_bytes()[..8].try_into().expect("digest holds 32 bytes"))
	}

	/// Recompute the digest of the aeon-beginning fields.
	pub fn hash_self(&mut self) {
		let payload = bincode::serialize(&(
			&self.qualified,
			&self.group_public_key,
			&self.block_number,
			&self.aeon_notarisation_keys,
		))
		.expect("serialization into a Vec cannot fail");
		self.digest = sha256(payload);
	}

	pub fn is_aeon_beginning(&self) -> bool {
		!self.confirmations.is_empty()
	}

	/// Position of `member` within the qualified set, as used to key the
	/// confirmations map.
	pub fn to_qual_index(&self, member: &Address) -> u16 {
		self.qualified.iter().take_while(|address| *address != member).count() as u16
	}

	/// Deterministic field-tagged wire encoding.
	pub fn to_wire(&self) -> Vec<u8> {
		WireWriter::new()
			.field(field_id::QUALIFIED, &self.qualified)
			.field(field_id::GROUP_PUBLIC_KEY, &self.group_public_key)
			.field(field_id::BLOCK_NUMBER, &self.block_number)
			.field(field_id::CONFIRMATIONS, &self.confirmations)
			.field(field_id::GROUP_SIGNATURE, &self.group_signature)
			.field(field_id::NOTARISATION_KEYS, &self.aeon_notarisation_keys)
			.field(field_id::NOTARISATION, &self.block_notarisation.0)
			.field(field_id::NOTARISATION_MEMBERS, &self.block_notarisation.1)
			.finish()
	}

	pub fn from_wire(bytes: &[u8]) -> Result<Self, CodecError> {
		let mut reader = WireReader::new(bytes);
		let mut entropy = BlockEntropy {
			qualified: reader.field(field_id::QUALIFIED)?,
			group_public_key: reader.field(field_id::GROUP_PUBLIC_KEY)?,
			block_number: reader.field(field_id::BLOCK_NUMBER)?,
			confirmations: reader.field(field_id::CONFIRMATIONS)?,
			group_signature: reader.field(field_id::GROUP_SIGNATURE)?,
			aeon_notarisation_keys: reader.field(field_id::NOTARISATION_KEYS)?,
			block_notarisation: (
				reader.field(field_id::NOTARISATION)?,
				reader.field(field_id::NOTARISATION_MEMBERS)?,
			),
			digest: Digest::EMPTY,
		};
		reader.finish()?;
		if entropy.is_aeon_beginning() {
			entropy.hash_self();
		}
		Ok(entropy)
	}
}

/// Serde mirror in wire field order, without the digest.
#[derive(Serialize, Deserialize)]
struct WireBlockEntropy {
	qualified: BTreeSet<Address>,
	group_public_key: Vec<u8>,
	block_number: u64,
	confirmations: BTreeMap<u16, Vec<u8>>,
	group_signature: Vec<u8>,
	aeon_notarisation_keys: BTreeMap<Address, SignedNotarisationKey>,
	block_notarisation: AggregateSignature,
}

impl From<WireBlockEntropy> for BlockEntropy {
	fn from(wire: WireBlockEntropy) -> Self {
		let mut entropy = BlockEntropy {
			qualified: wire.qualified,
			group_public_key: wire.group_public_key,
			block_number: wire.block_number,
			confirmations: wire.confirmations,
			group_signature: wire.group_signature,
			aeon_notarisation_keys: wire.aeon_notarisation_keys,
			block_notarisation: wire.block_notarisation,
			digest: Digest::EMPTY,
		};
		if entropy.is_aeon_beginning() {
			entropy.hash_self();
		}
		entropy
	}
}

impl From<BlockEntropy> for WireBlockEntropy {
	fn from(entropy: BlockEntropy) -> Self {
		WireBlockEntropy {
			qualified: entropy.qualified,
			group_public_key: entropy.group_public_key,
			block_number: entropy.block_number,
			confirmations: entropy.confirmations,
			group_signature: entropy.group_signature,
			aeon_notarisation_keys: entropy.aeon_notarisation_keys,
			block_notarisation: entropy.block_notarisation,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use palisade_primitives::ADDRESS_LEN;

	fn member(tag: u8) -> Address {
		Address([tag; ADDRESS_LEN])
	}

	fn aeon_beginning() -> BlockEntropy {
		let mut entropy = BlockEntropy {
			qualified: [member(1), member(2), member(3)].into_iter().collect(),
			group_public_key: vec![0xaa; 96],
			block_number: 101,
			group_signature: vec![0xbb; 48],
			..BlockEntropy::default()
		};
		entropy.hash_self();
		entropy.confirmations.insert(0, vec![1; 64]);
		entropy.confirmations.insert(1, vec![2; 64]);
		entropy.confirmations.insert(2, vec![3; 64]);
		entropy
	}

	#[test]
	fn digest_restored_on_deserialize() {
		let entropy = aeon_beginning();
		assert!(!entropy.digest.is_empty());

		let decoded = BlockEntropy::from_wire(&entropy.to_wire()).unwrap();
		assert_eq!(decoded.digest, entropy.digest);
		assert_eq!(decoded, entropy);

		let via_serde: BlockEntropy =
			bincode::deserialize(&bincode::serialize(&entropy).unwrap()).unwrap();
		assert_eq!(via_serde.digest, entropy.digest);
	}

	#[test]
	fn non_beginning_entropy_has_no_digest() {
		let mut entropy = BlockEntropy::default();
		entropy.group_signature = vec![0xcc; 48];
		let decoded = BlockEntropy::from_wire(&entropy.to_wire()).unwrap();
		assert!(!decoded.is_aeon_beginning());
		assert!(decoded.digest.is_empty());
	}

	#[test]
	fn select_copy_drops_aeon_beginning_fields() {
		let entropy = aeon_beginning();
		let mut next = BlockEntropy::default();
		next.select_copy(&entropy);
		assert_eq!(next.qualified, entropy.qualified);
		assert_eq!(next.group_signature, entropy.group_signature);
		assert!(next.confirmations.is_empty());
		assert!(next.digest.is_empty());
	}

	#[test]
	fn entropy_as_u64_is_prefix_of_entropy_hash() {
		let entropy = aeon_beginning();
		let hash = entropy.entropy_as_sha256();
		assert_eq!(
			entropy.entropy_as_u64(),
			u64::from_le_bytes(hash.as_bytes()[..8].try_into().unwrap())
		);
	}

	#[test]
	fn qual_index_follows_set_order() {
		let entropy = aeon_beginning();
		assert_eq!(entropy.to_qual_index(&member(1)), 0);
		assert_eq!(entropy.to_qual_index(&member(3)), 2);
	}
}
