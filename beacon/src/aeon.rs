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

use std::collections::BTreeSet;

use palisade_primitives::{
	codec::{CodecError, WireReader, WireWriter},
	Address,
};
use serde::{Deserialize, Serialize};

use crate::{
	dkg::{DkgManager, SignatureShare},
	entropy::BlockEntropy,
};

/// A contiguous range of block numbers governed by one DKG-produced
/// group key.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Aeon {
	pub members: BTreeSet<Address>,
	pub round_start: u64,
	pub round_end: u64,
	pub block_entropy_previous: BlockEntropy,
	/// Unix-seconds reference all members start their DKG attempt from.
	pub start_reference_timepoint: u64,
}

impl PartialEq for Aeon {
	fn eq(&self, other: &Self) -> bool {
		self.members == other.members &&
			self.round_start == other.round_start &&
			self.round_end == other.round_end
	}
}

impl Eq for Aeon {}

mod aeon_field_id {
	pub const MEMBERS: u8 = 1;
	pub const ROUND_START: u8 = 2;
	pub const ROUND_END: u8 = 3;
	pub const BLOCK_ENTROPY_PREVIOUS: u8 = 4;
	pub const START_REFERENCE_TIMEPOINT: u8 = 5;
}

impl Aeon {
	pub fn to_wire(&self) -> Vec<u8> {
		WireWriter::new()
			.field(aeon_field_id::MEMBERS, &self.members)
			.field(aeon_field_id::ROUND_START, &self.round_start)
			.field(aeon_field_id::ROUND_END, &self.round_end)
			.field(aeon_field_id::BLOCK_ENTROPY_PREVIOUS, &self.block_entropy_previous.to_wire())
			.field(aeon_field_id::START_REFERENCE_TIMEPOINT, &self.start_reference_timepoint)
			.finish()
	}

	pub fn from_wire(bytes: &[u8]) -> Result<Self, CodecError> {
		let mut reader = WireReader::new(bytes);
		let members = reader.field(aeon_field_id::MEMBERS)?;
		let round_start = reader.field(aeon_field_id::ROUND_START)?;
		let round_end = reader.field(aeon_field_id::ROUND_END)?;
		let entropy_bytes: Vec<u8> = reader.field(aeon_field_id::BLOCK_ENTROPY_PREVIOUS)?;
		let start_reference_timepoint = reader.field(aeon_field_id::START_REFERENCE_TIMEPOINT)?;
		reader.finish()?;

		Ok(Aeon {
			members,
			round_start,
			round_end,
			block_entropy_previous: BlockEntropy::from_wire(&entropy_bytes)?,
			start_reference_timepoint,
		})
	}
}

/// Everything needed to run one aeon: the aeon description, the
/// threshold key material, and the entropy skeleton for the aeon's
/// first block.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AeonExecutionUnit {
	pub block_entropy: BlockEntropy,
	pub manager: DkgManager,
	pub member_share: Option<SignatureShare>,
	pub aeon: Aeon,
}

mod unit_field_id {
	pub const BLOCK_ENTROPY: u8 = 1;
	pub const MANAGER: u8 = 2;
	pub const MEMBER_SHARE: u8 = 3;
	pub const AEON: u8 = 4;
}

impl AeonExecutionUnit {
	pub fn to_wire(&self) -> Vec<u8> {
		WireWriter::new()
			.field(unit_field_id::BLOCK_ENTROPY, &self.block_entropy.to_wire())
			.field(unit_field_id::MANAGER, &self.manager)
			.field(unit_field_id::MEMBER_SHARE, &self.member_share)
			.field(unit_field_id::AEON, &self.aeon.to_wire())
			.finish()
	}

	pub fn from_wire(bytes: &[u8]) -> Result<Self, CodecError> {
		let mut reader = WireReader::new(bytes);
		let entropy_bytes: Vec<u8> = reader.field(unit_field_id::BLOCK_ENTROPY)?;
		let manager = reader.field(unit_field_id::MANAGER)?;
		let member_share = reader.field(unit_field_id::MEMBER_SHARE)?;
		let aeon_bytes: Vec<u8> = reader.field(unit_field_id::AEON)?;
		reader.finish()?;

		Ok(AeonExecutionUnit {
			block_entropy: BlockEntropy::from_wire(&entropy_bytes)?,
			manager,
			member_share,
			aeon: Aeon::from_wire(&aeon_bytes)?,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use palisade_primitives::ADDRESS_LEN;

	#[test]
	fn aeon_equality_ignores_entropy_and_timepoint() {
		let members: BTreeSet<Address> =
			[Address([1; ADDRESS_LEN]), Address([2; ADDRESS_LEN])].into_iter().collect();
		let a = Aeon { members: members.clone(), round_start: 1, round_end: 10, ..Aeon::default() };
		let mut b = Aeon {
			members,
			round_start: 1,
			round_end: 10,
			start_reference_timepoint: 777,
			..Aeon::default()
		};
		b.block_entropy_previous.block_number = 9;
		assert_eq!(a, b);

		let c = Aeon { round_start: 2, ..a.clone() };
		assert_ne!(a, c);
	}

	#[test]
	fn execution_unit_wire_round_trip() {
		let members: BTreeSet<Address> =
			[Address([1; ADDRESS_LEN]), Address([2; ADDRESS_LEN])].into_iter().collect();
		let unit = AeonExecutionUnit {
			aeon: Aeon {
				members,
				round_start: 11,
				round_end: 20,
				start_reference_timepoint: 123,
				..Aeon::default()
			},
			..AeonExecutionUnit::default()
		};

		let decoded = AeonExecutionUnit::from_wire(&unit.to_wire()).unwrap();
		assert_eq!(decoded.aeon, unit.aeon);
		assert_eq!(decoded.aeon.start_reference_timepoint, 123);
	}
}
