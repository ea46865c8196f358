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

use palisade_primitives::Digest;
use serde::{Deserialize, Serialize};

use super::block::Block;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TravelogueStatus {
	/// The requested block lies on the heaviest branch.
	HeaviestBranch,
	/// The requested block exists but on a side branch.
	SideBranch,
	/// The requested block is unknown.
	NotFound,
}

/// Reply format conveying the heaviest chain for node sync.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeTravelogue {
	pub heaviest_hash: Digest,
	pub block_number: u64,
	pub status: TravelogueStatus,
	/// Blocks from just above the requested hash to the heaviest tip,
	/// oldest first. Empty unless the status is `HeaviestBranch`.
	pub blocks: Vec<Block>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reply_round_trips_for_the_wire() {
		let mut block = Block::default();
		block.update_digest();
		let reply = TimeTravelogue {
			heaviest_hash: block.hash,
			block_number: 12,
			status: TravelogueStatus::HeaviestBranch,
			blocks: vec![block],
		};

		let encoded = bincode::serialize(&reply).unwrap();
		let decoded: TimeTravelogue = bincode::deserialize(&encoded).unwrap();
		assert_eq!(decoded.status, TravelogueStatus::HeaviestBranch);
		assert_eq!(decoded.block_number, 12);
		assert_eq!(decoded.blocks[0].hash, decoded.heaviest_hash);
	}
}
