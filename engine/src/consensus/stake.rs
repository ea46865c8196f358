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

//! Stake bookkeeping and cabinet selection. Admission is permissioned:
//! the snapshot is installed at genesis (or by governance resets), and
//! cabinets are the top stakers after whitelist filtering, ordered
//! deterministically so every node derives the same set.

use std::collections::{BTreeMap, BTreeSet};

use palisade_primitives::Address;
use tracing::debug;

use crate::chain::Block;

/// Address -> staked amount.
pub type StakeSnapshot = BTreeMap<Address, u64>;

#[derive(Default)]
pub struct StakeManager {
	snapshot: StakeSnapshot,
	current_block: u64,
}

impl StakeManager {
	/// Install a fresh snapshot and return the genesis cabinet.
	pub fn reset(&mut self, snapshot: StakeSnapshot, max_cabinet_size: u64) -> BTreeSet<Address> {
		self.snapshot = snapshot;
		self.current_block = 0;
		self.select_top(max_cabinet_size, &BTreeSet::new())
	}

	pub fn update_current_block(&mut self, block_number: u64) {
		self.current_block = block_number;
	}

	pub fn current_block(&self) -> u64 {
		self.current_block
	}

	pub fn stake_of(&self, address: &Address) -> u64 {
		self.snapshot.get(address).copied().unwrap_or(0)
	}

	/// Cabinet for the aeon following `block`: the `max_cabinet_size`
	/// highest stakers, whitelist permitting. An empty whitelist admits
	/// everyone.
	pub fn build_cabinet(
		&self,
		block: &Block,
		max_cabinet_size: u64,
		whitelist: &BTreeSet<Address>,
	) -> BTreeSet<Address> {
		let cabinet = self.select_top(max_cabinet_size, whitelist);
		debug!(
			"cabinet of {} for the aeon after block {}",
			cabinet.len(),
			block.block_number
		);
		cabinet
	}

	fn select_top(&self, max_cabinet_size: u64, whitelist: &BTreeSet<Address>) -> BTreeSet<Address> {
		let mut stakers: Vec<(&Address, &u64)> = self
			.snapshot
			.iter()
			.filter(|(address, stake)| {
				**stake > 0 && (whitelist.is_empty() || whitelist.contains(address))
			})
			.collect();
		// Highest stake first; the address breaks ties so selection is
		// identical on every node.
		stakers.sort_by(|a, b| (b.1, a.0).cmp(&(a.1, b.0)));
		stakers
			.into_iter()
			.take(max_cabinet_size as usize)
			.map(|(address, _)| *address)
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use palisade_primitives::ADDRESS_LEN;

	fn addr(tag: u8) -> Address {
		Address([tag; ADDRESS_LEN])
	}

	fn snapshot() -> StakeSnapshot {
		[(addr(1), 50), (addr(2), 100), (addr(3), 100), (addr(4), 10), (addr(5), 0)]
			.into_iter()
			.collect()
	}

	#[test]
	fn cabinet_takes_top_stakers_deterministically() {
		let mut stake = StakeManager::default();
		let cabinet = stake.reset(snapshot(), 3);
		// 100, 100 (tie broken by address), then 50. Zero stake never
		// qualifies.
		assert_eq!(cabinet, BTreeSet::from([addr(1), addr(2), addr(3)]));
	}

	#[test]
	fn whitelist_filters_candidates() {
		let mut stake = StakeManager::default();
		stake.reset(snapshot(), 5);
		let whitelist = BTreeSet::from([addr(1), addr(4)]);
		let cabinet = stake.build_cabinet(&Block::genesis(), 5, &whitelist);
		assert_eq!(cabinet, BTreeSet::from([addr(1), addr(4)]));
	}

	#[test]
	fn stake_lookup() {
		let mut stake = StakeManager::default();
		stake.reset(snapshot(), 3);
		assert_eq!(stake.stake_of(&addr(2)), 100);
		assert_eq!(stake.stake_of(&addr(9)), 0);
	}
}
