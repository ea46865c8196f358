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

//! Main chain: a content-addressed DAG of blocks with loose-block
//! resolution and heaviest-tip tracking. The structure accepts headers
//! without consensus verification and always serves the heaviest chain;
//! ties break on a hash comparison. Blocks MUST carry a valid hash and
//! previous hash.
//!
//! Lock order is the chain mutex before the loose-block mutex, always.

use std::{
	collections::{HashMap, HashSet, VecDeque},
	path::PathBuf,
	sync::Mutex,
};

use palisade_primitives::Digest;
use tracing::{debug, info, warn};

use super::{
	block::{Block, TransactionLayout, GENESIS_DIGEST},
	store::BlockStore,
	travelogue::{TimeTravelogue, TravelogueStatus},
};

/// Blocks this far behind the heaviest tip are confirmed and flushed to
/// the persistent store.
const BLOCK_CONFIRMATION: u64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockStatus {
	Added,
	Loose,
	Duplicate,
	Invalid,
}

impl std::fmt::Display for BlockStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let text = match self {
			BlockStatus::Added => "Added",
			BlockStatus::Loose => "Loose",
			BlockStatus::Duplicate => "Duplicate",
			BlockStatus::Invalid => "Invalid",
		};
		write!(f, "{text}")
	}
}

/// Storage mode for the chain.
#[derive(Clone, Debug)]
pub enum Mode {
	InMemoryDb,
	CreatePersistentDb { path: PathBuf },
	LoadPersistentDb { path: PathBuf },
}

/// What to keep when a common-ancestor walk hits its length limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AncestorPathBehaviour {
	/// Keep the portion closest to the tip.
	ReturnMostRecent,
	/// Keep the portion closest to the ancestor.
	ReturnLeastRecent,
}

/// One tip per leaf of the non-loose DAG.
#[derive(Clone, Copy, Debug, Default)]
struct Tip {
	total_weight: u64,
}

#[derive(Clone, Debug)]
struct HeaviestTip {
	weight: u64,
	hash: Digest,
}

impl HeaviestTip {
	/// Strictly greater weight wins; equal weight falls back to the
	/// lexicographically greater hash.
	fn update(&mut self, weight: u64, hash: Digest) -> bool {
		if weight > self.weight || (weight == self.weight && hash > self.hash) {
			self.weight = weight;
			self.hash = hash;
			return true;
		}
		false
	}
}

struct ChainInner {
	/// All recent blocks, including loose ones.
	block_chain: HashMap<Digest, Block>,
	tips: HashMap<Digest, Tip>,
	heaviest: HeaviestTip,
}

pub struct MainChain {
	inner: Mutex<ChainInner>,
	/// Missing previous-hash -> blocks waiting on it.
	loose_blocks: Mutex<HashMap<Digest, Vec<Digest>>>,
	store: Option<BlockStore>,
}

impl MainChain {
	pub fn new(mode: Mode) -> Self {
		let genesis = Block::genesis();
		let inner = ChainInner {
			block_chain: HashMap::from([(genesis.hash, genesis.clone())]),
			tips: HashMap::from([(genesis.hash, Tip { total_weight: genesis.total_weight })]),
			heaviest: HeaviestTip { weight: genesis.total_weight, hash: genesis.hash },
		};

		let chain = MainChain {
			inner: Mutex::new(inner),
			loose_blocks: Mutex::new(HashMap::new()),
			store: match &mode {
				Mode::InMemoryDb => None,
				Mode::CreatePersistentDb { path } => Some(
					BlockStore::create(path).expect("failed to create the block store"),
				),
				Mode::LoadPersistentDb { path } =>
					Some(BlockStore::load(path).expect("failed to load the block store")),
			},
		};

		if matches!(mode, Mode::LoadPersistentDb { .. }) {
			chain.recover_from_store();
		}
		chain
	}

	pub fn store(&self) -> Option<&BlockStore> {
		self.store.as_ref()
	}

	/// Add a block to the chain, resolving any loose blocks it parents.
	pub fn add_block(&self, block: Block) -> BlockStatus {
		let mut block = block;
		if block.hash.is_empty() {
			block.update_digest();
		}

		let mut inner = self.inner.lock().expect("chain mutex poisoned");
		let status = self.insert_block(&mut inner, block.clone(), true);
		debug!("new block {} -> {status} (weight {})", block.hash, block.weight);
		status
	}

	pub fn get_heaviest_block(&self) -> Option<Block> {
		let mut inner = self.inner.lock().expect("chain mutex poisoned");
		let hash = inner.heaviest.hash;
		self.lookup_block(&mut inner, &hash)
	}

	pub fn get_heaviest_block_hash(&self) -> Digest {
		self.inner.lock().expect("chain mutex poisoned").heaviest.hash
	}

	pub fn heaviest_weight(&self) -> u64 {
		self.inner.lock().expect("chain mutex poisoned").heaviest.weight
	}

	pub fn total_blocks(&self) -> usize {
		self.inner.lock().expect("chain mutex poisoned").block_chain.len()
	}

	pub fn get_block(&self, hash: &Digest) -> Option<Block> {
		let mut inner = self.inner.lock().expect("chain mutex poisoned");
		self.lookup_block(&mut inner, hash)
	}

	/// Walk back from the heaviest block.
	pub fn get_heaviest_chain(&self, limit: u64) -> Vec<Block> {
		let hash = self.get_heaviest_block_hash();
		self.get_chain_preceding(&hash, limit)
	}

	/// Walk back from `start`, stopping at genesis or after `limit`
	/// blocks.
	pub fn get_chain_preceding(&self, start: &Digest, limit: u64) -> Vec<Block> {
		let mut inner = self.inner.lock().expect("chain mutex poisoned");
		let mut result = Vec::new();
		let mut current = *start;

		while (result.len() as u64) < limit {
			if current == GENESIS_DIGEST {
				break;
			}
			let Some(block) = self.lookup_block(&mut inner, &current) else {
				warn!("block lookup failure walking the chain at {current}");
				break;
			};
			current = block.previous_hash;
			result.push(block);
		}
		result
	}

	/// Coordinated walk back from `tip` and `other` until their common
	/// ancestor; returns the path from `tip` down to and including the
	/// ancestor. `behaviour` picks which end survives the `limit`.
	pub fn get_path_to_common_ancestor(
		&self,
		tip: &Digest,
		other: &Digest,
		limit: u64,
		behaviour: AncestorPathBehaviour,
	) -> Option<Vec<Block>> {
		let mut inner = self.inner.lock().expect("chain mutex poisoned");

		let mut path: Vec<Block> = Vec::new();
		let mut left_hash = *tip;
		let mut right_hash = *other;
		let mut left: Option<Block> = None;
		let mut right: Option<Block> = None;

		loop {
			if left.as_ref().map(|block| block.hash) != Some(left_hash) {
				let Some(block) = self.lookup_block(&mut inner, &left_hash) else {
					warn!("unable to look up left block {left_hash}");
					return None;
				};
				path.push(block.clone());
				left = Some(block);
			}
			if right.as_ref().map(|block| block.hash) != Some(right_hash) {
				let Some(block) = self.lookup_block(&mut inner, &right_hash) else {
					warn!("unable to look up right block {right_hash}");
					return None;
				};
				right = Some(block);
			}

			if left_hash == right_hash {
				break;
			}

			let left_number = left.as_ref().map(|block| block.block_number).unwrap_or(0);
			let right_number = right.as_ref().map(|block| block.block_number).unwrap_or(0);
			let at_genesis = left_number == 0 && right_number == 0;
			if at_genesis {
				// Distinct genesis-height blocks never converge.
				return None;
			}

			if left_number <= right_number {
				right_hash = right.as_ref().map(|block| block.previous_hash)?;
			}
			if left_number >= right_number {
				left_hash = left.as_ref().map(|block| block.previous_hash)?;
			}
		}

		let limit = limit as usize;
		if path.len() > limit {
			match behaviour {
				AncestorPathBehaviour::ReturnMostRecent => path.truncate(limit),
				AncestorPathBehaviour::ReturnLeastRecent => {
					path.drain(..path.len() - limit);
				},
			}
		}
		Some(path)
	}

	/// Status of `start` relative to the heaviest branch, plus the blocks
	/// from (not including) `start` up to the heaviest, oldest first.
	pub fn time_travel(&self, start: &Digest) -> TimeTravelogue {
		let mut inner = self.inner.lock().expect("chain mutex poisoned");
		let heaviest_hash = inner.heaviest.hash;
		let heaviest_number = self
			.lookup_block(&mut inner, &heaviest_hash)
			.map(|block| block.block_number)
			.unwrap_or(0);

		let known = self.lookup_block(&mut inner, start).is_some();
		if !known {
			return TimeTravelogue {
				heaviest_hash,
				block_number: heaviest_number,
				status: TravelogueStatus::NotFound,
				blocks: Vec::new(),
			};
		}

		// Walk back from the heaviest block looking for `start`.
		let mut blocks = Vec::new();
		let mut current = heaviest_hash;
		let mut on_heaviest_branch = false;
		while current != *start {
			if current == GENESIS_DIGEST {
				break;
			}
			let Some(block) = self.lookup_block(&mut inner, &current) else { break };
			current = block.previous_hash;
			blocks.push(block);
		}
		if current == *start {
			on_heaviest_branch = true;
		}

		if on_heaviest_branch {
			blocks.reverse();
			TimeTravelogue {
				heaviest_hash,
				block_number: heaviest_number,
				status: TravelogueStatus::HeaviestBranch,
				blocks,
			}
		} else {
			TimeTravelogue {
				heaviest_hash,
				block_number: heaviest_number,
				status: TravelogueStatus::SideBranch,
				blocks: Vec::new(),
			}
		}
	}

	/// Remove a block and every descendant, then re-index the tips.
	pub fn remove_block(&self, hash: &Digest) -> bool {
		let mut inner = self.inner.lock().expect("chain mutex poisoned");
		let mut loose = self.loose_blocks.lock().expect("loose mutex poisoned");

		if !inner.block_chain.contains_key(hash) {
			return false;
		}

		// Sweep out the whole subtree rooted at `hash`.
		let mut invalidated: HashSet<Digest> = HashSet::from([*hash]);
		inner.block_chain.remove(hash);
		loop {
			let next: Vec<Digest> = inner
				.block_chain
				.iter()
				.filter(|(_, block)| invalidated.contains(&block.previous_hash))
				.map(|(block_hash, _)| *block_hash)
				.collect();
			if next.is_empty() {
				break;
			}
			for block_hash in next {
				invalidated.insert(block_hash);
				inner.block_chain.remove(&block_hash);
			}
		}

		// Scrub the loose index of any reference to removed blocks.
		loose.retain(|_, waiting| {
			waiting.retain(|waiting_hash| !invalidated.contains(waiting_hash));
			!waiting.is_empty()
		});

		self.reindex_tips(&mut inner)
	}

	/// Hashes of blocks the chain knows it is missing.
	pub fn get_missing_block_hashes(&self, maximum: usize) -> Vec<Digest> {
		let loose = self.loose_blocks.lock().expect("loose mutex poisoned");
		loose.keys().take(maximum).copied().collect()
	}

	pub fn has_missing_blocks(&self) -> bool {
		!self.loose_blocks.lock().expect("loose mutex poisoned").is_empty()
	}

	pub fn get_tips(&self) -> HashSet<Digest> {
		let inner = self.inner.lock().expect("chain mutex poisoned");
		inner.tips.keys().copied().collect()
	}

	/// Remove from `container` any transaction whose digest appears in a
	/// block on the chain from `starting_hash` back to genesis. Returns
	/// false if the starting hash is unknown or loose.
	pub fn strip_already_seen_transactions(
		&self,
		starting_hash: &Digest,
		container: &mut Vec<TransactionLayout>,
	) -> bool {
		let mut inner = self.inner.lock().expect("chain mutex poisoned");

		let Some(mut block) = self.lookup_block(&mut inner, starting_hash) else {
			warn!("transaction uniqueness check on unknown block {starting_hash}");
			return false;
		};
		if block.is_loose {
			warn!("transaction uniqueness check on loose block {starting_hash}");
			return false;
		}

		let to_check: HashSet<Digest> =
			container.iter().map(|layout| layout.digest).collect();
		let mut duplicated: HashSet<Digest> = HashSet::new();
		let mut blocks_checked = 0usize;
		loop {
			blocks_checked += 1;
			for slice in &block.slices {
				for layout in slice {
					if to_check.contains(&layout.digest) {
						duplicated.insert(layout.digest);
					}
				}
			}
			match self.lookup_block(&mut inner, &block.previous_hash) {
				Some(previous) => block = previous,
				None => break,
			}
		}

		if !duplicated.is_empty() {
			info!(
				"found {} duplicate transactions over {blocks_checked} blocks",
				duplicated.len()
			);
			container.retain(|layout| !duplicated.contains(&layout.digest));
		}
		true
	}

	// ---- internals ----

	fn insert_block(
		&self,
		inner: &mut ChainInner,
		mut block: Block,
		evaluate_loose_blocks: bool,
	) -> BlockStatus {
		if block.hash.is_empty() {
			warn!("block discarded for lack of a digest");
			return BlockStatus::Invalid;
		}
		if block.hash == block.previous_hash {
			warn!("block discarded for self-referential digests");
			return BlockStatus::Invalid;
		}

		block.is_loose = false;
		let mut previous: Option<Block> = None;

		if evaluate_loose_blocks {
			if inner.block_chain.contains_key(&block.hash) {
				return BlockStatus::Duplicate;
			}

			match self.lookup_block(inner, &block.previous_hash) {
				Some(previous_block) => {
					if block.block_number != previous_block.block_number + 1 {
						info!("block {} has an invalid block number", block.hash);
						return BlockStatus::Invalid;
					}
					if previous_block.is_loose {
						block.is_loose = true;
					}
					previous = Some(previous_block);
				},
				None => {
					block.is_loose = true;
					debug!("previous block not found: {}", block.previous_hash);
				},
			}
		} else {
			// Called while resolving loose blocks; loose parents are
			// handled by the caller's worklist.
			match Self::lookup_block_from_cache(inner, &block.previous_hash) {
				Some(previous_block) => previous = Some(previous_block),
				None => return BlockStatus::Loose,
			}
		}

		if block.is_loose {
			self.record_loose_block(inner, block);
			return BlockStatus::Loose;
		}

		let previous = previous.expect("non-loose blocks have a known parent");

		// Reject blocks that replay a transaction already present on this
		// chain.
		if self.contains_duplicate_transactions(inner, &block, &previous) {
			info!("block {} replays transactions from its ancestry", block.hash);
			return BlockStatus::Invalid;
		}

		block.total_weight = previous.total_weight + block.weight;

		let heaviest_advanced = Self::update_tips(inner, &block);
		let hash = block.hash;
		inner.block_chain.insert(hash, block);

		if heaviest_advanced {
			self.write_to_store(inner);
		}
		if evaluate_loose_blocks {
			self.complete_loose_blocks(inner, hash);
		}

		BlockStatus::Added
	}

	/// Remove the parent's tip (if any) and register this block's,
	/// advancing the heaviest on the way.
	fn update_tips(inner: &mut ChainInner, block: &Block) -> bool {
		debug_assert!(!block.is_loose);
		debug_assert!(block.total_weight != 0);

		inner.tips.remove(&block.previous_hash);
		inner.tips.insert(block.hash, Tip { total_weight: block.total_weight });
		inner.heaviest.update(block.total_weight, block.hash)
	}

	fn record_loose_block(&self, inner: &mut ChainInner, mut block: Block) {
		let mut loose = self.loose_blocks.lock().expect("loose mutex poisoned");
		loose.entry(block.previous_hash).or_default().push(block.hash);
		block.is_loose = true;
		inner.block_chain.insert(block.hash, block);
	}

	/// Breadth-first resolution of every loose block waiting on `hash`.
	fn complete_loose_blocks(&self, inner: &mut ChainInner, hash: Digest) {
		let mut blocks_to_add: VecDeque<Digest> = {
			let mut loose = self.loose_blocks.lock().expect("loose mutex poisoned");
			match loose.remove(&hash) {
				Some(waiting) => waiting.into(),
				None => return,
			}
		};
		debug!("{} loose blocks resolved from {hash}", blocks_to_add.len());

		while let Some(next_hash) = blocks_to_add.pop_front() {
			let Some(block) = Self::lookup_block_from_cache(inner, &next_hash) else {
				continue;
			};
			// Re-entry is prevented by the flag, so the worklist below
			// does the recursion instead.
			self.insert_block(inner, block, false);

			let mut loose = self.loose_blocks.lock().expect("loose mutex poisoned");
			if let Some(waiting) = loose.remove(&next_hash) {
				blocks_to_add.extend(waiting);
			}
		}
	}

	fn contains_duplicate_transactions(
		&self,
		inner: &mut ChainInner,
		block: &Block,
		previous: &Block,
	) -> bool {
		let incoming: HashSet<Digest> = block
			.slices
			.iter()
			.flatten()
			.map(|layout| layout.digest)
			.collect();
		if incoming.is_empty() {
			return false;
		}

		let mut current = previous.clone();
		loop {
			for slice in &current.slices {
				for layout in slice {
					if incoming.contains(&layout.digest) {
						return true;
					}
				}
			}
			match self.lookup_block(inner, &current.previous_hash) {
				Some(block) => current = block,
				None => return false,
			}
		}
	}

	fn lookup_block(&self, inner: &mut ChainInner, hash: &Digest) -> Option<Block> {
		Self::lookup_block_from_cache(inner, hash)
			.or_else(|| self.lookup_block_from_store(inner, hash))
	}

	fn lookup_block_from_cache(inner: &ChainInner, hash: &Digest) -> Option<Block> {
		inner.block_chain.get(hash).cloned()
	}

	fn lookup_block_from_store(&self, inner: &mut ChainInner, hash: &Digest) -> Option<Block> {
		let store = self.store.as_ref()?;
		let mut block = store.get(hash).ok()??;
		// The stored form is authoritative for the body only.
		block.update_digest();
		inner.block_chain.entry(block.hash).or_insert_with(|| block.clone());
		Some(block)
	}

	/// Flush confirmed blocks (those `BLOCK_CONFIRMATION` behind the
	/// heaviest tip) to disk and drop them from the cache.
	fn write_to_store(&self, inner: &mut ChainInner) {
		let Some(store) = self.store.as_ref() else { return };

		let heaviest_hash = inner.heaviest.hash;
		let mut block = match Self::lookup_block_from_cache(inner, &heaviest_hash) {
			Some(block) => block,
			None => return,
		};
		for _ in 0..BLOCK_CONFIRMATION {
			match self.lookup_block(inner, &block.previous_hash) {
				Some(previous) => block = previous,
				None => return,
			}
		}

		// This block becomes the stored head; everything at and below it
		// is confirmed.
		if let Err(error) = store.set_head(&block) {
			warn!("failed to update the stored head: {error}");
			return;
		}
		debug!("updating stored head to {}", block.hash);

		while let Some(previous) = Self::lookup_block_from_cache(inner, &block.previous_hash) {
			match store.has(&previous.hash) {
				Ok(false) =>
					if let Err(error) = store.set(&previous) {
						warn!("failed to store confirmed block: {error}");
						return;
					},
				Ok(true) => {},
				Err(error) => {
					warn!("block store read failure: {error}");
					return;
				},
			}
			// Confirmed blocks leave the cache (and can no longer be
			// tips).
			inner.block_chain.remove(&previous.hash);
			inner.tips.remove(&previous.hash);
			block = previous;
		}
	}

	/// Restore the chain from disk: follow the head's ancestry, feeding
	/// blocks back through normal insertion.
	fn recover_from_store(&self) {
		let Some(store) = self.store.as_ref() else { return };
		let mut inner = self.inner.lock().expect("chain mutex poisoned");

		let head = match store.get_head() {
			Ok(Some(mut block)) => {
				block.update_digest();
				block
			},
			Ok(None) => return,
			Err(error) => {
				warn!("failed to read the stored head: {error}");
				return;
			},
		};

		info!("recovering chain from stored head {}", head.hash);
		let mut current = head.clone();
		self.insert_block(&mut inner, head, true);
		while let Ok(Some(mut next)) = store.get(&current.previous_hash) {
			next.update_digest();
			current = next.clone();
			self.insert_block(&mut inner, next, true);
		}
	}

	/// Rebuild the tip set from scratch after removals.
	fn reindex_tips(&self, inner: &mut ChainInner) -> bool {
		let mut blocks: Vec<(u64, Digest, u64, bool, Digest)> = inner
			.block_chain
			.values()
			.map(|block| {
				(
					block.block_number,
					block.hash,
					block.total_weight,
					block.is_loose,
					block.previous_hash,
				)
			})
			.collect();
		blocks.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

		let mut tips: HashSet<Digest> = HashSet::new();
		for (_, hash, _, is_loose, previous_hash) in &blocks {
			tips.remove(previous_hash);
			if !is_loose {
				tips.insert(*hash);
			}
		}

		let mut new_tips = HashMap::new();
		for tip in tips {
			let Some(block) = Self::lookup_block_from_cache(inner, &tip) else {
				return false;
			};
			new_tips.insert(tip, Tip { total_weight: block.total_weight });
		}
		inner.tips = new_tips;
		self.determine_heaviest_tip(inner)
	}

	fn determine_heaviest_tip(&self, inner: &mut ChainInner) -> bool {
		let best = inner.tips.iter().max_by(|a, b| {
			(a.1.total_weight, a.0).cmp(&(b.1.total_weight, b.0))
		});
		match best {
			Some((hash, tip)) => {
				inner.heaviest = HeaviestTip { weight: tip.total_weight, hash: *hash };
				true
			},
			None => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use palisade_primitives::sha256;

	fn child(previous: &Block, tag: &str, weight: u64) -> Block {
		let mut block = Block {
			previous_hash: previous.hash,
			block_number: previous.block_number + 1,
			merkle_hash: sha256(tag),
			weight,
			timestamp: previous.timestamp + 1,
			..Block::default()
		};
		block.update_digest();
		block
	}

	fn with_transactions(previous: &Block, tag: &str, digests: &[Digest]) -> Block {
		let mut block = child(previous, tag, 1);
		block.slices = vec![digests
			.iter()
			.map(|digest| TransactionLayout { digest: *digest, charge: 1 })
			.collect()];
		block.update_digest();
		block
	}

	#[test]
	fn linear_chain_in_memory() {
		let chain = MainChain::new(Mode::InMemoryDb);
		let genesis = Block::genesis();
		let b1 = child(&genesis, "b1", 2);
		let b2 = child(&b1, "b2", 2);
		let b3 = child(&b2, "b3", 2);

		assert_eq!(chain.add_block(b1.clone()), BlockStatus::Added);
		assert_eq!(chain.add_block(b2.clone()), BlockStatus::Added);
		assert_eq!(chain.add_block(b3.clone()), BlockStatus::Added);

		assert_eq!(chain.get_heaviest_block_hash(), b3.hash);
		let heaviest: Vec<Digest> =
			chain.get_heaviest_chain(3).iter().map(|block| block.hash).collect();
		assert_eq!(heaviest, vec![b3.hash, b2.hash, b1.hash]);
	}

	#[test]
	fn duplicate_and_invalid_blocks_are_rejected() {
		let chain = MainChain::new(Mode::InMemoryDb);
		let b1 = child(&Block::genesis(), "b1", 2);
		assert_eq!(chain.add_block(b1.clone()), BlockStatus::Added);
		assert_eq!(chain.add_block(b1.clone()), BlockStatus::Duplicate);

		// Wrong block number.
		let mut bad = child(&b1, "bad", 2);
		bad.block_number = 17;
		bad.update_digest();
		assert_eq!(chain.add_block(bad), BlockStatus::Invalid);

		// Self-referential digests.
		let mut selfie = child(&b1, "selfie", 2);
		selfie.update_digest();
		selfie.previous_hash = selfie.hash;
		assert_eq!(chain.add_block(selfie), BlockStatus::Invalid);
	}

	#[test]
	fn side_chain_switch_keeps_old_blocks_retrievable() {
		let chain = MainChain::new(Mode::InMemoryDb);
		let genesis = Block::genesis();

		let mut common = vec![genesis.clone()];
		for i in 1..=4 {
			let block = child(common.last().unwrap(), &format!("common {i}"), 2);
			assert_eq!(chain.add_block(block.clone()), BlockStatus::Added);
			common.push(block);
		}
		assert_eq!(chain.get_heaviest_block_hash(), common[4].hash);

		// A light side branch takes the tip first.
		let side1 = child(&common[4], "side 1", 1);
		let side2 = child(&side1, "side 2", 1);
		chain.add_block(side1.clone());
		chain.add_block(side2.clone());
		assert_eq!(chain.get_heaviest_block_hash(), side2.hash);

		// A heavier main branch overtakes it.
		let main1 = child(&common[4], "main 1", 3);
		let main2 = child(&main1, "main 2", 3);
		let main3 = child(&main2, "main 3", 3);
		chain.add_block(main1.clone());
		assert_eq!(chain.get_heaviest_block_hash(), side2.hash);
		chain.add_block(main2.clone());
		chain.add_block(main3.clone());
		assert_eq!(chain.get_heaviest_block_hash(), main3.hash);

		// The side branch is still retrievable by hash.
		assert!(chain.get_block(&side1.hash).is_some());
		assert!(chain.get_block(&side2.hash).is_some());
	}

	#[test]
	fn heaviest_weight_never_decreases() {
		let chain = MainChain::new(Mode::InMemoryDb);
		let b1 = child(&Block::genesis(), "b1", 5);
		chain.add_block(b1.clone());
		let weight_before = chain.heaviest_weight();

		// A lighter competitor does not move the tip.
		let light = child(&Block::genesis(), "light", 1);
		chain.add_block(light);
		assert_eq!(chain.get_heaviest_block_hash(), b1.hash);
		assert!(chain.heaviest_weight() >= weight_before);
	}

	#[test]
	fn equal_weight_tie_breaks_on_larger_hash() {
		let chain = MainChain::new(Mode::InMemoryDb);
		let a = child(&Block::genesis(), "tip a", 2);
		let b = child(&Block::genesis(), "tip b", 2);
		let winner = if a.hash > b.hash { a.hash } else { b.hash };

		chain.add_block(a.clone());
		chain.add_block(b.clone());
		assert_eq!(chain.get_heaviest_block_hash(), winner);

		// Insertion order must not matter.
		let other = MainChain::new(Mode::InMemoryDb);
		other.add_block(b);
		other.add_block(a);
		assert_eq!(other.get_heaviest_block_hash(), winner);
	}

	#[test]
	fn loose_blocks_resolve_in_topological_order() {
		let chain = MainChain::new(Mode::InMemoryDb);
		let genesis = Block::genesis();
		let b1 = child(&genesis, "b1", 2);
		let b2 = child(&b1, "b2", 2);
		let b3 = child(&b2, "b3", 2);

		assert_eq!(chain.add_block(b3.clone()), BlockStatus::Loose);
		assert_eq!(chain.get_missing_block_hashes(10), vec![b2.hash]);

		assert_eq!(chain.add_block(b2.clone()), BlockStatus::Loose);
		assert!(chain.has_missing_blocks());

		// The missing parent arrives and the whole tree resolves.
		assert_eq!(chain.add_block(b1.clone()), BlockStatus::Added);
		assert!(!chain.has_missing_blocks());
		assert_eq!(chain.get_heaviest_block_hash(), b3.hash);

		let resolved = chain.get_block(&b2.hash).unwrap();
		assert!(!resolved.is_loose);
		assert_eq!(resolved.total_weight, genesis.total_weight + 4);
	}

	#[test]
	fn loose_fan_out_resolves_breadth_first() {
		let chain = MainChain::new(Mode::InMemoryDb);
		let b1 = child(&Block::genesis(), "b1", 2);
		let b2 = child(&b1, "b2", 2);
		let c2 = child(&b1, "c2", 3);
		let b3 = child(&b2, "b3", 2);

		assert_eq!(chain.add_block(b2.clone()), BlockStatus::Loose);
		assert_eq!(chain.add_block(c2.clone()), BlockStatus::Loose);
		assert_eq!(chain.add_block(b3.clone()), BlockStatus::Loose);
		assert_eq!(chain.add_block(b1.clone()), BlockStatus::Added);

		assert!(!chain.has_missing_blocks());
		// b3's branch carries 1+2+2+2 = 7, c2's only 1+2+3 = 6.
		assert_eq!(chain.get_heaviest_block_hash(), b3.hash);
		assert_eq!(chain.get_block(&c2.hash).unwrap().total_weight, 6);
		assert_eq!(chain.get_block(&b3.hash).unwrap().total_weight, 7);
	}

	#[test]
	fn duplicate_transactions_on_the_same_chain_are_rejected() {
		let chain = MainChain::new(Mode::InMemoryDb);
		let tx = sha256(b"tx");
		let b1 = with_transactions(&Block::genesis(), "b1", &[tx]);
		assert_eq!(chain.add_block(b1.clone()), BlockStatus::Added);

		// Replay on the same chain: rejected.
		let replay = with_transactions(&b1, "replay", &[tx]);
		assert_eq!(chain.add_block(replay), BlockStatus::Invalid);

		// The same transaction on a different fork is fine.
		let fork = with_transactions(&Block::genesis(), "fork", &[tx]);
		assert_eq!(chain.add_block(fork), BlockStatus::Added);
	}

	#[test]
	fn strip_already_seen_transactions_filters_ancestry() {
		let chain = MainChain::new(Mode::InMemoryDb);
		let tx_old = sha256(b"tx old");
		let tx_older = sha256(b"tx older");
		let b1 = with_transactions(&Block::genesis(), "b1", &[tx_older]);
		let b2 = with_transactions(&b1, "b2", &[tx_old]);
		chain.add_block(b1);
		chain.add_block(b2.clone());

		let fresh = sha256(b"tx fresh");
		let mut pending = vec![
			TransactionLayout { digest: tx_old, charge: 1 },
			TransactionLayout { digest: fresh, charge: 1 },
			TransactionLayout { digest: tx_older, charge: 1 },
		];
		assert!(chain.strip_already_seen_transactions(&b2.hash, &mut pending));
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].digest, fresh);

		assert!(!chain.strip_already_seen_transactions(&sha256(b"unknown"), &mut pending));
	}

	#[test]
	fn common_ancestor_path_ends_at_the_ancestor() {
		let chain = MainChain::new(Mode::InMemoryDb);
		let genesis = Block::genesis();
		let b1 = child(&genesis, "b1", 2);
		let b2 = child(&b1, "b2", 2);
		let b3 = child(&b2, "b3", 2);
		let c2 = child(&b1, "c2", 1);
		let c3 = child(&c2, "c3", 1);
		for block in [&b1, &b2, &b3, &c2, &c3] {
			chain.add_block(block.clone());
		}

		let path = chain
			.get_path_to_common_ancestor(
				&b3.hash,
				&c3.hash,
				100,
				AncestorPathBehaviour::ReturnMostRecent,
			)
			.unwrap();
		let hashes: Vec<Digest> = path.iter().map(|block| block.hash).collect();
		assert_eq!(hashes, vec![b3.hash, b2.hash, b1.hash]);

		// The limit keeps the most recent portion...
		let recent = chain
			.get_path_to_common_ancestor(
				&b3.hash,
				&c3.hash,
				2,
				AncestorPathBehaviour::ReturnMostRecent,
			)
			.unwrap();
		assert_eq!(recent.iter().map(|b| b.hash).collect::<Vec<_>>(), vec![b3.hash, b2.hash]);

		// ...or the portion next to the ancestor.
		let least = chain
			.get_path_to_common_ancestor(
				&b3.hash,
				&c3.hash,
				2,
				AncestorPathBehaviour::ReturnLeastRecent,
			)
			.unwrap();
		assert_eq!(least.iter().map(|b| b.hash).collect::<Vec<_>>(), vec![b2.hash, b1.hash]);

		assert!(chain
			.get_path_to_common_ancestor(
				&b3.hash,
				&sha256(b"unknown"),
				100,
				AncestorPathBehaviour::ReturnMostRecent,
			)
			.is_none());
	}

	#[test]
	fn time_travel_reports_branch_status() {
		let chain = MainChain::new(Mode::InMemoryDb);
		let b1 = child(&Block::genesis(), "b1", 2);
		let b2 = child(&b1, "b2", 2);
		let b3 = child(&b2, "b3", 2);
		let side = child(&b1, "side", 1);
		for block in [&b1, &b2, &b3, &side] {
			chain.add_block(block.clone());
		}

		let reply = chain.time_travel(&b1.hash);
		assert_eq!(reply.status, TravelogueStatus::HeaviestBranch);
		assert_eq!(reply.heaviest_hash, b3.hash);
		let hashes: Vec<Digest> = reply.blocks.iter().map(|block| block.hash).collect();
		assert_eq!(hashes, vec![b2.hash, b3.hash]);

		let reply = chain.time_travel(&side.hash);
		assert_eq!(reply.status, TravelogueStatus::SideBranch);
		assert!(reply.blocks.is_empty());

		let reply = chain.time_travel(&sha256(b"never seen"));
		assert_eq!(reply.status, TravelogueStatus::NotFound);
	}

	#[test]
	fn removing_a_block_removes_descendants_and_reindexes_tips() {
		let chain = MainChain::new(Mode::InMemoryDb);
		let b1 = child(&Block::genesis(), "b1", 2);
		let b2 = child(&b1, "b2", 2);
		let b3 = child(&b2, "b3", 2);
		let side = child(&b1, "side", 1);
		for block in [&b1, &b2, &b3, &side] {
			chain.add_block(block.clone());
		}
		assert_eq!(chain.get_heaviest_block_hash(), b3.hash);

		assert!(chain.remove_block(&b2.hash));
		assert!(chain.get_block(&b2.hash).is_none());
		assert!(chain.get_block(&b3.hash).is_none());
		assert_eq!(chain.get_heaviest_block_hash(), side.hash);
		assert!(chain.get_tips().contains(&side.hash));

		assert!(!chain.remove_block(&sha256(b"unknown")));
	}

	#[test]
	fn persistent_chain_survives_restart() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("chain");

		let mut blocks = vec![Block::genesis()];
		{
			let chain = MainChain::new(Mode::CreatePersistentDb { path: path.clone() });
			// Push enough blocks past the confirmation window to force a
			// flush.
			for i in 1..=15 {
				let block = child(blocks.last().unwrap(), &format!("block {i}"), 2);
				assert_eq!(chain.add_block(block.clone()), BlockStatus::Added);
				blocks.push(block);
			}
			assert_eq!(chain.get_heaviest_block_hash(), blocks[15].hash);
		}

		let restored = MainChain::new(Mode::LoadPersistentDb { path });
		// Everything up to the confirmed head is retrievable again.
		let confirmed_head = &blocks[15 - BLOCK_CONFIRMATION as usize];
		assert_eq!(restored.get_heaviest_block_hash(), confirmed_head.hash);
		for block in &blocks[1..=15 - BLOCK_CONFIRMATION as usize] {
			assert!(restored.get_block(&block.hash).is_some(), "missing {}", block.hash);
		}
	}
}
