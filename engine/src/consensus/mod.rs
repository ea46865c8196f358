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

//! Consensus enforcement.
//!
//! Stakers form a cabinet which runs a DKG to obtain a group public
//! key; the subset that completes the DKG (qual) threshold-signs each
//! previous group signature, and that entropy ranks qual members per
//! block. The top-ranked member produces the heaviest block; lower
//! ranks must wait additional block intervals before competing, so the
//! best live miner wins.

pub mod stake;

use std::{
	collections::{BTreeMap, BTreeSet, HashMap},
	sync::{Arc, Mutex},
};

use palisade_beacon::{
	setup::SetupHandle, BlockEntropy, DkgManager, EntropyGenerator, EntropyStatus,
};
use palisade_primitives::{Address, Clock, Digest, Identity, Prover, DIGEST_LEN};
use tracing::{debug, info, warn};

use crate::chain::{Block, MainChain};

use stake::{StakeManager, StakeSnapshot};

/// Cabinets remembered for validation of slightly stale blocks.
const HISTORY_LENGTH: usize = 8;

/// Swap rounds of the deterministic qual shuffle.
const SHUFFLE_ITERATIONS: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationStatus {
	Yes,
	No,
}

/// The DKG orchestrator as consensus sees it.
pub trait CabinetCreator: Send + Sync {
	#[allow(clippy::too_many_arguments)]
	fn start_new_cabinet(
		&self,
		members: BTreeSet<Address>,
		threshold: u32,
		round_start: u64,
		round_end: u64,
		start_time: u64,
		previous_entropy: BlockEntropy,
	);

	fn abort(&self, below: u64);
}

impl CabinetCreator for SetupHandle {
	fn start_new_cabinet(
		&self,
		members: BTreeSet<Address>,
		threshold: u32,
		round_start: u64,
		round_end: u64,
		start_time: u64,
		previous_entropy: BlockEntropy,
	) {
		SetupHandle::start_new_cabinet(
			self,
			members,
			threshold,
			round_start,
			round_end,
			start_time,
			previous_entropy,
		);
	}

	fn abort(&self, below: u64) {
		SetupHandle::abort(self, below);
	}
}

/// 64-bit linear congruential generator (Knuth's MMIX parameters). The
/// constants are part of consensus: every implementation must shuffle
/// identically.
struct Lcg(u64);

impl Lcg {
	fn next(&mut self) -> u64 {
		self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
		self.0
	}
}

/// Sort ascending, then apply a fixed number of seeded swaps.
pub fn deterministic_shuffle(container: &mut [Address], entropy: u64) {
	if container.is_empty() {
		return;
	}
	container.sort();
	let mut rng = Lcg(entropy);
	let count = container.len() as u64;
	for _ in 0..SHUFFLE_ITERATIONS {
		let left = (rng.next() % count) as usize;
		let right = (rng.next() % count) as usize;
		container.swap(left, right);
	}
}

/// The qualified set ordered by priority for the block carrying
/// `entropy`: index 0 mines first.
pub fn qual_weighted_by_entropy(qualified: &BTreeSet<Address>, entropy: u64) -> Vec<Address> {
	let mut weighted: Vec<Address> = qualified.iter().copied().collect();
	deterministic_shuffle(&mut weighted, entropy);
	weighted
}

fn should_trigger_aeon(block_number: u64, aeon_period: u64) -> bool {
	block_number % aeon_period == 0
}

pub struct Consensus {
	stake: StakeManager,
	cabinet_creator: Arc<dyn CabinetCreator>,
	beacon: Arc<dyn EntropyGenerator>,
	chain: Arc<MainChain>,
	certificate: Prover,
	mining_identity: Identity,
	clock: Arc<dyn Clock>,

	aeon_period: u64,
	max_cabinet_size: u64,
	block_interval_ms: u64,
	notarisation_enabled: bool,
	whitelist: BTreeSet<Address>,
	default_start_time: u64,

	cabinet_history: BTreeMap<u64, BTreeSet<Address>>,
	aeon_beginning_cache: Mutex<HashMap<u64, Block>>,
	current_block: Block,
	previous_block: Block,
	last_triggered_cabinet: Digest,
}

impl Consensus {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		cabinet_creator: Arc<dyn CabinetCreator>,
		beacon: Arc<dyn EntropyGenerator>,
		chain: Arc<MainChain>,
		certificate: Prover,
		clock: Arc<dyn Clock>,
		aeon_period: u64,
		max_cabinet_size: u64,
		block_interval_ms: u64,
	) -> Self {
		assert!(aeon_period > 0);
		let mining_identity = certificate.identity();
		Consensus {
			stake: StakeManager::default(),
			cabinet_creator,
			beacon,
			chain,
			certificate,
			mining_identity,
			clock,
			aeon_period,
			max_cabinet_size,
			block_interval_ms,
			notarisation_enabled: false,
			whitelist: BTreeSet::new(),
			default_start_time: 0,
			cabinet_history: BTreeMap::new(),
			aeon_beginning_cache: Mutex::new(HashMap::new()),
			current_block: Block::genesis(),
			previous_block: Block::genesis(),
			last_triggered_cabinet: Digest::EMPTY,
		}
	}

	/// Install the genesis stake snapshot.
	pub fn reset(&mut self, snapshot: StakeSnapshot) {
		info!("resetting the stake aggregate");
		let cabinet = self.stake.reset(snapshot, self.max_cabinet_size);
		self.cabinet_history.insert(0, cabinet);
	}

	pub fn set_whitelist(&mut self, whitelist: BTreeSet<Address>) {
		self.whitelist = whitelist;
	}

	pub fn set_default_start_time(&mut self, default_start_time: u64) {
		self.default_start_time = default_start_time;
	}

	pub fn set_notarisation_enabled(&mut self, enabled: bool) {
		self.notarisation_enabled = enabled;
	}

	pub fn current_block(&self) -> &Block {
		&self.current_block
	}

	pub fn previous_block(&self) -> &Block {
		&self.previous_block
	}

	/// The cabinet recorded at a trigger height, while the history lasts.
	pub fn cabinet_at(&self, trigger_block_number: u64) -> Option<&BTreeSet<Address>> {
		self.cabinet_history.get(&trigger_block_number)
	}

	pub fn stake(&mut self) -> &mut StakeManager {
		&mut self.stake
	}

	/// The first block of the aeon `current` belongs to. For blocks on a
	/// trigger height this is the beginning of the aeon they close, not
	/// the one they open.
	fn get_beginning_of_aeon(&self, current: &Block) -> Option<Block> {
		let number = current.block_number;
		let nearest_aeon = if number == 0 {
			0
		} else if number % self.aeon_period == 0 {
			number - self.aeon_period + 1
		} else {
			(number / self.aeon_period) * self.aeon_period + 1
		};

		{
			let cache = self.aeon_beginning_cache.lock().expect("aeon cache poisoned");
			if let Some(block) = cache.get(&nearest_aeon) {
				return Some(block.clone());
			}
		}

		let mut walk = current.clone();
		while !walk.block_entropy.is_aeon_beginning() && walk.block_number != 0 {
			match self.chain.get_block(&walk.previous_hash) {
				Some(prior) => walk = prior,
				None => {
					warn!(
						"failed to find the beginning of the aeon walking from {}",
						current.block_number
					);
					return None;
				},
			}
		}

		if walk.block_number == nearest_aeon {
			let mut cache = self.aeon_beginning_cache.lock().expect("aeon cache poisoned");
			cache.insert(nearest_aeon, walk.clone());
		} else {
			warn!(
				"aeon beginning mismatch: expected {nearest_aeon}, found {}",
				walk.block_number
			);
		}
		Some(walk)
	}

	/// Weight of `block` when produced by `identity`: the qualified set
	/// size minus the identity's entropy-shuffled rank, zero when not
	/// qualified. The top rank therefore takes the maximum.
	pub fn get_block_generation_weight(&self, block: &Block, identity: &Identity) -> u64 {
		let Some(beginning_of_aeon) = self.get_beginning_of_aeon(block) else { return 0 };
		let weighted = qual_weighted_by_entropy(
			&beginning_of_aeon.block_entropy.qualified,
			block.block_entropy.entropy_as_u64(),
		);

		match weighted.iter().position(|address| address == identity.address()) {
			Some(rank) => (weighted.len() - rank) as u64,
			None => 0,
		}
	}

	/// Time-slot validity: the proposed block must be signed into the
	/// window its miner's rank entitles it to. Within one block interval
	/// of the previous block nobody may produce; after that a miner of
	/// rank r waits r further intervals.
	pub fn valid_block_timing(&self, previous: &Block, proposed: &Block) -> bool {
		let identity = &proposed.miner_id;

		// Use the proposed block: it may itself begin a new aeon.
		let Some(beginning_of_aeon) = self.get_beginning_of_aeon(proposed) else {
			return false;
		};
		let qualified = &beginning_of_aeon.block_entropy.qualified;
		let weighted =
			qual_weighted_by_entropy(qualified, proposed.block_entropy.entropy_as_u64());

		if !qualified.contains(identity.address()) {
			info!(
				"miner {} attempted block {} without being in qual",
				identity.address(),
				previous.block_number + 1
			);
			return false;
		}

		let last_block_timestamp_ms = previous.timestamp * 1000;
		let proposed_timestamp_ms = proposed.timestamp * 1000;
		let time_now_ms = self.clock.now_unix() * 1000;

		if proposed_timestamp_ms > time_now_ms {
			warn!("block minted ahead of time by {}ms", proposed_timestamp_ms - time_now_ms);
			return false;
		}
		if proposed_timestamp_ms < last_block_timestamp_ms {
			warn!("block minted before its predecessor");
			return false;
		}

		let previous_window_ends = last_block_timestamp_ms + self.block_interval_ms;
		if proposed_timestamp_ms < previous_window_ends {
			debug!("cannot produce within the block interval");
			return false;
		}

		let miner_rank = weighted
			.iter()
			.position(|address| address == identity.address())
			.expect("qual membership checked above") as u64;

		proposed_timestamp_ms > previous_window_ends + miner_rank * self.block_interval_ms
	}

	/// Signature checks over a new aeon beginning: qual drawn from the
	/// stake-derived cabinet, and enough of qual ECDSA-signed the
	/// entropy digest.
	fn enough_qual_signed(&self, previous: &Block, current: &Block) -> bool {
		let cabinet = self.stake.build_cabinet(previous, self.max_cabinet_size, &self.whitelist);
		if cabinet.is_empty() {
			warn!("empty cabinet while validating block {}", current.block_number);
			return false;
		}

		let required_qual_size = cabinet.len() - cabinet.len() / 3;
		let entropy = &current.block_entropy;
		let qualified = &entropy.qualified;
		let confirmations = &entropy.confirmations;

		if qualified.len() < required_qual_size || qualified.len() > cabinet.len() {
			warn!("aeon beginning with a mis-sized qualified set: {}", qualified.len());
			return false;
		}

		let mut total_confirmations = 0usize;
		for member in qualified {
			if !cabinet.contains(member) {
				warn!("unknown identity {member} in the qualified set");
				return false;
			}
			if let Some(signature) = confirmations.get(&entropy.to_qual_index(member)) {
				if !Identity::from_address(*member)
					.verify(entropy.digest.as_bytes(), signature)
				{
					warn!("bad confirmation signature by {member}");
					return false;
				}
				total_confirmations += 1;
			}
		}

		if total_confirmations < required_qual_size {
			warn!(
				"not enough confirmations: {total_confirmations} of {required_qual_size} required"
			);
			return false;
		}
		true
	}

	fn valid_notarisation_keys(&self, current: &Block) -> bool {
		let entropy = &current.block_entropy;
		for member in &entropy.qualified {
			let Some((public_key, signature)) = entropy.aeon_notarisation_keys.get(member)
			else {
				return false;
			};
			if !Identity::from_address(*member).verify(public_key, signature) {
				return false;
			}
		}
		true
	}

	/// Full validity check for an incoming block.
	pub fn valid_block(&self, current: &Block) -> ValidationStatus {
		let invalid = |reason: &str| {
			warn!("block {} rejected: {reason}", current.block_number);
			ValidationStatus::No
		};

		if current.block_number == 0 {
			return ValidationStatus::Yes;
		}

		// A loose block has no preceding block to check against.
		let Some(preceding) = self.chain.get_block(&current.previous_hash) else {
			return invalid("previous block not found");
		};

		if current.hash.as_bytes().len() != DIGEST_LEN ||
			current.previous_hash.as_bytes().len() != DIGEST_LEN
		{
			return invalid("malformed digests");
		}
		if current.block_number != current.block_entropy.block_number {
			return invalid("entropy is for a different block");
		}
		if current.block_number != preceding.block_number + 1 {
			return invalid("incorrect block number");
		}

		let block_entropy = &current.block_entropy;
		let qualified_cabinet;
		let group_public_key;

		if should_trigger_aeon(preceding.block_number, self.aeon_period) {
			// This block must begin a new aeon.
			if !block_entropy.is_aeon_beginning() {
				return invalid("expected a new aeon beginning");
			}
			if !self.enough_qual_signed(&preceding, current) {
				return invalid("bad aeon starting point");
			}

			qualified_cabinet = block_entropy.qualified.clone();
			group_public_key = block_entropy.group_public_key.clone();

			if qualified_cabinet.len() > self.max_cabinet_size as usize {
				return invalid("too many members in qual");
			}
			if self.notarisation_enabled && !self.valid_notarisation_keys(current) {
				return invalid("invalid notarisation keys");
			}
		} else {
			// Mid-aeon blocks must carry the aeon's qualified set
			// unchanged.
			let Some(beginning_of_aeon) = self.get_beginning_of_aeon(current) else {
				return invalid("aeon beginning unreachable");
			};
			qualified_cabinet = beginning_of_aeon.block_entropy.qualified.clone();
			group_public_key = beginning_of_aeon.block_entropy.group_public_key.clone();

			if beginning_of_aeon.block_entropy.qualified != block_entropy.qualified {
				return invalid("mismatched qualified field");
			}
		}

		if current.weight != self.get_block_generation_weight(current, &current.miner_id) {
			return invalid("incorrect weight");
		}

		// Signed by a member of qual, over the block hash.
		if !qualified_cabinet.contains(current.miner_id.address()) ||
			!current.verify_miner_signature()
		{
			return invalid("not signed by a qual member");
		}

		// The entropy must be a threshold signature of the previous
		// block's entropy.
		if !DkgManager::verify_group(
			&group_public_key,
			preceding.block_entropy.entropy_as_sha256().as_bytes(),
			&block_entropy.group_signature,
		) {
			return invalid("entropy is not a signature of the previous");
		}

		// Last: the timing checks rely on a fully well-formed block.
		if !self.valid_block_timing(&preceding, current) {
			return invalid("bad timings");
		}

		ValidationStatus::Yes
	}

	/// Whether `block` is a cabinet trigger not yet acted upon. Keyed by
	/// hash so alternating forks can each trigger at one height.
	fn should_trigger_new_cabinet(&mut self, block: &Block) -> bool {
		if self.last_triggered_cabinet != block.hash &&
			should_trigger_aeon(block.block_number, self.aeon_period)
		{
			self.last_triggered_cabinet = block.hash;
			return true;
		}
		false
	}

	/// Advance consensus to a newly accepted block, kicking off the next
	/// aeon's DKG on trigger heights.
	pub fn update_current_block(&mut self, current: Block) {
		let one_ahead = current.block_number == self.current_block.block_number + 1;
		if current.block_number > self.current_block.block_number && !one_ahead {
			warn!(
				"updating consensus by more than one block: {} -> {}",
				self.current_block.block_number, current.block_number
			);
		}

		if current.block_number == 0 {
			self.current_block = current.clone();
		} else {
			self.current_block = current.clone();
			match self.chain.get_block(&current.previous_hash) {
				Some(prior) => self.previous_block = prior,
				None => {
					warn!("failed to find the block preceding the update");
					return;
				},
			}
		}

		self.stake.update_current_block(self.current_block.block_number);

		if self.should_trigger_new_cabinet(&current) {
			let cabinet =
				self.stake
					.build_cabinet(&self.current_block, self.max_cabinet_size, &self.whitelist);
			if cabinet.is_empty() {
				warn!("failed to build a cabinet for block {}", current.block_number);
				return;
			}

			self.cabinet_history.insert(current.block_number, cabinet.clone());
			while self.cabinet_history.len() > HISTORY_LENGTH {
				self.cabinet_history.pop_first();
			}

			if cabinet.contains(self.mining_identity.address()) {
				let threshold = (cabinet.len() as u32 - 1) / 3 + 1;
				let round_start = self.current_block.block_number;

				let mut last_block_time = current.timestamp;
				if current.block_number == 0 {
					last_block_time = self.default_start_time;
				}
				let block_interval = 1;

				info!(
					"block {}: creating new aeon, threshold {threshold}, cabinet {}",
					round_start,
					cabinet.len()
				);
				// Repeat triggers for the same aeon are dropped downstream.
				self.cabinet_creator.start_new_cabinet(
					cabinet,
					threshold,
					round_start + 1,
					round_start + self.aeon_period,
					last_block_time + block_interval,
					current.block_entropy.clone(),
				);
			}
		}

		self.beacon.most_recent_seen(self.current_block.block_number);
		self.cabinet_creator.abort(self.current_block.block_number);
	}

	/// Propose the next block if the beacon is ready and it is our time
	/// slot. The returned block still needs packing, a digest and a
	/// signature.
	pub fn generate_next_block(&mut self) -> Option<Block> {
		let block_number = self.current_block.block_number + 1;

		// Entropy first: the first block of an aeon takes its qualified
		// set from here, and weight depends on it.
		let (status, entropy) = self.beacon.generate_entropy(block_number);
		if status != EntropyStatus::Ok {
			return None;
		}

		let mut block = Block {
			previous_hash: self.current_block.hash,
			block_number,
			miner_id: self.mining_identity,
			timestamp: self.clock.now_unix(),
			block_entropy: entropy?,
			..Block::default()
		};
		block.weight = self.get_block_generation_weight(&block, &self.mining_identity);

		// The previous block's entropy decides whether it is our turn
		// yet.
		if !self.valid_block_timing(&self.current_block, &block) {
			return None;
		}

		if let Some(beginning_of_aeon) = self.get_beginning_of_aeon(&block) {
			if block.weight != beginning_of_aeon.block_entropy.qualified.len() as u64 {
				debug!("producing a non-heaviest block at {}", block.block_number);
			}
		}

		Some(block)
	}

	/// Finalize a packed block: digest then miner signature.
	pub fn sign_block(&self, block: &mut Block) {
		block.update_digest();
		block.miner_signature = self.certificate.sign(block.hash.as_bytes());
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chain::{BlockStatus, Mode};
	use palisade_beacon::{testing::completed_execution_units, AeonExecutionUnit, SignatureShare};
	use palisade_primitives::ManualClock;

	const AEON_PERIOD: u64 = 5;
	const INTERVAL_MS: u64 = 1000;
	const NOW: u64 = 1_000_000;

	#[derive(Default)]
	struct RecordingCreator {
		starts: Mutex<Vec<(usize, u32, u64, u64, u64)>>,
		aborts: Mutex<Vec<u64>>,
	}

	impl CabinetCreator for RecordingCreator {
		fn start_new_cabinet(
			&self,
			members: BTreeSet<Address>,
			threshold: u32,
			round_start: u64,
			round_end: u64,
			start_time: u64,
			_previous_entropy: BlockEntropy,
		) {
			self.starts.lock().unwrap().push((
				members.len(),
				threshold,
				round_start,
				round_end,
				start_time,
			));
		}

		fn abort(&self, below: u64) {
			self.aborts.lock().unwrap().push(below);
		}
	}

	#[derive(Default)]
	struct StubBeacon {
		entropy: Mutex<HashMap<u64, BlockEntropy>>,
		seen: Mutex<Vec<u64>>,
	}

	impl EntropyGenerator for StubBeacon {
		fn generate_entropy(&self, block_number: u64) -> (EntropyStatus, Option<BlockEntropy>) {
			match self.entropy.lock().unwrap().get(&block_number) {
				Some(entropy) => (EntropyStatus::Ok, Some(entropy.clone())),
				None => (EntropyStatus::NotReady, None),
			}
		}

		fn most_recent_seen(&self, round: u64) {
			self.seen.lock().unwrap().push(round);
		}
	}

	type Units = Vec<(Prover, AeonExecutionUnit)>;

	/// Threshold-sign `message` with the aeon's managers.
	fn group_sign(units: &mut Units, message: Digest) -> Vec<u8> {
		let shares: Vec<SignatureShare> = units
			.iter_mut()
			.map(|(_, unit)| {
				unit.manager.set_message(message);
				unit.manager.sign().unwrap()
			})
			.collect();

		let manager = &mut units[0].1.manager;
		for share in &shares[1..] {
			manager.add_signature_part(&share.identity, &share.signature);
			if manager.can_verify() {
				break;
			}
		}
		assert!(manager.verify());
		manager.group_signature().unwrap()
	}

	/// A fully confirmed aeon-beginning entropy whose group signature
	/// signs `previous`.
	fn aeon_beginning_entropy(units: &mut Units, previous: &BlockEntropy) -> BlockEntropy {
		let mut entropy = units[0].1.block_entropy.clone();
		entropy.hash_self();
		let confirmations: Vec<(u16, Vec<u8>)> = units
			.iter()
			.map(|(prover, _)| {
				let index = entropy.to_qual_index(&prover.address());
				(index, prover.sign(entropy.digest.as_bytes()))
			})
			.collect();
		entropy.confirmations.extend(confirmations);
		entropy.group_signature = group_sign(units, previous.entropy_as_sha256());
		entropy
	}

	/// Build a block for `miner` with consistent weight, timing and
	/// signature.
	fn make_block(
		consensus: &Consensus,
		previous: &Block,
		entropy: BlockEntropy,
		miner: &Prover,
	) -> Block {
		let mut block = Block {
			previous_hash: previous.hash,
			block_number: previous.block_number + 1,
			miner_id: miner.identity(),
			block_entropy: entropy,
			..Block::default()
		};
		block.weight = consensus.get_block_generation_weight(&block, &miner.identity());
		let qual_size = 4u64;
		let rank = qual_size - block.weight;
		// One second past the rank's time slot.
		block.timestamp = previous.timestamp + rank + 2;
		resign(&mut block, miner);
		block
	}

	struct Environment {
		units: Units,
		chain: Arc<MainChain>,
		clock: Arc<ManualClock>,
		creator: Arc<RecordingCreator>,
		beacon: Arc<StubBeacon>,
	}

	fn environment() -> Environment {
		Environment {
			units: completed_execution_units(4, 2, 1, AEON_PERIOD),
			chain: Arc::new(MainChain::new(Mode::InMemoryDb)),
			clock: Arc::new(ManualClock::new(NOW)),
			creator: Arc::new(RecordingCreator::default()),
			beacon: Arc::new(StubBeacon::default()),
		}
	}

	fn consensus_for(env: &Environment, miner: &Prover) -> Consensus {
		let mut consensus = Consensus::new(
			env.creator.clone(),
			env.beacon.clone(),
			env.chain.clone(),
			miner.clone(),
			env.clock.clone(),
			AEON_PERIOD,
			10,
			INTERVAL_MS,
		);
		consensus.reset(
			env.units.iter().map(|(prover, _)| (prover.address(), 100)).collect(),
		);
		consensus
	}

	fn resign(block: &mut Block, miner: &Prover) {
		block.update_digest();
		block.miner_signature = miner.sign(block.hash.as_bytes());
	}

	#[test]
	fn shuffle_is_deterministic_and_a_permutation() {
		let members: BTreeSet<Address> =
			(0..8).map(|_| Prover::generate().address()).collect();
		let first = qual_weighted_by_entropy(&members, 42);
		let second = qual_weighted_by_entropy(&members, 42);
		assert_eq!(first, second);
		assert_eq!(first.iter().copied().collect::<BTreeSet<_>>(), members);

		let other_seed = qual_weighted_by_entropy(&members, 43);
		assert_ne!(first, other_seed);
	}

	#[test]
	fn weights_are_a_permutation_with_a_unique_maximum() {
		let mut env = environment();
		let genesis = Block::genesis();
		let entropy = aeon_beginning_entropy(&mut env.units, &genesis.block_entropy);
		let consensus = consensus_for(&env, &env.units[0].0.clone());

		let mut block = Block {
			previous_hash: genesis.hash,
			block_number: 1,
			block_entropy: entropy.clone(),
			..Block::default()
		};
		block.update_digest();

		let weights: BTreeSet<u64> = env
			.units
			.iter()
			.map(|(prover, _)| consensus.get_block_generation_weight(&block, &prover.identity()))
			.collect();
		assert_eq!(weights, (1..=4).collect());

		// The maximum belongs to the entropy-shuffled rank zero.
		let ranked = qual_weighted_by_entropy(&entropy.qualified, entropy.entropy_as_u64());
		assert_eq!(
			consensus
				.get_block_generation_weight(&block, &Identity::from_address(ranked[0])),
			4
		);

		// An outsider carries no weight.
		let outsider = Prover::generate();
		assert_eq!(consensus.get_block_generation_weight(&block, &outsider.identity()), 0);
	}

	#[test]
	fn aeon_beginning_block_validates_and_the_aeon_continues() {
		let mut env = environment();
		let genesis = Block::genesis();
		let miner = env.units[2].0.clone();
		let consensus = consensus_for(&env, &miner);

		let entropy1 = aeon_beginning_entropy(&mut env.units, &genesis.block_entropy);
		let block1 = make_block(&consensus, &genesis, entropy1.clone(), &miner);
		assert_eq!(consensus.valid_block(&block1), ValidationStatus::Yes);

		// Incorrect weight.
		let mut wrong_weight = block1.clone();
		wrong_weight.weight += 1;
		resign(&mut wrong_weight, &miner);
		assert_eq!(consensus.valid_block(&wrong_weight), ValidationStatus::No);

		// Minted inside the previous block's interval.
		let mut too_early = block1.clone();
		too_early.timestamp = genesis.timestamp;
		resign(&mut too_early, &miner);
		assert_eq!(consensus.valid_block(&too_early), ValidationStatus::No);

		// Entropy tagged for a different block.
		let mut wrong_round = block1.clone();
		wrong_round.block_entropy.block_number = 2;
		resign(&mut wrong_round, &miner);
		assert_eq!(consensus.valid_block(&wrong_round), ValidationStatus::No);

		// A miner outside the qualified set.
		let outsider = Prover::generate();
		let outsider_block = make_block(&consensus, &genesis, entropy1.clone(), &outsider);
		assert_eq!(consensus.valid_block(&outsider_block), ValidationStatus::No);

		// Too few confirmations: drop down to two of four.
		let mut sparse = entropy1.clone();
		while sparse.confirmations.len() > 2 {
			sparse.confirmations.pop_last();
		}
		let sparse_block = make_block(&consensus, &genesis, sparse, &miner);
		assert_eq!(consensus.valid_block(&sparse_block), ValidationStatus::No);

		// A group signature that does not sign the previous entropy.
		let mut rogue = entropy1.clone();
		rogue.group_signature = group_sign(
			&mut env.units,
			palisade_primitives::sha256(b"something else entirely"),
		);
		let rogue_block = make_block(&consensus, &genesis, rogue, &miner);
		assert_eq!(consensus.valid_block(&rogue_block), ValidationStatus::No);

		// Accept block 1 and continue the aeon with block 2.
		assert_eq!(env.chain.add_block(block1.clone()), BlockStatus::Added);

		let mut entropy2 = BlockEntropy::default();
		entropy2.select_copy(&entropy1);
		entropy2.block_number = 2;
		entropy2.group_signature = group_sign(&mut env.units, entropy1.entropy_as_sha256());

		let miner2 = env.units[1].0.clone();
		let block2 = make_block(&consensus, &block1, entropy2.clone(), &miner2);
		assert_eq!(consensus.valid_block(&block2), ValidationStatus::Yes);

		// Mid-aeon blocks must not alter the qualified set.
		let mut shrunk = entropy2.clone();
		let dropped = *shrunk.qualified.iter().next().unwrap();
		shrunk.qualified.remove(&dropped);
		let shrunk_block = make_block(&consensus, &block1, shrunk, &miner2);
		assert_eq!(consensus.valid_block(&shrunk_block), ValidationStatus::No);
	}

	#[test]
	fn timing_respects_the_rank_window() {
		let mut env = environment();
		let genesis = Block::genesis();
		let miner = env.units[0].0.clone();
		let consensus = consensus_for(&env, &miner);

		let entropy = aeon_beginning_entropy(&mut env.units, &genesis.block_entropy);
		let block = make_block(&consensus, &genesis, entropy, &miner);
		let rank = 4 - block.weight;
		assert!(consensus.valid_block_timing(&genesis, &block));

		// Exactly on the window boundary is still too early: the slot
		// opens strictly after rank + 1 intervals.
		let mut boundary = block.clone();
		boundary.timestamp = genesis.timestamp + rank + 1;
		assert!(!consensus.valid_block_timing(&genesis, &boundary));

		// Blocks from the future are rejected.
		let mut future = block.clone();
		future.timestamp = env.clock.now_unix() + 10;
		assert!(!consensus.valid_block_timing(&genesis, &future));

		// Blocks older than their parent are rejected.
		let mut ancient = block;
		ancient.timestamp = 0;
		let mut parent = genesis.clone();
		parent.timestamp = 100;
		assert!(!consensus.valid_block_timing(&parent, &ancient));
	}

	#[test]
	fn genesis_triggers_the_first_cabinet_once() {
		let env = environment();
		let miner = env.units[0].0.clone();
		let mut consensus = consensus_for(&env, &miner);
		consensus.set_default_start_time(NOW - 50);

		consensus.update_current_block(Block::genesis());
		{
			let starts = env.creator.starts.lock().unwrap();
			assert_eq!(starts.len(), 1);
			let (members, threshold, round_start, round_end, start_time) = starts[0];
			assert_eq!(members, 4);
			assert_eq!(threshold, 2);
			assert_eq!(round_start, 1);
			assert_eq!(round_end, AEON_PERIOD);
			assert_eq!(start_time, NOW - 50 + 1);
		}
		assert_eq!(env.creator.aborts.lock().unwrap().as_slice(), &[0]);
		assert_eq!(env.beacon.seen.lock().unwrap().as_slice(), &[0]);

		// The same trigger block never fires twice.
		consensus.update_current_block(Block::genesis());
		assert_eq!(env.creator.starts.lock().unwrap().len(), 1);
		assert_eq!(consensus.cabinet_at(0).unwrap().len(), 4);
	}

	#[test]
	fn generate_next_block_waits_for_entropy_and_its_slot() {
		let mut env = environment();
		let genesis = Block::genesis();
		let miner = env.units[3].0.clone();
		let mut consensus = consensus_for(&env, &miner);
		consensus.update_current_block(genesis.clone());

		// No entropy yet: not our turn.
		assert!(consensus.generate_next_block().is_none());

		let entropy1 = aeon_beginning_entropy(&mut env.units, &genesis.block_entropy);
		env.beacon.entropy.lock().unwrap().insert(1, entropy1.clone());

		let mut block = consensus.generate_next_block().expect("entropy is available");
		assert_eq!(block.block_number, 1);
		assert_eq!(
			block.weight,
			consensus.get_block_generation_weight(&block, &miner.identity())
		);

		consensus.sign_block(&mut block);
		assert!(block.verify_miner_signature());
		assert_eq!(consensus.valid_block(&block), ValidationStatus::Yes);
	}
}
