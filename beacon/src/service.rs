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

//! Per-block entropy production. Once an aeon's execution unit is
//! ready, this service repeatedly threshold-signs the previous round's
//! entropy hash, collecting missing shares from qualified peers over
//! RPC until the aggregate verifies under the group key.

use std::{
	collections::{BTreeMap, BTreeSet, VecDeque},
	sync::{Arc, Mutex},
	time::Duration,
};

use async_trait::async_trait;
use palisade_primitives::{Address, Identity, Prover};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::{
	aeon::AeonExecutionUnit,
	dkg::{AddResult, SignatureShare},
	entropy::BlockEntropy,
	p2p::NetworkView,
};

/// How many rounds ahead of the observed chain head entropy may be
/// produced.
const ENTROPY_LEAD_BLOCKS: u64 = 2;

/// Maximum wait for a signature-share RPC reply.
const RPC_WAIT: Duration = Duration::from_millis(200);

/// Bound on collect/verify round trips for a single block before the
/// aeon attempt is abandoned.
const MAX_VERIFY_ATTEMPTS: u32 = 16;

/// Partial signatures exchanged between peers for one round.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SignatureInformation {
	pub round: u64,
	pub threshold_signatures: BTreeMap<Address, SignatureShare>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntropyStatus {
	Ok,
	NotReady,
	Failed,
}

/// The face of the beacon that consensus consumes.
pub trait EntropyGenerator: Send + Sync {
	fn generate_entropy(&self, block_number: u64) -> (EntropyStatus, Option<BlockEntropy>);

	/// Advisory: the highest block number consensus has accepted.
	fn most_recent_seen(&self, round: u64);
}

/// Client side of the signature-share RPC. The reply is delivered as a
/// promise the caller polls with a bounded wait.
#[async_trait]
pub trait SignatureSharesRpc: Send + Sync {
	async fn get_signature_shares(
		&self,
		peer: Address,
		round: u64,
	) -> anyhow::Result<SignatureInformation>;
}

/// Crash-recovery storage for the active execution unit.
pub trait AeonStore: Send + Sync {
	fn save_active_unit(&self, unit: &AeonExecutionUnit) -> anyhow::Result<()>;
	fn load_active_unit(&self) -> anyhow::Result<Option<AeonExecutionUnit>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ServiceState {
	WaitForSetupCompletion,
	PrepareEntropyGeneration,
	CollectSignatures,
	VerifySignatures,
	Complete,
}

impl std::fmt::Display for ServiceState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let text = match self {
			ServiceState::WaitForSetupCompletion => "Waiting for setup completion",
			ServiceState::PrepareEntropyGeneration => "Preparing entropy generation",
			ServiceState::CollectSignatures => "Collecting signatures",
			ServiceState::VerifySignatures => "Verifying signatures",
			ServiceState::Complete => "Completion state",
		};
		write!(f, "{text}")
	}
}

/// State shared between the service task, the RPC server handler and
/// entropy consumers. One mutex guards both maps, as they are always
/// touched together.
#[derive(Default)]
struct EntropyCache {
	signatures_being_built: BTreeMap<u64, SignatureInformation>,
	completed_block_entropy: BTreeMap<u64, BlockEntropy>,
	most_recent_round_seen: u64,
	active_rounds: Option<(u64, u64)>,
}

/// Cloneable read/serve side of a running beacon service.
#[derive(Clone)]
pub struct BeaconHandle {
	cache: Arc<Mutex<EntropyCache>>,
}

impl BeaconHandle {
	/// RPC server endpoint: the partial signatures currently held for
	/// `round`, or an empty struct when the round is unknown.
	pub fn get_signature_shares(&self, round: u64) -> SignatureInformation {
		let cache = self.cache.lock().expect("beacon cache poisoned");
		cache.signatures_being_built.get(&round).cloned().unwrap_or_default()
	}
}

impl EntropyGenerator for BeaconHandle {
	fn generate_entropy(&self, block_number: u64) -> (EntropyStatus, Option<BlockEntropy>) {
		let cache = self.cache.lock().expect("beacon cache poisoned");
		if let Some(entropy) = cache.completed_block_entropy.get(&block_number) {
			return (EntropyStatus::Ok, Some(entropy.clone()));
		}
		match cache.active_rounds {
			Some((start, end)) if (start..=end).contains(&block_number) =>
				(EntropyStatus::NotReady, None),
			_ => (EntropyStatus::Failed, None),
		}
	}

	fn most_recent_seen(&self, round: u64) {
		let mut cache = self.cache.lock().expect("beacon cache poisoned");
		cache.most_recent_round_seen = round;
	}
}

pub struct BeaconService {
	certificate: Prover,
	identity: Identity,
	rpc: Arc<dyn SignatureSharesRpc>,
	network: Arc<dyn NetworkView>,
	store: Option<Arc<dyn AeonStore>>,
	cache: Arc<Mutex<EntropyCache>>,

	aeon_ready: UnboundedReceiver<AeonExecutionUnit>,
	reloaded: VecDeque<AeonExecutionUnit>,

	state: ServiceState,
	active: Option<AeonExecutionUnit>,
	entropy_previous: Option<BlockEntropy>,
	entropy_being_created: Option<BlockEntropy>,
	pending_peer: Option<Address>,
	random_counter: usize,
	verify_attempts: u32,
}

impl BeaconService {
	pub fn new(
		certificate: Prover,
		rpc: Arc<dyn SignatureSharesRpc>,
		network: Arc<dyn NetworkView>,
		aeon_ready: UnboundedReceiver<AeonExecutionUnit>,
		store: Option<Arc<dyn AeonStore>>,
	) -> (Self, BeaconHandle) {
		let identity = certificate.identity();
		let cache = Arc::new(Mutex::new(EntropyCache::default()));

		let mut service = BeaconService {
			certificate,
			identity,
			rpc,
			network,
			store,
			cache: cache.clone(),
			aeon_ready,
			reloaded: VecDeque::new(),
			state: ServiceState::WaitForSetupCompletion,
			active: None,
			entropy_previous: None,
			entropy_being_created: None,
			pending_peer: None,
			random_counter: 0,
			verify_attempts: 0,
		};
		service.reload_state();
		(service, BeaconHandle { cache })
	}

	/// Recover a mid-aeon execution unit after a crash-restart, so the
	/// DKG does not have to re-run.
	fn reload_state(&mut self) {
		let Some(store) = self.store.as_ref() else { return };
		match store.load_active_unit() {
			Ok(Some(mut unit)) => {
				info!(
					"recovered aeon keys valid for rounds {}..={}",
					unit.aeon.round_start, unit.aeon.round_end
				);
				for member in unit.manager.qual().clone() {
					self.network.connect_to(&member);
				}
				unit.manager.set_certificate(self.certificate.clone());
				self.reloaded.push_back(unit);
			},
			Ok(None) => info!("no stored beacon state found"),
			Err(error) => warn!("failed to load beacon state: {error:#}"),
		}
	}

	fn save_state(&self) {
		let (Some(store), Some(unit)) = (self.store.as_ref(), self.active.as_ref()) else {
			return;
		};
		if let Err(error) = store.save_active_unit(unit) {
			warn!("failed to persist beacon state: {error:#}");
		}
	}

	pub async fn run(mut self) {
		loop {
			let current = self.state;
			let (next, delay) = self.step().await;
			if next != current {
				debug!("beacon state {current} -> {next}");
			}
			self.state = next;
			tokio::time::sleep(delay).await;
		}
	}

	async fn step(&mut self) -> (ServiceState, Duration) {
		match self.state {
			ServiceState::WaitForSetupCompletion => self.on_wait_for_setup_completion(),
			ServiceState::PrepareEntropyGeneration => self.on_prepare_entropy_generation(),
			ServiceState::CollectSignatures => self.on_collect_signatures(),
			ServiceState::VerifySignatures => self.on_verify_signatures().await,
			ServiceState::Complete => self.on_complete(),
		}
	}

	fn on_wait_for_setup_completion(&mut self) -> (ServiceState, Duration) {
		self.active = None;

		let next_unit = self
			.reloaded
			.pop_front()
			.or_else(|| self.aeon_ready.try_recv().ok());
		if let Some(unit) = next_unit {
			self.entropy_previous = Some(unit.aeon.block_entropy_previous.clone());
			self.entropy_being_created = Some(unit.block_entropy.clone());
			{
				let mut cache = self.cache.lock().expect("beacon cache poisoned");
				cache.active_rounds = Some((unit.aeon.round_start, unit.aeon.round_end));
			}
			self.active = Some(unit);
			self.verify_attempts = 0;
			self.save_state();
			return (ServiceState::PrepareEntropyGeneration, Duration::ZERO);
		}

		(ServiceState::WaitForSetupCompletion, Duration::from_millis(500))
	}

	/// The node is out of sync when the chain has already moved past the
	/// aeon being generated for (possible while catching up after a
	/// restart).
	fn out_of_sync(&self) -> bool {
		let Some(active) = self.active.as_ref() else { return false };
		let most_recent = self
			.cache
			.lock()
			.expect("beacon cache poisoned")
			.most_recent_round_seen;
		if most_recent > active.aeon.round_end {
			warn!(
				"most recent seen round {most_recent} exceeds aeon end {}",
				active.aeon.round_end
			);
			return true;
		}
		false
	}

	fn on_prepare_entropy_generation(&mut self) -> (ServiceState, Duration) {
		if self.out_of_sync() {
			return (ServiceState::WaitForSetupCompletion, Duration::ZERO);
		}
		let (Some(active), Some(previous), Some(being_created)) = (
			self.active.as_mut(),
			self.entropy_previous.as_ref(),
			self.entropy_being_created.as_ref(),
		) else {
			return (ServiceState::WaitForSetupCompletion, Duration::ZERO);
		};

		active.manager.set_message(previous.entropy_as_sha256());
		let Some(share) = active.manager.sign() else {
			warn!("no signing share available for round {}", being_created.block_number);
			return (ServiceState::WaitForSetupCompletion, Duration::ZERO);
		};
		active.member_share = Some(share.clone());

		let round = being_created.block_number;
		let mut cache = self.cache.lock().expect("beacon cache poisoned");
		let entry = cache
			.signatures_being_built
			.entry(round)
			.or_insert_with(|| SignatureInformation { round, ..Default::default() });
		entry.threshold_signatures.insert(*self.identity.address(), share);

		self.verify_attempts = 0;
		(ServiceState::CollectSignatures, Duration::ZERO)
	}

	fn on_collect_signatures(&mut self) -> (ServiceState, Duration) {
		if self.out_of_sync() {
			return (ServiceState::WaitForSetupCompletion, Duration::ZERO);
		}
		let Some(active) = self.active.as_ref() else {
			return (ServiceState::WaitForSetupCompletion, Duration::ZERO);
		};
		let Some(round) =
			self.entropy_being_created.as_ref().map(|entropy| entropy.block_number)
		else {
			return (ServiceState::WaitForSetupCompletion, Duration::ZERO);
		};

		// Don't run ahead of the chain, and don't bother without peers.
		let most_recent = self
			.cache
			.lock()
			.expect("beacon cache poisoned")
			.most_recent_round_seen;
		if round > most_recent + ENTROPY_LEAD_BLOCKS ||
			self.network.connected_peers().is_empty()
		{
			return (ServiceState::CollectSignatures, Duration::from_millis(5));
		}

		// Prefer qual members whose signature we are still missing.
		let mut missing: BTreeSet<Address> = active.manager.qual().clone();
		{
			let cache = self.cache.lock().expect("beacon cache poisoned");
			if let Some(information) = cache.signatures_being_built.get(&round) {
				for address in information.threshold_signatures.keys() {
					missing.remove(address);
				}
			}
		}
		if missing.is_empty() {
			debug!("all qual signatures held for round {round}, re-querying a random member");
			missing = active.manager.qual().clone();
			missing.remove(self.identity.address());
		}
		if missing.is_empty() {
			return (ServiceState::CollectSignatures, Duration::from_millis(5));
		}

		let choice = self.random_counter % missing.len();
		self.random_counter = self.random_counter.wrapping_add(1);
		self.pending_peer = missing.into_iter().nth(choice);

		(ServiceState::VerifySignatures, Duration::ZERO)
	}

	async fn on_verify_signatures(&mut self) -> (ServiceState, Duration) {
		if self.out_of_sync() {
			return (ServiceState::WaitForSetupCompletion, Duration::ZERO);
		}
		let Some(round) =
			self.entropy_being_created.as_ref().map(|entropy| entropy.block_number)
		else {
			return (ServiceState::WaitForSetupCompletion, Duration::ZERO);
		};
		let Some(peer) = self.pending_peer.take() else {
			return (ServiceState::CollectSignatures, Duration::ZERO);
		};

		self.verify_attempts += 1;
		if self.verify_attempts > MAX_VERIFY_ATTEMPTS {
			warn!("round {round} exhausted verification attempts, dropping aeon");
			return (ServiceState::WaitForSetupCompletion, Duration::ZERO);
		}

		let reply =
			tokio::time::timeout(RPC_WAIT, self.rpc.get_signature_shares(peer, round)).await;
		let information = match reply {
			Ok(Ok(information)) => information,
			Ok(Err(error)) => {
				warn!("signature share request to {peer} failed: {error:#}");
				return (ServiceState::CollectSignatures, Duration::from_millis(100));
			},
			Err(_) => {
				debug!("signature share request to {peer} timed out");
				return (ServiceState::CollectSignatures, Duration::from_millis(100));
			},
		};

		if information.threshold_signatures.is_empty() {
			debug!("peer {peer} had no signatures for round {round}");
			return (ServiceState::CollectSignatures, Duration::from_millis(100));
		}
		if information.round != round {
			warn!("peer {peer} answered for round {} not {round}", information.round);
			return (ServiceState::CollectSignatures, Duration::ZERO);
		}

		let Some(active) = self.active.as_mut() else {
			return (ServiceState::WaitForSetupCompletion, Duration::ZERO);
		};
		{
			let mut cache = self.cache.lock().expect("beacon cache poisoned");
			let entry = cache
				.signatures_being_built
				.entry(round)
				.or_insert_with(|| SignatureInformation { round, ..Default::default() });
			for (address, share) in information.threshold_signatures {
				entry.threshold_signatures.insert(address, share.clone());
				match active.manager.add_signature_part(&share.identity, &share.signature) {
					AddResult::InvalidSignature =>
						warn!("invalid signature share from {address}"),
					AddResult::NotMember =>
						warn!("signature share from non qual member {address}"),
					AddResult::SignatureAlreadyAdded | AddResult::Added => {},
				}
				if active.manager.can_verify() {
					break;
				}
			}
		}

		if active.manager.can_verify() && active.manager.verify() {
			return (ServiceState::Complete, Duration::ZERO);
		}
		(ServiceState::CollectSignatures, Duration::ZERO)
	}

	fn on_complete(&mut self) -> (ServiceState, Duration) {
		if self.out_of_sync() {
			return (ServiceState::WaitForSetupCompletion, Duration::ZERO);
		}
		let (Some(active), Some(mut being_created)) =
			(self.active.as_ref(), self.entropy_being_created.take())
		else {
			return (ServiceState::WaitForSetupCompletion, Duration::ZERO);
		};

		let round = being_created.block_number;
		being_created.group_signature = active.manager.group_signature().unwrap_or_default();
		info!("entropy generated for round {round}");

		let aeon_length = active.aeon.round_end - active.aeon.round_start + 1;
		let max_cache = (aeon_length * 3) as usize;
		{
			let mut cache = self.cache.lock().expect("beacon cache poisoned");
			cache.completed_block_entropy.insert(round, being_created.clone());
			while cache.completed_block_entropy.len() > max_cache {
				cache.completed_block_entropy.pop_first();
			}
			while cache.signatures_being_built.len() > max_cache {
				cache.signatures_being_built.pop_first();
			}
		}

		if round < active.aeon.round_end {
			let mut next = BlockEntropy::default();
			next.select_copy(&being_created);
			next.block_number = round + 1;
			self.entropy_previous = Some(being_created);
			self.entropy_being_created = Some(next);
			return (ServiceState::PrepareEntropyGeneration, Duration::ZERO);
		}

		info!(
			"aeon complete at round {round}, waiting for the next execution unit"
		);
		(ServiceState::WaitForSetupCompletion, Duration::ZERO)
	}
}
