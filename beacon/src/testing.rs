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

//! In-memory multi-node harness: a message router standing in for the
//! wire transport, canned networks/clocks, and helpers that produce
//! completed aeon execution units without running the full ceremony.

use std::{
	collections::{BTreeMap, BTreeSet},
	sync::Arc,
};

use palisade_primitives::{Address, Clock, Prover};
use rand::{rngs::StdRng, SeedableRng};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::{
	aeon::{Aeon, AeonExecutionUnit},
	crypto,
	dkg::DkgManager,
	entropy::BlockEntropy,
	messages::{DkgMessage, DkgPhase},
	p2p::{NetworkView, SecretSharePacket},
	rbc::RbcMessage,
	setup::{BeaconSetupService, SetupChannels, SetupHandle},
};

/// A network view with a fixed, always-connected peer set.
pub struct StaticNetwork {
	peers: BTreeSet<Address>,
}

impl StaticNetwork {
	pub fn new(peers: BTreeSet<Address>) -> Self {
		StaticNetwork { peers }
	}
}

impl NetworkView for StaticNetwork {
	fn connected_peers(&self) -> BTreeSet<Address> {
		self.peers.clone()
	}

	fn requested_peers(&self) -> BTreeSet<Address> {
		self.peers.clone()
	}

	fn connect_to(&self, _address: &Address) {}

	fn disconnect_from(&self, _addresses: &BTreeSet<Address>) {}
}

/// Wall clock driven by tokio's (virtual) time, so paused-time tests
/// advance protocol deadlines deterministically.
pub struct TokioClock {
	epoch: tokio::time::Instant,
	base: u64,
}

impl TokioClock {
	pub fn new(base: u64) -> Self {
		TokioClock { epoch: tokio::time::Instant::now(), base }
	}
}

impl Clock for TokioClock {
	fn now_unix(&self) -> u64 {
		self.base + self.epoch.elapsed().as_secs()
	}
}

/// Sorted provers, so prover index equals cabinet index.
pub fn sorted_provers(count: usize) -> Vec<Prover> {
	let mut provers: Vec<Prover> = (0..count).map(|_| Prover::generate()).collect();
	provers.sort_by_key(|prover| prover.address());
	provers
}

/// Run the DKG maths directly (no networking) and hand back one
/// completed execution unit per member, ready for entropy generation.
pub fn completed_execution_units(
	count: usize,
	threshold: u32,
	round_start: u64,
	round_end: u64,
) -> Vec<(Prover, AeonExecutionUnit)> {
	let provers = sorted_provers(count);
	let members: BTreeSet<Address> = provers.iter().map(Prover::address).collect();

	let mut rng = StdRng::from_entropy();
	let mut managers: Vec<DkgManager> = provers
		.iter()
		.map(|prover| {
			let mut manager = DkgManager::default();
			manager.set_certificate(prover.clone());
			manager.new_cabinet(&members, threshold);
			manager.generate_coefficients(&mut rng);
			manager
		})
		.collect();

	for from in 0..count {
		let coefficients = managers[from].get_coefficients();
		for to in 0..count {
			if from == to {
				continue;
			}
			let shares = managers[from].get_own_shares(&provers[to].address());
			let from_address = provers[from].address();
			managers[to].add_coefficients(&from_address, &coefficients);
			managers[to].add_shares(&from_address, &shares);
		}
	}
	for manager in managers.iter_mut() {
		manager.set_qual(members.clone());
		manager.compute_secret_share();
	}
	for from in 0..count {
		let coefficients = managers[from].get_qual_coefficients();
		for to in 0..count {
			if from == to {
				continue;
			}
			managers[to].add_qual_coefficients(&provers[from].address(), &coefficients);
		}
	}
	for manager in managers.iter_mut() {
		manager.compute_public_keys();
	}

	// Seed entropy standing in for the previous aeon's last block.
	let mut previous = BlockEntropy::default();
	previous.block_number = round_start.saturating_sub(1);
	previous.group_signature = b"previous aeon group signature".to_vec();

	provers
		.into_iter()
		.zip(managers)
		.map(|(prover, manager)| {
			let mut entropy = BlockEntropy {
				qualified: manager.qual().clone(),
				group_public_key: manager.group_public_key().unwrap_or_default(),
				block_number: round_start,
				..BlockEntropy::default()
			};
			entropy.hash_self();

			let unit = AeonExecutionUnit {
				block_entropy: entropy,
				manager,
				member_share: None,
				aeon: Aeon {
					members: members.clone(),
					round_start,
					round_end,
					block_entropy_previous: previous.clone(),
					start_reference_timepoint: 0,
				},
			};
			(prover, unit)
		})
		.collect()
}

/// How the router mistreats one member's traffic.
#[derive(Clone, Copy)]
pub enum Misbehaviour {
	/// Corrupt the secret share sent to the member at `victim_index`,
	/// then go silent for the rest of the ceremony (only the initial
	/// connections and first-round coefficients broadcasts get through).
	BadShareThenSilent { victim_index: usize },
}

pub struct CeremonyNode {
	pub prover: Prover,
	pub handle: SetupHandle,
	pub ready: UnboundedReceiver<AeonExecutionUnit>,
}

/// Is this outbound broadcast one the "silent" cheater is still allowed
/// to send (pre-shares traffic only)?
fn allowed_while_silent(message: &RbcMessage) -> bool {
	let RbcMessage::Broadcast { payload, .. } = message else {
		return false;
	};
	matches!(
		bincode::deserialize::<DkgMessage>(payload),
		Ok(DkgMessage::Connections(_)) |
			Ok(DkgMessage::Coefficients(crate::messages::CoefficientsMessage {
				phase: DkgPhase::Shares,
				..
			}))
	)
}

fn corrupt_share_payload() -> Vec<u8> {
	let bogus = (
		crypto::scalar_to_bytes(&blstrs::Scalar::from(0xbad_u64)),
		crypto::scalar_to_bytes(&blstrs::Scalar::from(0xbad2_u64)),
	);
	bincode::serialize(&bogus).expect("share pairs always serialize")
}

/// Spawn `count` setup services wired through an in-memory router, and
/// kick off a cabinet for the given rounds.
pub fn spawn_ceremony(
	count: usize,
	threshold: u32,
	round_start: u64,
	round_end: u64,
	misbehaving: Option<(usize, Misbehaviour)>,
) -> Vec<CeremonyNode> {
	let provers = sorted_provers(count);
	let members: BTreeSet<Address> = provers.iter().map(Prover::address).collect();
	let clock = Arc::new(TokioClock::new(1_000_000));
	let start_time = clock.now_unix() + 1;

	let mut rbc_inboxes: BTreeMap<Address, UnboundedSender<(Address, RbcMessage)>> =
		BTreeMap::new();
	let mut share_inboxes: BTreeMap<Address, UnboundedSender<(Address, SecretSharePacket)>> =
		BTreeMap::new();
	let mut pending = Vec::new();

	for prover in &provers {
		let address = prover.address();
		let (rbc_in_tx, rbc_in_rx) = unbounded_channel();
		let (rbc_out_tx, rbc_out_rx) = unbounded_channel();
		let (shares_in_tx, shares_in_rx) = unbounded_channel();
		let (shares_out_tx, shares_out_rx) = unbounded_channel::<SecretSharePacket>();
		let (ready_tx, ready_rx) = unbounded_channel();

		rbc_inboxes.insert(address, rbc_in_tx);
		share_inboxes.insert(address, shares_in_tx);
		pending.push((
			prover.clone(),
			rbc_in_rx,
			rbc_out_tx,
			rbc_out_rx,
			shares_in_rx,
			shares_out_tx,
			shares_out_rx,
			ready_tx,
			ready_rx,
		));
	}

	let mut nodes = Vec::new();
	for (index, endpoints) in pending.into_iter().enumerate() {
		let (
			prover,
			rbc_in_rx,
			rbc_out_tx,
			mut rbc_out_rx,
			shares_in_rx,
			shares_out_tx,
			mut shares_out_rx,
			ready_tx,
			ready_rx,
		) = endpoints;
		let address = prover.address();
		let behaviour = misbehaving.and_then(|(bad_index, behaviour)| {
			(bad_index == index).then_some(behaviour)
		});

		// Outbound broadcast router for this node.
		let rbc_targets = rbc_inboxes.clone();
		tokio::spawn(async move {
			while let Some((recipients, message)) = rbc_out_rx.recv().await {
				if behaviour.is_some() && !allowed_while_silent(&message) {
					continue;
				}
				for recipient in recipients {
					if let Some(inbox) = rbc_targets.get(&recipient) {
						let _ = inbox.send((address, message.clone()));
					}
				}
			}
		});

		// Outbound secret-share router for this node.
		let share_targets = share_inboxes.clone();
		let victim = match behaviour {
			Some(Misbehaviour::BadShareThenSilent { victim_index }) =>
				Some(provers[victim_index].address()),
			None => None,
		};
		tokio::spawn(async move {
			while let Some(mut packet) = shares_out_rx.recv().await {
				if victim == Some(packet.to) {
					packet.payload = corrupt_share_payload();
				}
				if let Some(inbox) = share_targets.get(&packet.to) {
					let _ = inbox.send((address, packet.clone()));
				}
			}
		});

		let peers: BTreeSet<Address> =
			members.iter().filter(|member| **member != address).copied().collect();
		let channels = SetupChannels {
			rbc_incoming: rbc_in_rx,
			rbc_outgoing: rbc_out_tx,
			shares_incoming: shares_in_rx,
			shares_outgoing: shares_out_tx,
			beacon_ready: ready_tx,
		};
		let (service, handle) = BeaconSetupService::new(
			prover.clone(),
			clock.clone(),
			Arc::new(StaticNetwork::new(peers)),
			channels,
			false,
		);
		handle.start_new_cabinet(
			members.clone(),
			threshold,
			round_start,
			round_end,
			start_time,
			BlockEntropy::default(),
		);
		tokio::spawn(service.run());

		nodes.push(CeremonyNode { prover, handle, ready: ready_rx });
	}

	nodes
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	async fn wait_ready(node: &mut CeremonyNode) -> AeonExecutionUnit {
		tokio::time::timeout(Duration::from_secs(600), node.ready.recv())
			.await
			.expect("ceremony timed out")
			.expect("setup service dropped its ready channel")
	}

	#[tokio::test(start_paused = true)]
	async fn four_node_ceremony_completes_with_full_qual() {
		let mut nodes = spawn_ceremony(4, 2, 101, 200, None);

		let mut units = Vec::new();
		for node in nodes.iter_mut() {
			units.push(wait_ready(node).await);
		}

		let expected_key = units[0].manager.group_public_key().unwrap();
		for unit in &units {
			assert_eq!(unit.manager.qual().len(), 4);
			assert_eq!(unit.manager.group_public_key().unwrap(), expected_key);
			assert_eq!(unit.block_entropy.block_number, 101);
			assert!(unit.block_entropy.is_aeon_beginning());
			assert_eq!(unit.block_entropy.confirmations.len(), 4);
			assert_eq!(unit.block_entropy.group_public_key, expected_key);
		}

		// Confirmations are real signatures by qual members over the
		// entropy digest.
		let entropy = &units[0].block_entropy;
		let qualified: Vec<Address> = entropy.qualified.iter().copied().collect();
		for (index, signature) in &entropy.confirmations {
			let member = qualified[*index as usize];
			assert!(palisade_primitives::Identity::from_address(member)
				.verify(entropy.digest.as_bytes(), signature));
		}
	}

	#[tokio::test(start_paused = true)]
	async fn byzantine_share_dealer_is_excluded_from_qual() {
		// Node 3 deals node 0 a bad share and then goes silent; it must
		// not reach qual, while the remaining three finish the aeon.
		let cheater_index = 3;
		let mut nodes = spawn_ceremony(
			4,
			2,
			11,
			20,
			Some((cheater_index, Misbehaviour::BadShareThenSilent { victim_index: 0 })),
		);
		let cheater = nodes[cheater_index].prover.address();

		let mut group_keys = Vec::new();
		for (index, node) in nodes.iter_mut().enumerate() {
			if index == cheater_index {
				continue;
			}
			let unit = wait_ready(node).await;
			assert_eq!(unit.manager.qual().len(), 3, "qual must exclude the cheater");
			assert!(!unit.manager.in_qual(&cheater));
			assert!(unit.block_entropy.confirmations.len() >= 3);
			group_keys.push(unit.block_entropy.group_public_key.clone());
		}
		// The surviving members agree on the group key.
		assert!(group_keys.windows(2).all(|pair| pair[0] == pair[1]));
	}
}
