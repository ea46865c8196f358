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

//! DKG orchestrator: a cooperatively scheduled state machine with
//! wall-clock deadlines. All honest cabinet members derive the same
//! per-state deadlines from the aeon's start reference timepoint, so a
//! failed attempt resets everyone onto the same retry window without
//! further coordination.

use std::{
	collections::{BTreeMap, BTreeSet, VecDeque},
	sync::Arc,
	time::Duration,
};

use itertools::Itertools;
use palisade_primitives::{Address, Clock, Identity, MemberIndex, Prover};
use rand::{rngs::StdRng, SeedableRng};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::{
	aeon::{Aeon, AeonExecutionUnit},
	complaints::{ComplaintAnswersManager, ComplaintsManager, QualComplaintsManager},
	dkg::ExposedShares,
	entropy::BlockEntropy,
	messages::{
		CoefficientsMessage, ComplaintsMessage, ConnectionsMessage, DkgMessage, DkgPhase,
		FinalStateMessage, NotarisationKeyMessage, SharesMessage,
	},
	p2p::{NetworkView, SecretSharePacket},
	rbc::{RbcMessage, ReliableBroadcast},
};

/// A failed DKG attempt stretches the next attempt's allotted time by
/// half, up to this multiple of the base timespan.
const MAX_DKG_BOUND_MULTIPLE: u64 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SetupState {
	Idle,
	Reset,
	ConnectToAll,
	WaitForReadyConnections,
	WaitForNotarisationKeys,
	WaitForShares,
	WaitForComplaints,
	WaitForComplaintAnswers,
	WaitForQualShares,
	WaitForQualComplaints,
	WaitForReconstructionShares,
	ComputePublicSignature,
	DryRunSigning,
	BeaconReady,
}

impl std::fmt::Display for SetupState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let text = match self {
			SetupState::Idle => "Idle",
			SetupState::Reset => "Reset",
			SetupState::ConnectToAll => "Connect to the necessary cabinet members",
			SetupState::WaitForReadyConnections => "Waiting for ready connections",
			SetupState::WaitForNotarisationKeys => "Waiting for notarisation keys",
			SetupState::WaitForShares => "Waiting for shares and coefficients",
			SetupState::WaitForComplaints => "Waiting for complaints",
			SetupState::WaitForComplaintAnswers => "Wait for complaint answers",
			SetupState::WaitForQualShares => "Waiting for qual shares",
			SetupState::WaitForQualComplaints => "Waiting for qual complaints",
			SetupState::WaitForReconstructionShares => "Waiting for reconstruction shares",
			SetupState::ComputePublicSignature => "Compute the group public signature",
			SetupState::DryRunSigning => "Dry run of signing a seed value",
			SetupState::BeaconReady => "Beacon ready",
		};
		write!(f, "{text}")
	}
}

/// Relative time-slot weights, in state order. The dry run gets half a
/// slot extra because it needs a full broadcast round plus signature
/// verification over the whole qualified set.
const TIME_SLOTS: &[(SetupState, f64)] = &[
	(SetupState::Reset, 0.0),
	(SetupState::ConnectToAll, 1.0),
	(SetupState::WaitForReadyConnections, 1.0),
	(SetupState::WaitForNotarisationKeys, 1.0),
	(SetupState::WaitForShares, 1.0),
	(SetupState::WaitForComplaints, 1.0),
	(SetupState::WaitForComplaintAnswers, 1.0),
	(SetupState::WaitForQualShares, 1.0),
	(SetupState::WaitForQualComplaints, 1.0),
	(SetupState::WaitForReconstructionShares, 1.0),
	(SetupState::ComputePublicSignature, 1.0),
	(SetupState::DryRunSigning, 1.5),
];

/// Expected seconds per DKG state for a given cabinet size. Empirical:
/// dominated by share verification, which grows quadratically.
fn time_per_state(cabinet_size: usize) -> u64 {
	match cabinet_size {
		0..=8 => 1,
		9..=10 => 3,
		11..=30 => 10,
		31..=51 => 25,
		52..=60 => 30,
		61..=90 => 130,
		_ => 2722,
	}
}

fn total_time_slots() -> f64 {
	TIME_SLOTS.iter().map(|(_, slots)| slots).sum()
}

/// Requests other components submit to the running service.
pub enum SetupCommand {
	StartNewCabinet {
		members: BTreeSet<Address>,
		threshold: u32,
		round_start: u64,
		round_end: u64,
		start_time: u64,
		previous_entropy: BlockEntropy,
	},
	/// Abandon any in-progress DKG whose round start is below the given
	/// round.
	Abort { below: u64 },
}

/// Cloneable submission side of a running setup service.
#[derive(Clone)]
pub struct SetupHandle {
	commands: UnboundedSender<SetupCommand>,
}

impl SetupHandle {
	#[allow(clippy::too_many_arguments)]
	pub fn start_new_cabinet(
		&self,
		members: BTreeSet<Address>,
		threshold: u32,
		round_start: u64,
		round_end: u64,
		start_time: u64,
		previous_entropy: BlockEntropy,
	) {
		let _ = self.commands.send(SetupCommand::StartNewCabinet {
			members,
			threshold,
			round_start,
			round_end,
			start_time,
			previous_entropy,
		});
	}

	pub fn abort(&self, below: u64) {
		let _ = self.commands.send(SetupCommand::Abort { below });
	}
}

/// Channel endpoints wiring a setup service to the transport.
pub struct SetupChannels {
	/// Raw reliable-broadcast channel traffic from peers.
	pub rbc_incoming: UnboundedReceiver<(Address, RbcMessage)>,
	/// Our reliable-broadcast traffic towards peers.
	pub rbc_outgoing: UnboundedSender<(BTreeSet<Address>, RbcMessage)>,
	/// Sealed secret-share packets from peers.
	pub shares_incoming: UnboundedReceiver<(Address, SecretSharePacket)>,
	/// Our sealed secret-share packets towards peers.
	pub shares_outgoing: UnboundedSender<SecretSharePacket>,
	/// Completed aeon execution units.
	pub beacon_ready: UnboundedSender<AeonExecutionUnit>,
}

fn node_label(index: Option<MemberIndex>) -> String {
	match index {
		Some(index) => format!("({index:03})"),
		None => "(XXX)".to_string(),
	}
}

pub struct BeaconSetupService {
	certificate: Prover,
	identity: Identity,
	clock: Arc<dyn Clock>,
	network: Arc<dyn NetworkView>,
	notarisation_enabled: bool,
	rng: StdRng,

	rbc: ReliableBroadcast,
	rbc_incoming: UnboundedReceiver<(Address, RbcMessage)>,
	rbc_deliveries: UnboundedReceiver<(Address, Vec<u8>)>,
	shares_incoming: UnboundedReceiver<(Address, SecretSharePacket)>,
	shares_outgoing: UnboundedSender<SecretSharePacket>,
	beacon_ready: UnboundedSender<AeonExecutionUnit>,
	commands: UnboundedReceiver<SetupCommand>,

	state: SetupState,
	previous_state: SetupState,
	beacon: Option<AeonExecutionUnit>,
	aeon_queue: VecDeque<AeonExecutionUnit>,
	abort_below: u64,
	index: Option<MemberIndex>,

	connections: BTreeSet<Address>,
	ready_connections: BTreeMap<Address, BTreeSet<Address>>,
	valid_dkg_members: BTreeSet<Address>,
	shares_received: BTreeSet<Address>,
	coefficients_received: BTreeSet<Address>,
	qual_coefficients_received: BTreeSet<Address>,
	reconstruction_shares_received: BTreeMap<Address, BTreeMap<Address, ExposedShares>>,
	notarisation_key_messages: BTreeMap<Address, NotarisationKeyMessage>,
	final_state_payload: BTreeMap<Address, Vec<u8>>,
	complaints_manager: ComplaintsManager,
	complaint_answers_manager: ComplaintAnswersManager,
	qual_complaints_manager: QualComplaintsManager,

	condition_to_proceed: bool,
	reference_timepoint: u64,
	expected_dkg_timespan: u64,
	state_deadline: u64,
	failures: u16,
	last_created_entropy_for: Option<u64>,
}

impl BeaconSetupService {
	pub fn new(
		certificate: Prover,
		clock: Arc<dyn Clock>,
		network: Arc<dyn NetworkView>,
		channels: SetupChannels,
		notarisation_enabled: bool,
	) -> (Self, SetupHandle) {
		let identity = certificate.identity();
		let (delivery_tx, delivery_rx) = tokio::sync::mpsc::unbounded_channel();
		let (command_tx, command_rx) = tokio::sync::mpsc::unbounded_channel();
		let rbc = ReliableBroadcast::new(
			certificate.address(),
			channels.rbc_outgoing,
			delivery_tx,
		);

		let service = BeaconSetupService {
			certificate,
			identity,
			clock,
			network,
			notarisation_enabled,
			rng: StdRng::from_entropy(),
			rbc,
			rbc_incoming: channels.rbc_incoming,
			rbc_deliveries: delivery_rx,
			shares_incoming: channels.shares_incoming,
			shares_outgoing: channels.shares_outgoing,
			beacon_ready: channels.beacon_ready,
			commands: command_rx,
			state: SetupState::Idle,
			previous_state: SetupState::Idle,
			beacon: None,
			aeon_queue: VecDeque::new(),
			abort_below: 0,
			index: None,
			connections: BTreeSet::new(),
			ready_connections: BTreeMap::new(),
			valid_dkg_members: BTreeSet::new(),
			shares_received: BTreeSet::new(),
			coefficients_received: BTreeSet::new(),
			qual_coefficients_received: BTreeSet::new(),
			reconstruction_shares_received: BTreeMap::new(),
			notarisation_key_messages: BTreeMap::new(),
			final_state_payload: BTreeMap::new(),
			complaints_manager: ComplaintsManager::default(),
			complaint_answers_manager: ComplaintAnswersManager::default(),
			qual_complaints_manager: QualComplaintsManager::default(),
			condition_to_proceed: false,
			reference_timepoint: 0,
			expected_dkg_timespan: 0,
			state_deadline: 0,
			failures: 0,
			last_created_entropy_for: None,
		};
		(service, SetupHandle { commands: command_tx })
	}

	/// Drive the state machine forever, interleaving steps with message
	/// ingestion.
	pub async fn run(mut self) {
		loop {
			let delay = self.step();
			let sleep = tokio::time::sleep(delay);
			tokio::pin!(sleep);
			loop {
				tokio::select! {
					() = &mut sleep => break,
					Some((from, message)) = self.rbc_incoming.recv() => {
						self.rbc.handle_message(from, message);
					},
					Some((from, payload)) = self.rbc_deliveries.recv() => {
						self.on_dkg_payload(from, &payload);
					},
					Some((from, packet)) = self.shares_incoming.recv() => {
						self.on_shares_packet(from, packet);
					},
					Some(command) = self.commands.recv() => {
						self.on_command(command);
					},
				}
			}
		}
	}

	/// Execute one cooperative step. Returns how long to wait before the
	/// next one.
	pub fn step(&mut self) -> Duration {
		let current = self.state;
		let (next, delay) = match current {
			SetupState::Idle => self.on_idle(),
			SetupState::Reset => self.on_reset(),
			SetupState::ConnectToAll => self.on_connect_to_all(),
			SetupState::WaitForReadyConnections => self.on_wait_for_ready_connections(),
			SetupState::WaitForNotarisationKeys => self.on_wait_for_notarisation_keys(),
			SetupState::WaitForShares => self.on_wait_for_shares(),
			SetupState::WaitForComplaints => self.on_wait_for_complaints(),
			SetupState::WaitForComplaintAnswers => self.on_wait_for_complaint_answers(),
			SetupState::WaitForQualShares => self.on_wait_for_qual_shares(),
			SetupState::WaitForQualComplaints => self.on_wait_for_qual_complaints(),
			SetupState::WaitForReconstructionShares =>
				self.on_wait_for_reconstruction_shares(),
			SetupState::ComputePublicSignature => self.on_compute_public_signature(),
			SetupState::DryRunSigning => self.on_dry_run(),
			SetupState::BeaconReady => self.on_beacon_ready(),
		};
		if next != current {
			debug!(node = %node_label(self.index), "setup state {current} -> {next}");
		}
		self.previous_state = current;
		self.state = next;
		delay
	}

	pub fn state(&self) -> SetupState {
		self.state
	}

	fn on_command(&mut self, command: SetupCommand) {
		match command {
			SetupCommand::StartNewCabinet {
				members,
				threshold,
				round_start,
				round_end,
				start_time,
				previous_entropy,
			} => self.start_new_cabinet(
				members,
				threshold,
				round_start,
				round_end,
				start_time,
				previous_entropy,
			),
			SetupCommand::Abort { below } => self.abort(below),
		}
	}

	/// Queue a DKG for a new cabinet. Repeat triggers for the same
	/// `(round_start, round_end, members)` are dropped silently.
	pub fn start_new_cabinet(
		&mut self,
		members: BTreeSet<Address>,
		mut threshold: u32,
		round_start: u64,
		round_end: u64,
		start_time: u64,
		previous_entropy: BlockEntropy,
	) {
		if !members.contains(self.identity.address()) {
			return;
		}

		// The reliable broadcast only tolerates floor((n - 1) / 3) faults;
		// a smaller signing threshold would undercut that assumption.
		let rbc_threshold = if members.len() % 3 == 0 {
			(members.len() / 3).saturating_sub(1) as u32
		} else {
			(members.len() / 3) as u32
		};
		if threshold < rbc_threshold {
			warn!("threshold below broadcast fault bound, raising to {rbc_threshold}");
			threshold = rbc_threshold;
		}

		let mut unit = AeonExecutionUnit::default();
		unit.manager.set_certificate(self.certificate.clone());
		unit.manager.new_cabinet(&members, threshold);
		unit.aeon = Aeon {
			members,
			round_start,
			round_end,
			block_entropy_previous: previous_entropy,
			start_reference_timepoint: start_time,
		};

		let is_current_round =
			self.beacon.as_ref().map(|current| current.aeon == unit.aeon).unwrap_or(false);
		let is_already_queued = self.aeon_queue.iter().any(|queued| queued.aeon == unit.aeon);
		if is_current_round || is_already_queued {
			debug!(
				node = %node_label(self.index),
				"duplicate cabinet trigger for round {round_start} dropped"
			);
			return;
		}

		info!(
			node = %node_label(self.index),
			"queueing new cabinet for rounds {round_start}..={round_end}"
		);
		self.aeon_queue.push_back(unit);
	}

	pub fn abort(&mut self, below: u64) {
		self.abort_below = below;
	}

	fn on_idle(&mut self) -> (SetupState, Duration) {
		self.beacon = None;
		self.index = None;

		if let Some(unit) = self.aeon_queue.pop_front() {
			self.beacon = Some(unit);
			self.set_time_to_proceed(SetupState::Reset);
			return (SetupState::Reset, Duration::ZERO);
		}
		(SetupState::Idle, Duration::from_millis(100))
	}

	fn on_reset(&mut self) -> (SetupState, Duration) {
		let Some(beacon) = self.beacon.as_mut() else {
			return (SetupState::Idle, Duration::ZERO);
		};
		self.index = beacon.manager.own_index();

		if self.previous_state != SetupState::Reset && self.previous_state != SetupState::Idle {
			warn!(node = %node_label(self.index), "DKG attempt failed in {}", self.previous_state);
		}

		let beacon_outdated = beacon.aeon.round_start < self.abort_below;
		let beacon_superseded = self
			.aeon_queue
			.front()
			.map(|queued| queued.aeon.round_start == beacon.aeon.round_start)
			.unwrap_or(false);
		if beacon_outdated || beacon_superseded {
			info!(
				node = %node_label(self.index),
				"aborting DKG for round {} (abort below {})",
				beacon.aeon.round_start,
				self.abort_below
			);
			return (SetupState::Idle, Duration::ZERO);
		}

		let members = beacon.aeon.members.clone();
		let threshold = beacon.manager.threshold();
		beacon.manager.new_cabinet(&members, threshold);

		self.connections.clear();
		self.ready_connections.clear();
		self.valid_dkg_members.clear();
		self.shares_received.clear();
		self.coefficients_received.clear();
		self.qual_coefficients_received.clear();
		self.reconstruction_shares_received.clear();
		self.notarisation_key_messages.clear();
		self.final_state_payload.clear();
		self.complaints_manager.reset_cabinet(*self.identity.address());
		self.complaint_answers_manager.reset_cabinet();
		self.qual_complaints_manager.reset();
		self.rbc.enable(false);

		// Wait out the reference timepoint so all members re-enter the
		// broadcast channel within the same attempt window.
		if self.timer_expired() {
			self.rbc.enable(true);
			self.rbc.reset_cabinet(members);
			self.set_time_to_proceed(SetupState::ConnectToAll);
			return (SetupState::ConnectToAll, Duration::ZERO);
		}
		(SetupState::Reset, Duration::from_millis(10))
	}

	fn on_connect_to_all(&mut self) -> (SetupState, Duration) {
		let members = self.aeon_members_without_self();
		let connected = self.network.connected_peers();
		for address in members.difference(&connected) {
			self.network.connect_to(address);
		}

		let unwanted: BTreeSet<Address> =
			self.network.requested_peers().difference(&members).copied().collect();
		if !unwanted.is_empty() {
			self.network.disconnect_from(&unwanted);
		}

		if self.timer_expired() {
			self.set_time_to_proceed(SetupState::WaitForReadyConnections);
			return (SetupState::WaitForReadyConnections, Duration::ZERO);
		}
		(SetupState::ConnectToAll, Duration::from_millis(500))
	}

	fn on_wait_for_ready_connections(&mut self) -> (SetupState, Duration) {
		let members = self.aeon_members_without_self();
		let can_see: BTreeSet<Address> = self
			.network
			.connected_peers()
			.intersection(&members)
			.copied()
			.collect();
		let required = self.pre_dkg_threshold().saturating_sub(1) as usize;

		// Contribute our own connection list once we clear the bar, and
		// again whenever it grows.
		if can_see.len() > self.connections.len() &&
			can_see.len() >= required &&
			!self.condition_to_proceed
		{
			self.connections = can_see;
			self.send_broadcast(DkgMessage::Connections(ConnectionsMessage {
				connections: self.connections.clone(),
			}));
		}

		let is_ok =
			self.ready_connections.len() >= required && self.connections.len() >= required;
		self.note_condition(is_ok);

		if self.timer_expired() || self.condition_to_proceed {
			if !self.condition_to_proceed {
				warn!(node = %node_label(self.index), "failed to see enough ready peers for DKG");
				self.set_time_to_proceed(SetupState::Reset);
				return (SetupState::Reset, Duration::ZERO);
			}

			if self.notarisation_enabled {
				self.broadcast_notarisation_keys();
				self.set_time_to_proceed(SetupState::WaitForNotarisationKeys);
				return (SetupState::WaitForNotarisationKeys, Duration::ZERO);
			}
			if let Some(beacon) = self.beacon.as_ref() {
				self.valid_dkg_members = beacon.aeon.members.clone();
			}
			self.broadcast_shares();
			self.set_time_to_proceed(SetupState::WaitForShares);
			return (SetupState::WaitForShares, Duration::ZERO);
		}
		(SetupState::WaitForReadyConnections, Duration::from_millis(100))
	}

	fn on_wait_for_notarisation_keys(&mut self) -> (SetupState, Duration) {
		let cabinet_size = self.beacon.as_ref().map(|b| b.aeon.members.len()).unwrap_or(0);
		self.note_condition(self.valid_dkg_members.len() == cabinet_size);

		if self.timer_expired() || self.condition_to_proceed {
			if self.valid_dkg_members.len() >= self.pre_dkg_threshold() as usize {
				self.broadcast_shares();
				self.set_time_to_proceed(SetupState::WaitForShares);
				return (SetupState::WaitForShares, Duration::ZERO);
			}
			warn!(
				node = %node_label(self.index),
				"received {} of {} notarisation keys",
				self.valid_dkg_members.len(),
				cabinet_size
			);
			self.set_time_to_proceed(SetupState::Reset);
			return (SetupState::Reset, Duration::ZERO);
		}
		(SetupState::WaitForNotarisationKeys, Duration::from_millis(10))
	}

	fn on_wait_for_shares(&mut self) -> (SetupState, Duration) {
		let complete: BTreeSet<Address> = self
			.coefficients_received
			.intersection(&self.shares_received)
			.filter(|address| self.valid_dkg_members.contains(address))
			.copied()
			.collect();
		self.note_condition(
			complete.len() + 1 == self.valid_dkg_members.len() &&
				!self.valid_dkg_members.is_empty(),
		);

		if self.timer_expired() || self.condition_to_proceed {
			self.broadcast_complaints();
			self.set_time_to_proceed(SetupState::WaitForComplaints);
			return (SetupState::WaitForComplaints, Duration::ZERO);
		}
		(SetupState::WaitForShares, Duration::from_millis(10))
	}

	fn on_wait_for_complaints(&mut self) -> (SetupState, Duration) {
		let received = self.complaints_manager.num_complaints_received(&self.valid_dkg_members);
		self.note_condition(received + 1 == self.valid_dkg_members.len());

		if self.timer_expired() || self.condition_to_proceed {
			self.complaints_manager.finish(&self.valid_dkg_members);
			debug!(
				node = %node_label(self.index),
				"complaints: {}",
				self.complaints_manager.complaints().len()
			);
			self.broadcast_complaint_answers();
			self.set_time_to_proceed(SetupState::WaitForComplaintAnswers);
			return (SetupState::WaitForComplaintAnswers, Duration::ZERO);
		}
		(SetupState::WaitForComplaints, Duration::from_millis(10))
	}

	fn on_wait_for_complaint_answers(&mut self) -> (SetupState, Duration) {
		let received = self
			.complaint_answers_manager
			.num_complaint_answers_received(&self.valid_dkg_members, self.identity.address());
		self.note_condition(received + 1 == self.valid_dkg_members.len());

		if self.timer_expired() || self.condition_to_proceed {
			self.check_complaint_answers();
			if self.build_qual() {
				if let Some(beacon) = self.beacon.as_mut() {
					info!(
						node = %node_label(self.index),
						"built qual of size {}",
						beacon.manager.qual().len()
					);
					beacon.manager.compute_secret_share();
				}
				self.broadcast_qual_coefficients();
				self.set_time_to_proceed(SetupState::WaitForQualShares);
				return (SetupState::WaitForQualShares, Duration::ZERO);
			}

			warn!(node = %node_label(self.index), "failed to build qualified set, resetting");
			self.set_time_to_proceed(SetupState::Reset);
			return (SetupState::Reset, Duration::ZERO);
		}
		(SetupState::WaitForComplaintAnswers, Duration::from_millis(10))
	}

	fn on_wait_for_qual_shares(&mut self) -> (SetupState, Duration) {
		let qual = self.qual();
		let complete = self
			.qual_coefficients_received
			.intersection(&qual)
			.count();
		self.note_condition(!qual.is_empty() && complete + 1 == qual.len());

		if self.timer_expired() || self.condition_to_proceed {
			self.broadcast_qual_complaints();
			self.set_time_to_proceed(SetupState::WaitForQualComplaints);
			return (SetupState::WaitForQualComplaints, Duration::ZERO);
		}
		(SetupState::WaitForQualShares, Duration::from_millis(10))
	}

	fn on_wait_for_qual_complaints(&mut self) -> (SetupState, Duration) {
		let qual = self.qual();
		let received =
			self.qual_complaints_manager.num_complaints_received(&qual, self.identity.address());
		self.note_condition(!qual.is_empty() && received + 1 == qual.len());

		if self.timer_expired() || self.condition_to_proceed {
			self.check_qual_complaints();
			let complaints = self.qual_complaints_manager.complaints_size();
			let degree = self
				.beacon
				.as_ref()
				.map(|b| b.manager.polynomial_degree() as usize)
				.unwrap_or(0);
			// More complaints than tolerable faults breaks the whole
			// honest-majority assumption for this attempt.
			if complaints > degree {
				warn!(
					node = %node_label(self.index),
					"{complaints} qual complaints exceed fault bound {degree}, resetting"
				);
				self.set_time_to_proceed(SetupState::Reset);
				return (SetupState::Reset, Duration::ZERO);
			}
			if self.qual_complaints_manager.find_complaint(self.identity.address()) {
				warn!(node = %node_label(self.index), "this node is in the qual complaints");
			}
			self.broadcast_reconstruction_shares();
			self.set_time_to_proceed(SetupState::WaitForReconstructionShares);
			return (SetupState::WaitForReconstructionShares, Duration::ZERO);
		}
		(SetupState::WaitForQualComplaints, Duration::from_millis(10))
	}

	fn on_wait_for_reconstruction_shares(&mut self) -> (SetupState, Duration) {
		let complained = self.qual_complaints_manager.complaints().clone();
		let remaining_honest: BTreeSet<Address> =
			self.qual().difference(&complained).copied().collect();
		let received = remaining_honest
			.iter()
			.filter(|member| {
				*member != self.identity.address() &&
					self.reconstruction_shares_received.contains_key(member)
			})
			.count();
		self.note_condition(!remaining_honest.is_empty() && received + 1 == remaining_honest.len());

		if self.timer_expired() || self.condition_to_proceed {
			let received_shares = std::mem::take(&mut self.reconstruction_shares_received);
			if let Some(beacon) = self.beacon.as_mut() {
				for (from, exposed) in &received_shares {
					// Reconstruction shares from qual complainees or
					// non-qual members are not considered.
					if complained.contains(from) || !beacon.manager.in_qual(from) {
						warn!(
							node = %node_label(self.index),
							"discarding reconstruction shares from invalid sender"
						);
						continue;
					}
					for (accused, shares) in exposed {
						if beacon.manager.in_qual(accused) {
							beacon.manager.verify_reconstruction_share(from, accused, shares);
						}
					}
				}

				if !beacon.manager.run_reconstruction() {
					warn!(node = %node_label(self.index), "reconstruction failed, resetting");
					self.set_time_to_proceed(SetupState::Reset);
					return (SetupState::Reset, Duration::ZERO);
				}
			}

			self.set_time_to_proceed(SetupState::ComputePublicSignature);
			return (SetupState::ComputePublicSignature, Duration::ZERO);
		}
		(SetupState::WaitForReconstructionShares, Duration::from_millis(10))
	}

	fn on_compute_public_signature(&mut self) -> (SetupState, Duration) {
		if let Some(beacon) = self.beacon.as_mut() {
			beacon.manager.compute_public_keys();
		}
		self.set_time_to_proceed(SetupState::DryRunSigning);
		(SetupState::DryRunSigning, Duration::ZERO)
	}

	/// Collect ECDSA confirmations over the aeon-beginning entropy digest
	/// from the qualified set; enough of them and the aeon is ready.
	fn on_dry_run(&mut self) -> (SetupState, Duration) {
		if self.previous_state != SetupState::DryRunSigning {
			let notarisation_keys = self.qual_notarisation_keys();
			let Some(beacon) = self.beacon.as_mut() else {
				return (SetupState::Idle, Duration::ZERO);
			};

			let mut entropy = BlockEntropy {
				qualified: beacon.manager.qual().clone(),
				group_public_key: beacon.manager.group_public_key().unwrap_or_default(),
				block_number: beacon.aeon.round_start,
				aeon_notarisation_keys: notarisation_keys,
				..BlockEntropy::default()
			};
			entropy.hash_self();

			let own_signature = self.certificate.sign(entropy.digest.as_bytes());
			let own_index = entropy.to_qual_index(self.identity.address());
			entropy.confirmations.insert(own_index, own_signature.clone());
			beacon.block_entropy = entropy;

			self.send_broadcast(DkgMessage::FinalState(FinalStateMessage {
				signature: own_signature,
			}));
		}

		let qual_len = self.qual().len();
		self.note_condition(qual_len > 0 && self.final_state_payload.len() + 1 == qual_len);

		if self.timer_expired() || self.condition_to_proceed {
			let desired_signatures = self.qual_size() as usize;
			let payloads = std::mem::take(&mut self.final_state_payload);
			let Some(beacon) = self.beacon.as_mut() else {
				return (SetupState::Idle, Duration::ZERO);
			};

			for (address, signature) in payloads {
				if Identity::from_address(address)
					.verify(beacon.block_entropy.digest.as_bytes(), &signature)
				{
					let index = beacon.block_entropy.to_qual_index(&address);
					beacon.block_entropy.confirmations.insert(index, signature);
				} else {
					warn!(
						node = %node_label(self.index),
						"invalid confirmation signature from {address}"
					);
				}
			}

			if beacon.block_entropy.confirmations.len() >= desired_signatures {
				self.set_time_to_proceed(SetupState::BeaconReady);
				return (SetupState::BeaconReady, Duration::ZERO);
			}

			warn!(
				node = %node_label(self.index),
				"collected {} confirmations, wanted {desired_signatures}",
				beacon.block_entropy.confirmations.len()
			);
			self.set_time_to_proceed(SetupState::Reset);
			return (SetupState::Reset, Duration::ZERO);
		}
		(SetupState::DryRunSigning, Duration::from_millis(10))
	}

	fn on_beacon_ready(&mut self) -> (SetupState, Duration) {
		let Some(beacon) = self.beacon.take() else {
			return (SetupState::Idle, Duration::ZERO);
		};

		let first_block = beacon.aeon.round_start;
		if self.last_created_entropy_for == Some(first_block) {
			warn!(node = %node_label(self.index), "created two conflicting aeons for {first_block}");
		}
		self.last_created_entropy_for = Some(first_block);

		info!(
			node = %node_label(self.index),
			"new beacon generated, qual {} of {}, first block {first_block}",
			beacon.manager.qual().len(),
			beacon.aeon.members.len()
		);
		let _ = self.beacon_ready.send(beacon);
		(SetupState::Idle, Duration::ZERO)
	}

	// ---- message handlers ----

	fn on_dkg_payload(&mut self, from: Address, payload: &[u8]) {
		if self.state == SetupState::Idle || !self.basic_message_check(&from) {
			return;
		}
		let message: DkgMessage = match bincode::deserialize(payload) {
			Ok(message) => message,
			Err(error) => {
				warn!(node = %node_label(self.index), "undecodable DKG payload from {from}: {error}");
				return;
			},
		};

		match message {
			DkgMessage::Connections(message) => {
				self.ready_connections.entry(from).or_insert(message.connections);
			},
			DkgMessage::Coefficients(message) => self.on_new_coefficients(from, message),
			DkgMessage::Shares(message) => self.on_exposed_shares(from, message),
			DkgMessage::Complaints(message) => {
				if let Some(beacon) = self.beacon.as_ref() {
					self.complaints_manager.add_complaints_from(
						&from,
						&message.complaints,
						&beacon.aeon.members,
					);
				}
			},
			DkgMessage::NotarisationKey(message) => self.on_notarisation_key(from, message),
			DkgMessage::FinalState(message) => {
				let in_qual = self
					.beacon
					.as_ref()
					.map(|beacon| beacon.manager.in_qual(&from))
					.unwrap_or(false);
				if in_qual {
					self.final_state_payload.entry(from).or_insert(message.signature);
				}
			},
		}
	}

	fn on_new_coefficients(&mut self, from: Address, message: CoefficientsMessage) {
		let Some(beacon) = self.beacon.as_mut() else { return };
		match message.phase {
			DkgPhase::Shares => {
				if self.coefficients_received.insert(from) {
					beacon.manager.add_coefficients(&from, &message.coefficients);
				}
			},
			DkgPhase::QualShares => {
				if self.qual_coefficients_received.insert(from) {
					beacon.manager.add_qual_coefficients(&from, &message.coefficients);
				}
			},
			phase => {
				warn!(node = %node_label(self.index), "coefficients with phase {phase} from {from}");
			},
		}
	}

	fn on_exposed_shares(&mut self, from: Address, message: SharesMessage) {
		match message.phase {
			DkgPhase::ComplaintAnswers => {
				self.complaint_answers_manager.add_complaint_answer_from(&from, message.shares);
			},
			DkgPhase::QualComplaints => {
				self.qual_complaints_manager.add_complaints_from(&from, message.shares);
			},
			DkgPhase::ReconstructionShares => {
				self.reconstruction_shares_received.entry(from).or_insert(message.shares);
			},
			phase => {
				warn!(node = %node_label(self.index), "shares with phase {phase} from {from}");
			},
		}
	}

	fn on_notarisation_key(&mut self, from: Address, message: NotarisationKeyMessage) {
		if self.valid_dkg_members.contains(&from) {
			return;
		}
		if Identity::from_address(from).verify(&message.public_key, &message.signature) {
			self.notarisation_key_messages.insert(from, message);
			self.valid_dkg_members.insert(from);
		}
	}

	/// Per-peer share packets arrive over the secret-share channel, not
	/// the broadcast channel. Plaintext packets are rejected outright.
	fn on_shares_packet(&mut self, from: Address, packet: SecretSharePacket) {
		if !packet.sealed {
			warn!(node = %node_label(self.index), "unencrypted share packet from {from} dropped");
			return;
		}
		if self.state == SetupState::Idle || !self.basic_message_check(&from) {
			return;
		}
		let shares: ExposedShares = match bincode::deserialize(&packet.payload) {
			Ok(shares) => shares,
			Err(_) => {
				warn!(node = %node_label(self.index), "undecodable share packet from {from}");
				return;
			},
		};

		if self.shares_received.insert(from) {
			if let Some(beacon) = self.beacon.as_mut() {
				beacon.manager.add_shares(&from, &shares);
			}
		} else {
			debug!(node = %node_label(self.index), "duplicate shares from {from}");
		}
	}

	fn basic_message_check(&self, from: &Address) -> bool {
		match self.beacon.as_ref() {
			Some(beacon) => beacon.aeon.members.contains(from),
			None => false,
		}
	}

	// ---- broadcast helpers ----

	fn send_broadcast(&mut self, message: DkgMessage) {
		// The question ties the payload to (message type, state, attempt)
		// so retries never cross-contaminate earlier rounds.
		let tag = format!("{}:{}:{}", message.type_tag(), self.state, self.failures);
		let payload = bincode::serialize(&message).expect("DKG messages always serialize");
		self.rbc.set_question(tag, payload);
	}

	fn broadcast_notarisation_keys(&mut self) {
		// The notarisation key pair itself is managed outside the beacon;
		// here the dealer's identity key doubles as its notarisation key.
		let public_key = self.identity.address().as_bytes().to_vec();
		let signature = self.certificate.sign(&public_key);
		let message = NotarisationKeyMessage { public_key, signature };
		self.notarisation_key_messages.insert(*self.identity.address(), message.clone());
		self.valid_dkg_members.insert(*self.identity.address());
		self.send_broadcast(DkgMessage::NotarisationKey(message));
	}

	/// Broadcast own coefficient commitments and send every member its
	/// private share pair.
	fn broadcast_shares(&mut self) {
		let Some(beacon) = self.beacon.as_mut() else { return };
		beacon.manager.generate_coefficients(&mut self.rng);

		let coefficients = beacon.manager.get_coefficients();
		let recipients: Vec<Address> = self
			.valid_dkg_members
			.iter()
			.filter(|member| *member != self.identity.address())
			.copied()
			.collect();
		for member in recipients {
			let shares = beacon.manager.get_own_shares(&member);
			let payload = bincode::serialize(&shares).expect("share pairs always serialize");
			let _ = self.shares_outgoing.send(SecretSharePacket {
				to: member,
				sealed: true,
				payload,
			});
		}

		self.send_broadcast(DkgMessage::Coefficients(CoefficientsMessage {
			phase: DkgPhase::Shares,
			coefficients,
		}));
	}

	/// Members who withheld data or whose data failed verification.
	fn compute_complaints(&mut self) -> BTreeSet<Address> {
		let mut complaints = BTreeSet::new();
		for member in &self.valid_dkg_members {
			if member == self.identity.address() {
				continue;
			}
			if !self.coefficients_received.contains(member) ||
				!self.shares_received.contains(member)
			{
				complaints.insert(*member);
			}
		}

		if let Some(beacon) = self.beacon.as_ref() {
			let verified: BTreeSet<Address> = self
				.coefficients_received
				.intersection(&self.shares_received)
				.filter(|address| self.valid_dkg_members.contains(address))
				.copied()
				.collect();
			complaints.extend(beacon.manager.compute_complaints(&verified));
		}

		for accused in &complaints {
			self.complaints_manager.add_complaint_against(accused);
		}
		complaints
	}

	fn broadcast_complaints(&mut self) {
		let complaints = self.compute_complaints();
		if !complaints.is_empty() {
			debug!(
				node = %node_label(self.index),
				"broadcasting complaints against [{}]",
				complaints.iter().join(", ")
			);
		}
		self.send_broadcast(DkgMessage::Complaints(ComplaintsMessage { complaints }));
	}

	/// Answer every complaint against us by exposing the share we sent
	/// the reporter.
	fn broadcast_complaint_answers(&mut self) {
		let mut answers = BTreeMap::new();
		if let Some(beacon) = self.beacon.as_ref() {
			for reporter in self.complaints_manager.complaints_against_self() {
				answers.insert(reporter, beacon.manager.get_own_shares(&reporter));
			}
		}
		self.send_broadcast(DkgMessage::Shares(SharesMessage {
			phase: DkgPhase::ComplaintAnswers,
			shares: answers,
		}));
	}

	/// Check each answered complaint against the answerer's commitments;
	/// unanswered or badly answered complaints condemn the answerer.
	fn check_complaint_answers(&mut self) {
		let answers = self.complaint_answers_manager.complaint_answers_received().clone();
		let Some(beacon) = self.beacon.as_mut() else { return };

		for (from, answer) in &answers {
			let mut answered = BTreeSet::new();
			for (reporter, shares) in answer {
				if self.complaints_manager.find_complaint(&from, reporter) {
					answered.insert(*reporter);
					if !beacon.manager.verify_complaint_answer(&from, reporter, shares) {
						self.complaint_answers_manager.add_complaint_against(&from);
					}
				}
			}
			if answered.len() != self.complaints_manager.complaints_count(&from) {
				self.complaint_answers_manager.add_complaint_against(&from);
			}
		}

		// A complained-against member that never published an answer at
		// all is condemned the same as one whose answer failed.
		for accused in self.complaints_manager.complaints().clone() {
			if accused != *self.identity.address() && !answers.contains_key(&accused) {
				self.complaint_answers_manager.add_complaint_against(&accused);
			}
		}
	}

	/// Build the qualified set. Fails if we are not in it or it is too
	/// small to be fault tolerant.
	fn build_qual(&mut self) -> bool {
		let Some(beacon) = self.beacon.as_mut() else { return false };
		let degree = beacon.manager.polynomial_degree() as usize;
		let heavily_complained = self.complaints_manager.over_threshold(degree);
		let qual = self
			.complaint_answers_manager
			.build_qual(&self.valid_dkg_members, &heavily_complained);
		beacon.manager.set_qual(qual.clone());

		if !qual.contains(self.identity.address()) {
			warn!(node = %node_label(self.index), "not in qual of size {}", qual.len());
			return false;
		}
		let required = self.qual_size() as usize;
		if self.qual().len() < required {
			warn!(
				node = %node_label(self.index),
				"qual size {} below required {required}",
				self.qual().len()
			);
			return false;
		}
		true
	}

	fn broadcast_qual_coefficients(&mut self) {
		let Some(beacon) = self.beacon.as_mut() else { return };
		let coefficients = beacon.manager.get_qual_coefficients();
		self.send_broadcast(DkgMessage::Coefficients(CoefficientsMessage {
			phase: DkgPhase::QualShares,
			coefficients,
		}));
	}

	fn broadcast_qual_complaints(&mut self) {
		let complaints = match self.beacon.as_ref() {
			Some(beacon) =>
				beacon.manager.compute_qual_complaints(&self.qual_coefficients_received),
			None => BTreeMap::new(),
		};
		for accused in complaints.keys() {
			self.qual_complaints_manager.add_complaint_against(accused);
		}
		self.send_broadcast(DkgMessage::Shares(SharesMessage {
			phase: DkgPhase::QualComplaints,
			shares: complaints,
		}));
	}

	fn check_qual_complaints(&mut self) {
		let received = self.qual_complaints_manager.complaints_received().clone();
		let Some(beacon) = self.beacon.as_ref() else { return };
		for (sender, exposed) in received {
			for (accused, shares) in &exposed {
				if beacon.manager.in_qual(accused) {
					let to_blame = beacon.manager.verify_qual_complaint(&sender, accused, shares);
					self.qual_complaints_manager.add_complaint_against(&to_blame);
				}
			}
		}
	}

	/// Expose the shares we hold of every member complained against in
	/// qual so their contribution can be reconstructed.
	fn broadcast_reconstruction_shares(&mut self) {
		let complained = self.qual_complaints_manager.complaints().clone();
		let mut exposed = BTreeMap::new();
		if let Some(beacon) = self.beacon.as_mut() {
			for accused in &complained {
				beacon.manager.add_reconstruction_share(accused);
				exposed.insert(*accused, beacon.manager.get_received_shares(accused));
			}
		}
		self.send_broadcast(DkgMessage::Shares(SharesMessage {
			phase: DkgPhase::ReconstructionShares,
			shares: exposed,
		}));
	}

	fn qual_notarisation_keys(&self) -> BTreeMap<Address, (Vec<u8>, Vec<u8>)> {
		if !self.notarisation_enabled {
			return BTreeMap::new();
		}
		self.qual()
			.iter()
			.filter_map(|member| {
				self.notarisation_key_messages.get(member).map(|message| {
					(*member, (message.public_key.clone(), message.signature.clone()))
				})
			})
			.collect()
	}

	// ---- thresholds and timing ----

	fn qual(&self) -> BTreeSet<Address> {
		self.beacon
			.as_ref()
			.map(|beacon| beacon.manager.qual().clone())
			.unwrap_or_default()
	}

	fn aeon_members_without_self(&self) -> BTreeSet<Address> {
		self.beacon
			.as_ref()
			.map(|beacon| {
				beacon
					.aeon
					.members
					.iter()
					.filter(|member| *member != self.identity.address())
					.copied()
					.collect()
			})
			.unwrap_or_default()
	}

	/// Peers that must be visibly connected before shares are dealt.
	fn pre_dkg_threshold(&self) -> u32 {
		let Some(beacon) = self.beacon.as_ref() else { return u32::MAX };
		let cabinet_size = beacon.aeon.members.len() as u32;
		let threshold = beacon.manager.polynomial_degree() + 1;

		let required = threshold + cabinet_size / 3;
		if required < 2 {
			3
		} else {
			required
		}
	}

	/// Minimum size of the qualified set: `max(ceil(2n/3), t + 1)`.
	fn qual_size(&self) -> u32 {
		let Some(beacon) = self.beacon.as_ref() else { return u32::MAX };
		let cabinet_size = beacon.aeon.members.len() as u32;
		let proposed = cabinet_size - cabinet_size / 3;
		proposed.max(beacon.manager.polynomial_degree() + 1)
	}

	fn note_condition(&mut self, is_ok: bool) {
		if is_ok && !self.condition_to_proceed {
			self.condition_to_proceed = true;
			let now = self.clock.now_unix();
			debug!(
				node = %node_label(self.index),
				"state \"{}\" ready with {}s to spare",
				self.state,
				self.state_deadline.saturating_sub(now)
			);
		}
	}

	fn timer_expired(&self) -> bool {
		self.clock.now_unix() >= self.state_deadline
	}

	/// Set the deadline for the state being entered. Entering RESET also
	/// (re)derives the attempt window: the reference timepoint advances
	/// by the expected timespan per failure, with the timespan growing
	/// 1.5x each time up to a bound, so every honest member lands on the
	/// same window.
	fn set_time_to_proceed(&mut self, state: SetupState) {
		self.condition_to_proceed = false;
		let current_time = self.clock.now_unix();
		let Some(beacon) = self.beacon.as_ref() else { return };

		let cabinet_size = beacon.aeon.members.len();
		let per_state = time_per_state(cabinet_size);

		if state == SetupState::Reset {
			self.reference_timepoint = beacon.aeon.start_reference_timepoint;

			let base_timespan = (per_state as f64 * total_time_slots()) as u64;
			let bounded_timespan = base_timespan * MAX_DKG_BOUND_MULTIPLE;
			self.expected_dkg_timespan = base_timespan;

			let mut failures: u16 = 0;
			while self.reference_timepoint < current_time {
				failures = failures.saturating_add(1);
				self.reference_timepoint += self.expected_dkg_timespan;
				self.expected_dkg_timespan = (self.expected_dkg_timespan +
					self.expected_dkg_timespan / 2)
					.min(bounded_timespan);
			}
			self.failures = failures;

			info!(
				node = %node_label(self.index),
				"DKG for round {} allotted {}s from reference {} ({} prior failures)",
				beacon.aeon.round_start,
				self.expected_dkg_timespan,
				self.reference_timepoint,
				failures
			);
		}

		if state == SetupState::BeaconReady || state == SetupState::Idle {
			return;
		}

		let slots_to_end: f64 = TIME_SLOTS
			.iter()
			.take_while(|(slot_state, _)| *slot_state <= state)
			.map(|(_, slots)| slots)
			.sum();
		let time_until_deadline =
			((slots_to_end / total_time_slots()) * self.expected_dkg_timespan as f64) as u64;
		self.state_deadline = self.reference_timepoint + time_until_deadline;

		debug!(
			node = %node_label(self.index),
			"state \"{state}\" deadline at {} ({}s from now)",
			self.state_deadline,
			self.state_deadline.saturating_sub(current_time)
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn time_slots_cover_all_waiting_states() {
		assert_eq!(total_time_slots(), 11.5);
		// Slot order must follow state order for the prefix sums to work.
		for window in TIME_SLOTS.windows(2) {
			assert!(window[0].0 < window[1].0);
		}
	}

	#[test]
	fn per_state_time_grows_with_cabinet_size() {
		assert_eq!(time_per_state(4), 1);
		assert_eq!(time_per_state(10), 3);
		assert_eq!(time_per_state(51), 25);
		assert_eq!(time_per_state(500), 2722);
	}
}
