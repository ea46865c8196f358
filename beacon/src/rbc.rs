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

//! Bracha-style reliable broadcast. With `n >= 3f + 1` cabinet members
//! and at most `f` Byzantine, every payload a correct member broadcasts
//! is eventually delivered to every correct member, and no two correct
//! members deliver different payloads for the same `(sender, tag)`.

use std::collections::{BTreeMap, BTreeSet};

use palisade_primitives::{sha256, Address, Digest};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RbcMessage {
	/// The originator's payload.
	Broadcast { tag: String, payload: Vec<u8> },
	/// Second-hand confirmation that `origin` broadcast a payload with
	/// this digest.
	Echo { origin: Address, tag: String, digest: Digest },
	/// A member is ready to deliver `(origin, tag)` with this digest.
	Ready { origin: Address, tag: String, digest: Digest },
}

/// Tally for one `(origin, tag)` slot.
#[derive(Default)]
struct BroadcastTally {
	payload: Option<Vec<u8>>,
	payload_digest: Option<Digest>,
	echoes: BTreeMap<Digest, BTreeSet<Address>>,
	readies: BTreeMap<Digest, BTreeSet<Address>>,
	sent_echo: bool,
	sent_ready: bool,
	delivered: bool,
}

pub struct ReliableBroadcast {
	own_address: Address,
	cabinet: BTreeSet<Address>,
	enabled: bool,
	tallies: BTreeMap<(Address, String), BroadcastTally>,
	outgoing: UnboundedSender<(BTreeSet<Address>, RbcMessage)>,
	deliveries: UnboundedSender<(Address, Vec<u8>)>,
}

impl ReliableBroadcast {
	pub fn new(
		own_address: Address,
		outgoing: UnboundedSender<(BTreeSet<Address>, RbcMessage)>,
		deliveries: UnboundedSender<(Address, Vec<u8>)>,
	) -> Self {
		ReliableBroadcast {
			own_address,
			cabinet: BTreeSet::new(),
			enabled: false,
			tallies: BTreeMap::new(),
			outgoing,
			deliveries,
		}
	}

	pub fn enable(&mut self, enabled: bool) {
		self.enabled = enabled;
	}

	/// Atomically install a new cabinet, discarding every tally from the
	/// previous one.
	pub fn reset_cabinet(&mut self, cabinet: BTreeSet<Address>) {
		self.cabinet = cabinet;
		self.tallies.clear();
	}

	fn faults(&self) -> usize {
		self.cabinet.len().saturating_sub(1) / 3
	}

	fn echo_threshold(&self) -> usize {
		(self.cabinet.len() + self.faults() + 1).div_ceil(2)
	}

	fn ready_threshold(&self) -> usize {
		self.faults() + 1
	}

	fn deliver_threshold(&self) -> usize {
		2 * self.faults() + 1
	}

	fn peers(&self) -> BTreeSet<Address> {
		self.cabinet.iter().filter(|peer| **peer != self.own_address).copied().collect()
	}

	fn send(&self, message: RbcMessage) {
		let _ = self.outgoing.send((self.peers(), message));
	}

	/// Initiate a broadcast of `payload` under `tag`. The local upper
	/// layer handles its own data directly, so nothing is delivered back
	/// to ourselves.
	pub fn set_question(&mut self, tag: String, payload: Vec<u8>) {
		if !self.enabled {
			return;
		}
		let digest = sha256(&payload);
		self.send(RbcMessage::Broadcast { tag: tag.clone(), payload: payload.clone() });

		// Participate in our own broadcast: record the payload and count
		// our echo and ready immediately.
		let own = self.own_address;
		let tally = self.tallies.entry((own, tag.clone())).or_default();
		tally.payload = Some(payload);
		tally.payload_digest = Some(digest);
		tally.echoes.entry(digest).or_default().insert(own);
		tally.readies.entry(digest).or_default().insert(own);
		tally.sent_echo = true;
		tally.sent_ready = true;
		tally.delivered = true;

		self.send(RbcMessage::Echo { origin: own, tag: tag.clone(), digest });
		self.send(RbcMessage::Ready { origin: own, tag, digest });
	}

	/// Process an inbound channel message. Disabled channels and unknown
	/// senders drop messages silently.
	pub fn handle_message(&mut self, from: Address, message: RbcMessage) {
		if !self.enabled || !self.cabinet.contains(&from) {
			return;
		}

		match message {
			RbcMessage::Broadcast { tag, payload } => self.on_broadcast(from, tag, payload),
			RbcMessage::Echo { origin, tag, digest } => self.on_echo(from, origin, tag, digest),
			RbcMessage::Ready { origin, tag, digest } =>
				self.on_ready(from, origin, tag, digest),
		}
	}

	fn on_broadcast(&mut self, origin: Address, tag: String, payload: Vec<u8>) {
		let digest = sha256(&payload);
		let tally = self.tallies.entry((origin, tag.clone())).or_default();

		match tally.payload_digest {
			// An origin equivocating about its own payload never gets the
			// second version considered.
			Some(existing) if existing != digest => {
				warn!("conflicting broadcast payloads from {origin} for tag {tag}");
				return;
			},
			_ => {
				tally.payload = Some(payload);
				tally.payload_digest = Some(digest);
			},
		}

		if !tally.sent_echo {
			tally.sent_echo = true;
			tally.echoes.entry(digest).or_default().insert(self.own_address);
			self.send(RbcMessage::Echo { origin, tag: tag.clone(), digest });
		}
		self.progress(origin, tag);
	}

	fn on_echo(&mut self, from: Address, origin: Address, tag: String, digest: Digest) {
		let tally = self.tallies.entry((origin, tag.clone())).or_default();
		tally.echoes.entry(digest).or_default().insert(from);
		self.progress(origin, tag);
	}

	fn on_ready(&mut self, from: Address, origin: Address, tag: String, digest: Digest) {
		let tally = self.tallies.entry((origin, tag.clone())).or_default();
		tally.readies.entry(digest).or_default().insert(from);
		self.progress(origin, tag);
	}

	/// Advance the echo -> ready -> deliver pipeline for one slot.
	fn progress(&mut self, origin: Address, tag: String) {
		let echo_threshold = self.echo_threshold();
		let ready_threshold = self.ready_threshold();
		let deliver_threshold = self.deliver_threshold();
		let own = self.own_address;

		let mut ready_to_send = None;
		let mut delivery = None;
		{
			let Some(tally) = self.tallies.get_mut(&(origin, tag.clone())) else { return };

			if !tally.sent_ready {
				let supported = tally
					.echoes
					.iter()
					.find(|(_, echoers)| echoers.len() >= echo_threshold)
					.map(|(digest, _)| *digest)
					.or_else(|| {
						tally
							.readies
							.iter()
							.find(|(_, readiers)| readiers.len() >= ready_threshold)
							.map(|(digest, _)| *digest)
					});
				if let Some(digest) = supported {
					tally.sent_ready = true;
					tally.readies.entry(digest).or_default().insert(own);
					ready_to_send = Some(digest);
				}
			}

			if !tally.delivered {
				let deliverable = tally
					.readies
					.iter()
					.find(|(_, readiers)| readiers.len() >= deliver_threshold)
					.map(|(digest, _)| *digest);
				if let Some(digest) = deliverable {
					// Deliver only a payload we have actually seen match
					// the agreed digest.
					if tally.payload_digest == Some(digest) {
						if let Some(payload) = tally.payload.clone() {
							tally.delivered = true;
							delivery = Some(payload);
						}
					}
				}
			}
		}

		if let Some(digest) = ready_to_send {
			self.send(RbcMessage::Ready { origin, tag: tag.clone(), digest });
		}
		if let Some(payload) = delivery {
			debug!("delivering broadcast from {origin} tag {tag}");
			let _ = self.deliveries.send((origin, payload));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use palisade_primitives::ADDRESS_LEN;
	use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

	fn addr(tag: u8) -> Address {
		Address([tag; ADDRESS_LEN])
	}

	struct Node {
		rbc: ReliableBroadcast,
		outgoing: UnboundedReceiver<(BTreeSet<Address>, RbcMessage)>,
		deliveries: UnboundedReceiver<(Address, Vec<u8>)>,
	}

	fn build_network(size: u8) -> BTreeMap<Address, Node> {
		let cabinet: BTreeSet<Address> = (1..=size).map(addr).collect();
		cabinet
			.iter()
			.map(|address| {
				let (out_tx, out_rx) = unbounded_channel();
				let (del_tx, del_rx) = unbounded_channel();
				let mut rbc = ReliableBroadcast::new(*address, out_tx, del_tx);
				rbc.enable(true);
				rbc.reset_cabinet(cabinet.clone());
				(*address, Node { rbc, outgoing: out_rx, deliveries: del_rx })
			})
			.collect()
	}

	/// Shuttle queued messages until the network is quiet. `drop_from`
	/// silences one sender's outbound traffic.
	fn run_to_quiescence(nodes: &mut BTreeMap<Address, Node>, drop_from: Option<Address>) {
		loop {
			let mut in_flight = Vec::new();
			let addresses: Vec<Address> = nodes.keys().copied().collect();
			for address in addresses {
				let outgoing = &mut nodes.get_mut(&address).unwrap().outgoing;
				while let Ok((recipients, message)) = outgoing.try_recv() {
					if Some(address) == drop_from {
						continue;
					}
					in_flight.push((address, recipients, message));
				}
			}
			if in_flight.is_empty() {
				break;
			}
			for (from, recipients, message) in in_flight {
				for recipient in recipients {
					nodes.get_mut(&recipient).unwrap().rbc.handle_message(from, message.clone());
				}
			}
		}
	}

	fn collect_deliveries(node: &mut Node) -> Vec<(Address, Vec<u8>)> {
		let mut deliveries = Vec::new();
		while let Ok(delivery) = node.deliveries.try_recv() {
			deliveries.push(delivery);
		}
		deliveries
	}

	#[test]
	fn broadcast_reaches_every_member_once() {
		let mut nodes = build_network(4);
		let sender = addr(1);
		nodes
			.get_mut(&sender)
			.unwrap()
			.rbc
			.set_question("q1".into(), b"payload".to_vec());
		run_to_quiescence(&mut nodes, None);

		for (address, node) in nodes.iter_mut() {
			if *address == sender {
				continue;
			}
			let deliveries = collect_deliveries(node);
			assert_eq!(deliveries, vec![(sender, b"payload".to_vec())], "at {address}");
		}
	}

	#[test]
	fn redelivery_of_same_question_is_suppressed() {
		let mut nodes = build_network(4);
		let sender = addr(2);
		nodes
			.get_mut(&sender)
			.unwrap()
			.rbc
			.set_question("q".into(), b"one".to_vec());
		run_to_quiescence(&mut nodes, None);

		// Replay the same broadcast directly at a receiver.
		let replay = RbcMessage::Broadcast { tag: "q".into(), payload: b"one".to_vec() };
		let receiver = addr(1);
		nodes.get_mut(&receiver).unwrap().rbc.handle_message(sender, replay);
		run_to_quiescence(&mut nodes, None);

		let deliveries = collect_deliveries(nodes.get_mut(&receiver).unwrap());
		assert_eq!(deliveries.len(), 1);
	}

	#[test]
	fn disabled_channel_drops_messages() {
		let mut nodes = build_network(4);
		let receiver = addr(3);
		nodes.get_mut(&receiver).unwrap().rbc.enable(false);

		let sender = addr(1);
		nodes
			.get_mut(&sender)
			.unwrap()
			.rbc
			.set_question("q".into(), b"data".to_vec());
		run_to_quiescence(&mut nodes, None);

		assert!(collect_deliveries(nodes.get_mut(&receiver).unwrap()).is_empty());
	}

	#[test]
	fn non_cabinet_sender_is_ignored() {
		let mut nodes = build_network(4);
		let outsider = addr(99);
		let receiver = addr(1);
		nodes.get_mut(&receiver).unwrap().rbc.handle_message(
			outsider,
			RbcMessage::Broadcast { tag: "q".into(), payload: b"evil".to_vec() },
		);
		run_to_quiescence(&mut nodes, None);
		assert!(collect_deliveries(nodes.get_mut(&receiver).unwrap()).is_empty());
	}

	#[test]
	fn cabinet_reset_clears_pending_state() {
		let mut nodes = build_network(4);
		let sender = addr(1);
		nodes
			.get_mut(&sender)
			.unwrap()
			.rbc
			.set_question("q".into(), b"stale".to_vec());

		// Reset everyone before any traffic moves; nothing is delivered.
		let cabinet: BTreeSet<Address> = (1..=4).map(addr).collect();
		for node in nodes.values_mut() {
			node.rbc.reset_cabinet(cabinet.clone());
		}
		run_to_quiescence(&mut nodes, Some(sender));
		for node in nodes.values_mut() {
			assert!(collect_deliveries(node).is_empty());
		}
	}
}
