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

//! Messages exchanged between cabinet members during DKG setup. All of
//! these travel through the reliable broadcast channel; only the
//! per-peer secret shares (see [`crate::p2p`]) are sent privately.

use std::collections::{BTreeMap, BTreeSet};

use palisade_primitives::Address;
use serde::{Deserialize, Serialize};

use crate::dkg::ExposedShares;

/// Which stage of the protocol a coefficients or shares payload belongs
/// to. Two broadcasts from the same sender in different phases must
/// never be confused with each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DkgPhase {
	Shares,
	ComplaintAnswers,
	QualShares,
	QualComplaints,
	ReconstructionShares,
}

impl std::fmt::Display for DkgPhase {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			DkgPhase::Shares => "shares",
			DkgPhase::ComplaintAnswers => "complaint answers",
			DkgPhase::QualShares => "qual shares",
			DkgPhase::QualComplaints => "qual complaints",
			DkgPhase::ReconstructionShares => "reconstruction shares",
		};
		write!(f, "{name}")
	}
}

/// The directly-connected cabinet subset a node can currently see.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionsMessage {
	pub connections: BTreeSet<Address>,
}

/// An additional notarisation key, signed under the sender's identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotarisationKeyMessage {
	pub public_key: Vec<u8>,
	pub signature: Vec<u8>,
}

/// Coefficient commitments, tagged with the stage they belong to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoefficientsMessage {
	pub phase: DkgPhase,
	pub coefficients: Vec<Vec<u8>>,
}

/// The set of members the sender complains against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplaintsMessage {
	pub complaints: BTreeSet<Address>,
}

/// Exposed shares: complaint answers, qual complaints or reconstruction
/// shares depending on the phase tag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharesMessage {
	pub phase: DkgPhase,
	pub shares: BTreeMap<Address, ExposedShares>,
}

/// ECDSA signature over the sender's locally computed entropy digest for
/// the aeon-beginning block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalStateMessage {
	pub signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DkgMessage {
	Connections(ConnectionsMessage),
	NotarisationKey(NotarisationKeyMessage),
	Coefficients(CoefficientsMessage),
	Complaints(ComplaintsMessage),
	Shares(SharesMessage),
	FinalState(FinalStateMessage),
}

impl DkgMessage {
	/// Numeric message-type tag, part of the broadcast question string.
	pub fn type_tag(&self) -> u8 {
		match self {
			DkgMessage::Connections(_) => 0,
			DkgMessage::NotarisationKey(_) => 1,
			DkgMessage::Coefficients(_) => 2,
			DkgMessage::Complaints(_) => 3,
			DkgMessage::Shares(_) => 4,
			DkgMessage::FinalState(_) => 5,
		}
	}
}

impl std::fmt::Display for DkgMessage {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			DkgMessage::Connections(message) =>
				write!(f, "Connections({} peers)", message.connections.len()),
			DkgMessage::NotarisationKey(_) => write!(f, "NotarisationKey"),
			DkgMessage::Coefficients(message) =>
				write!(f, "Coefficients({})", message.phase),
			DkgMessage::Complaints(message) =>
				write!(f, "Complaints({})", message.complaints.len()),
			DkgMessage::Shares(message) => write!(f, "Shares({})", message.phase),
			DkgMessage::FinalState(_) => write!(f, "FinalState"),
		}
	}
}
