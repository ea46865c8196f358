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

//! Seam between the beacon subsystem and the wire transport. The
//! transport itself lives outside this workspace; the beacon only sees
//! channels of these types plus a view of current connectivity.

use std::collections::BTreeSet;

use palisade_primitives::Address;
use serde::{Deserialize, Serialize};

/// A per-peer secret share packet. `sealed` models transport-level
/// authenticated encryption; unsealed packets are dropped by the
/// receiver, shares are the one thing that must stay private.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretSharePacket {
	pub to: Address,
	pub sealed: bool,
	pub payload: Vec<u8>,
}

/// What a node can ask of the peer layer: who is reachable right now,
/// and requests to dial or drop peers by address.
pub trait NetworkView: Send + Sync {
	fn connected_peers(&self) -> BTreeSet<Address>;

	/// Peers we have asked the transport to maintain connections to.
	fn requested_peers(&self) -> BTreeSet<Address>;

	fn connect_to(&self, address: &Address);

	fn disconnect_from(&self, addresses: &BTreeSet<Address>);
}
