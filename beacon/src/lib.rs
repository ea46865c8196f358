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

//! Distributed random beacon: multi-round DKG producing a threshold BLS
//! group key, and the per-block threshold-signing loop that turns the
//! previous round's group signature into fresh verifiable entropy.

pub mod aeon;
pub mod complaints;
pub mod crypto;
pub mod dkg;
pub mod entropy;
pub mod messages;
pub mod p2p;
pub mod rbc;
pub mod service;
pub mod setup;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use aeon::{Aeon, AeonExecutionUnit};
pub use dkg::{AddResult, DkgManager, SignatureShare};
pub use entropy::BlockEntropy;
pub use service::{
	AeonStore, BeaconHandle, BeaconService, EntropyGenerator, EntropyStatus,
	SignatureInformation, SignatureSharesRpc,
};
pub use setup::BeaconSetupService;

/// Service identifier reserved for the DKG/beacon subsystem.
pub const SERVICE_DKG: u16 = 0x0d4b;

/// Channel carrying reliable-broadcast traffic during DKG setup.
pub const CHANNEL_RBC_BROADCAST: u16 = 1;

/// Channel carrying encrypted per-peer secret shares.
pub const CHANNEL_SECRET_KEY: u16 = 2;

/// Channel carrying beacon signature-share RPC traffic.
pub const CHANNEL_BEACON_RPC: u16 = 3;
