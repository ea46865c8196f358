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

//! Ledger engine: block DAG management, stake-weighted consensus and
//! the node plumbing (settings, logging, persistence) around them.

pub mod chain;
pub mod consensus;
pub mod logging;
pub mod settings;

pub use chain::{Block, BlockStatus, MainChain, Mode};
pub use consensus::Consensus;

/// Service identifier reserved for main-chain RPC traffic.
pub const SERVICE_MAIN_CHAIN: u16 = 0x4d43;

/// Channel carrying main-chain RPC requests and replies.
pub const CHANNEL_MAIN_CHAIN_RPC: u16 = 1;
