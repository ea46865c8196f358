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

//! The main chain: block structure, the DAG cache with loose-block
//! resolution and heaviest-tip tracking, the persistent store, and the
//! query/sync surfaces built on top.

pub mod block;
pub mod main_chain;
pub mod protocol;
pub mod store;
pub mod sync;
pub mod travelogue;

pub use block::{Block, Slice, Slices, TransactionLayout, GENESIS_DIGEST, GENESIS_MERKLE_ROOT};
pub use main_chain::{AncestorPathBehaviour, BlockStatus, MainChain, Mode};
pub use protocol::MainChainProtocol;
pub use store::{BlockStore, StoreError};
pub use sync::{ChainSynchroniser, MainChainRpcClient, SyncOutcome};
pub use travelogue::{TimeTravelogue, TravelogueStatus};
