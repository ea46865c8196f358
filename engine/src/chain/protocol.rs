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

//! Server side of the main-chain RPC surface. The transport dispatches
//! calls here; the methods are plain and synchronous because the chain
//! does its own locking.

use std::sync::Arc;

use palisade_primitives::Digest;
use tracing::debug;

use super::{
	block::Block,
	main_chain::{AncestorPathBehaviour, MainChain},
	travelogue::TimeTravelogue,
};

pub struct MainChainProtocol {
	chain: Arc<MainChain>,
}

impl MainChainProtocol {
	pub fn new(chain: Arc<MainChain>) -> Self {
		MainChainProtocol { chain }
	}

	/// The heaviest chain, newest first, at most `max_size` blocks.
	pub fn get_heaviest_chain(&self, max_size: u64) -> Vec<Block> {
		self.chain.get_heaviest_chain(max_size)
	}

	/// The sub-chain from `start` down to the common ancestor with
	/// `last_seen`, newest first. Empty when either hash is unknown.
	pub fn get_common_sub_chain(
		&self,
		start: &Digest,
		last_seen: &Digest,
		limit: u64,
	) -> Vec<Block> {
		match self.chain.get_path_to_common_ancestor(
			start,
			last_seen,
			limit,
			AncestorPathBehaviour::ReturnLeastRecent,
		) {
			Some(path) => path,
			None => {
				debug!("no common sub chain between {start} and {last_seen}");
				Vec::new()
			},
		}
	}

	pub fn time_travel(&self, start: &Digest) -> TimeTravelogue {
		self.chain.time_travel(start)
	}
}
