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

//! Client side of chain synchronisation. When the peer does not know
//! our tip we probe backwards by exponentially growing strides until it
//! acknowledges a hash, then stream the heaviest branch forward from
//! that anchor.

use std::sync::Arc;

use async_trait::async_trait;
use palisade_primitives::{Address, Digest};
use tracing::{debug, info, warn};

use super::{
	main_chain::{BlockStatus, MainChain},
	travelogue::{TimeTravelogue, TravelogueStatus},
};

/// Longest backward stride while searching for a common block.
const MAX_STRIDE: u64 = 16_384;

/// Give up on a peer after this many failed backward probes.
const MAX_BACK_STEPS: u32 = 30;

#[async_trait]
pub trait MainChainRpcClient: Send + Sync {
	async fn time_travel(&self, peer: Address, start: Digest)
		-> anyhow::Result<TimeTravelogue>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
	/// Our heaviest tip matches the peer's.
	InSync,
	/// Blocks were fetched and applied.
	Advanced,
	/// The peer never acknowledged any of our hashes.
	PeerAbandoned,
}

pub struct ChainSynchroniser {
	chain: Arc<MainChain>,
	client: Arc<dyn MainChainRpcClient>,
}

impl ChainSynchroniser {
	pub fn new(chain: Arc<MainChain>, client: Arc<dyn MainChainRpcClient>) -> Self {
		ChainSynchroniser { chain, client }
	}

	/// Walk `stride` blocks back from `hash` on the local chain
	/// (clamping at genesis). The walk includes the starting block, so
	/// fetch one extra.
	fn step_back(&self, hash: &Digest, stride: u64) -> Digest {
		let preceding = self.chain.get_chain_preceding(hash, stride + 1);
		preceding.last().map(|block| block.hash).unwrap_or(*hash)
	}

	/// Bring the local chain up to the peer's heaviest branch.
	pub async fn sync_from_peer(&self, peer: Address) -> anyhow::Result<SyncOutcome> {
		let mut anchor = self.chain.get_heaviest_block_hash();
		let mut stride: u64 = 1;
		let mut back_steps: u32 = 0;
		let mut fetched_any = false;

		loop {
			let reply = self.client.time_travel(peer, anchor).await?;
			match reply.status {
				TravelogueStatus::NotFound => {
					back_steps += 1;
					if back_steps > MAX_BACK_STEPS {
						warn!("peer {peer} acknowledged none of our hashes, abandoning");
						return Ok(SyncOutcome::PeerAbandoned);
					}
					let previous_anchor = anchor;
					anchor = self.step_back(&anchor, stride);
					stride = (stride * 2).min(MAX_STRIDE);
					debug!(
						"peer {peer} does not know {previous_anchor}, retrying from {anchor}"
					);
				},
				TravelogueStatus::SideBranch => {
					// The peer knows the block but it is off its heaviest
					// branch; re-anchor one step back and keep probing.
					back_steps += 1;
					if back_steps > MAX_BACK_STEPS {
						return Ok(SyncOutcome::PeerAbandoned);
					}
					anchor = self.step_back(&anchor, stride);
					stride = (stride * 2).min(MAX_STRIDE);
				},
				TravelogueStatus::HeaviestBranch => {
					if reply.blocks.is_empty() {
						return Ok(if fetched_any {
							SyncOutcome::Advanced
						} else {
							SyncOutcome::InSync
						});
					}

					let mut last_added = anchor;
					for block in reply.blocks {
						let hash = block.hash;
						match self.chain.add_block(block) {
							BlockStatus::Added | BlockStatus::Duplicate => {
								last_added = hash;
							},
							BlockStatus::Loose => {
								// Forward streaming from an acknowledged
								// anchor should never be loose.
								warn!("peer {peer} streamed a loose block {hash}");
								return Ok(SyncOutcome::PeerAbandoned);
							},
							BlockStatus::Invalid => {
								warn!("peer {peer} streamed an invalid block {hash}");
								return Ok(SyncOutcome::PeerAbandoned);
							},
						}
					}
					fetched_any = true;
					info!("synced forward to {last_added} from peer {peer}");

					if last_added == reply.heaviest_hash {
						return Ok(SyncOutcome::Advanced);
					}
					anchor = last_added;
				},
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chain::{block::Block, main_chain::Mode, protocol::MainChainProtocol};
	use palisade_primitives::{sha256, ADDRESS_LEN};

	fn child(previous: &Block, tag: &str, weight: u64) -> Block {
		let mut block = Block {
			previous_hash: previous.hash,
			block_number: previous.block_number + 1,
			merkle_hash: sha256(tag),
			weight,
			timestamp: previous.timestamp + 1,
			..Block::default()
		};
		block.update_digest();
		block
	}

	/// Serves time-travel replies straight from another chain instance.
	struct LocalPeer {
		protocol: MainChainProtocol,
	}

	#[async_trait]
	impl MainChainRpcClient for LocalPeer {
		async fn time_travel(
			&self,
			_peer: Address,
			start: Digest,
		) -> anyhow::Result<TimeTravelogue> {
			Ok(self.protocol.time_travel(&start))
		}
	}

	fn peer_address() -> Address {
		Address([7u8; ADDRESS_LEN])
	}

	#[tokio::test]
	async fn catches_up_from_genesis() {
		let remote = Arc::new(MainChain::new(Mode::InMemoryDb));
		let mut blocks = vec![Block::genesis()];
		for i in 0..8 {
			let block = child(blocks.last().unwrap(), &format!("remote {i}"), 2);
			assert_eq!(remote.add_block(block.clone()), BlockStatus::Added);
			blocks.push(block);
		}

		let local = Arc::new(MainChain::new(Mode::InMemoryDb));
		let syncer = ChainSynchroniser::new(
			local.clone(),
			Arc::new(LocalPeer { protocol: MainChainProtocol::new(remote.clone()) }),
		);

		let outcome = syncer.sync_from_peer(peer_address()).await.unwrap();
		assert_eq!(outcome, SyncOutcome::Advanced);
		assert_eq!(local.get_heaviest_block_hash(), remote.get_heaviest_block_hash());
	}

	#[tokio::test]
	async fn re_anchors_when_local_tip_is_on_a_fork() {
		let remote = Arc::new(MainChain::new(Mode::InMemoryDb));
		let local = Arc::new(MainChain::new(Mode::InMemoryDb));

		// Shared prefix of three blocks.
		let mut prefix = vec![Block::genesis()];
		for i in 0..3 {
			let block = child(prefix.last().unwrap(), &format!("common {i}"), 2);
			remote.add_block(block.clone());
			local.add_block(block.clone());
			prefix.push(block);
		}
		// The local node mined a light fork the peer never saw.
		let fork = child(prefix.last().unwrap(), "local fork", 1);
		local.add_block(fork);
		// The peer extended with a heavier branch.
		let mut tip = prefix.last().unwrap().clone();
		for i in 0..5 {
			tip = child(&tip, &format!("remote {i}"), 5);
			remote.add_block(tip.clone());
		}

		let syncer = ChainSynchroniser::new(
			local.clone(),
			Arc::new(LocalPeer { protocol: MainChainProtocol::new(remote.clone()) }),
		);
		let outcome = syncer.sync_from_peer(peer_address()).await.unwrap();
		assert_eq!(outcome, SyncOutcome::Advanced);
		assert_eq!(local.get_heaviest_block_hash(), remote.get_heaviest_block_hash());
	}

	#[tokio::test]
	async fn in_sync_peers_exchange_nothing() {
		let remote = Arc::new(MainChain::new(Mode::InMemoryDb));
		let local = Arc::new(MainChain::new(Mode::InMemoryDb));
		let block = child(&Block::genesis(), "only", 2);
		remote.add_block(block.clone());
		local.add_block(block);

		let syncer = ChainSynchroniser::new(
			local,
			Arc::new(LocalPeer { protocol: MainChainProtocol::new(remote) }),
		);
		let outcome = syncer.sync_from_peer(peer_address()).await.unwrap();
		assert_eq!(outcome, SyncOutcome::InSync);
	}

	/// A peer that knows nothing: every probe comes back NOT_FOUND.
	struct AmnesiacPeer;

	#[async_trait]
	impl MainChainRpcClient for AmnesiacPeer {
		async fn time_travel(
			&self,
			_peer: Address,
			_start: Digest,
		) -> anyhow::Result<TimeTravelogue> {
			Ok(TimeTravelogue {
				heaviest_hash: sha256(b"elsewhere"),
				block_number: 0,
				status: TravelogueStatus::NotFound,
				blocks: Vec::new(),
			})
		}
	}

	#[tokio::test]
	async fn abandons_a_peer_with_no_common_history() {
		let local = Arc::new(MainChain::new(Mode::InMemoryDb));
		let syncer = ChainSynchroniser::new(local, Arc::new(AmnesiacPeer));
		let outcome = syncer.sync_from_peer(peer_address()).await.unwrap();
		assert_eq!(outcome, SyncOutcome::PeerAbandoned);
	}
}
