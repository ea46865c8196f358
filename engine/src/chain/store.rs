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

//! Persistent block store: a content-addressed rocksdb keyed by block
//! hash with a `head` pointer, plus a column for the beacon's active
//! execution unit so a restart can resume mid-aeon.

use std::path::Path;

use palisade_beacon::{AeonExecutionUnit, AeonStore};
use palisade_primitives::{codec::CodecError, Digest};
use rocksdb::{ColumnFamilyDescriptor, Options, DB};

use super::block::Block;

const CF_BLOCKS: &str = "blocks";
const CF_BEACON: &str = "beacon";

const HEAD_KEY: &[u8] = b"head";
const BEACON_HEAD_KEY: &[u8] = b"HEAD";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("database failure: {0}")]
	Database(#[from] rocksdb::Error),
	#[error("stored value is malformed: {0}")]
	Codec(#[from] CodecError),
	#[error("missing column family {0}")]
	MissingColumn(&'static str),
}

pub struct BlockStore {
	db: DB,
}

impl BlockStore {
	/// Create a fresh store, discarding anything already at `path`.
	pub fn create(path: &Path) -> Result<Self, StoreError> {
		if path.exists() {
			let _ = DB::destroy(&Options::default(), path);
		}
		Self::open(path)
	}

	/// Open an existing store (or an empty one on first run).
	pub fn load(path: &Path) -> Result<Self, StoreError> {
		Self::open(path)
	}

	fn open(path: &Path) -> Result<Self, StoreError> {
		let mut options = Options::default();
		options.create_if_missing(true);
		options.create_missing_column_families(true);
		let descriptors = vec![
			ColumnFamilyDescriptor::new(CF_BLOCKS, Options::default()),
			ColumnFamilyDescriptor::new(CF_BEACON, Options::default()),
		];
		let db = DB::open_cf_descriptors(&options, path, descriptors)?;
		Ok(BlockStore { db })
	}

	fn blocks_cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
		self.db.cf_handle(CF_BLOCKS).ok_or(StoreError::MissingColumn(CF_BLOCKS))
	}

	fn beacon_cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
		self.db.cf_handle(CF_BEACON).ok_or(StoreError::MissingColumn(CF_BEACON))
	}

	pub fn set(&self, block: &Block) -> Result<(), StoreError> {
		let cf = self.blocks_cf()?;
		self.db.put_cf(cf, block.hash.as_bytes(), block.to_wire())?;
		Ok(())
	}

	pub fn get(&self, hash: &Digest) -> Result<Option<Block>, StoreError> {
		let cf = self.blocks_cf()?;
		match self.db.get_cf(cf, hash.as_bytes())? {
			Some(bytes) => Ok(Some(Block::from_wire(&bytes)?)),
			None => Ok(None),
		}
	}

	pub fn has(&self, hash: &Digest) -> Result<bool, StoreError> {
		let cf = self.blocks_cf()?;
		Ok(self.db.get_cf(cf, hash.as_bytes())?.is_some())
	}

	/// Store `block` under both its hash and the head pointer.
	pub fn set_head(&self, block: &Block) -> Result<(), StoreError> {
		let cf = self.blocks_cf()?;
		let encoded = block.to_wire();
		self.db.put_cf(cf, HEAD_KEY, &encoded)?;
		self.db.put_cf(cf, block.hash.as_bytes(), &encoded)?;
		Ok(())
	}

	pub fn get_head(&self) -> Result<Option<Block>, StoreError> {
		let cf = self.blocks_cf()?;
		match self.db.get_cf(cf, HEAD_KEY)? {
			Some(bytes) => Ok(Some(Block::from_wire(&bytes)?)),
			None => Ok(None),
		}
	}
}

impl AeonStore for BlockStore {
	fn save_active_unit(&self, unit: &AeonExecutionUnit) -> anyhow::Result<()> {
		let cf = self.beacon_cf()?;
		self.db.put_cf(cf, BEACON_HEAD_KEY, unit.to_wire())?;
		Ok(())
	}

	fn load_active_unit(&self) -> anyhow::Result<Option<AeonExecutionUnit>> {
		let cf = self.beacon_cf()?;
		match self.db.get_cf(cf, BEACON_HEAD_KEY)? {
			Some(bytes) => Ok(Some(AeonExecutionUnit::from_wire(&bytes)?)),
			None => Ok(None),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use palisade_primitives::sha256;

	fn sample_block(number: u64) -> Block {
		let mut block = Block {
			previous_hash: sha256(format!("prev {number}")),
			block_number: number,
			timestamp: 1000 + number,
			..Block::default()
		};
		block.update_digest();
		block
	}

	#[test]
	fn blocks_round_trip_through_the_store() {
		let dir = tempfile::tempdir().unwrap();
		let store = BlockStore::create(dir.path()).unwrap();

		let block = sample_block(3);
		store.set(&block).unwrap();
		assert!(store.has(&block.hash).unwrap());

		let loaded = store.get(&block.hash).unwrap().unwrap();
		assert_eq!(loaded.hash, block.hash);
		assert!(loaded.digest_matches());
		assert!(store.get(&sha256(b"unknown")).unwrap().is_none());
	}

	#[test]
	fn head_pointer_survives_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let head = sample_block(9);
		{
			let store = BlockStore::create(dir.path()).unwrap();
			store.set_head(&head).unwrap();
		}
		let store = BlockStore::load(dir.path()).unwrap();
		assert_eq!(store.get_head().unwrap().unwrap().hash, head.hash);
		// The head is also reachable by hash.
		assert!(store.has(&head.hash).unwrap());
	}

	#[test]
	fn create_discards_previous_contents() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("db");
		{
			let store = BlockStore::create(&path).unwrap();
			store.set(&sample_block(1)).unwrap();
		}
		let store = BlockStore::create(&path).unwrap();
		assert!(store.get_head().unwrap().is_none());
	}

	#[test]
	fn beacon_state_round_trips() {
		let dir = tempfile::tempdir().unwrap();
		let store = BlockStore::create(dir.path()).unwrap();
		assert!(store.load_active_unit().unwrap().is_none());

		let mut unit = AeonExecutionUnit::default();
		unit.aeon.round_start = 26;
		unit.aeon.round_end = 50;
		store.save_active_unit(&unit).unwrap();

		let loaded = store.load_active_unit().unwrap().unwrap();
		assert_eq!(loaded.aeon.round_start, 26);
		assert_eq!(loaded.aeon.round_end, 50);
	}
}
