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

//! Primitives shared by every palisade crate: participant addresses,
//! digests, ECDSA identities and the deterministic wire codec.

pub mod clock;
pub mod codec;
pub mod identity;

pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::{Identity, KeyError, Prover};

use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};

/// Index of a member within a sorted cabinet.
pub type MemberIndex = u32;

/// Number of bytes in a participant address.
pub const ADDRESS_LEN: usize = 64;

/// Number of bytes in a digest.
pub const DIGEST_LEN: usize = 32;

/// A 32-byte hash output. The all-zero value doubles as the "unset"
/// sentinel: it is never produced as the hash of real serialized content.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
	pub const EMPTY: Digest = Digest([0u8; DIGEST_LEN]);

	pub fn is_empty(&self) -> bool {
		*self == Self::EMPTY
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	pub fn from_slice(bytes: &[u8]) -> Option<Self> {
		let array: [u8; DIGEST_LEN] = bytes.try_into().ok()?;
		Some(Digest(array))
	}
}

impl AsRef<[u8]> for Digest {
	fn as_ref(&self) -> &[u8] {
		&self.0
	}
}

impl From<[u8; DIGEST_LEN]> for Digest {
	fn from(bytes: [u8; DIGEST_LEN]) -> Self {
		Digest(bytes)
	}
}

impl std::fmt::Display for Digest {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", hex::encode(self.0))
	}
}

impl std::fmt::Debug for Digest {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "Digest({}..)", hex::encode(&self.0[..4]))
	}
}

/// A fixed 64-byte public identifier of a participant. Equality and
/// ordering are plain byte comparison.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
	/// The raw array form of the address.
	pub fn raw(&self) -> [u8; ADDRESS_LEN] {
		self.0
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	pub fn from_slice(bytes: &[u8]) -> Option<Self> {
		let array: [u8; ADDRESS_LEN] = bytes.try_into().ok()?;
		Some(Address(array))
	}
}

impl AsRef<[u8]> for Address {
	fn as_ref(&self) -> &[u8] {
		&self.0
	}
}

impl std::fmt::Display for Address {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", hex::encode(self.0))
	}
}

impl std::fmt::Debug for Address {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "Address({}..)", hex::encode(&self.0[..4]))
	}
}

// 64-byte arrays have no derived serde impls, so addresses travel as
// length-prefixed byte strings.
impl Serialize for Address {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_bytes(&self.0)
	}
}

impl<'de> Deserialize<'de> for Address {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		struct AddressVisitor;

		impl<'de> serde::de::Visitor<'de> for AddressVisitor {
			type Value = Address;

			fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
				write!(f, "{ADDRESS_LEN} bytes")
			}

			fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Address, E> {
				Address::from_slice(v)
					.ok_or_else(|| E::invalid_length(v.len(), &self))
			}

			fn visit_seq<A: serde::de::SeqAccess<'de>>(
				self,
				mut seq: A,
			) -> Result<Address, A::Error> {
				let mut bytes = [0u8; ADDRESS_LEN];
				for (i, byte) in bytes.iter_mut().enumerate() {
					*byte = seq
						.next_element()?
						.ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
				}
				Ok(Address(bytes))
			}
		}

		deserializer.deserialize_bytes(AddressVisitor)
	}
}

/// SHA-256 convenience wrapper.
pub fn sha256(data: impl AsRef<[u8]>) -> Digest {
	let mut hasher = Sha256::new();
	hasher.update(data.as_ref());
	Digest(hasher.finalize().into())
}
