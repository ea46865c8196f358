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

//! Participant identities. An [`Address`] is the 64-byte uncompressed-point
//! body of a secp256k1 public key; signatures are compact ECDSA over the
//! SHA-256 of the signed content.

use secp256k1::{ecdsa, Message, PublicKey, SecretKey, SECP256K1};
use serde::{Deserialize, Serialize};

use crate::{sha256, Address, ADDRESS_LEN};

/// Length of a compact ECDSA signature.
pub const SIGNATURE_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
	#[error("invalid secret key material")]
	InvalidSecretKey,
	#[error("address does not encode a valid public key")]
	InvalidAddress,
}

/// An (address, verification key) bundle. The verification key is the
/// address itself, so identities are cheap to copy and compare.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity {
	address: Address,
}

impl Identity {
	pub fn from_address(address: Address) -> Self {
		Identity { address }
	}

	pub fn address(&self) -> &Address {
		&self.address
	}

	/// Verify `signature` over `message`. Malformed addresses or signatures
	/// simply fail verification.
	pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
		let Ok(public_key) = public_key_from_address(&self.address) else {
			return false;
		};
		let Ok(signature) = ecdsa::Signature::from_compact(signature) else {
			return false;
		};
		let digest = sha256(message);
		let message = Message::from_slice(digest.as_bytes())
			.expect("digest is exactly 32 bytes");
		SECP256K1.verify_ecdsa(&message, &signature, &public_key).is_ok()
	}
}

impl std::fmt::Debug for Identity {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "Identity({:?})", self.address)
	}
}

/// A private signing certificate.
#[derive(Clone)]
pub struct Prover {
	secret: SecretKey,
	identity: Identity,
}

impl Prover {
	/// Generate a fresh certificate from OS randomness.
	pub fn generate() -> Self {
		let secret = SecretKey::new(&mut secp256k1::rand::thread_rng());
		Self::from_secret(secret)
	}

	/// Restore a certificate from 32 bytes of secret key material.
	pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
		let secret = SecretKey::from_slice(bytes).map_err(|_| KeyError::InvalidSecretKey)?;
		Ok(Self::from_secret(secret))
	}

	fn from_secret(secret: SecretKey) -> Self {
		let public = PublicKey::from_secret_key(SECP256K1, &secret);
		let uncompressed = public.serialize_uncompressed();
		let mut address = [0u8; ADDRESS_LEN];
		address.copy_from_slice(&uncompressed[1..]);
		Prover { secret, identity: Identity::from_address(Address(address)) }
	}

	pub fn identity(&self) -> Identity {
		self.identity
	}

	pub fn address(&self) -> Address {
		*self.identity.address()
	}

	/// Sign `message`, returning the compact 64-byte signature.
	pub fn sign(&self, message: &[u8]) -> Vec<u8> {
		let digest = sha256(message);
		let message = Message::from_slice(digest.as_bytes())
			.expect("digest is exactly 32 bytes");
		SECP256K1.sign_ecdsa(&message, &self.secret).serialize_compact().to_vec()
	}
}

impl std::fmt::Debug for Prover {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "Prover({:?})", self.identity)
	}
}

fn public_key_from_address(address: &Address) -> Result<PublicKey, KeyError> {
	let mut uncompressed = [0u8; ADDRESS_LEN + 1];
	uncompressed[0] = 0x04;
	uncompressed[1..].copy_from_slice(address.as_bytes());
	PublicKey::from_slice(&uncompressed).map_err(|_| KeyError::InvalidAddress)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sign_and_verify() {
		let prover = Prover::generate();
		let signature = prover.sign(b"payload");
		assert!(prover.identity().verify(b"payload", &signature));
		assert!(!prover.identity().verify(b"other payload", &signature));
	}

	#[test]
	fn verify_rejects_foreign_signature() {
		let alice = Prover::generate();
		let mallory = Prover::generate();
		let signature = mallory.sign(b"payload");
		assert!(!alice.identity().verify(b"payload", &signature));
	}

	#[test]
	fn verify_rejects_garbage() {
		let prover = Prover::generate();
		assert!(!prover.identity().verify(b"payload", b"not a signature"));
		let bogus = Identity::from_address(Address([0xab; ADDRESS_LEN]));
		assert!(!bogus.verify(b"payload", &prover.sign(b"payload")));
	}

	#[test]
	fn certificate_round_trips_through_bytes() {
		let prover = Prover::generate();
		let restored = Prover::from_bytes(&prover.secret.secret_bytes()).unwrap();
		assert_eq!(prover.address(), restored.address());
	}
}
