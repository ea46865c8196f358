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

//! Threshold cryptographic state for one aeon.
//!
//! The manager holds this node's sharing polynomials, every peer's
//! commitments and shares, the qualified set, and (after completion) the
//! group public key and signing share. Shares are distributed with
//! Pedersen verifiable secret sharing; misbehaviour is reported through
//! complaint sets rather than errors, and no cryptographic failure
//! escapes this module as a panic.

use std::collections::{BTreeMap, BTreeSet};

use blstrs::{G1Projective, G2Projective, Scalar};
use ff::Field;
use group::Group;
use palisade_primitives::{Address, Digest, Identity, MemberIndex, Prover};
use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::Zeroize;

use crate::crypto;

/// A threshold signature share tagged with its signer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureShare {
	pub identity: Identity,
	pub signature: Vec<u8>,
}

/// Outcome of merging a received signature share.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddResult {
	Added,
	NotMember,
	SignatureAlreadyAdded,
	InvalidSignature,
}

/// A pair of exposed secret shares `(s, s')` as they travel on the wire.
pub type ExposedShares = (Vec<u8>, Vec<u8>);

/// Post-completion state that survives a crash-restart. Polynomials and
/// peer share bookkeeping deliberately do not.
#[derive(Clone, Serialize, Deserialize)]
pub struct DkgSnapshot {
	cabinet: Vec<Address>,
	threshold: u32,
	qual: BTreeSet<Address>,
	secret_share: Option<Vec<u8>>,
	group_public_key: Option<Vec<u8>>,
	verification_keys: BTreeMap<MemberIndex, Vec<u8>>,
}

impl Drop for DkgSnapshot {
	fn drop(&mut self) {
		// The serialized signing share is key material; wipe it.
		if let Some(secret) = self.secret_share.as_mut() {
			secret.zeroize();
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
	#[error("snapshot contains a malformed group element")]
	MalformedElement,
}

/// Threshold BLS state machine data for a single cabinet.
#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "DkgSnapshot", try_from = "DkgSnapshot")]
pub struct DkgManager {
	// Not part of the snapshot: re-installed after a reload.
	certificate: Option<Prover>,

	/// Sorted cabinet; a member's index is its position here.
	cabinet: Vec<Address>,
	index_of: BTreeMap<Address, MemberIndex>,
	/// Shares needed to sign: polynomial degree is `threshold - 1`.
	threshold: u32,

	/// Own sharing polynomial f and blinding polynomial f'.
	secret_coefficients: Vec<Scalar>,
	blinding_coefficients: Vec<Scalar>,
	/// Pedersen commitments `C_k = G*a_k + H*b_k` per member.
	commitments: BTreeMap<MemberIndex, Vec<G2Projective>>,
	/// Unblinded commitments `A_k = G*a_k` per qualified member.
	qual_coefficients: BTreeMap<MemberIndex, Vec<G2Projective>>,
	/// Shares `(s_ji, s'_ji)` received from each peer j.
	received_shares: BTreeMap<MemberIndex, (Scalar, Scalar)>,
	/// Exposed shares of accused members: accused -> revealer -> share.
	reconstruction_shares: BTreeMap<Address, BTreeMap<MemberIndex, Scalar>>,

	qual: BTreeSet<Address>,
	secret_share: Option<Scalar>,
	group_public_key: Option<G2Projective>,
	verification_keys: BTreeMap<MemberIndex, G2Projective>,

	message: Option<Digest>,
	signature_shares: BTreeMap<MemberIndex, G1Projective>,
	group_signature: Option<G1Projective>,
}

impl Default for DkgManager {
	fn default() -> Self {
		DkgManager {
			certificate: None,
			cabinet: Vec::new(),
			index_of: BTreeMap::new(),
			threshold: 0,
			secret_coefficients: Vec::new(),
			blinding_coefficients: Vec::new(),
			commitments: BTreeMap::new(),
			qual_coefficients: BTreeMap::new(),
			received_shares: BTreeMap::new(),
			reconstruction_shares: BTreeMap::new(),
			qual: BTreeSet::new(),
			secret_share: None,
			group_public_key: None,
			verification_keys: BTreeMap::new(),
			message: None,
			signature_shares: BTreeMap::new(),
			group_signature: None,
		}
	}
}

impl DkgManager {
	pub fn set_certificate(&mut self, certificate: Prover) {
		self.certificate = Some(certificate);
	}

	/// Install a new cabinet. `threshold` is the number of shares needed
	/// to produce a group signature (t + 1).
	pub fn new_cabinet(&mut self, members: &BTreeSet<Address>, threshold: u32) {
		self.reset();
		self.cabinet = members.iter().copied().collect();
		self.index_of = self
			.cabinet
			.iter()
			.enumerate()
			.map(|(index, address)| (*address, index as MemberIndex))
			.collect();
		self.threshold = threshold;
	}

	/// Drop all per-aeon state. Private polynomials are overwritten before
	/// release so they do not outlive the aeon.
	pub fn reset(&mut self) {
		for coefficient in self
			.secret_coefficients
			.iter_mut()
			.chain(self.blinding_coefficients.iter_mut())
		{
			*coefficient = Scalar::ZERO;
		}
		let certificate = self.certificate.take();
		*self = DkgManager { certificate, ..DkgManager::default() };
	}

	pub fn cabinet_size(&self) -> usize {
		self.cabinet.len()
	}

	pub fn cabinet_index(&self, address: &Address) -> Option<MemberIndex> {
		self.index_of.get(address).copied()
	}

	pub fn own_index(&self) -> Option<MemberIndex> {
		let certificate = self.certificate.as_ref()?;
		self.cabinet_index(&certificate.address())
	}

	/// Degree of the sharing polynomials (t).
	pub fn polynomial_degree(&self) -> u32 {
		self.threshold.saturating_sub(1)
	}

	pub fn threshold(&self) -> u32 {
		self.threshold
	}

	pub fn in_cabinet(&self, address: &Address) -> bool {
		self.index_of.contains_key(address)
	}

	pub fn qual(&self) -> &BTreeSet<Address> {
		&self.qual
	}

	pub fn in_qual(&self, address: &Address) -> bool {
		self.qual.contains(address)
	}

	pub fn set_qual(&mut self, qual: BTreeSet<Address>) {
		self.qual = qual;
	}

	/// Sample both sharing polynomials and commit to them.
	pub fn generate_coefficients(&mut self, rng: &mut impl rand::RngCore) {
		let degree = self.polynomial_degree() as usize;
		self.secret_coefficients =
			(0..=degree).map(|_| crypto::random_scalar(rng)).collect();
		self.blinding_coefficients =
			(0..=degree).map(|_| crypto::random_scalar(rng)).collect();

		let commitments: Vec<G2Projective> = self
			.secret_coefficients
			.iter()
			.zip(&self.blinding_coefficients)
			.map(|(a, b)| G2Projective::generator() * a + *crypto::PEDERSEN_H * b)
			.collect();

		if let Some(own) = self.own_index() {
			self.commitments.insert(own, commitments);
		}
	}

	/// Own Pedersen commitments, serialized for broadcast.
	pub fn get_coefficients(&self) -> Vec<Vec<u8>> {
		self.own_index()
			.and_then(|own| self.commitments.get(&own))
			.map(|commitments| commitments.iter().map(crypto::g2_to_bytes).collect())
			.unwrap_or_default()
	}

	/// The pair `(f(x_peer), f'(x_peer))` destined for `peer`.
	pub fn get_own_shares(&self, peer: &Address) -> ExposedShares {
		let Some(index) = self.cabinet_index(peer) else {
			return (Vec::new(), Vec::new());
		};
		let x = crypto::share_point(index);
		let share: Scalar = crypto::evaluate_polynomial(self.secret_coefficients.iter(), &x);
		let blinding: Scalar =
			crypto::evaluate_polynomial(self.blinding_coefficients.iter(), &x);
		(crypto::scalar_to_bytes(&share), crypto::scalar_to_bytes(&blinding))
	}

	/// Record the share pair `peer` sent us. Malformed scalars are kept as
	/// absent so the peer ends up in the complaint set.
	pub fn add_shares(&mut self, from: &Address, shares: &ExposedShares) {
		let Some(index) = self.cabinet_index(from) else { return };
		let (Some(share), Some(blinding)) = (
			crypto::scalar_from_bytes(&shares.0),
			crypto::scalar_from_bytes(&shares.1),
		) else {
			warn!("discarding malformed share pair from {from}");
			return;
		};
		self.received_shares.entry(index).or_insert((share, blinding));
	}

	pub fn add_coefficients(&mut self, from: &Address, coefficients: &[Vec<u8>]) {
		let Some(index) = self.cabinet_index(from) else { return };
		if coefficients.len() != self.threshold as usize {
			warn!("discarding coefficients of wrong degree from {from}");
			return;
		}
		let Some(parsed) = parse_commitments(coefficients) else {
			warn!("discarding malformed coefficients from {from}");
			return;
		};
		self.commitments.entry(index).or_insert(parsed);
	}

	pub fn add_qual_coefficients(&mut self, from: &Address, coefficients: &[Vec<u8>]) {
		let Some(index) = self.cabinet_index(from) else { return };
		if coefficients.len() != self.threshold as usize {
			return;
		}
		let Some(parsed) = parse_commitments(coefficients) else { return };
		self.qual_coefficients.entry(index).or_insert(parsed);
	}

	/// Own unblinded coefficients `A_k = G*a_k`, broadcast once qual is
	/// known.
	pub fn get_qual_coefficients(&mut self) -> Vec<Vec<u8>> {
		let unblinded: Vec<G2Projective> = self
			.secret_coefficients
			.iter()
			.map(|a| G2Projective::generator() * a)
			.collect();
		let serialized = unblinded.iter().map(crypto::g2_to_bytes).collect();
		if let Some(own) = self.own_index() {
			self.qual_coefficients.insert(own, unblinded);
		}
		serialized
	}

	/// The subset of `valid_peers` whose delivered share fails Pedersen
	/// verification (or who never delivered both share and commitments).
	pub fn compute_complaints(&self, valid_peers: &BTreeSet<Address>) -> BTreeSet<Address> {
		let Some(own) = self.own_index() else { return BTreeSet::new() };

		valid_peers
			.iter()
			.filter(|peer| Some(**peer) != self.certificate.as_ref().map(|c| c.address()))
			.filter(|peer| {
				let Some(index) = self.cabinet_index(peer) else { return true };
				match (self.received_shares.get(&index), self.commitments.get(&index)) {
					(Some(shares), Some(commitments)) =>
						!pedersen_share_is_valid(own, shares, commitments),
					_ => true,
				}
			})
			.copied()
			.collect()
	}

	/// Check an exposed share pair that `from` published in answer to a
	/// complaint by `reporter`. A valid answer that concerns us repairs
	/// our own record of the share.
	pub fn verify_complaint_answer(
		&mut self,
		from: &Address,
		reporter: &Address,
		shares: &ExposedShares,
	) -> bool {
		let (Some(from_index), Some(reporter_index)) =
			(self.cabinet_index(from), self.cabinet_index(reporter))
		else {
			return false;
		};
		let (Some(share), Some(blinding)) = (
			crypto::scalar_from_bytes(&shares.0),
			crypto::scalar_from_bytes(&shares.1),
		) else {
			return false;
		};
		let Some(commitments) = self.commitments.get(&from_index) else {
			return false;
		};

		let valid = pedersen_share_is_valid(reporter_index, &(share, blinding), commitments);
		if valid && Some(reporter_index) == self.own_index() {
			self.received_shares.insert(from_index, (share, blinding));
		}
		valid
	}

	/// Sum the qualified shares into this node's signing share.
	pub fn compute_secret_share(&mut self) {
		let Some(own) = self.own_index() else { return };
		let own_share: Scalar = crypto::evaluate_polynomial(
			self.secret_coefficients.iter(),
			&crypto::share_point(own),
		);

		let mut secret = own_share;
		for member in &self.qual {
			let Some(index) = self.cabinet_index(member) else { continue };
			if Some(index) == self.own_index() {
				continue;
			}
			if let Some((share, _)) = self.received_shares.get(&index) {
				secret += share;
			}
		}
		self.secret_share = Some(secret);
	}

	/// Qual members whose unblinded coefficients are missing or do not
	/// match the share they dealt us, paired with those dealt shares for
	/// broadcast.
	pub fn compute_qual_complaints(
		&self,
		coefficients_received: &BTreeSet<Address>,
	) -> BTreeMap<Address, ExposedShares> {
		let Some(own) = self.own_index() else { return BTreeMap::new() };

		self.qual
			.iter()
			.filter(|member| Some(**member) != self.certificate.as_ref().map(|c| c.address()))
			.filter_map(|member| {
				let index = self.cabinet_index(member)?;
				let shares = self.received_shares.get(&index);
				let qual_coefficients = self.qual_coefficients.get(&index);

				let misbehaved = match (shares, qual_coefficients) {
					(Some((share, _)), Some(coefficients))
						if coefficients_received.contains(member) =>
						!unblinded_share_is_valid(own, share, coefficients),
					_ => true,
				};

				misbehaved.then(|| (*member, self.serialized_received_shares(index)))
			})
			.collect()
	}

	/// Judge a qual complaint: returns the party at fault. An exposure
	/// that is consistent with the accused's Pedersen commitments but not
	/// its unblinded coefficients condemns the accused; anything else
	/// condemns the sender.
	pub fn verify_qual_complaint(
		&self,
		sender: &Address,
		accused: &Address,
		shares: &ExposedShares,
	) -> Address {
		let (Some(sender_index), Some(accused_index)) =
			(self.cabinet_index(sender), self.cabinet_index(accused))
		else {
			return *sender;
		};
		let (Some(share), Some(blinding)) = (
			crypto::scalar_from_bytes(&shares.0),
			crypto::scalar_from_bytes(&shares.1),
		) else {
			return *sender;
		};

		let Some(commitments) = self.commitments.get(&accused_index) else {
			return *sender;
		};
		if !pedersen_share_is_valid(sender_index, &(share, blinding), commitments) {
			return *sender;
		}

		match self.qual_coefficients.get(&accused_index) {
			Some(coefficients) if unblinded_share_is_valid(sender_index, &share, coefficients) =>
				*sender,
			_ => *accused,
		}
	}

	/// Seed the reconstruction of `accused` with the share we hold.
	pub fn add_reconstruction_share(&mut self, accused: &Address) {
		let (Some(own), Some(index)) = (self.own_index(), self.cabinet_index(accused)) else {
			return;
		};
		if let Some((share, _)) = self.received_shares.get(&index).copied() {
			self.reconstruction_shares.entry(*accused).or_default().insert(own, share);
		}
	}

	/// The shares we received from `accused`, serialized for exposure.
	pub fn get_received_shares(&self, accused: &Address) -> ExposedShares {
		self.cabinet_index(accused)
			.map(|index| self.serialized_received_shares(index))
			.unwrap_or_default()
	}

	/// Validate a reconstruction share exposed by `from` for `accused`,
	/// keeping it if it matches the accused's Pedersen commitments.
	pub fn verify_reconstruction_share(
		&mut self,
		from: &Address,
		accused: &Address,
		shares: &ExposedShares,
	) {
		let (Some(from_index), Some(accused_index)) =
			(self.cabinet_index(from), self.cabinet_index(accused))
		else {
			return;
		};
		let (Some(share), Some(blinding)) = (
			crypto::scalar_from_bytes(&shares.0),
			crypto::scalar_from_bytes(&shares.1),
		) else {
			return;
		};
		let Some(commitments) = self.commitments.get(&accused_index) else { return };
		if pedersen_share_is_valid(from_index, &(share, blinding), commitments) {
			self.reconstruction_shares
				.entry(*accused)
				.or_default()
				.insert(from_index, share);
		}
	}

	/// Rebuild the unblinded coefficients of every accused member from
	/// exposed shares. Fails when any accused has fewer than `threshold`
	/// verified shares, which breaks the fault assumption.
	pub fn run_reconstruction(&mut self) -> bool {
		let reconstruction = std::mem::take(&mut self.reconstruction_shares);
		for (accused, shares) in reconstruction {
			let Some(accused_index) = self.cabinet_index(&accused) else { return false };
			if shares.len() < self.threshold as usize {
				warn!(
					"reconstruction of {accused} failed: {} of {} shares",
					shares.len(),
					self.threshold
				);
				return false;
			}

			let points: Vec<(Scalar, Scalar)> = shares
				.iter()
				.take(self.threshold as usize)
				.map(|(index, share)| (crypto::share_point(*index), *share))
				.collect();
			let coefficients = crypto::interpolate_coefficients(&points);
			let unblinded =
				coefficients.iter().map(|a| G2Projective::generator() * a).collect();
			self.qual_coefficients.insert(accused_index, unblinded);
		}
		true
	}

	/// Derive the group public key and per-member verification keys from
	/// the qualified coefficients.
	pub fn compute_public_keys(&mut self) {
		let mut group_key = G2Projective::identity();
		for member in &self.qual {
			let Some(index) = self.cabinet_index(member) else { continue };
			if let Some(coefficients) = self.qual_coefficients.get(&index) {
				group_key += coefficients[0];
			}
		}
		self.group_public_key = Some(group_key);

		self.verification_keys = self
			.qual
			.iter()
			.filter_map(|member| self.cabinet_index(member))
			.map(|member_index| {
				let x = crypto::share_point(member_index);
				let key = self
					.qual
					.iter()
					.filter_map(|dealer| self.cabinet_index(dealer))
					.filter_map(|dealer_index| self.qual_coefficients.get(&dealer_index))
					.map(|coefficients| {
						crypto::evaluate_polynomial::<G2Projective, _>(coefficients.iter(), &x)
					})
					.sum();
				(member_index, key)
			})
			.collect();
	}

	pub fn group_public_key(&self) -> Option<Vec<u8>> {
		self.group_public_key.as_ref().map(crypto::g2_to_bytes)
	}

	/// Fix the digest the next signature round signs over. Clears any
	/// previously collected shares.
	pub fn set_message(&mut self, message: Digest) {
		self.message = Some(message);
		self.signature_shares.clear();
		self.group_signature = None;
	}

	/// Produce (and retain) our signature share over the current message.
	pub fn sign(&mut self) -> Option<SignatureShare> {
		let certificate = self.certificate.as_ref()?;
		let message = self.message?;
		let secret = self.secret_share?;
		let own = self.own_index()?;

		let signature = crypto::sign(&secret, message.as_bytes());
		self.signature_shares.insert(own, signature);
		Some(SignatureShare {
			identity: certificate.identity(),
			signature: crypto::g1_to_bytes(&signature),
		})
	}

	/// Merge a peer's signature share after a pairing check against its
	/// verification key.
	pub fn add_signature_part(&mut self, identity: &Identity, signature: &[u8]) -> AddResult {
		let address = identity.address();
		if !self.in_qual(address) {
			return AddResult::NotMember;
		}
		let Some(index) = self.cabinet_index(address) else {
			return AddResult::NotMember;
		};
		if self.signature_shares.contains_key(&index) {
			return AddResult::SignatureAlreadyAdded;
		}

		let (Some(message), Some(verification_key)) =
			(self.message, self.verification_keys.get(&index))
		else {
			return AddResult::InvalidSignature;
		};
		let Some(signature) = crypto::g1_from_bytes(signature) else {
			return AddResult::InvalidSignature;
		};
		if !crypto::verify(verification_key, message.as_bytes(), &signature) {
			return AddResult::InvalidSignature;
		}

		self.signature_shares.insert(index, signature);
		AddResult::Added
	}

	/// True once enough shares have accumulated to attempt aggregation.
	pub fn can_verify(&self) -> bool {
		self.signature_shares.len() >= self.threshold as usize
	}

	/// Aggregate the collected shares and pair-check the result against
	/// the group key. Stores the group signature on success.
	pub fn verify(&mut self) -> bool {
		let (Some(message), Some(group_key)) = (self.message, self.group_public_key) else {
			return false;
		};
		if !self.can_verify() {
			return false;
		}

		// Any t+1 valid shares interpolate to the same signature; take the
		// lowest-indexed ones so aggregation is deterministic.
		let indices: BTreeSet<MemberIndex> = self
			.signature_shares
			.keys()
			.take(self.threshold as usize)
			.copied()
			.collect();
		let aggregated: G1Projective = indices
			.iter()
			.map(|&index| {
				self.signature_shares[&index] *
					crypto::lagrange_coefficient_at_zero(index, &indices)
			})
			.sum();

		if crypto::verify(&group_key, message.as_bytes(), &aggregated) {
			self.group_signature = Some(aggregated);
			true
		} else {
			false
		}
	}

	pub fn group_signature(&self) -> Option<Vec<u8>> {
		self.group_signature.as_ref().map(crypto::g1_to_bytes)
	}

	/// Stateless check of a full group signature.
	pub fn verify_group(group_public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
		let (Some(key), Some(signature)) =
			(crypto::g2_from_bytes(group_public_key), crypto::g1_from_bytes(signature))
		else {
			return false;
		};
		crypto::verify(&key, message, &signature)
	}

	fn serialized_received_shares(&self, index: MemberIndex) -> ExposedShares {
		self.received_shares
			.get(&index)
			.map(|(share, blinding)| {
				(crypto::scalar_to_bytes(share), crypto::scalar_to_bytes(blinding))
			})
			.unwrap_or_default()
	}
}

fn parse_commitments(serialized: &[Vec<u8>]) -> Option<Vec<G2Projective>> {
	serialized.iter().map(|bytes| crypto::g2_from_bytes(bytes)).collect()
}

/// `G*s + H*s' == sum_k C_k * x^k` at the receiver's share point.
fn pedersen_share_is_valid(
	receiver: MemberIndex,
	(share, blinding): &(Scalar, Scalar),
	commitments: &[G2Projective],
) -> bool {
	let expected: G2Projective = crypto::evaluate_polynomial(
		commitments.iter(),
		&crypto::share_point(receiver),
	);
	G2Projective::generator() * share + *crypto::PEDERSEN_H * blinding == expected
}

/// `G*s == sum_k A_k * x^k` at the receiver's share point.
fn unblinded_share_is_valid(
	receiver: MemberIndex,
	share: &Scalar,
	coefficients: &[G2Projective],
) -> bool {
	let expected: G2Projective = crypto::evaluate_polynomial(
		coefficients.iter(),
		&crypto::share_point(receiver),
	);
	G2Projective::generator() * share == expected
}

impl From<DkgManager> for DkgSnapshot {
	fn from(manager: DkgManager) -> Self {
		DkgSnapshot {
			cabinet: manager.cabinet,
			threshold: manager.threshold,
			qual: manager.qual,
			secret_share: manager.secret_share.as_ref().map(crypto::scalar_to_bytes),
			group_public_key: manager.group_public_key.as_ref().map(crypto::g2_to_bytes),
			verification_keys: manager
				.verification_keys
				.iter()
				.map(|(index, key)| (*index, crypto::g2_to_bytes(key)))
				.collect(),
		}
	}
}

impl TryFrom<DkgSnapshot> for DkgManager {
	type Error = SnapshotError;

	fn try_from(mut snapshot: DkgSnapshot) -> Result<Self, Self::Error> {
		let secret_share = match snapshot.secret_share.take() {
			Some(mut bytes) => {
				let scalar = crypto::scalar_from_bytes(&bytes);
				bytes.zeroize();
				Some(scalar.ok_or(SnapshotError::MalformedElement)?)
			},
			None => None,
		};
		let group_public_key = snapshot
			.group_public_key
			.take()
			.map(|bytes| crypto::g2_from_bytes(&bytes).ok_or(SnapshotError::MalformedElement))
			.transpose()?;
		let verification_keys = std::mem::take(&mut snapshot.verification_keys)
			.into_iter()
			.map(|(index, bytes)| {
				crypto::g2_from_bytes(&bytes)
					.map(|key| (index, key))
					.ok_or(SnapshotError::MalformedElement)
			})
			.collect::<Result<_, _>>()?;

		let cabinet = std::mem::take(&mut snapshot.cabinet);
		let index_of = cabinet
			.iter()
			.enumerate()
			.map(|(index, address)| (*address, index as MemberIndex))
			.collect();

		Ok(DkgManager {
			cabinet,
			index_of,
			threshold: snapshot.threshold,
			qual: std::mem::take(&mut snapshot.qual),
			secret_share,
			group_public_key,
			verification_keys,
			..DkgManager::default()
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::{rngs::StdRng, SeedableRng};

	fn build_cabinet(size: usize) -> (Vec<Prover>, BTreeSet<Address>) {
		let mut provers: Vec<Prover> = (0..size).map(|_| Prover::generate()).collect();
		provers.sort_by_key(|prover| prover.address());
		let members = provers.iter().map(|prover| prover.address()).collect();
		(provers, members)
	}

	fn new_managers(provers: &[Prover], members: &BTreeSet<Address>, threshold: u32) -> Vec<DkgManager> {
		provers
			.iter()
			.map(|prover| {
				let mut manager = DkgManager::default();
				manager.set_certificate(prover.clone());
				manager.new_cabinet(members, threshold);
				manager
			})
			.collect()
	}

	/// Run coefficient + share exchange between all (honest) managers.
	fn exchange_shares(managers: &mut [DkgManager], provers: &[Prover]) {
		let mut rng = StdRng::seed_from_u64(99);
		for manager in managers.iter_mut() {
			manager.generate_coefficients(&mut rng);
		}

		for from in 0..provers.len() {
			let coefficients = managers[from].get_coefficients();
			for to in 0..provers.len() {
				if from == to {
					continue;
				}
				let shares = managers[from].get_own_shares(&provers[to].address());
				let from_address = provers[from].address();
				managers[to].add_coefficients(&from_address, &coefficients);
				managers[to].add_shares(&from_address, &shares);
			}
		}
	}

	fn complete_dkg(managers: &mut [DkgManager], provers: &[Prover], members: &BTreeSet<Address>) {
		for manager in managers.iter_mut() {
			assert!(manager.compute_complaints(members).is_empty());
			manager.set_qual(members.clone());
			manager.compute_secret_share();
		}

		for from in 0..provers.len() {
			let coefficients = managers[from].get_qual_coefficients();
			for to in 0..provers.len() {
				if from == to {
					continue;
				}
				managers[to].add_qual_coefficients(&provers[from].address(), &coefficients);
			}
		}

		for manager in managers.iter_mut() {
			assert!(manager.compute_qual_complaints(members).is_empty());
			manager.compute_public_keys();
		}
	}

	#[test]
	fn four_node_dkg_agrees_on_group_key_and_signature() {
		let (provers, members) = build_cabinet(4);
		let mut managers = new_managers(&provers, &members, 2);
		exchange_shares(&mut managers, &provers);
		complete_dkg(&mut managers, &provers, &members);

		let group_key = managers[0].group_public_key().unwrap();
		for manager in &managers {
			assert_eq!(manager.group_public_key().unwrap(), group_key);
		}

		// All sign the same message and cross-verify.
		let message = palisade_primitives::sha256(b"previous entropy");
		let shares: Vec<SignatureShare> = managers
			.iter_mut()
			.map(|manager| {
				manager.set_message(message);
				manager.sign().unwrap()
			})
			.collect();

		for manager in managers.iter_mut() {
			for share in &shares {
				let result = manager.add_signature_part(&share.identity, &share.signature);
				assert!(matches!(
					result,
					AddResult::Added | AddResult::SignatureAlreadyAdded
				));
			}
			assert!(manager.can_verify());
			assert!(manager.verify());
		}

		let signature = managers[0].group_signature().unwrap();
		for manager in &managers {
			assert_eq!(manager.group_signature().unwrap(), signature);
		}
		assert!(DkgManager::verify_group(&group_key, message.as_bytes(), &signature));
	}

	#[test]
	fn aggregation_is_independent_of_share_subset() {
		let (provers, members) = build_cabinet(4);
		let mut managers = new_managers(&provers, &members, 2);
		exchange_shares(&mut managers, &provers);
		complete_dkg(&mut managers, &provers, &members);

		let message = palisade_primitives::sha256(b"entropy seed");
		let shares: Vec<SignatureShare> = managers
			.iter_mut()
			.map(|manager| {
				manager.set_message(message);
				manager.sign().unwrap()
			})
			.collect();

		// Node 0 aggregates shares {0, 1}; node 3 aggregates {2, 3}. The
		// group signature must be bit-identical.
		assert_eq!(
			managers[0].add_signature_part(&shares[1].identity, &shares[1].signature),
			AddResult::Added
		);
		assert_eq!(
			managers[3].add_signature_part(&shares[2].identity, &shares[2].signature),
			AddResult::Added
		);
		assert!(managers[0].verify());
		assert!(managers[3].verify());
		assert_eq!(managers[0].group_signature(), managers[3].group_signature());
	}

	#[test]
	fn bad_share_raises_a_complaint_and_fails_its_answer() {
		let (provers, members) = build_cabinet(4);
		let mut managers = new_managers(&provers, &members, 2);
		let mut rng = StdRng::seed_from_u64(7);
		for manager in managers.iter_mut() {
			manager.generate_coefficients(&mut rng);
		}

		let cheater = 3;
		for from in 0..provers.len() {
			let coefficients = managers[from].get_coefficients();
			for to in 0..provers.len() {
				if from == to {
					continue;
				}
				let mut shares = managers[from].get_own_shares(&provers[to].address());
				if from == cheater && to == 0 {
					shares.0 = crypto::scalar_to_bytes(&Scalar::from(1234u64));
				}
				let from_address = provers[from].address();
				managers[to].add_coefficients(&from_address, &coefficients);
				managers[to].add_shares(&from_address, &shares);
			}
		}

		let complaints = managers[0].compute_complaints(&members);
		assert_eq!(complaints, BTreeSet::from([provers[cheater].address()]));
		assert!(managers[1].compute_complaints(&members).is_empty());

		// The cheater "answers" with the same bad share; everyone rejects.
		let bad_answer = (
			crypto::scalar_to_bytes(&Scalar::from(1234u64)),
			managers[cheater].get_own_shares(&provers[0].address()).1,
		);
		let cheater_address = provers[cheater].address();
		let reporter = provers[0].address();
		assert!(!managers[1].verify_complaint_answer(&cheater_address, &reporter, &bad_answer));

		// An honest answer passes and repairs the reporter's own record.
		let honest_answer = managers[cheater].get_own_shares(&provers[0].address());
		assert!(managers[0].verify_complaint_answer(&cheater_address, &reporter, &honest_answer));
	}

	#[test]
	fn reconstruction_recovers_a_withholding_member() {
		let (provers, members) = build_cabinet(4);
		let mut managers = new_managers(&provers, &members, 2);
		exchange_shares(&mut managers, &provers);

		for manager in managers.iter_mut() {
			manager.set_qual(members.clone());
			manager.compute_secret_share();
		}

		// Member 3 never broadcasts qual coefficients; the rest expose its
		// shares and reconstruct.
		let silent = 3;
		let silent_address = provers[silent].address();
		for from in 0..provers.len() {
			if from == silent {
				continue;
			}
			let coefficients = managers[from].get_qual_coefficients();
			for to in 0..provers.len() {
				if from == to {
					continue;
				}
				managers[to].add_qual_coefficients(&provers[from].address(), &coefficients);
			}
		}
		// The silent member still computes its own coefficients locally.
		managers[silent].get_qual_coefficients();

		let received: BTreeSet<Address> =
			members.iter().copied().filter(|m| *m != silent_address).collect();
		let exposures: Vec<(Address, ExposedShares)> = (0..provers.len())
			.filter(|i| *i != silent)
			.map(|i| {
				let complaints = managers[i].compute_qual_complaints(&received);
				assert_eq!(complaints.len(), 1);
				let shares = complaints[&silent_address].clone();
				managers[i].add_reconstruction_share(&silent_address);
				(provers[i].address(), shares)
			})
			.collect();

		for i in (0..provers.len()).filter(|i| *i != silent) {
			for (from, shares) in &exposures {
				if *from == provers[i].address() {
					continue;
				}
				managers[i].verify_reconstruction_share(from, &silent_address, shares);
			}
			assert!(managers[i].run_reconstruction());
			managers[i].compute_public_keys();
		}

		// Reconstructed group key matches what the silent member computes
		// from its own (never broadcast) polynomial.
		managers[silent].run_reconstruction();
		managers[silent].compute_public_keys();
		let expected = managers[silent].group_public_key().unwrap();
		for i in (0..provers.len()).filter(|i| *i != silent) {
			assert_eq!(managers[i].group_public_key().unwrap(), expected);
		}
	}

	#[test]
	fn signature_part_rejections() {
		let (provers, members) = build_cabinet(4);
		let mut managers = new_managers(&provers, &members, 2);
		exchange_shares(&mut managers, &provers);
		complete_dkg(&mut managers, &provers, &members);

		let message = palisade_primitives::sha256(b"seed");
		managers[0].set_message(message);
		managers[0].sign().unwrap();

		let outsider = Prover::generate();
		assert_eq!(
			managers[0].add_signature_part(&outsider.identity(), &[0u8; 48]),
			AddResult::NotMember
		);

		managers[1].set_message(message);
		let share = managers[1].sign().unwrap();
		assert_eq!(
			managers[0].add_signature_part(&share.identity, b"garbage"),
			AddResult::InvalidSignature
		);
		assert_eq!(
			managers[0].add_signature_part(&share.identity, &share.signature),
			AddResult::Added
		);
		assert_eq!(
			managers[0].add_signature_part(&share.identity, &share.signature),
			AddResult::SignatureAlreadyAdded
		);
	}

	#[test]
	fn snapshot_round_trip_preserves_signing_ability() {
		let (provers, members) = build_cabinet(4);
		let mut managers = new_managers(&provers, &members, 2);
		exchange_shares(&mut managers, &provers);
		complete_dkg(&mut managers, &provers, &members);

		let encoded = bincode::serialize(&managers[0]).unwrap();
		let mut restored: DkgManager = bincode::deserialize(&encoded).unwrap();
		restored.set_certificate(provers[0].clone());

		let message = palisade_primitives::sha256(b"after restart");
		restored.set_message(message);
		let share = restored.sign().unwrap();

		managers[1].set_message(message);
		assert_eq!(
			managers[1].add_signature_part(&share.identity, &share.signature),
			AddResult::Added
		);
	}
}
