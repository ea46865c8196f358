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

//! BLS12-381 layer used by the DKG manager. Signatures live in G1,
//! public keys and polynomial commitments in G2; nothing outside this
//! module and [`crate::dkg`] touches curve types directly.

use std::collections::BTreeSet;

use blstrs::{pairing, G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use ff::Field;
use group::prime::PrimeCurveAffine;
use group::{Curve, Group};
use palisade_primitives::MemberIndex;
use rand::RngCore;

/// Compressed G1 element length (signatures, signature shares).
pub const G1_LEN: usize = 48;

/// Compressed G2 element length (public keys, commitments).
pub const G2_LEN: usize = 96;

/// Scalar length.
pub const SCALAR_LEN: usize = 32;

const SIGNATURE_DST: &[u8] = b"PALISADE-V01-CS01-with-BLS12381G1_XMD:SHA-256_SSWU_RO_";
const PEDERSEN_DST: &[u8] = b"PALISADE-V01-PEDERSEN-BLS12381G2_XMD:SHA-256_SSWU_RO_";

lazy_static::lazy_static! {
	/// Second Pedersen generator. Derived by hashing so its discrete log
	/// with respect to the standard generator is unknown.
	pub static ref PEDERSEN_H: G2Projective =
		G2Projective::hash_to_curve(b"palisade pedersen blinding generator", PEDERSEN_DST, &[]);
}

pub fn hash_to_g1(message: &[u8]) -> G1Projective {
	G1Projective::hash_to_curve(message, SIGNATURE_DST, &[])
}

/// Sign `message` with a secret scalar, producing a (share of a) BLS
/// signature.
pub fn sign(secret: &Scalar, message: &[u8]) -> G1Projective {
	hash_to_g1(message) * secret
}

/// Pairing check `e(signature, G2) == e(H(message), public_key)`.
pub fn verify(public_key: &G2Projective, message: &[u8], signature: &G1Projective) -> bool {
	pairing(&signature.to_affine(), &G2Affine::generator()) ==
		pairing(&hash_to_g1(message).to_affine(), &public_key.to_affine())
}

/// Sample a random scalar.
pub fn random_scalar(rng: &mut impl RngCore) -> Scalar {
	Scalar::random(rng)
}

/// The x-coordinate a cabinet member evaluates sharing polynomials at.
/// Offset by one so no share is ever an evaluation at zero.
pub fn share_point(index: MemberIndex) -> Scalar {
	Scalar::from(u64::from(index) + 1)
}

/// Evaluate a polynomial (given by its coefficients `[c0, c1, ...]`) at
/// `x` by Horner folding. Works in the scalar field and, for commitment
/// verification, in the exponent.
pub fn evaluate_polynomial<'a, T, I>(coefficients: I, x: &Scalar) -> T
where
	T: 'a + Copy + std::ops::Mul<Scalar, Output = T> + std::ops::Add<T, Output = T>,
	I: DoubleEndedIterator<Item = &'a T>,
{
	coefficients
		.rev()
		.copied()
		.reduce(|acc, coefficient| acc * *x + coefficient)
		.expect("a polynomial has at least one coefficient")
}

/// Lagrange coefficient at zero for the member at `index`, over the
/// participating `indices`. Panics if `index` is not in `indices` or the
/// indices are not distinct, which cannot happen for map-keyed share sets.
pub fn lagrange_coefficient_at_zero(index: MemberIndex, indices: &BTreeSet<MemberIndex>) -> Scalar {
	debug_assert!(indices.contains(&index));

	let x_i = share_point(index);
	let mut numerator = Scalar::ONE;
	let mut denominator = Scalar::ONE;
	for &j in indices {
		if j == index {
			continue;
		}
		let x_j = share_point(j);
		numerator *= x_j;
		denominator *= x_j - x_i;
	}

	let inverse = Option::<Scalar>::from(denominator.invert())
		.expect("share points are distinct and non-zero");
	numerator * inverse
}

/// Interpolate the coefficient vector of the unique polynomial of degree
/// `points.len() - 1` through the given `(x, y)` points.
pub fn interpolate_coefficients(points: &[(Scalar, Scalar)]) -> Vec<Scalar> {
	let mut result = vec![Scalar::ZERO; points.len()];

	for (i, (x_i, y_i)) in points.iter().enumerate() {
		// Numerator polynomial prod_{j != i} (X - x_j), built up one root
		// at a time.
		let mut basis = vec![Scalar::ONE];
		let mut denominator = Scalar::ONE;
		for (j, (x_j, _)) in points.iter().enumerate() {
			if i == j {
				continue;
			}
			basis.push(Scalar::ZERO);
			for k in (0..basis.len() - 1).rev() {
				let carry = basis[k];
				basis[k + 1] += carry;
				basis[k] *= -*x_j;
			}
			denominator *= *x_i - *x_j;
		}

		let scale = *y_i *
			Option::<Scalar>::from(denominator.invert())
				.expect("interpolation points are distinct");
		for (k, coefficient) in basis.iter().enumerate() {
			result[k] += *coefficient * scale;
		}
	}

	result
}

pub fn g1_to_bytes(point: &G1Projective) -> Vec<u8> {
	point.to_affine().to_compressed().to_vec()
}

pub fn g1_from_bytes(bytes: &[u8]) -> Option<G1Projective> {
	let array: [u8; G1_LEN] = bytes.try_into().ok()?;
	Option::<G1Affine>::from(G1Affine::from_compressed(&array)).map(G1Projective::from)
}

pub fn g2_to_bytes(point: &G2Projective) -> Vec<u8> {
	point.to_affine().to_compressed().to_vec()
}

pub fn g2_from_bytes(bytes: &[u8]) -> Option<G2Projective> {
	let array: [u8; G2_LEN] = bytes.try_into().ok()?;
	Option::<G2Affine>::from(G2Affine::from_compressed(&array)).map(G2Projective::from)
}

pub fn scalar_to_bytes(scalar: &Scalar) -> Vec<u8> {
	scalar.to_bytes_le().to_vec()
}

pub fn scalar_from_bytes(bytes: &[u8]) -> Option<Scalar> {
	let array: [u8; SCALAR_LEN] = bytes.try_into().ok()?;
	Option::from(Scalar::from_bytes_le(&array))
}
