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

//! Bookkeeping for the three complaint rounds of the DKG. These track
//! who said what about whom; judging the cryptographic merit of a
//! complaint is the manager's job.

use std::collections::{BTreeMap, BTreeSet};

use palisade_primitives::Address;

use crate::dkg::ExposedShares;

/// First-round complaints about bad or missing shares.
#[derive(Default)]
pub struct ComplaintsManager {
	own_address: Option<Address>,
	/// accused -> reporters
	against: BTreeMap<Address, BTreeSet<Address>>,
	/// reporters we have received a complaints message from
	reporters: BTreeSet<Address>,
	finished: BTreeSet<Address>,
}

impl ComplaintsManager {
	pub fn reset_cabinet(&mut self, own_address: Address) {
		*self = ComplaintsManager { own_address: Some(own_address), ..Default::default() };
	}

	/// Record one of our own complaints.
	pub fn add_complaint_against(&mut self, accused: &Address) {
		if let Some(own) = self.own_address {
			self.against.entry(*accused).or_default().insert(own);
		}
	}

	/// Record a received complaints message. Accusations against
	/// non-members are ignored.
	pub fn add_complaints_from(
		&mut self,
		reporter: &Address,
		accused: &BTreeSet<Address>,
		cabinet: &BTreeSet<Address>,
	) {
		if !self.reporters.insert(*reporter) {
			return;
		}
		for address in accused {
			if cabinet.contains(address) {
				self.against.entry(*address).or_default().insert(*reporter);
			}
		}
	}

	/// How many of `valid_members` (other than us) we have heard from.
	pub fn num_complaints_received(&self, valid_members: &BTreeSet<Address>) -> usize {
		self.reporters
			.iter()
			.filter(|reporter| {
				valid_members.contains(reporter) && Some(**reporter) != self.own_address
			})
			.count()
	}

	/// Freeze the complaint set: everyone accused by a valid member.
	pub fn finish(&mut self, valid_members: &BTreeSet<Address>) {
		self.finished = self
			.against
			.iter()
			.filter(|(_, reporters)| reporters.iter().any(|r| valid_members.contains(r)))
			.map(|(accused, _)| *accused)
			.collect();
	}

	pub fn complaints(&self) -> &BTreeSet<Address> {
		&self.finished
	}

	pub fn complaints_against_self(&self) -> BTreeSet<Address> {
		match self.own_address {
			Some(own) => self
				.against
				.get(&own)
				.cloned()
				.unwrap_or_default(),
			None => BTreeSet::new(),
		}
	}

	pub fn complaints_count(&self, accused: &Address) -> usize {
		self.against.get(accused).map(BTreeSet::len).unwrap_or(0)
	}

	pub fn find_complaint(&self, accused: &Address, reporter: &Address) -> bool {
		self.against
			.get(accused)
			.map(|reporters| reporters.contains(reporter))
			.unwrap_or(false)
	}

	/// Members complained against by strictly more than `threshold`
	/// reporters; they are disqualified regardless of their answers.
	pub fn over_threshold(&self, threshold: usize) -> BTreeSet<Address> {
		self.against
			.iter()
			.filter(|(_, reporters)| reporters.len() > threshold)
			.map(|(accused, _)| *accused)
			.collect()
	}
}

/// Second round: answers to complaints, and the verdicts on them.
#[derive(Default)]
pub struct ComplaintAnswersManager {
	/// answerer -> (reporter -> exposed shares)
	answers: BTreeMap<Address, BTreeMap<Address, ExposedShares>>,
	/// members whose answers failed or never came
	against: BTreeSet<Address>,
}

impl ComplaintAnswersManager {
	pub fn reset_cabinet(&mut self) {
		*self = ComplaintAnswersManager::default();
	}

	pub fn add_complaint_answer_from(
		&mut self,
		from: &Address,
		answers: BTreeMap<Address, ExposedShares>,
	) {
		self.answers.entry(*from).or_insert(answers);
	}

	pub fn num_complaint_answers_received(&self, valid_members: &BTreeSet<Address>, own: &Address) -> usize {
		self.answers
			.keys()
			.filter(|sender| valid_members.contains(sender) && *sender != own)
			.count()
	}

	pub fn complaint_answers_received(&self) -> &BTreeMap<Address, BTreeMap<Address, ExposedShares>> {
		&self.answers
	}

	pub fn add_complaint_against(&mut self, accused: &Address) {
		self.against.insert(*accused);
	}

	/// The qualified set: valid members minus failed answerers minus the
	/// heavily complained against.
	pub fn build_qual(
		&self,
		valid_members: &BTreeSet<Address>,
		heavily_complained: &BTreeSet<Address>,
	) -> BTreeSet<Address> {
		valid_members
			.iter()
			.filter(|member| {
				!self.against.contains(member) && !heavily_complained.contains(member)
			})
			.copied()
			.collect()
	}
}

/// Third round: complaints within the qualified set.
#[derive(Default)]
pub struct QualComplaintsManager {
	/// sender -> exposed shares of the accused
	received: BTreeMap<Address, BTreeMap<Address, ExposedShares>>,
	against: BTreeSet<Address>,
}

impl QualComplaintsManager {
	pub fn reset(&mut self) {
		*self = QualComplaintsManager::default();
	}

	pub fn add_complaint_against(&mut self, accused: &Address) {
		self.against.insert(*accused);
	}

	pub fn add_complaints_from(
		&mut self,
		from: &Address,
		shares: BTreeMap<Address, ExposedShares>,
	) {
		self.received.entry(*from).or_insert(shares);
	}

	pub fn num_complaints_received(&self, qual: &BTreeSet<Address>, own: &Address) -> usize {
		self.received
			.keys()
			.filter(|sender| qual.contains(sender) && *sender != own)
			.count()
	}

	pub fn complaints_received(&self) -> &BTreeMap<Address, BTreeMap<Address, ExposedShares>> {
		&self.received
	}

	pub fn complaints(&self) -> &BTreeSet<Address> {
		&self.against
	}

	pub fn complaints_size(&self) -> usize {
		self.against.len()
	}

	pub fn find_complaint(&self, address: &Address) -> bool {
		self.against.contains(address)
	}
}
