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

//! Wall-clock abstraction. Protocol deadlines and block timestamps use
//! unix seconds from an injected clock so tests can run on virtual
//! time; monotonic scheduling delays are the runtime's business, not
//! this trait's.

use std::{
	sync::atomic::{AtomicU64, Ordering},
	time::{SystemTime, UNIX_EPOCH},
};

pub trait Clock: Send + Sync {
	/// Seconds elapsed since the unix epoch.
	fn now_unix(&self) -> u64;
}

/// The real system clock.
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now_unix(&self) -> u64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|elapsed| elapsed.as_secs())
			.unwrap_or(0)
	}
}

/// A manually advanced clock for tests.
#[derive(Default)]
pub struct ManualClock {
	now: AtomicU64,
}

impl ManualClock {
	pub fn new(now: u64) -> Self {
		ManualClock { now: AtomicU64::new(now) }
	}

	pub fn set(&self, now: u64) {
		self.now.store(now, Ordering::SeqCst);
	}

	pub fn advance(&self, seconds: u64) {
		self.now.fetch_add(seconds, Ordering::SeqCst);
	}
}

impl Clock for ManualClock {
	fn now_unix(&self) -> u64 {
		self.now.load(Ordering::SeqCst)
	}
}
