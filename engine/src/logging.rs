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

use tracing_subscriber::EnvFilter;

/// Install the process-wide tracing subscriber. Filtering follows
/// `RUST_LOG`, defaulting to `info`.
pub fn init_tracing(json: bool) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	if json {
		tracing_subscriber::fmt().with_env_filter(filter).json().init();
	} else {
		tracing_subscriber::fmt().with_env_filter(filter).init();
	}
}
