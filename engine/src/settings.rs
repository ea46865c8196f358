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

//! Node settings: a layered configuration of defaults, an optional TOML
//! file, `PALISADE_*` environment variables and command-line overrides,
//! highest last.

use std::path::PathBuf;

use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSettings {
	/// Interface the transport binds to.
	pub bind_address: String,
	pub port: u16,
	/// Bootstrap peer URIs.
	pub initial_peers: Vec<String>,
	/// 32-byte secret key file; a fresh key is generated when absent.
	#[serde(default)]
	pub key_file: Option<PathBuf>,
	pub db_path: PathBuf,
	/// Keep the chain purely in memory (no persistent block store).
	pub in_memory_db: bool,
	pub log_json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusSettings {
	/// Blocks per aeon.
	pub aeon_period: u64,
	pub max_cabinet_size: u64,
	pub block_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
	pub node: NodeSettings,
	pub consensus: ConsensusSettings,
}

#[derive(Debug, Parser)]
pub struct CommandLineOptions {
	/// Path to a TOML settings file.
	#[clap(long, env = "PALISADE_CONFIG")]
	pub config: Option<PathBuf>,

	#[clap(long)]
	pub port: Option<u16>,

	#[clap(long)]
	pub db_path: Option<PathBuf>,

	#[clap(long)]
	pub key_file: Option<PathBuf>,

	/// Comma separated bootstrap peer URIs.
	#[clap(long, value_delimiter = ',')]
	pub peers: Vec<String>,
}

impl Settings {
	pub fn new(options: &CommandLineOptions) -> Result<Self, ConfigError> {
		let mut builder = Config::builder()
			.set_default("node.bind_address", "0.0.0.0")?
			.set_default("node.port", 8010_u16)?
			.set_default("node.initial_peers", Vec::<String>::new())?
			.set_default("node.db_path", "palisade_data")?
			.set_default("node.in_memory_db", false)?
			.set_default("node.log_json", false)?
			.set_default("consensus.aeon_period", 25_u64)?
			.set_default("consensus.max_cabinet_size", 20_u64)?
			.set_default("consensus.block_interval_ms", 1000_u64)?;

		if let Some(path) = &options.config {
			builder = builder.add_source(File::from(path.clone()));
		}
		builder = builder.add_source(Environment::with_prefix("PALISADE").separator("__"));

		if let Some(port) = options.port {
			builder = builder.set_override("node.port", port)?;
		}
		if let Some(db_path) = &options.db_path {
			builder = builder
				.set_override("node.db_path", db_path.display().to_string())?;
		}
		if let Some(key_file) = &options.key_file {
			builder = builder
				.set_override("node.key_file", key_file.display().to_string())?;
		}
		if !options.peers.is_empty() {
			builder = builder.set_override("node.initial_peers", options.peers.clone())?;
		}

		builder.build()?.try_deserialize()
	}
}
