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

//! Deterministic field-tagged wire codec.
//!
//! Wire structures are sequences of `(field_id: u8, value)` pairs in
//! ascending field-id order; values are bincode-encoded. The reader
//! enforces the id sequence, so a mismatched or reordered field is a
//! decode error rather than silent misinterpretation.

use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
	#[error("unexpected field id {found} (expected {expected})")]
	UnexpectedField { expected: u8, found: u8 },
	#[error("input truncated")]
	Truncated,
	#[error("trailing bytes after final field")]
	TrailingBytes,
	#[error("malformed field value: {0}")]
	Value(#[from] bincode::Error),
}

/// Accumulates id-tagged fields into a wire buffer.
#[derive(Default)]
pub struct WireWriter {
	buffer: Vec<u8>,
}

impl WireWriter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn field<T: Serialize>(mut self, id: u8, value: &T) -> Self {
		self.buffer.push(id);
		bincode::serialize_into(&mut self.buffer, value)
			.expect("serialization into a Vec cannot fail");
		self
	}

	pub fn finish(self) -> Vec<u8> {
		self.buffer
	}
}

/// Reads id-tagged fields back out of a wire buffer.
pub struct WireReader<'a> {
	remaining: &'a [u8],
}

impl<'a> WireReader<'a> {
	pub fn new(bytes: &'a [u8]) -> Self {
		WireReader { remaining: bytes }
	}

	pub fn field<T: DeserializeOwned>(&mut self, id: u8) -> Result<T, CodecError> {
		let (&found, rest) = self.remaining.split_first().ok_or(CodecError::Truncated)?;
		if found != id {
			return Err(CodecError::UnexpectedField { expected: id, found });
		}
		let mut cursor = rest;
		let value = bincode::deserialize_from(&mut cursor)?;
		self.remaining = cursor;
		Ok(value)
	}

	pub fn finish(self) -> Result<(), CodecError> {
		if self.remaining.is_empty() {
			Ok(())
		} else {
			Err(CodecError::TrailingBytes)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fields_round_trip_in_order() {
		let bytes = WireWriter::new()
			.field(1, &42u64)
			.field(2, &"text".to_string())
			.field(5, &vec![1u8, 2, 3])
			.finish();

		let mut reader = WireReader::new(&bytes);
		assert_eq!(reader.field::<u64>(1).unwrap(), 42);
		assert_eq!(reader.field::<String>(2).unwrap(), "text");
		assert_eq!(reader.field::<Vec<u8>>(5).unwrap(), vec![1, 2, 3]);
		reader.finish().unwrap();
	}

	#[test]
	fn out_of_order_field_is_an_error() {
		let bytes = WireWriter::new().field(2, &1u8).finish();
		let mut reader = WireReader::new(&bytes);
		assert!(matches!(
			reader.field::<u8>(1),
			Err(CodecError::UnexpectedField { expected: 1, found: 2 })
		));
	}

	#[test]
	fn truncated_input_is_an_error() {
		let mut bytes = WireWriter::new().field(1, &7u64).finish();
		bytes.truncate(bytes.len() - 1);
		let mut reader = WireReader::new(&bytes);
		assert!(reader.field::<u64>(1).is_err());
	}

	#[test]
	fn trailing_bytes_are_an_error() {
		let mut bytes = WireWriter::new().field(1, &7u64).finish();
		bytes.push(0xff);
		let mut reader = WireReader::new(&bytes);
		reader.field::<u64>(1).unwrap();
		assert!(matches!(reader.finish(), Err(CodecError::TrailingBytes)));
	}

	#[test]
	fn encoding_is_deterministic() {
		let a = WireWriter::new().field(1, &123u64).field(2, &vec![9u8; 4]).finish();
		let b = WireWriter::new().field(1, &123u64).field(2, &vec![9u8; 4]).finish();
		assert_eq!(a, b);
	}
}
