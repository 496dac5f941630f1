// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! VICI message encoding.
//!
//! A message is a flat sequence of typed elements. Names are prefixed with a
//! one-byte length, values with a two-byte big-endian length.

use thiserror::Error;

const SECTION_START: u8 = 1;
const SECTION_END: u8 = 2;
const KEY_VALUE: u8 = 3;
const LIST_START: u8 = 4;
const LIST_ITEM: u8 = 5;
const LIST_END: u8 = 6;

const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
	#[error("message truncated")]
	Truncated,

	#[error("unknown element type {0}")]
	UnknownElement(u8),

	#[error("unexpected element type {0}")]
	UnexpectedElement(u8),

	#[error("name exceeds 255 bytes: {0}")]
	NameTooLong(String),

	#[error("value for {0} exceeds 65535 bytes")]
	ValueTooLong(String),

	#[error("unbalanced section")]
	UnbalancedSection,

	#[error("sections nested deeper than {MAX_DEPTH}")]
	TooDeep,

	#[error("invalid UTF-8 in element name")]
	InvalidName,

	#[error("unknown packet type {0}")]
	UnknownPacketType(u8),

	#[error("packet of {0} bytes exceeds limit")]
	PacketTooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
	Value(Vec<u8>),
	List(Vec<Vec<u8>>),
	Section(Message),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
	entries: Vec<(String, Element)>,
}

impl Message {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn value(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
		self.entries.push((key.into(), Element::Value(value.into())));
		self
	}

	pub fn list<I, V>(mut self, key: impl Into<String>, items: I) -> Self
	where
		I: IntoIterator<Item = V>,
		V: Into<Vec<u8>>,
	{
		let items = items.into_iter().map(Into::into).collect();
		self.entries.push((key.into(), Element::List(items)));
		self
	}

	pub fn section(mut self, key: impl Into<String>, section: Message) -> Self {
		self.entries.push((key.into(), Element::Section(section)));
		self
	}

	pub fn get(&self, key: &str) -> Option<&Element> {
		self.entries.iter().find(|(k, _)| k == key).map(|(_, e)| e)
	}

	pub fn get_str(&self, key: &str) -> Option<&str> {
		match self.get(key)? {
			Element::Value(v) => std::str::from_utf8(v).ok(),
			_ => None,
		}
	}

	pub fn get_section(&self, key: &str) -> Option<&Message> {
		match self.get(key)? {
			Element::Section(m) => Some(m),
			_ => None,
		}
	}

	pub fn sections(&self) -> impl Iterator<Item = (&str, &Message)> {
		self.entries.iter().filter_map(|(k, e)| match e {
			Element::Section(m) => Some((k.as_str(), m)),
			_ => None,
		})
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
		for (name, element) in &self.entries {
			match element {
				Element::Value(value) => {
					out.push(KEY_VALUE);
					put_name(out, name)?;
					put_value(out, name, value)?;
				}
				Element::List(items) => {
					out.push(LIST_START);
					put_name(out, name)?;
					for item in items {
						out.push(LIST_ITEM);
						put_value(out, name, item)?;
					}
					out.push(LIST_END);
				}
				Element::Section(section) => {
					out.push(SECTION_START);
					put_name(out, name)?;
					section.encode(out)?;
					out.push(SECTION_END);
				}
			}
		}
		Ok(())
	}

	pub fn decode(data: &[u8]) -> Result<Self, WireError> {
		let mut reader = Reader { data, pos: 0 };
		let message = decode_entries(&mut reader, 0)?;
		if reader.pos != data.len() {
			return Err(WireError::UnbalancedSection);
		}
		Ok(message)
	}
}

fn put_name(out: &mut Vec<u8>, name: &str) -> Result<(), WireError> {
	let len = u8::try_from(name.len()).map_err(|_| WireError::NameTooLong(name.to_string()))?;
	out.push(len);
	out.extend_from_slice(name.as_bytes());
	Ok(())
}

fn put_value(out: &mut Vec<u8>, name: &str, value: &[u8]) -> Result<(), WireError> {
	let len = u16::try_from(value.len()).map_err(|_| WireError::ValueTooLong(name.to_string()))?;
	out.extend_from_slice(&len.to_be_bytes());
	out.extend_from_slice(value);
	Ok(())
}

struct Reader<'a> {
	data: &'a [u8],
	pos: usize,
}

impl<'a> Reader<'a> {
	fn is_empty(&self) -> bool {
		self.pos >= self.data.len()
	}

	fn u8(&mut self) -> Result<u8, WireError> {
		let b = *self.data.get(self.pos).ok_or(WireError::Truncated)?;
		self.pos += 1;
		Ok(b)
	}

	fn bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
		let end = self.pos.checked_add(len).ok_or(WireError::Truncated)?;
		let slice = self.data.get(self.pos..end).ok_or(WireError::Truncated)?;
		self.pos = end;
		Ok(slice)
	}

	fn name(&mut self) -> Result<String, WireError> {
		let len = self.u8()? as usize;
		let raw = self.bytes(len)?;
		String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidName)
	}

	fn value(&mut self) -> Result<Vec<u8>, WireError> {
		let hi = self.u8()?;
		let lo = self.u8()?;
		let len = u16::from_be_bytes([hi, lo]) as usize;
		Ok(self.bytes(len)?.to_vec())
	}
}

fn decode_entries(reader: &mut Reader<'_>, depth: usize) -> Result<Message, WireError> {
	if depth > MAX_DEPTH {
		return Err(WireError::TooDeep);
	}

	let mut message = Message::new();
	loop {
		if reader.is_empty() {
			if depth > 0 {
				return Err(WireError::UnbalancedSection);
			}
			return Ok(message);
		}

		match reader.u8()? {
			KEY_VALUE => {
				let name = reader.name()?;
				let value = reader.value()?;
				message.entries.push((name, Element::Value(value)));
			}
			LIST_START => {
				let name = reader.name()?;
				let mut items = Vec::new();
				loop {
					match reader.u8()? {
						LIST_ITEM => items.push(reader.value()?),
						LIST_END => break,
						other => return Err(WireError::UnexpectedElement(other)),
					}
				}
				message.entries.push((name, Element::List(items)));
			}
			SECTION_START => {
				let name = reader.name()?;
				let section = decode_entries(reader, depth + 1)?;
				message.entries.push((name, Element::Section(section)));
			}
			SECTION_END => {
				if depth == 0 {
					return Err(WireError::UnbalancedSection);
				}
				return Ok(message);
			}
			other @ (LIST_ITEM | LIST_END) => return Err(WireError::UnexpectedElement(other)),
			other => return Err(WireError::UnknownElement(other)),
		}
	}
}
