// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::vici::wire::{Message, WireError};

/// Upper bound accepted for a single packet read from the daemon.
pub const MAX_PACKET_LEN: usize = 512 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
	CmdRequest = 0,
	CmdResponse = 1,
	CmdUnknown = 2,
	EventRegister = 3,
	EventUnregister = 4,
	EventConfirm = 5,
	EventUnknown = 6,
	Event = 7,
}

impl PacketType {
	fn is_named(self) -> bool {
		matches!(
			self,
			PacketType::CmdRequest
				| PacketType::EventRegister
				| PacketType::EventUnregister
				| PacketType::Event
		)
	}

	fn has_message(self) -> bool {
		matches!(
			self,
			PacketType::CmdRequest | PacketType::CmdResponse | PacketType::Event
		)
	}
}

impl TryFrom<u8> for PacketType {
	type Error = WireError;

	fn try_from(value: u8) -> Result<Self, Self::Error> {
		Ok(match value {
			0 => PacketType::CmdRequest,
			1 => PacketType::CmdResponse,
			2 => PacketType::CmdUnknown,
			3 => PacketType::EventRegister,
			4 => PacketType::EventUnregister,
			5 => PacketType::EventConfirm,
			6 => PacketType::EventUnknown,
			7 => PacketType::Event,
			other => return Err(WireError::UnknownPacketType(other)),
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
	pub kind: PacketType,
	pub name: Option<String>,
	pub message: Message,
}

impl Packet {
	pub fn request(command: &str, message: Message) -> Self {
		Self {
			kind: PacketType::CmdRequest,
			name: Some(command.to_string()),
			message,
		}
	}

	pub fn register(event: &str) -> Self {
		Self {
			kind: PacketType::EventRegister,
			name: Some(event.to_string()),
			message: Message::new(),
		}
	}

	pub fn unregister(event: &str) -> Self {
		Self {
			kind: PacketType::EventUnregister,
			name: Some(event.to_string()),
			message: Message::new(),
		}
	}

	/// Serializes the packet including its four-byte length prefix.
	pub fn encode(&self) -> Result<Vec<u8>, WireError> {
		let mut body = vec![self.kind as u8];
		if self.kind.is_named() {
			let name = self.name.as_deref().unwrap_or_default();
			let len = u8::try_from(name.len()).map_err(|_| WireError::NameTooLong(name.to_string()))?;
			body.push(len);
			body.extend_from_slice(name.as_bytes());
		}
		if self.kind.has_message() {
			self.message.encode(&mut body)?;
		}
		if body.len() > MAX_PACKET_LEN {
			return Err(WireError::PacketTooLarge(body.len()));
		}

		let mut out = Vec::with_capacity(body.len() + 4);
		out.extend_from_slice(&(body.len() as u32).to_be_bytes());
		out.extend_from_slice(&body);
		Ok(out)
	}

	/// Parses a packet body, i.e. everything after the length prefix.
	pub fn decode(body: &[u8]) -> Result<Self, WireError> {
		let (&kind, mut rest) = body.split_first().ok_or(WireError::Truncated)?;
		let kind = PacketType::try_from(kind)?;

		let name = if kind.is_named() {
			let (&len, tail) = rest.split_first().ok_or(WireError::Truncated)?;
			let len = len as usize;
			if tail.len() < len {
				return Err(WireError::Truncated);
			}
			let name = String::from_utf8(tail[..len].to_vec()).map_err(|_| WireError::InvalidName)?;
			rest = &tail[len..];
			Some(name)
		} else {
			None
		};

		let message = if kind.has_message() {
			Message::decode(rest)?
		} else {
			Message::new()
		};

		Ok(Self {
			kind,
			name,
			message,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_layout() {
		let packet = Packet::request("version", Message::new());
		let bytes = packet.encode().unwrap();
		assert_eq!(&bytes[..4], &9u32.to_be_bytes());
		assert_eq!(bytes[4], PacketType::CmdRequest as u8);
		assert_eq!(bytes[5], 7);
		assert_eq!(&bytes[6..], b"version");
	}

	#[test]
	fn decodes_response() {
		let mut body = vec![PacketType::CmdResponse as u8];
		Message::new().value("success", "yes").encode(&mut body).unwrap();

		let packet = Packet::decode(&body).unwrap();
		assert_eq!(packet.kind, PacketType::CmdResponse);
		assert!(packet.name.is_none());
		assert_eq!(packet.message.get_str("success"), Some("yes"));
	}

	#[test]
	fn decodes_event_confirm_without_payload() {
		let packet = Packet::decode(&[PacketType::EventConfirm as u8]).unwrap();
		assert_eq!(packet.kind, PacketType::EventConfirm);
		assert!(packet.message.is_empty());
	}

	#[test]
	fn register_roundtrip() {
		let bytes = Packet::register("list-sa").encode().unwrap();
		let packet = Packet::decode(&bytes[4..]).unwrap();
		assert_eq!(packet.kind, PacketType::EventRegister);
		assert_eq!(packet.name.as_deref(), Some("list-sa"));
	}

	#[test]
	fn rejects_unknown_type() {
		assert_eq!(Packet::decode(&[42]), Err(WireError::UnknownPacketType(42)));
	}

	#[test]
	fn rejects_truncated_name() {
		assert_eq!(
			Packet::decode(&[PacketType::Event as u8, 5, b'a']),
			Err(WireError::Truncated)
		);
	}
}
