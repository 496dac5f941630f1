// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! strongSwan VICI protocol: message codec, packet framing and a socket client.

pub mod client;
pub mod packet;
pub mod wire;

pub use client::{ViciClient, ViciClientConfig};
pub use packet::{Packet, PacketType};
pub use wire::{Element, Message, WireError};
