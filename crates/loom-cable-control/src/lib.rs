// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Control-plane access to the charon IKE daemon.
//!
//! The cable driver never talks to the daemon directly; it goes through the
//! narrow [`ControlClient`] capability:
//!
//! - [`ViciClient`] speaks strongSwan's VICI protocol over the daemon's unix socket
//! - `FakeControl` (feature `testing`) is an in-memory, scriptable stand-in
//!
//! # Example
//!
//! ```ignore
//! use loom_cable_control::{ControlClient, ViciClient, ViciClientConfig};
//!
//! let client = ViciClient::new(ViciClientConfig::new("/var/run/charon.vici"));
//! client.load_connection(&spec).await?;
//! client.initiate(&spec.id).await?;
//! ```

pub mod control;
pub mod vici;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

pub use control::{ControlClient, ControlError, Result, SaStatus};
pub use vici::{ViciClient, ViciClientConfig};

#[cfg(any(test, feature = "testing"))]
pub use fake::{ControlCall, FakeControl, FakeOp};
