// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use async_trait::async_trait;
use loom_cable_common::{ConnectionId, ConnectionSpec, SecretString};
use std::fmt;
use thiserror::Error;

/// Security association state as reported by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaStatus {
	Down,
	Connecting,
	Up,
	Error,
}

impl fmt::Display for SaStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			SaStatus::Down => "down",
			SaStatus::Connecting => "connecting",
			SaStatus::Up => "up",
			SaStatus::Error => "error",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
	#[error("control socket unreachable: {0}")]
	ConnectionRefused(String),

	#[error("{0} timed out")]
	Timeout(String),

	/// The daemon refused a configuration command, or an `initiate` whose
	/// negotiation log shows an authentication or proposal mismatch.
	#[error("daemon rejected {command}: {message}")]
	Rejected { command: String, message: String },

	/// Any other `success = no` reply, e.g. an `initiate` whose peer did
	/// not answer.
	#[error("daemon failed {command}: {message}")]
	CommandFailed { command: String, message: String },

	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("I/O error: {0}")]
	Io(String),
}

impl ControlError {
	/// Failures worth retrying without any change to the connection spec.
	pub fn is_transient(&self) -> bool {
		!self.is_rejected()
	}

	/// The daemon refused the connection definition itself.
	pub fn is_rejected(&self) -> bool {
		matches!(self, ControlError::Rejected { .. })
	}

	/// Malformed daemon responses indicate a defect on one side or the other
	/// and are flagged separately even though they are retried.
	pub fn is_defect(&self) -> bool {
		matches!(self, ControlError::Protocol(_))
	}
}

pub type Result<T> = std::result::Result<T, ControlError>;

/// Narrow capability over the IKE daemon's control socket.
///
/// Every call may block on I/O and may fail; callers are expected to bound
/// each call with their own timeout.
#[async_trait]
pub trait ControlClient: Send + Sync {
	/// Loads `spec` under `spec.id`. Loading identical content again is a
	/// no-op; different content under the same id replaces it.
	async fn load_connection(&self, spec: &ConnectionSpec) -> Result<()>;

	async fn unload_connection(&self, id: &ConnectionId) -> Result<()>;

	/// Loads a pre-shared IKE key matching any peer identity.
	async fn load_shared_key(&self, key: &SecretString) -> Result<()>;

	async fn initiate(&self, id: &ConnectionId) -> Result<()>;

	async fn terminate(&self, id: &ConnectionId) -> Result<()>;

	async fn status(&self, id: &ConnectionId) -> Result<SaStatus>;
}
