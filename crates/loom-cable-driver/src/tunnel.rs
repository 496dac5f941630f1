// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-endpoint tunnel state as seen from outside the reconciler.

use loom_cable_common::{ClusterId, ConnectionId, SpecError};
use loom_cable_control::ControlError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle of one remote endpoint's tunnel.
///
/// `Absent -> Pending -> Connecting -> Connected`, with `Connected ->
/// Connecting` on a lost SA, `Error -> Pending` after backoff, and any phase
/// `-> Terminating -> Absent` on removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelPhase {
	Absent,
	Pending,
	Connecting,
	Connected,
	Error,
	Terminating,
}

impl fmt::Display for TunnelPhase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			TunnelPhase::Absent => "absent",
			TunnelPhase::Pending => "pending",
			TunnelPhase::Connecting => "connecting",
			TunnelPhase::Connected => "connected",
			TunnelPhase::Error => "error",
			TunnelPhase::Terminating => "terminating",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
	/// Unreachable daemon, timeout, I/O or a failed command. Retried.
	Transient,
	/// The daemon refused the connection definition. Held until the endpoint changes.
	Rejected,
	/// Malformed daemon response. Retried but reported distinctly.
	Defect,
	/// No spec can be built from the endpoint pair. Held until the endpoint
	/// changes.
	InvalidSpec,
}

impl FailureKind {
	pub fn of(e: &ControlError) -> Self {
		if e.is_rejected() {
			FailureKind::Rejected
		} else if e.is_defect() {
			FailureKind::Defect
		} else {
			FailureKind::Transient
		}
	}

	pub fn is_retryable(self) -> bool {
		matches!(self, FailureKind::Transient | FailureKind::Defect)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
	pub kind: FailureKind,
	pub message: String,
}

impl From<&ControlError> for LastError {
	fn from(e: &ControlError) -> Self {
		Self {
			kind: FailureKind::of(e),
			message: e.to_string(),
		}
	}
}

impl From<&SpecError> for LastError {
	fn from(e: &SpecError) -> Self {
		Self {
			kind: FailureKind::InvalidSpec,
			message: e.to_string(),
		}
	}
}

/// Read-only snapshot of one endpoint's tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelStatus {
	pub cluster_id: ClusterId,
	pub connection_id: Option<ConnectionId>,
	pub phase: TunnelPhase,
	pub last_error: Option<LastError>,
	/// Consecutive failures since the tunnel was last connected or its spec
	/// last changed.
	pub retry_count: u32,
	/// Set once `retry_count` passes the configured ceiling. Retrying
	/// continues at the capped interval.
	pub retries_exhausted: bool,
	#[serde(skip)]
	pub next_retry_at: Option<Instant>,
}

impl TunnelStatus {
	pub fn new(cluster_id: ClusterId) -> Self {
		Self {
			cluster_id,
			connection_id: None,
			phase: TunnelPhase::Absent,
			last_error: None,
			retry_count: 0,
			retries_exhausted: false,
			next_retry_at: None,
		}
	}

	pub fn is_connected(&self) -> bool {
		self.phase == TunnelPhase::Connected
	}

	pub(crate) fn reset_retries(&mut self) {
		self.retry_count = 0;
		self.retries_exhausted = false;
		self.last_error = None;
		self.next_retry_at = None;
	}
}

/// Emitted on every phase change.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelTransition {
	pub cluster_id: ClusterId,
	pub from: TunnelPhase,
	pub to: TunnelPhase,
	pub retry_count: u32,
	/// Backoff before the next attempt, for transitions into `Error` that
	/// will be retried.
	pub retry_in: Option<Duration>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn failure_kind_classification() {
		let rejected = ControlError::Rejected {
			command: "load-conn".to_string(),
			message: "no".to_string(),
		};
		assert_eq!(FailureKind::of(&rejected), FailureKind::Rejected);
		assert_eq!(
			FailureKind::of(&ControlError::Protocol("x".to_string())),
			FailureKind::Defect
		);
		assert_eq!(
			FailureKind::of(&ControlError::Timeout("initiate".to_string())),
			FailureKind::Transient
		);
		assert!(!FailureKind::Rejected.is_retryable());
		assert!(!FailureKind::InvalidSpec.is_retryable());
		assert!(FailureKind::Defect.is_retryable());
	}

	#[test]
	fn status_serializes_phase_in_snake_case() {
		let mut status = TunnelStatus::new("east".parse().unwrap());
		status.phase = TunnelPhase::Connected;
		let json = serde_json::to_value(&status).unwrap();
		assert_eq!(json["phase"], "connected");
		assert_eq!(json["cluster_id"], "east");
		assert!(json.get("next_retry_at").is_none());
	}
}
