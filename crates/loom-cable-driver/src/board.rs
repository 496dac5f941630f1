// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared, read-mostly view of every tunnel's status.

use crate::tunnel::{TunnelStatus, TunnelTransition};
use loom_cable_common::ClusterId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

const TRANSITION_CHANNEL_CAPACITY: usize = 256;

/// Workers publish here; readers take snapshots or subscribe to phase
/// transitions. Cloning shares the same board.
#[derive(Clone)]
pub struct StatusBoard {
	inner: Arc<StatusBoardInner>,
}

struct StatusBoardInner {
	tunnels: RwLock<HashMap<ClusterId, TunnelStatus>>,
	sender: broadcast::Sender<TunnelTransition>,
}

impl StatusBoard {
	pub fn new() -> Self {
		let (sender, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
		Self {
			inner: Arc::new(StatusBoardInner {
				tunnels: RwLock::new(HashMap::new()),
				sender,
			}),
		}
	}

	/// Stores `status`, broadcasting `transition` when the phase changed.
	pub fn publish(&self, status: &TunnelStatus, transition: Option<TunnelTransition>) {
		self.inner
			.tunnels
			.write()
			.insert(status.cluster_id.clone(), status.clone());

		if let Some(transition) = transition {
			// No subscribers is fine.
			let _ = self.inner.sender.send(transition);
		}
	}

	pub fn remove(&self, cluster_id: &ClusterId) {
		self.inner.tunnels.write().remove(cluster_id);
	}

	pub fn get(&self, cluster_id: &ClusterId) -> Option<TunnelStatus> {
		self.inner.tunnels.read().get(cluster_id).cloned()
	}

	/// All tunnels ordered by cluster id.
	pub fn snapshot(&self) -> Vec<TunnelStatus> {
		let mut tunnels: Vec<_> = self.inner.tunnels.read().values().cloned().collect();
		tunnels.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
		tunnels
	}

	pub fn subscribe(&self) -> broadcast::Receiver<TunnelTransition> {
		self.inner.sender.subscribe()
	}
}

impl Default for StatusBoard {
	fn default() -> Self {
		Self::new()
	}
}
