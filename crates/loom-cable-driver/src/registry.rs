// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Authoritative set of known remote endpoints.

use loom_cable_common::{ClusterId, Endpoint};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
	Upserted(Endpoint),
	Removed(ClusterId),
}

impl RegistryEvent {
	pub fn cluster_id(&self) -> &ClusterId {
		match self {
			RegistryEvent::Upserted(endpoint) => &endpoint.cluster_id,
			RegistryEvent::Removed(id) => id,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
	Added,
	Updated,
	/// Identical content was already registered; no event was emitted.
	Unchanged,
}

#[derive(Default)]
struct Inner {
	endpoints: HashMap<ClusterId, Endpoint>,
	subscribers: Vec<mpsc::UnboundedSender<RegistryEvent>>,
}

/// Concurrency-safe map from cluster id to endpoint.
///
/// Each mutation and its event dispatch happen under one short lock, so every
/// subscriber observes changes in exactly the order they were applied. No
/// I/O happens while the lock is held.
#[derive(Default)]
pub struct EndpointRegistry {
	inner: Mutex<Inner>,
}

impl EndpointRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	#[instrument(skip(self, endpoint), fields(cluster_id = %endpoint.cluster_id))]
	pub fn upsert(&self, endpoint: Endpoint) -> UpsertOutcome {
		let mut inner = self.inner.lock();
		let outcome = match inner.endpoints.get(&endpoint.cluster_id) {
			Some(existing) if *existing == endpoint => return UpsertOutcome::Unchanged,
			Some(_) => UpsertOutcome::Updated,
			None => UpsertOutcome::Added,
		};

		debug!(?outcome, "endpoint registered");
		inner
			.endpoints
			.insert(endpoint.cluster_id.clone(), endpoint.clone());
		inner.dispatch(RegistryEvent::Upserted(endpoint));
		outcome
	}

	/// Returns the removed endpoint, if it was registered.
	#[instrument(skip(self, cluster_id), fields(cluster_id = %cluster_id))]
	pub fn remove(&self, cluster_id: &ClusterId) -> Option<Endpoint> {
		let mut inner = self.inner.lock();
		let removed = inner.endpoints.remove(cluster_id)?;
		debug!("endpoint removed");
		inner.dispatch(RegistryEvent::Removed(cluster_id.clone()));
		Some(removed)
	}

	pub fn get(&self, cluster_id: &ClusterId) -> Option<Endpoint> {
		self.inner.lock().endpoints.get(cluster_id).cloned()
	}

	/// All registered endpoints ordered by cluster id.
	pub fn snapshot(&self) -> Vec<Endpoint> {
		let mut endpoints: Vec<_> = self.inner.lock().endpoints.values().cloned().collect();
		endpoints.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
		endpoints
	}

	pub fn len(&self) -> usize {
		self.inner.lock().endpoints.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Subscribes to changes. The receiver first sees an `Upserted` for every
	/// endpoint already registered, then every later change.
	pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RegistryEvent> {
		let (tx, rx) = mpsc::unbounded_channel();
		let mut inner = self.inner.lock();
		let mut current: Vec<_> = inner.endpoints.values().cloned().collect();
		current.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
		for endpoint in current {
			// Receiver is alive; it was created above.
			let _ = tx.send(RegistryEvent::Upserted(endpoint));
		}
		inner.subscribers.push(tx);
		rx
	}
}

impl Inner {
	fn dispatch(&mut self, event: RegistryEvent) {
		self.subscribers
			.retain(|tx| tx.send(event.clone()).is_ok());
	}
}
