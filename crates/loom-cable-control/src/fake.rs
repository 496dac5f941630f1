// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Scriptable in-memory [`ControlClient`] for tests.
//!
//! Unscripted calls succeed and track a plausible daemon: `initiate` brings the
//! SA up, `terminate` takes it down, `status` reports the tracked state.
//! Results can be queued per operation and connection, and any operation can be
//! made to hang forever to exercise caller timeouts.

use crate::control::{ControlClient, ControlError, Result, SaStatus};
use async_trait::async_trait;
use loom_cable_common::{ConnectionId, ConnectionSpec, SecretString};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
	Load,
	Unload,
	Initiate,
	Terminate,
	Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCall {
	LoadConnection(ConnectionId),
	UnloadConnection(ConnectionId),
	LoadSharedKey,
	Initiate(ConnectionId),
	Terminate(ConnectionId),
	Status(ConnectionId),
}

impl ControlCall {
	pub fn connection(&self) -> Option<&ConnectionId> {
		match self {
			ControlCall::LoadConnection(id)
			| ControlCall::UnloadConnection(id)
			| ControlCall::Initiate(id)
			| ControlCall::Terminate(id)
			| ControlCall::Status(id) => Some(id),
			ControlCall::LoadSharedKey => None,
		}
	}
}

#[derive(Default)]
struct State {
	calls: Vec<ControlCall>,
	results: HashMap<(FakeOp, ConnectionId), VecDeque<Result<()>>>,
	statuses: HashMap<ConnectionId, VecDeque<Result<SaStatus>>>,
	shared_key_results: VecDeque<Result<()>>,
	hangs: HashSet<(FakeOp, ConnectionId)>,
	loaded: HashMap<ConnectionId, ConnectionSpec>,
	sas: HashMap<ConnectionId, SaStatus>,
	shared_key: Option<SecretString>,
}

#[derive(Default)]
pub struct FakeControl {
	state: Mutex<State>,
	notify: Notify,
}

impl FakeControl {
	pub fn new() -> Self {
		Self::default()
	}

	/// Queues the outcome of the next `op` call for `id`. `FakeOp::Status`
	/// results go through [`FakeControl::push_status`] instead.
	pub fn push_result(&self, op: FakeOp, id: &ConnectionId, result: Result<()>) {
		self.state
			.lock()
			.results
			.entry((op, id.clone()))
			.or_default()
			.push_back(result);
	}

	pub fn push_status(&self, id: &ConnectionId, result: Result<SaStatus>) {
		self.state
			.lock()
			.statuses
			.entry(id.clone())
			.or_default()
			.push_back(result);
	}

	pub fn push_shared_key_result(&self, result: Result<()>) {
		self.state.lock().shared_key_results.push_back(result);
	}

	/// Makes every subsequent `op` call for `id` pend forever. The call is
	/// still recorded.
	pub fn set_hang(&self, op: FakeOp, id: &ConnectionId) {
		self.state.lock().hangs.insert((op, id.clone()));
	}

	pub fn clear_hang(&self, op: FakeOp, id: &ConnectionId) {
		self.state.lock().hangs.remove(&(op, id.clone()));
	}

	/// Overrides the tracked SA state, e.g. to simulate a tunnel dropping.
	pub fn set_sa(&self, id: &ConnectionId, status: SaStatus) {
		self.state.lock().sas.insert(id.clone(), status);
	}

	pub fn calls(&self) -> Vec<ControlCall> {
		self.state.lock().calls.clone()
	}

	pub fn calls_for(&self, id: &ConnectionId) -> Vec<ControlCall> {
		self.state
			.lock()
			.calls
			.iter()
			.filter(|c| c.connection() == Some(id))
			.cloned()
			.collect()
	}

	pub fn count(&self, call: &ControlCall) -> usize {
		self.state.lock().calls.iter().filter(|c| *c == call).count()
	}

	pub fn loaded(&self, id: &ConnectionId) -> Option<ConnectionSpec> {
		self.state.lock().loaded.get(id).cloned()
	}

	pub fn shared_key(&self) -> Option<SecretString> {
		self.state.lock().shared_key.clone()
	}

	/// Resolves once `pred` holds over the recorded calls.
	pub async fn wait_for<F>(&self, pred: F)
	where
		F: Fn(&[ControlCall]) -> bool,
	{
		loop {
			let mut notified = std::pin::pin!(self.notify.notified());
			notified.as_mut().enable();
			if pred(&self.state.lock().calls) {
				return;
			}
			notified.await;
		}
	}

	/// Records `call` and returns the scripted outcome for it, pending forever
	/// if the operation is set to hang.
	async fn enter(&self, call: ControlCall, op: FakeOp, id: &ConnectionId) -> Option<Result<()>> {
		let (hang, scripted) = {
			let mut state = self.state.lock();
			state.calls.push(call);
			let key = (op, id.clone());
			let hang = state.hangs.contains(&key);
			let scripted = state.results.get_mut(&key).and_then(VecDeque::pop_front);
			(hang, scripted)
		};
		self.notify.notify_waiters();

		if hang {
			std::future::pending::<()>().await;
		}
		scripted
	}
}

#[async_trait]
impl ControlClient for FakeControl {
	async fn load_connection(&self, spec: &ConnectionSpec) -> Result<()> {
		let outcome = self
			.enter(ControlCall::LoadConnection(spec.id.clone()), FakeOp::Load, &spec.id)
			.await
			.unwrap_or(Ok(()));
		if outcome.is_ok() {
			self.state.lock().loaded.insert(spec.id.clone(), spec.clone());
		}
		outcome
	}

	async fn unload_connection(&self, id: &ConnectionId) -> Result<()> {
		let outcome = self
			.enter(ControlCall::UnloadConnection(id.clone()), FakeOp::Unload, id)
			.await
			.unwrap_or(Ok(()));
		if outcome.is_ok() {
			let mut state = self.state.lock();
			state.loaded.remove(id);
			state.sas.remove(id);
		}
		outcome
	}

	async fn load_shared_key(&self, key: &SecretString) -> Result<()> {
		let outcome = {
			let mut state = self.state.lock();
			state.calls.push(ControlCall::LoadSharedKey);
			let outcome = state.shared_key_results.pop_front().unwrap_or(Ok(()));
			if outcome.is_ok() {
				state.shared_key = Some(key.clone());
			}
			outcome
		};
		self.notify.notify_waiters();
		outcome
	}

	async fn initiate(&self, id: &ConnectionId) -> Result<()> {
		let outcome = self
			.enter(ControlCall::Initiate(id.clone()), FakeOp::Initiate, id)
			.await;
		let mut state = self.state.lock();
		match outcome {
			Some(result) => result,
			None if state.loaded.contains_key(id) => {
				state.sas.insert(id.clone(), SaStatus::Up);
				Ok(())
			}
			None => Err(ControlError::CommandFailed {
				command: "initiate".to_string(),
				message: format!("no config named {id}"),
			}),
		}
	}

	async fn terminate(&self, id: &ConnectionId) -> Result<()> {
		let outcome = self
			.enter(ControlCall::Terminate(id.clone()), FakeOp::Terminate, id)
			.await
			.unwrap_or(Ok(()));
		if outcome.is_ok() {
			self.state.lock().sas.insert(id.clone(), SaStatus::Down);
		}
		outcome
	}

	async fn status(&self, id: &ConnectionId) -> Result<SaStatus> {
		let scripted = self.enter(ControlCall::Status(id.clone()), FakeOp::Status, id).await;
		let mut state = self.state.lock();
		if let Some(Err(e)) = scripted {
			return Err(e);
		}
		if let Some(result) = state.statuses.get_mut(id).and_then(VecDeque::pop_front) {
			return result;
		}
		Ok(state.sas.get(id).copied().unwrap_or(SaStatus::Down))
	}
}
