// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Tunnel reconciliation.
//!
//! A dispatcher consumes registry events and owns one worker task per remote
//! endpoint. Each worker runs the tunnel state machine for its endpoint and
//! talks to the daemon on its own, so a slow or failing endpoint never holds
//! up another. Every control call races against the worker's command queue:
//! a removal or a spec-changing update interrupts waits and in-flight calls.

use crate::backoff::Backoff;
use crate::board::StatusBoard;
use crate::registry::RegistryEvent;
use crate::tunnel::{FailureKind, LastError, TunnelPhase, TunnelStatus, TunnelTransition};
use futures::future::join_all;
use loom_cable_common::{spec, ClusterId, ConnectionId, ConnectionSpec, DriverConfig, Endpoint};
use loom_cable_control::{ControlClient, ControlError, SaStatus};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug)]
pub(crate) enum WorkerCommand {
	Update(Endpoint),
	Remove,
}

/// Shared by the dispatcher and every worker it spawns.
#[derive(Clone)]
pub(crate) struct ReconcileContext {
	pub config: Arc<DriverConfig>,
	pub local: Arc<Endpoint>,
	pub control: Arc<dyn ControlClient>,
	pub board: StatusBoard,
}

struct WorkerHandle {
	tx: mpsc::UnboundedSender<WorkerCommand>,
	join: JoinHandle<()>,
}

pub(crate) struct Dispatcher {
	ctx: ReconcileContext,
	workers: HashMap<ClusterId, WorkerHandle>,
	/// Workers told to remove their tunnel that may still be tearing down.
	retiring: HashMap<ClusterId, JoinHandle<()>>,
}

impl Dispatcher {
	pub fn new(ctx: ReconcileContext) -> Self {
		Self {
			ctx,
			workers: HashMap::new(),
			retiring: HashMap::new(),
		}
	}

	#[instrument(skip_all)]
	pub async fn run(
		mut self,
		mut events: mpsc::UnboundedReceiver<RegistryEvent>,
		mut shutdown: watch::Receiver<bool>,
	) {
		info!("tunnel dispatcher started");

		if !*shutdown.borrow() {
			loop {
				tokio::select! {
					biased;

					changed = shutdown.changed() => {
						if changed.is_err() || *shutdown.borrow() {
							info!("shutdown signal received");
							break;
						}
					}

					event = events.recv() => {
						match event {
							Some(event) => self.handle(event),
							None => {
								debug!("registry closed");
								break;
							}
						}
					}
				}
			}
		}

		self.drain().await;
		info!("tunnel dispatcher stopped");
	}

	fn handle(&mut self, event: RegistryEvent) {
		self.retiring.retain(|_, join| !join.is_finished());

		match event {
			RegistryEvent::Upserted(endpoint) => {
				let id = endpoint.cluster_id.clone();
				let endpoint = match self.workers.get(&id) {
					Some(worker) => match worker.tx.send(WorkerCommand::Update(endpoint)) {
						Ok(()) => return,
						Err(mpsc::error::SendError(WorkerCommand::Update(endpoint))) => endpoint,
						Err(_) => return,
					},
					None => endpoint,
				};
				// Either no worker or it already exited.
				if let Some(stale) = self.workers.remove(&id) {
					self.retiring.insert(id.clone(), stale.join);
				}
				self.spawn(endpoint);
			}
			RegistryEvent::Removed(id) => {
				if let Some(worker) = self.workers.remove(&id) {
					let _ = worker.tx.send(WorkerCommand::Remove);
					self.retiring.insert(id, worker.join);
				}
			}
		}
	}

	fn spawn(&mut self, endpoint: Endpoint) {
		let id = endpoint.cluster_id.clone();
		let predecessor = self.retiring.remove(&id);
		let (tx, rx) = mpsc::unbounded_channel();
		let worker = TunnelWorker::new(self.ctx.clone(), endpoint, rx);

		debug!(cluster_id = %id, waits_for_predecessor = predecessor.is_some(), "spawning tunnel worker");
		let join = tokio::spawn(async move {
			if let Some(predecessor) = predecessor {
				if let Err(e) = predecessor.await {
					error!(error = %e, "previous tunnel worker failed");
				}
			}
			worker.run().await;
		});
		self.workers.insert(id, WorkerHandle { tx, join });
	}

	async fn drain(&mut self) {
		let mut joins: Vec<JoinHandle<()>> = self.retiring.drain().map(|(_, join)| join).collect();
		for (_, worker) in self.workers.drain() {
			let _ = worker.tx.send(WorkerCommand::Remove);
			joins.push(worker.join);
		}

		info!(workers = joins.len(), "tearing down tunnels");
		for result in join_all(joins).await {
			if let Err(e) = result {
				error!(error = %e, "tunnel worker failed");
			}
		}
	}
}

enum Outcome<T> {
	Done(T),
	Interrupted,
}

/// Daemon state left behind by a superseded connection spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stale {
	/// An SA may still run under the old spec; it must go before the new
	/// spec is initiated.
	Sa,
	/// No valid spec replaces the old one; its SA and definition must go.
	Connection,
}

/// State machine for one remote endpoint.
pub(crate) struct TunnelWorker {
	ctx: ReconcileContext,
	backoff: Backoff,
	endpoint: Endpoint,
	spec: Option<ConnectionSpec>,
	status: TunnelStatus,
	commands: mpsc::UnboundedReceiver<WorkerCommand>,
	removed: bool,
	/// Set once a spec was loaded into the daemon under `status.connection_id`.
	loaded: bool,
	stale: Option<Stale>,
}

impl TunnelWorker {
	fn new(
		ctx: ReconcileContext,
		endpoint: Endpoint,
		commands: mpsc::UnboundedReceiver<WorkerCommand>,
	) -> Self {
		let backoff = Backoff::from_config(&ctx.config.reconcile);
		let status = TunnelStatus::new(endpoint.cluster_id.clone());
		Self {
			ctx,
			backoff,
			endpoint,
			spec: None,
			status,
			commands,
			removed: false,
			loaded: false,
			stale: None,
		}
	}

	#[instrument(skip(self), fields(cluster_id = %self.status.cluster_id))]
	async fn run(mut self) {
		self.ctx.board.publish(&self.status, None);

		loop {
			if self.removed && self.status.phase != TunnelPhase::Terminating {
				self.transition(TunnelPhase::Terminating);
			}
			if self.status.phase != TunnelPhase::Terminating {
				if let Some(stale) = self.stale.take() {
					self.retire(stale).await;
					continue;
				}
			}

			match self.status.phase {
				TunnelPhase::Absent => self.rebuild_spec(),
				TunnelPhase::Pending => self.load().await,
				TunnelPhase::Connecting => self.connect().await,
				TunnelPhase::Connected => self.health_check().await,
				TunnelPhase::Error => self.hold_or_retry().await,
				TunnelPhase::Terminating => {
					self.teardown().await;
					break;
				}
			}
		}

		self.ctx.board.remove(&self.status.cluster_id);
		debug!("tunnel worker finished");
	}

	fn rebuild_spec(&mut self) {
		match spec::build(&self.ctx.local, &self.endpoint, &self.ctx.config) {
			Ok(spec) => {
				self.status.connection_id = Some(spec.id.clone());
				self.spec = Some(spec);
				self.transition(TunnelPhase::Pending);
			}
			Err(e) => {
				warn!(error = %e, "cannot build connection spec");
				self.spec = None;
				self.status.last_error = Some(LastError::from(&e));
				self.status.next_retry_at = None;
				self.transition(TunnelPhase::Error);
			}
		}
	}

	async fn load(&mut self) {
		let Some(spec) = self.spec.clone() else {
			self.rebuild_spec();
			return;
		};
		let control = self.ctx.control.clone();
		let limit = self.ctx.config.reconcile.load_timeout;

		match self
			.call("load_connection", limit, async move { control.load_connection(&spec).await })
			.await
		{
			Outcome::Interrupted => {}
			Outcome::Done(Ok(())) => {
				self.loaded = true;
				self.transition(TunnelPhase::Connecting);
			}
			Outcome::Done(Err(e)) => self.fail(e),
		}
	}

	async fn connect(&mut self) {
		let Some(id) = self.status.connection_id.clone() else {
			self.transition(TunnelPhase::Absent);
			return;
		};
		let reconcile = self.ctx.config.reconcile.clone();

		match self.initiate(&id, reconcile.initiate_timeout).await {
			Outcome::Interrupted => return,
			Outcome::Done(Err(e)) => return self.fail(e),
			Outcome::Done(Ok(())) => {}
		}

		for poll in 0..reconcile.max_connect_polls {
			if poll > 0 && self.wait(reconcile.status_poll_interval).await {
				return;
			}
			match self.status_of(&id, reconcile.status_timeout).await {
				Outcome::Interrupted => return,
				Outcome::Done(Ok(SaStatus::Up)) => {
					self.status.reset_retries();
					self.transition(TunnelPhase::Connected);
					return;
				}
				Outcome::Done(Ok(SaStatus::Error)) => {
					return self.fail(ControlError::CommandFailed {
						command: "initiate".to_string(),
						message: "daemon reports the SA in error state".to_string(),
					});
				}
				Outcome::Done(Ok(status)) => debug!(%status, poll, "waiting for SA"),
				Outcome::Done(Err(e)) if e.is_transient() && !e.is_defect() => {
					debug!(error = %e, poll, "status query failed");
				}
				Outcome::Done(Err(e)) => return self.fail(e),
			}
		}

		self.fail(ControlError::Timeout(format!(
			"SA establishment after {} status polls",
			reconcile.max_connect_polls
		)));
	}

	async fn health_check(&mut self) {
		let Some(id) = self.status.connection_id.clone() else {
			self.transition(TunnelPhase::Absent);
			return;
		};
		let reconcile = self.ctx.config.reconcile.clone();

		if self.wait(reconcile.health_check_interval).await {
			return;
		}
		match self.status_of(&id, reconcile.status_timeout).await {
			Outcome::Interrupted => {}
			Outcome::Done(Ok(SaStatus::Up | SaStatus::Connecting)) => {}
			Outcome::Done(Ok(status)) => {
				warn!(%status, connection = %id, "SA lost, re-initiating");
				self.transition(TunnelPhase::Connecting);
			}
			Outcome::Done(Err(e)) => {
				warn!(error = %e, connection = %id, "health check failed");
			}
		}
	}

	async fn hold_or_retry(&mut self) {
		let retryable = self
			.status
			.last_error
			.as_ref()
			.map_or(true, |e| e.kind.is_retryable());

		if !retryable || self.spec.is_none() {
			debug!("holding in error until the endpoint changes");
			self.idle().await;
			return;
		}

		let deadline = self.status.next_retry_at.unwrap_or_else(Instant::now);
		if self.wait_until(deadline).await {
			return;
		}
		info!(retry_count = self.status.retry_count, "retrying tunnel");
		self.transition(TunnelPhase::Pending);
	}

	/// Issues `terminate` then `unload_connection`, bounded by the grace
	/// period. Outcomes are logged and otherwise ignored.
	async fn teardown(&mut self) {
		if let Some(id) = self.status.connection_id.clone() {
			let control = self.ctx.control.clone();
			let reconcile = self.ctx.config.reconcile.clone();
			let op_timeout = reconcile.terminate_timeout;

			let steps = async {
				match timeout(op_timeout, control.terminate(&id)).await {
					Ok(Ok(())) => debug!(connection = %id, "terminated SA"),
					Ok(Err(e)) => warn!(error = %e, connection = %id, "terminate failed"),
					Err(_) => warn!(connection = %id, "terminate timed out"),
				}
				match timeout(op_timeout, control.unload_connection(&id)).await {
					Ok(Ok(())) => debug!(connection = %id, "unloaded connection"),
					Ok(Err(e)) => warn!(error = %e, connection = %id, "unload failed"),
					Err(_) => warn!(connection = %id, "unload timed out"),
				}
			};
			if timeout(reconcile.terminate_grace, steps).await.is_err() {
				warn!(connection = %id, "teardown exceeded grace period");
			}
		}

		self.status.connection_id = None;
		self.status.next_retry_at = None;
		self.transition(TunnelPhase::Absent);
	}

	/// Clears what a superseded spec left in the daemon. Outcomes are logged
	/// and otherwise ignored; a removal or another spec change interrupts.
	async fn retire(&mut self, stale: Stale) {
		let Some(id) = self.status.connection_id.clone() else {
			return;
		};
		let limit = self.ctx.config.reconcile.terminate_timeout;
		info!(connection = %id, ?stale, "retiring superseded connection");

		let control = self.ctx.control.clone();
		let target = id.clone();
		match self
			.call("terminate", limit, async move { control.terminate(&target).await })
			.await
		{
			Outcome::Interrupted => return,
			Outcome::Done(Ok(())) => debug!(connection = %id, "terminated superseded SA"),
			Outcome::Done(Err(e)) => warn!(error = %e, connection = %id, "terminate failed"),
		}

		if stale == Stale::Connection {
			let control = self.ctx.control.clone();
			let target = id.clone();
			match self
				.call("unload_connection", limit, async move {
					control.unload_connection(&target).await
				})
				.await
			{
				Outcome::Interrupted => return,
				Outcome::Done(Ok(())) => debug!(connection = %id, "unloaded superseded connection"),
				Outcome::Done(Err(e)) => warn!(error = %e, connection = %id, "unload failed"),
			}
			self.loaded = false;
		}
	}

	fn mark_stale(&mut self, stale: Stale) {
		if self.loaded {
			self.stale = self.stale.max(Some(stale));
		}
	}

	async fn initiate(&mut self, id: &ConnectionId, limit: Duration) -> Outcome<Result<(), ControlError>> {
		let control = self.ctx.control.clone();
		let id = id.clone();
		self.call("initiate", limit, async move { control.initiate(&id).await })
			.await
	}

	async fn status_of(&mut self, id: &ConnectionId, limit: Duration) -> Outcome<Result<SaStatus, ControlError>> {
		let control = self.ctx.control.clone();
		let id = id.clone();
		self.call("status", limit, async move { control.status(&id).await })
			.await
	}

	/// Drives `fut` to completion under `limit` unless a command interrupts it.
	async fn call<T, F>(&mut self, op: &'static str, limit: Duration, fut: F) -> Outcome<Result<T, ControlError>>
	where
		F: Future<Output = Result<T, ControlError>>,
	{
		let fut = timeout(limit, fut);
		tokio::pin!(fut);
		loop {
			tokio::select! {
				biased;

				command = self.commands.recv() => {
					if self.apply(command) {
						debug!(op, "control call interrupted");
						return Outcome::Interrupted;
					}
				}

				result = &mut fut => {
					return Outcome::Done(result.unwrap_or_else(|_| Err(ControlError::Timeout(op.to_string()))));
				}
			}
		}
	}

	async fn wait(&mut self, duration: Duration) -> bool {
		self.wait_until(Instant::now() + duration).await
	}

	/// Returns true when a command interrupted the wait.
	async fn wait_until(&mut self, deadline: Instant) -> bool {
		let sleep = sleep_until(deadline);
		tokio::pin!(sleep);
		loop {
			tokio::select! {
				biased;

				command = self.commands.recv() => {
					if self.apply(command) {
						return true;
					}
				}

				_ = &mut sleep => return false,
			}
		}
	}

	async fn idle(&mut self) {
		loop {
			let command = self.commands.recv().await;
			if self.apply(command) {
				return;
			}
		}
	}

	/// Applies a command. Returns true when the current step must be
	/// abandoned. A closed queue counts as removal.
	fn apply(&mut self, command: Option<WorkerCommand>) -> bool {
		match command {
			None | Some(WorkerCommand::Remove) => {
				debug!("endpoint removed");
				self.removed = true;
				true
			}
			Some(WorkerCommand::Update(endpoint)) => {
				if endpoint == self.endpoint {
					return false;
				}
				self.endpoint = endpoint;

				match spec::build(&self.ctx.local, &self.endpoint, &self.ctx.config) {
					Ok(spec) if self.spec.as_ref() == Some(&spec) => {
						debug!("endpoint updated without affecting the connection");
						false
					}
					Ok(spec) => {
						info!(connection = %spec.id, "connection spec changed");
						self.mark_stale(Stale::Sa);
						self.status.connection_id = Some(spec.id.clone());
						self.spec = Some(spec);
						self.status.reset_retries();
						self.transition(TunnelPhase::Pending);
						true
					}
					Err(e) => {
						warn!(error = %e, "updated endpoint yields no valid connection spec");
						self.mark_stale(Stale::Connection);
						self.spec = None;
						self.status.last_error = Some(LastError::from(&e));
						self.status.next_retry_at = None;
						self.transition(TunnelPhase::Error);
						true
					}
				}
			}
		}
	}

	fn fail(&mut self, e: ControlError) {
		let reconcile = &self.ctx.config.reconcile;
		let kind = FailureKind::of(&e);
		self.status.retry_count = self.status.retry_count.saturating_add(1);
		self.status.last_error = Some(LastError::from(&e));

		if self.status.retry_count > reconcile.retry_ceiling && !self.status.retries_exhausted {
			self.status.retries_exhausted = true;
			error!(
				retry_count = self.status.retry_count,
				ceiling = reconcile.retry_ceiling,
				error = %e,
				"retry ceiling exceeded, continuing at capped interval"
			);
		}

		let retry_in = if kind.is_retryable() {
			let delay = if self.status.retries_exhausted {
				self.backoff.max
			} else {
				self.backoff.delay(self.status.retry_count)
			};
			self.status.next_retry_at = Some(Instant::now() + delay);
			Some(delay)
		} else {
			self.status.next_retry_at = None;
			None
		};

		match kind {
			FailureKind::Defect => error!(error = %e, "daemon protocol defect"),
			FailureKind::Rejected => warn!(error = %e, "daemon rejected connection, holding until the endpoint changes"),
			_ => warn!(
				error = %e,
				retry_count = self.status.retry_count,
				retry_in_ms = retry_in.map(|d| d.as_millis() as u64),
				"tunnel attempt failed"
			),
		}

		self.transition_with(TunnelPhase::Error, retry_in);
	}

	fn transition(&mut self, to: TunnelPhase) {
		self.transition_with(to, None);
	}

	fn transition_with(&mut self, to: TunnelPhase, retry_in: Option<Duration>) {
		let from = self.status.phase;
		self.status.phase = to;
		if to != TunnelPhase::Error {
			self.status.next_retry_at = None;
		}

		let transition = (from != to).then(|| {
			info!(%from, %to, retry_count = self.status.retry_count, "tunnel phase changed");
			TunnelTransition {
				cluster_id: self.status.cluster_id.clone(),
				from,
				to,
				retry_count: self.status.retry_count,
				retry_in,
			}
		});
		self.ctx.board.publish(&self.status, transition);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use loom_cable_control::{ControlCall, FakeControl, FakeOp};

	fn endpoint(id: &str, ip: &str, subnet: &str) -> Endpoint {
		Endpoint::new(id.parse().unwrap(), ip.parse().unwrap())
			.with_subnets([subnet.parse().unwrap()])
	}

	fn context(fake: Arc<FakeControl>) -> ReconcileContext {
		ReconcileContext {
			config: Arc::new(DriverConfig::default()),
			local: Arc::new(endpoint("local", "10.0.0.1", "10.42.0.0/16")),
			control: fake,
			board: StatusBoard::new(),
		}
	}

	async fn wait_for_phase(board: &StatusBoard, id: &ClusterId, phase: TunnelPhase) {
		let mut rx = board.subscribe();
		if board.get(id).map(|s| s.phase) == Some(phase) {
			return;
		}
		loop {
			let transition = rx.recv().await.unwrap();
			if &transition.cluster_id == id && transition.to == phase {
				return;
			}
		}
	}

	#[tokio::test(start_paused = true)]
	async fn worker_connects_and_tears_down() {
		let fake = Arc::new(FakeControl::new());
		let ctx = context(fake.clone());
		let board = ctx.board.clone();
		let east = endpoint("east", "10.1.0.1", "10.52.0.0/16");
		let id: ClusterId = "east".parse().unwrap();
		let (tx, rx) = mpsc::unbounded_channel();

		let handle = tokio::spawn(TunnelWorker::new(ctx, east, rx).run());
		wait_for_phase(&board, &id, TunnelPhase::Connected).await;

		let conn = board.get(&id).unwrap().connection_id.unwrap();
		assert_eq!(fake.count(&ControlCall::Initiate(conn.clone())), 1);

		tx.send(WorkerCommand::Remove).unwrap();
		handle.await.unwrap();
		assert!(board.get(&id).is_none());
		assert_eq!(fake.count(&ControlCall::Terminate(conn.clone())), 1);
		assert_eq!(fake.count(&ControlCall::UnloadConnection(conn)), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn invalid_spec_holds_without_calls() {
		let fake = Arc::new(FakeControl::new());
		let ctx = context(fake.clone());
		let board = ctx.board.clone();
		let id: ClusterId = "east".parse().unwrap();
		let (tx, rx) = mpsc::unbounded_channel();
		let bare = Endpoint::new(id.clone(), "10.1.0.1".parse().unwrap());

		let handle = tokio::spawn(TunnelWorker::new(ctx, bare, rx).run());
		wait_for_phase(&board, &id, TunnelPhase::Error).await;
		tokio::time::sleep(Duration::from_secs(600)).await;

		let status = board.get(&id).unwrap();
		assert_eq!(status.phase, TunnelPhase::Error);
		assert_eq!(status.last_error.unwrap().kind, FailureKind::InvalidSpec);
		assert!(fake.calls().is_empty());

		tx.send(WorkerCommand::Update(endpoint("east", "10.1.0.1", "10.52.0.0/16")))
			.unwrap();
		wait_for_phase(&board, &id, TunnelPhase::Connected).await;

		drop(tx);
		handle.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn hanging_status_times_out_and_retries() {
		let fake = Arc::new(FakeControl::new());
		let ctx = context(fake.clone());
		let board = ctx.board.clone();
		let east = endpoint("east", "10.1.0.1", "10.52.0.0/16");
		let id: ClusterId = "east".parse().unwrap();
		let conn = ConnectionId::for_pair(&"local".parse().unwrap(), &id);
		fake.set_hang(FakeOp::Status, &conn);
		let (tx, rx) = mpsc::unbounded_channel();

		let handle = tokio::spawn(TunnelWorker::new(ctx, east, rx).run());
		wait_for_phase(&board, &id, TunnelPhase::Error).await;
		let status = board.get(&id).unwrap();
		assert_eq!(status.retry_count, 1);
		assert_eq!(status.last_error.unwrap().kind, FailureKind::Transient);

		fake.clear_hang(FakeOp::Status, &conn);
		wait_for_phase(&board, &id, TunnelPhase::Connected).await;
		assert_eq!(board.get(&id).unwrap().retry_count, 0);

		tx.send(WorkerCommand::Remove).unwrap();
		handle.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn lost_sa_is_reinitiated() {
		let fake = Arc::new(FakeControl::new());
		let ctx = context(fake.clone());
		let board = ctx.board.clone();
		let east = endpoint("east", "10.1.0.1", "10.52.0.0/16");
		let id: ClusterId = "east".parse().unwrap();
		let (tx, rx) = mpsc::unbounded_channel();

		let handle = tokio::spawn(TunnelWorker::new(ctx, east, rx).run());
		wait_for_phase(&board, &id, TunnelPhase::Connected).await;
		let conn = board.get(&id).unwrap().connection_id.unwrap();

		let mut transitions = board.subscribe();
		fake.set_sa(&conn, SaStatus::Down);
		let lost = transitions.recv().await.unwrap();
		assert_eq!((lost.from, lost.to), (TunnelPhase::Connected, TunnelPhase::Connecting));
		let back = transitions.recv().await.unwrap();
		assert_eq!(back.to, TunnelPhase::Connected);
		assert_eq!(fake.count(&ControlCall::Initiate(conn)), 2);

		tx.send(WorkerCommand::Remove).unwrap();
		handle.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn dispatcher_drains_workers_on_shutdown() {
		let fake = Arc::new(FakeControl::new());
		let ctx = context(fake.clone());
		let board = ctx.board.clone();
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		let dispatcher = tokio::spawn(Dispatcher::new(ctx).run(events_rx, shutdown_rx));
		for (id, ip) in [("east", "10.1.0.1"), ("west", "10.2.0.1")] {
			events_tx
				.send(RegistryEvent::Upserted(endpoint(id, ip, "10.52.0.0/16")))
				.unwrap();
		}
		wait_for_phase(&board, &"east".parse().unwrap(), TunnelPhase::Connected).await;
		wait_for_phase(&board, &"west".parse().unwrap(), TunnelPhase::Connected).await;

		shutdown_tx.send(true).unwrap();
		dispatcher.await.unwrap();

		assert!(board.snapshot().is_empty());
		let terminates = fake
			.calls()
			.into_iter()
			.filter(|c| matches!(c, ControlCall::Terminate(_)))
			.count();
		assert_eq!(terminates, 2);
	}
}
