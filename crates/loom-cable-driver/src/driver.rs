// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::board::StatusBoard;
use crate::error::{DriverError, Result};
use crate::reconciler::{Dispatcher, ReconcileContext};
use crate::registry::{EndpointRegistry, UpsertOutcome};
use crate::tunnel::{TunnelStatus, TunnelTransition};
use futures::{Stream, StreamExt};
use loom_cable_common::{CharonConfig, ClusterId, ConnectionId, DriverConfig, Endpoint, EndpointEvent};
use loom_cable_control::{ControlClient, ViciClient, ViciClientConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

/// IPsec cable driver for one local gateway.
///
/// Lifecycle: [`CableDriver::init`] prepares the daemon, [`CableDriver::start`]
/// spawns reconciliation, endpoint events are fed through
/// [`CableDriver::apply`] or [`CableDriver::run`], and
/// [`CableDriver::shutdown`] tears every tunnel down.
pub struct CableDriver {
	config: Arc<DriverConfig>,
	local: Arc<Endpoint>,
	control: Arc<dyn ControlClient>,
	registry: Arc<EndpointRegistry>,
	board: StatusBoard,
	dispatcher: Mutex<Option<JoinHandle<()>>>,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
}

impl CableDriver {
	pub fn new(config: DriverConfig, local: Endpoint, control: Arc<dyn ControlClient>) -> Self {
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		Self {
			config: Arc::new(config),
			local: Arc::new(local),
			control,
			registry: Arc::new(EndpointRegistry::new()),
			board: StatusBoard::new(),
			dispatcher: Mutex::new(None),
			shutdown_tx,
			shutdown_rx,
		}
	}

	/// Driver backed by the daemon's VICI socket at `config.vici_socket`.
	pub fn with_vici(config: DriverConfig, local: Endpoint) -> Self {
		let mut vici = ViciClientConfig::new(config.vici_socket.clone());
		vici.initiate_timeout = config.reconcile.initiate_timeout;
		let control: Arc<dyn ControlClient> = Arc::new(ViciClient::new(vici));
		Self::new(config, local, control)
	}

	/// Writes the daemon configuration and loads the shared IKE key, if any.
	#[instrument(skip(self), fields(cluster_id = %self.local.cluster_id))]
	pub async fn init(&self) -> Result<()> {
		if let Some(path) = &self.config.charon_conf_path {
			let charon = CharonConfig::from_driver_config(&self.config)?;
			charon.write_to(path)?;
			info!(path = %path.display(), "wrote charon configuration");
		}

		if let Some(psk) = &self.config.psk {
			let limit = self.config.reconcile.load_timeout;
			match tokio::time::timeout(limit, self.control.load_shared_key(psk)).await {
				Ok(result) => result?,
				Err(_) => {
					return Err(loom_cable_control::ControlError::Timeout("load_shared_key".to_string()).into());
				}
			}
			info!("loaded shared IKE key");
		}

		Ok(())
	}

	/// Spawns the reconciliation dispatcher. Must be called within a tokio
	/// runtime.
	pub fn start(&self) -> Result<()> {
		let mut slot = self.dispatcher.lock();
		if *self.shutdown_rx.borrow() {
			return Err(DriverError::ShutDown);
		}
		if slot.is_some() {
			return Err(DriverError::AlreadyStarted);
		}

		let ctx = ReconcileContext {
			config: self.config.clone(),
			local: self.local.clone(),
			control: self.control.clone(),
			board: self.board.clone(),
		};
		let events = self.registry.subscribe();
		let shutdown = self.shutdown_rx.clone();
		*slot = Some(tokio::spawn(Dispatcher::new(ctx).run(events, shutdown)));

		info!(cluster_id = %self.local.cluster_id, "cable driver started");
		Ok(())
	}

	/// Applies one membership event. Events about the local cluster are
	/// ignored. Returns whether the registry changed.
	pub fn apply(&self, event: EndpointEvent) -> bool {
		match event {
			EndpointEvent::Upserted { endpoint } => {
				if endpoint.cluster_id == self.local.cluster_id {
					debug!("ignoring event for the local cluster");
					return false;
				}
				self.registry.upsert(endpoint) != UpsertOutcome::Unchanged
			}
			EndpointEvent::Removed { cluster_id } => {
				if cluster_id == self.local.cluster_id {
					debug!("ignoring event for the local cluster");
					return false;
				}
				self.registry.remove(&cluster_id).is_some()
			}
		}
	}

	/// Starts the driver if needed, then applies `events` until the stream
	/// ends or shutdown is requested.
	#[instrument(skip_all, fields(cluster_id = %self.local.cluster_id))]
	pub async fn run<S>(&self, events: S) -> Result<()>
	where
		S: Stream<Item = EndpointEvent>,
	{
		match self.start() {
			Ok(()) | Err(DriverError::AlreadyStarted) => {}
			Err(e) => return Err(e),
		}

		let mut events = std::pin::pin!(events);
		let mut shutdown = self.shutdown_rx.clone();
		if *shutdown.borrow() {
			return Ok(());
		}

		loop {
			tokio::select! {
				biased;

				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						info!("shutdown signal received");
						break;
					}
				}

				event = events.next() => {
					match event {
						Some(event) => {
							self.apply(event);
						}
						None => {
							info!("endpoint event stream ended");
							break;
						}
					}
				}
			}
		}

		Ok(())
	}

	pub fn registry(&self) -> &EndpointRegistry {
		&self.registry
	}

	pub fn local(&self) -> &Endpoint {
		&self.local
	}

	pub fn tunnels(&self) -> Vec<TunnelStatus> {
		self.board.snapshot()
	}

	pub fn tunnel(&self, cluster_id: &ClusterId) -> Option<TunnelStatus> {
		self.board.get(cluster_id)
	}

	/// Connection ids of every tunnel currently connected.
	pub fn active_connections(&self) -> Vec<ConnectionId> {
		self.board
			.snapshot()
			.into_iter()
			.filter(TunnelStatus::is_connected)
			.filter_map(|status| status.connection_id)
			.collect()
	}

	pub fn subscribe_transitions(&self) -> broadcast::Receiver<TunnelTransition> {
		self.board.subscribe()
	}

	/// Tears down every tunnel and waits for the workers to finish.
	#[instrument(skip(self), fields(cluster_id = %self.local.cluster_id))]
	pub async fn shutdown(&self) {
		let _ = self.shutdown_tx.send(true);
		let dispatcher = self.dispatcher.lock().take();
		if let Some(dispatcher) = dispatcher {
			if let Err(e) = dispatcher.await {
				error!(error = %e, "dispatcher task failed");
			}
		}
		info!("cable driver stopped");
	}

	pub fn is_running(&self) -> bool {
		self.dispatcher.lock().is_some() && !*self.shutdown_rx.borrow()
	}
}

impl std::fmt::Debug for CableDriver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CableDriver")
			.field("cluster_id", &self.local.cluster_id)
			.field("endpoints", &self.registry.len())
			.field("is_running", &self.is_running())
			.finish()
	}
}
