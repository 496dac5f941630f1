// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::control::{ControlClient, ControlError, Result, SaStatus};
use crate::vici::packet::{Packet, PacketType, MAX_PACKET_LEN};
use crate::vici::wire::{Message, WireError};
use async_trait::async_trait;
use loom_cable_common::{AuthMethod, ClusterId, ConnectionId, ConnectionSpec, Encapsulation, SecretString};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, instrument, trace, warn};

const LIST_SA_EVENT: &str = "list-sa";
const CONTROL_LOG_EVENT: &str = "control-log";

/// Daemon log fragments marking an IKE negotiation the peer or the local
/// configuration refuses outright.
const REJECTION_MARKERS: &[&str] = &[
	"AUTHENTICATION_FAILED",
	"MAC mismatched",
	"no shared key found",
	"NO_PROPOSAL_CHOSEN",
	"TS_UNACCEPTABLE",
];

#[derive(Debug, Clone)]
pub struct ViciClientConfig {
	pub socket_path: PathBuf,
	/// Bound on connecting and on each read or write of a single packet.
	pub io_timeout: Duration,
	/// Passed to the daemon with `initiate`; the response read waits this long
	/// on top of `io_timeout`.
	pub initiate_timeout: Duration,
	pub max_idle_sessions: usize,
}

impl ViciClientConfig {
	pub fn new(socket_path: impl Into<PathBuf>) -> Self {
		Self {
			socket_path: socket_path.into(),
			io_timeout: Duration::from_secs(10),
			initiate_timeout: Duration::from_secs(20),
			max_idle_sessions: 4,
		}
	}
}

/// VICI client over the daemon's unix socket.
///
/// Each in-flight call owns its session exclusively, so concurrent callers
/// never wait on each other's I/O. Sessions that completed a call cleanly go
/// back to a small idle pool; a session is discarded on any error or when the
/// call is cancelled.
pub struct ViciClient {
	config: ViciClientConfig,
	idle: Mutex<Vec<UnixStream>>,
	loaded: Mutex<HashMap<ConnectionId, ConnectionSpec>>,
}

impl ViciClient {
	pub fn new(config: ViciClientConfig) -> Self {
		Self {
			config,
			idle: Mutex::new(Vec::new()),
			loaded: Mutex::new(HashMap::new()),
		}
	}

	/// Returns an idle session if one is pooled, otherwise a fresh one. The
	/// flag tells whether the session came from the pool.
	async fn checkout(&self) -> Result<(UnixStream, bool)> {
		if let Some(stream) = self.idle.lock().pop() {
			return Ok((stream, true));
		}
		Ok((self.connect().await?, false))
	}

	async fn connect(&self) -> Result<UnixStream> {
		let path = &self.config.socket_path;
		trace!(path = %path.display(), "opening control session");
		match timeout(self.config.io_timeout, UnixStream::connect(path)).await {
			Ok(Ok(stream)) => Ok(stream),
			Ok(Err(e)) if matches!(e.kind(), io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound) => {
				Err(ControlError::ConnectionRefused(format!("{}: {e}", path.display())))
			}
			Ok(Err(e)) => Err(ControlError::Io(e.to_string())),
			Err(_) => Err(ControlError::Timeout("connect to control socket".to_string())),
		}
	}

	fn checkin(&self, stream: UnixStream) {
		let mut idle = self.idle.lock();
		if idle.len() < self.config.max_idle_sessions {
			idle.push(stream);
		}
	}

	async fn request(&self, command: &str, message: Message, read_timeout: Duration) -> Result<Message> {
		let (stream, pooled) = self.checkout().await?;
		match self.exchange(stream, command, message.clone(), read_timeout).await {
			Err(ControlError::Io(e)) if pooled => {
				debug!(command, error = %e, "pooled control session is stale, reconnecting");
				let stream = self.connect().await?;
				self.exchange(stream, command, message, read_timeout).await
			}
			other => other,
		}
	}

	async fn exchange(
		&self,
		mut stream: UnixStream,
		command: &str,
		message: Message,
		read_timeout: Duration,
	) -> Result<Message> {
		write_packet(&mut stream, &Packet::request(command, message), self.config.io_timeout).await?;
		let response = read_packet(&mut stream, read_timeout).await?;
		let message = match response.kind {
			PacketType::CmdResponse => response.message,
			PacketType::CmdUnknown => {
				return Err(ControlError::Protocol(format!("daemon does not support command {command}")));
			}
			other => {
				return Err(ControlError::Protocol(format!(
					"unexpected {other:?} packet in reply to {command}"
				)));
			}
		};

		self.checkin(stream);
		Ok(message)
	}

	/// Issues `command` while subscribed to `event`, collecting the events the
	/// daemon streams before its final response. `read_timeout` bounds the
	/// wait for each streamed packet.
	async fn streaming_request(
		&self,
		command: &str,
		event: &str,
		message: Message,
		read_timeout: Duration,
	) -> Result<(Vec<Message>, Message)> {
		let (stream, pooled) = self.checkout().await?;
		match self
			.streaming_exchange(stream, command, event, message.clone(), read_timeout)
			.await
		{
			Err(ControlError::Io(e)) if pooled => {
				debug!(command, error = %e, "pooled control session is stale, reconnecting");
				let stream = self.connect().await?;
				self.streaming_exchange(stream, command, event, message, read_timeout)
					.await
			}
			other => other,
		}
	}

	async fn streaming_exchange(
		&self,
		mut stream: UnixStream,
		command: &str,
		event: &str,
		message: Message,
		read_timeout: Duration,
	) -> Result<(Vec<Message>, Message)> {
		let io_timeout = self.config.io_timeout;

		write_packet(&mut stream, &Packet::register(event), io_timeout).await?;
		expect_confirm(&mut stream, event, io_timeout).await?;

		write_packet(&mut stream, &Packet::request(command, message), io_timeout).await?;
		let mut events = Vec::new();
		let response = loop {
			let packet = read_packet(&mut stream, read_timeout).await?;
			match packet.kind {
				PacketType::Event if packet.name.as_deref() == Some(event) => events.push(packet.message),
				PacketType::CmdResponse => break packet.message,
				PacketType::CmdUnknown => {
					return Err(ControlError::Protocol(format!("daemon does not support command {command}")));
				}
				other => {
					return Err(ControlError::Protocol(format!(
						"unexpected {other:?} packet while streaming {command}"
					)));
				}
			}
		};

		write_packet(&mut stream, &Packet::unregister(event), io_timeout).await?;
		expect_confirm(&mut stream, event, io_timeout).await?;

		self.checkin(stream);
		Ok((events, response))
	}
}

#[async_trait]
impl ControlClient for ViciClient {
	#[instrument(skip(self, spec), fields(connection = %spec.id))]
	async fn load_connection(&self, spec: &ConnectionSpec) -> Result<()> {
		if self.loaded.lock().get(&spec.id) == Some(spec) {
			debug!("connection already loaded with identical content");
			return Ok(());
		}

		let response = self
			.request("load-conn", connection_message(spec), self.config.io_timeout)
			.await?;
		check_success("load-conn", &response, true)?;

		self.loaded.lock().insert(spec.id.clone(), spec.clone());
		debug!("loaded connection");
		Ok(())
	}

	#[instrument(skip(self, id), fields(connection = %id))]
	async fn unload_connection(&self, id: &ConnectionId) -> Result<()> {
		self.loaded.lock().remove(id);
		let response = self
			.request(
				"unload-conn",
				Message::new().value("name", id.as_str()),
				self.config.io_timeout,
			)
			.await?;
		match check_success("unload-conn", &response, false) {
			Err(ControlError::CommandFailed { message, .. }) if message.contains("not found") => Ok(()),
			other => other,
		}
	}

	#[instrument(skip_all)]
	async fn load_shared_key(&self, key: &SecretString) -> Result<()> {
		let message = Message::new()
			.value("type", "IKE")
			.value("data", key.expose().as_bytes());
		let response = self.request("load-shared", message, self.config.io_timeout).await?;
		check_success("load-shared", &response, true)?;
		debug!("loaded shared IKE key");
		Ok(())
	}

	#[instrument(skip(self, id), fields(connection = %id))]
	async fn initiate(&self, id: &ConnectionId) -> Result<()> {
		let message = Message::new()
			.value("child", id.as_str())
			.value("ike", id.as_str())
			.value("timeout", self.config.initiate_timeout.as_millis().to_string())
			.value("init-limits", "no");
		let read_timeout = self.config.initiate_timeout + self.config.io_timeout;

		let result = match self
			.streaming_request("initiate", CONTROL_LOG_EVENT, message, read_timeout)
			.await
		{
			Ok((logs, response)) => check_success("initiate", &response, false).map_err(|e| match e {
				ControlError::CommandFailed { command, message } => match rejection_reason(&logs) {
					Some(reason) => ControlError::Rejected {
						command,
						message: format!("{message}: {reason}"),
					},
					None => ControlError::CommandFailed { command, message },
				},
				other => other,
			}),
			Err(e) => Err(e),
		};
		if result.is_err() {
			// Forces the next load to reach the daemon in case it restarted.
			self.loaded.lock().remove(id);
		}
		result
	}

	#[instrument(skip(self, id), fields(connection = %id))]
	async fn terminate(&self, id: &ConnectionId) -> Result<()> {
		let message = Message::new()
			.value("ike", id.as_str())
			.value("force", "yes")
			.value("timeout", self.config.io_timeout.as_millis().to_string());
		let response = self
			.request("terminate", message, self.config.io_timeout * 2)
			.await?;
		match check_success("terminate", &response, false) {
			Err(ControlError::CommandFailed { message, .. }) if message.contains("no matching") => Ok(()),
			other => other,
		}
	}

	#[instrument(skip(self, id), fields(connection = %id))]
	async fn status(&self, id: &ConnectionId) -> Result<SaStatus> {
		let message = Message::new().value("ike", id.as_str()).value("noblock", "yes");
		let (events, response) = self
			.streaming_request("list-sas", LIST_SA_EVENT, message, self.config.io_timeout)
			.await?;
		check_success("list-sas", &response, false).or_else(|e| match e {
			// Older daemons answer list-sas with an empty message.
			ControlError::Protocol(_) if response.is_empty() => Ok(()),
			other => Err(other),
		})?;
		sa_status(&events, id)
	}
}

impl std::fmt::Debug for ViciClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ViciClient")
			.field("socket_path", &self.config.socket_path)
			.field("idle_sessions", &self.idle.lock().len())
			.finish()
	}
}

impl From<WireError> for ControlError {
	fn from(e: WireError) -> Self {
		ControlError::Protocol(e.to_string())
	}
}

async fn write_packet(stream: &mut UnixStream, packet: &Packet, limit: Duration) -> Result<()> {
	let bytes = packet.encode()?;
	trace!(kind = ?packet.kind, name = ?packet.name, len = bytes.len(), "vici send");
	match timeout(limit, stream.write_all(&bytes)).await {
		Ok(result) => result.map_err(|e| ControlError::Io(e.to_string())),
		Err(_) => Err(ControlError::Timeout("write to control socket".to_string())),
	}
}

async fn read_packet(stream: &mut UnixStream, limit: Duration) -> Result<Packet> {
	let read = async {
		let mut len_buf = [0u8; 4];
		stream.read_exact(&mut len_buf).await?;
		let len = u32::from_be_bytes(len_buf) as usize;
		if len > MAX_PACKET_LEN {
			return Ok(Err(WireError::PacketTooLarge(len)));
		}
		let mut body = vec![0u8; len];
		stream.read_exact(&mut body).await?;
		Ok::<_, io::Error>(Packet::decode(&body))
	};

	match timeout(limit, read).await {
		Ok(Ok(Ok(packet))) => {
			trace!(kind = ?packet.kind, name = ?packet.name, "vici recv");
			Ok(packet)
		}
		Ok(Ok(Err(e))) => Err(e.into()),
		Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
			Err(ControlError::Io("daemon closed the control session".to_string()))
		}
		Ok(Err(e)) => Err(ControlError::Io(e.to_string())),
		Err(_) => Err(ControlError::Timeout("read from control socket".to_string())),
	}
}

async fn expect_confirm(stream: &mut UnixStream, event: &str, limit: Duration) -> Result<()> {
	let packet = read_packet(stream, limit).await?;
	match packet.kind {
		PacketType::EventConfirm => Ok(()),
		PacketType::EventUnknown => Err(ControlError::Protocol(format!("daemon does not know event {event}"))),
		other => Err(ControlError::Protocol(format!(
			"unexpected {other:?} packet while (un)registering {event}"
		))),
	}
}

fn check_success(command: &str, response: &Message, rejectable: bool) -> Result<()> {
	match response.get_str("success") {
		Some("yes") => Ok(()),
		Some(_) => {
			let message = response
				.get_str("errmsg")
				.unwrap_or("unspecified failure")
				.to_string();
			warn!(command, error = %message, "daemon reported failure");
			if rejectable {
				Err(ControlError::Rejected {
					command: command.to_string(),
					message,
				})
			} else {
				Err(ControlError::CommandFailed {
					command: command.to_string(),
					message,
				})
			}
		}
		None => Err(ControlError::Protocol(format!("{command} response lacks success flag"))),
	}
}

/// First `control-log` line emitted during `initiate` that marks the
/// negotiation as refused.
fn rejection_reason(logs: &[Message]) -> Option<String> {
	logs.iter()
		.filter_map(|log| log.get_str("msg"))
		.find(|msg| REJECTION_MARKERS.iter().any(|marker| msg.contains(marker)))
		.map(str::to_string)
}

fn auth_section(auth: &AuthMethod, cluster: &ClusterId) -> Message {
	match auth {
		AuthMethod::PreSharedKey => Message::new().value("auth", "psk").value("id", cluster.as_str()),
		AuthMethod::Certificate { cert_ref } => Message::new()
			.value("auth", "pubkey")
			.value("id", cert_ref.as_str()),
	}
}

/// Builds the `load-conn` payload for `spec`: one IKE connection with a single
/// tunnel-mode child, both named after the connection id.
pub fn connection_message(spec: &ConnectionSpec) -> Message {
	let id = spec.id.as_str();
	let encap = match spec.encapsulation {
		Encapsulation::Plain => "no",
		Encapsulation::Tunnel => "yes",
	};

	let child = Message::new()
		.list("local_ts", spec.local_subnets.iter().map(|n| n.to_string()))
		.list("remote_ts", spec.remote_subnets.iter().map(|n| n.to_string()))
		.list("esp_proposals", spec.esp_proposals.iter().map(String::as_str))
		.value("mode", "tunnel")
		.value("start_action", "none")
		.value("dpd_action", "restart")
		.value("close_action", "none");

	let conn = Message::new()
		.value("version", "2")
		.list("local_addrs", [spec.local_addr.to_string()])
		.list("remote_addrs", [spec.remote_addr.to_string()])
		.value("remote_port", spec.remote_port.as_str())
		.value("encap", encap)
		.list("proposals", spec.ike_proposals.iter().map(String::as_str))
		.value("mobike", "no")
		.value("dpd_delay", "10s")
		.section("local", auth_section(&spec.local_auth, &spec.local_cluster))
		.section("remote", auth_section(&spec.remote_auth, &spec.remote_cluster))
		.section("children", Message::new().section(id, child));

	Message::new().section(id, conn)
}

/// Folds the `list-sa` events for `id` into one status. When several IKE SAs
/// exist for the connection (during make-before-break rekeying) the most
/// advanced one wins.
pub fn sa_status(events: &[Message], id: &ConnectionId) -> Result<SaStatus> {
	fn rank(status: SaStatus) -> u8 {
		match status {
			SaStatus::Down => 0,
			SaStatus::Error => 1,
			SaStatus::Connecting => 2,
			SaStatus::Up => 3,
		}
	}

	let mut best: Option<SaStatus> = None;
	for event in events {
		for (name, ike) in event.sections() {
			if name != id.as_str() {
				continue;
			}
			let state = ike
				.get_str("state")
				.ok_or_else(|| ControlError::Protocol(format!("IKE SA {name} has no state")))?;
			let status = match state {
				"ESTABLISHED" if child_installed(ike) => SaStatus::Up,
				"ESTABLISHED" | "CREATED" | "CONNECTING" | "REKEYING" | "REKEYED" => SaStatus::Connecting,
				"PASSIVE" | "DELETING" | "DESTROYING" => SaStatus::Down,
				_ => SaStatus::Error,
			};
			if best.map_or(true, |b| rank(status) > rank(b)) {
				best = Some(status);
			}
		}
	}
	Ok(best.unwrap_or(SaStatus::Down))
}

fn child_installed(ike: &Message) -> bool {
	ike.get_section("child-sas")
		.map(|children| {
			children
				.sections()
				.any(|(_, child)| child.get_str("state") == Some("INSTALLED"))
		})
		.unwrap_or(false)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::vici::wire::Element;
	use loom_cable_common::{spec, DriverConfig, Endpoint, MAX_CLUSTER_ID_LEN};
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;
	use tokio::net::UnixListener;

	fn test_spec(nat: bool) -> ConnectionSpec {
		let local = Endpoint::new("local".parse().unwrap(), "10.0.0.1".parse().unwrap())
			.with_subnets(["10.42.0.0/16".parse().unwrap()]);
		let mut remote = Endpoint::new("east".parse().unwrap(), "10.1.0.1".parse().unwrap())
			.with_subnets(["10.52.0.0/16".parse().unwrap()]);
		if nat {
			remote = remote.behind_nat(Some("203.0.113.1".parse().unwrap()));
		}
		spec::build(&local, &remote, &DriverConfig::default()).unwrap()
	}

	fn response(message: Message) -> Packet {
		Packet {
			kind: PacketType::CmdResponse,
			name: None,
			message,
		}
	}

	fn success() -> Packet {
		response(Message::new().value("success", "yes"))
	}

	fn bare(kind: PacketType) -> Packet {
		Packet {
			kind,
			name: None,
			message: Message::new(),
		}
	}

	async fn read_raw(stream: &mut UnixStream) -> Option<Packet> {
		let mut len = [0u8; 4];
		stream.read_exact(&mut len).await.ok()?;
		let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
		stream.read_exact(&mut body).await.ok()?;
		Packet::decode(&body).ok()
	}

	struct FakeDaemon {
		accepts: Arc<AtomicUsize>,
		requests: Arc<parking_lot::Mutex<Vec<Packet>>>,
	}

	fn spawn_daemon<F>(listener: UnixListener, handler: F) -> FakeDaemon
	where
		F: Fn(&Packet) -> Vec<Packet> + Send + Sync + 'static,
	{
		let accepts = Arc::new(AtomicUsize::new(0));
		let requests = Arc::new(parking_lot::Mutex::new(Vec::new()));
		let handler = Arc::new(handler);
		let (a, r) = (accepts.clone(), requests.clone());
		tokio::spawn(async move {
			while let Ok((mut stream, _)) = listener.accept().await {
				a.fetch_add(1, Ordering::SeqCst);
				let handler = handler.clone();
				let r = r.clone();
				tokio::spawn(async move {
					while let Some(packet) = read_raw(&mut stream).await {
						r.lock().push(packet.clone());
						for reply in handler(&packet) {
							if stream.write_all(&reply.encode().unwrap()).await.is_err() {
								return;
							}
						}
					}
				});
			}
		});
		FakeDaemon { accepts, requests }
	}

	/// Confirms event (un)registration and hands every other packet to
	/// `handler`.
	fn confirming<F>(handler: F) -> impl Fn(&Packet) -> Vec<Packet> + Send + Sync + 'static
	where
		F: Fn(&Packet) -> Vec<Packet> + Send + Sync + 'static,
	{
		move |packet| match packet.kind {
			PacketType::EventRegister | PacketType::EventUnregister => vec![bare(PacketType::EventConfirm)],
			_ => handler(packet),
		}
	}

	fn log_line(msg: &str) -> Packet {
		Packet {
			kind: PacketType::Event,
			name: Some(CONTROL_LOG_EVENT.to_string()),
			message: Message::new().value("group", "IKE").value("msg", msg),
		}
	}

	fn commands(daemon: &FakeDaemon) -> Vec<String> {
		daemon
			.requests
			.lock()
			.iter()
			.filter(|p| p.kind == PacketType::CmdRequest)
			.filter_map(|p| p.name.clone())
			.collect()
	}

	fn client_for(dir: &tempfile::TempDir) -> (ViciClient, UnixListener) {
		let path = dir.path().join("charon.vici");
		let listener = UnixListener::bind(&path).unwrap();
		let mut config = ViciClientConfig::new(path);
		config.io_timeout = Duration::from_millis(500);
		(ViciClient::new(config), listener)
	}

	#[test]
	fn connection_message_layout() {
		let spec = test_spec(true);
		let msg = connection_message(&spec);
		let conn = msg.get_section("cable.east.local").unwrap();

		assert_eq!(conn.get_str("version"), Some("2"));
		assert_eq!(conn.get_str("encap"), Some("yes"));
		assert_eq!(conn.get_str("remote_port"), Some("4500"));
		assert_eq!(
			conn.get("remote_addrs"),
			Some(&Element::List(vec![b"203.0.113.1".to_vec()]))
		);
		assert_eq!(conn.get_section("local").unwrap().get_str("auth"), Some("psk"));
		assert_eq!(conn.get_section("remote").unwrap().get_str("id"), Some("east"));

		let child = conn
			.get_section("children")
			.unwrap()
			.get_section("cable.east.local")
			.unwrap();
		assert_eq!(child.get_str("mode"), Some("tunnel"));
		assert_eq!(
			child.get("remote_ts"),
			Some(&Element::List(vec![b"10.52.0.0/16".to_vec()]))
		);
	}

	#[test]
	fn connection_message_without_nat() {
		let msg = connection_message(&test_spec(false));
		let conn = msg.get_section("cable.east.local").unwrap();
		assert_eq!(conn.get_str("encap"), Some("no"));
		assert_eq!(conn.get_str("remote_port"), Some("500"));
	}

	#[test]
	fn longest_connection_encodes() {
		let local = Endpoint::new("a".repeat(MAX_CLUSTER_ID_LEN).parse().unwrap(), "10.0.0.1".parse().unwrap())
			.with_subnets(["10.42.0.0/16".parse().unwrap()]);
		let remote = Endpoint::new("b".repeat(MAX_CLUSTER_ID_LEN).parse().unwrap(), "10.1.0.1".parse().unwrap())
			.with_subnets(["10.52.0.0/16".parse().unwrap()]);
		let spec = spec::build(&local, &remote, &DriverConfig::default()).unwrap();

		tokio_test::assert_ok!(Packet::request("load-conn", connection_message(&spec)).encode());
	}

	#[test]
	fn sa_status_mapping() {
		let id: ConnectionId = test_spec(false).id;
		let installed = Message::new().section(
			id.as_str(),
			Message::new().value("state", "ESTABLISHED").section(
				"child-sas",
				Message::new().section("c-1", Message::new().value("state", "INSTALLED")),
			),
		);
		let connecting = Message::new().section(id.as_str(), Message::new().value("state", "CONNECTING"));
		let other = Message::new().section("cable.a.b", Message::new().value("state", "ESTABLISHED"));

		assert_eq!(sa_status(&[], &id).unwrap(), SaStatus::Down);
		assert_eq!(sa_status(&[other.clone()], &id).unwrap(), SaStatus::Down);
		assert_eq!(sa_status(&[connecting.clone()], &id).unwrap(), SaStatus::Connecting);
		assert_eq!(sa_status(&[connecting, installed], &id).unwrap(), SaStatus::Up);

		let stateless = Message::new().section(id.as_str(), Message::new());
		assert!(sa_status(&[stateless], &id).unwrap_err().is_defect());
	}

	#[tokio::test]
	async fn load_connection_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let (client, listener) = client_for(&dir);
		let daemon = spawn_daemon(listener, |_| vec![success()]);
		let spec = test_spec(false);

		tokio_test::assert_ok!(client.load_connection(&spec).await);
		tokio_test::assert_ok!(client.load_connection(&spec).await);

		let requests = daemon.requests.lock().clone();
		assert_eq!(requests.len(), 1);
		assert_eq!(requests[0].name.as_deref(), Some("load-conn"));
		assert!(requests[0].message.get_section(spec.id.as_str()).is_some());
	}

	#[tokio::test]
	async fn changed_spec_is_reloaded() {
		let dir = tempfile::tempdir().unwrap();
		let (client, listener) = client_for(&dir);
		let daemon = spawn_daemon(listener, |_| vec![success()]);

		client.load_connection(&test_spec(false)).await.unwrap();
		client.load_connection(&test_spec(true)).await.unwrap();

		assert_eq!(daemon.requests.lock().len(), 2);
	}

	#[tokio::test]
	async fn sessions_are_reused() {
		let dir = tempfile::tempdir().unwrap();
		let (client, listener) = client_for(&dir);
		let daemon = spawn_daemon(listener, confirming(|_| vec![success()]));
		let id = test_spec(false).id;

		client.initiate(&id).await.unwrap();
		client.terminate(&id).await.unwrap();

		assert_eq!(daemon.accepts.load(Ordering::SeqCst), 1);
		assert_eq!(commands(&daemon), ["initiate", "terminate"]);
	}

	#[tokio::test]
	async fn stale_pooled_session_is_replaced() {
		let dir = tempfile::tempdir().unwrap();
		let (client, listener) = client_for(&dir);
		let accepts = Arc::new(AtomicUsize::new(0));
		let counter = accepts.clone();
		// Answers one request per session, then hangs up like a restarted daemon.
		tokio::spawn(async move {
			while let Ok((mut stream, _)) = listener.accept().await {
				counter.fetch_add(1, Ordering::SeqCst);
				tokio::spawn(async move {
					if read_raw(&mut stream).await.is_some() {
						let _ = stream.write_all(&success().encode().unwrap()).await;
					}
				});
			}
		});
		let id = test_spec(false).id;

		tokio_test::assert_ok!(client.terminate(&id).await);
		tokio_test::assert_ok!(client.unload_connection(&id).await);

		assert_eq!(accepts.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn fresh_session_failure_is_not_retried() {
		let dir = tempfile::tempdir().unwrap();
		let (client, listener) = client_for(&dir);
		let accepts = Arc::new(AtomicUsize::new(0));
		let counter = accepts.clone();
		tokio::spawn(async move {
			while let Ok((stream, _)) = listener.accept().await {
				counter.fetch_add(1, Ordering::SeqCst);
				drop(stream);
			}
		});

		let err = client.terminate(&test_spec(false).id).await.unwrap_err();
		assert!(matches!(err, ControlError::Io(_)));
		assert_eq!(accepts.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn failed_load_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let (client, listener) = client_for(&dir);
		spawn_daemon(listener, |_| {
			vec![response(
				Message::new()
					.value("success", "no")
					.value("errmsg", "invalid proposal"),
			)]
		});

		let err = client.load_connection(&test_spec(false)).await.unwrap_err();
		assert!(err.is_rejected());
		assert!(err.to_string().contains("invalid proposal"));
	}

	#[tokio::test]
	async fn failed_initiate_is_transient() {
		let dir = tempfile::tempdir().unwrap();
		let (client, listener) = client_for(&dir);
		spawn_daemon(
			listener,
			confirming(|_| {
				vec![
					log_line("sending retransmit 1 of request message ID 0"),
					log_line("giving up after 5 retransmits"),
					response(
						Message::new()
							.value("success", "no")
							.value("errmsg", "establishing CHILD_SA failed"),
					),
				]
			}),
		);

		let err = client.initiate(&test_spec(false).id).await.unwrap_err();
		assert!(matches!(err, ControlError::CommandFailed { .. }));
		assert!(err.is_transient());
	}

	#[tokio::test]
	async fn authentication_failure_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let (client, listener) = client_for(&dir);
		let daemon = spawn_daemon(
			listener,
			confirming(|_| {
				vec![
					log_line("received AUTHENTICATION_FAILED notify error"),
					response(
						Message::new()
							.value("success", "no")
							.value("errmsg", "establishing CHILD_SA failed"),
					),
				]
			}),
		);

		let err = client.initiate(&test_spec(false).id).await.unwrap_err();
		assert!(err.is_rejected());
		assert!(err.to_string().contains("AUTHENTICATION_FAILED"));

		let registered = daemon
			.requests
			.lock()
			.iter()
			.any(|p| p.kind == PacketType::EventRegister && p.name.as_deref() == Some(CONTROL_LOG_EVENT));
		assert!(registered);
	}

	#[tokio::test]
	async fn terminate_without_sa_succeeds() {
		let dir = tempfile::tempdir().unwrap();
		let (client, listener) = client_for(&dir);
		spawn_daemon(listener, |_| {
			vec![response(
				Message::new()
					.value("success", "no")
					.value("errmsg", "no matching SAs to terminate found"),
			)]
		});

		tokio_test::assert_ok!(client.terminate(&test_spec(false).id).await);
	}

	#[tokio::test]
	async fn status_streams_list_sa_events() {
		let dir = tempfile::tempdir().unwrap();
		let (client, listener) = client_for(&dir);
		let id = test_spec(false).id;
		let name = id.as_str().to_string();
		spawn_daemon(listener, move |packet| match packet.kind {
			PacketType::EventRegister | PacketType::EventUnregister => vec![bare(PacketType::EventConfirm)],
			PacketType::CmdRequest => vec![
				Packet {
					kind: PacketType::Event,
					name: Some(LIST_SA_EVENT.to_string()),
					message: Message::new().section(
						name.as_str(),
						Message::new().value("state", "ESTABLISHED").section(
							"child-sas",
							Message::new().section("c-7", Message::new().value("state", "INSTALLED")),
						),
					),
				},
				response(Message::new()),
			],
			_ => vec![],
		});

		assert_eq!(client.status(&id).await.unwrap(), SaStatus::Up);
	}

	#[tokio::test]
	async fn unknown_command_is_protocol_error() {
		let dir = tempfile::tempdir().unwrap();
		let (client, listener) = client_for(&dir);
		spawn_daemon(listener, confirming(|_| vec![bare(PacketType::CmdUnknown)]));

		let err = client.initiate(&test_spec(false).id).await.unwrap_err();
		assert!(err.is_defect());
	}

	#[tokio::test]
	async fn missing_socket_is_connection_refused() {
		let dir = tempfile::tempdir().unwrap();
		let client = ViciClient::new(ViciClientConfig::new(dir.path().join("absent.vici")));

		let err = client.status(&test_spec(false).id).await.unwrap_err();
		assert!(matches!(err, ControlError::ConnectionRefused(_)));
	}

	#[tokio::test]
	async fn silent_daemon_times_out() {
		let dir = tempfile::tempdir().unwrap();
		let (mut client, listener) = client_for(&dir);
		client.config.io_timeout = Duration::from_millis(50);
		spawn_daemon(listener, |_| vec![]);

		let err = client.unload_connection(&test_spec(false).id).await.unwrap_err();
		assert!(matches!(err, ControlError::Timeout(_)));
	}
}
