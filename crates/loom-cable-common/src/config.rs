// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Driver configuration.
//!
//! Resolved exactly once at startup from defaults overlaid with environment
//! variables, then shared read-only. Environment convention: `CE_IPSEC_<FIELD>`.

use crate::error::ConfigError;
use crate::secret::SecretString;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_IKE_PORT: &str = "500";
pub const DEFAULT_NATT_PORT: &str = "4500";
pub const DEFAULT_CHARON_CONF: &str = "/etc/strongswan/strongswan.d/charon.conf";
pub const DEFAULT_VICI_SOCKET: &str = "/var/run/charon.vici";

pub const ENV_IKE_PORT: &str = "CE_IPSEC_IKEPORT";
pub const ENV_NATT_PORT: &str = "CE_IPSEC_NATTPORT";
pub const ENV_PSK: &str = "CE_IPSEC_PSK";
pub const ENV_DEBUG: &str = "CE_IPSEC_DEBUG";
pub const ENV_CHARON_CONF: &str = "CE_IPSEC_CHARON_CONF";
pub const ENV_VICI_SOCKET: &str = "CE_IPSEC_VICI_SOCKET";
pub const ENV_RETRY_CEILING: &str = "CE_IPSEC_RETRY_CEILING";
pub const ENV_BACKOFF_MAX_SECS: &str = "CE_IPSEC_BACKOFF_MAX_SECS";
pub const ENV_STATUS_POLL_SECS: &str = "CE_IPSEC_STATUS_POLL_SECS";
pub const ENV_HEALTH_CHECK_SECS: &str = "CE_IPSEC_HEALTH_CHECK_SECS";

const DEFAULT_IKE_PROPOSALS: &[&str] = &["aes256gcm16-prfsha384-ecp384", "aes128gcm16-prfsha256-modp2048"];
const DEFAULT_ESP_PROPOSALS: &[&str] = &["aes256gcm16-ecp384", "aes128gcm16-modp2048"];

/// Timing knobs for the per-endpoint tunnel state machines.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
	pub status_poll_interval: Duration,
	pub max_connect_polls: u32,
	pub health_check_interval: Duration,
	pub backoff_initial: Duration,
	pub backoff_max: Duration,
	pub backoff_multiplier: f64,
	/// Consecutive failures after which an endpoint is reported as exhausted.
	/// Retrying continues at the capped backoff interval regardless.
	pub retry_ceiling: u32,
	pub terminate_grace: Duration,
	pub load_timeout: Duration,
	pub initiate_timeout: Duration,
	pub status_timeout: Duration,
	pub terminate_timeout: Duration,
}

impl Default for ReconcileConfig {
	fn default() -> Self {
		Self {
			status_poll_interval: Duration::from_secs(3),
			max_connect_polls: 10,
			health_check_interval: Duration::from_secs(30),
			backoff_initial: Duration::from_secs(1),
			backoff_max: Duration::from_secs(60),
			backoff_multiplier: 2.0,
			retry_ceiling: 10,
			terminate_grace: Duration::from_secs(10),
			load_timeout: Duration::from_secs(10),
			initiate_timeout: Duration::from_secs(20),
			status_timeout: Duration::from_secs(5),
			terminate_timeout: Duration::from_secs(5),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
	pub ike_port: String,
	pub natt_port: String,
	pub psk: Option<SecretString>,
	pub debug: bool,
	/// Where the rendered daemon configuration is written at init. `None`
	/// skips writing, for daemons configured out of band.
	pub charon_conf_path: Option<PathBuf>,
	pub vici_socket: PathBuf,
	pub ike_proposals: Vec<String>,
	pub esp_proposals: Vec<String>,
	pub reconcile: ReconcileConfig,
}

impl Default for DriverConfig {
	fn default() -> Self {
		Self {
			ike_port: DEFAULT_IKE_PORT.to_string(),
			natt_port: DEFAULT_NATT_PORT.to_string(),
			psk: None,
			debug: false,
			charon_conf_path: Some(PathBuf::from(DEFAULT_CHARON_CONF)),
			vici_socket: PathBuf::from(DEFAULT_VICI_SOCKET),
			ike_proposals: DEFAULT_IKE_PROPOSALS.iter().map(|s| s.to_string()).collect(),
			esp_proposals: DEFAULT_ESP_PROPOSALS.iter().map(|s| s.to_string()).collect(),
			reconcile: ReconcileConfig::default(),
		}
	}
}

impl DriverConfig {
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	/// Resolves the configuration using `lookup` in place of the process
	/// environment.
	pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let mut layer = DriverConfigLayer::default();
		layer.merge(DriverConfigLayer::from_lookup(lookup)?);
		layer.finalize()
	}
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverConfigLayer {
	pub ike_port: Option<String>,
	pub natt_port: Option<String>,
	pub psk: Option<SecretString>,
	pub debug: Option<bool>,
	pub charon_conf_path: Option<PathBuf>,
	pub vici_socket: Option<PathBuf>,
	pub retry_ceiling: Option<u32>,
	pub backoff_max_secs: Option<u64>,
	pub status_poll_secs: Option<u64>,
	pub health_check_secs: Option<u64>,
}

impl DriverConfigLayer {
	pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		debug!("loading cable driver configuration from environment");
		let var = |name: &str| lookup(name).filter(|s| !s.is_empty());

		Ok(Self {
			ike_port: var(ENV_IKE_PORT),
			natt_port: var(ENV_NATT_PORT),
			psk: var(ENV_PSK).map(SecretString::new),
			debug: var(ENV_DEBUG).map(|v| v.eq_ignore_ascii_case("true") || v == "1"),
			charon_conf_path: var(ENV_CHARON_CONF).map(PathBuf::from),
			vici_socket: var(ENV_VICI_SOCKET).map(PathBuf::from),
			retry_ceiling: parse_num(ENV_RETRY_CEILING, var(ENV_RETRY_CEILING))?,
			backoff_max_secs: parse_num(ENV_BACKOFF_MAX_SECS, var(ENV_BACKOFF_MAX_SECS))?,
			status_poll_secs: parse_num(ENV_STATUS_POLL_SECS, var(ENV_STATUS_POLL_SECS))?,
			health_check_secs: parse_num(ENV_HEALTH_CHECK_SECS, var(ENV_HEALTH_CHECK_SECS))?,
		})
	}

	pub fn merge(&mut self, other: Self) {
		if other.ike_port.is_some() {
			self.ike_port = other.ike_port;
		}
		if other.natt_port.is_some() {
			self.natt_port = other.natt_port;
		}
		if other.psk.is_some() {
			self.psk = other.psk;
		}
		if other.debug.is_some() {
			self.debug = other.debug;
		}
		if other.charon_conf_path.is_some() {
			self.charon_conf_path = other.charon_conf_path;
		}
		if other.vici_socket.is_some() {
			self.vici_socket = other.vici_socket;
		}
		if other.retry_ceiling.is_some() {
			self.retry_ceiling = other.retry_ceiling;
		}
		if other.backoff_max_secs.is_some() {
			self.backoff_max_secs = other.backoff_max_secs;
		}
		if other.status_poll_secs.is_some() {
			self.status_poll_secs = other.status_poll_secs;
		}
		if other.health_check_secs.is_some() {
			self.health_check_secs = other.health_check_secs;
		}
	}

	pub fn finalize(self) -> Result<DriverConfig, ConfigError> {
		let mut config = DriverConfig::default();

		if let Some(port) = self.ike_port.filter(|p| !p.is_empty()) {
			config.ike_port = port;
		}
		if let Some(port) = self.natt_port.filter(|p| !p.is_empty()) {
			config.natt_port = port;
		}
		config.psk = self.psk.filter(|k| !k.expose().is_empty());
		config.debug = self.debug.unwrap_or(false);
		if let Some(path) = self.charon_conf_path {
			config.charon_conf_path = Some(path);
		}
		if let Some(path) = self.vici_socket {
			config.vici_socket = path;
		}

		let reconcile = &mut config.reconcile;
		if let Some(ceiling) = self.retry_ceiling {
			reconcile.retry_ceiling = ceiling;
		}
		if let Some(secs) = self.backoff_max_secs {
			reconcile.backoff_max = non_zero_secs(ENV_BACKOFF_MAX_SECS, secs)?;
			reconcile.backoff_initial = reconcile.backoff_initial.min(reconcile.backoff_max);
		}
		if let Some(secs) = self.status_poll_secs {
			reconcile.status_poll_interval = non_zero_secs(ENV_STATUS_POLL_SECS, secs)?;
		}
		if let Some(secs) = self.health_check_secs {
			reconcile.health_check_interval = non_zero_secs(ENV_HEALTH_CHECK_SECS, secs)?;
		}

		Ok(config)
	}
}

fn parse_num<T: std::str::FromStr>(key: &str, value: Option<String>) -> Result<Option<T>, ConfigError> {
	match value {
		Some(v) => v.trim().parse().map(Some).map_err(|_| ConfigError::InvalidValue {
			key: key.to_string(),
			message: format!("invalid number '{v}'"),
		}),
		None => Ok(None),
	}
}

fn non_zero_secs(key: &str, secs: u64) -> Result<Duration, ConfigError> {
	if secs == 0 {
		return Err(ConfigError::InvalidValue {
			key: key.to_string(),
			message: "must be at least 1 second".to_string(),
		});
	}
	Ok(Duration::from_secs(secs))
}
