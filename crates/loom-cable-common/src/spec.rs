// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Connection specifications.
//!
//! A [`ConnectionSpec`] pairs the local endpoint with one remote endpoint and
//! carries everything the IKE daemon needs to load that connection. Specs are
//! values: a changed endpoint produces a new spec that replaces the old one.

use crate::config::DriverConfig;
use crate::endpoint::{AuthMethod, ClusterId, Endpoint, MAX_CLUSTER_ID_LEN};
use crate::error::SpecError;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

const CONNECTION_PREFIX: &str = "cable";

/// Daemon-side connection name, `cable.<a>.<b>` with the two cluster ids
/// sorted. Both gateways of a pair agree on it, and since cluster ids never
/// contain `.` distinct pairs never share one. Always fits a VICI section
/// name: 7 + 2 * [`MAX_CLUSTER_ID_LEN`] bytes at most.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
	pub fn for_pair(a: &ClusterId, b: &ClusterId) -> Self {
		let (first, second) = if a <= b { (a, b) } else { (b, a) };
		Self(format!("{CONNECTION_PREFIX}.{first}.{second}"))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encapsulation {
	/// Plain ESP on the base IKE port.
	Plain,
	/// ESP forced into UDP encapsulation on the NAT-T port.
	Tunnel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSpec {
	pub id: ConnectionId,
	pub local_cluster: ClusterId,
	pub remote_cluster: ClusterId,
	pub local_addr: IpAddr,
	pub remote_addr: IpAddr,
	pub remote_port: String,
	pub encapsulation: Encapsulation,
	pub ike_proposals: Vec<String>,
	pub esp_proposals: Vec<String>,
	pub local_subnets: Vec<IpNet>,
	pub remote_subnets: Vec<IpNet>,
	pub local_auth: AuthMethod,
	pub remote_auth: AuthMethod,
}

/// Derives the connection between `local` and `remote`. Pure; performs no I/O.
pub fn build(
	local: &Endpoint,
	remote: &Endpoint,
	config: &DriverConfig,
) -> Result<ConnectionSpec, SpecError> {
	if local.cluster_id == remote.cluster_id {
		return Err(SpecError::SelfConnection(local.cluster_id.to_string()));
	}
	for endpoint in [local, remote] {
		if endpoint.subnets.is_empty() {
			return Err(SpecError::NoSubnets(endpoint.cluster_id.to_string()));
		}
	}

	let (encapsulation, remote_port) = if remote.nat.behind_nat {
		(Encapsulation::Tunnel, config.natt_port.clone())
	} else {
		(Encapsulation::Plain, config.ike_port.clone())
	};

	Ok(ConnectionSpec {
		id: ConnectionId::for_pair(&local.cluster_id, &remote.cluster_id),
		local_cluster: local.cluster_id.clone(),
		remote_cluster: remote.cluster_id.clone(),
		local_addr: local.private_ip,
		remote_addr: remote.reachable_ip(),
		remote_port,
		encapsulation,
		ike_proposals: config.ike_proposals.clone(),
		esp_proposals: config.esp_proposals.clone(),
		local_subnets: local.subnets.clone(),
		remote_subnets: remote.subnets.clone(),
		local_auth: local.auth.clone(),
		remote_auth: remote.auth.clone(),
	})
}
