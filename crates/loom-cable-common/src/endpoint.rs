// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::EndpointError;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Longest cluster id accepted, the DNS label limit.
pub const MAX_CLUSTER_ID_LEN: usize = 63;

/// Cluster identifier. Always a DNS-1123 label: lowercase alphanumerics and
/// `-`, starting and ending with an alphanumeric, at most
/// [`MAX_CLUSTER_ID_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClusterId(String);

impl ClusterId {
	pub fn new(id: impl Into<String>) -> Result<Self, EndpointError> {
		let id = id.into();
		if id.is_empty() {
			return Err(EndpointError::EmptyClusterId);
		}
		if id.len() > MAX_CLUSTER_ID_LEN {
			return Err(EndpointError::ClusterIdTooLong(id.len()));
		}
		let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
		if !id.chars().all(|c| allowed(c) || c == '-')
			|| !id.starts_with(allowed)
			|| !id.ends_with(allowed)
		{
			return Err(EndpointError::InvalidClusterId(id));
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ClusterId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl std::str::FromStr for ClusterId {
	type Err = EndpointError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::new(s)
	}
}

impl TryFrom<String> for ClusterId {
	type Error = EndpointError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}

impl From<ClusterId> for String {
	fn from(id: ClusterId) -> Self {
		id.0
	}
}

/// Result of NAT discovery for a gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatInfo {
	pub behind_nat: bool,
	#[serde(default)]
	pub public_ip: Option<IpAddr>,
}

/// How a gateway authenticates during IKE. Key material itself is never
/// carried on an endpoint; a pre-shared key is loaded into the daemon once at
/// startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthMethod {
	#[default]
	PreSharedKey,
	/// `cert_ref` names the IKE identity of a certificate already present in
	/// the daemon's credential store.
	Certificate {
		cert_ref: String,
	},
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
	pub cluster_id: ClusterId,
	#[serde(default)]
	pub hostname: String,
	pub private_ip: IpAddr,
	#[serde(default)]
	pub nat: NatInfo,
	#[serde(default)]
	pub subnets: Vec<IpNet>,
	#[serde(default)]
	pub auth: AuthMethod,
}

impl Endpoint {
	pub fn new(cluster_id: ClusterId, private_ip: IpAddr) -> Self {
		Self {
			cluster_id,
			hostname: String::new(),
			private_ip,
			nat: NatInfo::default(),
			subnets: Vec::new(),
			auth: AuthMethod::default(),
		}
	}

	pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
		self.hostname = hostname.into();
		self
	}

	pub fn with_subnets(mut self, subnets: impl IntoIterator<Item = IpNet>) -> Self {
		self.subnets = subnets.into_iter().collect();
		self
	}

	pub fn with_public_ip(mut self, public_ip: IpAddr) -> Self {
		self.nat.public_ip = Some(public_ip);
		self
	}

	pub fn behind_nat(mut self, public_ip: Option<IpAddr>) -> Self {
		self.nat = NatInfo {
			behind_nat: true,
			public_ip: public_ip.or(self.nat.public_ip),
		};
		self
	}

	pub fn with_auth(mut self, auth: AuthMethod) -> Self {
		self.auth = auth;
		self
	}

	/// Address peers should use to reach this gateway: the NAT-discovered
	/// public address when known, the private address otherwise.
	pub fn reachable_ip(&self) -> IpAddr {
		self.nat.public_ip.unwrap_or(self.private_ip)
	}
}

/// An event delivered by the cluster-membership collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointEvent {
	Upserted { endpoint: Endpoint },
	Removed { cluster_id: ClusterId },
}
