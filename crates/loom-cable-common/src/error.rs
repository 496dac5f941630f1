// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("invalid value for {key}: {message}")]
	InvalidValue { key: String, message: String },

	#[error("{0} must not be empty")]
	EmptyPort(&'static str),
}

#[derive(Debug, Error)]
pub enum TemplateError {
	#[error("malformed template at byte {offset}: {reason}")]
	Malformed { offset: usize, reason: String },

	#[error("failed to write rendered config: {0}")]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
	#[error("cluster id must not be empty")]
	EmptyClusterId,

	#[error("cluster id is {0} bytes, longer than a DNS label")]
	ClusterIdTooLong(usize),

	#[error("cluster id {0:?} is not a DNS label")]
	InvalidClusterId(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
	#[error("cannot build a connection from cluster {0} to itself")]
	SelfConnection(String),

	#[error("cluster {0} advertises no subnets")]
	NoSubnets(String),
}
