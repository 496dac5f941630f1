// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
	#[error("template error: {0}")]
	Template(#[from] loom_cable_common::TemplateError),

	#[error("configuration error: {0}")]
	Config(#[from] loom_cable_common::ConfigError),

	#[error("control error: {0}")]
	Control(#[from] loom_cable_control::ControlError),

	#[error("driver already started")]
	AlreadyStarted,

	#[error("driver is shut down")]
	ShutDown,
}

pub type Result<T> = std::result::Result<T, DriverError>;
