// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared types for the IPsec cable driver.
//!
//! Everything in this crate is pure data or pure transformation:
//!
//! - [`Endpoint`] describes one cluster gateway as announced by cluster membership
//! - [`DriverConfig`] is the process-wide configuration, resolved once at startup
//! - [`CharonConfig`] renders the daemon's static `charon.conf`
//! - [`spec::build`] derives the [`ConnectionSpec`] for a local/remote endpoint pair
//!
//! No I/O against the IKE daemon happens here; see `loom-cable-control` for that.

pub mod charon;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod secret;
pub mod spec;

pub use charon::{render_template, CharonConfig};
pub use config::{DriverConfig, DriverConfigLayer, ReconcileConfig};
pub use endpoint::{AuthMethod, ClusterId, Endpoint, EndpointEvent, NatInfo, MAX_CLUSTER_ID_LEN};
pub use error::{ConfigError, EndpointError, SpecError, TemplateError};
pub use secret::{Secret, SecretString, REDACTED};
pub use spec::{ConnectionId, ConnectionSpec, Encapsulation};
