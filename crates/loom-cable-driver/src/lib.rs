// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! IPsec cable driver.
//!
//! Keeps encrypted site-to-site tunnels between the local cluster gateway and
//! every known remote gateway by driving the charon IKE daemon.
//!
//! # Overview
//!
//! 1. [`CableDriver::init`] writes `charon.conf` and loads the shared IKE key
//! 2. Membership events land in the [`EndpointRegistry`]
//! 3. One worker per remote endpoint builds its connection spec, loads it,
//!    initiates the SA and watches it, retrying with capped exponential
//!    backoff on failure
//! 4. Removing an endpoint terminates and unloads its connection
//!
//! Tunnel state is readable at any time through [`CableDriver::tunnels`] and
//! phase changes can be followed with [`CableDriver::subscribe_transitions`].
//!
//! # Example
//!
//! ```ignore
//! use loom_cable_common::{DriverConfig, EndpointEvent};
//! use loom_cable_driver::CableDriver;
//!
//! let config = DriverConfig::from_env()?;
//! let driver = CableDriver::with_vici(config, local_endpoint);
//! driver.init().await?;
//! driver.run(membership_events).await?;
//! driver.shutdown().await;
//! ```

pub mod backoff;
pub mod board;
pub mod driver;
pub mod error;
mod reconciler;
pub mod registry;
pub mod tunnel;

pub use backoff::Backoff;
pub use board::StatusBoard;
pub use driver::CableDriver;
pub use error::{DriverError, Result};
pub use registry::{EndpointRegistry, RegistryEvent, UpsertOutcome};
pub use tunnel::{FailureKind, LastError, TunnelPhase, TunnelStatus, TunnelTransition};
