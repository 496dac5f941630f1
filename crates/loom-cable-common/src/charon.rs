// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Rendering of the charon daemon's static configuration.

use crate::config::DriverConfig;
use crate::error::{ConfigError, TemplateError};
use std::io::Write;
use std::path::Path;
use tracing::{debug, instrument};

const CHARON_CONF_TEMPLATE: &str = "\
charon {
	port = {{port}}
	port_nat_t = {{port_nat_t}}
	make_before_break = yes
	ignore_acquire_ts = yes
	filelog {
		stderr {
			default = {{log_level}}
			ike_name = yes
		}
	}
	plugins {
		vici {
			load = yes
		}
	}
}
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharonConfig {
	ike_port: String,
	natt_port: String,
	debug: bool,
}

impl CharonConfig {
	pub fn new(
		ike_port: impl Into<String>,
		natt_port: impl Into<String>,
		debug: bool,
	) -> Result<Self, ConfigError> {
		let ike_port = ike_port.into();
		let natt_port = natt_port.into();
		if ike_port.is_empty() {
			return Err(ConfigError::EmptyPort("IKE port"));
		}
		if natt_port.is_empty() {
			return Err(ConfigError::EmptyPort("NAT-T port"));
		}
		Ok(Self {
			ike_port,
			natt_port,
			debug,
		})
	}

	pub fn from_driver_config(config: &DriverConfig) -> Result<Self, ConfigError> {
		Self::new(config.ike_port.clone(), config.natt_port.clone(), config.debug)
	}

	pub fn ike_port(&self) -> &str {
		&self.ike_port
	}

	pub fn natt_port(&self) -> &str {
		&self.natt_port
	}

	pub fn render<W: Write>(&self, sink: &mut W) -> Result<(), TemplateError> {
		let log_level = if self.debug { "2" } else { "1" };
		render_template(
			CHARON_CONF_TEMPLATE,
			&[
				("port", self.ike_port.as_str()),
				("port_nat_t", self.natt_port.as_str()),
				("log_level", log_level),
			],
			sink,
		)
	}

	#[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
	pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), TemplateError> {
		let path = path.as_ref();
		let mut rendered = Vec::new();
		self.render(&mut rendered)?;

		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		std::fs::write(path, rendered)?;

		debug!("wrote charon configuration");
		Ok(())
	}
}

/// Substitutes `{{name}}` placeholders from `vars` and writes the result to
/// `sink`. Nothing is written unless the whole template renders.
pub fn render_template<W: Write>(
	template: &str,
	vars: &[(&str, &str)],
	sink: &mut W,
) -> Result<(), TemplateError> {
	let mut out = String::with_capacity(template.len());
	let mut rest = template;
	let mut offset = 0;

	while let Some(start) = rest.find("{{") {
		out.push_str(&rest[..start]);
		let after_open = &rest[start + 2..];
		let end = after_open.find("}}").ok_or_else(|| TemplateError::Malformed {
			offset: offset + start,
			reason: "unterminated placeholder".to_string(),
		})?;

		let name = after_open[..end].trim();
		let value = vars
			.iter()
			.find(|(key, _)| *key == name)
			.map(|(_, value)| *value)
			.ok_or_else(|| TemplateError::Malformed {
				offset: offset + start,
				reason: format!("unknown placeholder '{name}'"),
			})?;
		out.push_str(value);

		let consumed = start + 2 + end + 2;
		offset += consumed;
		rest = &rest[consumed..];
	}

	if let Some(pos) = rest.find("}}") {
		return Err(TemplateError::Malformed {
			offset: offset + pos,
			reason: "unopened placeholder".to_string(),
		});
	}
	out.push_str(rest);

	sink.write_all(out.as_bytes())?;
	Ok(())
}
