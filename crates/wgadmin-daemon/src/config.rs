// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;

/// Linux interface names are at most 15 bytes. Room is left for the
/// sequence number appended to the prefix.
pub const MAX_PREFIX_LEN: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
	Sqlite,
	Memory,
}

impl FromStr for Backend {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"sqlite" => Ok(Self::Sqlite),
			"memory" => Ok(Self::Memory),
			other => Err(ConfigError::Parse(format!(
				"WGADMIN_BACKEND must be sqlite or memory, got {other:?}"
			))),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
	Text,
	Json,
}

impl FromStr for LogFormat {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"text" => Ok(Self::Text),
			"json" => Ok(Self::Json),
			other => Err(ConfigError::Parse(format!(
				"WGADMIN_LOG_FORMAT must be text or json, got {other:?}"
			))),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
	pub backend: Backend,
	pub database_url: String,
	pub interface_prefix: String,
	pub mtu: u32,
	pub uapi_dir: PathBuf,
	pub log_format: LogFormat,
}

impl Default for DaemonConfig {
	fn default() -> Self {
		Self {
			backend: Backend::Sqlite,
			database_url: "sqlite:./wgadmin.db".to_string(),
			interface_prefix: "wgadm".to_string(),
			mtu: 1420,
			uapi_dir: PathBuf::from("/var/run/wireguard"),
			log_format: LogFormat::Text,
		}
	}
}

impl DaemonConfig {
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	/// Builds the config from `lookup`, falling back to defaults for unset
	/// variables.
	pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let defaults = Self::default();

		let backend = match lookup("WGADMIN_BACKEND") {
			Some(value) => value.parse()?,
			None => defaults.backend,
		};

		let database_url = lookup("WGADMIN_DATABASE_URL").unwrap_or(defaults.database_url);
		if backend == Backend::Sqlite && database_url.trim().is_empty() {
			return Err(ConfigError::MissingEnv("WGADMIN_DATABASE_URL".to_string()));
		}

		let interface_prefix = lookup("WGADMIN_INTERFACE_PREFIX").unwrap_or(defaults.interface_prefix);
		validate_prefix(&interface_prefix)?;

		let mtu = match lookup("WGADMIN_MTU") {
			Some(value) => value
				.trim()
				.parse()
				.map_err(|e| ConfigError::Parse(format!("invalid WGADMIN_MTU: {e}")))?,
			None => defaults.mtu,
		};
		if !(576..=65535).contains(&mtu) {
			return Err(ConfigError::Parse(format!(
				"WGADMIN_MTU must be between 576 and 65535, got {mtu}"
			)));
		}

		let uapi_dir = lookup("WGADMIN_UAPI_DIR")
			.map(PathBuf::from)
			.unwrap_or(defaults.uapi_dir);

		let log_format = match lookup("WGADMIN_LOG_FORMAT") {
			Some(value) => value.parse()?,
			None => defaults.log_format,
		};

		Ok(Self {
			backend,
			database_url,
			interface_prefix,
			mtu,
			uapi_dir,
			log_format,
		})
	}
}

fn validate_prefix(prefix: &str) -> Result<(), ConfigError> {
	if prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN {
		return Err(ConfigError::Parse(format!(
			"WGADMIN_INTERFACE_PREFIX must be 1 to {MAX_PREFIX_LEN} characters, got {prefix:?}"
		)));
	}
	if !prefix
		.chars()
		.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
	{
		return Err(ConfigError::Parse(format!(
			"WGADMIN_INTERFACE_PREFIX may only contain letters, digits, '-' and '_', got {prefix:?}"
		)));
	}
	Ok(())
}
