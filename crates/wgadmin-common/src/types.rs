// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::Serialize;
use std::net::SocketAddr;
use thiserror::Error;

use crate::keys::{PrivateKey, PublicKey, SymmetricKey};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
	#[error("device name must not be empty")]
	EmptyDeviceName,

	#[error("device {0} has an all-zero private key")]
	ZeroPrivateKey(String),

	#[error("peer {peer} belongs to device {actual}, expected {expected}")]
	DeviceMismatch {
		peer: PublicKey,
		expected: String,
		actual: String,
	},

	#[error("invalid CIDR {0:?}")]
	InvalidCidr(String),
}

/// Desired configuration of one logical tunnel device.
///
/// The name is the identity. The public key is never stored on its own; it is
/// always derived from the private key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
	pub name: String,
	pub private_key: PrivateKey,
	pub listen_port: u16,
	pub address: Option<IpNet>,
}

impl DeviceInfo {
	pub fn new(name: impl Into<String>, private_key: PrivateKey) -> Self {
		Self {
			name: name.into(),
			private_key,
			listen_port: 0,
			address: None,
		}
	}

	pub fn with_listen_port(mut self, port: u16) -> Self {
		self.listen_port = port;
		self
	}

	pub fn with_address(mut self, address: IpNet) -> Self {
		self.address = Some(address);
		self
	}

	pub fn public_key(&self) -> PublicKey {
		self.private_key.public_key()
	}

	pub fn validate(&self) -> Result<(), ValidationError> {
		if self.name.is_empty() {
			return Err(ValidationError::EmptyDeviceName);
		}
		if self.private_key.is_zero() {
			return Err(ValidationError::ZeroPrivateKey(self.name.clone()));
		}
		Ok(())
	}
}

/// Desired (or, from the kernel view, observed) configuration of one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
	pub device: String,
	pub public_key: PublicKey,
	pub preshared_key: Option<SymmetricKey>,
	pub endpoint: Option<SocketAddr>,
	pub allowed_ips: Vec<IpNet>,
	pub persistent_keepalive_interval: Option<u16>,
	/// Only ever filled in from live state.
	pub last_handshake: Option<DateTime<Utc>>,
	pub name: String,
}

impl PeerInfo {
	pub fn new(device: impl Into<String>, public_key: PublicKey) -> Self {
		Self {
			device: device.into(),
			public_key,
			preshared_key: None,
			endpoint: None,
			allowed_ips: Vec::new(),
			persistent_keepalive_interval: None,
			last_handshake: None,
			name: String::new(),
		}
	}

	pub fn with_name(mut self, name: impl Into<String>) -> Self {
		self.name = name.into();
		self
	}

	pub fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
		self.endpoint = Some(endpoint);
		self
	}

	pub fn with_allowed_ips(mut self, allowed_ips: Vec<IpNet>) -> Self {
		self.allowed_ips = allowed_ips;
		self
	}

	pub fn with_preshared_key(mut self, key: SymmetricKey) -> Self {
		self.preshared_key = Some(key);
		self
	}

	pub fn with_keepalive(mut self, seconds: u16) -> Self {
		self.persistent_keepalive_interval = Some(seconds);
		self
	}

	/// Checks the peer may be written under `device`.
	pub fn validate_for(&self, device: &str) -> Result<(), ValidationError> {
		if device.is_empty() {
			return Err(ValidationError::EmptyDeviceName);
		}
		if self.device != device {
			return Err(ValidationError::DeviceMismatch {
				peer: self.public_key,
				expected: device.to_string(),
				actual: self.device.clone(),
			});
		}
		Ok(())
	}
}

/// Parses `addr/prefix` keeping the host bits, so `10.0.0.1/24` stays as is.
pub fn parse_cidr(s: &str) -> Result<IpNet, ValidationError> {
	s.trim()
		.parse::<IpNet>()
		.map_err(|_| ValidationError::InvalidCidr(s.to_string()))
}
