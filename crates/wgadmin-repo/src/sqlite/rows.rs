// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Row codecs between the SQLite columns and the domain types.
//!
//! Keys are stored as hex, addresses and allowed IPs as CIDR text (the latter
//! comma-joined) and the last handshake as unix nanoseconds. Anything that
//! does not decode is an error, never a default value.

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use std::net::SocketAddr;
use wgadmin_common::{parse_cidr, DeviceInfo, PeerInfo, PrivateKey, PublicKey, SymmetricKey};
use zeroize::Zeroizing;

use crate::error::{RepoError, Result};

const NANOS_PER_SEC: i64 = 1_000_000_000;

#[derive(sqlx::FromRow)]
pub(crate) struct DeviceRow {
	pub id: String,
	pub private_key: String,
	pub listen_port: i64,
	pub address: Option<String>,
}

impl Drop for DeviceRow {
	fn drop(&mut self) {
		zeroize::Zeroize::zeroize(&mut self.private_key);
	}
}

impl TryFrom<DeviceRow> for DeviceInfo {
	type Error = RepoError;

	fn try_from(row: DeviceRow) -> Result<Self> {
		let private_key = PrivateKey::from_hex(&row.private_key)
			.map_err(|e| invalid_column(&row.id, "private_key", e))?;
		let listen_port = u16::try_from(row.listen_port)
			.map_err(|e| invalid_column(&row.id, "listen_port", e))?;
		let address = match row.address.as_deref() {
			None | Some("") => None,
			Some(text) => Some(parse_cidr(text).map_err(|e| invalid_column(&row.id, "address", e))?),
		};

		Ok(DeviceInfo {
			name: row.id.clone(),
			private_key,
			listen_port,
			address,
		})
	}
}

/// Bind values for one device upsert.
pub(crate) struct DeviceParams {
	pub id: String,
	pub public_key: String,
	pub private_key: Zeroizing<String>,
	pub listen_port: i64,
	pub address: Option<String>,
}

impl From<&DeviceInfo> for DeviceParams {
	fn from(info: &DeviceInfo) -> Self {
		Self {
			id: info.name.clone(),
			public_key: info.public_key().to_hex(),
			private_key: info.private_key.to_hex(),
			listen_port: i64::from(info.listen_port),
			address: info.address.map(|a| a.to_string()),
		}
	}
}

#[derive(sqlx::FromRow)]
pub(crate) struct PeerRow {
	pub device_id: String,
	pub public_key: String,
	pub pre_shared_key: Option<String>,
	pub endpoint: Option<String>,
	pub allowed_ips: Option<String>,
	pub persistent_keepalive_interval: Option<i64>,
	pub last_handshake: Option<i64>,
	pub name: String,
}

impl Drop for PeerRow {
	fn drop(&mut self) {
		if let Some(psk) = self.pre_shared_key.as_mut() {
			zeroize::Zeroize::zeroize(psk);
		}
	}
}

impl PeerRow {
	pub fn from_info(info: &PeerInfo) -> Result<Self> {
		let last_handshake = info
			.last_handshake
			.map(|t| {
				t.timestamp_nanos_opt().ok_or_else(|| {
					RepoError::InvalidInput(format!(
						"last handshake {t} of peer {} is out of range",
						info.public_key
					))
				})
			})
			.transpose()?;

		Ok(Self {
			device_id: info.device.clone(),
			public_key: info.public_key.to_hex(),
			pre_shared_key: info
				.preshared_key
				.as_ref()
				.map(|k| k.to_hex().as_str().to_owned()),
			endpoint: info.endpoint.map(|e| e.to_string()),
			allowed_ips: encode_allowed_ips(&info.allowed_ips),
			persistent_keepalive_interval: info.persistent_keepalive_interval.map(i64::from),
			last_handshake,
			name: info.name.clone(),
		})
	}

	pub fn to_info(&self) -> Result<PeerInfo> {
		let ctx = format!("{}/{}", self.device_id, self.public_key);

		let public_key =
			PublicKey::from_hex(&self.public_key).map_err(|e| invalid_column(&ctx, "public_key", e))?;

		let preshared_key = match self.pre_shared_key.as_deref() {
			None | Some("") => None,
			Some(text) => Some(
				SymmetricKey::from_hex(text).map_err(|e| invalid_column(&ctx, "pre_shared_key", e))?,
			),
		};

		let endpoint = match self.endpoint.as_deref() {
			None | Some("") => None,
			Some(text) => Some(
				text.parse::<SocketAddr>()
					.map_err(|e| invalid_column(&ctx, "endpoint", e))?,
			),
		};

		let allowed_ips = decode_allowed_ips(self.allowed_ips.as_deref())
			.map_err(|e| invalid_column(&ctx, "allowed_ips", e))?;

		let persistent_keepalive_interval = self
			.persistent_keepalive_interval
			.map(u16::try_from)
			.transpose()
			.map_err(|e| invalid_column(&ctx, "persistent_keepalive_interval", e))?;

		let last_handshake = self
			.last_handshake
			.map(|nanos| {
				decode_nanos(nanos).ok_or_else(|| {
					invalid_column(&ctx, "last_handshake", format!("{nanos} is out of range"))
				})
			})
			.transpose()?;

		Ok(PeerInfo {
			device: self.device_id.clone(),
			public_key,
			preshared_key,
			endpoint,
			allowed_ips,
			persistent_keepalive_interval,
			last_handshake,
			name: self.name.clone(),
		})
	}
}

fn invalid_column(ctx: &str, column: &str, e: impl std::fmt::Display) -> RepoError {
	RepoError::InvalidInput(format!("stored {column} of {ctx} is malformed: {e}"))
}

pub(crate) fn encode_allowed_ips(ips: &[IpNet]) -> Option<String> {
	if ips.is_empty() {
		return None;
	}
	Some(
		ips.iter()
			.map(|ip| ip.to_string())
			.collect::<Vec<_>>()
			.join(","),
	)
}

pub(crate) fn decode_allowed_ips(text: Option<&str>) -> std::result::Result<Vec<IpNet>, String> {
	match text {
		None | Some("") => Ok(Vec::new()),
		Some(text) => text
			.split(',')
			.map(|part| parse_cidr(part).map_err(|e| e.to_string()))
			.collect(),
	}
}

fn decode_nanos(nanos: i64) -> Option<DateTime<Utc>> {
	let secs = nanos.div_euclid(NANOS_PER_SEC);
	let subsec = u32::try_from(nanos.rem_euclid(NANOS_PER_SEC)).ok()?;
	DateTime::<Utc>::from_timestamp(secs, subsec)
}
