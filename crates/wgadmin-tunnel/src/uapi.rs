// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! WireGuard cross-platform UAPI (`get=1` / `set=1` over a unix socket).
//!
//! Requests and responses are newline separated `key=value` lines, keys are
//! lowercase hex and a blank line terminates a request. Every response ends
//! with an `errno=` line.

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use std::fmt::Write as _;
use std::net::SocketAddr;
use zeroize::Zeroizing;

use wgadmin_common::{PrivateKey, PublicKey, SymmetricKey};

use crate::config::PeerConfig;
use crate::error::{Result, TunnelError};

#[cfg(unix)]
pub use client::{UapiClient, UapiEngine};

/// One `set=1` operation.
#[derive(Debug, Clone, Default)]
pub struct SetRequest {
	pub private_key: Option<PrivateKey>,
	pub listen_port: Option<u16>,
	pub replace_peers: bool,
	pub peers: Vec<PeerUpdate>,
}

#[derive(Debug, Clone)]
pub struct PeerUpdate {
	pub config: PeerConfig,
	pub remove: bool,
}

impl PeerUpdate {
	/// Creates or fully overwrites the peer, including its allowed IPs.
	pub fn upsert(config: PeerConfig) -> Self {
		Self {
			config,
			remove: false,
		}
	}

	pub fn remove(public_key: PublicKey) -> Self {
		Self {
			config: PeerConfig::new(public_key),
			remove: true,
		}
	}
}

impl SetRequest {
	pub fn replace_peers(peers: &[PeerConfig]) -> Self {
		Self {
			replace_peers: true,
			peers: peers.iter().cloned().map(PeerUpdate::upsert).collect(),
			..Self::default()
		}
	}

	/// Renders the request including the terminating blank line.
	pub fn encode(&self) -> Zeroizing<String> {
		let mut out = Zeroizing::new(String::from("set=1\n"));

		if let Some(key) = &self.private_key {
			let hex = key.to_hex();
			let _ = writeln!(out, "private_key={}", hex.as_str());
		}
		if let Some(port) = self.listen_port {
			let _ = writeln!(out, "listen_port={port}");
		}
		if self.replace_peers {
			out.push_str("replace_peers=true\n");
		}

		for peer in &self.peers {
			let config = &peer.config;
			let _ = writeln!(out, "public_key={}", config.public_key.to_hex());
			if peer.remove {
				out.push_str("remove=true\n");
				continue;
			}

			let psk = match &config.preshared_key {
				Some(key) => key.to_hex(),
				None => Zeroizing::new(ZERO_KEY_HEX.to_string()),
			};
			let _ = writeln!(out, "preshared_key={}", psk.as_str());
			if let Some(endpoint) = config.endpoint {
				let _ = writeln!(out, "endpoint={endpoint}");
			}
			let _ = writeln!(
				out,
				"persistent_keepalive_interval={}",
				config.persistent_keepalive_interval.unwrap_or(0)
			);
			out.push_str("replace_allowed_ips=true\n");
			for net in &config.allowed_ips {
				let _ = writeln!(out, "allowed_ip={net}");
			}
		}

		out.push('\n');
		out
	}
}

const ZERO_KEY_HEX: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Live state of one interface as reported by `get=1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveDevice {
	pub interface: String,
	pub private_key: Option<PrivateKey>,
	pub listen_port: u16,
	pub peers: Vec<LivePeer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePeer {
	pub config: PeerConfig,
	pub last_handshake: Option<DateTime<Utc>>,
	pub rx_bytes: u64,
	pub tx_bytes: u64,
}

struct PendingPeer {
	peer: LivePeer,
	handshake_sec: i64,
	handshake_nsec: u32,
}

impl PendingPeer {
	fn finish(mut self) -> LivePeer {
		if self.handshake_sec != 0 || self.handshake_nsec != 0 {
			self.peer.last_handshake =
				DateTime::from_timestamp(self.handshake_sec, self.handshake_nsec);
		}
		self.peer
	}
}

/// Parses the response to `get=1`. All-zero keys and a zero handshake time
/// mean "unset".
pub fn parse_get_response(interface: &str, response: &str) -> Result<LiveDevice> {
	let mut device = LiveDevice {
		interface: interface.to_string(),
		private_key: None,
		listen_port: 0,
		peers: Vec::new(),
	};
	let mut current: Option<PendingPeer> = None;

	for line in response.lines() {
		let line = line.trim_end();
		if line.is_empty() {
			continue;
		}
		let (key, value) = line
			.split_once('=')
			.ok_or_else(|| TunnelError::Uapi(format!("malformed line {line:?}")))?;

		match key {
			"errno" => {
				let errno: i32 = parse_value(key, value)?;
				if errno != 0 {
					return Err(TunnelError::Uapi(format!("{interface}: errno={errno}")));
				}
			}
			"private_key" => {
				let private_key = PrivateKey::from_hex(value)?;
				device.private_key = (!private_key.is_zero()).then_some(private_key);
			}
			"listen_port" => device.listen_port = parse_value(key, value)?,
			"public_key" => {
				if let Some(done) = current.take() {
					device.peers.push(done.finish());
				}
				current = Some(PendingPeer {
					peer: LivePeer {
						config: PeerConfig::new(PublicKey::from_hex(value)?),
						last_handshake: None,
						rx_bytes: 0,
						tx_bytes: 0,
					},
					handshake_sec: 0,
					handshake_nsec: 0,
				});
			}
			_ => {
				let Some(pending) = current.as_mut() else {
					// Interface-level keys such as fwmark.
					continue;
				};
				let peer = &mut pending.peer;
				match key {
					"preshared_key" => {
						let psk = SymmetricKey::from_hex(value)?;
						peer.config.preshared_key =
							(psk.expose_bytes() != &[0u8; 32]).then_some(psk);
					}
					"endpoint" => {
						peer.config.endpoint = Some(parse_value::<SocketAddr>(key, value)?);
					}
					"allowed_ip" => {
						peer.config.allowed_ips.push(parse_value::<IpNet>(key, value)?);
					}
					"persistent_keepalive_interval" => {
						let seconds: u16 = parse_value(key, value)?;
						peer.config.persistent_keepalive_interval = (seconds != 0).then_some(seconds);
					}
					"last_handshake_time_sec" => pending.handshake_sec = parse_value(key, value)?,
					"last_handshake_time_nsec" => pending.handshake_nsec = parse_value(key, value)?,
					"rx_bytes" => peer.rx_bytes = parse_value(key, value)?,
					"tx_bytes" => peer.tx_bytes = parse_value(key, value)?,
					_ => {}
				}
			}
		}
	}

	if let Some(done) = current.take() {
		device.peers.push(done.finish());
	}
	Ok(device)
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
	value
		.parse()
		.map_err(|_| TunnelError::Uapi(format!("invalid {key} value {value:?}")))
}

#[cfg(unix)]
mod client {
	use async_trait::async_trait;
	use std::io::ErrorKind;
	use std::path::{Path, PathBuf};
	use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
	use tokio::net::UnixStream;
	use tracing::{debug, instrument};
	use wgadmin_common::PrivateKey;

	use super::{parse_get_response, LiveDevice, SetRequest};
	use crate::config::PeerConfig;
	use crate::error::{Result, TunnelError};
	use crate::platform::TunnelEngine;

	/// Talks to the UAPI socket of one interface.
	#[derive(Debug, Clone)]
	pub struct UapiClient {
		interface: String,
		path: PathBuf,
	}

	impl UapiClient {
		/// `<dir>/<interface>.sock`
		pub fn for_interface(dir: &Path, interface: &str) -> Self {
			Self {
				interface: interface.to_string(),
				path: dir.join(format!("{interface}.sock")),
			}
		}

		pub fn interface(&self) -> &str {
			&self.interface
		}

		pub fn path(&self) -> &Path {
			&self.path
		}

		#[instrument(skip(self), fields(interface = %self.interface))]
		pub async fn get(&self) -> Result<LiveDevice> {
			let response = self.exchange("get=1\n\n").await?;
			parse_get_response(&self.interface, &response)
		}

		#[instrument(skip(self, request), fields(interface = %self.interface, peers = request.peers.len()))]
		pub async fn set(&self, request: &SetRequest) -> Result<()> {
			let encoded = request.encode();
			let response = self.exchange(&encoded).await?;
			// The errno line is the whole response to a set.
			parse_get_response(&self.interface, &response).map(|_| ())
		}

		async fn exchange(&self, request: &str) -> Result<String> {
			let mut stream = UnixStream::connect(&self.path).await.map_err(|e| {
				match e.kind() {
					ErrorKind::NotFound | ErrorKind::ConnectionRefused => {
						TunnelError::NotExist(self.interface.clone())
					}
					_ => TunnelError::Io(e),
				}
			})?;
			stream.write_all(request.as_bytes()).await?;
			stream.flush().await?;

			let mut reader = BufReader::new(stream);
			let mut response = String::new();
			loop {
				let mut line = String::new();
				if reader.read_line(&mut line).await? == 0 {
					return Err(TunnelError::Uapi(format!(
						"{}: connection closed before errno",
						self.interface
					)));
				}
				let done = line.starts_with("errno=");
				response.push_str(&line);
				if done {
					break;
				}
			}

			debug!(bytes = response.len(), "uapi response");
			Ok(response)
		}
	}

	/// [`TunnelEngine`] backed by the UAPI socket of a userspace device.
	#[derive(Debug, Clone)]
	pub struct UapiEngine {
		client: UapiClient,
	}

	impl UapiEngine {
		pub fn new(client: UapiClient) -> Self {
			Self { client }
		}
	}

	#[async_trait]
	impl TunnelEngine for UapiEngine {
		async fn set_private_key(&self, key: &PrivateKey) -> Result<()> {
			self.client
				.set(&SetRequest {
					private_key: Some(key.clone()),
					..SetRequest::default()
				})
				.await
		}

		async fn set_listen_port(&self, port: u16) -> Result<()> {
			self.client
				.set(&SetRequest {
					listen_port: Some(port),
					..SetRequest::default()
				})
				.await
		}

		async fn replace_peers(&self, peers: &[PeerConfig]) -> Result<()> {
			self.client.set(&SetRequest::replace_peers(peers)).await
		}

		async fn close(self: Box<Self>) -> Result<()> {
			// The engine lives as long as its TUN interface.
			Ok(())
		}
	}
}
