// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use ipnet::IpNet;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use wgadmin_common::{DeviceInfo, PeerInfo, PrivateKey, PublicKey, SymmetricKey};

/// Everything applied to one live interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
	pub private_key: PrivateKey,
	pub listen_port: u16,
	pub address: Option<IpNet>,
	pub peers: Vec<PeerConfig>,
}

impl DeviceConfig {
	pub fn new(private_key: PrivateKey) -> Self {
		Self {
			private_key,
			listen_port: 0,
			address: None,
			peers: Vec::new(),
		}
	}

	/// Builds the live configuration of `device` from stored desired state.
	/// Peers of other devices are ignored.
	pub fn from_desired(device: &DeviceInfo, peers: &[PeerInfo]) -> Self {
		Self {
			private_key: device.private_key.clone(),
			listen_port: device.listen_port,
			address: device.address,
			peers: peers
				.iter()
				.filter(|peer| peer.device == device.name)
				.map(PeerConfig::from)
				.collect(),
		}
	}

	pub fn public_key(&self) -> PublicKey {
		self.private_key.public_key()
	}

	/// Destinations to route through the interface: every allowed-IP prefix
	/// with its host bits cleared. Default routes are left out.
	pub fn routes(&self) -> BTreeSet<IpNet> {
		self.peers
			.iter()
			.flat_map(|peer| peer.allowed_ips.iter())
			.filter(|net| net.prefix_len() > 0)
			.map(|net| net.trunc())
			.collect()
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
	pub public_key: PublicKey,
	pub preshared_key: Option<SymmetricKey>,
	pub endpoint: Option<SocketAddr>,
	pub allowed_ips: Vec<IpNet>,
	pub persistent_keepalive_interval: Option<u16>,
}

impl PeerConfig {
	pub fn new(public_key: PublicKey) -> Self {
		Self {
			public_key,
			preshared_key: None,
			endpoint: None,
			allowed_ips: Vec::new(),
			persistent_keepalive_interval: None,
		}
	}
}

impl From<&PeerInfo> for PeerConfig {
	fn from(peer: &PeerInfo) -> Self {
		Self {
			public_key: peer.public_key,
			preshared_key: peer.preshared_key.clone(),
			endpoint: peer.endpoint,
			allowed_ips: peer.allowed_ips.clone(),
			persistent_keepalive_interval: peer.persistent_keepalive_interval,
		}
	}
}

/// Snapshot of a device that is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
	pub id: String,
	pub interface: String,
	pub index: u32,
	pub config: DeviceConfig,
}

#[cfg(test)]
mod tests {
	use super::*;
	use wgadmin_common::KeyPair;

	#[test]
	fn from_desired_keeps_only_own_peers() {
		let device = DeviceInfo::new("wg0", PrivateKey::generate()).with_listen_port(51820);
		let own = PeerInfo::new("wg0", *KeyPair::generate().public_key());
		let foreign = PeerInfo::new("wg1", *KeyPair::generate().public_key());

		let config = DeviceConfig::from_desired(&device, &[own.clone(), foreign]);

		assert_eq!(config.listen_port, 51820);
		assert_eq!(config.public_key(), device.public_key());
		assert_eq!(config.peers, vec![PeerConfig::from(&own)]);
	}

	#[test]
	fn routes_are_truncated_deduplicated_and_skip_default() {
		let mut config = DeviceConfig::new(PrivateKey::generate());
		let mut a = PeerConfig::new(*KeyPair::generate().public_key());
		a.allowed_ips = vec!["10.0.0.7/24".parse().unwrap(), "0.0.0.0/0".parse().unwrap()];
		let mut b = PeerConfig::new(*KeyPair::generate().public_key());
		b.allowed_ips = vec!["10.0.0.0/24".parse().unwrap(), "fd00::1/64".parse().unwrap()];
		config.peers = vec![a, b];

		let routes: Vec<String> = config.routes().iter().map(|r| r.to_string()).collect();
		assert_eq!(routes, vec!["10.0.0.0/24", "fd00::/64"]);
	}

	mod props {
		use super::*;
		use proptest::prelude::*;
		use std::net::Ipv4Addr;

		fn arb_net() -> impl Strategy<Value = IpNet> {
			(any::<u32>(), 0u8..=32).prop_map(|(addr, len)| {
				IpNet::V4(ipnet::Ipv4Net::new(Ipv4Addr::from(addr), len).unwrap())
			})
		}

		proptest! {
			#[test]
			fn routes_cover_every_non_default_prefix(
				sets in proptest::collection::vec(proptest::collection::vec(arb_net(), 0..4), 0..4)
			) {
				let mut config = DeviceConfig::new(PrivateKey::from_bytes([7; 32]));
				config.peers = sets
					.into_iter()
					.enumerate()
					.map(|(i, allowed_ips)| {
						let mut peer = PeerConfig::new(PublicKey::from_bytes([i as u8; 32]));
						peer.allowed_ips = allowed_ips;
						peer
					})
					.collect();

				let routes = config.routes();
				for route in &routes {
					prop_assert!(route.prefix_len() > 0);
					prop_assert_eq!(*route, route.trunc());
				}
				for net in config.peers.iter().flat_map(|p| p.allowed_ips.iter()) {
					prop_assert_eq!(routes.contains(&net.trunc()), net.prefix_len() > 0);
				}
			}
		}
	}
}
