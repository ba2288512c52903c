// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Platform seams used by [`TunnelManager`](crate::TunnelManager).
//!
//! On Linux the TUN device and packet engine come from boringtun and the
//! link, address and route operations go through rtnetlink. Tests swap both
//! for the fakes in [`testing`](crate::testing).

use async_trait::async_trait;
use ipnet::IpNet;
use wgadmin_common::PrivateKey;

use crate::config::PeerConfig;
use crate::error::Result;

/// Allocates TUN interfaces and binds a tunnel engine to them.
#[async_trait]
pub trait TunDriver: Send + Sync {
	async fn create(&self, name: &str) -> Result<Box<dyn TunInterface>>;

	async fn attach(&self, tun: &dyn TunInterface) -> Result<Box<dyn TunnelEngine>>;
}

#[async_trait]
pub trait TunInterface: Send + Sync {
	fn name(&self) -> &str;

	/// Releases the interface. The kernel removes the link once the last
	/// file descriptor is gone.
	async fn close(self: Box<Self>) -> Result<()>;
}

/// The WireGuard packet engine running on a TUN interface.
#[async_trait]
pub trait TunnelEngine: Send + Sync {
	async fn set_private_key(&self, key: &PrivateKey) -> Result<()>;

	async fn set_listen_port(&self, port: u16) -> Result<()>;

	/// Drops every existing peer and installs `peers`.
	async fn replace_peers(&self, peers: &[PeerConfig]) -> Result<()>;

	async fn close(self: Box<Self>) -> Result<()>;
}

/// Link, address and route configuration.
#[async_trait]
pub trait NetworkManager: Send + Sync {
	async fn link_index(&self, name: &str) -> Result<u32>;

	async fn set_mtu(&self, index: u32, mtu: u32) -> Result<()>;

	/// Removes every address assigned to the link.
	async fn flush_addresses(&self, index: u32) -> Result<()>;

	async fn add_address(&self, index: u32, address: IpNet) -> Result<()>;

	async fn add_route(&self, index: u32, destination: IpNet) -> Result<()>;

	async fn del_route(&self, index: u32, destination: IpNet) -> Result<()>;

	async fn set_link_up(&self, index: u32) -> Result<()>;
}
