// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::IpNet;
use rtnetlink::Handle;
use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::platform::NetworkManager;

/// [`NetworkManager`] over an rtnetlink socket.
pub struct NetlinkManager {
	handle: Handle,
}

impl NetlinkManager {
	/// Opens the netlink socket and spawns its connection task on the
	/// current runtime.
	pub fn new() -> Result<Self> {
		let (connection, handle, _) = rtnetlink::new_connection().map_err(TunnelError::Io)?;
		tokio::spawn(connection);
		Ok(Self { handle })
	}
}

fn netlink_err(e: rtnetlink::Error) -> TunnelError {
	TunnelError::Netlink(e.to_string())
}

#[async_trait]
impl NetworkManager for NetlinkManager {
	async fn link_index(&self, name: &str) -> Result<u32> {
		let mut links = self.handle.link().get().match_name(name.to_string()).execute();
		match links.try_next().await.map_err(netlink_err)? {
			Some(link) => Ok(link.header.index),
			None => Err(TunnelError::Netlink(format!("interface {name} not found"))),
		}
	}

	async fn set_mtu(&self, index: u32, mtu: u32) -> Result<()> {
		self.handle
			.link()
			.set(index)
			.mtu(mtu)
			.execute()
			.await
			.map_err(netlink_err)
	}

	async fn flush_addresses(&self, index: u32) -> Result<()> {
		let mut addresses = self
			.handle
			.address()
			.get()
			.set_link_index_filter(index)
			.execute();

		while let Some(message) = addresses.try_next().await.map_err(netlink_err)? {
			self.handle
				.address()
				.del(message)
				.execute()
				.await
				.map_err(netlink_err)?;
		}
		Ok(())
	}

	async fn add_address(&self, index: u32, address: IpNet) -> Result<()> {
		debug!(index, %address, "adding address");
		self.handle
			.address()
			.add(index, address.addr(), address.prefix_len())
			.execute()
			.await
			.map_err(netlink_err)
	}

	async fn add_route(&self, index: u32, destination: IpNet) -> Result<()> {
		debug!(index, %destination, "adding route");
		match destination {
			IpNet::V4(net) => {
				self.handle
					.route()
					.add()
					.v4()
					.destination_prefix(net.network(), net.prefix_len())
					.output_interface(index)
					.replace()
					.execute()
					.await
			}
			IpNet::V6(net) => {
				self.handle
					.route()
					.add()
					.v6()
					.destination_prefix(net.network(), net.prefix_len())
					.output_interface(index)
					.replace()
					.execute()
					.await
			}
		}
		.map_err(netlink_err)
	}

	async fn del_route(&self, index: u32, destination: IpNet) -> Result<()> {
		debug!(index, %destination, "deleting route");
		let message = match destination {
			IpNet::V4(net) => {
				let mut request = self
					.handle
					.route()
					.add()
					.v4()
					.destination_prefix(net.network(), net.prefix_len())
					.output_interface(index);
				request.message_mut().clone()
			}
			IpNet::V6(net) => {
				let mut request = self
					.handle
					.route()
					.add()
					.v6()
					.destination_prefix(net.network(), net.prefix_len())
					.output_interface(index);
				request.message_mut().clone()
			}
		};

		self.handle
			.route()
			.del(message)
			.execute()
			.await
			.map_err(netlink_err)
	}

	async fn set_link_up(&self, index: u32) -> Result<()> {
		self.handle
			.link()
			.set(index)
			.up()
			.execute()
			.await
			.map_err(netlink_err)
	}
}
