// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! A [`Repository`] view over the live WireGuard state.
//!
//! Device names are interface names. Writes go straight to the running
//! engines and persist nothing. Creating and destroying interfaces belongs to
//! [`TunnelManager`](crate::TunnelManager), so the device-set operations are
//! unsupported here.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use wgadmin_common::{sort_and_paginate, DeviceInfo, PeerInfo, PeerOrder, PublicKey};
use wgadmin_repo::{ChangeNotification, ChangeNotifier, PeerPage, RepoError, Repository};

use crate::config::PeerConfig;
use crate::error::{Result, TunnelError};
use crate::uapi::{LiveDevice, PeerUpdate, SetRequest};

#[cfg(unix)]
pub use uapi_control::UapiControlPlane;

/// Read and write access to running WireGuard interfaces.
#[async_trait]
pub trait ControlPlane: Send + Sync {
	async fn interfaces(&self) -> Result<Vec<String>>;

	async fn get(&self, interface: &str) -> Result<LiveDevice>;

	async fn set(&self, interface: &str, request: &SetRequest) -> Result<()>;
}

#[cfg(unix)]
mod uapi_control {
	use async_trait::async_trait;
	use std::io::ErrorKind;
	use std::path::{Path, PathBuf};

	use super::ControlPlane;
	use crate::error::Result;
	use crate::uapi::{LiveDevice, SetRequest, UapiClient};

	/// Discovers interfaces by their `<name>.sock` UAPI sockets.
	#[derive(Debug, Clone)]
	pub struct UapiControlPlane {
		socket_dir: PathBuf,
	}

	impl UapiControlPlane {
		pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
			Self {
				socket_dir: socket_dir.into(),
			}
		}

		pub fn socket_dir(&self) -> &Path {
			&self.socket_dir
		}

		fn client(&self, interface: &str) -> UapiClient {
			UapiClient::for_interface(&self.socket_dir, interface)
		}
	}

	#[async_trait]
	impl ControlPlane for UapiControlPlane {
		async fn interfaces(&self) -> Result<Vec<String>> {
			let mut entries = match tokio::fs::read_dir(&self.socket_dir).await {
				Ok(entries) => entries,
				Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
				Err(e) => return Err(e.into()),
			};

			let mut names = Vec::new();
			while let Some(entry) = entries.next_entry().await? {
				let file_name = entry.file_name();
				if let Some(name) = file_name.to_str().and_then(|n| n.strip_suffix(".sock")) {
					names.push(name.to_string());
				}
			}
			names.sort();
			Ok(names)
		}

		async fn get(&self, interface: &str) -> Result<LiveDevice> {
			self.client(interface).get().await
		}

		async fn set(&self, interface: &str, request: &SetRequest) -> Result<()> {
			self.client(interface).set(request).await
		}
	}
}

fn repo_error(e: TunnelError) -> RepoError {
	match e {
		TunnelError::NotExist(name) => RepoError::NotFound(format!("device {name}")),
		TunnelError::Key(e) => RepoError::InvalidInput(e.to_string()),
		other => RepoError::ControlPlane(other.to_string()),
	}
}

fn device_info(live: LiveDevice) -> Option<DeviceInfo> {
	let LiveDevice {
		interface,
		private_key,
		listen_port,
		..
	} = live;
	match private_key {
		Some(key) => Some(DeviceInfo::new(interface, key).with_listen_port(listen_port)),
		None => {
			debug!(%interface, "skipping interface without a private key");
			None
		}
	}
}

fn peer_infos(live: &LiveDevice) -> impl Iterator<Item = PeerInfo> + '_ {
	live.peers.iter().map(|peer| {
		let config = &peer.config;
		PeerInfo {
			device: live.interface.clone(),
			public_key: config.public_key,
			preshared_key: config.preshared_key.clone(),
			endpoint: config.endpoint,
			allowed_ips: config.allowed_ips.clone(),
			persistent_keepalive_interval: config.persistent_keepalive_interval,
			last_handshake: peer.last_handshake,
			name: String::new(),
		}
	})
}

pub struct KernelRepository<C> {
	control: C,
	notifier: ChangeNotifier,
}

impl<C: ControlPlane> KernelRepository<C> {
	pub fn new(control: C) -> Self {
		Self {
			control,
			notifier: ChangeNotifier::new(),
		}
	}

	pub fn control(&self) -> &C {
		&self.control
	}

	async fn live(&self, interface: &str) -> wgadmin_repo::Result<LiveDevice> {
		self.control.get(interface).await.map_err(repo_error)
	}

	async fn live_all(&self) -> wgadmin_repo::Result<Vec<LiveDevice>> {
		let names = self.control.interfaces().await.map_err(repo_error)?;
		let mut devices = Vec::with_capacity(names.len());
		for name in names {
			match self.control.get(&name).await {
				Ok(device) => devices.push(device),
				// Interface vanished between listing and reading.
				Err(TunnelError::NotExist(_)) => continue,
				Err(e) => return Err(repo_error(e)),
			}
		}
		Ok(devices)
	}

	async fn set(&self, interface: &str, request: &SetRequest) -> wgadmin_repo::Result<()> {
		self.control.set(interface, request).await.map_err(repo_error)
	}

	/// Validates `peers` for `device` and checks the interface exists.
	async fn checked_peer_configs(
		&self,
		device: &str,
		peers: &[PeerInfo],
	) -> wgadmin_repo::Result<Vec<PeerConfig>> {
		for peer in peers {
			peer.validate_for(device)?;
		}
		self.live(device).await?;
		Ok(peers.iter().map(PeerConfig::from).collect())
	}

	#[instrument(skip(self))]
	pub async fn list_devices(&self) -> wgadmin_repo::Result<Vec<DeviceInfo>> {
		let live = self.live_all().await?;
		Ok(live.into_iter().filter_map(device_info).collect())
	}

	#[instrument(skip(self, devices), fields(count = devices.len()))]
	pub async fn update_devices(&self, devices: &[DeviceInfo]) -> wgadmin_repo::Result<()> {
		for device in devices {
			device.validate()?;
		}
		for device in devices {
			self.live(&device.name).await?;
		}
		for device in devices {
			let request = SetRequest {
				private_key: Some(device.private_key.clone()),
				listen_port: Some(device.listen_port),
				..SetRequest::default()
			};
			self.set(&device.name, &request).await?;
		}
		self.notifier.notify_change();
		Ok(())
	}

	pub async fn replace_all_devices(&self, _devices: &[DeviceInfo]) -> wgadmin_repo::Result<()> {
		Err(RepoError::Unsupported(
			"replacing the live device set".to_string(),
		))
	}

	pub async fn remove_devices(&self, _names: &[String]) -> wgadmin_repo::Result<()> {
		Err(RepoError::Unsupported("removing live devices".to_string()))
	}

	#[instrument(skip(self))]
	pub async fn list_peers(
		&self,
		order: PeerOrder,
		offset: usize,
		limit: usize,
	) -> wgadmin_repo::Result<PeerPage> {
		let live = self.live_all().await?;
		let peers = live.iter().flat_map(peer_infos).collect();
		Ok(sort_and_paginate(peers, order, offset, limit))
	}

	#[instrument(skip(self, devices), fields(count = devices.len()))]
	pub async fn list_peers_by_devices(
		&self,
		devices: &[String],
		order: PeerOrder,
		offset: usize,
		limit: usize,
	) -> wgadmin_repo::Result<PeerPage> {
		let mut peers = Vec::new();
		for device in devices {
			match self.control.get(device).await {
				Ok(live) => peers.extend(peer_infos(&live)),
				Err(TunnelError::NotExist(_)) => continue,
				Err(e) => return Err(repo_error(e)),
			}
		}
		Ok(sort_and_paginate(peers, order, offset, limit))
	}

	#[instrument(skip(self, keys), fields(%device, count = keys.len()))]
	pub async fn list_peers_by_keys(
		&self,
		device: &str,
		keys: &[PublicKey],
		order: PeerOrder,
		offset: usize,
		limit: usize,
	) -> wgadmin_repo::Result<PeerPage> {
		let peers = match self.control.get(device).await {
			Ok(live) => peer_infos(&live)
				.filter(|peer| keys.contains(&peer.public_key))
				.collect(),
			Err(TunnelError::NotExist(_)) => Vec::new(),
			Err(e) => return Err(repo_error(e)),
		};
		Ok(sort_and_paginate(peers, order, offset, limit))
	}

	#[instrument(skip(self, peers), fields(%device, count = peers.len()))]
	pub async fn update_peers(&self, device: &str, peers: &[PeerInfo]) -> wgadmin_repo::Result<()> {
		let configs = self.checked_peer_configs(device, peers).await?;
		let request = SetRequest {
			peers: configs.into_iter().map(PeerUpdate::upsert).collect(),
			..SetRequest::default()
		};
		self.set(device, &request).await?;
		self.notifier.notify_change();
		Ok(())
	}

	#[instrument(skip(self, peers), fields(%device, count = peers.len()))]
	pub async fn replace_all_peers(&self, device: &str, peers: &[PeerInfo]) -> wgadmin_repo::Result<()> {
		let configs = self.checked_peer_configs(device, peers).await?;
		self.set(device, &SetRequest::replace_peers(&configs)).await?;
		self.notifier.notify_change();
		Ok(())
	}

	#[instrument(skip(self, keys), fields(%device, count = keys.len()))]
	pub async fn remove_peers(&self, device: &str, keys: &[PublicKey]) -> wgadmin_repo::Result<()> {
		let request = SetRequest {
			peers: keys.iter().copied().map(PeerUpdate::remove).collect(),
			..SetRequest::default()
		};
		self.set(device, &request).await?;
		self.notifier.notify_change();
		Ok(())
	}

	pub async fn close(&self) -> wgadmin_repo::Result<()> {
		self.notifier.close();
		Ok(())
	}
}

impl<C: ControlPlane> ChangeNotification for KernelRepository<C> {
	fn add_change_notification(&self, listener: mpsc::Sender<()>) {
		self.notifier.add(listener);
	}

	fn remove_change_notification(&self, listener: &mpsc::Sender<()>) {
		self.notifier.remove(listener);
	}
}

#[async_trait]
impl<C: ControlPlane> Repository for KernelRepository<C> {
	async fn list_devices(&self) -> wgadmin_repo::Result<Vec<DeviceInfo>> {
		KernelRepository::list_devices(self).await
	}

	async fn update_devices(&self, devices: &[DeviceInfo]) -> wgadmin_repo::Result<()> {
		KernelRepository::update_devices(self, devices).await
	}

	async fn replace_all_devices(&self, devices: &[DeviceInfo]) -> wgadmin_repo::Result<()> {
		KernelRepository::replace_all_devices(self, devices).await
	}

	async fn remove_devices(&self, names: &[String]) -> wgadmin_repo::Result<()> {
		KernelRepository::remove_devices(self, names).await
	}

	async fn list_peers(
		&self,
		order: PeerOrder,
		offset: usize,
		limit: usize,
	) -> wgadmin_repo::Result<PeerPage> {
		KernelRepository::list_peers(self, order, offset, limit).await
	}

	async fn list_peers_by_devices(
		&self,
		devices: &[String],
		order: PeerOrder,
		offset: usize,
		limit: usize,
	) -> wgadmin_repo::Result<PeerPage> {
		KernelRepository::list_peers_by_devices(self, devices, order, offset, limit).await
	}

	async fn list_peers_by_keys(
		&self,
		device: &str,
		keys: &[PublicKey],
		order: PeerOrder,
		offset: usize,
		limit: usize,
	) -> wgadmin_repo::Result<PeerPage> {
		KernelRepository::list_peers_by_keys(self, device, keys, order, offset, limit).await
	}

	async fn update_peers(&self, device: &str, peers: &[PeerInfo]) -> wgadmin_repo::Result<()> {
		KernelRepository::update_peers(self, device, peers).await
	}

	async fn replace_all_peers(&self, device: &str, peers: &[PeerInfo]) -> wgadmin_repo::Result<()> {
		KernelRepository::replace_all_peers(self, device, peers).await
	}

	async fn remove_peers(&self, device: &str, keys: &[PublicKey]) -> wgadmin_repo::Result<()> {
		KernelRepository::remove_peers(self, device, keys).await
	}

	async fn close(&self) -> wgadmin_repo::Result<()> {
		KernelRepository::close(self).await
	}
}
