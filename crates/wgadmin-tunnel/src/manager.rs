// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use ipnet::IpNet;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::config::{Device, DeviceConfig};
use crate::error::{Result, TunnelError};
use crate::platform::{NetworkManager, TunDriver, TunInterface, TunnelEngine};

pub const DEFAULT_PREFIX: &str = "wgadm";
pub const DEFAULT_MTU: u32 = 1420;

struct ManagedDevice {
	tun: Box<dyn TunInterface>,
	engine: Box<dyn TunnelEngine>,
	device: Device,
	routes: BTreeSet<IpNet>,
}

/// Owns every live tunnel, keyed by logical device id.
///
/// The device map lock is held across kernel I/O so operations on the same
/// manager never interleave.
pub struct TunnelManager {
	driver: Arc<dyn TunDriver>,
	network: Arc<dyn NetworkManager>,
	prefix: String,
	mtu: u32,
	seq: AtomicU32,
	devices: Mutex<HashMap<String, ManagedDevice>>,
}

impl TunnelManager {
	pub fn new(
		driver: Arc<dyn TunDriver>,
		network: Arc<dyn NetworkManager>,
		prefix: impl Into<String>,
		mtu: u32,
	) -> Self {
		Self {
			driver,
			network,
			prefix: prefix.into(),
			mtu,
			seq: AtomicU32::new(0),
			devices: Mutex::new(HashMap::new()),
		}
	}

	fn next_interface_name(&self) -> String {
		format!("{}{}", self.prefix, self.seq.fetch_add(1, Ordering::Relaxed))
	}

	/// Creates an interface for `id` and applies `config` to it.
	#[instrument(skip(self, config), fields(%id, peers = config.peers.len()))]
	pub async fn up(&self, id: &str, config: DeviceConfig) -> Result<Device> {
		let mut devices = self.devices.lock().await;
		if devices.contains_key(id) {
			return Err(TunnelError::AlreadyExists(id.to_string()));
		}

		let name = self.next_interface_name();
		let tun = self.driver.create(&name).await?;
		let engine = match self.driver.attach(tun.as_ref()).await {
			Ok(engine) => engine,
			Err(e) => {
				close_tun(tun).await;
				return Err(e);
			}
		};

		let applied = async {
			let index = self.network.link_index(&name).await?;
			self.network.set_mtu(index, self.mtu).await?;
			let mut routes = BTreeSet::new();
			self.apply(index, engine.as_ref(), &config, &mut routes).await?;
			Ok::<_, TunnelError>((index, routes))
		}
		.await;

		let (index, routes) = match applied {
			Ok(applied) => applied,
			Err(e) => {
				close_engine(engine).await;
				close_tun(tun).await;
				return Err(e);
			}
		};

		let device = Device {
			id: id.to_string(),
			interface: name,
			index,
			config,
		};
		info!(interface = %device.interface, index, "device up");
		devices.insert(
			id.to_string(),
			ManagedDevice {
				tun,
				engine,
				device: device.clone(),
				routes,
			},
		);
		Ok(device)
	}

	/// Tears down the interface of `id`. The device map stays locked until
	/// both closes finish, and the record is dropped even when closing fails.
	#[instrument(skip(self), fields(%id))]
	pub async fn down(&self, id: &str) -> Result<()> {
		let mut devices = self.devices.lock().await;
		let managed = devices
			.remove(id)
			.ok_or_else(|| TunnelError::NotExist(id.to_string()))?;

		let interface = managed.device.interface.clone();
		let engine_result = managed.engine.close().await;
		let tun_result = managed.tun.close().await;
		info!(%interface, "device down");
		drop(devices);
		engine_result.and(tun_result)
	}

	/// Applies `mutator` to the current config of `id` and re-applies the
	/// result to the existing interface.
	///
	/// If applying fails partway the previous config is applied again and the
	/// record keeps it. Installed routes are tracked through both passes.
	#[instrument(skip(self, mutator), fields(%id))]
	pub async fn configure<F>(&self, id: &str, mutator: F) -> Result<Device>
	where
		F: FnOnce(&mut DeviceConfig) -> Result<()> + Send,
	{
		let mut devices = self.devices.lock().await;
		let managed = devices
			.get_mut(id)
			.ok_or_else(|| TunnelError::NotExist(id.to_string()))?;

		let mut config = managed.device.config.clone();
		mutator(&mut config)?;

		let index = managed.device.index;
		let engine = managed.engine.as_ref();
		if let Err(e) = self.apply(index, engine, &config, &mut managed.routes).await {
			warn!(error = %e, "configure failed, restoring previous config");
			let previous = managed.device.config.clone();
			let restored = self
				.apply(index, engine, &previous, &mut managed.routes)
				.await;
			if let Err(restore) = restored {
				warn!(error = %restore, "failed to restore previous config");
			}
			return Err(e);
		}

		managed.device.config = config;
		Ok(managed.device.clone())
	}

	pub async fn devices(&self) -> Vec<Device> {
		let devices = self.devices.lock().await;
		devices.values().map(|managed| managed.device.clone()).collect()
	}

	pub async fn device(&self, id: &str) -> Option<Device> {
		let devices = self.devices.lock().await;
		devices.get(id).map(|managed| managed.device.clone())
	}

	/// Brings every device down. Failures are logged and do not stop the
	/// remaining teardowns.
	pub async fn shutdown(&self) {
		let ids: Vec<String> = self.devices.lock().await.keys().cloned().collect();
		for id in ids {
			if let Err(e) = self.down(&id).await {
				warn!(%id, error = %e, "failed to bring device down during shutdown");
			}
		}
	}

	/// Applies addresses, keys, peers and routes, in that order. Routes in
	/// `installed` that are no longer wanted are deleted.
	///
	/// `installed` tracks every route added or deleted, including when a
	/// later step fails. Stale routes that could not be deleted stay in it.
	async fn apply(
		&self,
		index: u32,
		engine: &dyn TunnelEngine,
		config: &DeviceConfig,
		installed: &mut BTreeSet<IpNet>,
	) -> Result<()> {
		self.network.flush_addresses(index).await?;
		if let Some(address) = config.address {
			self.network.add_address(index, address).await?;
		}

		engine.set_private_key(&config.private_key).await?;
		engine.set_listen_port(config.listen_port).await?;
		engine.replace_peers(&config.peers).await?;

		// Linux refuses routes through a link that is down.
		self.network.set_link_up(index).await?;

		for peer in &config.peers {
			for net in &peer.allowed_ips {
				if net.prefix_len() == 0 {
					warn!(index, peer = %peer.public_key, %net, "skipping default route");
				}
			}
		}

		let wanted = config.routes();
		for route in &wanted {
			self.network.add_route(index, *route).await?;
			installed.insert(*route);
		}
		let stale: Vec<IpNet> = installed.difference(&wanted).copied().collect();
		for route in stale {
			match self.network.del_route(index, route).await {
				Ok(()) => {
					installed.remove(&route);
				}
				Err(e) => warn!(index, %route, error = %e, "failed to delete stale route"),
			}
		}

		Ok(())
	}
}

async fn close_engine(engine: Box<dyn TunnelEngine>) {
	if let Err(e) = engine.close().await {
		warn!(error = %e, "failed to close tunnel engine");
	}
}

async fn close_tun(tun: Box<dyn TunInterface>) {
	let name = tun.name().to_string();
	if let Err(e) = tun.close().await {
		warn!(interface = %name, error = %e, "failed to close TUN interface");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::PeerConfig;
	use crate::testing::FakePlatform;
	use wgadmin_common::{KeyPair, PrivateKey};

	fn manager(platform: &FakePlatform) -> TunnelManager {
		TunnelManager::new(
			Arc::new(platform.clone()),
			Arc::new(platform.clone()),
			"wgt",
			DEFAULT_MTU,
		)
	}

	fn peer(allowed: &[&str]) -> PeerConfig {
		let mut peer = PeerConfig::new(*KeyPair::generate().public_key());
		peer.allowed_ips = allowed.iter().map(|s| s.parse().unwrap()).collect();
		peer
	}

	fn config(peers: Vec<PeerConfig>) -> DeviceConfig {
		let mut config = DeviceConfig::new(PrivateKey::generate());
		config.listen_port = 51820;
		config.address = Some("10.0.0.1/24".parse().unwrap());
		config.peers = peers;
		config
	}

	fn nets(items: &[&str]) -> Vec<IpNet> {
		items.iter().map(|s| s.parse().unwrap()).collect()
	}

	#[tokio::test]
	async fn up_applies_full_config() {
		let platform = FakePlatform::new();
		let manager = manager(&platform);
		let cfg = config(vec![peer(&["10.0.0.2/32"]), peer(&["10.1.0.0/16", "fd00::5/64"])]);

		let device = manager.up("dev-a", cfg.clone()).await.unwrap();

		assert_eq!(device.id, "dev-a");
		assert_eq!(device.interface, "wgt0");
		assert_eq!(device.config, cfg);

		let state = platform.interface("wgt0").unwrap();
		assert!(state.up);
		assert_eq!(state.mtu, DEFAULT_MTU);
		assert_eq!(state.addresses, nets(&["10.0.0.1/24"]));
		assert_eq!(state.private_key, Some(cfg.private_key.clone()));
		assert_eq!(state.listen_port, 51820);
		assert_eq!(state.peers, cfg.peers);
		assert_eq!(
			state.routes.into_iter().collect::<Vec<_>>(),
			nets(&["10.0.0.2/32", "10.1.0.0/16", "fd00::/64"])
		);
		assert_eq!(manager.device("dev-a").await, Some(device));
	}

	#[tokio::test]
	async fn up_without_address() {
		let platform = FakePlatform::new();
		let manager = manager(&platform);
		let mut cfg = config(Vec::new());
		cfg.address = None;

		let device = manager.up("dev-a", cfg).await.unwrap();

		assert_eq!(device.config.address, None);
		let state = platform.interface(&device.interface).unwrap();
		assert!(state.addresses.is_empty());
		assert!(state.up);
	}

	#[tokio::test]
	async fn second_up_is_rejected_and_first_untouched() {
		let platform = FakePlatform::new();
		let manager = manager(&platform);
		let first = manager.up("dev-a", config(vec![peer(&["10.0.0.2/32"])])).await.unwrap();

		let err = manager.up("dev-a", config(Vec::new())).await.unwrap_err();
		assert!(matches!(err, TunnelError::AlreadyExists(ref id) if id == "dev-a"), "got {err:?}");

		assert_eq!(manager.devices().await, vec![first.clone()]);
		assert_eq!(platform.open_interfaces(), vec![first.interface.clone()]);
		let state = platform.interface(&first.interface).unwrap();
		assert_eq!(state.peers, first.config.peers);
	}

	#[tokio::test]
	async fn down_unknown_is_not_exist() {
		let platform = FakePlatform::new();
		let manager = manager(&platform);

		let err = manager.down("ghost").await.unwrap_err();
		assert!(matches!(err, TunnelError::NotExist(ref id) if id == "ghost"));
		assert!(platform.events().is_empty());
	}

	#[tokio::test]
	async fn down_closes_engine_then_tun() {
		let platform = FakePlatform::new();
		let manager = manager(&platform);
		let device = manager.up("dev-a", config(Vec::new())).await.unwrap();

		manager.down("dev-a").await.unwrap();

		assert!(manager.devices().await.is_empty());
		assert!(platform.open_interfaces().is_empty());
		let events = platform.events();
		let tail = &events[events.len() - 2..];
		assert_eq!(
			tail,
			[
				format!("close engine {}", device.interface),
				format!("close tun {}", device.interface)
			]
		);

		let err = manager.down("dev-a").await.unwrap_err();
		assert!(matches!(err, TunnelError::NotExist(_)));
	}

	#[tokio::test]
	async fn down_forgets_device_even_when_close_fails() {
		let platform = FakePlatform::new();
		let manager = manager(&platform);
		manager.up("dev-a", config(Vec::new())).await.unwrap();

		platform.fail_step(Some("close engine"));
		let err = manager.down("dev-a").await.unwrap_err();
		assert!(matches!(err, TunnelError::Engine(_)));

		assert!(manager.device("dev-a").await.is_none());
		assert!(platform.open_interfaces().is_empty());
	}

	#[tokio::test]
	async fn failed_apply_rolls_back() {
		let platform = FakePlatform::new();
		let manager = manager(&platform);
		platform.fail_step(Some("replace peers"));

		let err = manager
			.up("dev-a", config(vec![peer(&["10.0.0.2/32"])]))
			.await
			.unwrap_err();
		assert!(matches!(err, TunnelError::Engine(_)), "got {err:?}");

		assert!(manager.devices().await.is_empty());
		assert!(platform.open_interfaces().is_empty());
		let events = platform.events();
		assert!(events.contains(&"close engine wgt0".to_string()));
		assert_eq!(events.last().map(String::as_str), Some("close tun wgt0"));
	}

	#[tokio::test]
	async fn failed_create_leaves_nothing() {
		let platform = FakePlatform::new();
		let manager = manager(&platform);
		platform.fail_create(true);

		let err = manager.up("dev-a", config(Vec::new())).await.unwrap_err();
		assert!(matches!(err, TunnelError::TunCreation(_)));
		assert!(manager.devices().await.is_empty());

		platform.fail_create(false);
		let device = manager.up("dev-a", config(Vec::new())).await.unwrap();
		assert_eq!(device.interface, "wgt1");
	}

	#[tokio::test]
	async fn default_route_is_skipped() {
		let platform = FakePlatform::new();
		let manager = manager(&platform);
		let cfg = config(vec![peer(&["0.0.0.0/0", "::/0", "10.9.0.0/24"])]);

		let device = manager.up("dev-a", cfg.clone()).await.unwrap();

		let state = platform.interface(&device.interface).unwrap();
		assert_eq!(state.routes.into_iter().collect::<Vec<_>>(), nets(&["10.9.0.0/24"]));
		// The engine still sees the full allowed-IP set.
		assert_eq!(state.peers, cfg.peers);
	}

	#[tokio::test]
	async fn configure_reapplies_and_drops_stale_routes() {
		let platform = FakePlatform::new();
		let manager = manager(&platform);
		let device = manager
			.up("dev-a", config(vec![peer(&["10.0.0.2/32"]), peer(&["10.0.0.3/32"])]))
			.await
			.unwrap();

		let replacement = peer(&["10.0.0.4/32"]);
		let expected = replacement.clone();
		let updated = manager
			.configure("dev-a", move |cfg| {
				cfg.listen_port = 40000;
				cfg.address = Some("10.0.0.9/24".parse().unwrap());
				cfg.peers = vec![replacement];
				Ok(())
			})
			.await
			.unwrap();

		assert_eq!(updated.interface, device.interface);
		assert_eq!(updated.config.listen_port, 40000);
		assert_eq!(updated.config.peers, vec![expected.clone()]);

		let state = platform.interface(&device.interface).unwrap();
		assert_eq!(state.listen_port, 40000);
		assert_eq!(state.addresses, nets(&["10.0.0.9/24"]));
		assert_eq!(state.peers, vec![expected]);
		assert_eq!(state.routes.into_iter().collect::<Vec<_>>(), nets(&["10.0.0.4/32"]));
		assert_eq!(manager.device("dev-a").await, Some(updated));
	}

	#[tokio::test]
	async fn configure_mutator_error_changes_nothing() {
		let platform = FakePlatform::new();
		let manager = manager(&platform);
		let device = manager.up("dev-a", config(Vec::new())).await.unwrap();
		let before = platform.events().len();

		let err = manager
			.configure("dev-a", |cfg| {
				cfg.listen_port = 1;
				Err(TunnelError::Engine("rejected".into()))
			})
			.await
			.unwrap_err();
		assert!(matches!(err, TunnelError::Engine(_)));

		assert_eq!(platform.events().len(), before);
		assert_eq!(manager.device("dev-a").await, Some(device));
	}

	#[tokio::test]
	async fn configure_unknown_is_not_exist() {
		let platform = FakePlatform::new();
		let manager = manager(&platform);
		let err = manager.configure("ghost", |_| Ok(())).await.unwrap_err();
		assert!(matches!(err, TunnelError::NotExist(_)));
	}

	#[tokio::test]
	async fn failed_configure_keeps_previous_record() {
		let platform = FakePlatform::new();
		let manager = manager(&platform);
		let device = manager.up("dev-a", config(Vec::new())).await.unwrap();

		platform.fail_step(Some("set port"));
		let err = manager
			.configure("dev-a", |cfg| {
				cfg.listen_port = 40000;
				Ok(())
			})
			.await
			.unwrap_err();
		assert!(matches!(err, TunnelError::Engine(_)));
		assert_eq!(manager.device("dev-a").await, Some(device.clone()));

		let state = platform.interface(&device.interface).unwrap();
		assert_eq!(state.listen_port, device.config.listen_port);
		assert_eq!(state.peers, device.config.peers);
	}

	#[tokio::test]
	async fn failed_configure_restores_previous_config() {
		let platform = FakePlatform::new();
		let manager = manager(&platform);
		let mut cfg = config(Vec::new());
		cfg.listen_port = 1000;
		let device = manager.up("dev-a", cfg).await.unwrap();

		platform.fail_step(Some("add route"));
		let err = manager
			.configure("dev-a", |cfg| {
				cfg.listen_port = 2000;
				cfg.peers = vec![peer(&["10.0.0.2/32"])];
				Ok(())
			})
			.await
			.unwrap_err();
		assert!(matches!(err, TunnelError::Netlink(_)), "got {err:?}");

		let current = manager.device("dev-a").await.unwrap();
		assert_eq!(current, device);
		let state = platform.interface(&device.interface).unwrap();
		assert_eq!(state.listen_port, 1000);
		assert!(state.peers.is_empty());
		assert!(state.routes.is_empty());
	}

	#[tokio::test]
	async fn failed_configure_still_tracks_routes() {
		let platform = FakePlatform::new();
		let manager = manager(&platform);
		let device = manager
			.up("dev-a", config(vec![peer(&["10.0.0.2/32"])]))
			.await
			.unwrap();

		platform.fail_step(Some("del route"));
		manager
			.configure("dev-a", |cfg| {
				cfg.peers = vec![peer(&["10.0.0.3/32"])];
				Ok(())
			})
			.await
			.unwrap();
		let state = platform.interface(&device.interface).unwrap();
		assert_eq!(
			state.routes.into_iter().collect::<Vec<_>>(),
			nets(&["10.0.0.2/32", "10.0.0.3/32"])
		);

		// The route that could not be deleted is retried on the next apply.
		platform.fail_step(None);
		manager.configure("dev-a", |_| Ok(())).await.unwrap();
		let state = platform.interface(&device.interface).unwrap();
		assert_eq!(state.routes.into_iter().collect::<Vec<_>>(), nets(&["10.0.0.3/32"]));
	}

	#[tokio::test]
	async fn failed_flush_rolls_back_up() {
		let platform = FakePlatform::new();
		let manager = manager(&platform);
		platform.fail_step(Some("flush"));

		let err = manager.up("dev-a", config(Vec::new())).await.unwrap_err();
		assert!(matches!(err, TunnelError::Netlink(_)), "got {err:?}");
		assert!(manager.devices().await.is_empty());
		assert!(platform.open_interfaces().is_empty());
	}

	#[tokio::test]
	async fn up_waits_for_down_of_same_device() {
		let platform = FakePlatform::new();
		let manager = Arc::new(manager(&platform));
		manager.up("dev-a", config(Vec::new())).await.unwrap();

		let gate = platform.gate_tun_close();
		let down = tokio::spawn({
			let manager = manager.clone();
			async move { manager.down("dev-a").await }
		});
		gate.entered().await;

		let up = tokio::spawn({
			let manager = manager.clone();
			async move { manager.up("dev-a", config(Vec::new())).await }
		});
		for _ in 0..10 {
			tokio::task::yield_now().await;
		}
		assert!(!up.is_finished());
		assert_eq!(platform.open_interfaces(), vec!["wgt0".to_string()]);

		gate.release();
		down.await.unwrap().unwrap();
		let device = up.await.unwrap().unwrap();

		assert_eq!(device.interface, "wgt1");
		assert_eq!(platform.open_interfaces(), vec!["wgt1".to_string()]);
		assert_eq!(manager.devices().await, vec![device]);
	}

	#[tokio::test]
	async fn shutdown_downs_everything() {
		let platform = FakePlatform::new();
		let manager = manager(&platform);
		manager.up("dev-a", config(Vec::new())).await.unwrap();
		manager.up("dev-b", config(Vec::new())).await.unwrap();

		manager.shutdown().await;

		assert!(manager.devices().await.is_empty());
		assert!(platform.open_interfaces().is_empty());
	}
}
