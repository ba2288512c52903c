// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory fakes of the platform traits.
//!
//! [`FakePlatform`] plays both [`TunDriver`] and [`NetworkManager`] and keeps
//! the state each interface would have in the kernel. Every successful call is
//! appended to an event log such as `"set port wgadm0"`. A step can be made to
//! fail with [`FakePlatform::fail_step`] using the event prefix.

use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use wgadmin_common::{PrivateKey, PublicKey};

use crate::config::PeerConfig;
use crate::error::{Result, TunnelError};
use crate::kernel::ControlPlane;
use crate::platform::{NetworkManager, TunDriver, TunInterface, TunnelEngine};
use crate::uapi::{LiveDevice, LivePeer, SetRequest};

/// Kernel-side view of one fake interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeInterface {
	pub index: u32,
	pub up: bool,
	pub mtu: u32,
	pub addresses: Vec<IpNet>,
	pub routes: BTreeSet<IpNet>,
	pub private_key: Option<PrivateKey>,
	pub listen_port: u16,
	pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Default)]
struct PlatformState {
	next_index: u32,
	interfaces: BTreeMap<String, FakeInterface>,
	events: Vec<String>,
	fail_create: bool,
	fail_step: Option<String>,
	close_gate: Option<CloseGate>,
}

/// Holds the next TUN close until [`CloseGate::release`] is called.
#[derive(Debug, Clone, Default)]
pub struct CloseGate {
	entered: Arc<Notify>,
	release: Arc<Notify>,
}

impl CloseGate {
	/// Resolves once a close is waiting on the gate.
	pub async fn entered(&self) {
		self.entered.notified().await;
	}

	pub fn release(&self) {
		self.release.notify_one();
	}

	async fn pass(&self) {
		self.entered.notify_one();
		self.release.notified().await;
	}
}

#[derive(Debug, Clone, Default)]
pub struct FakePlatform {
	inner: Arc<Mutex<PlatformState>>,
}

impl FakePlatform {
	pub fn new() -> Self {
		Self::default()
	}

	fn state(&self) -> MutexGuard<'_, PlatformState> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Makes every following `create` fail with [`TunnelError::TunCreation`].
	pub fn fail_create(&self, fail: bool) {
		self.state().fail_create = fail;
	}

	/// Makes every following call whose event starts with `step` fail.
	pub fn fail_step(&self, step: Option<&str>) {
		self.state().fail_step = step.map(str::to_string);
	}

	/// Gates the next TUN close.
	pub fn gate_tun_close(&self) -> CloseGate {
		let gate = CloseGate::default();
		self.state().close_gate = Some(gate.clone());
		gate
	}

	pub fn events(&self) -> Vec<String> {
		self.state().events.clone()
	}

	pub fn interface(&self, name: &str) -> Option<FakeInterface> {
		self.state().interfaces.get(name).cloned()
	}

	/// Names of interfaces that have not been closed, sorted.
	pub fn open_interfaces(&self) -> Vec<String> {
		self.state().interfaces.keys().cloned().collect()
	}

	/// Runs `apply` against the interface named `name` and records `step`.
	fn with_interface<F>(&self, step: &str, name: &str, apply: F) -> Result<()>
	where
		F: FnOnce(&mut FakeInterface),
	{
		let mut state = self.state();
		let event = format!("{step} {name}");
		check_failure(&state, step, &event)?;
		let iface = state
			.interfaces
			.get_mut(name)
			.ok_or_else(|| TunnelError::NotExist(name.to_string()))?;
		apply(iface);
		state.events.push(event);
		Ok(())
	}

	fn with_index<F>(&self, step: &str, index: u32, apply: F) -> Result<()>
	where
		F: FnOnce(&mut FakeInterface),
	{
		let name = {
			let state = self.state();
			state
				.interfaces
				.iter()
				.find(|(_, iface)| iface.index == index)
				.map(|(name, _)| name.clone())
				.ok_or_else(|| TunnelError::Netlink(format!("no link with index {index}")))?
		};
		self.with_interface(step, &name, apply)
	}
}

fn check_failure(state: &PlatformState, step: &str, event: &str) -> Result<()> {
	match &state.fail_step {
		Some(prefix) if event.starts_with(prefix.as_str()) => {
			let message = format!("injected failure: {event}");
			Err(match step {
				"set key" | "set port" | "replace peers" | "close engine" | "close tun" => {
					TunnelError::Engine(message)
				}
				_ => TunnelError::Netlink(message),
			})
		}
		_ => Ok(()),
	}
}

#[async_trait]
impl TunDriver for FakePlatform {
	async fn create(&self, name: &str) -> Result<Box<dyn TunInterface>> {
		let mut state = self.state();
		if state.fail_create {
			return Err(TunnelError::TunCreation(format!("{name}: injected failure")));
		}
		if state.interfaces.contains_key(name) {
			return Err(TunnelError::TunCreation(format!("{name}: interface exists")));
		}
		state.next_index += 1;
		let index = state.next_index;
		state.interfaces.insert(
			name.to_string(),
			FakeInterface {
				index,
				..FakeInterface::default()
			},
		);
		state.events.push(format!("create {name}"));
		Ok(Box::new(FakeTun {
			platform: self.clone(),
			name: name.to_string(),
		}))
	}

	async fn attach(&self, tun: &dyn TunInterface) -> Result<Box<dyn TunnelEngine>> {
		self.with_interface("attach", tun.name(), |_| {})?;
		Ok(Box::new(FakeEngine {
			platform: self.clone(),
			interface: tun.name().to_string(),
		}))
	}
}

#[async_trait]
impl NetworkManager for FakePlatform {
	async fn link_index(&self, name: &str) -> Result<u32> {
		let mut index = 0;
		self.with_interface("link index", name, |iface| index = iface.index)?;
		Ok(index)
	}

	async fn set_mtu(&self, index: u32, mtu: u32) -> Result<()> {
		self.with_index("set mtu", index, |iface| iface.mtu = mtu)
	}

	async fn flush_addresses(&self, index: u32) -> Result<()> {
		self.with_index("flush", index, |iface| iface.addresses.clear())
	}

	async fn add_address(&self, index: u32, address: IpNet) -> Result<()> {
		self.with_index("add address", index, |iface| iface.addresses.push(address))
	}

	async fn add_route(&self, index: u32, destination: IpNet) -> Result<()> {
		self.with_index("add route", index, |iface| {
			iface.routes.insert(destination);
		})
	}

	async fn del_route(&self, index: u32, destination: IpNet) -> Result<()> {
		self.with_index("del route", index, |iface| {
			iface.routes.remove(&destination);
		})
	}

	async fn set_link_up(&self, index: u32) -> Result<()> {
		self.with_index("link up", index, |iface| iface.up = true)
	}
}

struct FakeTun {
	platform: FakePlatform,
	name: String,
}

#[async_trait]
impl TunInterface for FakeTun {
	fn name(&self) -> &str {
		&self.name
	}

	async fn close(self: Box<Self>) -> Result<()> {
		let gate = self.platform.state().close_gate.take();
		if let Some(gate) = gate {
			gate.pass().await;
		}

		let mut state = self.platform.state();
		let event = format!("close tun {}", self.name);
		// The interface is gone whatever the outcome.
		state.interfaces.remove(&self.name);
		check_failure(&state, "close tun", &event)?;
		state.events.push(event);
		Ok(())
	}
}

struct FakeEngine {
	platform: FakePlatform,
	interface: String,
}

#[async_trait]
impl TunnelEngine for FakeEngine {
	async fn set_private_key(&self, key: &PrivateKey) -> Result<()> {
		self.platform.with_interface("set key", &self.interface, |iface| {
			iface.private_key = Some(key.clone());
		})
	}

	async fn set_listen_port(&self, port: u16) -> Result<()> {
		self.platform
			.with_interface("set port", &self.interface, |iface| iface.listen_port = port)
	}

	async fn replace_peers(&self, peers: &[PeerConfig]) -> Result<()> {
		self.platform
			.with_interface("replace peers", &self.interface, |iface| {
				iface.peers = peers.to_vec();
			})
	}

	async fn close(self: Box<Self>) -> Result<()> {
		let mut state = self.platform.state();
		let event = format!("close engine {}", self.interface);
		check_failure(&state, "close engine", &event)?;
		state.events.push(event);
		Ok(())
	}
}

/// [`ControlPlane`] over a map of live devices, applying set requests the
/// way a WireGuard engine does.
#[derive(Debug, Clone, Default)]
pub struct FakeControlPlane {
	devices: Arc<Mutex<BTreeMap<String, LiveDevice>>>,
}

impl FakeControlPlane {
	pub fn new() -> Self {
		Self::default()
	}

	fn devices(&self) -> MutexGuard<'_, BTreeMap<String, LiveDevice>> {
		self.devices.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn insert(&self, device: LiveDevice) {
		self.devices().insert(device.interface.clone(), device);
	}

	pub fn device(&self, interface: &str) -> Option<LiveDevice> {
		self.devices().get(interface).cloned()
	}

	/// Overwrites the observed handshake of one peer.
	pub fn set_handshake(
		&self,
		interface: &str,
		peer: &PublicKey,
		at: chrono::DateTime<chrono::Utc>,
	) {
		if let Some(device) = self.devices().get_mut(interface) {
			for live in &mut device.peers {
				if live.config.public_key == *peer {
					live.last_handshake = Some(at);
				}
			}
		}
	}
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
	async fn interfaces(&self) -> Result<Vec<String>> {
		Ok(self.devices().keys().cloned().collect())
	}

	async fn get(&self, interface: &str) -> Result<LiveDevice> {
		self.device(interface)
			.ok_or_else(|| TunnelError::NotExist(interface.to_string()))
	}

	async fn set(&self, interface: &str, request: &SetRequest) -> Result<()> {
		let mut devices = self.devices();
		let device = devices
			.get_mut(interface)
			.ok_or_else(|| TunnelError::NotExist(interface.to_string()))?;

		if let Some(key) = &request.private_key {
			device.private_key = Some(key.clone());
		}
		if let Some(port) = request.listen_port {
			device.listen_port = port;
		}
		if request.replace_peers {
			device.peers.clear();
		}
		for update in &request.peers {
			let key = update.config.public_key;
			let existing = device.peers.iter().position(|p| p.config.public_key == key);
			match (update.remove, existing) {
				(true, Some(at)) => {
					device.peers.remove(at);
				}
				(true, None) => {}
				(false, Some(at)) => device.peers[at].config = update.config.clone(),
				(false, None) => device.peers.push(LivePeer {
					config: update.config.clone(),
					last_handshake: None,
					rx_bytes: 0,
					tx_bytes: 0,
				}),
			}
		}
		Ok(())
	}
}
