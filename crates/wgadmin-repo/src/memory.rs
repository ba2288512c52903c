// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Volatile backend.
//!
//! State is a device map behind one mutex, shared with readers as an `Arc`.
//! Readers take a snapshot and release the lock straight away. Writers check
//! all of their input first and only then mutate, copy-on-write, so a failed
//! call leaves the state untouched.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::instrument;
use wgadmin_common::{sort_and_paginate, DeviceInfo, PeerInfo, PeerOrder, PublicKey};

use crate::error::{RepoError, Result};
use crate::notify::ChangeNotifier;
use crate::repository::{ChangeNotification, PeerPage, Repository};

#[derive(Debug, Clone)]
struct MemDevice {
	info: DeviceInfo,
	peers: HashMap<PublicKey, PeerInfo>,
}

type DeviceMap = HashMap<String, MemDevice>;

#[derive(Debug, Default)]
pub struct MemoryRepository {
	state: Mutex<Arc<DeviceMap>>,
	notifier: ChangeNotifier,
}

impl MemoryRepository {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> Result<MutexGuard<'_, Arc<DeviceMap>>> {
		self.state
			.lock()
			.map_err(|_| RepoError::Internal("memory repository lock poisoned".to_string()))
	}

	fn snapshot(&self) -> Result<Arc<DeviceMap>> {
		Ok(Arc::clone(&*self.lock()?))
	}

	fn write<F>(&self, apply: F) -> Result<()>
	where
		F: FnOnce(&mut Arc<DeviceMap>) -> Result<()>,
	{
		{
			let mut state = self.lock()?;
			apply(&mut *state)?;
		}
		self.notifier.notify_change();
		Ok(())
	}

	#[instrument(skip(self))]
	pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
		let snapshot = self.snapshot()?;
		let mut devices: Vec<DeviceInfo> = snapshot.values().map(|d| d.info.clone()).collect();
		devices.sort_by(|a, b| a.name.cmp(&b.name));
		Ok(devices)
	}

	#[instrument(skip(self, devices), fields(count = devices.len()))]
	pub async fn update_devices(&self, devices: &[DeviceInfo]) -> Result<()> {
		for device in devices {
			device.validate()?;
		}

		self.write(|state| {
			check_unique_keys(state.values().map(|d| &d.info), devices)?;
			let map = Arc::make_mut(state);
			for device in devices {
				map.entry(device.name.clone())
					.and_modify(|existing| existing.info = device.clone())
					.or_insert_with(|| MemDevice {
						info: device.clone(),
						peers: HashMap::new(),
					});
			}
			Ok(())
		})
	}

	#[instrument(skip(self, devices), fields(count = devices.len()))]
	pub async fn replace_all_devices(&self, devices: &[DeviceInfo]) -> Result<()> {
		for device in devices {
			device.validate()?;
		}
		check_unique_keys(std::iter::empty(), devices)?;

		self.write(|state| {
			let mut next = DeviceMap::with_capacity(devices.len());
			for device in devices {
				let peers = state
					.get(&device.name)
					.map(|existing| existing.peers.clone())
					.unwrap_or_default();
				next.insert(
					device.name.clone(),
					MemDevice {
						info: device.clone(),
						peers,
					},
				);
			}
			*state = Arc::new(next);
			Ok(())
		})
	}

	#[instrument(skip(self, names), fields(count = names.len()))]
	pub async fn remove_devices(&self, names: &[String]) -> Result<()> {
		self.write(|state| {
			let map = Arc::make_mut(state);
			for name in names {
				map.remove(name);
			}
			Ok(())
		})
	}

	#[instrument(skip(self))]
	pub async fn list_peers(&self, order: PeerOrder, offset: usize, limit: usize) -> Result<PeerPage> {
		let snapshot = self.snapshot()?;
		let peers: Vec<PeerInfo> = snapshot
			.values()
			.flat_map(|device| device.peers.values())
			.cloned()
			.collect();
		Ok(sort_and_paginate(peers, order, offset, limit))
	}

	#[instrument(skip(self, devices), fields(count = devices.len()))]
	pub async fn list_peers_by_devices(
		&self,
		devices: &[String],
		order: PeerOrder,
		offset: usize,
		limit: usize,
	) -> Result<PeerPage> {
		let snapshot = self.snapshot()?;
		let wanted: HashSet<&str> = devices.iter().map(String::as_str).collect();
		let peers: Vec<PeerInfo> = wanted
			.into_iter()
			.filter_map(|name| snapshot.get(name))
			.flat_map(|device| device.peers.values())
			.cloned()
			.collect();
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
	) -> Result<PeerPage> {
		let snapshot = self.snapshot()?;
		let peers: Vec<PeerInfo> = match snapshot.get(device) {
			Some(entry) => {
				let wanted: HashSet<&PublicKey> = keys.iter().collect();
				wanted
					.into_iter()
					.filter_map(|key| entry.peers.get(key))
					.cloned()
					.collect()
			}
			None => Vec::new(),
		};
		Ok(sort_and_paginate(peers, order, offset, limit))
	}

	#[instrument(skip(self, peers), fields(%device, count = peers.len()))]
	pub async fn update_peers(&self, device: &str, peers: &[PeerInfo]) -> Result<()> {
		for peer in peers {
			peer.validate_for(device)?;
		}

		self.write(|state| {
			ensure_device(state, device)?;
			let map = Arc::make_mut(state);
			if let Some(entry) = map.get_mut(device) {
				for peer in peers {
					let last_handshake = entry
						.peers
						.get(&peer.public_key)
						.and_then(|existing| existing.last_handshake);
					entry
						.peers
						.insert(peer.public_key, desired_peer(peer, last_handshake));
				}
			}
			Ok(())
		})
	}

	#[instrument(skip(self, peers), fields(%device, count = peers.len()))]
	pub async fn replace_all_peers(&self, device: &str, peers: &[PeerInfo]) -> Result<()> {
		for peer in peers {
			peer.validate_for(device)?;
		}

		self.write(|state| {
			ensure_device(state, device)?;
			let map = Arc::make_mut(state);
			if let Some(entry) = map.get_mut(device) {
				let mut next = HashMap::with_capacity(peers.len());
				for peer in peers {
					let last_handshake = entry
						.peers
						.get(&peer.public_key)
						.and_then(|existing| existing.last_handshake);
					next.insert(peer.public_key, desired_peer(peer, last_handshake));
				}
				entry.peers = next;
			}
			Ok(())
		})
	}

	#[instrument(skip(self, keys), fields(%device, count = keys.len()))]
	pub async fn remove_peers(&self, device: &str, keys: &[PublicKey]) -> Result<()> {
		self.write(|state| {
			ensure_device(state, device)?;
			let map = Arc::make_mut(state);
			if let Some(entry) = map.get_mut(device) {
				for key in keys {
					entry.peers.remove(key);
				}
			}
			Ok(())
		})
	}

	pub async fn close(&self) -> Result<()> {
		self.notifier.close();
		Ok(())
	}
}

fn ensure_device(state: &DeviceMap, device: &str) -> Result<()> {
	if state.contains_key(device) {
		Ok(())
	} else {
		Err(RepoError::NotFound(format!("device {device}")))
	}
}

// The stored last handshake is observed state and survives desired-state writes.
fn desired_peer(peer: &PeerInfo, last_handshake: Option<chrono::DateTime<chrono::Utc>>) -> PeerInfo {
	PeerInfo {
		last_handshake,
		..peer.clone()
	}
}

/// Rejects two differently named devices sharing a derived public key.
fn check_unique_keys<'a>(
	existing: impl Iterator<Item = &'a DeviceInfo>,
	incoming: &[DeviceInfo],
) -> Result<()> {
	let mut owners: HashMap<PublicKey, &str> = HashMap::new();
	let incoming_names: HashSet<&str> = incoming.iter().map(|d| d.name.as_str()).collect();
	for device in existing.filter(|d| !incoming_names.contains(d.name.as_str())) {
		owners.insert(device.public_key(), device.name.as_str());
	}
	for device in incoming {
		let key = device.public_key();
		match owners.get(&key) {
			Some(owner) if *owner != device.name => {
				return Err(RepoError::AlreadyExists(format!(
					"public key {key} is already used by device {owner}"
				)));
			}
			_ => {
				owners.insert(key, device.name.as_str());
			}
		}
	}
	Ok(())
}

impl ChangeNotification for MemoryRepository {
	fn add_change_notification(&self, listener: mpsc::Sender<()>) {
		self.notifier.add(listener);
	}

	fn remove_change_notification(&self, listener: &mpsc::Sender<()>) {
		self.notifier.remove(listener);
	}
}

#[async_trait]
impl Repository for MemoryRepository {
	async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
		self.list_devices().await
	}

	async fn update_devices(&self, devices: &[DeviceInfo]) -> Result<()> {
		self.update_devices(devices).await
	}

	async fn replace_all_devices(&self, devices: &[DeviceInfo]) -> Result<()> {
		self.replace_all_devices(devices).await
	}

	async fn remove_devices(&self, names: &[String]) -> Result<()> {
		self.remove_devices(names).await
	}

	async fn list_peers(&self, order: PeerOrder, offset: usize, limit: usize) -> Result<PeerPage> {
		self.list_peers(order, offset, limit).await
	}

	async fn list_peers_by_devices(
		&self,
		devices: &[String],
		order: PeerOrder,
		offset: usize,
		limit: usize,
	) -> Result<PeerPage> {
		self.list_peers_by_devices(devices, order, offset, limit).await
	}

	async fn list_peers_by_keys(
		&self,
		device: &str,
		keys: &[PublicKey],
		order: PeerOrder,
		offset: usize,
		limit: usize,
	) -> Result<PeerPage> {
		self.list_peers_by_keys(device, keys, order, offset, limit).await
	}

	async fn update_peers(&self, device: &str, peers: &[PeerInfo]) -> Result<()> {
		self.update_peers(device, peers).await
	}

	async fn replace_all_peers(&self, device: &str, peers: &[PeerInfo]) -> Result<()> {
		self.replace_all_peers(device, peers).await
	}

	async fn remove_peers(&self, device: &str, keys: &[PublicKey]) -> Result<()> {
		self.remove_peers(device, keys).await
	}

	async fn close(&self) -> Result<()> {
		self.close().await
	}
}
