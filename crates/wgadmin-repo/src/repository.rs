// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The storage-agnostic contract every backend implements.
//!
//! Listing operations return `(page, total)` where `total` counts every row
//! matching the filter before pagination. An `offset` past the end yields an
//! empty page and a `limit` of zero means no limit. Each successful mutating
//! call fires the change notification exactly once.

use async_trait::async_trait;
use tokio::sync::mpsc;
use wgadmin_common::{DeviceInfo, PeerInfo, PeerOrder, PublicKey};

use crate::error::Result;

pub type PeerPage = (Vec<PeerInfo>, usize);

/// Registration of zero-payload "state changed" listeners.
///
/// Listeners are identified by channel, so registering the same channel twice
/// (or removing an unknown one) is a no-op.
pub trait ChangeNotification: Send + Sync {
	fn add_change_notification(&self, listener: mpsc::Sender<()>);

	fn remove_change_notification(&self, listener: &mpsc::Sender<()>);
}

#[async_trait]
pub trait Repository: ChangeNotification {
	async fn list_devices(&self) -> Result<Vec<DeviceInfo>>;

	/// Inserts or updates devices by name. Devices not mentioned are kept.
	async fn update_devices(&self, devices: &[DeviceInfo]) -> Result<()>;

	/// Makes the stored device set exactly `devices`, atomically.
	async fn replace_all_devices(&self, devices: &[DeviceInfo]) -> Result<()>;

	async fn remove_devices(&self, names: &[String]) -> Result<()>;

	async fn list_peers(&self, order: PeerOrder, offset: usize, limit: usize) -> Result<PeerPage>;

	async fn list_peers_by_devices(
		&self,
		devices: &[String],
		order: PeerOrder,
		offset: usize,
		limit: usize,
	) -> Result<PeerPage>;

	async fn list_peers_by_keys(
		&self,
		device: &str,
		keys: &[PublicKey],
		order: PeerOrder,
		offset: usize,
		limit: usize,
	) -> Result<PeerPage>;

	async fn update_peers(&self, device: &str, peers: &[PeerInfo]) -> Result<()>;

	async fn replace_all_peers(&self, device: &str, peers: &[PeerInfo]) -> Result<()>;

	async fn remove_peers(&self, device: &str, keys: &[PublicKey]) -> Result<()>;

	/// Drops every registered listener and releases the backend's resources.
	async fn close(&self) -> Result<()>;
}
