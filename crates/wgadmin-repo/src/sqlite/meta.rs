// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Free-form key/value annotations on devices and peers.
//!
//! Annotations are removed together with their device or peer. They are not
//! part of the reconciled state, so writing them fires no change event.

use tracing::instrument;
use wgadmin_common::PublicKey;

use super::{require_device, SqliteRepository};
use crate::error::{RepoError, Result};

impl SqliteRepository {
	#[instrument(skip(self), fields(%device, %key))]
	pub async fn device_meta(&self, device: &str, key: &str) -> Result<Option<String>> {
		let row: Option<(String,)> =
			sqlx::query_as("SELECT value FROM device_meta WHERE device_id = ? AND name = ?")
				.bind(device)
				.bind(key)
				.fetch_optional(&self.pool)
				.await?;

		Ok(row.map(|(value,)| value))
	}

	#[instrument(skip(self, entries), fields(%device, count = entries.len()))]
	pub async fn set_device_meta(&self, device: &str, entries: &[(&str, &str)]) -> Result<()> {
		let mut tx = self.pool.begin().await?;
		require_device(&mut tx, device).await?;

		for (name, value) in entries {
			sqlx::query(
				"INSERT INTO device_meta (device_id, name, value) VALUES (?, ?, ?)
				 ON CONFLICT(device_id, name) DO UPDATE SET value = excluded.value",
			)
			.bind(device)
			.bind(*name)
			.bind(*value)
			.execute(&mut *tx)
			.await?;
		}

		tx.commit().await?;
		Ok(())
	}

	#[instrument(skip(self, keys), fields(%device, count = keys.len()))]
	pub async fn remove_device_meta(&self, device: &str, keys: &[&str]) -> Result<()> {
		let mut tx = self.pool.begin().await?;
		for key in keys {
			sqlx::query("DELETE FROM device_meta WHERE device_id = ? AND name = ?")
				.bind(device)
				.bind(*key)
				.execute(&mut *tx)
				.await?;
		}
		tx.commit().await?;
		Ok(())
	}

	#[instrument(skip(self), fields(%device, %peer, %key))]
	pub async fn peer_meta(
		&self,
		device: &str,
		peer: &PublicKey,
		key: &str,
	) -> Result<Option<String>> {
		let row: Option<(String,)> = sqlx::query_as(
			"SELECT value FROM peer_meta WHERE device_id = ? AND public_key = ? AND name = ?",
		)
		.bind(device)
		.bind(peer.to_hex())
		.bind(key)
		.fetch_optional(&self.pool)
		.await?;

		Ok(row.map(|(value,)| value))
	}

	#[instrument(skip(self, entries), fields(%device, %peer, count = entries.len()))]
	pub async fn set_peer_meta(
		&self,
		device: &str,
		peer: &PublicKey,
		entries: &[(&str, &str)],
	) -> Result<()> {
		let public_key = peer.to_hex();
		let mut tx = self.pool.begin().await?;

		let found: Option<(i64,)> =
			sqlx::query_as("SELECT 1 FROM peers WHERE device_id = ? AND public_key = ?")
				.bind(device)
				.bind(public_key.as_str())
				.fetch_optional(&mut *tx)
				.await?;
		if found.is_none() {
			return Err(RepoError::NotFound(format!("peer {peer} on device {device}")));
		}

		for (name, value) in entries {
			sqlx::query(
				"INSERT INTO peer_meta (device_id, public_key, name, value) VALUES (?, ?, ?, ?)
				 ON CONFLICT(device_id, public_key, name) DO UPDATE SET value = excluded.value",
			)
			.bind(device)
			.bind(public_key.as_str())
			.bind(*name)
			.bind(*value)
			.execute(&mut *tx)
			.await?;
		}

		tx.commit().await?;
		Ok(())
	}

	#[instrument(skip(self, keys), fields(%device, %peer, count = keys.len()))]
	pub async fn remove_peer_meta(&self, device: &str, peer: &PublicKey, keys: &[&str]) -> Result<()> {
		let public_key = peer.to_hex();
		let mut tx = self.pool.begin().await?;
		for key in keys {
			sqlx::query("DELETE FROM peer_meta WHERE device_id = ? AND public_key = ? AND name = ?")
				.bind(device)
				.bind(public_key.as_str())
				.bind(*key)
				.execute(&mut *tx)
				.await?;
		}
		tx.commit().await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::contract;
	use wgadmin_common::PeerOrder;

	async fn seeded() -> (SqliteRepository, PublicKey) {
		let repo = SqliteRepository::open("sqlite::memory:").await.unwrap();
		repo.update_devices(&[contract::device("wg0")]).await.unwrap();
		let peer = contract::peer("wg0", "alice");
		let key = peer.public_key;
		repo.update_peers("wg0", &[peer]).await.unwrap();
		(repo, key)
	}

	#[tokio::test]
	async fn device_meta_set_get_remove() {
		let (repo, _) = seeded().await;

		repo.set_device_meta("wg0", &[("owner", "ops"), ("site", "akl")])
			.await
			.unwrap();
		repo.set_device_meta("wg0", &[("owner", "netops")])
			.await
			.unwrap();

		assert_eq!(
			repo.device_meta("wg0", "owner").await.unwrap().as_deref(),
			Some("netops")
		);
		assert_eq!(
			repo.device_meta("wg0", "site").await.unwrap().as_deref(),
			Some("akl")
		);

		repo.remove_device_meta("wg0", &["site", "unknown"])
			.await
			.unwrap();
		assert_eq!(repo.device_meta("wg0", "site").await.unwrap(), None);
	}

	#[tokio::test]
	async fn device_meta_requires_device() {
		let (repo, _) = seeded().await;
		let err = repo
			.set_device_meta("ghost", &[("owner", "ops")])
			.await
			.unwrap_err();
		assert!(matches!(err, RepoError::NotFound(_)), "got {err:?}");
	}

	#[tokio::test]
	async fn peer_meta_follows_peer_lifecycle() {
		let (repo, key) = seeded().await;

		repo.set_peer_meta("wg0", &key, &[("email", "alice@example.com")])
			.await
			.unwrap();
		assert_eq!(
			repo.peer_meta("wg0", &key, "email").await.unwrap().as_deref(),
			Some("alice@example.com")
		);

		repo.remove_peers("wg0", &[key]).await.unwrap();
		assert_eq!(repo.peer_meta("wg0", &key, "email").await.unwrap(), None);

		let err = repo
			.set_peer_meta("wg0", &key, &[("email", "gone@example.com")])
			.await
			.unwrap_err();
		assert!(matches!(err, RepoError::NotFound(_)), "got {err:?}");
	}

	#[tokio::test]
	async fn device_removal_cascades_to_meta() {
		let (repo, key) = seeded().await;
		repo.set_device_meta("wg0", &[("owner", "ops")]).await.unwrap();
		repo.set_peer_meta("wg0", &key, &[("email", "a@example.com")])
			.await
			.unwrap();

		repo.remove_devices(&["wg0".to_string()]).await.unwrap();

		assert_eq!(repo.device_meta("wg0", "owner").await.unwrap(), None);
		assert_eq!(repo.peer_meta("wg0", &key, "email").await.unwrap(), None);
		let (_, total) = repo.list_peers(PeerOrder::NameAsc, 0, 0).await.unwrap();
		assert_eq!(total, 0);
	}

	#[tokio::test]
	async fn peer_meta_survives_peer_update() {
		let (repo, key) = seeded().await;
		repo.set_peer_meta("wg0", &key, &[("email", "a@example.com")])
			.await
			.unwrap();

		let (peers, _) = repo.list_peers(PeerOrder::NameAsc, 0, 0).await.unwrap();
		let renamed = peers[0].clone().with_name("alice-phone");
		repo.update_peers("wg0", &[renamed]).await.unwrap();

		assert_eq!(
			repo.peer_meta("wg0", &key, "email").await.unwrap().as_deref(),
			Some("a@example.com")
		);
	}
}
