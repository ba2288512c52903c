// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Persistent backend on SQLite.
//!
//! Each mutating call runs in one transaction and notifies listeners once,
//! after commit. Replace-all deletes the rows of its scope that are absent
//! from the input and then upserts the rest, so retained devices keep their
//! peers and retained peers keep their observed last handshake.

mod meta;
pub mod migrations;
mod rows;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Row;
use tokio::sync::mpsc;
use tracing::{debug, instrument};
use wgadmin_common::{DeviceInfo, PeerInfo, PeerOrder, PublicKey};

use crate::error::{RepoError, Result};
use crate::notify::ChangeNotifier;
use crate::pool::create_pool;
use crate::repository::{ChangeNotification, PeerPage, Repository};
use migrations::run_migrations;
use rows::{DeviceParams, DeviceRow, PeerRow};

const PEER_COLUMNS: &str = "device_id, public_key, pre_shared_key, endpoint, allowed_ips, \
	persistent_keepalive_interval, last_handshake, name";

const UPSERT_DEVICE: &str = "INSERT INTO devices (id, public_key, private_key, listen_port, address)
	 VALUES (?, ?, ?, ?, ?)
	 ON CONFLICT(id) DO UPDATE SET
		public_key = excluded.public_key,
		private_key = excluded.private_key,
		listen_port = excluded.listen_port,
		address = excluded.address";

// last_handshake is observed state and never written here.
const UPSERT_PEER: &str = "INSERT INTO peers (device_id, public_key, pre_shared_key, endpoint, allowed_ips,
		persistent_keepalive_interval, name)
	 VALUES (?, ?, ?, ?, ?, ?, ?)
	 ON CONFLICT(device_id, public_key) DO UPDATE SET
		pre_shared_key = excluded.pre_shared_key,
		endpoint = excluded.endpoint,
		allowed_ips = excluded.allowed_ips,
		persistent_keepalive_interval = excluded.persistent_keepalive_interval,
		name = excluded.name";

enum PeerScope<'a> {
	All,
	Devices(&'a [String]),
	Keys {
		device: &'a str,
		keys: &'a [PublicKey],
	},
}

pub struct SqliteRepository {
	pool: SqlitePool,
	notifier: ChangeNotifier,
}

impl SqliteRepository {
	/// Opens (creating if needed) the database at `database_url` and migrates
	/// it to the current schema.
	#[instrument(skip(database_url))]
	pub async fn open(database_url: &str) -> Result<Self> {
		let pool = create_pool(database_url).await?;
		Self::from_pool(pool).await
	}

	pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
		run_migrations(&pool).await?;
		Ok(Self {
			pool,
			notifier: ChangeNotifier::new(),
		})
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	#[instrument(skip(self))]
	pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
		let rows: Vec<DeviceRow> = sqlx::query_as(
			"SELECT id, private_key, listen_port, address FROM devices ORDER BY id",
		)
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(DeviceInfo::try_from).collect()
	}

	#[instrument(skip(self, devices), fields(count = devices.len()))]
	pub async fn update_devices(&self, devices: &[DeviceInfo]) -> Result<()> {
		for device in devices {
			device.validate()?;
		}

		let mut tx = self.pool.begin().await?;
		stage_public_keys(&mut tx, Some(devices)).await?;
		for device in devices {
			upsert_device(&mut tx, device).await?;
		}
		tx.commit().await?;

		self.notifier.notify_change();
		Ok(())
	}

	#[instrument(skip(self, devices), fields(count = devices.len()))]
	pub async fn replace_all_devices(&self, devices: &[DeviceInfo]) -> Result<()> {
		for device in devices {
			device.validate()?;
		}

		let mut tx = self.pool.begin().await?;

		let removed = if devices.is_empty() {
			sqlx::query("DELETE FROM devices").execute(&mut *tx).await?
		} else {
			let sql = format!(
				"DELETE FROM devices WHERE id NOT IN ({})",
				placeholders(devices.len())
			);
			let mut query = sqlx::query(&sql);
			for device in devices {
				query = query.bind(device.name.as_str());
			}
			query.execute(&mut *tx).await?
		};
		debug!(removed = removed.rows_affected(), "removed absent devices");

		stage_public_keys(&mut tx, None).await?;
		for device in devices {
			upsert_device(&mut tx, device).await?;
		}
		tx.commit().await?;

		self.notifier.notify_change();
		Ok(())
	}

	#[instrument(skip(self, names), fields(count = names.len()))]
	pub async fn remove_devices(&self, names: &[String]) -> Result<()> {
		let mut tx = self.pool.begin().await?;
		for name in names {
			sqlx::query("DELETE FROM devices WHERE id = ?")
				.bind(name.as_str())
				.execute(&mut *tx)
				.await?;
		}
		tx.commit().await?;

		self.notifier.notify_change();
		Ok(())
	}

	#[instrument(skip(self))]
	pub async fn list_peers(&self, order: PeerOrder, offset: usize, limit: usize) -> Result<PeerPage> {
		self.query_peers(PeerScope::All, order, offset, limit).await
	}

	#[instrument(skip(self, devices), fields(count = devices.len()))]
	pub async fn list_peers_by_devices(
		&self,
		devices: &[String],
		order: PeerOrder,
		offset: usize,
		limit: usize,
	) -> Result<PeerPage> {
		self.query_peers(PeerScope::Devices(devices), order, offset, limit)
			.await
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
		self.query_peers(PeerScope::Keys { device, keys }, order, offset, limit)
			.await
	}

	async fn query_peers(
		&self,
		scope: PeerScope<'_>,
		order: PeerOrder,
		offset: usize,
		limit: usize,
	) -> Result<PeerPage> {
		let mut conditions = vec!["1=1".to_string()];
		let mut binds: Vec<String> = Vec::new();

		match scope {
			PeerScope::All => {}
			PeerScope::Devices(devices) => {
				if devices.is_empty() {
					return Ok((Vec::new(), 0));
				}
				conditions.push(format!("device_id IN ({})", placeholders(devices.len())));
				binds.extend(devices.iter().cloned());
			}
			PeerScope::Keys { device, keys } => {
				if keys.is_empty() {
					return Ok((Vec::new(), 0));
				}
				conditions.push("device_id = ?".to_string());
				binds.push(device.to_string());
				conditions.push(format!("public_key IN ({})", placeholders(keys.len())));
				binds.extend(keys.iter().map(PublicKey::to_hex));
			}
		}

		let where_clause = conditions.join(" AND ");
		let sql_offset = i64::try_from(offset)
			.map_err(|_| RepoError::InvalidInput(format!("offset {offset} is too large")))?;
		let sql_limit = if limit == 0 {
			-1
		} else {
			i64::try_from(limit)
				.map_err(|_| RepoError::InvalidInput(format!("limit {limit} is too large")))?
		};

		let mut tx = self.pool.begin().await?;

		let count_sql = format!("SELECT COUNT(*) as cnt FROM peers WHERE {where_clause}");
		let mut count_query = sqlx::query(&count_sql);
		for v in &binds {
			count_query = count_query.bind(v.as_str());
		}
		let count_row = count_query.fetch_one(&mut *tx).await?;
		let total: i64 = count_row.get("cnt");

		let data_sql = format!(
			"SELECT {PEER_COLUMNS} FROM peers WHERE {where_clause} ORDER BY {} LIMIT ? OFFSET ?",
			order_clause(order)
		);
		let mut data_query = sqlx::query_as::<_, PeerRow>(&data_sql);
		for v in &binds {
			data_query = data_query.bind(v.as_str());
		}
		let rows = data_query
			.bind(sql_limit)
			.bind(sql_offset)
			.fetch_all(&mut *tx)
			.await?;

		tx.commit().await?;

		let peers = rows
			.iter()
			.map(PeerRow::to_info)
			.collect::<Result<Vec<_>>>()?;
		let total = usize::try_from(total)
			.map_err(|_| RepoError::Internal(format!("negative peer count {total}")))?;
		Ok((peers, total))
	}

	#[instrument(skip(self, peers), fields(%device, count = peers.len()))]
	pub async fn update_peers(&self, device: &str, peers: &[PeerInfo]) -> Result<()> {
		let rows = peer_rows(device, peers)?;

		let mut tx = self.pool.begin().await?;
		require_device(&mut tx, device).await?;
		for row in &rows {
			upsert_peer(&mut tx, row).await?;
		}
		tx.commit().await?;

		self.notifier.notify_change();
		Ok(())
	}

	#[instrument(skip(self, peers), fields(%device, count = peers.len()))]
	pub async fn replace_all_peers(&self, device: &str, peers: &[PeerInfo]) -> Result<()> {
		let rows = peer_rows(device, peers)?;

		let mut tx = self.pool.begin().await?;
		require_device(&mut tx, device).await?;

		let removed = if rows.is_empty() {
			sqlx::query("DELETE FROM peers WHERE device_id = ?")
				.bind(device)
				.execute(&mut *tx)
				.await?
		} else {
			let sql = format!(
				"DELETE FROM peers WHERE device_id = ? AND public_key NOT IN ({})",
				placeholders(rows.len())
			);
			let mut query = sqlx::query(&sql).bind(device);
			for row in &rows {
				query = query.bind(row.public_key.as_str());
			}
			query.execute(&mut *tx).await?
		};
		debug!(removed = removed.rows_affected(), "removed absent peers");

		for row in &rows {
			upsert_peer(&mut tx, row).await?;
		}
		tx.commit().await?;

		self.notifier.notify_change();
		Ok(())
	}

	#[instrument(skip(self, keys), fields(%device, count = keys.len()))]
	pub async fn remove_peers(&self, device: &str, keys: &[PublicKey]) -> Result<()> {
		let mut tx = self.pool.begin().await?;
		require_device(&mut tx, device).await?;
		for key in keys {
			sqlx::query("DELETE FROM peers WHERE device_id = ? AND public_key = ?")
				.bind(device)
				.bind(key.to_hex())
				.execute(&mut *tx)
				.await?;
		}
		tx.commit().await?;

		self.notifier.notify_change();
		Ok(())
	}

	pub async fn close(&self) -> Result<()> {
		self.notifier.close();
		self.pool.close().await;
		Ok(())
	}
}

fn placeholders(count: usize) -> String {
	vec!["?"; count].join(", ")
}

fn order_clause(order: PeerOrder) -> &'static str {
	match order {
		PeerOrder::NameAsc => "name ASC, public_key ASC",
		PeerOrder::NameDesc => "name DESC, public_key DESC",
		PeerOrder::LastHandshakeAsc => "last_handshake ASC, public_key ASC",
		PeerOrder::LastHandshakeDesc => "last_handshake DESC, public_key DESC",
	}
}

fn peer_rows(device: &str, peers: &[PeerInfo]) -> Result<Vec<PeerRow>> {
	peers
		.iter()
		.map(|peer| {
			peer.validate_for(device)?;
			PeerRow::from_info(peer)
		})
		.collect()
}

async fn require_device(conn: &mut SqliteConnection, device: &str) -> Result<()> {
	let found: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM devices WHERE id = ?")
		.bind(device)
		.fetch_optional(&mut *conn)
		.await?;
	match found {
		Some(_) => Ok(()),
		None => Err(RepoError::NotFound(format!("device {device}"))),
	}
}

/// Moves the public keys of the devices about to be written (every device
/// when `devices` is `None`) out of the unique index, so keys can move between
/// devices of one batch. Each upsert writes the real key back.
async fn stage_public_keys(
	conn: &mut SqliteConnection,
	devices: Option<&[DeviceInfo]>,
) -> Result<()> {
	match devices {
		None => {
			sqlx::query("UPDATE devices SET public_key = 'staged:' || id")
				.execute(&mut *conn)
				.await?;
		}
		Some([]) => {}
		Some(devices) => {
			let sql = format!(
				"UPDATE devices SET public_key = 'staged:' || id WHERE id IN ({})",
				placeholders(devices.len())
			);
			let mut query = sqlx::query(&sql);
			for device in devices {
				query = query.bind(device.name.as_str());
			}
			query.execute(&mut *conn).await?;
		}
	}
	Ok(())
}

async fn upsert_device(conn: &mut SqliteConnection, device: &DeviceInfo) -> Result<()> {
	let params = DeviceParams::from(device);
	sqlx::query(UPSERT_DEVICE)
		.bind(params.id.as_str())
		.bind(params.public_key.as_str())
		.bind(params.private_key.as_str())
		.bind(params.listen_port)
		.bind(params.address.as_deref())
		.execute(&mut *conn)
		.await
		.map_err(|e| match &e {
			sqlx::Error::Database(db) if db.is_unique_violation() => RepoError::AlreadyExists(
				format!("public key {} of device {} is already in use", params.public_key, params.id),
			),
			_ => RepoError::Storage(e),
		})?;
	Ok(())
}

async fn upsert_peer(conn: &mut SqliteConnection, row: &PeerRow) -> Result<()> {
	sqlx::query(UPSERT_PEER)
		.bind(row.device_id.as_str())
		.bind(row.public_key.as_str())
		.bind(row.pre_shared_key.as_deref())
		.bind(row.endpoint.as_deref())
		.bind(row.allowed_ips.as_deref())
		.bind(row.persistent_keepalive_interval)
		.bind(row.name.as_str())
		.execute(&mut *conn)
		.await?;
	Ok(())
}

impl ChangeNotification for SqliteRepository {
	fn add_change_notification(&self, listener: mpsc::Sender<()>) {
		self.notifier.add(listener);
	}

	fn remove_change_notification(&self, listener: &mpsc::Sender<()>) {
		self.notifier.remove(listener);
	}
}

#[async_trait]
impl Repository for SqliteRepository {
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
