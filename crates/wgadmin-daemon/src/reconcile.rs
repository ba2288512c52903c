// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Drives the live tunnels towards the stored desired state.
//!
//! The loop runs one full sync at start and another after every change event.
//! Events are coalesced by a one-slot channel, so a burst of writes costs at
//! most one extra sync.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use wgadmin_common::PeerOrder;
use wgadmin_repo::Repository;
use wgadmin_tunnel::{DeviceConfig, TunnelError, TunnelManager};

use crate::error::{ReconcileError, Result};

pub struct Reconciler {
	repo: Arc<dyn Repository>,
	manager: Arc<TunnelManager>,
}

impl Reconciler {
	pub fn new(repo: Arc<dyn Repository>, manager: Arc<TunnelManager>) -> Self {
		Self { repo, manager }
	}

	/// Makes the live device set match the repository.
	///
	/// Devices that fail are logged and reported together as
	/// [`ReconcileError::Partial`] once every other device has been handled.
	/// A TUN allocation failure aborts the sync as [`ReconcileError::Fatal`].
	#[instrument(skip(self))]
	pub async fn sync(&self) -> Result<()> {
		let desired = self.repo.list_devices().await?;
		let (peers, _) = self.repo.list_peers(PeerOrder::NameAsc, 0, 0).await?;
		let live: HashSet<String> = self
			.manager
			.devices()
			.await
			.into_iter()
			.map(|device| device.id)
			.collect();

		let mut failed = Vec::new();

		for device in &desired {
			let config = DeviceConfig::from_desired(device, &peers);
			let result = if live.contains(&device.name) {
				self.manager
					.configure(&device.name, move |current| {
						*current = config;
						Ok(())
					})
					.await
			} else {
				self.manager.up(&device.name, config).await
			};

			match result {
				Ok(applied) => {
					debug!(device = %device.name, interface = %applied.interface, "device reconciled")
				}
				Err(e @ TunnelError::TunCreation(_)) => return Err(ReconcileError::Fatal(e)),
				Err(e) => {
					error!(device = %device.name, error = %e, "failed to reconcile device");
					failed.push(device.name.clone());
				}
			}
		}

		let wanted: HashSet<&str> = desired.iter().map(|device| device.name.as_str()).collect();
		for id in live.iter().filter(|id| !wanted.contains(id.as_str())) {
			match self.manager.down(id).await {
				Ok(()) => info!(device = %id, "removed device no longer desired"),
				Err(e) => {
					error!(device = %id, error = %e, "failed to bring down removed device");
					failed.push(id.clone());
				}
			}
		}

		if failed.is_empty() {
			Ok(())
		} else {
			Err(ReconcileError::Partial { failed })
		}
	}

	/// Starts the loop on the current runtime.
	pub fn spawn(self) -> ReconcilerHandle {
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let (change_tx, change_rx) = mpsc::channel(1);
		self.repo.add_change_notification(change_tx.clone());
		// Only the repository keeps a strong sender so closing it ends the loop.
		let listener = change_tx.downgrade();
		drop(change_tx);

		let join = tokio::spawn(async move {
			let result = self.run(shutdown_rx, change_rx).await;
			if let Some(sender) = listener.upgrade() {
				self.repo.remove_change_notification(&sender);
			}
			result
		});

		ReconcilerHandle { shutdown_tx, join }
	}

	async fn run(
		&self,
		mut shutdown_rx: watch::Receiver<bool>,
		mut change_rx: mpsc::Receiver<()>,
	) -> Result<()> {
		info!("starting reconciler");
		self.sync_logged().await?;

		loop {
			tokio::select! {
				biased;

				changed = shutdown_rx.changed() => {
					if changed.is_err() || *shutdown_rx.borrow() {
						info!("shutdown signal received");
						break;
					}
				}

				change = change_rx.recv() => {
					match change {
						Some(()) => self.sync_logged().await?,
						None => {
							info!("change notifications closed");
							break;
						}
					}
				}
			}
		}

		info!("reconciler stopped");
		Ok(())
	}

	/// Runs a sync, passing through only errors that end the loop.
	async fn sync_logged(&self) -> Result<()> {
		match self.sync().await {
			Ok(()) => Ok(()),
			Err(e) if e.is_fatal() => {
				error!(error = %e, "reconciler cannot continue");
				Err(e)
			}
			Err(e) => {
				warn!(error = %e, "reconciliation incomplete, waiting for the next change");
				Ok(())
			}
		}
	}
}

/// Controls a running [`Reconciler`].
pub struct ReconcilerHandle {
	shutdown_tx: watch::Sender<bool>,
	join: JoinHandle<Result<()>>,
}

impl ReconcilerHandle {
	/// Signals the loop to stop and waits until it has.
	pub async fn shutdown(self) -> Result<()> {
		let _ = self.shutdown_tx.send(true);
		self.join.await?
	}

	/// Waits for the loop to end on its own.
	pub async fn join(self) -> Result<()> {
		self.join.await?
	}

	/// Resolves when the loop ends on its own. The handle must not be used
	/// again afterwards.
	pub async fn finished(&mut self) -> Result<()> {
		(&mut self.join).await?
	}

	pub fn is_finished(&self) -> bool {
		self.join.is_finished()
	}
}
