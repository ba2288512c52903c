// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Userspace WireGuard devices backed by boringtun.
//!
//! boringtun owns its TUN fd, UDP sockets and worker threads, and exposes
//! its UAPI socket at `/var/run/wireguard/<name>.sock`. Each device runs on a
//! dedicated thread which holds the handle until the interface is closed.

use async_trait::async_trait;
use defguard_boringtun::device::{DeviceConfig as BoringtunConfig, DeviceHandle};
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, TunnelError};
use crate::platform::{TunDriver, TunInterface, TunnelEngine};
use crate::uapi::{UapiClient, UapiEngine};

pub const DEFAULT_UAPI_DIR: &str = "/var/run/wireguard";

#[derive(Debug, Clone)]
pub struct BoringtunDriver {
	uapi_dir: PathBuf,
	threads: usize,
}

impl BoringtunDriver {
	pub fn new(uapi_dir: impl Into<PathBuf>) -> Self {
		Self {
			uapi_dir: uapi_dir.into(),
			threads: 4,
		}
	}

	pub fn with_threads(mut self, threads: usize) -> Self {
		self.threads = threads.max(1);
		self
	}

	pub fn uapi_dir(&self) -> &std::path::Path {
		&self.uapi_dir
	}
}

impl Default for BoringtunDriver {
	fn default() -> Self {
		Self::new(DEFAULT_UAPI_DIR)
	}
}

#[async_trait]
impl TunDriver for BoringtunDriver {
	#[instrument(skip(self), fields(%name))]
	async fn create(&self, name: &str) -> Result<Box<dyn TunInterface>> {
		let (ready_tx, ready_rx) = oneshot::channel();
		let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
		let config = BoringtunConfig {
			n_threads: self.threads,
			..BoringtunConfig::default()
		};
		let thread_name = name.to_string();

		let thread = std::thread::Builder::new()
			.name(format!("wg-{name}"))
			.spawn(move || {
				let handle = match DeviceHandle::new(&thread_name, config) {
					Ok(handle) => handle,
					Err(e) => {
						let _ = ready_tx.send(Err(format!("{e:?}")));
						return;
					}
				};
				if ready_tx.send(Ok(())).is_err() {
					return;
				}
				// Blocks until close() or until the interface is dropped.
				let _ = stop_rx.recv();
				drop(handle);
			})?;

		match ready_rx.await {
			Ok(Ok(())) => {
				info!(interface = %name, "created TUN interface");
				Ok(Box::new(BoringtunInterface {
					name: name.to_string(),
					stop: Some(stop_tx),
					thread: Some(thread),
				}))
			}
			Ok(Err(e)) => {
				let _ = thread.join();
				Err(TunnelError::TunCreation(format!("{name}: {e}")))
			}
			Err(_) => Err(TunnelError::TunCreation(format!(
				"{name}: device thread exited before reporting"
			))),
		}
	}

	async fn attach(&self, tun: &dyn TunInterface) -> Result<Box<dyn TunnelEngine>> {
		let client = UapiClient::for_interface(&self.uapi_dir, tun.name());
		debug!(socket = %client.path().display(), "attached UAPI engine");
		Ok(Box::new(UapiEngine::new(client)))
	}
}

pub struct BoringtunInterface {
	name: String,
	stop: Option<std_mpsc::Sender<()>>,
	thread: Option<JoinHandle<()>>,
}

#[async_trait]
impl TunInterface for BoringtunInterface {
	fn name(&self) -> &str {
		&self.name
	}

	async fn close(mut self: Box<Self>) -> Result<()> {
		if let Some(stop) = self.stop.take() {
			let _ = stop.send(());
		}
		if let Some(thread) = self.thread.take() {
			let joined = tokio::task::spawn_blocking(move || thread.join())
				.await
				.map_err(|e| TunnelError::Engine(e.to_string()))?;
			if joined.is_err() {
				return Err(TunnelError::Engine(format!("{}: device thread panicked", self.name)));
			}
		}
		info!(interface = %self.name, "closed TUN interface");
		Ok(())
	}
}

impl Drop for BoringtunInterface {
	fn drop(&mut self) {
		if let Some(stop) = self.stop.take() {
			warn!(interface = %self.name, "TUN interface dropped without close");
			let _ = stop.send(());
		}
	}
}
