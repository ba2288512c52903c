// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wgadmin_daemon::LogFormat;

fn init_tracing(format: LogFormat) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let registry = tracing_subscriber::registry().with(filter);
	match format {
		LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
		LogFormat::Json => registry
			.with(tracing_subscriber::fmt::layer().json())
			.init(),
	}
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
	use anyhow::Context;
	use std::sync::Arc;
	use tracing::{error, info};
	use wgadmin_daemon::{Backend, DaemonConfig, Reconciler};
	use wgadmin_repo::{MemoryRepository, Repository, SqliteRepository};
	use wgadmin_tunnel::{BoringtunDriver, NetlinkManager, TunnelManager};

	let config = DaemonConfig::from_env().context("failed to load configuration")?;
	init_tracing(config.log_format);

	info!(
		backend = ?config.backend,
		prefix = %config.interface_prefix,
		mtu = config.mtu,
		"starting wgadmin daemon"
	);

	let repo: Arc<dyn Repository> = match config.backend {
		Backend::Sqlite => Arc::new(
			SqliteRepository::open(&config.database_url)
				.await
				.with_context(|| format!("failed to open {}", config.database_url))?,
		),
		Backend::Memory => Arc::new(MemoryRepository::new()),
	};

	let network = NetlinkManager::new().context("failed to open netlink socket")?;
	let manager = Arc::new(TunnelManager::new(
		Arc::new(BoringtunDriver::new(config.uapi_dir.clone())),
		Arc::new(network),
		config.interface_prefix.clone(),
		config.mtu,
	));

	let mut handle = Reconciler::new(repo.clone(), manager.clone()).spawn();

	let outcome = tokio::select! {
		result = handle.finished() => result,
		_ = tokio::signal::ctrl_c() => {
			info!("received shutdown signal");
			handle.shutdown().await
		}
	};

	manager.shutdown().await;
	if let Err(e) = repo.close().await {
		error!(error = %e, "failed to close repository");
	}

	outcome.context("reconciler failed")?;
	info!("wgadmin daemon stopped");
	Ok(())
}

#[cfg(not(target_os = "linux"))]
fn main() -> anyhow::Result<()> {
	init_tracing(LogFormat::Text);
	anyhow::bail!("wgadmin-daemon needs Linux TUN and netlink support")
}
