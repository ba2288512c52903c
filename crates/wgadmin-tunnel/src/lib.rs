// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Live WireGuard state.
//!
//! [`TunnelManager`] brings userspace tunnels up and down on top of the
//! [`TunDriver`] and [`NetworkManager`] seams. [`KernelRepository`] exposes
//! whatever is running as a [`wgadmin_repo::Repository`].

pub mod config;
pub mod error;
pub mod kernel;
pub mod manager;
pub mod platform;
pub mod uapi;

#[cfg(target_os = "linux")]
pub mod netlink;
#[cfg(target_os = "linux")]
pub mod tun;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{Device, DeviceConfig, PeerConfig};
pub use error::{Result, TunnelError};
pub use kernel::{ControlPlane, KernelRepository};
pub use manager::{TunnelManager, DEFAULT_MTU, DEFAULT_PREFIX};
pub use platform::{NetworkManager, TunDriver, TunInterface, TunnelEngine};
pub use uapi::{LiveDevice, LivePeer, PeerUpdate, SetRequest};

#[cfg(unix)]
pub use kernel::UapiControlPlane;
#[cfg(unix)]
pub use uapi::{UapiClient, UapiEngine};

#[cfg(target_os = "linux")]
pub use netlink::NetlinkManager;
#[cfg(target_os = "linux")]
pub use tun::{BoringtunDriver, DEFAULT_UAPI_DIR};
