// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod config;
pub mod error;
pub mod reconcile;

pub use config::{Backend, DaemonConfig, LogFormat};
pub use error::{ConfigError, ReconcileError, Result};
pub use reconcile::{Reconciler, ReconcilerHandle};
