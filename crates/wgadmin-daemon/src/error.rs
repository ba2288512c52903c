// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;
use wgadmin_repo::RepoError;
use wgadmin_tunnel::TunnelError;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("missing environment variable: {0}")]
	MissingEnv(String),

	#[error("parse error: {0}")]
	Parse(String),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
	#[error("repository error: {0}")]
	Repository(#[from] RepoError),

	#[error("failed to reconcile devices: {}", failed.join(", "))]
	Partial { failed: Vec<String> },

	#[error("unrecoverable tunnel error: {0}")]
	Fatal(TunnelError),

	#[error("reconciler task failed: {0}")]
	Task(#[from] tokio::task::JoinError),
}

impl ReconcileError {
	pub fn is_fatal(&self) -> bool {
		matches!(self, Self::Fatal(_))
	}
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
