// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use wgadmin_common::{KeyError, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
	#[error("Not found: {0}")]
	NotFound(String),

	#[error("Already exists: {0}")]
	AlreadyExists(String),

	#[error("Invalid input: {0}")]
	InvalidInput(String),

	#[error("Database error: {0}")]
	Storage(#[from] sqlx::Error),

	#[error("Migration failed: {0}")]
	Migration(String),

	#[error("Unsupported: {0}")]
	Unsupported(String),

	#[error("Control plane error: {0}")]
	ControlPlane(String),

	#[error("Internal: {0}")]
	Internal(String),
}

impl From<ValidationError> for RepoError {
	fn from(e: ValidationError) -> Self {
		RepoError::InvalidInput(e.to_string())
	}
}

impl From<KeyError> for RepoError {
	fn from(e: KeyError) -> Self {
		RepoError::InvalidInput(e.to_string())
	}
}

pub type Result<T> = std::result::Result<T, RepoError>;
