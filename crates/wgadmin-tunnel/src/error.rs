// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;
use wgadmin_common::KeyError;

#[derive(Debug, Error)]
pub enum TunnelError {
	#[error("device {0} already exists")]
	AlreadyExists(String),

	#[error("device {0} does not exist")]
	NotExist(String),

	#[error("failed to create TUN interface: {0}")]
	TunCreation(String),

	#[error("netlink error: {0}")]
	Netlink(String),

	#[error("tunnel engine error: {0}")]
	Engine(String),

	#[error("UAPI error: {0}")]
	Uapi(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("key error: {0}")]
	Key(#[from] KeyError),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
