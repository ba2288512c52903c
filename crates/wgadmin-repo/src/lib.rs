// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Desired-state storage for WireGuard devices and peers.
//!
//! [`Repository`] is the contract; [`MemoryRepository`] and
//! [`SqliteRepository`] are the desired-state backends. Both fire their
//! [`ChangeNotifier`] once per successful write.

pub mod error;
pub mod memory;
pub mod notify;
pub mod pool;
pub mod repository;
pub mod sqlite;

#[cfg(test)]
mod contract;

pub use error::{RepoError, Result};
pub use memory::MemoryRepository;
pub use notify::ChangeNotifier;
pub use pool::create_pool;
pub use repository::{ChangeNotification, PeerPage, Repository};
pub use sqlite::migrations::{run_migrations, SCHEMA_VERSION};
pub use sqlite::SqliteRepository;
