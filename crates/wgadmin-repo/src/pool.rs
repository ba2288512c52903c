// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use sqlx::sqlite::{
	SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;

use crate::error::RepoError;

/// Create a SqlitePool with WAL mode, foreign keys and common settings.
///
/// In-memory databases live only as long as their connection, so they get a
/// single connection that is never recycled.
///
/// # Arguments
/// * `database_url` - SQLite connection string (e.g., "sqlite:./wgadmin.db")
///
/// # Errors
/// Returns `RepoError::InvalidInput` if the URL is invalid and
/// `RepoError::Storage` if the connection fails.
#[tracing::instrument(skip(database_url))]
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, RepoError> {
	let options = SqliteConnectOptions::from_str(database_url)
		.map_err(|e| RepoError::InvalidInput(format!("Invalid database URL: {e}")))?
		.journal_mode(SqliteJournalMode::Wal)
		.synchronous(SqliteSynchronous::Normal)
		.foreign_keys(true)
		.create_if_missing(true);

	let pool = if is_in_memory(database_url) {
		SqlitePoolOptions::new()
			.max_connections(1)
			.idle_timeout(None)
			.max_lifetime(None)
			.connect_with(options)
			.await?
	} else {
		SqlitePoolOptions::new().connect_with(options).await?
	};

	tracing::debug!("database pool created");
	Ok(pool)
}

fn is_in_memory(database_url: &str) -> bool {
	database_url.contains(":memory:") || database_url.contains("mode=memory")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn detects_in_memory_urls() {
		assert!(is_in_memory(":memory:"));
		assert!(is_in_memory("sqlite::memory:"));
		assert!(is_in_memory("sqlite://file?mode=memory"));
		assert!(!is_in_memory("sqlite:./wgadmin.db"));
	}

	#[tokio::test]
	async fn rejects_unknown_url_parameter() {
		let err = create_pool("sqlite::memory:?flavour=odd").await.unwrap_err();
		assert!(matches!(err, RepoError::InvalidInput(_)), "got {err:?}");
	}

	#[tokio::test]
	async fn in_memory_pool_enforces_foreign_keys() {
		let pool = create_pool("sqlite::memory:").await.unwrap();
		let (enabled,): (i64,) = sqlx::query_as("PRAGMA foreign_keys")
			.fetch_one(&pool)
			.await
			.unwrap();
		assert_eq!(enabled, 1);
	}
}
