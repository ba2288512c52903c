// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Forward-only schema migrations.
//!
//! The applied version lives in `options.schema_version`. Every pending step
//! and the version bump run in a single transaction, so a failing step leaves
//! the database exactly as it was.

use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tracing::{debug, info, instrument};

use crate::error::{RepoError, Result};

const SCHEMA_VERSION_OPTION: &str = "schema_version";

const MIGRATIONS: &[&str] = &[
	include_str!("../../migrations/001_create_tables.sql"),
	include_str!("../../migrations/002_create_indexes.sql"),
];

/// Schema version this build writes.
pub const SCHEMA_VERSION: i64 = MIGRATIONS.len() as i64;

/// Brings the schema up to [`SCHEMA_VERSION`] and returns the version found
/// before migrating.
///
/// # Errors
/// Returns `RepoError::Migration` if a step fails or the database was written
/// by a newer build.
#[instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<i64> {
	apply_steps(pool, MIGRATIONS).await
}

pub(crate) async fn apply_steps(pool: &SqlitePool, steps: &[&str]) -> Result<i64> {
	let target = steps.len() as i64;
	let mut tx = pool.begin().await?;

	let current = schema_version(&mut tx).await?;
	if current > target {
		return Err(RepoError::Migration(format!(
			"database schema version {current} is newer than supported version {target}"
		)));
	}
	if current == target {
		debug!(version = current, "schema up to date");
		tx.commit().await?;
		return Ok(current);
	}

	for (index, step) in steps.iter().enumerate().skip(current as usize) {
		let version = index + 1;
		for statement in step.split(';').map(str::trim).filter(|s| !s.is_empty()) {
			sqlx::query(statement)
				.execute(&mut *tx)
				.await
				.map_err(|e| RepoError::Migration(format!("step {version}: {e}")))?;
		}
		debug!(version, "applied migration step");
	}

	sqlx::query(
		"INSERT INTO options (name, value) VALUES (?, ?)
		 ON CONFLICT(name) DO UPDATE SET value = excluded.value",
	)
	.bind(SCHEMA_VERSION_OPTION)
	.bind(target.to_string())
	.execute(&mut *tx)
	.await?;

	tx.commit().await?;

	info!(from = current, to = target, "database schema migrated");
	Ok(current)
}

/// Reads the stored version. A database without an `options` table is empty
/// and reports version 0.
pub async fn schema_version(conn: &mut SqliteConnection) -> Result<i64> {
	let options_table: Option<(String,)> =
		sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'options'")
			.fetch_optional(&mut *conn)
			.await?;
	if options_table.is_none() {
		return Ok(0);
	}

	let stored: Option<(Option<String>,)> =
		sqlx::query_as("SELECT value FROM options WHERE name = ?")
			.bind(SCHEMA_VERSION_OPTION)
			.fetch_optional(&mut *conn)
			.await?;

	match stored {
		None | Some((None,)) => Ok(0),
		Some((Some(value),)) => match value.trim().parse::<i64>() {
			Ok(version) if version >= 0 => Ok(version),
			_ => Err(RepoError::Migration(format!(
				"invalid stored schema version {value:?}"
			))),
		},
	}
}
