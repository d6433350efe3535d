// src/db/schema.rs

//! Schema definitions and migrations for the trove store
//!
//! Migrations are numbered and applied in order; the applied versions are
//! recorded in `schema_version`.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!(
        "Schema migration complete. Now at version {}",
        SCHEMA_VERSION
    );
    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        _ => Err(Error::InitError(format!(
            "Unknown migration version: {}",
            version
        ))),
    }
}

/// Initial schema - Version 1
///
/// - troves: one row per (name, version, flavor)
/// - trove_files: file map of each trove
/// - trove_members: member trove references
/// - file_streams: contents identity of each file version
/// - trove_signatures: signatures carried in trove info
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        -- version is the timestamp-free string form; frozen_version keeps
        -- the commit timestamps
        CREATE TABLE troves (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            frozen_version TEXT NOT NULL,
            flavor TEXT NOT NULL,
            requires TEXT NOT NULL DEFAULT '',
            provides TEXT NOT NULL DEFAULT '',
            sha1 TEXT,
            trove_version INTEGER NOT NULL,
            incomplete INTEGER NOT NULL DEFAULT 0,
            capsule_kind TEXT,
            capsule_sha1 TEXT,
            capsule_metadata TEXT,
            committed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(name, version, flavor)
        );

        CREATE INDEX idx_troves_name ON troves(name);

        CREATE TABLE trove_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            trove_id INTEGER NOT NULL,
            file_id TEXT NOT NULL,
            path TEXT NOT NULL,
            version TEXT NOT NULL,
            frozen_version TEXT NOT NULL,
            UNIQUE(trove_id, file_id),
            FOREIGN KEY (trove_id) REFERENCES troves(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_trove_files_file ON trove_files(file_id, version);

        CREATE TABLE trove_members (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            trove_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            flavor TEXT NOT NULL,
            FOREIGN KEY (trove_id) REFERENCES troves(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_trove_members_trove ON trove_members(trove_id);

        -- keyed by file id and the timestamp-free version string
        CREATE TABLE file_streams (
            file_id TEXT NOT NULL,
            version TEXT NOT NULL,
            sha1 TEXT NOT NULL,
            is_config INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (file_id, version)
        );

        -- blob collection asks which streams still use a digest
        CREATE INDEX idx_file_streams_sha1 ON file_streams(sha1);

        CREATE TABLE trove_signatures (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            trove_id INTEGER NOT NULL,
            fingerprint TEXT NOT NULL,
            signature TEXT NOT NULL,
            FOREIGN KEY (trove_id) REFERENCES troves(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_trove_signatures_trove ON trove_signatures(trove_id);
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}
