// src/db/mod.rs

//! Trove store on SQLite
//!
//! This module handles:
//! - Database initialization and schema migration
//! - Connection management
//! - Write transactions for the commit pipeline
//!
//! Row-level access lives in `models`.

pub mod models;
pub mod schema;

use crate::error::{Error, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use tracing::{debug, info, warn};

/// Initialize a trove store at the specified path
///
/// Creates the database file and brings the schema up to date.
/// This is idempotent - calling it on an existing database is safe.
pub fn init(db_path: &str) -> Result<Connection> {
    debug!("Initializing database at: {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::InitError(format!("Failed to create database directory: {}", e)))?;
    }

    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;
    schema::migrate(&conn)?;

    info!("Database initialized successfully");
    Ok(conn)
}

/// Open an existing trove store
pub fn open(db_path: &str) -> Result<Connection> {
    if !Path::new(db_path).exists() {
        return Err(Error::DatabaseNotFound(db_path.to_string()));
    }

    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;
    schema::migrate(&conn)?;

    Ok(conn)
}

/// Run `f` inside a write transaction
///
/// The transaction takes the write lock up front, so concurrent writers
/// serialize on it and readers never see a partial batch. It commits when
/// `f` returns `Ok` and rolls back otherwise.
pub fn transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction) -> Result<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    match f(&tx) {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback() {
                warn!("Rollback failed after error '{}': {}", e, rollback);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_init_creates_database() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap().to_string();

        // Remove the temp file so init can create it
        drop(temp_file);

        let conn = init(&db_path).unwrap();
        assert!(Path::new(&db_path).exists());
        assert_eq!(
            schema::get_schema_version(&conn).unwrap(),
            schema::SCHEMA_VERSION
        );
    }

    #[test]
    fn test_open_existing_database() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();

        init(db_path).unwrap();
        assert!(open(db_path).is_ok());
    }

    #[test]
    fn test_open_nonexistent_database() {
        let result = open("/nonexistent/path/db.sqlite");
        assert!(matches!(result.unwrap_err(), Error::DatabaseNotFound(_)));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut conn = init(temp_file.path().to_str().unwrap()).unwrap();

        let result: Result<()> = transaction(&mut conn, |tx| {
            tx.execute(
                "INSERT INTO file_streams (file_id, version, sha1, is_config) VALUES ('a', 'v', 's', 0)",
                [],
            )?;
            Err(Error::CommitError("abort".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM file_streams", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        transaction(&mut conn, |tx| {
            tx.execute(
                "INSERT INTO file_streams (file_id, version, sha1, is_config) VALUES ('a', 'v', 's', 0)",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM file_streams", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
