use anyhow::{Context, Result};
use sqlx::{Connection, SqliteConnection, sqlite::SqliteConnectOptions};
use std::env;

use crate::db::migrations::DbPaths;

/// Opens the index database (write-locked or read-only) and attaches
/// `user_data` alongside it, the same split the compiler's queries assume:
/// index-local tables unqualified, `user_data.bookmarks` schema-qualified.
pub(crate) async fn connect_db(paths: &DbPaths, write_lock: bool) -> Result<SqliteConnection> {
    let readonly_mode = env::var("READONLY")
        .ok()
        .map(|value| matches!(value.to_lowercase().as_str(), "true" | "1"))
        .unwrap_or(false);
    let write_lock = write_lock && !readonly_mode;

    let mut conn = if write_lock {
        let options = SqliteConnectOptions::new()
            .filename(&paths.index_db_file)
            .create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&options)
            .await
            .context("failed to open index database")?;
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&mut conn)
            .await
            .context("failed to enable WAL mode")?;
        conn
    } else {
        let options = SqliteConnectOptions::new()
            .filename(&paths.index_db_file)
            .read_only(true);
        SqliteConnection::connect_with(&options)
            .await
            .context("failed to open index database")?
    };

    sqlx::query("ATTACH DATABASE ? AS user_data")
        .bind(paths.user_db_file.to_string_lossy().to_string())
        .execute(&mut conn)
        .await
        .context("failed to attach user data database")?;
    if write_lock {
        sqlx::query("PRAGMA user_data.journal_mode=WAL")
            .execute(&mut conn)
            .await
            .context("failed to enable WAL for user data")?;
    }

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&mut conn)
        .await
        .context("failed to enable foreign keys")?;
    sqlx::query("PRAGMA case_sensitive_like = ON")
        .execute(&mut conn)
        .await
        .context("failed to enable case-sensitive LIKE")?;

    Ok(conn)
}
