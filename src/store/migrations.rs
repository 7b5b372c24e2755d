//! Embedded schema migrations.
//!
//! Each migration runs once, inside its own transaction, and is recorded in
//! `_livesite_migrations`. New migrations are appended to [`MIGRATIONS`].

use rusqlite::Connection;

use super::StoreError;

struct Migration {
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000_notifications",
        sql: "CREATE TABLE notifications (
                  key TEXT PRIMARY KEY NOT NULL,
                  seq INTEGER NOT NULL
              ) WITHOUT ROWID;",
    },
    Migration {
        name: "001_poll_votes",
        sql: "CREATE TABLE poll_votes (
                  origin TEXT NOT NULL,
                  poll TEXT NOT NULL,
                  voter TEXT NOT NULL,
                  answer TEXT NOT NULL,
                  PRIMARY KEY (origin, poll, voter)
              ) WITHOUT ROWID;",
    },
    Migration {
        name: "002_solutions",
        sql: "CREATE TABLE solutions (
                  page TEXT PRIMARY KEY NOT NULL,
                  visible INTEGER NOT NULL DEFAULT 0
              ) WITHOUT ROWID;",
    },
];

/// Apply pending migrations, returning how many ran.
pub fn run_migrations(conn: &Connection) -> Result<usize, StoreError> {
    run_migration_list(conn, MIGRATIONS)
}

fn run_migration_list(conn: &Connection, migrations: &[Migration]) -> Result<usize, StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _livesite_migrations (
            name TEXT PRIMARY KEY NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|source| StoreError::Migration {
        name: "_livesite_migrations",
        source,
    })?;

    let mut applied = 0;
    for migration in migrations {
        let fail = |source| StoreError::Migration {
            name: migration.name,
            source,
        };

        let done: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM _livesite_migrations WHERE name = ?1",
                [migration.name],
                |row| row.get(0),
            )
            .map_err(fail)?;
        if done {
            continue;
        }

        let tx = conn.unchecked_transaction().map_err(fail)?;
        tx.execute_batch(migration.sql).map_err(fail)?;
        tx.execute(
            "INSERT INTO _livesite_migrations (name) VALUES (?1)",
            [migration.name],
        )
        .map_err(fail)?;
        tx.commit().map_err(fail)?;
        applied += 1;
    }

    Ok(applied)
}
