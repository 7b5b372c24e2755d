//! Per-page solution visibility.

use rusqlite::{Connection, OptionalExtension, params};

use super::{StoreError, Txn};

pub fn solutions_key(page: &str) -> String {
    format!("solutions:{page}")
}

/// Show or hide the solutions of `page`.
pub fn set_visible(txn: &mut Txn<'_>, page: &str, visible: bool) -> Result<(), StoreError> {
    txn.execute(
        "INSERT INTO solutions (page, visible) VALUES (?1, ?2)
         ON CONFLICT(page) DO UPDATE SET visible = excluded.visible",
        params![page, visible],
    )?;
    txn.notify(&[solutions_key(page)])?;
    Ok(())
}

/// Pages never toggled are hidden.
pub fn is_visible(conn: &Connection, page: &str) -> Result<bool, StoreError> {
    let visible = conn
        .query_row(
            "SELECT visible FROM solutions WHERE page = ?1",
            [page],
            |row| row.get::<_, bool>(0),
        )
        .optional()?;
    Ok(visible.unwrap_or(false))
}
