//! Poll votes.

use std::collections::BTreeMap;

use rusqlite::{Connection, params};
use serde_json::{Value, json};

use super::{StoreError, Txn};

/// Notification key bumped whenever a vote on `(origin, poll)` changes.
pub fn poll_key(origin: &str, poll: &str) -> String {
    format!("polls:{origin}:{poll}")
}

/// Record `voter`'s answer, replacing any earlier answer from the same voter.
pub fn vote(
    txn: &mut Txn<'_>,
    origin: &str,
    poll: &str,
    voter: &str,
    answer: &str,
) -> Result<(), StoreError> {
    txn.execute(
        "INSERT INTO poll_votes (origin, poll, voter, answer) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(origin, poll, voter) DO UPDATE SET answer = excluded.answer",
        params![origin, poll, voter, answer],
    )?;
    txn.notify(&[poll_key(origin, poll)])?;
    Ok(())
}

/// Current tally as `{"votes": n, "answers": {answer: count}}`.
pub fn results(conn: &Connection, origin: &str, poll: &str) -> Result<Value, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT answer, COUNT(*) FROM poll_votes
         WHERE origin = ?1 AND poll = ?2
         GROUP BY answer",
    )?;
    let rows = stmt.query_map(params![origin, poll], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut answers = BTreeMap::new();
    let mut votes = 0;
    for row in rows {
        let (answer, count) = row?;
        votes += count;
        answers.insert(answer, count);
    }
    Ok(json!({ "votes": votes, "answers": answers }))
}
