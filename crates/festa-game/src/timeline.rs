//! Game timeline rows. Only the latest row matters.

use chrono::{DateTime, Utc};
use festa_core::types::GamePhase;
use festa_store::{format_ts, parse_ts};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeline {
    pub id: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Timeline {
    pub fn phase(&self) -> GamePhase {
        match (self.started_at, self.ended_at) {
            (Some(_), None) => GamePhase::Running,
            (Some(_), Some(_)) => GamePhase::Ended,
            (None, _) => GamePhase::NotStarted,
        }
    }
}

pub fn phase_of(timeline: Option<&Timeline>) -> GamePhase {
    timeline.map_or(GamePhase::NotStarted, Timeline::phase)
}

pub fn latest(conn: &Connection) -> Result<Option<Timeline>> {
    let row = conn
        .query_row(
            "SELECT id, game_started_at, game_ended_at FROM game_timeline ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((id, started, ended)) = row else {
        return Ok(None);
    };
    Ok(Some(Timeline {
        id,
        started_at: started.as_deref().map(parse_ts).transpose()?,
        ended_at: ended.as_deref().map(parse_ts).transpose()?,
    }))
}

pub fn open(conn: &Connection, at: DateTime<Utc>) -> Result<i64> {
    conn.execute(
        "INSERT INTO game_timeline (game_started_at) VALUES (?1)",
        [format_ts(at)],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn close(conn: &Connection, id: i64, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE game_timeline SET game_ended_at = ?1 WHERE id = ?2",
        params![format_ts(at), id],
    )?;
    Ok(())
}

/// Reset `last_executed_at` of every held effect to `at`, so no effect pays
/// out for time before the game started. Returns rows touched.
pub fn baseline_all_effects(conn: &Connection, at: DateTime<Utc>) -> Result<usize> {
    let n = conn.execute(
        "INSERT INTO item_effect_executions (player_id, item_id, effect_id, last_executed_at)
         SELECT pi.player_id, pi.item_id, ie.effect_id, ?1
         FROM player_items pi
         JOIN item_effects ie ON ie.item_id = pi.item_id
         WHERE true
         ON CONFLICT (player_id, item_id, effect_id)
         DO UPDATE SET last_executed_at = excluded.last_executed_at",
        [format_ts(at)],
    )?;
    Ok(n)
}
