//! Balance and possession primitives.
//!
//! Each helper issues exactly one statement against the caller's connection
//! or transaction. Callers pair every mutation with its `record_*` entry
//! inside one [`crate::Store::write`] closure.

use chrono::{DateTime, Utc};
use festa_core::types::{EffectId, ItemId, PlayerId};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::store::format_ts;

/// What a ledger row points back at (`reference_id`, `reference_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub id: i64,
    pub kind: &'static str,
}

impl Reference {
    pub fn contract(id: i64) -> Self {
        Self { id, kind: "contract" }
    }

    pub fn debt_receipt(id: i64) -> Self {
        Self {
            id,
            kind: "debt_receipt",
        }
    }

    pub fn effect(id: EffectId) -> Self {
        Self { id, kind: "effect" }
    }
}

#[derive(Debug, Clone)]
pub struct MoneyEntry {
    pub from: Option<PlayerId>,
    pub to: Option<PlayerId>,
    pub amount: i64,
    /// `transaction_type` column: contract, debt, item_effect, transfer.
    pub kind: &'static str,
    pub reference: Option<Reference>,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct InfluenceEntry {
    pub player: PlayerId,
    pub amount: i64,
    pub kind: &'static str,
    pub reference: Option<Reference>,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct ItemEntry {
    pub from: Option<PlayerId>,
    pub to: Option<PlayerId>,
    pub item: ItemId,
    pub kind: &'static str,
    pub reference: Option<Reference>,
    pub description: String,
}

/// Money and influence of one player as currently stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Balance {
    pub name: String,
    pub money: i64,
    pub influence: i64,
}

/// An effect attached to an item, with its period in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemEffect {
    pub effect_id: EffectId,
    pub period_secs: i64,
}

pub fn balance(conn: &Connection, player: PlayerId) -> Result<Option<Balance>> {
    let balance = conn
        .query_row(
            "SELECT character_name, money, influence FROM players WHERE id = ?1",
            [player],
            |row| {
                Ok(Balance {
                    name: row.get(0)?,
                    money: row.get(1)?,
                    influence: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(balance)
}

pub fn add_money(conn: &Connection, player: PlayerId, delta: i64) -> Result<()> {
    conn.execute(
        "UPDATE players SET money = money + ?1 WHERE id = ?2",
        params![delta, player],
    )?;
    Ok(())
}

pub fn add_influence(conn: &Connection, player: PlayerId, delta: i64) -> Result<()> {
    conn.execute(
        "UPDATE players SET influence = influence + ?1 WHERE id = ?2",
        params![delta, player],
    )?;
    Ok(())
}

/// Subtract `amount` of money, never going below zero.
pub fn deduct_money_floored(conn: &Connection, player: PlayerId, amount: i64) -> Result<()> {
    conn.execute(
        "UPDATE players SET money = MAX(0, money - ?1) WHERE id = ?2",
        params![amount, player],
    )?;
    Ok(())
}

/// Subtract `points` of influence, never going below zero.
pub fn deduct_influence_floored(conn: &Connection, player: PlayerId, points: i64) -> Result<()> {
    conn.execute(
        "UPDATE players SET influence = MAX(0, influence - ?1) WHERE id = ?2",
        params![points, player],
    )?;
    Ok(())
}

pub fn record_money(conn: &Connection, entry: &MoneyEntry, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO money_transactions
         (from_player_id, to_player_id, amount, transaction_type,
          reference_id, reference_type, description, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
        params![
            entry.from,
            entry.to,
            entry.amount,
            entry.kind,
            entry.reference.map(|r| r.id),
            entry.reference.map(|r| r.kind),
            entry.description,
            format_ts(at),
        ],
    )?;
    Ok(())
}

pub fn record_influence(
    conn: &Connection,
    entry: &InfluenceEntry,
    at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO influence_transactions
         (player_id, amount, transaction_type, reference_id, reference_type,
          description, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7)",
        params![
            entry.player,
            entry.amount,
            entry.kind,
            entry.reference.map(|r| r.id),
            entry.reference.map(|r| r.kind),
            entry.description,
            format_ts(at),
        ],
    )?;
    Ok(())
}

pub fn record_item(conn: &Connection, entry: &ItemEntry, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO item_transactions
         (from_player_id, to_player_id, item_id, transaction_type,
          reference_id, reference_type, description, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
        params![
            entry.from,
            entry.to,
            entry.item,
            entry.kind,
            entry.reference.map(|r| r.id),
            entry.reference.map(|r| r.kind),
            entry.description,
            format_ts(at),
        ],
    )?;
    Ok(())
}

pub fn holds_item(conn: &Connection, player: PlayerId, item: ItemId) -> Result<bool> {
    let held: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM player_items WHERE player_id = ?1 AND item_id = ?2)",
        params![player, item],
        |row| row.get(0),
    )?;
    Ok(held)
}

pub fn item_name(conn: &Connection, item: ItemId) -> Result<Option<String>> {
    let name = conn
        .query_row("SELECT name FROM items WHERE id = ?1", [item], |row| row.get(0))
        .optional()?;
    Ok(name)
}

pub fn item_effects(conn: &Connection, item: ItemId) -> Result<Vec<ItemEffect>> {
    let mut stmt = conn.prepare_cached(
        "SELECT e.id, e.period_seconds
         FROM item_effects ie
         JOIN effects e ON ie.effect_id = e.id
         WHERE ie.item_id = ?1
         ORDER BY e.id",
    )?;
    let effects = stmt
        .query_map([item], |row| {
            Ok(ItemEffect {
                effect_id: row.get(0)?,
                period_secs: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(effects)
}

/// Give `item` to `player` and baseline its effects at `baseline`.
///
/// Possession is idempotent (a player holds at most one of each item). Every
/// effect of the item gets `last_executed_at = baseline`, so the first payout
/// lands one full period later. Returns the effects the caller must arm once
/// the transaction has committed.
pub fn grant_item(
    conn: &Connection,
    player: PlayerId,
    item: ItemId,
    baseline: DateTime<Utc>,
) -> Result<Vec<ItemEffect>> {
    let at = format_ts(baseline);
    conn.execute(
        "INSERT INTO player_items (player_id, item_id, acquired_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (player_id, item_id) DO NOTHING",
        params![player, item, at],
    )?;
    baseline_item_effects(conn, player, item, baseline)?;
    item_effects(conn, item)
}

/// Upsert `last_executed_at = baseline` for every effect of a held item.
pub fn baseline_item_effects(
    conn: &Connection,
    player: PlayerId,
    item: ItemId,
    baseline: DateTime<Utc>,
) -> Result<usize> {
    let n = conn.execute(
        "INSERT INTO item_effect_executions (player_id, item_id, effect_id, last_executed_at)
         SELECT ?1, ie.item_id, ie.effect_id, ?3
         FROM item_effects ie
         WHERE ie.item_id = ?2
         ON CONFLICT (player_id, item_id, effect_id)
         DO UPDATE SET last_executed_at = excluded.last_executed_at",
        params![player, item, format_ts(baseline)],
    )?;
    Ok(n)
}

/// Remove `item` from `player`, together with its execution history.
/// Returns false when the player did not hold it.
pub fn release_item(conn: &Connection, player: PlayerId, item: ItemId) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM player_items WHERE player_id = ?1 AND item_id = ?2",
        params![player, item],
    )?;
    conn.execute(
        "DELETE FROM item_effect_executions WHERE player_id = ?1 AND item_id = ?2",
        params![player, item],
    )?;
    Ok(removed > 0)
}

/// Upsert the `last_executed_at` of one (player, item, effect) triple.
pub fn mark_effect_executed(
    conn: &Connection,
    player: PlayerId,
    item: ItemId,
    effect: EffectId,
    at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO item_effect_executions (player_id, item_id, effect_id, last_executed_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (player_id, item_id, effect_id)
         DO UPDATE SET last_executed_at = excluded.last_executed_at",
        params![player, item, effect, format_ts(at)],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_ts, Store, StoreError};

    fn seeded() -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .write(|tx| {
                tx.execute_batch(
                    "INSERT INTO players (id, character_name, money, influence) VALUES (1, 'Ada', 50, 3);
                     INSERT INTO items (id, name) VALUES (10, 'Lantern');
                     INSERT INTO effects (id, effect_type, operation, value, period_seconds)
                         VALUES (100, 'generate_money', 'add', 5, 60),
                                (101, 'generate_influence', 'add', 1, 120);
                     INSERT INTO item_effects (item_id, effect_id) VALUES (10, 100), (10, 101);",
                )
                .map_err(StoreError::from)
            })
            .unwrap();
        store
    }

    #[test]
    fn influence_deduction_floors_at_zero() {
        let store = seeded();
        store
            .write(|tx| deduct_influence_floored(tx, 1, 10))
            .unwrap();
        let b = store.read(|conn| balance(conn, 1)).unwrap().unwrap();
        assert_eq!(b.influence, 0);
        assert_eq!(b.money, 50);
    }

    #[test]
    fn money_deduction_floors_at_zero() {
        let store = seeded();
        store.write(|tx| deduct_money_floored(tx, 1, 20)).unwrap();
        assert_eq!(store.read(|conn| balance(conn, 1)).unwrap().unwrap().money, 30);
        store.write(|tx| deduct_money_floored(tx, 1, 80)).unwrap();
        assert_eq!(store.read(|conn| balance(conn, 1)).unwrap().unwrap().money, 0);
    }

    #[test]
    fn grant_item_baselines_every_effect() {
        let store = seeded();
        let baseline = parse_ts("2026-01-01T00:00:00Z").unwrap();
        let effects = store.write(|tx| grant_item(tx, 1, 10, baseline)).unwrap();
        assert_eq!(
            effects,
            vec![
                ItemEffect { effect_id: 100, period_secs: 60 },
                ItemEffect { effect_id: 101, period_secs: 120 },
            ]
        );

        let rows: Vec<String> = store
            .read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT last_executed_at FROM item_effect_executions
                     WHERE player_id = 1 AND item_id = 10 ORDER BY effect_id",
                )?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok::<_, StoreError>(rows)
            })
            .unwrap();
        assert_eq!(rows, vec![format_ts(baseline), format_ts(baseline)]);
        assert!(store.read(|conn| holds_item(conn, 1, 10)).unwrap());
    }

    #[test]
    fn granting_twice_keeps_one_possession_row() {
        let store = seeded();
        let now = Utc::now();
        store.write(|tx| grant_item(tx, 1, 10, now)).unwrap();
        store.write(|tx| grant_item(tx, 1, 10, now)).unwrap();
        let count: i64 = store
            .read(|conn| {
                conn.query_row("SELECT COUNT(*) FROM player_items", [], |row| row.get(0))
                    .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn release_item_reports_whether_it_was_held() {
        let store = seeded();
        store.write(|tx| grant_item(tx, 1, 10, Utc::now())).unwrap();
        assert!(store.write(|tx| release_item(tx, 1, 10)).unwrap());
        assert!(!store.write(|tx| release_item(tx, 1, 10)).unwrap());
        assert!(!store.read(|conn| holds_item(conn, 1, 10)).unwrap());
    }
}
