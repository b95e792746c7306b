//! Item possession changes that start or move effect timers.

use chrono::{DateTime, Utc};
use festa_core::types::{ItemId, PlayerId};
use festa_scheduler::GrantedItem;
use festa_store::ledger::{self, ItemEntry};
use rusqlite::Connection;

use crate::error::{GameError, Result};

fn item_name(conn: &Connection, item: ItemId) -> Result<String> {
    ledger::item_name(conn, item)?.ok_or_else(|| GameError::NotFound(format!("item {item}")))
}

fn require_player(conn: &Connection, player: PlayerId) -> Result<()> {
    match ledger::balance(conn, player)? {
        Some(_) => Ok(()),
        None => Err(GameError::NotFound(format!("player {player}"))),
    }
}

/// Admin grant. Effects are baselined at `at`, so the first payout lands one
/// period later.
pub fn grant(
    conn: &Connection,
    player: PlayerId,
    item: ItemId,
    at: DateTime<Utc>,
) -> Result<GrantedItem> {
    require_player(conn, player)?;
    let name = item_name(conn, item)?;
    if ledger::holds_item(conn, player, item)? {
        return Err(GameError::InvalidState(format!(
            "player {player} already holds item {item}"
        )));
    }
    let effects = ledger::grant_item(conn, player, item, at)?;
    ledger::record_item(
        conn,
        &ItemEntry {
            from: None,
            to: Some(player),
            item,
            kind: "grant",
            reference: None,
            description: format!("Item grant: {name}"),
        },
        at,
    )?;
    Ok(GrantedItem {
        player_id: player,
        item_id: item,
        effects,
    })
}

/// Hand an item to another player. The recipient's effects restart from
/// `at`; the sender's execution history for the item is dropped.
pub fn transfer(
    conn: &Connection,
    from: PlayerId,
    to: PlayerId,
    item: ItemId,
    at: DateTime<Utc>,
) -> Result<GrantedItem> {
    if from == to {
        return Err(GameError::Validation(
            "cannot transfer an item to yourself".into(),
        ));
    }
    require_player(conn, to)?;
    if !ledger::holds_item(conn, from, item)? {
        return Err(GameError::NotFound(format!(
            "item {item} in inventory of player {from}"
        )));
    }
    let name = item_name(conn, item)?;

    ledger::release_item(conn, from, item)?;
    let effects = ledger::grant_item(conn, to, item, at)?;
    ledger::record_item(
        conn,
        &ItemEntry {
            from: Some(from),
            to: Some(to),
            item,
            kind: "transfer",
            reference: None,
            description: format!("Item transfer: {name}"),
        },
        at,
    )?;
    Ok(GrantedItem {
        player_id: to,
        item_id: item,
        effects,
    })
}
