//! Contract actions. Each function runs inside the caller's write
//! transaction; the service arms or disarms the deadline after commit.

use chrono::{DateTime, Duration, Utc};
use festa_core::types::{ContractId, ContractKind, ContractStatus, FactionId, PlayerId};
use festa_scheduler::contracts::{complete_contract, load_contract, Completion, ContractRow};
use festa_scheduler::GrantedItem;
use festa_store::format_ts;
use festa_store::ledger::{self, InfluenceEntry, MoneyEntry, Reference};
use rusqlite::{params, Connection, OptionalExtension};

use crate::deadline;
use crate::error::{GameError, Result};

/// Terms of a new contract, proposed by the executor. Rewards are not part
/// of the terms; they come from the admin reward settings at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContract {
    pub kind: ContractKind,
    pub customer_player_id: PlayerId,
    pub duration_seconds: i64,
}

/// Penalty charged to a customer who signs while already bound to a signed
/// contract with another faction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConflictPenalty {
    pub money: i64,
    pub influence: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedContract {
    pub id: ContractId,
    pub signed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub penalty: Option<ConflictPenalty>,
}

pub const DEFAULT_TERMINATION_REASON: &str = "Terminated by admin";

const CONFLICT_PENALTY_DESCRIPTION: &str = "Faction conflict penalty";

fn require(conn: &Connection, id: ContractId) -> Result<ContractRow> {
    load_contract(conn, id)?.ok_or_else(|| GameError::NotFound(format!("contract {id}")))
}

fn status_of(contract: &ContractRow) -> Result<ContractStatus> {
    contract.status.parse().map_err(GameError::InvalidState)
}

/// Current `(customer, executor)` money rewards for `kind`. `type2`
/// contracts never pay the customer.
pub fn reward_settings(conn: &Connection, kind: ContractKind) -> Result<(i64, i64)> {
    let rewards: Option<(i64, i64)> = match kind {
        ContractKind::Type1 => conn
            .query_row(
                "SELECT money_reward_customer, money_reward_executor
                 FROM contract_type1_reward_settings ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?,
        ContractKind::Type2 => conn
            .query_row(
                "SELECT money_reward_executor
                 FROM contract_type2_reward_settings ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((0, row.get(0)?)),
            )
            .optional()?,
    };
    rewards.ok_or_else(|| {
        GameError::InvalidState(format!("contract {kind} rewards are not configured"))
    })
}

/// Append a reward settings row for `kind`. The customer reward is ignored
/// for `type2`.
pub fn set_rewards(
    conn: &Connection,
    kind: ContractKind,
    customer_reward: i64,
    executor_reward: i64,
) -> Result<()> {
    if customer_reward < 0 || executor_reward < 0 {
        return Err(GameError::Validation(
            "contract rewards cannot be negative".into(),
        ));
    }
    match kind {
        ContractKind::Type1 => conn.execute(
            "INSERT INTO contract_type1_reward_settings
                 (money_reward_customer, money_reward_executor)
             VALUES (?1, ?2)",
            params![customer_reward, executor_reward],
        )?,
        ContractKind::Type2 => conn.execute(
            "INSERT INTO contract_type2_reward_settings (money_reward_executor) VALUES (?1)",
            [executor_reward],
        )?,
    };
    Ok(())
}

/// Latest faction-conflict penalty; zero when never configured.
pub fn conflict_penalty_settings(conn: &Connection) -> Result<ConflictPenalty> {
    let penalty = conn
        .query_row(
            "SELECT money_penalty, influence_penalty
             FROM contract_penalty_settings ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                Ok(ConflictPenalty {
                    money: row.get(0)?,
                    influence: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(penalty.unwrap_or_default())
}

pub fn set_conflict_penalty(conn: &Connection, penalty: ConflictPenalty) -> Result<()> {
    if penalty.money < 0 || penalty.influence < 0 {
        return Err(GameError::Validation(
            "contract penalties cannot be negative".into(),
        ));
    }
    conn.execute(
        "INSERT INTO contract_penalty_settings (money_penalty, influence_penalty)
         VALUES (?1, ?2)",
        params![penalty.money, penalty.influence],
    )?;
    Ok(())
}

/// Insert a pending contract with the currently configured rewards.
pub fn create(
    conn: &Connection,
    executor: PlayerId,
    terms: &NewContract,
    at: DateTime<Utc>,
) -> Result<ContractId> {
    if terms.customer_player_id == executor {
        return Err(GameError::Validation(
            "cannot create a contract with yourself".into(),
        ));
    }
    if terms.duration_seconds <= 0 {
        return Err(GameError::Validation("duration must be positive".into()));
    }
    // a contract that could never be signed is rejected up front
    deadline::after(
        at,
        Duration::try_seconds(terms.duration_seconds),
        "contract duration",
    )?;
    if ledger::balance(conn, terms.customer_player_id)?.is_none() {
        return Err(GameError::NotFound(format!(
            "customer player {}",
            terms.customer_player_id
        )));
    }
    let (customer_reward, executor_reward) = reward_settings(conn, terms.kind)?;

    conn.execute(
        "INSERT INTO contracts (contract_type, status, customer_player_id, executor_player_id,
             duration_seconds, money_reward_customer, money_reward_executor, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            terms.kind.as_str(),
            ContractStatus::Pending.as_str(),
            terms.customer_player_id,
            executor,
            terms.duration_seconds,
            customer_reward,
            executor_reward,
            format_ts(at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Faction of the counterpart in some signed contract of `player`, when that
/// faction differs from `faction`.
fn conflicting_faction(
    conn: &Connection,
    player: PlayerId,
    faction: FactionId,
) -> Result<Option<FactionId>> {
    let other = conn
        .query_row(
            "SELECT p.faction_id
             FROM contracts c
             JOIN players p ON p.id = CASE
                 WHEN c.customer_player_id = ?1 THEN c.executor_player_id
                 ELSE c.customer_player_id
             END
             WHERE (c.customer_player_id = ?1 OR c.executor_player_id = ?1)
               AND c.status = ?3
               AND p.faction_id IS NOT NULL
               AND p.faction_id != ?2
             LIMIT 1",
            params![player, faction, ContractStatus::Signed.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(other)
}

/// Charge the configured conflict penalty, floored at zero, and keep a
/// `contract_penalties` row even when both amounts are zero.
fn apply_conflict_penalty(
    conn: &Connection,
    contract: ContractId,
    player: PlayerId,
    at: DateTime<Utc>,
) -> Result<ConflictPenalty> {
    let penalty = conflict_penalty_settings(conn)?;
    if penalty.money > 0 {
        ledger::deduct_money_floored(conn, player, penalty.money)?;
        ledger::record_money(
            conn,
            &MoneyEntry {
                from: Some(player),
                to: None,
                amount: -penalty.money,
                kind: "contract",
                reference: Some(Reference::contract(contract)),
                description: CONFLICT_PENALTY_DESCRIPTION.into(),
            },
            at,
        )?;
    }
    if penalty.influence > 0 {
        ledger::deduct_influence_floored(conn, player, penalty.influence)?;
        ledger::record_influence(
            conn,
            &InfluenceEntry {
                player,
                amount: -penalty.influence,
                kind: "contract",
                reference: Some(Reference::contract(contract)),
                description: CONFLICT_PENALTY_DESCRIPTION.into(),
            },
            at,
        )?;
    }
    conn.execute(
        "INSERT INTO contract_penalties (player_id, contract_id, violation_type,
             money_penalty, influence_penalty, created_at)
         VALUES (?1, ?2, 'faction_conflict', ?3, ?4, ?5)",
        params![
            player,
            contract,
            penalty.money,
            penalty.influence,
            format_ts(at)
        ],
    )?;
    Ok(penalty)
}

/// Customer signs a pending contract; its deadline becomes
/// `at + duration_seconds`. A customer already bound to another faction
/// through a signed contract pays the conflict penalty in the same
/// transaction.
pub fn sign(
    conn: &Connection,
    id: ContractId,
    customer: PlayerId,
    at: DateTime<Utc>,
) -> Result<SignedContract> {
    let contract = require(conn, id)?;
    if contract.customer_player_id != customer {
        return Err(GameError::Forbidden(
            "only the customer can sign the contract".into(),
        ));
    }
    if status_of(&contract)? != ContractStatus::Pending {
        return Err(GameError::InvalidState(format!(
            "contract {id} is {}, not pending",
            contract.status
        )));
    }
    let expires_at = deadline::after(
        at,
        Duration::try_seconds(contract.duration_seconds),
        "contract duration",
    )?;

    let faction: Option<FactionId> = conn.query_row(
        "SELECT faction_id FROM players WHERE id = ?1",
        [customer],
        |row| row.get(0),
    )?;
    let penalty = match faction {
        Some(faction) if conflicting_faction(conn, customer, faction)?.is_some() => {
            Some(apply_conflict_penalty(conn, id, customer, at)?)
        }
        _ => None,
    };

    conn.execute(
        "UPDATE contracts
         SET status = ?1, signed_at = ?2, expires_at = ?3, customer_faction_id = ?4
         WHERE id = ?5",
        params![
            ContractStatus::Signed.as_str(),
            format_ts(at),
            format_ts(expires_at),
            faction,
            id
        ],
    )?;
    Ok(SignedContract {
        id,
        signed_at: at,
        expires_at,
        penalty,
    })
}

/// Customer closes an expired, signed contract by hand. Rewards go through
/// the same path as the deadline timer.
pub fn complete(
    conn: &Connection,
    id: ContractId,
    customer: PlayerId,
    at: DateTime<Utc>,
) -> Result<Option<GrantedItem>> {
    let contract = require(conn, id)?;
    if contract.customer_player_id != customer {
        return Err(GameError::Forbidden(
            "only the customer can complete the contract".into(),
        ));
    }
    if status_of(&contract)? != ContractStatus::Signed {
        return Err(GameError::InvalidState(format!(
            "contract {id} is {}, not signed",
            contract.status
        )));
    }
    match contract.expires_at {
        Some(expires_at) if expires_at <= at => {}
        _ => {
            return Err(GameError::InvalidState(format!(
                "contract {id} has not expired yet"
            )))
        }
    }
    Ok(complete_contract(conn, &contract, Completion::Manual, at)?)
}

/// Admin termination of a pending or signed contract. The reason is kept as
/// a zero-amount money ledger row. Returns the reason recorded.
pub fn terminate(
    conn: &Connection,
    id: ContractId,
    reason: Option<&str>,
    at: DateTime<Utc>,
) -> Result<String> {
    let contract = require(conn, id)?;
    match status_of(&contract)? {
        ContractStatus::Pending | ContractStatus::Signed => {}
        other => {
            return Err(GameError::InvalidState(format!(
                "contract {id} is {other} and cannot be terminated"
            )))
        }
    }

    let reason = reason.unwrap_or(DEFAULT_TERMINATION_REASON).to_string();
    conn.execute(
        "UPDATE contracts SET status = ?1, terminated_at = ?2 WHERE id = ?3",
        params![ContractStatus::Terminated.as_str(), format_ts(at), id],
    )?;
    ledger::record_money(
        conn,
        &MoneyEntry {
            from: None,
            to: None,
            amount: 0,
            kind: "contract",
            reference: Some(Reference::contract(id)),
            description: reason.clone(),
        },
        at,
    )?;
    Ok(reason)
}
