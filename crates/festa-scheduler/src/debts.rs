//! Debt deadlines: collect what the borrower can pay and apply the
//! influence penalty once `return_deadline` passes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use festa_core::types::{DebtId, PlayerId};
use festa_store::ledger::{self, InfluenceEntry, MoneyEntry, Reference};
use festa_store::{format_ts, parse_ts, Store};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::lifecycle::RunFlag;
use crate::registry::{Rearm, TimerRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebtRow {
    pub id: DebtId,
    pub lender_player_id: PlayerId,
    pub borrower_player_id: PlayerId,
    pub loan_amount: i64,
    pub return_amount: i64,
    pub return_deadline: DateTime<Utc>,
    pub is_returned: bool,
    pub penalty_applied: bool,
}

/// Result of one deadline fire transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebtOutcome {
    Penalized {
        collected: i64,
        influence_penalty: i64,
    },
    AlreadyReturned,
    AlreadyPenalized,
    Missing,
}

pub fn load_debt(conn: &Connection, id: DebtId) -> Result<Option<DebtRow>> {
    let row = conn
        .query_row(
            "SELECT id, lender_player_id, borrower_player_id, loan_amount, return_amount,
                    return_deadline, is_returned, penalty_applied
             FROM debt_receipts WHERE id = ?1",
            [id],
            |row| {
                Ok((
                    row.get::<_, DebtId>(0)?,
                    row.get::<_, PlayerId>(1)?,
                    row.get::<_, PlayerId>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, bool>(7)?,
                ))
            },
        )
        .optional()?;

    let Some((id, lender, borrower, loan, ret, deadline, is_returned, penalty_applied)) = row else {
        return Ok(None);
    };
    Ok(Some(DebtRow {
        id,
        lender_player_id: lender,
        borrower_player_id: borrower,
        loan_amount: loan,
        return_amount: ret,
        return_deadline: parse_ts(&deadline)?,
        is_returned,
        penalty_applied,
    }))
}

/// `(id, return_deadline)` of every debt neither returned nor penalised,
/// overdue ones included.
pub fn load_open_deadlines(conn: &Connection) -> Result<Vec<(DebtId, DateTime<Utc>)>> {
    let mut stmt = conn.prepare(
        "SELECT id, return_deadline FROM debt_receipts
         WHERE is_returned = 0 AND penalty_applied = 0
         ORDER BY return_deadline",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, DebtId>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut deadlines = Vec::with_capacity(rows.len());
    for (id, deadline) in rows {
        match parse_ts(&deadline) {
            Ok(ts) => deadlines.push((id, ts)),
            Err(e) => warn!(debt_id = id, "skipping debt with bad return_deadline: {e}"),
        }
    }
    Ok(deadlines)
}

/// Influence points taken from a defaulting borrower: the most recent
/// settings row, or 0 when there is none or it cannot be read.
pub fn current_penalty_points(conn: &Connection) -> i64 {
    let points = conn
        .query_row(
            "SELECT penalty_influence_points FROM debt_penalty_settings ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get::<_, i64>(0),
        )
        .optional();
    match points {
        Ok(points) => points.unwrap_or(0),
        Err(e) => {
            warn!("failed to read debt penalty settings, using 0: {e}");
            0
        }
    }
}

/// Deadline fire body. Run inside a write transaction.
///
/// Moves `min(return_amount, borrower balance)` from borrower to lender,
/// deducts the configured influence (floored at zero) and marks the receipt
/// penalised. Returned or already penalised receipts are left untouched.
pub fn apply_debt_penalty(
    conn: &Connection,
    id: DebtId,
    fired_at: DateTime<Utc>,
) -> Result<DebtOutcome> {
    let Some(debt) = load_debt(conn, id)? else {
        return Ok(DebtOutcome::Missing);
    };
    if debt.is_returned {
        return Ok(DebtOutcome::AlreadyReturned);
    }
    if debt.penalty_applied {
        return Ok(DebtOutcome::AlreadyPenalized);
    }

    let borrower = ledger::balance(conn, debt.borrower_player_id)?.ok_or(
        SchedulerError::PlayerNotFound {
            id: debt.borrower_player_id,
        },
    )?;
    let lender_name = ledger::balance(conn, debt.lender_player_id)?
        .map(|b| b.name)
        .unwrap_or_default();

    let collected = debt.return_amount.min(borrower.money.max(0));
    ledger::add_money(conn, debt.borrower_player_id, -collected)?;
    ledger::add_money(conn, debt.lender_player_id, collected)?;
    ledger::record_money(
        conn,
        &MoneyEntry {
            from: Some(debt.borrower_player_id),
            to: Some(debt.lender_player_id),
            amount: collected,
            kind: "debt",
            reference: Some(Reference::debt_receipt(id)),
            description: format!(
                "Automatic debt collection: {} → {lender_name} (overdue debt #{id}, amount: {collected})",
                borrower.name
            ),
        },
        fired_at,
    )?;

    let influence_penalty = current_penalty_points(conn);
    if influence_penalty > 0 {
        ledger::deduct_influence_floored(conn, debt.borrower_player_id, influence_penalty)?;
        ledger::record_influence(
            conn,
            &InfluenceEntry {
                player: debt.borrower_player_id,
                amount: -influence_penalty,
                kind: "penalty",
                reference: Some(Reference::debt_receipt(id)),
                description: format!(
                    "Penalty for overdue debt #{id}: -{influence_penalty} influence"
                ),
            },
            fired_at,
        )?;
    }

    conn.execute(
        "UPDATE debt_receipts SET penalty_applied = 1, penalty_applied_at = ?1 WHERE id = ?2",
        params![format_ts(fired_at), id],
    )?;

    Ok(DebtOutcome::Penalized {
        collected,
        influence_penalty,
    })
}

struct DebtsInner {
    store: Store,
    timers: TimerRegistry<DebtId>,
    run: RunFlag,
}

/// Timer engine for debt return deadlines. Cheap to clone.
#[derive(Clone)]
pub struct DebtScheduler {
    inner: Arc<DebtsInner>,
}

impl DebtScheduler {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(DebtsInner {
                store,
                timers: TimerRegistry::new("debts"),
                run: RunFlag::new("debts"),
            }),
        }
    }

    /// Arm every open debt. Overdue ones are penalised immediately.
    pub fn start(&self) -> Result<usize> {
        let count = self.inner.run.start_with(|| {
            let deadlines = self.inner.store.read(load_open_deadlines)?;
            for (id, deadline) in &deadlines {
                self.schedule_debt(*id, *deadline);
            }
            Ok(deadlines.len())
        })?;
        info!(count, "debt scheduler started");
        Ok(count)
    }

    pub fn stop(&self) {
        let was_running = self.inner.run.stop();
        let cancelled = self.inner.timers.stop_all();
        if was_running || cancelled > 0 {
            info!(cancelled, "debt scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.run.is_running()
    }

    pub fn schedule_debt(&self, id: DebtId, deadline: DateTime<Utc>) {
        let this = self.clone();
        self.inner.timers.schedule(id, deadline, move |id| {
            let this = this.clone();
            async move { this.fire(id).await }
        });
        debug!(debt_id = id, deadline = %deadline, "debt deadline scheduled");
    }

    /// Disarm a debt deadline, typically because the debt was returned.
    pub fn cancel_debt(&self, id: DebtId) -> bool {
        let cancelled = self.inner.timers.cancel(&id);
        if cancelled {
            debug!(debt_id = id, "debt deadline cancelled");
        }
        cancelled
    }

    pub fn scheduled_count(&self) -> usize {
        self.inner.timers.count()
    }

    pub fn due_at(&self, id: DebtId) -> Option<DateTime<Utc>> {
        self.inner.timers.due_at(&id)
    }

    async fn fire(&self, id: DebtId) -> Rearm {
        let fired_at = Utc::now();
        let store = self.inner.store.clone();
        let result = tokio::task::spawn_blocking(move || {
            store.write(|tx| apply_debt_penalty(tx, id, fired_at))
        })
        .await
        .map_err(|e| SchedulerError::Task(e.to_string()))
        .and_then(|r| r);

        match result {
            Ok(DebtOutcome::Penalized {
                collected,
                influence_penalty,
            }) => info!(debt_id = id, collected, influence_penalty, "overdue debt penalised"),
            Ok(DebtOutcome::AlreadyReturned) => {
                debug!(debt_id = id, "debt already returned, skipping")
            }
            Ok(DebtOutcome::AlreadyPenalized) => {
                debug!(debt_id = id, "debt already penalised, skipping")
            }
            Ok(DebtOutcome::Missing) => {
                warn!(debt_id = id, "debt receipt vanished before its deadline")
            }
            Err(e) => error!(debt_id = id, "debt penalty failed: {e}"),
        }
        Rearm::Done
    }
}
