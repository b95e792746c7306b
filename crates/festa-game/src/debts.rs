//! Debt receipt actions, run inside the caller's write transaction.

use chrono::{DateTime, Duration, Utc};
use festa_core::types::{DebtId, PlayerId};
use festa_scheduler::debts::load_debt;
use festa_store::format_ts;
use festa_store::ledger::{self, Balance, MoneyEntry, Reference};
use rusqlite::{params, Connection};

use crate::deadline;
use crate::error::{GameError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewDebt {
    pub lender_player_id: PlayerId,
    pub borrower_player_id: PlayerId,
    pub loan_amount: i64,
    pub return_amount: i64,
    pub deadline_minutes: i64,
}

impl NewDebt {
    fn validate(&self) -> Result<()> {
        if self.loan_amount <= 0 {
            return Err(GameError::Validation("loan amount must be positive".into()));
        }
        if self.return_amount <= 0 {
            return Err(GameError::Validation("return amount must be positive".into()));
        }
        if self.return_amount < self.loan_amount {
            return Err(GameError::Validation(
                "return amount must be at least the loan amount".into(),
            ));
        }
        if self.deadline_minutes <= 0 {
            return Err(GameError::Validation("deadline must be positive".into()));
        }
        if self.lender_player_id == self.borrower_player_id {
            return Err(GameError::Validation(
                "cannot issue a debt receipt to yourself".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuedDebt {
    pub id: DebtId,
    pub return_deadline: DateTime<Utc>,
}

fn player(conn: &Connection, id: PlayerId, role: &str) -> Result<Balance> {
    ledger::balance(conn, id)?.ok_or_else(|| GameError::NotFound(format!("{role} player {id}")))
}

fn transfer_money(
    conn: &Connection,
    from: PlayerId,
    to: PlayerId,
    amount: i64,
    debt: DebtId,
    description: String,
    at: DateTime<Utc>,
) -> Result<()> {
    ledger::add_money(conn, from, -amount)?;
    ledger::add_money(conn, to, amount)?;
    ledger::record_money(
        conn,
        &MoneyEntry {
            from: Some(from),
            to: Some(to),
            amount,
            kind: "debt",
            reference: Some(Reference::debt_receipt(debt)),
            description,
        },
        at,
    )?;
    Ok(())
}

/// Lend money against a receipt due `deadline_minutes` from `at`.
pub fn issue(conn: &Connection, terms: &NewDebt, at: DateTime<Utc>) -> Result<IssuedDebt> {
    terms.validate()?;
    let lender = player(conn, terms.lender_player_id, "lender")?;
    if lender.money < terms.loan_amount {
        return Err(GameError::InsufficientFunds {
            required: terms.loan_amount,
            available: lender.money,
        });
    }
    let borrower = player(conn, terms.borrower_player_id, "borrower")?;

    let return_deadline = deadline::after(
        at,
        Duration::try_minutes(terms.deadline_minutes),
        "debt deadline",
    )?;
    conn.execute(
        "INSERT INTO debt_receipts (lender_player_id, borrower_player_id, loan_amount,
             return_amount, created_at, return_deadline, is_returned, penalty_applied)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0)",
        params![
            terms.lender_player_id,
            terms.borrower_player_id,
            terms.loan_amount,
            terms.return_amount,
            format_ts(at),
            format_ts(return_deadline),
        ],
    )?;
    let id = conn.last_insert_rowid();

    transfer_money(
        conn,
        terms.lender_player_id,
        terms.borrower_player_id,
        terms.loan_amount,
        id,
        format!(
            "Debt loan: {} → {} (debt #{id}, amount: {}, to return: {})",
            lender.name, borrower.name, terms.loan_amount, terms.return_amount
        ),
        at,
    )?;
    Ok(IssuedDebt {
        id,
        return_deadline,
    })
}

/// Lender confirms repayment. The borrower must cover the full amount.
/// Returns the amount moved.
pub fn confirm_return(
    conn: &Connection,
    id: DebtId,
    lender: PlayerId,
    at: DateTime<Utc>,
) -> Result<i64> {
    let debt = load_debt(conn, id)?
        .ok_or_else(|| GameError::NotFound(format!("debt receipt {id}")))?;
    if debt.lender_player_id != lender {
        return Err(GameError::Forbidden(
            "only the lender can confirm a debt return".into(),
        ));
    }
    if debt.is_returned {
        return Err(GameError::InvalidState(format!("debt {id} already returned")));
    }
    if debt.penalty_applied {
        return Err(GameError::InvalidState(format!(
            "penalty already applied to debt {id}, it can no longer be returned"
        )));
    }

    let borrower = player(conn, debt.borrower_player_id, "borrower")?;
    if borrower.money < debt.return_amount {
        return Err(GameError::InsufficientFunds {
            required: debt.return_amount,
            available: borrower.money,
        });
    }
    let lender_name = ledger::balance(conn, lender)?
        .map(|b| b.name)
        .unwrap_or_default();

    transfer_money(
        conn,
        debt.borrower_player_id,
        lender,
        debt.return_amount,
        id,
        format!(
            "Debt return: {} → {lender_name} (debt #{id}, amount: {})",
            borrower.name, debt.return_amount
        ),
        at,
    )?;
    conn.execute(
        "UPDATE debt_receipts SET is_returned = 1, returned_at = ?1 WHERE id = ?2",
        params![format_ts(at), id],
    )?;
    Ok(debt.return_amount)
}

/// Append a penalty settings row; the latest row is the one applied.
pub fn set_penalty(conn: &Connection, points: i64) -> Result<()> {
    if points < 0 {
        return Err(GameError::Validation(
            "penalty points cannot be negative".into(),
        ));
    }
    conn.execute(
        "INSERT INTO debt_penalty_settings (penalty_influence_points) VALUES (?1)",
        [points],
    )?;
    Ok(())
}
