//! Contract deadlines: one timer per signed contract, firing at `expires_at`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use festa_core::types::{ContractId, ContractKind, ContractStatus, FactionId, ItemId, PlayerId};
use festa_store::ledger::{self, ItemEntry, MoneyEntry, Reference};
use festa_store::{format_ts, parse_ts, Store};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, info, warn};

use crate::effects::{EffectsScheduler, GrantedItem};
use crate::error::{Result, SchedulerError};
use crate::lifecycle::RunFlag;
use crate::registry::{Rearm, TimerRegistry};

/// A contract row as read inside a write transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractRow {
    pub id: ContractId,
    /// Raw `contract_type`; unknown values complete without rewards.
    pub kind: String,
    pub status: String,
    pub customer_player_id: PlayerId,
    pub executor_player_id: PlayerId,
    pub customer_faction_id: Option<FactionId>,
    pub duration_seconds: i64,
    pub money_reward_customer: i64,
    pub money_reward_executor: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ContractRow {
    pub fn status(&self) -> Option<ContractStatus> {
        self.status.parse().ok()
    }
}

/// Who closed the contract. Only changes the ledger wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The deadline timer fired.
    Expired,
    /// The customer completed it by hand after expiry.
    Manual,
}

impl Completion {
    fn description(self, id: ContractId) -> String {
        match self {
            Completion::Expired => format!("Auto-completed contract {id} reward"),
            Completion::Manual => format!("Contract {id} completion reward"),
        }
    }
}

/// Result of one deadline fire transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractOutcome {
    Completed { granted: Option<GrantedItem> },
    /// No longer signed (completed by hand or terminated). Nothing written.
    Stale { status: String },
    Missing,
}

pub fn load_contract(conn: &Connection, id: ContractId) -> Result<Option<ContractRow>> {
    let row = conn
        .query_row(
            "SELECT id, contract_type, status, customer_player_id, executor_player_id,
                    customer_faction_id, duration_seconds, money_reward_customer,
                    money_reward_executor, expires_at
             FROM contracts WHERE id = ?1",
            [id],
            |row| {
                Ok((
                    ContractRow {
                        id: row.get(0)?,
                        kind: row.get(1)?,
                        status: row.get(2)?,
                        customer_player_id: row.get(3)?,
                        executor_player_id: row.get(4)?,
                        customer_faction_id: row.get(5)?,
                        duration_seconds: row.get(6)?,
                        money_reward_customer: row.get(7)?,
                        money_reward_executor: row.get(8)?,
                        expires_at: None,
                    },
                    row.get::<_, Option<String>>(9)?,
                ))
            },
        )
        .optional()?;

    match row {
        Some((mut contract, expires_at)) => {
            contract.expires_at = expires_at.as_deref().map(parse_ts).transpose()?;
            Ok(Some(contract))
        }
        None => Ok(None),
    }
}

/// `(id, expires_at)` of every signed contract, past-due ones included.
pub fn load_signed_deadlines(conn: &Connection) -> Result<Vec<(ContractId, DateTime<Utc>)>> {
    let mut stmt = conn.prepare(
        "SELECT id, expires_at FROM contracts
         WHERE status = 'signed' AND expires_at IS NOT NULL
         ORDER BY expires_at",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, ContractId>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut deadlines = Vec::with_capacity(rows.len());
    for (id, expires_at) in rows {
        match parse_ts(&expires_at) {
            Ok(ts) => deadlines.push((id, ts)),
            Err(e) => warn!(contract_id = id, "skipping contract with bad expires_at: {e}"),
        }
    }
    Ok(deadlines)
}

fn faction_reward_item(conn: &Connection, faction: FactionId) -> Result<Option<ItemId>> {
    let item: Option<Option<ItemId>> = conn
        .query_row(
            "SELECT customer_item_reward_id FROM contract_type1_settings WHERE faction_id = ?1",
            [faction],
            |row| row.get(0),
        )
        .optional()?;
    Ok(item.flatten().filter(|id| *id > 0))
}

fn pay(
    conn: &Connection,
    contract: &ContractRow,
    player: PlayerId,
    amount: i64,
    description: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    if amount <= 0 {
        return Ok(());
    }
    ledger::add_money(conn, player, amount)?;
    ledger::record_money(
        conn,
        &MoneyEntry {
            from: None,
            to: Some(player),
            amount,
            kind: "contract",
            reference: Some(Reference::contract(contract.id)),
            description: description.to_string(),
        },
        at,
    )?;
    Ok(())
}

/// Pay out a contract according to its kind.
///
/// - `type1`: both money rewards, plus the customer faction's reward item
///   (when configured) with its effects baselined at `at`,
/// - `type2`: the executor's money reward only.
///
/// Non-positive amounts are skipped. Returns the granted item, whose effect
/// timers the caller arms after commit.
pub fn distribute_rewards(
    conn: &Connection,
    contract: &ContractRow,
    completion: Completion,
    at: DateTime<Utc>,
) -> Result<Option<GrantedItem>> {
    let description = completion.description(contract.id);
    match contract.kind.parse::<ContractKind>() {
        Ok(ContractKind::Type1) => {
            pay(
                conn,
                contract,
                contract.customer_player_id,
                contract.money_reward_customer,
                &description,
                at,
            )?;
            pay(
                conn,
                contract,
                contract.executor_player_id,
                contract.money_reward_executor,
                &description,
                at,
            )?;

            let Some(faction) = contract.customer_faction_id else {
                return Ok(None);
            };
            let Some(item_id) = faction_reward_item(conn, faction)? else {
                return Ok(None);
            };
            let effects = ledger::grant_item(conn, contract.customer_player_id, item_id, at)?;
            ledger::record_item(
                conn,
                &ItemEntry {
                    from: None,
                    to: Some(contract.customer_player_id),
                    item: item_id,
                    kind: "contract",
                    reference: Some(Reference::contract(contract.id)),
                    description,
                },
                at,
            )?;
            Ok(Some(GrantedItem {
                player_id: contract.customer_player_id,
                item_id,
                effects,
            }))
        }
        Ok(ContractKind::Type2) => {
            pay(
                conn,
                contract,
                contract.executor_player_id,
                contract.money_reward_executor,
                &description,
                at,
            )?;
            Ok(None)
        }
        Err(e) => {
            warn!(contract_id = contract.id, "{e}; completing without rewards");
            Ok(None)
        }
    }
}

/// Distribute rewards and flip a signed contract to `completed`.
pub fn complete_contract(
    conn: &Connection,
    contract: &ContractRow,
    completion: Completion,
    at: DateTime<Utc>,
) -> Result<Option<GrantedItem>> {
    let granted = distribute_rewards(conn, contract, completion, at)?;
    conn.execute(
        "UPDATE contracts SET status = ?1, completed_at = ?2 WHERE id = ?3",
        params![ContractStatus::Completed.as_str(), format_ts(at), contract.id],
    )?;
    Ok(granted)
}

/// Deadline fire body. Run inside a write transaction.
pub fn execute_contract_expiry(
    conn: &Connection,
    id: ContractId,
    fired_at: DateTime<Utc>,
) -> Result<ContractOutcome> {
    let Some(contract) = load_contract(conn, id)? else {
        return Ok(ContractOutcome::Missing);
    };
    if contract.status() != Some(ContractStatus::Signed) {
        return Ok(ContractOutcome::Stale {
            status: contract.status,
        });
    }
    let granted = complete_contract(conn, &contract, Completion::Expired, fired_at)?;
    Ok(ContractOutcome::Completed { granted })
}

struct ContractsInner {
    store: Store,
    timers: TimerRegistry<ContractId>,
    run: RunFlag,
    effects: Option<EffectsScheduler>,
}

/// Timer engine for contract deadlines. Cheap to clone.
#[derive(Clone)]
pub struct ContractScheduler {
    inner: Arc<ContractsInner>,
}

impl ContractScheduler {
    pub fn new(store: Store) -> Self {
        Self::build(store, None)
    }

    /// Items granted on completion get their effect timers armed on `effects`.
    pub fn with_effects(store: Store, effects: EffectsScheduler) -> Self {
        Self::build(store, Some(effects))
    }

    fn build(store: Store, effects: Option<EffectsScheduler>) -> Self {
        Self {
            inner: Arc::new(ContractsInner {
                store,
                timers: TimerRegistry::new("contracts"),
                run: RunFlag::new("contracts"),
                effects,
            }),
        }
    }

    /// Arm every signed contract. Already expired ones fire immediately.
    pub fn start(&self) -> Result<usize> {
        let count = self.inner.run.start_with(|| {
            let deadlines = self.inner.store.read(load_signed_deadlines)?;
            for (id, expires_at) in &deadlines {
                self.schedule_contract(*id, *expires_at);
            }
            Ok(deadlines.len())
        })?;
        info!(count, "contract scheduler started");
        Ok(count)
    }

    pub fn stop(&self) {
        let was_running = self.inner.run.stop();
        let cancelled = self.inner.timers.stop_all();
        if was_running || cancelled > 0 {
            info!(cancelled, "contract scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.run.is_running()
    }

    /// Arm (or re-arm) the deadline of one contract.
    pub fn schedule_contract(&self, id: ContractId, expires_at: DateTime<Utc>) {
        let this = self.clone();
        self.inner.timers.schedule(id, expires_at, move |id| {
            let this = this.clone();
            async move { this.fire(id).await }
        });
        debug!(contract_id = id, expires_at = %expires_at, "contract deadline scheduled");
    }

    pub fn cancel_contract(&self, id: ContractId) -> bool {
        let cancelled = self.inner.timers.cancel(&id);
        if cancelled {
            debug!(contract_id = id, "contract deadline cancelled");
        }
        cancelled
    }

    pub fn scheduled_count(&self) -> usize {
        self.inner.timers.count()
    }

    pub fn due_at(&self, id: ContractId) -> Option<DateTime<Utc>> {
        self.inner.timers.due_at(&id)
    }

    async fn fire(&self, id: ContractId) -> Rearm {
        let fired_at = Utc::now();
        let store = self.inner.store.clone();
        let result = tokio::task::spawn_blocking(move || {
            store.write(|tx| execute_contract_expiry(tx, id, fired_at))
        })
        .await
        .map_err(|e| SchedulerError::Task(e.to_string()))
        .and_then(|r| r);

        match result {
            Ok(ContractOutcome::Completed { granted }) => {
                info!(contract_id = id, "contract auto-completed");
                if let (Some(granted), Some(effects)) = (granted, &self.inner.effects) {
                    effects.arm_granted(&granted, fired_at);
                }
            }
            Ok(ContractOutcome::Stale { status }) => {
                debug!(contract_id = id, %status, "contract no longer signed, skipping");
            }
            Ok(ContractOutcome::Missing) => {
                warn!(contract_id = id, "contract vanished before its deadline");
            }
            Err(e) => error!(contract_id = id, "contract auto-completion failed: {e}"),
        }
        Rearm::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use festa_store::ledger::ItemEffect;
    use festa_store::StoreError;

    const SEED: &str = "
        INSERT INTO factions (id, name) VALUES (1, 'Guild');
        INSERT INTO players (id, character_name, faction_id, money) VALUES
            (1, 'Customer', 1, 100), (2, 'Executor', NULL, 0);
        INSERT INTO items (id, name) VALUES (10, 'Seal');
        INSERT INTO effects (id, effect_type, operation, value, period_seconds)
            VALUES (100, 'generate_money', 'add', 2, 60);
        INSERT INTO item_effects (item_id, effect_id) VALUES (10, 100);
        INSERT INTO contract_type1_settings (faction_id, customer_item_reward_id) VALUES (1, 10);
    ";

    fn seeded() -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .write(|tx| tx.execute_batch(SEED).map_err(StoreError::from))
            .unwrap();
        store
    }

    fn insert_contract(
        store: &Store,
        id: i64,
        kind: &str,
        status: &str,
        expires_at: DateTime<Utc>,
    ) {
        store
            .write(|tx| {
                tx.execute(
                    "INSERT INTO contracts (id, contract_type, status, customer_player_id,
                         executor_player_id, customer_faction_id, duration_seconds,
                         money_reward_customer, money_reward_executor, created_at, signed_at, expires_at)
                     VALUES (?1, ?2, ?3, 1, 2, 1, 60, 30, 70, ?4, ?4, ?5)",
                    params![id, kind, status, format_ts(Utc::now()), format_ts(expires_at)],
                )
                .map_err(StoreError::from)
            })
            .unwrap();
    }

    fn money(store: &Store, player: i64) -> i64 {
        store
            .read(|conn| ledger::balance(conn, player))
            .unwrap()
            .unwrap()
            .money
    }

    fn status(store: &Store, id: i64) -> String {
        store
            .read(|conn| load_contract(conn, id))
            .unwrap()
            .unwrap()
            .status
    }

    #[test]
    fn type1_pays_both_and_grants_faction_item() {
        let store = seeded();
        insert_contract(&store, 1, "type1", "signed", Utc::now());
        let now = Utc::now();
        let outcome = store
            .write(|tx| execute_contract_expiry(tx, 1, now))
            .unwrap();

        assert_eq!(
            outcome,
            ContractOutcome::Completed {
                granted: Some(GrantedItem {
                    player_id: 1,
                    item_id: 10,
                    effects: vec![ItemEffect { effect_id: 100, period_secs: 60 }],
                })
            }
        );
        assert_eq!(money(&store, 1), 130);
        assert_eq!(money(&store, 2), 70);
        assert_eq!(status(&store, 1), "completed");
        assert!(store.read(|conn| ledger::holds_item(conn, 1, 10)).unwrap());

        let descriptions: Vec<String> = store
            .read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT description FROM money_transactions WHERE reference_type = 'contract'",
                )?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok::<_, SchedulerError>(rows)
            })
            .unwrap();
        assert_eq!(descriptions, vec!["Auto-completed contract 1 reward"; 2]);
    }

    #[test]
    fn type2_pays_only_executor() {
        let store = seeded();
        insert_contract(&store, 2, "type2", "signed", Utc::now());
        let outcome = store
            .write(|tx| execute_contract_expiry(tx, 2, Utc::now()))
            .unwrap();
        assert_eq!(outcome, ContractOutcome::Completed { granted: None });
        assert_eq!(money(&store, 1), 100);
        assert_eq!(money(&store, 2), 70);
    }

    #[test]
    fn terminated_contract_is_left_alone() {
        let store = seeded();
        insert_contract(&store, 3, "type1", "terminated", Utc::now());
        let outcome = store
            .write(|tx| execute_contract_expiry(tx, 3, Utc::now()))
            .unwrap();
        assert_eq!(
            outcome,
            ContractOutcome::Stale {
                status: "terminated".into()
            }
        );
        assert_eq!(money(&store, 2), 0);
        assert_eq!(status(&store, 3), "terminated");
    }

    #[test]
    fn missing_contract_is_reported() {
        let store = seeded();
        let outcome = store
            .write(|tx| execute_contract_expiry(tx, 99, Utc::now()))
            .unwrap();
        assert_eq!(outcome, ContractOutcome::Missing);
    }

    #[test]
    fn unknown_kind_completes_without_rewards() {
        let store = seeded();
        insert_contract(&store, 4, "barter", "signed", Utc::now());
        store
            .write(|tx| execute_contract_expiry(tx, 4, Utc::now()))
            .unwrap();
        assert_eq!(status(&store, 4), "completed");
        assert_eq!(money(&store, 2), 0);
    }

    #[tokio::test]
    async fn start_catches_up_expired_contracts_and_arms_future_ones() {
        let store = seeded();
        insert_contract(&store, 1, "type2", "signed", Utc::now() - Duration::seconds(30));
        insert_contract(&store, 2, "type2", "signed", Utc::now() + Duration::seconds(600));
        insert_contract(&store, 3, "type2", "pending", Utc::now() - Duration::seconds(30));

        let effects = EffectsScheduler::new(store.clone());
        let scheduler = ContractScheduler::with_effects(store.clone(), effects);
        assert_eq!(scheduler.start().unwrap(), 2);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        assert_eq!(status(&store, 1), "completed");
        assert_eq!(status(&store, 2), "signed");
        assert_eq!(status(&store, 3), "pending");
        assert_eq!(scheduler.scheduled_count(), 1);
        assert!(scheduler.due_at(2).is_some());

        assert!(scheduler.cancel_contract(2));
        assert!(!scheduler.cancel_contract(2));
        scheduler.stop();
    }

    #[tokio::test]
    async fn granted_reward_item_gets_effect_timers() {
        let store = seeded();
        insert_contract(&store, 1, "type1", "signed", Utc::now() + Duration::milliseconds(50));

        let effects = EffectsScheduler::new(store.clone());
        let scheduler = ContractScheduler::with_effects(store.clone(), effects.clone());
        scheduler.start().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        assert_eq!(status(&store, 1), "completed");
        assert_eq!(effects.scheduled_count(), 1);
        effects.stop();
        scheduler.stop();
    }
}
