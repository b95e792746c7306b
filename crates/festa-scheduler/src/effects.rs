//! Recurring item effects: one timer per held (player, item, effect).

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use festa_core::types::{EffectId, EffectKind, ItemId, Operation, PlayerId};
use festa_store::ledger::{self, InfluenceEntry, ItemEffect, ItemEntry, MoneyEntry, Reference};
use festa_store::{parse_ts, Store};
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::lifecycle::RunFlag;
use crate::registry::{Rearm, TimerRegistry};
use crate::schedule::{due_after, effect_period, next_effect_due};

/// Identity of one recurring effect timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffectKey {
    pub player_id: PlayerId,
    pub item_id: ItemId,
    pub effect_id: EffectId,
}

impl EffectKey {
    pub fn new(player_id: PlayerId, item_id: ItemId, effect_id: EffectId) -> Self {
        Self {
            player_id,
            item_id,
            effect_id,
        }
    }
}

impl fmt::Display for EffectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "player={} item={} effect={}",
            self.player_id, self.item_id, self.effect_id
        )
    }
}

/// An item that just entered a player's possession inside a committed
/// transaction. Its effects still need timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantedItem {
    pub player_id: PlayerId,
    pub item_id: ItemId,
    pub effects: Vec<ItemEffect>,
}

/// A held effect as persisted, input to reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldEffect {
    pub key: EffectKey,
    pub period_secs: i64,
    pub last_executed_at: Option<DateTime<Utc>>,
}

/// Result of one effect fire transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectOutcome {
    /// The player no longer holds the item; nothing written.
    NotHeld,
    /// Effect applied and `last_executed_at` advanced.
    Applied { spawned: Option<GrantedItem> },
}

struct EffectRow {
    kind: String,
    operation: Option<String>,
    value: Option<i64>,
    spawned_item_id: Option<ItemId>,
}

impl EffectRow {
    /// Signed balance delta for resource effects, `None` when the row lacks
    /// a value or an operation. Unknown operations pass the value through.
    fn delta(&self) -> Option<i64> {
        let value = self.value?;
        let operation = self.operation.as_deref()?;
        Some(match operation.parse::<Operation>() {
            Ok(op) => op.delta(value),
            Err(_) => value,
        })
    }
}

/// Every (player, item, effect) currently held, with its last execution.
///
/// Rows whose timestamp does not parse are logged and skipped.
pub fn load_held_effects(conn: &Connection) -> Result<Vec<HeldEffect>> {
    let mut stmt = conn.prepare(
        "SELECT pi.player_id, pi.item_id, e.id, e.period_seconds, iee.last_executed_at
         FROM player_items pi
         JOIN item_effects ie ON ie.item_id = pi.item_id
         JOIN effects e ON e.id = ie.effect_id
         LEFT JOIN item_effect_executions iee
                ON iee.player_id = pi.player_id
               AND iee.item_id = pi.item_id
               AND iee.effect_id = e.id
         ORDER BY pi.player_id, pi.item_id, e.id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                EffectKey::new(row.get(0)?, row.get(1)?, row.get(2)?),
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut held = Vec::with_capacity(rows.len());
    for (key, period_secs, last) in rows {
        let last_executed_at = match last.as_deref().map(parse_ts).transpose() {
            Ok(ts) => ts,
            Err(e) => {
                warn!(%key, "skipping effect with bad last_executed_at: {e}");
                continue;
            }
        };
        held.push(HeldEffect {
            key,
            period_secs,
            last_executed_at,
        });
    }
    Ok(held)
}

fn load_effect(conn: &Connection, effect_id: EffectId) -> Result<Option<EffectRow>> {
    let row = conn
        .query_row(
            "SELECT effect_type, operation, value, spawned_item_id FROM effects WHERE id = ?1",
            [effect_id],
            |row| {
                Ok(EffectRow {
                    kind: row.get(0)?,
                    operation: row.get(1)?,
                    value: row.get(2)?,
                    spawned_item_id: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Apply one occurrence of an effect. Run inside a write transaction.
///
/// Re-checks possession first: a transfer since the timer was armed means the
/// old owner gets nothing and the new owner's own timer takes over.
pub fn execute_effect(
    conn: &Connection,
    key: EffectKey,
    fired_at: DateTime<Utc>,
) -> Result<EffectOutcome> {
    if !ledger::holds_item(conn, key.player_id, key.item_id)? {
        return Ok(EffectOutcome::NotHeld);
    }

    let effect = load_effect(conn, key.effect_id)?
        .ok_or(SchedulerError::EffectNotFound { id: key.effect_id })?;
    let item_name = ledger::item_name(conn, key.item_id)?.unwrap_or_default();

    let mut spawned = None;
    match effect.kind.parse::<EffectKind>() {
        Ok(EffectKind::GenerateMoney) => {
            if let Some(amount) = effect.delta() {
                ledger::add_money(conn, key.player_id, amount)?;
                ledger::record_money(
                    conn,
                    &MoneyEntry {
                        from: None,
                        to: Some(key.player_id),
                        amount,
                        kind: "item_effect",
                        reference: Some(Reference::effect(key.effect_id)),
                        description: format!("Item effect: {item_name} generated {amount} money"),
                    },
                    fired_at,
                )?;
                debug!(%key, amount, "effect generated money");
            }
        }
        Ok(EffectKind::GenerateInfluence) => {
            if let Some(amount) = effect.delta() {
                ledger::add_influence(conn, key.player_id, amount)?;
                ledger::record_influence(
                    conn,
                    &InfluenceEntry {
                        player: key.player_id,
                        amount,
                        kind: "item_effect",
                        reference: Some(Reference::effect(key.effect_id)),
                        description: format!(
                            "Item effect: {item_name} generated {amount} influence"
                        ),
                    },
                    fired_at,
                )?;
                debug!(%key, amount, "effect generated influence");
            }
        }
        Ok(EffectKind::SpawnItem) => {
            if let Some(spawned_id) = effect.spawned_item_id {
                let spawned_name = ledger::item_name(conn, spawned_id)?
                    .ok_or(SchedulerError::ItemNotFound { id: spawned_id })?;
                let effects = ledger::grant_item(conn, key.player_id, spawned_id, fired_at)?;
                ledger::record_item(
                    conn,
                    &ItemEntry {
                        from: None,
                        to: Some(key.player_id),
                        item: spawned_id,
                        kind: "spawned",
                        reference: Some(Reference::effect(key.effect_id)),
                        description: format!("Item effect: {item_name} spawned {spawned_name}"),
                    },
                    fired_at,
                )?;
                debug!(%key, spawned_id, "effect spawned item");
                spawned = Some(GrantedItem {
                    player_id: key.player_id,
                    item_id: spawned_id,
                    effects,
                });
            }
        }
        Err(e) => warn!(%key, "{e}; only advancing last_executed_at"),
    }

    ledger::mark_effect_executed(conn, key.player_id, key.item_id, key.effect_id, fired_at)?;
    Ok(EffectOutcome::Applied { spawned })
}

struct EffectsInner {
    store: Store,
    timers: TimerRegistry<EffectKey>,
    run: RunFlag,
}

/// Timer engine for recurring item effects.
///
/// Cheap to clone; clones share one registry. Each fire runs its transaction
/// on the blocking pool and then re-arms the key for `fire instant + period`.
#[derive(Clone)]
pub struct EffectsScheduler {
    inner: Arc<EffectsInner>,
}

impl EffectsScheduler {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(EffectsInner {
                store,
                timers: TimerRegistry::new("effects"),
                run: RunFlag::new("effects"),
            }),
        }
    }

    /// Load every held effect and arm its timer. Overdue effects fire at once.
    ///
    /// Returns the number of timers armed. A failed load arms nothing.
    pub fn start(&self) -> Result<usize> {
        let count = self.inner.run.start_with(|| {
            let held = self.inner.store.read(load_held_effects)?;
            let now = Utc::now();
            for effect in &held {
                let period = effect_period(effect.period_secs);
                let due = next_effect_due(effect.last_executed_at, period, now);
                self.schedule_effect(effect.key, due, effect.period_secs);
            }
            Ok(held.len())
        })?;
        info!(count, "effects scheduler started");
        Ok(count)
    }

    /// Disarm every effect timer. Idempotent.
    pub fn stop(&self) {
        let was_running = self.inner.run.stop();
        let cancelled = self.inner.timers.stop_all();
        if was_running || cancelled > 0 {
            info!(cancelled, "effects scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.run.is_running()
    }

    /// Arm (or re-arm) one effect for `due_at`; after each fire it re-arms
    /// itself `period_secs` later.
    pub fn schedule_effect(&self, key: EffectKey, due_at: DateTime<Utc>, period_secs: i64) {
        let this = self.clone();
        self.inner.timers.schedule(key, due_at, move |key| {
            let this = this.clone();
            async move { this.fire(key, period_secs).await }
        });
        debug!(%key, due_at = %due_at, "effect scheduled");
    }

    pub fn cancel_effect(&self, key: &EffectKey) -> bool {
        self.inner.timers.cancel(key)
    }

    /// Disarm every effect timer of one held item (the item left the player).
    pub fn cancel_item(&self, player_id: PlayerId, item_id: ItemId) -> usize {
        let n = self
            .inner
            .timers
            .cancel_where(|key| key.player_id == player_id && key.item_id == item_id);
        if n > 0 {
            info!(player_id, item_id, cancelled = n, "effect timers cancelled for item");
        }
        n
    }

    /// Arm the effects of an item that was just granted with `baseline` as
    /// its last execution.
    pub fn arm_granted(&self, granted: &GrantedItem, baseline: DateTime<Utc>) {
        for effect in &granted.effects {
            let key = EffectKey::new(granted.player_id, granted.item_id, effect.effect_id);
            self.schedule_effect(
                key,
                due_after(baseline, effect_period(effect.period_secs)),
                effect.period_secs,
            );
        }
    }

    pub fn scheduled_count(&self) -> usize {
        self.inner.timers.count()
    }

    pub fn due_at(&self, key: &EffectKey) -> Option<DateTime<Utc>> {
        self.inner.timers.due_at(key)
    }

    /// Arm every held effect that has no live timer, from its persisted
    /// `last_executed_at`. Existing timers are left alone.
    ///
    /// Recovers occurrences lost to fire-time errors, which do not re-arm.
    pub fn reconcile(&self) -> Result<usize> {
        let held = self.inner.store.read(load_held_effects)?;
        let now = Utc::now();
        let mut armed = 0;
        for effect in held {
            if self.inner.timers.contains(&effect.key) {
                continue;
            }
            let period = effect_period(effect.period_secs);
            let due = next_effect_due(effect.last_executed_at, period, now);
            self.schedule_effect(effect.key, due, effect.period_secs);
            armed += 1;
        }
        if armed > 0 {
            warn!(armed, "reconciliation re-armed effect timers");
        }
        Ok(armed)
    }

    /// Periodic reconciliation loop. Skips ticks while the scheduler is
    /// stopped; exits when `shutdown` broadcasts `true` or its sender drops.
    pub async fn run_sweep(self, every: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        info!(every_secs = every.as_secs(), "effects reconciliation sweep started");
        let mut interval = tokio::time::interval(every);
        // the first tick completes immediately; start() has just reconciled
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.is_running() {
                        continue;
                    }
                    if let Err(e) = self.reconcile() {
                        error!("effects reconciliation failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("effects reconciliation sweep shutting down");
                        break;
                    }
                }
            }
        }
    }

    // --- private helpers ---------------------------------------------------

    async fn fire(&self, key: EffectKey, period_secs: i64) -> Rearm {
        let fired_at = Utc::now();
        let store = self.inner.store.clone();
        let result = tokio::task::spawn_blocking(move || {
            store.write(|tx| execute_effect(tx, key, fired_at))
        })
        .await
        .map_err(|e| SchedulerError::Task(e.to_string()))
        .and_then(|r| r);

        match result {
            Ok(EffectOutcome::Applied { spawned }) => {
                if let Some(granted) = spawned {
                    self.arm_granted(&granted, fired_at);
                }
                Rearm::At(due_after(fired_at, effect_period(period_secs)))
            }
            Ok(EffectOutcome::NotHeld) => {
                debug!(%key, "item no longer held, effect timer retired");
                Rearm::Done
            }
            Err(e) => {
                // no re-arm: the reconciliation sweep picks the key up again
                error!(%key, "effect fire failed: {e}");
                Rearm::Done
            }
        }
    }
}
