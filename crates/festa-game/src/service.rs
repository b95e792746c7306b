use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use festa_core::types::{ContractId, ContractKind, DebtId, GamePhase, ItemId, PlayerId};
use festa_scheduler::{ContractScheduler, DebtScheduler, EffectsScheduler, GrantedItem};
use festa_store::Store;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::contracts::{self, ConflictPenalty, NewContract, SignedContract};
use crate::debts::{self, IssuedDebt, NewDebt};
use crate::error::{GameError, Result};
use crate::items;
use crate::timeline::{self, Timeline};

/// Live timer counts, as reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub effects: usize,
    pub contracts: usize,
    pub debts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameStatus {
    pub phase: GamePhase,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Seconds since start, or the length of an ended game.
    pub duration_secs: Option<i64>,
    pub schedulers: SchedulerStatus,
}

/// Entry point for every state change that touches a timer.
///
/// Each action commits its rows in one write transaction and only then arms
/// or disarms the matching timer, so a timer never points at uncommitted
/// state. Timers are armed whether or not the game is running; `start_game`
/// and `end_game` control the bulk load and the teardown.
#[derive(Clone)]
pub struct GameService {
    store: Store,
    effects: EffectsScheduler,
    contracts: ContractScheduler,
    debts: DebtScheduler,
}

impl GameService {
    pub fn new(store: Store) -> Self {
        let effects = EffectsScheduler::new(store.clone());
        let contracts = ContractScheduler::with_effects(store.clone(), effects.clone());
        let debts = DebtScheduler::new(store.clone());
        Self {
            store,
            effects,
            contracts,
            debts,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn effects(&self) -> &EffectsScheduler {
        &self.effects
    }

    pub fn contracts(&self) -> &ContractScheduler {
        &self.contracts
    }

    pub fn debts(&self) -> &DebtScheduler {
        &self.debts
    }

    // --- timeline ----------------------------------------------------------

    pub fn status(&self) -> Result<GameStatus> {
        let latest = self.store.read(timeline::latest)?;
        let duration_secs = latest.and_then(|t| {
            let started = t.started_at?;
            let until = t.ended_at.unwrap_or_else(Utc::now);
            Some((until - started).num_seconds())
        });
        Ok(GameStatus {
            phase: timeline::phase_of(latest.as_ref()),
            started_at: latest.and_then(|t| t.started_at),
            ended_at: latest.and_then(|t| t.ended_at),
            duration_secs,
            schedulers: self.scheduler_status(),
        })
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.effects.is_running()
                && self.contracts.is_running()
                && self.debts.is_running(),
            effects: self.effects.scheduled_count(),
            contracts: self.contracts.scheduled_count(),
            debts: self.debts.scheduled_count(),
        }
    }

    /// Open a new timeline row and baseline every held effect, without
    /// touching the schedulers. Used by one-shot CLI commands; a running
    /// server picks the change up through [`Self::sync_with_timeline`].
    pub fn record_game_start(&self) -> Result<Timeline> {
        let now = Utc::now();
        let timeline = self.store.write(|tx| {
            if timeline::phase_of(timeline::latest(tx)?.as_ref()) == GamePhase::Running {
                return Err(GameError::InvalidState("game is already running".into()));
            }
            let id = timeline::open(tx, now)?;
            let baselined = timeline::baseline_all_effects(tx, now)?;
            info!(timeline_id = id, baselined, "game started");
            Ok(Timeline {
                id,
                started_at: Some(now),
                ended_at: None,
            })
        })?;
        Ok(timeline)
    }

    /// Close the running timeline row, without touching the schedulers.
    pub fn record_game_end(&self) -> Result<Timeline> {
        let now = Utc::now();
        self.store.write(|tx| {
            let latest = timeline::latest(tx)?
                .ok_or_else(|| GameError::InvalidState("no game has been started".into()))?;
            match latest.phase() {
                GamePhase::Running => {}
                GamePhase::Ended => {
                    return Err(GameError::InvalidState("game has already ended".into()))
                }
                GamePhase::NotStarted => {
                    return Err(GameError::InvalidState("game has not been started".into()))
                }
            }
            timeline::close(tx, latest.id, now)?;
            info!(timeline_id = latest.id, "game ended");
            Ok(Timeline {
                ended_at: Some(now),
                ..latest
            })
        })
    }

    /// Start a game: timeline row, effect baseline, then all three schedulers.
    pub fn start_game(&self) -> Result<GameStatus> {
        self.record_game_start()?;
        self.start_schedulers()?;
        self.status()
    }

    /// End the running game and disarm every timer.
    pub fn end_game(&self) -> Result<GameStatus> {
        self.record_game_end()?;
        self.stop_schedulers();
        self.status()
    }

    /// Boot hook: start the schedulers if the latest timeline row is running.
    pub fn resume_if_active(&self) -> Result<bool> {
        let phase = timeline::phase_of(self.store.read(timeline::latest)?.as_ref());
        if phase != GamePhase::Running {
            info!(?phase, "no active game, schedulers stay idle");
            return Ok(false);
        }
        self.start_schedulers()?;
        Ok(true)
    }

    /// Bring the schedulers in line with the timeline: start them when a game
    /// is running, stop them when it is not. Returns whether they run.
    pub fn sync_with_timeline(&self) -> Result<bool> {
        let phase = timeline::phase_of(self.store.read(timeline::latest)?.as_ref());
        let flags = [
            self.effects.is_running(),
            self.contracts.is_running(),
            self.debts.is_running(),
        ];
        if phase == GamePhase::Running {
            if !flags.iter().all(|running| *running) {
                info!("game running, starting schedulers");
                self.start_schedulers()?;
            }
            Ok(true)
        } else {
            if flags.iter().any(|running| *running) {
                info!(?phase, "game not running, stopping schedulers");
                self.stop_schedulers();
            }
            Ok(false)
        }
    }

    /// Periodically call [`Self::sync_with_timeline`] until `shutdown` flips
    /// to `true` or its sender drops.
    pub async fn watch_timeline(self, every: StdDuration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sync_with_timeline() {
                        error!("timeline sync failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Start whichever schedulers are not running yet.
    fn start_schedulers(&self) -> Result<()> {
        if !self.effects.is_running() {
            self.effects.start()?;
        }
        if !self.contracts.is_running() {
            self.contracts.start()?;
        }
        if !self.debts.is_running() {
            self.debts.start()?;
        }
        Ok(())
    }

    pub fn stop_schedulers(&self) {
        self.effects.stop();
        self.contracts.stop();
        self.debts.stop();
    }

    // --- contracts ---------------------------------------------------------

    pub fn create_contract(&self, executor: PlayerId, terms: &NewContract) -> Result<ContractId> {
        let id = self
            .store
            .write(|tx| contracts::create(tx, executor, terms, Utc::now()))?;
        info!(contract_id = id, executor, kind = %terms.kind, "contract created");
        Ok(id)
    }

    /// Admin: rewards paid by contracts of `kind` created from now on.
    pub fn set_contract_rewards(
        &self,
        kind: ContractKind,
        customer_reward: i64,
        executor_reward: i64,
    ) -> Result<()> {
        self.store
            .write(|tx| contracts::set_rewards(tx, kind, customer_reward, executor_reward))?;
        info!(%kind, customer_reward, executor_reward, "contract rewards updated");
        Ok(())
    }

    /// Admin: penalty for signing while bound to another faction.
    pub fn set_conflict_penalty(&self, penalty: ConflictPenalty) -> Result<()> {
        self.store.write(|tx| contracts::set_conflict_penalty(tx, penalty))?;
        info!(
            money = penalty.money,
            influence = penalty.influence,
            "contract conflict penalty updated"
        );
        Ok(())
    }

    pub fn sign_contract(&self, id: ContractId, customer: PlayerId) -> Result<SignedContract> {
        let signed = self
            .store
            .write(|tx| contracts::sign(tx, id, customer, Utc::now()))?;
        self.contracts.schedule_contract(id, signed.expires_at);
        if let Some(penalty) = signed.penalty {
            warn!(
                contract_id = id,
                customer,
                money = penalty.money,
                influence = penalty.influence,
                "faction conflict penalty applied"
            );
        }
        info!(contract_id = id, expires_at = %signed.expires_at, "contract signed");
        Ok(signed)
    }

    pub fn complete_contract(&self, id: ContractId, customer: PlayerId) -> Result<()> {
        let now = Utc::now();
        let granted = self
            .store
            .write(|tx| contracts::complete(tx, id, customer, now))?;
        self.contracts.cancel_contract(id);
        if let Some(granted) = granted {
            self.effects.arm_granted(&granted, now);
        }
        info!(contract_id = id, "contract completed by customer");
        Ok(())
    }

    pub fn terminate_contract(&self, id: ContractId, reason: Option<&str>) -> Result<String> {
        let reason = self
            .store
            .write(|tx| contracts::terminate(tx, id, reason, Utc::now()))?;
        self.contracts.cancel_contract(id);
        info!(contract_id = id, %reason, "contract terminated");
        Ok(reason)
    }

    // --- debts -------------------------------------------------------------

    pub fn issue_debt(&self, terms: &NewDebt) -> Result<IssuedDebt> {
        let issued = self.store.write(|tx| debts::issue(tx, terms, Utc::now()))?;
        self.debts.schedule_debt(issued.id, issued.return_deadline);
        info!(
            debt_id = issued.id,
            lender = terms.lender_player_id,
            borrower = terms.borrower_player_id,
            "debt issued"
        );
        Ok(issued)
    }

    pub fn return_debt(&self, id: DebtId, lender: PlayerId) -> Result<i64> {
        let amount = self
            .store
            .write(|tx| debts::confirm_return(tx, id, lender, Utc::now()))?;
        self.debts.cancel_debt(id);
        info!(debt_id = id, amount, "debt returned");
        Ok(amount)
    }

    pub fn set_debt_penalty(&self, points: i64) -> Result<()> {
        self.store.write(|tx| debts::set_penalty(tx, points))?;
        info!(points, "debt penalty updated");
        Ok(())
    }

    // --- items -------------------------------------------------------------

    pub fn grant_item(&self, player: PlayerId, item: ItemId) -> Result<GrantedItem> {
        let now = Utc::now();
        let granted = self.store.write(|tx| items::grant(tx, player, item, now))?;
        self.effects.arm_granted(&granted, now);
        info!(player, item, effects = granted.effects.len(), "item granted");
        Ok(granted)
    }

    pub fn transfer_item(&self, from: PlayerId, to: PlayerId, item: ItemId) -> Result<GrantedItem> {
        let now = Utc::now();
        let granted = self
            .store
            .write(|tx| items::transfer(tx, from, to, item, now))?;
        let cancelled = self.effects.cancel_item(from, item);
        self.effects.arm_granted(&granted, now);
        info!(from, to, item, cancelled, "item transferred");
        Ok(granted)
    }
}
