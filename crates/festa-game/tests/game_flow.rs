// End-to-end flows through GameService against an in-memory database.
// Timers run on the real clock with second-scale deadlines.

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use festa_core::types::{ContractKind, GamePhase};
use festa_game::contracts::{ConflictPenalty, NewContract};
use festa_game::debts::NewDebt;
use festa_game::{GameError, GameService};
use festa_scheduler::EffectKey;
use festa_store::ledger;
use festa_store::{Store, StoreError};

const SEED: &str = "
    INSERT INTO factions (id, name) VALUES (1, 'Guild'), (2, 'Syndicate');
    INSERT INTO players (id, character_name, faction_id, money, influence) VALUES
        (1, 'Ada', 1, 100, 10),
        (2, 'Bram', NULL, 0, 10),
        (3, 'Cleo', NULL, 500, 10),
        (4, 'Dax', 2, 0, 10);
    INSERT INTO items (id, name) VALUES (10, 'Lantern'), (20, 'Banner');
    INSERT INTO effects (id, effect_type, operation, value, period_seconds) VALUES
        (100, 'generate_money', 'add', 7, 1),
        (200, 'generate_influence', 'add', 1, 3600);
    INSERT INTO item_effects (item_id, effect_id) VALUES (10, 100), (20, 200);
    INSERT INTO contract_type1_settings (faction_id, customer_item_reward_id) VALUES (1, 20);
    INSERT INTO contract_type1_reward_settings (money_reward_customer, money_reward_executor)
        VALUES (15, 40);
";

fn service() -> GameService {
    let store = Store::open_in_memory().unwrap();
    store
        .write(|tx| tx.execute_batch(SEED).map_err(StoreError::from))
        .unwrap();
    GameService::new(store)
}

fn money(service: &GameService, player: i64) -> i64 {
    service
        .store()
        .read(|conn| ledger::balance(conn, player))
        .unwrap()
        .unwrap()
        .money
}

fn influence(service: &GameService, player: i64) -> i64 {
    service
        .store()
        .read(|conn| ledger::balance(conn, player))
        .unwrap()
        .unwrap()
        .influence
}

fn contract_status(service: &GameService, id: i64) -> String {
    service
        .store()
        .read(|conn| {
            conn.query_row("SELECT status FROM contracts WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .map_err(StoreError::from)
        })
        .unwrap()
}

fn type1(customer: i64, duration_seconds: i64) -> NewContract {
    NewContract {
        kind: ContractKind::Type1,
        customer_player_id: customer,
        duration_seconds,
    }
}

fn count(service: &GameService, sql: &str) -> i64 {
    service
        .store()
        .read(|conn| conn.query_row(sql, [], |row| row.get(0)).map_err(StoreError::from))
        .unwrap()
}

fn backdate_expiry(service: &GameService, id: i64) {
    service
        .store()
        .write(|tx| {
            tx.execute(
                "UPDATE contracts SET expires_at = ?1 WHERE id = ?2",
                rusqlite::params![festa_store::format_ts(Utc::now() - Duration::seconds(5)), id],
            )
            .map_err(StoreError::from)
        })
        .unwrap();
}

async fn pause(ms: u64) {
    tokio::time::sleep(StdDuration::from_millis(ms)).await;
}

#[tokio::test]
async fn signed_contract_completes_itself_at_expiry() {
    let game = service();
    let id = game.create_contract(2, &type1(1, 1)).unwrap();
    let signed = game.sign_contract(id, 1).unwrap();
    assert_eq!(signed.expires_at - signed.signed_at, Duration::seconds(1));
    assert_eq!(game.contracts().scheduled_count(), 1);

    pause(1500).await;
    assert_eq!(contract_status(&game, id), "completed");
    assert_eq!(money(&game, 1), 115);
    assert_eq!(money(&game, 2), 40);
    assert_eq!(game.contracts().scheduled_count(), 0);

    // faction reward item arrives with its effect timer armed
    let holds = game
        .store()
        .read(|conn| ledger::holds_item(conn, 1, 20))
        .unwrap();
    assert!(holds);
    assert!(game
        .effects()
        .due_at(&EffectKey::new(1, 20, 200))
        .is_some());
    game.stop_schedulers();
}

#[tokio::test]
async fn terminated_contract_never_pays_out() {
    let game = service();
    let id = game.create_contract(2, &type1(1, 1)).unwrap();
    game.sign_contract(id, 1).unwrap();
    let reason = game.terminate_contract(id, None).unwrap();
    assert_eq!(reason, "Terminated by admin");
    assert_eq!(game.contracts().scheduled_count(), 0);

    pause(1400).await;
    assert_eq!(contract_status(&game, id), "terminated");
    assert_eq!(money(&game, 2), 0);

    let again = game.terminate_contract(id, Some("twice"));
    assert!(matches!(again, Err(GameError::InvalidState(_))));
}

#[tokio::test]
async fn contract_actions_enforce_roles_and_state() {
    let game = service();
    let id = game.create_contract(2, &type1(1, 600)).unwrap();

    assert!(matches!(
        game.sign_contract(id, 2),
        Err(GameError::Forbidden(_))
    ));
    game.sign_contract(id, 1).unwrap();
    assert!(matches!(
        game.sign_contract(id, 1),
        Err(GameError::InvalidState(_))
    ));
    assert!(matches!(
        game.complete_contract(id, 1),
        Err(GameError::InvalidState(_))
    ));
    assert!(matches!(
        game.complete_contract(99, 1),
        Err(GameError::NotFound(_))
    ));
    assert!(matches!(
        game.create_contract(1, &type1(1, 60)),
        Err(GameError::Validation(_))
    ));
    // rejected actions leave the armed deadline alone
    assert_eq!(game.contracts().scheduled_count(), 1);
    game.stop_schedulers();
}

#[tokio::test]
async fn manual_completion_after_expiry_disarms_the_timer() {
    let game = service();
    let id = game.create_contract(2, &type1(1, 600)).unwrap();
    game.sign_contract(id, 1).unwrap();
    // pretend the deadline already passed but the timer is still pending
    backdate_expiry(&game, id);

    game.complete_contract(id, 1).unwrap();
    assert_eq!(contract_status(&game, id), "completed");
    assert_eq!(game.contracts().scheduled_count(), 0);
    assert_eq!(money(&game, 1), 115);

    let description: String = game
        .store()
        .read(|conn| {
            conn.query_row(
                "SELECT description FROM money_transactions WHERE to_player_id = 2",
                [],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
        .unwrap();
    assert_eq!(description, format!("Contract {id} completion reward"));
    game.stop_schedulers();
}

#[tokio::test]
async fn overdue_debt_collects_partial_amount_and_penalises() {
    let game = service();
    game.set_debt_penalty(25).unwrap();
    let issued = game
        .issue_debt(&NewDebt {
            lender_player_id: 3,
            borrower_player_id: 2,
            loan_amount: 100,
            return_amount: 120,
            deadline_minutes: 30,
        })
        .unwrap();
    assert_eq!(money(&game, 3), 400);
    assert_eq!(money(&game, 2), 100);
    assert_eq!(game.debts().due_at(issued.id), Some(issued.return_deadline));

    // pull the deadline in rather than waiting half an hour
    game.debts()
        .schedule_debt(issued.id, Utc::now() + Duration::milliseconds(100));
    pause(500).await;

    assert_eq!(money(&game, 2), 0);
    assert_eq!(money(&game, 3), 500);
    assert_eq!(influence(&game, 2), 0);
    assert_eq!(game.debts().scheduled_count(), 0);
    assert!(matches!(
        game.return_debt(issued.id, 3),
        Err(GameError::InvalidState(_))
    ));
}

#[tokio::test]
async fn returned_debt_is_not_penalised() {
    let game = service();
    game.set_debt_penalty(5).unwrap();
    let issued = game
        .issue_debt(&NewDebt {
            lender_player_id: 3,
            borrower_player_id: 1,
            loan_amount: 50,
            return_amount: 60,
            deadline_minutes: 1,
        })
        .unwrap();

    assert!(matches!(
        game.return_debt(issued.id, 1),
        Err(GameError::Forbidden(_))
    ));
    assert_eq!(game.return_debt(issued.id, 3).unwrap(), 60);
    assert_eq!(game.debts().scheduled_count(), 0);
    assert_eq!(money(&game, 1), 90);
    assert_eq!(money(&game, 3), 510);
    assert_eq!(influence(&game, 1), 10);
}

#[tokio::test]
async fn debt_validation_rejects_bad_terms() {
    let game = service();
    let base = NewDebt {
        lender_player_id: 3,
        borrower_player_id: 2,
        loan_amount: 100,
        return_amount: 120,
        deadline_minutes: 10,
    };
    for terms in [
        NewDebt { loan_amount: 0, ..base },
        NewDebt { return_amount: 90, ..base },
        NewDebt { deadline_minutes: 0, ..base },
        NewDebt { borrower_player_id: 3, ..base },
    ] {
        assert!(matches!(
            game.issue_debt(&terms),
            Err(GameError::Validation(_))
        ));
    }
    assert!(matches!(
        game.issue_debt(&NewDebt { lender_player_id: 2, borrower_player_id: 3, ..base }),
        Err(GameError::InsufficientFunds { required: 100, available: 0 })
    ));
    assert!(matches!(
        game.issue_debt(&NewDebt { borrower_player_id: 42, ..base }),
        Err(GameError::NotFound(_))
    ));
    assert_eq!(game.debts().scheduled_count(), 0);
}

#[tokio::test]
async fn granted_item_pays_every_period() {
    let game = service();
    let granted = game.grant_item(1, 10).unwrap();
    assert_eq!(granted.effects.len(), 1);
    assert_eq!(game.effects().scheduled_count(), 1);

    // effect 100 pays 7 every second; the first payout is one period out
    pause(1500).await;
    assert_eq!(money(&game, 1), 107);
    assert!(matches!(
        game.grant_item(1, 10),
        Err(GameError::InvalidState(_))
    ));
    game.stop_schedulers();
    assert_eq!(game.effects().scheduled_count(), 0);
}

#[tokio::test]
async fn transfer_moves_effect_timers_to_recipient() {
    let game = service();
    game.grant_item(1, 10).unwrap();
    game.transfer_item(1, 2, 10).unwrap();

    let sender = EffectKey::new(1, 10, 100);
    let recipient = EffectKey::new(2, 10, 100);
    assert!(game.effects().due_at(&sender).is_none());
    assert!(game.effects().due_at(&recipient).is_some());

    pause(1500).await;
    assert_eq!(money(&game, 1), 100);
    assert_eq!(money(&game, 2), 7);

    assert!(matches!(
        game.transfer_item(1, 2, 10),
        Err(GameError::NotFound(_))
    ));
    assert!(matches!(
        game.transfer_item(2, 2, 10),
        Err(GameError::Validation(_))
    ));
    game.stop_schedulers();
}

#[tokio::test]
async fn game_timeline_controls_schedulers() {
    let game = service();
    assert_eq!(game.status().unwrap().phase, GamePhase::NotStarted);
    assert!(matches!(game.end_game(), Err(GameError::InvalidState(_))));
    assert!(!game.resume_if_active().unwrap());

    game.store()
        .write(|tx| {
            tx.execute(
                "INSERT INTO player_items (player_id, item_id, acquired_at)
                 VALUES (3, 20, '2026-01-01T00:00:00.000000Z')",
                [],
            )
            .map_err(StoreError::from)
        })
        .unwrap();

    let status = game.start_game().unwrap();
    assert_eq!(status.phase, GamePhase::Running);
    assert!(status.schedulers.running);
    assert_eq!(status.schedulers.effects, 1);
    assert!(matches!(game.start_game(), Err(GameError::InvalidState(_))));

    // held effects are baselined at the start instant, so nothing is overdue
    pause(100).await;
    assert_eq!(influence(&game, 3), 10);

    let json = serde_json::to_value(game.status().unwrap()).unwrap();
    assert_eq!(json["phase"], "running");
    assert_eq!(json["schedulers"]["effects"], 1);

    let ended = game.end_game().unwrap();
    assert_eq!(ended.phase, GamePhase::Ended);
    assert!(!ended.schedulers.running);
    assert_eq!(ended.schedulers.effects, 0);
    assert!(ended.duration_secs.is_some());
}

#[tokio::test]
async fn sync_follows_timeline_changes_made_elsewhere() {
    let game = service();
    assert!(!game.sync_with_timeline().unwrap());

    game.record_game_start().unwrap();
    assert!(!game.scheduler_status().running);
    assert!(game.sync_with_timeline().unwrap());
    assert!(game.scheduler_status().running);

    game.record_game_end().unwrap();
    assert!(!game.sync_with_timeline().unwrap());
    assert!(!game.scheduler_status().running);
}

#[tokio::test]
async fn contract_rewards_come_from_admin_settings() {
    let game = service();
    let type2 = NewContract {
        kind: ContractKind::Type2,
        customer_player_id: 1,
        duration_seconds: 60,
    };
    assert!(matches!(
        game.create_contract(2, &type2),
        Err(GameError::InvalidState(_))
    ));

    game.set_contract_rewards(ContractKind::Type2, 99, 30).unwrap();
    let id = game.create_contract(2, &type2).unwrap();
    let (customer, executor): (i64, i64) = game
        .store()
        .read(|conn| {
            conn.query_row(
                "SELECT money_reward_customer, money_reward_executor FROM contracts WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(StoreError::from)
        })
        .unwrap();
    assert_eq!((customer, executor), (0, 30));

    // later settings do not touch contracts already created
    game.set_contract_rewards(ContractKind::Type2, 0, 75).unwrap();
    assert_eq!(
        count(&game, "SELECT money_reward_executor FROM contracts WHERE id = 1"),
        30
    );
    assert!(matches!(
        game.set_contract_rewards(ContractKind::Type1, -1, 10),
        Err(GameError::Validation(_))
    ));
}

#[tokio::test]
async fn signing_against_another_faction_is_penalised() {
    let game = service();
    game.set_conflict_penalty(ConflictPenalty {
        money: 30,
        influence: 25,
    })
    .unwrap();

    // Ada (Guild) signs with Dax (Syndicate): nothing signed yet, no conflict
    let with_dax = game.create_contract(4, &type1(1, 600)).unwrap();
    assert_eq!(game.sign_contract(with_dax, 1).unwrap().penalty, None);

    // a second contract while bound to the Syndicate costs money and influence
    let with_bram = game.create_contract(2, &type1(1, 600)).unwrap();
    let signed = game.sign_contract(with_bram, 1).unwrap();
    assert_eq!(
        signed.penalty,
        Some(ConflictPenalty {
            money: 30,
            influence: 25
        })
    );
    assert_eq!(money(&game, 1), 70);
    assert_eq!(influence(&game, 1), 0);
    assert_eq!(contract_status(&game, with_bram), "signed");
    assert_eq!(
        count(
            &game,
            "SELECT COUNT(*) FROM contract_penalties
             WHERE player_id = 1 AND violation_type = 'faction_conflict'"
        ),
        1
    );
    assert_eq!(
        count(
            &game,
            "SELECT COUNT(*) FROM influence_transactions WHERE amount = -25"
        ),
        1
    );

    // players without a faction never conflict
    let bram_signs = game.create_contract(4, &type1(2, 600)).unwrap();
    assert_eq!(game.sign_contract(bram_signs, 2).unwrap().penalty, None);
    game.stop_schedulers();
}

#[tokio::test]
async fn oversized_deadlines_are_rejected_and_the_store_stays_usable() {
    let game = service();
    assert!(matches!(
        game.create_contract(2, &type1(1, i64::MAX)),
        Err(GameError::Validation(_))
    ));
    assert!(matches!(
        game.issue_debt(&NewDebt {
            lender_player_id: 3,
            borrower_player_id: 2,
            loan_amount: 10,
            return_amount: 10,
            deadline_minutes: i64::MAX / 2,
        }),
        Err(GameError::Validation(_))
    ));
    assert_eq!(money(&game, 3), 500);

    // a row that slipped past creation is caught again at signing
    let id = game.create_contract(2, &type1(1, 60)).unwrap();
    game.store()
        .write(|tx| {
            tx.execute(
                "UPDATE contracts SET duration_seconds = ?1 WHERE id = ?2",
                rusqlite::params![i64::MAX, id],
            )
            .map_err(StoreError::from)
        })
        .unwrap();
    assert!(matches!(
        game.sign_contract(id, 1),
        Err(GameError::Validation(_))
    ));
    assert_eq!(contract_status(&game, id), "pending");
    assert_eq!(game.status().unwrap().phase, GamePhase::NotStarted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deadline_fire_racing_manual_completion_pays_once() {
    let game = service();
    let id = game.create_contract(2, &type1(1, 600)).unwrap();
    game.sign_contract(id, 1).unwrap();
    backdate_expiry(&game, id);

    game.contracts().schedule_contract(id, Utc::now());
    match game.complete_contract(id, 1) {
        Ok(()) | Err(GameError::InvalidState(_)) => {}
        Err(e) => panic!("unexpected completion error: {e}"),
    }
    pause(300).await;

    assert_eq!(contract_status(&game, id), "completed");
    assert_eq!(money(&game, 1), 115);
    assert_eq!(money(&game, 2), 40);
    assert_eq!(
        count(
            &game,
            "SELECT COUNT(*) FROM money_transactions
             WHERE reference_type = 'contract' AND amount > 0"
        ),
        2
    );
    assert_eq!(game.contracts().scheduled_count(), 0);
    game.stop_schedulers();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deadline_fire_racing_debt_return_settles_once() {
    let game = service();
    game.set_debt_penalty(5).unwrap();
    let issued = game
        .issue_debt(&NewDebt {
            lender_player_id: 3,
            borrower_player_id: 1,
            loan_amount: 50,
            return_amount: 60,
            deadline_minutes: 30,
        })
        .unwrap();

    game.debts().schedule_debt(issued.id, Utc::now());
    match game.return_debt(issued.id, 3) {
        Ok(60) | Err(GameError::InvalidState(_)) => {}
        other => panic!("unexpected return outcome: {other:?}"),
    }
    pause(300).await;

    // either path moves exactly the return amount back to the lender
    assert_eq!(money(&game, 1), 90);
    assert_eq!(money(&game, 3), 510);
    assert_eq!(
        count(
            &game,
            "SELECT is_returned + penalty_applied FROM debt_receipts WHERE id = 1"
        ),
        1
    );
    assert_eq!(
        count(
            &game,
            "SELECT COUNT(*) FROM money_transactions WHERE reference_type = 'debt_receipt'"
        ),
        2
    );
    assert_eq!(game.debts().scheduled_count(), 0);
}
