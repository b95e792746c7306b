use rusqlite::{Connection, Result};

/// Initialise every Festa table. Safe to call on every startup
/// (CREATE IF NOT EXISTS makes it idempotent).
///
/// Timestamps are RFC 3339 TEXT in UTC (see [`crate::format_ts`]); booleans
/// are INTEGER 0/1.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_player_tables(conn)?;
    create_item_tables(conn)?;
    create_contract_tables(conn)?;
    create_debt_tables(conn)?;
    create_ledger_tables(conn)?;
    create_game_timeline_table(conn)?;
    Ok(())
}

fn create_player_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS factions (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            name    TEXT NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS players (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            character_name  TEXT NOT NULL,
            faction_id      INTEGER REFERENCES factions(id),
            money           INTEGER NOT NULL DEFAULT 0,
            influence       INTEGER NOT NULL DEFAULT 0
        );",
    )
}

/// Items, their effects, who holds what, and when each held effect last ran.
fn create_item_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS items (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            name    TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS effects (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            description         TEXT,
            effect_type         TEXT NOT NULL,     -- generate_money | generate_influence | spawn_item
            generated_resource  TEXT,
            operation           TEXT,              -- add | sub | mul | div
            value               INTEGER,
            spawned_item_id     INTEGER REFERENCES items(id),
            period_seconds      INTEGER NOT NULL CHECK (period_seconds > 0)
        );
        CREATE TABLE IF NOT EXISTS item_effects (
            item_id     INTEGER NOT NULL REFERENCES items(id),
            effect_id   INTEGER NOT NULL REFERENCES effects(id),
            PRIMARY KEY (item_id, effect_id)
        );
        CREATE TABLE IF NOT EXISTS player_items (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            player_id   INTEGER NOT NULL REFERENCES players(id),
            item_id     INTEGER NOT NULL REFERENCES items(id),
            acquired_at TEXT NOT NULL,
            UNIQUE (player_id, item_id)
        );
        CREATE TABLE IF NOT EXISTS item_effect_executions (
            player_id           INTEGER NOT NULL,
            item_id             INTEGER NOT NULL,
            effect_id           INTEGER NOT NULL,
            last_executed_at    TEXT,
            PRIMARY KEY (player_id, item_id, effect_id)
        );",
    )
}

fn create_contract_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS contracts (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            contract_type           TEXT NOT NULL,              -- type1 | type2
            status                  TEXT NOT NULL DEFAULT 'pending',
            customer_player_id      INTEGER NOT NULL REFERENCES players(id),
            executor_player_id      INTEGER NOT NULL REFERENCES players(id),
            customer_faction_id     INTEGER REFERENCES factions(id),
            duration_seconds        INTEGER NOT NULL,
            money_reward_customer   INTEGER NOT NULL DEFAULT 0,
            money_reward_executor   INTEGER NOT NULL DEFAULT 0,
            created_at              TEXT NOT NULL,
            signed_at               TEXT,
            expires_at              TEXT,
            completed_at            TEXT,
            terminated_at           TEXT
        );
        -- Reconciliation: SELECT ... WHERE status = 'signed'
        CREATE INDEX IF NOT EXISTS idx_contracts_status ON contracts (status);

        CREATE TABLE IF NOT EXISTS contract_type1_settings (
            faction_id              INTEGER PRIMARY KEY REFERENCES factions(id),
            customer_item_reward_id INTEGER REFERENCES items(id)
        );

        -- Admin settings below are append-only; the latest row wins.
        CREATE TABLE IF NOT EXISTS contract_type1_reward_settings (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            money_reward_customer   INTEGER NOT NULL DEFAULT 0,
            money_reward_executor   INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS contract_type2_reward_settings (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            money_reward_executor   INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS contract_penalty_settings (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            money_penalty       INTEGER NOT NULL DEFAULT 0,
            influence_penalty   INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS contract_penalties (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            player_id           INTEGER NOT NULL REFERENCES players(id),
            contract_id         INTEGER NOT NULL REFERENCES contracts(id),
            violation_type      TEXT NOT NULL,      -- faction_conflict
            money_penalty       INTEGER NOT NULL,
            influence_penalty   INTEGER NOT NULL,
            created_at          TEXT NOT NULL
        );",
    )
}

fn create_debt_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS debt_receipts (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            lender_player_id    INTEGER NOT NULL REFERENCES players(id),
            borrower_player_id  INTEGER NOT NULL REFERENCES players(id),
            loan_amount         INTEGER NOT NULL,
            return_amount       INTEGER NOT NULL,
            created_at          TEXT NOT NULL,
            return_deadline     TEXT NOT NULL,
            is_returned         INTEGER NOT NULL DEFAULT 0,
            returned_at         TEXT,
            penalty_applied     INTEGER NOT NULL DEFAULT 0,
            penalty_applied_at  TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_debts_open
            ON debt_receipts (is_returned, penalty_applied);

        -- Latest row wins.
        CREATE TABLE IF NOT EXISTS debt_penalty_settings (
            id                          INTEGER PRIMARY KEY AUTOINCREMENT,
            penalty_influence_points    INTEGER NOT NULL DEFAULT 0
        );",
    )
}

/// Append-only history of every money, influence and item movement.
fn create_ledger_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS money_transactions (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            from_player_id      INTEGER,
            to_player_id        INTEGER,
            amount              INTEGER NOT NULL,
            transaction_type    TEXT NOT NULL,
            reference_id        INTEGER,
            reference_type      TEXT,
            description         TEXT NOT NULL,
            created_at          TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS influence_transactions (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            player_id           INTEGER NOT NULL,
            amount              INTEGER NOT NULL,
            transaction_type    TEXT NOT NULL,
            reference_id        INTEGER,
            reference_type      TEXT,
            description         TEXT NOT NULL,
            created_at          TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS item_transactions (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            from_player_id      INTEGER,
            to_player_id        INTEGER,
            item_id             INTEGER NOT NULL,
            transaction_type    TEXT NOT NULL,
            reference_id        INTEGER,
            reference_type      TEXT,
            description         TEXT NOT NULL,
            created_at          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_money_tx_reference
            ON money_transactions (reference_type, reference_id);",
    )
}

fn create_game_timeline_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS game_timeline (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            game_started_at TEXT,
            game_ended_at   TEXT
        );",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_db_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open");
        init_db(&conn).expect("first init");
        init_db(&conn).expect("second init");
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('contracts', 'debt_receipts', 'item_effect_executions', 'game_timeline')",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(tables, 4);
    }
}
