use rusqlite::{Connection, Result};

/// Initialise the system-of-record schema. Safe to call on every startup
/// (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_sessions_table(conn)?;
    create_messages_table(conn)?;
    create_user_pointers_table(conn)?;
    create_message_log_table(conn)?;
    create_chat_snapshots_table(conn)?;
    create_runtime_config_table(conn)?;
    create_characters_table(conn)?;
    Ok(())
}

fn create_sessions_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            session_id      TEXT PRIMARY KEY,
            user_id         TEXT NOT NULL,
            role_id         TEXT,
            turn_count      INTEGER NOT NULL DEFAULT 0,
            last_active_ms  INTEGER NOT NULL,
            data            TEXT,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_user
            ON sessions(user_id);",
    )
}

/// History is stored out-of-line from `sessions`, one row per message,
/// ordered by `ordinal`. Push-right is an insert at `max(ordinal)+1`; trim
/// deletes the lowest-ordinal rows down to the retention count.
fn create_messages_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id  TEXT NOT NULL,
            ordinal     INTEGER NOT NULL,
            role        TEXT NOT NULL,
            content     TEXT NOT NULL,
            UNIQUE(session_id, ordinal)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session
            ON messages(session_id, ordinal);",
    )
}

fn create_user_pointers_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS user_pointers (
            user_id             TEXT PRIMARY KEY,
            current_session_id  TEXT,
            last_session_id     TEXT,
            last_active_ms      INTEGER,
            model_tier          TEXT NOT NULL DEFAULT 'standard_b'
        );",
    )
}

fn create_message_log_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS message_log (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id             TEXT NOT NULL,
            role_id             TEXT,
            user_input          TEXT NOT NULL,
            bot_reply           TEXT NOT NULL,
            instructions        TEXT NOT NULL,
            history_at_request  TEXT NOT NULL,
            model_name          TEXT NOT NULL,
            attempt_count       INTEGER NOT NULL DEFAULT 1,
            turn_type           TEXT NOT NULL DEFAULT 'normal',
            created_at          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_message_log_user
            ON message_log(user_id, created_at DESC);",
    )
}

fn create_chat_snapshots_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS chat_snapshots (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            snapshot_id     TEXT NOT NULL UNIQUE,
            user_id         TEXT NOT NULL,
            role_id         TEXT,
            snapshot_name   TEXT NOT NULL,
            history         TEXT NOT NULL,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_snapshots_user
            ON chat_snapshots(user_id, snapshot_name);",
    )
}

fn create_runtime_config_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS runtime_config (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            description TEXT,
            version     INTEGER NOT NULL DEFAULT 1,
            updated_at  TEXT NOT NULL
        );",
    )
}

/// Role cards. A miss here falls through to a bundled `characters/<id>.json`
/// file and finally to a hardcoded default (see `turnstile-sessions`).
fn create_characters_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS characters (
            role_id         TEXT PRIMARY KEY,
            name            TEXT NOT NULL,
            system_prompt   TEXT NOT NULL,
            first_mes       TEXT NOT NULL,
            extensions      TEXT
        );",
    )
}
