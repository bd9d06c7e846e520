use rusqlite::Connection;

use crate::error::Result;

/// Open a connection with the pragmas the engine relies on.
pub fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// In-memory connection for tests.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    init_schema(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

/// Initialise all tables and indices. Idempotent, runs on every startup.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id               TEXT PRIMARY KEY,
            title            TEXT,
            resume_token     TEXT,
            tools_json       TEXT NOT NULL DEFAULT '[]',
            skills_json      TEXT NOT NULL DEFAULT '[]',
            mode             TEXT,
            agent_mode       TEXT,
            model            TEXT,
            workdir          TEXT,
            last_user_msg    TEXT,
            retry_count      INTEGER NOT NULL DEFAULT 0,
            partial_text     TEXT,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_updated
            ON sessions(updated_at);

        CREATE TABLE IF NOT EXISTS messages (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id       TEXT NOT NULL
                             REFERENCES sessions(id) ON DELETE CASCADE,
            role             TEXT NOT NULL,
            kind             TEXT NOT NULL DEFAULT 'text',
            content          TEXT NOT NULL,
            tool_name        TEXT,
            agent_id         TEXT,
            reply_to         INTEGER,
            attachments_json TEXT,
            created_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session
            ON messages(session_id, id);

        CREATE TABLE IF NOT EXISTS tasks (
            id                 TEXT PRIMARY KEY,
            title              TEXT NOT NULL,
            description        TEXT NOT NULL DEFAULT '',
            notes              TEXT,
            status             TEXT NOT NULL DEFAULT 'backlog',
            sort_order         INTEGER NOT NULL DEFAULT 0,
            session_id         TEXT,
            workdir            TEXT,
            model              TEXT,
            mode               TEXT,
            agent_mode         TEXT,
            max_turns          INTEGER,
            attachments_json   TEXT,
            depends_on_json    TEXT NOT NULL DEFAULT '[]',
            chain_id           TEXT,
            source_session_id  TEXT,
            failure_reason     TEXT,
            retry_count        INTEGER NOT NULL DEFAULT 0,
            worker_pid         INTEGER,
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_status
            ON tasks(status, sort_order, created_at);
        CREATE INDEX IF NOT EXISTS idx_tasks_chain
            ON tasks(chain_id);",
    )?;
    Ok(())
}
