use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, instrument};

use crate::error::{Result, StoreError};
use crate::types::{
    FailureReason, MessageKind, MessageRecord, NewMessage, NewSession, NewTask, Role,
    SessionRecord, TaskPatch, TaskRecord, TaskStatus,
};

const SESSION_COLS: &str = "id, title, resume_token, tools_json, skills_json, mode, agent_mode,
     model, workdir, last_user_msg, retry_count, partial_text, created_at, updated_at";

const TASK_COLS: &str = "id, title, description, notes, status, sort_order, session_id, workdir,
     model, mode, agent_mode, max_turns, attachments_json, depends_on_json, chain_id,
     source_session_id, failure_reason, retry_count, worker_pid, created_at, updated_at";

const MESSAGE_COLS: &str =
    "id, session_id, role, kind, content, tool_name, agent_id, reply_to, attachments_json,
     created_at";

/// Thread-safe store for sessions, messages, and tasks.
///
/// Wraps a single SQLite connection in a `Mutex`; writes are serialised
/// through it, which is the engine's single-writer contract.
pub struct Store {
    db: Mutex<Connection>,
}

impl Store {
    /// Wrap an already-open (and schema-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::new(crate::db::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(crate::db::open_in_memory()?))
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    #[instrument(skip(self, new))]
    pub fn create_session(&self, new: NewSession) -> Result<SessionRecord> {
        let id = maestro_core::ids::session_id();
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.prepare_cached(
            "INSERT INTO sessions
             (id, title, tools_json, skills_json, mode, agent_mode, model, workdir,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        )?
        .execute(rusqlite::params![
            id,
            new.title,
            serde_json::to_string(&new.tools).unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&new.skills).unwrap_or_else(|_| "[]".into()),
            new.mode,
            new.agent_mode,
            new.model,
            new.workdir,
            now,
        ])?;
        debug!(session_id = %id, "session created");
        self.get_session_locked(&db, &id)?
            .ok_or(StoreError::SessionNotFound { id })
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let db = self.db.lock().unwrap();
        self.get_session_locked(&db, id)
    }

    fn get_session_locked(&self, db: &Connection, id: &str) -> Result<Option<SessionRecord>> {
        let mut stmt =
            db.prepare_cached(&format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?1"))?;
        match stmt.query_row([id], row_to_session) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Most-recently-updated sessions, newest first.
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {SESSION_COLS} FROM sessions ORDER BY updated_at DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map([limit as i64], row_to_session)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Delete a session; its messages cascade.
    #[instrument(skip(self))]
    pub fn delete_session(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM sessions WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(StoreError::SessionNotFound { id: id.to_string() });
        }
        Ok(())
    }

    pub fn set_session_title(&self, id: &str, title: &str) -> Result<()> {
        self.session_write(
            id,
            "UPDATE sessions SET title = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![id, title, chrono::Utc::now().to_rfc3339()],
        )
    }

    pub fn set_resume_token(&self, id: &str, token: &str) -> Result<()> {
        self.session_write(
            id,
            "UPDATE sessions SET resume_token = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![id, token, chrono::Utc::now().to_rfc3339()],
        )
    }

    pub fn set_partial_text(&self, id: &str, text: Option<&str>) -> Result<()> {
        self.session_write(
            id,
            "UPDATE sessions SET partial_text = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![id, text, chrono::Utc::now().to_rfc3339()],
        )
    }

    pub fn set_last_user_msg(&self, id: &str, msg: Option<&str>) -> Result<()> {
        self.session_write(
            id,
            "UPDATE sessions SET last_user_msg = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![id, msg, chrono::Utc::now().to_rfc3339()],
        )
    }

    /// Bump the retry counter and return the new value.
    pub fn bump_session_retry(&self, id: &str) -> Result<u32> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let n = db.execute(
            "UPDATE sessions SET retry_count = retry_count + 1, updated_at = ?2 WHERE id = ?1",
            rusqlite::params![id, now],
        )?;
        if n == 0 {
            return Err(StoreError::SessionNotFound { id: id.to_string() });
        }
        let count = db.query_row(
            "SELECT retry_count FROM sessions WHERE id = ?1",
            [id],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count as u32)
    }

    /// Interrupted-turn bookkeeping: the streaming column resets but the
    /// prompt stays, so a reconnecting client can be offered a retry.
    pub fn suspend_turn(&self, id: &str) -> Result<()> {
        self.session_write(
            id,
            "UPDATE sessions SET partial_text = NULL, updated_at = ?2 WHERE id = ?1",
            rusqlite::params![id, chrono::Utc::now().to_rfc3339()],
        )
    }

    /// Terminal bookkeeping for a turn: `last_user_msg` and `partial_text`
    /// go back to null whatever way the turn ended, and a successful turn
    /// resets the retry counter.
    pub fn finish_turn(&self, id: &str, success: bool) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        if success {
            self.session_write(
                id,
                "UPDATE sessions SET last_user_msg = NULL, partial_text = NULL,
                    retry_count = 0, updated_at = ?2
                 WHERE id = ?1",
                rusqlite::params![id, now],
            )
        } else {
            self.session_write(
                id,
                "UPDATE sessions SET last_user_msg = NULL, partial_text = NULL,
                    updated_at = ?2
                 WHERE id = ?1",
                rusqlite::params![id, now],
            )
        }
    }

    /// Per-turn profile updates (model/mode/skills may change between turns).
    pub fn set_session_profile(
        &self,
        id: &str,
        model: Option<&str>,
        mode: Option<&str>,
        agent_mode: Option<&str>,
        skills: &[String],
        tools: &[String],
    ) -> Result<()> {
        self.session_write(
            id,
            "UPDATE sessions SET model = COALESCE(?2, model), mode = COALESCE(?3, mode),
                agent_mode = COALESCE(?4, agent_mode), skills_json = ?5, tools_json = ?6,
                updated_at = ?7
             WHERE id = ?1",
            rusqlite::params![
                id,
                model,
                mode,
                agent_mode,
                serde_json::to_string(skills).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(tools).unwrap_or_else(|_| "[]".into()),
                chrono::Utc::now().to_rfc3339(),
            ],
        )
    }

    fn session_write(&self, id: &str, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(sql, params)?;
        if n == 0 {
            return Err(StoreError::SessionNotFound { id: id.to_string() });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    pub fn append_message(&self, msg: NewMessage) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        db.prepare_cached(
            "INSERT INTO messages
             (session_id, role, kind, content, tool_name, agent_id, reply_to,
              attachments_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?
        .execute(rusqlite::params![
            msg.session_id,
            msg.role.as_str(),
            msg.kind.as_str(),
            msg.content,
            msg.tool_name,
            msg.agent_id,
            msg.reply_to,
            msg.attachments.map(|a| a.to_string()),
            now,
        ])?;
        Ok(db.last_insert_rowid())
    }

    /// Page through a session's log, oldest first, tool calls excluded.
    ///
    /// `before` is an exclusive message-id cursor for backwards pagination.
    pub fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
        before: Option<i64>,
    ) -> Result<Vec<MessageRecord>> {
        let db = self.db.lock().unwrap();
        let cursor = before.unwrap_or(i64::MAX);
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {MESSAGE_COLS} FROM messages
             WHERE session_id = ?1 AND kind != 'tool' AND id < ?2
             ORDER BY id DESC LIMIT ?3"
        ))?;
        let mut rows: Vec<MessageRecord> = stmt
            .query_map(
                rusqlite::params![session_id, cursor, limit as i64],
                row_to_message,
            )?
            .filter_map(|r| r.ok())
            .collect();
        rows.reverse();
        Ok(rows)
    }

    /// The most recent user message, used to tell an internal retry (same
    /// prompt again) from a genuinely new turn.
    pub fn last_user_message(&self, session_id: &str) -> Result<Option<String>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT content FROM messages
             WHERE session_id = ?1 AND role = 'user'
             ORDER BY id DESC LIMIT 1",
            [session_id],
            |row| row.get::<_, String>(0),
        ) {
            Ok(content) => Ok(Some(content)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Recovery heuristic input: does the session hold any assistant text?
    pub fn has_assistant_text(&self, session_id: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE session_id = ?1 AND role = 'assistant' AND kind = 'text'",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    #[instrument(skip(self, new), fields(title = %new.title))]
    pub fn create_task(&self, new: NewTask) -> Result<TaskRecord> {
        let id = maestro_core::ids::task_id();
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.prepare_cached(
            "INSERT INTO tasks
             (id, title, description, status, sort_order, session_id, workdir, model,
              mode, agent_mode, max_turns, attachments_json, depends_on_json, chain_id,
              source_session_id, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?16)",
        )?
        .execute(rusqlite::params![
            id,
            new.title,
            new.description,
            new.status.as_str(),
            new.sort_order,
            new.session_id,
            new.workdir,
            new.model,
            new.mode,
            new.agent_mode,
            new.max_turns,
            new.attachments.map(|a| a.to_string()),
            serde_json::to_string(&new.depends_on).unwrap_or_else(|_| "[]".into()),
            new.chain_id,
            new.source_session_id,
            now,
        ])?;
        debug!(task_id = %id, "task created");
        self.get_task_locked(&db, &id)?
            .ok_or(StoreError::TaskNotFound { id })
    }

    pub fn get_task(&self, id: &str) -> Result<Option<TaskRecord>> {
        let db = self.db.lock().unwrap();
        self.get_task_locked(&db, id)
    }

    fn get_task_locked(&self, db: &Connection, id: &str) -> Result<Option<TaskRecord>> {
        let mut stmt = db.prepare_cached(&format!("SELECT {TASK_COLS} FROM tasks WHERE id = ?1"))?;
        match stmt.query_row([id], row_to_task) {
            Ok(t) => Ok(Some(t)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {TASK_COLS} FROM tasks ORDER BY sort_order, created_at"
        ))?;
        let rows = stmt.query_map([], row_to_task)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Scheduler candidates, in dispatch order.
    pub fn list_todo_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.list_by_status(TaskStatus::Todo)
    }

    pub fn list_in_progress_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.list_by_status(TaskStatus::InProgress)
    }

    fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {TASK_COLS} FROM tasks WHERE status = ?1
             ORDER BY sort_order, created_at"
        ))?;
        let rows = stmt.query_map([status.as_str()], row_to_task)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn tasks_by_chain(&self, chain_id: &str) -> Result<Vec<TaskRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {TASK_COLS} FROM tasks WHERE chain_id = ?1
             ORDER BY sort_order, created_at"
        ))?;
        let rows = stmt.query_map([chain_id], row_to_task)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn delete_task(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(StoreError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Apply a manual board edit.
    pub fn update_task(&self, id: &str, patch: TaskPatch) -> Result<TaskRecord> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let mut sets: Vec<String> = vec!["updated_at = ?1".into()];
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now)];

        let mut push = |clause: &str, value: Box<dyn rusqlite::ToSql>, params: &mut Vec<Box<dyn rusqlite::ToSql>>, sets: &mut Vec<String>| {
            params.push(value);
            sets.push(format!("{clause} = ?{}", params.len()));
        };

        if let Some(v) = patch.title {
            push("title", Box::new(v), &mut params, &mut sets);
        }
        if let Some(v) = patch.description {
            push("description", Box::new(v), &mut params, &mut sets);
        }
        if let Some(v) = patch.notes {
            push("notes", Box::new(v), &mut params, &mut sets);
        }
        if let Some(v) = patch.status {
            push("status", Box::new(v.as_str().to_string()), &mut params, &mut sets);
        }
        if let Some(v) = patch.sort_order {
            push("sort_order", Box::new(v), &mut params, &mut sets);
        }
        if let Some(v) = patch.workdir {
            push("workdir", Box::new(v), &mut params, &mut sets);
        }
        if let Some(v) = patch.model {
            push("model", Box::new(v), &mut params, &mut sets);
        }
        if let Some(v) = patch.mode {
            push("mode", Box::new(v), &mut params, &mut sets);
        }
        if let Some(v) = patch.agent_mode {
            push("agent_mode", Box::new(v), &mut params, &mut sets);
        }
        if let Some(v) = patch.max_turns {
            push("max_turns", Box::new(v), &mut params, &mut sets);
        }
        if let Some(v) = patch.depends_on {
            let json = serde_json::to_string(&v).unwrap_or_else(|_| "[]".into());
            push("depends_on_json", Box::new(json), &mut params, &mut sets);
        }
        if let Some(v) = patch.failure_reason {
            let s = v.map(|r| r.as_str().to_string());
            push("failure_reason", Box::new(s), &mut params, &mut sets);
        }

        params.push(Box::new(id.to_string()));
        let sql = format!(
            "UPDATE tasks SET {} WHERE id = ?{}",
            sets.join(", "),
            params.len()
        );
        let n = db.execute(&sql, rusqlite::params_from_iter(params.iter().map(|b| b.as_ref())))?;
        if n == 0 {
            return Err(StoreError::TaskNotFound { id: id.to_string() });
        }
        self.get_task_locked(&db, id)?
            .ok_or(StoreError::TaskNotFound { id: id.to_string() })
    }

    /// Transition a task to `in_progress`, recording the worker pid.
    pub fn start_task(&self, id: &str, pid: u32) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let n = db.execute(
            "UPDATE tasks SET status = 'in_progress', worker_pid = ?2,
                failure_reason = NULL, updated_at = ?3
             WHERE id = ?1",
            rusqlite::params![id, pid, now],
        )?;
        if n == 0 {
            return Err(StoreError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Start a task against an adopted session (chain members joining the
    /// session their predecessor established).
    pub fn start_task_with_session(&self, id: &str, session_id: &str, pid: u32) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let n = db.execute(
            "UPDATE tasks SET status = 'in_progress', session_id = ?2, worker_pid = ?3,
                failure_reason = NULL, updated_at = ?4
             WHERE id = ?1",
            rusqlite::params![id, session_id, pid, now],
        )?;
        if n == 0 {
            return Err(StoreError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Session creation + task link + status change, atomically. A crash
    /// between the two writes must not leave a running task with no session.
    pub fn start_task_with_new_session(
        &self,
        task_id: &str,
        new: NewSession,
        pid: u32,
    ) -> Result<SessionRecord> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let session_id = maestro_core::ids::session_id();
        let now = chrono::Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO sessions
             (id, title, tools_json, skills_json, mode, agent_mode, model, workdir,
              created_at, updated_at)
             VALUES (?1, ?2, '[]', '[]', ?3, ?4, ?5, ?6, ?7, ?7)",
            rusqlite::params![
                session_id,
                new.title,
                new.mode,
                new.agent_mode,
                new.model,
                new.workdir,
                now,
            ],
        )?;
        let n = tx.execute(
            "UPDATE tasks SET status = 'in_progress', session_id = ?2, worker_pid = ?3,
                failure_reason = NULL, updated_at = ?4
             WHERE id = ?1",
            rusqlite::params![task_id, session_id, pid, now],
        )?;
        if n == 0 {
            return Err(StoreError::TaskNotFound {
                id: task_id.to_string(),
            });
        }
        tx.commit()?;
        let db = &*db;
        self.get_session_locked(db, &session_id)?
            .ok_or(StoreError::SessionNotFound { id: session_id })
    }

    /// Update the recorded subprocess pid mid-run (set when the assistant
    /// child spawns, cleared with the terminal transition).
    pub fn set_task_worker_pid(&self, id: &str, pid: Option<u32>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let n = db.execute(
            "UPDATE tasks SET worker_pid = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![id, pid, now],
        )?;
        if n == 0 {
            return Err(StoreError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Terminal transition. Clears `worker_pid` so the pid invariant holds.
    pub fn finish_task(
        &self,
        id: &str,
        status: TaskStatus,
        reason: Option<FailureReason>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let n = db.execute(
            "UPDATE tasks SET status = ?2, failure_reason = ?3, worker_pid = NULL,
                updated_at = ?4
             WHERE id = ?1",
            rusqlite::params![id, status.as_str(), reason.map(|r| r.as_str()), now],
        )?;
        if n == 0 {
            return Err(StoreError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Chain-retry transition: back to `todo`, retry counter bumped.
    pub fn retry_task(&self, id: &str, reason: FailureReason) -> Result<u32> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let n = db.execute(
            "UPDATE tasks SET status = 'todo', retry_count = retry_count + 1,
                failure_reason = ?2, worker_pid = NULL, updated_at = ?3
             WHERE id = ?1",
            rusqlite::params![id, reason.as_str(), now],
        )?;
        if n == 0 {
            return Err(StoreError::TaskNotFound { id: id.to_string() });
        }
        let count = db.query_row("SELECT retry_count FROM tasks WHERE id = ?1", [id], |row| {
            row.get::<_, i64>(0)
        })?;
        Ok(count as u32)
    }

    // -----------------------------------------------------------------------
    // Maintenance hooks (driven by maintenance::run_loop)
    // -----------------------------------------------------------------------

    /// Delete sessions idle past the TTL; messages cascade. Returns the
    /// number of deleted sessions.
    pub fn delete_stale_sessions(&self, ttl_days: u32) -> Result<usize> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(ttl_days as i64)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM sessions WHERE updated_at < ?1", [&cutoff])?;
        Ok(n)
    }

    /// Truncating WAL checkpoint after a non-trivial cleanup.
    pub fn checkpoint_truncate(&self) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let tools_json: String = row.get(3)?;
    let skills_json: String = row.get(4)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        resume_token: row.get(2)?,
        tools: serde_json::from_str(&tools_json).unwrap_or_default(),
        skills: serde_json::from_str(&skills_json).unwrap_or_default(),
        mode: row.get(5)?,
        agent_mode: row.get(6)?,
        model: row.get(7)?,
        workdir: row.get(8)?,
        last_user_msg: row.get(9)?,
        retry_count: row.get::<_, i64>(10)? as u32,
        partial_text: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let role: String = row.get(2)?;
    let kind: String = row.get(3)?;
    let attachments_json: Option<String> = row.get(8)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: if role == "user" { Role::User } else { Role::Assistant },
        kind: kind.parse().unwrap_or(MessageKind::Text),
        content: row.get(4)?,
        tool_name: row.get(5)?,
        agent_id: row.get(6)?,
        reply_to: row.get(7)?,
        attachments: attachments_json.and_then(|j| serde_json::from_str(&j).ok()),
        created_at: row.get(9)?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let status_str: String = row.get(4)?;
    let status: TaskStatus = status_str.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("bad task status: {status_str}").into(),
        )
    })?;
    let attachments_json: Option<String> = row.get(12)?;
    let depends_on_json: String = row.get(13)?;
    let failure_reason: Option<String> = row.get(16)?;
    Ok(TaskRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        notes: row.get(3)?,
        status,
        sort_order: row.get(5)?,
        session_id: row.get(6)?,
        workdir: row.get(7)?,
        model: row.get(8)?,
        mode: row.get(9)?,
        agent_mode: row.get(10)?,
        max_turns: row.get::<_, Option<i64>>(11)?.map(|n| n as u32),
        attachments: attachments_json.and_then(|j| serde_json::from_str(&j).ok()),
        depends_on: serde_json::from_str(&depends_on_json).unwrap_or_default(),
        chain_id: row.get(14)?,
        source_session_id: row.get(15)?,
        failure_reason: failure_reason.and_then(|s| s.parse().ok()),
        retry_count: row.get::<_, i64>(17)? as u32,
        worker_pid: row.get::<_, Option<i64>>(18)?.map(|p| p as u32),
        created_at: row.get(19)?,
        updated_at: row.get(20)?,
    })
}
