use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{EngineError, Result};
use crate::model::{
    CharacterProfile, Conversation, DialogueTurn, Expression, JournalEntry, PoolConversation,
    PracticeLogEntry, ThoughtAttempt, Tier, UserProgress,
};
use crate::progress::{advance_streak, success_rate};
use crate::score::{next_mastery_level, MasteryUpdate, MASTERED_LEVEL};

const DATE_FMT: &str = "%Y-%m-%d";

/// SQLite-backed store for every persisted entity. Each multi-entity unit
/// (attempt + mastery + aggregates, completion + journal + aggregates,
/// expression save + counter) commits in a single transaction, so a failure
/// anywhere in the unit rolls the whole unit back; a score is never durable
/// without its mastery and streak effects. `user_progress` and `expressions`
/// carry a version column, checked on write inside the transaction, so a
/// writer that lost a race surfaces as `TransientStoreConflict` instead of
/// silently losing updates.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::init_schema(&conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS profiles (
                user_id TEXT PRIMARY KEY,
                location TEXT NOT NULL,
                age_group TEXT NOT NULL,
                gender TEXT NOT NULL,
                start_date TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                scenario TEXT NOT NULL,
                tier INTEGER NOT NULL,
                target_location TEXT,
                target_age_group TEXT,
                target_gender TEXT,
                dialogue TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                success_rate REAL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_user
                ON conversations(user_id, completed, created_at);
            CREATE TABLE IF NOT EXISTS served (
                user_id TEXT NOT NULL,
                pool_id TEXT NOT NULL,
                served_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_served_user ON served(user_id, served_at);
            CREATE TABLE IF NOT EXISTS attempts (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                turn_index INTEGER NOT NULL,
                transcription TEXT NOT NULL,
                success_score REAL NOT NULL,
                attempt_number INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attempts_conversation
                ON attempts(conversation_id, turn_index);
            CREATE TABLE IF NOT EXISTS expressions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                conversation_id TEXT,
                thought TEXT NOT NULL,
                expression TEXT NOT NULL,
                mastery_level INTEGER NOT NULL DEFAULT 0,
                practice_count INTEGER NOT NULL DEFAULT 0,
                last_practiced TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_expressions_user ON expressions(user_id);
            CREATE TABLE IF NOT EXISTS user_progress (
                user_id TEXT PRIMARY KEY,
                total_conversations INTEGER NOT NULL DEFAULT 0,
                total_minutes INTEGER NOT NULL DEFAULT 0,
                expressions_saved INTEGER NOT NULL DEFAULT 0,
                expressions_mastered INTEGER NOT NULL DEFAULT 0,
                current_streak INTEGER NOT NULL DEFAULT 0,
                longest_streak INTEGER NOT NULL DEFAULT 0,
                last_practice_date TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS journal (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                day_number INTEGER NOT NULL,
                emotional_state TEXT,
                confidence_level INTEGER,
                notes TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS practice_log (
                user_id TEXT NOT NULL,
                practice_date TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                minutes INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, practice_date)
            );
            CREATE TABLE IF NOT EXISTS library (
                id TEXT PRIMARY KEY,
                scenario TEXT NOT NULL,
                tier INTEGER NOT NULL,
                target_location TEXT,
                target_age_group TEXT,
                target_gender TEXT,
                dialogue TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_library_tier ON library(tier);",
        )?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    // ---- profiles ------------------------------------------------------

    /// Insert or update a profile's editable fields. An already-set
    /// `start_date` is preserved no matter what the incoming profile says.
    pub fn put_profile(&self, profile: &CharacterProfile) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO profiles (user_id, location, age_group, gender, start_date, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
                location = excluded.location,
                age_group = excluded.age_group,
                gender = excluded.gender",
            params![
                profile.user_id,
                profile.location,
                profile.age_group,
                profile.gender,
                profile.start_date.map(|d| d.format(DATE_FMT).to_string()),
                profile.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Set the practice start date if and only if it is still unset.
    pub fn begin_practice(&self, user_id: &str, date: NaiveDate) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE profiles SET start_date = ?1 WHERE user_id = ?2 AND start_date IS NULL",
            params![date.format(DATE_FMT).to_string(), user_id],
        )?;
        Ok(())
    }

    pub fn get_profile(&self, user_id: &str) -> Result<Option<CharacterProfile>> {
        let conn = self.lock();
        let profile = conn
            .query_row(
                "SELECT user_id, location, age_group, gender, start_date, created_at
                 FROM profiles WHERE user_id = ?1",
                params![user_id],
                row_to_profile,
            )
            .optional()?;
        Ok(profile)
    }

    // ---- conversations -------------------------------------------------

    /// Bind a conversation to a user and record the serving, unless an
    /// incomplete conversation raced in since the caller last checked; the
    /// raced-in one wins and no duplicate is minted.
    pub fn bind_conversation(
        &self,
        conversation: Conversation,
        pool_id: Option<&str>,
    ) -> Result<Conversation> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        if let Some(existing) = query_latest_incomplete(&tx, &conversation.user_id)? {
            tx.commit()?;
            return Ok(existing);
        }
        tx.execute(
            "INSERT INTO conversations
                (id, user_id, scenario, tier, target_location, target_age_group,
                 target_gender, dialogue, completed, success_rate, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, NULL, ?9)",
            params![
                conversation.id,
                conversation.user_id,
                conversation.scenario,
                conversation.tier,
                conversation.target_location,
                conversation.target_age_group,
                conversation.target_gender,
                serde_json::to_string(&conversation.dialogue)?,
                conversation.created_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "INSERT INTO served (user_id, pool_id, served_at) VALUES (?1, ?2, ?3)",
            params![
                conversation.user_id,
                pool_id.unwrap_or(&conversation.id),
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(conversation)
    }

    pub fn get_conversation(&self, id: &str) -> Result<Conversation> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, user_id, scenario, tier, target_location, target_age_group,
                    target_gender, dialogue, completed, success_rate, created_at
             FROM conversations WHERE id = ?1",
            params![id],
            row_to_conversation,
        )
        .optional()?
        .ok_or_else(|| EngineError::NotFound(format!("conversation {}", id)))
    }

    pub fn latest_incomplete(&self, user_id: &str) -> Result<Option<Conversation>> {
        let conn = self.lock();
        query_latest_incomplete(&conn, user_id)
    }

    // ---- serving history -----------------------------------------------

    /// Pool ids served to the user most recently, newest first, at most `k`.
    pub fn recent_served(&self, user_id: &str, k: usize) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT pool_id FROM served WHERE user_id = ?1
             ORDER BY served_at DESC, rowid DESC LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![user_id, k as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Most recent serve time per pool id, for least-recently-served picks.
    pub fn last_served_map(&self, user_id: &str) -> Result<HashMap<String, DateTime<Utc>>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT pool_id, MAX(served_at) FROM served WHERE user_id = ?1 GROUP BY pool_id",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            let pool_id: String = row.get(0)?;
            let served_at: String = row.get(1)?;
            Ok((pool_id, served_at))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (pool_id, served_at) = row?;
            map.insert(pool_id, parse_datetime(&served_at, 1)?);
        }
        Ok(map)
    }

    // ---- the attempt unit ----------------------------------------------

    /// Record one scored attempt and everything that follows from it, in a
    /// single transaction: the attempt row (number computed here so
    /// concurrent retries never collide), the mastery transition of the
    /// matching saved expression if one exists, the streak and counter
    /// update, and the per-day practice log. Any failure rolls the whole
    /// unit back.
    pub fn apply_attempt(
        &self,
        conversation_id: &str,
        user_id: &str,
        turn_index: usize,
        transcription: &str,
        success_score: f64,
        expected: &str,
        today: NaiveDate,
    ) -> Result<(ThoughtAttempt, Option<MasteryUpdate>)> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let next_number: u32 = tx.query_row(
            "SELECT COALESCE(MAX(attempt_number), 0) + 1 FROM attempts
             WHERE conversation_id = ?1 AND turn_index = ?2",
            params![conversation_id, turn_index as i64],
            |row| row.get(0),
        )?;
        let attempt = ThoughtAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            turn_index,
            transcription: transcription.to_string(),
            success_score,
            attempt_number: next_number,
            created_at: Utc::now(),
        };
        tx.execute(
            "INSERT INTO attempts
                (id, conversation_id, turn_index, transcription, success_score,
                 attempt_number, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                attempt.id,
                attempt.conversation_id,
                attempt.turn_index as i64,
                attempt.transcription,
                attempt.success_score,
                attempt.attempt_number,
                attempt.created_at.to_rfc3339(),
            ],
        )?;

        let mastery = match query_expression(&tx, user_id, expected)? {
            Some((expr, version)) => {
                let new_level =
                    next_mastery_level(expr.mastery_level, expr.practice_count, success_score);
                let new_count = expr.practice_count + 1;
                write_mastery(&tx, &expr.id, version, new_level, new_count, Utc::now())?;
                Some(MasteryUpdate {
                    expression_id: expr.id,
                    mastery_level: new_level,
                    practice_count: new_count,
                    mastered_now: new_level == MASTERED_LEVEL
                        && expr.mastery_level < MASTERED_LEVEL,
                })
            }
            None => None,
        };
        let mastered_now = mastery.as_ref().map_or(false, |m| m.mastered_now);

        let (mut progress, version) = progress_row(&tx, user_id)?;
        let streak = advance_streak(
            progress.current_streak,
            progress.longest_streak,
            progress.last_practice_date,
            today,
        );
        progress.current_streak = streak.current_streak;
        progress.longest_streak = streak.longest_streak;
        progress.last_practice_date = Some(today);
        if mastered_now {
            progress.expressions_mastered += 1;
        }
        write_progress(&tx, &progress, version)?;
        bump_practice_log(&tx, user_id, today, 1, 0)?;

        tx.commit()?;
        Ok((attempt, mastery))
    }

    /// The user's most recent attempt scores across all conversations,
    /// newest first, for the calibrator's rolling average.
    pub fn recent_scores(&self, user_id: &str, n: usize) -> Result<Vec<f64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT a.success_score FROM attempts a
             JOIN conversations c ON c.id = a.conversation_id
             WHERE c.user_id = ?1
             ORDER BY a.created_at DESC, a.rowid DESC LIMIT ?2",
        )?;
        let scores = stmt
            .query_map(params![user_id, n as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<f64>, _>>()?;
        Ok(scores)
    }

    // ---- the completion unit -------------------------------------------

    /// Seal a conversation and everything that follows from sealing, in a
    /// single transaction: the success rate frozen from the attempts as they
    /// stand, the journal entry, the conversation/minute counters, the
    /// streak, and the practice log. Completion is monotonic; sealing twice
    /// is a contract violation.
    pub fn complete_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
        minutes: u32,
        journal: &JournalEntry,
        today: NaiveDate,
    ) -> Result<(f64, UserProgress)> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let completed: Option<bool> = tx
            .query_row(
                "SELECT completed FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        match completed {
            None => {
                return Err(EngineError::NotFound(format!(
                    "conversation {}",
                    conversation_id
                )))
            }
            Some(true) => {
                return Err(EngineError::ConversationSealed(conversation_id.to_string()))
            }
            Some(false) => {}
        }

        let mut stmt =
            tx.prepare("SELECT success_score FROM attempts WHERE conversation_id = ?1")?;
        let scores = stmt
            .query_map(params![conversation_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<f64>, _>>()?;
        drop(stmt);
        let rate = success_rate(&scores);

        tx.execute(
            "UPDATE conversations SET completed = 1, success_rate = ?1 WHERE id = ?2",
            params![rate, conversation_id],
        )?;
        tx.execute(
            "INSERT INTO journal
                (id, user_id, conversation_id, day_number, emotional_state,
                 confidence_level, notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                journal.id,
                journal.user_id,
                journal.conversation_id,
                journal.day_number,
                journal.emotional_state,
                journal.confidence_level,
                journal.notes,
                journal.created_at.to_rfc3339(),
            ],
        )?;

        let (mut progress, version) = progress_row(&tx, user_id)?;
        progress.total_conversations += 1;
        progress.total_minutes += minutes;
        let streak = advance_streak(
            progress.current_streak,
            progress.longest_streak,
            progress.last_practice_date,
            today,
        );
        progress.current_streak = streak.current_streak;
        progress.longest_streak = streak.longest_streak;
        progress.last_practice_date = Some(today);
        write_progress(&tx, &progress, version)?;
        bump_practice_log(&tx, user_id, today, 0, minutes)?;

        tx.commit()?;
        Ok((rate, progress))
    }

    // ---- expressions ---------------------------------------------------

    /// Insert a freshly saved expression and bump the user's saved counter,
    /// in one transaction.
    pub fn save_expression_counted(&self, expression: &Expression) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO expressions
                (id, user_id, conversation_id, thought, expression, mastery_level,
                 practice_count, last_practiced, version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9)",
            params![
                expression.id,
                expression.user_id,
                expression.conversation_id,
                expression.thought,
                expression.expression,
                expression.mastery_level,
                expression.practice_count,
                expression.last_practiced.map(|t| t.to_rfc3339()),
                expression.created_at.to_rfc3339(),
            ],
        )?;
        let (mut progress, version) = progress_row(&tx, &expression.user_id)?;
        progress.expressions_saved += 1;
        write_progress(&tx, &progress, version)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_expression(&self, user_id: &str, id: &str) -> Result<Expression> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, user_id, conversation_id, thought, expression, mastery_level,
                    practice_count, last_practiced, created_at
             FROM expressions WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
            row_to_expression,
        )
        .optional()?
        .ok_or_else(|| EngineError::NotFound(format!("expression {}", id)))
    }

    /// The saved expression matching this target phrase, with its row
    /// version, if the user has saved it.
    pub fn find_expression(
        &self,
        user_id: &str,
        expression_text: &str,
    ) -> Result<Option<(Expression, i64)>> {
        let conn = self.lock();
        query_expression(&conn, user_id, expression_text)
    }

    pub fn list_expressions(&self, user_id: &str, limit: usize) -> Result<Vec<Expression>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, conversation_id, thought, expression, mastery_level,
                    practice_count, last_practiced, created_at
             FROM expressions WHERE user_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let expressions = stmt
            .query_map(params![user_id, limit as i64], row_to_expression)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(expressions)
    }

    pub fn search_expressions(&self, user_id: &str, query: &str) -> Result<Vec<Expression>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, conversation_id, thought, expression, mastery_level,
                    practice_count, last_practiced, created_at
             FROM expressions
             WHERE user_id = ?1 AND (expression LIKE ?2 OR thought LIKE ?2)
             ORDER BY created_at DESC",
        )?;
        let pattern = format!("%{}%", query);
        let expressions = stmt
            .query_map(params![user_id, pattern], row_to_expression)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(expressions)
    }

    pub fn delete_expression(&self, user_id: &str, id: &str) -> Result<()> {
        let conn = self.lock();
        let rows = conn.execute(
            "DELETE FROM expressions WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        if rows == 0 {
            return Err(EngineError::NotFound(format!("expression {}", id)));
        }
        Ok(())
    }

    /// Explicit user-initiated mastery reset. Practice history stays.
    pub fn reset_mastery(&self, user_id: &str, id: &str) -> Result<()> {
        let conn = self.lock();
        let rows = conn.execute(
            "UPDATE expressions SET mastery_level = 0, version = version + 1
             WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        if rows == 0 {
            return Err(EngineError::NotFound(format!("expression {}", id)));
        }
        Ok(())
    }

    // ---- progress ------------------------------------------------------

    /// The user's progress row, created empty on first use.
    pub fn get_progress(&self, user_id: &str) -> Result<UserProgress> {
        let conn = self.lock();
        Ok(progress_row(&conn, user_id)?.0)
    }

    // ---- journal -------------------------------------------------------

    pub fn journal_entries(&self, user_id: &str, limit: usize) -> Result<Vec<JournalEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, conversation_id, day_number, emotional_state,
                    confidence_level, notes, created_at
             FROM journal WHERE user_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![user_id, limit as i64], row_to_journal)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ---- practice log --------------------------------------------------

    /// The per-day activity log for the inclusive window of `days` calendar
    /// days ending today, newest first.
    pub fn practice_history(
        &self,
        user_id: &str,
        days: i64,
        today: NaiveDate,
    ) -> Result<Vec<PracticeLogEntry>> {
        let start = today - chrono::Duration::days(days.max(1) - 1);
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, practice_date, attempts, minutes FROM practice_log
             WHERE user_id = ?1 AND practice_date >= ?2
             ORDER BY practice_date DESC",
        )?;
        let entries = stmt
            .query_map(
                params![user_id, start.format(DATE_FMT).to_string()],
                |row| {
                    let date: String = row.get(1)?;
                    Ok(PracticeLogEntry {
                        user_id: row.get(0)?,
                        practice_date: parse_date(&date, 1)?,
                        attempts: row.get(2)?,
                        minutes: row.get(3)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ---- content library (the shared pool) -----------------------------

    pub fn insert_library(&self, conversation: &PoolConversation) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO library
                (id, scenario, tier, target_location, target_age_group,
                 target_gender, dialogue)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conversation.id,
                conversation.scenario,
                conversation.tier,
                conversation.target_location,
                conversation.target_age_group,
                conversation.target_gender,
                serde_json::to_string(&conversation.dialogue)?,
            ],
        )?;
        Ok(())
    }

    pub fn library_by_tier(&self, tier: Tier) -> Result<Vec<PoolConversation>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, scenario, tier, target_location, target_age_group,
                    target_gender, dialogue
             FROM library WHERE tier = ?1 ORDER BY id",
        )?;
        let conversations = stmt
            .query_map(params![tier], row_to_pool_conversation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(conversations)
    }

    pub fn library_count(&self) -> Result<usize> {
        let conn = self.lock();
        let count: usize = conn.query_row("SELECT COUNT(*) FROM library", [], |row| row.get(0))?;
        Ok(count)
    }
}

// ---- transaction helpers -----------------------------------------------

fn query_expression(
    conn: &Connection,
    user_id: &str,
    expression_text: &str,
) -> Result<Option<(Expression, i64)>> {
    let found = conn
        .query_row(
            "SELECT id, user_id, conversation_id, thought, expression, mastery_level,
                    practice_count, last_practiced, created_at, version
             FROM expressions WHERE user_id = ?1 AND expression = ?2",
            params![user_id, expression_text],
            |row| Ok((row_to_expression(row)?, row.get::<_, i64>(9)?)),
        )
        .optional()?;
    Ok(found)
}

fn write_mastery(
    conn: &Connection,
    id: &str,
    expected_version: i64,
    mastery_level: u8,
    practice_count: u32,
    last_practiced: DateTime<Utc>,
) -> Result<()> {
    let rows = conn.execute(
        "UPDATE expressions
         SET mastery_level = ?1, practice_count = ?2, last_practiced = ?3,
             version = version + 1
         WHERE id = ?4 AND version = ?5",
        params![
            mastery_level,
            practice_count,
            last_practiced.to_rfc3339(),
            id,
            expected_version,
        ],
    )?;
    if rows == 0 {
        return Err(EngineError::TransientStoreConflict(format!(
            "expression {}",
            id
        )));
    }
    Ok(())
}

fn progress_row(conn: &Connection, user_id: &str) -> Result<(UserProgress, i64)> {
    conn.execute(
        "INSERT OR IGNORE INTO user_progress (user_id, updated_at) VALUES (?1, ?2)",
        params![user_id, Utc::now().to_rfc3339()],
    )?;
    let result = conn.query_row(
        "SELECT user_id, total_conversations, total_minutes, expressions_saved,
                expressions_mastered, current_streak, longest_streak,
                last_practice_date, updated_at, version
         FROM user_progress WHERE user_id = ?1",
        params![user_id],
        |row| Ok((row_to_progress(row)?, row.get::<_, i64>(9)?)),
    )?;
    Ok(result)
}

fn write_progress(
    conn: &Connection,
    progress: &UserProgress,
    expected_version: i64,
) -> Result<()> {
    let rows = conn.execute(
        "UPDATE user_progress
         SET total_conversations = ?1, total_minutes = ?2, expressions_saved = ?3,
             expressions_mastered = ?4, current_streak = ?5, longest_streak = ?6,
             last_practice_date = ?7, updated_at = ?8, version = version + 1
         WHERE user_id = ?9 AND version = ?10",
        params![
            progress.total_conversations,
            progress.total_minutes,
            progress.expressions_saved,
            progress.expressions_mastered,
            progress.current_streak,
            progress.longest_streak,
            progress
                .last_practice_date
                .map(|d| d.format(DATE_FMT).to_string()),
            Utc::now().to_rfc3339(),
            progress.user_id,
            expected_version,
        ],
    )?;
    if rows == 0 {
        return Err(EngineError::TransientStoreConflict(format!(
            "progress {}",
            progress.user_id
        )));
    }
    Ok(())
}

fn bump_practice_log(
    conn: &Connection,
    user_id: &str,
    date: NaiveDate,
    attempts_delta: u32,
    minutes_delta: u32,
) -> Result<()> {
    conn.execute(
        "INSERT INTO practice_log (user_id, practice_date, attempts, minutes)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id, practice_date) DO UPDATE SET
            attempts = attempts + excluded.attempts,
            minutes = minutes + excluded.minutes",
        params![
            user_id,
            date.format(DATE_FMT).to_string(),
            attempts_delta,
            minutes_delta,
        ],
    )?;
    Ok(())
}

// ---- row mappers -------------------------------------------------------

fn parse_datetime(s: &str, col: usize) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_date(s: &str, col: usize) -> std::result::Result<NaiveDate, rusqlite::Error> {
    NaiveDate::parse_from_str(s, DATE_FMT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_dialogue(s: &str, col: usize) -> std::result::Result<Vec<DialogueTurn>, rusqlite::Error> {
    serde_json::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_profile(row: &Row<'_>) -> std::result::Result<CharacterProfile, rusqlite::Error> {
    let start_date: Option<String> = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(CharacterProfile {
        user_id: row.get(0)?,
        location: row.get(1)?,
        age_group: row.get(2)?,
        gender: row.get(3)?,
        start_date: start_date.map(|s| parse_date(&s, 4)).transpose()?,
        created_at: parse_datetime(&created_at, 5)?,
    })
}

fn row_to_conversation(row: &Row<'_>) -> std::result::Result<Conversation, rusqlite::Error> {
    let dialogue: String = row.get(7)?;
    let created_at: String = row.get(10)?;
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        scenario: row.get(2)?,
        tier: row.get(3)?,
        target_location: row.get(4)?,
        target_age_group: row.get(5)?,
        target_gender: row.get(6)?,
        dialogue: parse_dialogue(&dialogue, 7)?,
        completed: row.get(8)?,
        success_rate: row.get(9)?,
        created_at: parse_datetime(&created_at, 10)?,
    })
}

fn row_to_expression(row: &Row<'_>) -> std::result::Result<Expression, rusqlite::Error> {
    let last_practiced: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;
    Ok(Expression {
        id: row.get(0)?,
        user_id: row.get(1)?,
        conversation_id: row.get(2)?,
        thought: row.get(3)?,
        expression: row.get(4)?,
        mastery_level: row.get(5)?,
        practice_count: row.get(6)?,
        last_practiced: last_practiced.map(|s| parse_datetime(&s, 7)).transpose()?,
        created_at: parse_datetime(&created_at, 8)?,
    })
}

fn row_to_progress(row: &Row<'_>) -> std::result::Result<UserProgress, rusqlite::Error> {
    let last_practice: Option<String> = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(UserProgress {
        user_id: row.get(0)?,
        total_conversations: row.get(1)?,
        total_minutes: row.get(2)?,
        expressions_saved: row.get(3)?,
        expressions_mastered: row.get(4)?,
        current_streak: row.get(5)?,
        longest_streak: row.get(6)?,
        last_practice_date: last_practice.map(|s| parse_date(&s, 7)).transpose()?,
        updated_at: parse_datetime(&updated_at, 8)?,
    })
}

fn row_to_journal(row: &Row<'_>) -> std::result::Result<JournalEntry, rusqlite::Error> {
    let created_at: String = row.get(7)?;
    Ok(JournalEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        conversation_id: row.get(2)?,
        day_number: row.get(3)?,
        emotional_state: row.get(4)?,
        confidence_level: row.get(5)?,
        notes: row.get(6)?,
        created_at: parse_datetime(&created_at, 7)?,
    })
}

fn row_to_pool_conversation(
    row: &Row<'_>,
) -> std::result::Result<PoolConversation, rusqlite::Error> {
    let dialogue: String = row.get(6)?;
    Ok(PoolConversation {
        id: row.get(0)?,
        scenario: row.get(1)?,
        tier: row.get(2)?,
        target_location: row.get(3)?,
        target_age_group: row.get(4)?,
        target_gender: row.get(5)?,
        dialogue: parse_dialogue(&dialogue, 6)?,
    })
}

fn query_latest_incomplete(
    conn: &Connection,
    user_id: &str,
) -> Result<Option<Conversation>> {
    let conversation = conn
        .query_row(
            "SELECT id, user_id, scenario, tier, target_location, target_age_group,
                    target_gender, dialogue, completed, success_rate, created_at
             FROM conversations
             WHERE user_id = ?1 AND completed = 0
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            params![user_id],
            row_to_conversation,
        )
        .optional()?;
    Ok(conversation)
}
