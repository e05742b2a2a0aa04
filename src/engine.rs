use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, Timelike, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};
use uuid::Uuid;

use crate::calibrate::calibrate;
use crate::clock::day_number;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::generate::ConversationGenerator;
use crate::journal::{entry_text, TimeOfDay};
use crate::model::{
    CharacterProfile, Conversation, Expression, JournalEntry, PoolConversation, PracticeLogEntry,
    ThoughtAttempt, Tier, UserProgress,
};
use crate::progress::{clamp_minutes, streak_status, StreakStatus};
use crate::score::{MasteryUpdate, SimilarityScorer};
use crate::select::{ConversationPool, Selector};
use crate::store::Store;

/// A conversation handed to the user, with the serving context the caller
/// usually wants alongside it.
#[derive(Debug)]
pub struct StartedSession {
    pub conversation: Conversation,
    pub day_number: i64,
    pub tier: Tier,
    pub degraded: bool,
}

/// Result of scoring one transcription against its thought prompt.
#[derive(Debug)]
pub struct AttemptOutcome {
    pub attempt: ThoughtAttempt,
    pub expected_expression: String,
    /// Present when the expected phrase is a saved expression of this user.
    pub mastery: Option<MasteryUpdate>,
}

#[derive(Debug)]
pub struct CompletedSession {
    pub conversation_id: String,
    pub success_rate: f64,
    pub day_number: i64,
    pub journal: JournalEntry,
    pub progress: UserProgress,
}

/// The targeting, selection and progression engine. One instance per process;
/// safe to share across threads. Collaborators are injected so tests can pin
/// the pool, the generator, the scorer and the random source.
pub struct Engine {
    store: Arc<Store>,
    pool: Arc<dyn ConversationPool>,
    generator: Arc<dyn ConversationGenerator>,
    scorer: Arc<dyn SimilarityScorer>,
    config: EngineConfig,
    rng: Mutex<StdRng>,
}

impl Engine {
    pub fn new(
        store: Arc<Store>,
        pool: Arc<dyn ConversationPool>,
        generator: Arc<dyn ConversationGenerator>,
        scorer: Arc<dyn SimilarityScorer>,
        config: EngineConfig,
    ) -> Self {
        Self::with_rng(store, pool, generator, scorer, config, StdRng::from_entropy())
    }

    /// Like `new` but with a caller-supplied random source, so the
    /// probabilistic stretch-tier rule is pinnable in tests.
    pub fn with_rng(
        store: Arc<Store>,
        pool: Arc<dyn ConversationPool>,
        generator: Arc<dyn ConversationGenerator>,
        scorer: Arc<dyn SimilarityScorer>,
        config: EngineConfig,
        rng: StdRng,
    ) -> Self {
        Engine {
            store,
            pool,
            generator,
            scorer,
            config,
            rng: Mutex::new(rng),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ---- profile -------------------------------------------------------

    pub fn set_profile(
        &self,
        user_id: &str,
        location: &str,
        age_group: &str,
        gender: &str,
    ) -> Result<CharacterProfile> {
        let profile = CharacterProfile::new(user_id, location, age_group, gender);
        self.store.put_profile(&profile)?;
        self.require_profile(user_id)
    }

    pub fn profile(&self, user_id: &str) -> Result<CharacterProfile> {
        self.require_profile(user_id)
    }

    fn require_profile(&self, user_id: &str) -> Result<CharacterProfile> {
        self.store
            .get_profile(user_id)?
            .ok_or_else(|| EngineError::InvalidProfileState(user_id.to_string()))
    }

    // ---- sessions ------------------------------------------------------

    /// Serve the user's next conversation. Calling again before completing
    /// the previous one returns that same conversation.
    pub async fn start_session(&self, user_id: &str, today: NaiveDate) -> Result<StartedSession> {
        let mut profile = self.require_profile(user_id)?;

        if let Some(existing) = self.store.latest_incomplete(user_id)? {
            debug!(user = user_id, conversation = %existing.id, "resuming incomplete conversation");
            let tier = existing.tier;
            return Ok(StartedSession {
                conversation: existing,
                day_number: day_number(profile.start_date, today),
                tier,
                degraded: false,
            });
        }

        // First session ever starts the profile clock.
        self.store.begin_practice(user_id, today)?;
        if profile.start_date.is_none() {
            profile.start_date = Some(today);
        }

        let elapsed = crate::clock::elapsed_days(profile.start_date, today);
        let recent_scores = self.store.recent_scores(user_id, self.config.rolling_window)?;
        let filter = {
            let mut rng = self.rng.lock().expect("rng mutex poisoned");
            calibrate(elapsed, &profile, &recent_scores, &self.config, &mut *rng)
        };

        let recent_served = self
            .store
            .recent_served(user_id, self.config.history_window)?;
        let last_served = self.store.last_served_map(user_id)?;
        let selector = Selector::new(
            self.pool.as_ref(),
            self.generator.as_ref(),
            self.config.history_window,
        );
        let selection = selector.select(&filter, &recent_served, &last_served).await?;

        let conversation = Conversation::new(user_id, &selection.scenario, &filter, selection.dialogue);
        let bound = self
            .store
            .bind_conversation(conversation, selection.pool_id.as_deref())?;

        info!(
            user = user_id,
            conversation = %bound.id,
            tier = filter.tier,
            degraded = selection.degraded,
            "session started"
        );
        Ok(StartedSession {
            conversation: bound,
            day_number: day_number(profile.start_date, today),
            tier: filter.tier,
            degraded: selection.degraded,
        })
    }

    /// Score a transcription against the thought prompt at `turn_index`,
    /// record the attempt, advance mastery of the matching saved expression
    /// if any, and count the activity toward today's streak. Everything past
    /// scoring is one store transaction, so a failed submission leaves no
    /// score behind without its mastery and streak effects.
    pub fn submit_attempt(
        &self,
        conversation_id: &str,
        turn_index: usize,
        transcription: &str,
        today: NaiveDate,
    ) -> Result<AttemptOutcome> {
        if transcription.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "transcription must not be empty".to_string(),
            ));
        }

        let conversation = self.store.get_conversation(conversation_id)?;
        if conversation.completed && !self.config.allow_post_completion_attempts {
            return Err(EngineError::ConversationSealed(conversation_id.to_string()));
        }
        let (_, expected) = conversation.prompt_at(turn_index)?;
        let expected = expected.to_string();

        let score = self.scorer.score(&expected, transcription);
        let (attempt, mastery) = self.with_conflict_retry(|| {
            self.store.apply_attempt(
                conversation_id,
                &conversation.user_id,
                turn_index,
                transcription,
                score,
                &expected,
                today,
            )
        })?;

        debug!(
            conversation = conversation_id,
            turn = turn_index,
            score,
            "attempt recorded"
        );
        Ok(AttemptOutcome {
            attempt,
            expected_expression: expected,
            mastery,
        })
    }

    /// Seal the conversation, freeze its success rate, roll the aggregates,
    /// and write the character's journal entry for the day.
    pub fn complete_session(
        &self,
        conversation_id: &str,
        duration_minutes: u32,
        today: NaiveDate,
        emotional_state: Option<String>,
        confidence_level: Option<u8>,
    ) -> Result<CompletedSession> {
        let conversation = self.store.get_conversation(conversation_id)?;
        let profile = self.require_profile(&conversation.user_id)?;

        let day = day_number(profile.start_date, today);
        let minutes = clamp_minutes(duration_minutes, self.config.max_session_minutes);

        let journal = JournalEntry {
            id: Uuid::new_v4().to_string(),
            user_id: conversation.user_id.clone(),
            conversation_id: conversation_id.to_string(),
            day_number: day,
            emotional_state,
            confidence_level,
            notes: entry_text(day, &profile, TimeOfDay::from_hour(Utc::now().hour())),
            created_at: Utc::now(),
        };
        // Zero attempts means an abandoned session; rate 0, not an error.
        // Sealing, journal and aggregates commit as one store transaction.
        let (rate, progress) = self.with_conflict_retry(|| {
            self.store.complete_conversation(
                conversation_id,
                &conversation.user_id,
                minutes,
                &journal,
                today,
            )
        })?;

        info!(
            conversation = conversation_id,
            success_rate = rate,
            day,
            "session completed"
        );
        Ok(CompletedSession {
            conversation_id: conversation_id.to_string(),
            success_rate: rate,
            day_number: day,
            journal,
            progress,
        })
    }

    // ---- expressions ---------------------------------------------------

    /// Save a target phrase for later practice. Saving the same phrase twice
    /// returns the existing record untouched.
    pub fn save_expression(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        thought: &str,
        expression: &str,
    ) -> Result<Expression> {
        if thought.trim().is_empty() || expression.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "thought and expression must not be empty".to_string(),
            ));
        }
        if let Some((existing, _)) = self.store.find_expression(user_id, expression)? {
            return Ok(existing);
        }

        let saved = Expression::new(user_id, conversation_id, thought, expression);
        self.with_conflict_retry(|| self.store.save_expression_counted(&saved))?;
        Ok(saved)
    }

    /// Save the expression taught by a conversation's thought-prompt turn.
    /// Thought and target phrase come from the turn itself, so what lands in
    /// the expression list is exactly what `submit_attempt` scores against.
    pub fn save_expression_from_turn(
        &self,
        conversation_id: &str,
        turn_index: usize,
    ) -> Result<Expression> {
        let conversation = self.store.get_conversation(conversation_id)?;
        let (thought, expected) = conversation.prompt_at(turn_index)?;
        let (thought, expected) = (thought.to_string(), expected.to_string());
        self.save_expression(
            &conversation.user_id,
            Some(conversation_id),
            &thought,
            &expected,
        )
    }

    pub fn list_expressions(&self, user_id: &str, limit: usize) -> Result<Vec<Expression>> {
        self.store.list_expressions(user_id, limit)
    }

    pub fn search_expressions(&self, user_id: &str, query: &str) -> Result<Vec<Expression>> {
        self.store.search_expressions(user_id, query)
    }

    pub fn delete_expression(&self, user_id: &str, expression_id: &str) -> Result<()> {
        self.store.delete_expression(user_id, expression_id)
    }

    /// Drop an expression back to level 0 at the user's request. Practice
    /// history and counters are untouched.
    pub fn reset_mastery(&self, user_id: &str, expression_id: &str) -> Result<Expression> {
        self.store.reset_mastery(user_id, expression_id)?;
        self.store.get_expression(user_id, expression_id)
    }

    // ---- read models ---------------------------------------------------

    pub fn progress(&self, user_id: &str) -> Result<UserProgress> {
        self.store.get_progress(user_id)
    }

    pub fn streak_status(&self, user_id: &str, today: NaiveDate) -> Result<StreakStatus> {
        Ok(streak_status(&self.store.get_progress(user_id)?, today))
    }

    pub fn practice_history(
        &self,
        user_id: &str,
        days: i64,
        today: NaiveDate,
    ) -> Result<Vec<PracticeLogEntry>> {
        self.store.practice_history(user_id, days, today)
    }

    pub fn journal_entries(&self, user_id: &str, limit: usize) -> Result<Vec<JournalEntry>> {
        self.store.journal_entries(user_id, limit)
    }

    // ---- content library -----------------------------------------------

    pub fn import_library(&self, conversations: &[PoolConversation]) -> Result<usize> {
        for conversation in conversations {
            crate::model::validate_dialogue(&conversation.dialogue)?;
            self.store.insert_library(conversation)?;
        }
        Ok(conversations.len())
    }

    // ---- internals -----------------------------------------------------

    /// Retry a versioned-row write a bounded number of times before giving
    /// up. Conflicts are expected under concurrent submissions; losing one
    /// must never lose the update.
    fn with_conflict_retry<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut tries = 0;
        loop {
            match op() {
                Err(EngineError::TransientStoreConflict(_))
                    if tries < self.config.conflict_retries =>
                {
                    tries += 1;
                    std::thread::sleep(Duration::from_millis(self.config.conflict_backoff_ms));
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::NullGenerator;
    use crate::model::DialogueTurn;
    use crate::score::LexicalScorer;
    use crate::select::StaticPool;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn dialogue() -> Vec<DialogueTurn> {
        vec![
            DialogueTurn::Line {
                speaker: "barista".to_string(),
                text: "What can I get you?".to_string(),
            },
            DialogueTurn::Prompt {
                speaker: "user".to_string(),
                thought: "want an iced latte".to_string(),
                expected_expression: "could I get an iced latte".to_string(),
            },
        ]
    }

    fn pool_entries(n: usize, tier: Tier) -> Vec<PoolConversation> {
        (0..n)
            .map(|i| PoolConversation {
                id: format!("lib-{:02}", i),
                scenario: format!("scenario {}", i),
                tier,
                target_location: None,
                target_age_group: None,
                target_gender: None,
                dialogue: dialogue(),
            })
            .collect()
    }

    fn engine_with_pool(pool: Vec<PoolConversation>) -> Engine {
        let mut config = EngineConfig::default();
        config.conflict_retries = 8;
        Engine::with_rng(
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(StaticPool::new(pool)),
            Arc::new(NullGenerator),
            Arc::new(LexicalScorer),
            config,
            StdRng::seed_from_u64(7),
        )
    }

    fn with_profile(engine: &Engine, user: &str) {
        engine
            .set_profile(user, "new-york", "25-34", "female")
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_session_requires_profile() {
        let engine = engine_with_pool(pool_entries(3, 1));
        let result = engine.start_session("ghost", d(2025, 3, 1)).await;
        assert!(matches!(result, Err(EngineError::InvalidProfileState(_))));
    }

    #[tokio::test]
    async fn test_start_session_twice_returns_same_conversation() {
        let engine = engine_with_pool(pool_entries(3, 1));
        with_profile(&engine, "u1");

        let first = engine.start_session("u1", d(2025, 3, 1)).await.unwrap();
        let second = engine.start_session("u1", d(2025, 3, 1)).await.unwrap();
        assert_eq!(first.conversation.id, second.conversation.id);
        assert_eq!(first.day_number, 1);
        assert_eq!(first.tier, 1);
    }

    #[tokio::test]
    async fn test_start_date_pins_the_clock() {
        let engine = engine_with_pool(pool_entries(20, 1).into_iter()
            .chain(pool_entries(20, 2).into_iter().map(|mut c| {
                c.id = format!("t2-{}", c.id);
                c
            }))
            .collect());
        with_profile(&engine, "u1");

        let started = engine.start_session("u1", d(2025, 3, 1)).await.unwrap();
        engine
            .complete_session(&started.conversation.id, 10, d(2025, 3, 1), None, None)
            .unwrap();

        // Ten days in, the band has moved to tier 2.
        let later = engine.start_session("u1", d(2025, 3, 11)).await.unwrap();
        assert_eq!(later.tier, 2);
        assert_eq!(later.day_number, 11);
    }

    #[tokio::test]
    async fn test_degraded_start_when_generator_down_and_pool_repeats() {
        let engine = engine_with_pool(pool_entries(1, 1));
        with_profile(&engine, "u1");

        let first = engine.start_session("u1", d(2025, 3, 1)).await.unwrap();
        assert!(!first.degraded);
        engine
            .complete_session(&first.conversation.id, 5, d(2025, 3, 1), None, None)
            .unwrap();

        let second = engine.start_session("u1", d(2025, 3, 2)).await.unwrap();
        assert!(second.degraded, "only pool entry was just served");
    }

    #[tokio::test]
    async fn test_attempt_scores_and_seals() {
        let engine = engine_with_pool(pool_entries(3, 1));
        with_profile(&engine, "u1");
        let today = d(2025, 3, 1);
        let started = engine.start_session("u1", today).await.unwrap();
        let id = started.conversation.id.clone();

        let outcome = engine
            .submit_attempt(&id, 1, "could I get an iced latte", today)
            .unwrap();
        assert!(outcome.attempt.success_score > 0.9);
        assert_eq!(outcome.attempt.attempt_number, 1);
        assert!(outcome.mastery.is_none(), "phrase was never saved");

        let completed = engine.complete_session(&id, 12, today, None, None).unwrap();
        assert!(completed.success_rate > 0.9);
        assert_eq!(completed.progress.total_conversations, 1);
        assert_eq!(completed.progress.total_minutes, 12);

        assert!(matches!(
            engine.submit_attempt(&id, 1, "anything", today),
            Err(EngineError::ConversationSealed(_))
        ));
    }

    #[tokio::test]
    async fn test_attempt_rejects_non_prompt_turn_and_empty_text() {
        let engine = engine_with_pool(pool_entries(3, 1));
        with_profile(&engine, "u1");
        let today = d(2025, 3, 1);
        let started = engine.start_session("u1", today).await.unwrap();
        let id = started.conversation.id.clone();

        assert!(matches!(
            engine.submit_attempt(&id, 0, "hello", today),
            Err(EngineError::UnknownTurn { turn: 0, .. })
        ));
        assert!(matches!(
            engine.submit_attempt(&id, 1, "   ", today),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_attempt_completion_is_abandoned_not_error() {
        let engine = engine_with_pool(pool_entries(3, 1));
        with_profile(&engine, "u1");
        let today = d(2025, 3, 1);
        let started = engine.start_session("u1", today).await.unwrap();

        let completed = engine
            .complete_session(&started.conversation.id, 0, today, None, None)
            .unwrap();
        assert_eq!(completed.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_duration_clamped_against_corrupt_timers() {
        let engine = engine_with_pool(pool_entries(3, 1));
        with_profile(&engine, "u1");
        let today = d(2025, 3, 1);
        let started = engine.start_session("u1", today).await.unwrap();

        let completed = engine
            .complete_session(&started.conversation.id, 9999, today, None, None)
            .unwrap();
        assert_eq!(completed.progress.total_minutes, 180);
    }

    #[tokio::test]
    async fn test_mastery_advances_on_good_attempt() {
        let engine = engine_with_pool(pool_entries(3, 1));
        with_profile(&engine, "u1");
        let today = d(2025, 3, 1);
        let started = engine.start_session("u1", today).await.unwrap();
        let id = started.conversation.id.clone();

        engine
            .save_expression("u1", Some(&id), "want an iced latte", "could I get an iced latte")
            .unwrap();

        let outcome = engine
            .submit_attempt(&id, 1, "could I get an iced latte", today)
            .unwrap();
        let mastery = outcome.mastery.unwrap();
        assert_eq!(mastery.mastery_level, 1);
        assert_eq!(mastery.practice_count, 1);
        assert!(!mastery.mastered_now);
    }

    #[tokio::test]
    async fn test_first_poor_attempt_never_demotes_below_zero() {
        let engine = engine_with_pool(pool_entries(3, 1));
        with_profile(&engine, "u1");
        let today = d(2025, 3, 1);
        let started = engine.start_session("u1", today).await.unwrap();
        let id = started.conversation.id.clone();

        engine
            .save_expression("u1", Some(&id), "want an iced latte", "could I get an iced latte")
            .unwrap();

        let outcome = engine.submit_attempt(&id, 1, "zzz", today).unwrap();
        assert!(outcome.attempt.success_score < 0.3);
        let mastery = outcome.mastery.unwrap();
        assert_eq!(mastery.mastery_level, 0);
        assert_eq!(mastery.practice_count, 1);
    }

    #[tokio::test]
    async fn test_mastered_now_fires_once_and_bumps_counter() {
        let engine = engine_with_pool(pool_entries(3, 1));
        with_profile(&engine, "u1");
        let today = d(2025, 3, 1);
        let started = engine.start_session("u1", today).await.unwrap();
        let id = started.conversation.id.clone();

        engine
            .save_expression("u1", Some(&id), "want an iced latte", "could I get an iced latte")
            .unwrap();

        let mut fired = 0;
        for _ in 0..6 {
            let outcome = engine
                .submit_attempt(&id, 1, "could I get an iced latte", today)
                .unwrap();
            if outcome.mastery.unwrap().mastered_now {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        assert_eq!(engine.progress("u1").unwrap().expressions_mastered, 1);
    }

    #[tokio::test]
    async fn test_streak_extends_and_resets() {
        let engine = engine_with_pool(pool_entries(3, 1));
        with_profile(&engine, "u1");

        let s1 = engine.start_session("u1", d(2025, 3, 1)).await.unwrap();
        engine
            .submit_attempt(&s1.conversation.id, 1, "could I get an iced latte", d(2025, 3, 1))
            .unwrap();
        assert_eq!(engine.progress("u1").unwrap().current_streak, 1);

        // Next day extends; more activity same day does not double-count.
        engine
            .submit_attempt(&s1.conversation.id, 1, "iced latte please", d(2025, 3, 2))
            .unwrap();
        engine
            .submit_attempt(&s1.conversation.id, 1, "iced latte please", d(2025, 3, 2))
            .unwrap();
        assert_eq!(engine.progress("u1").unwrap().current_streak, 2);

        // A three-day gap resets to 1, longest survives.
        engine
            .submit_attempt(&s1.conversation.id, 1, "iced latte please", d(2025, 3, 5))
            .unwrap();
        let progress = engine.progress("u1").unwrap();
        assert_eq!(progress.current_streak, 1);
        assert_eq!(progress.longest_streak, 2);
    }

    #[tokio::test]
    async fn test_streak_status_read_model() {
        let engine = engine_with_pool(pool_entries(3, 1));
        with_profile(&engine, "u1");
        let s1 = engine.start_session("u1", d(2025, 3, 1)).await.unwrap();
        engine
            .submit_attempt(&s1.conversation.id, 1, "could I get an iced latte", d(2025, 3, 1))
            .unwrap();

        let status = engine.streak_status("u1", d(2025, 3, 2)).unwrap();
        assert!(!status.practiced_today);
        assert!(status.streak_at_risk);
        assert_eq!(status.current_streak, 1);
    }

    #[tokio::test]
    async fn test_save_expression_idempotent_and_counted() {
        let engine = engine_with_pool(pool_entries(3, 1));
        with_profile(&engine, "u1");

        let first = engine
            .save_expression("u1", None, "busy", "I'm swamped")
            .unwrap();
        let second = engine
            .save_expression("u1", None, "busy again", "I'm swamped")
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(engine.progress("u1").unwrap().expressions_saved, 1);

        assert!(matches!(
            engine.save_expression("u1", None, "", "x"),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_mastery() {
        let engine = engine_with_pool(pool_entries(3, 1));
        with_profile(&engine, "u1");
        let today = d(2025, 3, 1);
        let started = engine.start_session("u1", today).await.unwrap();
        let id = started.conversation.id.clone();
        let saved = engine
            .save_expression("u1", Some(&id), "want an iced latte", "could I get an iced latte")
            .unwrap();
        engine
            .submit_attempt(&id, 1, "could I get an iced latte", today)
            .unwrap();

        let reset = engine.reset_mastery("u1", &saved.id).unwrap();
        assert_eq!(reset.mastery_level, 0);
        assert_eq!(reset.practice_count, 1, "history survives a reset");
    }

    #[tokio::test]
    async fn test_completion_writes_journal_and_history() {
        let engine = engine_with_pool(pool_entries(3, 1));
        with_profile(&engine, "u1");
        let today = d(2025, 3, 1);
        let started = engine.start_session("u1", today).await.unwrap();
        let id = started.conversation.id.clone();
        engine
            .submit_attempt(&id, 1, "could I get an iced latte", today)
            .unwrap();
        let completed = engine
            .complete_session(&id, 15, today, Some("nervous".to_string()), Some(3))
            .unwrap();
        assert_eq!(completed.journal.day_number, 1);
        assert_eq!(completed.journal.emotional_state.as_deref(), Some("nervous"));

        let entries = engine.journal_entries("u1", 10).unwrap();
        assert_eq!(entries.len(), 1);

        let history = engine.practice_history("u1", 7, today).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].attempts, 1);
        assert_eq!(history[0].minutes, 15);
    }

    #[test]
    fn test_concurrent_attempts_lose_no_updates() {
        let engine = Arc::new(engine_with_pool(pool_entries(3, 1)));
        with_profile(&engine, "u1");
        let today = d(2025, 3, 1);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let started = runtime.block_on(engine.start_session("u1", today)).unwrap();
        let id = started.conversation.id.clone();
        engine
            .save_expression("u1", Some(&id), "want an iced latte", "could I get an iced latte")
            .unwrap();

        let n = 4;
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let id = id.clone();
                std::thread::spawn(move || {
                    engine
                        .submit_attempt(&id, 1, "could I get an iced latte", today)
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let (expr, _) = engine
            .store()
            .find_expression("u1", "could I get an iced latte")
            .unwrap()
            .unwrap();
        assert_eq!(expr.practice_count, n as u32, "every attempt counted");
        let history = engine.practice_history("u1", 7, today).unwrap();
        assert_eq!(history[0].attempts, n as u32);
    }

    #[test]
    fn test_submission_commits_whole_unit_or_nothing() {
        // With retries disabled every submission must still land whole: an
        // attempt row may never become durable while its mastery or streak
        // update is lost to a race.
        let mut config = EngineConfig::default();
        config.conflict_retries = 0;
        let engine = Arc::new(Engine::with_rng(
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(StaticPool::new(pool_entries(3, 1))),
            Arc::new(NullGenerator),
            Arc::new(LexicalScorer),
            config,
            StdRng::seed_from_u64(7),
        ));
        with_profile(&engine, "u1");
        let today = d(2025, 3, 1);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let started = runtime.block_on(engine.start_session("u1", today)).unwrap();
        let id = started.conversation.id.clone();
        engine
            .save_expression("u1", Some(&id), "want an iced latte", "could I get an iced latte")
            .unwrap();

        let n = 16;
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let id = id.clone();
                std::thread::spawn(move || {
                    engine
                        .submit_attempt(&id, 1, "could I get an iced latte", today)
                        .is_ok()
                })
            })
            .collect();
        let committed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        let (expr, _) = engine
            .store()
            .find_expression("u1", "could I get an iced latte")
            .unwrap()
            .unwrap();
        let history = engine.practice_history("u1", 7, today).unwrap();
        assert_eq!(
            history[0].attempts, committed as u32,
            "every committed attempt carries its practice-log bump"
        );
        assert_eq!(
            expr.practice_count, committed as u32,
            "every committed attempt carries its mastery bump"
        );
        assert_eq!(committed, n, "serialized units never conflict");
    }

    #[tokio::test]
    async fn test_save_expression_from_turn_uses_the_prompt() {
        let engine = engine_with_pool(pool_entries(3, 1));
        with_profile(&engine, "u1");
        let today = d(2025, 3, 1);
        let started = engine.start_session("u1", today).await.unwrap();
        let id = started.conversation.id.clone();

        let saved = engine.save_expression_from_turn(&id, 1).unwrap();
        assert_eq!(saved.thought, "want an iced latte");
        assert_eq!(saved.expression, "could I get an iced latte");
        assert_eq!(saved.conversation_id.as_deref(), Some(id.as_str()));

        // Attempts against the turn now feed mastery of the saved record.
        let outcome = engine
            .submit_attempt(&id, 1, "could I get an iced latte", today)
            .unwrap();
        let mastery = outcome.mastery.unwrap();
        assert_eq!(mastery.expression_id, saved.id);
        assert_eq!(mastery.mastery_level, 1);

        // A non-prompt turn is rejected, not silently saved.
        assert!(matches!(
            engine.save_expression_from_turn(&id, 0),
            Err(EngineError::UnknownTurn { turn: 0, .. })
        ));
    }

    #[test]
    fn test_conflict_retry_is_bounded() {
        let mut config = EngineConfig::default();
        config.conflict_retries = 2;
        config.conflict_backoff_ms = 0;
        let engine = Engine::with_rng(
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(StaticPool::new(pool_entries(1, 1))),
            Arc::new(NullGenerator),
            Arc::new(LexicalScorer),
            config,
            StdRng::seed_from_u64(7),
        );

        let mut calls = 0;
        let result: Result<()> = engine.with_conflict_retry(|| {
            calls += 1;
            Err(EngineError::TransientStoreConflict("contended row".to_string()))
        });
        assert!(matches!(result, Err(EngineError::TransientStoreConflict(_))));
        assert_eq!(calls, 3, "initial try plus two retries");

        let mut calls = 0;
        let result = engine.with_conflict_retry(|| {
            calls += 1;
            if calls < 2 {
                Err(EngineError::TransientStoreConflict("contended row".to_string()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }
}
