//! Targeting, selection and progression engine for spoken language practice.
//!
//! The flow: the profile clock turns a start date into elapsed days, the
//! calibrator turns elapsed days plus recent performance into a content
//! filter, the selector turns the filter into a served conversation, and
//! every scored attempt feeds mastery, streak and progress aggregates.

pub mod calibrate;
pub mod cli;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod generate;
pub mod journal;
pub mod model;
pub mod progress;
pub mod score;
pub mod select;
pub mod store;

pub use config::{Config, EngineConfig, GenerationConfig};
pub use engine::{AttemptOutcome, CompletedSession, Engine, StartedSession};
pub use error::{EngineError, Result};
pub use generate::{ConversationGenerator, GeneratedConversation, HttpGenerator, NullGenerator};
pub use model::{
    CharacterProfile, ContentFilter, Conversation, DialogueTurn, Expression, JournalEntry,
    PoolConversation, PracticeLogEntry, ThoughtAttempt, Tier, UserProgress,
};
pub use score::{LexicalScorer, MasteryUpdate, SimilarityScorer};
pub use select::{ConversationPool, Selection, Selector, StaticPool};
pub use store::Store;
