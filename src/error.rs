use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The user has no character profile yet; the caller must initialize it
    /// before asking for tier-dependent behavior.
    #[error("profile not initialized for user {0}")]
    InvalidProfileState(String),

    #[error("turn {turn} in conversation {conversation} is not a thought prompt")]
    UnknownTurn { conversation: String, turn: usize },

    #[error("conversation {0} is already completed")]
    ConversationSealed(String),

    /// A concurrent writer won the race on a versioned row. Retried internally
    /// with bounded backoff before it ever reaches a caller.
    #[error("concurrent update conflict on {0}")]
    TransientStoreConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("content pool has no candidates for tier {0}")]
    EmptyPool(u8),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
