use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Difficulty tier, 1 (first week) through 4 (two months in).
pub type Tier = u8;

pub const MIN_TIER: Tier = 1;
pub const MAX_TIER: Tier = 4;

/// A user's character profile. `start_date` is set once when practice begins
/// and never changes afterwards; the store enforces that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterProfile {
    pub user_id: String,
    pub location: String,
    pub age_group: String,
    pub gender: String,
    pub start_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl CharacterProfile {
    pub fn new(user_id: &str, location: &str, age_group: &str, gender: &str) -> Self {
        CharacterProfile {
            user_id: user_id.to_string(),
            location: location.to_string(),
            age_group: age_group.to_string(),
            gender: gender.to_string(),
            start_date: None,
            created_at: Utc::now(),
        }
    }
}

/// The targeting contract produced by the calibrator and consumed by the
/// selector. `None` on a content field means "any".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFilter {
    pub tier: Tier,
    pub location: Option<String>,
    pub age_group: Option<String>,
    pub gender: Option<String>,
}

impl ContentFilter {
    pub fn from_profile(tier: Tier, profile: &CharacterProfile) -> Self {
        let field = |s: &str| {
            if s.is_empty() {
                None
            } else {
                Some(s.to_string())
            }
        };
        ContentFilter {
            tier,
            location: field(&profile.location),
            age_group: field(&profile.age_group),
            gender: field(&profile.gender),
        }
    }

    /// Whether content with the given target fields satisfies this filter. A
    /// `None` target on the content side means the content suits anyone; a
    /// `None` on the filter side means the caller relaxed the field.
    pub fn matches(
        &self,
        tier: Tier,
        location: Option<&str>,
        age_group: Option<&str>,
        gender: Option<&str>,
    ) -> bool {
        fn field_ok(want: &Option<String>, have: Option<&str>) -> bool {
            match (want, have) {
                (None, _) | (_, None) => true,
                (Some(w), Some(h)) => w == h,
            }
        }
        tier == self.tier
            && field_ok(&self.location, location)
            && field_ok(&self.age_group, age_group)
            && field_ok(&self.gender, gender)
    }
}

/// One turn of a conversation: either a plain line from the interlocutor, or
/// a thought prompt the learner must express out loud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DialogueTurn {
    Prompt {
        speaker: String,
        thought: String,
        expected_expression: String,
    },
    Line {
        speaker: String,
        text: String,
    },
}

impl DialogueTurn {
    pub fn is_prompt(&self) -> bool {
        matches!(self, DialogueTurn::Prompt { .. })
    }
}

/// A well-formed dialogue is non-empty and contains at least one thought
/// prompt; a generation collaborator returning anything else signals failure.
pub fn validate_dialogue(dialogue: &[DialogueTurn]) -> Result<()> {
    if dialogue.is_empty() {
        return Err(EngineError::Generation("empty dialogue".to_string()));
    }
    if !dialogue.iter().any(|t| t.is_prompt()) {
        return Err(EngineError::Generation(
            "dialogue has no thought prompt".to_string(),
        ));
    }
    Ok(())
}

/// A conversation bound to a user. Target fields are stored denormalized so
/// the serving decision stays auditable even if calibration policy changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub scenario: String,
    pub tier: Tier,
    pub target_location: Option<String>,
    pub target_age_group: Option<String>,
    pub target_gender: Option<String>,
    pub dialogue: Vec<DialogueTurn>,
    pub completed: bool,
    pub success_rate: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(
        user_id: &str,
        scenario: &str,
        filter: &ContentFilter,
        dialogue: Vec<DialogueTurn>,
    ) -> Self {
        Conversation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            scenario: scenario.to_string(),
            tier: filter.tier,
            target_location: filter.location.clone(),
            target_age_group: filter.age_group.clone(),
            target_gender: filter.gender.clone(),
            dialogue,
            completed: false,
            success_rate: None,
            created_at: Utc::now(),
        }
    }

    /// The thought prompt at `turn_index`, or `UnknownTurn`.
    pub fn prompt_at(&self, turn_index: usize) -> Result<(&str, &str)> {
        match self.dialogue.get(turn_index) {
            Some(DialogueTurn::Prompt {
                thought,
                expected_expression,
                ..
            }) => Ok((thought.as_str(), expected_expression.as_str())),
            _ => Err(EngineError::UnknownTurn {
                conversation: self.id.clone(),
                turn: turn_index,
            }),
        }
    }
}

/// A conversation in the shared content pool, not yet bound to any user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConversation {
    pub id: String,
    pub scenario: String,
    pub tier: Tier,
    pub target_location: Option<String>,
    pub target_age_group: Option<String>,
    pub target_gender: Option<String>,
    pub dialogue: Vec<DialogueTurn>,
}

/// One scored attempt at expressing a thought prompt. Write-once; a retry is
/// a new record with the next attempt number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThoughtAttempt {
    pub id: String,
    pub conversation_id: String,
    pub turn_index: usize,
    pub transcription: String,
    pub success_score: f64,
    pub attempt_number: u32,
    pub created_at: DateTime<Utc>,
}

/// A saved target phrase with its mastery state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expression {
    pub id: String,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub thought: String,
    pub expression: String,
    pub mastery_level: u8,
    pub practice_count: u32,
    pub last_practiced: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Expression {
    pub fn new(
        user_id: &str,
        conversation_id: Option<&str>,
        thought: &str,
        expression: &str,
    ) -> Self {
        Expression {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            conversation_id: conversation_id.map(|s| s.to_string()),
            thought: thought.to_string(),
            expression: expression.to_string(),
            mastery_level: 0,
            practice_count: 0,
            last_practiced: None,
            created_at: Utc::now(),
        }
    }
}

/// Cumulative per-user counters. Updated transactionally by the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProgress {
    pub user_id: String,
    pub total_conversations: u32,
    pub total_minutes: u32,
    pub expressions_saved: u32,
    pub expressions_mastered: u32,
    pub current_streak: u32,
    pub longest_streak: u32,
    pub last_practice_date: Option<NaiveDate>,
    pub updated_at: DateTime<Utc>,
}

impl UserProgress {
    pub fn empty(user_id: &str) -> Self {
        UserProgress {
            user_id: user_id.to_string(),
            total_conversations: 0,
            total_minutes: 0,
            expressions_saved: 0,
            expressions_mastered: 0,
            current_streak: 0,
            longest_streak: 0,
            last_practice_date: None,
            updated_at: Utc::now(),
        }
    }
}

/// Append-only journal row written when a conversation completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub day_number: i64,
    pub emotional_state: Option<String>,
    pub confidence_level: Option<u8>,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

/// Per-day practice activity, one row per user per calendar day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PracticeLogEntry {
    pub user_id: String,
    pub practice_date: NaiveDate,
    pub attempts: u32,
    pub minutes: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(speaker: &str, thought: &str, expr: &str) -> DialogueTurn {
        DialogueTurn::Prompt {
            speaker: speaker.to_string(),
            thought: thought.to_string(),
            expected_expression: expr.to_string(),
        }
    }

    fn line(speaker: &str, text: &str) -> DialogueTurn {
        DialogueTurn::Line {
            speaker: speaker.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_dialogue_turn_json_shape() {
        let turns = vec![
            line("neighbor", "Hey! How's your day going?"),
            prompt("user", "busy but coping", "It's been hectic, but I'm managing"),
        ];
        let json = serde_json::to_string(&turns).unwrap();
        let back: Vec<DialogueTurn> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, turns);
        assert!(!back[0].is_prompt());
        assert!(back[1].is_prompt());
    }

    #[test]
    fn test_validate_dialogue_rejects_empty() {
        assert!(validate_dialogue(&[]).is_err());
    }

    #[test]
    fn test_validate_dialogue_requires_prompt() {
        let only_lines = vec![line("neighbor", "hello"), line("neighbor", "bye")];
        assert!(validate_dialogue(&only_lines).is_err());

        let with_prompt = vec![line("neighbor", "hello"), prompt("user", "t", "e")];
        assert!(validate_dialogue(&with_prompt).is_ok());
    }

    #[test]
    fn test_filter_matches_wildcards() {
        let filter = ContentFilter {
            tier: 2,
            location: Some("new-york".to_string()),
            age_group: Some("25-34".to_string()),
            gender: Some("female".to_string()),
        };

        // Content target None means "suits anyone".
        assert!(filter.matches(2, None, None, None));
        assert!(filter.matches(2, Some("new-york"), Some("25-34"), Some("female")));
        assert!(!filter.matches(2, Some("la"), None, None));
        assert!(!filter.matches(3, None, None, None));
    }

    #[test]
    fn test_filter_relaxed_field_matches_anything() {
        let filter = ContentFilter {
            tier: 1,
            location: None,
            age_group: None,
            gender: None,
        };
        assert!(filter.matches(1, Some("la"), Some("18-24"), Some("male")));
    }

    #[test]
    fn test_prompt_at() {
        let conv = Conversation::new(
            "u1",
            "coffee line",
            &ContentFilter {
                tier: 1,
                location: None,
                age_group: None,
                gender: None,
            },
            vec![line("barista", "What can I get you?"), prompt("user", "t", "e")],
        );
        assert!(conv.prompt_at(0).is_err());
        assert_eq!(conv.prompt_at(1).unwrap(), ("t", "e"));
        assert!(conv.prompt_at(9).is_err());
    }
}
