use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::GenerationConfig;
use crate::error::{EngineError, Result};
use crate::model::{validate_dialogue, ContentFilter, DialogueTurn};
use crate::score::tier_label;

/// A freshly generated conversation, not yet bound to a user.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedConversation {
    pub scenario: String,
    pub dialogue: Vec<DialogueTurn>,
}

/// External content-generation collaborator. The selector calls this when the
/// local pool has no acceptable candidate; any error here is survivable.
#[async_trait]
pub trait ConversationGenerator: Send + Sync {
    async fn generate(&self, filter: &ContentFilter) -> Result<GeneratedConversation>;
}

/// Generator that always fails, for deployments with no API key configured.
/// The selector treats it like an unavailable collaborator and degrades.
pub struct NullGenerator;

#[async_trait]
impl ConversationGenerator for NullGenerator {
    async fn generate(&self, _filter: &ContentFilter) -> Result<GeneratedConversation> {
        Err(EngineError::Generation(
            "no generation collaborator configured".to_string(),
        ))
    }
}

/// OpenAI-compatible chat-completions generator.
pub struct HttpGenerator {
    client: reqwest::Client,
    config: GenerationConfig,
}

impl HttpGenerator {
    pub fn new(config: GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EngineError::Generation(e.to_string()))?;
        Ok(HttpGenerator { client, config })
    }

    fn prompt(filter: &ContentFilter) -> String {
        let any = "any".to_string();
        format!(
            "Write a short everyday English conversation for a language learner \
             living abroad. Difficulty: {} (tier {} of 4). Learner location: {}. Age group: {}. \
             Gender: {}. Return ONLY a JSON object with keys \"scenario\" (string) and \
             \"dialogue\" (array). Each dialogue element is either \
             {{\"speaker\", \"text\"}} for a line the other person says, or \
             {{\"speaker\": \"user\", \"thought\", \"expected_expression\"}} for a moment \
             where the learner must put a thought into English. Include at least two \
             thought prompts.",
            tier_label(filter.tier),
            filter.tier,
            filter.location.clone().unwrap_or_else(|| any.clone()),
            filter.age_group.clone().unwrap_or_else(|| any.clone()),
            filter.gender.clone().unwrap_or(any),
        )
    }
}

#[async_trait]
impl ConversationGenerator for HttpGenerator {
    async fn generate(&self, filter: &ContentFilter) -> Result<GeneratedConversation> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| EngineError::Generation("generation API key not set".to_string()))?;

        let body = json!({
            "model": self.config.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You produce practice conversations as strict JSON. No prose, no markdown."
                },
                {
                    "role": "user",
                    "content": Self::prompt(filter)
                }
            ],
            "temperature": 0.8,
        });

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Generation(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(EngineError::Generation(format!(
                "collaborator returned {}",
                response.status()
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Generation(format!("bad response body: {}", e)))?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| EngineError::Generation("response missing content".to_string()))?;

        let generated: GeneratedConversation = serde_json::from_str(strip_fences(content))
            .map_err(|e| EngineError::Generation(format!("malformed conversation: {}", e)))?;
        validate_dialogue(&generated.dialogue)?;
        Ok(generated)
    }
}

/// Models often wrap JSON in a markdown code fence despite instructions.
fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    inner.trim()
}
