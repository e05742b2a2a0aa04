use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::generate::ConversationGenerator;
use crate::model::{validate_dialogue, ContentFilter, DialogueTurn, PoolConversation, Tier};
use crate::store::Store;

/// Read-only view of the shared conversation pool. Injected so tests can run
/// against a fixed in-memory pool instead of the library table.
pub trait ConversationPool: Send + Sync {
    fn candidates(&self, tier: Tier) -> Result<Vec<PoolConversation>>;
}

impl ConversationPool for Store {
    fn candidates(&self, tier: Tier) -> Result<Vec<PoolConversation>> {
        self.library_by_tier(tier)
    }
}

/// Fixed pool over a vector, for tests and seed fixtures.
pub struct StaticPool {
    conversations: Vec<PoolConversation>,
}

impl StaticPool {
    pub fn new(conversations: Vec<PoolConversation>) -> Self {
        StaticPool { conversations }
    }
}

impl ConversationPool for StaticPool {
    fn candidates(&self, tier: Tier) -> Result<Vec<PoolConversation>> {
        Ok(self
            .conversations
            .iter()
            .filter(|c| c.tier == tier)
            .cloned()
            .collect())
    }
}

/// What the selector chose. `pool_id` is set for pool picks so the serving
/// history can key on the pool entry; generated content has no pool id.
#[derive(Debug)]
pub struct Selection {
    pub scenario: String,
    pub dialogue: Vec<DialogueTurn>,
    pub pool_id: Option<String>,
    pub degraded: bool,
}

pub struct Selector<'a> {
    pool: &'a dyn ConversationPool,
    generator: &'a dyn ConversationGenerator,
    history_window: usize,
}

impl<'a> Selector<'a> {
    pub fn new(
        pool: &'a dyn ConversationPool,
        generator: &'a dyn ConversationGenerator,
        history_window: usize,
    ) -> Self {
        Selector {
            pool,
            generator,
            history_window,
        }
    }

    /// Pick one conversation for the filter, avoiding anything served within
    /// the dedup window. Pool first with stepwise relaxation, then the
    /// generation collaborator, then a degraded repeat from the pool.
    pub async fn select(
        &self,
        filter: &ContentFilter,
        recent: &[String],
        last_served: &HashMap<String, DateTime<Utc>>,
    ) -> Result<Selection> {
        let candidates = self.pool.candidates(filter.tier)?;
        let recent_set: HashSet<&str> = recent
            .iter()
            .take(self.history_window)
            .map(String::as_str)
            .collect();

        for relaxed in relaxation_ladder(filter) {
            let fresh: Vec<&PoolConversation> = candidates
                .iter()
                .filter(|c| matches_filter(&relaxed, c) && !recent_set.contains(c.id.as_str()))
                .collect();
            if let Some(pick) = least_recently_served(&fresh, last_served) {
                return Ok(Selection {
                    scenario: pick.scenario.clone(),
                    dialogue: pick.dialogue.clone(),
                    pool_id: Some(pick.id.clone()),
                    degraded: false,
                });
            }
        }

        // Generation uses the original, unrelaxed filter. Malformed output
        // is treated the same as an unavailable collaborator.
        let generated = self.generator.generate(filter).await.and_then(|g| {
            validate_dialogue(&g.dialogue)?;
            Ok(g)
        });
        match generated {
            Ok(generated) => Ok(Selection {
                scenario: generated.scenario,
                dialogue: generated.dialogue,
                pool_id: None,
                degraded: false,
            }),
            Err(e) => {
                warn!(error = %e, tier = filter.tier, "generation unavailable, serving degraded pool pick");
                let all: Vec<&PoolConversation> = candidates.iter().collect();
                let pick = least_recently_served(&all, last_served)
                    .ok_or_else(|| EngineError::EmptyPool(filter.tier))?;
                Ok(Selection {
                    scenario: pick.scenario.clone(),
                    dialogue: pick.dialogue.clone(),
                    pool_id: Some(pick.id.clone()),
                    degraded: true,
                })
            }
        }
    }
}

/// The original filter followed by each relaxation step:
/// gender first, then age group, then location.
fn relaxation_ladder(filter: &ContentFilter) -> Vec<ContentFilter> {
    let mut steps = vec![filter.clone()];
    let mut step = filter.clone();
    step.gender = None;
    steps.push(step.clone());
    step.age_group = None;
    steps.push(step.clone());
    step.location = None;
    steps.push(step);
    steps
}

fn matches_filter(filter: &ContentFilter, candidate: &PoolConversation) -> bool {
    filter.matches(
        candidate.tier,
        candidate.target_location.as_deref(),
        candidate.target_age_group.as_deref(),
        candidate.target_gender.as_deref(),
    )
}

/// Never-served candidates win; among served ones the oldest serving wins.
/// Ties break on id so the choice is stable.
fn least_recently_served<'c>(
    candidates: &[&'c PoolConversation],
    last_served: &HashMap<String, DateTime<Utc>>,
) -> Option<&'c PoolConversation> {
    candidates
        .iter()
        .min_by(|a, b| {
            let ka = (last_served.get(&a.id).copied(), &a.id);
            let kb = (last_served.get(&b.id).copied(), &b.id);
            ka.cmp(&kb)
        })
        .copied()
}
