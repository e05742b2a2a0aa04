use crate::model::Tier;

/// Attempts at or above this score advance mastery.
pub const PROMOTE_THRESHOLD: f64 = 0.7;
/// Attempts below this score demote mastery (after enough prior practice).
pub const DEMOTE_THRESHOLD: f64 = 0.3;
/// Mastery level at which an expression counts as mastered.
pub const MASTERED_LEVEL: u8 = 5;
/// A single poor first attempt does not demote; demotion needs this many
/// prior attempts on the expression.
pub const DEMOTION_MIN_PRIOR_ATTEMPTS: u32 = 2;

/// Similarity between a transcription and the expected expression, in [0, 1].
///
/// The real model behind this is pluggable; the contract only requires
/// determinism for identical inputs and scores that fall as the transcription
/// drifts further from the expected text.
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, expected: &str, transcription: &str) -> f64;
}

/// Default scorer: a blend of normalized character edit distance and word
/// overlap on lowercased, punctuation-stripped text. No network, fully
/// deterministic.
#[derive(Debug, Default, Clone)]
pub struct LexicalScorer;

impl SimilarityScorer for LexicalScorer {
    fn score(&self, expected: &str, transcription: &str) -> f64 {
        let a = normalize(expected);
        let b = normalize(transcription);
        if a.is_empty() && b.is_empty() {
            return 1.0;
        }
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let char_sim = char_similarity(&a, &b);
        let token_sim = token_overlap(&a, &b);
        ((char_sim + token_sim) / 2.0).clamp(0.0, 1.0)
    }
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn char_similarity(a: &str, b: &str) -> f64 {
    let dist = levenshtein(a, b);
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - dist as f64 / max_len as f64
}

fn token_overlap(a: &str, b: &str) -> f64 {
    let set_a: std::collections::HashSet<&str> = a.split(' ').collect();
    let set_b: std::collections::HashSet<&str> = b.split(' ').collect();
    let shared = set_a.intersection(&set_b).count();
    let total = set_a.union(&set_b).count();
    if total == 0 {
        return 1.0;
    }
    shared as f64 / total as f64
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// The mastery state machine for one attempt. `prior_attempts` is the
/// expression's practice count before this attempt is applied.
pub fn next_mastery_level(level: u8, prior_attempts: u32, score: f64) -> u8 {
    if score >= PROMOTE_THRESHOLD {
        (level + 1).min(MASTERED_LEVEL)
    } else if score < DEMOTE_THRESHOLD && prior_attempts >= DEMOTION_MIN_PRIOR_ATTEMPTS {
        level.saturating_sub(1)
    } else {
        level
    }
}

/// Outcome of applying one attempt to a saved expression.
#[derive(Debug, Clone, PartialEq)]
pub struct MasteryUpdate {
    pub expression_id: String,
    pub mastery_level: u8,
    pub practice_count: u32,
    /// True exactly once, on the transition into level 5.
    pub mastered_now: bool,
}

/// Difficulty label used in the generation prompt, by tier.
pub fn tier_label(tier: Tier) -> &'static str {
    match tier {
        1 => "beginner",
        2 => "intermediate",
        3 => "advanced",
        _ => "fluent",
    }
}
