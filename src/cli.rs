use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::engine::Engine;
use crate::generate::{ConversationGenerator, HttpGenerator, NullGenerator};
use crate::model::{DialogueTurn, PoolConversation};
use crate::score::{tier_label, LexicalScorer};
use crate::store::Store;

#[derive(Parser)]
#[command(name = "talkpath")]
#[command(about = "Daily conversation practice: difficulty targeting, selection and progression")]
pub struct Cli {
    /// Data directory (defaults to the platform config dir)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage the character profile
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    /// Start or complete a practice session
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Submit a transcribed attempt at a thought prompt
    Attempt {
        #[arg(long)]
        conversation: String,
        #[arg(long)]
        turn: usize,
        #[arg(long)]
        text: String,
    },
    /// Manage saved expressions
    Expression {
        #[command(subcommand)]
        command: ExpressionCommands,
    },
    /// Show cumulative progress counters
    Progress {
        #[arg(long, default_value = "default")]
        user: String,
    },
    /// Show the daily streak state
    Streak {
        #[arg(long, default_value = "default")]
        user: String,
    },
    /// Show the per-day practice log
    History {
        #[arg(long, default_value = "default")]
        user: String,
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Show the character's journal
    Journal {
        #[arg(long, default_value = "default")]
        user: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Manage the shared conversation library
    Library {
        #[command(subcommand)]
        command: LibraryCommands,
    },
}

#[derive(Subcommand)]
pub enum ProfileCommands {
    Set {
        #[arg(long, default_value = "default")]
        user: String,
        #[arg(long)]
        location: String,
        #[arg(long)]
        age_group: String,
        #[arg(long)]
        gender: String,
    },
    Show {
        #[arg(long, default_value = "default")]
        user: String,
    },
}

#[derive(Subcommand)]
pub enum SessionCommands {
    Start {
        #[arg(long, default_value = "default")]
        user: String,
    },
    Complete {
        #[arg(long)]
        conversation: String,
        #[arg(long, default_value_t = 0)]
        minutes: u32,
        #[arg(long)]
        feeling: Option<String>,
        #[arg(long)]
        confidence: Option<u8>,
    },
}

#[derive(Subcommand)]
pub enum ExpressionCommands {
    /// Save the expression taught by a conversation turn
    Save {
        #[arg(long)]
        conversation: String,
        #[arg(long)]
        turn: usize,
    },
    /// Save a free-form expression not tied to a conversation turn
    SaveText {
        #[arg(long, default_value = "default")]
        user: String,
        #[arg(long)]
        thought: String,
        #[arg(long)]
        expression: String,
        #[arg(long)]
        conversation: Option<String>,
    },
    List {
        #[arg(long, default_value = "default")]
        user: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Search {
        #[arg(long, default_value = "default")]
        user: String,
        query: String,
    },
    Delete {
        #[arg(long, default_value = "default")]
        user: String,
        id: String,
    },
    /// Drop an expression back to mastery level 0
    Reset {
        #[arg(long, default_value = "default")]
        user: String,
        id: String,
    },
}

#[derive(Subcommand)]
pub enum LibraryCommands {
    /// Import conversations from a JSON file into the local pool
    Import {
        #[arg(long)]
        file: PathBuf,
    },
    Status,
}

fn build_engine(data_dir: Option<PathBuf>) -> Result<Engine> {
    let config = Config::new(data_dir)?;
    let store = Arc::new(Store::open(config.db_file())?);
    let generator: Arc<dyn ConversationGenerator> = if config.generation.api_key.is_some() {
        Arc::new(HttpGenerator::new(config.generation.clone())?)
    } else {
        Arc::new(NullGenerator)
    };
    Ok(Engine::new(
        store.clone(),
        store,
        generator,
        Arc::new(LexicalScorer),
        config.engine.clone(),
    ))
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub async fn handle_profile(command: ProfileCommands, data_dir: Option<PathBuf>) -> Result<()> {
    let engine = build_engine(data_dir)?;
    match command {
        ProfileCommands::Set {
            user,
            location,
            age_group,
            gender,
        } => {
            let profile = engine.set_profile(&user, &location, &age_group, &gender)?;
            println!("✅ Profile saved for {}", profile.user_id);
        }
        ProfileCommands::Show { user } => {
            let profile = engine.profile(&user)?;
            println!("👤 {}", profile.user_id);
            println!("  Location: {}", profile.location);
            println!("  Age group: {}", profile.age_group);
            println!("  Gender: {}", profile.gender);
            match profile.start_date {
                Some(start) => println!("  Practicing since: {}", start),
                None => println!("  Practicing since: (not started yet)"),
            }
        }
    }
    Ok(())
}

pub async fn handle_session(command: SessionCommands, data_dir: Option<PathBuf>) -> Result<()> {
    let engine = build_engine(data_dir)?;
    match command {
        SessionCommands::Start { user } => {
            let session = engine.start_session(&user, today()).await?;
            println!(
                "🎯 Day {} — {} (tier {})",
                session.day_number,
                tier_label(session.tier),
                session.tier
            );
            if session.degraded {
                println!("⚠️  Fresh content unavailable, serving a repeat");
            }
            println!("📝 {} [{}]", session.conversation.scenario, session.conversation.id);
            for (i, turn) in session.conversation.dialogue.iter().enumerate() {
                match turn {
                    DialogueTurn::Line { speaker, text } => {
                        println!("  {:>2}. {}: {}", i, speaker, text)
                    }
                    DialogueTurn::Prompt { thought, .. } => {
                        println!("  {:>2}. (you, thinking: \"{}\") — say it in English", i, thought)
                    }
                }
            }
        }
        SessionCommands::Complete {
            conversation,
            minutes,
            feeling,
            confidence,
        } => {
            let completed =
                engine.complete_session(&conversation, minutes, today(), feeling, confidence)?;
            println!(
                "✅ Session complete — success rate {:.0}%",
                completed.success_rate * 100.0
            );
            println!(
                "🔥 Streak: {} (longest {})",
                completed.progress.current_streak, completed.progress.longest_streak
            );
            println!("📖 Day {} journal:\n{}", completed.day_number, completed.journal.notes);
        }
    }
    Ok(())
}

pub async fn handle_attempt(
    conversation: String,
    turn: usize,
    text: String,
    data_dir: Option<PathBuf>,
) -> Result<()> {
    let engine = build_engine(data_dir)?;
    let outcome = engine.submit_attempt(&conversation, turn, &text, today())?;
    println!(
        "🎙  Attempt {} scored {:.0}%",
        outcome.attempt.attempt_number,
        outcome.attempt.success_score * 100.0
    );
    println!("💬 Target: {}", outcome.expected_expression);
    if let Some(mastery) = outcome.mastery {
        println!(
            "📈 Mastery: level {} after {} practices{}",
            mastery.mastery_level,
            mastery.practice_count,
            if mastery.mastered_now { " — mastered! 🎉" } else { "" }
        );
    }
    Ok(())
}

pub async fn handle_expression(
    command: ExpressionCommands,
    data_dir: Option<PathBuf>,
) -> Result<()> {
    let engine = build_engine(data_dir)?;
    match command {
        ExpressionCommands::Save { conversation, turn } => {
            let saved = engine.save_expression_from_turn(&conversation, turn)?;
            println!("✅ Saved \"{}\" ({})", saved.expression, saved.id);
        }
        ExpressionCommands::SaveText {
            user,
            thought,
            expression,
            conversation,
        } => {
            let saved =
                engine.save_expression(&user, conversation.as_deref(), &thought, &expression)?;
            println!("✅ Saved expression {}", saved.id);
        }
        ExpressionCommands::List { user, limit } => {
            let expressions = engine.list_expressions(&user, limit)?;
            if expressions.is_empty() {
                println!("No saved expressions.");
                return Ok(());
            }
            println!("📚 Expressions ({}):", expressions.len());
            for expr in expressions {
                println!(
                    "  [{}/5] {} — \"{}\" ({})",
                    expr.mastery_level, expr.expression, expr.thought, expr.id
                );
            }
        }
        ExpressionCommands::Search { user, query } => {
            let expressions = engine.search_expressions(&user, &query)?;
            println!("🔍 {} match(es):", expressions.len());
            for expr in expressions {
                println!("  [{}/5] {} ({})", expr.mastery_level, expr.expression, expr.id);
            }
        }
        ExpressionCommands::Delete { user, id } => {
            engine.delete_expression(&user, &id)?;
            println!("🗑  Deleted {}", id);
        }
        ExpressionCommands::Reset { user, id } => {
            let expr = engine.reset_mastery(&user, &id)?;
            println!("↩️  {} reset to level {}", expr.expression, expr.mastery_level);
        }
    }
    Ok(())
}

pub async fn handle_progress(user: String, data_dir: Option<PathBuf>) -> Result<()> {
    let engine = build_engine(data_dir)?;
    let progress = engine.progress(&user)?;
    println!("📊 Progress for {}:", user);
    println!("  Conversations: {}", progress.total_conversations);
    println!("  Minutes practiced: {}", progress.total_minutes);
    println!("  Expressions saved: {}", progress.expressions_saved);
    println!("  Expressions mastered: {}", progress.expressions_mastered);
    println!(
        "  Streak: {} (longest {})",
        progress.current_streak, progress.longest_streak
    );
    Ok(())
}

pub async fn handle_streak(user: String, data_dir: Option<PathBuf>) -> Result<()> {
    let engine = build_engine(data_dir)?;
    let status = engine.streak_status(&user, today())?;
    println!("🔥 Streak: {} (longest {})", status.current_streak, status.longest_streak);
    if status.practiced_today {
        println!("  Practiced today ✅");
    } else if status.streak_at_risk {
        println!("  At risk — practice today to keep it alive!");
    }
    Ok(())
}

pub async fn handle_history(user: String, days: i64, data_dir: Option<PathBuf>) -> Result<()> {
    let engine = build_engine(data_dir)?;
    let history = engine.practice_history(&user, days, today())?;
    if history.is_empty() {
        println!("No practice in the last {} days.", days);
        return Ok(());
    }
    println!("📅 Last {} days:", days);
    for entry in history {
        println!(
            "  {} — {} attempts, {} min",
            entry.practice_date, entry.attempts, entry.minutes
        );
    }
    Ok(())
}

pub async fn handle_journal(user: String, limit: usize, data_dir: Option<PathBuf>) -> Result<()> {
    let engine = build_engine(data_dir)?;
    let entries = engine.journal_entries(&user, limit)?;
    if entries.is_empty() {
        println!("The journal is empty.");
        return Ok(());
    }
    for entry in entries {
        println!("— Day {} —", entry.day_number);
        if let Some(feeling) = &entry.emotional_state {
            println!("  Feeling: {}", feeling);
        }
        println!("{}", entry.notes);
        println!();
    }
    Ok(())
}

pub async fn handle_library(command: LibraryCommands, data_dir: Option<PathBuf>) -> Result<()> {
    let engine = build_engine(data_dir)?;
    match command {
        LibraryCommands::Import { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let conversations: Vec<PoolConversation> =
                serde_json::from_str(&raw).context("Failed to parse conversation file")?;
            let imported = engine.import_library(&conversations)?;
            println!("✅ Imported {} conversation(s)", imported);
        }
        LibraryCommands::Status => {
            println!("📦 Library holds {} conversation(s)", engine.store().library_count()?);
        }
    }
    Ok(())
}
