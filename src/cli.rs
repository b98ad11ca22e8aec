use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "ai-story", author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate a story abstract (chaptered plan).
    Abstract(AbstractArgs),
    /// Generate a full story, chapter by chapter, from an abstract.
    Story(StoryArgs),
}

#[derive(Debug, Args)]
pub struct AbstractArgs {
    /// Config JSON file with `api_key`, `model_name`, `thinking_level`
    /// (default: GEMINI_API_KEY and the default model).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Output path for the abstract (default: abstract-<timestamp>.yaml).
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Story idea to build the plan around.
    #[arg(long, default_value = "")]
    pub instruction: String,

    /// Language the plan is written in.
    #[arg(long, default_value = "english")]
    pub language: String,

    /// Number of chapters to plan (0 picks a random number in 20..=40).
    #[arg(long, default_value_t = 0)]
    pub chapters: u32,

    /// Directory to save raw API request/response bodies in.
    #[arg(long, env = "AI_STORY_DUMP_DIR")]
    pub dump_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct StoryArgs {
    /// Config JSON file with `api_key`, `model_name`, `thinking_level`
    /// (default: GEMINI_API_KEY and the default model).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Abstract file (yaml, json or plain text) created by `abstract`.
    #[arg(long)]
    pub r#abstract: PathBuf,

    /// Target average words per chapter.
    #[arg(long, default_value_t = 5000, value_parser = clap::value_parser!(u32).range(1..))]
    pub words_per_chapter: u32,

    /// Output path for the story (default: derived from the abstract name).
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// What to do when a chapter still fails after all retries.
    #[arg(long, value_enum, default_value_t = ChapterFailurePolicy::Abort)]
    pub on_chapter_failure: ChapterFailurePolicy,

    /// Extra attempts per chapter after the first failure.
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Pause before each chapter retry.
    #[arg(long, default_value_t = 2000)]
    pub retry_delay_ms: u64,

    /// Pause after each written chapter (rate-limit courtesy).
    #[arg(long, default_value_t = 1000)]
    pub chapter_delay_ms: u64,

    /// Directory to save raw API request/response bodies in.
    #[arg(long, env = "AI_STORY_DUMP_DIR")]
    pub dump_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ChapterFailurePolicy {
    /// Stop the run; chapters already written stay on disk.
    Abort,
    /// Write an error placeholder for the chapter and move on.
    Placeholder,
}
