use std::path::PathBuf;

use anyhow::Context as _;
use rand::Rng;

use crate::abstract_file::{self, AbstractRecord};
use crate::chapter_count;
use crate::cli::AbstractArgs;
use crate::config;
use crate::gemini::{GeminiClient, GenerateRequest, TextModel};
use crate::usage::Usage;

/// Range used when the caller leaves the chapter count at 0.
pub const RANDOM_CHAPTERS: std::ops::RangeInclusive<u32> = 20..=40;

#[derive(Debug, Clone)]
pub struct GeneratedAbstract {
    pub record: AbstractRecord,
    pub usage: Usage,
}

pub fn run(args: AbstractArgs) -> anyhow::Result<()> {
    let config = config::resolve(args.config.as_deref()).context("resolve gemini config")?;
    let client = GeminiClient::new(&config)
        .context("create gemini client")?
        .with_dump_dir(args.dump_dir.clone());

    let chapters = resolve_chapter_count(args.chapters, &mut rand::thread_rng());

    tracing::info!(
        model = %config.model_name,
        language = %args.language,
        chapters = chapters,
        "generate abstract"
    );
    let generated = generate(&client, &args.instruction, &args.language, chapters)
        .context("generate abstract")?;
    let mut total = generated.usage;
    tracing::info!(usage = %generated.usage, "abstract generated");

    let out_path = args.output.clone().unwrap_or_else(default_output_path);
    abstract_file::write(&out_path, &generated.record).context("save abstract")?;
    println!("Abstract saved to: {}", out_path.display());

    match chapter_count::ask(
        &client,
        chapter_count::planned_chapters_prompt(&generated.record.abstract_text),
    ) {
        Ok(count) => {
            total.add(&count.usage);
            println!("Chapters planned in abstract: {}", count.count);
            tracing::info!(chapters = count.count, usage = %count.usage, "chapter count extracted");
        }
        Err(err) => {
            tracing::warn!(
                error = %err,
                "failed to extract chapter count from abstract; the saved abstract is unaffected"
            );
        }
    }

    println!("Total cost: ${:.6}", total.cost);
    tracing::info!(usage = %total, "abstract generation finished");
    Ok(())
}

/// Returns `requested`, or a random count from [`RANDOM_CHAPTERS`] when it is 0.
pub fn resolve_chapter_count(requested: u32, rng: &mut impl Rng) -> u32 {
    if requested > 0 {
        tracing::info!(chapters = requested, "using requested chapter count");
        return requested;
    }
    let picked = rng.gen_range(RANDOM_CHAPTERS);
    tracing::info!(chapters = picked, "chapter count not given; picked at random");
    picked
}

pub fn build_prompt(instruction: &str, language: &str, chapters: u32) -> String {
    let mut prompt = format!(
        "Write a concise, compelling story writing plan.\n\
It needs to include the settings, the names of the main characters and a detailed plan for all {chapters} chapters.\n"
    );

    let instruction = instruction.trim();
    if instruction.is_empty() {
        prompt.push_str("Create a detailed story idea.\n");
    } else {
        prompt.push_str(&format!("Story Idea: {instruction}\n"));
    }

    prompt.push_str(&format!("Output the plan in {language}.\n"));
    prompt
}

pub fn generate(
    model: &dyn TextModel,
    instruction: &str,
    language: &str,
    chapters: u32,
) -> anyhow::Result<GeneratedAbstract> {
    let prompt = build_prompt(instruction, language, chapters);
    let result = model
        .generate(&GenerateRequest::new(prompt))
        .with_context(|| format!("call model {}", model.model_name()))?;

    if result.text.trim().is_empty() {
        anyhow::bail!("model returned an empty abstract");
    }

    let usage = Usage::from(&result);
    Ok(GeneratedAbstract {
        record: AbstractRecord {
            abstract_text: result.text,
            continuation_token: result.continuation_token.unwrap_or_default(),
        },
        usage,
    })
}

fn default_output_path() -> PathBuf {
    let stamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S");
    PathBuf::from(format!("abstract-{stamp}.yaml"))
}
