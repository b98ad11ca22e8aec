use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::Context as _;

use crate::abstract_file;
use crate::chapter_count;
use crate::cli::{ChapterFailurePolicy, StoryArgs};
use crate::config;
use crate::gemini::{ContinuationToken, GeminiClient, GenerateRequest, ModelCallResult, TextModel};
use crate::logging;
use crate::usage::Usage;

/// Separator closing the story preamble.
pub const PREAMBLE_SEPARATOR: &str = "----------------------------------------";

const CHAPTER_HEADER_PREFIX: &str = "## Chapter ";

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StoryOptions {
    pub words_per_chapter: u32,
    pub failure_policy: ChapterFailurePolicy,
    pub retry: RetryPolicy,
    pub chapter_delay: Duration,
}

impl Default for StoryOptions {
    fn default() -> Self {
        Self {
            words_per_chapter: 5000,
            failure_policy: ChapterFailurePolicy::Abort,
            retry: RetryPolicy::default(),
            chapter_delay: Duration::from_secs(1),
        }
    }
}

impl From<&StoryArgs> for StoryOptions {
    fn from(args: &StoryArgs) -> Self {
        Self {
            words_per_chapter: args.words_per_chapter,
            failure_policy: args.on_chapter_failure,
            retry: RetryPolicy {
                max_retries: args.max_retries,
                delay: Duration::from_millis(args.retry_delay_ms),
            },
            chapter_delay: Duration::from_millis(args.chapter_delay_ms),
        }
    }
}

/// Where a story run stands. Lives for one run only; the output file is the
/// only thing that survives it.
#[derive(Debug, Clone)]
pub struct StoryProgress {
    pub chapters_already_written: u32,
    pub first_new_chapter: u32,
    pub usage: Usage,
    /// Text of every chapter so far, fed back into each chapter prompt.
    pub previous_chapters: String,
    pub last_token: Option<ContinuationToken>,
}

impl StoryProgress {
    pub fn fresh() -> Self {
        Self {
            chapters_already_written: 0,
            first_new_chapter: 1,
            usage: Usage::default(),
            previous_chapters: String::new(),
            last_token: None,
        }
    }

    fn resumed(chapters_already_written: u32, previous_chapters: String) -> Option<Self> {
        Some(Self {
            chapters_already_written,
            first_new_chapter: chapters_already_written.checked_add(1)?,
            usage: Usage::default(),
            previous_chapters,
            last_token: None,
        })
    }

    pub fn is_resuming(&self) -> bool {
        self.chapters_already_written > 0
    }
}

#[derive(Debug, Clone)]
pub struct StoryOutcome {
    pub output_path: PathBuf,
    pub total_chapters: u32,
    pub first_new_chapter: u32,
    pub usage: Usage,
}

/// Result of the structural `## Chapter N` scan over an existing story.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterScan {
    /// Headers `1..=n` in order, the last one with text after it.
    Chapters(u32),
    /// The headers do not tell a clear story. `headers` is how many
    /// `## Chapter N` lines were found, an upper bound on what was written.
    Ambiguous { reason: String, headers: u32 },
}

pub fn run(args: StoryArgs) -> anyhow::Result<()> {
    let stamp = file_timestamp();
    let log_path = log_path_for(&args.r#abstract, &stamp);
    logging::with_log_file(&log_path, || run_logged(&args, &stamp))
}

fn run_logged(args: &StoryArgs, stamp: &str) -> anyhow::Result<()> {
    let config = config::resolve(args.config.as_deref()).context("resolve gemini config")?;
    let client = GeminiClient::new(&config)
        .context("create gemini client")?
        .with_dump_dir(args.dump_dir.clone());

    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&args.r#abstract, stamp));

    let outcome = generate_story(
        &client,
        &args.r#abstract,
        &output_path,
        &StoryOptions::from(args),
    )?;

    println!("Story saved to: {}", outcome.output_path.display());
    println!("Total cost: ${:.6}", outcome.usage.cost);
    Ok(())
}

/// Generates (or resumes) the story for `abstract_path` into `output_path`.
pub fn generate_story(
    model: &dyn TextModel,
    abstract_path: &Path,
    output_path: &Path,
    options: &StoryOptions,
) -> anyhow::Result<StoryOutcome> {
    let record = abstract_file::read(abstract_path).context("load abstract")?;

    tracing::info!(model = %model.model_name(), "asking model for the planned chapter count");
    let planned = chapter_count::ask(
        model,
        chapter_count::planned_chapters_prompt(&record.abstract_text),
    )
    .context("determine planned chapter count")?;
    if planned.count == 0 {
        anyhow::bail!(
            "model found 0 planned chapters in {}; cannot generate a story",
            abstract_path.display()
        );
    }
    let total_chapters = planned.count;
    tracing::info!(chapters = total_chapters, usage = %planned.usage, "planned chapter count");

    let mut progress = resume_progress(model, output_path);
    progress.usage.add(&planned.usage);

    let mut file = open_output(output_path, progress.is_resuming())?;
    if !progress.is_resuming() {
        write_preamble(&mut file, &record.abstract_text, &header_timestamp())
            .with_context(|| format!("write story preamble: {}", output_path.display()))?;
    }

    generate_chapters(
        model,
        &mut file,
        output_path,
        &record.abstract_text,
        total_chapters,
        &mut progress,
        options,
    )?;

    tracing::info!(
        path = %output_path.display(),
        usage = %progress.usage,
        "story finished"
    );

    Ok(StoryOutcome {
        output_path: output_path.to_owned(),
        total_chapters,
        first_new_chapter: progress.first_new_chapter,
        usage: progress.usage,
    })
}

/// Works out where to resume from an existing output file, if any.
///
/// The deterministic header scan decides when it can; the model is asked
/// only when the headers are ambiguous. Anything that goes wrong means
/// starting fresh.
pub fn resume_progress(model: &dyn TextModel, output_path: &Path) -> StoryProgress {
    if !output_path.exists() {
        tracing::info!(path = %output_path.display(), "starting a new story");
        return StoryProgress::fresh();
    }

    let existing = match std::fs::read_to_string(output_path) {
        Ok(existing) => existing,
        Err(err) => {
            tracing::warn!(
                path = %output_path.display(),
                error = %err,
                "cannot read existing story; starting from chapter 1"
            );
            return StoryProgress::fresh();
        }
    };

    let mut usage = Usage::default();
    let written = match scan_chapters(&existing) {
        ChapterScan::Chapters(count) => {
            tracing::info!(chapters = count, "found written chapters by header scan");
            count
        }
        ChapterScan::Ambiguous { reason, headers } => {
            tracing::warn!(
                reason = %reason,
                headers,
                "chapter headers are ambiguous; asking model for the last complete chapter"
            );
            match chapter_count::ask(model, chapter_count::written_chapters_prompt(&existing)) {
                Ok(answer) if answer.count > headers => {
                    usage.add(&answer.usage);
                    tracing::warn!(
                        answer = answer.count,
                        headers,
                        "model claims more chapters than the file has headers; starting from chapter 1"
                    );
                    0
                }
                Ok(answer) => {
                    usage.add(&answer.usage);
                    answer.count
                }
                Err(err) => {
                    usage.add(&err.usage);
                    tracing::warn!(
                        error = %err,
                        "could not get written chapter count; starting from chapter 1"
                    );
                    0
                }
            }
        }
    };

    let resumed = if written > 0 {
        StoryProgress::resumed(written, existing)
    } else {
        None
    };
    let mut progress = match resumed {
        Some(progress) => {
            tracing::info!(
                path = %output_path.display(),
                chapters = written,
                resume_from = progress.first_new_chapter,
                "resuming story"
            );
            progress
        }
        None => {
            tracing::info!(
                path = %output_path.display(),
                "no complete chapters in existing story; starting from chapter 1"
            );
            StoryProgress::fresh()
        }
    };
    progress.usage = usage;
    progress
}

/// Scans `## Chapter N` header lines after the preamble.
pub fn scan_chapters(story: &str) -> ChapterScan {
    let body_start = preamble_end(story);
    let body = &story[body_start..];

    let mut headers: Vec<(u32, usize)> = Vec::new();
    let mut offset = 0usize;
    for line in body.split_inclusive('\n') {
        offset += line.len();
        if let Some(number) = chapter_header_number(line) {
            headers.push((number, offset));
        }
    }

    let header_count = u32::try_from(headers.len()).unwrap_or(u32::MAX);
    let ambiguous = |reason: String| ChapterScan::Ambiguous {
        reason,
        headers: header_count,
    };

    for (idx, (number, _)) in headers.iter().enumerate() {
        let expected = u32::try_from(idx).map_or(u32::MAX, |idx| idx.saturating_add(1));
        if *number != expected {
            return ambiguous(format!(
                "expected chapter {expected} but found chapter {number}"
            ));
        }
    }

    let Some(&(last, text_start)) = headers.last() else {
        return ChapterScan::Chapters(0);
    };
    if body[text_start..].trim().is_empty() {
        return ambiguous(format!("chapter {last} has no text"));
    }
    ChapterScan::Chapters(last)
}

/// Byte offset just past the separator that closes the preamble.
///
/// That is the last separator line followed, blank lines aside, by
/// `## Chapter 1` or by the end of the file. Separator lines inside the
/// abstract text are followed by something else and are skipped. Returns 0
/// when no separator qualifies.
fn preamble_end(story: &str) -> usize {
    let mut end = 0usize;
    let mut offset = 0usize;
    let mut pending: Option<usize> = None;
    for line in story.split_inclusive('\n') {
        offset += line.len();
        let trimmed = line.trim_end();
        if trimmed == PREAMBLE_SEPARATOR {
            pending = Some(offset);
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }
        if let Some(candidate) = pending.take()
            && chapter_header_number(line) == Some(1)
        {
            end = candidate;
        }
    }
    if let Some(candidate) = pending {
        end = candidate;
    }
    end
}

fn chapter_header_number(line: &str) -> Option<u32> {
    line.trim_end()
        .strip_prefix(CHAPTER_HEADER_PREFIX)?
        .trim()
        .parse()
        .ok()
}

fn generate_chapters(
    model: &dyn TextModel,
    out: &mut impl Write,
    output_path: &Path,
    abstract_text: &str,
    total_chapters: u32,
    progress: &mut StoryProgress,
    options: &StoryOptions,
) -> anyhow::Result<()> {
    tracing::info!(
        from = progress.first_new_chapter,
        to = total_chapters,
        words_per_chapter = options.words_per_chapter,
        "generating chapters"
    );

    for chapter in progress.first_new_chapter..=total_chapters {
        tracing::info!(chapter, total = total_chapters, "generating chapter");

        let prompt = chapter_prompt(
            chapter,
            options.words_per_chapter,
            abstract_text,
            &progress.previous_chapters,
        );
        let request =
            GenerateRequest::new(prompt).with_continuation_token(progress.last_token.take());

        let (text, usage, token) = match call_with_retry(model, &request, chapter, &options.retry) {
            Ok(result) => {
                let usage = Usage::from(&result);
                (result.text, usage, result.continuation_token)
            }
            Err(err) => match options.failure_policy {
                ChapterFailurePolicy::Abort => {
                    return Err(err).with_context(|| {
                        format!(
                            "generate chapter {chapter}; chapters before it are saved in {}",
                            output_path.display()
                        )
                    });
                }
                ChapterFailurePolicy::Placeholder => {
                    let message = format!("{err:#}");
                    tracing::error!(
                        chapter,
                        error = %message,
                        "chapter failed; writing placeholder and continuing"
                    );
                    (placeholder_text(chapter, &err), Usage::default(), None)
                }
            },
        };

        let block = chapter_block(chapter, &text);
        out.write_all(block.as_bytes())
            .and_then(|()| out.flush())
            .with_context(|| {
                format!("write chapter {chapter} to {}", output_path.display())
            })?;

        progress.usage.add(&usage);
        progress.previous_chapters.push_str(&block);
        progress.last_token = token;

        tracing::info!(
            chapter,
            chapter_usage = %usage,
            total_usage = %progress.usage,
            "chapter written"
        );

        if chapter < total_chapters && !options.chapter_delay.is_zero() {
            thread::sleep(options.chapter_delay);
        }
    }

    Ok(())
}

fn call_with_retry(
    model: &dyn TextModel,
    request: &GenerateRequest,
    chapter: u32,
    retry: &RetryPolicy,
) -> anyhow::Result<ModelCallResult> {
    let attempts = retry.max_retries.saturating_add(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        if let Some(err) = &last_error {
            tracing::warn!(
                chapter,
                attempt,
                attempts,
                error = %err,
                "retrying chapter"
            );
            if !retry.delay.is_zero() {
                thread::sleep(retry.delay);
            }
        }

        match model.generate(request) {
            Ok(result) => return Ok(result),
            Err(err) => last_error = Some(err),
        }
    }

    let err = match last_error {
        Some(err) => anyhow::Error::new(err),
        None => anyhow::anyhow!("no attempts were made"),
    };
    Err(err.context(format!("chapter {chapter} failed after {attempts} attempt(s)")))
}

pub fn chapter_prompt(
    chapter: u32,
    words_per_chapter: u32,
    abstract_text: &str,
    previous_chapters: &str,
) -> String {
    format!(
        "Given the following complete story abstract (plan) and the chapters already written, please write Chapter {chapter} of the story.\n\
Generate a short title for the chapter.\n\
The chapter should be approximately {words_per_chapter} words. Focus on progressing the narrative as outlined in the abstract for this specific chapter.\n\
\n\
--- Full Story Abstract (Plan) ---\n\
{abstract_text}\n\
--- End Full Story Abstract (Plan) ---\n\
\n\
--- Previously Written Chapters ---\n\
{previous_chapters}\n\
--- End Previously Written Chapters ---\n\
\n\
Write Chapter {chapter} now, ensuring it flows logically from previous chapters and adheres to the overall story plan.\n"
    )
}

pub fn chapter_block(chapter: u32, text: &str) -> String {
    format!("{CHAPTER_HEADER_PREFIX}{chapter}\n\n{}\n\n", text.trim())
}

fn placeholder_text(chapter: u32, err: &anyhow::Error) -> String {
    format!(
        "Error generating Chapter {chapter}: {err:#}\n\n[Generation Failed - Please review logs]"
    )
}

fn write_preamble(out: &mut impl Write, abstract_text: &str, timestamp: &str) -> std::io::Result<()> {
    write!(
        out,
        "--- Full Story: {timestamp} ---\n\nStory Plan Abstract:\n{abstract_text}\n\n{PREAMBLE_SEPARATOR}\n\n"
    )?;
    out.flush()
}

fn open_output(path: &Path, append: bool) -> anyhow::Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create story output dir: {}", parent.display()))?;
    }

    let mut options = OpenOptions::new();
    if append {
        options.append(true);
    } else {
        options.write(true).create(true).truncate(true);
    }
    options
        .open(path)
        .with_context(|| format!("open story output: {}", path.display()))
}

/// `abstract-X.yaml` → `fulltext-X.txt` next to the abstract; otherwise a
/// timestamped name in the working directory.
pub fn default_output_path(abstract_path: &Path, stamp: &str) -> PathBuf {
    let derived = derived_name(abstract_path, "fulltext-").map(|rest| {
        let rest = match strip_known_extension(&rest) {
            Some(stem) => format!("{stem}.txt"),
            None => rest,
        };
        abstract_path.with_file_name(rest)
    });
    derived.unwrap_or_else(|| PathBuf::from(format!("fulltext-{stamp}.txt")))
}

/// `abstract-X.yaml` → `log-X.log` next to the abstract; otherwise a
/// timestamped name in the working directory.
pub fn log_path_for(abstract_path: &Path, stamp: &str) -> PathBuf {
    derived_name(abstract_path, "log-")
        .and_then(|rest| strip_known_extension(&rest).map(|stem| format!("{stem}.log")))
        .map(|name| abstract_path.with_file_name(name))
        .unwrap_or_else(|| PathBuf::from(format!("story-log-{stamp}.log")))
}

fn derived_name(abstract_path: &Path, new_prefix: &str) -> Option<String> {
    const PREFIX: &str = "abstract-";
    let name = abstract_path.file_name()?.to_str()?;
    if !name.to_ascii_lowercase().starts_with(PREFIX) {
        return None;
    }
    Some(format!("{new_prefix}{}", &name[PREFIX.len()..]))
}

fn strip_known_extension(name: &str) -> Option<&str> {
    let (stem, ext) = name.rsplit_once('.')?;
    matches!(
        ext.to_ascii_lowercase().as_str(),
        "txt" | "json" | "yaml" | "yml"
    )
    .then_some(stem)
}

fn file_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d-%H-%M-%S").to_string()
}

fn header_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
