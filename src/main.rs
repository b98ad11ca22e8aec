use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

fn main() -> ExitCode {
    if let Err(err) = try_main() {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn try_main() -> anyhow::Result<()> {
    ai_story::logging::init().context("init logging")?;

    let cli = ai_story::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        ai_story::cli::Command::Abstract(args) => {
            ai_story::abstract_plan::run(args).context("abstract")?;
        }
        ai_story::cli::Command::Story(args) => {
            ai_story::story::run(args).context("story")?;
        }
    }

    Ok(())
}
