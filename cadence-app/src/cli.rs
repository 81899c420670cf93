//! Command-line parsing.

use std::path::PathBuf;

use anyhow::{bail, Context as _};

const DEFAULT_HISTORY_LIMIT: usize = 20;

pub const USAGE: &str = "\
usage: cadence <command>

commands:
  elements                              list registered element types as JSON
  validate <pipeline.json>              validate a pipeline definition
  run --audio <in.wav> [--pipeline <p.json>]
                                        run a pipeline over a WAV file
  history [limit]                       show recent runs
  search <query> [limit]                search run output text
  prune                                 drop runs older than retentionDays
  clear                                 delete every recorded run
  help                                  show this message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Elements,
    Validate(PathBuf),
    Run {
        pipeline: Option<PathBuf>,
        audio: PathBuf,
    },
    History(usize),
    Search {
        query: String,
        limit: usize,
    },
    Prune,
    Clear,
    Help,
}

/// Parse everything after the program name.
pub fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Command> {
    let mut args = args.into_iter();
    let Some(command) = args.next() else {
        return Ok(Command::Help);
    };
    let rest: Vec<String> = args.collect();

    let command = match command.as_str() {
        "elements" => {
            no_extra(&rest, 0)?;
            Command::Elements
        }
        "validate" => {
            no_extra(&rest, 1)?;
            let path = rest.first().context("validate needs a pipeline file")?;
            Command::Validate(PathBuf::from(path))
        }
        "run" => parse_run(&rest)?,
        "history" => {
            no_extra(&rest, 1)?;
            Command::History(parse_limit(rest.first())?)
        }
        "search" => {
            no_extra(&rest, 2)?;
            let query = rest.first().context("search needs a query")?.clone();
            Command::Search {
                query,
                limit: parse_limit(rest.get(1))?,
            }
        }
        "prune" => {
            no_extra(&rest, 0)?;
            Command::Prune
        }
        "clear" => {
            no_extra(&rest, 0)?;
            Command::Clear
        }
        "help" | "-h" | "--help" => Command::Help,
        other => bail!("unknown command `{other}`"),
    };
    Ok(command)
}

fn parse_run(rest: &[String]) -> anyhow::Result<Command> {
    let mut pipeline = None;
    let mut audio = None;
    let mut iter = rest.iter();
    while let Some(flag) = iter.next() {
        let slot = match flag.as_str() {
            "--pipeline" | "-p" => &mut pipeline,
            "--audio" | "-a" => &mut audio,
            other => bail!("unexpected argument `{other}` for run"),
        };
        let value = iter
            .next()
            .with_context(|| format!("{flag} needs a value"))?;
        *slot = Some(PathBuf::from(value));
    }
    Ok(Command::Run {
        pipeline,
        audio: audio.context("run needs --audio <file.wav>")?,
    })
}

fn parse_limit(raw: Option<&String>) -> anyhow::Result<usize> {
    match raw {
        None => Ok(DEFAULT_HISTORY_LIMIT),
        Some(raw) => {
            let limit: usize = raw
                .parse()
                .with_context(|| format!("invalid limit `{raw}`"))?;
            Ok(limit.max(1))
        }
    }
}

fn no_extra(rest: &[String], allowed: usize) -> anyhow::Result<()> {
    if let Some(extra) = rest.get(allowed) {
        bail!("unexpected argument `{extra}`");
    }
    Ok(())
}
