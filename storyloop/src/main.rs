//! storyloop: drive a story manifest to completion with a coding agent.
//!
//! Every command operates on the current directory, which must be the root of
//! the project's git work tree. Loop state lives under `.storyloop/`.

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use storyloop::control::{ResetOptions, latest_log, reset_loop, stop_loops};
use storyloop::core::progress::{format_duration, progress_bar};
use storyloop::error::{EnvironmentError, RetriesExhausted, WaveCheckpointFailed};
use storyloop::exit_codes;
use storyloop::io::agent::CommandAgent;
use storyloop::io::config::{LoopConfig, load_config};
use storyloop::io::environment::check_environment;
use storyloop::io::gates::CommandGateRunner;
use storyloop::io::git::Git;
use storyloop::io::init::{InitOptions, LoopPaths, init_loop};
use storyloop::logging;
use storyloop::looping::{LoopEvent, LoopStop, run_loop};
use storyloop::select::{NextOutcome, next_from_root, status_from_root};
use storyloop::validate::validate_project;

#[derive(Parser)]
#[command(
    name = "storyloop",
    version,
    about = "Drive a story manifest to completion, one verified TDD story at a time"
)]
struct Cli {
    /// Log progress details to stderr (RUST_LOG overrides).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.storyloop/` (config, gitignore) and a starter manifest if missing.
    Init {
        /// Overwrite existing loop files.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the loop until every story passed or a limit is hit.
    Run(RunArgs),
    /// Signal every running loop and its agent.
    Stop,
    /// Show completion and the state of every story.
    Status,
    /// Print the id of the next eligible story.
    Next,
    /// Check config, manifest schema and manifest invariants.
    Validate,
    /// Print the latest iteration's logs.
    Log,
    /// Forget run state, baselines and logs.
    Reset {
        /// Also set every story back to pending.
        #[arg(long)]
        stories: bool,
    },
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Model passed to the agent command.
    #[arg(long)]
    model: Option<String>,
    /// Iteration limit for this invocation.
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Delegate every unblocked story at once.
    #[arg(long)]
    teams: bool,
    /// Require a `[REFACTOR]` commit after green.
    #[arg(long)]
    refactor: bool,
    /// Manifest path relative to the project root.
    #[arg(long)]
    manifest: Option<String>,
}

impl RunArgs {
    fn apply(&self, cfg: &mut LoopConfig) {
        if let Some(model) = &self.model {
            cfg.model = Some(model.clone());
        }
        if let Some(max) = self.max_iterations {
            cfg.max_iterations = max;
        }
        if let Some(manifest) = &self.manifest {
            cfg.manifest_path = manifest.clone();
        }
        cfg.teams |= self.teams;
        cfg.refactor_required |= self.refactor;
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("storyloop: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<RetriesExhausted>().is_some()
        || err.downcast_ref::<WaveCheckpointFailed>().is_some()
    {
        exit_codes::EXHAUSTED
    } else {
        exit_codes::INVALID
    }
}

fn run(command: Command) -> Result<i32> {
    let root = std::env::current_dir().context("resolve current directory")?;
    match command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Run(args) => cmd_run(&root, &args),
        Command::Stop => cmd_stop(&root),
        Command::Status => cmd_status(&root),
        Command::Next => cmd_next(&root),
        Command::Validate => cmd_validate(&root),
        Command::Log => cmd_log(&root),
        Command::Reset { stories } => cmd_reset(&root, stories),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_loop(root, &InitOptions { force })?;
    println!("initialized {}", paths.loop_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, args: &RunArgs) -> Result<i32> {
    let paths = LoopPaths::new(root);
    let mut cfg = load_config(&paths.config_path)
        .map_err(|err| EnvironmentError::InvalidConfig(format!("{err:#}")))?;
    args.apply(&mut cfg);
    check_environment(&paths, &cfg, &Git::new(root))?;

    let agent = CommandAgent::new(cfg.agent.clone());
    let gates = CommandGateRunner::new(cfg.gates.clone())
        .map_err(|err| EnvironmentError::InvalidConfig(format!("{err:#}")))?;
    let outcome = run_loop(root, &cfg, &agent, &gates, print_event)?;

    match outcome.stop {
        LoopStop::Idle => println!(
            "all stories passed ({} this run, {} iterations)",
            outcome.passed.len(),
            outcome.iterations
        ),
        LoopStop::Exhausted { max_iterations } => println!(
            "stopped after {max_iterations} iterations; {} stories passed this run",
            outcome.passed.len()
        ),
    }
    Ok(exit_codes::OK)
}

fn print_event(event: &LoopEvent<'_>) {
    match event {
        LoopEvent::Started {
            run_id,
            mode,
            tolerated_failures,
        } => {
            println!("{run_id} ({mode})");
            if *tolerated_failures > 0 {
                println!("baseline: {tolerated_failures} pre-existing failure(s) tolerated");
            }
        }
        LoopEvent::Delegating {
            iter,
            unit,
            attempt,
            max_attempts,
        } => {
            let peers = if unit.peers.is_empty() {
                String::new()
            } else {
                format!(" with {}", unit.peers.join(", "))
            };
            println!("[{iter}] {}{peers} (attempt {attempt}/{max_attempts})", unit.primary);
        }
        LoopEvent::StoryFinished { iter, verdict } => {
            let status = if verdict.passed() { "passed" } else { "failed" };
            if verdict.note.is_empty() {
                println!("[{iter}] {} {status}", verdict.story_id);
            } else {
                println!("[{iter}] {} {status}: {}", verdict.story_id, verdict.note);
            }
        }
        LoopEvent::Progress { passed, total, eta } => match eta {
            Some(eta) => println!(
                "{} eta {}",
                progress_bar(*passed, *total),
                format_duration(*eta)
            ),
            None => println!("{}", progress_bar(*passed, *total)),
        },
    }
}

fn cmd_stop(root: &Path) -> Result<i32> {
    let report = stop_loops(root)?;
    if report.loops.is_empty() && report.agents.is_empty() {
        println!("no running loop");
    } else {
        println!(
            "signalled {} loop(s) and {} agent(s)",
            report.loops.len(),
            report.agents.len()
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path) -> Result<i32> {
    print!("{}", status_from_root(root)?.render());
    Ok(exit_codes::OK)
}

fn cmd_next(root: &Path) -> Result<i32> {
    match next_from_root(root)? {
        NextOutcome::Next(next) => {
            println!("{}", next.id);
            if next.is_exhausted() {
                eprintln!(
                    "{} already used {}/{} attempts; `storyloop run` would halt",
                    next.id, next.attempts, next.max_attempts
                );
            }
            Ok(exit_codes::OK)
        }
        NextOutcome::Complete => {
            eprintln!("no eligible story: all stories passed");
            Ok(exit_codes::COMPLETE)
        }
        NextOutcome::Blocked(ids) => {
            eprintln!("no eligible story: blocked ({})", ids.join(", "));
            Ok(exit_codes::COMPLETE)
        }
    }
}

fn cmd_validate(root: &Path) -> Result<i32> {
    let report = validate_project(root)?;
    if report.is_valid() {
        println!("{}: ok ({} stories)", report.manifest_path.display(), report.stories);
        return Ok(exit_codes::OK);
    }
    eprintln!("{}: invalid", report.manifest_path.display());
    for problem in &report.problems {
        eprintln!("- {problem}");
    }
    Ok(exit_codes::INVALID)
}

fn cmd_log(root: &Path) -> Result<i32> {
    match latest_log(root)? {
        Some(log) => print!("{}", log.render()),
        None => println!("no iterations recorded"),
    }
    Ok(exit_codes::OK)
}

fn cmd_reset(root: &Path, stories: bool) -> Result<i32> {
    let count = reset_loop(root, ResetOptions { stories })?;
    if stories {
        println!("reset loop state and {count} stories");
    } else {
        println!("reset loop state");
    }
    Ok(exit_codes::OK)
}
