//! Plan-driven code generation and execution engine.
//!
//! `stepwise repl` runs the interactive session; `run` and `parse` expose the
//! executor and plan parser for one-off use.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stepwise::core::dependency::MissingDependency;
use stepwise::core::plan_parser::parse_plan;
use stepwise::core::types::RunStatus;
use stepwise::executor::{ExecRequest, Execute, ScriptExecutor};
use stepwise::exit_codes;
use stepwise::io::collaborator::CommandCollaborator;
use stepwise::io::config::{DEFAULT_CONFIG_PATH, StepwiseConfig, load_config, write_config};
use stepwise::io::installer::DependencyResolver;
use stepwise::io::interrupt::Interrupt;
use stepwise::io::operator::ConsoleOperator;
use stepwise::logging;
use stepwise::session::{Session, run_repl};
use tracing::{debug, info};

#[derive(Parser)]
#[command(
    name = "stepwise",
    version,
    about = "Plan, generate, and run code step by step"
)]
struct Cli {
    /// Config file (default: `.stepwise/config.toml` under the workdir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding artifacts and config.
    #[arg(long, global = true, default_value = ".")]
    workdir: PathBuf,
    /// More diagnostics on stderr (`-v` info, `-vv` debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file if none exists.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Interactive session (default).
    Repl,
    /// Run an artifact once, with one automatic repair round.
    Run {
        /// Script to run; `.wat` files run in the in-process sandbox.
        path: PathBuf,
    },
    /// Parse a plan text file and print its steps as JSON.
    Parse { path: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(exit_codes::INVALID as u8)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.workdir.join(DEFAULT_CONFIG_PATH));
    debug!(config = %config_path.display(), "resolved config path");

    let code = match cli.command.unwrap_or(Command::Repl) {
        Command::Init { force } => cmd_init(&config_path, force)?,
        Command::Parse { path } => cmd_parse(&path)?,
        Command::Repl => {
            let cfg = load_config(&config_path)?;
            cmd_repl(&cfg, &cli.workdir)?
        }
        Command::Run { path } => {
            let cfg = load_config(&config_path)?;
            cmd_run(&cfg, &path)?
        }
    };
    Ok(code as u8)
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        println!("{} already exists; use --force to overwrite.", config_path.display());
        return Ok(exit_codes::OK);
    }
    write_config(config_path, &StepwiseConfig::default())?;
    println!("Wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_parse(path: &Path) -> Result<i32> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let steps = parse_plan(&text);
    if steps.is_empty() {
        eprintln!("no steps could be parsed from {}", path.display());
        return Ok(exit_codes::INVALID);
    }
    let json = serde_json::to_string_pretty(&steps).context("serialize steps")?;
    println!("{json}");
    Ok(exit_codes::OK)
}

fn cmd_repl(cfg: &StepwiseConfig, workdir: &Path) -> Result<i32> {
    let interrupt = Interrupt::new();
    interrupt.install()?;
    let mut session = Session::from_config(cfg, workdir, interrupt)?;
    let mut console = ConsoleOperator::new()?;
    run_repl(&mut session, &mut console)?;
    Ok(exit_codes::OK)
}

fn cmd_run(cfg: &StepwiseConfig, path: &Path) -> Result<i32> {
    let code = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let in_process = path.extension().is_some_and(|ext| ext == "wat");

    let interrupt = Interrupt::new();
    interrupt.install()?;
    let resolver = DependencyResolver::new(
        MissingDependency::new(&cfg.dependencies.pattern)?,
        cfg.dependencies.installer.clone(),
        Duration::from_secs(cfg.dependencies.timeout_secs),
    );
    let executor = ScriptExecutor::new(
        cfg.script.interpreter.clone(),
        cfg.script.env.clone(),
        cfg.script.language.as_str(),
        resolver,
        interrupt,
    )?;
    let codegen = CommandCollaborator::new(
        cfg.collaborators.codegen.clone(),
        Duration::from_secs(cfg.collaborators.timeout_secs),
        cfg.collaborators.output_limit_bytes,
        &cfg.marker,
        cfg.script.language.as_str(),
    )?;
    let mut operator = ConsoleOperator::new()?;

    let request = ExecRequest {
        code: &code,
        fix_instruction: "Make this script run without errors.",
        prior_context: "",
        target: (!in_process).then_some(path),
        plan_context: None,
    };
    info!(path = %path.display(), in_process, "one-off run");
    let outcome = executor.execute(&request, &codegen, &mut operator)?;

    if outcome.was_auto_fixed {
        let fixed = fixed_path(path);
        fs::write(&fixed, &outcome.code_after)
            .with_context(|| format!("write {}", fixed.display()))?;
        println!("Repaired code written to {}", fixed.display());
    }

    Ok(match outcome.status {
        RunStatus::Succeeded => exit_codes::OK,
        RunStatus::Exited(code) => {
            info!(code, "script stopped itself");
            exit_codes::OK
        }
        RunStatus::Interrupted => exit_codes::INTERRUPTED,
        RunStatus::NoCode => {
            eprintln!("{} is empty", path.display());
            exit_codes::INVALID
        }
        RunStatus::DependencyInstalled(module) => {
            println!("Installed {module}; run again.");
            exit_codes::EXEC_FAILED
        }
        RunStatus::CompileError(msg) | RunStatus::RuntimeError(msg) => {
            eprintln!("{msg}");
            exit_codes::EXEC_FAILED
        }
    })
}

/// `<path>.fixed`, beside the original.
fn fixed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".fixed");
    PathBuf::from(name)
}
