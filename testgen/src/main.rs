//! `testgen` CLI: drive a coding agent through a test-generation run.
//!
//! Configuration lives in `testgen.toml` at the workspace root. Reports are
//! written under the configured report directories.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use testgen::cancel::CancellationToken;
use testgen::core::extract::{ExtractContext, extract_execution_result};
use testgen::core::sanitize::sanitize;
use testgen::exit_codes;
use testgen::io::agent_cli::CliAgentProvider;
use testgen::io::cleanup::cleanup_stray_artifacts;
use testgen::io::command_runner::ShellCommandRunner;
use testgen::io::config::{CONFIG_FILE_NAME, RunConfiguration, load_config, write_config};
use testgen::io::notify::StderrNotifier;
use testgen::io::output_log::OutputLog;
use testgen::io::worktree::GitWorktreeIsolation;
use testgen::logging;
use testgen::run::{Collaborators, RunRequest, run_generation};

#[derive(Parser)]
#[command(
    name = "testgen",
    version,
    about = "Generate, run, and report tests with a coding agent"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `testgen.toml` into the workspace.
    Init {
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Run perspectives, generation, and test execution.
    Run {
        /// File containing the generation prompt.
        #[arg(long)]
        prompt_file: PathBuf,
        /// Config file (defaults to `<workspace>/testgen.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
        /// Agent model override.
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        run_id: Option<String>,
        /// Also append the output log to this file.
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Extract a test execution result from an agent log and print it as JSON.
    Extract {
        log: PathBuf,
        /// Exit code to report when the log has no usable result.
        #[arg(long)]
        fallback_exit_code: Option<i32>,
    },
    /// Print a sanitized copy of an agent log.
    Sanitize { file: PathBuf },
    /// Remove stray perspective files from the workspace root.
    Cleanup {
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { workspace, force } => cmd_init(&workspace, force),
        Command::Run {
            prompt_file,
            config,
            workspace,
            model,
            run_id,
            log_file,
        } => cmd_run(RunArgs {
            prompt_file,
            config,
            workspace,
            model,
            run_id,
            log_file,
        }),
        Command::Extract {
            log,
            fallback_exit_code,
        } => cmd_extract(&log, fallback_exit_code),
        Command::Sanitize { file } => cmd_sanitize(&file),
        Command::Cleanup { workspace } => cmd_cleanup(&workspace),
    }
}

fn cmd_init(workspace: &Path, force: bool) -> Result<i32> {
    let path = workspace.join(CONFIG_FILE_NAME);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(&path, &RunConfiguration::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

struct RunArgs {
    prompt_file: PathBuf,
    config: Option<PathBuf>,
    workspace: PathBuf,
    model: Option<String>,
    run_id: Option<String>,
    log_file: Option<PathBuf>,
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let workspace = fs::canonicalize(&args.workspace)
        .with_context(|| format!("resolve workspace {}", args.workspace.display()))?;
    let config_path = args
        .config
        .unwrap_or_else(|| workspace.join(CONFIG_FILE_NAME));
    let config = load_config(&config_path)?;
    let prompt = fs::read_to_string(&args.prompt_file)
        .with_context(|| format!("read prompt {}", args.prompt_file.display()))?;
    let log = match &args.log_file {
        Some(path) => OutputLog::with_file(path)?,
        None => OutputLog::new(),
    };

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel()).context("install Ctrl-C handler")?;

    let request = RunRequest {
        run_id: args.run_id.unwrap_or_else(RunRequest::generated_run_id),
        workspace_root: workspace,
        prompt,
        model: args.model,
    };
    let isolation = GitWorktreeIsolation::in_temp_dir();
    let deps = Collaborators {
        provider: &CliAgentProvider,
        command_runner: &ShellCommandRunner,
        isolation: &isolation,
        notifier: &StderrNotifier,
        log: &log,
    };
    let outcome = run_generation(&request, &config, &deps, &cancel);
    for line in log.lines() {
        println!("{line}");
    }
    Ok(exit_codes::for_outcome(&outcome))
}

fn cmd_extract(path: &Path, fallback_exit_code: Option<i32>) -> Result<i32> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let ctx = ExtractContext {
        fallback_exit_code,
        measured_duration_ms: 0,
    };
    let (result, code) = match extract_execution_result(&raw, ctx) {
        Ok(result) => (result, exit_codes::OK),
        Err(failure) => (failure.result, exit_codes::INVALID),
    };
    let payload = serde_json::to_string_pretty(&result).context("serialize result")?;
    println!("{payload}");
    Ok(code)
}

fn cmd_sanitize(path: &Path) -> Result<i32> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    println!("{}", sanitize(&raw));
    Ok(exit_codes::OK)
}

fn cmd_cleanup(workspace: &Path) -> Result<i32> {
    let workspace = fs::canonicalize(workspace)
        .with_context(|| format!("resolve workspace {}", workspace.display()))?;
    let mut code = exit_codes::OK;
    for outcome in cleanup_stray_artifacts(&workspace) {
        match (&outcome.error_message, outcome.deleted) {
            (Some(err), _) => {
                eprintln!("{}: {err}", outcome.relative_path);
                code = exit_codes::INVALID;
            }
            (None, true) => println!("deleted {}", outcome.relative_path),
            (None, false) => println!("kept {}", outcome.relative_path),
        }
    }
    Ok(code)
}
