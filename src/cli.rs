use crate::config::loader::EngineConfig;
use crate::config::types::{EventKind, ExecutionRequest, LanguageId, OutputEvent};
use crate::judge::registry;
use crate::kernel::signal::SignalHandler;
use crate::safety::workspace::{WorkspaceManager, RUN_DIR_PREFIX, SESSION_DIR_PREFIX};
use crate::session::coordinator::Coordinator;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file (defaults: $CODEBOX_CONFIG, then ./codebox.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SourceArgs {
    /// Programming language (c, cpp, java, python, javascript)
    #[arg(long)]
    language: Option<String>,
    /// Source code as string
    #[arg(long, conflicts_with = "file")]
    code: Option<String>,
    /// Read source code from a file
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run code in a fresh workspace, print the result as JSON
    Execute {
        #[command(flatten)]
        source: SourceArgs,
        /// Read an ExecutionRequest (or an array of them) as JSON from stdin
        #[arg(long, conflicts_with_all = ["language", "code", "file"])]
        json: bool,
    },
    /// Run JavaScript or Python in the embedded script sandbox, streaming events
    RunClient {
        #[command(flatten)]
        source: SourceArgs,
        /// Stop the session after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Check if all language dependencies are installed
    CheckDeps {
        /// Verbose output showing detailed version information
        #[arg(long, short)]
        verbose: bool,
    },
    /// Remove workspaces left behind by crashed runs
    Sweep {
        /// Only remove workspaces older than this many seconds
        #[arg(long, default_value_t = 3600)]
        max_age_secs: u64,
    },
}

pub fn run() -> Result<()> {
    env_logger::init();

    if !cfg!(unix) {
        anyhow::bail!("codebox requires a Unix-like system for process-group control");
    }

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Execute { source, json } => {
            let coordinator = Coordinator::new(config)?;
            if json {
                execute_json(&coordinator)
            } else {
                let request = source.into_request()?;
                let result = coordinator.execute(&request);
                println!("{}", serde_json::to_string_pretty(&result)?);
                if !result.is_success() {
                    std::process::exit(1);
                }
                Ok(())
            }
        }
        Commands::RunClient { source, timeout } => {
            let coordinator = Coordinator::new(config)?;
            let request = source.into_request()?;
            run_client(&coordinator, &request, timeout.map(Duration::from_secs))
        }
        Commands::CheckDeps { verbose } => check_language_dependencies(verbose),
        Commands::Sweep { max_age_secs } => {
            let max_age = Duration::from_secs(max_age_secs);
            for prefix in [RUN_DIR_PREFIX, SESSION_DIR_PREFIX] {
                let manager = WorkspaceManager::with_prefix(config.workspace_root.clone(), prefix)?;
                let removed = manager.sweep_stale(max_age)?;
                println!(
                    "Removed {} stale {}* workspace(s) under {}",
                    removed,
                    prefix,
                    manager.root().display()
                );
            }
            Ok(())
        }
    }
}

impl SourceArgs {
    fn into_request(self) -> Result<ExecutionRequest> {
        let language = self
            .language
            .ok_or_else(|| anyhow::anyhow!("--language is required"))?;
        let code = match (self.code, self.file) {
            (Some(code), _) => code,
            (None, Some(path)) => read_source(&path)?,
            (None, None) => anyhow::bail!("either --code or --file is required"),
        };
        Ok(ExecutionRequest::new(language, code))
    }
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn execute_json(coordinator: &Coordinator) -> Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read request from stdin")?;

    let value: serde_json::Value = serde_json::from_str(&input).context("Invalid request JSON")?;
    let success = if value.is_array() {
        let requests: Vec<ExecutionRequest> =
            serde_json::from_value(value).context("Invalid request array")?;
        let results = coordinator.execute_batch(&requests);
        println!("{}", serde_json::to_string_pretty(&results)?);
        results.iter().all(|r| r.is_success())
    } else {
        let request: ExecutionRequest = serde_json::from_value(value).context("Invalid request")?;
        let result = coordinator.execute(&request);
        println!("{}", serde_json::to_string_pretty(&result)?);
        result.is_success()
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

fn run_client(coordinator: &Coordinator, request: &ExecutionRequest, timeout: Option<Duration>) -> Result<()> {
    let signals = SignalHandler::install()?;
    let started = Instant::now();
    let mut session = coordinator.run_in_browser(&request.language, &request.code);
    let stdout = std::io::stdout();
    let mut errors = 0usize;

    let mut emit = |events: &[OutputEvent]| -> Result<()> {
        let mut out = stdout.lock();
        for event in events {
            if event.kind == EventKind::Error {
                errors += 1;
            }
            writeln!(out, "{}", serde_json::to_string(event)?)?;
        }
        out.flush()?;
        Ok(())
    };

    let mut shown = 0;
    loop {
        emit(&session.output()[shown..])?;
        shown = session.output().len();
        if session.is_finished() {
            break;
        }
        if signals.interrupted() {
            log::info!("Interrupted; stopping session {}", session.id());
            session.stop();
            break;
        }
        if timeout.map(|t| started.elapsed() >= t).unwrap_or(false) {
            log::info!("Timeout reached; stopping session {}", session.id());
            session.stop();
            break;
        }
        session.wait(Duration::from_millis(50));
    }

    let state = serde_json::json!({ "session": session.id(), "state": session.state() });
    eprintln!("{}", state);
    if errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn check_language_dependencies(verbose: bool) -> Result<()> {
    use std::process::Command;

    println!("Checking language dependencies...");
    println!();

    let mut missing_languages = Vec::new();

    for pipeline in registry::supported() {
        let mut lang_ok = true;
        let mut versions = Vec::new();

        for binary in pipeline.required_binaries() {
            let version_arg = if binary.starts_with("java") { "-version" } else { "--version" };
            match Command::new(binary).arg(version_arg).output() {
                Ok(output) if output.status.success() => {
                    let version_info = if !output.stdout.is_empty() {
                        String::from_utf8_lossy(&output.stdout)
                    } else {
                        String::from_utf8_lossy(&output.stderr)
                    }
                    .lines()
                    .next()
                    .unwrap_or("")
                    .to_string();
                    versions.push(format!("  {} -> {}", binary, version_info.trim()));
                }
                Ok(_) => {
                    lang_ok = false;
                    versions.push(format!("  {} -> FAILED", binary));
                }
                Err(_) => {
                    lang_ok = false;
                    versions.push(format!("  {} -> NOT FOUND", binary));
                }
            }
        }

        if lang_ok {
            println!("[ok]      {}", pipeline.id);
        } else {
            println!("[missing] {}", pipeline.id);
        }
        if verbose {
            for version in versions {
                println!("{}", version);
            }
            println!();
        }
        if !lang_ok {
            missing_languages.push(pipeline.id);
        }
    }

    println!();
    if missing_languages.is_empty() {
        println!("All language dependencies are installed.");
        if verbose {
            println!();
            println!("Usage examples:");
            println!("  codebox execute --language=python --code='print(\"Hello World\")'");
            println!("  codebox run-client --language=javascript --code='console.log(1 + 1)'");
        }
        Ok(())
    } else {
        let names: Vec<&str> = missing_languages.iter().map(|l: &LanguageId| l.as_str()).collect();
        anyhow::bail!("Missing language dependencies: {}", names.join(", "))
    }
}
