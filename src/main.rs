//! `sow` — thin CLI surface over the project lifecycle engine.
//!
//! Synchronous by design: the core carries no async runtime, so this
//! binary loads a project, performs one logical operation, and exits.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sow::error::SowError;
use sow::{demo_type, loader, registry};

#[derive(Parser)]
#[command(name = "sow")]
#[command(about = "Project lifecycle engine CLI")]
struct Cli {
    /// Project working directory. Defaults to $SOW_STATE_DIR, else the
    /// current directory.
    #[arg(long, env = "SOW_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the project's current state and phase summary.
    Status,

    /// Determine and fire the next event for the current state.
    Advance,

    /// Fire a specific event by name.
    Fire { event: String },

    /// List events currently permitted from the current state.
    List,

    /// Report what firing an event would do, without doing it.
    DryRun { event: Option<String> },

    /// Register the fixture project type and initialize a project here.
    DemoInit { name: String },
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let working_dir = cli.state_dir.clone().unwrap_or_else(|| PathBuf::from("."));

    match run(&cli.command, &working_dir) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: &Commands, working_dir: &std::path::Path) -> anyhow::Result<()> {
    // The fixture type is always available to the CLI; a real host
    // registers its own types here instead before calling `loader::load`.
    let _ = registry::register(demo_type::TYPE_NAME, Arc::new(demo_type::config()?));

    match command {
        Commands::DemoInit { name } => {
            let config = registry::get(demo_type::TYPE_NAME)?;
            sow::Project::initialize(
                name.clone(),
                "main",
                config,
                working_dir,
                &std::collections::HashMap::new(),
            )?;
            println!("initialized demo project '{name}' in {}", working_dir.display());
            Ok(())
        }
        Commands::Status => {
            let project = loader::load(working_dir)?;
            println!("state: {}", project.current_state());
            if let Some(prompt) = project.prompt() {
                println!("{prompt}");
            }
            for (name, phase) in project.snapshot().phases {
                println!(
                    "  phase {name}: status={} tasks={}",
                    phase.status,
                    phase.tasks.len()
                );
            }
            Ok(())
        }
        Commands::Advance => {
            let mut project = loader::load(working_dir)?;
            project.advance()?;
            println!("state: {}", project.current_state());
            Ok(())
        }
        Commands::Fire { event } => {
            let mut project = loader::load(working_dir)?;
            project.fire(event)?;
            println!("state: {}", project.current_state());
            Ok(())
        }
        Commands::List => {
            let project = loader::load(working_dir)?;
            for event in project.permitted_triggers() {
                let description = project
                    .config()
                    .transition_description(&project.current_state(), &event)
                    .unwrap_or("");
                println!("{event}\t{description}");
            }
            Ok(())
        }
        Commands::DryRun { event } => {
            let project = loader::load(working_dir)?;
            let events = match event {
                Some(e) => vec![e.clone()],
                None => project
                    .config()
                    .events_from(&project.current_state())
                    .map(str::to_string)
                    .collect(),
            };
            for event in events {
                match project.dry_run(&event) {
                    Ok(report) => println!(
                        "{} -> {}: would_fire={} {}",
                        report.event,
                        report.to,
                        report.would_fire,
                        report.guard_description.unwrap_or_default()
                    ),
                    Err(SowError::EventNotConfigured { .. }) => {
                        println!("{event}: not configured from this state");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            Ok(())
        }
    }
}
