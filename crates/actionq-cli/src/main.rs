mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{event::EventSubcommand, program::ProgramSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "actionq",
    about = "Action program queue: schedule, watch, and run declarative wallet programs",
    version,
    propagate_version = true
)]
struct Cli {
    /// Data root (default: auto-detect from .actionq/)
    #[arg(long, global = true, env = "ACTIONQ_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .actionq/ with a default config and a sample wallet fixture
    Init,

    /// Add, inspect, and cancel programs
    Program {
        #[command(subcommand)]
        subcommand: ProgramSubcommand,
    },

    /// Signal push events that programs wait on
    Event {
        #[command(subcommand)]
        subcommand: EventSubcommand,
    },

    /// Run the scheduler against the simulated account
    Run {
        /// Tick once and exit
        #[arg(long)]
        once: bool,

        /// Wallet fixture to load and write back (default: .actionq/fixture.yaml)
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Program { subcommand } => cmd::program::run(&root, subcommand, cli.json),
        Commands::Event { subcommand } => cmd::event::run(&root, subcommand, cli.json),
        Commands::Run { once, fixture } => cmd::run::run(&root, once, fixture.as_deref(), cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
