//! Run a deep-research session from the command line and print the answer.
//!
//! Configuration comes from environment variables layered over an optional
//! `config.json` (see [`trawl_rs::config::Settings`]).
//!
//! # Examples
//!
//! ```sh
//! # Basic research run
//! trawl --question "what is the tallest building completed in 2024?"
//!
//! # With an explicit config file and a tighter budget
//! trawl --question "latest stable rust release" \
//!   --config ./config.json --token-budget 200000
//!
//! # Deterministic run with step artifacts for inspection
//! trawl --question "compare tokio and async-std" \
//!   --seed 7 --artifacts ./debug-artifacts
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;
use trawl_rs::agent::researcher::{Researcher, ResearcherOptions};
use trawl_rs::actions::StepAction;
use trawl_rs::config::Settings;

/// Run a deep-research session and print the markdown answer.
#[derive(Parser)]
#[command(name = "trawl", version)]
struct Cli {
    /// The question to research
    #[arg(long)]
    question: String,

    /// Path to config.json
    #[arg(long)]
    config: Option<PathBuf>,

    // ── Budgets ────────────────────────────────────────────────
    /// Total token budget for the session
    #[arg(long, default_value_t = 1_000_000)]
    token_budget: u64,

    /// Rejected answers tolerated before beast mode
    #[arg(long, default_value_t = 3)]
    max_bad_attempts: u32,

    // ── Output control ─────────────────────────────────────────
    /// Maximum URLs reported in the outcome
    #[arg(long, default_value_t = 100)]
    num_urls: usize,

    /// Disable the step-1 direct-answer shortcut
    #[arg(long)]
    no_direct_answer: bool,

    /// Print the visited-URL list after the answer
    #[arg(long)]
    show_urls: bool,

    // ── Debugging ──────────────────────────────────────────────
    /// RNG seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Directory for per-step debug artifacts
    #[arg(long)]
    artifacts: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e}");
            process::exit(1);
        }
    };

    let researcher = match Researcher::from_settings(&settings) {
        Ok(researcher) => researcher,
        Err(e) => {
            eprintln!("failed to build researcher: {e}");
            process::exit(1);
        }
    };

    let options = ResearcherOptions {
        token_budget: Some(cli.token_budget),
        max_bad_attempts: Some(cli.max_bad_attempts),
        num_returned_urls: Some(cli.num_urls),
        no_direct_answer: cli.no_direct_answer,
        seed: cli.seed,
        artifacts_dir: cli.artifacts,
        ..Default::default()
    };

    let outcome = match researcher.run(&cli.question, options).await {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("research failed: {e}");
            process::exit(1);
        }
    };

    match &outcome.result.action {
        StepAction::Answer { is_final, .. } => {
            if !is_final {
                eprintln!("note: budget exhausted before a final answer; best effort follows");
            }
            println!("{}", outcome.md_answer());
        }
        other => {
            eprintln!(
                "no answer produced (last action: {}): {}",
                other.name(),
                outcome.result.think,
            );
            process::exit(2);
        }
    }

    if cli.show_urls && !outcome.read_urls.is_empty() {
        println!("\nSources read:");
        for url in &outcome.read_urls {
            println!("- {url}");
        }
    }
}
