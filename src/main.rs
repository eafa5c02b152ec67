//! Shepherd - Issue and Pull Request Triage Bot
//!
//! Command-line entry point: loads configuration, wires the remote client,
//! governor, and CI provider together, and runs the triage loop.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::error;
use tracing_subscriber::EnvFilter;

use shepherd::ci;
use shepherd::config::TriageConfig;
use shepherd::governor::{GovernorConfig, QuotaStore, RetryGovernor};
use shepherd::remote::HttpRemote;
use shepherd::triage::{TriageLoop, TriageOptions};

#[derive(Parser)]
#[command(name = "shepherd")]
#[command(version = "0.1.0")]
#[command(about = "Issue and pull request triage with rate-governed remote calls", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Config file (defaults to ./shepherd.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the triage loop over open items
    Triage {
        /// Item numbers to triage (all open items when omitted)
        items: Vec<u64>,

        /// CI provider the repository uses
        #[arg(long, value_parser = clap::builder::PossibleValuesParser::new(ci::VALID_CI_PROVIDERS.to_vec()))]
        ci: Option<String>,

        /// Skip items whose update timestamp has not changed
        #[arg(long)]
        skip_no_update: bool,

        /// Stop after caching item state, before reconciliation
        #[arg(long)]
        collect_only: bool,

        /// Only process issues
        #[arg(long, conflicts_with = "only_prs")]
        only_issues: bool,

        /// Only process pull requests
        #[arg(long)]
        only_prs: bool,
    },

    /// Show or validate configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate the configuration and exit
    Validate,
    /// Print the resolved configuration
    Show,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "shepherd=debug" } else { "shepherd=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match TriageConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "configuration error");
            eprintln!("{} {err}", "error:".red().bold());
            return ExitCode::from(1);
        }
    };

    let result = match cli.command {
        Commands::Triage {
            items,
            ci,
            skip_no_update,
            collect_only,
            only_issues,
            only_prs,
        } => {
            run_triage(
                config,
                items,
                ci,
                TriageOptions {
                    skip_no_update,
                    collect_only,
                    only_issues,
                    only_prs,
                },
            )
            .await
        }
        Commands::Config { action } => run_config(config, action),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "fatal error");
            eprintln!("{} {err}", "error:".red().bold());
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

async fn run_triage(
    mut config: TriageConfig,
    items: Vec<u64>,
    ci_override: Option<String>,
    options: TriageOptions,
) -> shepherd::Result<()> {
    if let Some(provider) = ci_override {
        config.ci_provider = provider;
        config.validate()?;
    }

    let token = config.token().unwrap_or_default();
    let remote = Arc::new(HttpRemote::new(config.remote_url.clone(), token));
    let governor = Arc::new(RetryGovernor::new(
        remote.clone(),
        Some(QuotaStore::new(config.quota_path())),
        GovernorConfig::default(),
    ));
    let provider = ci::create_provider(&config.ci_provider, &config)?;

    let looper = TriageLoop::new(remote, governor, Some(provider), config, options);
    let summary = looper.run(&items).await?;

    println!(
        "{} {} triaged, {} skipped, {} collected, {} failed ({} redo cycles)",
        "done:".green().bold(),
        summary.triaged,
        summary.skipped,
        summary.collected,
        summary.failed,
        summary.redos
    );
    if summary.failed > 0 {
        println!(
            "{} {} item(s) hit policy conflicts or remote failures, see log",
            "note:".yellow().bold(),
            summary.failed
        );
    }
    Ok(())
}

fn run_config(config: TriageConfig, action: ConfigAction) -> shepherd::Result<()> {
    match action {
        ConfigAction::Validate => {
            config.validate()?;
            println!("{} configuration valid", "ok:".green().bold());
        }
        ConfigAction::Show => {
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| shepherd::ShepherdError::config(e.to_string()))?;
            print!("{rendered}");
        }
    }
    Ok(())
}
