mod auth;
mod cache;
mod cli;
mod config;
mod error;
mod git;
mod models;
mod monitor;
mod providers;
mod tui;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use crate::cache::Cache;
use crate::cli::Cli;
use crate::config::Configuration;

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(err) = run().await {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let paths = Configuration::default_paths();
    let (config, found) = Configuration::from_paths(&paths)?;
    if !found {
        eprintln!(
            "warning: no configuration file found at {}, using default configuration \
             without credentials. Unauthenticated API clients are heavily rate limited \
             and cannot see private repositories.",
            paths
                .first()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        );
    }
    if config
        .providers
        .gitlab
        .iter()
        .any(|p| p.token.is_none() && p.token_from_process.is_none())
    {
        eprintln!("warning: cimon cannot access pipeline jobs on GitLab without an API token");
    }

    let (source_providers, ci_providers) =
        providers::from_config(&config).context("configuration error")?;
    let cache = Cache::new(ci_providers, source_providers);

    let repository = match cli.repository {
        Some(repository) => repository,
        None => std::env::current_dir()
            .context("failed to determine the current directory")?
            .display()
            .to_string(),
    };
    let commit = cli.commit.unwrap_or_else(|| "HEAD".to_owned());

    info!("monitoring {commit} of {repository}");
    tui::app::run(cache, repository, commit).await?;

    Ok(())
}
