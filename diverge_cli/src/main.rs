mod signals;

use anyhow::Context;
use clap::Parser;
use diverge_core::archive::ArchiveId;
use diverge_core::campaign::Campaign;
use diverge_core::config::CampaignConfig;
use diverge_core::process::SystemRunner;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::PathBuf;
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "diverge.toml";

/// Differential fuzzing of a compiler backend against a reference toolchain.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Campaign configuration (TOML). Falls back to ./diverge.toml, then built-in defaults.
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    /// Execution engine for target artifacts, as named under [engines].
    #[clap(long)]
    engine: Option<String>,
    /// Seed for every random draw in the campaign.
    #[clap(long)]
    seed: Option<u64>,
    /// Stop after this many iterations instead of running until interrupted.
    #[clap(short = 'n', long)]
    max_iterations: Option<u64>,
    #[clap(long, default_value = "info")]
    log_level: String,
    /// Replay an archived reproducer (e.g. newfail_4242_0) and exit.
    #[clap(long, value_name = "ID")]
    replay: Option<String>,
}

fn init_logging(level: &str) {
    let filter = format!("diverge={level},diverge_core={level}");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<CampaignConfig, anyhow::Error> {
    match &cli.config {
        Some(config_path) => {
            info!(?config_path, "Loading configuration from specified path");
            CampaignConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG);
            if default_config_path.exists() {
                info!(?default_config_path, "No config file specified, loading default");
                CampaignConfig::load_from_file(&default_config_path)
            } else {
                info!("No config file specified and no {DEFAULT_CONFIG} found, using built-in defaults");
                Ok(CampaignConfig::default())
            }
        }
    }
}

fn apply_overrides(config: &mut CampaignConfig, cli: &Cli) -> Result<(), anyhow::Error> {
    if let Some(engine) = &cli.engine {
        config.target.engine = engine.clone();
    }
    if let Some(seed) = cli.seed {
        config.campaign.seed = Some(seed);
    }
    if let Some(max_iterations) = cli.max_iterations {
        config.campaign.max_iterations = Some(max_iterations);
    }
    config
        .validate()
        .context("Invalid configuration after command-line overrides")?;
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let mut config = load_config(&cli)?;
    apply_overrides(&mut config, &cli)?;

    let seed = config.campaign.seed.unwrap_or_else(rand::random);
    info!(
        seed,
        engine = %config.target.engine,
        archive = ?config.campaign.archive_dir,
        "Starting campaign"
    );
    let rng = ChaCha8Rng::seed_from_u64(seed);
    let mut campaign = Campaign::new(&config, SystemRunner::new(), rng)?;
    campaign.preflight()?;

    if let Some(id) = &cli.replay {
        let reproducer = campaign
            .archive()
            .load(&ArchiveId::from(id.as_str()))
            .with_context(|| format!("Failed to load reproducer {id}"))?;
        let report = campaign.replay(&reproducer)?;
        if report.verdict != reproducer.metadata.verdict {
            warn!(
                recorded = %reproducer.metadata.verdict,
                replayed = %report.verdict,
                "Replay verdict differs from the recorded one"
            );
        }
        println!("{id}: {} ({})", report.verdict, report.detail);
        return Ok(());
    }

    signals::install();
    let stats = campaign.run(signals::cancel_flag())?;
    println!("Campaign finished: {stats}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn overrides_replace_config_values() {
        let cli = Cli::parse_from(["diverge", "--seed", "9", "-n", "25"]);
        let mut config = CampaignConfig::default();
        apply_overrides(&mut config, &cli).unwrap();
        assert_eq!(config.campaign.seed, Some(9));
        assert_eq!(config.campaign.max_iterations, Some(25));
        assert_eq!(config.target.engine, "node");
    }

    #[test]
    fn unknown_engine_override_is_rejected() {
        let cli = Cli::parse_from(["diverge", "--engine", "d8"]);
        let mut config = CampaignConfig::default();
        let err = apply_overrides(&mut config, &cli).unwrap_err();
        assert!(format!("{err:#}").contains("d8"));
    }
}
