//! Chaos Emitter binary entry point

use anyhow::{Context, Result as AnyhowResult};
use clap::Parser;
use tracing::info;

use chaos_emitter::{
    handle_generate_config, handle_validate, handle_version, init_logging, Cli, Commands, Emitter,
    EmitterConfig, PatternConfig, EMITTER_FULL_NAME, EMITTER_VERSION,
};

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Handle subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output, pattern }) => {
            handle_generate_config(output.as_deref(), *pattern)?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, &cli.pattern_config, *verbose)?;
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    // Load configuration
    let mut config = EmitterConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    cli.apply_overrides(&mut config);

    let pattern = PatternConfig::load_or_disabled(&cli.pattern_config).with_context(|| {
        format!(
            "Failed to load pattern schedule from {}",
            cli.pattern_config.display()
        )
    })?;

    // Initialize logging; the guards flush the file sinks on exit
    let _log_guards = init_logging(&config.logging)?;

    info!("🌀 {} v{}", EMITTER_FULL_NAME, EMITTER_VERSION);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let emitter = Emitter::new(config, pattern).context("Failed to assemble emitter")?;
    emitter.run().await?;

    Ok(())
}
