//! chatbridge - one stable chat-completion API over heterogeneous web chat providers
//!
//! A local server that speaks the OpenAI/Ollama chat protocol and bridges
//! each turn onto the configured upstream provider.

use chatbridge::config::{Config, ConfigError, KeySource};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chatbridge")]
#[command(about = "One stable chat-completion API over heterogeneous web chat providers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Show configured providers and the models they serve
    Providers {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

impl Commands {
    fn config_path(&self) -> &str {
        match self {
            Commands::Serve { config, .. } => config,
            Commands::Check { config } => config,
            Commands::Providers { config } => config,
        }
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("chatbridge={},tower_http=info", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn log_key_sources(key_sources: &[(String, KeySource)]) {
    for (provider, source) in key_sources {
        match source {
            KeySource::None => {
                tracing::debug!(provider = %provider, "No API key configured");
            }
            source => tracing::info!(provider = %provider, source = %source, "API key loaded"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loaded: Result<(Config, Vec<(String, KeySource)>), ConfigError> =
        Config::from_file_with_env(cli.command.config_path());
    let level = loaded
        .as_ref()
        .map(|(config, _)| config.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_tracing(&level);

    let path = cli.command.config_path().to_string();
    let (mut config, key_sources) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            tracing::error!(config = %path, error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    match cli.command {
        Commands::Serve { listen, .. } => {
            tracing::info!(config = %path, providers = config.providers.len(), "Loaded configuration");
            log_key_sources(&key_sources);

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                config.server.listen = addr;
            }

            chatbridge::proxy::run_server(config).await
        }

        Commands::Check { .. } => {
            log_key_sources(&key_sources);
            println!(
                "Configuration OK: {} provider(s), listening on {}",
                config.providers.len(),
                config.server.listen
            );
            Ok(())
        }

        Commands::Providers { .. } => {
            for (provider, (_, source)) in config.providers.iter().zip(&key_sources) {
                let models = if provider.models.is_empty() {
                    provider.name.clone()
                } else {
                    provider.models.join(", ")
                };
                println!(
                    "{:<16} {:<9} {:<8} key: {:<28} models: {}",
                    provider.name,
                    provider.kind.as_str(),
                    format!("{:?}", provider.transport).to_lowercase(),
                    source.to_string(),
                    models
                );
            }
            Ok(())
        }
    }
}
