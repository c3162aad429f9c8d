//! llm-router - provider-agnostic chat completion router
//!
//! A local server that accepts OpenAI-style chat requests and routes them
//! to OpenAI- or Anthropic-style providers by model name.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llm_router::config::{Config, KeySource};
use llm_router::providers::{anthropic, openai, ProviderKind};

#[derive(Parser)]
#[command(name = "llm-router")]
#[command(about = "Route chat completions to OpenAI- and Anthropic-style providers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the router server
    Serve {
        /// Path to configuration file (defaults plus environment when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show configured providers and where their keys come from
    Providers {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("llm_router={level},tower_http={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn log_key_sources(key_sources: &[(ProviderKind, KeySource)]) {
    for (kind, source) in key_sources {
        match source {
            KeySource::None => tracing::info!(provider = %kind, "No API key found"),
            _ => tracing::info!(provider = %kind, source = %source, "API key resolved"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let (mut config, key_sources) = Config::load(config.as_ref())?;
            init_tracing(&config.logging.level);
            log_key_sources(&key_sources);

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                config.server.listen = addr;
            }

            llm_router::proxy::run_server(config).await
        }

        Commands::Check { config } => {
            init_tracing("info");
            let (config, key_sources) = Config::load(config.as_ref())?;
            log_key_sources(&key_sources);

            println!("Configuration OK");
            println!("  listen:          {}", config.server.listen);
            println!("  request timeout: {}s", config.server.request_timeout_secs);
            Ok(())
        }

        Commands::Providers { config } => {
            init_tracing("warn");
            let (config, key_sources) = Config::load(config.as_ref())?;

            for (kind, source) in key_sources {
                let settings = config.providers.get(kind);
                let base_url = settings.base_url.as_deref().unwrap_or(match kind {
                    ProviderKind::OpenAi => openai::DEFAULT_BASE_URL,
                    ProviderKind::Anthropic => anthropic::DEFAULT_BASE_URL,
                });
                let status = if settings.api_key.is_some() {
                    "registered"
                } else {
                    "not registered"
                };
                println!(
                    "{:<10} {:<15} key: {:<28} {}",
                    kind.to_string(),
                    status,
                    source.to_string(),
                    base_url
                );
            }
            Ok(())
        }
    }
}
