use clap::{Parser, Subcommand};
use glm_relay::auth::TokenCache;
use glm_relay::cli::AppConfig;
use glm_relay::providers::GlmClient;
use glm_relay::server;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "glm-relay")]
#[command(about = "OpenAI-compatible relay for the ChatGLM web assistant", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults to ~/.glm-relay/config.toml)
    #[arg(short, long, env = "GLM_RELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay service
    Start {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Write the default configuration file
    Init,
    /// Check whether a refresh token can still log in
    CheckToken {
        /// ChatGLM refresh token
        token: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => AppConfig::default_path().unwrap_or_else(|_| PathBuf::from("config/default.toml")),
    };

    match cli.command {
        Commands::Start { port } => {
            let mut config = AppConfig::from_file(&config_path)?;
            if let Some(port) = port {
                config.server.port = port;
            }

            tracing::info!("Starting glm-relay on port {}", config.server.port);
            println!("🚀 glm-relay v{}", env!("CARGO_PKG_VERSION"));
            println!("📡 Starting server on {}:{}", config.server.host, config.server.port);
            println!("🔗 Upstream: {}", config.upstream.base_url);
            println!();
            println!("Press Ctrl+C to stop");

            server::start_server(config).await?;
        }
        Commands::Init => {
            AppConfig::write_default(&config_path)?;
            println!("✅ Wrote default configuration to {}", config_path.display());
        }
        Commands::CheckToken { token } => {
            let config = AppConfig::from_file(&config_path)?;
            let client = Arc::new(GlmClient::new(&config.upstream)?);
            let tokens = TokenCache::new(client, config.upstream.token_ttl());
            if tokens.is_live(&token).await {
                println!("✅ Token is live");
            } else {
                println!("❌ Token is not live");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
