//! Gateway CLI

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use llm_gateway::config::GatewayConfig;
use llm_gateway::server::run_server;

#[derive(Parser)]
#[command(name = "llm-gateway")]
#[command(about = "LLM API gateway with semantic caching and request coalescing")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway server
    Run {
        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// SQLite database for agent runs (overrides the environment)
        #[arg(long)]
        database_path: Option<std::path::PathBuf>,
    },

    /// Check the health of a running gateway
    Health {
        #[arg(default_value = "127.0.0.1")]
        host: String,

        #[arg(default_value = "3000")]
        port: u16,
    },

    /// Print version information
    Version,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("llm_gateway=info,tower_http=info"));

    // With GATEWAY_LOG_DIR set, logs also go to a daily-rotated file.
    if let Ok(dir) = std::env::var("GATEWAY_LOG_DIR") {
        let appender = tracing_appender::rolling::daily(dir, "llm-gateway.log");
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(appender)
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { port, host, database_path } => {
            init_tracing();
            let mut config = GatewayConfig::from_env();
            if let Some(path) = database_path {
                config.database_path = path;
            }
            run_server(config, &host, port).await
        }
        Commands::Health { host, port } => {
            let url = format!("http://{host}:{port}/health");
            let response = reqwest::get(&url).await?;
            let status = response.status();
            let body: serde_json::Value = response.json().await?;
            println!("{status}: {body}");
            Ok(())
        }
        Commands::Version => {
            println!("llm-gateway {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
