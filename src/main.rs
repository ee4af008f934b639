//! WireWarp control plane server
//!
//! Serves the REST API, the agent channel and the live status channel, and
//! runs the staleness sweeper until Ctrl+C.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wirewarp_api::{ApiServer, ApiServerConfig};
use wirewarp_auth::{JwtClaims, JwtValidator};
use wirewarp_control::{ControlConfig, ControlPlane};

/// WireWarp control plane for a fleet of WireGuard tunnels
#[derive(Parser, Debug)]
#[command(name = "wirewarp-server")]
#[command(about = "Run the WireWarp control plane", long_about = None)]
#[command(version = env!("WIREWARP_VERSION"))]
#[command(long_version = concat!(env!("WIREWARP_VERSION"), "\nCommit: ", env!("WIREWARP_GIT_HASH"), "\nBuilt: ", env!("WIREWARP_BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    server_args: ServerArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mint an operator session token for the API and live channel
    GenerateToken {
        /// JWT secret (must match the server's --jwt-secret)
        #[arg(long, env = "WIREWARP_JWT_SECRET")]
        secret: String,

        /// Operator name recorded as the token subject
        #[arg(long, default_value = "operator")]
        subject: String,

        /// Token validity in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// API server bind address (REST, agent channel, live channel)
    #[arg(long, env = "WIREWARP_API_ADDR", default_value = "0.0.0.0:8000")]
    api_addr: SocketAddr,

    #[arg(long, env = "DATABASE_URL", default_value = "sqlite::memory:")]
    database_url: String,

    /// Secret for operator sessions and agent credentials
    #[arg(long, env = "WIREWARP_JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Registration token lifetime in hours
    #[arg(long, default_value = "24")]
    token_ttl_hours: u64,

    /// Connected agents silent for longer than this are marked disconnected
    #[arg(long, default_value = "90")]
    liveness_threshold_secs: u64,

    #[arg(long, default_value = "30")]
    sweep_interval_secs: u64,

    /// Live channel queue bound per observer
    #[arg(long, default_value = "256")]
    observer_queue_cap: usize,

    /// Days of agent metric samples kept
    #[arg(long, default_value = "7")]
    metrics_retention_days: u64,

    /// Allowed CORS origins (repeatable; all origins when omitted)
    #[arg(long = "cors-origin")]
    cors_origins: Vec<String>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl ServerArgs {
    fn control_config(&self) -> ControlConfig {
        ControlConfig {
            token_ttl: Duration::from_secs(self.token_ttl_hours.saturating_mul(3600)),
            liveness_threshold: Duration::from_secs(self.liveness_threshold_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            observer_queue_capacity: self.observer_queue_cap,
            metrics_retention: Duration::from_secs(
                self.metrics_retention_days.saturating_mul(24 * 3600),
            ),
            ..ControlConfig::default()
        }
    }
}

fn generate_token(secret: &str, subject: &str, hours: i64) -> Result<()> {
    let claims = JwtClaims::session(subject.to_string(), chrono::Duration::hours(hours));
    let token = JwtValidator::encode(secret.as_bytes(), &claims)
        .map_err(|e| anyhow::anyhow!("Failed to generate token: {}", e))?;

    println!("\nSession token generated\n");
    println!("Subject:       {}", subject);
    println!("Valid for:     {} hours", hours);
    println!("Expires:       {}", claims.exp_formatted());

    println!("\n{}", "=".repeat(70));
    println!("TOKEN:");
    println!("{}", "=".repeat(70));
    println!("{}", token);
    println!("{}\n", "=".repeat(70));

    println!("Usage:");
    println!("  curl -H \"Authorization: Bearer {}\" http://localhost:8000/api/agents", token);
    println!();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(command) = cli.command {
        return match command {
            Commands::GenerateToken {
                secret,
                subject,
                hours,
            } => generate_token(&secret, &subject, hours),
        };
    }

    let args = cli.server_args;
    init_logging(&args.log_level)?;

    let jwt_secret = args
        .jwt_secret
        .clone()
        .filter(|s| !s.is_empty())
        .context("--jwt-secret (or WIREWARP_JWT_SECRET) is required")?;

    info!("Starting WireWarp control plane");
    info!("Database: {}", args.database_url);

    let db = wirewarp_db::connect(&args.database_url)
        .await
        .context("Failed to connect to database")?;
    wirewarp_db::migrate(&db)
        .await
        .context("Failed to run database migrations")?;
    info!("Database migrations applied");

    let control = ControlPlane::new(db, args.control_config(), jwt_secret.as_bytes());

    let shutdown = CancellationToken::new();
    let sweeper_handle = control.sweeper().spawn(shutdown.clone());

    let api_config = ApiServerConfig {
        bind_addr: args.api_addr,
        enable_cors: true,
        cors_origins: if args.cors_origins.is_empty() {
            None
        } else {
            Some(args.cors_origins.clone())
        },
        jwt_secret,
    };
    let api_server = ApiServer::new(api_config, control);

    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server
            .start(async move { api_shutdown.cancelled().await })
            .await
        {
            error!("API server error: {}", e);
        }
    });

    info!("Press Ctrl+C to stop");

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping..."),
        Err(err) => error!("Error listening for shutdown signal: {}", err),
    }

    shutdown.cancel();
    let _ = api_handle.await;
    let _ = sweeper_handle.await;
    info!("WireWarp control plane stopped");

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
