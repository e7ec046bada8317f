//! Main entry point for the Scrim Room matchmaking service
//!
//! Loads configuration, installs logging, starts the service and shuts it
//! down gracefully on SIGINT or SIGTERM.

use anyhow::Result;
use clap::Parser;
use scrim_room::config::{validate_config, AppConfig, QueueBackendKind};
use scrim_room::service::{AppState, HealthCheck, HealthStatus, ServiceHandle};
use std::path::PathBuf;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Scrim Room - 5v5 matchmaking, challenges and map veto
#[derive(Parser)]
#[command(
    name = "scrim-room",
    version,
    about = "Matchmaking service for 5v5 scrims with map veto and hosted matches",
    long_about = "Scrim Room queues solo players and teams, forms five-a-side matches, \
                 arbitrates challenges between teams, runs a turn-based map veto and \
                 provisions matches through an external hosting API."
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Path to configuration file (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Perform health check and exit
    #[arg(long, help = "Perform a health check and exit with status code")]
    health_check: bool,

    /// Log level override
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Override log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    #[arg(long, value_name = "URL", help = "Override AMQP connection URL")]
    amqp_url: Option<String>,

    #[arg(long, help = "Log events instead of publishing them to AMQP")]
    no_amqp: bool,

    #[arg(long, value_name = "URL", help = "Use the Redis queue backend at this URL")]
    redis_url: Option<String>,

    #[arg(long, value_name = "URL", help = "Override the hosting API base URL")]
    hosting_url: Option<String>,

    /// HTTP port override
    #[arg(long, value_name = "PORT", help = "Override health and metrics port")]
    http_port: Option<u16>,

    #[arg(short, long, help = "Enable debug mode with verbose logging")]
    debug: bool,

    #[arg(
        long,
        help = "Validate configuration and exit without starting service"
    )]
    dry_run: bool,
}

/// Initialize structured logging with the configured level
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Build the service, check it once and exit with its status
async fn perform_health_check(config: AppConfig) -> Result<()> {
    info!("Performing health check...");

    let mut app_state = AppState::new(config).await?;
    let handle = app_state.handle();
    handle.set_running(true).await;

    let result = HealthCheck::check(&handle).await;
    app_state.shutdown().await?;

    match result {
        Ok(health) => {
            println!("Health Check: {}", health.status);
            for check in &health.checks {
                println!(
                    "  {}: {} ({}ms){}",
                    check.name,
                    check.status,
                    check.duration_ms,
                    check
                        .message
                        .as_deref()
                        .map(|m| format!(" - {}", m))
                        .unwrap_or_default()
                );
            }
            println!("  Players queued: {}", health.stats.players_queued);
            println!("  Active matches: {}", health.stats.active_matches);

            if health.status == HealthStatus::Healthy {
                std::process::exit(0);
            } else {
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("Health check failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Wait for shutdown signals (SIGINT, SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C) signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// Log a health summary every 30 seconds
async fn health_check_task(handle: ServiceHandle) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));

    while handle.is_running().await {
        interval.tick().await;

        match HealthCheck::check(&handle).await {
            Ok(health) => info!(
                "Health check: {} - {} players queued, {} active matches",
                health.status, health.stats.players_queued, health.stats.active_matches
            ),
            Err(e) => warn!("Health check failed: {}", e),
        }
    }
}

fn display_startup_banner(config: &AppConfig) {
    info!("Scrim Room Matchmaking Service");
    info!("   Service: {}", config.service.name);
    info!("   Log level: {}", config.service.log_level);
    info!("   Health port: {}", config.service.health_port);
    info!("   Queue backend: {:?}", config.queue.backend);
    info!("   Hosting API: {}", config.hosting.base_url);
    if config.amqp.enabled {
        info!("   AMQP: {}", config.amqp.url);
    } else {
        info!("   AMQP: disabled");
    }
    info!(
        "   Auto-match veto: {}",
        config.matchmaking.auto_match_veto
    );
    info!("   Map pool: {}", config.veto.map_pool.join(", "));
}

/// Load configuration from file or environment, then apply CLI overrides
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = if let Some(config_path) = &args.config {
        AppConfig::from_file(config_path)?
    } else {
        AppConfig::from_env()?
    };

    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }
    if args.debug {
        config.service.log_level = "debug".to_string();
    }
    if let Some(amqp_url) = &args.amqp_url {
        config.amqp.url = amqp_url.clone();
        config.amqp.enabled = true;
    }
    if args.no_amqp {
        config.amqp.enabled = false;
    }
    if let Some(redis_url) = &args.redis_url {
        config.queue.redis_url = redis_url.clone();
        config.queue.backend = QueueBackendKind::Redis;
    }
    if let Some(hosting_url) = &args.hosting_url {
        config.hosting.base_url = hosting_url.clone();
    }
    if let Some(http_port) = args.http_port {
        config.service.health_port = http_port;
    }

    validate_config(&config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args).unwrap_or_else(|e| {
        eprintln!("Configuration error: {:#}", e);
        std::process::exit(1);
    });

    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    if args.health_check {
        return perform_health_check(config).await;
    }

    if args.dry_run {
        info!("Configuration validation successful");
        display_startup_banner(&config);
        info!("Dry run completed - exiting without starting service");
        return Ok(());
    }

    display_startup_banner(&config);

    let mut app_state = match AppState::new(config.clone()).await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = app_state.start().await {
        error!("Failed to start service: {}", e);
        std::process::exit(1);
    }

    let health_task = tokio::spawn(health_check_task(app_state.handle()));

    info!("Scrim Room is running; press Ctrl+C to shut down");
    wait_for_shutdown_signal().await;

    info!("Shutdown signal received, beginning graceful shutdown...");
    health_task.abort();

    match tokio::time::timeout(config.shutdown_timeout(), app_state.shutdown()).await {
        Ok(Ok(())) => info!("Graceful shutdown completed"),
        Ok(Err(e)) => warn!("Shutdown finished with errors: {}", e),
        Err(_) => warn!("Shutdown timeout exceeded, forcing exit"),
    }

    info!("Scrim Room stopped");
    Ok(())
}
