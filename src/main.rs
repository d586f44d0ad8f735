use std::{path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use learnvibe_gateway::{
    config::{GatewayConfig, GatewayConfigValidator, load_config},
    metrics, server, tracing_setup,
    utils::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Write a commented default configuration file
    Init {
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve_command(&config).await,
        None => serve_command(&args.config).await,
    }
}

async fn serve_command(config_path: &str) -> Result<()> {
    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;
    GatewayConfigValidator::validate(&config)
        .map_err(|e| eyre!("Invalid configuration in {config_path}:\n{e}"))?;

    tracing_setup::init_tracing(&config.logging).context("Failed to initialize tracing")?;
    metrics::init_metrics().context("Failed to initialize metrics")?;
    tracing::info!("Loaded configuration from {config_path}");

    let shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    let result = server::serve(config, shutdown).await;
    tracing_setup::shutdown_tracing();
    result
}

async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");
    if !Path::new(config_path).exists() {
        println!("Note: '{config_path}' not found, validating defaults and environment overrides");
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("Configuration validation: OK");
            println!();
            print_summary(&config);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

fn print_summary(config: &GatewayConfig) {
    println!("Configuration Summary:");
    println!("   - Listen Address: {}", config.listen_addr);
    println!(
        "   - Primary: {} ({})",
        config.backends.primary.name, config.backends.primary.url
    );
    println!(
        "   - Content: {} ({})",
        config.backends.content.name, config.backends.content.url
    );
    println!("   - Routes: {}", config.routes.len());
    if config.rate_limit.enabled {
        println!(
            "   - Rate Limit: {} rps, burst {}",
            config.rate_limit.requests_per_second, config.rate_limit.burst
        );
    } else {
        println!("   - Rate Limit: disabled");
    }
    println!(
        "   - Circuit Breaker: trips at {} of >= {} requests, open for {}s",
        config.circuit_breaker.failure_ratio,
        config.circuit_breaker.min_requests,
        config.circuit_breaker.timeout_secs
    );
}

const DEFAULT_CONFIG: &str = r#"# Gateway configuration
# Every key is optional; values below are the built-in defaults.
# Any key can be overridden from the environment, e.g.
#   GATEWAY__BACKENDS__PRIMARY__URL=http://cms:8080

listen_addr = "0.0.0.0:8000"

# Deadline for one proxied request, retries included
request_timeout_secs = 30
max_body_bytes = 10485760

[backends.primary]
name = "CMS Service"
url = "http://localhost:8080"
health_path = "/health"

[backends.content]
name = "Content Service"
url = "http://localhost:8082"
health_path = "/health"

# Longest matching prefix wins; unmatched paths use [fallback]
[[routes]]
prefix = "/auth"
backend = "primary"

[[routes]]
prefix = "/api/courses"
backend = "primary"

[[routes]]
prefix = "/api/enrollments"
backend = "primary"

[[routes]]
prefix = "/api/admin"
backend = "primary"

[[routes]]
prefix = "/api/content"
backend = "content"

[[routes]]
prefix = "/public/content"
backend = "content"
# strip_prefix = true

[fallback]
content_prefixes = ["/api/content", "/public/content"]

[rate_limit]
enabled = true
requests_per_second = 100
burst = 60
# Only enable behind a trusted load balancer
trust_forwarded_headers = false
on_missing_key = "allow"
sweep_interval_secs = 60

[circuit_breaker]
max_requests = 5
interval_secs = 30
timeout_secs = 10
min_requests = 5
failure_ratio = 0.5

[retry]
initial_interval_ms = 500
multiplier = 1.5
randomization_factor = 0.5
max_interval_ms = 2000
max_elapsed_ms = 5000

[health_check]
endpoint = "/health"
probe_timeout_secs = 3
aggregate_timeout_secs = 5

[logging]
level = "info"
json = true
"#;

async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    tokio::fs::write(path, DEFAULT_CONFIG)
        .await
        .context("Failed to write config file")?;
    println!("Created default configuration at: {config_path}");
    println!("   Run 'learnvibe-gateway serve --config {config_path}' to start the gateway");
    Ok(())
}
