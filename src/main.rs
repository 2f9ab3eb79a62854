use std::{path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use passage::{
    adapters::{server, HealthChecker, HttpClientAdapter, RequestDispatcher},
    config::{loader::load_config, ConfigValidator},
    core::GatewayService,
    metrics,
    ports::HttpClient,
    tracing_setup,
    utils::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Start the gateway (default)
    Serve {
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Validate a configuration file and exit
    Validate {
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    if command == "validate" {
        return validate_config_command(&config_path);
    }

    let config = Arc::new(
        load_config(&config_path)
            .wrap_err_with(|| format!("Failed to load config from {config_path}"))?,
    );
    ConfigValidator::validate(&config).map_err(|e| eyre!("Invalid configuration:\n{e}"))?;

    tracing_setup::init_tracing(&config.logging, &config.tracing)
        .map_err(|e| eyre!("Failed to initialize logging: {e}"))?;

    let prometheus = if config.metrics.enable {
        Some(metrics::install_recorder().map_err(|e| eyre!("Failed to initialize metrics: {e}"))?)
    } else {
        None
    };

    let gateway = Arc::new(
        GatewayService::new(&config).map_err(|e| eyre!("Service registration failed: {e}"))?,
    );
    let http_client: Arc<dyn HttpClient> = Arc::new(
        HttpClientAdapter::new(&config.proxy).wrap_err("Failed to create upstream HTTP client")?,
    );

    let dispatcher = Arc::new(RequestDispatcher::new(
        gateway.clone(),
        http_client.clone(),
        &config,
    ));

    let shutdown = Arc::new(GracefulShutdown::new(config.server.shutdown_timeout()));

    let signal_handler_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!(error = %e, "signal handler error");
        }
    });

    let health_checker = HealthChecker::new(http_client, shutdown.token());
    let prober_handles = health_checker.spawn_all(gateway.services());
    if !prober_handles.is_empty() {
        tracing::info!(probers = prober_handles.len(), "health probing enabled");
    }

    tracing::info!(port = config.server.port, "starting Passage API gateway");
    server::serve(config, dispatcher, prometheus, shutdown).await?;

    tracing::info!("gateway exited");
    Ok(())
}

fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("Error: configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path) {
        Ok(config) => {
            println!("Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("Configuration parsing failed:\n   {e}");
            std::process::exit(1);
        }
    };

    match ConfigValidator::validate(&config) {
        Ok(()) => {
            println!("Configuration validation: OK");
            println!();
            println!("Summary:");
            println!("   port: {}", config.server.port);
            println!("   services: {}", config.services.len());
            println!("   tls: {}", config.security.enable_tls);
            println!("   cache: {}", config.proxy.enable_cache);
            println!(
                "   circuit breaker: {}, retry: {}",
                config.resilience.enable_circuit_breaker, config.resilience.enable_retry
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration validation failed:\n{e}");
            std::process::exit(1);
        }
    }
}
