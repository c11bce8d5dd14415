use std::{future::IntoFuture, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use lb_proxy::{
    adapters::{
        FileConfigProvider, HealthChecker, HttpClientAdapter, HttpHandler, HyperForwarderFactory,
    },
    config::{ServerConfig, ServerConfigValidator, loader::load_config},
    core::{server::ProxyServer, stats::new_collector},
    ports::config_provider::ConfigProvider,
    tracing_setup,
    utils::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "lb.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "lb.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "lb.yaml")]
        config: String,
    },
    /// Start the load balancer (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "lb.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command.unwrap_or(Commands::Serve {
        config: args.config,
    }) {
        Commands::Validate { config } => validate_config_command(&config).await,
        Commands::Init { config } => init_config_command(&config).await,
        Commands::Serve { config } => serve(&config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    tracing_setup::init_tracing().map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    tracing::info!("Loading initial configuration from {config_path}");
    let provider: Arc<dyn ConfigProvider> = Arc::new(
        FileConfigProvider::new(config_path).context("Failed to create config provider")?,
    );
    let config = provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;
    ServerConfigValidator::validate(&config).context("Invalid configuration")?;

    let server = Arc::new(build_server(&config));
    apply_config(&server, &config).await?;

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;

    let shutdown = Arc::new(GracefulShutdown::new());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown.run_signal_handler().await {
                tracing::error!("Signal handler error: {}", e);
            }
        });
    }

    let watcher = provider
        .watch()
        .map(|rx| tokio::spawn(watch_config(provider.clone(), rx, server.clone(), config.clone())));

    let app = HttpHandler::new(server.clone()).router();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!(
        %addr,
        handlers = config.handlers.len(),
        health_checks = config.health_check.enabled,
        "load balancer listening"
    );

    let token = shutdown.token();
    let serving = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { token.cancelled().await })
    .into_future();
    let mut serving = std::pin::pin!(serving);

    tokio::select! {
        result = &mut serving => result.context("Server error")?,
        reason = shutdown.wait_for_shutdown_signal() => {
            tracing::info!(?reason, "Shutdown signal received, draining connections");
            match tokio::time::timeout(shutdown.drain_timeout(), serving).await {
                Ok(result) => result.context("Server error")?,
                Err(_) => tracing::warn!("Drain timeout exceeded, dropping open connections"),
            }
        }
    }

    if let Some(watcher) = watcher {
        watcher.abort();
    }
    server.close_all();
    tracing::info!("Graceful shutdown completed");
    Ok(())
}

fn build_server(config: &ServerConfig) -> ProxyServer {
    let server = ProxyServer::new(new_collector(config.stats), Arc::new(HyperForwarderFactory))
        .with_access_log(config.access_log);

    if config.health_check.enabled {
        let checker = HealthChecker::new(
            Arc::new(HttpClientAdapter::new()),
            config.health_check.interval(),
        );
        server.with_monitor(Arc::new(checker))
    } else {
        tracing::info!("Health checking is disabled");
        server
    }
}

/// Install handlers and the default key from `config`.
async fn apply_config(server: &ProxyServer, config: &ServerConfig) -> Result<()> {
    let definitions = config
        .definitions()
        .context("Invalid handler definition")?;
    server
        .reconcile(definitions)
        .await
        .context("Failed to apply handlers")?;
    server
        .set_default_handler(config.default_handler.clone().unwrap_or_default())
        .context("Failed to set default handler")?;
    Ok(())
}

/// Reload the configuration whenever the provider signals a change.
///
/// Listener-level settings (address, stats backend, health interval) only
/// take effect on restart; handlers are reconciled in place.
async fn watch_config(
    provider: Arc<dyn ConfigProvider>,
    mut notify_rx: tokio::sync::mpsc::Receiver<()>,
    server: Arc<ProxyServer>,
    mut current: ServerConfig,
) {
    let debounce = Duration::from_millis(500);
    tracing::info!("Config watcher task started.");

    while notify_rx.recv().await.is_some() {
        // editors emit bursts of events for one save
        tokio::time::sleep(debounce).await;
        while notify_rx.try_recv().is_ok() {}

        let config = match provider.load_config().await {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to reload configuration: {e:#}. Keeping old configuration.");
                continue;
            }
        };
        if config == current {
            tracing::debug!("Configuration unchanged");
            continue;
        }
        if let Err(e) = ServerConfigValidator::validate(&config) {
            tracing::error!("Reloaded configuration is invalid: {e}. Keeping old configuration.");
            continue;
        }
        if config.listen_addr != current.listen_addr || config.stats != current.stats {
            tracing::warn!("listen_addr and stats changes require a restart");
        }

        match apply_config(&server, &config).await {
            Ok(()) => {
                tracing::info!(handlers = config.handlers.len(), "Configuration reloaded");
                current = config;
            }
            Err(e) => tracing::error!("Failed to apply configuration: {e:#}"),
        }
    }
    tracing::info!("Config watcher task is shutting down.");
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Handlers: {}", config.handlers.len());
            for handler in &config.handlers {
                println!(
                    "     - {} ({}): {} route(s), {} host(s)",
                    handler.key,
                    handler.effective_strategy(),
                    handler.routes.len(),
                    handler.hosts.len()
                );
            }
            println!("   • Health Checks: {}", config.health_check.enabled);
            println!("   • Access Log: {}", config.access_log);
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure all targets start with http:// or https://");
            println!("   • Use humantime durations such as '5s' or '250ms'");
            println!("   • Verify listen address format (e.g., '127.0.0.1:3000')");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Load balancer configuration

listen_addr: "127.0.0.1:8080"
access_log: true
stats: noop

health_check:
  enabled: true
  interval_secs: 15
  timeout_secs: 5

# default_handler: api

handlers:
  - key: api
    strategy: rr          # rr | wrr | wrrh | rand | ip_hash
    routes: ["/api/*"]
    shutdown_wait: 5s
    dial_timeout: 2s
    response_header_timeout: 30s
    hosts:
      - target: "http://localhost:3001"
        health: "http://localhost:3001/health"
      - target: "http://localhost:3002"
        health: "http://localhost:3002/health"
        weight: 2

  - key: chat
    ip_hash: true
    routes: ["/ws/:room"]
    hosts:
      - target: "http://localhost:4001"
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'lb-proxy serve --config {config_path}' to start the load balancer");
    Ok(())
}
