//! Prometheus exporter for Keenetic routers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use keenetic_exporter::config::{LogFormat, load_env_file};
use keenetic_exporter::session::{FileSessionStore, MemorySessionStore, SessionStore};
use keenetic_exporter::{
    Credentials, ExporterConfig, HttpServer, KeeneticClient, MetricStore, Poller,
    TransformRegistry,
};

/// Prometheus exporter for Keenetic routers.
///
/// Environment variables may also come from a `.env` file in the working
/// directory; variables already set in the environment take precedence.
#[derive(Parser, Debug)]
#[command(name = "keenetic-exporter")]
#[command(about = "Export Keenetic router statistics as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long, default_value = "config/metrics.json5")]
    config: String,

    /// Router admin endpoint, e.g. http://192.168.1.1 (overrides config).
    #[arg(long, env = "KEENETIC_HOST")]
    host: Option<String>,

    /// Router login (overrides config).
    #[arg(long, env = "KEENETIC_USERNAME")]
    username: Option<String>,

    /// Router password (overrides config).
    #[arg(long, env = "KEENETIC_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Skip the login handshake.
    #[arg(long, env = "KEENETIC_SKIP_AUTH")]
    skip_auth: bool,

    /// HTTP listen address (overrides config).
    #[arg(long, env = "METRICS_LISTEN")]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error). Defaults to the config value.
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut ExporterConfig) {
        if let Some(host) = self.host {
            config.router.endpoint = host;
        }
        if let Some(username) = self.username {
            config.router.username = username;
        }
        if let Some(password) = self.password {
            config.router.password = password;
        }
        if self.skip_auth {
            config.router.skip_auth = true;
        }
        if let Some(listen) = self.listen {
            config.prometheus.listen = listen;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

fn init_logging(config: &ExporterConfig) -> anyhow::Result<()> {
    let log_level = config.logging.level.parse().unwrap_or(Level::INFO);
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("keenetic_exporter={}", log_level).parse()?)
        .add_directive(format!("hyper={}", Level::WARN).parse()?)
        .add_directive(format!("reqwest={}", Level::WARN).parse()?);

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Variables from `.env` feed the `env` fallbacks of the arguments below.
    let env_file = load_env_file(".env");
    let args = Args::parse();

    let mut config = ExporterConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;
    args.apply(&mut config);
    config.validate()?;

    init_logging(&config)?;

    match env_file {
        Ok(true) => info!("Loaded environment from .env"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "Ignoring unreadable .env file"),
    }

    info!(
        endpoint = %config.router.endpoint,
        groups = config.groups.len(),
        "Starting Keenetic exporter"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let session_store: Arc<dyn SessionStore> = match &config.session.path {
        Some(path) => {
            info!(path = %path.display(), "Persisting session cookies");
            Arc::new(FileSessionStore::new(path.clone()))
        }
        None => Arc::new(MemorySessionStore::new()),
    };

    let credentials = Credentials::new(
        config.router.endpoint.clone(),
        config.router.username.clone(),
        config.router.password.clone(),
    )
    .with_skip_auth(config.router.skip_auth);

    let client = KeeneticClient::with_timeout(
        credentials,
        session_store,
        Duration::from_secs(config.router.timeout_secs),
    )?;

    let store = Arc::new(MetricStore::new(
        config.prometheus.clone(),
        config.polling.clone(),
        config.filters.clone(),
    ));

    let listen_addr: SocketAddr = config
        .prometheus
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    let poller = Poller::new(
        client,
        config.groups.clone(),
        TransformRegistry::default(),
        config.prometheus.prefix.clone(),
        store.clone(),
        Duration::from_secs(config.polling.interval_secs),
    );
    let http_server = HttpServer::bind(store.clone(), listen_addr, &config.prometheus.path).await?;

    let poller_task = tokio::spawn(poller.run(shutdown_rx.clone()));

    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    wait_for_signal().await;

    shutdown_tx.send(true)?;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = poller_task.await;
        let _ = http_task.await;
    })
    .await;

    let stats = store.stats();
    info!(
        polls_total = stats.polls_total,
        poll_errors_total = stats.poll_errors_total,
        samples_accepted = stats.samples_accepted,
        samples_filtered = stats.samples_filtered,
        series_count = store.series_count(),
        "Final statistics"
    );

    info!("Exporter stopped");
    Ok(())
}
