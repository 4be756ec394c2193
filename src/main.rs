use moorage::admin::{AdminServer, PKG_NAME, VERSION};
use moorage::config::Config;
use moorage::descriptor::HostParser;
use moorage::guard::{scaled_background, ConcurrencyGuard};
use moorage::locale::language_from_env;
use moorage::locator::Locator;
use moorage::pool::PoolConfig;
use moorage::provisioner::Provisioner;
use moorage::proxy::ProxyServer;
use moorage::resolver::Resolver;
use moorage::runner::{CliRunner, CommandRunner};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("moorage=debug".parse()?),
        )
        .init();

    let config = load_config()?;

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner: Arc<dyn CommandRunner> = Arc::new(CliRunner::new(
        config.provisioner.git_path.clone(),
        config.provisioner.docker_path.clone(),
    ));

    let guard = Arc::new(ConcurrencyGuard::new(
        config.guard.max_background.unwrap_or_else(scaled_background),
        config.guard.max_live,
        config.guard.sample_rate,
    ));

    let resolver = Arc::new(Resolver::new(
        HostParser::new(&config.server.server_name),
        Provisioner::new(
            Arc::clone(&runner),
            config.provisioner.source_dir.clone(),
            config.provisioner.clone_scheme.clone(),
        ),
        Locator::new(Arc::clone(&runner)),
        Arc::clone(&guard),
        config.resolver.retain_provisioned,
    ));

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: config.server.pool_idle_timeout(),
    };

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::with_pool_config(
        bind_addr,
        resolver.clone(),
        shutdown_rx.clone(),
        pool_config,
    )
    .with_request_timeout(config.server.request_timeout());
    let pool_stats = proxy.pool().stats();

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    let admin_handle = if config.server.admin_port > 0 {
        let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
            .parse()
            .map_err(|e| {
                error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
                anyhow::anyhow!("Invalid admin bind address: {}", e)
            })?;

        // Generate or use configured admin token
        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });

        let admin_server = AdminServer::new(
            admin_addr,
            Arc::clone(&resolver),
            pool_stats,
            shutdown_rx.clone(),
            admin_token,
        );

        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        info!("Admin API disabled");
        None
    };

    wait_for_signal().await?;

    // Stop accepting, then let in-flight resolutions finish
    let _ = shutdown_tx.send(true);

    let drain_timeout = config.server.drain_timeout();
    info!(
        timeout_secs = drain_timeout.as_secs(),
        live = guard.live(),
        background = guard.background(),
        "Waiting for in-flight resolutions"
    );
    if tokio::time::timeout(drain_timeout, guard.drain()).await.is_err() {
        warn!(
            live = guard.live(),
            background = guard.background(),
            "Drain timed out, exiting with work in flight"
        );
    }

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Config path from the first argument. Without one, a missing `config.toml`
/// means built-in defaults.
fn load_config() -> anyhow::Result<Config> {
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if explicit.is_none() && !config_path.exists() {
        info!(path = %config_path.display(), "No configuration file, using defaults");
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    Ok(config)
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");

    let language = language_from_env();
    info!(
        language = if language.is_empty() { "unset" } else { language.as_str() },
        "Diagnostic language"
    );

    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        server_name = %config.server.server_name,
        "Server configuration"
    );
    info!(
        source_dir = %config.provisioner.source_dir.display(),
        clone_scheme = %config.provisioner.clone_scheme,
        git = %config.provisioner.git_path,
        docker = %config.provisioner.docker_path,
        "Provisioner settings"
    );
    info!(
        max_background = ?config.guard.max_background,
        max_live = config.guard.max_live,
        sample_rate = config.guard.sample_rate,
        retain_provisioned = config.resolver.retain_provisioned,
        "Concurrency settings"
    );
    info!(
        request_timeout_secs = config.server.request_timeout_secs,
        drain_timeout_secs = config.server.drain_timeout_secs,
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Request handling settings"
    );
}
