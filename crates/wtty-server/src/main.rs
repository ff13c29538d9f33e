//! wtty-server: a web terminal.
//!
//! Hosts PTY-backed shell sessions and bridges them to browser clients over
//! WebSockets, with replay history for late-joining tabs and session logs in
//! `script(1)` format.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tracing::{error, info};
use wtty_core::{WttyError, WttyResult};

use wtty_server::config::{self, Overrides, Settings};
use wtty_server::registry::SessionRegistry;
use wtty_server::{routes, tls};

/// wtty-server — web terminal server
#[derive(Parser, Debug)]
#[command(name = "wtty-server", version, about = "Web terminal server")]
struct Cli {
    /// Bind address
    #[arg(long)]
    host: Option<String>,

    /// Bind port
    #[arg(short, long)]
    port: Option<u16>,

    /// Shell to spawn for new sessions
    #[arg(long)]
    shell: Option<String>,

    /// Command to run instead of the shell (e.g. "htop")
    #[arg(long)]
    cmd: Option<String>,

    /// Default color theme
    #[arg(long)]
    theme: Option<String>,

    /// MOTD banner: "default", "none", or a file path
    #[arg(long)]
    motd_art: Option<String>,

    /// Session log directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Disable session logging
    #[arg(long)]
    no_log: bool,

    /// Serve plain HTTP without TLS
    #[arg(long)]
    unsecure: bool,

    /// TLS certificate directory
    #[arg(long)]
    ssl_dir: Option<PathBuf>,

    /// Generate TLS certificates and exit
    #[arg(long)]
    generate_certs: bool,

    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            host: self.host.clone(),
            port: self.port,
            shell: self.shell.clone(),
            cmd: self.cmd.clone(),
            theme: self.theme.clone(),
            motd_art: self.motd_art.clone(),
            log_dir: self.log_dir.clone(),
            no_log: self.no_log,
            unsecure: self.unsecure,
            ssl_dir: self.ssl_dir.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();

    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let settings = match Settings::load(Some(&config_path), &cli.overrides()) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if cli.generate_certs {
        if let Err(e) = tls::prepare_certs(&settings.ssl_dir, &settings.host) {
            error!(error = %e, "certificate generation failed");
            std::process::exit(1);
        }
        info!(path = %settings.ssl_dir.display(), "certificates ready");
        return;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %settings.host,
        port = settings.port,
        "starting wtty-server"
    );

    let registry = SessionRegistry::new(settings.clone());
    let app = routes::build_router(registry.clone());

    tokio::select! {
        result = serve(&settings, app) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    registry.shutdown().await;
    info!("wtty-server stopped");
}

async fn serve(settings: &Settings, app: Router) -> WttyResult<()> {
    let addr = bind_addr(settings)?;
    let service = app.into_make_service_with_connect_info::<SocketAddr>();

    if settings.unsecure {
        info!("serving over plain HTTP (--unsecure)");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, service)
            .await
            .map_err(|e| WttyError::Client(format!("server failed: {e}")))
    } else {
        let Some((cert, key)) = tls::server_cert_paths(&settings.ssl_dir, &settings.host) else {
            return Err(WttyError::Config(format!(
                "TLS certificates not found in {}. Run with --generate-certs --host={} to \
                 create them, or use --unsecure to skip TLS.",
                settings.ssl_dir.display(),
                settings.host
            )));
        };
        let tls_config = RustlsConfig::from_pem_file(cert, key)
            .await
            .map_err(|e| WttyError::Config(format!("cannot load TLS certificates: {e}")))?;
        axum_server::bind_rustls(addr, tls_config)
            .serve(service)
            .await
            .map_err(|e| WttyError::Client(format!("server failed: {e}")))
    }
}

fn bind_addr(settings: &Settings) -> WttyResult<SocketAddr> {
    (settings.host.as_str(), settings.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| WttyError::Config(format!("cannot resolve bind address {}", settings.host)))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(sig) => sig,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
