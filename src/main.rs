use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pgrollback::config::Settings;
use pgrollback::proxy::registry::{RegistrySettings, SessionRegistry};
use pgrollback::proxy::server::ProxyServer;

#[tokio::main]
async fn main() {
    let mut args = std::env::args().skip(1);
    let mut config_path: Option<String> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let Some(path) = args.next() else {
                    eprintln!("usage: pgrollback [--config <path>]");
                    std::process::exit(2);
                };
                config_path = Some(path);
            }
            "--help" | "-h" => {
                println!("usage: pgrollback [--config <path>]");
                return;
            }
            other => {
                eprintln!("unknown argument: {other}");
                eprintln!("usage: pgrollback [--config <path>]");
                std::process::exit(2);
            }
        }
    }

    let settings = match Settings::load(config_path.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    init_logging(&settings);

    let registry = SessionRegistry::new(RegistrySettings {
        postgres_host: settings.postgres.host.clone(),
        postgres_port: settings.postgres.port,
        postgres_database: settings.postgres.database.clone(),
        postgres_user: settings.postgres.user.clone(),
        postgres_password: if settings.postgres.password.is_empty() {
            None
        } else {
            Some(settings.postgres.password.clone())
        },
        session_timeout: settings.session_timeout(),
        idle_timeout: settings.idle_timeout(),
        keepalive_interval: settings.keepalive_interval(),
    });

    let server = match ProxyServer::bind(
        &settings.proxy.listen_host,
        settings.proxy.listen_port,
        registry.clone(),
    )
    .await
    {
        Ok(server) => server,
        Err(err) => {
            eprintln!(
                "failed to listen on {}:{}: {err}",
                settings.proxy.listen_host, settings.proxy.listen_port
            );
            std::process::exit(1);
        }
    };

    let cleanup_task = registry.spawn_cleanup_task();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_task = tokio::spawn(server.run(shutdown_rx));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(err) => info!(error = %err, "signal listener failed; shutting down"),
    }
    let _ = shutdown_tx.send(true);
    let _ = server_task.await;
    cleanup_task.abort();
    registry.destroy_all().await;
    info!("shutdown complete");
}

fn init_logging(settings: &Settings) {
    let filter = EnvFilter::try_new(&settings.logging.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    if settings.logging.file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return;
    }
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&settings.logging.file)
    {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        Err(err) => {
            eprintln!(
                "cannot open log file {}: {err}; logging to stderr",
                settings.logging.file
            );
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
