use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use loanstat::config::ReportConfig;
use loanstat::engine::ReportEngine;
use loanstat::store::LogStore;
use loanstat::{reloader, wire};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("LOANSTAT_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    loanstat::observability::init(metrics_port)?;

    let port = std::env::var("LOANSTAT_PORT").unwrap_or_else(|_| "5433".into());
    let bind = std::env::var("LOANSTAT_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let log_path = std::env::var("LOANSTAT_LOG").unwrap_or_else(|_| "./data/transactions.log".into());
    let password = std::env::var("LOANSTAT_PASSWORD").unwrap_or_else(|_| "loanstat".into());
    let max_connections: usize = std::env::var("LOANSTAT_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(256);
    let reload_secs: u64 = std::env::var("LOANSTAT_RELOAD_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);

    let tls_cert = std::env::var("LOANSTAT_TLS_CERT").ok();
    let tls_key = std::env::var("LOANSTAT_TLS_KEY").ok();
    let tls_acceptor =
        loanstat::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    let config = ReportConfig::from_env()?;
    let catalog_size = config.capacities.len();

    let log_path = PathBuf::from(log_path);
    if let Some(dir) = log_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let store = Arc::new(LogStore::open(&log_path)?);
    if reload_secs > 0 {
        tokio::spawn(reloader::run_reloader(
            store.clone(),
            Duration::from_secs(reload_secs),
        ));
    }

    let engine = Arc::new(ReportEngine::new(store, config)?);
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("loanstat listening on {addr}");
    info!("  log: {}", log_path.display());
    info!("  equipment types: {catalog_size}");
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(loanstat::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(loanstat::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(loanstat::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let pw = password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, pw, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(loanstat::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("loanstat stopped");
    Ok(())
}
