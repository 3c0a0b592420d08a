//! The daemon: sweeper loop, outbox loop and HTTP API side by side.

use crate::config::ServerConfig;
use crate::http::{self, Services};
use anyhow::{Context, Result};
use heirloom_core::{Clock, SystemClock};
use heirloom_engine::{
    CheckInTracker, LegacyTokenService, NotificationInbox, OutboxDispatcher, ReleaseSweeper,
    TimeCapsuleIndex, VaultRegistry,
};
use heirloom_notify::{ContactDirectory, LogGateway, NotificationGateway, SmtpGateway};
use heirloom_store::Store;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Run until `shutdown` turns true. A sweep batch in flight always finishes.
pub async fn run(config: ServerConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    log::info!("Heirloom server starting…");
    log::info!("  Database:   {}", config.database_path().display());
    log::info!("  Listen:     {}", config.server.listen_addr);
    log::info!(
        "  Sweep:      every {} seconds, batches of {}",
        config.engine.sweep_interval_secs,
        config.engine.batch_size
    );
    log::info!(
        "  Outbox:     every {} seconds, {} attempts max",
        config.notifications.dispatch_interval_secs,
        config.notifications.max_attempts
    );

    prepare_data_dir(&config)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = config.engine_config();

    let sweeper = ReleaseSweeper::new(open_store(&config)?, clock.clone(), &engine);
    let dispatcher = OutboxDispatcher::new(
        open_store(&config)?,
        clock.clone(),
        gateway(&config)?,
        config.retry_policy(),
        config.engine.batch_size,
    );
    let services = Services {
        vaults: VaultRegistry::new(open_store(&config)?, clock.clone()),
        checkins: CheckInTracker::new(open_store(&config)?, clock.clone()),
        capsules: TimeCapsuleIndex::new(open_store(&config)?, clock.clone()),
        tokens: LegacyTokenService::new(open_store(&config)?, clock, &engine)?,
        inbox: NotificationInbox::new(open_store(&config)?),
    };

    let addr = config.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    log::info!("HTTP API listening on {}", addr);

    let mut http_shutdown = shutdown.clone();
    let server = async move {
        axum::serve(listener, http::router(services))
            .with_graceful_shutdown(async move {
                while !*http_shutdown.borrow() {
                    if http_shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
    };

    let (swept, dispatched, served) = tokio::join!(
        sweeper.run(config.sweep_interval(), shutdown.clone()),
        dispatcher.run(config.dispatch_interval(), shutdown),
        server,
    );
    swept.context("Sweeper failed")?;
    dispatched.context("Outbox dispatcher failed")?;
    served.context("HTTP server failed")?;

    log::info!("Heirloom server stopped.");
    Ok(())
}

/// Turn `signal` into a shutdown request. When the signal handler cannot be
/// installed the daemon keeps running, and `shutdown` is held open so the
/// loops do not mistake a dropped sender for a stop.
pub async fn forward_shutdown<F>(signal: F, shutdown: watch::Sender<bool>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            log::info!("Received shutdown signal. Finishing current work…");
            let _ = shutdown.send(true);
        }
        Err(e) => {
            log::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// One sweep pass followed by one outbox drain.
pub fn run_once(config: &ServerConfig) -> Result<()> {
    prepare_data_dir(config)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let report = ReleaseSweeper::new(open_store(config)?, clock.clone(), &config.engine_config())
        .run_once()
        .context("Sweep failed")?;
    log::info!(
        "Sweep: {} entered grace, {} released ({} by capsule), {} reminders, {} failed",
        report.grace_entered,
        report.released,
        report.released_by_capsule,
        report.reminders,
        report.failed
    );

    let delivered = OutboxDispatcher::new(
        open_store(config)?,
        clock,
        gateway(config)?,
        config.retry_policy(),
        config.engine.batch_size,
    )
    .dispatch_once()
    .context("Outbox dispatch failed")?;
    log::info!(
        "Outbox: {} delivered, {} failed, {} claimed elsewhere",
        delivered.delivered,
        delivered.failed,
        delivered.skipped
    );
    Ok(())
}

fn prepare_data_dir(config: &ServerConfig) -> Result<()> {
    std::fs::create_dir_all(&config.server.data_dir).with_context(|| {
        format!(
            "Failed to create data dir: {}",
            config.server.data_dir.display()
        )
    })
}

fn open_store(config: &ServerConfig) -> Result<Store> {
    let path = config.database_path();
    Store::open(&path, config.storage_timeout())
        .with_context(|| format!("Failed to open database {}", path.display()))
}

/// SMTP when email is configured and enabled, otherwise log-only delivery.
fn gateway(config: &ServerConfig) -> Result<Arc<dyn NotificationGateway>> {
    match config.notifications.email {
        Some(ref email) if email.enabled => {
            let contacts = ContactDirectory::new(config.notifications.contacts.iter().cloned());
            log::info!(
                "Email notifications via {} ({} contacts)",
                email.smtp_host,
                contacts.len()
            );
            let smtp = SmtpGateway::new(email, contacts).context("Failed to set up SMTP")?;
            Ok(Arc::new(smtp))
        }
        _ => {
            log::warn!("No email configured; notifications will only be logged");
            Ok(Arc::new(LogGateway))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heirloom_store::vaults;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn config_in(dir: &TempDir) -> ServerConfig {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "[server]\ndata_dir = \"{}\"\n\n[engine]\ntoken_salt = \"test-salt\"\n",
            dir.path().join("nested").display()
        )
        .unwrap();
        ServerConfig::from_file(file.path()).unwrap()
    }

    #[test]
    fn test_run_once_creates_database() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        run_once(&config).unwrap();
        assert!(config.database_path().exists());

        let store = open_store(&config).unwrap();
        assert!(vaults::list_for_owner(store.conn(), "alice").unwrap().is_empty());
    }

    #[test]
    fn test_gateway_falls_back_to_log() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        assert!(gateway(&config).is_ok());

        let mut email = heirloom_notify::EmailConfig::new("", "u", "p", "from@example.com");
        email.enabled = false;
        config.notifications.email = Some(email);
        assert!(gateway(&config).is_ok());
    }

    #[tokio::test]
    async fn test_signal_requests_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        forward_shutdown(async { Ok(()) }, tx).await;
        assert!(*rx.borrow_and_update());
    }

    #[tokio::test]
    async fn test_failed_signal_handler_keeps_running() {
        let (tx, rx) = watch::channel(false);
        let failing = async { Err(std::io::Error::other("no signal handler")) };
        let handle = tokio::spawn(forward_shutdown(failing, tx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(!handle.is_finished());
        assert!(!*rx.borrow());
        assert!(rx.has_changed().is_ok());
        handle.abort();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.server.listen_addr = "127.0.0.1:0".into();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(config, rx));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
