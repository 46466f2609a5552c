use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use loyalty_core::{Clock, SystemClock};
use loyalty_dispatcher::{Config, build_registry, mail_transport};
use loyalty_outbox::{Dispatcher, OutboxStore, PostgresOutboxStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let span = loyalty_observability::init("loyalty-dispatcher");
    run().instrument(span).await
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    // One clock for retry deadlines and the claim query.
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = PostgresOutboxStore::new(pool).with_clock(clock.clone());
    store.ensure_schema().await.context("failed to create outbox schema")?;

    match store.stats().await {
        Ok(stats) => tracing::info!(
            pending = stats.pending,
            processing = stats.processing,
            failed = stats.failed,
            dead = stats.dead,
            "outbox backlog"
        ),
        Err(e) => tracing::warn!(error = %e, "could not read outbox stats"),
    }

    let mail = mail_transport(config.smtp).context("invalid SMTP configuration")?;
    let dispatcher = Dispatcher::new(store, build_registry(mail))
        .with_config(config.dispatcher)
        .with_clock(clock);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutdown requested; finishing current batch");
            shutdown.cancel();
        }
    });

    dispatcher.run(shutdown).await?;

    let stats = dispatcher.stats();
    tracing::info!(
        ticks = stats.ticks,
        sent = stats.events_sent,
        failed = stats.events_failed,
        dead = stats.events_dead,
        lost = stats.events_lost,
        claim_errors = stats.claim_errors,
        "dispatcher exited"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
