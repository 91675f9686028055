//! Entry point: parse config, connect to Postgres, wire the Aggregator,
//! Controller and Pipeline together, and run until signalled.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use daq_dispatcher::aggregator::Aggregator;
use daq_dispatcher::config::{self, Cli};
use daq_dispatcher::controller::Controller;
use daq_dispatcher::dispatcher::{run_reconciliation_loop, MeteredStore};
use daq_dispatcher::metrics::Metrics;
use daq_dispatcher::model::HostTopology;
use daq_dispatcher::pipeline::Pipeline;
use daq_dispatcher::store::postgres::PostgresStore;
use daq_dispatcher::store::StoreGateway;

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt().json().with_target(false).init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let topology_cfg = config::parse_master_daq_config(&cli.master_daq_config)?;
    let topology = HostTopology::from_master_config(&topology_cfg);

    let control_url = config::resolve_database_url(
        &cli.control_database_url,
        cli.control_database_password.as_deref(),
    );
    let runs_url = config::resolve_database_url(&cli.runs_database_url, cli.runs_database_password.as_deref());
    let store: Arc<dyn StoreGateway> =
        Arc::new(PostgresStore::connect(&control_url, &runs_url).await?);

    let metrics = Arc::new(Metrics::new());
    let metered_store = MeteredStore::new(store.clone(), metrics.clone());

    let pipeline = Arc::new(Pipeline::restore(metered_store.as_ref()).await?);
    let aggregator = Aggregator::new(topology, &cli);
    let controller = Controller::new(metered_store.clone(), pipeline.clone(), &cli);

    let stop = Arc::new(AtomicBool::new(false));

    let worker_store = metered_store.clone();
    let worker_pipeline = pipeline.clone();
    let worker_stop = stop.clone();
    let pipeline_handle = tokio::spawn(async move {
        worker_pipeline.run_worker(worker_store, worker_stop).await;
    });

    let loop_store = metered_store.clone();
    let loop_metrics = metrics.clone();
    let loop_stop = stop.clone();
    let poll_frequency = cli.poll_frequency;
    let loop_handle = tokio::spawn(async move {
        run_reconciliation_loop(loop_store, aggregator, controller, loop_metrics, poll_frequency, loop_stop).await;
    });

    let server_metrics = metrics.clone();
    let server_port = cli.metrics_port;
    let server_stop = stop.clone();
    let server_handle = tokio::spawn(async move {
        let shutdown = async move {
            while !server_stop.load(std::sync::atomic::Ordering::Relaxed) {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        };
        if let Err(e) = daq_dispatcher::metrics::run_server(server_metrics, server_port, shutdown).await {
            tracing::error!(error = %e, "metrics server exited with an error");
        }
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping");
    stop.store(true, std::sync::atomic::Ordering::Relaxed);

    let _ = tokio::join!(pipeline_handle, loop_handle, server_handle);
    tracing::info!("dispatcher shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        tracing::info!("received SIGINT");
    }
}
