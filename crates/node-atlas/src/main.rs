use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use node_atlas::{
    aggregator::Aggregator,
    broadcast::Broadcaster,
    classifier::{Classifier, CsvGeoDatabase, GeoLookup, NoGeo},
    client::SolRpcClient,
    collector::{Collector, JsonFileStore, SnapshotStore},
    settings::{AppArgs, Settings},
};
use std::{sync::Arc, time::Duration};
use tokio::{signal, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = AppArgs::parse();
    let settings = Settings::new(args.config.as_deref())?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&settings.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(metrics_addr) = settings.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()?;
        info!(%metrics_addr, "prometheus exporter listening");
    }

    export_build_info();

    let rules = settings.ruleset();
    for overlap in rules.overlaps() {
        warn!(%overlap, "provider rule is shadowed by an earlier rule");
    }

    let geo: Box<dyn GeoLookup> = match &settings.geo.database_path {
        Some(path) => {
            let database = CsvGeoDatabase::from_path(path)
                .with_context(|| format!("Failed to load geo database {path:?}"))?;
            info!(?path, ranges = database.len(), "geo database loaded");
            Box::new(database)
        }
        None => {
            warn!("no geo database configured; locations will be Unknown");
            Box::new(NoGeo)
        }
    };

    let aggregator = Arc::new(Aggregator::new(
        Classifier::new(rules, geo),
        settings.aggregator.clone(),
    ));

    let store = Arc::new(JsonFileStore::new(&settings.storage.snapshot_path));
    match store.read() {
        Ok(Some(seed)) => {
            info!(
                path = ?store.path(),
                ips = seed.ips.len(),
                taken_at = %seed.timestamp,
                "seeding aggregate from stored snapshot"
            );
            aggregator.ingest(&seed).await;
        }
        Ok(None) => {}
        Err(err) => error!(?err, path = ?store.path(), "failed to read stored snapshot; starting empty"),
    }

    let sol_rpc = settings.rpc.url()?;
    info!(%sol_rpc, commitment = %settings.rpc.commitment, "Solana Node Atlas starting");

    let source = SolRpcClient::new(sol_rpc, settings.rpc.commitment());
    let (collector, rx) = Collector::new(source, store, settings.collector.clone());

    if args.once {
        let snapshot = collector.collect_once().await;
        collector.persist(&snapshot).await;
        aggregator.ingest(&snapshot).await;
        println!("{}", serde_json::to_string_pretty(&aggregator.report().await)?);
        return Ok(());
    }

    let shutdown_listener = shutdown_listener()?;

    if let Some(secs) = args.run_for_secs {
        tokio::spawn({
            let shutdown_listener = shutdown_listener.clone();
            async move {
                sleep(Duration::from_secs(secs)).await;
                info!(secs, "run duration elapsed");
                shutdown_listener.cancel();
            }
        });
    }

    let broadcaster = Broadcaster::new(aggregator, settings.aggregator.broadcast_capacity);
    let mut observer = broadcaster.subscribe().await;
    tokio::spawn(async move {
        while let Some(report) = observer.next().await {
            info!(
                total_ips = report.total_ips,
                total_snapshots = report.total_snapshots,
                providers = report.provider_stats.len(),
                countries = report.country_stats.len(),
                high_value_txs = report.high_value_txs.len(),
                "report updated"
            );
        }
    });

    // The broadcaster ends on its own once the collector drops its sender,
    // after the final cycle's snapshot has been published.
    let broadcasting = tokio::spawn(async move { broadcaster.run(rx).await });
    let handle = collector.start_with(shutdown_listener.child_token());

    if let Err(err) = handle.join().await {
        error!(?err, "collector exited with error");
    }
    match broadcasting.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(?err, "report broadcaster exited with error"),
        Err(err) => error!(?err, "report broadcaster task failed"),
    }

    info!("Solana Node Atlas shutting down");

    Ok(())
}

fn shutdown_listener() -> anyhow::Result<CancellationToken> {
    let cancellation_token = CancellationToken::new();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("sigterm listener failed")?;
    tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            tokio::select! {
                _ = sigterm.recv() => cancellation_token.cancel(),
                _ = signal::ctrl_c() => cancellation_token.cancel(),
            }
        }
    });

    Ok(cancellation_token)
}

fn export_build_info() {
    let version = option_env!("BUILD_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"));
    let build_commit = option_env!("BUILD_COMMIT").unwrap_or("UNKNOWN");
    let build_date = option_env!("DATE").unwrap_or("UNKNOWN");
    let pkg_version = env!("CARGO_PKG_VERSION");

    metrics::gauge!(
        "node_atlas_build_info",
        "version" => version,
        "commit" => build_commit,
        "date" => build_date,
        "pkg_version" => pkg_version
    )
    .set(1);
}
