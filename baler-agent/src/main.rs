//! # baler-agent
//!
//! Sidecar entry point. For every configured datatype this wires up one
//! pipeline — watcher + sweep finder feeding a tar cache that uploads through
//! a shared object-store client — and runs them all until a terminal signal
//! walks the process through its two-phase shutdown:
//!
//! 1. `term` cancels: every open tarball is uploaded, but the pipelines stay
//!    up so files that land during the grace period are still captured.
//! 2. after `--sigterm_wait_time`, `kill` cancels: one final flush, the cache
//!    loops return, and the process exits.

mod config;
mod metrics_server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use baler_core::tarcache::{datatype_directory, CacheConfig, TarCache};
use baler_core::{finder, StandardNamer, StoreUploader, Uploader, Watcher};
use clap::Parser;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::ObjectStore;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use config::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let node = args.node()?;
    let age_delays = args.age_delays()?;
    let cleanup_cadence = args.cleanup_cadence()?;
    let mut seen = std::collections::HashSet::new();
    for spec in &args.datatypes {
        if !seen.insert(spec.name.as_str()) {
            anyhow::bail!("datatype {} specified more than once", spec.name);
        }
    }
    info!(
        directory = %args.directory.display(),
        bucket = %args.bucket,
        project = %args.project,
        experiment = %args.experiment,
        node = %node,
        "starting baler-agent"
    );

    let store: Arc<dyn ObjectStore> = Arc::new(
        GoogleCloudStorageBuilder::new()
            .with_bucket_name(&args.bucket)
            .build()
            .context("could not build the object-store client")?,
    );

    // Cancellation cascade: root covers everything, kill covers the final
    // flush, term covers the first emergency flush. Cancelling a parent
    // cancels its children, so the signal task only ever cancels in order.
    let root = CancellationToken::new();
    let kill = root.child_token();
    let term = kill.child_token();

    let mut cache_loops: Vec<(String, JoinHandle<()>)> = Vec::new();
    let mut service_loops: Vec<JoinHandle<()>> = Vec::new();

    for spec in &args.datatypes {
        let datadir = datatype_directory(&args.directory, &spec.name);
        std::fs::create_dir_all(&datadir)
            .with_context(|| format!("could not create {}", datadir.display()))?;

        let namer = StandardNamer::new(&spec.name, &args.experiment, &node);
        let uploader: Arc<dyn Uploader> = Arc::new(StoreUploader::new(
            Arc::clone(&store),
            Box::new(namer),
            args.upload_timeout.map(Into::into),
        ));
        let (cache, file_tx) = TarCache::new(
            CacheConfig {
                // Member names are relative to the spool root, so they keep
                // the datatype token: <datatype>/YYYY/MM/DD/<name>.
                directory: args.directory.to_string_lossy().into_owned(),
                datatype: spec.name.clone(),
                size_threshold: args.archive_size_threshold,
                age_delays,
                sample_ratio: spec.sample_ratio,
                metadata: args.metadata_map(),
            },
            uploader,
        );
        let watcher = Watcher::new(&datadir, &spec.name, file_tx.clone())
            .with_context(|| format!("could not watch {}", datadir.display()))?;

        if args.dry_run {
            continue;
        }
        cache_loops.push((
            spec.name.clone(),
            tokio::spawn(cache.listen_forever(term.clone(), kill.clone())),
        ));
        service_loops.push(tokio::spawn(watcher.listen_forever(root.clone())));
        service_loops.push(tokio::spawn(finder::find_forever(
            root.clone(),
            spec.name.clone(),
            datadir,
            args.max_file_age.into(),
            file_tx,
            cleanup_cadence,
        )));
    }

    if args.dry_run {
        info!("dry run: everything initialized, exiting");
        return Ok(());
    }

    service_loops.push(tokio::spawn({
        let addr = args.metrics_address;
        let ctx = root.clone();
        async move {
            if let Err(err) = metrics_server::serve(addr, ctx).await {
                error!("metrics server failed: {err:#}");
            }
        }
    }));

    spawn_signal_handler(
        term.clone(),
        kill.clone(),
        root.clone(),
        args.sigterm_wait_time.into(),
    )?;

    // The cache loops are the pipeline's beating heart; the process lives
    // exactly as long as they do. A panicked loop means a corrupt archive
    // stream, and the only safe reaction is to die and let the next run's
    // sweep recover the files.
    for (datatype, handle) in cache_loops {
        if let Err(err) = handle.await {
            error!("{datatype} cache loop failed: {err}");
            anyhow::bail!("cache loop for {datatype} did not shut down cleanly");
        }
    }
    info!("all cache loops drained, exiting");
    root.cancel();
    for handle in service_loops {
        let _ = handle.await;
    }
    Ok(())
}

/// On the first SIGTERM or SIGINT: cancel `term`, wait out the grace period,
/// cancel `kill`, then `root`. The tokens are the only channel between signal
/// delivery and the event loops.
fn spawn_signal_handler(
    term: CancellationToken,
    kill: CancellationToken,
    root: CancellationToken,
    grace: Duration,
) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("could not install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("could not install SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("caught SIGTERM"),
            _ = sigint.recv() => info!("caught SIGINT"),
        }
        info!("flushing all open tarballs, hard stop in {grace:?}");
        term.cancel();
        tokio::time::sleep(grace).await;
        kill.cancel();
        root.cancel();
    });
    Ok(())
}
