// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! `run` (§1.4, §5): the long-running recorder process. Builds a tokio
//! runtime for the RTSP/HTTP/detection I/O that the ingest and web threads
//! need, starts an ingest thread per enabled stream plus the HTTP surface,
//! the health supervisor, and the retention sweep, then waits for
//! SIGINT/SIGTERM before tearing everything back down (§5 "System
//! shutdown").

mod config;

use std::sync::Arc;

use base::clock::RealClocks;
use base::{err, Error};
use bpaf::Bpaf;
use jiff::SignedDuration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use crate::health::{self, HealthConfig, WebServerControl};
use crate::registry::{Registry, RegistryConfig};
use crate::retention;
use crate::stream::{Opener, RealOpener};
use crate::web::WebServer;
use catalog::Catalog;

pub use config::ConfigFile;

/// Runs the recorder: ingest, detection, retention, and the HTTP surface.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path to the process-wide TOML configuration file (§1.3).
    #[bpaf(long, argument("PATH"))]
    config: std::path::PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = ConfigFile::load(&args.config)?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if config.worker_threads > 0 {
        builder.worker_threads(config.worker_threads);
    }
    let rt = builder
        .build()
        .map_err(|e| err!(Internal, msg("building the tokio runtime"), source(e)))?;

    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let system = start(&config, rt.handle().clone(), shutdown_rx)?;

    info!("camwatch is running");
    rt.block_on(wait_for_shutdown_signal())?;

    info!("shutting down");
    drop(shutdown_tx);
    system.shutdown();
    rt.shutdown_background();
    Ok(0)
}

/// Blocks until SIGINT or SIGTERM arrives (§5 "System shutdown" phase 1
/// trigger).
async fn wait_for_shutdown_signal() -> Result<(), Error> {
    let mut int = signal(SignalKind::interrupt())
        .map_err(|e| err!(Internal, msg("installing SIGINT handler"), source(e)))?;
    let mut term = signal(SignalKind::terminate())
        .map_err(|e| err!(Internal, msg("installing SIGTERM handler"), source(e)))?;
    tokio::select! {
        _ = int.recv() => info!("received SIGINT"),
        _ = term.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

/// Everything started by a successful [`start`], joined back together by
/// [`System::shutdown`] in reverse order: ingest first (it feeds the
/// writers the web surface reads from), then the web surface, then the
/// background sweep threads.
struct System {
    registry: Arc<Registry<RealClocks>>,
    web: Arc<WebServer<RealClocks>>,
    retention_join: std::thread::JoinHandle<()>,
    health_join: std::thread::JoinHandle<()>,
}

impl System {
    fn shutdown(self) {
        self.registry.shutdown_all();
        if let Err(e) = self.web.stop() {
            warn!(exception = %e.chain(), "stopping web server");
        }
        // The retention/health loops only check for shutdown between sleeps,
        // so joining them can take up to their configured interval in the
        // worst case; both have already been signalled via the dropped
        // `shutdown_tx` by the time we get here.
        if self.retention_join.join().is_err() {
            error!("retention thread panicked");
        }
        if self.health_join.join().is_err() {
            error!("health thread panicked");
        }
        info!("shutdown complete");
    }
}

fn start(
    config: &ConfigFile,
    runtime: tokio::runtime::Handle,
    shutdown_rx: base::shutdown::Receiver,
) -> Result<System, Error> {
    let clocks = RealClocks {};
    crate::cmds::ensure_storage_layout(&config.storage_root)?;
    let catalog = Arc::new(Catalog::open(&config.database_path())?);

    let bind_address: std::net::SocketAddr = config.bind_address.parse().map_err(|e| {
        err!(
            FailedPrecondition,
            msg("bind address {:?} isn't a usable socket address", config.bind_address),
            source(e)
        )
    })?;

    let web = Arc::new(WebServer::new(
        bind_address,
        catalog.clone(),
        config.storage_root.clone(),
        clocks,
        runtime.clone(),
    ));
    web.start()?;
    info!(%bind_address, "web surface listening");

    let registry_config = RegistryConfig {
        catalog: catalog.clone(),
        opener: Arc::new(RealOpener) as Arc<dyn Opener>,
        storage_root: config.storage_root.clone(),
        clocks,
        runtime: runtime.clone(),
        detection_api_base: config.detection_api_base()?,
    };
    let registry = Registry::new(registry_config);

    let streams = {
        let tx = catalog.tx()?;
        let streams = tx.list_streams(false)?;
        tx.commit()?;
        streams
    };
    let stream_count = streams.len();
    for stream in &streams {
        if let Err(e) = registry.start(stream) {
            error!(stream = %stream.name, exception = %e.chain(), "failed to start ingest");
        }
    }
    info!(count = stream_count, "started enabled streams");

    let retention_join = {
        let catalog = catalog.clone();
        let shutdown_rx = shutdown_rx.clone();
        let interval = SignedDuration::from_secs(config.retention_sweep_secs.max(1));
        std::thread::Builder::new()
            .name("retention".to_owned())
            .spawn(move || retention::run(catalog, clocks, shutdown_rx, interval))
            .map_err(|e| err!(Internal, msg("spawning retention thread"), source(e)))?
    };

    let health_join = {
        let shutdown_rx = shutdown_rx.clone();
        let runtime = runtime.clone();
        let health_url = config.health_url()?;
        let web: Arc<dyn WebServerControl> = web.clone();
        let health_config = HealthConfig {
            probe_interval: SignedDuration::from_secs(config.health_probe_secs.max(1)),
            restart_cooldown: SignedDuration::from_secs(config.health_restart_cooldown_secs.max(0)),
            max_restart_attempts: config.health_max_restart_attempts,
        };
        std::thread::Builder::new()
            .name("health".to_owned())
            .spawn(move || health::run(clocks, shutdown_rx, runtime, health_url, web, health_config))
            .map_err(|e| err!(Internal, msg("spawning health thread"), source(e)))?
    };

    Ok(System {
        registry,
        web,
        retention_join,
        health_join,
    })
}
