// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The stream registry and supervisor (C6): a bounded table of ingest
//! threads keyed by stream name, plus a parallel MP4-writer registry for
//! externally driven (continuous) capture paths.
//!
//! Grounded on the teacher's streamer-handle map (`parking_lot::Mutex<HashMap<...>>`
//! guarding O(1) lookups, never I/O, per §5 "Shared-resource policy").

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;

use base::clock::Clocks;
use base::{bail, err, Error, Mutex};
use jiff::SignedDuration;
use tracing::{info, warn};
use url::Url;

use crate::ingest::{self, IngestContext, IngestStats, MotionSettings, SharedStatus};
use crate::predictor::Predictor;
use crate::stream::Opener;
use crate::writer::Writer;
use catalog::model::Stream as StreamRow;
use catalog::Catalog;

/// The 5 s cooperative-stop envelope of §4.6 `stop`/`shutdown_all`.
const STOP_TIMEOUT: StdDuration = StdDuration::from_secs(5);
const STOP_POLL: StdDuration = StdDuration::from_millis(20);

struct StreamHandle {
    join: Option<JoinHandle<()>>,
    shutdown_tx: base::shutdown::Sender,
    status: Arc<SharedStatus>,
    /// Set once a `stop` times out; the slot is kept (so the name stays
    /// reserved) but refuses further `start` calls until process restart
    /// (§4.6 "marked unusable until process restart").
    leaked: bool,
}

/// Resolves the detection service base URL to use for `stream`: its own
/// `detection.api_url` override (§3 Stream detection policy) if set, else
/// the process config's default.
fn resolve_detection_api_base(stream: &StreamRow, default: &Url) -> Result<Url, Error> {
    match stream.detection.api_url.as_deref() {
        Some(u) if !u.is_empty() => {
            u.parse().map_err(|e| err!(InvalidArgument, msg("bad detection_api_url {u:?} for stream {:?}", stream.name), source(e)))
        }
        _ => Ok(default.clone()),
    }
}

/// Everything the registry needs to build an [`IngestContext`] for a stream
/// row, factored out of per-call arguments (§1.3 process config: storage
/// root, detection service defaults).
pub struct RegistryConfig<C: Clocks + Clone> {
    pub catalog: Arc<Catalog<C>>,
    pub opener: Arc<dyn Opener>,
    pub storage_root: std::path::PathBuf,
    pub clocks: C,
    pub runtime: tokio::runtime::Handle,
    pub detection_api_base: Url,
}

/// C6: the bounded ingest-thread table plus the continuous-recording writer
/// registry.
pub struct Registry<C: Clocks + Clone> {
    config: RegistryConfig<C>,
    streams: Mutex<HashMap<String, StreamHandle>>,
    writers: Mutex<HashMap<String, Writer>>,
}

impl<C: Clocks + Clone> Registry<C> {
    pub fn new(config: RegistryConfig<C>) -> Arc<Self> {
        Arc::new(Registry {
            config,
            streams: Mutex::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
        })
    }

    /// Spawns an ingest thread for `stream`. Refuses if an entry already
    /// exists for that name (§4.6 `start`).
    pub fn start(self: &Arc<Self>, stream: &StreamRow) -> Result<(), Error> {
        let mut streams = self.streams.lock();
        if let Some(existing) = streams.get(&stream.name) {
            if existing.leaked {
                bail!(
                    FailedPrecondition,
                    msg("stream {:?} has a leaked ingest thread, needs a process restart", stream.name)
                );
            }
            bail!(AlreadyExists, msg("stream {:?} is already running", stream.name));
        }

        let url: Url = stream.url.parse().map_err(|e| err!(InvalidArgument, source(e)))?;
        let predictor = self.build_predictor(stream)?;
        let motion = self.build_motion_settings(&stream.name)?;
        let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let status = SharedStatus::new();

        let ctx = IngestContext {
            stream_name: stream.name.clone(),
            url,
            record_audio: stream.record_audio,
            buffer_capacity: SignedDuration::from_secs(
                stream.detection.pre_roll_seconds.max(1),
            ),
            detection_enabled: stream.detection.enabled,
            detection_interval: stream.detection.interval.max(1),
            detection_threshold: stream.detection.threshold,
            pre_roll: SignedDuration::from_secs(stream.detection.pre_roll_seconds.max(0)),
            post_roll: SignedDuration::from_secs(stream.detection.post_roll_seconds.max(0)),
            motion,
            storage_root: self.config.storage_root.clone(),
            catalog: self.config.catalog.clone(),
            opener: self.config.opener.clone(),
            predictor,
            clocks: self.config.clocks.clone(),
            shutdown_rx,
            status: status.clone(),
            runtime: self.config.runtime.clone(),
        };

        let name = stream.name.clone();
        let join = std::thread::Builder::new()
            .name(format!("ingest-{name}"))
            .spawn(move || ingest::run(ctx))
            .map_err(|e| err!(Internal, source(e)))?;

        streams.insert(
            name,
            StreamHandle {
                join: Some(join),
                shutdown_tx,
                status,
                leaked: false,
            },
        );
        Ok(())
    }

    fn build_predictor(&self, stream: &StreamRow) -> Result<Option<Arc<dyn Predictor>>, Error> {
        if !stream.detection.enabled {
            return Ok(None);
        }
        let api_base = resolve_detection_api_base(stream, &self.config.detection_api_base)?;
        match stream.detection.model.as_deref() {
            #[cfg(feature = "embedded-detector")]
            Some(path) if path != crate::predictor::API_DETECTION_SENTINEL && !path.starts_with("http") => {
                let model_path = std::path::Path::new(path);
                let predictor = crate::predictor::EmbeddedPredictor::load(model_path, stream.detection.threshold)?;
                Ok(Some(Arc::new(predictor) as Arc<dyn Predictor>))
            }
            Some(path) => {
                let predictor = crate::predictor::RemotePredictor::new(
                    path,
                    &api_base,
                    self.config.runtime.clone(),
                    stream.detection.threshold,
                )?;
                Ok(Some(Arc::new(predictor) as Arc<dyn Predictor>))
            }
            None => {
                let predictor = crate::predictor::RemotePredictor::new(
                    crate::predictor::API_DETECTION_SENTINEL,
                    &api_base,
                    self.config.runtime.clone(),
                    stream.detection.threshold,
                )?;
                Ok(Some(Arc::new(predictor) as Arc<dyn Predictor>))
            }
        }
    }

    /// Reads `stream_name`'s `motion_config` row, if any, into the settings
    /// [`crate::ingest::Fsm`] needs to run the motion-diff heuristic (§6.2
    /// `motion_config`). Returns `None` when there's no row or it's disabled.
    fn build_motion_settings(&self, stream_name: &str) -> Result<Option<MotionSettings>, Error> {
        let tx = self.config.catalog.tx()?;
        let config = tx.get_motion_config(stream_name)?;
        tx.commit()?;
        Ok(config.filter(|c| c.enabled).map(|c| MotionSettings {
            sensitivity: c.sensitivity,
            min_area: c.min_area,
            cooldown: SignedDuration::from_secs(c.cooldown_seconds.max(0)),
        }))
    }

    /// Signals the named stream's thread to stop, waits up to 5 s for it to
    /// reach STOPPED, then reclaims the slot. On timeout the slot is kept
    /// but marked leaked (§4.6 `stop`).
    pub fn stop(&self, stream_name: &str) -> Result<(), Error> {
        let handle = {
            let mut streams = self.streams.lock();
            match streams.remove(stream_name) {
                Some(h) => h,
                None => bail!(NotFound, msg("no running ingest thread for {stream_name:?}")),
            }
        };
        drop(handle.shutdown_tx); // triggers ShutdownError in the thread's check()

        let deadline = std::time::Instant::now() + STOP_TIMEOUT;
        let mut join = handle.join;
        loop {
            if matches!(*handle.status.state.lock(), ingest::IngestState::Stopped) {
                break;
            }
            if std::time::Instant::now() >= deadline {
                warn!(stream = stream_name, "stop timed out, marking slot leaked");
                self.streams.lock().insert(
                    stream_name.to_owned(),
                    StreamHandle {
                        join: join.take(),
                        shutdown_tx: base::shutdown::channel().0,
                        status: handle.status,
                        leaked: true,
                    },
                );
                return Ok(());
            }
            std::thread::sleep(STOP_POLL);
        }
        if let Some(join) = join {
            let _ = join.join();
        }
        info!(stream = stream_name, "stopped");
        Ok(())
    }

    pub fn is_running(&self, stream_name: &str) -> bool {
        self.streams.lock().contains_key(stream_name)
    }

    pub fn state(&self, stream_name: &str) -> Option<ingest::IngestState> {
        self.streams.lock().get(stream_name).map(|h| *h.status.state.lock())
    }

    pub fn stats(&self, stream_name: &str) -> Option<IngestStats> {
        self.streams.lock().get(stream_name).map(|h| h.status.stats.lock().clone())
    }

    pub fn running_streams(&self) -> Vec<String> {
        self.streams.lock().keys().cloned().collect()
    }

    /// Signals every running thread, waits up to 5 s total, then forcibly
    /// reclaims whatever hasn't exited (§4.6 `shutdown_all`, §5 "System
    /// shutdown" two-phase protocol).
    pub fn shutdown_all(&self) {
        let handles: Vec<(String, StreamHandle)> = {
            let mut streams = self.streams.lock();
            streams.drain().collect()
        };
        // Signal every thread at once (phase 1 of §5's two-phase shutdown),
        // keeping each join handle + status around to poll for phase 2.
        let mut remaining: Vec<(String, Option<JoinHandle<()>>, Arc<SharedStatus>)> = handles
            .into_iter()
            .map(|(name, h)| {
                drop(h.shutdown_tx);
                (name, h.join, h.status)
            })
            .collect();

        let deadline = std::time::Instant::now() + STOP_TIMEOUT;
        let mut stopped: Vec<(String, Option<JoinHandle<()>>)> = Vec::new();
        while std::time::Instant::now() < deadline && !remaining.is_empty() {
            let (done, pending): (Vec<_>, Vec<_>) = remaining
                .into_iter()
                .partition(|(_, _, status)| matches!(*status.state.lock(), ingest::IngestState::Stopped));
            for (name, join, _) in done {
                info!(stream = %name, "stopped during shutdown_all");
                stopped.push((name, join));
            }
            remaining = pending;
            if !remaining.is_empty() {
                std::thread::sleep(STOP_POLL);
            }
        }
        for (_, join) in stopped {
            if let Some(join) = join {
                let _ = join.join();
            }
        }
        for (name, join, _) in remaining {
            warn!(stream = %name, "shutdown_all: thread did not stop in time, leaking");
            if let Some(join) = join {
                drop(join); // detach; joining would block indefinitely
            }
        }
    }

    /// Registers (or replaces) the continuous-recording writer for
    /// `stream_name`. A prior writer, if any, is closed first (§4.6
    /// "previous writer is closed before replacement").
    pub fn register_writer(&self, stream_name: &str, writer: Writer) {
        let mut writers = self.writers.lock();
        if let Some(old) = writers.insert(stream_name.to_owned(), writer) {
            if let Err(e) = old.close() {
                warn!(stream = stream_name, exception = %e.chain(), "closing replaced writer failed");
            }
        }
    }

    /// Closes and removes the continuous-recording writer for
    /// `stream_name`, if any (§4.6 "Unregistration closes and removes").
    pub fn unregister_writer(&self, stream_name: &str) -> Result<(), Error> {
        let Some(writer) = self.writers.lock().remove(stream_name) else {
            return Ok(());
        };
        writer.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use jiff::Timestamp;

    struct NeverOpens;
    impl Opener for NeverOpens {
        fn open(&self, _label: String, _url: Url, _options: crate::stream::Options) -> Result<Box<dyn crate::stream::Stream>, Error> {
            Err(err!(Unavailable, msg("no test server")))
        }
    }

    fn test_config() -> RegistryConfig<SimulatedClocks> {
        let rt = tokio::runtime::Runtime::new().unwrap();
        RegistryConfig {
            catalog: Arc::new(Catalog::new(rusqlite::Connection::open_in_memory().unwrap(), SimulatedClocks::new(Timestamp::from_second(0).unwrap())).unwrap()),
            opener: Arc::new(NeverOpens),
            storage_root: std::env::temp_dir(),
            clocks: SimulatedClocks::new(Timestamp::from_second(0).unwrap()),
            runtime: rt.handle().clone(),
            detection_api_base: "http://127.0.0.1:1/".parse().unwrap(),
        }
    }

    fn stream_row(name: &str) -> StreamRow {
        StreamRow {
            id: 1,
            name: name.to_owned(),
            url: "rtsp://127.0.0.1:1/test".to_owned(),
            enabled: true,
            streaming_enabled: false,
            width: 0,
            height: 0,
            fps: 0.0,
            codec: "h264".to_owned(),
            priority: 0,
            record: true,
            segment_duration: 60,
            protocol: "tcp".to_owned(),
            is_onvif: false,
            record_audio: false,
            backchannel_enabled: false,
            detection: catalog::model::DetectionPolicy::default(),
            retention: catalog::model::RetentionPolicy::default(),
            ptz: catalog::model::PtzMetadata::default(),
        }
    }

    #[test]
    fn double_start_is_rejected() {
        let registry = Registry::new(test_config());
        let row = stream_row("front");
        registry.start(&row).unwrap();
        let err = registry.start(&row).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::AlreadyExists);
        registry.stop("front").unwrap();
    }

    #[test]
    fn stop_unknown_stream_is_not_found() {
        let registry = Registry::new(test_config());
        let err = registry.stop("nope").unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::NotFound);
    }

    #[test]
    fn resolve_detection_api_base_prefers_per_stream_override() {
        let default: Url = "http://127.0.0.1:1/".parse().unwrap();
        let mut row = stream_row("front");
        row.detection.api_url = Some("http://127.0.0.1:2/".to_owned());
        let resolved = resolve_detection_api_base(&row, &default).unwrap();
        assert_eq!(resolved.as_str(), "http://127.0.0.1:2/");
    }

    #[test]
    fn resolve_detection_api_base_falls_back_to_default_when_unset() {
        let default: Url = "http://127.0.0.1:1/".parse().unwrap();
        let row = stream_row("front");
        let resolved = resolve_detection_api_base(&row, &default).unwrap();
        assert_eq!(resolved, default);
    }

    #[test]
    fn build_predictor_uses_per_stream_api_url_end_to_end() {
        let registry = Registry::new(test_config());
        let mut row = stream_row("front");
        row.detection.enabled = true;
        row.detection.api_url = Some("http://127.0.0.1:2/".to_owned());
        // Just needs to succeed without touching the process default; the
        // URL itself is covered by the resolve_detection_api_base tests
        // above (a RemotePredictor doesn't expose its URL post-construction).
        assert!(registry.build_predictor(&row).unwrap().is_some());
    }
}
