// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The minimal HTTP surface (§6.3): health, sync, and stream/recording/
//! detection CRUD backed directly by the catalog. Not a full REST
//! framework — `hyper`'s low-level server pieces plus a hand-rolled router,
//! the way the teacher's own `web` module is built, just against a much
//! narrower contract (§3 Non-goals: no live view/playback surface here).
//!
//! Implements [`crate::health::WebServerControl`] so the health supervisor
//! (C7) can start/stop/probe it without knowing it's hyper underneath.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use base::clock::Clocks;
use base::{err, Error};
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::health::{HealthStatus, WebServerControl};
use catalog::model::{DetectionEvent, MotionConfig, NewStream, Recording, RecordingFilter, Sort, Stream as StreamRow};
use catalog::Catalog;

type ResponseBody = Full<Bytes>;

struct State<C: Clocks + Clone> {
    catalog: Arc<Catalog<C>>,
    storage_root: std::path::PathBuf,
    clocks: C,
    start_time: i64,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
}

/// The process's HTTP surface, controllable from the health supervisor.
pub struct WebServer<C: Clocks + Clone> {
    addr: SocketAddr,
    runtime: tokio::runtime::Handle,
    state: Arc<State<C>>,
    running: base::Mutex<Option<Running>>,
}

struct Running {
    shutdown_tx: base::shutdown::Sender,
    alive: Arc<AtomicBool>,
    join: std::thread::JoinHandle<()>,
}

impl<C: Clocks + Clone + 'static> WebServer<C> {
    pub fn new(
        addr: SocketAddr,
        catalog: Arc<Catalog<C>>,
        storage_root: std::path::PathBuf,
        clocks: C,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let start_time = clocks.realtime().as_second();
        WebServer {
            addr,
            runtime,
            state: Arc::new(State {
                catalog,
                storage_root,
                clocks,
                start_time,
                total_requests: AtomicU64::new(0),
                failed_requests: AtomicU64::new(0),
            }),
            running: base::Mutex::new(None),
        }
    }
}

impl<C: Clocks + Clone + 'static> WebServerControl for WebServer<C> {
    fn start(&self) -> Result<(), Error> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let alive = Arc::new(AtomicBool::new(true));
        let addr = self.addr;
        let state = self.state.clone();
        let runtime = self.runtime.clone();
        let alive2 = alive.clone();

        let join = std::thread::Builder::new()
            .name("web".to_owned())
            .spawn(move || {
                let _enter = runtime.enter();
                let result = runtime.block_on(serve(addr, state, shutdown_rx));
                alive2.store(false, Ordering::SeqCst);
                if let Err(e) = result {
                    warn!(exception = %e.chain(), "web server exited with error");
                }
            })
            .map_err(|e| err!(Internal, source(e)))?;

        *running = Some(Running { shutdown_tx, alive, join });
        Ok(())
    }

    fn stop(&self) -> Result<(), Error> {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return Ok(());
        };
        drop(running.shutdown_tx);
        let _ = running.join.join();
        Ok(())
    }

    fn is_alive(&self) -> bool {
        match &*self.running.lock() {
            Some(r) => r.alive.load(Ordering::SeqCst) && !r.join.is_finished(),
            None => false,
        }
    }
}

async fn serve<C: Clocks + Clone + 'static>(
    addr: SocketAddr,
    state: Arc<State<C>>,
    shutdown_rx: base::shutdown::Receiver,
) -> Result<(), Error> {
    let listener = TcpListener::bind(addr).await.map_err(|e| err!(Internal, msg("binding {addr}"), source(e)))?;
    info!(%addr, "listening for HTTP requests");
    let graceful = GracefulShutdown::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        warn!(exception = %e, "accept failed");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let state = state.clone();
                let conn = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, std::convert::Infallible>(handle(state, req).await) }
                    }));
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        warn!(exception = %e, "connection error");
                    }
                });
            }
            _ = shutdown_rx.as_future() => break,
        }
    }

    graceful.shutdown().await;
    Ok(())
}

async fn handle<C: Clocks + Clone>(state: Arc<State<C>>, req: Request<Incoming>) -> Response<ResponseBody> {
    state.total_requests.fetch_add(1, Ordering::Relaxed);
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let query = req.uri().query().unwrap_or("").to_owned();

    let result = route(&state, &method, &path, &query, req).await;
    match result {
        Ok(resp) => resp,
        Err(e) => {
            state.failed_requests.fetch_add(1, Ordering::Relaxed);
            warn!(%method, %path, exception = %e.chain(), "request failed");
            error_response(&e)
        }
    }
}

async fn route<C: Clocks + Clone>(
    state: &Arc<State<C>>,
    method: &Method,
    path: &str,
    query: &str,
    req: Request<Incoming>,
) -> Result<Response<ResponseBody>, Error> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        (&Method::GET, ["api", "health"]) => Ok(json_response(StatusCode::OK, &health_status(state))),
        (&Method::POST, ["api", "recordings", "sync"]) => {
            let report = crate::cmds::sync::sync(&state.catalog, &state.storage_root)?;
            Ok(json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "inserted": report.inserted,
                    "completed": report.completed,
                    "streamsCreated": report.streams_created,
                }),
            ))
        }
        (&Method::GET, ["api", "streams"]) => {
            let tx = state.catalog.tx()?;
            let streams = tx.list_streams(true)?;
            Ok(json_response(StatusCode::OK, &streams))
        }
        (&Method::POST, ["api", "streams"]) => {
            let body = read_json::<NewStreamRequest>(req).await?;
            let tx = state.catalog.tx()?;
            tx.add_or_reactivate_stream(&body.name, &body.url, body.record_audio)?;
            tx.commit()?;
            Ok(json_response(StatusCode::OK, &serde_json::json!({"ok": true})))
        }
        (&Method::GET, ["api", "streams", name]) => {
            let tx = state.catalog.tx()?;
            let stream = tx.get_stream(name)?.ok_or_else(|| err!(NotFound, msg("no such stream {name:?}")))?;
            Ok(json_response(StatusCode::OK, &stream))
        }
        (&Method::PUT, ["api", "streams", name]) => {
            let body = read_json::<StreamUpdateRequest>(req).await?;
            let tx = state.catalog.tx()?;
            let mut existing = tx.get_stream(name)?.ok_or_else(|| err!(NotFound, msg("no such stream {name:?}")))?;
            if let Some(enabled) = body.enabled {
                existing.enabled = enabled;
            }
            if let Some(url) = body.url {
                existing.url = url;
            }
            tx.update_stream(name, &to_new_stream(existing))?;
            tx.commit()?;
            Ok(json_response(StatusCode::OK, &serde_json::json!({"ok": true})))
        }
        (&Method::GET, ["api", "streams", name, "motion"]) => {
            let tx = state.catalog.tx()?;
            tx.get_stream(name)?.ok_or_else(|| err!(NotFound, msg("no such stream {name:?}")))?;
            let config = tx.get_motion_config(name)?.unwrap_or_else(|| MotionConfig {
                stream_name: (*name).to_owned(),
                ..Default::default()
            });
            Ok(json_response(StatusCode::OK, &config))
        }
        (&Method::PUT, ["api", "streams", name, "motion"]) => {
            let body = read_json::<MotionConfigRequest>(req).await?;
            let tx = state.catalog.tx()?;
            tx.get_stream(name)?.ok_or_else(|| err!(NotFound, msg("no such stream {name:?}")))?;
            tx.upsert_motion_config(&MotionConfig {
                stream_name: (*name).to_owned(),
                enabled: body.enabled,
                sensitivity: body.sensitivity,
                min_area: body.min_area,
                cooldown_seconds: body.cooldown_seconds,
            })?;
            tx.commit()?;
            Ok(json_response(StatusCode::OK, &serde_json::json!({"ok": true})))
        }
        (&Method::DELETE, ["api", "streams", name]) => {
            let permanent = query.split('&').any(|kv| kv == "permanent=true");
            let tx = state.catalog.tx()?;
            if permanent {
                tx.permanent_delete_stream(name)?;
            } else {
                tx.soft_delete_stream(name)?;
            }
            tx.commit()?;
            Ok(json_response(StatusCode::OK, &serde_json::json!({"ok": true})))
        }
        (&Method::GET, ["api", "recordings"]) => {
            let filter = recording_filter_from_query(query);
            let tx = state.catalog.tx()?;
            let recordings: Vec<Recording> = tx.get_recordings(&filter, Sort::default(), 500, 0)?;
            Ok(json_response(StatusCode::OK, &recordings))
        }
        (&Method::DELETE, ["api", "recordings", id]) => {
            let id: i64 = id.parse().map_err(|_| err!(InvalidArgument, msg("recording id must be an integer")))?;
            let tx = state.catalog.tx()?;
            tx.delete_recording(id)?;
            tx.commit()?;
            Ok(json_response(StatusCode::OK, &serde_json::json!({"ok": true})))
        }
        (&Method::GET, ["api", "detections"]) => {
            let params = query_params(query);
            let stream_name = params.get("stream").cloned().ok_or_else(|| err!(InvalidArgument, msg("missing stream query param")))?;
            let start: i64 = params.get("start").and_then(|s| s.parse().ok()).unwrap_or(0);
            let end: i64 = params.get("end").and_then(|s| s.parse().ok()).unwrap_or(i64::MAX);
            let tx = state.catalog.tx()?;
            let detections: Vec<DetectionEvent> = tx.query_detections(&stream_name, start, end)?;
            Ok(json_response(StatusCode::OK, &detections))
        }
        _ => Err(err!(NotFound, msg("no such route: {method} {path}"))),
    }
}

fn health_status<C: Clocks + Clone>(state: &State<C>) -> HealthStatus {
    let now = state.clocks.realtime().as_second();
    HealthStatus {
        healthy: true,
        status: "ok",
        uptime: now - state.start_time,
        total_requests: state.total_requests.load(Ordering::Relaxed),
        failed_requests: state.failed_requests.load(Ordering::Relaxed),
        timestamp: now,
    }
}

fn query_params(query: &str) -> std::collections::HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes()).into_owned().collect()
}

fn recording_filter_from_query(query: &str) -> RecordingFilter {
    let params = query_params(query);
    RecordingFilter {
        stream_name: params.get("stream").cloned(),
        start_after: params.get("start_after").and_then(|s| s.parse().ok()),
        end_before: params.get("end_before").and_then(|s| s.parse().ok()),
        complete_only: params.get("complete_only").map(|s| s == "true").unwrap_or(false),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<T, Error> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| err!(InvalidArgument, msg("reading request body"), source(e)))?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| err!(InvalidArgument, msg("parsing JSON body"), source(e)))
}

fn json_response(status: StatusCode, body: &impl Serialize) -> Response<ResponseBody> {
    let bytes = serde_json::to_vec(body).expect("serializing a response body never fails");
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .expect("building a response from a fixed set of headers never fails")
}

fn error_response(e: &Error) -> Response<ResponseBody> {
    let status = StatusCode::from_u16(e.kind().http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &serde_json::json!({"error": e.to_string()}))
}

/// Request body for `POST /api/streams`; only the fields an operator
/// actually needs to supply, with sensible defaults for the rest (§3
/// Stream's many attributes mostly matter to the ingest pipeline, not to
/// registration).
#[derive(serde::Deserialize)]
struct NewStreamRequest {
    name: String,
    url: String,
    #[serde(default)]
    record_audio: bool,
}

#[derive(serde::Deserialize)]
struct MotionConfigRequest {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_motion_sensitivity")]
    sensitivity: f64,
    #[serde(default = "default_motion_min_area")]
    min_area: f64,
    #[serde(default = "default_motion_cooldown")]
    cooldown_seconds: i64,
}

fn default_motion_sensitivity() -> f64 {
    0.5
}

fn default_motion_min_area() -> f64 {
    0.01
}

fn default_motion_cooldown() -> i64 {
    30
}

#[derive(serde::Deserialize, Default)]
struct StreamUpdateRequest {
    enabled: Option<bool>,
    url: Option<String>,
}

fn to_new_stream(s: StreamRow) -> NewStream {
    NewStream {
        name: s.name,
        url: s.url,
        enabled: s.enabled,
        streaming_enabled: s.streaming_enabled,
        width: s.width,
        height: s.height,
        fps: s.fps,
        codec: s.codec,
        priority: s.priority,
        record: s.record,
        segment_duration: s.segment_duration,
        protocol: s.protocol,
        is_onvif: s.is_onvif,
        record_audio: s.record_audio,
        backchannel_enabled: s.backchannel_enabled,
        detection: s.detection,
        retention: s.retention,
        ptz: s.ptz,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use jiff::Timestamp;

    fn test_state() -> Arc<State<SimulatedClocks>> {
        let clocks = SimulatedClocks::new(Timestamp::from_second(1_700_000_000).unwrap());
        let catalog = Arc::new(Catalog::new(rusqlite::Connection::open_in_memory().unwrap(), clocks.clone()).unwrap());
        Arc::new(State {
            catalog,
            storage_root: std::env::temp_dir(),
            clocks,
            start_time: 1_700_000_000,
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
        })
    }

    #[test]
    fn health_status_reports_uptime() {
        let state = test_state();
        state.clocks.sleep(jiff::SignedDuration::from_secs(30));
        let status = health_status(&state);
        assert!(status.healthy);
        assert_eq!(status.uptime, 30);
    }

    #[test]
    fn query_params_parses_pairs() {
        let params = query_params("stream=front&start=10&end=20");
        assert_eq!(params.get("stream").map(String::as_str), Some("front"));
        assert_eq!(params.get("start").map(String::as_str), Some("10"));
        assert_eq!(params.get("end").map(String::as_str), Some("20"));
    }

    #[test]
    fn recording_filter_parses_stream_and_bounds() {
        let filter = recording_filter_from_query("stream=front&start_after=5&end_before=100&complete_only=true");
        assert_eq!(filter.stream_name.as_deref(), Some("front"));
        assert_eq!(filter.start_after, Some(5));
        assert_eq!(filter.end_before, Some(100));
        assert!(filter.complete_only);
    }
}
