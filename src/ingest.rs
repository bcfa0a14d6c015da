// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The stream ingest thread (C5): one per enabled stream, running the
//! connect/buffer/record/reconnect state machine of §4.5.
//!
//! Grounded on the teacher's `streamer.rs` run/run_once loop — the overall
//! "loop calling a fallible step, sleeping and logging a warning on error"
//! shape is the same — generalized with the buffering/detection/pre-roll/
//! post-roll states the teacher's continuous-rotation recorder never
//! needed.

use std::path::PathBuf;
use std::sync::Arc;

use base::clock::{Clocks, Instant};
use base::{Error, Mutex};
use jiff::SignedDuration;
use tracing::{info, instrument, warn};
use url::Url;

use crate::buffer::{Packet, PacketBuffer, StreamKind};
use crate::decode::KeyframeDecoder;
use crate::predictor::Predictor;
use crate::stream::{Opener, Options};
use crate::writer::{SourceParams, TrackParams, Writer};
use catalog::model::{NewRecording, RecordingUpdate, TriggerType};
use catalog::Catalog;

/// §4.5's named states.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum IngestState {
    Initializing,
    Connecting,
    Buffering,
    Recording,
    PostBuffer,
    Reconnecting,
    Stopping,
    Stopped,
}

/// Live counters exposed to the registry/HTTP surface (§4.6 `stats`).
#[derive(Clone, Debug, Default)]
pub struct IngestStats {
    pub packets_received: u64,
    pub recordings_started: u64,
    pub reconnects: u64,
    pub last_error: Option<String>,
}

/// Shared, lock-protected status a [`crate::registry`] handle reads from
/// another thread while the ingest thread itself only ever writes to it.
pub struct SharedStatus {
    pub state: Mutex<IngestState>,
    pub stats: Mutex<IngestStats>,
}

impl SharedStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(SharedStatus {
            state: Mutex::new(IngestState::Initializing),
            stats: Mutex::new(IngestStats::default()),
        })
    }

    fn set_state(&self, s: IngestState) {
        *self.state.lock() = s;
    }
}

const PACKET_READ_TIMEOUT: SignedDuration = SignedDuration::from_secs(10);
const DETECTION_GRACE: SignedDuration = SignedDuration::from_secs(2);
const BACKOFF_BASE: SignedDuration = SignedDuration::from_millis(500);
const BACKOFF_CAP: SignedDuration = SignedDuration::from_secs(30);

/// A stream's motion-recording policy (the `motion_config` table), resolved
/// once at thread start. `None` means motion-triggered recording is off for
/// this stream — only the AI-detection and continuous paths apply.
#[derive(Clone, Debug)]
pub struct MotionSettings {
    /// Higher values treat smaller per-pixel changes as motion.
    pub sensitivity: f64,
    /// Fraction of the frame (0.0-1.0) that must change to count as motion.
    pub min_area: f64,
    /// Minimum gap between the end of one motion recording's trigger check
    /// and the start of the next.
    pub cooldown: SignedDuration,
}

/// Everything one ingest thread needs; built by [`crate::registry`] and
/// moved into the thread.
pub struct IngestContext<C: Clocks + Clone> {
    pub stream_name: String,
    pub url: Url,
    pub record_audio: bool,
    pub buffer_capacity: SignedDuration,
    pub detection_enabled: bool,
    pub detection_interval: i64,
    pub detection_threshold: f64,
    pub pre_roll: SignedDuration,
    pub post_roll: SignedDuration,
    pub motion: Option<MotionSettings>,
    pub storage_root: PathBuf,
    pub catalog: Arc<Catalog<C>>,
    pub opener: Arc<dyn Opener>,
    pub predictor: Option<Arc<dyn Predictor>>,
    pub clocks: C,
    pub shutdown_rx: base::shutdown::Receiver,
    pub status: Arc<SharedStatus>,
    /// Entered once at thread start so `tokio::runtime::Handle::current()`
    /// resolves inside the blocking `Opener` (§2 Design Notes).
    pub runtime: tokio::runtime::Handle,
}

/// Thread body. Runs until shutdown is requested or the registry asks it to
/// stop, then returns.
#[instrument(skip_all, fields(stream = %ctx.stream_name))]
pub fn run<C: Clocks + Clone>(mut ctx: IngestContext<C>) {
    let _guard = ctx.runtime.enter();
    let mut fsm = Fsm::new(&ctx);
    ctx.status.set_state(IngestState::Initializing);

    'outer: loop {
        match fsm.state {
            IngestState::Initializing => {
                ctx.status.set_state(IngestState::Connecting);
                fsm.state = IngestState::Connecting;
            }
            IngestState::Connecting => {
                if ctx.shutdown_rx.check().is_err() {
                    fsm.state = IngestState::Stopping;
                    continue 'outer;
                }
                match open_stream(&ctx) {
                    Ok(s) => {
                        fsm.source = Some(s);
                        fsm.connect_failures = 0;
                        ctx.status.set_state(IngestState::Buffering);
                        fsm.state = IngestState::Buffering;
                    }
                    Err(e) => {
                        fsm.connect_failures += 1;
                        ctx.status.stats.lock().last_error = Some(e.chain());
                        warn!(exception = %e.chain(), attempt = fsm.connect_failures, "connect failed");
                        let backoff = backoff_for(fsm.connect_failures);
                        ctx.clocks.sleep(backoff);
                    }
                }
            }
            IngestState::Buffering | IngestState::Recording | IngestState::PostBuffer => {
                if ctx.shutdown_rx.check().is_err() {
                    fsm.state = IngestState::Stopping;
                    continue 'outer;
                }
                match fsm.step(&ctx) {
                    Ok(()) => {}
                    Err(StepError::Timeout) => {
                        info!("packet read timeout, reconnecting");
                        ctx.status.set_state(IngestState::Reconnecting);
                        fsm.state = IngestState::Reconnecting;
                    }
                    Err(StepError::Fatal(e)) => {
                        warn!(exception = %e.chain(), "ingest step failed, reconnecting");
                        ctx.status.stats.lock().last_error = Some(e.chain());
                        ctx.status.set_state(IngestState::Reconnecting);
                        fsm.state = IngestState::Reconnecting;
                    }
                }
            }
            IngestState::Reconnecting => {
                fsm.close_writer(&ctx, /* clean= */ true);
                fsm.buffer.clear();
                fsm.source = None;
                ctx.status.stats.lock().reconnects += 1;
                ctx.status.set_state(IngestState::Connecting);
                fsm.state = IngestState::Connecting;
            }
            IngestState::Stopping => {
                fsm.close_writer(&ctx, /* clean= */ true);
                fsm.source = None;
                ctx.status.set_state(IngestState::Stopped);
                fsm.state = IngestState::Stopped;
            }
            IngestState::Stopped => break 'outer,
        }
    }
}

fn backoff_for(attempt: u32) -> SignedDuration {
    let millis = 500u64.saturating_mul(1u64 << attempt.min(6));
    SignedDuration::from_millis(millis as i64).min(BACKOFF_CAP).max(BACKOFF_BASE)
}

fn open_stream<C: Clocks + Clone>(ctx: &IngestContext<C>) -> Result<Box<dyn crate::stream::Stream>, Error> {
    let options = Options {
        session: retina::client::SessionOptions::default(),
        setup: retina::client::SetupOptions::default(),
        want_audio: ctx.record_audio,
    };
    ctx.opener.open(ctx.stream_name.clone(), ctx.url.clone(), options)
}

enum StepError {
    Timeout,
    Fatal(Error),
}

/// The mutable state the big `match` in [`run`] threads through.
struct Fsm {
    state: IngestState,
    source: Option<Box<dyn crate::stream::Stream>>,
    buffer: PacketBuffer,
    writer: Option<Writer>,
    video_params: Option<TrackParams>,
    audio_params: Option<TrackParams>,
    keyframe_counter: i64,
    last_detection_time: Option<Instant>,
    writer_creation_time: Option<Instant>,
    recording_id: Option<i64>,
    recording_start: Option<i64>,
    /// Which trigger opened the current (or most recently closed) recording
    /// row, so [`Fsm::on_recording_keyframe`] and [`Fsm::close_writer`] know
    /// whether to read/write `recordings` or `motion_recordings`.
    current_trigger: TriggerType,
    /// Decodes buffered keyframes to RGB for the AI predictor and/or the
    /// motion-diff heuristic; `None` when neither detection nor motion is
    /// enabled for this stream, or the decoder failed to open.
    decoder: Option<KeyframeDecoder>,
    /// Last frame decoded for the motion heuristic, kept to diff against the
    /// next one.
    motion_prev_frame: Option<(Vec<u8>, u32, u32)>,
    last_motion_time: Option<Instant>,
    last_packet_time: Instant,
    connect_failures: u32,
}

impl Fsm {
    fn new<C: Clocks + Clone>(ctx: &IngestContext<C>) -> Self {
        let decoder = if ctx.detection_enabled || ctx.motion.is_some() {
            match KeyframeDecoder::new() {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!(exception = %e.chain(), "failed to open H.264 decoder; detection/motion will run without frame pixels");
                    None
                }
            }
        } else {
            None
        };
        Fsm {
            state: IngestState::Initializing,
            source: None,
            buffer: PacketBuffer::new(ctx.buffer_capacity),
            writer: None,
            video_params: None,
            audio_params: None,
            keyframe_counter: 0,
            last_detection_time: None,
            writer_creation_time: None,
            recording_id: None,
            recording_start: None,
            current_trigger: TriggerType::Continuous,
            decoder,
            motion_prev_frame: None,
            last_motion_time: None,
            last_packet_time: ctx.clocks.monotonic(),
            connect_failures: 0,
        }
    }

    /// Reads and handles exactly one packet. Returns `Ok(())` for steady
    /// state, or an error that `run` translates into a RECONNECTING
    /// transition.
    fn step<C: Clocks + Clone>(&mut self, ctx: &IngestContext<C>) -> Result<(), StepError> {
        let now = ctx.clocks.monotonic();
        if now.checked_sub(self.last_packet_time) > PACKET_READ_TIMEOUT {
            return Err(StepError::Timeout);
        }

        let source = self.source.as_mut().expect("step called without an open source");
        let frame = source.next().map_err(StepError::Fatal)?;
        self.last_packet_time = ctx.clocks.monotonic();
        if let Some(p) = frame.new_video_params {
            self.video_params = Some(p);
        }
        if let Some(p) = frame.new_audio_params {
            self.audio_params = Some(p);
        }
        if self.video_params.is_none() {
            self.video_params = Some(source.video_params().clone());
        }
        if self.audio_params.is_none() {
            self.audio_params = source.audio_params().cloned();
        }

        ctx.status.stats.lock().packets_received += 1;
        let receipt = ctx.clocks.monotonic();
        self.buffer.push(frame.packet.clone(), receipt);

        if self.state == IngestState::Buffering {
            self.maybe_run_detection(ctx, &frame.packet)?;
            if self.state == IngestState::Buffering {
                self.maybe_run_motion_detection(ctx, &frame.packet)?;
            }
        } else {
            self.write_live_packet(ctx, &frame.packet).map_err(StepError::Fatal)?;
            if frame.packet.kind == StreamKind::Video && frame.packet.keyframe {
                self.on_recording_keyframe(ctx, &frame.packet)?;
            }
        }
        Ok(())
    }

    fn maybe_run_detection<C: Clocks + Clone>(&mut self, ctx: &IngestContext<C>, packet: &Packet) -> Result<(), StepError> {
        if packet.kind != StreamKind::Video || !packet.keyframe || !ctx.detection_enabled {
            return Ok(());
        }
        self.keyframe_counter += 1;
        if self.keyframe_counter < ctx.detection_interval.max(1) {
            return Ok(());
        }
        self.keyframe_counter = 0;

        let Some(predictor) = ctx.predictor.as_ref() else { return Ok(()) };
        // §4.5 "detection work done under its own per-thread lock": there's
        // exactly one ingest thread per predictor handle here, so a local
        // call is already serialized; the lock matters only for predictor
        // implementations shared across streams (not this crate's wiring).
        let (frame, w, h) = self.decode_keyframe_for_predictor(packet);
        let detections = predictor.predict(&frame, w, h).map_err(StepError::Fatal)?;
        if detections.is_empty() {
            return Ok(());
        }
        self.start_recording(ctx, TriggerType::Detection)?;
        Ok(())
    }

    /// Starts a motion-triggered recording (independent of the AI predictor)
    /// once `motion_config`'s `min_area` threshold is crossed between two
    /// consecutive decoded keyframes, subject to `cooldown_seconds` (§6.2
    /// `motion_config`, §3 `trigger_type = motion`).
    fn maybe_run_motion_detection<C: Clocks + Clone>(&mut self, ctx: &IngestContext<C>, packet: &Packet) -> Result<(), StepError> {
        if packet.kind != StreamKind::Video || !packet.keyframe {
            return Ok(());
        }
        let Some(motion) = ctx.motion.as_ref() else { return Ok(()) };
        let now = ctx.clocks.monotonic();
        if let Some(last) = self.last_motion_time {
            if now.checked_sub(last) < motion.cooldown {
                return Ok(());
            }
        }
        let decoded = self.try_decode_keyframe(packet);
        let Some(fraction) = self.motion_fraction_since_last(decoded, motion.sensitivity) else { return Ok(()) };
        if fraction < motion.min_area {
            return Ok(());
        }
        self.last_motion_time = Some(now);
        self.start_recording(ctx, TriggerType::Motion)?;
        Ok(())
    }

    /// Decodes `packet` (assumed a video keyframe) to RGB, logging and
    /// returning `None` on failure rather than propagating: a missed frame
    /// just means one fewer sample for detection/motion, not a stream fault.
    fn try_decode_keyframe(&mut self, packet: &Packet) -> Option<(Vec<u8>, u32, u32)> {
        let decoder = self.decoder.as_mut()?;
        match decoder.decode_to_rgb(&packet.data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(exception = %e.chain(), "keyframe decode failed");
                None
            }
        }
    }

    /// Like [`Fsm::try_decode_keyframe`], but returns a 0x0 empty buffer
    /// instead of `None` — the shape [`crate::predictor::Predictor::predict`]
    /// expects from callers with nothing to offer (the remote-snapshot
    /// backend ignores the buffer regardless; the embedded backend's resize
    /// step tolerates a zero-sized source).
    fn decode_keyframe_for_predictor(&mut self, packet: &Packet) -> (Vec<u8>, u32, u32) {
        self.try_decode_keyframe(packet).unwrap_or_else(|| (Vec::new(), 0, 0))
    }

    /// Diffs `decoded` against the last frame seen for the motion heuristic,
    /// storing `decoded` as the new reference frame. Returns `None` when
    /// there's no decoded frame, or no prior frame of matching dimensions to
    /// diff against yet.
    fn motion_fraction_since_last(&mut self, decoded: Option<(Vec<u8>, u32, u32)>, sensitivity: f64) -> Option<f64> {
        let (rgb, w, h) = decoded?;
        let fraction = match self.motion_prev_frame.replace((rgb.clone(), w, h)) {
            Some((prev, pw, ph)) if pw == w && ph == h => Some(motion_fraction(&prev, &rgb, sensitivity)),
            _ => None,
        };
        fraction
    }

    fn start_recording<C: Clocks + Clone>(&mut self, ctx: &IngestContext<C>, trigger: TriggerType) -> Result<(), StepError> {
        let now = ctx.clocks.monotonic();
        let start_unix = ctx.clocks.realtime().as_second();
        let path = ctx
            .storage_root
            .join(&ctx.stream_name)
            .join(format!("{start_unix}.mp4"));
        let mut writer = Writer::create(&path, &ctx.stream_name);
        writer.configure_audio(ctx.record_audio);

        let video_params = self.video_params.clone().unwrap_or(TrackParams { sample_entry: Vec::new(), timescale: 90_000 });

        let new_recording = NewRecording {
            stream_name: ctx.stream_name.clone(),
            file_path: path.to_string_lossy().into_owned(),
            start_time: start_unix,
            width: 0,
            height: 0,
            fps: 0.0,
            codec: "h264".to_owned(),
            trigger_type: trigger,
        };
        let tx = ctx.catalog.tx().map_err(StepError::Fatal)?;
        let id = match trigger {
            TriggerType::Motion => tx.add_motion_recording(&new_recording),
            TriggerType::Continuous | TriggerType::Detection => tx.add_recording(&new_recording),
        }
        .map_err(StepError::Fatal)?;
        tx.commit().map_err(StepError::Fatal)?;

        let mut init_error = None;
        let flushed = self.buffer.flush(|p| {
            if p.kind != StreamKind::Video {
                return Ok(());
            }
            if !writer.is_initialized() {
                if let Err(e) = writer.initialize(p, video_params.clone(), 0, 0) {
                    init_error = Some(e);
                    return Err(());
                }
            } else if let Err(e) = writer.write(p, SourceParams::Video(&video_params)) {
                init_error = Some(e);
                return Err(());
            }
            Ok(())
        });
        if flushed.is_err() || init_error.is_some() {
            warn!("pre-roll flush failed, abandoning recording and staying in BUFFERING");
            writer.abort();
            let update = RecordingUpdate { end_time: start_unix, size_bytes: 0, is_complete: true };
            let _ = ctx.catalog.tx().and_then(|tx| {
                match trigger {
                    TriggerType::Motion => tx.update_motion_recording(id, &update),
                    TriggerType::Continuous | TriggerType::Detection => tx.update_recording(id, &update),
                }?;
                tx.commit()
            });
            return Ok(());
        }

        self.writer = Some(writer);
        self.writer_creation_time = Some(now);
        self.last_detection_time = Some(now);
        self.recording_id = Some(id);
        self.recording_start = Some(start_unix);
        self.current_trigger = trigger;
        ctx.status.stats.lock().recordings_started += 1;
        ctx.status.set_state(IngestState::Recording);
        self.state = IngestState::Recording;
        Ok(())
    }

    fn write_live_packet<C: Clocks + Clone>(&mut self, ctx: &IngestContext<C>, packet: &Packet) -> Result<(), Error> {
        let Some(writer) = self.writer.as_mut() else { return Ok(()) };
        if !writer.is_initialized() {
            if packet.kind == StreamKind::Video && packet.keyframe {
                if let Some(vp) = self.video_params.clone() {
                    writer.initialize(packet, vp, 0, 0)?;
                }
            }
            return Ok(());
        }
        let params = match packet.kind {
            StreamKind::Video => self.video_params.as_ref().map(SourceParams::Video),
            StreamKind::Audio => self.audio_params.as_ref().map(SourceParams::Audio),
        };
        if let Some(params) = params {
            writer.write(packet, params)?;
        }
        let _ = ctx;
        Ok(())
    }

    /// Runs on every video keyframe while RECORDING/POST_BUFFER: advances or
    /// ends the recording per §4.5's timing rules.
    fn on_recording_keyframe<C: Clocks + Clone>(&mut self, ctx: &IngestContext<C>, packet: &Packet) -> Result<(), StepError> {
        let now = ctx.clocks.monotonic();

        if let Some(created) = self.writer_creation_time {
            if now.checked_sub(created) >= ctx.pre_roll + ctx.post_roll {
                info!("max recording duration reached, rotating");
                self.close_writer(ctx, true);
                ctx.status.set_state(IngestState::Buffering);
                self.state = IngestState::Buffering;
                return Ok(());
            }
        }

        let active = match self.current_trigger {
            TriggerType::Detection => match self.check_detection_activity(ctx, packet)? {
                Some(active) => active,
                None => return Ok(()),
            },
            TriggerType::Motion => self.check_motion_activity(ctx, packet),
            TriggerType::Continuous => return Ok(()),
        };

        if active {
            self.last_detection_time = Some(now);
            if self.state == IngestState::PostBuffer {
                ctx.status.set_state(IngestState::Recording);
                self.state = IngestState::Recording;
            }
            return Ok(());
        }

        match self.state {
            IngestState::Recording => {
                let since = now.checked_sub(self.last_detection_time.unwrap_or(now));
                if since > DETECTION_GRACE {
                    ctx.status.set_state(IngestState::PostBuffer);
                    self.state = IngestState::PostBuffer;
                }
            }
            IngestState::PostBuffer => {
                let post_buffer_end = self.last_detection_time.unwrap_or(now) + DETECTION_GRACE + ctx.post_roll;
                if now >= post_buffer_end {
                    self.close_writer(ctx, true);
                    ctx.status.set_state(IngestState::Buffering);
                    self.state = IngestState::Buffering;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Re-runs the AI predictor against the current keyframe, subsampled by
    /// `detection_interval` exactly as the BUFFERING-state check does.
    /// Returns `None` when this keyframe was skipped by the interval (caller
    /// should leave the recording's state alone), `Some(true)` when the
    /// predictor found something, `Some(false)` otherwise.
    fn check_detection_activity<C: Clocks + Clone>(&mut self, ctx: &IngestContext<C>, packet: &Packet) -> Result<Option<bool>, StepError> {
        if !ctx.detection_enabled {
            return Ok(None);
        }
        let Some(predictor) = ctx.predictor.as_ref() else { return Ok(None) };
        self.keyframe_counter += 1;
        if self.keyframe_counter < ctx.detection_interval.max(1) {
            return Ok(None);
        }
        self.keyframe_counter = 0;
        let (frame, w, h) = self.decode_keyframe_for_predictor(packet);
        let detections = predictor.predict(&frame, w, h).map_err(StepError::Fatal)?;
        Ok(Some(!detections.is_empty()))
    }

    /// Diffs this keyframe against the last one to decide whether motion is
    /// still ongoing, so the recording's post-roll/grace timers keep working
    /// the same way they do for detection-triggered recordings.
    fn check_motion_activity<C: Clocks + Clone>(&mut self, ctx: &IngestContext<C>, packet: &Packet) -> bool {
        let Some(motion) = ctx.motion.as_ref() else { return false };
        let decoded = self.try_decode_keyframe(packet);
        match self.motion_fraction_since_last(decoded, motion.sensitivity) {
            Some(fraction) => fraction >= motion.min_area,
            None => false,
        }
    }

    /// Closes the writer (if any), updating the catalog row to its final
    /// state. `clean` distinguishes a normal close from a discard; today
    /// both paths finalize the row the same way, since a never-initialized
    /// writer simply produced no file (§4.3).
    fn close_writer<C: Clocks + Clone>(&mut self, ctx: &IngestContext<C>, clean: bool) {
        let _ = clean;
        let Some(writer) = self.writer.take() else { return };
        let Some(id) = self.recording_id.take() else {
            writer.abort();
            return;
        };
        let end_time = ctx.clocks.realtime().as_second();
        let trigger = self.current_trigger;
        let finalize = |update: &RecordingUpdate| {
            ctx.catalog.tx().and_then(|tx| {
                match trigger {
                    TriggerType::Motion => tx.update_motion_recording(id, update),
                    TriggerType::Continuous | TriggerType::Detection => tx.update_recording(id, update),
                }?;
                tx.commit()
            })
        };
        match writer.close() {
            Ok(Some(summary)) => {
                let update = RecordingUpdate { end_time, size_bytes: summary.size_bytes, is_complete: true };
                if let Err(e) = finalize(&update) {
                    warn!(exception = %e.chain(), "failed to finalize recording row");
                }
            }
            Ok(None) => {
                let update = RecordingUpdate { end_time, size_bytes: 0, is_complete: true };
                if let Err(e) = finalize(&update) {
                    warn!(exception = %e.chain(), "failed to finalize empty recording row");
                }
            }
            Err(e) => {
                warn!(exception = %e.chain(), "closing writer failed");
            }
        }
        self.writer_creation_time = None;
        self.recording_start = None;
    }
}

/// Fraction (0.0-1.0) of pixels whose summed per-channel RGB delta exceeds a
/// threshold derived from `sensitivity` (higher sensitivity, lower
/// threshold). Returns 0.0 if the two buffers don't have a matching length,
/// or either is empty.
fn motion_fraction(prev: &[u8], curr: &[u8], sensitivity: f64) -> f64 {
    if prev.len() != curr.len() || prev.is_empty() {
        return 0.0;
    }
    let threshold = (255.0 * (1.0 - sensitivity.clamp(0.0, 1.0))).max(4.0) as i32;
    let pixels = prev.len() / 3;
    let mut changed = 0usize;
    for i in 0..pixels {
        let o = i * 3;
        let dr = (prev[o] as i32 - curr[o] as i32).abs();
        let dg = (prev[o + 1] as i32 - curr[o + 1] as i32).abs();
        let db = (prev[o + 2] as i32 - curr[o + 2] as i32).abs();
        if dr + dg + db > threshold {
            changed += 1;
        }
    }
    changed as f64 / pixels.max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_for(0), SignedDuration::from_millis(500));
        assert_eq!(backoff_for(1), SignedDuration::from_secs(1));
        assert!(backoff_for(10) <= BACKOFF_CAP);
    }

    #[test]
    fn shared_status_starts_initializing() {
        let status = SharedStatus::new();
        assert_eq!(*status.state.lock(), IngestState::Initializing);
    }

    #[test]
    fn motion_fraction_is_zero_for_identical_frames() {
        let frame = vec![10u8, 20, 30, 200, 100, 50];
        assert_eq!(motion_fraction(&frame, &frame, 0.5), 0.0);
    }

    #[test]
    fn motion_fraction_detects_changed_pixels() {
        let prev = vec![0u8, 0, 0, 0, 0, 0];
        let curr = vec![0u8, 0, 0, 255, 255, 255];
        assert_eq!(motion_fraction(&prev, &curr, 0.5), 0.5);
    }

    #[test]
    fn motion_fraction_ignores_mismatched_buffers() {
        assert_eq!(motion_fraction(&[1, 2, 3], &[1, 2], 0.5), 0.0);
        assert_eq!(motion_fraction(&[], &[], 0.5), 0.0);
    }

    #[test]
    fn higher_sensitivity_lowers_the_change_threshold() {
        let prev = vec![100u8, 100, 100];
        let curr = vec![105u8, 100, 100];
        assert_eq!(motion_fraction(&prev, &curr, 0.0), 0.0);
        assert_eq!(motion_fraction(&prev, &curr, 1.0), 1.0);
    }
}
