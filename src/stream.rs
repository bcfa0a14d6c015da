// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The RTSP source abstraction (part of C5): opens a camera's RTSP session
//! and yields demuxed, stream-copied packets — both video and audio, unlike
//! the teacher's video-only original — via the [`Opener`]/[`Stream`] trait
//! pair it uses for test injection.

use base::{bail, err, Error};
use futures::StreamExt;
use retina::client::Demuxed;
use retina::codec::{CodecItem, ParametersRef};
use std::pin::Pin;
use tracing::Instrument;
use url::Url;

use crate::buffer::{Packet, StreamKind};
use crate::h264;
use crate::writer::TrackParams;

static RETINA_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub struct Options {
    pub session: retina::client::SessionOptions,
    pub setup: retina::client::SetupOptions,
    /// Whether to also set up the stream's audio media, if present (§3
    /// Stream `record_audio`).
    pub want_audio: bool,
}

/// One demuxed item plus, when the source just (re)negotiated parameters,
/// the updated track parameters to reinitialize a writer's `stsd` with.
pub struct Frame {
    pub packet: Packet,
    pub new_video_params: Option<TrackParams>,
    pub new_audio_params: Option<TrackParams>,
}

/// Opens a RTSP stream. This is a trait for test injection.
pub trait Opener: Send + Sync {
    /// Opens the given RTSP URL.
    ///
    /// Note: despite the blocking interface, this expects to be called from
    /// the context of a multithreaded tokio runtime with IO and time enabled.
    fn open(&self, label: String, url: Url, options: Options) -> Result<Box<dyn Stream>, Error>;
}

pub trait Stream: Send {
    fn tool(&self) -> Option<&retina::client::Tool>;
    fn video_params(&self) -> &TrackParams;
    fn audio_params(&self) -> Option<&TrackParams>;
    fn next(&mut self) -> Result<Frame, Error>;
}

pub struct RealOpener;

pub const OPENER: RealOpener = RealOpener;

impl Opener for RealOpener {
    fn open(&self, label: String, url: Url, mut options: Options) -> Result<Box<dyn Stream>, Error> {
        options.session = options.session.user_agent(format!("Camwatch {}", env!("CARGO_PKG_VERSION")));
        let rt_handle = tokio::runtime::Handle::current();
        let (inner, first_frame) = rt_handle
            .block_on(rt_handle.spawn(tokio::time::timeout(RETINA_TIMEOUT, RetinaStreamInner::play(label, url, options)).in_current_span()))
            .expect("RetinaStream::play task panicked, see earlier error")
            .map_err(|e| err!(DeadlineExceeded, msg("unable to play stream and get first frame within {RETINA_TIMEOUT:?}"), source(e)))??;
        Ok(Box::new(RetinaStream {
            inner: Some(inner),
            rt_handle,
            first_frame: Some(first_frame),
        }))
    }
}

/// Real stream, implemented with the Retina library.
///
/// Retina is asynchronous and tokio-based where the ingest thread expects a
/// synchronous stream interface. This blocks on the tokio operations,
/// handing the inner state off to a spawned task each call — see the
/// teacher's own note on why `block_on(spawn(...))` beats a bare `block_on`.
struct RetinaStream {
    inner: Option<Box<RetinaStreamInner>>,
    rt_handle: tokio::runtime::Handle,
    first_frame: Option<DemuxedFrame>,
}

struct RetinaStreamInner {
    label: String,
    session: Demuxed,
    video_i: usize,
    audio_i: Option<usize>,
    video_params: TrackParams,
    audio_params: Option<TrackParams>,
    /// Whether video sample data arrives in Annex B form and needs
    /// [`h264::transform_sample_data`] before it's in AVC form.
    video_need_transform: bool,
}

enum DemuxedFrame {
    Video { timestamp: i64, is_key: bool, data: bytes::Bytes },
    Audio { timestamp: i64, data: bytes::Bytes },
}

/// H.264 RTP payload always uses a 90 kHz clock, per RFC 6184 — fixed, not
/// negotiated, so there's no need to ask retina for it.
const H264_RTP_CLOCK_RATE: u32 = 90_000;

/// Returns the track parameters plus whether per-sample data needs Annex B
/// -> AVC transformation (§h264 `ExtraData::need_transform`): some RTSP
/// servers describe H.264 in Annex B form, in which case the sample data
/// arrives in that form too and must be converted before it can sit in an
/// `avcC`-described `.mp4` track.
fn video_params_to_track(params: &retina::codec::VideoParameters) -> Result<(TrackParams, bool), Error> {
    let (width, height) = params.pixel_dimensions();
    let width = u16::try_from(width).map_err(|e| err!(Unknown, source(e)))?;
    let height = u16::try_from(height).map_err(|e| err!(Unknown, source(e)))?;
    let entry = h264::ExtraData::parse(params.extra_data(), width, height)?;
    Ok((
        TrackParams {
            sample_entry: entry.entry.data,
            timescale: H264_RTP_CLOCK_RATE,
        },
        entry.need_transform,
    ))
}

fn audio_params_to_track(params: &retina::codec::AudioParameters) -> Result<TrackParams, Error> {
    // For AAC, the RTP clock rate always equals the sample rate (RFC 3640).
    let sample_rate = params.sample_rate();
    let sample_entry = crate::writer::aac_sample_entry(params.channels(), sample_rate, params.extra_data())?;
    Ok(TrackParams {
        sample_entry,
        timescale: sample_rate,
    })
}

/// Applies [`h264::transform_sample_data`] to a video frame's bytes when the
/// session's extra data was in Annex B form, leaving audio frames untouched.
fn transform_if_needed(frame: DemuxedFrame, need_transform: bool) -> DemuxedFrame {
    match frame {
        DemuxedFrame::Video { timestamp, is_key, data } if need_transform => {
            let mut out = Vec::new();
            match h264::transform_sample_data(&data, &mut out) {
                Ok(()) => DemuxedFrame::Video { timestamp, is_key, data: out.into() },
                Err(e) => {
                    tracing::warn!("Annex B -> AVC transform failed, passing sample through as-is: {e}");
                    DemuxedFrame::Video { timestamp, is_key, data }
                }
            }
        }
        other => other,
    }
}

impl RetinaStreamInner {
    /// Plays to first frame. No timeout; that's the caller's responsibility.
    async fn play(label: String, url: Url, options: Options) -> Result<(Box<Self>, DemuxedFrame), Error> {
        let mut session = retina::client::Session::describe(url, options.session).await.map_err(|e| err!(Unknown, source(e)))?;
        tracing::debug!("connected to {:?}, tool {:?}", &label, session.tool());
        let video_i = session
            .streams()
            .iter()
            .position(|s| s.media() == "video" && matches!(s.encoding_name(), "h264"))
            .ok_or_else(|| err!(FailedPrecondition, msg("couldn't find a supported video stream")))?;
        session.setup(video_i, options.setup.clone()).await.map_err(|e| err!(Unknown, source(e)))?;

        let audio_i = if options.want_audio {
            session.streams().iter().position(|s| s.media() == "audio" && matches!(s.encoding_name(), "aac"))
        } else {
            None
        };
        if let Some(audio_i) = audio_i {
            if let Err(e) = session.setup(audio_i, options.setup.clone()).await {
                tracing::warn!("{}: audio setup failed, continuing video-only: {e}", &label);
            }
        }

        let session = session.play(retina::client::PlayOptions::default()).await.map_err(|e| err!(Unknown, source(e)))?;
        let mut session = session.demuxed().map_err(|e| err!(Unknown, source(e)))?;

        let first_frame = loop {
            match Pin::new(&mut session).next().await {
                None => bail!(Unavailable, msg("stream closed before first frame")),
                Some(Err(e)) => bail!(Unknown, msg("unable to get first frame"), source(e)),
                Some(Ok(CodecItem::VideoFrame(v))) => {
                    if v.is_random_access_point() {
                        break DemuxedFrame::Video {
                            timestamp: v.timestamp().elapsed(),
                            is_key: true,
                            data: v.into_data().into(),
                        };
                    }
                }
                Some(Ok(_)) => {}
            }
        };
        let video_params = match session.streams()[video_i].parameters() {
            Some(ParametersRef::Video(v)) => v.clone(),
            _ => bail!(Unknown, msg("couldn't find video parameters")),
        };
        let audio_params = audio_i
            .and_then(|i| match session.streams()[i].parameters() {
                Some(ParametersRef::Audio(a)) => Some(a.clone()),
                _ => None,
            });
        let (video_params, video_need_transform) = video_params_to_track(&video_params)?;
        let audio_params = audio_params.map(|a| audio_params_to_track(&a)).transpose()?;
        let self_ = Box::new(Self {
            label,
            session,
            video_i,
            audio_i,
            video_params,
            audio_params,
            video_need_transform,
        });
        let first_frame = transform_if_needed(first_frame, video_need_transform);
        Ok((self_, first_frame))
    }

    async fn fetch_next_frame(mut self: Box<Self>) -> Result<(Box<Self>, DemuxedFrame, Option<TrackParams>), Error> {
        loop {
            match Pin::new(&mut self.session).next().await.transpose().map_err(|e| err!(Unknown, source(e)))? {
                None => bail!(Unavailable, msg("end of stream")),
                Some(CodecItem::VideoFrame(v)) => {
                    if v.loss() > 0 {
                        tracing::warn!("{}: lost {} RTP packets @ {}", &self.label, v.loss(), v.start_ctx());
                    }
                    let new_params = if v.has_new_parameters() {
                        match self.session.streams()[self.video_i].parameters() {
                            Some(ParametersRef::Video(v)) => {
                                let (params, need_transform) = video_params_to_track(v)?;
                                self.video_need_transform = need_transform;
                                Some(params)
                            }
                            _ => None,
                        }
                    } else {
                        None
                    };
                    let frame = DemuxedFrame::Video {
                        timestamp: v.timestamp().elapsed(),
                        is_key: v.is_random_access_point(),
                        data: v.into_data().into(),
                    };
                    let frame = transform_if_needed(frame, self.video_need_transform);
                    return Ok((self, frame, new_params));
                }
                Some(CodecItem::AudioFrame(a)) if Some(a.stream_id()) == self.audio_i => {
                    let frame = DemuxedFrame::Audio {
                        timestamp: a.timestamp().elapsed(),
                        data: a.into_data().into(),
                    };
                    return Ok((self, frame, None));
                }
                Some(_) => {}
            }
        }
    }
}

impl Stream for RetinaStream {
    fn tool(&self) -> Option<&retina::client::Tool> {
        self.inner.as_ref().unwrap().session.tool()
    }

    fn video_params(&self) -> &TrackParams {
        &self.inner.as_ref().unwrap().video_params
    }

    fn audio_params(&self) -> Option<&TrackParams> {
        self.inner.as_ref().unwrap().audio_params.as_ref()
    }

    fn next(&mut self) -> Result<Frame, Error> {
        let (demuxed, new_video_params) = match self.first_frame.take() {
            Some(f) => (f, None),
            None => {
                let inner = self.inner.take().unwrap();
                let (mut inner, frame, new_params) = self
                    .rt_handle
                    .block_on(self.rt_handle.spawn(tokio::time::timeout(RETINA_TIMEOUT, inner.fetch_next_frame()).in_current_span()))
                    .expect("fetch_next_frame task panicked, see earlier error")
                    .map_err(|e| err!(DeadlineExceeded, msg("unable to get next frame within {RETINA_TIMEOUT:?}"), source(e)))??;
                let new_video_params = match new_params {
                    Some(p) if p != inner.video_params => {
                        tracing::debug!("{}: video parameter change", &inner.label);
                        inner.video_params = p.clone();
                        Some(p)
                    }
                    _ => None,
                };
                self.inner = Some(inner);
                (frame, new_video_params)
            }
        };
        let packet = match demuxed {
            DemuxedFrame::Video { timestamp, is_key, data } => Packet {
                kind: StreamKind::Video,
                keyframe: is_key,
                data,
                dts: timestamp,
                pts: timestamp,
            },
            DemuxedFrame::Audio { timestamp, data } => Packet {
                kind: StreamKind::Audio,
                keyframe: true,
                data,
                dts: timestamp,
                pts: timestamp,
            },
        };
        Ok(Frame {
            packet,
            new_video_params,
            new_audio_params: None,
        })
    }
}

#[cfg(test)]
pub mod testutil {
    use mp4::mp4box::WriteBox as _;

    use super::*;
    use std::io::Cursor;

    /// A canned source that replays an existing `.mp4`'s video track,
    /// matching the teacher's own `Mp4Stream` test double (grounded on its
    /// `stream.rs::testutil::Mp4Stream`).
    pub struct Mp4Stream {
        reader: mp4::Mp4Reader<Cursor<Vec<u8>>>,
        h264_track_id: u32,
        next_sample_id: u32,
        video_params: TrackParams,
    }

    impl Mp4Stream {
        pub fn open(path: &str) -> Result<Self, Error> {
            let f = std::fs::read(path)?;
            let len = f.len();
            let reader =
                mp4::Mp4Reader::read_header(Cursor::new(f), u64::try_from(len).expect("len in u64 range")).map_err(|e| err!(Unknown, source(e)))?;
            let h264_track = match reader.tracks().values().find(|t| matches!(t.media_type(), Ok(mp4::MediaType::H264))) {
                None => bail!(InvalidArgument, msg("expected a H.264 track, tracks were: {:#?}", reader.tracks())),
                Some(t) => t,
            };
            let mut data = Vec::new();
            h264_track.trak.mdia.minf.stbl.stsd.avc1.as_ref().unwrap().write_box(&mut data).unwrap();
            let video_params = TrackParams { sample_entry: data, timescale: 90_000 };
            let h264_track_id = h264_track.track_id();
            Ok(Mp4Stream { reader, h264_track_id, next_sample_id: 1, video_params })
        }

        pub fn duration(&self) -> u64 {
            self.reader.moov.mvhd.duration
        }
    }

    impl Stream for Mp4Stream {
        fn tool(&self) -> Option<&retina::client::Tool> {
            None
        }

        fn video_params(&self) -> &TrackParams {
            &self.video_params
        }

        fn audio_params(&self) -> Option<&TrackParams> {
            None
        }

        fn next(&mut self) -> Result<Frame, Error> {
            let sample = self
                .reader
                .read_sample(self.h264_track_id, self.next_sample_id)
                .map_err(|e| err!(Unknown, source(e)))?
                .ok_or_else(|| err!(OutOfRange, msg("end of file")))?;
            self.next_sample_id += 1;
            Ok(Frame {
                packet: Packet {
                    kind: StreamKind::Video,
                    keyframe: sample.is_sync,
                    data: sample.bytes,
                    dts: sample.start_time as i64,
                    pts: sample.start_time as i64,
                },
                new_video_params: None,
                new_audio_params: None,
            })
        }
    }
}
