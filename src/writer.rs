// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The recording writer (C3): turns a sequence of demuxed, stream-copied
//! packets into one seekable `.mp4` file.
//!
//! Unlike the teacher's own sample-file format (an internal, append-only
//! representation paired with separate index rows in the catalog), this
//! writer emits a standalone ISO BMFF file that any ordinary player can
//! open, per §4.3. Boxes are built the same way `h264::ExtraData::parse`
//! builds `avc1`/`avcC` — plain `byteorder` writes into a `Vec<u8>`, with box
//! lengths patched in after the fact.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use base::{bail, err, Error};
use byteorder::{BigEndian, WriteBytesExt};

use crate::buffer::{Packet, StreamKind};

/// A track's fixed sample-description box (`avc1`/`avcC` for video,
/// `mp4a`/`esds` for audio) plus the RTP/codec clock rate its timestamps are
/// expressed in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackParams {
    pub sample_entry: Vec<u8>,
    pub timescale: u32,
}

/// The source-side parameters accompanying a [`write`](Writer::write) call;
/// tagged by kind so the writer can tell a first-video-packet from a
/// first-audio-packet without inspecting `packet.kind` twice.
pub enum SourceParams<'a> {
    Video(&'a TrackParams),
    Audio(&'a TrackParams),
}

struct SampleMeta {
    offset: u64,
    size: u32,
    dts: i64,
    is_sync: bool,
}

struct Track {
    params: TrackParams,
    samples: Vec<SampleMeta>,
    origin_dts: Option<i64>,
    last_dts: i64,
}

impl Track {
    fn new(params: TrackParams) -> Self {
        Track {
            params,
            samples: Vec::new(),
            origin_dts: None,
            last_dts: 0,
        }
    }
}

/// Summary returned by [`Writer::close`] for the catalog `update_recording`
/// call (§4.2).
pub struct Summary {
    pub size_bytes: i64,
    pub width: i64,
    pub height: i64,
}

/// Builds one `.mp4` file from demuxed packets. Not `Send`-shared: owned
/// exclusively by its ingest thread, like the packet buffer it drains (§4.1,
/// §4.3 Ownership).
pub struct Writer {
    path: PathBuf,
    file: Option<File>,
    mdat_len_pos: u64,
    video: Option<Track>,
    audio: Option<Track>,
    audio_enabled: bool,
    width: u16,
    height: u16,
}

const FTYP: &[u8] = b"\0\0\0\x18ftypisom\0\0\0\0isomiso2avc1mp41";

impl Writer {
    /// Allocates writer state. Does not touch the filesystem yet (§4.3
    /// `create`): a detection that never reaches a keyframe never creates an
    /// empty file.
    pub fn create(path: &Path, _stream_name: &str) -> Self {
        Writer {
            path: path.to_owned(),
            file: None,
            mdat_len_pos: 0,
            video: None,
            audio: None,
            audio_enabled: false,
            width: 0,
            height: 0,
        }
    }

    /// Caller's choice of whether to carry an audio track, if the source has
    /// one. Ignored if no audio packets ever arrive (§4.3).
    pub fn configure_audio(&mut self, enabled: bool) {
        self.audio_enabled = enabled;
    }

    pub fn is_initialized(&self) -> bool {
        self.file.is_some()
    }

    /// Opens the file and writes `ftyp` plus an `mdat` header sized zero (to
    /// be patched at [`close`](Writer::close)), then writes `first_keyframe`
    /// as the video track's first sample. Must be called with a video
    /// keyframe (§4.3 "must be called on a video keyframe").
    pub fn initialize(
        &mut self,
        first_keyframe: &Packet,
        video_params: TrackParams,
        width: u16,
        height: u16,
    ) -> Result<(), Error> {
        if !first_keyframe.keyframe || first_keyframe.kind != StreamKind::Video {
            bail!(
                FailedPrecondition,
                msg("initialize must be called with a video keyframe")
            );
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&self.path)?;
        file.write_all(FTYP)?;
        let mdat_len_pos = file.stream_position()?;
        file.write_u32::<BigEndian>(0)?; // patched at close
        file.write_all(b"mdat")?;
        self.file = Some(file);
        self.mdat_len_pos = mdat_len_pos;
        self.width = width;
        self.height = height;
        self.video = Some(Track::new(video_params));
        self.write_sample(StreamKind::Video, first_keyframe)
    }

    /// Routes a packet to its track, establishing the track's dts origin on
    /// its first call and, for audio, enforcing strictly increasing dts
    /// (§4.3). Packets before [`initialize`](Writer::initialize) are a
    /// caller bug, not a recoverable condition.
    pub fn write(&mut self, packet: &Packet, params: SourceParams) -> Result<(), Error> {
        if self.file.is_none() {
            bail!(FailedPrecondition, msg("write before initialize"));
        }
        match (packet.kind, params) {
            (StreamKind::Video, SourceParams::Video(_)) => self.write_sample(StreamKind::Video, packet),
            (StreamKind::Audio, SourceParams::Audio(p)) => {
                if !self.audio_enabled {
                    return Ok(());
                }
                if self.audio.is_none() {
                    self.audio = Some(Track::new(p.clone()));
                }
                self.write_sample(StreamKind::Audio, packet)
            }
            _ => bail!(Internal, msg("packet kind doesn't match source params kind")),
        }
    }

    fn write_sample(&mut self, kind: StreamKind, packet: &Packet) -> Result<(), Error> {
        let file = self.file.as_mut().expect("write_sample after initialize");
        let offset = file.stream_position()?;
        file.write_all(&packet.data)?;

        let track = match kind {
            StreamKind::Video => self.video.as_mut().unwrap(),
            StreamKind::Audio => self.audio.as_mut().unwrap(),
        };
        let origin = *track.origin_dts.get_or_insert(packet.dts);
        let mut dts = packet.dts - origin;
        if kind == StreamKind::Audio {
            if let Some(last) = track.samples.last() {
                if dts <= last.dts {
                    dts = last.dts + 1;
                }
            }
        }
        track.last_dts = dts;
        track.samples.push(SampleMeta {
            offset,
            size: u32::try_from(packet.data.len()).map_err(|e| err!(OutOfRange, source(e)))?,
            dts,
            is_sync: packet.keyframe || kind == StreamKind::Audio,
        });
        Ok(())
    }

    /// Writes the `moov` trailer, patches the `mdat` length, and fsyncs.
    /// Safe to call on a writer that was never
    /// [`initialize`](Writer::initialize)d: there's no file to finalize, so
    /// this simply discards state (§4.3).
    pub fn close(mut self) -> Result<Option<Summary>, Error> {
        let Some(mut file) = self.file.take() else {
            return Ok(None);
        };
        match self.finish(&mut file) {
            Ok(summary) => Ok(Some(summary)),
            Err(e) => {
                drop(file);
                let _ = std::fs::remove_file(&self.path);
                Err(e)
            }
        }
    }

    /// Discards the writer immediately, removing any partial file (§4.3,
    /// §7 "writer failure" path: the caller has already decided this
    /// recording is not salvageable).
    pub fn abort(mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn finish(&mut self, file: &mut File) -> Result<Summary, Error> {
        let video = self
            .video
            .as_ref()
            .ok_or_else(|| err!(FailedPrecondition, msg("no video samples written")))?;
        let mdat_end = file.stream_position()?;
        let mdat_len = mdat_end - self.mdat_len_pos; // includes the 4-byte length field itself
        let mdat_len =
            u32::try_from(mdat_len).map_err(|_| err!(ResourceExhausted, msg("recording exceeds 4 GiB")))?;

        let moov = build_moov(video, self.audio.as_ref(), self.width, self.height)?;
        file.write_all(&moov)?;

        file.seek(SeekFrom::Start(self.mdat_len_pos))?;
        file.write_u32::<BigEndian>(mdat_len)?;
        file.seek(SeekFrom::End(0))?;
        file.sync_all()?;

        let size_bytes = i64::try_from(file.stream_position()?).unwrap_or(i64::MAX);
        Ok(Summary {
            size_bytes,
            width: i64::from(self.width),
            height: i64::from(self.height),
        })
    }
}

fn write_box(buf: &mut Vec<u8>, fourcc: &[u8; 4], body: impl FnOnce(&mut Vec<u8>) -> Result<(), Error>) -> Result<(), Error> {
    let start = buf.len();
    buf.extend_from_slice(&[0, 0, 0, 0]);
    buf.extend_from_slice(fourcc);
    body(buf)?;
    let len = u32::try_from(buf.len() - start).map_err(|e| err!(Internal, source(e)))?;
    BigEndian::write_u32(&mut buf[start..start + 4], len);
    Ok(())
}

/// Movie-level timescale used for `mvhd`'s duration; each track keeps its
/// own native timescale in `mdhd`, matching how real encoders rarely share
/// one clock rate between video and audio.
const MOVIE_TIMESCALE: u32 = 1000;

fn track_duration_ticks(track: &Track) -> i64 {
    track.samples.last().map(|s| s.dts).unwrap_or(0) + default_sample_duration(track)
}

fn default_sample_duration(track: &Track) -> i64 {
    if track.samples.len() < 2 {
        return i64::from(track.params.timescale) / 30; // a guess; only matters for 0/1-sample files
    }
    let mut total = 0i64;
    for w in track.samples.windows(2) {
        total += w[1].dts - w[0].dts;
    }
    total / (track.samples.len() as i64 - 1)
}

fn build_moov(video: &Track, audio: Option<&Track>, width: u16, height: u16) -> Result<Vec<u8>, Error> {
    let mut moov = Vec::new();
    write_box(&mut moov, b"moov", |moov| {
        let video_dur_ticks = track_duration_ticks(video);
        let video_dur_movie = scale(video_dur_ticks, video.params.timescale, MOVIE_TIMESCALE);
        let audio_dur_movie = audio
            .map(|a| scale(track_duration_ticks(a), a.params.timescale, MOVIE_TIMESCALE))
            .unwrap_or(0);
        let duration = video_dur_movie.max(audio_dur_movie);
        let next_track_id = if audio.is_some() { 3 } else { 2 };

        write_box(moov, b"mvhd", |b| {
            write_full_box_header(b, 0, 0);
            b.write_u32::<BigEndian>(0).unwrap(); // creation_time
            b.write_u32::<BigEndian>(0).unwrap(); // modification_time
            b.write_u32::<BigEndian>(MOVIE_TIMESCALE).unwrap();
            b.write_u32::<BigEndian>(u32::try_from(duration).unwrap_or(0)).unwrap();
            b.write_u32::<BigEndian>(0x0001_0000).unwrap(); // rate 1.0
            b.write_u16::<BigEndian>(0x0100).unwrap(); // volume 1.0
            b.extend_from_slice(&[0; 10]); // reserved
            b.extend_from_slice(&IDENTITY_MATRIX);
            b.extend_from_slice(&[0; 24]); // pre_defined
            b.write_u32::<BigEndian>(next_track_id).unwrap();
            Ok(())
        })?;

        write_track(moov, video, width, height, TrackKind::Video)?;
        if let Some(audio) = audio {
            write_track(moov, audio, 0, 0, TrackKind::Audio)?;
        }
        Ok(())
    })?;
    Ok(moov)
}

#[rustfmt::skip]
const IDENTITY_MATRIX: [u8; 36] = [
    0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00,
];

fn write_full_box_header(b: &mut Vec<u8>, version: u8, flags: u32) {
    b.push(version);
    b.extend_from_slice(&flags.to_be_bytes()[1..]);
}

fn scale(ticks: i64, from: u32, to: u32) -> i64 {
    if from == 0 {
        return 0;
    }
    ticks * i64::from(to) / i64::from(from)
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum TrackKind {
    Video,
    Audio,
}

fn write_track(moov: &mut Vec<u8>, track: &Track, width: u16, height: u16, kind: TrackKind) -> Result<(), Error> {
    let track_id = if kind == TrackKind::Video { 1u32 } else { 2u32 };
    let duration_ticks = track_duration_ticks(track);
    let duration_movie = scale(duration_ticks, track.params.timescale, MOVIE_TIMESCALE);

    write_box(moov, b"trak", |b| {
        write_box(b, b"tkhd", |b| {
            write_full_box_header(b, 0, 0x0000_0007); // enabled, in movie, in preview
            b.write_u32::<BigEndian>(0).unwrap(); // creation_time
            b.write_u32::<BigEndian>(0).unwrap(); // modification_time
            b.write_u32::<BigEndian>(track_id).unwrap();
            b.write_u32::<BigEndian>(0).unwrap(); // reserved
            b.write_u32::<BigEndian>(u32::try_from(duration_movie).unwrap_or(0)).unwrap();
            b.extend_from_slice(&[0; 8]); // reserved
            b.write_u16::<BigEndian>(0).unwrap(); // layer
            b.write_u16::<BigEndian>(0).unwrap(); // alternate_group
            b.write_u16::<BigEndian>(if kind == TrackKind::Audio { 0x0100 } else { 0 }).unwrap();
            b.write_u16::<BigEndian>(0).unwrap(); // reserved
            b.extend_from_slice(&IDENTITY_MATRIX);
            b.write_u32::<BigEndian>(u32::from(width) << 16).unwrap();
            b.write_u32::<BigEndian>(u32::from(height) << 16).unwrap();
            Ok(())
        })?;
        write_box(b, b"mdia", |b| {
            write_box(b, b"mdhd", |b| {
                write_full_box_header(b, 0, 0);
                b.write_u32::<BigEndian>(0).unwrap();
                b.write_u32::<BigEndian>(0).unwrap();
                b.write_u32::<BigEndian>(track.params.timescale).unwrap();
                b.write_u32::<BigEndian>(u32::try_from(duration_ticks).unwrap_or(0)).unwrap();
                b.write_u16::<BigEndian>(0x55c4).unwrap(); // language "und"
                b.write_u16::<BigEndian>(0).unwrap();
                Ok(())
            })?;
            write_box(b, b"hdlr", |b| {
                write_full_box_header(b, 0, 0);
                b.write_u32::<BigEndian>(0).unwrap(); // pre_defined
                b.extend_from_slice(if kind == TrackKind::Video { b"vide" } else { b"soun" });
                b.extend_from_slice(&[0; 12]); // reserved
                let name: &[u8] = if kind == TrackKind::Video { b"VideoHandler\0" } else { b"SoundHandler\0" };
                b.extend_from_slice(name);
                Ok(())
            })?;
            write_box(b, b"minf", |b| {
                if kind == TrackKind::Video {
                    write_box(b, b"vmhd", |b| {
                        write_full_box_header(b, 0, 1);
                        b.extend_from_slice(&[0; 8]);
                        Ok(())
                    })?;
                } else {
                    write_box(b, b"smhd", |b| {
                        write_full_box_header(b, 0, 0);
                        b.extend_from_slice(&[0; 4]);
                        Ok(())
                    })?;
                }
                write_box(b, b"dinf", |b| {
                    write_box(b, b"dref", |b| {
                        write_full_box_header(b, 0, 0);
                        b.write_u32::<BigEndian>(1).unwrap();
                        write_box(b, b"url ", |b| {
                            write_full_box_header(b, 0, 1); // self-contained
                            Ok(())
                        })
                    })
                })?;
                write_box(b, b"stbl", |b| write_stbl(b, track, kind))?;
                Ok(())
            })?;
            Ok(())
        })?;
        Ok(())
    })
}

fn write_stbl(b: &mut Vec<u8>, track: &Track, kind: TrackKind) -> Result<(), Error> {
    write_box(b, b"stsd", |b| {
        write_full_box_header(b, 0, 0);
        b.write_u32::<BigEndian>(1).unwrap();
        b.extend_from_slice(&track.params.sample_entry);
        Ok(())
    })?;
    write_box(b, b"stts", |b| {
        write_full_box_header(b, 0, 0);
        let entries = stts_entries(track);
        b.write_u32::<BigEndian>(u32::try_from(entries.len()).unwrap()).unwrap();
        for (count, delta) in entries {
            b.write_u32::<BigEndian>(count).unwrap();
            b.write_u32::<BigEndian>(delta).unwrap();
        }
        Ok(())
    })?;
    if kind == TrackKind::Video {
        let sync: Vec<u32> = track
            .samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_sync)
            .map(|(i, _)| u32::try_from(i + 1).unwrap())
            .collect();
        if sync.len() != track.samples.len() {
            write_box(b, b"stss", |b| {
                write_full_box_header(b, 0, 0);
                b.write_u32::<BigEndian>(u32::try_from(sync.len()).unwrap()).unwrap();
                for s in sync {
                    b.write_u32::<BigEndian>(s).unwrap();
                }
                Ok(())
            })?;
        }
    }
    write_box(b, b"stsc", |b| {
        write_full_box_header(b, 0, 0);
        b.write_u32::<BigEndian>(1).unwrap();
        b.write_u32::<BigEndian>(1).unwrap(); // first_chunk
        b.write_u32::<BigEndian>(1).unwrap(); // samples_per_chunk
        b.write_u32::<BigEndian>(1).unwrap(); // sample_description_index
        Ok(())
    })?;
    write_box(b, b"stsz", |b| {
        write_full_box_header(b, 0, 0);
        b.write_u32::<BigEndian>(0).unwrap(); // sample_size (0 = table follows)
        b.write_u32::<BigEndian>(u32::try_from(track.samples.len()).unwrap()).unwrap();
        for s in &track.samples {
            b.write_u32::<BigEndian>(s.size).unwrap();
        }
        Ok(())
    })?;
    write_box(b, b"stco", |b| {
        write_full_box_header(b, 0, 0);
        b.write_u32::<BigEndian>(u32::try_from(track.samples.len()).unwrap()).unwrap();
        for s in &track.samples {
            b.write_u32::<BigEndian>(u32::try_from(s.offset).unwrap_or(u32::MAX)).unwrap();
        }
        Ok(())
    })?;
    Ok(())
}

/// Run-length-encodes consecutive sample durations for `stts`.
fn stts_entries(track: &Track) -> Vec<(u32, u32)> {
    let default_dur = default_sample_duration(track).max(1);
    let mut deltas = Vec::with_capacity(track.samples.len());
    for w in track.samples.windows(2) {
        deltas.push(u32::try_from((w[1].dts - w[0].dts).max(1)).unwrap_or(1));
    }
    deltas.push(u32::try_from(default_dur).unwrap_or(1));

    let mut entries: Vec<(u32, u32)> = Vec::new();
    for d in deltas {
        match entries.last_mut() {
            Some((count, delta)) if *delta == d => *count += 1,
            _ => entries.push((1, d)),
        }
    }
    entries
}

/// Builds a minimal AAC-LC `mp4a`/`esds` sample entry, the audio analogue of
/// [`crate::h264::ExtraData::parse`]'s `avc1`/`avcC`. `asc` is the raw
/// MPEG-4 AudioSpecificConfig (2 bytes for plain AAC-LC).
pub fn aac_sample_entry(channels: u16, sample_rate: u32, asc: &[u8]) -> Result<Vec<u8>, Error> {
    let mut entry = Vec::new();
    write_box(&mut entry, b"mp4a", |b| {
        b.extend_from_slice(&[0; 6]); // reserved
        b.write_u16::<BigEndian>(1).unwrap(); // data_reference_index
        b.extend_from_slice(&[0; 8]); // reserved (version/revision/vendor)
        b.write_u16::<BigEndian>(channels).unwrap();
        b.write_u16::<BigEndian>(16).unwrap(); // sample size bits
        b.extend_from_slice(&[0; 4]); // pre_defined + reserved
        b.write_u32::<BigEndian>(sample_rate << 16).unwrap();
        write_box(b, b"esds", |b| {
            write_full_box_header(b, 0, 0);
            // ES_Descriptor (tag 0x03)
            b.push(0x03);
            let desc_len = 3 + 5 + 2 + asc.len() as u8 + 3;
            b.push(desc_len);
            b.write_u16::<BigEndian>(0).unwrap(); // ES_ID
            b.push(0); // flags
            // DecoderConfigDescriptor (tag 0x04)
            b.push(0x04);
            b.push(13 + asc.len() as u8);
            b.push(0x40); // objectTypeIndication: audio ISO/IEC 14496-3
            b.push(0x15); // streamType(6 bits)=5 audio, upStream=0, reserved=1
            b.extend_from_slice(&[0, 0, 0]); // bufferSizeDB
            b.write_u32::<BigEndian>(0).unwrap(); // maxBitrate
            b.write_u32::<BigEndian>(0).unwrap(); // avgBitrate
            // DecoderSpecificInfo (tag 0x05)
            b.push(0x05);
            b.push(u8::try_from(asc.len()).map_err(|e| err!(InvalidArgument, source(e)))?);
            b.extend_from_slice(asc);
            // SLConfigDescriptor (tag 0x06)
            b.push(0x06);
            b.push(1);
            b.push(0x02);
            Ok(())
        })
    })?;
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pkt(kind: StreamKind, keyframe: bool, dts: i64, data: &[u8]) -> Packet {
        Packet {
            kind,
            keyframe,
            data: Bytes::copy_from_slice(data),
            dts,
            pts: dts,
        }
    }

    fn video_params() -> TrackParams {
        TrackParams {
            sample_entry: vec![0; 16], // opaque stand-in; box correctness is covered by h264 tests
            timescale: 90_000,
        }
    }

    #[test]
    fn never_initialized_writer_creates_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.mp4");
        let w = Writer::create(&path, "front");
        assert!(w.close().unwrap().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn write_before_initialize_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.mp4");
        let mut w = Writer::create(&path, "front");
        let vp = video_params();
        let err = w
            .write(&pkt(StreamKind::Video, false, 1, b"x"), SourceParams::Video(&vp))
            .unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn happy_path_produces_a_valid_looking_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.mp4");
        let mut w = Writer::create(&path, "front");
        let vp = video_params();
        w.initialize(&pkt(StreamKind::Video, true, 1000, b"key"), vp.clone(), 1280, 720)
            .unwrap();
        w.write(&pkt(StreamKind::Video, false, 1090, b"p1"), SourceParams::Video(&vp))
            .unwrap();
        w.write(&pkt(StreamKind::Video, false, 1180, b"p2"), SourceParams::Video(&vp))
            .unwrap();
        let summary = w.close().unwrap().unwrap();
        assert!(summary.size_bytes > 0);
        assert_eq!(summary.width, 1280);
        assert_eq!(summary.height, 720);
        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[4..8], b"ftyp");
        assert!(data.windows(4).any(|w| w == b"moov"));
        assert!(data.windows(4).any(|w| w == b"mdat"));
    }

    #[test]
    fn abort_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.mp4");
        let mut w = Writer::create(&path, "front");
        let vp = video_params();
        w.initialize(&pkt(StreamKind::Video, true, 0, b"key"), vp, 640, 480).unwrap();
        assert!(path.exists());
        w.abort();
        assert!(!path.exists());
    }
}
