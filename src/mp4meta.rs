// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Reads just enough of an ISO BMFF (`.mp4`) trailer to recover a
//! recording's duration (§8 S4 "compute its actual duration via the file's
//! trailer"), without pulling in a full demuxer.
//!
//! The symmetric counterpart of [`crate::writer`]'s box writer: walks
//! top-level boxes looking for `moov`, then `moov`'s children for `mvhd`,
//! and reads the version-0 `mvhd` layout `writer.rs` always emits.

use base::{bail, err, Error};
use byteorder::{BigEndian, ReadBytesExt};

/// The `mvhd` duration, expressed in seconds.
pub fn movie_duration_secs(path: &std::path::Path) -> Result<f64, Error> {
    let data = std::fs::read(path)?;
    let moov = find_box(&data, b"moov").ok_or_else(|| err!(InvalidArgument, msg("no moov box in {}", path.display())))?;
    let mvhd = find_box(moov, b"mvhd").ok_or_else(|| err!(InvalidArgument, msg("no mvhd box in {}", path.display())))?;
    if mvhd.len() < 20 {
        bail!(InvalidArgument, msg("mvhd box in {} too short", path.display()));
    }
    let version = mvhd[0];
    if version != 0 {
        // writer.rs only ever emits version 0; a version-1 (64-bit) mvhd
        // means this file wasn't produced by this program.
        bail!(InvalidArgument, msg("unsupported mvhd version {version} in {}", path.display()));
    }
    let mut timescale = &mvhd[12..16];
    let mut duration = &mvhd[16..20];
    let timescale = timescale.read_u32::<BigEndian>().map_err(|e| err!(Internal, source(e)))?;
    let duration = duration.read_u32::<BigEndian>().map_err(|e| err!(Internal, source(e)))?;
    if timescale == 0 {
        bail!(InvalidArgument, msg("mvhd timescale is zero in {}", path.display()));
    }
    Ok(f64::from(duration) / f64::from(timescale))
}

/// Returns the body of the first child box named `fourcc` directly within
/// `data` (not recursive beyond one level — callers walk level by level, the
/// same way the box tree is nested).
fn find_box<'a>(mut data: &'a [u8], fourcc: &[u8; 4]) -> Option<&'a [u8]> {
    loop {
        if data.len() < 8 {
            return None;
        }
        let mut size_bytes = &data[0..4];
        let size = size_bytes.read_u32::<BigEndian>().ok()? as usize;
        let kind = &data[4..8];
        if size < 8 || size > data.len() {
            return None;
        }
        if kind == fourcc {
            return Some(&data[8..size]);
        }
        data = &data[size..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Packet, StreamKind};
    use crate::writer::{TrackParams, Writer};

    #[test]
    fn reads_duration_from_written_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let mut w = Writer::create(&path, "test");
        let video_params = TrackParams {
            sample_entry: b"\x00\x00\x00\x08avc1".to_vec(),
            timescale: 90_000,
        };
        w.initialize(
            &Packet {
                kind: StreamKind::Video,
                keyframe: true,
                data: bytes::Bytes::from_static(b"frame0"),
                dts: 0,
                pts: 0,
            },
            video_params.clone(),
            1920,
            1080,
        )
        .unwrap();
        w.write(
            &Packet {
                kind: StreamKind::Video,
                keyframe: true,
                data: bytes::Bytes::from_static(b"frame1"),
                dts: 90_000,
                pts: 90_000,
            },
            crate::writer::SourceParams::Video(&video_params),
        )
        .unwrap();
        w.close().unwrap();

        let secs = movie_duration_secs(&path).unwrap();
        assert!(secs > 0.9 && secs < 1.2, "unexpected duration {secs}");
    }
}
