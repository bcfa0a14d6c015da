// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Keyframe decoding for the detection/motion pipeline: turns a buffered
//! H.264 keyframe into the packed RGB buffer [`crate::predictor::Predictor`]
//! and the motion heuristic both expect (§4.5 "every Nth keyframe ... is
//! decoded and handed to C4").
//!
//! Grounded on the teacher's optional `analytics` feature
//! (`server/src/analytics.rs`), which decodes H.264 via an FFmpeg binding
//! before handing frames to a TFLite model; this crate reaches for
//! `openh264` instead of an FFmpeg FFI binding (the `ffmpeg` crate pulled in
//! by `analytics.rs` isn't otherwise a dependency of this binary). The
//! AVC-to-Annex-B helper below is the mirror image of
//! [`crate::h264::transform_sample_data`].

use base::{err, Error};
use byteorder::{BigEndian, ByteOrder};

/// Decodes buffered AVC-framed keyframes to packed RGB8, reusing one
/// `openh264` decoder instance and its scratch buffers across calls.
pub struct KeyframeDecoder {
    decoder: openh264::decoder::Decoder,
    annex_b: Vec<u8>,
}

impl KeyframeDecoder {
    pub fn new() -> Result<Self, Error> {
        let decoder = openh264::decoder::Decoder::new()
            .map_err(|e| err!(Internal, msg("opening H.264 decoder: {e}")))?;
        Ok(KeyframeDecoder { decoder, annex_b: Vec::new() })
    }

    /// Decodes one AVC-framed access unit (as buffered by the ingest
    /// pipeline) to packed RGB8. Returns `None` if this access unit alone
    /// didn't produce a displayable frame (e.g. a parameter-set-only NAL);
    /// that's not an error, just nothing to run detection against yet.
    pub fn decode_to_rgb(&mut self, avc_sample: &[u8]) -> Result<Option<(Vec<u8>, u32, u32)>, Error> {
        avc_to_annex_b(avc_sample, &mut self.annex_b);
        let decoded = self
            .decoder
            .decode(&self.annex_b)
            .map_err(|e| err!(Internal, msg("decoding H.264 keyframe: {e}")))?;
        let Some(yuv) = decoded else { return Ok(None) };
        let (width, height) = yuv.dimensions();
        let mut rgb = vec![0u8; yuv.rgb8_len()];
        yuv.write_rgb8(&mut rgb);
        Ok(Some((rgb, width as u32, height as u32)))
    }
}

/// Reverses [`crate::h264::transform_sample_data`]: turns 4-byte-length-
/// prefixed AVC NAL units back into Annex B start-code-delimited form, which
/// is what `openh264` expects as input. Malformed (truncated) input is
/// ignored rather than erroring — this only ever sees data this crate
/// produced itself via `transform_sample_data`.
fn avc_to_annex_b(avc: &[u8], out: &mut Vec<u8>) {
    out.clear();
    let mut data = avc;
    while data.len() >= 4 {
        let len = BigEndian::read_u32(&data[..4]) as usize;
        data = &data[4..];
        if len > data.len() {
            break;
        }
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(&data[..len]);
        data = &data[len..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avc_to_annex_b_reverses_transform_sample_data() {
        let annex_b_in: [u8; 13] = [0, 0, 0, 1, 0x67, 1, 2, 3, 0, 0, 1, 0x68, 9];
        let mut avc = Vec::new();
        crate::h264::transform_sample_data(&annex_b_in, &mut avc).unwrap();
        let mut back = Vec::new();
        avc_to_annex_b(&avc, &mut back);
        // Every NAL regains a 4-byte start code, even the one that started
        // out 3-byte in the input; the two buffers agree on NAL content.
        assert_eq!(back, vec![0, 0, 0, 1, 0x67, 1, 2, 3, 0, 0, 0, 1, 0x68, 9]);
    }

    #[test]
    fn truncated_length_is_ignored_not_panicking() {
        let mut out = Vec::new();
        avc_to_annex_b(&[0, 0, 0, 255, 1, 2, 3], &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn short_buffer_is_ignored_not_panicking() {
        let mut out = Vec::new();
        avc_to_annex_b(&[1, 2, 3], &mut out);
        assert!(out.is_empty());
    }
}
