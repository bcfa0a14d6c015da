// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The detection predictor (C4): an opaque `predict(frame) -> boxes`
//! capability with two backends, an embedded on-device model and a remote
//! HTTP snapshot service (§4.4).
//!
//! Callers hold an `Arc<dyn Predictor>` and never care which backend is
//! behind it — the same shape the teacher uses for its `Opener` trait object
//! in `stream.rs`.

use base::Error;

/// One predicted object, box coordinates normalized to `[0, 1]` (§4.4).
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f64,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// A detection backend. `predict` takes an already-decoded RGB frame (row
/// major, 3 bytes/pixel, no padding); implementations that fetch their own
/// imagery (the remote snapshot variant) are free to ignore it.
///
/// Per §4.4: both implementations return an empty `Vec` rather than an error
/// when the underlying source is merely unavailable; only hard protocol
/// errors propagate.
pub trait Predictor: Send + Sync {
    fn predict(&self, frame_rgb: &[u8], width: u32, height: u32) -> Result<Vec<Detection>, Error>;
}

/// Sentinel path string that [`RemotePredictor::new`] resolves to the
/// process config's detection service base URL at call time (§4.4).
pub const API_DETECTION_SENTINEL: &str = "api-detection";

#[cfg(feature = "embedded-detector")]
pub use embedded::EmbeddedPredictor;

#[cfg(feature = "embedded-detector")]
mod embedded {
    use std::path::Path;

    use base::{err, Error};
    use parking_lot::Mutex;
    use tract_onnx::prelude::*;

    use super::{Detection, Predictor};

    type Model = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

    /// A loaded on-device model. Single-threaded per handle: `tract`'s
    /// execution plan isn't `Sync`-safe to call concurrently, so calls are
    /// serialized behind a mutex the way the teacher serializes access to its
    /// single `rusqlite::Connection` (§4.4 "callers serialize").
    pub struct EmbeddedPredictor {
        model: Mutex<Model>,
        input_width: usize,
        input_height: usize,
        threshold: f64,
        labels: Vec<String>,
    }

    impl EmbeddedPredictor {
        /// Loads an ONNX model from `model_path`. If a sibling file with the
        /// same stem and a `.names` extension exists, one label per line is
        /// read from it; otherwise predictions are labeled `"object"`.
        pub fn load(model_path: &Path, threshold: f64) -> Result<Self, Error> {
            let model = tract_onnx::onnx()
                .model_for_path(model_path)
                .map_err(|e| err!(Internal, msg("loading model {}: {e}", model_path.display())))?
                .into_optimized()
                .map_err(|e| err!(Internal, msg("optimizing model {}: {e}", model_path.display())))?
                .into_runnable()
                .map_err(|e| err!(Internal, msg("planning model {}: {e}", model_path.display())))?;

            let input_fact = model.model().input_fact(0).map_err(|e| err!(Internal, source(e)))?;
            let shape = input_fact.shape.as_concrete().ok_or_else(|| {
                err!(InvalidArgument, msg("model {} has a dynamic input shape", model_path.display()))
            })?;
            // Expect NCHW.
            let (input_height, input_width) = match shape {
                [_, _, h, w] => (*h, *w),
                _ => bail_shape(model_path)?,
            };

            let labels = std::fs::read_to_string(model_path.with_extension("names"))
                .map(|s| s.lines().map(str::to_owned).collect())
                .unwrap_or_default();

            Ok(EmbeddedPredictor {
                model: Mutex::new(model),
                input_width,
                input_height,
                threshold,
                labels,
            })
        }

        fn label(&self, class_id: usize) -> String {
            self.labels.get(class_id).cloned().unwrap_or_else(|| "object".to_owned())
        }
    }

    fn bail_shape(model_path: &Path) -> Result<(usize, usize), Error> {
        Err(err!(InvalidArgument, msg("model {} isn't NCHW", model_path.display())))
    }

    impl Predictor for EmbeddedPredictor {
        fn predict(&self, frame_rgb: &[u8], width: u32, height: u32) -> Result<Vec<Detection>, Error> {
            if frame_rgb.len() != (width as usize) * (height as usize) * 3 {
                return Err(err!(InvalidArgument, msg("frame buffer size doesn't match width*height*3")));
            }
            let input = nearest_neighbor_resize_to_nchw(frame_rgb, width, height, self.input_width, self.input_height);
            let input =
                Tensor::from_shape(&[1, 3, self.input_height, self.input_width], &input).map_err(|e| err!(Internal, source(e)))?;

            let model = self.model.lock();
            let outputs = model.run(tvec!(input.into())).map_err(|e| err!(Internal, msg("inference failed: {e}")))?;
            let Some(out) = outputs.first() else {
                return Ok(Vec::new());
            };
            let rows = out.to_array_view::<f32>().map_err(|e| err!(Internal, source(e)))?;

            // Convention: each row is [x, y, w, h, confidence, class_id], all
            // but class_id already normalized to [0, 1].
            let mut detections = Vec::new();
            if let Some(shape) = rows.shape().get(rows.ndim().saturating_sub(2)..) {
                if shape.len() == 2 && shape[1] >= 6 {
                    for row in rows.rows().into_iter() {
                        let confidence = f64::from(row[4]);
                        if confidence < self.threshold {
                            continue;
                        }
                        detections.push(Detection {
                            label: self.label(row[5] as usize),
                            confidence,
                            x: f64::from(row[0]).clamp(0.0, 1.0),
                            y: f64::from(row[1]).clamp(0.0, 1.0),
                            w: f64::from(row[2]).clamp(0.0, 1.0),
                            h: f64::from(row[3]).clamp(0.0, 1.0),
                        });
                    }
                }
            }
            Ok(detections)
        }
    }

    /// Cheap nearest-neighbor resize + HWC-RGB→CHW-f32/255 rearrangement.
    /// Good enough for a thresholded detector; this crate deliberately
    /// doesn't pull in an image-processing crate for one resize.
    fn nearest_neighbor_resize_to_nchw(src: &[u8], src_w: u32, src_h: u32, dst_w: usize, dst_h: usize) -> Vec<f32> {
        let mut out = vec![0f32; 3 * dst_w * dst_h];
        if src_w == 0 || src_h == 0 {
            return out;
        }
        for y in 0..dst_h {
            let sy = (y * src_h as usize / dst_h.max(1)).min(src_h as usize - 1);
            for x in 0..dst_w {
                let sx = (x * src_w as usize / dst_w.max(1)).min(src_w as usize - 1);
                let src_idx = (sy * src_w as usize + sx) * 3;
                for c in 0..3 {
                    out[c * dst_h * dst_w + y * dst_w + x] = f32::from(src[src_idx + c]) / 255.0;
                }
            }
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn resize_handles_zero_sized_source_without_panicking() {
            // The only real call sites (ingest.rs's keyframe-decode-disabled
            // fallback) pass a 0x0 source; this must not underflow computing
            // `src_h - 1` / `src_w - 1`.
            let out = nearest_neighbor_resize_to_nchw(&[], 0, 0, 4, 4);
            assert_eq!(out, vec![0f32; 3 * 4 * 4]);
        }
    }
}

/// Calls a companion HTTP service: fetches a JPEG snapshot, POSTs it to a
/// detection endpoint, parses the JSON response. Blocking from the caller's
/// perspective — resolved via `tokio::runtime::Handle::block_on`, the same
/// hand-off the teacher uses to drive its async `retina` stream from a
/// synchronous ingest thread (§2 Design Notes).
pub struct RemotePredictor {
    client: reqwest::Client,
    handle: tokio::runtime::Handle,
    snapshot_url: url::Url,
    detect_url: url::Url,
    threshold: f64,
}

#[derive(serde::Deserialize)]
struct RemoteDetection {
    label: String,
    confidence: f64,
    x: f64,
    y: f64,
    w: f64,
    h: f64,
}

#[derive(serde::Deserialize)]
struct RemoteResponse {
    detections: Vec<RemoteDetection>,
}

impl RemotePredictor {
    /// `path` is either the `"api-detection"` sentinel (resolved against
    /// `api_base`) or a literal `http://`/`https://` URL (§4.4).
    pub fn new(
        path: &str,
        api_base: &url::Url,
        handle: tokio::runtime::Handle,
        threshold: f64,
    ) -> Result<Self, Error> {
        let base = if path == super::API_DETECTION_SENTINEL {
            api_base.clone()
        } else if path.starts_with("http://") || path.starts_with("https://") {
            path.parse().map_err(|e| base::err!(InvalidArgument, msg("bad detection URL: {e}")))?
        } else {
            return Err(base::err!(InvalidArgument, msg("detection path must be {:?} or an http(s) URL", super::API_DETECTION_SENTINEL)));
        };
        let snapshot_url = base.join("snapshot").map_err(|e| base::err!(InvalidArgument, source(e)))?;
        let detect_url = base.join("detect").map_err(|e| base::err!(InvalidArgument, source(e)))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|e| base::err!(Internal, source(e)))?;
        Ok(RemotePredictor { client, handle, snapshot_url, detect_url, threshold })
    }

    async fn predict_async(&self) -> Result<Vec<Detection>, Error> {
        let snapshot = match self.client.get(self.snapshot_url.clone()).send().await {
            Ok(resp) if resp.status().is_success() => resp.bytes().await.map_err(|e| base::err!(Unavailable, source(e)))?,
            Ok(_) | Err(_) => return Ok(Vec::new()), // unreachable/non-2xx: empty, not an error (§4.4)
        };
        let resp = self
            .client
            .post(self.detect_url.clone())
            .header("content-type", "image/jpeg")
            .body(snapshot)
            .send()
            .await;
        let resp = match resp {
            Ok(r) if r.status().is_success() => r,
            Ok(_) | Err(_) => return Ok(Vec::new()),
        };
        let parsed: RemoteResponse = resp.json().await.map_err(|e| base::err!(DataLoss, msg("malformed detection response: {e}")))?;
        Ok(parsed
            .detections
            .into_iter()
            .filter(|d| d.confidence >= self.threshold)
            .map(|d| Detection {
                label: d.label,
                confidence: d.confidence,
                x: d.x.clamp(0.0, 1.0),
                y: d.y.clamp(0.0, 1.0),
                w: d.w.clamp(0.0, 1.0),
                h: d.h.clamp(0.0, 1.0),
            })
            .collect())
    }
}

impl Predictor for RemotePredictor {
    fn predict(&self, _frame_rgb: &[u8], _width: u32, _height: u32) -> Result<Vec<Detection>, Error> {
        // Ignores the decoded frame entirely: the companion service pulls
        // its own snapshot (§4.4), so this backend never needs a decoder.
        self.handle.block_on(self.predict_async())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_resolves_against_api_base() {
        let handle = tokio::runtime::Runtime::new().unwrap();
        let base: url::Url = "http://127.0.0.1:9000/".parse().unwrap();
        let p = RemotePredictor::new(API_DETECTION_SENTINEL, &base, handle.handle().clone(), 0.5).unwrap();
        assert_eq!(p.snapshot_url.as_str(), "http://127.0.0.1:9000/snapshot");
        assert_eq!(p.detect_url.as_str(), "http://127.0.0.1:9000/detect");
    }

    #[test]
    fn literal_url_used_as_is() {
        let handle = tokio::runtime::Runtime::new().unwrap();
        let base: url::Url = "http://127.0.0.1:9000/".parse().unwrap();
        let p = RemotePredictor::new("https://detector.example/v1/", &base, handle.handle().clone(), 0.5).unwrap();
        assert_eq!(p.snapshot_url.as_str(), "https://detector.example/v1/snapshot");
    }

    #[test]
    fn rejects_non_sentinel_non_url_path() {
        let handle = tokio::runtime::Runtime::new().unwrap();
        let base: url::Url = "http://127.0.0.1:9000/".parse().unwrap();
        assert!(RemotePredictor::new("not-a-url", &base, handle.handle().clone(), 0.5).is_err());
    }

    #[test]
    fn unavailable_snapshot_service_returns_empty_not_error() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        // Nothing is listening on this port.
        let base: url::Url = "http://127.0.0.1:1".parse().unwrap();
        let p = RemotePredictor::new(API_DETECTION_SENTINEL, &base, rt.handle().clone(), 0.5).unwrap();
        let result = rt.block_on(p.predict_async()).unwrap();
        assert!(result.is_empty());
    }
}
