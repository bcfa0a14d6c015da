// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Typed row structs for the catalog tables.

use serde::{Deserialize, Serialize};

/// Why a recording was started.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Continuous,
    Detection,
    Motion,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerType::Continuous => "continuous",
            TriggerType::Detection => "detection",
            TriggerType::Motion => "motion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "continuous" => Some(TriggerType::Continuous),
            "detection" => Some(TriggerType::Detection),
            "motion" => Some(TriggerType::Motion),
            _ => None,
        }
    }
}

/// A stream's detection policy (§3 Stream "detection policy" attribute group).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DetectionPolicy {
    pub enabled: bool,
    pub model: Option<String>,
    pub threshold: f64,
    pub interval: i64,
    pub pre_roll_seconds: i64,
    pub post_roll_seconds: i64,
    pub api_url: Option<String>,
}

/// A stream's retention policy (§3 Stream "retention policy" attribute group).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub days: i64,
    pub detection_days: i64,
    pub max_storage_mb: i64,
}

/// PTZ/ONVIF metadata, carried verbatim (this crate doesn't interpret it).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PtzMetadata {
    pub enabled: bool,
    pub presets: Option<String>,
    pub onvif_host: Option<String>,
    pub onvif_port: Option<i64>,
    pub onvif_username: Option<String>,
    pub onvif_password: Option<String>,
}

/// A configured ingest source (the `streams` table).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Stream {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub streaming_enabled: bool,
    pub width: i64,
    pub height: i64,
    pub fps: f64,
    pub codec: String,
    pub priority: i64,
    pub record: bool,
    pub segment_duration: i64,
    pub protocol: String,
    pub is_onvif: bool,
    pub record_audio: bool,
    pub backchannel_enabled: bool,
    pub detection: DetectionPolicy,
    pub retention: RetentionPolicy,
    pub ptz: PtzMetadata,
}

/// Fields needed to create a new [`Stream`]; `id` is assigned by the catalog.
#[derive(Clone, Debug, Default)]
pub struct NewStream {
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub streaming_enabled: bool,
    pub width: i64,
    pub height: i64,
    pub fps: f64,
    pub codec: String,
    pub priority: i64,
    pub record: bool,
    pub segment_duration: i64,
    pub protocol: String,
    pub is_onvif: bool,
    pub record_audio: bool,
    pub backchannel_enabled: bool,
    pub detection: DetectionPolicy,
    pub retention: RetentionPolicy,
    pub ptz: PtzMetadata,
}

/// A stream's motion-triggered-recording policy (the `motion_config` table,
/// §6.2). Distinct from [`DetectionPolicy`]: this gates a pixel-diff
/// heuristic rather than the AI predictor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MotionConfig {
    pub stream_name: String,
    pub enabled: bool,
    pub sensitivity: f64,
    pub min_area: f64,
    pub cooldown_seconds: i64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        MotionConfig {
            stream_name: String::new(),
            enabled: false,
            sensitivity: 0.5,
            min_area: 0.01,
            cooldown_seconds: 30,
        }
    }
}

/// One completed or in-progress capture file (the `recordings` table).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Recording {
    pub id: i64,
    pub stream_name: String,
    pub file_path: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub size_bytes: i64,
    pub width: i64,
    pub height: i64,
    pub fps: f64,
    pub codec: String,
    pub is_complete: bool,
    pub trigger_type: TriggerType,
}

/// Fields needed to open a new recording row (§4.2 `add_recording`).
#[derive(Clone, Debug)]
pub struct NewRecording {
    pub stream_name: String,
    pub file_path: String,
    pub start_time: i64,
    pub width: i64,
    pub height: i64,
    pub fps: f64,
    pub codec: String,
    pub trigger_type: TriggerType,
}

/// Fields written at recording close (§4.2 `update_recording`).
#[derive(Clone, Debug)]
pub struct RecordingUpdate {
    pub end_time: i64,
    pub size_bytes: i64,
    pub is_complete: bool,
}

/// One object detected in a frame (the `detections` table).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub id: i64,
    pub stream_name: String,
    pub timestamp: i64,
    pub label: String,
    pub confidence: f64,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Fields needed to insert a new [`DetectionEvent`]; `id` is assigned by the catalog.
#[derive(Clone, Debug)]
pub struct NewDetectionEvent {
    pub stream_name: String,
    pub timestamp: i64,
    pub label: String,
    pub confidence: f64,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// A free-form operational event (the `events` table): stream
/// enable/disable, retention sweeps, restarts, etc.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub event_type: String,
    pub timestamp: i64,
    pub stream_name: Option<String>,
    pub description: Option<String>,
    pub details: Option<String>,
}

/// Filters accepted by [`crate::Transaction::get_recordings`].
#[derive(Clone, Debug, Default)]
pub struct RecordingFilter {
    pub stream_name: Option<String>,
    pub start_after: Option<i64>,
    pub end_before: Option<i64>,
    pub complete_only: bool,
}

/// Sort column allow-list for `get_recordings` (§4.2 "Sorting safety").
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SortField {
    Id,
    StreamName,
    StartTime,
    EndTime,
    SizeBytes,
}

impl SortField {
    pub fn column(self) -> &'static str {
        match self {
            SortField::Id => "id",
            SortField::StreamName => "stream_name",
            SortField::StartTime => "start_time",
            SortField::EndTime => "end_time",
            SortField::SizeBytes => "size_bytes",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "id" => Some(SortField::Id),
            "stream_name" => Some(SortField::StreamName),
            "start_time" => Some(SortField::StartTime),
            "end_time" => Some(SortField::EndTime),
            "size_bytes" => Some(SortField::SizeBytes),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

/// A sort spec from a user-provided (field, direction) pair, falling back to
/// `start_time DESC` for anything not on the allow-list (§4.2).
#[derive(Copy, Clone, Debug)]
pub struct Sort {
    pub field: SortField,
    pub dir: SortDir,
}

impl Default for Sort {
    fn default() -> Self {
        Sort {
            field: SortField::StartTime,
            dir: SortDir::Desc,
        }
    }
}

impl Sort {
    pub fn parse(field: &str, dir: &str) -> Self {
        let field = SortField::parse(field);
        let dir = match dir {
            "asc" | "ASC" => Some(SortDir::Asc),
            "desc" | "DESC" => Some(SortDir::Desc),
            _ => None,
        };
        match (field, dir) {
            (Some(field), Some(dir)) => Sort { field, dir },
            _ => Sort::default(),
        }
    }
}
