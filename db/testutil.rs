// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Test harness for the catalog crate and its dependents: an in-memory
//! [`Catalog`] driven by [`base::clock::SimulatedClocks`] so tests never
//! sleep for real.

use base::clock::SimulatedClocks;
use jiff::Timestamp;

use crate::model::{DetectionPolicy, NewStream, PtzMetadata, RetentionPolicy};
use crate::Catalog;

static INIT: std::sync::Once = std::sync::Once::new();

/// Performs process-wide test setup: installs tracing output once per
/// process (repeat calls are a no-op, matching [`std::sync::Once`]).
pub fn init() {
    INIT.call_once(|| {
        base::tracing_setup::install_for_tests();
    });
}

/// Builds a minimally-filled [`NewStream`] for `name`, suitable as a
/// starting point for tests that only care about a couple of fields.
pub fn test_stream(name: &str) -> NewStream {
    NewStream {
        name: name.to_owned(),
        url: format!("rtsp://127.0.0.1/{name}"),
        enabled: true,
        streaming_enabled: true,
        width: 1920,
        height: 1080,
        fps: 15.0,
        codec: "h264".to_owned(),
        priority: 5,
        record: true,
        segment_duration: 60,
        protocol: "tcp".to_owned(),
        is_onvif: false,
        record_audio: false,
        backchannel_enabled: false,
        detection: DetectionPolicy::default(),
        retention: RetentionPolicy {
            days: 30,
            detection_days: 30,
            max_storage_mb: 0,
        },
        ptz: PtzMetadata::default(),
    }
}

/// An in-memory catalog plus the simulated clock driving it, for use in a
/// single test function.
pub struct TestCatalog {
    pub catalog: Catalog<SimulatedClocks>,
    pub clocks: SimulatedClocks,
}

impl TestCatalog {
    /// Opens a fresh `:memory:` catalog with the clock starting at
    /// 2024-01-01T00:00:00Z.
    pub fn new() -> Self {
        init();
        let clocks = SimulatedClocks::new(Timestamp::from_second(1_704_067_200).unwrap());
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let catalog = Catalog::new(conn, clocks.clone()).unwrap();
        TestCatalog { catalog, clocks }
    }
}

impl Default for TestCatalog {
    fn default() -> Self {
        Self::new()
    }
}
