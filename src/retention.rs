// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The retention engine (C8): a periodic sweep that expires recordings by
//! age and, per stream, by storage budget (§4.8).
//!
//! Grounded on the teacher's syncer thread: a plain OS thread that
//! sleep-loops on [`base::shutdown::Receiver`], not a tokio task (§2 Design
//! Notes "C7/C8 ... are plain OS threads").

use std::sync::Arc;

use base::clock::Clocks;
use jiff::SignedDuration;
use tracing::{info, warn};

use catalog::Catalog;

const SECONDS_PER_DAY: i64 = 86_400;
const BYTES_PER_MB: i64 = 1024 * 1024;

/// Runs the retention sweep every `interval` until `shutdown_rx` fires.
/// Intended to be run on its own OS thread.
pub fn run<C: Clocks + Clone>(catalog: Arc<Catalog<C>>, clocks: C, shutdown_rx: base::shutdown::Receiver, interval: SignedDuration) {
    while shutdown_rx.check().is_ok() {
        let now = clocks.realtime().as_second();
        if let Err(e) = sweep_once(&catalog, now) {
            warn!(exception = %e.chain(), "retention sweep failed");
        }
        clocks.sleep(interval);
    }
}

/// One pass over every stream: expire-by-age, then expire-by-budget, then
/// an opportunistic vacuum (§4.8 steps 1-4). `now` is the sweep's reference
/// time, passed in rather than read from the catalog's own clock so tests
/// can drive it deterministically.
pub fn sweep_once<C: Clocks + Clone>(catalog: &Catalog<C>, now: i64) -> Result<(), base::Error> {
    let streams = {
        let tx = catalog.tx()?;
        let streams = tx.list_streams(true)?;
        tx.commit()?;
        streams
    };

    for stream in &streams {
        let tx = catalog.tx()?;
        let mut expired = Vec::new();
        if stream.retention.days > 0 {
            let cutoff = now - stream.retention.days * SECONDS_PER_DAY;
            expired.extend(tx.delete_recordings_older_than(&stream.name, cutoff)?);
        }
        if stream.retention.detection_days > 0 {
            let cutoff = now - stream.retention.detection_days * SECONDS_PER_DAY;
            expired.extend(tx.delete_motion_recordings_older_than(&stream.name, cutoff)?);
        }
        if stream.retention.max_storage_mb > 0 {
            let max_bytes = stream.retention.max_storage_mb * BYTES_PER_MB;
            expired.extend(tx.delete_oldest_until_under_budget(&stream.name, max_bytes)?);
        }
        tx.commit()?;

        for recording in &expired {
            remove_file_logging_errors(&recording.file_path);
        }
        if !expired.is_empty() {
            info!(stream = %stream.name, count = expired.len(), "retention: expired recordings");
        }
    }

    catalog.vacuum()?;
    Ok(())
}

/// Deletes the file backing an expired recording row. A missing file is
/// logged, not failed: the row is already gone from the catalog, so there's
/// nothing left to roll back (§4.8 "logging but not failing on missing
/// files").
fn remove_file_logging_errors(path: &str) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path, exception = %e, "failed to remove expired recording file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use catalog::model::{DetectionPolicy, NewRecording, NewStream, PtzMetadata, RetentionPolicy, TriggerType};
    use jiff::Timestamp;

    fn test_catalog(now: i64) -> Catalog<SimulatedClocks> {
        let clocks = SimulatedClocks::new(Timestamp::from_second(now).unwrap());
        Catalog::new(rusqlite::Connection::open_in_memory().unwrap(), clocks).unwrap()
    }

    #[test]
    fn sweep_removes_aged_out_recordings_and_their_files() {
        let dir = tempfile::tempdir().unwrap();
        let now = 1_700_000_000;
        let catalog = test_catalog(now);

        {
            let tx = catalog.tx().unwrap();
            tx.add_stream(&NewStream {
                name: "front".to_owned(),
                url: "rtsp://example/front".to_owned(),
                enabled: true,
                retention: RetentionPolicy { days: 1, detection_days: 0, max_storage_mb: 0 },
                detection: DetectionPolicy::default(),
                ptz: PtzMetadata::default(),
                ..Default::default()
            })
            .unwrap();
            let old_path = dir.path().join("old.mp4");
            std::fs::write(&old_path, b"x").unwrap();
            let id = tx
                .add_recording(&NewRecording {
                    stream_name: "front".to_owned(),
                    file_path: old_path.to_string_lossy().into_owned(),
                    start_time: now - 2 * SECONDS_PER_DAY,
                    width: 0,
                    height: 0,
                    fps: 0.0,
                    codec: "h264".to_owned(),
                    trigger_type: TriggerType::Continuous,
                })
                .unwrap();
            tx.update_recording(
                id,
                &catalog::model::RecordingUpdate { end_time: now - 2 * SECONDS_PER_DAY + 10, size_bytes: 1, is_complete: true },
            )
            .unwrap();
            tx.commit().unwrap();
            assert!(old_path.exists());
        }

        sweep_once(&catalog, now).unwrap();

        let tx = catalog.tx().unwrap();
        let remaining = tx.get_recordings(&Default::default(), Default::default(), 100, 0).unwrap();
        assert!(remaining.is_empty());
    }
}
