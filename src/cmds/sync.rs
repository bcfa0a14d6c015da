// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! `sync` (§1.4, §6.3 `POST /api/recordings/sync`): rescans the on-disk MP4
//! tree and repopulates the catalog from whatever it finds — crash recovery
//! (§8 S4) and orphan-file adoption (§9 "sync behavior for orphan files")
//! share this one code path, reachable from both the CLI and the HTTP
//! surface.

use std::path::{Path, PathBuf};

use base::Error;
use bpaf::Bpaf;
use catalog::model::{NewRecording, NewStream, RecordingUpdate, TriggerType};
use catalog::Catalog;
use tracing::{info, warn};

#[derive(Bpaf, Debug)]
#[bpaf(command("sync"))]
/// Rescans the recordings tree and repopulates the catalog from files found.
pub struct Args {
    /// Root directory for the database, recordings, and detection models.
    #[bpaf(long, argument("PATH"))]
    storage_root: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let catalog = super::open_catalog(&args.storage_root)?;
    let report = sync(&catalog, &args.storage_root)?;
    info!(
        inserted = report.inserted,
        completed = report.completed,
        streams_created = report.streams_created,
        "sync complete"
    );
    Ok(0)
}

#[derive(Default, Debug)]
pub struct SyncReport {
    pub inserted: usize,
    pub completed: usize,
    pub streams_created: usize,
}

/// Walks `<storage_root>/mp4/<stream>/*.mp4` (§6.1 on-disk layout),
/// classifying each file by its name and reconciling it with the catalog.
pub fn sync<C: base::clock::Clocks + Clone>(catalog: &Catalog<C>, storage_root: &Path) -> Result<SyncReport, Error> {
    let mp4_root = storage_root.join(super::MP4_DIR);
    let mut report = SyncReport::default();
    if !mp4_root.is_dir() {
        return Ok(report);
    }

    for stream_dir in std::fs::read_dir(&mp4_root)? {
        let stream_dir = stream_dir?;
        if !stream_dir.file_type()?.is_dir() {
            continue;
        }
        let stream_name = stream_dir.file_name().to_string_lossy().into_owned();

        for entry in std::fs::read_dir(stream_dir.path())? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("mp4") {
                continue;
            }
            if let Err(e) = sync_one_file(catalog, &stream_name, &path, &mut report) {
                warn!(file = %path.display(), exception = %e.chain(), "failed to sync file");
            }
        }
    }
    Ok(report)
}

fn sync_one_file<C: base::clock::Clocks + Clone>(
    catalog: &Catalog<C>,
    stream_name: &str,
    path: &Path,
    report: &mut SyncReport,
) -> Result<(), Error> {
    let file_path = path.to_string_lossy().into_owned();
    let tx = catalog.tx()?;

    if let Some(existing) = tx.get_recording_by_path(&file_path)? {
        if existing.end_time.is_none() {
            // A crash-interrupted recording (§8 S4): recompute its duration
            // from the file's own trailer, since the ingest thread that was
            // writing it never got to call `update_recording`.
            let duration_secs = crate::mp4meta::movie_duration_secs(path)?;
            let size_bytes = i64::try_from(std::fs::metadata(path)?.len()).unwrap_or(i64::MAX);
            tx.update_recording(
                existing.id,
                &RecordingUpdate {
                    end_time: existing.start_time + duration_secs.round() as i64,
                    size_bytes,
                    is_complete: true,
                },
            )?;
            report.completed += 1;
        }
        tx.commit()?;
        return Ok(());
    }

    // No catalog row at all: an orphan file. Make sure its stream exists
    // (creating a disabled placeholder if not, unless it was permanently
    // deleted, per the tombstone resolution in DESIGN.md) then insert a
    // best-effort recording row from the filename and trailer.
    if tx.get_stream(stream_name)?.is_none() {
        if tx.is_stream_tombstoned(stream_name)? {
            info!(stream = stream_name, file = %path.display(), "skipping orphan file for permanently deleted stream");
            tx.commit()?;
            return Ok(());
        }
        tx.add_stream(&NewStream {
            name: stream_name.to_owned(),
            enabled: false,
            ..Default::default()
        })?;
        report.streams_created += 1;
    }

    let trigger_type = trigger_type_from_filename(path);
    let start_time = start_time_from_filename(path).unwrap_or(0);
    let duration_secs = crate::mp4meta::movie_duration_secs(path).unwrap_or(0.0);
    let size_bytes = i64::try_from(std::fs::metadata(path)?.len()).unwrap_or(i64::MAX);

    tx.add_recording(&NewRecording {
        stream_name: stream_name.to_owned(),
        file_path,
        start_time,
        width: 0,
        height: 0,
        fps: 0.0,
        codec: String::new(),
        trigger_type,
    })?;
    if duration_secs > 0.0 {
        // Look the row back up by path to get the id just assigned.
        if let Some(row) = tx.get_recording_by_path(&path.to_string_lossy())? {
            tx.update_recording(
                row.id,
                &RecordingUpdate {
                    end_time: start_time + duration_secs.round() as i64,
                    size_bytes,
                    is_complete: true,
                },
            )?;
        }
    }
    report.inserted += 1;
    tx.commit()?;
    Ok(())
}

fn trigger_type_from_filename(path: &Path) -> TriggerType {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    if stem.starts_with("detection_") {
        TriggerType::Detection
    } else if stem.starts_with("motion_") {
        TriggerType::Motion
    } else {
        TriggerType::Continuous
    }
}

/// Parses the `_YYYYMMDD_HHMMSS` suffix in `recording_YYYYMMDD_HHMMSS.mp4`
/// (and the `detection_`/`motion_` equivalents) into a Unix timestamp.
fn start_time_from_filename(path: &Path) -> Option<i64> {
    let stem = path.file_stem()?.to_str()?;
    let mut parts = stem.rsplitn(3, '_');
    let time = parts.next()?;
    let date = parts.next()?;
    if time.len() != 6 || date.len() != 8 {
        return None;
    }
    let year: i16 = date[0..4].parse().ok()?;
    let month: i8 = date[4..6].parse().ok()?;
    let day: i8 = date[6..8].parse().ok()?;
    let hour: i8 = time[0..2].parse().ok()?;
    let minute: i8 = time[2..4].parse().ok()?;
    let second: i8 = time[4..6].parse().ok()?;
    let dt = jiff::civil::DateTime::new(year, month, day, hour, minute, second, 0).ok()?;
    let zoned = dt.to_zoned(jiff::tz::TimeZone::UTC).ok()?;
    Some(zoned.timestamp().as_second())
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::testutil::TestCatalog;

    #[test]
    fn orphan_file_creates_disabled_stream_and_recording() {
        let tc = TestCatalog::new();
        let dir = tempfile::tempdir().unwrap();
        let stream_dir = dir.path().join(super::super::MP4_DIR).join("front");
        std::fs::create_dir_all(&stream_dir).unwrap();
        let file = stream_dir.join("recording_20240115_103000.mp4");
        std::fs::write(&file, b"not a real mp4, duration lookup will fail gracefully").unwrap();

        let report = sync(&tc.catalog, dir.path()).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.streams_created, 1);

        let tx = tc.catalog.tx().unwrap();
        let stream = tx.get_stream("front").unwrap().unwrap();
        assert!(!stream.enabled);
        let recording = tx.get_recording_by_path(&file.to_string_lossy()).unwrap().unwrap();
        assert_eq!(recording.trigger_type, TriggerType::Continuous);
    }

    #[test]
    fn tombstoned_stream_is_not_recreated() {
        let tc = TestCatalog::new();
        {
            let tx = tc.catalog.tx().unwrap();
            tx.add_stream(&NewStream {
                name: "gone".to_owned(),
                ..Default::default()
            })
            .unwrap();
            tx.permanent_delete_stream("gone").unwrap();
            tx.commit().unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let stream_dir = dir.path().join(super::super::MP4_DIR).join("gone");
        std::fs::create_dir_all(&stream_dir).unwrap();
        std::fs::write(stream_dir.join("recording_20240115_103000.mp4"), b"x").unwrap();

        let report = sync(&tc.catalog, dir.path()).unwrap();
        assert_eq!(report.streams_created, 0);
        assert_eq!(report.inserted, 0);
    }

    #[test]
    fn filename_timestamp_parses() {
        let p = PathBuf::from("/x/recording_20240115_103000.mp4");
        let t = start_time_from_filename(&p).unwrap();
        // 2024-01-15T10:30:00Z
        assert_eq!(t, 1705314600);
    }
}
