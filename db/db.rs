// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The catalog: a SQLite-backed store of stream configuration, recording
//! metadata, and detection/operational events (§3, §4.2, §6.2).
//!
//! [`Catalog`] owns the single [`rusqlite::Connection`] behind a mutex (one
//! writer at a time, matching SQLite's own single-writer model — see §5).
//! Every mutation goes through a [`Transaction`], whose `Drop` rolls back
//! unless [`Transaction::commit`] was called, so a caller that bails out
//! early via `?` can never leave a half-applied change visible.

use std::path::Path;

use base::{bail, clock::Clocks, err, Error, ErrorKind, Mutex, ResultExt as _};
use rusqlite::params;
use tracing::info;

use crate::model::{
    DetectionEvent, MotionConfig, NewDetectionEvent, NewRecording, NewStream, Recording,
    RecordingFilter, RecordingUpdate, Sort, Stream,
};
use crate::raw::{self, RecordingTable};

/// The SQLite `user_version` pragma doubles as our schema version, per the
/// teacher's convention: it's transactional with every other change, so a
/// crash mid-migration can never leave version and schema disagreeing.
const MIN_SQLITE_VERSION: (i32, &str) = (3035000, "3.35.0");

pub(crate) fn get_schema_version(conn: &rusqlite::Connection) -> Result<Option<i32>, Error> {
    let exists: bool = conn
        .query_row(
            "select count(*) > 0 from sqlite_master where type = 'table' and name = 'version'",
            params![],
            |row| row.get(0),
        )
        .err_kind(ErrorKind::Internal)?;
    if !exists {
        return Ok(None);
    }
    conn.query_row("select max(id) from version", params![], |row| row.get(0))
        .err_kind(ErrorKind::Internal)
}

fn check_sqlite_version(conn: &rusqlite::Connection) -> Result<(), Error> {
    let (version, version_number): (String, i32) = conn
        .query_row("select sqlite_version(), sqlite_version_number()", params![], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .err_kind(ErrorKind::Internal)?;
    if version_number < MIN_SQLITE_VERSION.0 {
        bail!(
            FailedPrecondition,
            msg(
                "SQLite version {} is too old; need at least {}",
                version,
                MIN_SQLITE_VERSION.1
            )
        );
    }
    Ok(())
}

/// Pragmas chosen for crash-safety and the single-writer/many-reader access
/// pattern described in §5: WAL mode lets readers (the HTTP surface) proceed
/// while the ingest pipeline holds the write lock.
const INTEGRITY_PRAGMAS: &str = "
    pragma journal_mode = wal;
    pragma synchronous = normal;
    pragma foreign_keys = on;
";

fn set_integrity_pragmas(conn: &rusqlite::Connection) -> Result<(), Error> {
    conn.execute_batch(INTEGRITY_PRAGMAS)
        .map_err(|e| err!(Internal, msg("setting pragmas"), source(e)))
}

/// Brings a connection up to the current schema, creating it fresh if empty.
pub(crate) fn init(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    check_sqlite_version(conn)?;
    set_integrity_pragmas(conn)?;
    crate::upgrade::run(conn)
}

/// Errors out if `conn`'s schema isn't exactly [`crate::upgrade::EXPECTED_VERSION`].
pub(crate) fn check_schema_version(conn: &rusqlite::Connection) -> Result<(), Error> {
    let ver = get_schema_version(conn)?;
    match ver {
        Some(v) if v == crate::upgrade::EXPECTED_VERSION => Ok(()),
        Some(v) => Err(err!(
            FailedPrecondition,
            msg(
                "catalog is at schema version {v}, expected {}; run migrations first",
                crate::upgrade::EXPECTED_VERSION
            )
        )),
        None => Err(err!(FailedPrecondition, msg("catalog has no version table"))),
    }
}

/// The catalog database. Cheap to clone-share: wrap in an `Arc` at the call
/// site if more than one owner is needed (mirrors [`base::shutdown::Receiver`]'s
/// own cloneable-handle style).
pub struct Catalog<C: Clocks + Clone = base::clock::RealClocks> {
    conn: Mutex<rusqlite::Connection>,
    clocks: C,
}

impl Catalog<base::clock::RealClocks> {
    /// Opens (creating if necessary) the catalog database at `path`.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| err!(Internal, msg("opening catalog at {}", path.display()), source(e)))?;
        Self::new(conn, base::clock::RealClocks {})
    }
}

impl<C: Clocks + Clone> Catalog<C> {
    /// Wraps an already-open connection, running migrations against it.
    /// Used directly by tests with an in-memory connection and
    /// [`base::clock::SimulatedClocks`].
    pub fn new(mut conn: rusqlite::Connection, clocks: C) -> Result<Self, Error> {
        init(&mut conn)?;
        Ok(Catalog {
            conn: Mutex::new(conn),
            clocks,
        })
    }

    /// Starts a write transaction. Only one may be outstanding at a time
    /// (the mutex blocks a second caller until the first's guard drops, up
    /// to a 5 s wait before giving up — §4.2 "begin acquires the
    /// process-wide lock with a 5 s timeout").
    pub fn tx(&self) -> Result<Transaction<'_, C>, Error> {
        let guard = self
            .conn
            .try_lock_for(std::time::Duration::from_secs(5))
            .ok_or_else(|| err!(DeadlineExceeded, msg("timed out waiting for the catalog lock")))?;
        guard
            .execute_batch("begin immediate")
            .map_err(|e| err!(Internal, msg("starting transaction"), source(e)))?;
        Ok(Transaction {
            conn: guard,
            clocks: &self.clocks,
            committed: false,
        })
    }

    /// Returns the on-disk size of the catalog file in bytes, via SQLite's
    /// page accounting (§4.2 `size_bytes`).
    pub fn size_bytes(&self) -> Result<i64, Error> {
        let conn = self.conn.lock();
        let page_count: i64 = conn
            .query_row("pragma page_count", params![], |row| row.get(0))
            .err_kind(ErrorKind::Internal)?;
        let page_size: i64 = conn
            .query_row("pragma page_size", params![], |row| row.get(0))
            .err_kind(ErrorKind::Internal)?;
        Ok(page_count * page_size)
    }

    /// Runs SQLite's own consistency checker plus the orphan-row scan
    /// described in §4.2 `integrity_check`. Does not touch the filesystem;
    /// cross-referencing recording rows against files on disk is the `check`
    /// command's job (it has the storage root), not the catalog's.
    pub fn integrity_check(&self) -> Result<Vec<String>, Error> {
        let conn = self.conn.lock();
        let mut problems = Vec::new();
        let sqlite_report: Vec<String> = conn
            .prepare_cached("pragma integrity_check")
            .err_kind(ErrorKind::Internal)?
            .query_map(params![], |row| row.get(0))
            .err_kind(ErrorKind::Internal)?
            .collect::<Result<_, _>>()
            .err_kind(ErrorKind::Internal)?;
        for line in sqlite_report {
            if line != "ok" {
                problems.push(format!("sqlite integrity_check: {line}"));
            }
        }
        let orphans: i64 = conn
            .query_row(
                "select count(*) from recordings
                 where stream_name not in (select name from streams)",
                params![],
                |row| row.get(0),
            )
            .err_kind(ErrorKind::Internal)?;
        if orphans > 0 {
            problems.push(format!("{orphans} recording row(s) reference a nonexistent stream"));
        }
        Ok(problems)
    }

    /// Reclaims space left by deleted rows. Not run automatically — the
    /// `retention` sweep calls it only after a delete pass removes enough
    /// rows to be worth the I/O (§4.8).
    pub fn vacuum(&self) -> Result<(), Error> {
        let conn = self.conn.lock();
        conn.execute_batch("vacuum").map_err(|e| err!(Internal, msg("vacuuming catalog"), source(e)))
    }
}

/// A write transaction. Rolls back on drop unless [`Transaction::commit`]
/// was called — mirroring the teacher's lock-guard-flushes-on-drop pattern,
/// but for SQL atomicity rather than an in-memory cache.
pub struct Transaction<'a, C: Clocks + Clone> {
    conn: base::MutexGuard<'a, rusqlite::Connection>,
    clocks: &'a C,
    committed: bool,
}

impl<'a, C: Clocks + Clone> Transaction<'a, C> {
    pub fn commit(mut self) -> Result<(), Error> {
        self.conn
            .execute_batch("commit")
            .map_err(|e| err!(Internal, msg("committing transaction"), source(e)))?;
        self.committed = true;
        Ok(())
    }

    fn now(&self) -> i64 {
        self.clocks.realtime().as_second()
    }

    // ---- streams ----

    pub fn add_stream(&self, s: &NewStream) -> Result<i64, Error> {
        raw::insert_stream(&self.conn, s)
    }

    pub fn update_stream(&self, name: &str, s: &NewStream) -> Result<(), Error> {
        raw::update_stream_by_name(&self.conn, name, s)
    }

    pub fn get_stream(&self, name: &str) -> Result<Option<Stream>, Error> {
        raw::get_stream(&self.conn, name)
    }

    pub fn get_stream_by_id(&self, id: i64) -> Result<Option<Stream>, Error> {
        raw::get_stream_by_id(&self.conn, id)
    }

    pub fn list_streams(&self, include_disabled: bool) -> Result<Vec<Stream>, Error> {
        raw::list_streams(&self.conn, include_disabled)
    }

    pub fn soft_delete_stream(&self, name: &str) -> Result<(), Error> {
        raw::soft_delete_stream(&self.conn, name)
    }

    pub fn permanent_delete_stream(&self, name: &str) -> Result<(), Error> {
        raw::permanent_delete_stream(&self.conn, name, self.now())
    }

    pub fn is_stream_tombstoned(&self, name: &str) -> Result<bool, Error> {
        raw::is_stream_tombstoned(&self.conn, name)
    }

    pub fn count_streams(&self) -> Result<i64, Error> {
        raw::count_streams(&self.conn)
    }

    /// Adds a new stream named `name`, or, if a stream by that name already
    /// exists (even soft-deleted), reactivates it in place: its url and
    /// `record_audio` are overwritten and `enabled` is forced true, but every
    /// other column (width/height/detection policy/retention policy/ptz/...)
    /// is left as-is rather than reset to defaults. Shared by the CLI's
    /// `config add` and the HTTP `POST /api/streams` handler so both honor
    /// the same "re-add a soft-deleted stream updates the original row"
    /// rule (§4.2).
    pub fn add_or_reactivate_stream(
        &self,
        name: &str,
        url: &str,
        record_audio: bool,
    ) -> Result<(), Error> {
        match raw::get_stream(&self.conn, name)? {
            Some(existing) => raw::update_stream_by_name(
                &self.conn,
                name,
                &NewStream {
                    name: existing.name,
                    url: url.to_owned(),
                    enabled: true,
                    streaming_enabled: existing.streaming_enabled,
                    width: existing.width,
                    height: existing.height,
                    fps: existing.fps,
                    codec: existing.codec,
                    priority: existing.priority,
                    record: existing.record,
                    segment_duration: existing.segment_duration,
                    protocol: existing.protocol,
                    is_onvif: existing.is_onvif,
                    record_audio,
                    backchannel_enabled: existing.backchannel_enabled,
                    detection: existing.detection,
                    retention: existing.retention,
                    ptz: existing.ptz,
                },
            ),
            None => raw::insert_stream(
                &self.conn,
                &NewStream {
                    name: name.to_owned(),
                    url: url.to_owned(),
                    enabled: true,
                    streaming_enabled: true,
                    record: true,
                    record_audio,
                    protocol: "tcp".to_owned(),
                    segment_duration: 60,
                    ..Default::default()
                },
            )
            .map(|_| ()),
        }
    }

    pub fn get_motion_config(&self, stream_name: &str) -> Result<Option<MotionConfig>, Error> {
        raw::get_motion_config(&self.conn, stream_name)
    }

    pub fn upsert_motion_config(&self, c: &MotionConfig) -> Result<(), Error> {
        raw::upsert_motion_config(&self.conn, c)
    }

    // ---- continuous recordings ----

    pub fn add_recording(&self, r: &NewRecording) -> Result<i64, Error> {
        raw::add_recording(&self.conn, RecordingTable::Continuous, r)
    }

    pub fn update_recording(&self, id: i64, u: &RecordingUpdate) -> Result<(), Error> {
        raw::update_recording(&self.conn, RecordingTable::Continuous, id, u)
    }

    pub fn get_recording_by_id(&self, id: i64) -> Result<Option<Recording>, Error> {
        raw::get_recording_by_id(&self.conn, RecordingTable::Continuous, id)
    }

    pub fn get_recording_by_path(&self, file_path: &str) -> Result<Option<Recording>, Error> {
        raw::get_recording_by_path(&self.conn, RecordingTable::Continuous, file_path)
    }

    pub fn get_recordings(
        &self,
        filter: &RecordingFilter,
        sort: Sort,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Recording>, Error> {
        raw::get_recordings(&self.conn, RecordingTable::Continuous, filter, sort, limit, offset)
    }

    pub fn count_recordings(&self, filter: &RecordingFilter) -> Result<i64, Error> {
        raw::count_recordings(&self.conn, RecordingTable::Continuous, filter)
    }

    pub fn delete_recording(&self, id: i64) -> Result<(), Error> {
        raw::delete_recording(&self.conn, RecordingTable::Continuous, id)
    }

    pub fn delete_recordings_older_than(
        &self,
        stream_name: &str,
        cutoff: i64,
    ) -> Result<Vec<Recording>, Error> {
        raw::delete_recordings_older_than(&self.conn, RecordingTable::Continuous, stream_name, cutoff)
    }

    pub fn delete_oldest_until_under_budget(
        &self,
        stream_name: &str,
        max_bytes: i64,
    ) -> Result<Vec<Recording>, Error> {
        raw::delete_oldest_until_under_budget(&self.conn, RecordingTable::Continuous, stream_name, max_bytes)
    }

    // ---- motion recordings (same lifecycle rules, separate table) ----

    pub fn add_motion_recording(&self, r: &NewRecording) -> Result<i64, Error> {
        raw::add_recording(&self.conn, RecordingTable::Motion, r)
    }

    pub fn update_motion_recording(&self, id: i64, u: &RecordingUpdate) -> Result<(), Error> {
        raw::update_recording(&self.conn, RecordingTable::Motion, id, u)
    }

    pub fn get_motion_recordings(
        &self,
        filter: &RecordingFilter,
        sort: Sort,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Recording>, Error> {
        raw::get_recordings(&self.conn, RecordingTable::Motion, filter, sort, limit, offset)
    }

    pub fn delete_motion_recordings_older_than(
        &self,
        stream_name: &str,
        cutoff: i64,
    ) -> Result<Vec<Recording>, Error> {
        raw::delete_recordings_older_than(&self.conn, RecordingTable::Motion, stream_name, cutoff)
    }

    // ---- detections & events ----

    pub fn insert_detections(&self, events: &[NewDetectionEvent]) -> Result<(), Error> {
        raw::insert_detections(&self.conn, events)
    }

    pub fn query_detections(
        &self,
        stream_name: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<DetectionEvent>, Error> {
        raw::query_detections(&self.conn, stream_name, start, end)
    }

    pub fn insert_event(
        &self,
        event_type: &str,
        stream_name: Option<&str>,
        description: Option<&str>,
        details: Option<&str>,
    ) -> Result<i64, Error> {
        raw::insert_event(&self.conn, event_type, self.now(), stream_name, description, details)
    }
}

impl<'a, C: Clocks + Clone> Drop for Transaction<'a, C> {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.conn.execute_batch("rollback") {
                info!(error = %e, "rollback on transaction drop failed (connection likely poisoned)");
            }
        }
    }
}
