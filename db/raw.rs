// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Raw prepared-statement access: SQL that doesn't interpret the schema
//! beyond what's needed to bind/read the typed row structs in [`crate::model`].

use std::collections::HashSet;

use base::{err, ErrorKind, ResultExt as _};
use rusqlite::{named_params, params, Connection, OptionalExtension, Row};

use crate::columns;
use crate::model::{
    DetectionEvent, MotionConfig, NewDetectionEvent, NewRecording, NewStream, Recording,
    RecordingFilter, RecordingUpdate, Sort, Stream, TriggerType,
};
use crate::query;

/// Which of the two structurally-identical recording tables a call targets.
/// Not user input — always a compile-time constant at the call site — so
/// interpolating it into SQL is safe.
#[derive(Copy, Clone)]
pub(crate) enum RecordingTable {
    Continuous,
    Motion,
}

impl RecordingTable {
    fn name(self) -> &'static str {
        match self {
            RecordingTable::Continuous => "recordings",
            RecordingTable::Motion => "motion_recordings",
        }
    }
}

/// Columns every supported schema version has always had. Missing any of
/// these means the on-disk schema predates this binary and needs an
/// upgrade, not graceful degradation.
const STREAM_REQUIRED_COLUMNS: &[&str] = &[
    "id", "name", "url", "enabled", "streaming_enabled", "width", "height", "fps", "codec",
    "priority", "record", "segment_duration", "protocol", "is_onvif", "record_audio",
    "detection_based_recording", "detection_model", "detection_threshold", "detection_interval",
    "pre_detection_buffer", "post_detection_buffer", "detection_api_url", "retention_days",
    "detection_retention_days", "max_storage_mb",
];

/// Columns a future migration could plausibly add or drop; a catalog
/// opened against an older schema still works, just without these fields
/// (§4.2 "Query-builder sub-component").
const STREAM_OPTIONAL_COLUMNS: &[&str] = &[
    "backchannel_enabled",
    "ptz_enabled",
    "ptz_presets",
    "onvif_host",
    "onvif_port",
    "onvif_username",
    "onvif_password",
];

/// Builds the `streams` select-list against the live schema, filtering
/// [`STREAM_OPTIONAL_COLUMNS`] down to whichever are actually present.
/// Returns the column list text plus the set of optional columns kept, so
/// [`stream_from_row`] knows which ones it can read versus must default.
fn stream_select_columns(conn: &Connection) -> Result<(String, HashSet<String>), base::Error> {
    let mut candidates: Vec<&'static str> = STREAM_REQUIRED_COLUMNS.to_vec();
    candidates.extend_from_slice(STREAM_OPTIONAL_COLUMNS);
    let present = columns::present(conn, "streams", &candidates, STREAM_REQUIRED_COLUMNS)?;
    let list = candidates.iter().filter(|c| present.contains(**c)).copied().collect::<Vec<_>>().join(", ");
    Ok((list, present))
}

fn stream_from_row(row: &Row, present: &HashSet<String>) -> rusqlite::Result<Stream> {
    use crate::model::{DetectionPolicy, PtzMetadata, RetentionPolicy};
    let opt_bool = |row: &Row, name: &str| -> rusqlite::Result<bool> {
        if present.contains(name) {
            Ok(row.get::<_, i64>(name)? != 0)
        } else {
            Ok(false)
        }
    };
    let opt_string = |row: &Row, name: &str| -> rusqlite::Result<Option<String>> {
        if present.contains(name) {
            row.get(name)
        } else {
            Ok(None)
        }
    };
    let opt_i64 = |row: &Row, name: &str| -> rusqlite::Result<Option<i64>> {
        if present.contains(name) {
            row.get(name)
        } else {
            Ok(None)
        }
    };
    Ok(Stream {
        id: row.get("id")?,
        name: row.get("name")?,
        url: row.get("url")?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        streaming_enabled: row.get::<_, i64>("streaming_enabled")? != 0,
        width: row.get("width")?,
        height: row.get("height")?,
        fps: row.get("fps")?,
        codec: row.get("codec")?,
        priority: row.get("priority")?,
        record: row.get::<_, i64>("record")? != 0,
        segment_duration: row.get("segment_duration")?,
        protocol: row.get("protocol")?,
        is_onvif: row.get::<_, i64>("is_onvif")? != 0,
        record_audio: row.get::<_, i64>("record_audio")? != 0,
        backchannel_enabled: opt_bool(row, "backchannel_enabled")?,
        detection: DetectionPolicy {
            enabled: row.get::<_, i64>("detection_based_recording")? != 0,
            model: row.get("detection_model")?,
            threshold: row.get("detection_threshold")?,
            interval: row.get("detection_interval")?,
            pre_roll_seconds: row.get("pre_detection_buffer")?,
            post_roll_seconds: row.get("post_detection_buffer")?,
            api_url: row.get("detection_api_url")?,
        },
        retention: RetentionPolicy {
            days: row.get("retention_days")?,
            detection_days: row.get("detection_retention_days")?,
            max_storage_mb: row.get("max_storage_mb")?,
        },
        ptz: PtzMetadata {
            enabled: opt_bool(row, "ptz_enabled")?,
            presets: opt_string(row, "ptz_presets")?,
            onvif_host: opt_string(row, "onvif_host")?,
            onvif_port: opt_i64(row, "onvif_port")?,
            onvif_username: opt_string(row, "onvif_username")?,
            onvif_password: opt_string(row, "onvif_password")?,
        },
    })
}

pub(crate) fn insert_stream(conn: &Connection, s: &NewStream) -> Result<i64, base::Error> {
    let sql = format!(
        "insert into streams (
            name, url, enabled, streaming_enabled, width, height, fps, codec, priority, record,
            segment_duration, protocol, is_onvif, record_audio, backchannel_enabled,
            detection_based_recording, detection_model, detection_threshold, detection_interval,
            pre_detection_buffer, post_detection_buffer, detection_api_url,
            retention_days, detection_retention_days, max_storage_mb,
            ptz_enabled, ptz_presets, onvif_host, onvif_port, onvif_username, onvif_password
        ) values (
            :name, :url, :enabled, :streaming_enabled, :width, :height, :fps, :codec, :priority,
            :record, :segment_duration, :protocol, :is_onvif, :record_audio,
            :backchannel_enabled, :detection_enabled, :detection_model, :detection_threshold,
            :detection_interval, :pre_roll, :post_roll, :detection_api_url,
            :retention_days, :detection_retention_days, :max_storage_mb,
            :ptz_enabled, :ptz_presets, :onvif_host, :onvif_port, :onvif_username, :onvif_password
        )"
    );
    let mut stmt = conn.prepare_cached(&sql).err_kind(ErrorKind::Internal)?;
    stmt.execute(named_params! {
        ":name": s.name,
        ":url": s.url,
        ":enabled": s.enabled as i64,
        ":streaming_enabled": s.streaming_enabled as i64,
        ":width": s.width,
        ":height": s.height,
        ":fps": s.fps,
        ":codec": s.codec,
        ":priority": s.priority,
        ":record": s.record as i64,
        ":segment_duration": s.segment_duration,
        ":protocol": s.protocol,
        ":is_onvif": s.is_onvif as i64,
        ":record_audio": s.record_audio as i64,
        ":backchannel_enabled": s.backchannel_enabled as i64,
        ":detection_enabled": s.detection.enabled as i64,
        ":detection_model": s.detection.model,
        ":detection_threshold": s.detection.threshold,
        ":detection_interval": s.detection.interval,
        ":pre_roll": s.detection.pre_roll_seconds,
        ":post_roll": s.detection.post_roll_seconds,
        ":detection_api_url": s.detection.api_url,
        ":retention_days": s.retention.days,
        ":detection_retention_days": s.retention.detection_days,
        ":max_storage_mb": s.retention.max_storage_mb,
        ":ptz_enabled": s.ptz.enabled as i64,
        ":ptz_presets": s.ptz.presets,
        ":onvif_host": s.ptz.onvif_host,
        ":onvif_port": s.ptz.onvif_port,
        ":onvif_username": s.ptz.onvif_username,
        ":onvif_password": s.ptz.onvif_password,
    })
    .map_err(|e| {
        if matches!(
            &e,
            rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
        ) {
            err!(AlreadyExists, msg("stream {} already exists", s.name), source(e))
        } else {
            err!(Internal, msg("inserting stream {}", s.name), source(e))
        }
    })?;
    Ok(conn.last_insert_rowid())
}

/// Updates every mutable column of the stream named `name` in place (used
/// both by the stream-CRUD API and by S5's "soft-delete then re-add"
/// semantics, which update the original row rather than inserting a new one).
pub(crate) fn update_stream_by_name(
    conn: &Connection,
    name: &str,
    s: &NewStream,
) -> Result<(), base::Error> {
    let mut stmt = conn
        .prepare_cached(
            "update streams set
                name = :new_name, url = :url, enabled = :enabled,
                streaming_enabled = :streaming_enabled, width = :width, height = :height,
                fps = :fps, codec = :codec, priority = :priority, record = :record,
                segment_duration = :segment_duration, protocol = :protocol,
                is_onvif = :is_onvif, record_audio = :record_audio,
                backchannel_enabled = :backchannel_enabled,
                detection_based_recording = :detection_enabled,
                detection_model = :detection_model, detection_threshold = :detection_threshold,
                detection_interval = :detection_interval, pre_detection_buffer = :pre_roll,
                post_detection_buffer = :post_roll, detection_api_url = :detection_api_url,
                retention_days = :retention_days,
                detection_retention_days = :detection_retention_days,
                max_storage_mb = :max_storage_mb, ptz_enabled = :ptz_enabled,
                ptz_presets = :ptz_presets, onvif_host = :onvif_host, onvif_port = :onvif_port,
                onvif_username = :onvif_username, onvif_password = :onvif_password,
                deleted_at = null
            where name = :name",
        )
        .err_kind(ErrorKind::Internal)?;
    let n = stmt
        .execute(named_params! {
            ":name": name,
            ":new_name": s.name,
            ":url": s.url,
            ":enabled": s.enabled as i64,
            ":streaming_enabled": s.streaming_enabled as i64,
            ":width": s.width,
            ":height": s.height,
            ":fps": s.fps,
            ":codec": s.codec,
            ":priority": s.priority,
            ":record": s.record as i64,
            ":segment_duration": s.segment_duration,
            ":protocol": s.protocol,
            ":is_onvif": s.is_onvif as i64,
            ":record_audio": s.record_audio as i64,
            ":backchannel_enabled": s.backchannel_enabled as i64,
            ":detection_enabled": s.detection.enabled as i64,
            ":detection_model": s.detection.model,
            ":detection_threshold": s.detection.threshold,
            ":detection_interval": s.detection.interval,
            ":pre_roll": s.detection.pre_roll_seconds,
            ":post_roll": s.detection.post_roll_seconds,
            ":detection_api_url": s.detection.api_url,
            ":retention_days": s.retention.days,
            ":detection_retention_days": s.retention.detection_days,
            ":max_storage_mb": s.retention.max_storage_mb,
            ":ptz_enabled": s.ptz.enabled as i64,
            ":ptz_presets": s.ptz.presets,
            ":onvif_host": s.ptz.onvif_host,
            ":onvif_port": s.ptz.onvif_port,
            ":onvif_username": s.ptz.onvif_username,
            ":onvif_password": s.ptz.onvif_password,
        })
        .err_kind(ErrorKind::Internal)?;
    if n == 0 {
        return Err(err!(NotFound, msg("no such stream {name}")));
    }
    Ok(())
}

pub(crate) fn get_stream(conn: &Connection, name: &str) -> Result<Option<Stream>, base::Error> {
    let (columns, present) = stream_select_columns(conn)?;
    let sql = format!("select {columns} from streams where name = ?");
    let mut stmt = conn.prepare_cached(&sql).err_kind(ErrorKind::Internal)?;
    stmt.query_row(params![name], |row| stream_from_row(row, &present))
        .optional()
        .err_kind(ErrorKind::Internal)
}

pub(crate) fn get_stream_by_id(conn: &Connection, id: i64) -> Result<Option<Stream>, base::Error> {
    let (columns, present) = stream_select_columns(conn)?;
    let sql = format!("select {columns} from streams where id = ?");
    let mut stmt = conn.prepare_cached(&sql).err_kind(ErrorKind::Internal)?;
    stmt.query_row(params![id], |row| stream_from_row(row, &present))
        .optional()
        .err_kind(ErrorKind::Internal)
}

/// Lists streams. Permanently-deleted (tombstoned) streams are always
/// excluded; `include_disabled` controls whether merely-disabled ones show.
pub(crate) fn list_streams(
    conn: &Connection,
    include_disabled: bool,
) -> Result<Vec<Stream>, base::Error> {
    let (columns, present) = stream_select_columns(conn)?;
    let sql = format!(
        "select {columns} from streams where deleted_at is null{} order by name",
        if include_disabled { "" } else { " and enabled = 1" }
    );
    let mut stmt = conn.prepare_cached(&sql).err_kind(ErrorKind::Internal)?;
    let rows = stmt
        .query_map(params![], |row| stream_from_row(row, &present))
        .err_kind(ErrorKind::Internal)?;
    rows.collect::<Result<Vec<_>, _>>().err_kind(ErrorKind::Internal)
}

pub(crate) fn soft_delete_stream(conn: &Connection, name: &str) -> Result<(), base::Error> {
    let n = conn
        .prepare_cached("update streams set enabled = 0 where name = ? and deleted_at is null")
        .err_kind(ErrorKind::Internal)?
        .execute(params![name])
        .err_kind(ErrorKind::Internal)?;
    if n == 0 {
        return Err(err!(NotFound, msg("no such stream {name}")));
    }
    Ok(())
}

/// Sets the tombstone column so `sync` never auto-reinserts this name (see
/// DESIGN.md's resolution of the "orphan file after permanent delete" open
/// question). The row is retained rather than deleted so historical
/// recordings still referencing the name by FK-by-name remain queryable.
pub(crate) fn permanent_delete_stream(
    conn: &Connection,
    name: &str,
    now: i64,
) -> Result<(), base::Error> {
    let n = conn
        .prepare_cached("update streams set enabled = 0, deleted_at = ? where name = ?")
        .err_kind(ErrorKind::Internal)?
        .execute(params![now, name])
        .err_kind(ErrorKind::Internal)?;
    if n == 0 {
        return Err(err!(NotFound, msg("no such stream {name}")));
    }
    Ok(())
}

pub(crate) fn is_stream_tombstoned(conn: &Connection, name: &str) -> Result<bool, base::Error> {
    conn.query_row(
        "select deleted_at is not null from streams where name = ?",
        params![name],
        |row| row.get(0),
    )
    .optional()
    .err_kind(ErrorKind::Internal)
    .map(|v: Option<bool>| v.unwrap_or(false))
}

pub(crate) fn count_streams(conn: &Connection) -> Result<i64, base::Error> {
    conn.query_row(
        "select count(*) from streams where deleted_at is null",
        params![],
        |row| row.get(0),
    )
    .err_kind(ErrorKind::Internal)
}

fn motion_config_from_row(row: &Row) -> rusqlite::Result<MotionConfig> {
    Ok(MotionConfig {
        stream_name: row.get("stream_name")?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        sensitivity: row.get("sensitivity")?,
        min_area: row.get("min_area")?,
        cooldown_seconds: row.get("cooldown_seconds")?,
    })
}

pub(crate) fn get_motion_config(
    conn: &Connection,
    stream_name: &str,
) -> Result<Option<MotionConfig>, base::Error> {
    conn.prepare_cached("select stream_name, enabled, sensitivity, min_area, cooldown_seconds from motion_config where stream_name = ?")
        .err_kind(ErrorKind::Internal)?
        .query_row(params![stream_name], motion_config_from_row)
        .optional()
        .err_kind(ErrorKind::Internal)
}

/// Inserts or replaces `stream_name`'s motion-recording policy (§6.2
/// `motion_config`; `stream_name` is the table's primary key).
pub(crate) fn upsert_motion_config(conn: &Connection, c: &MotionConfig) -> Result<(), base::Error> {
    conn.prepare_cached(
        "insert into motion_config (stream_name, enabled, sensitivity, min_area, cooldown_seconds)
         values (:stream_name, :enabled, :sensitivity, :min_area, :cooldown_seconds)
         on conflict(stream_name) do update set
            enabled = :enabled, sensitivity = :sensitivity, min_area = :min_area,
            cooldown_seconds = :cooldown_seconds",
    )
    .err_kind(ErrorKind::Internal)?
    .execute(named_params! {
        ":stream_name": c.stream_name,
        ":enabled": c.enabled as i64,
        ":sensitivity": c.sensitivity,
        ":min_area": c.min_area,
        ":cooldown_seconds": c.cooldown_seconds,
    })
    .err_kind(ErrorKind::Internal)?;
    Ok(())
}

fn recording_from_row(row: &Row) -> rusqlite::Result<Recording> {
    let trigger: String = row.get("trigger_type")?;
    Ok(Recording {
        id: row.get("id")?,
        stream_name: row.get("stream_name")?,
        file_path: row.get("file_path")?,
        start_time: row.get("start_time")?,
        end_time: row.get("end_time")?,
        size_bytes: row.get("size_bytes")?,
        width: row.get("width")?,
        height: row.get("height")?,
        fps: row.get("fps")?,
        codec: row.get("codec")?,
        is_complete: row.get::<_, i64>("is_complete")? != 0,
        trigger_type: TriggerType::parse(&trigger).unwrap_or(TriggerType::Continuous),
    })
}

const RECORDING_COLUMNS: &str =
    "id, stream_name, file_path, start_time, end_time, size_bytes, width, height, fps, codec, \
     is_complete, trigger_type";

pub(crate) fn add_recording(
    conn: &Connection,
    table: RecordingTable,
    r: &NewRecording,
) -> Result<i64, base::Error> {
    let sql = format!(
        "insert into {} (stream_name, file_path, start_time, end_time, size_bytes, width,
            height, fps, codec, is_complete, trigger_type)
         values (:stream_name, :file_path, :start_time, null, 0, :width, :height, :fps, :codec,
            0, :trigger_type)",
        table.name()
    );
    conn.prepare_cached(&sql)
        .err_kind(ErrorKind::Internal)?
        .execute(named_params! {
            ":stream_name": r.stream_name,
            ":file_path": r.file_path,
            ":start_time": r.start_time,
            ":width": r.width,
            ":height": r.height,
            ":fps": r.fps,
            ":codec": r.codec,
            ":trigger_type": r.trigger_type.as_str(),
        })
        .map_err(|e| err!(Internal, msg("inserting recording {}", r.file_path), source(e)))?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn update_recording(
    conn: &Connection,
    table: RecordingTable,
    id: i64,
    u: &RecordingUpdate,
) -> Result<(), base::Error> {
    let sql = format!(
        "update {} set end_time = :end_time, size_bytes = :size_bytes, is_complete = :is_complete
         where id = :id",
        table.name()
    );
    let n = conn
        .prepare_cached(&sql)
        .err_kind(ErrorKind::Internal)?
        .execute(named_params! {
            ":id": id,
            ":end_time": u.end_time,
            ":size_bytes": u.size_bytes,
            ":is_complete": u.is_complete as i64,
        })
        .err_kind(ErrorKind::Internal)?;
    if n == 0 {
        return Err(err!(NotFound, msg("no such recording {id}")));
    }
    Ok(())
}

pub(crate) fn get_recording_by_id(
    conn: &Connection,
    table: RecordingTable,
    id: i64,
) -> Result<Option<Recording>, base::Error> {
    let sql = format!("select {RECORDING_COLUMNS} from {} where id = ?", table.name());
    conn.prepare_cached(&sql)
        .err_kind(ErrorKind::Internal)?
        .query_row(params![id], recording_from_row)
        .optional()
        .err_kind(ErrorKind::Internal)
}

/// Looks a recording up by its (unique) backing file path, used by `sync` to
/// tell an already-cataloged in-progress recording apart from an orphan file
/// discovered on disk.
pub(crate) fn get_recording_by_path(
    conn: &Connection,
    table: RecordingTable,
    file_path: &str,
) -> Result<Option<Recording>, base::Error> {
    let sql = format!("select {RECORDING_COLUMNS} from {} where file_path = ?", table.name());
    conn.prepare_cached(&sql)
        .err_kind(ErrorKind::Internal)?
        .query_row(params![file_path], recording_from_row)
        .optional()
        .err_kind(ErrorKind::Internal)
}

pub(crate) fn get_recordings(
    conn: &Connection,
    table: RecordingTable,
    filter: &RecordingFilter,
    sort: Sort,
    limit: i64,
    offset: i64,
) -> Result<Vec<Recording>, base::Error> {
    let (where_clause, binds) = query::build_recording_filter(filter);
    let sql = format!(
        "select {RECORDING_COLUMNS} from {} {where_clause} order by {} {} limit ? offset ?",
        table.name(),
        sort.field.column(),
        sort.dir.as_sql(),
    );
    let mut stmt = conn.prepare_cached(&sql).err_kind(ErrorKind::Internal)?;
    let mut params: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b as &dyn rusqlite::ToSql).collect();
    params.push(&limit);
    params.push(&offset);
    let rows = stmt
        .query_map(params.as_slice(), recording_from_row)
        .err_kind(ErrorKind::Internal)?;
    rows.collect::<Result<Vec<_>, _>>().err_kind(ErrorKind::Internal)
}

pub(crate) fn count_recordings(
    conn: &Connection,
    table: RecordingTable,
    filter: &RecordingFilter,
) -> Result<i64, base::Error> {
    let (where_clause, binds) = query::build_recording_filter(filter);
    let sql = format!("select count(*) from {} {where_clause}", table.name());
    let params: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|b| b as &dyn rusqlite::ToSql).collect();
    conn.prepare_cached(&sql)
        .err_kind(ErrorKind::Internal)?
        .query_row(params.as_slice(), |row| row.get(0))
        .err_kind(ErrorKind::Internal)
}

pub(crate) fn delete_recording(
    conn: &Connection,
    table: RecordingTable,
    id: i64,
) -> Result<(), base::Error> {
    let sql = format!("delete from {} where id = ?", table.name());
    let n = conn
        .prepare_cached(&sql)
        .err_kind(ErrorKind::Internal)?
        .execute(params![id])
        .err_kind(ErrorKind::Internal)?;
    if n == 0 {
        return Err(err!(NotFound, msg("no such recording {id}")));
    }
    Ok(())
}

/// Deletes every completed recording for `stream_name` older than `cutoff`
/// (an end_time threshold), returning the deleted rows so the caller can
/// unlink their backing files. Rows with `end_time is null` (in-flight
/// recordings) are never matched — see DESIGN.md's open-question resolution.
pub(crate) fn delete_recordings_older_than(
    conn: &Connection,
    table: RecordingTable,
    stream_name: &str,
    cutoff: i64,
) -> Result<Vec<Recording>, base::Error> {
    let select_sql = format!(
        "select {RECORDING_COLUMNS} from {} where stream_name = ? and is_complete = 1 and end_time < ?",
        table.name()
    );
    let deleted: Vec<Recording> = conn
        .prepare_cached(&select_sql)
        .err_kind(ErrorKind::Internal)?
        .query_map(params![stream_name, cutoff], recording_from_row)
        .err_kind(ErrorKind::Internal)?
        .collect::<Result<_, _>>()
        .err_kind(ErrorKind::Internal)?;
    let delete_sql = format!(
        "delete from {} where stream_name = ? and is_complete = 1 and end_time < ?",
        table.name()
    );
    conn.prepare_cached(&delete_sql)
        .err_kind(ErrorKind::Internal)?
        .execute(params![stream_name, cutoff])
        .err_kind(ErrorKind::Internal)?;
    Ok(deleted)
}

/// Deletes the oldest complete recordings for a stream until its total
/// size is at or under `max_bytes`, returning the deleted rows.
pub(crate) fn delete_oldest_until_under_budget(
    conn: &Connection,
    table: RecordingTable,
    stream_name: &str,
    max_bytes: i64,
) -> Result<Vec<Recording>, base::Error> {
    let sql = format!(
        "select {RECORDING_COLUMNS} from {} where stream_name = ? and is_complete = 1
         order by start_time asc",
        table.name()
    );
    let all: Vec<Recording> = conn
        .prepare_cached(&sql)
        .err_kind(ErrorKind::Internal)?
        .query_map(params![stream_name], recording_from_row)
        .err_kind(ErrorKind::Internal)?
        .collect::<Result<_, _>>()
        .err_kind(ErrorKind::Internal)?;
    let mut total: i64 = all.iter().map(|r| r.size_bytes).sum();
    let mut deleted = Vec::new();
    for r in all {
        if total <= max_bytes {
            break;
        }
        delete_recording(conn, table, r.id)?;
        total -= r.size_bytes;
        deleted.push(r);
    }
    Ok(deleted)
}

pub(crate) fn insert_detections(
    conn: &Connection,
    events: &[NewDetectionEvent],
) -> Result<(), base::Error> {
    let mut stmt = conn
        .prepare_cached(
            "insert into detections (stream_name, timestamp, label, confidence, x, y, width, height)
             values (:stream_name, :timestamp, :label, :confidence, :x, :y, :width, :height)",
        )
        .err_kind(ErrorKind::Internal)?;
    for e in events {
        stmt.execute(named_params! {
            ":stream_name": e.stream_name,
            ":timestamp": e.timestamp,
            ":label": e.label,
            ":confidence": e.confidence,
            ":x": e.x,
            ":y": e.y,
            ":width": e.width,
            ":height": e.height,
        })
        .err_kind(ErrorKind::Internal)?;
    }
    Ok(())
}

pub(crate) fn query_detections(
    conn: &Connection,
    stream_name: &str,
    start: i64,
    end: i64,
) -> Result<Vec<DetectionEvent>, base::Error> {
    let mut stmt = conn
        .prepare_cached(
            "select id, stream_name, timestamp, label, confidence, x, y, width, height
             from detections
             where stream_name = ? and timestamp >= ? and timestamp <= ?
             order by timestamp",
        )
        .err_kind(ErrorKind::Internal)?;
    let rows = stmt
        .query_map(params![stream_name, start, end], |row| {
            Ok(DetectionEvent {
                id: row.get(0)?,
                stream_name: row.get(1)?,
                timestamp: row.get(2)?,
                label: row.get(3)?,
                confidence: row.get(4)?,
                x: row.get(5)?,
                y: row.get(6)?,
                width: row.get(7)?,
                height: row.get(8)?,
            })
        })
        .err_kind(ErrorKind::Internal)?;
    rows.collect::<Result<Vec<_>, _>>().err_kind(ErrorKind::Internal)
}

pub(crate) fn insert_event(
    conn: &Connection,
    event_type: &str,
    timestamp: i64,
    stream_name: Option<&str>,
    description: Option<&str>,
    details: Option<&str>,
) -> Result<i64, base::Error> {
    conn.prepare_cached(
        "insert into events (type, timestamp, stream_name, description, details)
         values (?, ?, ?, ?, ?)",
    )
    .err_kind(ErrorKind::Internal)?
    .execute(params![event_type, timestamp, stream_name, description, details])
    .err_kind(ErrorKind::Internal)?;
    Ok(conn.last_insert_rowid())
}
