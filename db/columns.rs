// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Live-schema column presence, cached per table (§4.2 "Query-builder
//! sub-component"). A `select` list built from [`present`] tolerates an
//! on-disk schema that predates a later migration's optional columns,
//! instead of failing the statement prepare outright, while still erroring
//! fast if a column the binary actually depends on is missing.

use std::collections::{HashMap, HashSet};

use base::{bail, err, ErrorKind};
use rusqlite::Connection;

static CACHE: base::Mutex<Option<HashMap<&'static str, HashSet<String>>>> = base::Mutex::new(None);

fn columns_of(conn: &Connection, table: &'static str) -> Result<HashSet<String>, base::Error> {
    let mut cache = CACHE.lock();
    let cache = cache.get_or_insert_with(HashMap::new);
    if let Some(cols) = cache.get(table) {
        return Ok(cols.clone());
    }
    let mut stmt = conn
        .prepare(&format!("pragma table_info({table})"))
        .map_err(|e| err!(Internal, msg("reading schema of table {table}"), source(e)))?;
    let cols: HashSet<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| err!(Internal, msg("reading schema of table {table}"), source(e)))?
        .collect::<rusqlite::Result<_>>()
        .map_err(|e| err!(Internal, msg("reading schema of table {table}"), source(e)))?;
    cache.insert(table, cols.clone());
    Ok(cols)
}

/// Filters `candidates` against `table`'s live schema, one `pragma
/// table_info` lookup per table per process (subsequent calls hit the
/// cache). Aborts with [`ErrorKind::FailedPrecondition`] if any of
/// `required` is absent; otherwise returns whichever of `candidates` are
/// actually present, so the caller's `select` list only names real columns.
pub(crate) fn present(
    conn: &Connection,
    table: &'static str,
    candidates: &[&'static str],
    required: &[&'static str],
) -> Result<HashSet<String>, base::Error> {
    let cols = columns_of(conn, table)?;
    for r in required {
        if !cols.contains(*r) {
            bail!(
                FailedPrecondition,
                msg("table {table} is missing required column \"{r}\"; the on-disk schema needs upgrading")
            );
        }
    }
    Ok(candidates.iter().filter(|c| cols.contains(**c)).map(|c| c.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_filters_out_absent_candidates() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("create table widgets (id integer primary key, name text)").unwrap();
        let present = present(&conn, "widgets", &["id", "name", "color"], &["id"]).unwrap();
        assert!(present.contains("id"));
        assert!(present.contains("name"));
        assert!(!present.contains("color"));
    }

    #[test]
    fn present_aborts_on_missing_required_column() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("create table widgets (id integer primary key)").unwrap();
        let err = present(&conn, "widgets", &["id"], &["id", "name"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    }

    #[test]
    fn lookups_are_cached_across_calls() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("create table gadgets (id integer primary key)").unwrap();
        let first = present(&conn, "gadgets", &["id"], &[]).unwrap();
        conn.execute_batch("alter table gadgets add column extra text").unwrap();
        // second lookup against the same table name reuses the cached column
        // set from before the `alter table`, by design.
        let second = present(&conn, "gadgets", &["id", "extra"], &[]).unwrap();
        assert_eq!(first, second);
    }
}
