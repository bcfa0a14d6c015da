// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Builds the `where` clause for [`crate::Transaction::get_recordings`] from
//! a [`crate::model::RecordingFilter`].
//!
//! Every filter field maps to a fixed, known-safe column, so (unlike the
//! live-schema check in [`crate::columns`]) there's no need to check the
//! live table schema before using it — the allow-list is the enum itself.
//! That check matters for the *sort* column instead, since that one is
//! chosen from caller input; see [`crate::model::Sort`].

use rusqlite::types::Value;

use crate::model::RecordingFilter;

/// Returns the `where ...` clause text (or `""` if unfiltered) plus its
/// positional bind values, in the order the `?` placeholders appear.
pub(crate) fn build_recording_filter(filter: &RecordingFilter) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();

    if let Some(stream_name) = &filter.stream_name {
        clauses.push("stream_name = ?".to_string());
        binds.push(Value::Text(stream_name.clone()));
    }
    if let Some(start_after) = filter.start_after {
        clauses.push("start_time >= ?".to_string());
        binds.push(Value::Integer(start_after));
    }
    if let Some(end_before) = filter.end_before {
        clauses.push("start_time <= ?".to_string());
        binds.push(Value::Integer(end_before));
    }
    if filter.complete_only {
        clauses.push("is_complete = 1".to_string());
    }

    if clauses.is_empty() {
        (String::new(), binds)
    } else {
        (format!("where {}", clauses.join(" and ")), binds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_has_no_where_clause() {
        let (sql, binds) = build_recording_filter(&RecordingFilter::default());
        assert_eq!(sql, "");
        assert!(binds.is_empty());
    }

    #[test]
    fn filter_combines_with_and() {
        let filter = RecordingFilter {
            stream_name: Some("front_door".to_string()),
            complete_only: true,
            ..Default::default()
        };
        let (sql, binds) = build_recording_filter(&filter);
        assert_eq!(sql, "where stream_name = ? and is_complete = 1");
        assert_eq!(binds.len(), 1);
    }
}
