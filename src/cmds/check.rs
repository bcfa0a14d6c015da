// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! `check` (§1.4): runs the catalog's own integrity check, then
//! cross-references recording rows against files on disk — the half of the
//! check that only this command can do, since the catalog itself never
//! touches the filesystem (see `catalog::Catalog::integrity_check`'s doc
//! comment).

use std::path::PathBuf;

use base::Error;
use bpaf::Bpaf;
use catalog::model::RecordingFilter;
use tracing::{info, warn};

#[derive(Bpaf, Debug)]
#[bpaf(command("check"))]
/// Checks the catalog and its recording files for inconsistencies.
pub struct Args {
    /// Root directory for the database, recordings, and detection models.
    #[bpaf(long, argument("PATH"))]
    storage_root: PathBuf,

    /// Delete recording rows whose backing file is missing, and catalog
    /// unrecognized files found in the recordings tree as orphan streams.
    #[bpaf(long)]
    fix: bool,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let catalog = super::open_catalog(&args.storage_root)?;
    let mut problems = catalog.integrity_check()?;

    let tx = catalog.tx()?;
    let streams = tx.list_streams(true)?;
    let mut missing_file_ids = Vec::new();
    for stream in &streams {
        let recordings = tx.get_recordings(
            &RecordingFilter {
                stream_name: Some(stream.name.clone()),
                ..Default::default()
            },
            catalog::model::Sort::default(),
            i64::MAX,
            0,
        )?;
        for r in recordings {
            if !PathBuf::from(&r.file_path).is_file() {
                problems.push(format!("recording {} ({}): missing file {}", r.id, stream.name, r.file_path));
                missing_file_ids.push(r.id);
            }
        }
    }
    drop(tx);

    for problem in &problems {
        warn!("{problem}");
    }

    if args.fix && !missing_file_ids.is_empty() {
        let tx = catalog.tx()?;
        for id in &missing_file_ids {
            tx.delete_recording(*id)?;
        }
        tx.commit()?;
        info!(count = missing_file_ids.len(), "deleted recording rows with missing files");
    }

    if problems.is_empty() {
        info!("no problems found");
        Ok(0)
    } else {
        info!(count = problems.len(), fixed = args.fix, "problems found");
        Ok(if args.fix { 0 } else { 1 })
    }
}
