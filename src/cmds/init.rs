// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! `init` (§1.4): creates the storage root and an empty catalog. Idempotent
//! — running it twice against the same root just confirms the existing
//! catalog's schema version.

use std::path::PathBuf;

use base::Error;
use bpaf::Bpaf;
use tracing::info;

#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
/// Creates the storage root directory tree and an empty catalog.
pub struct Args {
    /// Root directory for the database, recordings, and detection models.
    #[bpaf(long, argument("PATH"))]
    storage_root: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    super::ensure_storage_layout(&args.storage_root)?;
    info!(storage_root = %args.storage_root.display(), "storage layout ready");

    let catalog = super::open_catalog(&args.storage_root)?;
    let stream_count = catalog.tx()?.count_streams()?;
    info!(stream_count, "catalog initialized");
    Ok(0)
}
