// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

use base::{err, Error};

/// Creates the version-1 schema in a database that has none yet.
pub(super) fn run(tx: &rusqlite::Transaction) -> Result<(), Error> {
    tx.execute_batch(include_str!("../schema.sql"))
        .map_err(|e| err!(Internal, msg("creating version 1 schema"), source(e)))?;
    Ok(())
}
