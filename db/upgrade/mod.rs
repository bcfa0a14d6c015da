// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Upgrades the catalog schema.
//!
//! Each entry in `UPGRADERS` brings the database from version `i` to `i+1`,
//! running inside its own transaction. A fresh database is created directly
//! at `EXPECTED_VERSION` by [`crate::init`]; this module only matters for a
//! database opened at an older version.

use base::{bail, err, Error};
use rusqlite::params;
use tracing::info;

mod v0_to_v1;

pub(crate) const EXPECTED_VERSION: i32 = 1;

type Upgrader = fn(&rusqlite::Transaction) -> Result<(), Error>;

const UPGRADERS: &[Upgrader] = &[v0_to_v1::run];

const UPGRADE_NOTES: &str = concat!("upgraded by camwatch-catalog ", env!("CARGO_PKG_VERSION"));

/// Runs every migration needed to bring `conn` from its current version up
/// to [`EXPECTED_VERSION`]. A database with no `version` table is treated as
/// version 0.
pub fn run(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    assert_eq!(UPGRADERS.len() as i32, EXPECTED_VERSION);
    let old_ver = crate::get_schema_version(conn)?.unwrap_or(0);
    if old_ver > EXPECTED_VERSION {
        bail!(
            FailedPrecondition,
            msg("database is at version {old_ver}, later than expected {EXPECTED_VERSION}")
        );
    }
    if old_ver == EXPECTED_VERSION {
        return Ok(());
    }
    info!(from = old_ver, to = EXPECTED_VERSION, "upgrading catalog schema");
    for ver in old_ver..EXPECTED_VERSION {
        info!(from = ver, to = ver + 1, "running migration");
        let tx = conn
            .transaction()
            .map_err(|e| err!(Internal, msg("starting migration transaction"), source(e)))?;
        UPGRADERS[ver as usize](&tx)?;
        tx.execute(
            "insert into version (id, unix_time, notes) values (?, cast(strftime('%s', 'now') as integer), ?)",
            params![ver + 1, UPGRADE_NOTES],
        )
        .map_err(|e| err!(Internal, msg("recording migration to version {}", ver + 1), source(e)))?;
        tx.commit()
            .map_err(|e| err!(Internal, msg("committing migration to version {}", ver + 1), source(e)))?;
    }
    info!("...done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_db_needs_no_upgrade() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        crate::init(&mut conn).unwrap();
        run(&mut conn).unwrap();
        assert_eq!(crate::get_schema_version(&conn).unwrap(), Some(EXPECTED_VERSION));
    }

    #[test]
    fn empty_db_upgrades_to_current() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("pragma foreign_keys = on;").unwrap();
        run(&mut conn).unwrap();
        assert_eq!(crate::get_schema_version(&conn).unwrap(), Some(EXPECTED_VERSION));
        // Every table from the fresh schema should now exist.
        conn.execute("select count(*) from streams", params![])
            .unwrap();
    }
}
