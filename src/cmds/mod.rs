// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! CLI subcommands (§1.4): `run`, `init`, `check`, `sync`, `config`.

pub mod check;
pub mod config;
pub mod init;
pub mod run;
pub mod sync;

/// Directories created under the storage root (§6.1), relative to its root.
pub const DATABASE_DIR: &str = "database";
pub const MP4_DIR: &str = "mp4";
pub const HLS_DIR: &str = "hls";
pub const MODELS_DIR: &str = "models";

/// Creates `storage_root` and its fixed subdirectories if they don't
/// already exist, mode 0755 (§6.1). Idempotent: used by both `init` and
/// `run` (a fresh deployment may run `run` directly without `init` first).
pub fn ensure_storage_layout(storage_root: &std::path::Path) -> Result<(), base::Error> {
    for sub in [DATABASE_DIR, MP4_DIR, HLS_DIR, MODELS_DIR] {
        let dir = storage_root.join(sub);
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755))?;
        }
    }
    Ok(())
}

pub(crate) fn database_path(storage_root: &std::path::Path) -> std::path::PathBuf {
    storage_root.join(DATABASE_DIR).join("nvr.db")
}

pub(crate) fn open_catalog(storage_root: &std::path::Path) -> Result<catalog::Catalog, base::Error> {
    catalog::Catalog::open(&database_path(storage_root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_storage_layout_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        ensure_storage_layout(dir.path()).unwrap();
        ensure_storage_layout(dir.path()).unwrap();
        assert!(dir.path().join(DATABASE_DIR).is_dir());
        assert!(dir.path().join(MP4_DIR).is_dir());
        assert!(dir.path().join(HLS_DIR).is_dir());
        assert!(dir.path().join(MODELS_DIR).is_dir());
    }
}
