// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! `config` (§1.4): non-interactive stream CRUD against the catalog,
//! standing in for the teacher's interactive `cursive` TUI — this spec's
//! stream config is catalog-resident, not file-resident, so there's no
//! config file to walk a human through editing (see DESIGN.md).

use std::path::PathBuf;

use base::Error;
use bpaf::Bpaf;
use catalog::model::NewStream;
use tracing::info;

#[derive(Bpaf, Debug)]
#[bpaf(command("config"))]
/// Adds, lists, enables, disables, or deletes a stream's catalog row.
pub struct Args {
    /// Root directory for the database, recordings, and detection models.
    #[bpaf(long, argument("PATH"))]
    storage_root: PathBuf,

    #[bpaf(external(action))]
    action: Action,
}

#[derive(Bpaf, Debug)]
enum Action {
    /// Registers a new stream, or reactivates one that was soft-deleted.
    #[bpaf(command)]
    Add {
        #[bpaf(positional("NAME"))]
        name: String,
        #[bpaf(long, argument("URL"))]
        url: String,
        #[bpaf(long)]
        record_audio: bool,
    },
    /// Lists every non-tombstoned stream.
    #[bpaf(command)]
    List,
    /// Flips `enabled` to true.
    #[bpaf(command)]
    Enable {
        #[bpaf(positional("NAME"))]
        name: String,
    },
    /// Flips `enabled` to false (soft delete).
    #[bpaf(command)]
    Disable {
        #[bpaf(positional("NAME"))]
        name: String,
    },
    /// Permanently deletes a stream, tombstoning its name against future
    /// `sync` auto-reinsertion.
    #[bpaf(command)]
    Delete {
        #[bpaf(positional("NAME"))]
        name: String,
    },
    /// Sets a stream's motion-triggered-recording policy (§6.2 `motion_config`).
    #[bpaf(command)]
    Motion {
        #[bpaf(positional("NAME"))]
        name: String,
        #[bpaf(long)]
        enabled: bool,
        #[bpaf(long, argument("FRACTION"), fallback(0.5))]
        sensitivity: f64,
        #[bpaf(long, argument("FRACTION"), fallback(0.01))]
        min_area: f64,
        #[bpaf(long, argument("SECONDS"), fallback(30))]
        cooldown_seconds: i64,
    },
}

pub fn run(args: Args) -> Result<i32, Error> {
    let catalog = super::open_catalog(&args.storage_root)?;
    let tx = catalog.tx()?;

    match &args.action {
        Action::Add { name, url, record_audio } => {
            tx.add_or_reactivate_stream(name, url, *record_audio)?;
            info!(stream = %name, "added or reactivated stream");
        }
        Action::List => {
            for s in tx.list_streams(true)? {
                println!(
                    "{:<20} enabled={:<5} record={:<5} url={}",
                    s.name, s.enabled, s.record, s.url
                );
            }
        }
        Action::Enable { name } => {
            let mut s = tx.get_stream(name)?.ok_or_else(|| base::err!(NotFound, msg("no such stream {name:?}")))?;
            s.enabled = true;
            tx.update_stream(name, &to_new_stream(s))?;
            info!(stream = %name, "enabled stream");
        }
        Action::Disable { name } => {
            tx.soft_delete_stream(name)?;
            info!(stream = %name, "disabled stream");
        }
        Action::Delete { name } => {
            tx.permanent_delete_stream(name)?;
            info!(stream = %name, "permanently deleted stream");
        }
        Action::Motion { name, enabled, sensitivity, min_area, cooldown_seconds } => {
            tx.get_stream(name)?.ok_or_else(|| base::err!(NotFound, msg("no such stream {name:?}")))?;
            tx.upsert_motion_config(&catalog::model::MotionConfig {
                stream_name: name.clone(),
                enabled: *enabled,
                sensitivity: *sensitivity,
                min_area: *min_area,
                cooldown_seconds: *cooldown_seconds,
            })?;
            info!(stream = %name, enabled = *enabled, "updated motion-recording policy");
        }
    }

    tx.commit()?;
    Ok(0)
}

fn to_new_stream(s: catalog::model::Stream) -> NewStream {
    NewStream {
        name: s.name,
        url: s.url,
        enabled: s.enabled,
        streaming_enabled: s.streaming_enabled,
        width: s.width,
        height: s.height,
        fps: s.fps,
        codec: s.codec,
        priority: s.priority,
        record: s.record,
        segment_duration: s.segment_duration,
        protocol: s.protocol,
        is_onvif: s.is_onvif,
        record_audio: s.record_audio,
        backchannel_enabled: s.backchannel_enabled,
        detection: s.detection,
        retention: s.retention,
        ptz: s.ptz,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::testutil::TestCatalog;

    #[test]
    fn add_then_disable_then_delete() {
        let tc = TestCatalog::new();
        {
            let tx = tc.catalog.tx().unwrap();
            tx.add_stream(&NewStream {
                name: "front".to_owned(),
                url: "rtsp://127.0.0.1/front".to_owned(),
                ..Default::default()
            })
            .unwrap();
            tx.commit().unwrap();
        }
        {
            let tx = tc.catalog.tx().unwrap();
            tx.soft_delete_stream("front").unwrap();
            tx.commit().unwrap();
        }
        assert!(!tc.catalog.tx().unwrap().get_stream("front").unwrap().unwrap().enabled);

        {
            let tx = tc.catalog.tx().unwrap();
            tx.permanent_delete_stream("front").unwrap();
            tx.commit().unwrap();
        }
        assert!(tc.catalog.tx().unwrap().is_stream_tombstoned("front").unwrap());
    }
}
