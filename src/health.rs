// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The health/restart supervisor (C7): probes the HTTP surface's
//! `/api/health` on a configurable interval and restarts it after three
//! consecutive failures (§4.7).
//!
//! Grounded on the teacher's plain-OS-thread syncer/streamer loops — not a
//! tokio task — sleep-looping on [`base::shutdown::Receiver`] the same way
//! [`crate::retention`] does.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use base::clock::Clocks;
use base::Error;
use jiff::SignedDuration;
use tracing::{info, warn};
use url::Url;

const CONSECUTIVE_FAILURES_BEFORE_RESTART: u32 = 3;
const PROBE_TIMEOUT: StdDuration = StdDuration::from_secs(5);

/// The tunable half of §4.7: how often to probe, how long to back off
/// after a restart, and how many restarts to attempt before giving up.
/// `Default` matches the spec's own defaults, which are also
/// `ConfigFile`'s defaults (`cmds::run::config`).
#[derive(Clone, Copy, Debug)]
pub struct HealthConfig {
    pub probe_interval: SignedDuration,
    pub restart_cooldown: SignedDuration,
    pub max_restart_attempts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            probe_interval: SignedDuration::from_secs(30),
            restart_cooldown: SignedDuration::from_secs(60),
            max_restart_attempts: 5,
        }
    }
}

/// Everything the supervisor needs to start/stop the HTTP surface, kept
/// abstract so this module doesn't depend on `hyper` directly (§4.7
/// invariant: "the supervisor never touches ingest threads, only the HTTP
/// surface").
pub trait WebServerControl: Send + Sync {
    /// Starts the server if it isn't already running.
    fn start(&self) -> Result<(), Error>;
    /// Stops the server and waits for its thread to exit.
    fn stop(&self) -> Result<(), Error>;
    /// True if the server's thread is still alive (not just that `start`
    /// was called — a panicked thread reports `false`).
    fn is_alive(&self) -> bool;
}

/// Runs the probe loop until `shutdown_rx` fires. Intended to be run on its
/// own OS thread, like the teacher's retention/health loops.
pub fn run<C: Clocks + Clone>(
    clocks: C,
    shutdown_rx: base::shutdown::Receiver,
    runtime: tokio::runtime::Handle,
    health_url: Url,
    web: Arc<dyn WebServerControl>,
    config: HealthConfig,
) {
    let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build().expect("reqwest client builds");
    let mut consecutive_failures = 0u32;
    let mut restart_attempts = 0u32;
    let mut last_restart: Option<base::clock::Instant> = None;

    while shutdown_rx.check().is_ok() {
        clocks.sleep(config.probe_interval);
        if shutdown_rx.check().is_err() {
            break;
        }

        let alive = web.is_alive() && probe_once(&runtime, &client, &health_url);
        if alive {
            consecutive_failures = 0;
            restart_attempts = 0;
            continue;
        }

        consecutive_failures += 1;
        warn!(consecutive_failures, "health probe failed");
        if consecutive_failures < CONSECUTIVE_FAILURES_BEFORE_RESTART {
            continue;
        }

        if restart_attempts >= config.max_restart_attempts {
            warn!("giving up on restarting the HTTP surface after {} attempts", config.max_restart_attempts);
            continue;
        }
        let now = clocks.monotonic();
        if let Some(last) = last_restart {
            if now.checked_sub(last) < config.restart_cooldown {
                continue;
            }
        }

        info!("restarting HTTP surface after {consecutive_failures} consecutive failed probes");
        if let Err(e) = restart(web.as_ref()) {
            warn!(exception = %e.chain(), "restart attempt failed");
        }
        restart_attempts += 1;
        last_restart = Some(now);
        consecutive_failures = 0;
    }
}

fn restart(web: &dyn WebServerControl) -> Result<(), Error> {
    web.stop()?;
    web.start()
}

fn probe_once(runtime: &tokio::runtime::Handle, client: &reqwest::Client, url: &Url) -> bool {
    let url = url.clone();
    let client = client.clone();
    runtime.block_on(async move {
        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            _ => false,
        }
    })
}

/// The JSON body served at `/api/health` (§6.3).
#[derive(Clone, Debug, serde::Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub status: &'static str,
    pub uptime: i64,
    #[serde(rename = "totalRequests")]
    pub total_requests: u64,
    #[serde(rename = "failedRequests")]
    pub failed_requests: u64,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use jiff::Timestamp;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FakeWeb {
        alive: AtomicBool,
        starts: AtomicU32,
        stops: AtomicU32,
    }

    impl WebServerControl for FakeWeb {
        fn start(&self) -> Result<(), Error> {
            self.alive.store(true, Ordering::SeqCst);
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&self) -> Result<(), Error> {
            self.alive.store(false, Ordering::SeqCst);
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn dead_server_triggers_restart_after_threshold() {
        let web = Arc::new(FakeWeb {
            alive: AtomicBool::new(false),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
        });
        // The real `run` loop needs a live tokio runtime + shutdown channel;
        // here we exercise just the restart bookkeeping directly, the way
        // the teacher's streamer tests poke `run_once` instead of `run`.
        let mut consecutive_failures = 0u32;
        for _ in 0..CONSECUTIVE_FAILURES_BEFORE_RESTART {
            if !web.is_alive() {
                consecutive_failures += 1;
            }
        }
        assert_eq!(consecutive_failures, CONSECUTIVE_FAILURES_BEFORE_RESTART);
        restart(web.as_ref()).unwrap();
        assert_eq!(web.starts.load(Ordering::SeqCst), 1);
        assert_eq!(web.stops.load(Ordering::SeqCst), 1);
        assert!(web.is_alive());
    }

    #[test]
    fn simulated_clock_drives_cooldown_math() {
        let restart_cooldown = HealthConfig::default().restart_cooldown;
        let clocks = SimulatedClocks::new(Timestamp::from_second(0).unwrap());
        let t0 = clocks.monotonic();
        clocks.sleep(SignedDuration::from_secs(30));
        let t1 = clocks.monotonic();
        assert!(t1.checked_sub(t0) < restart_cooldown);
        clocks.sleep(SignedDuration::from_secs(31));
        let t2 = clocks.monotonic();
        assert!(t2.checked_sub(t0) >= restart_cooldown);
    }
}
