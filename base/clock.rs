// This file is part of Camwatch, a network video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Clock interface and implementations, so that state machines driven by
//! wall-clock and monotonic time (the ingest FSM's pre-roll/post-roll
//! timers, the health supervisor's backoff) can be tested without sleeping
//! for real.

use std::mem;
use std::sync::mpsc;
use std::time::Duration as StdDuration;

use jiff::{SignedDuration, Timestamp};
use parking_lot::Mutex;
use tracing::warn;

use crate::error::Error;
use crate::shutdown::ShutdownError;

/// An opaque monotonic timestamp, counted in nanoseconds since some
/// unspecified epoch fixed at process start. Only differences between two
/// `Instant`s are meaningful.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct Instant(i64);

impl Instant {
    pub const fn new(nanos: i64) -> Self {
        Instant(nanos)
    }

    pub fn checked_sub(self, rhs: Instant) -> SignedDuration {
        SignedDuration::from_nanos(self.0.saturating_sub(rhs.0))
    }
}

impl std::ops::Add<SignedDuration> for Instant {
    type Output = Instant;
    fn add(self, rhs: SignedDuration) -> Instant {
        Instant(self.0.saturating_add(rhs.as_nanos() as i64))
    }
}

impl std::ops::Sub<Instant> for Instant {
    type Output = SignedDuration;
    fn sub(self, rhs: Instant) -> SignedDuration {
        self.checked_sub(rhs)
    }
}

/// Abstract interface to the system clocks. This is for testability: a
/// [`SimulatedClocks`] lets tests drive the ingest state machine through
/// hours of pre-roll/post-roll/backoff timing in milliseconds of wall time.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall-clock time.
    fn realtime(&self) -> Timestamp;

    /// Gets the current time from a monotonic clock.
    ///
    /// On Linux, this uses `CLOCK_BOOTTIME`, which includes suspended time.
    /// On other systems, it uses `CLOCK_MONOTONIC`.
    fn monotonic(&self) -> Instant;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: SignedDuration);

    /// Calls `rcv.recv_timeout` or substitutes a test implementation.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError>;
}

/// Repeatedly calls `f`, sleeping a backoff interval and checking for
/// shutdown between attempts, until it succeeds or shutdown is requested.
pub fn retry<C, T, E>(
    clocks: &C,
    shutdown_rx: &crate::shutdown::Receiver,
    f: &mut dyn FnMut() -> Result<T, E>,
) -> Result<T, ShutdownError>
where
    C: Clocks,
    E: Into<Error>,
{
    loop {
        let e = match f() {
            Ok(t) => return Ok(t),
            Err(e) => e.into(),
        };
        shutdown_rx.check()?;
        warn!(exception = %e.chain(), "sleeping for 1 s after error");
        clocks.sleep(SignedDuration::from_secs(1));
    }
}

#[derive(Copy, Clone)]
pub struct RealClocks {}

impl RealClocks {
    fn get(&self, clock: libc::clockid_t) -> (i64, i32) {
        unsafe {
            let mut ts = mem::MaybeUninit::uninit();
            assert_eq!(0, libc::clock_gettime(clock, ts.as_mut_ptr()));
            let ts = ts.assume_init();
            (ts.tv_sec as i64, ts.tv_nsec as i32)
        }
    }
}

impl Clocks for RealClocks {
    fn realtime(&self) -> Timestamp {
        let (secs, nanos) = self.get(libc::CLOCK_REALTIME);
        Timestamp::new(secs, nanos).expect("CLOCK_REALTIME in range")
    }

    #[cfg(target_os = "linux")]
    fn monotonic(&self) -> Instant {
        let (secs, nanos) = self.get(libc::CLOCK_BOOTTIME);
        Instant::new(secs.saturating_mul(1_000_000_000).saturating_add(nanos as i64))
    }

    #[cfg(not(target_os = "linux"))]
    fn monotonic(&self) -> Instant {
        let (secs, nanos) = self.get(libc::CLOCK_MONOTONIC);
        Instant::new(secs.saturating_mul(1_000_000_000).saturating_add(nanos as i64))
    }

    fn sleep(&self, how_long: SignedDuration) {
        match how_long.try_into() {
            Ok(d) => std::thread::sleep(d),
            Err(err) => warn!(%err, duration = ?how_long, "invalid sleep duration"),
        };
    }

    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        rcv.recv_timeout(timeout)
    }
}

/// Logs a warning if the guard lives "too long" (e.g. a catalog transaction
/// or an RTSP read that should be quick), using the label from `label_f`.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: Instant,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.monotonic(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic() - self.start;
        if elapsed.as_secs() >= 1 {
            let label_f = self.label_f.take().unwrap();
            warn!("{} took {:?}!", label_f().as_ref(), elapsed);
        }
    }
}

/// Simulated clock for testing: starts at a fixed wall-clock time and only
/// advances when `sleep` or a timed-out `recv_timeout` is called.
#[derive(Clone)]
pub struct SimulatedClocks(std::sync::Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot: Timestamp,
    uptime: Mutex<SignedDuration>,
}

impl SimulatedClocks {
    pub fn new(boot: Timestamp) -> Self {
        SimulatedClocks(std::sync::Arc::new(SimulatedClocksInner {
            boot,
            uptime: Mutex::new(SignedDuration::ZERO),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> Timestamp {
        self.0.boot.checked_add(*self.0.uptime.lock()).expect("simulated time in range")
    }

    fn monotonic(&self) -> Instant {
        Instant::new(0) + *self.0.uptime.lock()
    }

    /// Advances the clock by the specified amount without actually sleeping.
    fn sleep(&self, how_long: SignedDuration) {
        let mut l = self.0.uptime.lock();
        *l = l.checked_add(how_long).expect("simulated uptime overflow");
    }

    /// Advances the clock by the specified amount if data is not immediately available.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: StdDuration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        let r = rcv.recv_timeout(StdDuration::new(0, 0));
        if r.is_err() {
            self.sleep(SignedDuration::try_from(timeout).unwrap());
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_advances_only_on_sleep() {
        let clocks = SimulatedClocks::new(Timestamp::from_second(1_700_000_000).unwrap());
        let t0 = clocks.monotonic();
        clocks.sleep(SignedDuration::from_secs(5));
        let t1 = clocks.monotonic();
        assert_eq!((t1 - t0).as_secs(), 5);
    }

    #[test]
    fn retry_succeeds_after_shutdown_check() {
        let clocks = SimulatedClocks::new(Timestamp::from_second(0).unwrap());
        let (_tx, rx) = crate::shutdown::channel();
        let mut attempts = 0;
        let result: Result<i32, ShutdownError> = retry(&clocks, &rx, &mut || {
            attempts += 1;
            if attempts < 3 {
                Err(crate::err!(Unavailable, msg("not yet")))
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }
}
