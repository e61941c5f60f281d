//! Session clock pairs.
//!
//! The engine never stamps record timestamps; it only reports a wall/boot
//! clock pair at session start and at each flush so consumers can correlate
//! the timestamps embedded in records. Boot time keeps counting across
//! suspend, which is what makes it the right axis for system traces.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A wall/boot clock pair captured at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSnapshot {
    pub wall_clock_ns: u64,
    pub boot_clock_ns: u64,
}

/// Captures the current wall/boot pair.
pub fn clock_snapshot() -> ClockSnapshot {
    ClockSnapshot {
        wall_clock_ns: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64),
        boot_clock_ns: boot_clock_ns(),
    }
}

#[cfg(target_os = "linux")]
fn boot_clock_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime writes the timespec we hand it; CLOCK_BOOTTIME
    // exists on every kernel we support.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_BOOTTIME, &mut ts) };
    if rc != 0 {
        return 0;
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(all(unix, not(target_os = "linux")))]
fn boot_clock_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // No CLOCK_BOOTTIME outside linux; monotonic is the closest axis.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(not(unix))]
fn boot_clock_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static BASE: OnceLock<Instant> = OnceLock::new();
    BASE.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
