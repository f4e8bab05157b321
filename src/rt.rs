//! Thin wrappers around the scheduling and timing syscalls the regulation
//! threads rely on: CPU affinity, SCHED_FIFO priority and absolute monotonic
//! sleeps.
//!
//! On non-Linux hosts these degrade to no-ops or portable approximations so
//! the engine (and its tests) still run; only the Linux build provides real
//! pinning and real-time priority.

use std::io;
use std::time::{Duration, Instant};

use crate::CoreId;

/// FIFO priority used for throttler tasks.
pub const THROTTLER_PRIORITY: i32 = 1;

#[cfg(target_os = "linux")]
pub fn pin_to_core(core: CoreId) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_to_core(_core: CoreId) -> io::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
pub fn set_fifo_priority(priority: i32) -> io::Result<()> {
    unsafe {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_fifo_priority(_priority: i32) -> io::Result<()> {
    Ok(())
}

/// Core the calling thread currently executes on, if the platform can tell.
#[cfg(target_os = "linux")]
pub fn current_core() -> Option<CoreId> {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu >= 0 {
        Some(cpu as CoreId)
    } else {
        None
    }
}

#[cfg(not(target_os = "linux"))]
pub fn current_core() -> Option<CoreId> {
    None
}

/// Sleep until the absolute monotonic `deadline`. Returns immediately when
/// the deadline already passed.
#[cfg(target_os = "linux")]
pub fn sleep_until(deadline: Instant) {
    // clock_nanosleep against CLOCK_MONOTONIC would be the direct call, but
    // Instant carries no portable conversion to a timespec; sleeping the
    // remaining delta against the same monotonic clock is equivalent here.
    let now = Instant::now();
    if let Some(remaining) = deadline.checked_duration_since(now) {
        nanosleep_duration(remaining);
    }
}

#[cfg(target_os = "linux")]
fn nanosleep_duration(d: Duration) {
    let mut ts = libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: libc::c_long::from(d.subsec_nanos() as i32),
    };
    unsafe {
        // Re-issue on EINTR with the remaining time.
        let mut rem: libc::timespec = std::mem::zeroed();
        while libc::nanosleep(&ts, &mut rem) != 0
            && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR)
        {
            ts = rem;
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if let Some(remaining) = deadline.checked_duration_since(now) {
        std::thread::sleep(remaining);
    }
}
