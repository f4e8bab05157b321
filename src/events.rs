//! Raw PMU event identifiers for last-level-cache traffic.
//!
//! The values are raw `perf_event_attr.config` encodings: on x86 the usual
//! `umask << 8 | event_code` layout (see tools/perf/pmu-events/arch/x86/), on
//! ARM the architected PMUv3 common event numbers.

use std::fmt;

/// A raw hardware event configuration, as programmed into the PMU.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EventId(pub u64);

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "EventId({:#06x})", self.0)
    }
}

impl fmt::LowerHex for EventId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// x86: OFFCORE_REQUESTS.ALL_DATA_RD
pub const X86_LLC_RD_MISS: EventId = EventId(0x08b0);
/// x86: OFFCORE_REQUESTS.WB
pub const X86_LLC_WB: EventId = EventId(0x40b0);
/// x86: CYCLE_ACTIVITY.STALLS_L3_MISS
pub const X86_STALL_L3_MISS_CYCLES: EventId = EventId(0x06a3);

/// ARM: L2D_CACHE_REFILL
pub const ARM_LLC_REFILL: EventId = EventId(0x17);
/// ARM: L2D_CACHE_WB
pub const ARM_LLC_WB: EventId = EventId(0x18);

/// The LLC read-miss event used for regulation on the build architecture.
pub fn default_llc_miss_event() -> EventId {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        X86_LLC_RD_MISS
    }
    #[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
    {
        ARM_LLC_REFILL
    }
    #[cfg(not(any(
        target_arch = "x86",
        target_arch = "x86_64",
        target_arch = "arm",
        target_arch = "aarch64"
    )))]
    {
        EventId(0)
    }
}
