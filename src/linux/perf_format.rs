//! The perf_event_attr structure and its flag words, as passed to
//! perf_event_open(2).

use bitflags::*;

/// Argument block for perf_event_open(2).
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct EventAttr {
    pub attr_type: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_freq: u64,
    pub sample_type: SampleFormatFlags,
    pub read_format: ReadFormatFlags,
    pub settings: EventAttrFlags,

    pub wakeup_events_watermark: u32,
    pub bp_type: u32,

    pub config1_or_bp_addr: u64,
    pub config2_or_bp_len: u64,

    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clock_id: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub reserved: u32,
}

impl Default for EventAttr {
    fn default() -> EventAttr {
        use std::mem;
        unsafe { mem::zeroed::<EventAttr>() }
    }
}

bitflags! {
    pub struct ReadFormatFlags: u64 {
        /// Adds the 64-bit time_enabled field, for estimating totals when the
        /// PMU is overcommitted and multiplexing happens.
        const FORMAT_TOTAL_TIME_ENABLED = 1 << 0;
        /// Adds the 64-bit time_running field.
        const FORMAT_TOTAL_TIME_RUNNING = 1 << 1;
        /// Adds a 64-bit unique value that corresponds to the event group.
        const FORMAT_ID = 1 << 2;
        /// Allows all counter values in an event group to be read with one read.
        const FORMAT_GROUP = 1 << 3;
    }
}

bitflags! {
    pub struct SampleFormatFlags: u64 {
        /// Records instruction pointer.
        const PERF_SAMPLE_IP = 1 << 0;
        /// Records the process and thread IDs.
        const PERF_SAMPLE_TID = 1 << 1;
        /// Records a timestamp.
        const PERF_SAMPLE_TIME = 1 << 2;
        /// Records CPU number.
        const PERF_SAMPLE_CPU = 1 << 7;
        /// Records the current sampling period.
        const PERF_SAMPLE_PERIOD = 1 << 8;
    }
}

bitflags! {
    pub struct EventAttrFlags: u64 {
        /// off by default
        const EVENT_ATTR_DISABLED       =  1 << 0;
        /// children inherit it
        const EVENT_ATTR_INHERIT        =  1 << 1;
        /// must always be on PMU
        const EVENT_ATTR_PINNED         =  1 << 2;
        /// only group on PMU
        const EVENT_ATTR_EXCLUSIVE      =  1 << 3;
        /// don't count user
        const EVENT_ATTR_EXCLUDE_USER   =  1 << 4;
        /// ditto kernel
        const EVENT_ATTR_EXCLUDE_KERNEL =  1 << 5;
        /// ditto hypervisor
        const EVENT_ATTR_EXCLUDE_HV     =  1 << 6;
        /// don't count when idle
        const EVENT_ATTR_EXCLUDE_IDLE   =  1 << 7;
        /// use freq, not period
        const EVENT_ATTR_FREQ           =  1 << 10;
        /// wakeup_watermark
        const EVENT_ATTR_WATERMARK      =  1 << 14;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_is_zero_initialized() {
        let attr: EventAttr = Default::default();
        assert_eq!(attr.attr_type, 0);
        assert_eq!(attr.config, 0);
        assert!(attr.settings.is_empty());
    }
}
