//! Runtime parameters and the static worker plan.
//!
//! The name/value endpoints mirror the original control files
//! (`regu_interval`, `obs_interval`, `sliding_window_size`,
//! `enable_regulation`, plus the hex counter id): values parse from decimal
//! (hex for the event id), out-of-range writes are rejected without changing
//! state, and reads render the current value. All fields are read-mostly
//! atomics; a write takes effect at the next observation.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::Error;
use crate::events::{self, EventId};
use crate::{CoreId, WorkerId};

/// Length of the predictor's history ring.
pub const HIST_SIZE: usize = 5;

/// Upper bound on regulated worker cores.
pub const MAX_WORKERS: usize = 6;

/// Largest accepted regulation interval. Intervals must divide one second.
pub const MAX_INTERVAL_MS: u32 = 1000;

/// Largest accepted sliding-window size for utilization statistics.
pub const MAX_WINDOW: u32 = 64;

/// A validated configuration write, one per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    RegulationIntervalMs(u32),
    ObservationIntervalMs(u32),
    SlidingWindowSize(u32),
    LlcMissEventId(EventId),
    EnableRegulation(bool),
}

impl Setting {
    /// Parse a `name`/`value` pair from the configuration surface.
    pub fn parse(name: &str, value: &str) -> Result<Setting, Error> {
        let value = value.trim();
        match name {
            "regulation_interval_ms" => {
                let v: u32 = value
                    .parse()
                    .map_err(|_| Error::invalid(format!("regulation_interval_ms: {:?}", value)))?;
                if v == 0 || v > MAX_INTERVAL_MS || 1000 % v != 0 {
                    return Err(Error::invalid(format!(
                        "regulation_interval_ms out of range: {}",
                        v
                    )));
                }
                Ok(Setting::RegulationIntervalMs(v))
            }
            "observation_interval_ms" => {
                let v: u32 = value
                    .parse()
                    .map_err(|_| Error::invalid(format!("observation_interval_ms: {:?}", value)))?;
                if v == 0 {
                    return Err(Error::invalid("observation_interval_ms must be non-zero"));
                }
                Ok(Setting::ObservationIntervalMs(v))
            }
            "sliding_window_size" => {
                let v: u32 = value
                    .parse()
                    .map_err(|_| Error::invalid(format!("sliding_window_size: {:?}", value)))?;
                if v == 0 || v > MAX_WINDOW {
                    return Err(Error::invalid(format!(
                        "sliding_window_size out of range: {}",
                        v
                    )));
                }
                Ok(Setting::SlidingWindowSize(v))
            }
            "llc_miss_event_id" => {
                let digits = value.trim_start_matches("0x").trim_start_matches("0X");
                let v = u64::from_str_radix(digits, 16)
                    .map_err(|_| Error::invalid(format!("llc_miss_event_id: {:?}", value)))?;
                Ok(Setting::LlcMissEventId(EventId(v)))
            }
            "enable_regulation" => match value {
                "0" => Ok(Setting::EnableRegulation(false)),
                "1" => Ok(Setting::EnableRegulation(true)),
                _ => Err(Error::invalid(format!("enable_regulation: {:?}", value))),
            },
            _ => Err(Error::invalid(format!("unknown parameter: {:?}", name))),
        }
    }
}

/// The mutable runtime parameters, shared lock-free between the control
/// surface, the coordinator and the worker timers.
#[derive(Debug)]
pub struct Params {
    regulation_interval_ms: AtomicU32,
    observation_interval_ms: AtomicU32,
    sliding_window_size: AtomicU32,
    llc_miss_event_id: AtomicU64,
}

impl Default for Params {
    fn default() -> Params {
        Params {
            regulation_interval_ms: AtomicU32::new(1),
            observation_interval_ms: AtomicU32::new(1000),
            sliding_window_size: AtomicU32::new(25),
            llc_miss_event_id: AtomicU64::new(events::default_llc_miss_event().0),
        }
    }
}

impl Params {
    pub fn regulation_interval_ms(&self) -> u32 {
        self.regulation_interval_ms.load(Ordering::Relaxed)
    }

    pub fn observation_interval_ms(&self) -> u32 {
        self.observation_interval_ms.load(Ordering::Relaxed)
    }

    pub fn sliding_window_size(&self) -> u32 {
        self.sliding_window_size.load(Ordering::Relaxed)
    }

    pub fn llc_miss_event_id(&self) -> EventId {
        EventId(self.llc_miss_event_id.load(Ordering::Relaxed))
    }

    /// Store a validated setting. `EnableRegulation` is not a stored
    /// parameter (it drives the lifecycle) and is ignored here.
    pub fn store(&self, setting: Setting) {
        match setting {
            Setting::RegulationIntervalMs(v) => {
                self.regulation_interval_ms.store(v, Ordering::Relaxed)
            }
            Setting::ObservationIntervalMs(v) => {
                self.observation_interval_ms.store(v, Ordering::Relaxed)
            }
            Setting::SlidingWindowSize(v) => self.sliding_window_size.store(v, Ordering::Relaxed),
            Setting::LlcMissEventId(ev) => self.llc_miss_event_id.store(ev.0, Ordering::Relaxed),
            Setting::EnableRegulation(_) => {}
        }
    }

    /// Render one endpoint's current value, `None` for unknown names.
    /// `enable_regulation` is rendered by the lifecycle, not here.
    pub fn render(&self, name: &str) -> Option<String> {
        match name {
            "regulation_interval_ms" => Some(self.regulation_interval_ms().to_string()),
            "observation_interval_ms" => Some(self.observation_interval_ms().to_string()),
            "sliding_window_size" => Some(self.sliding_window_size().to_string()),
            "llc_miss_event_id" => Some(format!("{:#x}", self.llc_miss_event_id())),
            _ => None,
        }
    }
}

/// Budget control strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Controller {
    /// Online NLMS demand prediction (the default).
    Lms,
    /// PID regulation of measured bandwidth toward the worker setpoint.
    Pid,
}

impl Default for Controller {
    fn default() -> Controller {
        Controller::Lms
    }
}

/// The static layout of a regulated machine: which cores are workers, where
/// the coordinator runs, and the per-worker bandwidth constants.
///
/// Worker ids are assigned in `worker_cores` order, starting at 1.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Core the coordinator loop is pinned to.
    pub coordinator_core: CoreId,
    /// Cores under regulation, one worker each.
    pub worker_cores: Vec<CoreId>,
    /// How per-worker budgets are derived from measurements.
    pub controller: Controller,
    /// Per-worker initial/minimum bandwidth setpoint in MB/s. Also the floor
    /// substituted when a zero budget would be reloaded.
    pub initial_setpoint_mb: Vec<u64>,
    /// Per-worker bandwidth limit in MB/s (not enforced by the baseline
    /// engine, surfaced for diagnostics).
    pub max_bw_mb: Vec<u64>,
    /// Machine-wide bandwidth pool divided among the workers when cumulative
    /// demand exceeds it.
    pub bw_total_available_mb: u64,
}

impl Default for Plan {
    fn default() -> Plan {
        Plan::new(vec![1, 2, 3, 4])
    }
}

impl Plan {
    /// A plan with default constants: setpoint 1000 MB/s and limit
    /// 30000 MB/s per worker, coordinator on core 0, a 25600 MB/s pool.
    pub fn new(worker_cores: Vec<CoreId>) -> Plan {
        let n = worker_cores.len();
        Plan {
            coordinator_core: 0,
            worker_cores,
            controller: Controller::default(),
            initial_setpoint_mb: vec![1000; n],
            max_bw_mb: vec![30_000; n],
            bw_total_available_mb: 25_600,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_cores.len()
    }

    /// Worker ids in this plan, `1..=N`.
    pub fn worker_ids(&self) -> impl Iterator<Item = WorkerId> {
        1..=self.worker_cores.len() as u8
    }

    /// Core for a given worker id.
    pub fn core_of(&self, worker: WorkerId) -> CoreId {
        self.worker_cores[worker as usize - 1]
    }

    /// Initial setpoint for a given worker id.
    pub fn setpoint_of(&self, worker: WorkerId) -> u64 {
        self.initial_setpoint_mb[worker as usize - 1]
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.worker_cores.is_empty() {
            return Err(Error::invalid("no worker cores"));
        }
        if self.worker_cores.len() > MAX_WORKERS {
            return Err(Error::invalid(format!(
                "more than {} worker cores",
                MAX_WORKERS
            )));
        }
        if self.worker_cores.contains(&self.coordinator_core) {
            return Err(Error::invalid("coordinator core cannot be a worker"));
        }
        let n = self.worker_cores.len();
        if self.initial_setpoint_mb.len() != n || self.max_bw_mb.len() != n {
            return Err(Error::invalid("per-worker constant tables mismatch plan"));
        }
        if self.initial_setpoint_mb.iter().any(|&s| s == 0) {
            return Err(Error::invalid("initial setpoint must be non-zero"));
        }
        if self.bw_total_available_mb == 0 {
            return Err(Error::invalid("bandwidth pool must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_store_interval() {
        let p = Params::default();
        let s = Setting::parse("regulation_interval_ms", "10").unwrap();
        p.store(s);
        assert_eq!(p.regulation_interval_ms(), 10);
    }

    #[test]
    fn interval_must_divide_one_second() {
        assert!(Setting::parse("regulation_interval_ms", "3").is_err());
        assert!(Setting::parse("regulation_interval_ms", "0").is_err());
        assert!(Setting::parse("regulation_interval_ms", "2000").is_err());
        assert!(Setting::parse("regulation_interval_ms", "500").is_ok());
    }

    #[test]
    fn enable_accepts_only_zero_and_one() {
        assert_eq!(
            Setting::parse("enable_regulation", "1").unwrap(),
            Setting::EnableRegulation(true)
        );
        assert!(Setting::parse("enable_regulation", "2").is_err());
        assert!(Setting::parse("enable_regulation", "yes").is_err());
    }

    #[test]
    fn event_id_parses_hex() {
        let s = Setting::parse("llc_miss_event_id", "0x08b0").unwrap();
        assert_eq!(s, Setting::LlcMissEventId(EventId(0x08b0)));
        let s = Setting::parse("llc_miss_event_id", "17").unwrap();
        assert_eq!(s, Setting::LlcMissEventId(EventId(0x17)));
        assert!(Setting::parse("llc_miss_event_id", "zz").is_err());
    }

    #[test]
    fn unknown_name_rejected() {
        assert!(Setting::parse("no_such_knob", "1").is_err());
        let p = Params::default();
        assert!(p.render("no_such_knob").is_none());
    }

    #[test]
    fn rejected_write_leaves_state_unchanged() {
        let p = Params::default();
        assert!(Setting::parse("sliding_window_size", "0").is_err());
        assert_eq!(p.sliding_window_size(), 25);
    }

    #[test]
    fn plan_validation() {
        assert!(Plan::default().validate().is_ok());
        assert!(Plan::new(vec![]).validate().is_err());
        let mut p = Plan::default();
        p.coordinator_core = 1;
        assert!(p.validate().is_err());
        let mut p = Plan::default();
        p.initial_setpoint_mb[2] = 0;
        assert!(p.validate().is_err());
    }
}
