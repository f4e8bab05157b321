//! The Linux perf_event counter backend
//! (http://man7.org/linux/man-pages/man2/perf_event_open.2.html)
//!
//! Each worker's budget counter is a raw hardware event opened pinned to the
//! worker's CPU with `sample_period` equal to the event budget. A one-page
//! sample ring is mapped over the fd so every period exhaustion writes a
//! sample and wakes `poll(2)`; a per-counter watcher thread pinned to the
//! worker core consumes the wakeup and runs the deferred overflow work.

use std::io::{self, Error};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use libc::MAP_SHARED;
use log::{debug, info, warn};

use crate::error::CounterError;
use crate::events::EventId;
use crate::rt;
use crate::{BudgetCounter, CoreId, CounterProvider, OverflowHandler, WorkerId};

pub mod perf_format;

use self::perf_format::{EventAttr, EventAttrFlags, ReadFormatFlags, SampleFormatFlags};

const PERF_TYPE_RAW: u32 = 4;

const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;
const PERF_EVENT_IOC_PERIOD: u64 = 0x4008_2404;

/// Pages in the sample ring, excluding the header page. Must be a power of
/// two; one page is plenty for budget-exhaustion samples.
const RING_PAGES: usize = 1;

fn perf_event_open(
    hw_event: &EventAttr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_int,
) -> isize {
    unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            hw_event as *const EventAttr as usize,
            pid,
            cpu,
            group_fd,
            flags,
        ) as isize
    }
}

fn ioctl(fd: libc::c_int, request: u64, value: libc::c_int) -> isize {
    unsafe { libc::ioctl(fd, request, value) as isize }
}

fn ioctl_u64(fd: libc::c_int, request: u64, value: &u64) -> isize {
    unsafe { libc::ioctl(fd, request, value as *const u64) as isize }
}

/// Configures one raw budget counter. Follows the attribute set of the
/// original in-kernel controller: raw event, pinned, initially disabled, no
/// kernel-mode counting, one wakeup per sample.
pub struct CounterBuilder {
    pid: libc::pid_t,
    cpu: isize,
    attrs: EventAttr,
}

impl Default for CounterBuilder {
    fn default() -> CounterBuilder {
        CounterBuilder {
            // All pids on the target CPU.
            pid: -1,
            cpu: -1,
            attrs: Default::default(),
        }
    }
}

impl CounterBuilder {
    /// A raw hardware event, encoded as in the vendor event tables.
    pub fn from_raw_event(event: EventId) -> CounterBuilder {
        let mut builder: CounterBuilder = Default::default();
        builder.attrs.attr_type = PERF_TYPE_RAW;
        builder.attrs.config = event.0;
        builder
    }

    /// Count on `cpu` only.
    pub fn on_cpu<'a>(&'a mut self, cpu: CoreId) -> &'a mut CounterBuilder {
        self.cpu = cpu as isize;
        self
    }

    /// Overflow after every `period` events.
    pub fn set_sample_period<'a>(&'a mut self, period: u64) -> &'a mut CounterBuilder {
        self.attrs.sample_period_freq = period;
        self
    }

    /// The counter starts out disabled.
    pub fn disable<'a>(&'a mut self) -> &'a mut CounterBuilder {
        self.attrs.settings.insert(EventAttrFlags::EVENT_ATTR_DISABLED);
        self
    }

    /// The counter should always be on the PMU.
    pub fn pinned<'a>(&'a mut self) -> &'a mut CounterBuilder {
        self.attrs.settings.insert(EventAttrFlags::EVENT_ATTR_PINNED);
        self
    }

    /// The counter excludes events that happen in the kernel.
    pub fn exclude_kernel<'a>(&'a mut self) -> &'a mut CounterBuilder {
        self.attrs
            .settings
            .insert(EventAttrFlags::EVENT_ATTR_EXCLUDE_KERNEL);
        self
    }

    /// The counter excludes events that happen in the hypervisor.
    pub fn exclude_hv<'a>(&'a mut self) -> &'a mut CounterBuilder {
        self.attrs.settings.insert(EventAttrFlags::EVENT_ATTR_EXCLUDE_HV);
        self
    }

    /// Wake poll(2) after every sample.
    pub fn wakeup_each_sample<'a>(&'a mut self) -> &'a mut CounterBuilder {
        self.attrs.wakeup_events_watermark = 1;
        self.attrs
            .sample_type
            .insert(SampleFormatFlags::PERF_SAMPLE_PERIOD);
        self
    }

    /// Adds the time_enabled and time_running fields to reads, so totals can
    /// be estimated when the PMU is overcommitted and multiplexing happens.
    pub fn enable_read_format_times<'a>(&'a mut self) -> &'a mut CounterBuilder {
        self.attrs
            .read_format
            .insert(ReadFormatFlags::FORMAT_TOTAL_TIME_ENABLED);
        self.attrs
            .read_format
            .insert(ReadFormatFlags::FORMAT_TOTAL_TIME_RUNNING);
        self
    }

    /// Open the counter fd.
    pub fn finish(&self) -> Result<libc::c_int, CounterError> {
        let mut attrs = self.attrs;
        attrs.size = std::mem::size_of::<EventAttr>() as u32;
        let fd = perf_event_open(&attrs, self.pid, self.cpu as i32, -1, 0) as libc::c_int;
        if fd < 0 {
            let err = Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EOPNOTSUPP) => CounterError::Unsupported,
                Some(libc::ENOENT) => CounterError::NoSuchEvent,
                _ => CounterError::Io(err),
            });
        }
        Ok(fd)
    }
}

/// Header page of the perf mmap ring. Layout fixed by the kernel ABI; only
/// the ring cursors are touched, the rest is padding here.
#[repr(C)]
#[allow(dead_code)]
struct MmapPage {
    version: u32,
    compat_version: u32,
    lock: u32,
    index: u32,
    offset: i64,
    time_enabled: u64,
    time_running: u64,
    capabilities: u64,
    pmc_width: u16,
    time_shift: u16,
    time_mult: u32,
    time_offset: u64,
    reserved: [u64; 120],
    data_head: u64,
    data_tail: u64,
}

/// Layout of a read(2) on the counter fd with the time fields enabled.
#[repr(C)]
#[derive(Default, Debug)]
pub struct FileReadFormat {
    /// The value of the event
    pub value: u64,
    /// if PERF_FORMAT_TOTAL_TIME_ENABLED
    pub time_enabled: u64,
    /// if PERF_FORMAT_TOTAL_TIME_RUNNING
    pub time_running: u64,
}

/// A budget counter backed by a perf fd, with a watcher thread turning ring
/// wakeups into overflow work.
pub struct PerfEventCounter {
    fd: libc::c_int,
    stop_fd: libc::c_int,
    watcher: Option<JoinHandle<()>>,
    worker: WorkerId,
}

impl PerfEventCounter {
    fn check(ret: isize) -> Result<(), CounterError> {
        if ret == -1 {
            return Err(CounterError::Io(Error::last_os_error()));
        }
        Ok(())
    }

    /// Read the fd and parse the return format.
    pub fn read_fd(&self) -> Result<FileReadFormat, CounterError> {
        let mut value: FileReadFormat = Default::default();
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut value as *mut FileReadFormat as *mut libc::c_void,
                std::mem::size_of::<FileReadFormat>(),
            )
        };
        if ret != std::mem::size_of::<FileReadFormat>() as isize {
            return Err(CounterError::Io(Error::last_os_error()));
        }
        Ok(value)
    }
}

impl BudgetCounter for PerfEventCounter {
    fn enable(&self) -> Result<(), CounterError> {
        Self::check(ioctl(self.fd, PERF_EVENT_IOC_ENABLE, 0))
    }

    fn disable(&self) -> Result<(), CounterError> {
        Self::check(ioctl(self.fd, PERF_EVENT_IOC_DISABLE, 0))
    }

    fn stop(&self) -> Result<(), CounterError> {
        Self::check(ioctl(self.fd, PERF_EVENT_IOC_DISABLE, 0))
    }

    fn start(&self) -> Result<(), CounterError> {
        Self::check(ioctl(self.fd, PERF_EVENT_IOC_ENABLE, 0))
    }

    fn set_period_left(&self, events: u64) -> Result<(), CounterError> {
        // IOC_PERIOD installs a new sample period; issued while the counter
        // is stopped it takes effect on restart, which is the closest the
        // perf ABI gets to reloading the remaining period directly.
        let period = events.max(1);
        Self::check(ioctl_u64(self.fd, PERF_EVENT_IOC_PERIOD, &period))
    }

    fn read_total(&self) -> Result<u64, CounterError> {
        let read = self.read_fd()?;
        // A pinned raw counter normally runs whenever it is enabled; if the
        // PMU was overcommitted and the event multiplexed, scale the count up
        // to an estimated total.
        if read.time_running > 0 && read.time_running < read.time_enabled {
            let scaled = (read.value as u128 * read.time_enabled as u128
                / read.time_running as u128) as u64;
            return Ok(scaled);
        }
        Ok(read.value)
    }
}

impl Drop for PerfEventCounter {
    fn drop(&mut self) {
        // Unblock and join the watcher before the fds go away.
        let one: u64 = 1;
        unsafe {
            libc::write(
                self.stop_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
        if let Some(w) = self.watcher.take() {
            let _ = w.join();
        }
        unsafe {
            libc::close(self.stop_fd);
            libc::close(self.fd);
        }
        debug!("counter for worker {} released", self.worker);
    }
}

/// Watcher thread: map the sample ring, then turn every poll wakeup into a
/// call of the overflow handler, until the stop eventfd fires.
fn watcher_main(
    fd: libc::c_int,
    stop_fd: libc::c_int,
    worker: WorkerId,
    core: CoreId,
    overflow: OverflowHandler,
    ready: mpsc::Sender<io::Result<()>>,
) {
    if let Err(e) = rt::pin_to_core(core) {
        warn!("watcher/{}: could not pin to core {}: {}", worker, core, e);
    }

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let map = mmap::MemoryMap::new(
        (1 + RING_PAGES) * page_size,
        &[
            mmap::MapOption::MapFd(fd),
            mmap::MapOption::MapOffset(0),
            mmap::MapOption::MapNonStandardFlags(MAP_SHARED),
            mmap::MapOption::MapReadable,
            mmap::MapOption::MapWritable,
        ],
    );
    let map = match map {
        Ok(m) => {
            let _ = ready.send(Ok(()));
            m
        }
        Err(e) => {
            let _ = ready.send(Err(io::Error::new(
                io::ErrorKind::Other,
                format!("mmap of sample ring failed: {:?}", e),
            )));
            return;
        }
    };
    let header = map.data() as *mut MmapPage;

    loop {
        let mut fds = [
            libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: stop_fd,
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
        if ret < 0 {
            let err = Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            warn!("watcher/{}: poll failed: {}", worker, err);
            break;
        }
        if fds[1].revents != 0 {
            break;
        }
        if fds[0].revents & libc::POLLIN != 0 {
            // Discard the sample payload; only the budget-exhaustion edge
            // matters. Consuming the ring rearms the wakeup.
            unsafe {
                let head = std::ptr::read_volatile(&(*header).data_head);
                std::ptr::write_volatile(&mut (*header).data_tail, head);
            }
            overflow(worker);
        }
        if fds[0].revents & (libc::POLLERR | libc::POLLHUP) != 0 {
            break;
        }
    }
    debug!("watcher/{}: exit", worker);
}

/// [`CounterProvider`] backed by perf_event_open(2).
pub struct PerfCounterProvider;

impl CounterProvider for PerfCounterProvider {
    fn create(
        &self,
        worker: WorkerId,
        core: CoreId,
        sample_period: u64,
        event: EventId,
        overflow: OverflowHandler,
    ) -> Result<std::sync::Arc<dyn BudgetCounter>, CounterError> {
        let fd = CounterBuilder::from_raw_event(event)
            .on_cpu(core)
            .set_sample_period(sample_period.max(1))
            .pinned()
            .disable()
            .exclude_kernel()
            .wakeup_each_sample()
            .enable_read_format_times()
            .finish()?;

        let stop_fd = unsafe { libc::eventfd(0, 0) };
        if stop_fd < 0 {
            let err = Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(CounterError::Io(err));
        }

        let (ready_tx, ready_rx) = mpsc::channel();
        let watcher = thread::Builder::new()
            .name(format!("watcher/{}", worker))
            .spawn(move || watcher_main(fd, stop_fd, worker, core, overflow, ready_tx))
            .map_err(|e| {
                unsafe {
                    libc::close(stop_fd);
                    libc::close(fd);
                }
                CounterError::Io(e)
            })?;

        // The ring must exist before the counter is ever enabled, or early
        // overflows would be lost.
        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = watcher.join();
                unsafe {
                    libc::close(stop_fd);
                    libc::close(fd);
                }
                return Err(CounterError::Io(e));
            }
            Err(_) => {
                let _ = watcher.join();
                unsafe {
                    libc::close(stop_fd);
                    libc::close(fd);
                }
                return Err(CounterError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "watcher thread died during setup",
                )));
            }
        }

        info!(
            "worker {}: configured counter {:?} on core {} (period {})",
            worker, event, core, sample_period
        );
        Ok(std::sync::Arc::new(PerfEventCounter {
            fd,
            stop_fd,
            watcher: Some(watcher),
            worker,
        }))
    }
}
