//! Hardware counters driving deterministic scheduling: retired conditional
//! branches ("ticks") plus instructions, page faults and hardware interrupts
//! for the per-frame execution fingerprint. The ticks counter is also armed
//! to deliver TIME_SLICE_SIGNAL on quantum overflow.

use crate::error::{Result, RetraceError};
use crate::log::LogWarn;
use crate::perf_event::*;
use crate::scoped_fd::ScopedFd;
use crate::ticks::Ticks;
use libc::pid_t;
use nix::errno::Errno;
use raw_cpuid::CpuId;

/// Signal the ticks counter fires at the tracee when its quantum expires.
/// SIGSTKFLT is effectively unused by applications.
pub const TIME_SLICE_SIGNAL: i32 = libc::SIGSTKFLT;

/// BR_INST_RETIRED.CONDITIONAL on modern Intel cores.
const INTEL_RCB_EVENT: u64 = 0x51_01c4;
/// HW_INTERRUPTS.RECEIVED.
const INTEL_HW_INTR_EVENT: u64 = 0x53_01cb;

struct PmuAttributes {
    ticks_type: u32,
    ticks_config: u64,
    hw_interrupts_config: Option<u64>,
}

lazy_static! {
    static ref PMU_ATTRIBUTES: PmuAttributes = get_init_attributes();
}

fn get_init_attributes() -> PmuAttributes {
    let cpuid = CpuId::new();
    let is_intel = cpuid
        .get_vendor_info()
        .map(|v| v.as_string() == "GenuineIntel")
        .unwrap_or(false);
    if is_intel {
        PmuAttributes {
            ticks_type: PERF_TYPE_RAW,
            ticks_config: INTEL_RCB_EVENT,
            hw_interrupts_config: Some(INTEL_HW_INTR_EVENT),
        }
    } else {
        // Generic branch counting includes unconditional branches, so tick
        // counts are not comparable with traces recorded on Intel. They are
        // still self-consistent, which is what replay needs.
        log!(
            LogWarn,
            "Unknown CPU vendor; falling back to generic branch counter"
        );
        PmuAttributes {
            ticks_type: PERF_TYPE_HARDWARE,
            ticks_config: PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
            hw_interrupts_config: None,
        }
    }
}

/// Cumulative counter values for one task, from task start.
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct CounterSnapshot {
    pub ticks: Ticks,
    pub instructions: u64,
    pub page_faults: u64,
    pub hw_interrupts: u64,
}

fn new_perf_event_attr(type_id: u32, config: u64) -> perf_event_attr {
    let mut attr = perf_event_attr::default();
    attr.type_ = type_id;
    attr.config = config;
    // Count userspace tracee code only.
    attr.flags = ATTR_EXCLUDE_KERNEL | ATTR_EXCLUDE_HV;
    attr
}

fn start_counter(tid: pid_t, group_fd: i32, attr: &mut perf_event_attr) -> Result<ScopedFd> {
    if group_fd == -1 {
        attr.flags |= ATTR_PINNED;
    }
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *mut perf_event_attr,
            tid,
            -1,
            group_fd,
            0,
        ) as i32
    };
    if fd < 0 {
        let errno = Errno::last();
        if errno == Errno::EACCES {
            fatal!(
                "Permission denied to use 'perf_event_open'; are perf events \
                 enabled? Try 'perf record'."
            );
        }
        if errno == Errno::ENOENT {
            fatal!(
                "Unable to open performance counter with 'perf_event_open'; \
                 are perf events enabled? Try 'perf record'."
            );
        }
        return Err(RetraceError::Os(nix::Error::Sys(errno)));
    }
    Ok(ScopedFd::new_from_fd(fd))
}

fn read_counter(fd: &ScopedFd) -> u64 {
    let mut val: u64 = 0;
    let nread = unsafe {
        libc::read(
            fd.as_raw(),
            &mut val as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    debug_assert!(nread == std::mem::size_of::<u64>() as isize);
    val
}

fn ioctl_fd(fd: &ScopedFd, request: libc::c_ulong) {
    unsafe {
        libc::ioctl(fd.as_raw(), request, 0);
    }
}

/// One group of counters attached to one task for its whole lifetime.
pub struct PerfCounters {
    tid: pid_t,
    fd_ticks: ScopedFd,
    fd_instructions: ScopedFd,
    fd_page_faults: ScopedFd,
    fd_hw_interrupts: Option<ScopedFd>,
    started: bool,
}

impl PerfCounters {
    pub fn new(tid: pid_t) -> Result<PerfCounters> {
        let mut ticks_attr =
            new_perf_event_attr(PMU_ATTRIBUTES.ticks_type, PMU_ATTRIBUTES.ticks_config);
        // Delivered on overflow once a period is armed.
        ticks_attr.sample_period = 0;
        let fd_ticks = start_counter(tid, -1, &mut ticks_attr)?;

        // The tracee owns the fd's signal so the interrupt stops the tracee,
        // not us.
        unsafe {
            libc::fcntl(fd_ticks.as_raw(), libc::F_SETFL, libc::O_ASYNC);
            libc::fcntl(fd_ticks.as_raw(), F_SETSIG, TIME_SLICE_SIGNAL);
            libc::fcntl(fd_ticks.as_raw(), libc::F_SETOWN, tid);
        }

        let group = fd_ticks.as_raw();
        let mut instructions_attr =
            new_perf_event_attr(PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS);
        let fd_instructions = start_counter(tid, group, &mut instructions_attr)?;
        let mut page_faults_attr =
            new_perf_event_attr(PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS);
        let fd_page_faults = start_counter(tid, group, &mut page_faults_attr)?;

        let fd_hw_interrupts = match PMU_ATTRIBUTES.hw_interrupts_config {
            Some(config) => {
                let mut attr = new_perf_event_attr(PERF_TYPE_RAW, config);
                attr.flags |= ATTR_EXCLUDE_HV;
                Some(start_counter(tid, group, &mut attr)?)
            }
            None => None,
        };

        Ok(PerfCounters {
            tid,
            fd_ticks,
            fd_instructions,
            fd_page_faults,
            fd_hw_interrupts,
            started: false,
        })
    }

    pub fn tid(&self) -> pid_t {
        self.tid
    }

    pub fn start(&mut self) {
        ioctl_fd(&self.fd_ticks, PERF_EVENT_IOC_ENABLE);
        ioctl_fd(&self.fd_instructions, PERF_EVENT_IOC_ENABLE);
        ioctl_fd(&self.fd_page_faults, PERF_EVENT_IOC_ENABLE);
        if let Some(fd) = &self.fd_hw_interrupts {
            ioctl_fd(fd, PERF_EVENT_IOC_ENABLE);
        }
        self.started = true;
    }

    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        ioctl_fd(&self.fd_ticks, PERF_EVENT_IOC_DISABLE);
        ioctl_fd(&self.fd_instructions, PERF_EVENT_IOC_DISABLE);
        ioctl_fd(&self.fd_page_faults, PERF_EVENT_IOC_DISABLE);
        if let Some(fd) = &self.fd_hw_interrupts {
            ioctl_fd(fd, PERF_EVENT_IOC_DISABLE);
        }
        self.started = false;
    }

    /// Arrange for TIME_SLICE_SIGNAL after `period` more ticks.
    pub fn arm_tick_interrupt(&mut self, period: Ticks) {
        let mut p = period.max(1);
        unsafe {
            libc::ioctl(
                self.fd_ticks.as_raw(),
                PERF_EVENT_IOC_PERIOD,
                &mut p as *mut u64,
            );
        }
    }

    pub fn read(&self) -> CounterSnapshot {
        CounterSnapshot {
            ticks: read_counter(&self.fd_ticks),
            instructions: read_counter(&self.fd_instructions),
            page_faults: read_counter(&self.fd_page_faults),
            hw_interrupts: self
                .fd_hw_interrupts
                .as_ref()
                .map(read_counter)
                .unwrap_or(0),
        }
    }
}

impl Drop for PerfCounters {
    fn drop(&mut self) {
        self.stop();
    }
}
