//! Minimal perf_event_open(2) ABI declarations, hand-maintained.
//! Only the fields and constants the counters module actually touches.

#![allow(non_camel_case_types)]

/// fcntl command directing the fd's O_ASYNC signal; the libc crate does not
/// export it.
pub const F_SETSIG: libc::c_int = 10;

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_RAW: u32 = 4;

pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
pub const PERF_COUNT_SW_PAGE_FAULTS: u64 = 2;

// _IO('$', 0) and friends.
pub const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
pub const PERF_EVENT_IOC_RESET: libc::c_ulong = 0x2403;
// _IOW('$', 4, u64)
pub const PERF_EVENT_IOC_PERIOD: libc::c_ulong = 0x4008_2404;

// Flag bits within perf_event_attr.flags (bit 0 is `disabled`).
pub const ATTR_DISABLED: u64 = 1 << 0;
pub const ATTR_PINNED: u64 = 1 << 2;
pub const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
pub const ATTR_EXCLUDE_HV: u64 = 1 << 6;

/// Truncated perf_event_attr. The kernel accepts historical sizes, and
/// `size` is set to the size of this struct, so trailing fields we never
/// use can be omitted.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct perf_event_attr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    /// sample_period / sample_freq union in the kernel header.
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    /// Bitfield in the kernel header; see the ATTR_* constants.
    pub flags: u64,
    /// wakeup_events / wakeup_watermark union.
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
}

impl Default for perf_event_attr {
    fn default() -> perf_event_attr {
        perf_event_attr {
            type_: 0,
            size: std::mem::size_of::<perf_event_attr>() as u32,
            config: 0,
            sample_period: 0,
            sample_type: 0,
            read_format: 0,
            flags: 0,
            wakeup_events: 0,
            bp_type: 0,
            config1: 0,
            config2: 0,
        }
    }
}
