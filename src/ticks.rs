/// Retired-conditional-branch count. Doesn't correspond to any unit of real
/// time in general, but it is exactly reproducible for the same code on the
/// same CPU, which is all scheduling needs.
pub type Ticks = u64;

/// Empirical data puts insns/rcb around 10; guessing ~4 cycles/insn on a
/// nominal 2GHz CPU gives 50,000 ticks per millisecond. The default quantum
/// aims for 10ms timeslices.
pub const DEFAULT_MAX_TICKS: Ticks = 500_000;

/// Maximum number of events (syscall entry/exit, signal, interrupt) a task
/// may accumulate in one timeslice before being descheduled.
pub const DEFAULT_MAX_EVENTS: u64 = 1_000;
