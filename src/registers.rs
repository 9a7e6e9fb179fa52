use serde::{Deserialize, Serialize};
use std::io::{self, Write};

/// Snapshot of a task's x86-64 general-purpose register file, as captured
/// at each trace frame. Also mirrors the live register state of a task
/// between events.
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    /// Syscall number as originally trapped, before the kernel or the
    /// replayer rewrites rax.
    pub orig_rax: u64,
    pub rsp: u64,
    pub rip: u64,
    pub eflags: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl Registers {
    pub fn ip(&self) -> u64 {
        self.rip
    }

    pub fn sp(&self) -> u64 {
        self.rsp
    }

    pub fn original_syscallno(&self) -> i64 {
        self.orig_rax as i64
    }

    pub fn syscall_result(&self) -> i64 {
        self.rax as i64
    }

    pub fn set_syscall_result(&mut self, result: i64) {
        self.rax = result as u64;
    }

    /// Syscall arguments in the x86-64 kernel convention.
    pub fn syscall_args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9]
    }

    pub fn set_syscall_args(&mut self, args: [u64; 6]) {
        self.rdi = args[0];
        self.rsi = args[1];
        self.rdx = args[2];
        self.r10 = args[3];
        self.r8 = args[4];
        self.r9 = args[5];
    }

    /// Human-readable multi-line register listing.
    pub fn write_register_file_compact(&self, out: &mut dyn Write) -> io::Result<()> {
        write!(
            out,
            "  rax:{:#x} rbx:{:#x} rcx:{:#x} rdx:{:#x} rsi:{:#x} rdi:{:#x} rbp:{:#x}\n  \
             orig_rax:{:#x} rsp:{:#x} rip:{:#x} eflags:{:#x}",
            self.rax,
            self.rbx,
            self.rcx,
            self.rdx,
            self.rsi,
            self.rdi,
            self.rbp,
            self.orig_rax,
            self.rsp,
            self.rip,
            self.eflags
        )
    }

    /// Machine-parseable single-line form. Field order matches the raw dump
    /// header printed by the dump command.
    pub fn write_register_file_raw(&self, out: &mut dyn Write) -> io::Result<()> {
        write!(
            out,
            "{:x} {:x} {:x} {:x} {:x} {:x} {:x} {:x} {:x} {:x} {:x}",
            self.rax,
            self.rbx,
            self.rcx,
            self.rdx,
            self.rsi,
            self.rdi,
            self.rbp,
            self.orig_rax,
            self.rsp,
            self.rip,
            self.eflags
        )
    }
}

#[cfg(target_arch = "x86_64")]
impl From<libc::user_regs_struct> for Registers {
    fn from(r: libc::user_regs_struct) -> Registers {
        Registers {
            rax: r.rax,
            rbx: r.rbx,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            rbp: r.rbp,
            orig_rax: r.orig_rax,
            rsp: r.rsp,
            rip: r.rip,
            eflags: r.eflags,
            r8: r.r8,
            r9: r.r9,
            r10: r.r10,
            r11: r.r11,
            r12: r.r12,
            r13: r.r13,
            r14: r.r14,
            r15: r.r15,
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl Registers {
    /// Overlay this snapshot onto a full kernel register struct. Segment and
    /// fs/gs base registers are preserved from `base`.
    pub fn apply_to(&self, base: &mut libc::user_regs_struct) {
        base.rax = self.rax;
        base.rbx = self.rbx;
        base.rcx = self.rcx;
        base.rdx = self.rdx;
        base.rsi = self.rsi;
        base.rdi = self.rdi;
        base.rbp = self.rbp;
        base.orig_rax = self.orig_rax;
        base.rsp = self.rsp;
        base.rip = self.rip;
        base.eflags = self.eflags;
        base.r8 = self.r8;
        base.r9 = self.r9;
        base.r10 = self.r10;
        base.r11 = self.r11;
        base.r12 = self.r12;
        base.r13 = self.r13;
        base.r14 = self.r14;
        base.r15 = self.r15;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_args_round_trip() {
        let mut regs = Registers::default();
        regs.set_syscall_args([1, 2, 3, 4, 5, 6]);
        assert_eq!([1, 2, 3, 4, 5, 6], regs.syscall_args());
    }

    #[test]
    fn syscall_result_is_rax() {
        let mut regs = Registers::default();
        regs.set_syscall_result(-38);
        assert_eq!(-38, regs.syscall_result());
        assert_eq!(-38i64 as u64, regs.rax);
    }
}
