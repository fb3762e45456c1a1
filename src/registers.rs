//! Cached register bundle for one tracee: a `Registers` struct holding
//! two generations of the raw `user_regs_struct` (current and original),
//! `get`/`set` by role, and `fetch`/`push` wrapping
//! `PTRACE_GETREGS`/`PTRACE_SETREGS`. The PRE/POST/injection state
//! machine itself lives in `tracee::TraceeState`; this module only holds
//! the register values.

use crate::arch::{ArgIndex, Arch, Register, Word, ARG_INDICES};
use crate::errors::Result;
use libc::user_regs_struct;
use log::debug;
use nix::sys::ptrace;
use nix::unistd::Pid;

/// Which generation of the register block a `get`/`set` call addresses.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegVersion {
    /// The live value, kept in sync with the kernel via `fetch`/`push`.
    Current = 0,
    /// A snapshot taken before a hook or the injection engine started
    /// mutating `Current` — used to restore state afterwards.
    Original = 1,
}

use RegVersion::*;

/// A six-argument, return-value, syscall-number, ip/sp snapshot, read out
/// of a `Registers` bundle at a point in time so it can be carried in an
/// `Event` independent of the tracee's later register changes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SyscallArgs {
    pub syscall_number: Word,
    pub args: [Word; 6],
    pub return_value: Word,
    pub instruction_pointer: Word,
    pub stack_pointer: Word,
}

/// The cached general-purpose registers of one tracee, with a second
/// "Original" generation for injection/denial bookkeeping.
#[derive(Debug)]
pub struct Registers {
    pid: Pid,
    arch: Arch,
    current: Option<user_regs_struct>,
    original: Option<user_regs_struct>,
    dirty: bool,
}

impl Registers {
    pub fn new(pid: Pid) -> Self {
        Registers {
            pid,
            arch: Arch::new(),
            current: None,
            original: None,
            dirty: false,
        }
    }

    #[cfg(test)]
    pub fn from_raw(pid: Pid, raw: user_regs_struct) -> Self {
        Registers {
            pid,
            arch: Arch::new(),
            current: Some(raw),
            original: None,
            dirty: false,
        }
    }

    /// Retrieves all general-purpose registers from the kernel into
    /// `Current`. Must be called once per syscall-stop before `get`/`set`
    /// are used.
    pub fn fetch(&mut self) -> Result<()> {
        let regs = ptrace::getregs(self.pid)?;
        self.current = Some(regs);
        self.dirty = false;
        Ok(())
    }

    /// Pushes `Current` back to the kernel if it was modified since the
    /// last fetch/push.
    pub fn push(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let regs = self.regs(Current);
        debug!("{}: push regs: {:x?}", self.pid, regs);
        ptrace::setregs(self.pid, *regs)?;
        self.dirty = false;
        Ok(())
    }

    /// Force a push even if nothing was marked dirty; used by the injection
    /// engine when it hands the caller's register snapshot back verbatim.
    pub fn push_forced(&mut self) -> Result<()> {
        self.dirty = true;
        self.push()
    }

    #[inline]
    pub fn get(&self, version: RegVersion, register: Register) -> Word {
        self.arch.get(self.regs(version), register)
    }

    #[inline]
    pub fn set(&mut self, register: Register, value: Word) {
        let current = self.current.get_or_insert_with(|| unsafe { std::mem::zeroed() });
        self.arch.set(current, register, value);
        self.dirty = true;
    }

    #[inline]
    pub fn syscall_number(&self, version: RegVersion) -> Word {
        self.get(version, Register::SyscallNumber)
    }

    #[inline]
    pub fn set_syscall_number(&mut self, value: Word) {
        self.set(Register::SyscallNumber, value);
    }

    #[inline]
    pub fn arg(&self, version: RegVersion, index: ArgIndex) -> Word {
        self.get(version, Register::Arg(index))
    }

    #[inline]
    pub fn set_arg(&mut self, index: ArgIndex, value: Word) {
        self.set(Register::Arg(index), value);
    }

    #[inline]
    pub fn return_value(&self, version: RegVersion) -> Word {
        self.get(version, Register::ReturnValue)
    }

    #[inline]
    pub fn set_return_value(&mut self, value: Word) {
        self.set(Register::ReturnValue, value);
    }

    #[inline]
    pub fn instruction_pointer(&self, version: RegVersion) -> Word {
        self.get(version, Register::InstructionPointer)
    }

    #[inline]
    pub fn set_instruction_pointer(&mut self, value: Word) {
        self.set(Register::InstructionPointer, value);
    }

    #[inline]
    pub fn stack_pointer(&self, version: RegVersion) -> Word {
        self.get(version, Register::StackPointer)
    }

    /// Saves `Current` into `Original`, the only way `Original` is ever
    /// written. Used before the injection engine or a denial starts
    /// mutating registers, so they can be restored afterwards.
    pub fn snapshot(&mut self) {
        self.original = self.current;
    }

    /// Restores `Current` from the snapshot taken by the last `snapshot()`
    /// call. Requires a snapshot to exist.
    pub fn restore(&mut self) {
        self.current = self.original;
        self.dirty = true;
    }

    pub fn to_syscall_args(&self, version: RegVersion) -> SyscallArgs {
        let mut args = [0; 6];
        for (slot, idx) in args.iter_mut().zip(ARG_INDICES.iter()) {
            *slot = self.arg(version, *idx);
        }
        SyscallArgs {
            syscall_number: self.syscall_number(version),
            args,
            return_value: self.return_value(version),
            instruction_pointer: self.instruction_pointer(version),
            stack_pointer: self.stack_pointer(version),
        }
    }

    #[inline]
    fn regs(&self, version: RegVersion) -> &user_regs_struct {
        match version {
            Current => self.current.as_ref().expect("Current registers not fetched"),
            Original => self.original.as_ref().expect("no register snapshot taken"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    fn zeroed_registers() -> Registers {
        Registers::from_raw(Pid::from_raw(-1), unsafe { mem::zeroed() })
    }

    #[test]
    fn set_marks_dirty() {
        let mut regs = zeroed_registers();
        assert!(!regs.dirty);
        regs.set_syscall_number(123);
        assert!(regs.dirty);
        assert_eq!(regs.syscall_number(Current), 123);
    }

    #[test]
    fn snapshot_then_restore_round_trips() {
        let mut regs = zeroed_registers();
        regs.set_syscall_number(1);
        regs.snapshot();
        regs.set_syscall_number(2);
        assert_eq!(regs.syscall_number(Current), 2);
        regs.restore();
        assert_eq!(regs.syscall_number(Current), 1);
    }

    #[test]
    fn to_syscall_args_reads_all_six() {
        let mut regs = zeroed_registers();
        for (i, idx) in ARG_INDICES.iter().enumerate() {
            regs.set_arg(*idx, i as Word + 10);
        }
        let snap = regs.to_syscall_args(Current);
        assert_eq!(snap.args, [10, 11, 12, 13, 14, 15]);
    }
}
