//! Injection engine: synchronous syscall injection, the split async
//! start/end flavor, denial, and modification.
//!
//! Built on the register-snapshot/restore machinery in `registers.rs`:
//! set registers to the call to inject, resume through exactly one
//! syscall-stop pair, read back the result, restore the caller's
//! original registers. The async split (`pre_start`/`pre_end`,
//! `post_start`/`post_end`) adapts that same shape to the event loop's
//! non-blocking, stop-by-stop model rather than a blocking double-wait.

use crate::arch::{Arch, ArgIndex, ARG_INDICES};
use crate::errors::{Error, ErrorKind, Result};
use crate::registers::RegVersion;
use crate::tracee::{InjectionRecord, Tracee};

/// Replaces the tracee's pending call with `syscall_number` and `args`,
/// snapshotting the caller's registers first so they can be restored once
/// the injected call's own POST stop is observed. Legal only at `IdlePre`;
/// any other state is a protocol violation.
pub fn begin_injection(tracee: &mut Tracee, syscall_number: u64, args: &[u64]) -> Result<()> {
    if !tracee.state.is_pre() {
        return Err(Error::new(ErrorKind::ProtocolViolation)
            .with_msg("begin_injection called outside a PRE stop"));
    }
    tracee.regs.snapshot();

    let arch = Arch::new();
    let rewind = arch.reentry_rewind();
    debug_assert!(
        rewind as usize <= Arch::SYSCALL_INSTRUCTION_WIDTH,
        "reentry rewind can't exceed one syscall-entry instruction"
    );
    if rewind > 0 {
        let ip = tracee.regs.instruction_pointer(RegVersion::Current);
        tracee.regs.set_instruction_pointer(ip.saturating_sub(rewind));
    }

    tracee.regs.set_syscall_number(syscall_number as u64);
    for (idx, value) in ARG_INDICES.iter().zip(args.iter()) {
        tracee.regs.set_arg(*idx, *value);
    }
    tracee.regs.push()?;
    tracee.injection = Some(InjectionRecord {
        requested_at: tracee.state,
        syscall_number,
        on_complete: None,
    });
    tracee.state = crate::event::TraceeState::InjectingPre;
    Ok(())
}

/// Called when the injected call's own PRE stop arrives; simply advances
/// the state so the event loop resumes it through to POST without
/// delivering a hook for this intermediate stop — hooks are suppressed
/// for the duration of an injection.
pub fn on_injected_pre(tracee: &mut Tracee) -> Result<()> {
    if tracee.state != crate::event::TraceeState::InjectingPre {
        return Err(Error::new(ErrorKind::ProtocolViolation)
            .with_msg("on_injected_pre called outside InjectingPre"));
    }
    tracee.regs.fetch()?;
    tracee.state = crate::event::TraceeState::InjectingPost;
    Ok(())
}

/// Called when the injected call's POST stop arrives: reads its return
/// value, restores the caller's original registers, and reports the
/// result. Synchronous injection calls this directly and returns the
/// value to the caller; the async flavor instead invokes the
/// `on_complete` callback stashed at `begin_injection` time.
pub fn on_injected_post(tracee: &mut Tracee) -> Result<i64> {
    if tracee.state != crate::event::TraceeState::InjectingPost {
        return Err(Error::new(ErrorKind::ProtocolViolation)
            .with_msg("on_injected_post called outside InjectingPost"));
    }
    tracee.regs.fetch()?;
    let result = tracee.regs.return_value(RegVersion::Current) as i64;
    tracee.regs.restore();
    tracee.regs.push_forced()?;
    let record = tracee.injection.take();
    tracee.state = crate::event::TraceeState::IdlePre;
    if let Some(InjectionRecord {
        on_complete: Some(cb),
        ..
    }) = record
    {
        cb(result);
    }
    Ok(result)
}

/// Denies the tracee's pending call by substituting an unimplemented
/// syscall number, causing the kernel to fail it with `ENOSYS` without
/// ever actually running it. Legal only at `IdlePre`.
pub fn deny_syscall(tracee: &mut Tracee) -> Result<()> {
    if !tracee.state.is_pre() {
        return Err(Error::new(ErrorKind::ProtocolViolation)
            .with_msg("deny_syscall called outside a PRE stop"));
    }
    let arch = crate::arch::Arch::new();
    let nr = tracee.regs.syscall_number(RegVersion::Current);
    tracee.denied_nr = Some(nr);
    tracee.regs.set_syscall_number(arch.impossible_syscall_number());
    tracee.regs.push()?;
    tracee.state = crate::event::TraceeState::DeniedPreWaitingPost;
    Ok(())
}

/// Called at the POST stop synthesized for a denial: restores the
/// original syscall number into the register view so the controller sees
/// the call it actually asked to make (now carrying the kernel's ENOSYS
/// result), and returns to `IdlePost`.
pub fn on_denied_post(tracee: &mut Tracee) -> Result<()> {
    if tracee.state != crate::event::TraceeState::DeniedPreWaitingPost {
        return Err(Error::new(ErrorKind::ProtocolViolation)
            .with_msg("on_denied_post called outside DeniedPreWaitingPost"));
    }
    tracee.regs.fetch()?;
    if let Some(nr) = tracee.denied_nr.take() {
        tracee.regs.set_syscall_number(nr);
    }
    tracee.state = crate::event::TraceeState::IdlePost;
    Ok(())
}

/// Rewrites an argument of the tracee's own pending call without
/// substituting a different syscall entirely. Legal only at `IdlePre`.
pub fn modify_syscall(tracee: &mut Tracee, index: ArgIndex, value: u64) -> Result<()> {
    if !tracee.state.is_pre() {
        return Err(Error::new(ErrorKind::ProtocolViolation)
            .with_msg("modify_syscall called outside a PRE stop"));
    }
    tracee.regs.set_arg(index, value);
    tracee.regs.push()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TraceeState;
    use nix::unistd::Pid;

    fn tracee_at(state: TraceeState) -> Tracee {
        let mut tracee = Tracee::new(Pid::from_raw(-1), false);
        tracee.state = state;
        tracee
    }

    #[test]
    fn deny_syscall_rejects_non_pre_state() {
        let mut tracee = tracee_at(TraceeState::IdlePost);
        let err = deny_syscall(&mut tracee).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn modify_syscall_rejects_non_pre_state() {
        let mut tracee = tracee_at(TraceeState::InjectingPre);
        let err = modify_syscall(&mut tracee, ArgIndex::Arg0, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn on_injected_pre_rejects_wrong_state() {
        let mut tracee = tracee_at(TraceeState::IdlePre);
        let err = on_injected_pre(&mut tracee).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn on_denied_post_rejects_wrong_state() {
        let mut tracee = tracee_at(TraceeState::IdlePre);
        let err = on_denied_post(&mut tracee).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }
}
