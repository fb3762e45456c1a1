//! Safe-fork protocol: admitting a new tracee produced by
//! `fork`/`vfork`/`clone` without racing the kernel's auto-follow — the
//! new child must have a `Tracee` record before its first syscall-stop
//! can arrive, or that stop has nothing to attribute itself to.

use crate::arch::Word;
use crate::child_registry::ChildRegistry;
use crate::errors::{Error, ErrorKind, Result};
use crate::inject;
use crate::tracee::Tracee;
use nix::sys::ptrace;
use nix::unistd::Pid;

/// Which fork-family event produced the new child, mirroring the
/// `PTRACE_EVENT_{FORK,VFORK,CLONE}` values the kernel reports.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ForkKind {
    Fork,
    Vfork,
    Clone,
}

/// A syscall substituted for a pending fork/vfork/clone while the parent
/// is staged through the safe-fork protocol: cheap, side-effect-free, and
/// never itself creates a child.
const NOOP_SYSCALL: Word = sc::nr::GETPID as Word;

/// True if `nr` is one of the fork-family syscalls the safe-fork protocol
/// intercepts.
pub fn is_fork_family(nr: Word) -> bool {
    nr == sc::nr::FORK as Word || nr == sc::nr::VFORK as Word || nr == sc::nr::CLONE as Word
}

/// Stage 1 of the safe-fork protocol: at the parent's PRE stop for
/// `real_nr` (a fork/vfork/clone call), replace it with a no-op and
/// remember the real call so it can be injected once the no-op's own
/// PRE/POST cycle has completed. Only legal at a PRE stop (checked by
/// `inject::begin_injection`, which this delegates to).
pub fn begin_safe_fork(tracee: &mut Tracee, real_nr: Word, real_args: [Word; 6]) -> Result<()> {
    inject::begin_injection(tracee, NOOP_SYSCALL, &[])?;
    tracee.safe_fork_real_call = Some((real_nr, real_args));
    Ok(())
}

/// Stage 3 of the safe-fork protocol, run from the parent's
/// `PTRACE_EVENT_{FORK,VFORK,CLONE}` stop once `begin_safe_fork` has
/// staged the real call through the injection engine: resolves the new
/// child's pid via `PTRACE_GETEVENTMSG` and admits it into `registry`
/// before the parent is resumed, so no syscall-stop for the new child can
/// arrive before it has a `Tracee` record to be attributed to. Returns the
/// new child's pid.
///
/// Idempotent against a child that has already been admitted by a prior
/// race-free path (e.g. a `waitpid` on the child pid arriving first):
/// in that case the existing record is left untouched and its pid is
/// still returned.
pub fn admit_new_child(registry: &mut ChildRegistry, parent_pid: Pid, kind: ForkKind) -> Result<Pid> {
    let raw_pid = {
        let parent = registry
            .get(parent_pid)
            .ok_or_else(|| Error::new(ErrorKind::Unrecoverable).with_msg("fork event for unknown parent"))?;
        ptrace::getevent(parent.pid)?
    };
    let child_pid = Pid::from_raw(raw_pid as i32);

    if !registry.contains(child_pid) {
        let attached = registry.get(parent_pid).map(|p| p.attached).unwrap_or(false);
        let child = Tracee::new(child_pid, attached);
        child.set_trace_options(true)?;
        registry.admit(child);
    }

    if let Some(parent) = registry.get_mut(parent_pid) {
        parent.safe_fork_pid = Some(child_pid);
    }

    // `vfork` suspends the parent until the child execs or exits; the
    // parent's own PTRACE_EVENT_VFORK_DONE stop (handled by the event
    // loop like an ordinary syscall-stop) is what actually resumes it,
    // so no extra handling is needed here beyond recording the
    // relationship for the controller to observe via `safe_fork_pid`.
    let _ = kind;
    Ok(child_pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TraceeState;

    #[test]
    fn fork_kind_values_distinct() {
        assert_ne!(ForkKind::Fork, ForkKind::Vfork);
        assert_ne!(ForkKind::Vfork, ForkKind::Clone);
    }

    #[test]
    fn is_fork_family_matches_known_numbers() {
        assert!(is_fork_family(sc::nr::FORK as Word));
        assert!(is_fork_family(sc::nr::VFORK as Word));
        assert!(is_fork_family(sc::nr::CLONE as Word));
        assert!(!is_fork_family(sc::nr::GETPID as Word));
    }

    #[test]
    fn begin_safe_fork_rejects_non_pre_state() {
        let mut tracee = Tracee::new(Pid::from_raw(-1), false);
        tracee.state = TraceeState::IdlePost;
        let err = begin_safe_fork(&mut tracee, sc::nr::FORK as Word, [0; 6]).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::ProtocolViolation);
    }
}
