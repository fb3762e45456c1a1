//! Event classification and the per-tracee state machine: an explicit
//! `{idle-pre, idle-post, injecting-pre, injecting-post,
//! denied-pre-waiting-post}` enumeration in place of a `pre_syscall: bool`
//! plus separate injection flags, so illegal combinations are
//! unrepresentable rather than merely unreachable.

use crate::registers::SyscallArgs;
use nix::unistd::Pid;

/// Classified kind of a value returned by `wait_event`. Carries stable
/// numeric discriminants (`none=1, syscall=2, signal=3, internal=4, quit=5`)
/// so a controller can match on the bare integer across an FFI boundary.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventKind {
    None = 1,
    Syscall = 2,
    Signal = 3,
    Internal = 4,
    Quit = 5,
}

/// One event returned by `wait_event` to the controller.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub pid: Pid,
    pub syscall_number: Option<u64>,
    pub signal_num: Option<i32>,
    pub args: Option<SyscallArgs>,
}

impl Event {
    pub fn new(kind: EventKind, pid: Pid) -> Self {
        Event {
            kind,
            pid,
            syscall_number: None,
            signal_num: None,
            args: None,
        }
    }

    pub fn quit(pid: Pid) -> Self {
        Event::new(EventKind::Quit, pid)
    }

    pub fn none(pid: Pid) -> Self {
        Event::new(EventKind::None, pid)
    }

    pub fn signal(pid: Pid, signal_num: i32) -> Self {
        let mut event = Event::new(EventKind::Signal, pid);
        event.signal_num = Some(signal_num);
        event
    }

    pub fn internal(pid: Pid) -> Self {
        Event::new(EventKind::Internal, pid)
    }

    pub fn syscall(pid: Pid, args: SyscallArgs) -> Self {
        let mut event = Event::new(EventKind::Syscall, pid);
        event.syscall_number = Some(args.syscall_number);
        event.args = Some(args);
        event
    }
}

/// Which half of a syscall-stop a tracee is at, or which step of an
/// in-flight injection/denial it's in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TraceeState {
    /// Waiting for the PRE half of the next syscall-stop.
    IdlePre,
    /// PRE has been observed; waiting for the matching POST.
    IdlePost,
    /// The injection engine has substituted registers and is waiting for
    /// the PRE half of the injected call's own stop cycle.
    InjectingPre,
    /// The injected call's PRE has completed; waiting for its POST so the
    /// engine can read the result and restore the caller's registers.
    InjectingPost,
    /// `deny_syscall` replaced the pending call with an impossible one;
    /// waiting for the kernel's POST so a synthetic `-1`/denied result can
    /// be reported without re-consulting the kernel.
    DeniedPreWaitingPost,
}

impl TraceeState {
    /// True while in any of the injection/denial states, during which
    /// hooks must not be delivered for the intervening stops.
    pub fn is_engine_owned(&self) -> bool {
        matches!(
            self,
            TraceeState::InjectingPre
                | TraceeState::InjectingPost
                | TraceeState::DeniedPreWaitingPost
        )
    }

    /// True at a PRE stop, the only place synchronous injection, denial,
    /// and modification are legal.
    pub fn is_pre(&self) -> bool {
        matches!(self, TraceeState::IdlePre)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_owned_states() {
        assert!(TraceeState::InjectingPre.is_engine_owned());
        assert!(TraceeState::InjectingPost.is_engine_owned());
        assert!(TraceeState::DeniedPreWaitingPost.is_engine_owned());
        assert!(!TraceeState::IdlePre.is_engine_owned());
        assert!(!TraceeState::IdlePost.is_engine_owned());
    }

    #[test]
    fn only_idle_pre_is_pre() {
        assert!(TraceeState::IdlePre.is_pre());
        assert!(!TraceeState::IdlePost.is_pre());
    }
}
