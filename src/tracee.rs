//! Per-tracee record: pid, attachment mode, the PRE/POST + injection
//! state machine, cached registers, and a memory window, plus an opaque
//! controller-owned slot for whatever bookkeeping the caller needs.

use crate::errors::Result;
use crate::event::{Event, TraceeState};
use crate::memory::MemoryWindow;
use crate::registers::Registers;
use log::debug;
use nix::sys::ptrace;
use nix::unistd::Pid;
use std::any::Any;

/// An in-flight injection or asynchronous injection callback. Kept on the
/// tracee so the event loop can recognize "this stop belongs to the
/// injection engine, not a hook" without a side table.
pub struct InjectionRecord {
    /// The PRE/POST phase at which injection was requested.
    pub requested_at: TraceeState,
    /// The syscall number being injected.
    pub syscall_number: u64,
    /// Completion callback for the asynchronous `pre-end`/`post-end`
    /// flavor; `None` for synchronous injection, which blocks the caller
    /// directly instead.
    pub on_complete: Option<Box<dyn FnOnce(i64)>>,
}

impl std::fmt::Debug for InjectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectionRecord")
            .field("requested_at", &self.requested_at)
            .field("syscall_number", &self.syscall_number)
            .field("has_callback", &self.on_complete.is_some())
            .finish()
    }
}

/// One tracee under control.
#[derive(Debug)]
pub struct Tracee {
    pub pid: Pid,
    /// True if acquired via `attach` rather than fork. Attached tracees are
    /// detached, not killed, on shutdown; this flag is inherited by
    /// descendants adopted through this tracee and is immutable after
    /// admission.
    pub attached: bool,
    pub state: TraceeState,
    pub regs: Registers,
    pub memory: MemoryWindow,
    /// The number of the last syscall denied by `deny_syscall`, used to
    /// synthesize a POST stop for the denial without re-consulting the
    /// kernel.
    pub denied_nr: Option<u64>,
    /// In-flight injection bookkeeping; `None` when no injection is active.
    pub injection: Option<InjectionRecord>,
    /// The last event observed for this tracee, kept inline (not a
    /// pointer back to the session) to avoid a reference cycle.
    pub last_event: Option<Event>,
    /// Set by the safe-fork protocol when this tracee is a parent whose
    /// child has just been adopted; the only mechanism by which this
    /// field is populated.
    pub safe_fork_pid: Option<Pid>,
    /// Set while the safe-fork protocol is staging a fork/vfork/clone: the
    /// real syscall number and arguments to inject once the placeholder
    /// no-op it substituted has completed its own PRE/POST cycle.
    pub safe_fork_real_call: Option<(u64, [u64; 6])>,
    /// True once this tracee's kernel-level trace options have been set.
    /// Per-tracee rather than session-wide, since each tracee gets exactly
    /// one bootstrap stop of its own to apply them at.
    pub options_applied: bool,
    /// Opaque controller-owned slot. The engine never inspects or
    /// downcasts this; only the controller does, via `Tracee::custom`.
    pub custom: Option<Box<dyn Any + Send>>,
}

impl Tracee {
    pub fn new(pid: Pid, attached: bool) -> Self {
        Tracee {
            pid,
            attached,
            state: TraceeState::IdlePre,
            regs: Registers::new(pid),
            memory: MemoryWindow::new(),
            denied_nr: None,
            injection: None,
            last_event: None,
            safe_fork_pid: None,
            safe_fork_real_call: None,
            options_applied: false,
            custom: None,
        }
    }

    pub fn child(pid: Pid, parent: &Tracee) -> Self {
        Tracee::new(pid, parent.attached)
    }

    /// Applies the kernel-level trace options this engine needs on every
    /// tracee exactly once, before its first post-initial-stop resumption.
    pub fn set_trace_options(&self, trace_children: bool) -> Result<()> {
        use ptrace::Options;
        let mut options = Options::PTRACE_O_TRACESYSGOOD | Options::PTRACE_O_TRACEEXIT;
        if trace_children {
            options |= Options::PTRACE_O_TRACEFORK
                | Options::PTRACE_O_TRACEVFORK
                | Options::PTRACE_O_TRACEVFORKDONE
                | Options::PTRACE_O_TRACECLONE
                | Options::PTRACE_O_TRACEEXEC;
        }
        debug!("{}: set_trace_options({:?})", self.pid, options);
        ptrace::setoptions(self.pid, options)?;
        Ok(())
    }

    /// Resumes the tracee through the kernel's syscall-stop machinery,
    /// carrying a signal through if one is pending and not overridden.
    pub fn continue_to_next_syscall_stop(&self, signal_override: Option<nix::sys::signal::Signal>) -> Result<()> {
        ptrace::syscall(self.pid, signal_override)?;
        Ok(())
    }

    /// Resumes freely (`PTRACE_CONT`), used when the controller wants to
    /// skip straight past intervening signal-delivery stops.
    pub fn continue_freely(&self, signal_override: Option<nix::sys::signal::Signal>) -> Result<()> {
        ptrace::cont(self.pid, signal_override)?;
        Ok(())
    }

    /// Toggles the PRE/POST half on an ordinary (non-injection,
    /// non-denial) syscall-stop.
    pub fn toggle_pre_post(&mut self) {
        self.state = match self.state {
            TraceeState::IdlePre => TraceeState::IdlePost,
            TraceeState::IdlePost => TraceeState::IdlePre,
            other => other,
        };
    }

    pub fn kill(&self) -> Result<()> {
        ptrace::kill(self.pid)?;
        Ok(())
    }

    pub fn detach(&self) -> Result<()> {
        ptrace::detach(self.pid, None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tracee_starts_idle_pre() {
        let tracee = Tracee::new(Pid::from_raw(1), false);
        assert_eq!(tracee.state, TraceeState::IdlePre);
        assert!(!tracee.attached);
    }

    #[test]
    fn toggle_pre_post_alternates() {
        let mut tracee = Tracee::new(Pid::from_raw(1), false);
        tracee.toggle_pre_post();
        assert_eq!(tracee.state, TraceeState::IdlePost);
        tracee.toggle_pre_post();
        assert_eq!(tracee.state, TraceeState::IdlePre);
    }

    #[test]
    fn child_inherits_attached_flag() {
        let parent = Tracee::new(Pid::from_raw(1), true);
        let child = Tracee::child(Pid::from_raw(2), &parent);
        assert!(child.attached);
    }

    #[test]
    fn toggle_pre_post_is_noop_during_injection() {
        let mut tracee = Tracee::new(Pid::from_raw(1), false);
        tracee.state = TraceeState::InjectingPre;
        tracee.toggle_pre_post();
        assert_eq!(tracee.state, TraceeState::InjectingPre);
    }
}
