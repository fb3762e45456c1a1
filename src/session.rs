//! Event loop core and session state: the top-level object a controller
//! drives — launch or attach, `wait_event`, resume, and shutdown.
//!
//! The launch handshake forks, has the child call `PTRACE_TRACEME` then
//! raise `SIGSTOP` on itself, and the event loop dispatches `waitpid`
//! results over `Exited`/`Signaled`/`Stopped`/`PtraceEvent`/
//! `PtraceSyscall`. Unlike an always-running translation loop, this is a
//! single-step `wait_event`/`continue_tracee` pair: single-threaded,
//! driven entirely by the controller's own calls rather than an internal
//! loop.

use crate::arch::ArgIndex;
use crate::child_registry::ChildRegistry;
use crate::errors::{Error, ErrorKind, Result};
use crate::event::{Event, TraceeState};
use crate::hooks::{HookRegistry, HookResult};
use crate::inject;
use crate::safe_fork::{self, admit_new_child, ForkKind};
use crate::tracee::Tracee;
use log::{debug, info, warn};
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, getpid, ForkResult, Pid};
use std::ffi::CString;

/// Controller-tunable session behavior.
#[derive(Debug, Clone)]
pub struct Config {
    /// Apply `PTRACE_O_TRACEFORK`/`VFORK`/`CLONE` so descendants are
    /// auto-attached. Disable to trace only the initial tracee.
    pub trace_children: bool,
    /// Raises the effective `log` level the demo binary initializes
    /// `env_logger` with; the engine itself always emits at `debug`/`trace`
    /// regardless of this flag, since filtering is `env_logger`'s job.
    pub verbose: bool,
    /// Route new children through the safe-fork protocol
    /// (`safe_fork::begin_safe_fork` staging a no-op in place of the real
    /// fork/vfork/clone, then `safe_fork::admit_new_child` adopting the
    /// child once the real call is injected) instead of relying on the
    /// kernel's plain auto-follow ordering. Disabling this is only safe
    /// when the controller doesn't care about races between a new child's
    /// first stop and its admission into the registry.
    pub use_safe_trace: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            trace_children: true,
            verbose: false,
            use_safe_trace: true,
        }
    }
}

/// The top-level tracing session: the child registry and hook registry.
pub struct Session {
    config: Config,
    registry: ChildRegistry,
    hooks: HookRegistry,
    quit: bool,
}

impl Session {
    /// Creates an empty session: no tracees, no hooks, ready to
    /// `fork_trace_exec` or `attach`.
    pub fn new(config: Config) -> Self {
        Session {
            config,
            registry: ChildRegistry::new(),
            hooks: HookRegistry::new(),
            quit: false,
        }
    }

    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    pub fn registry(&self) -> &ChildRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ChildRegistry {
        &mut self.registry
    }

    /// Forks a fresh child that declares itself traceable and execs
    /// `path`/`args`, then admits it as the session's first tracee. The
    /// child calls `ptrace::traceme()` then raises `SIGSTOP` on itself so
    /// the parent's first `wait_event` call observes a stop before the
    /// target's own code runs.
    pub fn fork_trace_exec(&mut self, path: &str, args: &[&str]) -> Result<Pid> {
        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                let tracee = Tracee::new(child, false);
                self.registry.admit(tracee);
                Ok(child)
            }
            ForkResult::Child => {
                ptrace::traceme().expect("ptrace traceme");
                kill(getpid(), Signal::SIGSTOP).expect("tracee self-stop for handshake");
                let cpath = CString::new(path).expect("path has no interior nul");
                let cargs: Vec<CString> = args
                    .iter()
                    .map(|a| CString::new(*a).expect("arg has no interior nul"))
                    .collect();
                execvp(&cpath, &cargs).expect("execvp failed in tracee");
                unreachable!("execvp does not return on success");
            }
        }
    }

    /// Attaches to an already-running process. `attached` tracees are
    /// detached rather than killed on session shutdown.
    pub fn attach(&mut self, pid: Pid) -> Result<()> {
        ptrace::attach(pid)?;
        let tracee = Tracee::new(pid, true);
        self.registry.admit(tracee);
        Ok(())
    }

    /// Blocks for the next event across every tracee in the session,
    /// applying the safe-fork protocol and PRE/POST bookkeeping before
    /// returning it to the controller. Returns a `Quit` event once no
    /// tracee remains alive.
    pub fn wait_event(&mut self) -> Result<Event> {
        if self.registry.is_empty() || self.quit {
            return Ok(Event::quit(Pid::from_raw(0)));
        }

        let status = wait::waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL))?;

        match status {
            WaitStatus::Exited(pid, code) => {
                info!("{}: exited with status {}", pid, code);
                self.registry.forget(pid);
                if self.registry.is_empty() {
                    self.quit = true;
                }
                Ok(Event::quit(pid))
            }
            WaitStatus::Signaled(pid, sig, _) => {
                warn!("{}: terminated by signal {:?}", pid, sig);
                self.registry.forget(pid);
                if self.registry.is_empty() {
                    self.quit = true;
                }
                Ok(Event::quit(pid))
            }
            WaitStatus::PtraceEvent(pid, _, status_additional) => self.handle_ptrace_event(pid, status_additional),
            WaitStatus::PtraceSyscall(pid) => {
                self.ensure_admitted(pid);
                self.handle_syscall_stop(pid)
            }
            WaitStatus::Stopped(pid, sig) => {
                self.ensure_admitted(pid);
                self.handle_stop(pid, sig)
            }
            WaitStatus::Continued(pid) => Ok(Event::none(pid)),
            WaitStatus::StillAlive => Ok(Event::none(Pid::from_raw(0))),
        }
    }

    /// Admits `pid` with a default (unattached) tracee record if it
    /// hasn't been seen yet, covering the `use_safe_trace = false` path
    /// where a forked/cloned child's first stop is the first time this
    /// session learns about it.
    fn ensure_admitted(&mut self, pid: Pid) {
        if !self.registry.contains(pid) {
            self.registry.admit(Tracee::new(pid, false));
        }
    }

    fn handle_stop(&mut self, pid: Pid, sig: Signal) -> Result<Event> {
        match sig {
            Signal::SIGSTOP => {
                debug!("{}: sigstop", pid);
                Ok(Event::signal(pid, sig as i32))
            }
            Signal::SIGTRAP => {
                let is_bootstrap = self.registry.get(pid).map(|t| !t.options_applied).unwrap_or(false);
                if is_bootstrap {
                    if let Some(tracee) = self.registry.get_mut(pid) {
                        tracee.options_applied = true;
                        tracee.set_trace_options(self.config.trace_children)?;
                    }
                    // This is the post-exec bootstrap trap, not a
                    // syscall-stop; don't surface it to the controller as
                    // one.
                    return Ok(Event::none(pid));
                }
                self.handle_syscall_stop(pid)
            }
            other => Ok(Event::signal(pid, other as i32)),
        }
    }

    fn handle_syscall_stop(&mut self, pid: Pid) -> Result<Event> {
        let state = self
            .registry
            .get(pid)
            .map(|t| t.state)
            .ok_or_else(|| Error::new(ErrorKind::Unrecoverable).with_msg("stop for unknown pid"))?;

        match state {
            TraceeState::InjectingPre => {
                let tracee = self.registry.get_mut(pid).expect("checked above");
                inject::on_injected_pre(tracee)?;
                Ok(Event::none(pid))
            }
            TraceeState::InjectingPost => {
                let tracee = self.registry.get_mut(pid).expect("checked above");
                let result = inject::on_injected_post(tracee)?;
                if let Some((real_nr, real_args)) = tracee.safe_fork_real_call.take() {
                    // The placeholder no-op just completed; inject the
                    // real fork/vfork/clone now that the parent is
                    // parked back at a fresh PRE stop.
                    inject::begin_injection(tracee, real_nr, &real_args)?;
                    return Ok(Event::none(pid));
                }
                let mut event = Event::internal(pid);
                event.syscall_number = Some(result as u64);
                Ok(event)
            }
            TraceeState::DeniedPreWaitingPost => {
                let tracee = self.registry.get_mut(pid).expect("checked above");
                inject::on_denied_post(tracee)?;
                let args = tracee.regs.to_syscall_args(crate::registers::RegVersion::Current);
                Ok(Event::syscall(pid, args))
            }
            TraceeState::IdlePre | TraceeState::IdlePost => {
                let original_state = state;
                let (number, event) = {
                    let tracee = self.registry.get_mut(pid).expect("checked above");
                    tracee.regs.fetch()?;
                    let args = tracee.regs.to_syscall_args(crate::registers::RegVersion::Current);
                    let event = Event::syscall(pid, args);
                    tracee.last_event = Some(event.clone());
                    (args.syscall_number, event)
                };

                // Run the hook while `tracee.state` still reflects this
                // stop's own PRE/POST half — injection/denial/modification
                // are only legal during a hook invoked at PRE, and the
                // tracee hasn't toggled away from that yet.
                let mut event_for_hook = event;
                let mut hooks = std::mem::take(&mut self.hooks);
                let outcome = hooks.execute_hook(number, self, &mut event_for_hook);
                self.hooks = hooks;

                if original_state == TraceeState::IdlePre
                    && self.config.use_safe_trace
                    && matches!(outcome, HookResult::Continue | HookResult::NoHook)
                    && safe_fork::is_fork_family(number)
                {
                    if let Some(tracee) = self.registry.get_mut(pid) {
                        if tracee.state == TraceeState::IdlePre {
                            let real_args = event_for_hook.args.map(|a| a.args).unwrap_or([0; 6]);
                            safe_fork::begin_safe_fork(tracee, number, real_args)?;
                        }
                    }
                }

                // Advance the PRE/POST alternation only if nothing above
                // already moved the tracee into an injection/denial state
                // of its own — those own `tracee.state` until their own
                // protocol completes.
                if let Some(tracee) = self.registry.get_mut(pid) {
                    if tracee.state == original_state {
                        tracee.toggle_pre_post();
                    }
                }

                match outcome {
                    HookResult::KillChild => {
                        if let Some(tracee) = self.registry.get(pid) {
                            tracee.kill()?;
                        }
                        self.registry.forget(pid);
                        Ok(Event::quit(pid))
                    }
                    HookResult::Abort => {
                        self.kill_all()?;
                        self.quit = true;
                        Ok(Event::quit(pid))
                    }
                    HookResult::Continue | HookResult::NoHook => Ok(event_for_hook),
                }
            }
        }
    }

    fn handle_ptrace_event(&mut self, pid: Pid, status_additional: i32) -> Result<Event> {
        use ptrace::Event as PtraceEvent;

        let kind = if status_additional == PtraceEvent::PTRACE_EVENT_FORK as i32 {
            Some(ForkKind::Fork)
        } else if status_additional == PtraceEvent::PTRACE_EVENT_VFORK as i32 {
            Some(ForkKind::Vfork)
        } else if status_additional == PtraceEvent::PTRACE_EVENT_CLONE as i32 {
            Some(ForkKind::Clone)
        } else {
            None
        };

        if let Some(kind) = kind {
            if self.config.use_safe_trace {
                let child_pid = admit_new_child(&mut self.registry, pid, kind)?;
                debug!("{}: new child {} via {:?}", pid, child_pid, kind);
            } else {
                debug!(
                    "{}: new child via {:?} (safe-fork disabled, admitting lazily on its own first stop)",
                    pid, kind
                );
            }
            return Ok(Event::internal(pid));
        }

        // PTRACE_EVENT_EXEC, PTRACE_EVENT_VFORK_DONE, PTRACE_EVENT_EXIT,
        // PTRACE_EVENT_SECCOMP: reported to the controller as internal
        // events carrying no syscall payload; this engine has nothing
        // beyond bookkeeping to do for them.
        Ok(Event::internal(pid))
    }

    /// Resumes `pid` through to the next syscall-stop, honoring any
    /// pending signal unless the controller overrides it.
    pub fn continue_tracee(&mut self, pid: Pid, signal_override: Option<Signal>) -> Result<()> {
        let tracee = self
            .registry
            .get(pid)
            .ok_or_else(|| Error::new(ErrorKind::Unrecoverable).with_msg("continue for unknown pid"))?;
        tracee.continue_to_next_syscall_stop(signal_override)
    }

    /// Blocks until `pid`'s next syscall-stop without going through
    /// `wait_event`'s general dispatch, so the caller can drive a tracee
    /// through an extra stop cycle (an injected call) without surfacing
    /// the intervening stops to the controller. Only legal to call from
    /// within a hook, which is itself invoked from inside `wait_event`.
    fn wait_for_injection_stop(&mut self, pid: Pid) -> Result<()> {
        loop {
            match wait::waitpid(pid, Some(WaitPidFlag::__WALL))? {
                WaitStatus::PtraceSyscall(p) if p == pid => return Ok(()),
                WaitStatus::Exited(p, code) if p == pid => {
                    self.registry.forget(p);
                    return Err(Error::new(ErrorKind::Unrecoverable)
                        .with_msg(format!("tracee exited (status {}) mid-injection", code)));
                }
                WaitStatus::Signaled(p, sig, _) if p == pid => {
                    self.registry.forget(p);
                    return Err(Error::new(ErrorKind::Unrecoverable)
                        .with_msg(format!("tracee killed by {:?} mid-injection", sig)));
                }
                _ => continue,
            }
        }
    }

    /// Synchronously injects `syscall_number(args)` into `pid` and blocks
    /// until it completes, returning its result. Legal only when `pid` is
    /// currently at a PRE stop — i.e. called from within a hook invoked
    /// for that stop, before the hook returns.
    pub fn inject_syscall(&mut self, pid: Pid, syscall_number: u64, args: &[u64]) -> Result<i64> {
        {
            let tracee = self
                .registry
                .get_mut(pid)
                .ok_or_else(|| Error::new(ErrorKind::Unrecoverable).with_msg("inject_syscall for unknown pid"))?;
            inject::begin_injection(tracee, syscall_number, args)?;
            tracee.continue_to_next_syscall_stop(None)?;
        }
        self.wait_for_injection_stop(pid)?;
        {
            let tracee = self
                .registry
                .get_mut(pid)
                .ok_or_else(|| Error::new(ErrorKind::Unrecoverable).with_msg("tracee vanished mid-injection"))?;
            inject::on_injected_pre(tracee)?;
            tracee.continue_to_next_syscall_stop(None)?;
        }
        self.wait_for_injection_stop(pid)?;
        let tracee = self
            .registry
            .get_mut(pid)
            .ok_or_else(|| Error::new(ErrorKind::Unrecoverable).with_msg("tracee vanished mid-injection"))?;
        inject::on_injected_post(tracee)
    }

    /// Starts an asynchronous injection of `syscall_number(args)` into
    /// `pid` without blocking the caller; `on_complete` runs with the
    /// injected call's result once its matching POST stop arrives via the
    /// ordinary event loop, with no hook dispatched for the intervening
    /// stops. Legal only at a PRE stop.
    pub fn pre_start(
        &mut self,
        pid: Pid,
        syscall_number: u64,
        args: &[u64],
        on_complete: Box<dyn FnOnce(i64)>,
    ) -> Result<()> {
        let tracee = self
            .registry
            .get_mut(pid)
            .ok_or_else(|| Error::new(ErrorKind::Unrecoverable).with_msg("pre_start for unknown pid"))?;
        inject::begin_injection(tracee, syscall_number, args)?;
        if let Some(record) = tracee.injection.as_mut() {
            record.on_complete = Some(on_complete);
        }
        tracee.continue_to_next_syscall_stop(None)
    }

    /// Denies `pid`'s currently pending call with `ENOSYS`. Legal only at
    /// a PRE stop.
    pub fn deny_syscall(&mut self, pid: Pid) -> Result<()> {
        let tracee = self
            .registry
            .get_mut(pid)
            .ok_or_else(|| Error::new(ErrorKind::Unrecoverable).with_msg("deny_syscall for unknown pid"))?;
        inject::deny_syscall(tracee)
    }

    /// Rewrites argument `index` of `pid`'s currently pending call. Legal
    /// only at a PRE stop.
    pub fn modify_syscall(&mut self, pid: Pid, index: ArgIndex, value: u64) -> Result<()> {
        let tracee = self
            .registry
            .get_mut(pid)
            .ok_or_else(|| Error::new(ErrorKind::Unrecoverable).with_msg("modify_syscall for unknown pid"))?;
        inject::modify_syscall(tracee, index, value)
    }

    /// Kills the named tracee and removes it from the registry.
    pub fn kill_child(&mut self, pid: Pid) -> Result<()> {
        if let Some(tracee) = self.registry.get(pid) {
            tracee.kill()?;
        }
        self.registry.forget(pid);
        Ok(())
    }

    /// Detaches an attached tracee, or kills a forked one, and removes it.
    pub fn remove_child(&mut self, pid: Pid) -> Result<()> {
        if let Some(tracee) = self.registry.get(pid) {
            if tracee.attached {
                tracee.detach()?;
            } else {
                tracee.kill()?;
            }
        }
        self.registry.forget(pid);
        Ok(())
    }

    pub fn children_count(&self) -> usize {
        self.registry.count()
    }

    fn kill_all(&mut self) -> Result<()> {
        let pids: Vec<Pid> = self.registry.pids().copied().collect();
        for pid in pids {
            if let Some(tracee) = self.registry.get(pid) {
                let _ = tracee.kill();
            }
            self.registry.forget(pid);
        }
        Ok(())
    }

    /// Detaches every attached tracee and kills every forked one, then
    /// marks the session finished, without touching the controller
    /// process itself.
    pub fn free(&mut self) -> Result<()> {
        let pids: Vec<Pid> = self.registry.pids().copied().collect();
        for pid in pids {
            let _ = self.remove_child(pid);
        }
        self.quit = true;
        Ok(())
    }

    /// `free`, then terminates the calling (controller) process itself.
    /// Never returns.
    pub fn quit(&mut self) -> ! {
        let _ = self.free();
        std::process::exit(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_has_no_children() {
        let session = Session::new(Config::default());
        assert_eq!(session.children_count(), 0);
    }

    #[test]
    fn wait_event_on_empty_session_quits_immediately() {
        let mut session = Session::new(Config::default());
        let event = session.wait_event().unwrap();
        assert_eq!(event.kind, crate::event::EventKind::Quit);
    }

    #[test]
    fn default_config_traces_children() {
        assert!(Config::default().trace_children);
    }

    /// Drives the real event loop (`wait_event`/`continue_tracee`) against
    /// a genuinely forked and traced child, rather than hand-built
    /// `Tracee` state: the handshake's bootstrap stop, a hook seeing a
    /// real syscall number, and the tracee's eventual exit all have to go
    /// through the kernel, not a stand-in.
    #[test]
    fn wait_event_drives_hook_against_real_tracee() {
        use crate::event::EventKind;
        use std::cell::RefCell;
        use std::rc::Rc;

        crate::test_support::test_in_subprocess(|| {
            match unsafe { fork() }.expect("fork") {
                ForkResult::Parent { child } => {
                    assert_eq!(
                        wait::waitpid(child, Some(WaitPidFlag::__WALL)).expect("initial stop"),
                        WaitStatus::Stopped(child, Signal::SIGSTOP)
                    );

                    let mut session = Session::new(Config::default());
                    session.registry.admit(Tracee::new(child, false));

                    session.continue_tracee(child, None).expect("resume past handshake stop");
                    let bootstrap = session.wait_event().expect("bootstrap stop");
                    assert_eq!(bootstrap.kind, EventKind::None);
                    assert!(session.registry.get(child).unwrap().options_applied);

                    let saw_close = Rc::new(RefCell::new(false));
                    let saw_close_hook = saw_close.clone();
                    session.hooks_mut().set_default_hook(move |_session, event| {
                        if event.syscall_number == Some(sc::nr::CLOSE as u64) {
                            *saw_close_hook.borrow_mut() = true;
                        }
                        HookResult::Continue
                    });

                    let mut syscall_stops = 0;
                    loop {
                        session.continue_tracee(child, None).expect("resume tracee");
                        let event = session.wait_event().expect("next event");
                        match event.kind {
                            EventKind::Syscall => syscall_stops += 1,
                            EventKind::Quit => break,
                            _ => {}
                        }
                        assert!(syscall_stops <= 20, "tracee never reached exit");
                    }

                    assert!(*saw_close.borrow(), "default hook never observed the close syscall");
                    assert!(syscall_stops >= 2, "expected a PRE/POST pair for the close syscall");
                }
                ForkResult::Child => {
                    ptrace::traceme().expect("traceme");
                    kill(getpid(), Signal::SIGSTOP).expect("child sigstop");
                    let _ = nc::close(-1);
                    std::process::exit(0);
                }
            }
        });
    }
}
