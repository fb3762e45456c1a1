//! Hook registry: a mapping from syscall number to a controller-supplied
//! callback, plus a default catch-all. Lookup is O(1) on syscall number
//! via a `HashMap`; re-registering for a number replaces the previous
//! binding.

use crate::arch::Word;
use crate::event::Event;
use crate::session::Session;
use crate::syscall_table::number_for_name;
use std::collections::HashMap;

/// What a hook tells the event loop to do after it runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HookResult {
    /// Continue the tracee, carrying any pending signal through unless the
    /// caller overrides it.
    Continue = 0,
    /// Kill the tracee and remove it from the registry.
    KillChild = 1,
    /// Kill every tracee and return a `quit` event to the controller.
    Abort = 2,
    /// No hook existed for this syscall (also returned by
    /// `execute_hook` directly, never produced by a hook function itself).
    NoHook = 3,
}

/// A hook receives the session it was triggered from, so it can call
/// `Session::inject_syscall`/`deny_syscall`/`modify_syscall`/`pre_start`
/// against the tracee that's stopped, alongside the stopped event itself.
pub type HookFn = Box<dyn FnMut(&mut Session, &mut Event) -> HookResult>;

/// Syscall number -> callback, plus an optional default.
#[derive(Default)]
pub struct HookRegistry {
    by_number: HashMap<Word, HookFn>,
    default: Option<HookFn>,
}

impl HookRegistry {
    pub fn new() -> Self {
        HookRegistry {
            by_number: HashMap::new(),
            default: None,
        }
    }

    /// Resolves `name` to a syscall number via the built-in table and
    /// registers `hook` for it. Re-registering for the same syscall
    /// replaces the previous binding.
    ///
    /// Returns `false` if `name` is not in the built-in table; the
    /// controller should fall back to `set_hook_by_number` with a number
    /// from its own table in that case.
    pub fn set_hook<F>(&mut self, name: &str, hook: F) -> bool
    where
        F: FnMut(&mut Session, &mut Event) -> HookResult + 'static,
    {
        match number_for_name(name) {
            Some(nr) => {
                self.set_hook_by_number(nr, hook);
                true
            }
            None => false,
        }
    }

    pub fn set_hook_by_number<F>(&mut self, number: Word, hook: F)
    where
        F: FnMut(&mut Session, &mut Event) -> HookResult + 'static,
    {
        self.by_number.insert(number, Box::new(hook));
    }

    pub fn set_default_hook<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Session, &mut Event) -> HookResult + 'static,
    {
        self.default = Some(Box::new(hook));
    }

    /// Runs the hook registered for `event`'s syscall number, falling back
    /// to the default hook, returning `NoHook` if neither exists. Takes
    /// the triggering `Session` by value-through-reference rather than
    /// `&mut self` on `Session` holding this registry, so the caller must
    /// first move the registry out of the session (see
    /// `Session::handle_syscall_stop`).
    pub fn execute_hook(&mut self, number: Word, session: &mut Session, event: &mut Event) -> HookResult {
        if let Some(hook) = self.by_number.get_mut(&number) {
            return hook(session, event);
        }
        if let Some(hook) = &mut self.default {
            return hook(session, event);
        }
        HookResult::NoHook
    }

    pub fn len(&self) -> usize {
        self.by_number.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_number.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventKind};
    use crate::session::{Config, Session};
    use nix::unistd::Pid;

    fn blank_event() -> Event {
        Event::new(EventKind::Syscall, Pid::from_raw(1))
    }

    #[test]
    fn no_hook_returns_no_hook() {
        let mut registry = HookRegistry::new();
        let mut session = Session::new(Config::default());
        let mut event = blank_event();
        assert_eq!(registry.execute_hook(1, &mut session, &mut event), HookResult::NoHook);
    }

    #[test]
    fn specific_hook_wins_over_default() {
        let mut registry = HookRegistry::new();
        registry.set_default_hook(|_, _| HookResult::Abort);
        registry.set_hook_by_number(42, |_, _| HookResult::Continue);
        let mut session = Session::new(Config::default());
        let mut event = blank_event();
        assert_eq!(registry.execute_hook(42, &mut session, &mut event), HookResult::Continue);
        assert_eq!(registry.execute_hook(7, &mut session, &mut event), HookResult::Abort);
    }

    #[test]
    fn re_registering_replaces_and_keeps_count() {
        let mut registry = HookRegistry::new();
        registry.set_hook_by_number(1, |_, _| HookResult::Continue);
        registry.set_hook_by_number(1, |_, _| HookResult::KillChild);
        assert_eq!(registry.len(), 1);
        let mut session = Session::new(Config::default());
        let mut event = blank_event();
        assert_eq!(registry.execute_hook(1, &mut session, &mut event), HookResult::KillChild);
    }

    #[test]
    fn unresolvable_name_is_rejected() {
        let mut registry = HookRegistry::new();
        assert!(!registry.set_hook("not_a_real_syscall", |_, _| HookResult::Continue));
    }
}
