//! Built-in syscall name/number table: a minimal name-to-number lookup
//! covering enough common syscalls to make hook registration by name
//! usable out of the box, so the crate is runnable standalone. Numbers
//! are re-exported from `sc::nr` rather than hand-copied.

use crate::arch::Word;

/// Resolves a syscall name to its x86_64 number. Returns `None` for names
/// not in the built-in table; a controller needing a wider table supplies
/// its own and calls `HookRegistry::set_hook_by_number` directly.
pub fn number_for_name(name: &str) -> Option<Word> {
    let nr = match name {
        "read" => sc::nr::READ,
        "write" => sc::nr::WRITE,
        "open" => sc::nr::OPEN,
        "openat" => sc::nr::OPENAT,
        "close" => sc::nr::CLOSE,
        "fork" => sc::nr::FORK,
        "vfork" => sc::nr::VFORK,
        "clone" => sc::nr::CLONE,
        "execve" => sc::nr::EXECVE,
        "exit" => sc::nr::EXIT,
        "exit_group" => sc::nr::EXIT_GROUP,
        "getpid" => sc::nr::GETPID,
        "getuid" => sc::nr::GETUID,
        "mmap" => sc::nr::MMAP,
        "munmap" => sc::nr::MUNMAP,
        "fstat" => sc::nr::FSTAT,
        _ => return None,
    };
    Some(nr as Word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_names() {
        assert_eq!(number_for_name("getpid"), Some(sc::nr::GETPID as Word));
        assert_eq!(number_for_name("write"), Some(sc::nr::WRITE as Word));
    }

    #[test]
    fn unknown_name_resolves_to_none() {
        assert_eq!(number_for_name("not_a_syscall"), None);
    }
}
