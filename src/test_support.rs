//! Subprocess test harness: forking under `cargo test` mixes child
//! processes across test threads unless each test that forks is itself
//! run in a throwaway subprocess whose exit status is all the parent
//! test thread observes.

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};

/// Runs `func` in a forked child and asserts the child exits 0, keeping
/// any `fork()` done inside it off the test-runner's own process tree.
pub fn test_in_subprocess<F: FnOnce()>(func: F) {
    match unsafe { fork() }.expect("fork in test_in_subprocess") {
        ForkResult::Child => {
            func();
            std::process::exit(0);
        }
        ForkResult::Parent { child } => {
            assert_eq!(
                waitpid(child, None).expect("waitpid in test_in_subprocess"),
                WaitStatus::Exited(child, 0)
            );
        }
    }
}

/// Forks a traced child that raises `SIGSTOP` on itself (the same
/// handshake `Session::fork_trace_exec` uses) then runs `func_child`,
/// while the parent drives `func_parent` once per syscall-stop until it
/// returns `true`. Wraps the whole thing in `test_in_subprocess` so the
/// fork doesn't leak into the test binary's own process tree.
pub fn fork_trace_test<FuncParent, FuncChild>(mut func_parent: FuncParent, func_child: FuncChild)
where
    FuncParent: FnMut(Pid) -> bool,
    FuncChild: FnOnce(),
{
    test_in_subprocess(|| {
        match unsafe { fork() }.expect("fork in fork_trace_test") {
            ForkResult::Parent { child } => {
                assert_eq!(
                    waitpid(child, Some(WaitPidFlag::__WALL)).expect("initial waitpid"),
                    WaitStatus::Stopped(child, Signal::SIGSTOP)
                );
                nix::sys::ptrace::setoptions(child, nix::sys::ptrace::Options::PTRACE_O_TRACESYSGOOD)
                    .expect("set ptrace options in test");
                restart(child);

                loop {
                    match waitpid(child, Some(WaitPidFlag::__WALL)).expect("event loop waitpid") {
                        WaitStatus::PtraceSyscall(pid) => {
                            assert_eq!(pid, child);
                            if func_parent(pid) {
                                break;
                            }
                        }
                        WaitStatus::Exited(_, _) | WaitStatus::Signaled(_, _, _) => {
                            panic!("tracee exited before parent function signaled completion")
                        }
                        _ => {}
                    }
                    restart(child);
                }
            }
            ForkResult::Child => {
                nix::sys::ptrace::traceme().expect("test ptrace traceme");
                kill(getpid(), Signal::SIGSTOP).expect("test child sigstop");
                func_child();
            }
        }
    });
}

fn restart(child: Pid) {
    nix::sys::ptrace::syscall(child, None).expect("restart tracee in test");
}
